use std::sync::Arc;

use actix_web::{HttpResponse, Responder, delete, get, post, put, web};
use serde::{Deserialize, Serialize};

use crate::app::engine::{BillingEngine, StartSession};
use crate::app::services::{BillingQueryHandler, ServiceError, SqliteBillingStore};
use crate::domain::charges::{Charge, ChargeOrigin};
use crate::domain::error::{BillingError, ErrorKind};
use crate::domain::models::{ChargeId, NewStation, SessionId, Station, StationId, Transfer};
use crate::domain::money::Piasters;
use crate::domain::rates::{BillingMode, StationRates};
use crate::domain::reconciliation::{Closing, ClosingPolicy};
use crate::domain::session::{Session, SessionView};
use crate::domain::time::{TimestampMs, timestamp_to_iso8601};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<BillingEngine>,
    pub queries: SqliteBillingStore,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StationResponse {
    pub id: i64,
    pub name: String,
    pub single_rate_per_hour: Piasters,
    pub multi_rate_per_hour: Option<Piasters>,
    pub status: String,
    pub active_session_id: Option<i64>,
    pub reachable: bool,
    pub network_address: Option<String>,
}

impl From<&Station> for StationResponse {
    fn from(station: &Station) -> Self {
        Self {
            id: station.id.0,
            name: station.name.clone(),
            single_rate_per_hour: station.rates.single_per_hour,
            multi_rate_per_hour: station.rates.multi_per_hour,
            status: station.status.as_str().to_string(),
            active_session_id: station.status.active_session().map(|id| id.0),
            reachable: station.reachable,
            network_address: station.network_address.clone(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownRowResponse {
    pub mode: String,
    pub rate_per_hour: Piasters,
    pub minutes: i64,
    pub cost: Piasters,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChargeResponse {
    pub id: i64,
    pub amount: Piasters,
    pub reason: Option<String>,
    pub created_at: String,
    pub origin: String,
    pub transfer_id: Option<i64>,
}

impl From<&Charge> for ChargeResponse {
    fn from(charge: &Charge) -> Self {
        let (origin, transfer_id) = match charge.origin {
            ChargeOrigin::Manual => ("manual", None),
            ChargeOrigin::Transfer(id) => ("transfer", Some(id.0)),
        };
        Self {
            id: charge.id.0,
            amount: charge.amount,
            reason: charge.reason.clone(),
            created_at: timestamp_to_iso8601(charge.created_at),
            origin: origin.to_string(),
            transfer_id,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClosingResponse {
    pub ended_at: String,
    pub policy: String,
    pub final_amount: Piasters,
    pub true_total: Piasters,
    pub gaming: Piasters,
    pub orders: Piasters,
    pub charges: Piasters,
    pub transferred_in: Piasters,
    pub transferred_out_id: Option<i64>,
}

impl From<&Closing> for ClosingResponse {
    fn from(closing: &Closing) -> Self {
        Self {
            ended_at: timestamp_to_iso8601(closing.ended_at),
            policy: closing.policy.as_str().to_string(),
            final_amount: closing.final_amount,
            true_total: closing.true_total.total(),
            gaming: closing.true_total.gaming,
            orders: closing.true_total.orders,
            charges: closing.true_total.charges,
            transferred_in: closing.true_total.transferred_in,
            transferred_out_id: closing.transferred_out.map(|id| id.0),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub id: i64,
    pub station_id: i64,
    pub state: String,
    pub mode: Option<String>,
    pub created_at: String,
    pub started_at: String,
    pub paused_since: Option<String>,
    pub elapsed_ms: i64,
    pub billable_ms: i64,
    pub paused_ms: i64,
    pub gaming_cost: Piasters,
    pub breakdown: Vec<BreakdownRowResponse>,
    pub charges: Vec<ChargeResponse>,
    pub charges_total: Piasters,
    pub transferred_in: Piasters,
    pub running_total: Piasters,
    pub timer_minutes: Option<u32>,
    pub timer_remaining_ms: Option<i64>,
    pub timer_expired: bool,
    pub cost_limit: Option<Piasters>,
    pub cost_limit_reached: bool,
    pub version: u64,
    pub closing: Option<ClosingResponse>,
}

fn session_response(session: &Session, view: &SessionView) -> SessionResponse {
    SessionResponse {
        id: session.id().0,
        station_id: session.station_id().0,
        state: session.state().as_str().to_string(),
        mode: session.current_mode().map(|mode| mode.as_str().to_string()),
        created_at: timestamp_to_iso8601(session.created_at()),
        started_at: timestamp_to_iso8601(session.started_at()),
        paused_since: session.paused_since().map(timestamp_to_iso8601),
        elapsed_ms: view.elapsed_ms,
        billable_ms: view.billable_ms,
        paused_ms: view.paused_ms,
        gaming_cost: view.breakdown.total,
        breakdown: view
            .breakdown
            .rows
            .iter()
            .map(|row| BreakdownRowResponse {
                mode: row.mode.as_str().to_string(),
                rate_per_hour: row.rate_per_hour,
                minutes: row.minutes,
                cost: row.cost,
            })
            .collect(),
        charges: session
            .charges()
            .charges()
            .iter()
            .map(ChargeResponse::from)
            .collect(),
        charges_total: view.charges,
        transferred_in: view.transferred_in,
        running_total: view.running_total(),
        timer_minutes: session.timer_minutes(),
        timer_remaining_ms: view.timer.map(|timer| timer.remaining_ms),
        timer_expired: view.timer.is_some_and(|timer| timer.expired),
        cost_limit: session.cost_limit(),
        cost_limit_reached: view.cost_limit_reached,
        version: session.version(),
        closing: session.closing().map(ClosingResponse::from),
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub id: i64,
    pub from_session_id: i64,
    pub from_station_id: i64,
    pub to_session_id: i64,
    pub to_station_id: i64,
    pub amount: Piasters,
    pub includes_orders: bool,
    pub created_at: String,
}

impl From<&Transfer> for TransferResponse {
    fn from(transfer: &Transfer) -> Self {
        Self {
            id: transfer.id.0,
            from_session_id: transfer.from_session_id.0,
            from_station_id: transfer.from_station_id.0,
            to_session_id: transfer.to_session_id.0,
            to_station_id: transfer.to_station_id.0,
            amount: transfer.amount,
            includes_orders: transfer.includes_orders,
            created_at: timestamp_to_iso8601(transfer.created_at),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsDbResponse {
    pub schema_version: u32,
    pub sessions_count: i64,
    pub active_sessions_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStationRequest {
    pub name: String,
    pub single_rate_per_hour: i64,
    pub multi_rate_per_hour: Option<i64>,
    pub network_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRatesRequest {
    pub single_rate_per_hour: i64,
    pub multi_rate_per_hour: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub maintenance: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub station_id: i64,
    pub mode: Option<String>,
    pub started_at: Option<String>,
    pub timer_minutes: Option<u32>,
    pub cost_limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: String,
}

#[derive(Debug, Deserialize)]
pub struct TimerRequest {
    pub minutes: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CostLimitRequest {
    pub amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTimeRequest {
    pub started_at: String,
}

#[derive(Debug, Deserialize)]
pub struct ChargeRequest {
    pub amount: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EndSessionRequest {
    pub policy: Option<String>,
    pub amount: Option<i64>,
}

impl EndSessionRequest {
    fn closing_policy(&self) -> Result<ClosingPolicy, String> {
        match (self.policy.as_deref().unwrap_or("rounded"), self.amount) {
            ("rounded", _) => Ok(ClosingPolicy::Rounded),
            ("zero", _) => Ok(ClosingPolicy::Zero),
            ("custom", Some(amount)) => Ok(ClosingPolicy::Custom(Piasters(amount))),
            ("custom", None) => Err("custom policy requires an amount".to_string()),
            (other, _) => Err(format!("invalid closing policy: {other}")),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchStationRequest {
    pub station_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub to_session_id: i64,
    #[serde(default)]
    pub include_orders: bool,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(list_stations_endpoint)
        .service(create_station_endpoint)
        .service(update_station_rates_endpoint)
        .service(set_station_maintenance_endpoint)
        .service(start_session_endpoint)
        .service(list_active_sessions_endpoint)
        .service(list_session_history_endpoint)
        .service(get_session_endpoint)
        .service(pause_session_endpoint)
        .service(resume_session_endpoint)
        .service(switch_mode_endpoint)
        .service(set_timer_endpoint)
        .service(set_cost_limit_endpoint)
        .service(retime_start_endpoint)
        .service(add_charge_endpoint)
        .service(edit_charge_endpoint)
        .service(remove_charge_endpoint)
        .service(end_session_endpoint)
        .service(switch_station_endpoint)
        .service(transfer_endpoint)
        .service(list_transfers_endpoint)
        .service(get_db_diagnostics_endpoint);
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[get("/stations")]
async fn list_stations_endpoint(state: web::Data<ApiState>) -> impl Responder {
    match state.engine.stations() {
        Ok(stations) => {
            let mapped: Vec<StationResponse> =
                stations.iter().map(StationResponse::from).collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => billing_error_response(error),
    }
}

#[post("/stations")]
async fn create_station_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<CreateStationRequest>,
) -> impl Responder {
    let body = body.into_inner();
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return bad_request("station name must not be empty");
    }

    let rates = match station_rates(body.single_rate_per_hour, body.multi_rate_per_hour) {
        Ok(rates) => rates,
        Err(error) => return billing_error_response(error),
    };

    match state.engine.register_station(NewStation {
        name,
        rates,
        network_address: body.network_address,
    }) {
        Ok(station) => HttpResponse::Created().json(StationResponse::from(&station)),
        Err(error) => billing_error_response(error),
    }
}

#[put("/stations/{id}/rates")]
async fn update_station_rates_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<UpdateRatesRequest>,
) -> impl Responder {
    let rates = match station_rates(body.single_rate_per_hour, body.multi_rate_per_hour) {
        Ok(rates) => rates,
        Err(error) => return billing_error_response(error),
    };

    match state
        .engine
        .update_station_rates(StationId(path.into_inner()), rates)
    {
        Ok(station) => HttpResponse::Ok().json(StationResponse::from(&station)),
        Err(error) => billing_error_response(error),
    }
}

#[put("/stations/{id}/maintenance")]
async fn set_station_maintenance_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<MaintenanceRequest>,
) -> impl Responder {
    match state
        .engine
        .set_station_maintenance(StationId(path.into_inner()), body.maintenance)
    {
        Ok(station) => HttpResponse::Ok().json(StationResponse::from(&station)),
        Err(error) => billing_error_response(error),
    }
}

#[post("/sessions")]
async fn start_session_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<StartSessionRequest>,
) -> impl Responder {
    let mode = match body.mode.as_deref().map(str::parse::<BillingMode>) {
        None => BillingMode::Single,
        Some(Ok(mode)) => mode,
        Some(Err(message)) => return bad_request(message),
    };
    let started_at = match body.started_at.as_deref().map(parse_timestamp).transpose() {
        Ok(value) => value,
        Err(message) => return bad_request(message),
    };

    let request = StartSession {
        station_id: StationId(body.station_id),
        mode,
        started_at,
        timer_minutes: body.timer_minutes,
        cost_limit: body.cost_limit.map(Piasters),
    };

    match state.engine.start_session(request) {
        Ok(session_id) => session_view_response(&state, session_id, HttpResponse::Created),
        Err(error) => billing_error_response(error),
    }
}

#[get("/sessions/active")]
async fn list_active_sessions_endpoint(state: web::Data<ApiState>) -> impl Responder {
    let now = state.engine.now();
    match state.engine.active_sessions() {
        Ok(sessions) => {
            let mapped: Vec<SessionResponse> = sessions
                .iter()
                .map(|session| session_response(session, &session.view(now)))
                .collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => billing_error_response(error),
    }
}

#[get("/sessions/history")]
async fn list_session_history_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<ListQuery>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0);
    let now = state.engine.now();

    match state.queries.list_ended_sessions(limit, offset) {
        Ok(sessions) => {
            let mapped: Vec<SessionResponse> = sessions
                .iter()
                .map(|session| session_response(session, &session.view(now)))
                .collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => service_error_response(error),
    }
}

#[get("/sessions/{id}")]
async fn get_session_endpoint(state: web::Data<ApiState>, path: web::Path<i64>) -> impl Responder {
    let session_id = SessionId(path.into_inner());
    match state.engine.session_view(session_id) {
        Ok(snapshot) => {
            HttpResponse::Ok().json(session_response(&snapshot.session, &snapshot.view))
        }
        Err(BillingError::UnknownSession(_) | BillingError::SessionEnded(_)) => {
            match state.queries.load_session(session_id) {
                Ok(Some(session)) => {
                    let view = session.view(state.engine.now());
                    HttpResponse::Ok().json(session_response(&session, &view))
                }
                Ok(None) => billing_error_response(BillingError::UnknownSession(session_id)),
                Err(error) => service_error_response(error),
            }
        }
        Err(error) => billing_error_response(error),
    }
}

#[post("/sessions/{id}/pause")]
async fn pause_session_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
) -> impl Responder {
    let session_id = SessionId(path.into_inner());
    match state.engine.pause(session_id) {
        Ok(()) => session_view_response(&state, session_id, HttpResponse::Ok),
        Err(error) => billing_error_response(error),
    }
}

#[post("/sessions/{id}/resume")]
async fn resume_session_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
) -> impl Responder {
    let session_id = SessionId(path.into_inner());
    match state.engine.resume(session_id) {
        Ok(()) => session_view_response(&state, session_id, HttpResponse::Ok),
        Err(error) => billing_error_response(error),
    }
}

#[put("/sessions/{id}/mode")]
async fn switch_mode_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<ModeRequest>,
) -> impl Responder {
    let mode = match body.mode.parse::<BillingMode>() {
        Ok(mode) => mode,
        Err(message) => return bad_request(message),
    };

    let session_id = SessionId(path.into_inner());
    match state.engine.switch_mode(session_id, mode) {
        Ok(()) => session_view_response(&state, session_id, HttpResponse::Ok),
        Err(error) => billing_error_response(error),
    }
}

#[put("/sessions/{id}/timer")]
async fn set_timer_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<TimerRequest>,
) -> impl Responder {
    let session_id = SessionId(path.into_inner());
    match state.engine.set_timer(session_id, body.minutes) {
        Ok(()) => session_view_response(&state, session_id, HttpResponse::Ok),
        Err(error) => billing_error_response(error),
    }
}

#[put("/sessions/{id}/cost-limit")]
async fn set_cost_limit_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<CostLimitRequest>,
) -> impl Responder {
    let session_id = SessionId(path.into_inner());
    match state
        .engine
        .set_cost_limit(session_id, body.amount.map(Piasters))
    {
        Ok(()) => session_view_response(&state, session_id, HttpResponse::Ok),
        Err(error) => billing_error_response(error),
    }
}

#[put("/sessions/{id}/start-time")]
async fn retime_start_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<StartTimeRequest>,
) -> impl Responder {
    let started_at = match parse_timestamp(&body.started_at) {
        Ok(value) => value,
        Err(message) => return bad_request(message),
    };

    let session_id = SessionId(path.into_inner());
    match state.engine.retime_start(session_id, started_at) {
        Ok(()) => session_view_response(&state, session_id, HttpResponse::Ok),
        Err(error) => billing_error_response(error),
    }
}

#[post("/sessions/{id}/charges")]
async fn add_charge_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<ChargeRequest>,
) -> impl Responder {
    let session_id = SessionId(path.into_inner());
    let body = body.into_inner();
    match state
        .engine
        .add_charge(session_id, Piasters(body.amount), body.reason)
    {
        Ok(_) => session_view_response(&state, session_id, HttpResponse::Created),
        Err(error) => billing_error_response(error),
    }
}

#[put("/sessions/{id}/charges/{charge_id}")]
async fn edit_charge_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<(i64, i64)>,
    body: web::Json<ChargeRequest>,
) -> impl Responder {
    let (session_id, charge_id) = path.into_inner();
    let session_id = SessionId(session_id);
    let body = body.into_inner();
    match state.engine.edit_charge(
        session_id,
        ChargeId(charge_id),
        Piasters(body.amount),
        body.reason,
    ) {
        Ok(()) => session_view_response(&state, session_id, HttpResponse::Ok),
        Err(error) => billing_error_response(error),
    }
}

#[delete("/sessions/{id}/charges/{charge_id}")]
async fn remove_charge_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<(i64, i64)>,
) -> impl Responder {
    let (session_id, charge_id) = path.into_inner();
    let session_id = SessionId(session_id);
    match state.engine.remove_charge(session_id, ChargeId(charge_id)) {
        Ok(()) => session_view_response(&state, session_id, HttpResponse::Ok),
        Err(error) => billing_error_response(error),
    }
}

#[post("/sessions/{id}/end")]
async fn end_session_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<EndSessionRequest>,
) -> impl Responder {
    let policy = match body.closing_policy() {
        Ok(policy) => policy,
        Err(message) => return bad_request(message),
    };

    match state.engine.end_session(SessionId(path.into_inner()), policy) {
        Ok(closing) => HttpResponse::Ok().json(ClosingResponse::from(&closing)),
        Err(error) => billing_error_response(error),
    }
}

#[post("/sessions/{id}/switch-station")]
async fn switch_station_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<SwitchStationRequest>,
) -> impl Responder {
    let session_id = SessionId(path.into_inner());
    match state
        .engine
        .switch_station(session_id, StationId(body.station_id))
    {
        Ok(()) => session_view_response(&state, session_id, HttpResponse::Ok),
        Err(error) => billing_error_response(error),
    }
}

#[post("/sessions/{id}/transfer")]
async fn transfer_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<TransferRequest>,
) -> impl Responder {
    match state.engine.transfer(
        SessionId(path.into_inner()),
        SessionId(body.to_session_id),
        body.include_orders,
    ) {
        Ok(transfer) => HttpResponse::Created().json(TransferResponse::from(&transfer)),
        Err(error) => billing_error_response(error),
    }
}

#[get("/transfers")]
async fn list_transfers_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<ListQuery>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.queries.list_transfers(limit) {
        Ok(transfers) => {
            let mapped: Vec<TransferResponse> =
                transfers.iter().map(TransferResponse::from).collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => service_error_response(error),
    }
}

#[get("/diagnostics/db")]
async fn get_db_diagnostics_endpoint(state: web::Data<ApiState>) -> impl Responder {
    let schema_version = match state.queries.get_schema_version() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };
    let sessions_count = match state.queries.count_sessions() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };
    let active_sessions_count = match state.queries.count_active_sessions() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };

    HttpResponse::Ok().json(DiagnosticsDbResponse {
        schema_version,
        sessions_count,
        active_sessions_count,
    })
}

fn session_view_response(
    state: &ApiState,
    session_id: SessionId,
    status: fn() -> actix_web::HttpResponseBuilder,
) -> HttpResponse {
    match state.engine.session_view(session_id) {
        Ok(snapshot) => status().json(session_response(&snapshot.session, &snapshot.view)),
        Err(error) => billing_error_response(error),
    }
}

fn station_rates(single: i64, multi: Option<i64>) -> Result<StationRates, BillingError> {
    StationRates::new(Piasters(single), multi.map(Piasters))
}

fn parse_timestamp(raw: &str) -> Result<TimestampMs, String> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|value| TimestampMs(value.timestamp_millis()))
        .map_err(|error| format!("invalid timestamp {raw}: {error}"))
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({
        "error": message.into(),
        "kind": "invalid_request"
    }))
}

fn billing_error_response(error: BillingError) -> HttpResponse {
    let kind = error.kind();
    let body = serde_json::json!({
        "error": error.to_string(),
        "kind": kind.as_str()
    });

    match kind {
        ErrorKind::Precondition => HttpResponse::UnprocessableEntity().json(body),
        ErrorKind::NotFound => HttpResponse::NotFound().json(body),
        ErrorKind::Conflict => HttpResponse::Conflict().json(body),
        ErrorKind::Unavailable => HttpResponse::ServiceUnavailable().json(body),
    }
}

fn service_error_response(error: ServiceError) -> HttpResponse {
    match error {
        ServiceError::DbLockPoisoned => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "database lock poisoned"
            }))
        }
        ServiceError::Database(error) => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("database query failed: {error}")
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use actix_web::{App, http::StatusCode, test, web};
    use rusqlite::{Connection, params};
    use serde_json::{Value, json};

    use crate::app::engine::{BillingEngine, EngineDeps};
    use crate::app::services::SqliteBillingStore;
    use crate::domain::events::TracingEventSink;
    use crate::domain::money::DEFAULT_ROUNDING_STEP;
    use crate::test_support::{FakeClock, open_test_connection};

    use super::{ApiState, configure_routes};

    const START_MS: i64 = 1_700_000_000_000;

    fn build_state(name: &str) -> (ApiState, Arc<FakeClock>, Arc<Mutex<Connection>>) {
        let connection = Arc::new(Mutex::new(open_test_connection(name)));
        let store = SqliteBillingStore::new(Arc::clone(&connection));
        let clock = Arc::new(FakeClock::new(START_MS));
        let engine = BillingEngine::new(
            EngineDeps {
                clock: clock.clone(),
                store: Arc::new(store.clone()),
                orders: Arc::new(store.clone()),
                events: Arc::new(TracingEventSink),
            },
            DEFAULT_ROUNDING_STEP,
        );

        (
            ApiState {
                engine: Arc::new(engine),
                queries: store,
            },
            clock,
            connection,
        )
    }

    fn station_body(name: &str) -> Value {
        json!({ "name": name, "singleRatePerHour": 3000, "multiRatePerHour": 4800 })
    }

    #[actix_web::test]
    async fn health_endpoint_returns_ok() {
        let (state, _, _) = build_state("health-api");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn session_lifecycle_ends_with_rounded_amount() {
        let (state, clock, _) = build_state("lifecycle-api");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/stations")
            .set_json(json!({ "name": "PS-1", "singleRatePerHour": 3000 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let station: Value = test::read_body_json(resp).await;
        let station_id = station["id"].as_i64().expect("station id should be numeric");

        let req = test::TestRequest::post()
            .uri("/sessions")
            .set_json(json!({ "stationId": station_id }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let session: Value = test::read_body_json(resp).await;
        let session_id = session["id"].as_i64().expect("session id should be numeric");
        assert_eq!(session["state"], "running");
        assert_eq!(session["mode"], "single");

        clock.advance_minutes(65);

        let req = test::TestRequest::get()
            .uri(&format!("/sessions/{session_id}"))
            .to_request();
        let view: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(view["gamingCost"], 3250);
        assert_eq!(view["runningTotal"], 3250);

        let req = test::TestRequest::post()
            .uri(&format!("/sessions/{session_id}/end"))
            .set_json(json!({ "policy": "rounded" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let closing: Value = test::read_body_json(resp).await;
        assert_eq!(closing["trueTotal"], 3250);
        assert_eq!(closing["finalAmount"], 3500);
        assert_eq!(closing["policy"], "rounded");

        let req = test::TestRequest::get().uri("/stations").to_request();
        let stations: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stations[0]["status"], "available");

        let req = test::TestRequest::get()
            .uri("/sessions/history?limit=5")
            .to_request();
        let history: Value = test::call_and_read_body_json(&app, req).await;
        let items = history.as_array().expect("history should be an array");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["closing"]["finalAmount"], 3500);
    }

    #[actix_web::test]
    async fn busy_station_is_rejected_with_precondition_kind() {
        let (state, _, _) = build_state("busy-station-api");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/stations")
            .set_json(station_body("PS-2"))
            .to_request();
        let station: Value = test::call_and_read_body_json(&app, req).await;
        let station_id = station["id"].as_i64().expect("station id should be numeric");

        for expected in [StatusCode::CREATED, StatusCode::UNPROCESSABLE_ENTITY] {
            let req = test::TestRequest::post()
                .uri("/sessions")
                .set_json(json!({ "stationId": station_id }))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), expected);
            if expected == StatusCode::UNPROCESSABLE_ENTITY {
                let body: Value = test::read_body_json(resp).await;
                assert_eq!(body["kind"], "precondition");
            }
        }
    }

    #[actix_web::test]
    async fn unknown_session_returns_not_found() {
        let (state, _, _) = build_state("unknown-session-api");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/sessions/404/pause")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["kind"], "not_found");
    }

    #[actix_web::test]
    async fn invalid_mode_is_a_bad_request() {
        let (state, _, _) = build_state("invalid-mode-api");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/sessions")
            .set_json(json!({ "stationId": 1, "mode": "quad" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn transfer_moves_gaming_cost_and_orders_to_target() {
        let (state, clock, connection) = build_state("transfer-api");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let mut session_ids = Vec::new();
        for name in ["PS-1", "PS-2"] {
            let req = test::TestRequest::post()
                .uri("/stations")
                .set_json(station_body(name))
                .to_request();
            let station: Value = test::call_and_read_body_json(&app, req).await;
            let req = test::TestRequest::post()
                .uri("/sessions")
                .set_json(json!({ "stationId": station["id"] }))
                .to_request();
            let session: Value = test::call_and_read_body_json(&app, req).await;
            session_ids.push(session["id"].as_i64().expect("session id should be numeric"));
        }
        let (from, to) = (session_ids[0], session_ids[1]);

        connection
            .lock()
            .expect("lock should be available")
            .execute(
                "INSERT INTO orders (session_id, menu_item_id, quantity, price_snapshot)
                 VALUES (?1, 1, 2, 250)",
                params![from],
            )
            .expect("order insert should succeed");

        clock.advance_minutes(30);

        let req = test::TestRequest::post()
            .uri(&format!("/sessions/{from}/transfer"))
            .set_json(json!({ "toSessionId": to, "includeOrders": true }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let transfer: Value = test::read_body_json(resp).await;
        assert_eq!(transfer["amount"], 1500 + 500);

        let req = test::TestRequest::get()
            .uri(&format!("/sessions/{to}"))
            .to_request();
        let target: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(target["transferredIn"], 2000);
        assert_eq!(target["charges"][0]["origin"], "transfer");
        assert_eq!(target["charges"][0]["reason"], "transfer from PS-1");

        let req = test::TestRequest::get()
            .uri(&format!("/sessions/{from}"))
            .to_request();
        let source: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(source["state"], "ended");
        assert_eq!(source["closing"]["finalAmount"], 0);

        let req = test::TestRequest::post()
            .uri(&format!("/sessions/{to}/transfer"))
            .set_json(json!({ "toSessionId": to }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let req = test::TestRequest::get().uri("/transfers").to_request();
        let transfers: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(transfers.as_array().map(Vec::len), Some(1));
    }

    #[actix_web::test]
    async fn diagnostics_db_returns_schema_and_counts() {
        let (state, _, _) = build_state("diagnostics-db-api");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/stations")
            .set_json(station_body("PS-3"))
            .to_request();
        let station: Value = test::call_and_read_body_json(&app, req).await;
        let req = test::TestRequest::post()
            .uri("/sessions")
            .set_json(json!({ "stationId": station["id"], "timerMinutes": 30 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = test::TestRequest::get().uri("/diagnostics/db").to_request();
        let json: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["sessionsCount"], 1);
        assert_eq!(json["activeSessionsCount"], 1);
    }
}
