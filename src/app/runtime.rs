use std::collections::{HashMap, HashSet};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use chrono::Utc;
use thiserror::Error;

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::db::{open_connection, run_migrations};
use crate::adapters::monitor_webhook::MonitorWebhookSink;
use crate::adapters::router_rest::{
    RouterClient, RouterClientError, RouterCredentials, RouterRestClient,
};
use crate::app::config::AppConfig;
use crate::app::engine::{BillingEngine, EngineDeps};
use crate::app::error::AppError;
use crate::app::services::SqliteBillingStore;
use crate::domain::error::BillingError;
use crate::domain::events::{EventSink, TracingEventSink};
use crate::domain::models::StationId;
use crate::domain::reachability::ReachabilityTracker;
use crate::domain::time::{Clock, TimestampMs, timestamp_to_iso8601};

#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(Utc::now().timestamp_millis())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to fetch reachable hosts: {0}")]
    Router(#[source] RouterClientError),
    #[error("billing engine rejected update: {0}")]
    Engine(#[source] BillingError),
}

/// Polls the router, turns debounced reachability changes into pause/resume
/// calls, fires due timers and retries failed saves.
pub struct ReachabilitySynchronizer<R> {
    router: Option<R>,
    clock: Arc<dyn Clock>,
    engine: Arc<BillingEngine>,
    trackers: HashMap<StationId, ReachabilityTracker>,
    debounce_samples: usize,
}

impl<R> ReachabilitySynchronizer<R>
where
    R: RouterClient,
{
    pub fn new(
        router: Option<R>,
        clock: Arc<dyn Clock>,
        engine: Arc<BillingEngine>,
        debounce_samples: usize,
    ) -> Self {
        Self {
            router,
            clock,
            engine,
            trackers: HashMap::new(),
            debounce_samples,
        }
    }

    pub fn tick(&mut self) -> Result<(), SyncError> {
        let hosts = self.router.as_ref().map(RouterClient::reachable_hosts);

        let reachability = match hosts {
            Some(Ok(hosts)) => self.apply_reachability(&hosts),
            Some(Err(error)) => Err(SyncError::Router(error)),
            None => Ok(()),
        };

        self.engine.evaluate_timers().map_err(SyncError::Engine)?;
        let still_pending = self.engine.flush_pending().map_err(SyncError::Engine)?;
        if still_pending > 0 {
            tracing::warn!(still_pending, "some records are still waiting to be saved");
        }

        reachability
    }

    fn apply_reachability(&mut self, hosts: &HashSet<String>) -> Result<(), SyncError> {
        let debounce_samples = self.debounce_samples;

        for station in self.engine.stations().map_err(SyncError::Engine)? {
            let Some(address) = station.network_address.as_deref() else {
                continue;
            };
            let reachable = hosts.contains(address);
            let tracker = self
                .trackers
                .entry(station.id)
                .or_insert_with(|| ReachabilityTracker::new(debounce_samples));

            let Some(transition) = tracker.observe(reachable, self.clock.as_ref()) else {
                continue;
            };

            tracing::info!(
                station_id = %station.id,
                reachable = transition.reachable(),
                at = %timestamp_to_iso8601(transition.at()),
                "station reachability changed"
            );
            if let Err(error) = self.engine.on_station_reachability_changed(
                station.id,
                transition.reachable(),
                transition.at(),
            ) {
                tracing::warn!(
                    error = %error,
                    station_id = %station.id,
                    "reachability change not applied"
                );
            }
        }

        Ok(())
    }
}

pub fn start_synchronizer<R>(
    mut synchronizer: ReachabilitySynchronizer<R>,
    interval: Duration,
    stop_flag: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    R: RouterClient,
{
    std::thread::spawn(move || {
        while !stop_flag.load(Ordering::Relaxed) {
            if let Err(error) = synchronizer.tick() {
                tracing::warn!(error = %error, "sync cycle failed");
            }
            std::thread::sleep(interval);
        }
    })
}

struct Services {
    engine: Arc<BillingEngine>,
    store: SqliteBillingStore,
    clock: Arc<dyn Clock>,
}

fn bootstrap(config: &AppConfig) -> Result<Services, AppError> {
    let mut connection = open_connection(&config.db_path).map_err(AppError::database_init)?;
    run_migrations(&mut connection).map_err(AppError::database_init)?;
    let store = SqliteBillingStore::new(Arc::new(Mutex::new(connection)));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let events: Arc<dyn EventSink> = match &config.monitor_webhook_url {
        Some(url) => {
            let (sink, _worker) =
                MonitorWebhookSink::spawn(url, Arc::clone(&clock)).map_err(AppError::runtime)?;
            tracing::info!(url = %url, "monitor webhook enabled");
            Arc::new(sink)
        }
        None => Arc::new(TracingEventSink),
    };

    let engine = BillingEngine::new(
        EngineDeps {
            clock: Arc::clone(&clock),
            store: Arc::new(store.clone()),
            orders: Arc::new(store.clone()),
            events,
        },
        config.rounding_step,
    );
    let snapshot = store.load_snapshot().map_err(AppError::database_init)?;
    engine.restore(snapshot).map_err(AppError::runtime)?;

    Ok(Services {
        engine: Arc::new(engine),
        store,
        clock,
    })
}

pub fn run(config: AppConfig) -> Result<(), AppError> {
    let services = bootstrap(&config)?;

    let router = match &config.router {
        Some(router) => {
            let credentials = router.user.clone().map(|user| RouterCredentials {
                user,
                password: router.password.clone(),
            });
            Some(RouterRestClient::new(&router.url, credentials).map_err(AppError::runtime)?)
        }
        None => {
            tracing::info!("no router configured; reachability sync disabled");
            None
        }
    };

    let synchronizer = ReachabilitySynchronizer::new(
        router,
        Arc::clone(&services.clock),
        Arc::clone(&services.engine),
        config.debounce_samples,
    );
    let stop_flag = Arc::new(AtomicBool::new(false));
    let synchronizer_handle = start_synchronizer(
        synchronizer,
        Duration::from_millis(config.sync_interval_ms),
        Arc::clone(&stop_flag),
    );

    let server_result = serve(&config, &services);

    stop_flag.store(true, Ordering::Relaxed);
    if synchronizer_handle.join().is_err() {
        return Err(AppError::runtime("synchronizer thread panicked"));
    }

    server_result
}

pub fn run_api(config: AppConfig) -> Result<(), AppError> {
    let services = bootstrap(&config)?;
    serve(&config, &services)
}

fn serve(config: &AppConfig, services: &Services) -> Result<(), AppError> {
    let api_state = ApiState {
        engine: Arc::clone(&services.engine),
        queries: services.store.clone(),
    };
    let bind = config.http_bind.clone();

    tracing::info!(bind = %bind, "http server starting");

    actix_web::rt::System::new()
        .block_on(async move {
            HttpServer::new(move || {
                App::new()
                    .wrap(Cors::permissive())
                    .app_data(web::Data::new(api_state.clone()))
                    .configure(configure_routes)
            })
            .bind(&bind)?
            .run()
            .await
        })
        .map_err(AppError::runtime)
}
