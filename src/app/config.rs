use crate::app::AppError;
use crate::domain::money::{DEFAULT_ROUNDING_STEP, Piasters};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub http_bind: String,
    /// Reachability sync is disabled when no router is configured.
    pub router: Option<RouterConfig>,
    pub sync_interval_ms: u64,
    pub debounce_samples: usize,
    pub rounding_step: Piasters,
    pub monitor_webhook_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let router = non_empty(&lookup, "ROUTER_URL").map(|url| RouterConfig {
            url,
            user: non_empty(&lookup, "ROUTER_USER"),
            password: non_empty(&lookup, "ROUTER_PASSWORD"),
        });

        let sync_interval_ms = parse_or_default(&lookup, "SYNC_INTERVAL_MS", 5000_u64)?;
        if sync_interval_ms == 0 {
            return Err(AppError::config("SYNC_INTERVAL_MS must be greater than zero"));
        }

        let rounding_step = parse_or_default(
            &lookup,
            "ROUNDING_STEP_PIASTERS",
            DEFAULT_ROUNDING_STEP.0,
        )?;
        if rounding_step <= 0 {
            return Err(AppError::config(
                "ROUNDING_STEP_PIASTERS must be greater than zero",
            ));
        }

        Ok(Self {
            db_path: non_empty(&lookup, "DB_PATH")
                .unwrap_or_else(|| "/var/lib/lounge/lounge.db".to_string()),
            http_bind: non_empty(&lookup, "HTTP_BIND")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            router,
            sync_interval_ms,
            debounce_samples: parse_or_default(&lookup, "DEBOUNCE_SAMPLES", 2_usize)?,
            rounding_step: Piasters(rounding_step),
            monitor_webhook_url: non_empty(&lookup, "MONITOR_WEBHOOK_URL"),
        })
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, RouterConfig};
    use crate::domain::money::Piasters;

    #[test]
    fn applies_defaults_for_optional_fields() {
        let result = AppConfig::from_lookup(|_| None).expect("config should be valid");

        assert_eq!(result.db_path, "/var/lib/lounge/lounge.db");
        assert_eq!(result.http_bind, "0.0.0.0:8080");
        assert_eq!(result.router, None);
        assert_eq!(result.sync_interval_ms, 5000);
        assert_eq!(result.debounce_samples, 2);
        assert_eq!(result.rounding_step, Piasters(500));
        assert_eq!(result.monitor_webhook_url, None);
    }

    #[test]
    fn reads_router_settings() {
        let result = AppConfig::from_lookup(|key| match key {
            "ROUTER_URL" => Some(" http://192.168.88.1 ".to_string()),
            "ROUTER_USER" => Some("lounge".to_string()),
            "ROUTER_PASSWORD" => Some(String::new()),
            "ROUNDING_STEP_PIASTERS" => Some("100".to_string()),
            _ => None,
        })
        .expect("config should be valid");

        assert_eq!(
            result.router,
            Some(RouterConfig {
                url: "http://192.168.88.1".to_string(),
                user: Some("lounge".to_string()),
                password: None,
            })
        );
        assert_eq!(result.rounding_step, Piasters(100));
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let result = AppConfig::from_lookup(|key| match key {
            "SYNC_INTERVAL_MS" => Some("abc".to_string()),
            _ => None,
        });

        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: SYNC_INTERVAL_MS must be a valid number"
        );
    }

    #[test]
    fn rejects_non_positive_rounding_step() {
        let result = AppConfig::from_lookup(|key| match key {
            "ROUNDING_STEP_PIASTERS" => Some("0".to_string()),
            _ => None,
        });

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: ROUNDING_STEP_PIASTERS must be greater than zero"
        );
    }
}
