use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Seven days.
const DEFAULT_OFFLINE_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the WebSocket listener
    pub ws_port: u16,
    /// Port for the REST surface (key directory, health, metrics)
    pub http_port: u16,
    /// When absent the offline queue and delivery state live in process memory
    pub redis_url: Option<String>,
    /// When absent the key directory lives in process memory
    pub database_url: Option<String>,
    pub jwt_public_key_pem: String,
    pub offline_retention: Duration,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub send_dedup_window: Duration,
    pub log_format: LogFormat,
}

impl Config {
    fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, AppError>
    where
        T::Err: std::fmt::Display,
    {
        match env::var(key) {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse()
                .map_err(|e| AppError::Config(format!("{key}: {e}"))),
            _ => Ok(default),
        }
    }

    fn optional_var(key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.trim().is_empty())
    }

    fn secs(key: &str, default: u64) -> Result<Duration, AppError> {
        let secs: u64 = Self::parse_var(key, default)?;
        if secs == 0 {
            return Err(AppError::Config(format!("{key} must be greater than zero")));
        }
        Ok(Duration::from_secs(secs))
    }

    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let jwt_public_key_pem = Self::optional_var("JWT_PUBLIC_KEY_PEM")
            .ok_or_else(|| AppError::Config("JWT_PUBLIC_KEY_PEM missing".into()))?
            // Single-line env files carry the PEM with literal "\n"
            .replace("\\n", "\n");

        let log_format = match Self::optional_var("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let idle_timeout = Self::secs("IDLE_TIMEOUT_SECS", 60)?;
        let heartbeat_interval = Self::secs("HEARTBEAT_INTERVAL_SECS", 15)?;
        if heartbeat_interval >= idle_timeout {
            return Err(AppError::Config(
                "HEARTBEAT_INTERVAL_SECS must be shorter than IDLE_TIMEOUT_SECS".into(),
            ));
        }

        Ok(Self {
            ws_port: Self::parse_var("WS_PORT", 3001)?,
            http_port: Self::parse_var("HTTP_PORT", 3000)?,
            redis_url: Self::optional_var("REDIS_URL"),
            database_url: Self::optional_var("DATABASE_URL"),
            jwt_public_key_pem,
            offline_retention: Self::secs(
                "OFFLINE_RETENTION_SECS",
                DEFAULT_OFFLINE_RETENTION_SECS,
            )?,
            idle_timeout,
            heartbeat_interval,
            send_dedup_window: Self::secs("SEND_DEDUP_WINDOW_SECS", 300)?,
            log_format,
        })
    }

    /// In-memory everything, short timers. Callers supply their own authenticator.
    pub fn test_defaults() -> Self {
        Self {
            ws_port: 0,
            http_port: 0,
            redis_url: None,
            database_url: None,
            jwt_public_key_pem: String::new(),
            offline_retention: Duration::from_secs(DEFAULT_OFFLINE_RETENTION_SECS),
            idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            send_dedup_window: Duration::from_secs(300),
            log_format: LogFormat::Pretty,
        }
    }
}
