//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use revshare_core::engagement::EngagementConfig;
use revshare_core::executor::ExecutorConfig;
use revshare_core::fraud::FraudConfig;
use revshare_core::payout::PayoutConfig;
use rust_decimal::Decimal;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub fraud_threshold: Decimal,
    pub suspicious_score_threshold: Decimal,
    pub max_session_minutes: u32,
    pub instructor_share_rate: Decimal,
    pub payout_currency: String,
    pub validation_batch_size: usize,
    pub validation_interval: Duration,
    pub payout_interval: Duration,
    pub transfer_api_url: String,
    pub transfer_api_key: Option<String>,
    pub transfer_timeout: Duration,
    pub admin_token: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingVar(key.to_string()))
        };

        // --- Server and Database Settings ---
        let bind_address = parse::<SocketAddr>("BIND_ADDRESS", &var("BIND_ADDRESS", "0.0.0.0:3000"))?;
        let database_url = required("DATABASE_URL")?;

        let log_level_str = var("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Engagement and Payout Rules ---
        let fraud_threshold = rate("FRAUD_THRESHOLD", &var("FRAUD_THRESHOLD", "0.70"))?;
        let suspicious_score_threshold = rate(
            "SUSPICIOUS_SCORE_THRESHOLD",
            &var("SUSPICIOUS_SCORE_THRESHOLD", "0.30"),
        )?;
        let max_session_minutes = parse::<u32>("MAX_SESSION_MINUTES", &var("MAX_SESSION_MINUTES", "1440"))?;
        let instructor_share_rate = rate("INSTRUCTOR_SHARE_RATE", &var("INSTRUCTOR_SHARE_RATE", "0.80"))?;

        let payout_currency = var("PAYOUT_CURRENCY", "EUR").to_uppercase();
        if payout_currency.len() != 3 || !payout_currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::InvalidValue(
                "PAYOUT_CURRENCY".to_string(),
                format!("'{}' is not an ISO currency code", payout_currency),
            ));
        }

        // --- Background Jobs ---
        let validation_batch_size = positive("VALIDATION_BATCH_SIZE", &var("VALIDATION_BATCH_SIZE", "100"))?;
        let validation_interval = Duration::from_secs(positive(
            "VALIDATION_INTERVAL_SECS",
            &var("VALIDATION_INTERVAL_SECS", "300"),
        )? as u64);
        let payout_interval = Duration::from_secs(positive(
            "PAYOUT_INTERVAL_SECS",
            &var("PAYOUT_INTERVAL_SECS", "3600"),
        )? as u64);

        // --- Transfer Provider ---
        let transfer_api_url = var("TRANSFER_API_URL", "https://api.stripe.com")
            .trim_end_matches('/')
            .to_string();
        let transfer_api_key = lookup("TRANSFER_API_KEY").filter(|k| !k.trim().is_empty());
        let transfer_timeout = Duration::from_secs(positive(
            "TRANSFER_TIMEOUT_SECS",
            &var("TRANSFER_TIMEOUT_SECS", "30"),
        )? as u64);

        let admin_token = required("ADMIN_TOKEN")?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            fraud_threshold,
            suspicious_score_threshold,
            max_session_minutes,
            instructor_share_rate,
            payout_currency,
            validation_batch_size,
            validation_interval,
            payout_interval,
            transfer_api_url,
            transfer_api_key,
            transfer_timeout,
            admin_token,
        })
    }

    pub fn engagement_config(&self) -> EngagementConfig {
        EngagementConfig {
            fraud: FraudConfig {
                threshold: self.fraud_threshold,
            },
            max_session_minutes: self.max_session_minutes,
            suspicious_threshold: self.suspicious_score_threshold,
        }
    }

    pub fn payout_config(&self) -> PayoutConfig {
        PayoutConfig {
            instructor_share_rate: self.instructor_share_rate,
            currency: self.payout_currency.clone(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            transfer_timeout: self.transfer_timeout,
            batch_limit: self.validation_batch_size,
        }
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}

fn positive(key: &str, raw: &str) -> Result<usize, ConfigError> {
    match parse::<usize>(key, raw)? {
        0 => Err(ConfigError::InvalidValue(key.to_string(), "must be greater than zero".to_string())),
        n => Ok(n),
    }
}

/// A fraction in `[0, 1]`.
fn rate(key: &str, raw: &str) -> Result<Decimal, ConfigError> {
    let value = parse::<Decimal>(key, raw)?;
    if value < Decimal::ZERO || value > Decimal::ONE {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            format!("{} is outside [0, 1]", value),
        ));
    }
    Ok(value)
}
