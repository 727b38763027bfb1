use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::time::Duration;

use crate::error::AppResult;

/// Process-wide configuration, loaded once at startup and handed to the
/// components that need it.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_horizon_url")]
    pub horizon_url: String,
    #[serde(default = "default_network_passphrase")]
    pub network_passphrase: String,
    pub installation_account_secret: String,
    pub local_federation_domain: String,
    pub core_banking_url: Option<String>,

    #[serde(default = "default_max_retries")]
    pub payment_max_retries: i32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_recovery_sweep_interval_secs")]
    pub recovery_sweep_interval_secs: u64,

    #[serde(default = "default_stream_poll_interval_ms")]
    pub stream_poll_interval_ms: u64,
    #[serde(default = "default_stream_reconnect_delay_ms")]
    pub stream_reconnect_delay_ms: u64,

    #[serde(default = "default_new_account_starting_balance")]
    pub new_account_starting_balance: Decimal,
    #[serde(default = "default_vault_account_starting_balance")]
    pub vault_account_starting_balance: Decimal,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_horizon_url() -> String {
    "https://horizon-testnet.stellar.org".to_string()
}

fn default_network_passphrase() -> String {
    "Test SDF Network ; September 2015".to_string()
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    2_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_recovery_sweep_interval_secs() -> u64 {
    60
}

fn default_stream_poll_interval_ms() -> u64 {
    1_000
}

fn default_stream_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_new_account_starting_balance() -> Decimal {
    dec!(20)
}

fn default_vault_account_starting_balance() -> Decimal {
    dec!(10)
}

impl Config {
    /// Read configuration from the process environment (after `.env` has been
    /// loaded). Keys are the upper-cased field names, e.g. `HORIZON_URL`.
    pub fn from_env() -> AppResult<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn retry_policy(&self) -> crate::relay::retry::RetryConfig {
        crate::relay::retry::RetryConfig {
            max_retries: self.payment_max_retries,
            initial_delay_ms: self.retry_initial_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            ..Default::default()
        }
    }

    pub fn recovery_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_sweep_interval_secs)
    }

    pub fn stream_settings(&self) -> crate::ingest::StreamSettings {
        crate::ingest::StreamSettings {
            poll_interval: Duration::from_millis(self.stream_poll_interval_ms),
            reconnect_delay: Duration::from_millis(self.stream_reconnect_delay_ms),
        }
    }
}
