//! Configuration management for the coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Chain credentials live in per-currency sections keyed by ticker, with the
//! historical key names preserved for config compatibility.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub wallets: HashMap<String, WalletSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Whether this node acts as a swap coordinator (service node).
    #[serde(default)]
    pub enable_exchange: bool,
    /// Minimum spacing of automated maker-input rechecks, seconds.
    #[serde(default = "default_inputs_check_interval")]
    pub order_inputs_check_interval_secs: i64,
    /// Confirmation polling cadence of the swap driver.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Expiry sweep cadence.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Per-currency wallet section. Key names match the legacy flat config.
#[derive(Debug, Clone, Deserialize)]
pub struct WalletSection {
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Ip", default)]
    pub ip: String,
    #[serde(rename = "Port", default)]
    pub port: String,
    #[serde(rename = "Username", default)]
    pub username: String,
    #[serde(rename = "Password", default)]
    pub password: String,
    /// Dust threshold in base units; zero disables the check.
    #[serde(rename = "MinimumAmount", default)]
    pub minimum_amount: u64,
    #[serde(rename = "TxVersion", default = "default_tx_version")]
    pub tx_version: u32,
    #[serde(rename = "JSONVersion", default)]
    pub json_version: String,
    #[serde(rename = "RequiredConfirmations", default)]
    pub required_confirmations: u32,
    #[serde(rename = "BlockTime", default = "default_block_time")]
    pub block_time_secs: u32,
}

fn default_inputs_check_interval() -> i64 {
    900
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_tx_version() -> u32 {
    1
}

fn default_block_time() -> u32 {
    60
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("COORDINATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.coordinator.enable_exchange && self.enabled_wallets().is_empty() {
            anyhow::bail!("Exchange role enabled but no usable wallet sections configured");
        }
        if self.coordinator.order_inputs_check_interval_secs < 0 {
            anyhow::bail!("order_inputs_check_interval_secs must not be negative");
        }
        Ok(())
    }

    /// Wallet sections carrying complete connection credentials. Incomplete
    /// sections are skipped with a warning, as the legacy loader did.
    pub fn enabled_wallets(&self) -> Vec<(&String, &WalletSection)> {
        self.wallets
            .iter()
            .filter(|(name, w)| {
                let complete = !w.ip.is_empty()
                    && !w.port.is_empty()
                    && !w.username.is_empty()
                    && !w.password.is_empty();
                if !complete {
                    tracing::warn!("{} \"{}\" failed to load the config", name, w.title);
                }
                complete
            })
            .collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_wallet_credentials_from_env() {
        env::set_var("CROSSDEX_TEST_LTC_PASSWORD", "hunter2");
        let raw = "Username = \"rpcuser\"\nPassword = \"${CROSSDEX_TEST_LTC_PASSWORD}\"";
        assert_eq!(
            substitute_env_vars(raw),
            "Username = \"rpcuser\"\nPassword = \"hunter2\""
        );

        // an unset credential substitutes to empty, which drops the wallet
        // section at load time
        let raw = "Password = \"${CROSSDEX_TEST_UNSET_CREDENTIAL}\"";
        assert_eq!(substitute_env_vars(raw), "Password = \"\"");
    }

    #[test]
    fn wallet_sections_parse_with_legacy_keys() {
        env::set_var("CROSSDEX_TEST_BLOCK_PASSWORD", "swordfish");
        let raw = r#"
            [coordinator]
            enable_exchange = true

            [api]
            host = "127.0.0.1"
            port = 41414

            [metrics]
            enabled = false
            port = 9090

            [wallets.LTC]
            Title = "Litecoin"
            Address = ""
            Ip = "127.0.0.1"
            Port = "9332"
            Username = "user"
            Password = "${CROSSDEX_TEST_BLOCK_PASSWORD}"
            MinimumAmount = 0
            TxVersion = 1
            JSONVersion = ""

            [wallets.BLOCK]
            Title = "Blocknet"
            Ip = ""
            Port = ""
            Username = ""
            Password = ""
        "#;
        let settings: Settings = toml::from_str(&substitute_env_vars(raw)).unwrap();
        assert_eq!(settings.wallets.len(), 2);
        // only the complete section survives, with its credential resolved
        let enabled = settings.enabled_wallets();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].0, "LTC");
        assert_eq!(enabled[0].1.password, "swordfish");
        assert_eq!(settings.coordinator.order_inputs_check_interval_secs, 900);
    }
}
