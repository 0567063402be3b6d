//! Runtime settings loaded from the environment (and `.env` via dotenvy).

use anyhow::Context;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::execution::EngineConfig;

#[derive(Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    pub telegram_token: String,
    pub telegram_chat_id: i64,
    pub symbol: String,
    pub target_profit_percent: Decimal,
    pub amount: Decimal,
    pub testnet: bool,
    pub order_timeout_secs: u64,
    pub recv_window_ms: u64,
}

impl Settings {
    /// Read settings from process environment variables
    pub fn load() -> anyhow::Result<Self> {
        Self::build(config::Environment::default())
    }

    /// Read settings from an explicit variable map instead of the process env
    pub fn from_vars(vars: HashMap<String, String>) -> anyhow::Result<Self> {
        Self::build(config::Environment::default().source(Some(vars)))
    }

    fn build(env: config::Environment) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .set_default("testnet", true)?
            .set_default("order_timeout_secs", 10)?
            .set_default("recv_window_ms", 5000)?
            .add_source(env)
            .build()?
            .try_deserialize::<Settings>()
            .context("invalid settings, check SYMBOL, AMOUNT, TARGET_PROFIT_PERCENT and TELEGRAM_*")?;

        Ok(Settings {
            symbol: settings.symbol.trim().to_uppercase(),
            ..settings
        })
    }

    /// Check values the engine and clients rely on. Paper mode needs no
    /// exchange credentials.
    pub fn validate(&self, paper: bool) -> anyhow::Result<()> {
        if self.symbol.is_empty() {
            anyhow::bail!("SYMBOL must not be empty");
        }
        if self.target_profit_percent <= Decimal::ZERO {
            anyhow::bail!(
                "TARGET_PROFIT_PERCENT must be positive, got {}",
                self.target_profit_percent
            );
        }
        if self.amount <= Decimal::ZERO {
            anyhow::bail!("AMOUNT must be positive, got {}", self.amount);
        }
        if self.telegram_token.is_empty() {
            anyhow::bail!("TELEGRAM_TOKEN must not be empty");
        }
        if self.telegram_chat_id == 0 {
            anyhow::bail!("TELEGRAM_CHAT_ID must be set");
        }
        if !paper && (self.api_key.is_empty() || self.api_secret.is_empty()) {
            anyhow::bail!("API_KEY and API_SECRET are required unless running with --paper");
        }
        if self.order_timeout_secs == 0 {
            anyhow::bail!("ORDER_TIMEOUT_SECS must be at least 1");
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            order_timeout: Duration::from_secs(self.order_timeout_secs),
        }
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        "<unset>".to_string()
    } else if secret.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("{}****", secret.chars().take(4).collect::<String>())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &mask(&self.api_secret))
            .field("telegram_token", &mask(&self.telegram_token))
            .field("telegram_chat_id", &self.telegram_chat_id)
            .field("symbol", &self.symbol)
            .field("target_profit_percent", &self.target_profit_percent)
            .field("amount", &self.amount)
            .field("testnet", &self.testnet)
            .field("order_timeout_secs", &self.order_timeout_secs)
            .field("recv_window_ms", &self.recv_window_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            ("API_KEY", "key-1234567890"),
            ("API_SECRET", "secret-1234567890"),
            ("TELEGRAM_TOKEN", "123456:ABCDEF"),
            ("TELEGRAM_CHAT_ID", "42"),
            ("SYMBOL", "btcusdt"),
            ("TARGET_PROFIT_PERCENT", "0.5"),
            ("AMOUNT", "0.001"),
        ]
    }

    #[test]
    fn test_load_with_defaults() {
        let settings = Settings::from_vars(vars(&base_vars())).unwrap();

        assert_eq!(settings.symbol, "BTCUSDT");
        assert_eq!(settings.target_profit_percent, dec!(0.5));
        assert_eq!(settings.amount, dec!(0.001));
        assert_eq!(settings.telegram_chat_id, 42);
        assert!(settings.testnet);
        assert_eq!(settings.order_timeout_secs, 10);
        assert_eq!(settings.recv_window_ms, 5000);
        assert!(settings.validate(false).is_ok());
    }

    #[test]
    fn test_overrides() {
        let mut pairs = base_vars();
        pairs.push(("TESTNET", "false"));
        pairs.push(("ORDER_TIMEOUT_SECS", "3"));
        let settings = Settings::from_vars(vars(&pairs)).unwrap();

        assert!(!settings.testnet);
        assert_eq!(settings.engine_config().order_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_missing_symbol_fails() {
        let pairs: Vec<_> = base_vars()
            .into_iter()
            .filter(|(k, _)| *k != "SYMBOL")
            .collect();
        assert!(Settings::from_vars(vars(&pairs)).is_err());
    }

    #[test]
    fn test_validation_rejects_non_positive_values() {
        let mut settings = Settings::from_vars(vars(&base_vars())).unwrap();
        settings.target_profit_percent = dec!(0);
        assert!(settings.validate(false).is_err());

        let mut settings = Settings::from_vars(vars(&base_vars())).unwrap();
        settings.amount = dec!(-1);
        assert!(settings.validate(false).is_err());
    }

    #[test]
    fn test_credentials_optional_in_paper_mode() {
        let pairs: Vec<_> = base_vars()
            .into_iter()
            .filter(|(k, _)| !k.starts_with("API_"))
            .collect();
        let settings = Settings::from_vars(vars(&pairs)).unwrap();

        assert!(settings.validate(false).is_err());
        assert!(settings.validate(true).is_ok());
    }

    #[test]
    fn test_debug_masks_secrets() {
        let settings = Settings::from_vars(vars(&base_vars())).unwrap();
        let debug = format!("{:?}", settings);

        assert!(!debug.contains("secret-1234567890"));
        assert!(!debug.contains("ABCDEF"));
        assert!(debug.contains("BTCUSDT"));
    }
}
