use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::types::{TimeFrame, TradingError};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub exchange: ExchangeSettings,
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
    pub notifications: NotificationSettings,
}

impl Config {
    /// Loads the TOML config file when present, otherwise starts from
    /// defaults. `TRADEPILOT_DATABASE_URL` overrides the database URL either
    /// way.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("could not read config file: {}", path))?;
            toml::from_str(&raw)
                .with_context(|| format!("could not parse config file: {}", path))?
        } else {
            Config::default()
        };

        if let Ok(url) = std::env::var("TRADEPILOT_DATABASE_URL") {
            config.database.url = url;
        }

        if let Err(errors) = config.validate() {
            anyhow::bail!("invalid configuration: {}", errors.join(", "));
        }

        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.engine.controller_tick_secs == 0 {
            errors.push("controller_tick_secs must be > 0".to_string());
        }
        if self.engine.action_tick_secs == 0 {
            errors.push("action_tick_secs must be > 0".to_string());
        }
        if self.engine.ticker_idle_timeout_secs == 0 {
            errors.push("ticker_idle_timeout_secs must be > 0".to_string());
        }
        if self.engine.candle_window_size == 0 {
            errors.push("candle_window_size must be > 0".to_string());
        }
        if self.engine.price_precision > 28 {
            errors.push("price_precision must be <= 28".to_string());
        }
        if TimeFrame::parse(&self.engine.candle_interval).is_err() {
            errors.push(format!(
                "unknown candle_interval: {}",
                self.engine.candle_interval,
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://tradepilot.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ExchangeSettings {
    pub testnet: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub controller_tick_secs: u64,
    pub action_tick_secs: u64,
    pub ticker_idle_timeout_secs: u64,
    pub entry_order_validity_secs: u64,
    pub signal_pause_secs: u64,
    pub candle_window_size: usize,
    pub candle_interval: String,
    pub request_timeout_secs: u64,
    pub price_precision: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            controller_tick_secs: 60,
            action_tick_secs: 5,
            ticker_idle_timeout_secs: 10,
            entry_order_validity_secs: 60,
            signal_pause_secs: 300,
            candle_window_size: 720,
            candle_interval: "1m".to_string(),
            request_timeout_secs: 60,
            price_precision: 4,
        }
    }
}

impl EngineSettings {
    pub fn controller_tick(&self) -> Duration {
        Duration::from_secs(self.controller_tick_secs)
    }

    pub fn action_tick(&self) -> Duration {
        Duration::from_secs(self.action_tick_secs)
    }

    pub fn ticker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ticker_idle_timeout_secs)
    }

    pub fn entry_order_validity(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.entry_order_validity_secs as i64)
    }

    pub fn signal_pause(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.signal_pause_secs as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn interval(&self) -> std::result::Result<TimeFrame, TradingError> {
        TimeFrame::parse(&self.candle_interval)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub queue_capacity: usize,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}
