use mandi_finance::{FeeSchedule, FinanceSettings};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub kafka: KafkaConfig,
    pub engine: EngineRules,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Empty means "run on the in-memory repositories".
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    #[serde(default)]
    pub brokers: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_gateway_topic")]
    pub gateway_topic: String,
}

fn default_group_id() -> String {
    "mandi-engine".to_string()
}

fn default_gateway_topic() -> String {
    "mandi.gateway.events".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineRules {
    #[serde(default = "default_currency")]
    pub default_currency: String,
    #[serde(default = "default_retries")]
    pub max_conflict_retries: u32,
    #[serde(default = "default_payment_terms")]
    pub payment_terms_days: i64,
    /// Combined GST percentage used when a request does not carry one.
    pub gst_rate: Decimal,
    #[serde(default)]
    pub fees: FeeRules,
}

fn default_currency() -> String {
    "INR".to_string()
}

fn default_retries() -> u32 {
    3
}

fn default_payment_terms() -> i64 {
    30
}

/// Money rules are read as decimals, never through a float.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FeeRules {
    #[serde(default)]
    pub gateway_fee_percent: Decimal,
    #[serde(default)]
    pub processing_fee: Decimal,
    #[serde(default)]
    pub convenience_fee: Decimal,
}

fn ensure_percent(name: &str, value: Decimal) -> Result<(), config::ConfigError> {
    if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
        return Err(config::ConfigError::Message(format!("{} must be within 0..=100, got {}", name, value)));
    }
    Ok(())
}

impl EngineRules {
    pub fn gst_rate(&self) -> Decimal {
        self.gst_rate
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            gateway_fee_percent: self.fees.gateway_fee_percent,
            processing_fee: self.fees.processing_fee,
            convenience_fee: self.fees.convenience_fee,
        }
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        ensure_percent("engine.gst_rate", self.gst_rate)?;
        ensure_percent("engine.fees.gateway_fee_percent", self.fees.gateway_fee_percent)?;
        for (name, fee) in [
            ("engine.fees.processing_fee", self.fees.processing_fee),
            ("engine.fees.convenience_fee", self.fees.convenience_fee),
        ] {
            if fee < Decimal::ZERO {
                return Err(config::ConfigError::Message(format!("{} cannot be negative, got {}", name, fee)));
            }
        }
        Ok(())
    }

    pub fn finance_settings(&self) -> FinanceSettings {
        FinanceSettings {
            fee_schedule: self.fee_schedule(),
            payment_terms_days: self.payment_terms_days,
            max_conflict_retries: self.max_conflict_retries,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Developer overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `MANDI__DATABASE__URL=postgres://...`
            .add_source(config::Environment::with_prefix("MANDI").prefix_separator("__").separator("__"))
            .build()?;

        let config: Config = s.try_deserialize()?;
        config.engine.validate()?;
        Ok(config)
    }
}
