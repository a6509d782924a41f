//! # cf-config
//!
//! Layered runtime configuration: built-in defaults, then an optional
//! `civic-fix.toml` in the working directory, then `CIVICFIX__*` environment
//! variables (`CIVICFIX__SERVER__PORT=9000` sets `server.port`). A `.env`
//! file, if present, is loaded into the environment first.

use std::path::PathBuf;

use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use config::builder::DefaultState;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

pub const ENV_PREFIX: &str = "CIVICFIX";
pub const CONFIG_FILE: &str = "civic-fix";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub identity: IdentityConfig,
    pub payments: PaymentsConfig,
    pub logging: LoggingConfig,
    /// `.env` file that `load` read into the environment, if any. Logged by
    /// the caller once tracing is up.
    #[serde(skip)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed by CORS; empty allows any.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Issues a non-premium citizen may file over the life of the account.
    pub free_issue_limit: u32,
    pub status_change_attempts: u32,
}

#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    pub jwt_secret: SecretString,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct PaymentsConfig {
    /// Minor currency units.
    pub boost_price: i64,
    pub premium_price: i64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub stripe_api_key: SecretString,
    pub stripe_api_base: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl AppConfig {
    /// Loads `.env`, the optional config file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env_file = dotenvy::dotenv().ok();
        let config = defaults()?
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(environment())
            .build()?;
        let mut app = Self::finish(config)?;
        app.env_file = env_file;
        Ok(app)
    }

    /// Defaults overlaid with a TOML document. Environment is ignored.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config = defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::finish(config)
    }

    /// Defaults overlaid with the given variables, read as if they were the
    /// process environment.
    pub fn from_env_map(vars: config::Map<String, String>) -> Result<Self, ConfigError> {
        let config = defaults()?
            .add_source(environment().source(Some(vars)))
            .build()?;
        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self, ConfigError> {
        let app: Self = config.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.free_issue_limit == 0 {
            return Err(ConfigError::Invalid("engine.free_issue_limit must be at least 1".into()));
        }
        if self.payments.boost_price <= 0 || self.payments.premium_price <= 0 {
            return Err(ConfigError::Invalid("payment prices must be positive".into()));
        }
        if self.payments.currency.trim().is_empty() {
            return Err(ConfigError::Invalid("payments.currency must be set".into()));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> (String, u16) {
        (self.server.host.clone(), self.server.port)
    }

    /// Fails when a secret the enabled plugins need was left empty.
    pub fn require_secret<'a>(secret: &'a SecretString, name: &str) -> Result<&'a str, ConfigError> {
        let value = secret.expose_secret();
        if value.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{name} must be set")));
        }
        Ok(value)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
    Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("database.url", "sqlite://civic-fix.db")?
        .set_default("engine.free_issue_limit", 3)?
        .set_default("engine.status_change_attempts", 3)?
        .set_default("identity.jwt_secret", "")?
        .set_default("identity.timeout_secs", 5)?
        .set_default("payments.boost_price", 100)?
        .set_default("payments.premium_price", 1000)?
        .set_default("payments.currency", "usd")?
        .set_default(
            "payments.success_url",
            "http://localhost:8080/api/payments/success?session_id={CHECKOUT_SESSION_ID}",
        )?
        .set_default("payments.cancel_url", "http://localhost:8080/api/payments/cancelled")?
        .set_default("payments.stripe_api_key", "")?
        .set_default("payments.stripe_api_base", "https://api.stripe.com")?
        .set_default("payments.timeout_secs", 10)?
        .set_default("logging.format", "pretty")?
        .set_default("logging.filter", "info,sqlx=warn")
}
