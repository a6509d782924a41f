//! # Civic-Fix Binary
//!
//! The entry point that assembles the application based on compile-time features.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use cf_api::middleware::{cors_policy, standard_middleware};
use cf_api::{configure_routes, AppState};
use cf_config::{AppConfig, LogFormat, LoggingConfig};
use cf_core::traits::{IdentityVerifier, PaymentGateway, Store};
use cf_services::{Engine, EngineSettings, PaymentSettings};
use tracing_subscriber::EnvFilter;

#[cfg(not(any(feature = "db-sqlite", feature = "db-memory")))]
compile_error!("enable a store: `db-sqlite` or `db-memory`");

#[cfg(not(feature = "auth-jwt"))]
compile_error!("the `auth-jwt` feature provides the only identity verifier");

#[cfg(not(feature = "pay-stripe"))]
compile_error!("the `pay-stripe` feature provides the only payment gateway");

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    init_tracing(&config.logging);
    if let Some(path) = &config.env_file {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let store = build_store(&config).await?;
    let identity = build_identity(&config)?;
    let gateway = build_gateway(&config)?;
    let engine = Engine::new(store, identity, gateway, engine_settings(&config));
    let state = web::Data::new(AppState { engine });

    let (host, port) = config.bind_address();
    let origins = config.server.allowed_origins.clone();
    tracing::info!(%host, port, "civic-fix listening");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(cors_policy(&origins))
            .wrap(standard_middleware())
            .configure(configure_routes)
    })
    .bind((host.as_str(), port))
    .with_context(|| format!("binding {host}:{port}"))?
    .run()
    .await?;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn engine_settings(config: &AppConfig) -> EngineSettings {
    let payments = &config.payments;
    EngineSettings {
        free_issue_limit: config.engine.free_issue_limit,
        payments: PaymentSettings {
            boost_price: payments.boost_price,
            premium_price: payments.premium_price,
            currency: payments.currency.clone(),
            success_url: payments.success_url.clone(),
            cancel_url: payments.cancel_url.clone(),
        },
        identity_timeout: Duration::from_secs(config.identity.timeout_secs),
        gateway_timeout: Duration::from_secs(payments.timeout_secs),
        status_change_attempts: config.engine.status_change_attempts,
    }
}

#[cfg(feature = "db-sqlite")]
async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    let store = cf_db_sqlite::SqliteStore::connect(&config.database.url)
        .await
        .with_context(|| format!("opening database {}", config.database.url))?;
    Ok(Arc::new(store))
}

#[cfg(all(feature = "db-memory", not(feature = "db-sqlite")))]
async fn build_store(_config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    tracing::warn!("using the in-memory store; all data is lost on restart");
    Ok(Arc::new(cf_db_memory::MemoryStore::new()))
}

#[cfg(feature = "auth-jwt")]
fn build_identity(config: &AppConfig) -> anyhow::Result<Arc<dyn IdentityVerifier>> {
    let identity = &config.identity;
    let secret = AppConfig::require_secret(&identity.jwt_secret, "identity.jwt_secret")?;
    let mut verifier = cf_auth_jwt::JwtIdentityVerifier::hs256(secret.as_bytes());
    if let Some(issuer) = &identity.issuer {
        verifier = verifier.with_issuer(issuer);
    }
    if let Some(audience) = &identity.audience {
        verifier = verifier.with_audience(audience);
    }
    Ok(Arc::new(verifier))
}

#[cfg(feature = "pay-stripe")]
fn build_gateway(config: &AppConfig) -> anyhow::Result<Arc<dyn PaymentGateway>> {
    let payments = &config.payments;
    let api_key = AppConfig::require_secret(&payments.stripe_api_key, "payments.stripe_api_key")?;
    let gateway = cf_pay_stripe::StripeGateway::new(cf_pay_stripe::StripeConfig {
        api_base: payments.stripe_api_base.clone(),
        api_key: api_key.to_string(),
        timeout: Duration::from_secs(payments.timeout_secs),
    })?;
    Ok(Arc::new(gateway))
}
