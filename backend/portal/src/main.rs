//! Commit Portal: entry point.
//!
//! Hosts the challenge engine behind an Axum REST API backed by SQLite, and
//! runs a background sweep that closes overdue enrollments. Both stop on
//! Ctrl-C.

mod api;
mod config;
mod db;
mod errors;
mod sweeper;
mod upload;
mod verifier;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use commit_engine::{
    Catalog, ChallengeEngine, DailyDeadline, FailurePolicy, NeverFail, ProofVerifier, RetryPolicy,
};
use config::{Config, FailurePolicyKind};
use errors::Result;
use verifier::{HttpVerifier, SimulatedVerifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = db::init_pool(&config.database_url).await?;
    let engine = Arc::new(build_engine(&config, pool.clone()).await?);

    let shutdown = CancellationToken::new();

    // ─── Overdue sweep ────────────────────────────────────
    let sweep = tokio::spawn(sweeper::run(
        engine.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        shutdown.clone(),
    ));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        engine,
        pool,
        max_proof_bytes: config.max_proof_bytes,
    });

    // Base64 inflates uploads by 4/3; leave headroom for the JSON envelope.
    let body_limit = config.max_proof_bytes / 3 * 4 + 4096;

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/templates", get(api::list_templates))
        .route("/templates/:id", get(api::get_template))
        .route("/templates/:id/tiers/:tier/quote", get(api::quote_stake))
        .route("/enrollments", post(api::start_enrollment))
        .route("/enrollments/:id", get(api::get_enrollment))
        .route("/enrollments/:id/proofs", post(api::submit_proof))
        .route("/enrollments/:id/events", get(api::enrollment_events))
        .route("/me/enrollments", get(api::my_enrollments))
        .route("/me/summary", get(api::my_summary))
        .route("/proofs", post(api::upload_proof))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    sweep.await?;
    Ok(())
}

/// Wire catalog, store, verifier and failure policy into the engine.
async fn build_engine(config: &Config, pool: sqlx::SqlitePool) -> Result<ChallengeEngine> {
    let catalog = match &config.catalog_path {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            let catalog = Catalog::from_json(&json)?;
            info!("Loaded {} challenge templates from {path}", catalog.len());
            catalog
        }
        None => Catalog::builtin(),
    };

    let verifier: Arc<dyn ProofVerifier> = match &config.verifier_url {
        Some(url) => {
            let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
            info!("Verifying proofs via {url}");
            Arc::new(HttpVerifier::new(client, url.clone()))
        }
        None => {
            info!("Verifying proofs with a simulated {}ms delay", config.verify_delay_ms);
            Arc::new(SimulatedVerifier::new(Duration::from_millis(config.verify_delay_ms)))
        }
    };

    let failure_policy: Arc<dyn FailurePolicy> = match config.failure_policy {
        FailurePolicyKind::Never => Arc::new(NeverFail),
        FailurePolicyKind::DailyDeadline => Arc::new(DailyDeadline::new(chrono::Duration::minutes(
            config.deadline_grace_minutes,
        ))),
    };
    info!("Failure policy: {}", failure_policy.name());

    let retry = RetryPolicy {
        max_retries: config.max_write_retries,
        ..RetryPolicy::default()
    };

    Ok(
        ChallengeEngine::new(Arc::new(catalog), Arc::new(db::SqliteStore::new(pool)))
            .with_verifier(verifier)
            .with_failure_policy(failure_policy)
            .with_retry_policy(retry),
    )
}
