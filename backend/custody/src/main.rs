//! Custody engine entry point.
//!
//! Starts one background task per lifecycle job and a small read-only Axum
//! API for operators.  Ctrl-C stops the jobs between runs and drains the API.

use std::sync::Arc;

use axum::{routing::get, Router};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use custody_engine::api;
use custody_engine::bank::JunoClient;
use custody_engine::chain::{EscrowClient, RelayerGateway};
use custody_engine::config::Config;
use custody_engine::db;
use custody_engine::multisig::MultisigEngine;
use custody_engine::rates::HttpRateSource;
use custody_engine::router::TransactionRouter;
use custody_engine::safety::SafetyService;
use custody_engine::scheduler::{self, SchedulerState};
use custody_engine::stages::{StageSettings, Stages};

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

    // Shared by the relayer, banking rail and rate lookups.
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    // ─── Collaborators ────────────────────────────────────
    let gateway = Arc::new(RelayerGateway::new(
        client.clone(),
        config.chain.rpc_url.clone(),
        config.chain.bridge_wallet.clone(),
    ));
    let contract = Arc::new(EscrowClient::new(gateway, config.chain.clone()));
    let bank = Arc::new(JunoClient::new(client.clone(), config.bank.clone()));
    let rates = Arc::new(HttpRateSource::new(client, config.routing.rate_api_url.clone()));

    let router = Arc::new(TransactionRouter::new(config.routing.clone(), rates));
    let report = router.validate_configuration();
    if !report.is_complete() {
        warn!(
            missing = ?report.missing,
            fail_open = router.fail_open(),
            "Multi-sig routing is not fully configured"
        );
    }

    let stages = Arc::new(Stages::new(
        pool.clone(),
        contract,
        bank.clone(),
        StageSettings::from_config(&config),
    ));
    let multisig = Arc::new(MultisigEngine::new(
        pool.clone(),
        router.clone(),
        stages.clone(),
        config.approvals.ttl,
    ));
    let safety = Arc::new(SafetyService::new(
        pool.clone(),
        stages.clone(),
        config.safety.max_attempts,
    ));

    // ─── Background jobs ──────────────────────────────────
    let shutdown = CancellationToken::new();
    let scheduler_state = Arc::new(SchedulerState {
        pool: pool.clone(),
        bank,
        router,
        stages,
        multisig,
        safety,
        escalate_after: config.safety.max_rejections,
    });
    let jobs = scheduler::spawn_all(scheduler_state, config.schedule.clone(), shutdown.clone());

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState { pool });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/payments/:id/events", get(api::payment_events))
        .route("/approvals/pending", get(api::pending_approvals))
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
    for job in jobs {
        let _ = job.await;
    }
    info!("Custody engine stopped");
    Ok(())
}
