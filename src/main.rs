//! x402 facilitator HTTP entrypoint.
//!
//! Launches an axum server exposing the facilitator API:
//! - `POST /verify` – check a payment payload against requirements
//! - `POST /settle` – execute an accepted payment on-chain
//! - `GET /supported` – supported (version, scheme, network) combinations
//! - `GET /healthz` – liveness
//! - `POST /claims/report` – report a broken settlement (API key required)
//!
//! Configuration comes from a JSON file (`--config`, `CONFIG` env) with
//! `.env` loaded first. A background task sweeps overdue claims.

use axum::http::Method;
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use x402_facilitator::claims::{ClaimsService, InMemoryClaimsStore, RefundWallet};
use x402_facilitator::config::{CliArgs, FacilitatorConfig};
use x402_facilitator::engine::FacilitatorEngine;
use x402_facilitator::handlers::{self, AppState};
use x402_facilitator::telemetry;
use x402_facilitator::webhook::WebhookDispatcher;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    telemetry::init();

    let args = CliArgs::parse();
    let config = FacilitatorConfig::load(&args.config)?;

    let adapters = Arc::new(config.build_adapters()?);
    let webhooks = WebhookDispatcher::new(config.webhook_targets()?);
    let engine = Arc::new(FacilitatorEngine::new(
        Arc::clone(&adapters),
        webhooks.clone(),
        config.facilitator_id.clone(),
    ));

    let store = Arc::new(InMemoryClaimsStore::new());
    for api_key in &config.api_keys {
        store
            .add_api_key(
                &api_key.key.resolve()?,
                api_key.server_id.clone(),
                api_key.resource_owner.clone(),
            )
            .await;
    }
    for wallet in &config.refund_wallets {
        store
            .add_refund_wallet(
                wallet.resource_owner.clone(),
                wallet.network.clone(),
                RefundWallet {
                    address: wallet.address.clone(),
                    secret: wallet.secret.resolve()?,
                },
            )
            .await;
    }
    let claims = Arc::new(ClaimsService::new(
        store,
        Arc::clone(&adapters),
        webhooks,
        config.facilitator_id.clone(),
    ));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());
    spawn_expiry_sweep(Arc::clone(&claims), shutdown.clone());

    let state = AppState {
        engine,
        claims,
    };
    let app = handlers::routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = config.listen_address();
    tracing::info!(%addr, "starting facilitator server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        shutdown.cancel();
    });
}

/// Periodically expire overdue claims until shutdown.
fn spawn_expiry_sweep(claims: Arc<ClaimsService<InMemoryClaimsStore>>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = claims.expire_sweep(chrono::Utc::now()).await {
                        tracing::error!(error = %e, "claim expiry sweep failed");
                    }
                }
            }
        }
    });
}
