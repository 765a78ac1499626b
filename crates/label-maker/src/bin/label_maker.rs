/*
 * label-maker - Kubernetes Node Role Labeler
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! label-maker - Kubernetes controller for node role labels
//!
//! This service:
//! - Watches every Node in the cluster
//! - Copies the role-indicator label value into `node-role.kubernetes.io/<role>`
//! - Serves `/health` and `/ready` for the kubelet probes

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::{extract::State, response::Json, routing::get, Router};
use label_maker::tasks::{config::LabelerConfig, run_node_controller};
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone)]
struct AppState {
    config: Arc<LabelerConfig>,
    shutdown: CancellationToken,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,label_maker=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting label-maker v{}", env!("CARGO_PKG_VERSION"));

    let config = LabelerConfig::from_env().context("failed to load configuration")?;

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();

    // Start the controller in the background
    let controller_handle = {
        let config = config.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_node_controller(client, config, shutdown.clone()).await {
                error!("Controller error: {}", e);
            }
            // Take the probe server down with the controller
            shutdown.cancel();
        })
    };

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let state = AppState {
        config: Arc::new(config),
        shutdown: shutdown.clone(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let probe_addr = std::env::var("PROBE_ADDR").unwrap_or_else(|_| DEFAULT_PROBE_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&probe_addr)
        .await
        .with_context(|| format!("failed to bind probe server on {probe_addr}"))?;
    info!("Probe server listening on {}", probe_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await?;

    controller_handle.await?;
    info!("label-maker stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "label-maker",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Json<Value> {
    let status = if state.shutdown.is_cancelled() {
        "stopping"
    } else {
        "ready"
    };

    Json(json!({
        "status": status,
        "service": "label-maker",
        "version": env!("CARGO_PKG_VERSION"),
        "roleLabel": state.config.role_label,
        "roleLabelExplicit": state.config.role_label_explicit
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
