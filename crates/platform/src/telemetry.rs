//! Exposes a Prometheus scrape endpoint. Grounded in the teacher's
//! `platform::telemetry::telemetry_service` (axum `/metrics` route, graceful
//! shutdown wired to the service's `CancellationToken`), upgraded to render
//! through a real `metrics_exporter_prometheus::PrometheusHandle` instead of
//! a static string.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use taskqueue_core::config::ObservabilitySettings;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::service::ServiceRegistration;

pub fn install_recorder() -> Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

pub fn telemetry_service(settings: ObservabilitySettings, handle: PrometheusHandle) -> ServiceRegistration {
    ServiceRegistration::new(
        "telemetry",
        Arc::new(move |_ctx, token: CancellationToken| {
            let settings = settings.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                if !settings.enable_metrics {
                    return Ok(());
                }

                let app = Router::new().route("/metrics", get(metrics_handler)).with_state(handle);
                let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
                let shutdown = token.clone();

                let listener = tokio::net::TcpListener::bind(addr).await?;
                info!(port = settings.metrics_port, "telemetry server started");

                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        shutdown.cancelled().await;
                        info!("shutting down telemetry server");
                    })
                    .await?;

                Ok(())
            })
        }),
    )
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
