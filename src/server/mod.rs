//! Control plane: request ingress, event fan-out, cross-cutting policy.

mod events;
mod router;
mod settings;
mod state;
mod ws;

pub use router::build_router;
pub use settings::{SettingsStore, SettingsUpdate};
pub use state::AppState;

use std::net::SocketAddr;

use anyhow::Context;
use tracing::info;

/// Serve the control plane until `shutdown` resolves, then drain sessions.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(target: "server", %addr, "control plane listening");

    let center = state.center.clone();
    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    center.shutdown_all().await;
    Ok(())
}
