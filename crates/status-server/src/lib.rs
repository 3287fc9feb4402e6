//! Status Server
//!
//! Read-only HTTP view of the drift engine:
//! - `GET /` returns the last cycle's inventory and the daily schedule
//! - `GET /health` returns liveness

pub mod api;
pub mod state;

pub use state::AppState;

use axum::{routing::get, Router};
use drift_engine::SnapshotHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(api::status::get_status))
        .route("/health", get(api::health::get_health))
        .with_state(state)
}

/// Serves the status routes on `addr` until the task is dropped.
pub async fn serve(addr: SocketAddr, snapshot: SnapshotHandle) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Status server listening");
    axum::serve(listener, router(Arc::new(AppState::new(snapshot)))).await?;
    Ok(())
}
