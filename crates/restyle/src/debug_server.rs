use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;

use restyle_engine::QueueSnapshot;

/// Serve the supervisor's latest queue snapshot on the given port.
pub async fn serve(port: u16, snapshots: watch::Receiver<QueueSnapshot>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/debug/queue", get(queue_snapshot))
        .with_state(snapshots);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "debug endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn queue_snapshot(
    State(snapshots): State<watch::Receiver<QueueSnapshot>>,
) -> Json<QueueSnapshot> {
    Json(snapshots.borrow().clone())
}
