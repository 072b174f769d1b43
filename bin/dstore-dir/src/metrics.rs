//! HTTP status endpoint of the DIR: `/health` and Prometheus `/metrics`

use crate::coordinator::DirCoordinator;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dstore_common::ShutdownSignal;
use dstore_placement::HealthStatus;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Render the Prometheus text exposition of the coordinator state
#[must_use]
pub fn render_metrics(coordinator: &DirCoordinator) -> String {
    let mut output = String::with_capacity(4 * 1024);
    let osds = coordinator.cluster_snapshot();

    let _ = writeln!(output, "# HELP dstore_osds Registered OSDs by health status");
    let _ = writeln!(output, "# TYPE dstore_osds gauge");
    for status in [HealthStatus::Up, HealthStatus::Suspected, HealthStatus::Down] {
        let count = osds.iter().filter(|o| o.status == Some(status)).count();
        let _ = writeln!(output, "dstore_osds{{status=\"{status}\"}} {count}");
    }

    let _ = writeln!(output, "# HELP dstore_osd_chunks Chunk replicas placed on each OSD");
    let _ = writeln!(output, "# TYPE dstore_osd_chunks gauge");
    for osd in &osds {
        let _ = writeln!(
            output,
            "dstore_osd_chunks{{osd_id=\"{}\"}} {}",
            osd.osd_id, osd.chunk_count
        );
    }

    let replication = coordinator.replication();
    let _ = writeln!(output, "# HELP dstore_repairs_total Replica repairs by outcome");
    let _ = writeln!(output, "# TYPE dstore_repairs_total counter");
    let _ = writeln!(
        output,
        "dstore_repairs_total{{result=\"ok\"}} {}",
        replication.repairs_succeeded()
    );
    let _ = writeln!(
        output,
        "dstore_repairs_total{{result=\"failed\"}} {}",
        replication.repairs_failed()
    );

    let _ = writeln!(output, "# HELP dstore_repair_queue_depth Queued repair tasks");
    let _ = writeln!(output, "# TYPE dstore_repair_queue_depth gauge");
    let _ = writeln!(output, "dstore_repair_queue_depth {}", replication.queue_len());

    let _ = writeln!(output, "# HELP dstore_files Files known to the coordinator");
    let _ = writeln!(output, "# TYPE dstore_files gauge");
    let _ = writeln!(output, "dstore_files {}", coordinator.state().file_count());

    output
}

async fn metrics_handler(State(coordinator): State<Arc<DirCoordinator>>) -> impl IntoResponse {
    render_metrics(&coordinator)
}

/// OK while at least one OSD can take writes
async fn health_handler(State(coordinator): State<Arc<DirCoordinator>>) -> impl IntoResponse {
    let alive = coordinator
        .cluster_snapshot()
        .iter()
        .any(|o| o.status.is_some_and(HealthStatus::is_alive));
    if alive {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NO_ALIVE_OSD")
    }
}

#[must_use]
pub fn router(coordinator: Arc<DirCoordinator>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(coordinator)
}

/// Serve the status endpoint on `port` until `shutdown` fires
pub async fn serve_metrics(
    port: u16,
    coordinator: Arc<DirCoordinator>,
    mut shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics available at http://{}/metrics", addr);
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}
