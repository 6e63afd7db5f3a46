//! Jobs Worker Service - Entry Point
//!
//! Background worker that fills listing jobs and dispatches notifications.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    zerg_jobs_worker::run().await
}
