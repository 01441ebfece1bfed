use std::sync::Arc;

use lexisync_worker::{init_tracing, shared_coordinator, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let base_url =
        std::env::var("LEXISYNC_SERVER").unwrap_or_else(|_| "https://learn.example.com".into());
    let username = std::env::var("LEXISYNC_USER").unwrap_or_else(|_| "default".into());

    let config = WorkerConfig::new(&base_url, &username);
    let progress = Arc::new(|msg: lexisync_worker::ProgressMessage| {
        tracing::info!(key = ?msg.key, args = ?msg.args, "bootstrap progress");
    });
    let _coordinator = shared_coordinator(config, progress).await?;
    tracing::info!(user = %username, server = %base_url, "worker running");

    tokio::signal::ctrl_c().await?;
    lexisync_worker::reset_shared_coordinator().await;
    Ok(())
}
