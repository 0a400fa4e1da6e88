use std::sync::Arc;

use tokio::net::TcpListener;

use crate::services::Services;

/// Accept clients until the task is aborted. Each connection gets its own task.
pub async fn run(listener: TcpListener, services: Arc<Services>) -> anyhow::Result<()> {
    tracing::info!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        tracing::debug!("Connection from {}", addr);

        let services = Arc::clone(&services);
        tokio::spawn(async move {
            if let Err(e) = super::connection::handle(stream, services).await {
                tracing::warn!("Connection from {} closed: {}", addr, e);
            }
        });
    }
}
