use std::sync::Arc;

use reach_transfer::{Responder, ServerConfig, TracingLogger};
use tracing::info;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reach_server=debug,reach_transfer=info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // One thread: the responder is a single receive loop.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match &config.serve_root {
            Some(root) => info!("Serving files below {}", root.display()),
            None => info!("Serving absolute paths (REACH_SERVE_ROOT unset)"),
        }
        info!(
            "Packet size {} bytes, session timeout {}s, pacing {:?}",
            config.packet_size,
            config.session_timeout.as_secs(),
            config.send_pacing,
        );

        let responder = Responder::bind(config, Some(Arc::new(TracingLogger)))?;
        info!("REACH server listening on {}", responder.local_addr()?);

        tokio::select! {
            result = responder.run() => result?,
            _ = shutdown_signal() => {}
        }
        Ok::<(), anyhow::Error>(())
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
