use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use worldcore_server::Server;
use worldcore_server::config::{CliArgs, ServerConfig};
use worldcore_server::error::Fatal;

fn main() -> ExitCode {
    let cli = CliArgs::parse(std::env::args().skip(1));
    let config = match ServerConfig::load(&cli, std::env::vars()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", Fatal::Config(e));
            return ExitCode::from(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if config.server.io_threads > 0 {
        runtime.worker_threads(config.server.io_threads);
    }
    let runtime = match runtime.build() {
        Ok(rt) => rt,
        Err(e) => {
            let fatal = Fatal::Runtime(e.into());
            tracing::error!("{}", fatal);
            return fatal.exit_code();
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => {
            tracing::info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(fatal) => {
            tracing::error!("{}", fatal);
            fatal.exit_code()
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), Fatal> {
    tracing::info!(
        "worldcore server starting: seed {}, persistence {:?}",
        config.world.seed,
        config.persistence.backend
    );
    let server = Server::start(config).await?;
    server.run_until(shutdown_signal()).await
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received, shutting down..."),
        _ = terminate => tracing::info!("SIGTERM received, shutting down..."),
    }
}
