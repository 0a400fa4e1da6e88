pub mod config;
pub mod dashboard;
pub mod entity;
pub mod error;
pub mod event_bus;
pub mod game;
pub mod net;
pub mod persistence;
pub mod player_registry;
pub mod protocol;
pub mod services;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use config::ServerConfig;
use error::Fatal;
use game::Intent;
use game::game_loop::GameLoop;
use services::Services;

/// A running server: listener, game loop, streamer and optional dashboard.
pub struct Server {
    services: Arc<Services>,
    local_addr: SocketAddr,
    game_loop: JoinHandle<anyhow::Result<()>>,
    listener: JoinHandle<anyhow::Result<()>>,
    dashboard: Option<JoinHandle<()>>,
}

impl Server {
    /// Open persistence, bind the listener and start every background task.
    pub async fn start(config: ServerConfig) -> Result<Server, Fatal> {
        let bind_addr = config.bind_addr();
        let dashboard = config.dashboard.enabled.then_some(config.dashboard.port);
        let (services, intents) = Services::build(config)?;

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("cannot bind {}", bind_addr))
            .map_err(Fatal::Bind)?;
        let local_addr = listener.local_addr().map_err(|e| Fatal::Bind(e.into()))?;

        services.streamer.start();
        let game_loop = tokio::spawn(GameLoop::new(Arc::clone(&services), intents).run());
        let listener = tokio::spawn(net::listener::run(listener, Arc::clone(&services)));
        let dashboard = dashboard.map(|port| tokio::spawn(dashboard::server::start(Arc::clone(&services), port)));

        tracing::info!("Server listening on {}", local_addr);
        Ok(Server { services, local_addr, game_loop, listener, dashboard })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Run until `signal` resolves or the listener fails, then shut down
    /// gracefully.
    pub async fn run_until(mut self, signal: impl Future<Output = ()>) -> Result<(), Fatal> {
        let accept_error = tokio::select! {
            _ = signal => None,
            result = &mut self.listener => Some(match result {
                Ok(Ok(())) => anyhow::anyhow!("listener stopped"),
                Ok(Err(e)) => e,
                Err(e) => anyhow::Error::new(e).context("listener task panicked"),
            }),
        };
        if let Some(e) = &accept_error {
            tracing::error!("Listener failed: {:#}", e);
        }
        self.shutdown().await?;
        match accept_error {
            Some(e) => Err(Fatal::Runtime(e)),
            None => Ok(()),
        }
    }

    /// Graceful shutdown: notify sessions, wait out the grace window, then
    /// save players and chunks. Logins are refused meanwhile.
    pub async fn shutdown(self) -> Result<(), Fatal> {
        tracing::info!("Shutting down");
        let _ = self.services.intents.send(Intent::BeginShutdown).await;
        let result = match self.game_loop.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Fatal::Runtime(e)),
            Err(e) => Err(Fatal::Runtime(anyhow::Error::new(e).context("game loop panicked"))),
        };
        self.listener.abort();
        if let Some(dashboard) = self.dashboard {
            dashboard.abort();
        }
        result
    }
}
