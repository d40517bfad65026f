//! TCP listener tying sessions and the tick loop together

use crate::config::ServerConfig;
use crate::context::{EngineChannels, ServerContext};
use crate::engine::Engine;
use crate::error::ServerError;
use crate::external::{EligibilityCheck, SpawnDistributionProvider, StatisticsSink};
use crate::session::handle_connection;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Main server coordinating the listener and the tick loop
pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    engine: Engine,
}

impl Server {
    /// Validates the configuration, builds the world and binds the listener.
    pub async fn bind(
        config: ServerConfig,
        eligibility: Arc<dyn EligibilityCheck>,
        provider: Arc<dyn SpawnDistributionProvider>,
        sink: Arc<dyn StatisticsSink>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.bind_addr.clone();

        let (ctx, channels): (Arc<ServerContext>, EngineChannels) =
            ServerContext::new(config, eligibility);
        let engine = Engine::new(Arc::clone(&ctx), channels, provider, sink)?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            ctx,
            engine,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared state, e.g. to request shutdown from outside.
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Accepts connections until shutdown is requested, then waits for the
    /// tick loop to say goodbye to every session.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            ctx,
            engine,
        } = self;

        let engine_handle = tokio::spawn(engine.run());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(Arc::clone(&ctx), stream, peer));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = ctx.control.shutdown_requested() => break,
            }
        }

        info!("No longer accepting connections");
        drop(listener);
        if let Err(e) = engine_handle.await {
            error!("Tick loop panicked: {}", e);
        }
        info!("Server stopped");
        Ok(())
    }
}
