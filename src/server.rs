use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;

use crate::{
    config::ServerConfig,
    coordinator::TurnCoordinator,
    listener::{ConnectionListener, ListenerHandle},
    registry::AgentRegistry,
    status::StatusBoard,
};

/// The network side of the arena: listener, agent proxies and the turn
/// coordinator, all built from one [`ServerConfig`].
pub struct ArenaServer {
    config: ServerConfig,
    registry: Arc<AgentRegistry>,
    status: Arc<StatusBoard>,
    coordinator: TurnCoordinator,
    listener: ListenerHandle,
}

impl ArenaServer {
    pub async fn start(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(AgentRegistry::from_config(&config));
        let status = Arc::new(StatusBoard::from_config(&config));
        let coordinator = TurnCoordinator::new(Arc::clone(&registry), config.agent_timeout());
        let listener =
            ConnectionListener::bind(&config, Arc::clone(&registry), Arc::clone(&status))
                .await?
                .start()?;

        tracing::info!(
            target = "arena_broker::server",
            addr = %listener.local_addr(),
            agents = registry.len(),
            teams = registry.teams().len(),
            "arena server started"
        );

        Ok(Self {
            config,
            registry,
            status,
            coordinator,
            listener,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn status(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    pub fn coordinator(&self) -> &TurnCoordinator {
        &self.coordinator
    }

    /// Stops accepting, then says bye to every agent.
    pub async fn shutdown(self) {
        self.listener.stop().await;
        self.coordinator.shutdown().await;
        tracing::info!(target = "arena_broker::server", "arena server stopped");
    }
}
