//! One-shot server probe: handshake with a router, record its version and
//! leave.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::RouterLink;
use crate::config::MachineConfig;
use crate::error::Result;
use crate::machine::{MachineCore, Next, Role, State};

/// Probe machine (`start -> handshake -> quit`).
#[derive(Debug)]
pub struct ServerMachine {
    core: Arc<MachineCore>,
    link: RouterLink,
    router_version: Option<String>,
}

impl ServerMachine {
    /// Probe for the router in `config`.
    #[must_use]
    pub fn new(config: MachineConfig) -> Self {
        let name = format!("server {}:{}", config.address, config.port);
        Self {
            core: Arc::new(MachineCore::new(name, config.clone())),
            link: RouterLink::new(config),
            router_version: None,
        }
    }

    /// Router version seen by the last successful handshake.
    #[must_use]
    pub fn router_version(&self) -> Option<&str> {
        self.router_version.as_deref()
    }
}

#[async_trait]
impl Role for ServerMachine {
    fn core(&self) -> &Arc<MachineCore> {
        &self.core
    }

    async fn on_handshake(&mut self) -> Result<Next> {
        self.link.handshake(false).await?;
        self.router_version = Some(self.link.router_version().to_string());
        Ok(Next::now(State::Quit))
    }

    async fn on_restart(&mut self) {
        self.link.reset().await;
    }

    async fn on_quit(&mut self) {
        self.link.quit().await;
    }
}
