//! Sockets handed off by `tunnel` requests, keyed by session id.
//!
//! A parked socket lives until its session quits, migrates or is pruned.

use dashmap::DashMap;
use tokio::net::TcpStream;

use crate::session::short_id;

/// Parked tunnel sockets.
#[derive(Debug, Default)]
pub struct TunnelMap {
    tunnels: DashMap<String, TcpStream>,
}

impl TunnelMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `stream` for session `id`, replacing (and closing) an older one.
    pub fn insert(&self, id: &str, stream: TcpStream) {
        if self.tunnels.insert(id.to_string(), stream).is_some() {
            tracing::debug!("Tunnel for {} replaced", short_id(id));
        }
    }

    /// Drop the tunnel of session `id`, closing its socket.
    pub fn remove(&self, id: &str) -> bool {
        self.tunnels.remove(id).is_some()
    }

    /// Keep only tunnels whose session id passes `keep`, returning how many
    /// were dropped.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) -> usize {
        let before = self.tunnels.len();
        self.tunnels.retain(|id, _| keep(id));
        before.saturating_sub(self.tunnels.len())
    }

    /// Number of parked tunnels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Whether nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
