//! Router: accepts client connections, runs the handshake responder and
//! dispatches sealed requests to the message handlers.
//!
//! Each accepted socket gets its own task (bounded by a semaphore sized from
//! `threads`) that serves requests while both sides keep the connection
//! alive:
//!
//! - without a `Session` header the body must be a handshake sealed with the
//!   router cipher;
//! - with one, the session must be registered and the body sealed with its
//!   cipher (a rekey handshake may still use the router cipher);
//! - `quit` ends the loop, `tunnel` parks the socket, unknown types are
//!   answered with not found and end the loop.

mod handlers;
pub mod relay;
pub mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use demonsaw_crypto::Cipher;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{ROUTER_FIRST_READ_TIMEOUT, ROUTER_READ_TIMEOUT, RouterConfig};
use crate::error::{Error, Result};
use crate::event::EventBus;
use crate::http::{HttpRequest, HttpResponse, HttpSocket, HttpStatus};
use crate::message::{MessageType, Packet};
use crate::registry::{Peer, SessionRegistry};
use crate::session::{Session, bootstrap_cipher, short_id};

use handlers::Outcome;
pub use relay::ChunkRelay;
pub use tunnel::TunnelMap;

/// Interval between stale session and slot sweeps.
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// State shared by every connection task.
pub(crate) struct Shared {
    config: RouterConfig,
    cipher: Box<dyn Cipher>,
    registry: SessionRegistry,
    relay: ChunkRelay,
    tunnels: TunnelMap,
}

/// Router entry point.
#[derive(Debug)]
pub struct Router;

impl Router {
    /// Bind the configured address and start accepting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid settings or [`Error::Io`] when
    /// the address cannot be bound.
    pub async fn bind(config: RouterConfig, events: EventBus) -> Result<RouterHandle> {
        config.validate()?;
        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            cipher: bootstrap_cipher(config.passphrase()),
            registry: SessionRegistry::new(events.clone()),
            relay: ChunkRelay::new(&config, events),
            tunnels: TunnelMap::new(),
            config,
        });
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(accept_loop(Arc::clone(&shared), listener, signal));

        tracing::info!("Router listening on {}", local_addr);
        Ok(RouterHandle {
            local_addr,
            shared,
            shutdown,
            task,
        })
    }
}

impl Shared {
    /// Drop sessions and relay slots idle for longer than `limit`, along with
    /// tunnels whose session is gone. Returns the three counts.
    fn prune(&self, limit: Duration) -> (usize, usize, usize) {
        let sessions = self.registry.prune(limit);
        let mut tunnels = sessions
            .iter()
            .filter(|id| self.tunnels.remove(id))
            .count();
        tunnels += self.tunnels.retain(|id| self.registry.contains(id));
        let slots = self.relay.prune(limit);
        (sessions.len(), slots, tunnels)
    }
}

/// A running router.
pub struct RouterHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RouterHandle {
    /// Bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    /// Chunk relay.
    #[must_use]
    pub fn relay(&self) -> &ChunkRelay {
        &self.shared.relay
    }

    /// Parked tunnels.
    #[must_use]
    pub fn tunnels(&self) -> &TunnelMap {
        &self.shared.tunnels
    }

    /// Sweep sessions, relay slots and tunnels idle for longer than `limit`
    /// now instead of waiting for the periodic sweep.
    pub fn prune(&self, limit: Duration) -> (usize, usize, usize) {
        self.shared.prune(limit)
    }

    /// Stop accepting, abort connection tasks and wait for the accept loop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!("Router accept loop failed: {}", err);
        }
        tracing::info!("Router on {} stopped", self.local_addr);
    }
}

impl std::fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterHandle")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.shared.registry.len())
            .field("transfers", &self.shared.relay.len())
            .finish()
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut signal: watch::Receiver<bool>) {
    let permits = Arc::new(Semaphore::new(shared.config.threads()));
    let mut connections = JoinSet::new();
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("Accept failed: {}", err);
                        continue;
                    }
                };
                let permit = tokio::select! {
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = signal.changed() => break,
                };
                let shared = Arc::clone(&shared);
                connections.spawn(async move {
                    serve(&shared, stream, addr).await;
                    drop(permit);
                });
            }
            _ = prune.tick() => {
                let (sessions, slots, tunnels) = shared.prune(shared.config.session_timeout());
                if sessions + slots + tunnels > 0 {
                    tracing::debug!(
                        "Pruned {} sessions, {} relay slots and {} tunnels",
                        sessions,
                        slots,
                        tunnels
                    );
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = signal.changed() => break,
        }
    }

    connections.abort_all();
    while connections.join_next().await.is_some() {}
}

async fn respond(socket: &mut HttpSocket, peer: Option<&Arc<Peer>>, status: HttpStatus) -> Result<()> {
    let mut response = HttpResponse::status(status);
    response.session = peer.map(|peer| peer.id()).filter(|id| !id.is_empty());
    socket.write_response(&response).await
}

/// Open a request body, choosing the peer and cipher by the session header.
fn open(shared: &Shared, request: &HttpRequest) -> std::result::Result<(Arc<Peer>, Packet), HttpStatus> {
    let Some(id) = &request.session else {
        let packet = Packet::open(&request.body, shared.cipher.as_ref()).map_err(|_| HttpStatus::BadRequest)?;
        if packet.kind() != MessageType::Handshake {
            return Err(HttpStatus::BadRequest);
        }
        return Ok((Arc::new(Peer::new(Session::new())), packet));
    };

    let peer = shared.registry.get(id).ok_or(HttpStatus::Unauthorized)?;
    peer.touch();
    let opened = Packet::open(&request.body, peer.session().cipher());
    let packet = match opened {
        Ok(packet) => packet,
        Err(_) => match Packet::open(&request.body, shared.cipher.as_ref()) {
            Ok(packet) if packet.kind() == MessageType::Handshake => packet,
            _ => return Err(HttpStatus::BadRequest),
        },
    };
    Ok((peer, packet))
}

async fn serve(shared: &Shared, stream: TcpStream, addr: SocketAddr) {
    let mut socket = HttpSocket::from_stream(stream, shared.config.socket_timeout());
    let mut wait = ROUTER_FIRST_READ_TIMEOUT;
    tracing::debug!("Connection from {}", addr);

    loop {
        let request = match socket.read_request_within(wait).await {
            Ok(Some(request)) => request,
            Ok(None) | Err(Error::Timeout(_)) => break,
            Err(Error::Protocol(reason)) => {
                tracing::debug!("Malformed request from {}: {}", addr, reason);
                let _ = socket.write_status(HttpStatus::BadRequest).await;
                break;
            }
            Err(err) => {
                tracing::debug!("Read from {} failed: {}", addr, err);
                break;
            }
        };
        wait = ROUTER_READ_TIMEOUT;

        if !request.method.eq_ignore_ascii_case("POST") {
            let _ = socket.write_status(HttpStatus::MethodNotAllowed).await;
            break;
        }

        let (peer, packet) = match open(shared, &request) {
            Ok(opened) => opened,
            Err(status) => {
                if respond(&mut socket, None, status).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let handshake = packet.kind() == MessageType::Handshake;
        let outcome = handlers::dispatch(shared, &peer, packet);
        let (reply, last) = match outcome {
            Outcome::Reply(packet) => (Ok(packet), false),
            Outcome::Last(packet) => (Ok(packet), true),
            Outcome::Status(status) => (Err(status), false),
            Outcome::Close(status) => (Err(status), true),
            Outcome::Tunnel => {
                let id = peer.id();
                if respond(&mut socket, Some(&peer), HttpStatus::Ok).await.is_ok() {
                    tracing::debug!("Tunnel parked for {}", short_id(&id));
                    shared.tunnels.insert(&id, socket.into_stream());
                }
                return;
            }
        };

        let written = match reply {
            Ok(packet) => {
                let sealed = if handshake {
                    packet.seal(shared.cipher.as_ref())
                } else {
                    packet.seal(peer.session().cipher())
                };
                match sealed {
                    Ok(body) => {
                        let mut response = HttpResponse::ok(Some(peer.id()), body);
                        response.keep_alive = request.keep_alive && !last;
                        socket.write_response(&response).await
                    }
                    Err(err) => {
                        tracing::error!("Sealing reply for {} failed: {}", addr, err);
                        respond(&mut socket, Some(&peer), HttpStatus::InternalError).await
                    }
                }
            }
            Err(status) => respond(&mut socket, Some(&peer), status).await,
        };

        if written.is_err() || last || !request.keep_alive {
            break;
        }
    }
    socket.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpRequest;

    fn local() -> RouterConfig {
        RouterConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
            ..RouterConfig::default()
        }
    }

    async fn connect(handle: &RouterHandle) -> HttpSocket {
        HttpSocket::open("127.0.0.1", handle.local_addr().port(), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_session_unauthorized() {
        let handle = Router::bind(local(), EventBus::new()).await.unwrap();
        let mut socket = connect(&handle).await;

        let body = Packet::empty(MessageType::Ping).seal(Session::new().cipher()).unwrap();
        socket
            .write_request(&HttpRequest::post(Some("nobody".to_string()), body.clone()))
            .await
            .unwrap();
        assert_eq!(socket.read_response().await.unwrap().status, HttpStatus::Unauthorized);

        // The loop continues after an unauthorized request
        socket.write_request(&HttpRequest::post(None, body)).await.unwrap();
        assert_eq!(socket.read_response().await.unwrap().status, HttpStatus::BadRequest);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_not_allowed() {
        let handle = Router::bind(local(), EventBus::new()).await.unwrap();
        let mut socket = connect(&handle).await;
        let request = HttpRequest {
            method: "GET".to_string(),
            ..HttpRequest::post(None, String::new())
        };
        socket.write_request(&request).await.unwrap();
        assert_eq!(
            socket.read_response().await.unwrap().status,
            HttpStatus::MethodNotAllowed
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_garbage_body_bad_request() {
        let handle = Router::bind(local(), EventBus::new()).await.unwrap();
        let mut socket = connect(&handle).await;
        socket
            .write_request(&HttpRequest::post(None, "not base64!".to_string()))
            .await
            .unwrap();
        assert_eq!(socket.read_response().await.unwrap().status, HttpStatus::BadRequest);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let config = RouterConfig {
            max_transfers: 0,
            ..local()
        };
        assert!(Router::bind(config, EventBus::new()).await.unwrap_err().is_config());
    }
}
