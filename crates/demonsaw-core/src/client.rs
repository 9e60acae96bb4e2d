//! Client side of a router connection.
//!
//! [`RouterLink`] owns the socket and session for one router and turns
//! packets into sealed HTTP exchanges. [`ClientMachine`] drives it through
//! `start -> handshake -> join -> [group] -> info -> ping ... -> quit`.

use std::sync::Arc;

use async_trait::async_trait;
use demonsaw_crypto::Cipher;
use serde::de::DeserializeOwned;

use crate::config::MachineConfig;
use crate::error::{Error, Result};
use crate::handshake::{HandshakeResponse, client_request, client_response};
use crate::http::{HttpRequest, HttpResponse, HttpSocket, HttpStatus};
use crate::machine::{MachineCore, Next, Role, State};
use crate::group::Group;
use crate::message::{GroupRequest, InfoResponse, JoinRequest, MessageType, Packet};
use crate::session::{Session, bootstrap_cipher, short_id};

/// A router answer.
#[derive(Debug, Clone)]
pub struct Reply {
    /// HTTP status
    pub status: HttpStatus,
    /// Decrypted packet, when the router sent a body
    pub packet: Option<Packet>,
}

impl Reply {
    /// The packet of a `200` reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Status`] for any other status and
    /// [`Error::Protocol`] for an empty `200`.
    pub fn into_packet(self) -> Result<Packet> {
        if !self.status.is_ok() {
            return Err(Error::Status(self.status));
        }
        self.packet.ok_or(Error::protocol("empty reply"))
    }

    /// Decode the body of a `200` reply.
    ///
    /// # Errors
    ///
    /// See [`Reply::into_packet`] and [`Packet::body`].
    pub fn body<T: DeserializeOwned>(self) -> Result<T> {
        self.into_packet()?.body()
    }
}

/// Socket plus session for one router.
pub struct RouterLink {
    config: MachineConfig,
    socket: Option<HttpSocket>,
    session: Session,
    router_cipher: Box<dyn Cipher>,
    router_version: String,
}

impl RouterLink {
    /// Link configured by `config`; nothing is opened yet.
    #[must_use]
    pub fn new(config: MachineConfig) -> Self {
        let passphrase = config.security.passphrase();
        let session = passphrase.map_or_else(Session::new, Session::with_password);
        Self {
            router_cipher: bootstrap_cipher(passphrase),
            config,
            socket: None,
            session,
            router_version: String::new(),
        }
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Session state.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Version the router reported in the last handshake.
    #[must_use]
    pub fn router_version(&self) -> &str {
        &self.router_version
    }

    /// Whether a socket is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Open the socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unusable endpoint, or a transport
    /// error if the connection fails.
    pub async fn open(&mut self) -> Result<()> {
        self.config.validate_endpoint()?;
        let socket = HttpSocket::open(
            &self.config.address,
            self.config.port,
            self.config.socket_timeout(),
        )
        .await?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Close the socket without notifying the router.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
    }

    /// Close and fall back to the bootstrap cipher. The session id is kept
    /// so the next handshake migrates it.
    pub async fn reset(&mut self) {
        self.close().await;
        self.session.clear();
        self.router_version.clear();
    }

    async fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        if self.socket.is_none() {
            self.open().await?;
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(Error::transport("socket not open"));
        };
        socket.write_request(request).await?;
        socket.read_response().await
    }

    /// Send one request, reopening once when a kept-alive connection turns
    /// out to be closed.
    async fn exchange(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let reused = self.is_open();
        let response = match self.send(&request).await {
            Err(Error::Transport(_) | Error::Io(_)) if reused => {
                tracing::debug!("Reconnecting to {}:{}", self.config.address, self.config.port);
                self.close().await;
                self.send(&request).await
            }
            other => other,
        };

        match response {
            Ok(response) => {
                if !response.keep_alive {
                    self.close().await;
                }
                Ok(response)
            }
            Err(err) => {
                self.close().await;
                Err(err)
            }
        }
    }

    fn session_header(&self) -> Option<String> {
        Some(self.session.id().to_string()).filter(|id| !id.is_empty())
    }

    /// Run the handshake. `full` selects the configured prime size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Status`] when the router refuses, or a transport,
    /// protocol or crypto error.
    pub async fn handshake(&mut self, full: bool) -> Result<()> {
        let request = client_request(&mut self.session, &self.config.security, full)?;
        let body = Packet::new(MessageType::Handshake, &request)?.seal(self.router_cipher.as_ref())?;
        let response = self
            .exchange(HttpRequest::post(self.session_header(), body))
            .await?;
        if !response.status.is_ok() {
            self.session.dh_mut().clear();
            if response.status == HttpStatus::Unauthorized {
                // Router no longer knows our id.
                self.session.set_id(String::new());
            }
            return Err(Error::Status(response.status));
        }

        let packet = Packet::open(&response.body, self.router_cipher.as_ref())?;
        if packet.kind() != MessageType::Handshake {
            return Err(Error::protocol("unexpected handshake reply"));
        }
        let reply: HandshakeResponse = packet.body()?;
        self.router_version = client_response(&mut self.session, &self.config.security, &reply)?;
        tracing::info!(
            "Connected to {}:{} (router {}, session {})",
            self.config.address,
            self.config.port,
            self.router_version,
            short_id(self.session.id())
        );
        Ok(())
    }

    /// Send a packet under the session cipher.
    ///
    /// # Errors
    ///
    /// Returns transport errors, or [`Error::Protocol`] / [`Error::Crypto`]
    /// when the reply cannot be opened. A non-`200` status is returned in
    /// the [`Reply`].
    pub async fn request(&mut self, packet: &Packet) -> Result<Reply> {
        let body = packet.seal(self.session.cipher())?;
        let response = self
            .exchange(HttpRequest::post(self.session_header(), body))
            .await?;
        let packet = if response.status.is_ok() && !response.body.is_empty() {
            Some(Packet::open(&response.body, self.session.cipher())?)
        } else {
            None
        };
        Ok(Reply {
            status: response.status,
            packet,
        })
    }

    /// Register `group_id` with the router so it can tell which peers share
    /// a group key.
    ///
    /// # Errors
    ///
    /// See [`RouterLink::request`]; a refused id comes back as
    /// [`Error::Status`].
    pub async fn join_group(&mut self, group_id: &str) -> Result<()> {
        let request = GroupRequest {
            id: group_id.to_string(),
        };
        self.request(&Packet::new(MessageType::Group, &request)?)
            .await?
            .into_packet()?;
        Ok(())
    }

    /// Tell the router we are leaving and close. Errors are swallowed.
    pub async fn quit(&mut self) {
        if self.is_open() && !self.session.id().is_empty() {
            if let Err(err) = self.request(&Packet::empty(MessageType::Quit)).await {
                tracing::debug!("Quit not delivered: {}", err);
            }
        }
        self.close().await;
    }
}

impl std::fmt::Debug for RouterLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterLink")
            .field("address", &self.config.address)
            .field("port", &self.config.port)
            .field("session", &self.session)
            .field("open", &self.is_open())
            .finish()
    }
}

/// End-user connection: join, then ping until stopped.
#[derive(Debug)]
pub struct ClientMachine {
    core: Arc<MachineCore>,
    link: RouterLink,
    group: Option<Arc<Group>>,
    info: Option<InfoResponse>,
}

impl ClientMachine {
    /// Client for the router in `config`.
    #[must_use]
    pub fn new(config: MachineConfig) -> Self {
        let name = format!("client {}:{}", config.address, config.port);
        Self {
            core: Arc::new(MachineCore::new(name, config.clone())),
            link: RouterLink::new(config),
            group: None,
            info: None,
        }
    }

    /// Register `group` with the router after joining.
    #[must_use]
    pub fn with_group(mut self, group: Arc<Group>) -> Self {
        self.group = Some(group);
        self
    }

    /// Router link.
    #[must_use]
    pub fn link(&self) -> &RouterLink {
        &self.link
    }

    /// Last router status report.
    #[must_use]
    pub fn info(&self) -> Option<&InfoResponse> {
        self.info.as_ref()
    }
}

#[async_trait]
impl Role for ClientMachine {
    fn core(&self) -> &Arc<MachineCore> {
        &self.core
    }

    async fn on_handshake(&mut self) -> Result<Next> {
        self.link.handshake(true).await?;
        Ok(Next::now(State::Join))
    }

    async fn on_state(&mut self, state: State) -> Result<Next> {
        let interval = self.core.config().ping_interval();
        match state {
            State::Join => {
                let join = JoinRequest {
                    name: self.core.config().name.clone(),
                };
                self.link
                    .request(&Packet::new(MessageType::Join, &join)?)
                    .await?
                    .into_packet()?;
                Ok(Next::now(State::Group))
            }
            State::Group => {
                let id = self.group.as_ref().map(|group| group.id()).unwrap_or_default();
                if !id.is_empty() {
                    self.link.join_group(&id).await?;
                    tracing::info!("Registered group {}", short_id(&id));
                }
                Ok(Next::now(State::Info))
            }
            State::Info => {
                let info: InfoResponse = self
                    .link
                    .request(&Packet::empty(MessageType::Info))
                    .await?
                    .body()?;
                tracing::info!(
                    "Router {} has {} sessions and {} transfers",
                    info.version,
                    info.sessions,
                    info.transfers
                );
                self.info = Some(info);
                Ok(Next::after(State::Ping, interval))
            }
            State::Ping => {
                self.link
                    .request(&Packet::empty(MessageType::Ping))
                    .await?
                    .into_packet()?;
                Ok(Next::after(State::Ping, interval))
            }
            _ => Ok(Next::now(State::Idle)),
        }
    }

    async fn on_restart(&mut self) {
        self.link.reset().await;
    }

    async fn on_quit(&mut self) {
        self.link.quit().await;
        self.core.errors().info("Disconnected");
    }
}
