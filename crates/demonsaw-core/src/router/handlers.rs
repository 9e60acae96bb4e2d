//! Per-message router handlers.

use std::sync::Arc;

use crate::VERSION;
use crate::error::{Error, Result};
use crate::handshake::{self, HandshakeRequest, MAX_NAME_SIZE};
use crate::http::HttpStatus;
use crate::message::{
    DownloadRequest, GroupRequest, InfoResponse, JoinRequest, MessageType, Packet,
    TransferRequest, TransferResponse, UploadRequest,
};
use crate::registry::Peer;
use crate::session::short_id;

use super::Shared;

/// What the connection loop does after a handler ran.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Seal and send a packet, keep reading
    Reply(Packet),
    /// Send a bare status, keep reading
    Status(HttpStatus),
    /// Seal and send a packet, then end the loop
    Last(Packet),
    /// Send a bare status, then end the loop
    Close(HttpStatus),
    /// Park the socket as a tunnel
    Tunnel,
}

/// Dispatch `packet` from `peer`.
pub(crate) fn dispatch(shared: &Shared, peer: &Arc<Peer>, packet: Packet) -> Outcome {
    let kind = packet.kind();
    let result = match kind {
        MessageType::Handshake => on_handshake(shared, peer, &packet),
        MessageType::Ping => on_ping(peer),
        MessageType::Info => on_info(shared),
        MessageType::Join => on_join(peer, &packet),
        MessageType::Group => on_group(peer, &packet),
        MessageType::Quit => return on_quit(shared, peer),
        MessageType::Tunnel => return Outcome::Tunnel,
        MessageType::Transfer => on_transfer(shared, &packet),
        MessageType::Download => on_download(shared, &packet),
        MessageType::Upload => on_upload(shared, packet),
        MessageType::Search | MessageType::Browse | MessageType::Chat => {
            Err(Error::Status(HttpStatus::NotImplemented))
        }
        MessageType::Unknown => return Outcome::Close(HttpStatus::NotFound),
    };

    match result {
        Ok(reply) => Outcome::Reply(reply),
        Err(err) => {
            let status = err.status();
            if matches!(err, Error::Status(_)) {
                tracing::debug!("{} from {}: {}", kind.name(), short_id(&peer.id()), status);
            } else {
                tracing::warn!("{} from {} failed: {}", kind.name(), short_id(&peer.id()), err);
            }
            Outcome::Status(status)
        }
    }
}

fn on_handshake(shared: &Shared, peer: &Arc<Peer>, packet: &Packet) -> Result<Packet> {
    let request: HandshakeRequest = packet.body()?;
    let old = peer.id();
    let response = handshake::respond(&shared.registry, peer, &request)?;
    // A migrated session takes nothing parked under its old id along.
    if !old.is_empty() && old != peer.id() && shared.tunnels.remove(&old) {
        tracing::debug!("Tunnel of {} dropped on migration", short_id(&old));
    }
    Packet::new(MessageType::Handshake, &response)
}

fn on_ping(peer: &Peer) -> Result<Packet> {
    peer.touch();
    Ok(Packet::empty(MessageType::Ping))
}

fn on_info(shared: &Shared) -> Result<Packet> {
    let info = InfoResponse {
        version: VERSION.to_string(),
        sessions: shared.registry.len(),
        transfers: shared.relay.len(),
    };
    Packet::new(MessageType::Info, &info)
}

fn on_join(peer: &Peer, packet: &Packet) -> Result<Packet> {
    let request: JoinRequest = packet.body()?;
    if request.name.len() > MAX_NAME_SIZE {
        return Err(Error::protocol("name too long"));
    }
    peer.session().set_name(request.name.clone());
    tracing::info!("{} joined as \"{}\"", short_id(&peer.id()), request.name);
    Ok(Packet::empty(MessageType::Join))
}

/// Longest accepted group id: a hex SHA-512 digest.
const MAX_GROUP_ID_SIZE: usize = 128;

fn on_group(peer: &Peer, packet: &Packet) -> Result<Packet> {
    let request: GroupRequest = packet.body()?;
    if request.id.len() > MAX_GROUP_ID_SIZE || !request.id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Status(HttpStatus::BadRequest));
    }
    tracing::debug!("{} group {}", short_id(&peer.id()), short_id(&request.id));
    peer.set_group(request.id);
    Ok(Packet::empty(MessageType::Group))
}

fn on_quit(shared: &Shared, peer: &Peer) -> Outcome {
    let id = peer.id();
    shared.registry.remove(&id);
    shared.tunnels.remove(&id);
    tracing::info!("{} quit", short_id(&id));
    Outcome::Last(Packet::empty(MessageType::Quit))
}

fn on_transfer(shared: &Shared, packet: &Packet) -> Result<Packet> {
    let request: TransferRequest = packet.body()?;
    let id = shared.relay.create(&request)?;
    Packet::new(MessageType::Transfer, &TransferResponse { id })
}

fn on_download(shared: &Shared, packet: &Packet) -> Result<Packet> {
    let request: DownloadRequest = packet.body()?;
    let (response, data) = shared.relay.download(&request)?;
    Ok(Packet::new(MessageType::Download, &response)?.with_data(data))
}

fn on_upload(shared: &Shared, packet: Packet) -> Result<Packet> {
    let request: UploadRequest = packet.body()?;
    let response = shared.relay.upload(&request, packet.data)?;
    Packet::new(MessageType::Upload, &response)
}
