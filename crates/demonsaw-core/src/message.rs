//! Packet envelope and message bodies.
//!
//! A packet is serialized to JSON, encrypted with the session cipher (or the
//! router cipher for handshakes) and base64-encoded into the HTTP body.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use demonsaw_crypto::Cipher;
use demonsaw_crypto::cipher::{TAG_SIZE, XCHACHA_NONCE_SIZE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};

/// Framing version carried in every packet header.
pub const PACKET_VERSION: u32 = 1;

/// Room left for the JSON header and message body around the data.
pub const PACKET_OVERHEAD: usize = 64 * 1024;

const fn base64_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}

/// Upper bound of a sealed HTTP body carrying `data_len` bytes of data.
///
/// The data is base64 inside the JSON, the JSON is encrypted, and the
/// ciphertext is base64 again.
#[must_use]
pub const fn sealed_size(data_len: usize) -> usize {
    base64_len(base64_len(data_len) + PACKET_OVERHEAD + XCHACHA_NONCE_SIZE + TAG_SIZE)
}

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Key agreement
    Handshake,
    /// Register a client name
    Join,
    /// Keep-alive
    Ping,
    /// Router status
    Info,
    /// File search
    Search,
    /// Share browsing
    Browse,
    /// Group membership
    Group,
    /// Register a relay slot
    Transfer,
    /// Fetch a chunk from a relay slot
    Download,
    /// Post a chunk to a relay slot
    Upload,
    /// Chat message
    Chat,
    /// Leave
    Quit,
    /// Hand the socket to a tunnel
    Tunnel,
    /// Anything this build does not know
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Lowercase wire name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Join => "join",
            Self::Ping => "ping",
            Self::Info => "info",
            Self::Search => "search",
            Self::Browse => "browse",
            Self::Group => "group",
            Self::Transfer => "transfer",
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Chat => "chat",
            Self::Quit => "quit",
            Self::Tunnel => "tunnel",
            Self::Unknown => "unknown",
        }
    }
}

/// Packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Framing version
    pub version: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            version: PACKET_VERSION,
        }
    }
}

/// Typed message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Type tag
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Type-specific body
    #[serde(default)]
    pub body: Value,
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Header
    pub header: Header,
    /// Message
    pub message: Message,
    /// Binary payload
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "serialize_data",
        deserialize_with = "deserialize_data"
    )]
    pub data: Vec<u8>,
}

fn serialize_data<T: AsRef<[u8]>, S: Serializer>(
    data: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data.as_ref()))
}

fn deserialize_data<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

impl Packet {
    /// Build a packet with a serializable body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `body` cannot be serialized.
    pub fn new<T: Serialize>(kind: MessageType, body: &T) -> Result<Self> {
        Ok(Self {
            header: Header::default(),
            message: Message {
                kind,
                body: serde_json::to_value(body)?,
            },
            data: Vec::new(),
        })
    }

    /// Build a packet with no body.
    #[must_use]
    pub fn empty(kind: MessageType) -> Self {
        Self {
            header: Header::default(),
            message: Message {
                kind,
                body: Value::Null,
            },
            data: Vec::new(),
        }
    }

    /// Attach a binary payload.
    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Message type.
    #[must_use]
    pub fn kind(&self) -> MessageType {
        self.message.kind
    }

    /// Decode the body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the body does not match `T`.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.message.body.clone())?)
    }

    /// Serialize, encrypt and base64-encode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if encryption fails.
    pub fn seal(&self, cipher: &dyn Cipher) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        let sealed = cipher.encrypt(&json)?;
        Ok(STANDARD.encode(sealed))
    }

    /// Decode, decrypt and parse an HTTP body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for bad base64, JSON or an unsupported
    /// header, and [`Error::Crypto`] when decryption fails.
    pub fn open(body: &str, cipher: &dyn Cipher) -> Result<Self> {
        let sealed = STANDARD.decode(body.trim())?;
        let json = cipher.decrypt(&sealed)?;
        let packet: Packet = serde_json::from_slice(&json)?;
        if packet.header.version == 0 || packet.header.version > PACKET_VERSION {
            return Err(Error::protocol("unsupported packet version"));
        }
        Ok(packet)
    }
}

// ============ Message Bodies ============

/// A byte range of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Offset in the file
    pub offset: u64,
    /// Length in bytes
    pub size: u64,
}

impl From<demonsaw_files::Chunk> for ChunkInfo {
    fn from(chunk: demonsaw_files::Chunk) -> Self {
        Self {
            offset: chunk.offset,
            size: chunk.size,
        }
    }
}

impl From<ChunkInfo> for demonsaw_files::Chunk {
    fn from(info: ChunkInfo) -> Self {
        Self {
            offset: info.offset,
            size: info.size,
        }
    }
}

/// `join` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Display name
    #[serde(default)]
    pub name: String,
}

/// `group` request. An empty id leaves any group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRequest {
    /// Hex group id
    #[serde(default)]
    pub id: String,
}

/// `info` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    /// Router version
    pub version: String,
    /// Registered sessions
    pub sessions: usize,
    /// Open relay slots
    pub transfers: usize,
}

/// `transfer` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Slot id; the router picks one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// File size
    pub file_size: u64,
}

/// `transfer` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResponse {
    /// Slot id
    pub id: String,
}

/// `download` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Slot id
    pub id: String,
    /// Wanted offset
    pub offset: u64,
    /// Wanted length
    pub size: u64,
}

/// `download` response. Chunk bytes travel in the packet data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResponse {
    /// The chunk carried in the data payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
    /// Milliseconds to wait before asking again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

/// `upload` request. A posted chunk travels in the packet data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Slot id
    pub id: String,
    /// The chunk carried in the data payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
}

/// `upload` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Next chunk the router wants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
    /// Milliseconds to wait before asking again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}
