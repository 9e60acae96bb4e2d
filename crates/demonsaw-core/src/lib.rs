//! # Demonsaw Core
//!
//! Protocol and runtime for Demonsaw rendezvous file sharing.
//!
//! This crate provides:
//! - Encrypted HTTP packet transport (sealed JSON over `POST`)
//! - Diffie-Hellman session handshake with id migration
//! - Connection state machines for clients, probes and transfer workers
//! - The router: session registry, message dispatch and chunk relay
//! - Group entropy keys that wrap chunk payloads end to end
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   handshake / join / ping    ┌──────────────────────┐
//! │ ClientMachine│ ───────────────────────────► │        Router        │
//! └──────────────┘                              │  SessionRegistry     │
//! ┌──────────────┐   transfer / upload          │  ChunkRelay          │
//! │ UploadWorker │ ───────────────────────────► │  TunnelMap           │
//! └──────────────┘                              │                      │
//! ┌──────────────┐   transfer / download        │                      │
//! │DownloadWorker│ ◄──────────────────────────► │                      │
//! └──────────────┘                              └──────────────────────┘
//! ```
//!
//! Every request body is a [`Packet`] sealed with the session cipher, or
//! with the router's bootstrap cipher while the handshake is in flight.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod group;
pub mod handshake;
pub mod http;
pub mod machine;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod status;
pub mod transfer;

pub use client::{ClientMachine, Reply, RouterLink};
pub use config::{GroupConfig, MachineConfig, RouterConfig, SecurityConfig, TransferConfig};
pub use error::{Error, Result};
pub use event::{Event, EventAction, EventBus, EventKind};
pub use group::{EntropySource, Group};
pub use http::{HttpSocket, HttpStatus};
pub use machine::{MachineCore, MachineHandle, Next, Role, State};
pub use message::{MessageType, Packet};
pub use registry::{Peer, SessionRegistry};
pub use router::{ChunkRelay, Router, RouterHandle};
pub use server::ServerMachine;
pub use session::Session;
pub use status::{ErrorLog, Status};
pub use transfer::{Direction, DownloadWorker, TransferJob, TransferManager, UploadWorker};

/// Version reported in handshakes and `info` replies
pub const VERSION: &str = "2.7.2";
