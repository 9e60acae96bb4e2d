//! Router chunk relay.
//!
//! Uploader and downloader never talk directly. Each transfer gets a slot:
//!
//! ```text
//! downloader ── download {offset} ──► requested ── upload poll ──► in-flight
//!                                                                    │
//! downloader ◄── chunk data ◄── buffered ◄── upload {chunk, data} ◄──┘
//! ```
//!
//! A slot is removed once every byte of the file has been delivered.
//! In-flight requests that the uploader never answers are handed out again
//! after the upload timeout.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use demonsaw_crypto::random::random_id;
use demonsaw_files::MAX_CHUNK_SIZE;

use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventAction, EventBus, EventKind};
use crate::http::HttpStatus;
use crate::message::{
    ChunkInfo, DownloadRequest, DownloadResponse, TransferRequest, UploadRequest, UploadResponse,
};
use crate::session::short_id;

#[derive(Debug)]
struct Slot {
    file_size: u64,
    requested: VecDeque<ChunkInfo>,
    inflight: HashMap<u64, (ChunkInfo, Instant)>,
    buffered: BTreeMap<u64, (ChunkInfo, Vec<u8>)>,
    delivered: HashSet<u64>,
    delivered_bytes: u64,
    touched: Instant,
}

impl Slot {
    fn new(file_size: u64) -> Self {
        Self {
            file_size,
            requested: VecDeque::new(),
            inflight: HashMap::new(),
            buffered: BTreeMap::new(),
            delivered: HashSet::new(),
            delivered_bytes: 0,
            touched: Instant::now(),
        }
    }

    fn is_pending(&self, offset: u64) -> bool {
        self.inflight.contains_key(&offset)
            || self.buffered.contains_key(&offset)
            || self.requested.iter().any(|chunk| chunk.offset == offset)
    }

    fn expire(&mut self, limit: Duration) {
        let expired: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, (_, since))| since.elapsed() >= limit)
            .map(|(offset, _)| *offset)
            .collect();
        for offset in expired {
            if let Some((chunk, _)) = self.inflight.remove(&offset) {
                self.requested.push_front(chunk);
            }
        }
    }

    fn complete(&self) -> bool {
        self.delivered_bytes >= self.file_size
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Relay slots keyed by transfer id.
#[derive(Debug)]
pub struct ChunkRelay {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    open: AtomicUsize,
    max_transfers: usize,
    chunk_buffer: usize,
    upload_timeout: Duration,
    delay: u64,
    events: EventBus,
}

impl ChunkRelay {
    /// Relay sized by `config`.
    #[must_use]
    pub fn new(config: &RouterConfig, events: EventBus) -> Self {
        Self {
            slots: DashMap::new(),
            open: AtomicUsize::new(0),
            max_transfers: config.max_transfers.max(1),
            chunk_buffer: config.chunk_buffer.max(1),
            upload_timeout: config.upload_timeout(),
            delay: config.relay_delay_ms,
            events,
        }
    }

    /// Open slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether slot `id` exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    fn slot(&self, id: &str) -> Result<Arc<Mutex<Slot>>> {
        self.slots
            .get(id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(Error::Status(HttpStatus::NotFound))
    }

    fn remove(&self, id: &str) {
        if self.slots.remove(id).is_some() {
            self.open.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!("Relay slot {} closed", short_id(id));
            self.events
                .publish(&Event::new(EventKind::Transfer, EventAction::Removed, id));
        }
    }

    /// Open (or join) a slot. Uploader and downloader both register the same
    /// id; the first one creates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Status`] with service unavailable when every slot is
    /// taken and bad request when an existing slot has another file size.
    pub fn create(&self, request: &TransferRequest) -> Result<String> {
        if let Some(id) = &request.id {
            if id.is_empty() || id.len() > 64 {
                return Err(Error::protocol("invalid transfer id"));
            }
        }

        let id = loop {
            let candidate = match &request.id {
                Some(id) => id.clone(),
                None => random_id()?,
            };
            match self.slots.entry(candidate.clone()) {
                Entry::Occupied(entry) if request.id.is_some() => {
                    return if lock(entry.get()).file_size == request.file_size {
                        Ok(candidate)
                    } else {
                        Err(Error::Status(HttpStatus::BadRequest))
                    };
                }
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    // Capacity is reserved before the insert.
                    let reserved = self
                        .open
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                            (open < self.max_transfers).then_some(open + 1)
                        });
                    if reserved.is_err() {
                        return Err(Error::Status(HttpStatus::ServiceUnavailable));
                    }
                    entry.insert(Arc::new(Mutex::new(Slot::new(request.file_size))));
                    break candidate;
                }
            }
        };

        tracing::debug!("Relay slot {} opened ({} bytes)", short_id(&id), request.file_size);
        self.events
            .publish(&Event::new(EventKind::Transfer, EventAction::Added, id.clone()));
        Ok(id)
    }

    /// Serve a downloader. Returns the chunk bytes when buffered, otherwise
    /// queues the request and suggests a delay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Status`] with not found for an unknown slot and bad
    /// request for a chunk larger than [`MAX_CHUNK_SIZE`].
    pub fn download(&self, request: &DownloadRequest) -> Result<(DownloadResponse, Vec<u8>)> {
        if request.size > MAX_CHUNK_SIZE {
            return Err(Error::Status(HttpStatus::BadRequest));
        }
        let slot = self.slot(&request.id)?;
        let mut state = lock(&slot);
        state.touched = Instant::now();

        if let Some((chunk, data)) = state.buffered.remove(&request.offset) {
            if state.delivered.insert(chunk.offset) {
                state.delivered_bytes += chunk.size;
            }
            let complete = state.complete();
            drop(state);
            if complete {
                self.remove(&request.id);
            }
            let response = DownloadResponse {
                chunk: Some(chunk),
                delay: None,
            };
            return Ok((response, data));
        }

        if request.size > 0 && request.offset < state.file_size && !state.is_pending(request.offset) {
            let size = request.size.min(state.file_size - request.offset);
            state.requested.push_back(ChunkInfo {
                offset: request.offset,
                size,
            });
        }
        Ok((
            DownloadResponse {
                chunk: None,
                delay: Some(self.delay),
            },
            Vec::new(),
        ))
    }

    /// Serve an uploader: store the posted chunk (if it was asked for and
    /// there is room) and hand out the next wanted chunk. Payloads are
    /// opaque; they may be wrapped by a group cipher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Status`] with not found for an unknown (or finished)
    /// slot.
    pub fn upload(&self, request: &UploadRequest, data: Vec<u8>) -> Result<UploadResponse> {
        let slot = self.slot(&request.id)?;
        let mut state = lock(&slot);
        state.touched = Instant::now();

        if let Some(chunk) = request.chunk {
            if let Some((wanted, _)) = state.inflight.remove(&chunk.offset) {
                if !data.is_empty() && state.buffered.len() < self.chunk_buffer {
                    state.buffered.insert(chunk.offset, (wanted, data));
                } else {
                    state.requested.push_front(wanted);
                }
            }
        }

        state.expire(self.upload_timeout);
        if state.buffered.len() + state.inflight.len() < self.chunk_buffer {
            if let Some(chunk) = state.requested.pop_front() {
                state.inflight.insert(chunk.offset, (chunk, Instant::now()));
                return Ok(UploadResponse {
                    chunk: Some(chunk),
                    delay: None,
                });
            }
        }
        Ok(UploadResponse {
            chunk: None,
            delay: Some(self.delay),
        })
    }

    /// Drop slots untouched for longer than `limit`.
    pub fn prune(&self, limit: Duration) -> usize {
        let stale: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| lock(entry.value()).touched.elapsed() > limit)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            self.remove(id);
        }
        stale.len()
    }
}
