//! Download worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use demonsaw_files::{Chunk, FileWriter, shard_count, wait_backoff};

use crate::client::RouterLink;
use crate::config::{MachineConfig, TransferConfig};
use crate::error::{Error, Result};
use crate::http::HttpStatus;
use crate::machine::{MachineCore, Next, Role, State};
use crate::message::{DownloadRequest, DownloadResponse, MessageType, Packet, TransferRequest, TransferResponse};
use crate::status::Status;

use super::TransferJob;
use super::shard::{Poll, ShardSet, ShardStep, retry_or_fail};

/// Claim chunks and pull them from the relay, one at a time.
struct DownloadStep {
    job: TransferJob,
    writer: Arc<FileWriter>,
    chunk_size: u64,
    current: Option<Chunk>,
    empty: usize,
}

impl DownloadStep {
    fn claim(&mut self) -> Option<Chunk> {
        if self.current.is_none() {
            let transfer = self.job.transfer();
            self.current = transfer.claim_next(self.chunk_size);
            if let Some(chunk) = self.current {
                transfer.add_request(chunk.offset);
            }
        }
        self.current
    }
}

#[async_trait]
impl ShardStep for DownloadStep {
    async fn step(&mut self, link: &mut RouterLink) -> Result<Poll> {
        let Some(chunk) = self.claim() else {
            if self.job.transfer().complete() {
                return Ok(Poll::Finished);
            }
            // Remaining chunks belong to other shards.
            self.empty += 1;
            return Ok(Poll::Wait(wait_backoff(self.empty)));
        };

        let request = DownloadRequest {
            id: self.job.id().to_string(),
            offset: chunk.offset,
            size: chunk.size,
        };
        let packet = link
            .request(&Packet::new(MessageType::Download, &request)?)
            .await?
            .into_packet()?;
        let response: DownloadResponse = packet.body()?;

        let Some(info) = response.chunk else {
            self.empty += 1;
            let delay = response
                .delay
                .map_or_else(|| wait_backoff(self.empty), Duration::from_millis);
            return Ok(Poll::Wait(delay));
        };
        if info.offset != chunk.offset || info.size != chunk.size {
            return Err(Error::protocol("relay returned another chunk"));
        }

        let data = self.job.unseal(packet.data)?;
        self.writer.write_chunk(chunk, &data).await?;

        let transfer = self.job.transfer();
        transfer.remove_request(chunk.offset);
        if transfer.chunks().ack_chunk(chunk.offset) {
            transfer.update(chunk.size);
        }
        self.current = None;
        self.empty = 0;
        Ok(Poll::Ready)
    }

    fn abandon(&mut self) {
        if let Some(chunk) = self.current.take() {
            let transfer = self.job.transfer();
            transfer.remove_request(chunk.offset);
            transfer.chunks().release(chunk.offset);
        }
    }
}

/// Receives one file through a relay slot
/// (`start -> handshake -> transfer -> download -> quit`).
#[derive(Debug)]
pub struct DownloadWorker {
    core: Arc<MachineCore>,
    link: RouterLink,
    job: TransferJob,
    settings: TransferConfig,
    writer: Option<Arc<FileWriter>>,
    shards: ShardSet,
}

impl DownloadWorker {
    /// Worker for `job` against the router in `config`.
    #[must_use]
    pub fn new(config: MachineConfig, settings: TransferConfig, job: TransferJob) -> Self {
        let name = format!("download {}", job.file_name());
        Self {
            core: Arc::new(MachineCore::new(name, config.clone())),
            link: RouterLink::new(config),
            job,
            settings,
            writer: None,
            shards: ShardSet::default(),
        }
    }

    /// The job being downloaded.
    #[must_use]
    pub fn job(&self) -> &TransferJob {
        &self.job
    }

    fn finish(&self, status: Status) -> Next {
        self.core.set_status(status);
        self.job.set_status(status);
        Next::now(State::Quit)
    }

    async fn open_slot(&mut self) -> Result<Next> {
        let transfer = self.job.transfer();
        let request = TransferRequest {
            id: Some(self.job.id().to_string()),
            file_size: transfer.file_size(),
        };
        let reply = self
            .link
            .request(&Packet::new(MessageType::Transfer, &request)?)
            .await?;
        let response: TransferResponse = match reply.body() {
            Err(Error::Status(status @ (HttpStatus::BadRequest | HttpStatus::NotImplemented))) => {
                self.core
                    .errors()
                    .error(format!("\"{}\" refused by router: {}", self.job.file_name(), status));
                return Ok(self.finish(Status::Error));
            }
            other => other?,
        };
        tracing::debug!("Downloading \"{}\" via slot {}", self.job.file_name(), response.id);

        let writer = match &self.writer {
            Some(writer) => Arc::clone(writer),
            None => {
                let writer = Arc::new(FileWriter::create(self.job.path(), transfer.file_size()).await?);
                self.writer = Some(Arc::clone(&writer));
                writer
            }
        };

        transfer.resume();
        self.job.set_status(Status::Pending);
        if transfer.complete() {
            return Ok(self.finish(Status::Success));
        }

        let count = shard_count(
            self.settings.download_threads(),
            transfer.file_size(),
            self.settings.thread_size,
            self.link.router_version(),
        );
        for _ in 0..count {
            let step = DownloadStep {
                job: self.job.clone(),
                writer: Arc::clone(&writer),
                chunk_size: self.settings.chunk_size(),
                current: None,
                empty: 0,
            };
            self.shards.spawn(&self.core, &self.job, step);
        }
        Ok(Next::now(State::Download))
    }

    async fn monitor(&mut self) -> Result<Next> {
        let transfer = self.job.transfer();
        let running = self.shards.reap();

        if transfer.complete() {
            if let Some(writer) = &self.writer {
                writer.sync().await?;
            }
            self.core.errors().info(format!(
                "Downloaded \"{}\" in {}",
                self.job.file_name(),
                transfer.time()
            ));
            return Ok(self.finish(Status::Success));
        }
        if let Some(err) = self.shards.take_failure() {
            self.core
                .errors()
                .error(format!("\"{}\": {}", self.job.file_name(), err));
            return Ok(self.finish(Status::Error));
        }
        if running == 0 || transfer.idle() > self.settings.stall_timeout() {
            return Ok(Next::now(State::Cancel));
        }
        Ok(Next::after(State::Download, self.core.config().idle_timeout()))
    }
}

#[async_trait]
impl Role for DownloadWorker {
    fn core(&self) -> &Arc<MachineCore> {
        &self.core
    }

    async fn on_handshake(&mut self) -> Result<Next> {
        self.link.handshake(true).await?;
        Ok(Next::now(State::Transfer))
    }

    async fn on_state(&mut self, state: State) -> Result<Next> {
        match state {
            State::Transfer => self.open_slot().await,
            State::Download => self.monitor().await,
            _ => Ok(Next::now(State::Idle)),
        }
    }

    async fn on_restart(&mut self) {
        // Aborted shards never release their claims.
        self.shards.abort().await;
        self.job.transfer().stop();
        self.link.reset().await;
    }

    async fn on_cancel(&mut self) -> Next {
        self.shards.abort().await;
        retry_or_fail(&self.core, &self.job, self.settings.max_retries())
    }

    async fn on_quit(&mut self) {
        self.shards.abort().await;
        self.job.transfer().stop();
        if self.core.stopping() && !matches!(self.job.status(), Status::Success | Status::Error) {
            self.core.set_status(Status::Cancelled);
            self.job.set_status(Status::Cancelled);
        }
        self.link.quit().await;
    }
}
