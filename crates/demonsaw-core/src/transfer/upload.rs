//! Upload worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use demonsaw_files::{Chunk, FileReader, shard_count, wait_backoff};

use crate::client::RouterLink;
use crate::config::{MachineConfig, TransferConfig};
use crate::error::{Error, Result};
use crate::http::HttpStatus;
use crate::machine::{MachineCore, Next, Role, State};
use crate::message::{ChunkInfo, MessageType, Packet, TransferRequest, TransferResponse, UploadRequest, UploadResponse};
use crate::status::Status;

use super::TransferJob;
use super::shard::{Poll, ShardSet, ShardStep, retry_or_fail};

/// Answer the relay: post the chunk it last asked for and learn the next one.
struct UploadStep {
    job: TransferJob,
    reader: Arc<FileReader>,
    wanted: Option<ChunkInfo>,
    empty: usize,
}

#[async_trait]
impl ShardStep for UploadStep {
    async fn step(&mut self, link: &mut RouterLink) -> Result<Poll> {
        let request = UploadRequest {
            id: self.job.id().to_string(),
            chunk: self.wanted,
        };
        let mut packet = Packet::new(MessageType::Upload, &request)?;
        if let Some(info) = self.wanted {
            let chunk = Chunk::from(info);
            if chunk.end() > self.reader.size() {
                return Err(Error::protocol("relay asked past the end of the file"));
            }
            let data = self.reader.read_chunk(chunk).await?;
            packet = packet.with_data(self.job.seal(data)?);
        }

        let response: UploadResponse = link.request(&packet).await?.body()?;
        if let Some(posted) = self.wanted.take() {
            let transfer = self.job.transfer();
            if transfer.chunks().ack_chunk(posted.offset) {
                transfer.update(posted.size);
            }
        }

        match response.chunk {
            Some(next) => {
                self.wanted = Some(next);
                self.empty = 0;
                Ok(Poll::Ready)
            }
            None => {
                self.empty += 1;
                let delay = response
                    .delay
                    .map_or_else(|| wait_backoff(self.empty), Duration::from_millis);
                Ok(Poll::Wait(delay))
            }
        }
    }
}

/// Sends one file through a relay slot
/// (`start -> handshake -> transfer -> upload -> quit`).
///
/// The relay decides which chunk goes next; the upload is done once the
/// router closes the slot after the downloader has every byte.
#[derive(Debug)]
pub struct UploadWorker {
    core: Arc<MachineCore>,
    link: RouterLink,
    job: TransferJob,
    settings: TransferConfig,
    reader: Option<Arc<FileReader>>,
    shards: ShardSet,
}

impl UploadWorker {
    /// Worker for `job` against the router in `config`.
    #[must_use]
    pub fn new(config: MachineConfig, settings: TransferConfig, job: TransferJob) -> Self {
        let name = format!("upload {}", job.file_name());
        Self {
            core: Arc::new(MachineCore::new(name, config.clone())),
            link: RouterLink::new(config),
            job,
            settings,
            reader: None,
            shards: ShardSet::default(),
        }
    }

    /// The job being uploaded.
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
        let reader = match &self.reader {
            Some(reader) => Arc::clone(reader),
            None => {
                let reader = Arc::new(FileReader::open(self.job.path()).await?);
                if reader.size() != transfer.file_size() {
                    self.core
                        .errors()
                        .error(format!("\"{}\" changed size", self.job.file_name()));
                    return Ok(self.finish(Status::Error));
                }
                self.reader = Some(Arc::clone(&reader));
                reader
            }
        };

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
        tracing::debug!("Uploading \"{}\" via slot {}", self.job.file_name(), response.id);

        transfer.resume();
        self.job.set_status(Status::Pending);
        if transfer.file_size() == 0 {
            return Ok(self.finish(Status::Success));
        }

        let count = shard_count(
            self.settings.upload_threads(),
            transfer.file_size(),
            self.settings.thread_size,
            self.link.router_version(),
        );
        for _ in 0..count {
            let step = UploadStep {
                job: self.job.clone(),
                reader: Arc::clone(&reader),
                wanted: None,
                empty: 0,
            };
            self.shards.spawn(&self.core, &self.job, step);
        }
        Ok(Next::now(State::Upload))
    }

    fn monitor(&mut self) -> Next {
        let transfer = self.job.transfer();
        let running = self.shards.reap();

        if let Some(err) = self.shards.take_failure() {
            self.core
                .errors()
                .error(format!("\"{}\": {}", self.job.file_name(), err));
            return self.finish(Status::Error);
        }
        if running == 0 {
            if transfer.complete() {
                self.core.errors().info(format!(
                    "Uploaded \"{}\" in {}",
                    self.job.file_name(),
                    transfer.time()
                ));
                return self.finish(Status::Success);
            }
            return Next::now(State::Cancel);
        }
        if transfer.idle() > self.settings.stall_timeout() {
            return Next::now(State::Cancel);
        }
        Next::after(State::Upload, self.core.config().idle_timeout())
    }
}

#[async_trait]
impl Role for UploadWorker {
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
            State::Upload => Ok(self.monitor()),
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
