//! Transfer scheduler.
//!
//! Jobs wait in the pending list until the idle pass promotes them within
//! the download/upload limits (small or listed-extension uploads first).
//! Each promoted job runs as its own worker machine. A worker that quits
//! with its job still queued (a retryable cancel) sends the job back to the
//! pending list to compete for a slot again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use demonsaw_files::{Limits, PriorityPolicy, TransferQueue};
use tokio::task::JoinSet;

use crate::config::{MachineConfig, TransferConfig};
use crate::machine::{MachineCore, MachineHandle};
use crate::status::Status;

use super::{Direction, DownloadWorker, TransferJob, UploadWorker};

/// Queue plus the worker machines of the active jobs.
#[derive(Debug)]
pub struct TransferManager {
    machine: MachineConfig,
    settings: TransferConfig,
    queue: TransferQueue<TransferJob>,
    policy: PriorityPolicy,
    running: Mutex<HashMap<(String, Direction), Arc<MachineCore>>>,
    stopping: AtomicBool,
}

impl TransferManager {
    /// Manager for transfers through the router in `machine`.
    #[must_use]
    pub fn new(machine: MachineConfig, settings: TransferConfig) -> Self {
        let policy = PriorityPolicy::new(settings.priority_size, &settings.priority_extensions);
        Self {
            machine,
            settings,
            queue: TransferQueue::new(),
            policy,
            running: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<(String, Direction), Arc<MachineCore>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a job.
    pub fn push(&self, job: TransferJob) {
        job.set_status(Status::Queued);
        self.queue.push(job);
    }

    /// Pending, active and finished lists.
    #[must_use]
    pub fn queue(&self) -> &TransferQueue<TransferJob> {
        &self.queue
    }

    /// Cancel job `id`, wherever it is. Both directions of a slot are
    /// cancelled when this node runs both.
    pub fn cancel(&self, id: &str) -> bool {
        let mut stopped = false;
        for ((running, _), core) in self.running().iter() {
            if running == id {
                core.stop();
                stopped = true;
            }
        }
        if stopped {
            return true;
        }
        let mut removed = false;
        for upload in [false, true] {
            if let Some(job) = self.queue.remove(id, upload) {
                job.set_status(Status::Cancelled);
                removed = true;
            }
        }
        removed
    }

    /// Stop every worker and leave [`TransferManager::run`].
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        for core in self.running().values() {
            core.stop();
        }
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn limits(&self) -> Limits {
        Limits {
            downloads: self.settings.max_downloads(),
            uploads: self.settings.max_uploads(),
        }
    }

    fn launch(&self, job: TransferJob, workers: &mut JoinSet<TransferJob>) {
        let machine = self.machine.clone();
        let settings = self.settings.clone();
        let key = (job.id().to_string(), job.direction());
        let handle = match job.direction() {
            Direction::Download => MachineHandle::spawn(DownloadWorker::new(machine, settings, job.clone())),
            Direction::Upload => MachineHandle::spawn(UploadWorker::new(machine, settings, job.clone())),
        };
        self.running().insert(key, Arc::clone(handle.core()));
        workers.spawn(async move {
            handle.join().await;
            job
        });
    }

    /// File a job whose worker has finished: back to pending when it is
    /// still queued for a retry, otherwise to the finished list.
    fn settle(&self, job: &TransferJob) {
        let upload = job.direction() == Direction::Upload;
        let cancelled = self
            .running()
            .remove(&(job.id().to_string(), job.direction()))
            .is_some_and(|core| core.stopping());

        if job.status() == Status::Queued {
            if !cancelled && !self.stopping() {
                tracing::info!(
                    "Requeued \"{}\" (retry {})",
                    job.file_name(),
                    job.transfer().retries()
                );
                self.queue.requeue(job.id(), upload);
                return;
            }
            job.set_status(Status::Cancelled);
        }
        self.queue.finish(job.id(), upload);
    }

    /// Run the idle scheduling pass until nothing is pending or active, or
    /// until [`TransferManager::stop`].
    pub async fn run(&self) {
        let mut workers = JoinSet::new();
        let idle = self.machine.idle_timeout();

        loop {
            if !self.stopping() {
                for job in self.queue.promote(self.limits(), &self.policy) {
                    tracing::info!("Starting \"{}\"", job.file_name());
                    self.launch(job, &mut workers);
                }
            }

            while let Some(joined) = workers.try_join_next() {
                match joined {
                    Ok(job) => self.settle(&job),
                    Err(err) => tracing::error!("Transfer task failed: {}", err),
                }
            }

            if workers.is_empty() && (self.stopping() || self.queue.pending().is_empty()) {
                break;
            }
            if self.stopping() {
                // Late promotions may have missed the first sweep.
                for core in self.running().values() {
                    core.stop();
                }
            }
            tokio::time::sleep(idle).await;
        }
    }
}
