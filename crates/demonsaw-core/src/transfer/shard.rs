//! Shard driver shared by download and upload workers.
//!
//! Every shard owns its own router connection. It runs its step until the
//! transfer completes, the relay slot disappears, or the worker aborts it.
//! Failures are sorted by what retrying could achieve:
//!
//! | reply                                      | action                  |
//! |--------------------------------------------|-------------------------|
//! | not found                                  | done                    |
//! | not implemented                            | error, quit             |
//! | bad request, service unavailable, timeout  | warning, sleep(error)   |
//! | anything else                              | error, reconnect        |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use demonsaw_files::should_retry;
use tokio::task::JoinSet;

use crate::client::RouterLink;
use crate::config::MachineConfig;
use crate::error::{Error, Result};
use crate::http::HttpStatus;
use crate::machine::{MachineCore, Next, State};
use crate::status::Status;

use super::TransferJob;

/// Result of one shard step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Poll {
    /// Go again immediately
    Ready,
    /// Sleep before the next step
    Wait(Duration),
    /// Nothing left to do
    Finished,
}

/// One request/response round of a shard.
#[async_trait]
pub(crate) trait ShardStep: Send {
    async fn step(&mut self, link: &mut RouterLink) -> Result<Poll>;

    /// Give back any chunk claimed but not finished.
    fn abandon(&mut self) {}
}

enum Action {
    Done,
    Quit,
    Backoff,
    Reconnect,
}

fn action(err: &Error) -> Action {
    match err {
        Error::Status(HttpStatus::NotFound) => Action::Done,
        Error::Status(HttpStatus::NotImplemented) => Action::Quit,
        Error::Status(HttpStatus::BadRequest | HttpStatus::ServiceUnavailable) | Error::Timeout(_) => {
            Action::Backoff
        }
        _ => Action::Reconnect,
    }
}

/// Run `step` until it finishes. Returns the error that made the shard quit.
pub(crate) async fn drive<S: ShardStep>(
    core: Arc<MachineCore>,
    job: TransferJob,
    config: MachineConfig,
    mut step: S,
) -> Result<()> {
    let transfer = job.transfer();
    let error_delay = config.error_timeout();
    let mut link = RouterLink::new(config);
    let mut connected = false;
    transfer.add_shard();

    let result = loop {
        if transfer.stopped() {
            break Ok(());
        }

        let polled = if connected {
            step.step(&mut link).await
        } else {
            link.handshake(true).await.map(|()| {
                connected = true;
                Poll::Ready
            })
        };

        match polled {
            Ok(Poll::Ready) => {}
            Ok(Poll::Wait(delay)) => tokio::time::sleep(delay).await,
            Ok(Poll::Finished) => break Ok(()),
            Err(err) => match action(&err) {
                Action::Done => break Ok(()),
                Action::Quit => {
                    core.errors().error(format!("\"{}\": {}", job.file_name(), err));
                    break Err(err);
                }
                Action::Backoff => {
                    core.errors().warn(format!("\"{}\": {}", job.file_name(), err));
                    tokio::time::sleep(error_delay).await;
                }
                Action::Reconnect => {
                    core.errors().error(format!("\"{}\": {}", job.file_name(), err));
                    link.reset().await;
                    connected = false;
                    tokio::time::sleep(error_delay).await;
                }
            },
        }
    };

    step.abandon();
    transfer.remove_shard();
    link.quit().await;
    result
}

/// Shards of one worker.
#[derive(Debug, Default)]
pub(crate) struct ShardSet {
    tasks: JoinSet<Result<()>>,
    failure: Option<Error>,
}

impl ShardSet {
    /// Start a shard running `step`.
    pub(crate) fn spawn<S: ShardStep + 'static>(
        &mut self,
        core: &Arc<MachineCore>,
        job: &TransferJob,
        step: S,
    ) {
        let config = core.config().clone();
        self.tasks
            .spawn(drive(Arc::clone(core), job.clone(), config, step));
    }

    /// Collect finished shards. Returns how many are still running.
    pub(crate) fn reap(&mut self) -> usize {
        while let Some(joined) = self.tasks.try_join_next() {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.failure = Some(err),
                Err(err) if err.is_cancelled() => {}
                Err(err) => self.failure = Some(Error::Transport(format!("shard panicked: {err}").into())),
            }
        }
        self.tasks.len()
    }

    /// Error that made a shard give up, if any.
    pub(crate) fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    /// Abort every shard and wait for them to unwind.
    pub(crate) async fn abort(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.failure = None;
    }
}

/// Decide what a cancelled transfer does next. Either way the worker quits:
/// a job left [`Status::Queued`] goes back to the pending list while the
/// retry budget allows it, otherwise it fails for good.
pub(crate) fn retry_or_fail(core: &MachineCore, job: &TransferJob, max_retries: usize) -> Next {
    let transfer = job.transfer();
    transfer.stop();
    if should_retry(max_retries, transfer.retries(), transfer.updated()) {
        transfer.add_retry();
        transfer.reset();
        core.errors().info(format!("Requeueing \"{}\"", job.file_name()));
        job.set_status(Status::Queued);
        return Next::now(State::Quit);
    }

    let config = core.config();
    core.errors().error(format!(
        "\"{}\" timed out on {}:{}",
        job.file_name(),
        config.address,
        config.port
    ));
    core.set_status(Status::Error);
    job.set_status(Status::Error);
    Next::now(State::Quit)
}
