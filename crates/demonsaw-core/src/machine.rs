//! Connection state machine driver.
//!
//! A machine owns a queue of pending transitions. `set_state(state, delay)`
//! queues the state behind a sleep. Roles implement [`Role`] and the shared
//! [`run`] loop turns their results (or errors) into the next transition:
//!
//! ```text
//! start ──► handshake ──► role states ... ──► quit ──► none
//!   ▲           │ error
//!   └─ restart ◄┘ (after error backoff)
//! ```
//!
//! Stopping latches: status changes are suppressed (apart from `none` and
//! `cancelled`), pending transitions are dropped and the machine goes
//! `stop -> quit -> none`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::config::MachineConfig;
use crate::error::{Error, Result};
use crate::status::{ErrorLog, Status};

/// Machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    /// Finished
    #[default]
    None,
    /// Waiting for work
    Idle,
    /// Validate configuration
    Start,
    /// Tear down and start again
    Restart,
    /// Waiting out a delay
    Sleep,
    /// Key agreement
    Handshake,
    /// Register with the router
    Join,
    /// Register a group id
    Group,
    /// Keep-alive
    Ping,
    /// Query router status
    Info,
    /// Socket hand-off
    Tunnel,
    /// Register a relay slot
    Transfer,
    /// Fetch chunks
    Download,
    /// Send chunks
    Upload,
    /// Leave the router
    Quit,
    /// Cancel work in progress
    Cancel,
    /// Stop for good
    Stop,
}

/// A transition returned by a role step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Next {
    /// State to enter
    pub state: State,
    /// Sleep before entering it
    pub delay: Duration,
}

impl Next {
    /// Enter `state` immediately.
    #[must_use]
    pub const fn now(state: State) -> Self {
        Self {
            state,
            delay: Duration::ZERO,
        }
    }

    /// Enter `state` after `delay`.
    #[must_use]
    pub const fn after(state: State, delay: Duration) -> Self {
        Self { state, delay }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between a running machine and its handles.
#[derive(Debug)]
pub struct MachineCore {
    name: String,
    config: MachineConfig,
    state: Mutex<State>,
    status: Mutex<Status>,
    queue: Mutex<VecDeque<Next>>,
    stopping: AtomicBool,
    quit: AtomicUsize,
    wake: Notify,
    errors: ErrorLog,
}

impl MachineCore {
    /// Core for a machine called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, config: MachineConfig) -> Self {
        let name = name.into();
        Self {
            errors: ErrorLog::new(name.clone(), config.max_errors()),
            name,
            config,
            state: Mutex::new(State::None),
            status: Mutex::new(Status::None),
            queue: Mutex::new(VecDeque::new()),
            stopping: AtomicBool::new(false),
            quit: AtomicUsize::new(0),
            wake: Notify::new(),
        }
    }

    /// Machine name used in log lines.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Error history.
    #[must_use]
    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        *lock(&self.state)
    }

    fn enter(&self, state: State) {
        *lock(&self.state) = state;
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        *lock(&self.status)
    }

    /// Set the status. Ignored while stopping unless the status
    /// [survives quit](Status::survives_quit).
    pub fn set_status(&self, status: Status) {
        if self.stopping() && !status.survives_quit() {
            return;
        }
        *lock(&self.status) = status;
    }

    /// Queue `state` immediately. Ignored while stopping.
    pub fn set_state(&self, state: State) {
        self.set_state_after(state, Duration::ZERO);
    }

    /// Queue `state` behind a sleep of `delay`. Ignored while stopping.
    pub fn set_state_after(&self, state: State, delay: Duration) {
        if self.stopping() {
            return;
        }
        self.push(Next::after(state, delay));
    }

    fn push(&self, next: Next) {
        lock(&self.queue).push_back(next);
        self.wake.notify_one();
    }

    fn pop(&self) -> Option<Next> {
        lock(&self.queue).pop_front()
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut queue = lock(&self.queue);
        queue.clear();
        queue.push_back(Next::now(State::Stop));
        drop(queue);
        self.wake.notify_one();
    }

    /// Latch the quit flag. Returns true only for the first caller.
    pub fn quit_once(&self) -> bool {
        self.quit.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Whether quit has run.
    #[must_use]
    pub fn has_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire) > 0
    }

    /// Sleep for `delay` in poll-sized slices. Returns false if a stop was
    /// requested meanwhile.
    pub async fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let poll = self.config.sleep_timeout();
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let slice = (now + poll).min(deadline);
            tokio::select! {
                () = sleep_until(slice) => {}
                () = self.wake.notified() => {}
            }
        }
        false
    }

    async fn wait(&self) {
        self.wake.notified().await;
    }
}

/// Role-specific behavior plugged into [`run`].
#[async_trait]
pub trait Role: Send {
    /// Shared core.
    fn core(&self) -> &Arc<MachineCore>;

    /// Validate configuration. Defaults to checking the router endpoint.
    async fn on_start(&mut self) -> Result<Next> {
        self.core().config().validate_endpoint()?;
        Ok(Next::now(State::Handshake))
    }

    /// Run the handshake and pick the first steady state.
    async fn on_handshake(&mut self) -> Result<Next>;

    /// Any state without a dedicated hook.
    async fn on_state(&mut self, state: State) -> Result<Next> {
        tracing::debug!("[{}] no handler for {:?}", self.core().name(), state);
        Ok(Next::now(State::Idle))
    }

    /// Drop connection state before starting again.
    async fn on_restart(&mut self) {}

    /// Cancel in-flight work. Defaults to `stop`.
    async fn on_cancel(&mut self) -> Next {
        Next::now(State::Stop)
    }

    /// Leave: best-effort notify, then close. Errors are swallowed.
    async fn on_quit(&mut self) {}
}

fn recover(core: &MachineCore, state: State, err: &Error) -> Option<Next> {
    if core.stopping() {
        return None;
    }
    let config = core.config();
    if err.is_config() {
        core.set_status(Status::Warning);
        core.errors().warn(err.to_string());
        return Some(Next::after(State::Start, config.idle_timeout()));
    }
    core.set_status(Status::Error);
    core.errors().error(format!("{state:?}: {err}"));
    Some(Next::after(State::Restart, config.error_timeout()))
}

async fn step<R: Role + ?Sized>(role: &mut R, state: State) -> Option<Next> {
    let core = Arc::clone(role.core());
    match state {
        State::Start => match role.on_start().await {
            Ok(next) => Some(next),
            Err(err) => recover(&core, state, &err),
        },
        State::Restart => {
            role.on_restart().await;
            Some(Next::now(State::Start))
        }
        State::Handshake => match role.on_handshake().await {
            Ok(next) => {
                core.set_status(Status::Success);
                Some(next)
            }
            Err(err) => recover(&core, state, &err),
        },
        State::Cancel => Some(role.on_cancel().await),
        State::Stop => Some(Next::now(State::Quit)),
        State::Quit => {
            if core.quit_once() {
                role.on_quit().await;
            }
            Some(Next::now(State::None))
        }
        State::Idle => {
            core.wait().await;
            None
        }
        State::None | State::Sleep => None,
        other => match role.on_state(other).await {
            Ok(next) => Some(next),
            Err(err) => recover(&core, other, &err),
        },
    }
}

/// Drive `role` from `start` until it reaches `none`.
pub async fn run<R: Role + ?Sized>(role: &mut R) {
    let core = Arc::clone(role.core());
    core.set_state(State::Start);

    loop {
        let Some(next) = core.pop() else {
            if core.state() == State::None && core.has_quit() {
                break;
            }
            core.wait().await;
            continue;
        };

        if !next.delay.is_zero() {
            core.enter(State::Sleep);
            if !core.sleep(next.delay).await && !matches!(next.state, State::Stop | State::Quit | State::None) {
                continue;
            }
        }

        core.enter(next.state);
        if next.state == State::None {
            break;
        }
        if let Some(following) = step(role, next.state).await {
            if core.stopping() && !matches!(following.state, State::Quit | State::None | State::Stop) {
                continue;
            }
            core.push(following);
        }
    }
    tracing::debug!("[{}] machine finished", core.name());
}

/// Handle to a spawned machine.
#[derive(Debug)]
pub struct MachineHandle {
    core: Arc<MachineCore>,
    task: JoinHandle<()>,
}

impl MachineHandle {
    /// Spawn `role` on the runtime.
    pub fn spawn<R: Role + 'static>(mut role: R) -> Self {
        let core = Arc::clone(role.core());
        let task = tokio::spawn(async move { run(&mut role).await });
        Self { core, task }
    }

    /// Shared core.
    #[must_use]
    pub fn core(&self) -> &Arc<MachineCore> {
        &self.core
    }

    /// Request a stop.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Wait for the machine to finish.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            tracing::error!("[{}] machine task failed: {}", self.core.name(), err);
        }
    }

    /// Request a stop and wait for the machine to finish.
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Scripted {
        core: Arc<MachineCore>,
        handshakes: Arc<AtomicUsize>,
        fail_first: bool,
        quits: Arc<AtomicUsize>,
        ping_forever: bool,
    }

    #[async_trait]
    impl Role for Scripted {
        fn core(&self) -> &Arc<MachineCore> {
            &self.core
        }

        async fn on_handshake(&mut self) -> Result<Next> {
            let n = self.handshakes.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(Error::transport("refused"));
            }
            if self.ping_forever {
                Ok(Next::now(State::Ping))
            } else {
                Ok(Next::now(State::Quit))
            }
        }

        async fn on_state(&mut self, _state: State) -> Result<Next> {
            Ok(Next::after(State::Ping, Duration::from_millis(10)))
        }

        async fn on_quit(&mut self) {
            self.quits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> MachineConfig {
        MachineConfig {
            error_ms: 10,
            idle_ms: 10,
            sleep_ms: 5,
            ..MachineConfig::default()
        }
    }

    fn scripted(config: MachineConfig, fail_first: bool, ping_forever: bool) -> Scripted {
        Scripted {
            core: Arc::new(MachineCore::new("test", config)),
            handshakes: Arc::new(AtomicUsize::new(0)),
            fail_first,
            quits: Arc::new(AtomicUsize::new(0)),
            ping_forever,
        }
    }

    #[tokio::test]
    async fn test_one_shot() {
        let mut role = scripted(fast_config(), false, false);
        run(&mut role).await;
        assert_eq!(role.handshakes.load(Ordering::SeqCst), 1);
        assert_eq!(role.quits.load(Ordering::SeqCst), 1);
        assert_eq!(role.core.status(), Status::Success);
        assert_eq!(role.core.state(), State::None);
    }

    #[tokio::test]
    async fn test_handshake_error_restarts() {
        let mut role = scripted(fast_config(), true, false);
        run(&mut role).await;
        assert_eq!(role.handshakes.load(Ordering::SeqCst), 2);
        assert_eq!(role.core.errors().len(), 1);
        assert_eq!(role.core.status(), Status::Success);
    }

    #[tokio::test]
    async fn test_config_error_is_warning() {
        let config = MachineConfig {
            port: 0,
            ..fast_config()
        };
        let role = scripted(config, false, false);
        let handshakes = Arc::clone(&role.handshakes);
        let quits = Arc::clone(&role.quits);
        let handle = MachineHandle::spawn(role);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.core().status(), Status::Warning);
        assert_eq!(handshakes.load(Ordering::SeqCst), 0);
        handle.shutdown().await;
        assert_eq!(quits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_loop() {
        let role = scripted(fast_config(), false, true);
        let quits = Arc::clone(&role.quits);
        let handle = MachineHandle::spawn(role);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let core = Arc::clone(handle.core());
        handle.shutdown().await;
        assert_eq!(quits.load(Ordering::SeqCst), 1);
        assert_eq!(core.state(), State::None);

        core.set_status(Status::Error);
        assert_eq!(core.status(), Status::Success);
        core.set_status(Status::Cancelled);
        assert_eq!(core.status(), Status::Cancelled);
    }

    #[test]
    fn test_quit_latch() {
        let core = MachineCore::new("test", MachineConfig::default());
        assert!(core.quit_once());
        assert!(!core.quit_once());
        core.stop();
        core.stop();
        assert_eq!(core.pop(), Some(Next::now(State::Stop)));
        assert_eq!(core.pop(), None);
    }
}
