//! Lifecycle coordination: shutdown flag, supervised listener tasks and
//! signal handling.
//!
//! The coordinator moves through `Starting -> Running -> ShuttingDown ->
//! Stopped`. Every serve loop runs as a named task under a [`Supervisor`];
//! when one ends, its result is classified against the [`ShutdownFlag`]:
//! once the flag is set, listener errors are the expected fallout of closing
//! the raw socket, before that they are fatal.

use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

// =============================================================================
// Shutdown flag
// =============================================================================

/// Set once, right before the raw listener is closed.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` for the call that set it.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Lifecycle state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Binding the listen socket.
    Starting,
    /// All listeners are up on this address.
    Running(SocketAddr),
    /// The raw listener is being closed and handlers drained.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

/// Publishes the coordinator's state to any number of observers.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<LifecycleState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Starting);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub(crate) fn set(&self, state: LifecycleState) {
        self.tx.send_replace(state);
    }

    /// Wait until the server is running and return its address, or `None` if
    /// it stopped first.
    pub async fn wait_running(&self) -> Option<SocketAddr> {
        let mut rx = self.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, LifecycleState::Running(_) | LifecycleState::Stopped))
            .await
            .ok()
            .map(|s| *s)?;
        match state {
            LifecycleState::Running(addr) => Some(addr),
            _ => None,
        }
    }
}

// =============================================================================
// Termination classification
// =============================================================================

/// How a listener task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Fatal,
}

/// Classify a serve loop's result using the flag value at this moment.
pub fn classify<E: Display>(
    task: &str,
    result: &Result<(), E>,
    flag: &ShutdownFlag,
) -> Termination {
    match result {
        Ok(()) => {
            info!(task = %task, "gracefully shutting down");
            Termination::Graceful
        }
        Err(e) if flag.is_set() => {
            info!(task = %task, error = %e, "gracefully shutting down");
            Termination::Graceful
        }
        Err(e) => {
            error!(task = %task, error = %e, "failed listening");
            Termination::Fatal
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// A supervised task that finished.
#[derive(Debug)]
pub struct TaskExit {
    pub name: &'static str,
    pub termination: Termination,
    pub message: Option<String>,
}

/// Runs named listener tasks and classifies them as they finish.
pub struct Supervisor {
    tasks: JoinSet<(&'static str, Result<(), String>)>,
    flag: ShutdownFlag,
}

impl Supervisor {
    pub fn new(flag: ShutdownFlag) -> Self {
        Self {
            tasks: JoinSet::new(),
            flag,
        }
    }

    /// Spawn a serve loop under `name`.
    pub fn spawn<F, E>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        self.tasks.spawn(async move {
            let result = task.await.map_err(|e| e.to_string());
            (name, result)
        });
        info!(task = %name, "Spawned listener task");
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next task to finish. `None` once no tasks are left.
    pub async fn next(&mut self) -> Option<TaskExit> {
        let joined = self.tasks.join_next().await?;
        let exit = match joined {
            Ok((name, result)) => TaskExit {
                name,
                termination: classify(name, &result, &self.flag),
                message: result.err(),
            },
            Err(e) if e.is_cancelled() => TaskExit {
                name: "aborted",
                termination: Termination::Graceful,
                message: None,
            },
            Err(e) => {
                error!(error = %e, "Listener task panicked");
                TaskExit {
                    name: "panicked",
                    termination: if self.flag.is_set() {
                        Termination::Graceful
                    } else {
                        Termination::Fatal
                    },
                    message: Some(e.to_string()),
                }
            }
        };
        Some(exit)
    }

    /// Wait up to `timeout` for every task to finish, then abort the rest.
    pub async fn drain(&mut self, timeout: Duration) {
        info!(count = self.tasks.len(), "Waiting for listener tasks to finish");

        let drained = tokio::time::timeout(timeout, async {
            while self.next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = self.tasks.len(), "Force aborting listener tasks");
            self.abort_all().await;
        }
    }

    /// Abort every remaining task and wait for them to go away.
    pub async fn abort_all(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

// =============================================================================
// Signals
// =============================================================================

/// What to do about a received termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: start a graceful shutdown.
    Shutdown,
    /// Any later signal: exit immediately.
    ForceExit,
}

/// Counts termination signals. The first requests shutdown, the next one
/// forces the process out.
#[derive(Debug, Default)]
pub struct SignalTracker {
    received: u32,
}

impl SignalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_signal(&mut self) -> SignalAction {
        self.received = self.received.saturating_add(1);
        if self.received == 1 {
            SignalAction::Shutdown
        } else {
            SignalAction::ForceExit
        }
    }

    pub fn received(&self) -> u32 {
        self.received
    }
}

/// Watch SIGINT and SIGTERM. The first signal sets `shutdown` to true, a
/// second one exits the process with status 1.
pub fn spawn_signal_watcher(shutdown: watch::Sender<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut signals = match Signals::new() {
            Ok(signals) => signals,
            Err(e) => {
                error!(error = %e, "Failed to listen for termination signals");
                // Dropping the sender would read as a shutdown request.
                shutdown.closed().await;
                return;
            }
        };

        let mut tracker = SignalTracker::new();
        loop {
            let signal = signals.recv().await;
            match tracker.on_signal() {
                SignalAction::Shutdown => {
                    info!(signal = %signal, "Received shutdown signal");
                    shutdown.send_replace(true);
                }
                SignalAction::ForceExit => {
                    warn!(signal = %signal, "forcing exit");
                    std::process::exit(1);
                }
            }
        }
    })
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "ctrl-c"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_flag_set_once() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();

        assert!(!flag.is_set());
        assert!(flag.set());
        assert!(!other.set());
        assert!(other.is_set());
    }

    #[test]
    fn test_error_after_flag_is_graceful() {
        let flag = ShutdownFlag::new();
        let result: Result<(), &str> = Err("listener closed");

        assert_eq!(classify("http-server", &result, &flag), Termination::Fatal);
        flag.set();
        assert_eq!(classify("http-server", &result, &flag), Termination::Graceful);
    }

    #[test]
    fn test_ok_is_graceful() {
        let flag = ShutdownFlag::new();
        let result: Result<(), &str> = Ok(());
        assert_eq!(classify("tcp-mux", &result, &flag), Termination::Graceful);
    }

    #[test]
    fn test_signal_tracker() {
        let mut tracker = SignalTracker::new();
        assert_eq!(tracker.on_signal(), SignalAction::Shutdown);
        assert_eq!(tracker.on_signal(), SignalAction::ForceExit);
        assert_eq!(tracker.on_signal(), SignalAction::ForceExit);
        assert_eq!(tracker.received(), 3);
    }

    #[tokio::test]
    async fn test_lifecycle_wait_running() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);

        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_running().await })
        };
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        lifecycle.set(LifecycleState::Running(addr));

        assert_eq!(waiter.await.unwrap(), Some(addr));
    }

    #[tokio::test]
    async fn test_lifecycle_wait_running_stopped() {
        let lifecycle = Lifecycle::new();
        lifecycle.set(LifecycleState::Stopped);
        assert_eq!(lifecycle.wait_running().await, None);
    }

    #[tokio::test]
    async fn test_supervisor_classifies_exits() {
        let flag = ShutdownFlag::new();
        let mut supervisor = Supervisor::new(flag.clone());

        supervisor.spawn("http-server", async { Err::<(), _>("listener closed") });
        let exit = supervisor.next().await.unwrap();
        assert_eq!(exit.name, "http-server");
        assert_eq!(exit.termination, Termination::Fatal);
        assert_eq!(exit.message.as_deref(), Some("listener closed"));

        flag.set();
        supervisor.spawn("grpc-server", async { Err::<(), _>("listener closed") });
        let exit = supervisor.next().await.unwrap();
        assert_eq!(exit.termination, Termination::Graceful);

        assert!(supervisor.next().await.is_none());
    }

    #[tokio::test]
    async fn test_supervisor_drain_aborts_stragglers() {
        let mut supervisor = Supervisor::new(ShutdownFlag::new());
        supervisor.spawn("stuck", async {
            std::future::pending::<()>().await;
            Ok::<(), String>(())
        });
        supervisor.spawn("done", async { Ok::<(), String>(()) });

        let drained = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.drain(Duration::from_millis(50)),
        )
        .await;
        assert_ok!(drained);
        assert!(supervisor.is_empty());
    }
}
