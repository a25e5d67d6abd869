use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A named cleanup step run during shutdown.
pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Terminates the process. Replaced in tests.
pub type ExitHandler = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Idle,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

impl TerminationSignal {
    /// Conventional `128 + signo` exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationSignal::Interrupt => 130,
            TerminationSignal::Terminate => 143,
        }
    }
}

impl std::fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationSignal::Interrupt => write!(f, "SIGINT"),
            TerminationSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

struct Inner {
    state: ShutdownState,
    cleanups: Vec<(String, CleanupFn)>,
    token: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

/// Turns termination signals into cancellation plus ordered cleanup.
///
/// The first signal cancels in-flight work and runs cleanups newest first
/// under a watchdog; a second signal exits immediately.
pub struct ShutdownCoordinator {
    inner: Mutex<Inner>,
    timeout: Duration,
    exit: ExitHandler,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Self::with_exit_handler(timeout, Arc::new(|code| std::process::exit(code)))
    }

    pub fn with_exit_handler(timeout: Duration, exit: ExitHandler) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: ShutdownState::Idle,
                cleanups: Vec::new(),
                token: CancellationToken::new(),
                listener: None,
            }),
            timeout,
            exit,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a panic elsewhere; the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ShutdownState {
        self.lock().state
    }

    /// Token shared with the executor; cancelled on the first signal.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.lock().token.clone()
    }

    pub fn register_cleanup(&self, name: &str, cleanup: CleanupFn) {
        self.lock().cleanups.push((name.to_string(), cleanup));
    }

    /// Remove a cleanup by name. Returns whether one was registered.
    pub fn unregister_cleanup(&self, name: &str) -> bool {
        let mut inner = self.lock();
        match inner.cleanups.iter().rposition(|(n, _)| n == name) {
            Some(idx) => {
                drop(inner.cleanups.remove(idx));
                true
            }
            None => false,
        }
    }

    /// Listen for SIGINT and SIGTERM on a background task.
    pub fn install(self: &Arc<Self>) -> anyhow::Result<()> {
        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let this = Arc::clone(self);
        let listener = tokio::spawn(async move {
            loop {
                #[cfg(unix)]
                let signal = tokio::select! {
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => TerminationSignal::Interrupt,
                        Err(e) => {
                            tracing::warn!(error = %e, "SIGINT listener failed");
                            return;
                        }
                    },
                    _ = sigterm.recv() => TerminationSignal::Terminate,
                };
                #[cfg(not(unix))]
                let signal = match tokio::signal::ctrl_c().await {
                    Ok(()) => TerminationSignal::Interrupt,
                    Err(e) => {
                        tracing::warn!(error = %e, "SIGINT listener failed");
                        return;
                    }
                };
                this.signal(signal);
            }
        });

        let mut inner = self.lock();
        if let Some(old) = inner.listener.replace(listener) {
            old.abort();
        }
        Ok(())
    }

    /// Handle a termination signal.
    ///
    /// From `Idle` this starts shutdown and returns the task running it.
    /// While already shutting down it forces `exit(1)` and returns None.
    pub fn signal(&self, signal: TerminationSignal) -> Option<JoinHandle<()>> {
        let mut inner = self.lock();
        match inner.state {
            ShutdownState::ShuttingDown => {
                drop(inner);
                tracing::warn!(%signal, "second signal during shutdown, forcing exit");
                (self.exit)(1);
                None
            }
            ShutdownState::Idle => {
                inner.state = ShutdownState::ShuttingDown;
                let token = inner.token.clone();
                let cleanups = std::mem::take(&mut inner.cleanups);
                drop(inner);

                tracing::info!(%signal, cleanups = cleanups.len(), "shutting down");
                token.cancel();

                let exit = Arc::clone(&self.exit);
                let timeout = self.timeout;
                Some(tokio::spawn(async move {
                    match tokio::time::timeout(timeout, run_cleanups(cleanups)).await {
                        Ok(()) => exit(signal.exit_code()),
                        Err(_) => {
                            tracing::warn!(timeout_secs = timeout.as_secs(), "cleanup exceeded shutdown timeout, forcing exit");
                            exit(1)
                        }
                    }
                }))
            }
        }
    }

    /// Stop listening for signals and reset to a fresh idle state.
    pub fn dispose(&self) {
        let mut inner = self.lock();
        if let Some(listener) = inner.listener.take() {
            listener.abort();
        }
        inner.cleanups.clear();
        inner.token = CancellationToken::new();
        inner.state = ShutdownState::Idle;
    }
}

/// Run cleanups newest first. A failing or panicking step is logged and
/// the rest still run.
async fn run_cleanups(cleanups: Vec<(String, CleanupFn)>) {
    for (name, cleanup) in cleanups.into_iter().rev() {
        match tokio::spawn(cleanup()).await {
            Ok(Ok(())) => tracing::debug!(cleanup = %name, "cleanup done"),
            Ok(Err(e)) => tracing::warn!(cleanup = %name, error = %e, "cleanup failed"),
            Err(e) => tracing::warn!(cleanup = %name, error = %e, "cleanup panicked"),
        }
    }
}
