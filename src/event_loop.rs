//! The single shared event loop
//!
//! A current-thread tokio runtime drives every signaling server, the signal
//! handler and any work posted by the render thread. `LoopHandle` is the
//! cloneable face of the loop: it spawns services with per-task failure
//! isolation, accepts dispatched closures while the loop is running, and
//! requests a global stop.

use futures::FutureExt;
use log::{debug, error, info, warn};
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long in-flight work may take to finish once the loop is stopping
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Loop lifecycle; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Running = 0,
    Stopping = 1,
    Stopped = 2,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::Running,
            1 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

struct Shared {
    runtime: Handle,
    state: AtomicU8,
    stop: CancellationToken,
    tracker: TaskTracker,
    services: AtomicUsize,
    idle: Notify,
}

/// Cloneable handle to the shared loop, usable from any thread
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// Ask the loop to stop after the current task; safe from any thread
    pub fn stop(&self) {
        if self.advance(LoopState::Running, LoopState::Stopping) {
            info!("Stop requested, draining event loop");
        }
        self.shared.stop.cancel();
    }

    /// Token cancelled once a stop has been requested
    pub fn stop_token(&self) -> CancellationToken {
        self.shared.stop.clone()
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        self.shared.stop.cancelled().await
    }

    /// Post a closure onto the loop. Returns false, without running it,
    /// once the loop has left `Running`.
    pub fn dispatch<F>(&self, f: F) -> bool
    where
        F: FnOnce(&LoopHandle) + Send + 'static,
    {
        if !self.is_running() {
            return false;
        }
        let lp = self.clone();
        self.shared
            .tracker
            .spawn_on(async move { f(&lp) }, &self.shared.runtime);
        true
    }

    /// Spawn tracked background work; it is drained on stop but does not
    /// keep the loop alive on its own
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.tracker.spawn_on(fut, &self.shared.runtime);
    }

    /// Spawn a long-lived service. Errors and panics are logged at the task
    /// boundary; the loop keeps running for everything else. When the last
    /// service finishes, the loop stops on its own.
    pub fn spawn_service<F, E>(&self, name: &str, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        self.shared.services.fetch_add(1, Ordering::AcqRel);
        let name = name.to_string();
        let lp = self.clone();

        self.shared.tracker.spawn_on(
            async move {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(())) => debug!("{} finished", name),
                    Ok(Err(e)) => error!("{} failed: {}", name, e),
                    Err(panic) => error!("{} panicked: {}", name, panic_message(&*panic)),
                }
                if lp.shared.services.fetch_sub(1, Ordering::AcqRel) == 1 {
                    lp.shared.idle.notify_one();
                }
            },
            &self.shared.runtime,
        );
    }

    pub fn services(&self) -> usize {
        self.shared.services.load(Ordering::Acquire)
    }

    fn advance(&self, from: LoopState, to: LoopState) -> bool {
        self.shared
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Owner of the runtime; dropped last among loop-driven resources
pub struct EventLoop {
    runtime: Runtime,
    handle: LoopHandle,
}

impl EventLoop {
    pub fn new() -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = LoopHandle {
            shared: Arc::new(Shared {
                runtime: runtime.handle().clone(),
                state: AtomicU8::new(LoopState::Running as u8),
                stop: CancellationToken::new(),
                tracker: TaskTracker::new(),
                services: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        };
        Ok(Self { runtime, handle })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Route SIGINT and SIGTERM to `stop()`. Both are hooked here, before
    /// capture or any server is constructed, so an early Ctrl-C still
    /// drains the loop instead of killing the process.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let _guard = self.runtime.enter();
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        let lp = self.handle.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("Received SIGINT");
                    lp.stop();
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM");
                    lp.stop();
                }
                _ = lp.stopped() => {}
            }
        });
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        let lp = self.handle.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C");
                    lp.stop();
                }
                _ = lp.stopped() => {}
            }
        });
        Ok(())
    }

    /// Drive the loop until a stop is requested or every service has
    /// finished, then drain in-flight work.
    pub fn run(&self) {
        let lp = self.handle.clone();
        let inner = lp.clone();
        self.runtime.block_on(async move {
            let shared = &inner.shared;
            let exhausted = async {
                while shared.services.load(Ordering::Acquire) > 0 {
                    shared.idle.notified().await;
                }
            };

            tokio::select! {
                _ = inner.stopped() => {}
                _ = exhausted => {
                    info!("All services finished");
                    inner.stop();
                }
            }

            shared.tracker.close();
            if tokio::time::timeout(DRAIN_GRACE, shared.tracker.wait())
                .await
                .is_err()
            {
                warn!(
                    "{} task(s) still running after {:?}, abandoning them",
                    shared.tracker.len(),
                    DRAIN_GRACE
                );
            }
        });
        lp.advance(LoopState::Stopping, LoopState::Stopped);
        info!("Event loop stopped");
    }
}
