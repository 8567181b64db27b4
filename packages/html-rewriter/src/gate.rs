//! One-shot asynchronous engine initialization.
//!
//! The gate owns a single broadcast signal: every [`wait_ready`] call clones
//! the same shared future, so all waiters observe one outcome together. A
//! failed attempt resolves the current signal with the error and installs a
//! fresh one, so later waiters wait for the *next* attempt instead of seeing
//! a memoized failure.
//!
//! Attempts are started by [`trigger`], which `HtmlRewriter` construction
//! calls; at most one attempt runs at a time. Waiters never retry. The one
//! exception is a construction made outside a Tokio runtime: its request is
//! parked and started by the first waiter that runs on a runtime.
//!
//! ```text
//! Uninitialized ──trigger──► Initializing ──ok──► Ready
//!       ▲                         │
//!       │                         └──err──► Failed ──trigger──► Initializing
//! ```
//!
//! [`wait_ready`]: ReadinessGate::wait_ready
//! [`trigger`]: ReadinessGate::trigger

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{FutureExt, Shared};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::engine::{EngineModule, ModuleLoader};
use crate::error::{LoadError, RewriterError};

/// Lifecycle of the shared engine module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineInitState {
    Uninitialized,
    Initializing,
    Ready,
    /// The last attempt failed; the next trigger starts a new one.
    Failed,
}

/// Proof that the engine module finished initializing.
///
/// Only obtainable from [`ReadinessGate::wait_ready`]; sessions require it.
#[derive(Debug, Clone, Copy)]
pub struct EngineReady {
    _private: (),
}

type Outcome = Result<(), Arc<LoadError>>;

struct Signal {
    tx: Option<oneshot::Sender<Outcome>>,
    rx: Shared<oneshot::Receiver<Outcome>>,
}

impl Signal {
    fn armed() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: rx.shared(),
        }
    }
}

/// A construction that happened with no runtime to spawn the load on.
struct DeferredLoad {
    loader: Arc<dyn ModuleLoader>,
    module: Arc<dyn EngineModule>,
}

struct GateInner {
    state: EngineInitState,
    signal: Signal,
    attempts: u64,
    deferred: Option<DeferredLoad>,
}

/// Single-flight readiness gate for one engine module.
pub struct ReadinessGate {
    inner: Mutex<GateInner>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                state: EngineInitState::Uninitialized,
                signal: Signal::armed(),
                attempts: 0,
                deferred: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> EngineInitState {
        self.lock().state
    }

    /// Number of load attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }

    /// Start a load attempt in the background.
    ///
    /// No-op while an attempt is in flight or once the engine is ready.
    /// Outside a Tokio runtime nothing can be spawned: the request is kept
    /// and the first [`wait_ready`](Self::wait_ready) running on a runtime
    /// starts it.
    pub fn trigger(self: &Arc<Self>, loader: Arc<dyn ModuleLoader>, module: Arc<dyn EngineModule>) {
        let mut inner = self.lock();
        match inner.state {
            EngineInitState::Ready | EngineInitState::Initializing => return,
            EngineInitState::Uninitialized | EngineInitState::Failed => {}
        }

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no Tokio runtime available, engine load deferred to the first wait");
                inner.deferred = Some(DeferredLoad { loader, module });
                return;
            }
        };

        inner.deferred = None;
        inner.state = EngineInitState::Initializing;
        inner.attempts += 1;
        let attempt = inner.attempts;
        drop(inner);

        debug!(attempt, "loading engine module");
        let mut guard = SettleOnDrop {
            gate: Arc::clone(self),
            attempt,
            settled: false,
        };
        runtime.spawn(async move {
            let outcome = AssertUnwindSafe(load_module(loader.as_ref(), module.as_ref()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(LoadError::Initialize("engine load panicked".into())));
            guard.settled = true;
            guard.gate.settle(attempt, outcome);
        });
    }

    fn settle(&self, attempt: u64, outcome: Result<(), LoadError>) {
        let mut inner = self.lock();
        match outcome {
            Ok(()) => {
                inner.state = EngineInitState::Ready;
                if let Some(tx) = inner.signal.tx.take() {
                    let _ = tx.send(Ok(()));
                }
                info!(attempt, "engine ready");
            }
            Err(err) => {
                error!(attempt, error = %err, "engine load failed");
                inner.state = EngineInitState::Failed;
                // Re-arm before publishing so late waiters wait for the next attempt
                let failed = std::mem::replace(&mut inner.signal, Signal::armed());
                if let Some(tx) = failed.tx {
                    // Nobody waiting is fine: the failure is already logged
                    let _ = tx.send(Err(Arc::new(err)));
                }
            }
        }
    }

    /// Suspend until the engine is ready.
    ///
    /// Waiters attached to a failing attempt receive [`RewriterError::EngineLoad`].
    /// A waiter only starts a load that a construction requested but could
    /// not spawn; it never retries a failed attempt.
    pub async fn wait_ready(self: &Arc<Self>) -> Result<EngineReady, RewriterError> {
        let (signal, deferred) = {
            let mut inner = self.lock();
            if inner.state == EngineInitState::Ready {
                return Ok(EngineReady { _private: () });
            }
            // Subscribe before starting so a fast failure still reaches us
            (inner.signal.rx.clone(), inner.deferred.take())
        };

        if let Some(DeferredLoad { loader, module }) = deferred {
            debug!("starting engine load requested before a runtime existed");
            self.trigger(loader, module);
        }

        match signal.await {
            Ok(Ok(())) => Ok(EngineReady { _private: () }),
            Ok(Err(err)) => Err(RewriterError::EngineLoad(err)),
            Err(_) => Err(RewriterError::EngineLoad(Arc::new(LoadError::Abandoned))),
        }
    }
}

/// Fails the attempt if the load task is dropped before settling, e.g. when
/// its runtime shuts down, so the gate does not stay `Initializing`.
struct SettleOnDrop {
    gate: Arc<ReadinessGate>,
    attempt: u64,
    settled: bool,
}

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        if !self.settled {
            self.gate.settle(self.attempt, Err(LoadError::Abandoned));
        }
    }
}

async fn load_module(loader: &dyn ModuleLoader, module: &dyn EngineModule) -> Result<(), LoadError> {
    let payload = loader
        .load()
        .await?
        .ensure_content_type(module.content_type());
    module.initialize(payload).await
}
