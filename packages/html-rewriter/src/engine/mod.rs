//! The seam between the adapters and the rewriting engine.
//!
//! An engine is split in two parts:
//! - [`EngineModule`]: the shared, process-wide module. Initialized once by the
//!   readiness gate, then asked to [`instantiate`](EngineModule::instantiate)
//!   one [`EngineSession`] per transformation.
//! - [`EngineSession`]: one single-pass rewriting instance bound to one output
//!   sink. Sessions are driven from a single task and are not `Send`.
//!
//! The payload the module is initialized from is acquired by a
//! [`ModuleLoader`] (see [`loader`]).
//!
//! ```text
//! HtmlRewriter::new()
//!     │
//!     ▼ trigger
//! ReadinessGate ── ModuleLoader::load() ── EngineModule::initialize()
//!     │
//!     ▼ wait_ready()
//! EngineModule::instantiate(sink) ─► EngineSession
//!     on() / on_document() ─► write()* ─► end() ─► free()
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{LoadError, Result};
use crate::gate::ReadinessGate;
use crate::handlers::{DocumentHandlers, ElementHandlers};

pub mod loader;
pub mod native;

pub use loader::{BuiltinLoader, FileLoader, ModuleLoader, ModulePayload};
pub use native::NativeEngine;

/// Sink receiving every chunk the engine emits, including empty ones.
///
/// `Send + Sync` so an engine may emit from another task; adapters filter
/// zero-length chunks before forwarding them downstream.
pub type OutputSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Per-session engine options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Parse `<esi:*>` tags as elements.
    pub enable_esi_tags: bool,
}

/// The shared engine module.
#[async_trait]
pub trait EngineModule: Send + Sync + 'static {
    /// Content type the module payload must be labelled with.
    fn content_type(&self) -> &'static str {
        "application/wasm"
    }

    /// Module initialization entry point. Called once per load attempt.
    async fn initialize(&self, payload: ModulePayload) -> std::result::Result<(), LoadError>;

    /// Create a fresh single-use session emitting into `sink`.
    fn instantiate(&self, sink: OutputSink, options: SessionOptions) -> Result<Box<dyn EngineSession>>;
}

/// One single-use engine instance.
#[async_trait(?Send)]
pub trait EngineSession {
    /// Register handlers for elements matching `selector`.
    fn on(&mut self, selector: &str, handlers: &ElementHandlers) -> Result<()>;

    /// Register whole-document handlers.
    fn on_document(&mut self, handlers: &DocumentHandlers) -> Result<()>;

    /// Feed one input chunk.
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Signal end of input.
    async fn end(&mut self) -> Result<()>;

    /// Release the instance's resources.
    fn free(self: Box<Self>);
}

// =============================================================================
// Engine Handle
// =============================================================================

struct EngineInner {
    module: Arc<dyn EngineModule>,
    loader: Arc<dyn ModuleLoader>,
    gate: Arc<ReadinessGate>,
}

/// Cheaply cloneable handle to an engine module, its loader and its gate.
///
/// Clones share the same readiness gate.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

static NATIVE_ENGINE: OnceLock<Engine> = OnceLock::new();

impl Engine {
    /// Create a handle with its own readiness gate.
    pub fn new(module: impl EngineModule, loader: impl ModuleLoader) -> Self {
        Self::from_parts(Arc::new(module), Arc::new(loader))
    }

    pub fn from_parts(module: Arc<dyn EngineModule>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                module,
                loader,
                gate: Arc::new(ReadinessGate::new()),
            }),
        }
    }

    /// The process-wide `lol_html` engine used by `HtmlRewriter::new`.
    pub fn native() -> Self {
        NATIVE_ENGINE
            .get_or_init(|| Engine::new(NativeEngine::new(), BuiltinLoader::new()))
            .clone()
    }

    pub fn module(&self) -> &Arc<dyn EngineModule> {
        &self.inner.module
    }

    pub fn gate(&self) -> &Arc<ReadinessGate> {
        &self.inner.gate
    }

    /// Start a load attempt unless one is running or the engine is ready.
    pub(crate) fn trigger_load(&self) {
        self.inner.gate.trigger(
            Arc::clone(&self.inner.loader),
            Arc::clone(&self.inner.module),
        );
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.inner.gate.state())
            .finish()
    }
}
