//! Testing utilities: a scripted engine and loader.
//!
//! These let adapter lifecycles be exercised without the real rewriting
//! engine: emissions can be synchronous, deferred to a spawned task, or
//! withheld, and every stage can be told to fail.
//!
//! # Feature Flag
//!
//! Available to this crate's tests and, for downstream crates, with the
//! `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! html-rewriter = { path = "../html-rewriter", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use html_rewriter::testing::{Emission, ScriptedEngine, ScriptedLoader};
//! use html_rewriter::{Engine, HtmlRewriter};
//!
//! let scripted = ScriptedEngine::new().with_emission(Emission::Deferred(Duration::from_millis(5)));
//! let rewriter = HtmlRewriter::with_engine(Engine::new(scripted.clone(), ScriptedLoader::new()));
//! // ... drive an adapter ...
//! assert_eq!(scripted.freed(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::engine::{EngineModule, EngineSession, ModuleLoader, ModulePayload, OutputSink, SessionOptions};
use crate::error::{LoadError, Result, RewriterError};
use crate::handlers::{DocumentHandlers, ElementHandlers};

// =============================================================================
// Loader
// =============================================================================

/// Loader with configurable failures and latency.
#[derive(Debug, Default)]
pub struct ScriptedLoader {
    fail_first: usize,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` load attempts.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Sleep before every load (use with paused Tokio time).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of load attempts observed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ModuleLoader for ScriptedLoader {
    async fn load(&self) -> std::result::Result<ModulePayload, LoadError> {
        let call = self.calls.fetch_add(1, Ordering::AcqRel);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call < self.fail_first {
            return Err(LoadError::Initialize(format!("scripted failure on attempt {}", call + 1)));
        }
        Ok(ModulePayload::new(Bytes::from_static(b"\0asm")).with_content_type("text/plain"))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// How the scripted engine answers each write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    /// Emit the written chunk synchronously inside `write`.
    Echo,
    /// Emit a zero-length chunk, then the written chunk.
    EmptyThenEcho,
    /// Emit the written chunk from a spawned task after a delay.
    Deferred(Duration),
    /// Emit each chunk one write late; the last chunk is never emitted.
    WithholdLast,
    /// Never emit anything.
    Silent,
}

#[derive(Debug, Clone)]
struct Script {
    emission: Emission,
    fail_write_at: Option<usize>,
    fail_finish: bool,
    reject_selector: Option<String>,
    trailer: Option<Bytes>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            emission: Emission::Echo,
            fail_write_at: None,
            fail_finish: false,
            reject_selector: None,
            trailer: None,
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    initialized: AtomicUsize,
    instantiated: AtomicUsize,
    freed: AtomicUsize,
    writes: AtomicUsize,
    finishes: AtomicUsize,
    options: Mutex<Vec<SessionOptions>>,
    selectors: Mutex<Vec<String>>,
    document_bindings: AtomicUsize,
    payload_content_types: Mutex<Vec<Option<String>>>,
}

/// Engine module whose sessions follow a script and count lifecycle calls.
///
/// Clones share the script and the counters.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Script>,
    stats: Arc<Stats>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn script_mut(&mut self) -> &mut Script {
        Arc::make_mut(&mut self.script)
    }

    pub fn with_emission(mut self, emission: Emission) -> Self {
        self.script_mut().emission = emission;
        self
    }

    /// Fail the write with this zero-based index.
    pub fn failing_write_at(mut self, index: usize) -> Self {
        self.script_mut().fail_write_at = Some(index);
        self
    }

    pub fn failing_finish(mut self) -> Self {
        self.script_mut().fail_finish = true;
        self
    }

    /// Reject binding this selector.
    pub fn rejecting_selector(mut self, selector: impl Into<String>) -> Self {
        self.script_mut().reject_selector = Some(selector.into());
        self
    }

    /// Emit these bytes synchronously when the session ends.
    pub fn with_trailer(mut self, trailer: impl Into<Bytes>) -> Self {
        self.script_mut().trailer = Some(trailer.into());
        self
    }

    pub fn initialized(&self) -> usize {
        self.stats.initialized.load(Ordering::Acquire)
    }

    pub fn instantiated(&self) -> usize {
        self.stats.instantiated.load(Ordering::Acquire)
    }

    pub fn freed(&self) -> usize {
        self.stats.freed.load(Ordering::Acquire)
    }

    pub fn writes(&self) -> usize {
        self.stats.writes.load(Ordering::Acquire)
    }

    pub fn finishes(&self) -> usize {
        self.stats.finishes.load(Ordering::Acquire)
    }

    /// Selectors bound across all sessions, in binding order.
    pub fn bound_selectors(&self) -> Vec<String> {
        self.stats.selectors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn document_bindings(&self) -> usize {
        self.stats.document_bindings.load(Ordering::Acquire)
    }

    /// Options passed to each instantiated session.
    pub fn session_options(&self) -> Vec<SessionOptions> {
        self.stats.options.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Content types of the payloads handed to `initialize`.
    pub fn payload_content_types(&self) -> Vec<Option<String>> {
        self.stats
            .payload_content_types
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl EngineModule for ScriptedEngine {
    async fn initialize(&self, payload: ModulePayload) -> std::result::Result<(), LoadError> {
        self.stats.initialized.fetch_add(1, Ordering::AcqRel);
        self.stats
            .payload_content_types
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.content_type().map(str::to_string));
        Ok(())
    }

    fn instantiate(&self, sink: OutputSink, options: SessionOptions) -> Result<Box<dyn EngineSession>> {
        self.stats.instantiated.fetch_add(1, Ordering::AcqRel);
        self.stats
            .options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(options);

        Ok(Box::new(ScriptedSession {
            sink,
            script: Arc::clone(&self.script),
            stats: Arc::clone(&self.stats),
            writes: 0,
            held: None,
        }))
    }
}

struct ScriptedSession {
    sink: OutputSink,
    script: Arc<Script>,
    stats: Arc<Stats>,
    writes: usize,
    held: Option<Bytes>,
}

#[async_trait(?Send)]
impl EngineSession for ScriptedSession {
    fn on(&mut self, selector: &str, _handlers: &ElementHandlers) -> Result<()> {
        if self.script.reject_selector.as_deref() == Some(selector) {
            return Err(RewriterError::EngineBind {
                selector: selector.to_string(),
                reason: "scripted rejection".into(),
            });
        }
        self.stats
            .selectors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(selector.to_string());
        Ok(())
    }

    fn on_document(&mut self, _handlers: &DocumentHandlers) -> Result<()> {
        self.stats.document_bindings.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let index = self.writes;
        self.writes += 1;
        self.stats.writes.fetch_add(1, Ordering::AcqRel);

        if self.script.fail_write_at == Some(index) {
            return Err(RewriterError::EngineWrite(
                format!("scripted failure on write {}", index).into(),
            ));
        }

        match self.script.emission {
            Emission::Echo => (self.sink)(&chunk),
            Emission::EmptyThenEcho => {
                (self.sink)(&[]);
                (self.sink)(&chunk);
            }
            Emission::Deferred(delay) => {
                let sink = Arc::clone(&self.sink);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    sink(&chunk);
                });
            }
            Emission::WithholdLast => {
                if let Some(previous) = self.held.replace(chunk) {
                    (self.sink)(&previous);
                }
            }
            Emission::Silent => {}
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        self.stats.finishes.fetch_add(1, Ordering::AcqRel);
        if self.script.fail_finish {
            return Err(RewriterError::EngineFinish("scripted finish failure".into()));
        }
        if let Some(trailer) = &self.script.trailer {
            (self.sink)(trailer);
        }
        Ok(())
    }

    fn free(self: Box<Self>) {
        self.stats.freed.fetch_add(1, Ordering::AcqRel);
    }
}
