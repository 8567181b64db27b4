//! Single-use rewriting session.
//!
//! A [`RewriterSession`] wraps one engine instance bound to one output sink.
//! It can only be opened with an [`EngineReady`] proof, binds every handler
//! of the configuration in registration order, and releases the engine
//! instance exactly once: explicitly through [`release`], or on drop when an
//! adapter is cancelled mid-stream.
//!
//! [`release`]: RewriterSession::release

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::debug;

use crate::config::HtmlRewriter;
use crate::engine::{EngineSession, OutputSink, SessionOptions};
use crate::error::{Result, RewriterError};
use crate::gate::EngineReady;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One engine instance driven through one transformation.
pub struct RewriterSession {
    id: u64,
    engine: Option<Box<dyn EngineSession>>,
}

impl RewriterSession {
    /// Instantiate the engine and bind the rewriter's handlers.
    ///
    /// A binding failure releases the instance before returning the error.
    pub fn open(_ready: EngineReady, rewriter: &HtmlRewriter, sink: OutputSink) -> Result<Self> {
        let options = SessionOptions {
            enable_esi_tags: rewriter.esi_tags_enabled(),
        };
        let engine = rewriter.engine().module().instantiate(sink, options)?;

        let mut session = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            engine: Some(engine),
        };
        debug!(session = session.id, esi = options.enable_esi_tags, "session opened");

        for binding in rewriter.element_bindings() {
            session
                .engine_mut()?
                .on(binding.selector(), binding.handlers())?;
        }
        for handlers in rewriter.document_bindings() {
            session.engine_mut()?.on_document(handlers)?;
        }

        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.engine.is_none()
    }

    fn engine_mut(&mut self) -> Result<&mut Box<dyn EngineSession>> {
        self.engine
            .as_mut()
            .ok_or(RewriterError::SessionMisuse("session used after release"))
    }

    /// Feed one chunk to the engine.
    pub async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.engine_mut()?.write(chunk).await
    }

    /// Signal end of input. Trailing emissions may land before or after this
    /// resolves.
    pub async fn finish(&mut self) -> Result<()> {
        self.engine_mut()?.end().await
    }

    /// Free the engine instance. Later calls are no-ops.
    pub fn release(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.free();
            debug!(session = self.id, "session released");
        }
    }
}

impl Drop for RewriterSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::handlers::{DocumentHandlers, ElementHandlers};
    use crate::testing::{ScriptedEngine, ScriptedLoader};
    use std::sync::Arc;

    fn null_sink() -> OutputSink {
        Arc::new(|_: &[u8]| {})
    }

    async fn ready_rewriter(scripted: &ScriptedEngine) -> HtmlRewriter {
        let rewriter = HtmlRewriter::with_engine(Engine::new(scripted.clone(), ScriptedLoader::new()));
        rewriter.engine().gate().wait_ready().await.unwrap();
        rewriter
    }

    #[tokio::test]
    async fn binds_in_registration_order() {
        let scripted = ScriptedEngine::new();
        let rewriter = ready_rewriter(&scripted)
            .await
            .on("div", ElementHandlers::new())
            .on_document(DocumentHandlers::new())
            .on("span", ElementHandlers::new());

        let ready = rewriter.engine().gate().wait_ready().await.unwrap();
        let _session = RewriterSession::open(ready, &rewriter, null_sink()).unwrap();

        assert_eq!(scripted.bound_selectors(), vec!["div", "span"]);
        assert_eq!(scripted.document_bindings(), 1);
    }

    #[tokio::test]
    async fn bind_failure_releases_instance() {
        let scripted = ScriptedEngine::new().rejecting_selector("bad");
        let rewriter = ready_rewriter(&scripted)
            .await
            .on("ok", ElementHandlers::new())
            .on("bad", ElementHandlers::new());

        let ready = rewriter.engine().gate().wait_ready().await.unwrap();
        let err = RewriterSession::open(ready, &rewriter, null_sink()).err().unwrap();

        assert!(matches!(err, RewriterError::EngineBind { .. }));
        assert_eq!(scripted.instantiated(), 1);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_drop_does_not_double_free() {
        let scripted = ScriptedEngine::new();
        let rewriter = ready_rewriter(&scripted).await;

        let ready = rewriter.engine().gate().wait_ready().await.unwrap();
        let mut session = RewriterSession::open(ready, &rewriter, null_sink()).unwrap();
        session.release();
        session.release();
        assert!(session.is_released());
        drop(session);

        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn use_after_release_is_misuse() {
        let scripted = ScriptedEngine::new();
        let rewriter = ready_rewriter(&scripted).await;

        let ready = rewriter.engine().gate().wait_ready().await.unwrap();
        let mut session = RewriterSession::open(ready, &rewriter, null_sink()).unwrap();
        session.release();

        let err = session.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, RewriterError::SessionMisuse(_)));
        let err = session.finish().await.unwrap_err();
        assert!(matches!(err, RewriterError::SessionMisuse(_)));
    }

    #[tokio::test]
    async fn esi_toggle_reaches_the_engine() {
        let scripted = ScriptedEngine::new();
        let rewriter = crate::config::with_enable_esi_tags(ready_rewriter(&scripted).await);

        let ready = rewriter.engine().gate().wait_ready().await.unwrap();
        let _session = RewriterSession::open(ready, &rewriter, null_sink()).unwrap();

        assert_eq!(
            scripted.session_options(),
            vec![SessionOptions { enable_esi_tags: true }]
        );
    }
}
