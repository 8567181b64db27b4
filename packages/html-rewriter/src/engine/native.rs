//! `lol_html`-backed engine.
//!
//! The rewriter is statically linked, so initialization only validates that
//! the gate handed over a payload; sessions buffer handler bindings until the
//! first write, because `lol_html` takes every handler at construction.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use lol_html::html_content::{Comment, Doctype, DocumentEnd, Element, TextChunk};
use lol_html::{
    DocumentContentHandlers, ElementContentHandlers, HtmlRewriter as LolRewriter, Selector, Settings,
};
use tracing::debug;

use super::{EngineModule, EngineSession, ModulePayload, OutputSink, SessionOptions};
use crate::error::{LoadError, Result, RewriterError};
use crate::handlers::{DocumentHandlers, ElementHandlers};

type Emit = Box<dyn FnMut(&[u8])>;

/// Engine module backed by the `lol_html` crate.
#[derive(Debug, Clone, Default)]
pub struct NativeEngine;

impl NativeEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineModule for NativeEngine {
    fn content_type(&self) -> &'static str {
        "application/x-lol-html"
    }

    async fn initialize(&self, payload: ModulePayload) -> std::result::Result<(), LoadError> {
        debug!(
            bytes = payload.len(),
            content_type = ?payload.content_type(),
            "native engine initialized"
        );
        Ok(())
    }

    fn instantiate(&self, sink: OutputSink, options: SessionOptions) -> Result<Box<dyn EngineSession>> {
        Ok(Box::new(NativeSession::new(sink, options)))
    }
}

enum NativeState {
    Binding,
    Rewriting(LolRewriter<'static, Emit>),
    Ended,
    Failed,
}

struct NativeSession {
    sink: OutputSink,
    options: SessionOptions,
    element_content_handlers: Vec<(Cow<'static, Selector>, ElementContentHandlers<'static>)>,
    document_content_handlers: Vec<DocumentContentHandlers<'static>>,
    state: NativeState,
}

impl NativeSession {
    fn new(sink: OutputSink, options: SessionOptions) -> Self {
        Self {
            sink,
            options,
            element_content_handlers: Vec::new(),
            document_content_handlers: Vec::new(),
            state: NativeState::Binding,
        }
    }

    fn ensure_binding(&self) -> Result<()> {
        match self.state {
            NativeState::Binding => Ok(()),
            _ => Err(RewriterError::SessionMisuse(
                "handlers must be bound before the first write",
            )),
        }
    }

    /// Build the `lol_html` rewriter on the first write or end.
    fn start(&mut self) {
        if !matches!(self.state, NativeState::Binding) {
            return;
        }

        let settings = Settings {
            element_content_handlers: std::mem::take(&mut self.element_content_handlers),
            document_content_handlers: std::mem::take(&mut self.document_content_handlers),
            enable_esi_tags: self.options.enable_esi_tags,
            ..Settings::new()
        };

        let sink = Arc::clone(&self.sink);
        let emit: Emit = Box::new(move |chunk: &[u8]| sink(chunk));
        self.state = NativeState::Rewriting(LolRewriter::new(settings, emit));
    }
}

#[async_trait(?Send)]
impl EngineSession for NativeSession {
    fn on(&mut self, selector: &str, handlers: &ElementHandlers) -> Result<()> {
        self.ensure_binding()?;

        let parsed: Selector = selector.parse().map_err(|err| RewriterError::EngineBind {
            selector: selector.to_string(),
            reason: format!("{}", err),
        })?;

        self.element_content_handlers
            .push((Cow::Owned(parsed), element_content_handlers(handlers)));
        Ok(())
    }

    fn on_document(&mut self, handlers: &DocumentHandlers) -> Result<()> {
        self.ensure_binding()?;
        self.document_content_handlers
            .push(document_content_handlers(handlers));
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.start();

        let written = match &mut self.state {
            NativeState::Rewriting(rewriter) => rewriter.write(&chunk),
            NativeState::Ended => return Err(RewriterError::SessionMisuse("write after end")),
            _ => return Err(RewriterError::SessionMisuse("write after a failed write")),
        };

        written.map_err(|err| {
            // lol_html must not be used again after reporting an error
            self.state = NativeState::Failed;
            RewriterError::EngineWrite(Box::new(err))
        })
    }

    async fn end(&mut self) -> Result<()> {
        self.start();

        match std::mem::replace(&mut self.state, NativeState::Ended) {
            NativeState::Rewriting(rewriter) => rewriter
                .end()
                .map_err(|err| RewriterError::EngineFinish(Box::new(err))),
            NativeState::Ended => Err(RewriterError::SessionMisuse("end called twice")),
            NativeState::Failed | NativeState::Binding => {
                self.state = NativeState::Failed;
                Err(RewriterError::SessionMisuse("end after a failed write"))
            }
        }
    }

    fn free(self: Box<Self>) {
        debug!(
            pending_bindings = self.element_content_handlers.len(),
            "native session freed"
        );
    }
}

fn element_content_handlers(handlers: &ElementHandlers) -> ElementContentHandlers<'static> {
    let mut content: ElementContentHandlers<'static> = ElementContentHandlers::default();

    if let Some(callback) = handlers.element_callback() {
        let callback = Arc::clone(callback);
        content = content.element(move |el: &mut Element<'_, '_>| callback(el));
    }
    if let Some(callback) = handlers.comments_callback() {
        let callback = Arc::clone(callback);
        content = content.comments(move |comment: &mut Comment<'_>| callback(comment));
    }
    if let Some(callback) = handlers.text_callback() {
        let callback = Arc::clone(callback);
        content = content.text(move |text: &mut TextChunk<'_>| callback(text));
    }

    content
}

fn document_content_handlers(handlers: &DocumentHandlers) -> DocumentContentHandlers<'static> {
    let mut content: DocumentContentHandlers<'static> = DocumentContentHandlers::default();

    if let Some(callback) = handlers.doctype_callback() {
        let callback = Arc::clone(callback);
        content = content.doctype(move |doctype: &mut Doctype<'_>| callback(doctype));
    }
    if let Some(callback) = handlers.comments_callback() {
        let callback = Arc::clone(callback);
        content = content.comments(move |comment: &mut Comment<'_>| callback(comment));
    }
    if let Some(callback) = handlers.text_callback() {
        let callback = Arc::clone(callback);
        content = content.text(move |text: &mut TextChunk<'_>| callback(text));
    }
    if let Some(callback) = handlers.end_callback() {
        let callback = Arc::clone(callback);
        content = content.end(move |end: &mut DocumentEnd<'_>| callback(end));
    }

    content
}
