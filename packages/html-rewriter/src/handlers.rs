//! Handler sets accumulated by the caller before a transformation.
//!
//! Callbacks are stored behind `Arc` so a single [`HtmlRewriter`] can be
//! reused for many transformations: every session receives its own clones
//! of the same callbacks.
//!
//! [`HtmlRewriter`]: crate::HtmlRewriter

use std::fmt;
use std::sync::Arc;

use lol_html::html_content::{Comment, Doctype, DocumentEnd, Element, TextChunk};
use lol_html::HandlerResult;

/// Callback invoked for each element matching a selector.
pub type ElementCallback = Arc<dyn Fn(&mut Element<'_, '_>) -> HandlerResult + Send + Sync>;
/// Callback invoked for each comment.
pub type CommentCallback = Arc<dyn Fn(&mut Comment<'_>) -> HandlerResult + Send + Sync>;
/// Callback invoked for each text chunk.
pub type TextCallback = Arc<dyn Fn(&mut TextChunk<'_>) -> HandlerResult + Send + Sync>;
/// Callback invoked for the document type declaration.
pub type DoctypeCallback = Arc<dyn Fn(&mut Doctype<'_>) -> HandlerResult + Send + Sync>;
/// Callback invoked once the whole document has been parsed.
pub type DocumentEndCallback = Arc<dyn Fn(&mut DocumentEnd<'_>) -> HandlerResult + Send + Sync>;

/// Handlers applied to elements matching one selector.
#[derive(Clone, Default)]
pub struct ElementHandlers {
    element: Option<ElementCallback>,
    comments: Option<CommentCallback>,
    text: Option<TextCallback>,
}

impl ElementHandlers {
    /// Create an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle the matched element itself (attributes, before/after, removal).
    pub fn element<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Element<'_, '_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.element = Some(Arc::new(handler));
        self
    }

    /// Handle comments inside the matched element.
    pub fn comments<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Comment<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.comments = Some(Arc::new(handler));
        self
    }

    /// Handle text chunks inside the matched element.
    pub fn text<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut TextChunk<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.text = Some(Arc::new(handler));
        self
    }

    pub fn element_callback(&self) -> Option<&ElementCallback> {
        self.element.as_ref()
    }

    pub fn comments_callback(&self) -> Option<&CommentCallback> {
        self.comments.as_ref()
    }

    pub fn text_callback(&self) -> Option<&TextCallback> {
        self.text.as_ref()
    }

    /// Whether no callback has been set.
    pub fn is_empty(&self) -> bool {
        self.element.is_none() && self.comments.is_none() && self.text.is_none()
    }
}

impl fmt::Debug for ElementHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementHandlers")
            .field("element", &self.element.is_some())
            .field("comments", &self.comments.is_some())
            .field("text", &self.text.is_some())
            .finish()
    }
}

/// Handlers applied to whole-document events, with no selector.
#[derive(Clone, Default)]
pub struct DocumentHandlers {
    doctype: Option<DoctypeCallback>,
    comments: Option<CommentCallback>,
    text: Option<TextCallback>,
    end: Option<DocumentEndCallback>,
}

impl DocumentHandlers {
    /// Create an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn doctype<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Doctype<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.doctype = Some(Arc::new(handler));
        self
    }

    pub fn comments<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Comment<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.comments = Some(Arc::new(handler));
        self
    }

    pub fn text<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut TextChunk<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.text = Some(Arc::new(handler));
        self
    }

    /// Handle the end of the document (e.g. append trailing content).
    ///
    /// Never invoked for a transformation whose body is absent.
    pub fn end<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut DocumentEnd<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.end = Some(Arc::new(handler));
        self
    }

    pub fn doctype_callback(&self) -> Option<&DoctypeCallback> {
        self.doctype.as_ref()
    }

    pub fn comments_callback(&self) -> Option<&CommentCallback> {
        self.comments.as_ref()
    }

    pub fn text_callback(&self) -> Option<&TextCallback> {
        self.text.as_ref()
    }

    pub fn end_callback(&self) -> Option<&DocumentEndCallback> {
        self.end.as_ref()
    }

    /// Whether no callback has been set.
    pub fn is_empty(&self) -> bool {
        self.doctype.is_none() && self.comments.is_none() && self.text.is_none() && self.end.is_none()
    }
}

impl fmt::Debug for DocumentHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentHandlers")
            .field("doctype", &self.doctype.is_some())
            .field("comments", &self.comments.is_some())
            .field("text", &self.text.is_some())
            .field("end", &self.end.is_some())
            .finish()
    }
}

/// A selector paired with the handlers for elements it matches.
///
/// Immutable once appended to a rewriter.
#[derive(Debug, Clone)]
pub struct SelectorBinding {
    selector: String,
    handlers: ElementHandlers,
}

impl SelectorBinding {
    pub(crate) fn new(selector: String, handlers: ElementHandlers) -> Self {
        Self { selector, handlers }
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn handlers(&self) -> &ElementHandlers {
        &self.handlers
    }
}
