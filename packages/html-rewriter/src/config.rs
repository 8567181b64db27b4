//! Reusable rewriter configuration.

use std::fmt;

use crate::engine::Engine;
use crate::handlers::{DocumentHandlers, ElementHandlers, SelectorBinding};

/// Handler registry plus engine options, reusable across transformations.
///
/// Constructing one starts loading the engine in the background. Handlers
/// are registered with [`on`](Self::on) and [`on_document`](Self::on_document)
/// before any transformation; each adapter call then opens its own session
/// from the same bindings.
///
/// # Example
///
/// ```rust,ignore
/// use html_rewriter::{ElementHandlers, HtmlRewriter};
/// use lol_html::html_content::ContentType;
///
/// let rewriter = HtmlRewriter::new().on(
///     "p",
///     ElementHandlers::new().element(|el| {
///         el.append("!", ContentType::Text);
///         Ok(())
///     }),
/// );
///
/// let body = rewriter.transform_stream(source);
/// ```
#[derive(Clone)]
pub struct HtmlRewriter {
    engine: Engine,
    element_bindings: Vec<SelectorBinding>,
    document_bindings: Vec<DocumentHandlers>,
    enable_esi_tags: bool,
}

impl Default for HtmlRewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl HtmlRewriter {
    /// Create a rewriter backed by the process-wide `lol_html` engine.
    pub fn new() -> Self {
        Self::with_engine(Engine::native())
    }

    /// Create a rewriter backed by a specific engine.
    pub fn with_engine(engine: Engine) -> Self {
        engine.trigger_load();
        Self {
            engine,
            element_bindings: Vec::new(),
            document_bindings: Vec::new(),
            enable_esi_tags: false,
        }
    }

    /// Register handlers for elements matching `selector`.
    ///
    /// The selector is validated by the engine when a session binds it.
    pub fn on(mut self, selector: impl Into<String>, handlers: ElementHandlers) -> Self {
        self.element_bindings
            .push(SelectorBinding::new(selector.into(), handlers));
        self
    }

    /// Register whole-document handlers.
    pub fn on_document(mut self, handlers: DocumentHandlers) -> Self {
        self.document_bindings.push(handlers);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn element_bindings(&self) -> &[SelectorBinding] {
        &self.element_bindings
    }

    pub fn document_bindings(&self) -> &[DocumentHandlers] {
        &self.document_bindings
    }

    pub fn esi_tags_enabled(&self) -> bool {
        self.enable_esi_tags
    }
}

/// Enable experimental `<esi:*>` tag parsing on a rewriter.
///
/// Not a constructor option: only engines that understand ESI honor it.
pub fn with_enable_esi_tags(mut rewriter: HtmlRewriter) -> HtmlRewriter {
    rewriter.enable_esi_tags = true;
    rewriter
}

impl fmt::Debug for HtmlRewriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtmlRewriter")
            .field("engine", &self.engine)
            .field("element_bindings", &self.element_bindings)
            .field("document_bindings", &self.document_bindings.len())
            .field("enable_esi_tags", &self.enable_esi_tags)
            .finish()
    }
}
