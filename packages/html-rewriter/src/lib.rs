//! Streaming adapters around an incremental HTML rewriting engine.
//!
//! An [`HtmlRewriter`] collects selector-scoped and document-wide handlers
//! once, then rewrites any number of documents through one of three
//! adapters. Each transformation opens its own engine session and releases
//! it exactly once, whether it succeeds, fails, or is dropped mid-stream.
//!
//! - Pull: [`HtmlRewriter::transform`] / [`HtmlRewriter::transform_stream`]
//! - Pipe: [`HtmlRewriter::pipe_through`], [`HtmlRewriter::pipe_to`], [`HtmlRewriter::pipe_io`]
//! - Push: [`HtmlRewriter::transform_legacy`], [`HtmlRewriter::pipe_legacy`]
//!
//! The engine module is loaded asynchronously the first time a rewriter is
//! constructed; adapters wait on its readiness gate before opening sessions.
//!
//! # Example
//!
//! ```rust,ignore
//! use html_rewriter::{ElementHandlers, HtmlRewriter};
//! use lol_html::html_content::ContentType;
//!
//! let rewriter = HtmlRewriter::new().on(
//!     "a[href]",
//!     ElementHandlers::new().element(|el| {
//!         el.set_attribute("rel", "noopener")?;
//!         Ok(())
//!     }),
//! );
//!
//! let mut out = Vec::new();
//! rewriter.pipe_io(&b"<a href=\"/\">home</a>"[..], &mut out).await?;
//! ```

pub mod adapters;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod rules;
pub mod session;
pub mod settings;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adapters::legacy::{FlushOutcome, LegacyOptions, LegacyOutput, LegacyTransform, DEFAULT_FLUSH_TIMEOUT};
pub use adapters::pipe::PipeSummary;
pub use adapters::RewrittenStream;
pub use config::{with_enable_esi_tags, HtmlRewriter};
pub use engine::{Engine, EngineModule, EngineSession, ModuleLoader, NativeEngine};
pub use error::{LoadError, Result, RewriterError};
pub use gate::{EngineInitState, EngineReady, ReadinessGate};
pub use handlers::{DocumentHandlers, ElementHandlers};
pub use rules::{RuleError, RuleSet};
pub use session::RewriterSession;
pub use settings::{RewriterSettings, SettingsError};
