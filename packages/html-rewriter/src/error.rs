//! Typed errors for the rewriter adapters.
//!
//! Uses `thiserror` for library errors (not `anyhow`). Every adapter reports
//! failures as [`RewriterError`]; engine payload loading has its own
//! [`LoadError`] which is shared between every waiter of a failed attempt.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error used for upstream, downstream and engine-reported failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while driving a rewriting session.
#[derive(Debug, Error)]
pub enum RewriterError {
    /// The engine module could not be loaded or initialized.
    ///
    /// Retryable: the next `HtmlRewriter` construction starts a new attempt.
    #[error("engine failed to load: {0}")]
    EngineLoad(#[source] Arc<LoadError>),

    /// A selector or handler set was rejected while binding it to the engine.
    #[error("invalid handler binding for selector `{selector}`: {reason}")]
    EngineBind { selector: String, reason: String },

    /// The engine rejected an input chunk (malformed input or a handler error).
    #[error("engine rejected input: {0}")]
    EngineWrite(#[source] BoxError),

    /// The engine failed while flushing end-of-input.
    #[error("engine failed to finish: {0}")]
    EngineFinish(#[source] BoxError),

    /// An operation was invoked on a released or failed session.
    #[error("session misuse: {0}")]
    SessionMisuse(&'static str),

    /// The byte source feeding the adapter failed.
    #[error("upstream error: {0}")]
    Upstream(#[source] BoxError),

    /// The sink receiving rewritten bytes failed.
    #[error("downstream error: {0}")]
    Downstream(#[source] BoxError),
}

impl RewriterError {
    /// Whether a fresh `HtmlRewriter` construction may clear this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RewriterError::EngineLoad(_))
    }
}

/// Errors raised while acquiring or initializing the engine module.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Reading the module payload from disk failed.
    #[error("failed to read engine module from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The payload was present but had no content.
    #[error("engine module payload is empty")]
    EmptyPayload,

    /// The module's initialization entry point failed.
    #[error("engine initialization failed: {0}")]
    Initialize(String),

    /// The load task ended without reporting an outcome.
    #[error("engine load was abandoned before completing")]
    Abandoned,
}

/// Result type alias for rewriter operations.
pub type Result<T> = std::result::Result<T, RewriterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_load_failures_are_retryable() {
        let load = RewriterError::EngineLoad(Arc::new(LoadError::EmptyPayload));
        assert!(load.is_retryable());

        let misuse = RewriterError::SessionMisuse("write after release");
        assert!(!misuse.is_retryable());
    }

    #[test]
    fn bind_error_names_the_selector() {
        let err = RewriterError::EngineBind {
            selector: "p[".into(),
            reason: "unexpected end of input".into(),
        };
        assert!(err.to_string().contains("`p[`"));
    }
}
