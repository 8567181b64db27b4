use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use dotenvy::dotenv;
use thiserror::Error;

use crate::adapters::legacy::{LegacyOptions, DEFAULT_FLUSH_TIMEOUT};
use crate::config::{with_enable_esi_tags, HtmlRewriter};
use crate::engine::{Engine, FileLoader, NativeEngine};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{key} must be {expected}, got `{value}`")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Rewriter settings loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriterSettings {
    /// `HTML_REWRITER_FLUSH_TIMEOUT_MS`, default 1000
    pub flush_timeout: Duration,
    /// `HTML_REWRITER_ENABLE_ESI_TAGS`, default false
    pub enable_esi_tags: bool,
    /// `HTML_REWRITER_MODULE_PATH`: load the engine payload from this file
    /// instead of the built-in one
    pub module_path: Option<PathBuf>,
}

impl Default for RewriterSettings {
    fn default() -> Self {
        Self {
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            enable_esi_tags: false,
            module_path: None,
        }
    }
}

impl RewriterSettings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let mut settings = Self::default();

        if let Some(value) = lookup("HTML_REWRITER_FLUSH_TIMEOUT_MS") {
            let millis = value.trim().parse::<u64>().map_err(|_| SettingsError::Invalid {
                key: "HTML_REWRITER_FLUSH_TIMEOUT_MS",
                expected: "a number of milliseconds",
                value: value.clone(),
            })?;
            settings.flush_timeout = Duration::from_millis(millis);
        }

        if let Some(value) = lookup("HTML_REWRITER_ENABLE_ESI_TAGS") {
            settings.enable_esi_tags = parse_flag(&value).ok_or_else(|| SettingsError::Invalid {
                key: "HTML_REWRITER_ENABLE_ESI_TAGS",
                expected: "a boolean",
                value: value.clone(),
            })?;
        }

        settings.module_path = lookup("HTML_REWRITER_MODULE_PATH")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(settings)
    }

    pub fn legacy_options(&self) -> LegacyOptions {
        LegacyOptions::default().with_flush_timeout(self.flush_timeout)
    }

    /// Engine selected by these settings.
    ///
    /// Without a module path this is the shared process-wide engine; with
    /// one, the process-wide engine loaded from that path.
    pub fn engine(&self) -> Engine {
        match &self.module_path {
            Some(path) => file_engine(path),
            None => Engine::native(),
        }
    }

    /// A rewriter with no handlers, configured by these settings.
    pub fn rewriter(&self) -> HtmlRewriter {
        let rewriter = HtmlRewriter::with_engine(self.engine());
        if self.enable_esi_tags {
            with_enable_esi_tags(rewriter)
        } else {
            rewriter
        }
    }
}

static FILE_ENGINES: OnceLock<Mutex<HashMap<PathBuf, Engine>>> = OnceLock::new();

/// One engine, and so one readiness gate, per payload path.
fn file_engine(path: &Path) -> Engine {
    let mut engines = FILE_ENGINES
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    engines
        .entry(path.to_path_buf())
        .or_insert_with(|| Engine::new(NativeEngine::new(), FileLoader::new(path)))
        .clone()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
