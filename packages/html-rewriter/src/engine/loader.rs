//! Acquisition of the engine module payload.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::LoadError;

/// A module payload with its declared content type.
#[derive(Debug, Clone)]
pub struct ModulePayload {
    bytes: Bytes,
    content_type: Option<String>,
}

impl ModulePayload {
    /// Create an unlabelled payload.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Relabel the payload unless it already declares `expected`.
    ///
    /// Payload sources frequently mislabel module binaries (generic
    /// `application/octet-stream`, `text/plain`), so a mismatch is corrected
    /// rather than rejected. Parameters such as `; charset=..` are kept when
    /// the essence already matches.
    pub fn ensure_content_type(mut self, expected: &str) -> Self {
        let matches = self
            .content_type
            .as_deref()
            .map(|declared| declared.trim().to_ascii_lowercase().starts_with(expected))
            .unwrap_or(false);

        if !matches {
            debug!(
                declared = ?self.content_type,
                expected,
                "relabelling engine module payload"
            );
            self.content_type = Some(expected.to_string());
        }
        self
    }
}

/// Source of the engine module payload.
#[async_trait]
pub trait ModuleLoader: Send + Sync + 'static {
    async fn load(&self) -> Result<ModulePayload, LoadError>;
}

/// Loader for engines compiled into the binary: yields an empty payload.
#[derive(Debug, Clone, Default)]
pub struct BuiltinLoader;

impl BuiltinLoader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModuleLoader for BuiltinLoader {
    async fn load(&self) -> Result<ModulePayload, LoadError> {
        Ok(ModulePayload::new(Bytes::new()))
    }
}

/// Loads the payload from a file on disk.
#[derive(Debug, Clone)]
pub struct FileLoader {
    path: PathBuf,
}

impl FileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ModuleLoader for FileLoader {
    async fn load(&self) -> Result<ModulePayload, LoadError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| LoadError::Read {
                path: self.path.clone(),
                source,
            })?;

        if bytes.is_empty() {
            return Err(LoadError::EmptyPayload);
        }

        debug!(path = %self.path.display(), bytes = bytes.len(), "read engine module");
        Ok(ModulePayload::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mislabelled_payload_is_relabelled() {
        let payload = ModulePayload::new(vec![0, 97, 115, 109])
            .with_content_type("application/octet-stream")
            .ensure_content_type("application/wasm");
        assert_eq!(payload.content_type(), Some("application/wasm"));
    }

    #[test]
    fn matching_label_keeps_parameters() {
        let payload = ModulePayload::new(vec![1])
            .with_content_type("application/wasm; charset=binary")
            .ensure_content_type("application/wasm");
        assert_eq!(payload.content_type(), Some("application/wasm; charset=binary"));
    }

    #[test]
    fn unlabelled_payload_gets_expected_label() {
        let payload = ModulePayload::new(Bytes::new()).ensure_content_type("application/wasm");
        assert_eq!(payload.content_type(), Some("application/wasm"));
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn file_loader_reports_missing_file() {
        let loader = FileLoader::new("/definitely/not/here/engine.wasm");
        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
    }

    #[tokio::test]
    async fn file_loader_reads_payload() {
        let path = std::env::temp_dir().join(format!("html-rewriter-loader-{}.bin", std::process::id()));
        tokio::fs::write(&path, b"\0asm").await.unwrap();

        let payload = FileLoader::new(&path).load().await.unwrap();
        assert_eq!(payload.bytes().as_ref(), b"\0asm");

        tokio::fs::remove_file(&path).await.unwrap();
    }
}
