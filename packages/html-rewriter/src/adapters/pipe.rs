//! Source-to-sink pipes.
//!
//! [`pipe_through`](HtmlRewriter::pipe_through) is the composable form: it
//! returns the rewritten stream for the caller to forward. The other two
//! drive the whole pipe and report a [`PipeSummary`].

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::RewrittenStream;
use crate::config::HtmlRewriter;
use crate::error::{BoxError, Result, RewriterError};

/// What a completed pipe delivered downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeSummary {
    pub chunks: usize,
    pub bytes: u64,
}

impl PipeSummary {
    fn record(&mut self, chunk: &Bytes) {
        self.chunks += 1;
        self.bytes += chunk.len() as u64;
    }
}

impl HtmlRewriter {
    /// Rewrite `source` as a stream stage.
    ///
    /// The source is pulled only as the returned stream is consumed; a source
    /// error fails the output with [`RewriterError::Upstream`].
    pub fn pipe_through<S, E>(&self, source: S) -> RewrittenStream
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + 'static,
        E: Into<BoxError> + 'static,
    {
        RewrittenStream::new(self.clone(), source)
    }

    /// Rewrite `source` into `sink`, then close the sink.
    pub async fn pipe_to<S, E, W>(&self, source: S, mut sink: W) -> Result<PipeSummary>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + 'static,
        E: Into<BoxError> + 'static,
        W: Sink<Bytes> + Unpin,
        W::Error: Into<BoxError>,
    {
        let mut output = self.pipe_through(source);
        let mut summary = PipeSummary::default();

        while let Some(chunk) = output.next().await {
            let chunk = chunk?;
            summary.record(&chunk);
            sink.send(chunk)
                .await
                .map_err(|err| RewriterError::Downstream(err.into()))?;
        }
        sink.close()
            .await
            .map_err(|err| RewriterError::Downstream(err.into()))?;

        debug!(chunks = summary.chunks, bytes = summary.bytes, "pipe complete");
        Ok(summary)
    }

    /// Rewrite everything read from `reader` into `writer`.
    ///
    /// The writer is flushed and shut down once the rewrite finishes.
    pub async fn pipe_io<R, W>(&self, reader: R, mut writer: W) -> Result<PipeSummary>
    where
        R: AsyncRead + 'static,
        W: AsyncWrite + Unpin,
    {
        let mut output = self.pipe_through(ReaderStream::new(reader));
        let mut summary = PipeSummary::default();

        while let Some(chunk) = output.next().await {
            let chunk = chunk?;
            summary.record(&chunk);
            writer.write_all(&chunk).await.map_err(downstream)?;
        }
        writer.flush().await.map_err(downstream)?;
        writer.shutdown().await.map_err(downstream)?;

        debug!(chunks = summary.chunks, bytes = summary.bytes, "pipe complete");
        Ok(summary)
    }
}

fn downstream(err: std::io::Error) -> RewriterError {
    RewriterError::Downstream(Box::new(err))
}
