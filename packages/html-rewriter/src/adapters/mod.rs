//! Stream adapters driving one session per transformation.
//!
//! - [`transform`]: pull-based transform over a response body or byte stream
//! - [`pipe`]: source-to-sink pipes (`futures::Sink`, `AsyncRead`/`AsyncWrite`)
//! - [`legacy`]: push-style transform with a pending-emission completion barrier
//!
//! The pull and pipe adapters share [`RewrittenStream`]: a driver future that
//! owns the session, plus the channel the session's sink fills.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::LocalBoxFuture;
use futures::stream::{Stream, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::config::HtmlRewriter;
use crate::engine::OutputSink;
use crate::error::{BoxError, Result, RewriterError};
use crate::session::RewriterSession;

pub mod legacy;
pub mod pipe;
pub mod transform;

/// Rewritten output of one transformation.
///
/// The session is driven lazily: input is pulled and written only while the
/// consumer polls and no rewritten bytes are waiting, so an idle consumer
/// pauses the source. Dropping the stream cancels the transformation and
/// releases the session.
///
/// `!Send`, like the engine session it drives.
pub struct RewrittenStream {
    driver: Option<LocalBoxFuture<'static, Result<()>>>,
    output: mpsc::UnboundedReceiver<Bytes>,
}

impl RewrittenStream {
    pub(crate) fn new<S, E>(rewriter: HtmlRewriter, source: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + 'static,
        E: Into<BoxError> + 'static,
    {
        let (sink, output) = channel_sink();
        Self {
            driver: Some(drive(rewriter, source, sink).boxed_local()),
            output,
        }
    }

    /// A finished stream that never opens a session.
    pub fn empty() -> Self {
        let (_, mut output) = mpsc::unbounded_channel();
        output.close();
        Self {
            driver: None,
            output,
        }
    }

    /// Whether the transformation has completed (successfully or not).
    pub fn is_terminated(&self) -> bool {
        self.driver.is_none()
    }
}

impl Stream for RewrittenStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            // Hand out rewritten bytes before pulling more input
            match this.output.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                Poll::Ready(None) if this.driver.is_none() => return Poll::Ready(None),
                _ => {}
            }

            let Some(driver) = this.driver.as_mut() else {
                return Poll::Ready(None);
            };

            match driver.poll_unpin(cx) {
                Poll::Ready(Ok(())) => {
                    this.driver = None;
                    // Emissions after release are impossible; drain what is buffered
                    this.output.close();
                }
                Poll::Ready(Err(err)) => {
                    this.driver = None;
                    this.output.close();
                    while this.output.try_recv().is_ok() {}
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Sink forwarding non-empty emissions into a channel.
pub(crate) fn channel_sink() -> (OutputSink, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: OutputSink = std::sync::Arc::new(move |chunk: &[u8]| {
        if !chunk.is_empty() {
            // Receiver gone means the consumer cancelled; the driver is being dropped too
            let _ = tx.send(Bytes::copy_from_slice(chunk));
        }
    });
    (sink, rx)
}

async fn drive<S, E>(rewriter: HtmlRewriter, source: S, sink: OutputSink) -> Result<()>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<BoxError>,
{
    let ready = rewriter.engine().gate().wait_ready().await?;
    let mut session = RewriterSession::open(ready, &rewriter, sink)?;

    let outcome = feed(&mut session, source).await;
    session.release();
    outcome
}

/// Write every source chunk, one at a time, then finish.
async fn feed<S, E>(session: &mut RewriterSession, source: S) -> Result<()>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<BoxError>,
{
    futures::pin_mut!(source);
    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(|err| RewriterError::Upstream(err.into()))?;
        session.write(chunk).await?;
        // Let the consumer take this chunk's output before the next pull
        tokio::task::yield_now().await;
    }
    session.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::testing::{Emission, ScriptedEngine, ScriptedLoader};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn rewriter(scripted: &ScriptedEngine) -> HtmlRewriter {
        HtmlRewriter::with_engine(Engine::new(scripted.clone(), ScriptedLoader::new()))
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> {
        futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(stream: RewrittenStream) -> (Vec<Bytes>, Option<RewriterError>) {
        let mut out = Vec::new();
        let mut error = None;
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => out.push(chunk),
                Err(err) => error = Some(err),
            }
        }
        (out, error)
    }

    #[tokio::test]
    async fn success_releases_once() {
        let scripted = ScriptedEngine::new().with_trailer("</end>");
        let (out, error) = collect(RewrittenStream::new(rewriter(&scripted), chunks(&["a", "b"]))).await;

        assert!(error.is_none());
        assert_eq!(out, vec!["a", "b", "</end>"]);
        assert_eq!(scripted.instantiated(), 1);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn write_error_fails_output_and_releases_once() {
        let scripted = ScriptedEngine::new().failing_write_at(1);
        let (_, error) = collect(RewrittenStream::new(rewriter(&scripted), chunks(&["a", "b", "c"]))).await;

        assert!(matches!(error, Some(RewriterError::EngineWrite(_))));
        assert_eq!(scripted.writes(), 2);
        assert_eq!(scripted.finishes(), 0);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn finish_error_fails_output_and_releases_once() {
        let scripted = ScriptedEngine::new().failing_finish();
        let (_, error) = collect(RewrittenStream::new(rewriter(&scripted), chunks(&["a"]))).await;

        assert!(matches!(error, Some(RewriterError::EngineFinish(_))));
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn upstream_error_aborts_and_releases_once() {
        let scripted = ScriptedEngine::new();
        let source = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"never")),
        ]);
        let (_, error) = collect(RewrittenStream::new(rewriter(&scripted), source)).await;

        assert!(matches!(error, Some(RewriterError::Upstream(_))));
        assert_eq!(scripted.writes(), 1);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn dropping_the_output_releases_once() {
        let scripted = ScriptedEngine::new();
        let source = chunks(&["a"]).chain(futures::stream::pending());
        let mut stream = RewrittenStream::new(rewriter(&scripted), source);

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(scripted.freed(), 0);

        drop(stream);
        assert_eq!(scripted.instantiated(), 1);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn unread_output_pauses_the_source() {
        let scripted = ScriptedEngine::new();
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let source = chunks(&["a", "b", "c"]).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut stream = RewrittenStream::new(rewriter(&scripted), source);

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(pulled.load(Ordering::SeqCst), 1);

        let rest: Vec<_> = stream.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(rest, vec!["b", "c"]);
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_emissions_are_never_forwarded() {
        let scripted = ScriptedEngine::new().with_emission(Emission::EmptyThenEcho);
        let (out, _) = collect(RewrittenStream::new(rewriter(&scripted), chunks(&["x", "", "y"]))).await;

        assert!(out.iter().all(|chunk| !chunk.is_empty()));
        assert_eq!(out, vec!["x", "y"]);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_emission_landing_after_release_is_dropped() {
        let scripted = ScriptedEngine::new().with_emission(Emission::Deferred(Duration::from_millis(10)));
        let (out, error) = collect(RewrittenStream::new(rewriter(&scripted), chunks(&["a", "b"]))).await;

        // Paused time: both emissions are still scheduled when the session is released
        assert!(error.is_none());
        assert!(out.is_empty());
        assert_eq!(scripted.freed(), 1);

        // Late emissions hit a closed channel and are discarded
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn empty_stream_never_opens_a_session() {
        let (out, error) = collect(RewrittenStream::empty()).await;
        assert!(out.is_empty());
        assert!(error.is_none());
    }
}
