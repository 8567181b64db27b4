//! Push-style transform for callers that feed chunks themselves.
//!
//! The caller pushes chunks through [`LegacyTransform::transform`] and reads
//! rewritten bytes from [`LegacyOutput`]. Since an engine may emit after its
//! calls return, completion is gated by a pending-emission counter: it is
//! incremented per submitted chunk and decremented per emission, and
//! [`flush`](LegacyTransform::flush) waits for it to drain (or for the flush
//! timeout) before closing the output.
//!
//! The counter assumes one emission per submitted chunk. Engines that emit
//! more often drive it below zero, which counts as drained; engines that emit
//! less often hold completion until the timeout.

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::config::HtmlRewriter;
use crate::engine::OutputSink;
use crate::error::{BoxError, Result, RewriterError};
use crate::session::RewriterSession;

/// Flush timeout used when none is configured.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyOptions {
    /// Upper bound on how long `flush` waits for outstanding emissions.
    #[serde(rename = "flush_timeout_ms", with = "millis")]
    pub flush_timeout: Duration,
}

impl Default for LegacyOptions {
    fn default() -> Self {
        Self {
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl LegacyOptions {
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// How a successful flush completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every submitted chunk was matched by an emission.
    Drained,
    /// The flush timeout elapsed first; output was closed anyway.
    TimedOut { outstanding: i64 },
}

// =============================================================================
// Emission barrier
// =============================================================================

struct EmissionBarrier {
    pending: AtomicI64,
    notify: Notify,
    output: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl EmissionBarrier {
    fn new(output: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            pending: AtomicI64::new(0),
            notify: Notify::new(),
            output: Mutex::new(Some(output)),
        }
    }

    fn output(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Bytes>>> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outstanding(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    fn submitted(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn emitted(&self, chunk: &[u8]) {
        if !chunk.is_empty() {
            match self.output().as_ref() {
                Some(tx) => {
                    let _ = tx.send(Bytes::copy_from_slice(chunk));
                }
                None => warn!(bytes = chunk.len(), "emission after output completed, dropping"),
            }
        }

        let remaining = self.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining < 0 {
            trace!(remaining, "more emissions than submitted chunks");
        }
        if remaining <= 0 {
            self.notify.notify_waiters();
        }
    }

    async fn drained(&self, timeout: Duration) -> FlushOutcome {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            // Register before checking so a decrement in between is not missed
            let notified = self.notify.notified();
            if self.outstanding() <= 0 {
                return FlushOutcome::Drained;
            }

            tokio::select! {
                _ = notified => {}
                _ = &mut deadline => {
                    let outstanding = self.outstanding();
                    warn!(outstanding, ?timeout, "flush timed out waiting for emissions, completing output");
                    return FlushOutcome::TimedOut { outstanding };
                }
            }
        }
    }

    fn complete(&self) {
        self.output().take();
    }
}

// =============================================================================
// Transform and output
// =============================================================================

/// Writable half of a legacy transform.
///
/// Dropping it without flushing releases the session and ends the output.
pub struct LegacyTransform {
    session: RewriterSession,
    barrier: Arc<EmissionBarrier>,
    flush_timeout: Duration,
}

impl LegacyTransform {
    /// Submit one chunk to the engine.
    pub async fn transform(&mut self, chunk: Bytes) -> Result<()> {
        self.barrier.submitted();
        self.session.write(chunk).await
    }

    /// Submitted chunks not yet matched by an emission.
    pub fn outstanding(&self) -> i64 {
        self.barrier.outstanding()
    }

    /// Finish the engine, release the session, and complete the output once
    /// outstanding emissions drain or the flush timeout elapses.
    ///
    /// An engine finish failure completes the output immediately and is
    /// returned without waiting.
    pub async fn flush(mut self) -> Result<FlushOutcome> {
        let finished = self.session.finish().await;
        self.session.release();

        if let Err(err) = finished {
            self.barrier.complete();
            return Err(err);
        }

        let outcome = self.barrier.drained(self.flush_timeout).await;
        self.barrier.complete();
        debug!(session = self.session.id(), ?outcome, "legacy transform flushed");
        Ok(outcome)
    }
}

/// Readable half of a legacy transform.
pub struct LegacyOutput {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Stream for LegacyOutput {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

impl HtmlRewriter {
    /// Open a push-style transform.
    ///
    /// Waits for the engine, then opens the session immediately; a binding
    /// failure is returned here.
    pub async fn transform_legacy(&self, options: LegacyOptions) -> Result<(LegacyTransform, LegacyOutput)> {
        let ready = self.engine().gate().wait_ready().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let barrier = Arc::new(EmissionBarrier::new(tx));
        let sink: OutputSink = {
            let barrier = Arc::clone(&barrier);
            Arc::new(move |chunk: &[u8]| barrier.emitted(chunk))
        };
        let session = RewriterSession::open(ready, self, sink)?;

        Ok((
            LegacyTransform {
                session,
                barrier,
                flush_timeout: options.flush_timeout,
            },
            LegacyOutput { rx },
        ))
    }

    /// Feed `source` through a legacy transform while forwarding its output
    /// to `next`, then close `next`.
    pub async fn pipe_legacy<S, E, W>(&self, source: S, mut next: W, options: LegacyOptions) -> Result<FlushOutcome>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<BoxError>,
        W: Sink<Bytes> + Unpin,
        W::Error: Into<BoxError>,
    {
        let (mut transform, mut output) = self.transform_legacy(options).await?;

        let feed = async move {
            futures::pin_mut!(source);
            while let Some(chunk) = source.next().await {
                let chunk = chunk.map_err(|err| RewriterError::Upstream(err.into()))?;
                transform.transform(chunk).await?;
            }
            transform.flush().await
        };

        let forward = async {
            while let Some(chunk) = output.next().await {
                next.send(chunk)
                    .await
                    .map_err(|err| RewriterError::Downstream(err.into()))?;
            }
            next.close()
                .await
                .map_err(|err| RewriterError::Downstream(err.into()))
        };

        let (outcome, ()) = futures::future::try_join(feed, forward).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::handlers::ElementHandlers;
    use crate::testing::{Emission, ScriptedEngine, ScriptedLoader};
    use std::convert::Infallible;

    fn rewriter(scripted: &ScriptedEngine) -> HtmlRewriter {
        HtmlRewriter::with_engine(Engine::new(scripted.clone(), ScriptedLoader::new()))
    }

    async fn push_all(transform: &mut LegacyTransform, parts: &[&'static str]) {
        for part in parts {
            transform.transform(Bytes::from_static(part.as_bytes())).await.unwrap();
        }
    }

    #[tokio::test]
    async fn synchronous_emissions_drain_immediately() {
        let scripted = ScriptedEngine::new();
        let (mut transform, output) = rewriter(&scripted)
            .transform_legacy(LegacyOptions::default())
            .await
            .unwrap();

        push_all(&mut transform, &["a", "b"]).await;
        assert_eq!(transform.outstanding(), 0);

        assert_eq!(transform.flush().await.unwrap(), FlushOutcome::Drained);
        assert_eq!(output.collect::<Vec<_>>().await, vec!["a", "b"]);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_emissions_complete_after_the_last_one() {
        let delay = Duration::from_millis(50);
        let scripted = ScriptedEngine::new().with_emission(Emission::Deferred(delay));
        let (mut transform, output) = rewriter(&scripted)
            .transform_legacy(LegacyOptions::default())
            .await
            .unwrap();

        push_all(&mut transform, &["a", "b", "c"]).await;
        assert_eq!(transform.outstanding(), 3);

        let started = tokio::time::Instant::now();
        assert_eq!(transform.flush().await.unwrap(), FlushOutcome::Drained);
        assert!(started.elapsed() < DEFAULT_FLUSH_TIMEOUT);

        // Deferred tasks share one deadline, so arrival order is unspecified
        let mut chunks = output.collect::<Vec<_>>().await;
        chunks.sort();
        assert_eq!(chunks, vec!["a", "b", "c"]);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn withheld_emission_times_out_and_completes_output() {
        let timeout = Duration::from_millis(250);
        let scripted = ScriptedEngine::new().with_emission(Emission::WithholdLast);
        let (mut transform, output) = rewriter(&scripted)
            .transform_legacy(LegacyOptions::default().with_flush_timeout(timeout))
            .await
            .unwrap();

        push_all(&mut transform, &["a", "b"]).await;

        let started = tokio::time::Instant::now();
        let outcome = transform.flush().await.unwrap();
        assert_eq!(outcome, FlushOutcome::TimedOut { outstanding: 1 });
        assert!(started.elapsed() >= timeout);

        assert_eq!(output.collect::<Vec<_>>().await, vec!["a"]);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn empty_emissions_count_but_are_not_forwarded() {
        let scripted = ScriptedEngine::new().with_emission(Emission::EmptyThenEcho);
        let (mut transform, output) = rewriter(&scripted)
            .transform_legacy(LegacyOptions::default())
            .await
            .unwrap();

        push_all(&mut transform, &["a"]).await;
        // Two emissions for one chunk
        assert_eq!(transform.outstanding(), -1);

        assert_eq!(transform.flush().await.unwrap(), FlushOutcome::Drained);
        assert_eq!(output.collect::<Vec<_>>().await, vec!["a"]);
    }

    #[tokio::test]
    async fn finish_failure_completes_output_and_releases() {
        let scripted = ScriptedEngine::new().failing_finish();
        let (mut transform, output) = rewriter(&scripted)
            .transform_legacy(LegacyOptions::default())
            .await
            .unwrap();

        push_all(&mut transform, &["a"]).await;
        let err = transform.flush().await.unwrap_err();

        assert!(matches!(err, RewriterError::EngineFinish(_)));
        assert_eq!(output.collect::<Vec<_>>().await, vec!["a"]);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn write_failure_is_reported_and_drop_releases() {
        let scripted = ScriptedEngine::new().failing_write_at(0);
        let (mut transform, output) = rewriter(&scripted)
            .transform_legacy(LegacyOptions::default())
            .await
            .unwrap();

        let err = transform.transform(Bytes::from_static(b"a")).await.unwrap_err();
        assert!(matches!(err, RewriterError::EngineWrite(_)));

        drop(transform);
        assert_eq!(scripted.freed(), 1);
        assert!(output.collect::<Vec<_>>().await.is_empty());
    }

    #[tokio::test]
    async fn bind_failure_is_returned_on_open() {
        let scripted = ScriptedEngine::new().rejecting_selector("bad");
        let result = rewriter(&scripted)
            .on("bad", ElementHandlers::new())
            .transform_legacy(LegacyOptions::default())
            .await;

        assert!(matches!(result, Err(RewriterError::EngineBind { .. })));
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pipe_legacy_forwards_deferred_output() {
        let scripted = ScriptedEngine::new().with_emission(Emission::Deferred(Duration::from_millis(10)));
        let source = futures::stream::iter(vec![
            Ok::<_, Infallible>(Bytes::from_static(b"<p>")),
            Ok(Bytes::from_static(b"</p>")),
        ]);
        let (tx, rx) = futures::channel::mpsc::unbounded::<Bytes>();

        let outcome = rewriter(&scripted)
            .pipe_legacy(source, tx, LegacyOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome, FlushOutcome::Drained);
        let mut chunks = rx.collect::<Vec<_>>().await;
        chunks.sort();
        assert_eq!(chunks, vec!["</p>", "<p>"]);
        assert_eq!(scripted.freed(), 1);
    }

    #[test]
    fn options_deserialize_from_millis() {
        let options: LegacyOptions = serde_json::from_str(r#"{"flush_timeout_ms": 250}"#).unwrap();
        assert_eq!(options.flush_timeout, Duration::from_millis(250));

        let defaults: LegacyOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, LegacyOptions::default());
    }
}
