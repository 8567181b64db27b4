//! Pull-based transform over a response body or any byte stream.

use bytes::Bytes;
use futures::Stream;
use http::header::CONTENT_LENGTH;
use http::Response;
use tracing::debug;

use super::RewrittenStream;
use crate::config::HtmlRewriter;
use crate::error::BoxError;

impl HtmlRewriter {
    /// Rewrite a response, preserving its status and headers.
    ///
    /// `Content-Length` is removed since the rewritten length is unknown. A
    /// response without a body passes through with an empty body and no
    /// session is opened.
    ///
    /// The returned body is not `Send`: engine sessions run on the task that
    /// polls them. Consume it on that task (or a `LocalSet`); it cannot be
    /// handed to `tokio::spawn` or used directly as a hyper/axum body.
    pub fn transform<S, E>(&self, response: Response<Option<S>>) -> Response<RewrittenStream>
    where
        S: Stream<Item = Result<Bytes, E>> + 'static,
        E: Into<BoxError> + 'static,
    {
        let (mut parts, body) = response.into_parts();

        let Some(body) = body else {
            debug!(status = %parts.status, "response has no body, nothing to rewrite");
            return Response::from_parts(parts, RewrittenStream::empty());
        };

        parts.headers.remove(CONTENT_LENGTH);
        Response::from_parts(parts, self.transform_stream(body))
    }

    /// Rewrite a byte stream.
    ///
    /// Nothing is read from `body` until the returned stream is polled. The
    /// engine's session is released when the stream ends, fails, or is
    /// dropped.
    pub fn transform_stream<S, E>(&self, body: S) -> RewrittenStream
    where
        S: Stream<Item = Result<Bytes, E>> + 'static,
        E: Into<BoxError> + 'static,
    {
        RewrittenStream::new(self.clone(), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::error::RewriterError;
    use crate::handlers::ElementHandlers;
    use crate::testing::{ScriptedEngine, ScriptedLoader};
    use futures::StreamExt;
    use http::header::CONTENT_TYPE;
    use http::StatusCode;
    use std::convert::Infallible;

    type Body = futures::stream::Iter<std::vec::IntoIter<Result<Bytes, Infallible>>>;

    fn body(parts: &[&'static str]) -> Body {
        futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    fn rewriter(scripted: &ScriptedEngine) -> HtmlRewriter {
        HtmlRewriter::with_engine(Engine::new(scripted.clone(), ScriptedLoader::new()))
    }

    #[tokio::test]
    async fn preserves_metadata_and_strips_content_length() {
        let scripted = ScriptedEngine::new();
        let response = Response::builder()
            .status(StatusCode::CREATED)
            .header(CONTENT_TYPE, "text/html")
            .header(CONTENT_LENGTH, "9")
            .body(Some(body(&["<p>", "hi</p>"])))
            .unwrap();

        let rewritten = rewriter(&scripted).transform(response);
        assert_eq!(rewritten.status(), StatusCode::CREATED);
        assert_eq!(rewritten.headers()[CONTENT_TYPE], "text/html");
        assert!(rewritten.headers().get(CONTENT_LENGTH).is_none());

        let chunks: Vec<_> = rewritten
            .into_body()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["<p>", "hi</p>"]);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn absent_body_opens_no_session() {
        let scripted = ScriptedEngine::new();
        let response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(CONTENT_LENGTH, "0")
            .body(None::<Body>)
            .unwrap();

        let rewritten = rewriter(&scripted).transform(response);
        assert_eq!(rewritten.status(), StatusCode::NO_CONTENT);
        assert_eq!(rewritten.headers()[CONTENT_LENGTH], "0");

        let chunks: Vec<_> = rewritten.into_body().collect().await;
        assert!(chunks.is_empty());
        assert_eq!(scripted.instantiated(), 0);
    }

    #[tokio::test]
    async fn nothing_is_pulled_until_polled() {
        let scripted = ScriptedEngine::new();
        let stream = rewriter(&scripted).transform_stream(body(&["<p>"]));

        tokio::task::yield_now().await;
        assert_eq!(scripted.instantiated(), 0);
        drop(stream);
        assert_eq!(scripted.freed(), 0);
    }

    #[tokio::test]
    async fn waits_for_the_engine_before_opening_a_session() {
        let scripted = ScriptedEngine::new();
        let rewriter = HtmlRewriter::with_engine(Engine::new(
            scripted.clone(),
            ScriptedLoader::new().with_delay(std::time::Duration::from_secs(3600)),
        ));

        let mut stream = rewriter.transform_stream(body(&["<p>"]));
        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());
        assert_eq!(scripted.instantiated(), 0);
    }

    #[tokio::test]
    async fn bind_error_fails_the_output() {
        let scripted = ScriptedEngine::new().rejecting_selector("p[");
        let rewriter = rewriter(&scripted).on("p[", ElementHandlers::new());

        let mut stream = rewriter.transform_stream(body(&["<p>"]));
        let err = stream.next().await.unwrap().unwrap_err();

        assert!(matches!(err, RewriterError::EngineBind { .. }));
        assert!(stream.next().await.is_none());
        assert_eq!(scripted.writes(), 0);
        assert_eq!(scripted.freed(), 1);
    }

    #[tokio::test]
    async fn one_configuration_serves_concurrent_transforms() {
        let scripted = ScriptedEngine::new();
        let rewriter = rewriter(&scripted);

        let first = rewriter.transform_stream(body(&["a", "b"])).map(|c| c.unwrap()).collect::<Vec<_>>();
        let second = rewriter.transform_stream(body(&["c"])).map(|c| c.unwrap()).collect::<Vec<_>>();
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(second, vec!["c"]);
        assert_eq!(scripted.instantiated(), 2);
        assert_eq!(scripted.freed(), 2);
    }
}
