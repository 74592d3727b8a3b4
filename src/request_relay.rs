// Copyright 2024 All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Replays requests received over the tunnel against the local HTTP
//! service.
//!
//! The relay owns the read half of the socket. Every decoded request is
//! handled on its own task so that a slow local backend never stalls
//! reading of the next frame; the number of tasks in flight is bounded by
//! [`RelayConfig::max_in_flight`]. All responses go through the shared
//! [`FrameWriter`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::{Sink, Stream, StreamExt};
use http::HeaderMap;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Response;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{self, Message};
use tower_service::Service;
use tracing::{debug, error, info, warn};

use crate::body_fragments::BodyFragments;
use crate::chunk_codec::{self, Reassembler};
use crate::config::{RelayConfig, ResponseMode};
use crate::error::{BoxError, RelayError, ResponseError};
use crate::frame_writer::FrameWriter;
use crate::local_client::LocalHttp;
use crate::protocol::{
    to_ascii_json, BufferedResponse, InboundFrame, InboundRequest, StreamHead, StreamSignal,
};

/// Sent when even the fallback response cannot be encoded.
const MARSHAL_ERROR_FRAME: &str = r#"{"status":500,"body":"Tunnel marshal error"}"#;

/// The HTTP relay loop for one tunnel session.
pub struct RequestRelay<S> {
    client_id: Arc<str>,
    writer: Arc<FrameWriter<S>>,
    local: LocalHttp,
    config: RelayConfig,
    reassembler: Reassembler,
}

impl<S> RequestRelay<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Into<BoxError>,
{
    /// Creates a relay for the session `client_id`.
    pub fn new(
        client_id: impl Into<Arc<str>>,
        writer: Arc<FrameWriter<S>>,
        local: LocalHttp,
        config: RelayConfig,
    ) -> Self {
        let reassembler = Reassembler::new(config.reassembly_ttl);
        Self {
            client_id: client_id.into(),
            writer,
            local,
            config,
            reassembler,
        }
    }

    /// Reads frames from `inbound` until the socket closes or fails.
    ///
    /// When the loop ends the writer is closed, which cancels every request
    /// still in flight; this returns once they have all stopped.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Read`] if reading from the socket failed. A
    /// clean close by the broker is `Ok(())`.
    pub async fn run<R>(self, mut inbound: R) -> Result<(), RelayError>
    where
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        info!(
            client_id = %self.client_id,
            local = %self.local.endpoint(),
            mode = ?self.config.response_mode,
            "listening for relay requests"
        );
        let shutdown = self.writer.shutdown().clone();
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();

        let result = loop {
            while let Some(finished) = tasks.try_join_next() {
                log_task_exit(finished);
            }

            let next = tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("connection previously closed, exiting relay loop");
                    break Ok(());
                }
                next = inbound.next() => next,
            };
            let text = match next {
                None => {
                    info!("tunnel stream ended");
                    break Ok(());
                }
                Some(Err(err)) => {
                    warn!(error = %err, "tunnel read error");
                    break Err(RelayError::Read(err));
                }
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "tunnel closed by broker");
                    break Ok(());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    warn!(len = bytes.len(), "unexpected binary frame, ignoring");
                    continue;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            };

            let Some(request) = self.decode(&text) else {
                continue;
            };

            let permit = tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };
            let handler = self.handler();
            tasks.spawn(async move {
                let _permit = permit;
                handler.handle(request).await;
            });
        };

        self.writer.close().await;
        while let Some(finished) = tasks.join_next().await {
            log_task_exit(finished);
        }
        result
    }

    /// Decodes one text frame. Chunk envelopes are absorbed until their
    /// payload is complete. Malformed frames are logged and skipped.
    fn decode(&self, text: &str) -> Option<InboundRequest> {
        let frame = match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "invalid tunnel message, skipping");
                return None;
            }
        };
        match frame {
            InboundFrame::Request(request) => Some(request),
            InboundFrame::Chunk(envelope) => {
                let payload = self.reassembler.absorb(envelope)?;
                match serde_json::from_str(&payload) {
                    Ok(request) => Some(request),
                    Err(err) => {
                        warn!(error = %err, "invalid reassembled tunnel message, skipping");
                        None
                    }
                }
            }
        }
    }

    fn handler(&self) -> Handler<S> {
        Handler {
            client_id: Arc::clone(&self.client_id),
            writer: Arc::clone(&self.writer),
            local: self.local.clone(),
            response_mode: self.config.response_mode,
            fragment_size: self.config.fragment_size.get(),
            stream_increment: self.config.stream_increment.get(),
        }
    }
}

fn log_task_exit(finished: Result<(), tokio::task::JoinError>) {
    if let Err(err) = finished {
        if err.is_panic() {
            error!(error = %err, "request handler panicked");
        }
    }
}

/// Everything one request task needs.
struct Handler<S> {
    client_id: Arc<str>,
    writer: Arc<FrameWriter<S>>,
    local: LocalHttp,
    response_mode: ResponseMode,
    fragment_size: usize,
    stream_increment: usize,
}

impl<S> Handler<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Into<BoxError>,
{
    async fn handle(self, request: InboundRequest) {
        let shutdown = self.writer.shutdown().clone();
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!(method = %request.method, path = %request.path, "connection closed, abandoning request");
            }
            result = self.respond(&request) => {
                if let Err(err) = result {
                    warn!(
                        method = %request.method,
                        path = %request.path,
                        error = %err,
                        "failed to send response"
                    );
                }
            }
        }
    }

    async fn respond(&self, request: &InboundRequest) -> Result<(), ResponseError> {
        let local_request = match self.local.build_request(request) {
            Ok(local_request) => local_request,
            Err(err) => {
                warn!(error = %err, "failed to create local request");
                return self
                    .send_buffered(&BufferedResponse::synthetic(500, "Failed to create request"))
                    .await;
            }
        };
        let response = match self.local.clone().call(local_request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "local http error");
                return self
                    .send_buffered(&BufferedResponse::synthetic(502, "Bad Gateway"))
                    .await;
            }
        };
        match self.response_mode {
            ResponseMode::Buffered => self.respond_buffered(request, response).await,
            ResponseMode::Streamed => self.respond_streamed(request, response).await,
        }
    }

    async fn respond_buffered(
        &self,
        request: &InboundRequest,
        response: Response<Incoming>,
    ) -> Result<(), ResponseError> {
        let (parts, body) = response.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!(error = %err, "failed reading local response body");
                return self
                    .send_buffered(&BufferedResponse::synthetic(502, "Bad Gateway"))
                    .await;
            }
        };
        let response = BufferedResponse {
            status: parts.status.as_u16(),
            headers: first_values(&parts.headers),
            body: String::from_utf8_lossy(&body).into_owned(),
        };
        info!(
            method = %request.method,
            path = %request.path,
            status = response.status,
            bytes = body.len(),
            "relayed response"
        );
        self.send_buffered(&response).await
    }

    /// Writes `response` as one text frame, or as chunk envelopes when its
    /// encoding is larger than the fragment size. Every frame written,
    /// envelopes included, is at most the fragment size.
    async fn send_buffered(&self, response: &BufferedResponse) -> Result<(), ResponseError> {
        let json = match to_ascii_json(response) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "json marshal error");
                MARSHAL_ERROR_FRAME.to_owned()
            }
        };
        if json.len() <= self.fragment_size {
            self.writer.write_text(json).await?;
            return Ok(());
        }

        let frames =
            chunk_codec::split_frames(&self.client_id, json.as_bytes(), self.fragment_size)?;
        debug!(
            bytes = json.len(),
            chunks = frames.len(),
            "sending chunked response"
        );
        for frame in frames {
            self.writer.write_text(frame).await?;
        }
        Ok(())
    }

    async fn respond_streamed(
        &self,
        request: &InboundRequest,
        response: Response<Incoming>,
    ) -> Result<(), ResponseError> {
        let (parts, body) = response.into_parts();
        let head = StreamHead {
            status: parts.status.as_u16(),
            headers: first_values(&parts.headers),
            stream: true,
        };
        self.writer.write_text(serde_json::to_string(&head)?).await?;

        let mut fragments = Box::pin(BodyFragments::new(body, self.stream_increment));
        let mut sent = 0_usize;
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(bytes) => {
                    sent += bytes.len();
                    self.writer.write_binary(bytes).await?;
                }
                Err(err) => {
                    warn!(error = %err, sent, "local response body failed mid-stream");
                    let signal = StreamSignal::StreamError {
                        message: err.to_string(),
                    };
                    self.writer.write_text(serde_json::to_string(&signal)?).await?;
                    return Ok(());
                }
            }
        }
        self.writer
            .write_text(serde_json::to_string(&StreamSignal::EndOfStream)?)
            .await?;
        info!(
            method = %request.method,
            path = %request.path,
            status = head.status,
            bytes = sent,
            "streamed response"
        );
        Ok(())
    }
}

/// First value of every header, lossily decoded.
fn first_values(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .keys()
        .filter_map(|name| {
            let value = headers.get(name)?;
            Some((
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use core::convert::Infallible;
    use core::future::Future;
    use core::num::NonZeroUsize;
    use core::pin::Pin;
    use core::task::{Context, Poll};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use futures::channel::mpsc;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Request;
    use hyper_util::rt::TokioIo;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use super::*;
    use crate::chunk_codec::ChunkEnvelope;
    use crate::config::Endpoint;

    type Inbound = mpsc::UnboundedSender<Result<Message, tungstenite::Error>>;

    /// Serves every connection with `handler`.
    async fn local_server<F, Fut>(handler: F) -> Endpoint
    where
        F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler(req).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    async fn refused_endpoint() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Endpoint::new("127.0.0.1", port)
    }

    /// Forwards the first `allowed` frames to a channel, then fails every
    /// send.
    struct FailAfter {
        inner: mpsc::UnboundedSender<Message>,
        allowed: usize,
        attempts: Arc<AtomicUsize>,
    }

    impl Sink<Message> for FailAfter {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> io::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.allowed == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            self.allowed -= 1;
            self.inner
                .unbounded_send(item)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Harness {
        inbound: Option<Inbound>,
        outbound: mpsc::UnboundedReceiver<Message>,
        writer: Arc<FrameWriter<mpsc::UnboundedSender<Message>>>,
        run: JoinHandle<Result<(), RelayError>>,
    }

    impl Harness {
        fn start(endpoint: Endpoint, config: RelayConfig) -> Self {
            let (in_tx, in_rx) = mpsc::unbounded();
            let (out_tx, out_rx) = mpsc::unbounded();
            let writer = Arc::new(FrameWriter::new(out_tx));
            let relay = RequestRelay::new(
                "client-1",
                Arc::clone(&writer),
                LocalHttp::new(endpoint),
                config,
            );
            Self {
                inbound: Some(in_tx),
                outbound: out_rx,
                writer,
                run: tokio::spawn(relay.run(in_rx)),
            }
        }

        fn send(&self, message: Message) {
            self.inbound
                .as_ref()
                .unwrap()
                .unbounded_send(Ok(message))
                .unwrap();
        }

        fn send_request(&self, method: &str, path: &str) {
            let request = InboundRequest {
                method: method.to_owned(),
                path: path.to_owned(),
                ..InboundRequest::default()
            };
            self.send(Message::text(serde_json::to_string(&request).unwrap()));
        }

        async fn next(&mut self) -> Message {
            timeout(Duration::from_secs(5), self.outbound.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("outbound closed")
        }

        async fn next_response(&mut self) -> BufferedResponse {
            match self.next().await {
                Message::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected text frame, got {other:?}"),
            }
        }

        async fn finish(mut self) -> Result<(), RelayError> {
            self.inbound.take();
            timeout(Duration::from_secs(5), self.run)
                .await
                .expect("relay did not stop")
                .unwrap()
        }
    }

    fn ok_server() -> impl Fn(Request<Incoming>) -> core::future::Ready<Response<Full<Bytes>>>
           + Clone
           + Send
           + Sync
           + 'static {
        |_req| core::future::ready(Response::new(Full::new(Bytes::from_static(b"ok"))))
    }

    #[tokio::test]
    async fn relays_buffered_response() {
        let endpoint = local_server(ok_server()).await;
        let mut harness = Harness::start(endpoint, RelayConfig::default());
        harness.send(Message::text(
            r#"{"method":"GET","path":"/health","headers":{},"body":""}"#,
        ));
        let response = harness.next_response().await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "ok");
        assert_eq!(response.headers.get("content-length").map(String::as_str), Some("2"));
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn forwards_method_path_headers_and_body() {
        let endpoint = local_server(|req: Request<Incoming>| async move {
            let method = req.method().to_string();
            let path = req.uri().path().to_owned();
            let trace = req.headers()["x-trace"].to_str().unwrap().to_owned();
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let echo = format!("{method} {path} {trace} {}", String::from_utf8_lossy(&body));
            Response::new(Full::new(Bytes::from(echo)))
        })
        .await;
        let mut harness = Harness::start(endpoint, RelayConfig::default());
        harness.send(Message::text(
            r#"{"method":"POST","path":"/items","headers":{"X-Trace":"t1"},"body":"hello"}"#,
        ));
        let response = harness.next_response().await;
        assert_eq!(response.body, "POST /items t1 hello");
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_local_service_is_bad_gateway() {
        let mut harness = Harness::start(refused_endpoint().await, RelayConfig::default());
        harness.send_request("GET", "/health");
        let response = harness.next_response().await;
        assert_eq!(response.status, 502);
        assert_eq!(response.body, "Bad Gateway");

        // The relay keeps going after a failed request.
        harness.send_request("GET", "/again");
        assert_eq!(harness.next_response().await.status, 502);
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_request_is_internal_error() {
        let endpoint = local_server(ok_server()).await;
        let mut harness = Harness::start(endpoint, RelayConfig::default());
        harness.send_request("NOT A METHOD", "/");
        let response = harness.next_response().await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body, "Failed to create request");
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_and_binary_frames_are_skipped() {
        let endpoint = local_server(ok_server()).await;
        let mut harness = Harness::start(endpoint, RelayConfig::default());
        harness.send(Message::text("{not json"));
        harness.send(Message::binary(Bytes::from_static(b"\x00\x01")));
        harness.send(Message::text(r#"{"unrelated":true}"#));
        harness.send_request("GET", "/health");
        let response = harness.next_response().await;
        assert_eq!(response.body, "ok");
        // Four inbound frames, one response.
        assert!(timeout(Duration::from_millis(200), harness.outbound.next())
            .await
            .is_err());
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_response_is_chunked() {
        let body = r#"say "hi" \ "#.repeat(100);
        let served = body.clone();
        let endpoint = local_server(move |_req| {
            let served = served.clone();
            async move { Response::new(Full::new(Bytes::from(served))) }
        })
        .await;
        let config = RelayConfig {
            fragment_size: NonZeroUsize::new(256).unwrap(),
            ..RelayConfig::default()
        };
        let mut harness = Harness::start(endpoint, config);
        harness.send_request("GET", "/big");

        let reassembler = Reassembler::new(Duration::from_secs(60));
        let mut frames = 0;
        let payload = loop {
            let Message::Text(text) = harness.next().await else {
                panic!("expected text frame");
            };
            assert!(text.len() <= 256, "frame of {} bytes", text.len());
            let envelope: ChunkEnvelope = serde_json::from_str(&text).unwrap();
            assert_eq!(envelope.client_id, "client-1");
            assert_eq!(envelope.chunk_index, frames);
            frames += 1;
            if let Some(payload) = reassembler.absorb(envelope) {
                break payload;
            }
        };
        assert!(frames > 1);
        let response: BufferedResponse = serde_json::from_str(&payload).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, body);
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn chunked_inbound_request_is_reassembled() {
        let endpoint = local_server(|req: Request<Incoming>| async move {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Response::new(Full::new(Bytes::from(format!("{}", body.len()))))
        })
        .await;
        let mut harness = Harness::start(endpoint, RelayConfig::default());
        let request = InboundRequest {
            method: "POST".to_owned(),
            path: "/upload".to_owned(),
            body: "z".repeat(500),
            ..InboundRequest::default()
        };
        let json = serde_json::to_string(&request).unwrap();
        for envelope in chunk_codec::split("broker", json.as_bytes(), 100).unwrap() {
            harness.send(Message::text(serde_json::to_string(&envelope).unwrap()));
        }
        let response = harness.next_response().await;
        assert_eq!(response.body, "500");
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn streams_fixed_size_fragments_then_end_marker() {
        let endpoint = local_server(|_req| async {
            Response::new(Full::new(Bytes::from(vec![b'x'; 300 * 1024])))
        })
        .await;
        let config = RelayConfig {
            response_mode: ResponseMode::Streamed,
            stream_increment: NonZeroUsize::new(128 * 1024).unwrap(),
            ..RelayConfig::default()
        };
        let mut harness = Harness::start(endpoint, config);
        harness.send_request("GET", "/download");

        let Message::Text(head) = harness.next().await else {
            panic!("expected metadata frame");
        };
        let head: StreamHead = serde_json::from_str(&head).unwrap();
        assert_eq!(head.status, 200);
        assert!(head.stream);

        let mut sizes = Vec::new();
        let end = loop {
            match harness.next().await {
                Message::Binary(bytes) => sizes.push(bytes.len()),
                Message::Text(text) => break text,
                other => panic!("unexpected frame {other:?}"),
            }
        };
        assert_eq!(sizes, vec![128 * 1024, 128 * 1024, 44 * 1024]);
        let end: StreamSignal = serde_json::from_str(&end).unwrap();
        assert_eq!(end, StreamSignal::EndOfStream);
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn slow_request_does_not_block_the_next_one() {
        let gate = Arc::new(Notify::new());
        let server_gate = Arc::clone(&gate);
        let endpoint = local_server(move |req: Request<Incoming>| {
            let gate = Arc::clone(&server_gate);
            async move {
                if req.uri().path() == "/slow" {
                    gate.notified().await;
                }
                Response::new(Full::new(Bytes::from(req.uri().path().to_owned())))
            }
        })
        .await;
        let mut harness = Harness::start(endpoint, RelayConfig::default());
        harness.send_request("GET", "/slow");
        harness.send_request("GET", "/fast");
        assert_eq!(harness.next_response().await.body, "/fast");
        gate.notify_one();
        assert_eq!(harness.next_response().await.body, "/slow");
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn closing_the_socket_cancels_in_flight_requests() {
        let endpoint = local_server(|_req| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Response::new(Full::new(Bytes::new()))
        })
        .await;
        let harness = Harness::start(endpoint, RelayConfig::default());
        harness.send_request("GET", "/hang");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let writer = Arc::clone(&harness.writer);
        harness.finish().await.unwrap();
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn read_error_ends_the_relay() {
        let harness = Harness::start(refused_endpoint().await, RelayConfig::default());
        harness
            .inbound
            .as_ref()
            .unwrap()
            .unbounded_send(Err(tungstenite::Error::ConnectionClosed))
            .unwrap();
        let result = timeout(Duration::from_secs(5), harness.run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::Read(_))));
        assert!(harness.writer.is_closed());
    }

    #[tokio::test]
    async fn close_frame_ends_the_relay_cleanly() {
        let harness = Harness::start(refused_endpoint().await, RelayConfig::default());
        harness.send(Message::Close(None));
        let result = timeout(Duration::from_secs(5), harness.run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn body_failure_mid_stream_sends_stream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0_u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client hung up before sending a request");
                request.extend_from_slice(&buf[..n]);
            }
            // Promise 1000 bytes, send 7, hang up.
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\npartial")
                .await
                .unwrap();
        });
        let config = RelayConfig {
            response_mode: ResponseMode::Streamed,
            stream_increment: NonZeroUsize::new(4).unwrap(),
            ..RelayConfig::default()
        };
        let mut harness = Harness::start(endpoint, config);
        harness.send_request("GET", "/download");

        let Message::Text(head) = harness.next().await else {
            panic!("expected metadata frame");
        };
        let head: StreamHead = serde_json::from_str(&head).unwrap();
        assert_eq!(head.status, 200);

        let signal = loop {
            match harness.next().await {
                Message::Binary(bytes) => assert!(bytes.len() <= 4),
                Message::Text(text) => break text,
                other => panic!("unexpected frame {other:?}"),
            }
        };
        let signal: StreamSignal = serde_json::from_str(&signal).unwrap();
        assert!(
            matches!(signal, StreamSignal::StreamError { .. }),
            "expected stream-error, got {signal:?}"
        );
        assert!(!harness.writer.is_closed());
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn write_failure_stops_the_stream() {
        let endpoint = local_server(|_req| async {
            Response::new(Full::new(Bytes::from(vec![b'x'; 300 * 1024])))
        })
        .await;
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded();
        let attempts = Arc::new(AtomicUsize::new(0));
        let writer = Arc::new(FrameWriter::new(FailAfter {
            inner: out_tx,
            allowed: 1,
            attempts: Arc::clone(&attempts),
        }));
        let config = RelayConfig {
            response_mode: ResponseMode::Streamed,
            stream_increment: NonZeroUsize::new(128 * 1024).unwrap(),
            ..RelayConfig::default()
        };
        let relay = RequestRelay::new(
            "client-1",
            Arc::clone(&writer),
            LocalHttp::new(endpoint),
            config,
        );
        let run = tokio::spawn(relay.run(in_rx));

        let request = InboundRequest {
            method: "GET".to_owned(),
            path: "/download".to_owned(),
            ..InboundRequest::default()
        };
        in_tx
            .unbounded_send(Ok(Message::text(serde_json::to_string(&request).unwrap())))
            .unwrap();

        // The failed fragment latches the writer, which also ends the relay
        // while the inbound side is still open.
        timeout(Duration::from_secs(5), run)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();
        assert!(writer.is_closed());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(writer.write_text("late").await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        drop(writer);
        let written: Vec<Message> = out_rx.collect().await;
        assert_eq!(written.len(), 1);
        let Message::Text(head) = &written[0] else {
            panic!("expected metadata frame");
        };
        let head: StreamHead = serde_json::from_str(head).unwrap();
        assert!(head.stream);
        drop(in_tx);
    }
}
