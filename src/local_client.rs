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

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use bytes::Bytes;
use futures::future::{select, Either};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::handshake as http1_handshake;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tower_service::Service;
use tracing::debug;

use crate::config::Endpoint;
use crate::error::LocalError;
use crate::protocol::InboundRequest;

/// Issues requests against the local HTTP service.
///
/// Each call dials a fresh http1 connection, so a slow or wedged request
/// never holds up another one.
#[derive(Clone, Debug)]
pub struct LocalHttp {
    endpoint: Endpoint,
}

impl LocalHttp {
    /// Creates a client for the HTTP service at `endpoint`.
    #[inline]
    #[must_use]
    pub const fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// The local service this client talks to.
    #[inline]
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Builds the local request for `inbound`. The target is
    /// `http://<endpoint>/<path without its leading slash>`.
    ///
    /// # Errors
    ///
    /// Fails when the method, path or a header is not valid HTTP.
    pub fn build_request(&self, inbound: &InboundRequest) -> Result<Request<Full<Bytes>>, http::Error> {
        let path = inbound.path.strip_prefix('/').unwrap_or(&inbound.path);
        let mut builder = Request::builder()
            .method(inbound.method.as_str())
            .uri(format!("http://{}/{path}", self.endpoint))
            .header(HOST, self.endpoint.to_string());
        for (name, value) in &inbound.headers {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            // Framing and routing headers are derived from the local target
            // and the body, not copied.
            if name == HOST || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            builder = builder.header(name, HeaderValue::from_str(value)?);
        }
        builder.body(Full::new(Bytes::from(inbound.body.clone())))
    }
}

impl Service<Request<Full<Bytes>>> for LocalHttp {
    type Response = Response<Incoming>;
    type Error = LocalError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    #[inline]
    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        Box::pin(send_request(self.endpoint.to_string(), req))
    }
}

/// Connects to `endpoint`, performs the http1 handshake and sends
/// `request`. The connection keeps being driven in the background until
/// the response body has been consumed or dropped.
async fn send_request(
    endpoint: String,
    request: Request<Full<Bytes>>,
) -> Result<Response<Incoming>, LocalError> {
    let stream = match TcpStream::connect(&endpoint).await {
        Ok(stream) => stream,
        Err(source) => return Err(LocalError::Connect { endpoint, source }),
    };
    let (mut sender, conn) = http1_handshake(TokioIo::new(stream)).await?;

    let request_fut = sender.send_request(request);
    futures::pin_mut!(request_fut);
    let mut conn = Box::pin(conn);
    let response = match select(request_fut, conn.as_mut()).await {
        Either::Left((response_res, _)) => response_res?,
        Either::Right((conn_res, _)) => {
            conn_res?;
            return Err(LocalError::Disconnected);
        }
    };

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(endpoint = %endpoint, error = %err, "local connection ended with error");
        }
    });
    Ok(response)
}
