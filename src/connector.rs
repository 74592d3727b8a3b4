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

use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::ConnectError;
use crate::frame_writer::FrameWriter;
use crate::protocol::Handshake;
use crate::{DEFAULT_BROKER_HOST, MAX_INBOUND_FRAME, TUNNEL_HOST_ENV};

/// Write half of an established tunnel.
pub type TunnelSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// Read half of an established tunnel.
pub type TunnelStream<S> = SplitStream<WebSocketStream<S>>;

/// Parameters for [`connect`].
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Broker `host:port`. Falls back to `DAKWAK_TUNNEL_HOST`, then to
    /// the built in default.
    pub broker_host: Option<String>,
    /// Authentication token.
    pub token: String,
    /// Pins a previously issued identity.
    pub api_key: Option<String>,
    /// Routing hostname advertised to the broker.
    pub advertised_host: Option<String>,
}

impl ConnectOptions {
    /// The `wss://<host>/connect?...` target for these options.
    pub fn broker_url(&self) -> Result<Url, ConnectError> {
        let host = resolve_broker_host(self.broker_host.as_deref());
        let mut url = Url::parse(&format!("wss://{host}/connect"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("token", &self.token);
            if let Some(api_key) = non_empty(self.api_key.as_deref()) {
                query.append_pair("apikey", api_key);
            }
            if let Some(host) = non_empty(self.advertised_host.as_deref()) {
                query.append_pair("host", host);
            }
        }
        Ok(url)
    }
}

/// Explicit host, else the environment override, else the default.
#[must_use]
pub fn resolve_broker_host(explicit: Option<&str>) -> String {
    if let Some(host) = non_empty(explicit) {
        return host.to_owned();
    }
    std::env::var(TUNNEL_HOST_ENV)
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| DEFAULT_BROKER_HOST.to_owned())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// An authenticated tunnel and the identity the broker assigned to it.
pub struct Session<S> {
    client_id: String,
    socket: WebSocketStream<S>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// The broker assigned identity.
    #[inline]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Splits the socket. The write half is handed to a [`FrameWriter`],
    /// which becomes the only way to write to it.
    pub fn into_parts(self) -> (String, FrameWriter<TunnelSink<S>>, TunnelStream<S>) {
        let (sink, stream) = self.socket.split();
        (self.client_id, FrameWriter::new(sink), stream)
    }
}

/// Dials the broker described by `options` and performs the handshake.
/// Never retries.
pub async fn connect(
    options: &ConnectOptions,
) -> Result<Session<MaybeTlsStream<TcpStream>>, ConnectError> {
    let url = options.broker_url()?;
    connect_url(&url).await
}

/// Dials an explicit websocket url and performs the handshake.
pub async fn connect_url(url: &Url) -> Result<Session<MaybeTlsStream<TcpStream>>, ConnectError> {
    info!(
        broker = url.host_str().unwrap_or_default(),
        port = url.port_or_known_default(),
        "dialing tunnel"
    );
    let config = WebSocketConfig::default()
        .max_message_size(Some(MAX_INBOUND_FRAME))
        .max_frame_size(Some(MAX_INBOUND_FRAME));
    let (socket, _response) = connect_async_with_config(url.as_str(), Some(config), false)
        .await
        .map_err(ConnectError::Connect)?;
    establish(socket).await
}

/// Reads the handshake frame from a freshly opened socket. The socket is
/// closed before any error is returned.
pub async fn establish<S>(mut socket: WebSocketStream<S>) -> Result<Session<S>, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_handshake(&mut socket).await {
        Ok(client_id) => {
            info!(client_id = %client_id, "tunnel connection established");
            Ok(Session { client_id, socket })
        }
        Err(err) => {
            if let Err(close_err) = socket.close(None).await {
                debug!(error = %close_err, "error closing tunnel after failed handshake");
            }
            Err(err)
        }
    }
}

async fn read_handshake<S>(socket: &mut WebSocketStream<S>) -> Result<String, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let payload = match socket.next().await {
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err(ConnectError::ClosedBeforeHandshake),
            Some(Err(err)) => return Err(ConnectError::HandshakeRead(err)),
        };
        let handshake: Handshake =
            serde_json::from_slice(&payload).map_err(ConnectError::InvalidHandshake)?;
        if handshake.client_id.is_empty() {
            return Err(ConnectError::MissingClientId);
        }
        return Ok(handshake.client_id);
    }
}

#[cfg(test)]
mod tests {
    use futures::SinkExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_async;

    use super::*;

    /// Accepts one websocket, sends `first`, then reports whether the
    /// client closed the socket.
    async fn broker(first: Message) -> (Url, oneshot::Receiver<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(first).await.unwrap();
            let closed = loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break true,
                    Some(Ok(_)) => {}
                }
            };
            let _ = closed_tx.send(closed);
        });
        let url = Url::parse(&format!("ws://{addr}/connect?token=t")).unwrap();
        (url, closed_rx)
    }

    #[test]
    fn url_carries_query_parameters() {
        let options = ConnectOptions {
            broker_host: Some("broker.example:8443".to_owned()),
            token: "s3cret token".to_owned(),
            api_key: Some("abc123".to_owned()),
            advertised_host: Some("localhost:3000".to_owned()),
        };
        let url = options.broker_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("broker.example"));
        assert_eq!(url.port(), Some(8443));
        assert_eq!(url.path(), "/connect");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("token".to_owned(), "s3cret token".to_owned()),
                ("apikey".to_owned(), "abc123".to_owned()),
                ("host".to_owned(), "localhost:3000".to_owned()),
            ]
        );
    }

    #[test]
    fn optional_parameters_are_omitted() {
        let options = ConnectOptions {
            broker_host: Some("broker.example:443".to_owned()),
            token: "t".to_owned(),
            api_key: Some(String::new()),
            advertised_host: None,
        };
        let url = options.broker_url().unwrap();
        assert_eq!(url.query(), Some("token=t"));
    }

    #[test]
    fn explicit_host_wins() {
        assert_eq!(resolve_broker_host(Some("a.example:1")), "a.example:1");
    }

    #[tokio::test]
    async fn handshake_yields_client_id() {
        let (url, _closed) = broker(Message::text(r#"{"client_id":"abc123"}"#)).await;
        let session = connect_url(&url).await.unwrap();
        assert_eq!(session.client_id(), "abc123");
    }

    #[tokio::test]
    async fn empty_client_id_fails_and_closes() {
        let (url, closed) = broker(Message::text(r#"{"client_id":""}"#)).await;
        let err = connect_url(&url).await.err().unwrap();
        assert!(matches!(err, ConnectError::MissingClientId));
        assert!(closed.await.unwrap());
    }

    #[tokio::test]
    async fn missing_client_id_fails() {
        let (url, closed) = broker(Message::text(r#"{"other":"x"}"#)).await;
        let err = connect_url(&url).await.err().unwrap();
        assert!(matches!(err, ConnectError::MissingClientId));
        assert!(closed.await.unwrap());
    }

    #[tokio::test]
    async fn non_json_handshake_fails_and_closes() {
        let (url, closed) = broker(Message::text("hello")).await;
        let err = connect_url(&url).await.err().unwrap();
        assert!(matches!(err, ConnectError::InvalidHandshake(_)));
        assert!(closed.await.unwrap());
    }

    #[tokio::test]
    async fn refused_dial_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("ws://{addr}/connect")).unwrap();
        let err = connect_url(&url).await.err().unwrap();
        assert!(matches!(err, ConnectError::Connect(_)));
    }
}
