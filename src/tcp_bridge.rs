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

//! Raw byte relay between the tunnel and a local TCP service.
//!
//! No structured frames are used: every tunnel message is written to the
//! local connection as-is, and every read from the local connection is
//! sent as one binary frame. Two pumps run concurrently; when either one
//! ends the writer is closed, which stops the other and closes both ends.

use std::sync::Arc;

use bytes::Bytes;
use futures::{Sink, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, Endpoint};
use crate::error::{BoxError, BridgeError};
use crate::frame_writer::FrameWriter;

/// Bridges one tunnel session to a local TCP endpoint.
pub struct TcpBridge<S> {
    writer: Arc<FrameWriter<S>>,
    endpoint: Endpoint,
    config: BridgeConfig,
}

impl<S> TcpBridge<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Into<BoxError>,
{
    /// Creates a bridge that writes to the tunnel through `writer`. The
    /// local endpoint is not dialed until [`TcpBridge::run`].
    pub const fn new(writer: Arc<FrameWriter<S>>, endpoint: Endpoint, config: BridgeConfig) -> Self {
        Self {
            writer,
            endpoint,
            config,
        }
    }

    /// Dials the local endpoint and pumps bytes in both directions until
    /// either side closes.
    ///
    /// # Errors
    ///
    /// Fails if the local endpoint cannot be dialed. The tunnel is closed
    /// in that case too.
    pub async fn run<R>(self, inbound: R) -> Result<(), BridgeError>
    where
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
    {
        let endpoint = self.endpoint.to_string();
        let local = match TcpStream::connect(&endpoint).await {
            Ok(local) => local,
            Err(source) => {
                warn!(endpoint = %endpoint, error = %source, "failed to dial local tcp service");
                self.writer.close().await;
                return Err(BridgeError::Dial { endpoint, source });
            }
        };
        if let Err(err) = local.set_nodelay(true) {
            debug!(error = %err, "could not disable nagle on local connection");
        }
        info!(endpoint = %endpoint, "bridging tunnel to local tcp service");

        let (local_read, local_write) = local.into_split();
        let shutdown = self.writer.shutdown().clone();

        let inbound_pump = tokio::spawn(tunnel_to_local(
            inbound,
            local_write,
            Arc::clone(&self.writer),
            shutdown.clone(),
        ));
        let outbound_pump = tokio::spawn(local_to_tunnel(
            local_read,
            Arc::clone(&self.writer),
            self.config.read_buffer.max(1),
            shutdown,
        ));

        let (inbound_bytes, outbound_bytes) = (inbound_pump.await, outbound_pump.await);
        info!(
            endpoint = %endpoint,
            to_local = inbound_bytes.unwrap_or_default(),
            to_tunnel = outbound_bytes.unwrap_or_default(),
            "tcp bridge closed"
        );
        Ok(())
    }
}

/// Writes every tunnel message to the local connection. Returns the
/// number of bytes written.
async fn tunnel_to_local<R, S>(
    mut inbound: R,
    mut local: OwnedWriteHalf,
    writer: Arc<FrameWriter<S>>,
    shutdown: CancellationToken,
) -> u64
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    S: Sink<Message> + Unpin + Send,
    S::Error: Into<BoxError>,
{
    let mut total = 0_u64;
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = inbound.next() => next,
        };
        let payload = match next {
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                debug!("tunnel closed, ending inbound pump");
                break;
            }
            Some(Err(err)) => {
                warn!(error = %err, "tunnel read error");
                break;
            }
        };
        if let Err(err) = local.write_all(&payload).await {
            warn!(error = %err, "local write error");
            break;
        }
        total += payload.len() as u64;
    }
    if let Err(err) = local.shutdown().await {
        debug!(error = %err, "error shutting down local connection");
    }
    writer.close().await;
    total
}

/// Sends everything read from the local connection as binary frames.
/// Returns the number of bytes sent.
async fn local_to_tunnel<S>(
    mut local: OwnedReadHalf,
    writer: Arc<FrameWriter<S>>,
    buffer_size: usize,
    shutdown: CancellationToken,
) -> u64
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Into<BoxError>,
{
    let mut buf = vec![0_u8; buffer_size];
    let mut total = 0_u64;
    loop {
        let read = tokio::select! {
            () = shutdown.cancelled() => break,
            read = local.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("local connection closed, ending outbound pump");
                break;
            }
            Ok(n) => {
                if let Err(err) = writer.write_binary(Bytes::copy_from_slice(&buf[..n])).await {
                    warn!(error = %err, "tunnel write error");
                    break;
                }
                total += n as u64;
            }
            Err(err) => {
                warn!(error = %err, "local read error");
                break;
            }
        }
    }
    writer.close().await;
    total
}
