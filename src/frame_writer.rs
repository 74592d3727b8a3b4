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

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BoxError, WriteError};

/// How long [`FrameWriter::close`] waits for the transport to close.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// One message to put on the tunnel socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Control and JSON payloads.
    Text(String),
    /// Raw body bytes.
    Binary(Bytes),
}

impl Frame {
    fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::text(text),
            Self::Binary(bytes) => Message::binary(bytes),
        }
    }
}

/// The only path by which anything writes to the tunnel socket.
///
/// Each call to [`FrameWriter::write`] holds an exclusive lock across
/// the whole transport send, so frames from concurrent callers are never
/// interleaved. The first transport failure latches the writer closed:
/// every later write fails immediately without touching the socket and
/// the shutdown token is cancelled so that in-flight work stops.
///
/// A send that is stuck on the transport gives up as soon as the writer
/// latches closed, so closing never waits behind a stalled peer.
pub struct FrameWriter<S> {
    sink: Mutex<S>,
    closed: AtomicBool,
    reason: StdMutex<Option<String>>,
    shutdown: CancellationToken,
}

impl<S> FrameWriter<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Into<BoxError>,
{
    /// Takes exclusive ownership of the socket's write half.
    pub fn new(sink: S) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            reason: StdMutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Sends one frame.
    pub async fn write(&self, frame: Frame) -> Result<(), WriteError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut sink = self.sink.lock().await;
        // Another writer may have failed while we waited for the lock.
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let sent = tokio::select! {
            () = self.shutdown.cancelled() => return Err(self.closed_error()),
            sent = sink.send(frame.into_message()) => sent,
        };
        if let Err(err) = sent {
            let err: BoxError = err.into();
            warn!(error = %err, "tunnel write failed, closing connection");
            self.latch(format!("write failed: {err}"));
            return Err(WriteError::Transport(err));
        }
        Ok(())
    }

    /// Sends a text frame.
    pub async fn write_text(&self, text: impl Into<String>) -> Result<(), WriteError> {
        self.write(Frame::Text(text.into())).await
    }

    /// Sends a binary frame.
    pub async fn write_binary(&self, bytes: impl Into<Bytes>) -> Result<(), WriteError> {
        self.write(Frame::Binary(bytes.into())).await
    }

    /// Latches the writer closed and closes the underlying sink. A no-op
    /// if already closed.
    ///
    /// The latch and the shutdown signal happen before the sink lock is
    /// taken. Closing the transport itself is bounded by a short timeout.
    pub async fn close(&self) {
        if !self.latch("closed locally".to_owned()) {
            return;
        }
        let closing = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let err: BoxError = err.into();
                debug!(error = %err, "error while closing tunnel");
            }
            Err(_) => debug!("tunnel did not close in time, dropping it"),
        }
    }

    /// Latches the writer closed without touching the socket. Used when
    /// the read side has observed the connection end.
    pub fn mark_closed(&self, reason: impl Into<String>) {
        if !self.is_closed() {
            self.latch(reason.into());
        }
    }
}

impl<S> FrameWriter<S> {
    /// Whether the writer has latched closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancelled once the writer latches closed. Every task that uses
    /// this writer selects on it.
    #[inline]
    pub const fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Returns whether this call was the one that closed the writer.
    fn latch(&self, reason: String) -> bool {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.shutdown.cancel();
        first
    }

    fn closed_error(&self) -> WriteError {
        let reason = self
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "connection closed".to_owned());
        WriteError::Closed { reason }
    }
}
