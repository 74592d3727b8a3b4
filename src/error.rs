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

//! Error types, one enum per concern.

use std::error::Error as StdError;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Boxed transport error, used where the sink type is generic.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Failure to establish a tunnel session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The broker target could not be turned into a URL.
    #[error("invalid broker url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Dialing or upgrading the socket failed.
    #[error("failed to connect to tunnel: {0}")]
    Connect(#[source] tungstenite::Error),

    /// The first frame could not be read.
    #[error("failed to read client_id from server: {0}")]
    HandshakeRead(#[source] tungstenite::Error),

    /// The socket closed before the broker sent an identity.
    #[error("tunnel closed before handshake")]
    ClosedBeforeHandshake,

    /// The first frame was not valid JSON.
    #[error("invalid client_id message: {0}")]
    InvalidHandshake(#[source] serde_json::Error),

    /// The handshake carried no usable identity.
    #[error("client_id missing in tunnel response")]
    MissingClientId,
}

/// Failure writing a frame to the tunnel socket.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The writer latched closed after an earlier failure or close.
    #[error("connection closed: {reason}")]
    Closed {
        /// Why the writer latched closed.
        reason: String,
    },

    /// The transport rejected this write. The writer is now closed.
    #[error("transport write failed: {0}")]
    Transport(#[source] BoxError),
}

/// Failure splitting a payload into chunk envelopes.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// A fragment is not valid text. The whole payload is rejected.
    #[error("fragment {index} is not valid utf-8: {source}")]
    Encoding {
        /// Index of the offending fragment.
        index: usize,
        /// Underlying decode error.
        source: std::str::Utf8Error,
    },

    /// Fragment size must be non-zero.
    #[error("fragment size must be greater than zero")]
    ZeroFragmentSize,

    /// An envelope could not be serialized.
    #[error("failed to encode chunk envelope: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Not even a one-byte fragment fits in the frame limit once the
    /// envelope is encoded.
    #[error("frame limit of {limit} bytes is too small for a chunk envelope")]
    FrameTooSmall {
        /// The requested frame limit.
        limit: usize,
    },
}

/// A `host:port` endpoint that could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    /// No `:` separator.
    #[error("invalid endpoint format, must be host:port")]
    MissingPort,

    /// Nothing before the `:`.
    #[error("endpoint host must not be empty")]
    EmptyHost,

    /// The port is not a number in `0..=65535`.
    #[error("invalid endpoint port {port:?}: {source}")]
    InvalidPort {
        /// The text after the `:`.
        port: String,
        /// Why it did not parse.
        source: core::num::ParseIntError,
    },
}

/// Failure talking to the local HTTP service.
#[derive(Debug, Error)]
pub enum LocalError {
    /// The local endpoint refused or dropped the TCP connection.
    #[error("failed to reach local service at {endpoint}: {source}")]
    Connect {
        /// Address that was dialed.
        endpoint: String,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// The http1 exchange failed.
    #[error("local http error: {0}")]
    Http(#[from] hyper::Error),

    /// The connection ended before a response head arrived.
    #[error("local service disconnected before responding")]
    Disconnected,
}

/// Terminal failure of the request relay loop.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Reading from the tunnel socket failed.
    #[error("tunnel read failed: {0}")]
    Read(#[source] tungstenite::Error),
}

/// Failure of the raw TCP bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The local TCP endpoint could not be dialed.
    #[error("failed to dial local tcp service at {endpoint}: {source}")]
    Dial {
        /// Address that was dialed.
        endpoint: String,
        /// Underlying socket error.
        source: std::io::Error,
    },
}

/// Failure sending one response back over the tunnel. Ends the handling
/// of that request only.
#[derive(Debug, Error)]
pub enum ResponseError {
    /// The frame could not be written.
    #[error(transparent)]
    Write(#[from] WriteError),

    /// A response frame could not be serialized.
    #[error("failed to encode response frame: {0}")]
    Encode(#[from] serde_json::Error),

    /// An oversized response could not be split.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}
