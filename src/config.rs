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

use core::fmt;
use core::num::NonZeroUsize;
use core::str::FromStr;
use std::time::Duration;

use crate::error::EndpointError;

/// A local `host:port` target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from its parts.
    #[inline]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host part.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the same port on a different host.
    #[inline]
    #[must_use]
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self::new(host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or(EndpointError::MissingPort)?;
        if host.is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        let port = port
            .parse::<u16>()
            .map_err(|source| EndpointError::InvalidPort {
                port: port.to_owned(),
                source,
            })?;
        Ok(Self::new(host, port))
    }
}

/// What kind of local service the tunnel is relayed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayMode {
    /// Inbound frames are JSON requests for a local HTTP server.
    Http(ResponseMode),
    /// The socket is a raw byte pipe to a local TCP server.
    Tcp,
}

/// How a local HTTP response travels back over the tunnel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// Read the whole body, send one JSON frame (chunked if oversized).
    #[default]
    Buffered,
    /// Metadata frame, binary body fragments, then end-of-stream.
    Streamed,
}

/// Tunables for [`crate::RequestRelay`].
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Response strategy.
    pub response_mode: ResponseMode,
    /// Buffered payloads larger than this are split into chunk envelopes
    /// of at most this many bytes.
    pub fragment_size: NonZeroUsize,
    /// Size of each binary body fragment in streaming mode.
    pub stream_increment: NonZeroUsize,
    /// Upper bound on concurrently handled requests. Reading the next
    /// inbound frame waits while the bound is reached.
    pub max_in_flight: usize,
    /// Partial inbound reassemblies idle for longer than this are dropped.
    pub reassembly_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            response_mode: ResponseMode::Buffered,
            fragment_size: NonZeroUsize::new(5 * 1024 * 1024).unwrap_or(NonZeroUsize::MIN),
            stream_increment: NonZeroUsize::new(128 * 1024).unwrap_or(NonZeroUsize::MIN),
            max_in_flight: 64,
            reassembly_ttl: Duration::from_secs(120),
        }
    }
}

/// Tunables for [`crate::TcpBridge`].
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Bytes read from the local connection per binary frame, at most.
    pub read_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            read_buffer: 32 * 1024,
        }
    }
}
