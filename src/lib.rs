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

//! This library opens a single long-lived websocket to a tunnel
//! broker, receives a routable identity from it, and then relays
//! everything arriving on that socket to a service on the local
//! network. Two relay modes exist:
//!
//! * HTTP relay: every inbound text frame is a JSON encoded request
//!   that is replayed against a local HTTP server. The response is
//!   either sent back as one (possibly chunked) JSON frame, or
//!   streamed as a metadata frame, binary body fragments and an
//!   explicit end-of-stream frame.
//! * TCP bridge: the socket is treated as a raw byte pipe to a local
//!   TCP service.
//!
//! All writes to the socket go through a single [`FrameWriter`]
//! so that concurrent request handlers can never interleave frames.

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod body_fragments;
pub mod chunk_codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod frame_writer;
pub mod local_client;
pub mod protocol;
pub mod request_relay;
pub mod tcp_bridge;

pub use config::{BridgeConfig, Endpoint, RelayConfig, RelayMode, ResponseMode};
pub use connector::{connect, ConnectOptions, Session};
pub use frame_writer::{Frame, FrameWriter};
pub use request_relay::RequestRelay;
pub use tcp_bridge::TcpBridge;

/// Broker used when neither an explicit host nor
/// `TUNNEL_HOST_ENV` is provided.
pub const DEFAULT_BROKER_HOST: &str = "tunnel.dakwak.com:443";

/// Environment variable that overrides the broker host.
pub const TUNNEL_HOST_ENV: &str = "DAKWAK_TUNNEL_HOST";

/// Largest inbound frame accepted from the broker.
pub const MAX_INBOUND_FRAME: usize = 5 * 1024 * 1024;
