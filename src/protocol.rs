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

//! JSON messages exchanged with the broker.

use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;

use crate::chunk_codec::ChunkEnvelope;

/// First frame sent by the broker.
#[derive(Debug, Deserialize, Serialize)]
pub struct Handshake {
    #[serde(default)]
    pub client_id: String,
}

/// A request the broker wants replayed against the local service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// A fully materialized response.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BufferedResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl BufferedResponse {
    /// A response generated by the relay itself rather than the local
    /// service.
    #[must_use]
    pub fn synthetic(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.to_owned(),
        }
    }
}

/// Metadata frame that opens a streamed response.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StreamHead {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub stream: bool,
}

/// Control frame that terminates a streamed response. Sent as a text
/// frame while body fragments are binary, so body bytes can never be
/// mistaken for it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StreamSignal {
    EndOfStream,
    StreamError { message: String },
}

/// Any text frame the broker may send after the handshake.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    Chunk(ChunkEnvelope),
    Request(InboundRequest),
}

/// Serializes `value` as compact JSON containing only ASCII bytes.
/// Anything outside ASCII is written as `\uXXXX` escapes, so the output
/// can be cut at any byte offset and each piece is still valid text.
pub fn to_ascii_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let mut out = Vec::with_capacity(128);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
    value.serialize(&mut ser)?;
    // Only ASCII was written.
    Ok(String::from_utf8_lossy(&out).into_owned())
}

struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (offset, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(&fragment.as_bytes()[start..offset])?;
            let mut units = [0_u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                writer.write_all(format!("\\u{unit:04x}").as_bytes())?;
            }
            start = offset + ch.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }
}
