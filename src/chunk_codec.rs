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

//! Splitting of oversized payloads into ordered envelopes and the
//! matching reassembly on the receiving side.
//!
//! Envelopes of one payload must be absorbed in index order. The
//! tunnel socket delivers frames in order, so no reordering or gap
//! detection is done here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ChunkError;

/// One ordered fragment of a payload too large for a single frame.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChunkEnvelope {
    /// Session the payload belongs to; reassembly is keyed by it.
    pub client_id: String,
    /// Zero-based position of this fragment.
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Set on the final fragment only.
    pub is_last: bool,
    pub payload: String,
}

/// Splits `payload` into `ceil(len / max_fragment)` envelopes, or a
/// single empty terminal envelope when `payload` is empty.
///
/// # Errors
///
/// Fails for the whole payload if any fragment is not valid UTF-8, or
/// if `max_fragment` is zero. A partially split payload is never
/// returned since the receiver could not reassemble it.
pub fn split(
    client_id: &str,
    payload: &[u8],
    max_fragment: usize,
) -> Result<Vec<ChunkEnvelope>, ChunkError> {
    if max_fragment == 0 {
        return Err(ChunkError::ZeroFragmentSize);
    }
    if payload.is_empty() {
        return Ok(vec![ChunkEnvelope {
            client_id: client_id.to_owned(),
            chunk_index: 0,
            total_chunks: 1,
            is_last: true,
            payload: String::new(),
        }]);
    }

    let total_chunks = payload.len().div_ceil(max_fragment);
    payload
        .chunks(max_fragment)
        .enumerate()
        .map(|(index, part)| {
            let text = core::str::from_utf8(part)
                .map_err(|source| ChunkError::Encoding { index, source })?;
            Ok(ChunkEnvelope {
                client_id: client_id.to_owned(),
                chunk_index: index,
                total_chunks,
                is_last: index + 1 == total_chunks,
                payload: text.to_owned(),
            })
        })
        .collect()
}

/// Splits `payload` like [`split`] and encodes each envelope, sizing the
/// fragments so that every encoded envelope is at most `max_frame` bytes.
///
/// Escaping can make an envelope much larger than its payload, so the
/// fragment size starts at `max_frame` and shrinks until the largest
/// frame fits.
///
/// # Errors
///
/// Fails like [`split`], or with [`ChunkError::FrameTooSmall`] when not
/// even a one-byte fragment fits.
pub fn split_frames(
    client_id: &str,
    payload: &[u8],
    max_frame: usize,
) -> Result<Vec<String>, ChunkError> {
    if max_frame == 0 {
        return Err(ChunkError::ZeroFragmentSize);
    }
    let mut fragment = max_frame;
    while fragment > 0 {
        let frames = split(client_id, payload, fragment)?
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ChunkError::Serialize)?;
        let largest = frames.iter().map(String::len).max().unwrap_or_default();
        if largest <= max_frame {
            return Ok(frames);
        }
        // Shrink in proportion to the overshoot, and always by at least one.
        fragment = (fragment.saturating_mul(max_frame) / largest).min(fragment - 1);
    }
    Err(ChunkError::FrameTooSmall { limit: max_frame })
}

/// Fragments received so far for one session.
#[derive(Debug)]
struct Partial {
    parts: Vec<String>,
    last_seen: Instant,
    /// Set once the entry has been removed from the table. A caller that
    /// raced the removal must look the session up again.
    retired: bool,
}

impl Partial {
    fn new() -> Self {
        Self {
            parts: Vec::new(),
            last_seen: Instant::now(),
            retired: false,
        }
    }
}

type Slot = Arc<Mutex<Partial>>;

/// Per-session reassembly buffers.
///
/// Owned by the relay session that receives the envelopes, and dropped
/// with it. Each session has its own lock; the table lock is held only
/// long enough to look up or remove a slot, so sessions never wait on
/// each other's reassembly.
#[derive(Debug)]
pub struct Reassembler {
    slots: Mutex<HashMap<String, Slot>>,
    ttl: Duration,
}

impl Reassembler {
    /// Partial reassemblies idle for longer than `ttl` are evicted.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Appends `envelope` to its session's buffer. Returns the complete
    /// payload when `envelope.is_last` is set, leaving no buffer behind
    /// for that session.
    pub fn absorb(&self, envelope: ChunkEnvelope) -> Option<String> {
        self.evict_stale();
        let ChunkEnvelope {
            client_id,
            chunk_index,
            total_chunks,
            is_last,
            payload,
        } = envelope;

        loop {
            let slot = self.slot(&client_id);
            let mut partial = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if partial.retired {
                continue;
            }
            partial.parts.push(payload);
            partial.last_seen = Instant::now();
            debug!(
                client_id = %client_id,
                chunk_index,
                total_chunks,
                "absorbed chunk"
            );
            if !is_last {
                return None;
            }

            partial.retired = true;
            let full = partial.parts.concat();
            drop(partial);
            self.remove(&client_id, &slot);
            return Some(full);
        }
    }

    /// Number of sessions with an incomplete payload.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drops partial payloads that have not received a fragment within
    /// the ttl. Slots currently being appended to are left alone.
    pub fn evict_stale(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|client_id, slot| {
            let Ok(mut partial) = slot.try_lock() else {
                return true;
            };
            if partial.last_seen.elapsed() < self.ttl {
                return true;
            }
            warn!(
                client_id = %client_id,
                fragments = partial.parts.len(),
                "evicting abandoned partial payload"
            );
            partial.retired = true;
            false
        });
        before - slots.len()
    }

    fn slot(&self, client_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(client_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(Partial::new()))),
        )
    }

    fn remove(&self, client_id: &str, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(client_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(client_id);
        }
    }
}
