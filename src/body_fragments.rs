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

use core::pin::Pin;
use core::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::{ready, Stream};
use hyper::body::Body;
use pin_project::pin_project;

/// Re-slices a response body into fragments of exactly `size` bytes.
/// Only the final fragment may be shorter. Trailers are ignored.
///
/// A body of 300 KiB read with a size of 128 KiB yields 128 KiB,
/// 128 KiB and 44 KiB, however the body happened to be framed on the
/// wire.
#[pin_project]
pub struct BodyFragments<B> {
    /// The body being read.
    #[pin]
    body: B,

    /// Data read from the body but not yet emitted.
    pending: BytesMut,

    /// Fragment size.
    size: usize,

    /// The body has reported its end.
    finished: bool,
}

impl<B> BodyFragments<B> {
    /// Wraps `body`. A `size` of zero is treated as one.
    #[inline]
    pub fn new(body: B, size: usize) -> Self {
        Self {
            body,
            pending: BytesMut::new(),
            size: size.max(1),
            finished: false,
        }
    }
}

impl<B> Stream for BodyFragments<B>
where
    B: Body,
{
    type Item = Result<Bytes, B::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if this.pending.len() >= *this.size {
                return Poll::Ready(Some(Ok(this.pending.split_to(*this.size).freeze())));
            }
            if *this.finished {
                if this.pending.is_empty() {
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(Ok(this.pending.split().freeze())));
            }
            match ready!(this.body.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Ok(mut data) = frame.into_data() {
                        while data.has_remaining() {
                            let chunk = data.chunk();
                            let len = chunk.len();
                            this.pending.extend_from_slice(chunk);
                            data.advance(len);
                        }
                    }
                }
                Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                None => *this.finished = true,
            }
        }
    }
}
