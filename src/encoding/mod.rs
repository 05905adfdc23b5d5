// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rectangle encoders and the per-session encoder registry.
//!
//! An [`Encoder`] serializes one update rectangle (header plus
//! encoding-specific payload) into the outbound buffer. Encoders are pure
//! functions over the rectangle content; the session owns the actual stream
//! write, so an encoder never blocks and never sees session state.
//!
//! The built-in set covers Raw, CopyRect, and the pseudo-encodings used for
//! desktop geometry and cursor shape. Compressed encodings (Tight, ZRLE,
//! Hextile) plug into the same registry.

mod copyrect;
mod pseudo;
mod raw;

pub use copyrect::CopyRectEncoder;
pub use pseudo::{CursorEncoder, DesktopSizeEncoder, ExtendedDesktopSizeEncoder};
pub use raw::RawEncoder;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::Result;
use crate::protocol::{PixelFormat, Rect, ENCODING_COPYRECT, ENCODING_RAW};

/// Serializes rectangles of one encoding type.
pub trait Encoder: Send + Sync {
    /// The numeric encoding code this encoder produces.
    fn encoding(&self) -> i32;

    /// Writes the rectangle header and encoded payload into `buf`.
    ///
    /// `contents` is the rectangle's payload in the form the encoding
    /// expects; for pixel encodings that is raw pixel data already
    /// translated to `format`. Returns the number of bytes written,
    /// header included.
    ///
    /// # Errors
    ///
    /// [`crate::RfbError::Encoder`] when `contents` does not match the
    /// rectangle geometry. The caller treats this as fatal because the
    /// outbound stream position is undefined mid-rectangle.
    fn write_rect(
        &self,
        buf: &mut BytesMut,
        format: &PixelFormat,
        rect: Rect,
        contents: &[u8],
    ) -> Result<usize>;
}

/// Running totals for one encoding type.
///
/// Counts are monotone for the lifetime of the session and are logged when
/// the session closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    /// Rectangles serialized.
    pub rectangles: u64,
    /// Input payload bytes before encoding.
    pub raw_bytes: u64,
    /// Bytes produced on the wire, headers included.
    pub encoded_bytes: u64,
}

impl EncoderStats {
    /// Accumulates one serialized rectangle.
    pub fn record(&mut self, raw_bytes: usize, encoded_bytes: usize) {
        self.rectangles += 1;
        self.raw_bytes += raw_bytes as u64;
        self.encoded_bytes += encoded_bytes as u64;
    }
}

/// Per-session statistics keyed by encoding code.
pub type StatsMap = HashMap<i32, EncoderStats>;

/// The set of encoders a session can produce.
pub struct EncoderRegistry {
    encoders: Vec<Arc<dyn Encoder>>,
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl EncoderRegistry {
    /// A registry with the built-in encoders: Raw, CopyRect, and the
    /// desktop-size and cursor pseudo-encodings.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self {
            encoders: Vec::new(),
        };
        registry.register(Arc::new(RawEncoder));
        registry.register(Arc::new(CopyRectEncoder));
        registry.register(Arc::new(DesktopSizeEncoder));
        registry.register(Arc::new(ExtendedDesktopSizeEncoder));
        registry.register(Arc::new(CursorEncoder));
        registry
    }

    /// Adds an encoder, replacing any prior encoder with the same code.
    pub fn register(&mut self, encoder: Arc<dyn Encoder>) {
        self.encoders
            .retain(|existing| existing.encoding() != encoder.encoding());
        self.encoders.push(encoder);
    }

    /// Looks up an encoder by its encoding code.
    #[must_use]
    pub fn get(&self, encoding: i32) -> Option<&Arc<dyn Encoder>> {
        self.encoders
            .iter()
            .find(|encoder| encoder.encoding() == encoding)
    }

    /// Selects the encoding used for pixel rectangles.
    ///
    /// Walks the client's preference list and picks the first encoding with
    /// a registered encoder, skipping CopyRect (which only ever carries move
    /// operations) and pseudo-encodings. Falls back to Raw, which every
    /// client must accept.
    #[must_use]
    pub fn select(&self, client_preferences: &[i32]) -> i32 {
        client_preferences
            .iter()
            .copied()
            .find(|&code| {
                code == ENCODING_RAW || (code > ENCODING_COPYRECT && self.get(code).is_some())
            })
            .unwrap_or(ENCODING_RAW)
    }
}
