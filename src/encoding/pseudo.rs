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

//! Pseudo-encodings: rectangles that carry state instead of pixels.
//!
//! A pseudo-rectangle reuses the normal rectangle header but overloads its
//! fields. `DesktopSize` announces new framebuffer dimensions in
//! `width`/`height`; `ExtendedDesktopSize` additionally carries a screen
//! layout and smuggles the change reason and status through `x` and `y`;
//! `Cursor` uses `x`/`y` as the hotspot and appends the cursor image.

use bytes::{BufMut, BytesMut};

use super::Encoder;
use crate::error::{Result, RfbError};
use crate::protocol::{
    PixelFormat, Rect, ENCODING_CURSOR, ENCODING_DESKTOP_SIZE, ENCODING_EXTENDED_DESKTOP_SIZE,
    RECT_HEADER_LEN,
};

/// Announces a framebuffer dimension change to legacy clients.
///
/// Header-only: `width` and `height` carry the new size, the position is
/// zero, and there is no payload.
pub struct DesktopSizeEncoder;

impl Encoder for DesktopSizeEncoder {
    fn encoding(&self) -> i32 {
        ENCODING_DESKTOP_SIZE
    }

    fn write_rect(
        &self,
        buf: &mut BytesMut,
        _format: &PixelFormat,
        rect: Rect,
        contents: &[u8],
    ) -> Result<usize> {
        if !contents.is_empty() {
            return Err(RfbError::Encoder("desktop-size rectangle carries no payload"));
        }
        rect.write_header(buf, ENCODING_DESKTOP_SIZE);
        Ok(RECT_HEADER_LEN)
    }
}

/// Announces a dimension change with screen layout, or answers a
/// `SetDesktopSize` request.
///
/// The header's `x` is the change reason and `y` the status code. The
/// payload is the screen list built by
/// [`ExtendedDesktopSizeEncoder::payload`].
pub struct ExtendedDesktopSizeEncoder;

impl ExtendedDesktopSizeEncoder {
    /// Builds the single-screen payload: number-of-screens, padding, then
    /// `(id, x, y, width, height, flags)` for the one screen.
    #[must_use]
    pub fn payload(width: u16, height: u16) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_u8(1); // number of screens
        buf.put_bytes(0, 3);
        buf.put_u32(1); // screen id
        buf.put_u16(0); // x
        buf.put_u16(0); // y
        buf.put_u16(width);
        buf.put_u16(height);
        buf.put_u32(0); // flags
        buf.to_vec()
    }
}

impl Encoder for ExtendedDesktopSizeEncoder {
    fn encoding(&self) -> i32 {
        ENCODING_EXTENDED_DESKTOP_SIZE
    }

    fn write_rect(
        &self,
        buf: &mut BytesMut,
        _format: &PixelFormat,
        rect: Rect,
        contents: &[u8],
    ) -> Result<usize> {
        // 4 bytes of screen count and padding plus 16 bytes per screen
        if contents.len() < 20 || (contents.len() - 4) % 16 != 0 {
            return Err(RfbError::Encoder("malformed extended desktop size payload"));
        }
        rect.write_header(buf, ENCODING_EXTENDED_DESKTOP_SIZE);
        buf.put_slice(contents);
        Ok(RECT_HEADER_LEN + contents.len())
    }
}

/// Sends the cursor shape so the client can render the pointer locally.
///
/// The header's `x`/`y` carry the hotspot and `width`/`height` the cursor
/// image size. The payload is the cursor pixels in the client's format
/// followed by the transparency bitmask, one bit per pixel with rows padded
/// to whole bytes.
pub struct CursorEncoder;

impl Encoder for CursorEncoder {
    fn encoding(&self) -> i32 {
        ENCODING_CURSOR
    }

    fn write_rect(
        &self,
        buf: &mut BytesMut,
        format: &PixelFormat,
        rect: Rect,
        contents: &[u8],
    ) -> Result<usize> {
        let pixels = rect.area() as usize * format.bytes_per_pixel();
        let mask = usize::from(rect.width).div_ceil(8) * usize::from(rect.height);
        if contents.len() != pixels + mask {
            return Err(RfbError::Encoder("cursor payload does not match shape size"));
        }
        rect.write_header(buf, ENCODING_CURSOR);
        buf.put_slice(contents);
        Ok(RECT_HEADER_LEN + contents.len())
    }
}
