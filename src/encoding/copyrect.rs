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

//! CopyRect encoding: move a region the client already has.

use bytes::{BufMut, BytesMut};

use super::Encoder;
use crate::error::{Result, RfbError};
use crate::protocol::{PixelFormat, Point, Rect, ENCODING_COPYRECT, RECT_HEADER_LEN};

/// Tells the client to copy the rectangle from another screen position.
///
/// The payload is 4 bytes (source x and y); no pixel data crosses the wire.
/// The session packs the source point with [`CopyRectEncoder::payload`]
/// when it queues the move.
pub struct CopyRectEncoder;

impl CopyRectEncoder {
    /// Packs a source position into the 4-byte CopyRect payload.
    #[must_use]
    pub fn payload(src: Point) -> [u8; 4] {
        let x = src.x.to_be_bytes();
        let y = src.y.to_be_bytes();
        [x[0], x[1], y[0], y[1]]
    }
}

impl Encoder for CopyRectEncoder {
    fn encoding(&self) -> i32 {
        ENCODING_COPYRECT
    }

    fn write_rect(
        &self,
        buf: &mut BytesMut,
        _format: &PixelFormat,
        rect: Rect,
        contents: &[u8],
    ) -> Result<usize> {
        if contents.len() != 4 {
            return Err(RfbError::Encoder("copyrect payload must be source x, y"));
        }
        rect.write_header(buf, ENCODING_COPYRECT);
        buf.put_slice(contents);
        Ok(RECT_HEADER_LEN + 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_big_endian_source() {
        assert_eq!(CopyRectEncoder::payload(Point::new(0x0102, 3)), [1, 2, 0, 3]);
    }

    #[test]
    fn writes_header_then_source() {
        let mut buf = BytesMut::new();
        let written = CopyRectEncoder
            .write_rect(
                &mut buf,
                &PixelFormat::rgb888(),
                Rect::new(1, 0, 1, 1),
                &CopyRectEncoder::payload(Point::new(0, 0)),
            )
            .unwrap();
        assert_eq!(written, 16);
        assert_eq!(&buf[..], &[0, 1, 0, 0, 0, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0]);
    }
}
