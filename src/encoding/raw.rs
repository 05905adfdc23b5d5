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

//! Raw encoding: uncompressed pixel data in the client's pixel format.

use bytes::BytesMut;

use super::Encoder;
use crate::error::{Result, RfbError};
use crate::protocol::{PixelFormat, Rect, ENCODING_RAW, RECT_HEADER_LEN};

/// The mandatory baseline encoding.
///
/// Emits `width * height * bytes_per_pixel` bytes of pixel data verbatim.
/// Translation into the client's pixel format happens before the data
/// reaches the encoder.
pub struct RawEncoder;

impl Encoder for RawEncoder {
    fn encoding(&self) -> i32 {
        ENCODING_RAW
    }

    fn write_rect(
        &self,
        buf: &mut BytesMut,
        format: &PixelFormat,
        rect: Rect,
        contents: &[u8],
    ) -> Result<usize> {
        let expected = rect.area() as usize * format.bytes_per_pixel();
        if contents.len() != expected {
            return Err(RfbError::Encoder("raw payload does not match rectangle size"));
        }
        rect.write_header(buf, ENCODING_RAW);
        buf.extend_from_slice(contents);
        Ok(RECT_HEADER_LEN + contents.len())
    }
}
