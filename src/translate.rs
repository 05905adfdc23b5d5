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

//! Pixel translation between arbitrary RFB pixel formats.
//!
//! Framebuffer updates are always delivered in the pixel format the client
//! requested, which rarely matches the capture source's native format. This
//! module implements the conversion: a straight row copy when the two formats
//! are identical, otherwise a per-pixel unpack, channel rescale, and repack
//! honoring each format's byte order.
//!
//! Translation is pure CPU work over byte slices; it performs no I/O and
//! takes no locks. Callers hold the framebuffer lock around it when the
//! source slice aliases live framebuffer memory.

use crate::error::{Result, RfbError};
use crate::protocol::{PixelFormat, Rect};

/// Copies `src_rect` from a source pixel buffer into a destination buffer at
/// `(dst_x, dst_y)`, converting between pixel formats as needed.
///
/// Strides are in bytes. When `src_format` and `dst_format` are equal the
/// copy degenerates to one `memcpy` per row. Otherwise every pixel is
/// decoded from `src_format`, each channel rescaled into the destination
/// channel range with integer arithmetic, and re-encoded into `dst_format`.
///
/// Indexed (non true-color) sources are expanded through their palette.
/// Indexed destinations are not supported; converting into a color-mapped
/// format would require inverse palette lookup.
///
/// # Errors
///
/// [`RfbError::SanityCheck`] when either buffer is too small for the
/// requested region, or when the destination format is indexed.
#[allow(clippy::too_many_arguments)] // Mirrors the shape of a 2D blit: two buffers, two layouts, one region
pub fn copy_rect(
    src: &[u8],
    src_stride: usize,
    src_format: &PixelFormat,
    src_rect: Rect,
    dst: &mut [u8],
    dst_stride: usize,
    dst_format: &PixelFormat,
    dst_x: usize,
    dst_y: usize,
) -> Result<()> {
    if src_rect.is_empty() {
        return Ok(());
    }
    if !dst_format.true_colour {
        return Err(RfbError::SanityCheck(
            "indexed destination pixel formats are not supported",
        ));
    }

    let src_bpp = src_format.bytes_per_pixel();
    let dst_bpp = dst_format.bytes_per_pixel();
    let width = usize::from(src_rect.width);
    let height = usize::from(src_rect.height);

    let src_start = usize::from(src_rect.y) * src_stride + usize::from(src_rect.x) * src_bpp;
    let src_end = src_start + (height - 1) * src_stride + width * src_bpp;
    let dst_start = dst_y * dst_stride + dst_x * dst_bpp;
    let dst_end = dst_start + (height - 1) * dst_stride + width * dst_bpp;
    if src_end > src.len() || dst_end > dst.len() {
        return Err(RfbError::SanityCheck("pixel buffer too small for region"));
    }

    if src_format == dst_format {
        let row_bytes = width * src_bpp;
        for row in 0..height {
            let s = src_start + row * src_stride;
            let d = dst_start + row * dst_stride;
            dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
        return Ok(());
    }

    for row in 0..height {
        let mut s = src_start + row * src_stride;
        let mut d = dst_start + row * dst_stride;
        for _ in 0..width {
            let raw = read_pixel(&src[s..s + src_bpp], src_format.big_endian);
            let (r, g, b) = unpack_channels(raw, src_format);
            let out = pack_channels(r, g, b, src_format, dst_format);
            write_pixel(&mut dst[d..d + dst_bpp], out, dst_format.big_endian);
            s += src_bpp;
            d += dst_bpp;
        }
    }

    Ok(())
}

/// Reads one pixel value of 1, 2, or 4 bytes with the given byte order.
fn read_pixel(bytes: &[u8], big_endian: bool) -> u32 {
    match bytes.len() {
        1 => u32::from(bytes[0]),
        2 => {
            let v = [bytes[0], bytes[1]];
            if big_endian {
                u32::from(u16::from_be_bytes(v))
            } else {
                u32::from(u16::from_le_bytes(v))
            }
        }
        _ => {
            let v = [bytes[0], bytes[1], bytes[2], bytes[3]];
            if big_endian {
                u32::from_be_bytes(v)
            } else {
                u32::from_le_bytes(v)
            }
        }
    }
}

/// Writes one pixel value of 1, 2, or 4 bytes with the given byte order.
#[allow(clippy::cast_possible_truncation)] // Pixel values are masked to the format's bit width
fn write_pixel(bytes: &mut [u8], value: u32, big_endian: bool) {
    match bytes.len() {
        1 => bytes[0] = value as u8,
        2 => {
            let v = if big_endian {
                (value as u16).to_be_bytes()
            } else {
                (value as u16).to_le_bytes()
            };
            bytes.copy_from_slice(&v);
        }
        _ => {
            let v = if big_endian {
                value.to_be_bytes()
            } else {
                value.to_le_bytes()
            };
            bytes.copy_from_slice(&v);
        }
    }
}

/// Splits a raw pixel value into its color channels.
///
/// Indexed formats resolve the pixel through the palette and report the
/// entry as 8:8:8 channels.
fn unpack_channels(raw: u32, format: &PixelFormat) -> (u32, u32, u32) {
    if !format.true_colour {
        let entry = format
            .palette
            .as_ref()
            .and_then(|p| p.get(raw as usize).copied())
            .unwrap_or(0);
        return ((entry >> 16) & 0xff, (entry >> 8) & 0xff, entry & 0xff);
    }
    (
        (raw >> format.red_shift) & u32::from(format.red_max),
        (raw >> format.green_shift) & u32::from(format.green_max),
        (raw >> format.blue_shift) & u32::from(format.blue_max),
    )
}

/// Rescales channels from the source range into the destination range and
/// packs them at the destination shifts.
fn pack_channels(r: u32, g: u32, b: u32, src: &PixelFormat, dst: &PixelFormat) -> u32 {
    // Indexed sources were expanded to 8-bit channels by unpack_channels.
    let (src_r_max, src_g_max, src_b_max) = if src.true_colour {
        (
            u32::from(src.red_max),
            u32::from(src.green_max),
            u32::from(src.blue_max),
        )
    } else {
        (255, 255, 255)
    };

    let rescale = |comp: u32, from_max: u32, to_max: u32| -> u32 {
        if from_max == to_max || from_max == 0 {
            comp
        } else {
            to_max * comp / from_max
        }
    };

    let r = rescale(r, src_r_max, u32::from(dst.red_max));
    let g = rescale(g, src_g_max, u32::from(dst.green_max));
    let b = rescale(b, src_b_max, u32::from(dst.blue_max));

    (r << dst.red_shift) | (g << dst.green_shift) | (b << dst.blue_shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb565() -> PixelFormat {
        PixelFormat {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: false,
            true_colour: true,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
            palette: None,
        }
    }

    fn bgr888() -> PixelFormat {
        PixelFormat {
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
            ..PixelFormat::rgb888()
        }
    }

    #[test]
    fn same_format_is_a_row_copy() {
        let format = PixelFormat::rgb888();
        // 2x2 source, red and green on the first row
        let src = [
            0x00, 0x00, 0xff, 0x00, 0x00, 0xff, 0x00, 0x00, //
            0x11, 0x22, 0x33, 0x00, 0x44, 0x55, 0x66, 0x00,
        ];
        let mut dst = vec![0u8; src.len()];
        copy_rect(
            &src,
            8,
            &format,
            Rect::new(0, 0, 2, 2),
            &mut dst,
            8,
            &format,
            0,
            0,
        )
        .unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn converts_channel_order() {
        let src_fmt = PixelFormat::rgb888();
        let dst_fmt = bgr888();
        // One pure-red pixel: 0x00ff0000 little-endian
        let src = [0x00, 0x00, 0xff, 0x00];
        let mut dst = vec![0u8; 4];
        copy_rect(
            &src,
            4,
            &src_fmt,
            Rect::new(0, 0, 1, 1),
            &mut dst,
            4,
            &dst_fmt,
            0,
            0,
        )
        .unwrap();
        // Red now lives at shift 0
        assert_eq!(dst, [0xff, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn honors_destination_endianness() {
        let src_fmt = PixelFormat::rgb888();
        let dst_fmt = PixelFormat {
            big_endian: true,
            ..rgb565()
        };
        // Pure red: 565 value is 0xf800
        let src = [0x00, 0x00, 0xff, 0x00];
        let mut dst = vec![0u8; 2];
        copy_rect(
            &src,
            4,
            &src_fmt,
            Rect::new(0, 0, 1, 1),
            &mut dst,
            2,
            &dst_fmt,
            0,
            0,
        )
        .unwrap();
        assert_eq!(dst, [0xf8, 0x00]);
    }

    #[test]
    fn round_trip_preserves_pixels_when_maxes_match() {
        let f1 = PixelFormat::rgb888();
        let f2 = bgr888();
        let src: Vec<u8> = (0u8..32).collect(); // 8 arbitrary rgb888 pixels
        let rect = Rect::new(0, 0, 8, 1);

        let mut mid = vec![0u8; src.len()];
        copy_rect(&src, 32, &f1, rect, &mut mid, 32, &f2, 0, 0).unwrap();
        let mut back = vec![0u8; src.len()];
        copy_rect(&mid, 32, &f2, rect, &mut back, 32, &f1, 0, 0).unwrap();

        // The unused high byte is not carried through conversion
        for px in 0..8 {
            assert_eq!(back[px * 4..px * 4 + 3], src[px * 4..px * 4 + 3]);
        }
    }

    #[test]
    fn expands_indexed_source_through_palette() {
        let src_fmt = PixelFormat {
            bits_per_pixel: 8,
            depth: 8,
            big_endian: false,
            true_colour: false,
            red_max: 0,
            green_max: 0,
            blue_max: 0,
            red_shift: 0,
            green_shift: 0,
            blue_shift: 0,
            palette: Some(vec![0x0000_0000, 0x00ff_8040]),
        };
        let dst_fmt = PixelFormat::rgb888();
        let src = [1u8];
        let mut dst = vec![0u8; 4];
        copy_rect(
            &src,
            1,
            &src_fmt,
            Rect::new(0, 0, 1, 1),
            &mut dst,
            4,
            &dst_fmt,
            0,
            0,
        )
        .unwrap();
        assert_eq!(dst, [0x40, 0x80, 0xff, 0x00]);
    }

    #[test]
    fn rejects_indexed_destination_and_short_buffers() {
        let indexed = PixelFormat {
            true_colour: false,
            ..PixelFormat::rgb888()
        };
        let src = [0u8; 4];
        let mut dst = vec![0u8; 4];
        assert!(copy_rect(
            &src,
            4,
            &PixelFormat::rgb888(),
            Rect::new(0, 0, 1, 1),
            &mut dst,
            4,
            &indexed,
            0,
            0
        )
        .is_err());

        let mut short = vec![0u8; 2];
        assert!(copy_rect(
            &src,
            4,
            &PixelFormat::rgb888(),
            Rect::new(0, 0, 1, 1),
            &mut short,
            4,
            &PixelFormat::rgb888(),
            0,
            0
        )
        .is_err());
    }
}
