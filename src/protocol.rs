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

//! RFB (Remote Framebuffer) protocol constants and wire structures.
//!
//! This module provides the fundamental building blocks for RFB protocol
//! communication as specified in RFC 6143: protocol version negotiation,
//! message types, security handshakes, encodings, pixel format definitions,
//! and rectangle geometry.
//!
//! # Protocol Overview
//!
//! The RFB protocol operates in the following phases:
//! 1. **Protocol Version** - Server and client agree on protocol version
//! 2. **Security Handshake** - Authentication method selection and execution
//! 3. **Initialization** - Exchange of framebuffer parameters and capabilities
//! 4. **Normal Operation** - Ongoing message exchange for input events and
//!    screen updates
//!
//! All multi-byte integers on the wire are big-endian.

use bytes::{BufMut, BytesMut};

/// The RFB protocol version string advertised by the server.
///
/// This server implements RFB protocol version 3.8, which is widely supported
/// by modern VNC clients. The version string must be exactly 12 bytes
/// including the newline character as specified by the RFB protocol.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Maximum accepted `ClientCutText` payload (16 MiB).
///
/// Bounds the variable-length clipboard message so a hostile client cannot
/// make the server buffer arbitrary amounts of memory.
pub const MAX_CUT_TEXT: usize = 16 * 1024 * 1024;

/// Maximum accepted `SetEncodings` entry count.
pub const MAX_ENCODINGS: usize = 511;

// Client-to-Server Message Types

/// Message type: Client requests to change the pixel format.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Message type: Client specifies supported encodings.
///
/// The client sends a list of encoding types it supports, ordered by
/// preference. The server will use the first mutually supported encoding.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Message type: Client requests a framebuffer update.
///
/// The client can request either an incremental update (changes only) or
/// a full refresh of a specified rectangular region.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: Client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: Client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: Client sends cut text (clipboard data).
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

/// Message type: Client requests a new desktop size.
///
/// Part of the `ExtendedDesktopSize` extension. The server answers with an
/// `ExtendedDesktopSize` pseudo-rectangle carrying the result status.
pub const CLIENT_MSG_SET_DESKTOP_SIZE: u8 = 251;

// Server-to-Client Message Types

/// Message type: Server sends a framebuffer update.
///
/// Contains one or more rectangles of pixel data representing screen changes.
/// This is the primary message for transmitting visual updates to the client.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Message type: Server sets colour map entries.
///
/// Used for indexed color modes to define the color palette.
/// Not currently used in this true-color implementation.
#[allow(dead_code)]
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;

/// Message type: Server sends a bell (beep) notification.
pub const SERVER_MSG_BELL: u8 = 2;

/// Message type: Server sends cut text (clipboard data).
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Encoding Types

/// Encoding type: Raw pixel data in the client's pixel format.
pub const ENCODING_RAW: i32 = 0;

/// Encoding type: Copy Rectangle.
///
/// Instructs the client to copy a rectangular region from one location
/// to another on the screen. Highly efficient for scrolling operations.
/// This is a server-side operation, not a data encoding format.
pub const ENCODING_COPYRECT: i32 = 1;

/// Pseudo-encoding: Rich Cursor.
///
/// Allows the server to send cursor shape and hotspot information.
pub const ENCODING_CURSOR: i32 = -239;

/// Pseudo-encoding: Desktop Size.
///
/// Notifies the client of framebuffer dimension changes.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

/// Pseudo-encoding: Extended Desktop Size.
///
/// Carries a screen layout in addition to the dimensions, and doubles as the
/// reply channel for `SetDesktopSize` requests.
pub const ENCODING_EXTENDED_DESKTOP_SIZE: i32 = -308;

// ExtendedDesktopSize reasons and status codes. The pseudo-rectangle header
// carries the reason in `x` and the status in `y`.

/// ExtendedDesktopSize reason: the server changed the screen layout itself.
pub const EDS_REASON_SERVER: u16 = 0;

/// ExtendedDesktopSize reason: this client requested the change.
pub const EDS_REASON_CLIENT: u16 = 1;

/// ExtendedDesktopSize status: the request succeeded.
pub const EDS_STATUS_SUCCESS: u16 = 0;

/// ExtendedDesktopSize status: resizing is administratively prohibited.
pub const EDS_STATUS_PROHIBITED: u16 = 1;

/// ExtendedDesktopSize status: the resize failed for an out-of-band reason.
pub const EDS_STATUS_RESIZE_FAILED: u16 = 3;

/// ExtendedDesktopSize status: the requested screen layout was invalid.
pub const EDS_STATUS_INVALID_LAYOUT: u16 = 4;

// Security Types

/// Security type: None (no authentication).
///
/// No authentication is required. The connection proceeds directly
/// to the initialization phase.
pub const SECURITY_TYPE_NONE: u8 = 1;

/// Security type: VNC Authentication.
///
/// Standard VNC authentication using DES-encrypted challenge-response.
/// The server sends a 16-byte challenge, which the client encrypts with
/// the password and returns.
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

// Security Results

/// Security result: Authentication successful.
pub const SECURITY_RESULT_OK: u32 = 0;

/// Security result: Authentication failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// Describes how pixel values map to bytes and color channels.
///
/// A pixel format travels as 16 bytes on the wire (within `ServerInit` and
/// `SetPixelFormat`). Once constructed a format is treated as immutable;
/// the session replaces its copy wholesale when the client changes formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Bits per pixel on the wire: 8, 16, or 32.
    pub bits_per_pixel: u8,
    /// Number of useful bits in a pixel value. At most `bits_per_pixel`.
    pub depth: u8,
    /// True if multi-byte pixel values are big-endian on the wire.
    pub big_endian: bool,
    /// True for direct color; false for indexed (color map) formats.
    pub true_colour: bool,
    /// Maximum red channel value (for example 255 for 8 bits of red).
    pub red_max: u16,
    /// Maximum green channel value.
    pub green_max: u16,
    /// Maximum blue channel value.
    pub blue_max: u16,
    /// Right shift that positions the red channel within a pixel value.
    pub red_shift: u8,
    /// Right shift that positions the green channel within a pixel value.
    pub green_shift: u8,
    /// Right shift that positions the blue channel within a pixel value.
    pub blue_shift: u8,
    /// Color map for indexed formats, packed as `0x00RRGGBB` entries.
    ///
    /// Never present on the wire; a capture source that produces indexed
    /// pixels supplies it so the pixels can be expanded to direct color.
    pub palette: Option<Vec<u32>>,
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::rgb888()
    }
}

impl PixelFormat {
    /// The server's native format: 32 bits per pixel, 24-bit depth,
    /// little-endian, true color, 8:8:8 channels at shifts 16/8/0.
    #[must_use]
    pub fn rgb888() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
            palette: None,
        }
    }

    /// Bytes each pixel occupies on the wire.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel) / 8
    }

    /// Checks the structural invariants of this format.
    ///
    /// A valid format has a pixel size of 8, 16, or 32 bits, a depth that
    /// fits inside it, and channel shifts and maxima that fit inside the
    /// pixel. Indexed formats carry no channel constraints.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) {
            return false;
        }
        if self.depth == 0 || self.depth > self.bits_per_pixel {
            return false;
        }
        if !self.true_colour {
            return true;
        }
        for (max, shift) in [
            (self.red_max, self.red_shift),
            (self.green_max, self.green_shift),
            (self.blue_max, self.blue_shift),
        ] {
            if max == 0 {
                return false;
            }
            let channel_bits = (16 - max.leading_zeros()) as u8;
            if shift >= self.bits_per_pixel || channel_bits + shift > self.bits_per_pixel {
                return false;
            }
        }
        true
    }

    /// Serializes this format into the 16-byte wire layout.
    ///
    /// The layout is `bpp, depth, big-endian, true-color, max-R, max-G,
    /// max-B, shift-R, shift-G, shift-B` followed by 3 padding bytes.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(u8::from(self.big_endian));
        buf.put_u8(u8::from(self.true_colour));
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3);
    }

    /// Decodes a format from its 16-byte wire layout.
    ///
    /// The inverse of [`PixelFormat::write_to`]. The wire carries no palette,
    /// so the decoded format never has one.
    #[must_use]
    pub fn from_wire_bytes(bytes: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: bytes[0],
            depth: bytes[1],
            big_endian: bytes[2] != 0,
            true_colour: bytes[3] != 0,
            red_max: u16::from_be_bytes([bytes[4], bytes[5]]),
            green_max: u16::from_be_bytes([bytes[6], bytes[7]]),
            blue_max: u16::from_be_bytes([bytes[8], bytes[9]]),
            red_shift: bytes[10],
            green_shift: bytes[11],
            blue_shift: bytes[12],
            // bytes[13..16] are padding
            palette: None,
        }
    }
}

/// A point in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    /// Horizontal coordinate.
    pub x: u16,
    /// Vertical coordinate.
    pub y: u16,
}

impl Point {
    /// Creates a new point.
    #[must_use]
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in framebuffer coordinates.
///
/// Coordinates and extents are unsigned, so negative widths and heights are
/// unrepresentable. A rectangle with zero width or height is empty; all of
/// the geometric operations are total functions, with empty rectangles as
/// the absorbing element of [`Rect::intersect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width of the rectangle in pixels.
    pub width: u16,
    /// Height of the rectangle in pixels.
    pub height: u16,
}

impl Rect {
    /// Creates a new rectangle.
    #[must_use]
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True if this rectangle covers no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels covered.
    #[must_use]
    pub fn area(&self) -> u32 {
        u32::from(self.width) * u32::from(self.height)
    }

    /// One past the right edge.
    #[must_use]
    pub fn right(&self) -> u32 {
        u32::from(self.x) + u32::from(self.width)
    }

    /// One past the bottom edge.
    #[must_use]
    pub fn bottom(&self) -> u32 {
        u32::from(self.y) + u32::from(self.height)
    }

    /// Returns the overlap of two rectangles, or an empty rectangle when
    /// they are disjoint. Commutative and associative.
    #[allow(clippy::cast_possible_truncation)] // The min of two in-range edges stays in u16 range
    #[must_use]
    pub fn intersect(&self, other: &Rect) -> Rect {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if u32::from(x1) >= x2 || u32::from(y1) >= y2 {
            return Rect::default();
        }
        Rect::new(
            x1,
            y1,
            (x2 - u32::from(x1)) as u16,
            (y2 - u32::from(y1)) as u16,
        )
    }

    /// Returns the bounding box containing both rectangles.
    ///
    /// An empty operand contributes nothing, so `union` with an empty
    /// rectangle returns the other operand.
    #[allow(clippy::cast_possible_truncation)] // Edges of in-range operands stay in u16 range
    #[must_use]
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = self.right().max(other.right());
        let y2 = self.bottom().max(other.bottom());
        Rect::new(
            x1,
            y1,
            (x2 - u32::from(x1)) as u16,
            (y2 - u32::from(y1)) as u16,
        )
    }

    /// Writes the rectangle header for a framebuffer update.
    ///
    /// The header format is:
    /// - 2 bytes: x position
    /// - 2 bytes: y position
    /// - 2 bytes: width
    /// - 2 bytes: height
    /// - 4 bytes: encoding type (signed 32-bit integer)
    pub fn write_header(&self, buf: &mut BytesMut, encoding: i32) {
        // RFB requires big-endian (network byte order) for all multi-byte integers
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(encoding);
    }
}

/// Size in bytes of a serialized rectangle header.
pub const RECT_HEADER_LEN: usize = 12;

/// The `ServerInit` message sent at the end of the handshake.
///
/// Provides the client with framebuffer dimensions, the server's native
/// pixel format, and the desktop name.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// The width of the framebuffer in pixels.
    pub framebuffer_width: u16,
    /// The height of the framebuffer in pixels.
    pub framebuffer_height: u16,
    /// The pixel format used by the framebuffer.
    pub pixel_format: PixelFormat,
    /// The name of the desktop.
    pub name: String,
}

impl ServerInit {
    /// Serializes the `ServerInit` message into a byte buffer.
    ///
    /// The format follows the RFB protocol specification:
    /// - 2 bytes: framebuffer width
    /// - 2 bytes: framebuffer height
    /// - 16 bytes: pixel format
    /// - 4 bytes: name length
    /// - N bytes: name string (UTF-8)
    #[allow(clippy::cast_possible_truncation)] // Desktop name length limited to u32 per RFB protocol
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}
