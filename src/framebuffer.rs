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

//! The framebuffer data model and the capture source contract.
//!
//! A [`Framebuffer`] is a named pixel buffer with fixed dimensions, stride,
//! and pixel format. The pixel bytes sit behind a coarse mutex: the capture
//! backend writes under the lock, and the session holds the same lock while
//! copying rectangles out, so every multi-byte read observes a consistent
//! frame.
//!
//! Sessions never create framebuffers themselves. A host-provided
//! [`FramebufferSource`] produces them on demand and may attach
//! [`CaptureHints`] describing what changed since the previous capture,
//! which lets the update path skip pixel diffing entirely.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, RfbError};
use crate::protocol::{PixelFormat, Point, Rect};
use crate::translate;

/// A pixel buffer exported to the client.
///
/// The buffer geometry is immutable for the lifetime of the instance. A
/// resize produces a fresh `Framebuffer`; the session detects the identity
/// change (`Arc::ptr_eq`) and resets its diff cache accordingly.
pub struct Framebuffer {
    name: String,
    width: u16,
    height: u16,
    format: PixelFormat,
    stride: usize,
    data: Mutex<Vec<u8>>,
}

impl Framebuffer {
    /// Creates a zero-filled framebuffer with `stride = width * bytes_per_pixel`.
    #[must_use]
    pub fn new(name: impl Into<String>, width: u16, height: u16, format: PixelFormat) -> Self {
        let stride = usize::from(width) * format.bytes_per_pixel();
        let data = vec![0u8; stride * usize::from(height)];
        Self {
            name: name.into(),
            width,
            height,
            format,
            stride,
            data: Mutex::new(data),
        }
    }

    /// Creates a framebuffer around existing pixel data.
    ///
    /// # Errors
    ///
    /// [`RfbError::SanityCheck`] if `data` is not exactly
    /// `width * bytes_per_pixel * height` bytes long.
    pub fn with_data(
        name: impl Into<String>,
        width: u16,
        height: u16,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self> {
        let stride = usize::from(width) * format.bytes_per_pixel();
        if data.len() != stride * usize::from(height) {
            return Err(RfbError::SanityCheck(
                "framebuffer data length does not match dimensions",
            ));
        }
        Ok(Self {
            name: name.into(),
            width,
            height,
            format,
            stride,
            data: Mutex::new(data),
        })
    }

    /// The desktop name advertised to the client.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.height
    }

    /// Row length in bytes.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The native pixel format of the buffer.
    #[must_use]
    pub fn format(&self) -> &PixelFormat {
        &self.format
    }

    /// The full framebuffer as a rectangle at the origin.
    #[must_use]
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Locks and returns the raw pixel bytes.
    ///
    /// Mutating captures and multi-byte consistent reads both go through
    /// this guard. Hold it for the shortest span that still covers the
    /// whole read or write.
    ///
    /// # Panics
    ///
    /// Panics if a previous holder panicked while holding the lock.
    #[must_use]
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().expect("framebuffer lock poisoned")
    }

    /// Copies `rect` out of the framebuffer into `out`, translating to
    /// `dst_format` on the way.
    ///
    /// `out` is resized to the tightly packed result
    /// (`rect.width * rect.height * dst_format.bytes_per_pixel()`). The
    /// buffer lock is held for the duration of the copy.
    ///
    /// # Errors
    ///
    /// [`RfbError::SanityCheck`] when `rect` falls outside the framebuffer
    /// or translation is impossible (see [`translate::copy_rect`]).
    pub fn copy_rect_to(&self, rect: Rect, dst_format: &PixelFormat, out: &mut Vec<u8>) -> Result<()> {
        if rect.right() > u32::from(self.width) || rect.bottom() > u32::from(self.height) {
            return Err(RfbError::SanityCheck("rectangle outside framebuffer bounds"));
        }
        let dst_stride = usize::from(rect.width) * dst_format.bytes_per_pixel();
        out.resize(dst_stride * usize::from(rect.height), 0);

        let data = self.lock();
        translate::copy_rect(
            &data,
            self.stride,
            &self.format,
            rect,
            out,
            dst_stride,
            dst_format,
            0,
            0,
        )
    }
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

/// A region the capture source knows was copied from elsewhere on screen.
///
/// `src` is the top-left corner the content moved from; `dest` is where it
/// lives now. Transmitting the move instead of the pixels turns scrolling
/// into a few bytes of CopyRect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRect {
    /// Source position of the copied content.
    pub src: Point,
    /// Destination region, in framebuffer coordinates.
    pub dest: Rect,
}

/// The shape of the pointer, for clients that render the cursor locally.
#[derive(Debug, Clone)]
pub struct PointerShape {
    /// Cursor image width in pixels.
    pub width: u16,
    /// Cursor image height in pixels.
    pub height: u16,
    /// Hotspot X offset within the image.
    pub hotspot_x: u16,
    /// Hotspot Y offset within the image.
    pub hotspot_y: u16,
    /// Cursor pixels in the framebuffer's pixel format, tightly packed.
    pub pixels: Vec<u8>,
    /// Transparency bitmask, one bit per pixel, rows padded to whole bytes.
    pub mask: Vec<u8>,
}

/// Pointer state attached to a capture.
#[derive(Debug, Clone)]
pub struct PointerInfo {
    /// Pointer X position.
    pub x: u16,
    /// Pointer Y position.
    pub y: u16,
    /// False when the pointer is hidden.
    pub visible: bool,
    /// Cursor image, when the source can provide one.
    pub shape: Option<PointerShape>,
}

/// Change advisories produced alongside a capture.
///
/// Hints are advisory: the diff cache may use them instead of pixel
/// comparison, but an empty or absent hint set simply falls back to
/// line-by-line diffing.
#[derive(Debug, Clone, Default)]
pub struct CaptureHints {
    /// Regions that were copied from another on-screen location unchanged.
    pub moves: Vec<MoveRect>,
    /// Regions altered since the previous capture.
    pub dirty: Vec<Rect>,
    /// Pointer position and shape, when tracked by the source.
    pub pointer: Option<PointerInfo>,
}

/// A client's pending `FramebufferUpdateRequest`.
///
/// At most one request is pending per session; a newer request overwrites
/// an unsatisfied one. The update pump only sends when a request is
/// pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRequest {
    /// True to send only changes since the last update; false to resend
    /// the whole region.
    pub incremental: bool,
    /// The region the client wants, already clipped to framebuffer bounds.
    pub region: Rect,
}

impl UpdateRequest {
    /// Clips the request to `bounds`, returning `None` when nothing is left.
    #[must_use]
    pub fn clipped_to(&self, bounds: Rect) -> Option<UpdateRequest> {
        let region = self.region.intersect(&bounds);
        if region.is_empty() {
            return None;
        }
        Some(UpdateRequest {
            incremental: self.incremental,
            region,
        })
    }
}

/// Outcome of a [`FramebufferSource::set_desktop_size`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStatus {
    /// The desktop was resized; the next capture returns the new geometry.
    Success,
    /// The source does not permit resizing.
    Prohibited,
    /// The source tried and failed to resize.
    ResizeFailed,
    /// The requested screen layout was rejected.
    InvalidScreenLayout,
}

/// A producer of framebuffer snapshots, implemented by the host.
///
/// `capture` is invoked from the session's update pump at most once per
/// update tick. Returning the same `Arc` means "the previous buffer was
/// updated in place"; returning a new instance (resize, mode change) makes
/// the session adopt it and reset its diff cache. Returning `Ok(None)`
/// means no frame is available yet.
pub trait FramebufferSource: Send {
    /// Produces the current framebuffer, capturing a fresh frame into it.
    ///
    /// # Errors
    ///
    /// Capture failures are logged by the session and the tick is skipped;
    /// they never close the session.
    fn capture(&mut self) -> Result<Option<Arc<Framebuffer>>>;

    /// Change advisories for the most recent capture.
    ///
    /// Called after [`FramebufferSource::capture`] on the same tick. The
    /// default implementation reports no hints, which selects the pixel
    /// diffing path.
    fn hints(&mut self) -> Option<CaptureHints> {
        None
    }

    /// True if [`FramebufferSource::set_desktop_size`] can ever succeed.
    fn supports_resizing(&self) -> bool {
        false
    }

    /// Asks the source to resize the desktop.
    fn set_desktop_size(&mut self, width: u16, height: u16) -> ResizeStatus {
        let _ = (width, height);
        ResizeStatus::Prohibited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_and_length_follow_dimensions() {
        let fb = Framebuffer::new("test", 7, 3, PixelFormat::rgb888());
        assert_eq!(fb.stride(), 28);
        assert_eq!(fb.lock().len(), 84);
        assert_eq!(fb.bounds(), Rect::new(0, 0, 7, 3));
    }

    #[test]
    fn with_data_validates_length() {
        let format = PixelFormat::rgb888();
        assert!(Framebuffer::with_data("t", 2, 1, format.clone(), vec![0u8; 8]).is_ok());
        assert!(Framebuffer::with_data("t", 2, 1, format, vec![0u8; 7]).is_err());
    }

    #[test]
    fn copy_rect_to_is_format_converting() {
        let format = PixelFormat::rgb888();
        let fb = Framebuffer::with_data(
            "t",
            2,
            1,
            format.clone(),
            vec![0xff, 0x00, 0x00, 0xff, 0x00, 0xff, 0x00, 0xff],
        )
        .unwrap();

        let mut out = Vec::new();
        fb.copy_rect_to(Rect::new(1, 0, 1, 1), &format, &mut out).unwrap();
        assert_eq!(out, [0x00, 0xff, 0x00, 0xff]);

        assert!(fb
            .copy_rect_to(Rect::new(1, 0, 2, 1), &format, &mut out)
            .is_err());
    }
}
