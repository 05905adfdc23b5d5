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

//! The framebuffer cache: turns full captures into minimal update
//! rectangles.
//!
//! Given the current framebuffer and the client's pending update request,
//! the cache decides what actually needs to cross the wire. When the
//! capture source supplies change hints (move and dirty rectangles) those
//! are trusted directly. Without hints the cache compares the framebuffer
//! line by line against its own snapshot of the previously sent frame and
//! coalesces runs of differing scanlines into rectangles.
//!
//! The cache never touches the stream. It reports regions through an
//! [`UpdateSink`], which the session implements by queueing encoded
//! rectangles between `BeginUpdate` and `EndUpdate`.

use std::sync::Arc;

use crate::error::Result;
use crate::framebuffer::{CaptureHints, Framebuffer, PointerInfo, UpdateRequest};
use crate::protocol::{PixelFormat, Point, Rect};

/// Receives the regions the cache decides to transmit.
///
/// Methods are invoked in transmission order: moves first, then
/// invalidations, then the pointer.
pub trait UpdateSink {
    /// Queues a CopyRect move of `dest` from `src`.
    ///
    /// # Errors
    ///
    /// Propagates queueing failures; the cache aborts the pass.
    fn copy_region(&mut self, dest: Rect, src: Point) -> Result<()>;

    /// Queues a fresh transmission of `region`'s pixels.
    ///
    /// # Errors
    ///
    /// Propagates queueing failures; the cache aborts the pass.
    fn invalidate(&mut self, region: Rect) -> Result<()>;

    /// Queues a cursor shape update.
    ///
    /// # Errors
    ///
    /// Propagates queueing failures; the cache aborts the pass.
    fn pointer(&mut self, info: &PointerInfo) -> Result<()>;
}

/// What the connected client can accept, as far as the cache cares.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkCapabilities {
    /// The client listed the CopyRect encoding.
    pub copy_rect: bool,
    /// The client listed the cursor pseudo-encoding.
    pub cursor: bool,
}

/// Snapshot-based diff engine for one session.
///
/// Holds a second pixel buffer with the same geometry as the exported
/// framebuffer. The snapshot is compared against and refreshed from the
/// live buffer on every update pass, and discarded whenever the
/// framebuffer instance, dimensions, or pixel format change.
pub struct FramebufferCache {
    snapshot: Vec<u8>,
    width: u16,
    height: u16,
    stride: usize,
    format: PixelFormat,
    /// Identity of the framebuffer the snapshot belongs to.
    identity: usize,
}

impl Default for FramebufferCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FramebufferCache {
    /// Creates a cache with no snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: Vec::new(),
            width: 0,
            height: 0,
            stride: 0,
            format: PixelFormat::rgb888(),
            identity: 0,
        }
    }

    /// Points the cache at `fb`, resetting the snapshot if the instance or
    /// its geometry changed. Returns true when a reset happened.
    pub fn sync_to(&mut self, fb: &Arc<Framebuffer>) -> bool {
        let identity = Arc::as_ptr(fb) as usize;
        if identity == self.identity
            && self.width == fb.width()
            && self.height == fb.height()
            && self.format == *fb.format()
        {
            return false;
        }
        self.width = fb.width();
        self.height = fb.height();
        self.stride = fb.stride();
        self.format = fb.format().clone();
        self.identity = identity;
        self.snapshot.clear();
        self.snapshot
            .resize(self.stride * usize::from(self.height), 0);
        true
    }

    /// Produces the rectangles answering `request` and feeds them to `sink`.
    ///
    /// With `hints` present the hint-driven path runs: moves become
    /// CopyRects (or invalidations when the client cannot copy), dirty
    /// regions become invalidations clipped to the request, and the pointer
    /// becomes a cursor update. Without hints the scanline diff runs.
    /// A non-incremental request short-circuits both paths and resends the
    /// whole requested region.
    ///
    /// # Errors
    ///
    /// Propagates the first sink failure.
    pub fn respond_to_update_request(
        &mut self,
        fb: &Arc<Framebuffer>,
        hints: Option<&CaptureHints>,
        request: &UpdateRequest,
        caps: SinkCapabilities,
        sink: &mut dyn UpdateSink,
    ) -> Result<()> {
        self.sync_to(fb);
        let region = request.region.intersect(&fb.bounds());
        if region.is_empty() {
            return Ok(());
        }

        let pointer = hints.and_then(|h| h.pointer.as_ref());

        if request.incremental {
            match hints {
                Some(h) if !h.moves.is_empty() || !h.dirty.is_empty() => {
                    self.respond_from_hints(fb, h, region, caps, sink)?;
                }
                _ => self.respond_from_diff(fb, region, sink)?,
            }
        } else {
            // Full refresh of the requested region, hints or not.
            sink.invalidate(region)?;
            self.refresh(fb, region);
        }

        if caps.cursor {
            if let Some(info) = pointer {
                if info.shape.is_some() {
                    sink.pointer(info)?;
                }
            }
        }

        Ok(())
    }

    fn respond_from_hints(
        &mut self,
        fb: &Arc<Framebuffer>,
        hints: &CaptureHints,
        region: Rect,
        caps: SinkCapabilities,
        sink: &mut dyn UpdateSink,
    ) -> Result<()> {
        for mv in &hints.moves {
            let dest = mv.dest.intersect(&fb.bounds());
            if dest.is_empty() {
                continue;
            }
            if caps.copy_rect {
                sink.copy_region(dest, mv.src)?;
            } else {
                sink.invalidate(dest)?;
            }
            self.refresh(fb, dest);
        }
        for dirty in &hints.dirty {
            let clipped = dirty.intersect(&region);
            if clipped.is_empty() {
                continue;
            }
            sink.invalidate(clipped)?;
            self.refresh(fb, clipped);
        }
        Ok(())
    }

    /// Line-by-line comparison against the snapshot, coalescing consecutive
    /// differing scanlines into one rectangle each.
    fn respond_from_diff(
        &mut self,
        fb: &Arc<Framebuffer>,
        region: Rect,
        sink: &mut dyn UpdateSink,
    ) -> Result<()> {
        let bpp = self.format.bytes_per_pixel();
        let x_off = usize::from(region.x) * bpp;
        let row_len = usize::from(region.width) * bpp;

        let mut changed = Vec::new();
        {
            let data = fb.lock();
            let mut run_start: Option<u16> = None;
            for y in region.y..(region.bottom() as u16) {
                let off = usize::from(y) * self.stride + x_off;
                let live = &data[off..off + row_len];
                let cached = &mut self.snapshot[off..off + row_len];
                if live == cached {
                    if let Some(start) = run_start.take() {
                        changed.push(Rect::new(region.x, start, region.width, y - start));
                    }
                } else {
                    cached.copy_from_slice(live);
                    run_start.get_or_insert(y);
                }
            }
            if let Some(start) = run_start {
                changed.push(Rect::new(
                    region.x,
                    start,
                    region.width,
                    region.bottom() as u16 - start,
                ));
            }
        }

        for rect in changed {
            sink.invalidate(rect)?;
        }
        Ok(())
    }

    /// Copies `region` from the framebuffer into the snapshot.
    fn refresh(&mut self, fb: &Arc<Framebuffer>, region: Rect) {
        let bpp = self.format.bytes_per_pixel();
        let x_off = usize::from(region.x) * bpp;
        let row_len = usize::from(region.width) * bpp;
        let data = fb.lock();
        for y in region.y..(region.bottom() as u16) {
            let off = usize::from(y) * self.stride + x_off;
            self.snapshot[off..off + row_len].copy_from_slice(&data[off..off + row_len]);
        }
    }
}
