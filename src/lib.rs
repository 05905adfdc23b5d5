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


//! # rfbsession
//!
//! A single-client RFB (Remote Framebuffer / VNC) **server session** in pure
//! Rust.
//!
//! This library implements the server side of the RFB protocol (RFC 6143)
//! over any already-connected byte stream: the multi-stage handshake with
//! optional VNC authentication, a live framebuffer export, and rate-limited
//! incremental updates driven by client requests and a pluggable screen
//! capture source. Listening sockets, TLS, input injection, and capture
//! backends are the host's business; one session owns exactly one stream
//! and one capture source.
//!
//! ## Features
//!
//! - **Full handshake**: version negotiation, None and VNC security types,
//!   DES challenge-response with a pluggable verifier
//! - **Update pipeline**: request/response update loop with a diff cache
//!   that sends only changed scanlines, capture hints (move/dirty
//!   rectangles), and CopyRect for scrolls
//! - **Pixel translation**: arbitrary true-color format conversion between
//!   the capture format and whatever the client asks for
//! - **Pseudo-encodings**: DesktopSize, ExtendedDesktopSize (including
//!   client-initiated resizing), and rich cursor shapes
//! - **Generic transports**: anything `AsyncRead + AsyncWrite` works; built
//!   on Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rfbsession::{
//!     Framebuffer, FramebufferSource, PixelFormat, Result, SessionListeners,
//!     SessionOptions, VncServerSession,
//! };
//!
//! struct TestPattern(Arc<Framebuffer>);
//!
//! impl FramebufferSource for TestPattern {
//!     fn capture(&mut self) -> Result<Option<Arc<Framebuffer>>> {
//!         Ok(Some(self.0.clone()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:5900").await?;
//!     let (stream, _) = listener.accept().await?;
//!
//!     let fb = Arc::new(Framebuffer::new("demo", 800, 600, PixelFormat::rgb888()));
//!     let session = VncServerSession::connect(
//!         stream,
//!         SessionOptions::default(),
//!         Box::new(TestPattern(fb)),
//!         SessionListeners::default(),
//!     )
//!     .await?;
//!
//!     // The session now runs on its own tasks; keep the handle around to
//!     // ring the bell, push clipboard text, or close it.
//!     session.bell().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             Your Application             │
//! │                                          │
//! │  • Accept connections, hand streams in   │
//! │  • Implement FramebufferSource           │
//! │  • Receive input events via listeners    │
//! └───────────────────┬──────────────────────┘
//!                     │
//!                     ▼
//! ┌──────────────────────────────────────────┐
//! │       VncServerSession (Public)          │
//! │                                          │
//! │   message loop          update pump      │
//! │   (reads, dispatch)     (capture, rate)  │
//! │          └───────┬──────────┘            │
//! │                  ▼                       │
//! │     cache ─► encoders ─► stream lock     │
//! └───────────────────┬──────────────────────┘
//!                     │
//!                     ▼
//! ┌──────────────────────────────────────────┐
//! │       Framebuffer (mutex-guarded)        │
//! │                                          │
//! │  • Produced by the capture source        │
//! │  • Diffed against the cache snapshot     │
//! │  • Translated to the client's format     │
//! └──────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod cache;
pub mod encoding;
pub mod error;
pub mod events;
pub mod framebuffer;
pub mod protocol;
pub mod pump;
pub mod session;
pub mod translate;

// Internal modules
mod pool;

// Re-exports
pub use auth::{PasswordChallenge, VncAuth};
pub use cache::{FramebufferCache, SinkCapabilities, UpdateSink};
pub use encoding::{Encoder, EncoderRegistry, EncoderStats};
pub use error::{Result, RfbError};
pub use events::SessionListeners;
pub use framebuffer::{
    CaptureHints, Framebuffer, FramebufferSource, MoveRect, PointerInfo, PointerShape,
    ResizeStatus, UpdateRequest,
};
pub use protocol::{PixelFormat, Point, Rect};
pub use pump::UpdatePump;
pub use session::{ClientState, SessionOptions, SessionState, VncServerSession};

/// RFB protocol version.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;
