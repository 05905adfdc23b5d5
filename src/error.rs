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

//! Error types for the RFB server session.
//!
//! All fallible operations in this crate return [`Result`]. The variants of
//! [`RfbError`] map to the session's failure policy:
//!
//! - [`RfbError::Capture`] is recovered locally: the update tick is skipped
//!   and the session keeps running.
//! - [`RfbError::AuthFailure`] writes the failure reason to the client before
//!   the session closes.
//! - Every other variant closes the session with a logged reason.

use thiserror::Error;

/// The canonical error type for an RFB server session.
#[derive(Debug, Error)]
pub enum RfbError {
    /// The underlying byte stream failed during a read or write.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The client sent something the protocol does not allow: an unknown
    /// opcode, an out-of-bounds size, or an unusable protocol version.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// An internal invariant did not hold, such as a missing framebuffer at
    /// initialization time or a buffer of the wrong length.
    #[error("sanity check failed: {0}")]
    SanityCheck(&'static str),

    /// The client failed VNC authentication.
    #[error("authentication failed")]
    AuthFailure,

    /// The capture source could not produce a framebuffer this tick.
    #[error("capture error: {0}")]
    Capture(String),

    /// An encoder could not serialize a rectangle. The stream state is
    /// undefined mid-rectangle, so this always closes the session.
    #[error("encoder error: {0}")]
    Encoder(&'static str),
}

/// Crate-wide result alias.
pub type Result<T, E = RfbError> = std::result::Result<T, E>;
