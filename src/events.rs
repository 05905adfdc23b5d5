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

//! Observable session events.
//!
//! The host wires itself to a session by filling in the optional callbacks
//! of [`SessionListeners`]. Each callback receives a typed, mutable
//! argument record; a few records carry fields the listener writes back
//! (authentication and update overrides).
//!
//! Callbacks run synchronously on the session task that produced the
//! event. They must not block indefinitely: the message loop and the
//! update pump stall for as long as a callback runs.

use crate::framebuffer::ResizeStatus;

/// A boxed listener callback.
pub type Callback<A> = Box<dyn Fn(&mut A) + Send + Sync>;

/// Arguments for [`SessionListeners::password_provided`].
///
/// `is_authenticated` arrives pre-set to the verdict of the session's
/// password collaborator; a listener may override it in either direction.
#[derive(Debug)]
pub struct PasswordProvidedArgs {
    /// The 16-byte challenge that was sent to the client.
    pub challenge: [u8; 16],
    /// The client's 16-byte encrypted response.
    pub response: [u8; 16],
    /// Whether the session accepts the response.
    pub is_authenticated: bool,
}

/// Arguments for [`SessionListeners::creating_desktop`].
#[derive(Debug)]
pub struct CreatingDesktopArgs {
    /// The share flag from the client's `ClientInit` message.
    pub shared: bool,
}

/// Arguments for [`SessionListeners::connected`].
#[derive(Debug, Default)]
pub struct ConnectedArgs {}

/// Arguments for [`SessionListeners::connection_failed`].
#[derive(Debug)]
pub struct ConnectionFailedArgs {
    /// Why the handshake never reached the running state.
    pub reason: String,
}

/// Arguments for [`SessionListeners::closed`].
#[derive(Debug)]
pub struct ClosedArgs {
    /// Why the session ended.
    pub reason: String,
}

/// Arguments for [`SessionListeners::framebuffer_capturing`].
#[derive(Debug, Default)]
pub struct FramebufferCapturingArgs {}

/// Arguments for [`SessionListeners::framebuffer_updating`].
///
/// Setting `handled` tells the session the listener produced (or
/// suppressed) this update itself; the session then skips its own cache
/// pass and reports `sent_changes` as the outcome.
#[derive(Debug)]
pub struct FramebufferUpdatingArgs {
    /// True when the pending request is incremental.
    pub incremental: bool,
    /// Set by the listener to take over this update.
    pub handled: bool,
    /// The listener's outcome, honored only when `handled` is set.
    pub sent_changes: bool,
}

/// Arguments for [`SessionListeners::key_changed`].
#[derive(Debug)]
pub struct KeyChangedArgs {
    /// The X Window System keysym of the key.
    pub keysym: u32,
    /// True on press, false on release.
    pub pressed: bool,
}

/// Arguments for [`SessionListeners::pointer_changed`].
#[derive(Debug)]
pub struct PointerChangedArgs {
    /// Pointer X position.
    pub x: u16,
    /// Pointer Y position.
    pub y: u16,
    /// Bitmask of pressed buttons (bit 0 = left, 1 = middle, 2 = right).
    pub button_mask: u8,
}

/// Arguments for [`SessionListeners::remote_clipboard_changed`].
#[derive(Debug)]
pub struct RemoteClipboardChangedArgs {
    /// The clipboard text the client sent.
    pub text: String,
}

/// Arguments for [`SessionListeners::desktop_size_changed`].
#[derive(Debug)]
pub struct DesktopSizeChangedArgs {
    /// Width the client asked for.
    pub width: u16,
    /// Height the client asked for.
    pub height: u16,
    /// What the capture source said.
    pub status: ResizeStatus,
}

/// The set of callbacks a host can attach to a session.
///
/// Every field is optional; an unset callback costs nothing. The struct is
/// passed to the session at construction and never changes afterwards.
#[derive(Default)]
pub struct SessionListeners {
    /// The client answered a VNC authentication challenge.
    pub password_provided: Option<Callback<PasswordProvidedArgs>>,
    /// The handshake finished and the desktop is about to be exported.
    pub creating_desktop: Option<Callback<CreatingDesktopArgs>>,
    /// The session reached the running state.
    pub connected: Option<Callback<ConnectedArgs>>,
    /// The session failed before reaching the running state.
    pub connection_failed: Option<Callback<ConnectionFailedArgs>>,
    /// The session ended after having been connected. Fires exactly once.
    pub closed: Option<Callback<ClosedArgs>>,
    /// A capture is about to be taken for an update.
    pub framebuffer_capturing: Option<Callback<FramebufferCapturingArgs>>,
    /// An update is about to be assembled; may be taken over.
    pub framebuffer_updating: Option<Callback<FramebufferUpdatingArgs>>,
    /// The client pressed or released a key.
    pub key_changed: Option<Callback<KeyChangedArgs>>,
    /// The client moved the pointer or changed button state.
    pub pointer_changed: Option<Callback<PointerChangedArgs>>,
    /// The client sent clipboard contents.
    pub remote_clipboard_changed: Option<Callback<RemoteClipboardChangedArgs>>,
    /// The client asked for a desktop resize and the source answered.
    pub desktop_size_changed: Option<Callback<DesktopSizeChangedArgs>>,
}

impl SessionListeners {
    /// Invokes `callback` with `args` when it is set.
    pub(crate) fn emit<A>(callback: &Option<Callback<A>>, args: &mut A) {
        if let Some(callback) = callback {
            callback(args);
        }
    }
}

impl std::fmt::Debug for SessionListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionListeners").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn emit_skips_unset_callbacks() {
        let listeners = SessionListeners::default();
        let mut args = ConnectedArgs::default();
        SessionListeners::emit(&listeners.connected, &mut args);
    }

    #[test]
    fn listeners_can_mutate_their_arguments() {
        let fired = Arc::new(AtomicBool::new(false));
        let observer = fired.clone();
        let listeners = SessionListeners {
            framebuffer_updating: Some(Box::new(move |args: &mut FramebufferUpdatingArgs| {
                observer.store(true, Ordering::SeqCst);
                args.handled = true;
                args.sent_changes = true;
            })),
            ..SessionListeners::default()
        };

        let mut args = FramebufferUpdatingArgs {
            incremental: true,
            handled: false,
            sent_changes: false,
        };
        SessionListeners::emit(&listeners.framebuffer_updating, &mut args);
        assert!(fired.load(Ordering::SeqCst));
        assert!(args.handled && args.sent_changes);
    }
}
