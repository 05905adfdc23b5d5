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

//! The RFB server session: handshake, message loop, and update flushing.
//!
//! A [`VncServerSession`] owns one already-connected byte stream and drives
//! it through the protocol state machine:
//!
//! ```text
//! AwaitingVersion -> AwaitingSecuritySelection -> (AwaitingAuth ->)
//!     AwaitingClientInit -> Running -> Closed
//! ```
//!
//! Any state can fall to `Closed` on an I/O failure or protocol violation.
//!
//! Two tasks run per session once connected: the message loop, which owns
//! the read half and dispatches client messages, and the update pump, which
//! captures the screen and flushes pending changes at a bounded rate. All
//! writes from either task are serialized by a single stream mutex, so the
//! client observes whole messages in the order their first byte was
//! written.
//!
//! Lock order, always: update state, then the framebuffer buffer, then the
//! stream. Taking them in any other order is a bug.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use bytes::{BufMut, BytesMut};
use log::{error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::auth::{PasswordChallenge, VncAuth};
use crate::cache::{FramebufferCache, SinkCapabilities, UpdateSink};
use crate::encoding::{
    CopyRectEncoder, EncoderRegistry, ExtendedDesktopSizeEncoder, StatsMap,
};
use crate::error::{Result, RfbError};
use crate::events::{
    ClosedArgs, ConnectedArgs, ConnectionFailedArgs, CreatingDesktopArgs, DesktopSizeChangedArgs,
    FramebufferCapturingArgs, FramebufferUpdatingArgs, KeyChangedArgs, PasswordProvidedArgs,
    PointerChangedArgs, RemoteClipboardChangedArgs, SessionListeners,
};
use crate::framebuffer::{
    Framebuffer, FramebufferSource, PointerInfo, ResizeStatus, UpdateRequest,
};
use crate::pool::BufferPool;
use crate::protocol::{
    PixelFormat, Point, Rect, ServerInit, CLIENT_MSG_CLIENT_CUT_TEXT,
    CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST, CLIENT_MSG_KEY_EVENT, CLIENT_MSG_POINTER_EVENT,
    CLIENT_MSG_SET_DESKTOP_SIZE, CLIENT_MSG_SET_ENCODINGS, CLIENT_MSG_SET_PIXEL_FORMAT,
    EDS_REASON_CLIENT, EDS_REASON_SERVER, EDS_STATUS_INVALID_LAYOUT, EDS_STATUS_PROHIBITED,
    EDS_STATUS_RESIZE_FAILED, EDS_STATUS_SUCCESS, ENCODING_COPYRECT, ENCODING_CURSOR,
    ENCODING_DESKTOP_SIZE, ENCODING_EXTENDED_DESKTOP_SIZE, ENCODING_RAW, MAX_CUT_TEXT,
    MAX_ENCODINGS, PROTOCOL_VERSION, SECURITY_RESULT_FAILED, SECURITY_RESULT_OK,
    SECURITY_TYPE_NONE, SECURITY_TYPE_VNC_AUTH, SERVER_MSG_BELL, SERVER_MSG_FRAMEBUFFER_UPDATE,
    SERVER_MSG_SERVER_CUT_TEXT,
};
use crate::pump::{PumpHandle, UpdatePump};

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Desktop name sent in `ServerInit`. `None` uses the framebuffer's name.
    pub desktop_name: Option<String>,
    /// Password for VNC authentication. `None` offers the None security type.
    pub password: Option<String>,
    /// Offer VNC authentication even without a configured password, for use
    /// with a custom [`PasswordChallenge`] collaborator.
    pub authentication_required: bool,
    /// Upper bound on update messages per second.
    pub max_update_rate: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            desktop_name: None,
            password: None,
            authentication_required: false,
            max_update_rate: 15,
        }
    }
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the client's protocol version banner.
    AwaitingVersion,
    /// Waiting for the client to pick a security type.
    AwaitingSecuritySelection,
    /// Waiting for the challenge response.
    AwaitingAuth,
    /// Waiting for `ClientInit`.
    AwaitingClientInit,
    /// The normal message loop is running.
    Running,
    /// The session has ended.
    Closed,
}

/// What the session knows about the connected client.
#[derive(Debug, Clone)]
pub struct ClientState {
    /// Protocol version the client reported.
    pub version: (u32, u32),
    /// Security type the client selected.
    pub auth_method: u8,
    /// Encodings the client accepts, in its order of preference.
    pub encodings: Vec<i32>,
    /// Pixel format updates are delivered in.
    pub pixel_format: PixelFormat,
    /// Framebuffer width the client believes is current.
    pub width: u16,
    /// Framebuffer height the client believes is current.
    pub height: u16,
    /// Encoding used for pixel rectangles.
    pub selected_encoding: i32,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            version: (0, 0),
            auth_method: 0,
            encodings: Vec::new(),
            pixel_format: PixelFormat::rgb888(),
            width: 0,
            height: 0,
            selected_encoding: ENCODING_RAW,
        }
    }
}

impl ClientState {
    fn supports(&self, encoding: i32) -> bool {
        self.encodings.contains(&encoding)
    }
}

/// One rectangle queued for the next `FramebufferUpdate` message.
#[derive(Debug)]
pub struct PendingRectangle {
    /// Where the rectangle lands on the client's screen.
    pub region: Rect,
    /// Encoding code used to serialize it.
    pub encoding: i32,
    /// Encoding-specific payload.
    pub contents: Vec<u8>,
}

/// State guarded by the update lock: the pending request, the rectangle
/// queue, the diff cache, and the current framebuffer handle. Holding the
/// lock keeps a client request and a pump tick from interleaving.
struct UpdateState {
    framebuffer: Option<Arc<Framebuffer>>,
    cache: FramebufferCache,
    request: Option<UpdateRequest>,
    queue: Vec<PendingRectangle>,
}

struct Shared {
    options: SessionOptions,
    listeners: SessionListeners,
    registry: EncoderRegistry,
    pool: BufferPool,
    /// The stream lock. Every outbound byte goes through here.
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    /// The update request lock.
    update: Mutex<UpdateState>,
    source: StdMutex<Box<dyn FramebufferSource>>,
    client: StdMutex<ClientState>,
    state: StdMutex<SessionState>,
    stats: StdMutex<StatsMap>,
    pump_handle: OnceLock<PumpHandle>,
    closed: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    fn client_snapshot(&self) -> ClientState {
        self.client.lock().expect("client lock poisoned").clone()
    }

    fn signal_pump(&self) {
        if let Some(handle) = self.pump_handle.get() {
            handle.signal();
        }
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn record_stats(&self, encoding: i32, raw_bytes: usize, encoded_bytes: usize) {
        self.stats
            .lock()
            .expect("stats lock poisoned")
            .entry(encoding)
            .or_default()
            .record(raw_bytes, encoded_bytes);
    }
}

/// A live server session over one transport stream.
///
/// Created with [`VncServerSession::connect`], which performs the whole
/// handshake before returning. Dropping the session aborts its tasks;
/// call [`VncServerSession::close`] for an orderly shutdown.
pub struct VncServerSession {
    shared: Arc<Shared>,
    pump: Option<UpdatePump>,
    reader_task: Option<JoinHandle<()>>,
}

impl VncServerSession {
    /// Runs the server handshake on `stream` and starts the session.
    ///
    /// The stream must be freshly connected: the first bytes exchanged are
    /// the protocol version banners. On success the message loop and update
    /// pump are running and the `Connected` listener has fired.
    ///
    /// VNC authentication uses the standard DES verifier around
    /// `options.password`; use [`VncServerSession::connect_with_challenge`]
    /// to substitute your own.
    ///
    /// # Errors
    ///
    /// Any handshake failure: the `ConnectionFailed` listener fires, the
    /// error is returned, and the stream is dropped.
    pub async fn connect<S>(
        stream: S,
        options: SessionOptions,
        source: Box<dyn FramebufferSource>,
        listeners: SessionListeners,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let challenge = Box::new(VncAuth::new(options.password.clone()));
        Self::connect_with_challenge(stream, options, source, listeners, challenge).await
    }

    /// Like [`VncServerSession::connect`] with a custom password verifier.
    ///
    /// # Errors
    ///
    /// Same failure behavior as [`VncServerSession::connect`].
    pub async fn connect_with_challenge<S>(
        stream: S,
        options: SessionOptions,
        source: Box<dyn FramebufferSource>,
        listeners: SessionListeners,
        challenge: Box<dyn PasswordChallenge>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);

        let shared = Arc::new(Shared {
            options,
            listeners,
            registry: EncoderRegistry::standard(),
            pool: BufferPool::new(),
            writer: Mutex::new(Box::new(write_half)),
            update: Mutex::new(UpdateState {
                framebuffer: None,
                cache: FramebufferCache::new(),
                request: None,
                queue: Vec::new(),
            }),
            source: StdMutex::new(source),
            client: StdMutex::new(ClientState::default()),
            state: StdMutex::new(SessionState::AwaitingVersion),
            stats: StdMutex::new(HashMap::new()),
            pump_handle: OnceLock::new(),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = handshake(&mut read_half, &shared, challenge.as_ref()).await {
            error!("handshake failed: {e}");
            shared.set_state(SessionState::Closed);
            let mut args = ConnectionFailedArgs {
                reason: e.to_string(),
            };
            SessionListeners::emit(&shared.listeners.connection_failed, &mut args);
            return Err(e);
        }

        shared.set_state(SessionState::Running);
        info!("session handshake completed");
        SessionListeners::emit(&shared.listeners.connected, &mut ConnectedArgs::default());

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            match run_message_loop(read_half, &reader_shared).await {
                Ok(()) => shutdown(&reader_shared, "client disconnected").await,
                Err(e) => {
                    error!("message loop failed: {e}");
                    shutdown(&reader_shared, &e.to_string()).await;
                }
            }
        });

        let pump_shared = shared.clone();
        let pump = UpdatePump::start(
            move || {
                let shared = pump_shared.clone();
                async move {
                    if shared.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Err(e) = framebuffer_send_changes(&shared).await {
                        error!("update flush failed: {e}");
                        shutdown(&shared, &e.to_string()).await;
                    }
                }
            },
            shared.options.max_update_rate,
            false,
        );
        let _ = shared.pump_handle.set(pump.handle());

        Ok(Self {
            shared,
            pump: Some(pump),
            reader_task: Some(reader_task),
        })
    }

    /// The session's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().expect("state lock poisoned")
    }

    /// A snapshot of what the client negotiated.
    #[must_use]
    pub fn client(&self) -> ClientState {
        self.shared.client_snapshot()
    }

    /// Per-encoding statistics accumulated so far.
    #[must_use]
    pub fn stats(&self) -> StatsMap {
        self.shared.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Rings the client's bell.
    ///
    /// # Errors
    ///
    /// [`RfbError::Transport`] when the stream write fails.
    pub async fn bell(&self) -> Result<()> {
        self.shared.write_all(&[SERVER_MSG_BELL]).await
    }

    /// Sends clipboard text to the client.
    ///
    /// # Errors
    ///
    /// [`RfbError::Transport`] when the stream write fails.
    #[allow(clippy::cast_possible_truncation)] // Clipboard length limited to u32 per RFB protocol
    pub async fn send_clipboard(&self, text: &str) -> Result<()> {
        let mut msg = BytesMut::with_capacity(8 + text.len());
        msg.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
        msg.put_bytes(0, 3);
        msg.put_u32(text.len() as u32);
        msg.put_slice(text.as_bytes());
        self.shared.write_all(&msg).await
    }

    /// Wakes the update pump without waiting for the next tick.
    pub fn request_update_check(&self) {
        self.shared.signal_pump();
    }

    /// Waits until the session ends on its own (client disconnect or
    /// protocol failure), then reaps its tasks.
    pub async fn join(&mut self) {
        if let Some(task) = self.reader_task.take() {
            let _ = task.await;
        }
        if let Some(mut pump) = self.pump.take() {
            pump.stop().await;
        }
    }

    /// Closes the session: stops the pump, shuts the stream down, and
    /// reaps the message loop. Idempotent.
    pub async fn close(&mut self) {
        shutdown(&self.shared, "closed by host").await;
        if let Some(mut pump) = self.pump.take() {
            pump.stop().await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for VncServerSession {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Marks the session closed, logs the accumulated statistics, shuts the
/// write half down, and fires `Closed` exactly once.
async fn shutdown(shared: &Arc<Shared>, reason: &str) {
    if shared.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    shared.set_state(SessionState::Closed);

    let stats = shared.stats.lock().expect("stats lock poisoned").clone();
    let mut encodings: Vec<_> = stats.into_iter().collect();
    encodings.sort_by_key(|(encoding, _)| *encoding);
    for (encoding, s) in encodings {
        info!(
            "encoding {encoding}: {} rectangles, {} raw bytes, {} encoded bytes",
            s.rectangles, s.raw_bytes, s.encoded_bytes
        );
    }
    info!("session closed: {reason}");

    {
        let mut writer = shared.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    let mut args = ClosedArgs {
        reason: reason.to_string(),
    };
    SessionListeners::emit(&shared.listeners.closed, &mut args);
}

fn parse_version(banner: &[u8; 12]) -> Result<(u32, u32)> {
    if &banner[..4] != b"RFB " || banner[7] != b'.' || banner[11] != b'\n' {
        return Err(RfbError::ProtocolViolation("malformed version banner"));
    }
    let number = |digits: &[u8]| -> Result<u32> {
        digits.iter().try_fold(0u32, |acc, &b| {
            if b.is_ascii_digit() {
                Ok(acc * 10 + u32::from(b - b'0'))
            } else {
                Err(RfbError::ProtocolViolation("malformed version banner"))
            }
        })
    };
    Ok((number(&banner[4..7])?, number(&banner[8..11])?))
}

fn put_reason(buf: &mut BytesMut, reason: &str) {
    #[allow(clippy::cast_possible_truncation)] // Reason strings are short constants
    buf.put_u32(reason.len() as u32);
    buf.put_slice(reason.as_bytes());
}

/// Runs the multi-stage handshake up to (but not including) `Running`.
async fn handshake<S>(
    reader: &mut ReadHalf<S>,
    shared: &Arc<Shared>,
    challenge_source: &dyn PasswordChallenge,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    // Version exchange
    shared.write_all(PROTOCOL_VERSION.as_bytes()).await?;
    let mut banner = [0u8; 12];
    reader.read_exact(&mut banner).await?;
    let version = parse_version(&banner)?;
    #[cfg(feature = "debug-logging")]
    info!("client version: {}.{}", version.0, version.1);

    // Security negotiation
    shared.set_state(SessionState::AwaitingSecuritySelection);
    let auth_required =
        shared.options.authentication_required || shared.options.password.is_some();
    let methods: Vec<u8> = if version != (3, 8) {
        // Anything but 3.8 gets an empty method list, which fails cleanly
        Vec::new()
    } else if auth_required {
        vec![SECURITY_TYPE_VNC_AUTH]
    } else {
        vec![SECURITY_TYPE_NONE]
    };

    if methods.is_empty() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        put_reason(&mut buf, "unsupported protocol version");
        shared.write_all(&buf).await?;
        return Err(RfbError::ProtocolViolation("unsupported protocol version"));
    }

    {
        let mut buf = BytesMut::with_capacity(1 + methods.len());
        #[allow(clippy::cast_possible_truncation)] // At most two methods are ever offered
        buf.put_u8(methods.len() as u8);
        buf.put_slice(&methods);
        shared.write_all(&buf).await?;
    }

    let selected = reader.read_u8().await?;
    if !methods.contains(&selected) {
        let mut buf = BytesMut::new();
        buf.put_u32(SECURITY_RESULT_FAILED);
        put_reason(&mut buf, "security type not offered");
        shared.write_all(&buf).await?;
        return Err(RfbError::ProtocolViolation(
            "client selected an unoffered security type",
        ));
    }

    {
        let mut client = shared.client.lock().expect("client lock poisoned");
        client.version = version;
        client.auth_method = selected;
    }

    if selected == SECURITY_TYPE_VNC_AUTH {
        shared.set_state(SessionState::AwaitingAuth);
        let mut challenge = challenge_source.generate_challenge();
        shared.write_all(&challenge).await?;

        let mut response = [0u8; 16];
        reader.read_exact(&mut response).await?;

        let mut args = PasswordProvidedArgs {
            challenge,
            response,
            is_authenticated: challenge_source.verify_response(&challenge, &response),
        };
        SessionListeners::emit(&shared.listeners.password_provided, &mut args);
        let authenticated = args.is_authenticated;

        // Challenge material must not outlive the exchange
        challenge.fill(0);
        response.fill(0);
        args.challenge.fill(0);
        args.response.fill(0);

        if authenticated {
            let mut buf = BytesMut::with_capacity(4);
            buf.put_u32(SECURITY_RESULT_OK);
            shared.write_all(&buf).await?;
        } else {
            let mut buf = BytesMut::new();
            buf.put_u32(SECURITY_RESULT_FAILED);
            put_reason(&mut buf, "authentication failed");
            shared.write_all(&buf).await?;
            return Err(RfbError::AuthFailure);
        }
    } else {
        // Protocol 3.8 sends a SecurityResult for the None type as well
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(SECURITY_RESULT_OK);
        shared.write_all(&buf).await?;
    }

    // ClientInit / ServerInit
    shared.set_state(SessionState::AwaitingClientInit);
    let shared_flag = reader.read_u8().await? != 0;
    let mut creating = CreatingDesktopArgs {
        shared: shared_flag,
    };
    SessionListeners::emit(&shared.listeners.creating_desktop, &mut creating);

    let framebuffer = {
        let mut source = shared.source.lock().expect("source lock poisoned");
        match source.capture() {
            Ok(Some(fb)) => fb,
            Ok(None) => {
                return Err(RfbError::SanityCheck(
                    "no framebuffer available at initialization",
                ))
            }
            Err(e) => {
                warn!("initial capture failed: {e}");
                return Err(RfbError::SanityCheck(
                    "no framebuffer available at initialization",
                ));
            }
        }
    };

    let name = shared
        .options
        .desktop_name
        .clone()
        .unwrap_or_else(|| framebuffer.name().to_string());
    let init = ServerInit {
        framebuffer_width: framebuffer.width(),
        framebuffer_height: framebuffer.height(),
        pixel_format: framebuffer.format().clone(),
        name,
    };
    let mut buf = BytesMut::new();
    init.write_to(&mut buf);
    shared.write_all(&buf).await?;

    {
        let mut client = shared.client.lock().expect("client lock poisoned");
        client.width = framebuffer.width();
        client.height = framebuffer.height();
        client.pixel_format = framebuffer.format().clone();
    }
    {
        let mut update = shared.update.lock().await;
        update.cache.sync_to(&framebuffer);
        update.framebuffer = Some(framebuffer);
    }

    Ok(())
}

/// The `Running`-state dispatch loop. Returns `Ok` on a clean client
/// disconnect; every error closes the session.
async fn run_message_loop<S>(mut reader: ReadHalf<S>, shared: &Arc<Shared>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    loop {
        let opcode = match reader.read_u8().await {
            Ok(opcode) => opcode,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match opcode {
            CLIENT_MSG_SET_PIXEL_FORMAT => {
                let mut padding = [0u8; 3];
                reader.read_exact(&mut padding).await?;
                let mut raw = [0u8; 16];
                reader.read_exact(&mut raw).await?;
                let format = PixelFormat::from_wire_bytes(&raw);
                if !format.is_valid() {
                    return Err(RfbError::ProtocolViolation("invalid pixel format"));
                }
                if !format.true_colour {
                    return Err(RfbError::ProtocolViolation(
                        "indexed client pixel formats are unsupported",
                    ));
                }
                #[cfg(feature = "debug-logging")]
                info!(
                    "client pixel format: {}bpp depth={} shifts R{} G{} B{}",
                    format.bits_per_pixel,
                    format.depth,
                    format.red_shift,
                    format.green_shift,
                    format.blue_shift
                );
                shared.client.lock().expect("client lock poisoned").pixel_format = format;
            }

            CLIENT_MSG_SET_ENCODINGS => {
                let _padding = reader.read_u8().await?;
                let count = usize::from(reader.read_u16().await?);
                if count > MAX_ENCODINGS {
                    return Err(RfbError::ProtocolViolation("encoding list too long"));
                }
                let mut encodings = Vec::with_capacity(count);
                for _ in 0..count {
                    encodings.push(reader.read_i32().await?);
                }
                let selected = shared.registry.select(&encodings);
                #[cfg(feature = "debug-logging")]
                info!("client set {count} encodings, selected {selected}: {encodings:?}");
                let mut client = shared.client.lock().expect("client lock poisoned");
                client.encodings = encodings;
                client.selected_encoding = selected;
            }

            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                let incremental = reader.read_u8().await? != 0;
                let x = reader.read_u16().await?;
                let y = reader.read_u16().await?;
                let width = reader.read_u16().await?;
                let height = reader.read_u16().await?;
                let request = UpdateRequest {
                    incremental,
                    region: Rect::new(x, y, width, height),
                };

                let mut update = shared.update.lock().await;
                let bounds = update
                    .framebuffer
                    .as_ref()
                    .map(|fb| fb.bounds())
                    .unwrap_or_default();
                // Requests clipped to nothing are discarded
                if let Some(clipped) = request.clipped_to(bounds) {
                    update.request = Some(clipped);
                    drop(update);
                    shared.signal_pump();
                }
            }

            CLIENT_MSG_KEY_EVENT => {
                let pressed = reader.read_u8().await? != 0;
                let mut padding = [0u8; 2];
                reader.read_exact(&mut padding).await?;
                let keysym = reader.read_u32().await?;
                let mut args = KeyChangedArgs { keysym, pressed };
                SessionListeners::emit(&shared.listeners.key_changed, &mut args);
            }

            CLIENT_MSG_POINTER_EVENT => {
                let button_mask = reader.read_u8().await?;
                let x = reader.read_u16().await?;
                let y = reader.read_u16().await?;
                let mut args = PointerChangedArgs { x, y, button_mask };
                SessionListeners::emit(&shared.listeners.pointer_changed, &mut args);
            }

            CLIENT_MSG_CLIENT_CUT_TEXT => {
                let mut padding = [0u8; 3];
                reader.read_exact(&mut padding).await?;
                let length = reader.read_u32().await? as usize;
                if length > MAX_CUT_TEXT {
                    return Err(RfbError::ProtocolViolation("cut text too large"));
                }
                let mut text_bytes = vec![0u8; length];
                reader.read_exact(&mut text_bytes).await?;
                let text = String::from_utf8_lossy(&text_bytes).into_owned();
                let mut args = RemoteClipboardChangedArgs { text };
                SessionListeners::emit(&shared.listeners.remote_clipboard_changed, &mut args);
            }

            CLIENT_MSG_SET_DESKTOP_SIZE => {
                let _padding = reader.read_u8().await?;
                let width = reader.read_u16().await?;
                let height = reader.read_u16().await?;
                let screens = usize::from(reader.read_u8().await?);
                let _padding = reader.read_u8().await?;
                // The screen layout is read and discarded; this server
                // exports a single screen covering the framebuffer.
                let mut layout = vec![0u8; screens * 16];
                reader.read_exact(&mut layout).await?;
                handle_set_desktop_size(shared, width, height).await?;
            }

            _ => {
                error!("unknown client message type {opcode}");
                return Err(RfbError::ProtocolViolation("unknown client message type"));
            }
        }
    }
}

/// Applies a `SetDesktopSize` request and answers with an
/// `ExtendedDesktopSize` rectangle when the client can receive one.
async fn handle_set_desktop_size(shared: &Arc<Shared>, width: u16, height: u16) -> Result<()> {
    let status = {
        let mut source = shared.source.lock().expect("source lock poisoned");
        if source.supports_resizing() {
            source.set_desktop_size(width, height)
        } else {
            ResizeStatus::Prohibited
        }
    };

    let mut args = DesktopSizeChangedArgs {
        width,
        height,
        status,
    };
    SessionListeners::emit(&shared.listeners.desktop_size_changed, &mut args);

    // Adopt the resized framebuffer right away so the reply and subsequent
    // updates agree on the geometry.
    let mut reply_size = (width, height);
    if status == ResizeStatus::Success {
        let captured = {
            let mut source = shared.source.lock().expect("source lock poisoned");
            source.capture()
        };
        match captured {
            Ok(Some(fb)) => {
                reply_size = (fb.width(), fb.height());
                let mut update = shared.update.lock().await;
                let is_new = update
                    .framebuffer
                    .as_ref()
                    .map_or(true, |current| !Arc::ptr_eq(current, &fb));
                if is_new {
                    update.cache.sync_to(&fb);
                    update.framebuffer = Some(fb);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("capture after resize failed: {e}"),
        }
    } else {
        let client = shared.client_snapshot();
        reply_size = (client.width, client.height);
    }

    let client = shared.client_snapshot();
    if client.supports(ENCODING_EXTENDED_DESKTOP_SIZE) {
        let status_code = match status {
            ResizeStatus::Success => EDS_STATUS_SUCCESS,
            ResizeStatus::Prohibited => EDS_STATUS_PROHIBITED,
            ResizeStatus::ResizeFailed => EDS_STATUS_RESIZE_FAILED,
            ResizeStatus::InvalidScreenLayout => EDS_STATUS_INVALID_LAYOUT,
        };
        let rect = Rect::new(EDS_REASON_CLIENT, status_code, reply_size.0, reply_size.1);
        let payload = ExtendedDesktopSizeEncoder::payload(reply_size.0, reply_size.1);

        let mut buf = BytesMut::new();
        buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        buf.put_u8(0);
        buf.put_u16(1);
        let encoder = shared
            .registry
            .get(ENCODING_EXTENDED_DESKTOP_SIZE)
            .ok_or(RfbError::Encoder("extended desktop size encoder missing"))?;
        let written = encoder.write_rect(&mut buf, &client.pixel_format, rect, &payload)?;
        shared.record_stats(ENCODING_EXTENDED_DESKTOP_SIZE, payload.len(), written);
        shared.write_all(&buf).await?;
    }

    if status == ResizeStatus::Success {
        let mut client = shared.client.lock().expect("client lock poisoned");
        client.width = reply_size.0;
        client.height = reply_size.1;
    }

    Ok(())
}

/// Queues rectangles during a cache pass, translating pixel data into the
/// client's format as it goes.
struct UpdateQueue<'a> {
    fb: &'a Arc<Framebuffer>,
    queue: &'a mut Vec<PendingRectangle>,
    pool: &'a BufferPool,
    client_format: &'a PixelFormat,
    pixel_encoding: i32,
}

impl UpdateQueue<'_> {
    fn push(&mut self, region: Rect, encoding: i32, contents: Vec<u8>) {
        self.queue.push(PendingRectangle {
            region,
            encoding,
            contents,
        });
    }
}

impl UpdateSink for UpdateQueue<'_> {
    fn copy_region(&mut self, dest: Rect, src: Point) -> Result<()> {
        self.push(
            dest,
            ENCODING_COPYRECT,
            CopyRectEncoder::payload(src).to_vec(),
        );
        Ok(())
    }

    fn invalidate(&mut self, region: Rect) -> Result<()> {
        let mut contents = self
            .pool
            .take(region.area() as usize * self.client_format.bytes_per_pixel());
        // Holds the framebuffer lock for the whole rectangle copy
        self.fb
            .copy_rect_to(region, self.client_format, &mut contents)?;
        self.push(region, self.pixel_encoding, contents);
        Ok(())
    }

    fn pointer(&mut self, info: &PointerInfo) -> Result<()> {
        let Some(shape) = info.shape.as_ref() else {
            return Ok(());
        };
        let shape_rect = Rect::new(0, 0, shape.width, shape.height);
        let src_stride = usize::from(shape.width) * self.fb.format().bytes_per_pixel();
        let dst_stride = usize::from(shape.width) * self.client_format.bytes_per_pixel();

        let mut contents = self
            .pool
            .take(dst_stride * usize::from(shape.height) + shape.mask.len());
        contents.resize(dst_stride * usize::from(shape.height), 0);
        crate::translate::copy_rect(
            &shape.pixels,
            src_stride,
            self.fb.format(),
            shape_rect,
            &mut contents,
            dst_stride,
            self.client_format,
            0,
            0,
        )?;
        contents.extend_from_slice(&shape.mask);

        self.push(
            Rect::new(shape.hotspot_x, shape.hotspot_y, shape.width, shape.height),
            ENCODING_CURSOR,
            contents,
        );
        Ok(())
    }
}

/// One pump tick: capture, diff, serialize, send.
///
/// Returns whether any rectangles went out. Capture failures are logged
/// and swallowed; transport and encoder failures propagate and close the
/// session.
async fn framebuffer_send_changes(shared: &Arc<Shared>) -> Result<bool> {
    let mut update = shared.update.lock().await;

    let Some(pending) = update.request else {
        return Ok(false);
    };

    // Capture, adopting a new framebuffer instance if the source swapped
    let capture_result = {
        let mut source = shared.source.lock().expect("source lock poisoned");
        source.capture()
    };
    match capture_result {
        Ok(Some(fb)) => {
            let is_new = update
                .framebuffer
                .as_ref()
                .map_or(true, |current| !Arc::ptr_eq(current, &fb));
            if is_new {
                update.cache.sync_to(&fb);
                update.framebuffer = Some(fb);
            }
        }
        Ok(None) => {}
        Err(e) => warn!("screen capture failed: {e}"),
    }
    let Some(fb) = update.framebuffer.clone() else {
        return Ok(false);
    };

    SessionListeners::emit(
        &shared.listeners.framebuffer_capturing,
        &mut FramebufferCapturingArgs::default(),
    );
    let mut updating = FramebufferUpdatingArgs {
        incremental: pending.incremental,
        handled: false,
        sent_changes: false,
    };
    SessionListeners::emit(&shared.listeners.framebuffer_updating, &mut updating);
    if updating.handled {
        if updating.sent_changes {
            update.request = None;
        }
        return Ok(updating.sent_changes);
    }

    // The framebuffer may have been replaced since the request arrived
    let Some(request) = pending.clipped_to(fb.bounds()) else {
        update.request = None;
        return Ok(false);
    };

    let client = shared.client_snapshot();
    let caps = SinkCapabilities {
        copy_rect: client.supports(ENCODING_COPYRECT),
        cursor: client.supports(ENCODING_CURSOR),
    };
    let supports_eds = client.supports(ENCODING_EXTENDED_DESKTOP_SIZE);
    let supports_desktop_size = client.supports(ENCODING_DESKTOP_SIZE);

    // BeginUpdate
    update.queue.clear();
    let mut sent_geometry = false;

    // A full refresh re-announces the geometry ahead of the pixel data
    if !request.incremental && supports_eds {
        update.queue.push(PendingRectangle {
            region: Rect::new(
                EDS_REASON_SERVER,
                EDS_STATUS_SUCCESS,
                fb.width(),
                fb.height(),
            ),
            encoding: ENCODING_EXTENDED_DESKTOP_SIZE,
            contents: ExtendedDesktopSizeEncoder::payload(fb.width(), fb.height()),
        });
        sent_geometry = true;
    }

    let hints = {
        let mut source = shared.source.lock().expect("source lock poisoned");
        source.hints()
    };

    {
        let UpdateState { cache, queue, .. } = &mut *update;
        let mut sink = UpdateQueue {
            fb: &fb,
            queue,
            pool: &shared.pool,
            client_format: &client.pixel_format,
            pixel_encoding: client.selected_encoding,
        };
        cache.respond_to_update_request(&fb, hints.as_ref(), &request, caps, &mut sink)?;
    }

    // EndUpdate: reconcile geometry, serialize the queue, and flush
    if !sent_geometry && (fb.width() != client.width || fb.height() != client.height) {
        if supports_eds {
            update.queue.push(PendingRectangle {
                region: Rect::new(
                    EDS_REASON_SERVER,
                    EDS_STATUS_SUCCESS,
                    fb.width(),
                    fb.height(),
                ),
                encoding: ENCODING_EXTENDED_DESKTOP_SIZE,
                contents: ExtendedDesktopSizeEncoder::payload(fb.width(), fb.height()),
            });
            sent_geometry = true;
        } else if supports_desktop_size {
            update.queue.push(PendingRectangle {
                region: Rect::new(0, 0, fb.width(), fb.height()),
                encoding: ENCODING_DESKTOP_SIZE,
                contents: Vec::new(),
            });
            sent_geometry = true;
        }
    }

    if update.queue.is_empty() {
        // Nothing changed; the request stays pending until something does
        return Ok(false);
    }

    let rect_count = u16::try_from(update.queue.len())
        .map_err(|_| RfbError::Encoder("too many rectangles in one update"))?;

    let mut buf = BytesMut::with_capacity(4 + update.queue.len() * 64);
    buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
    buf.put_u8(0);
    buf.put_u16(rect_count);
    for rect in update.queue.drain(..) {
        let encoder = shared
            .registry
            .get(rect.encoding)
            .ok_or(RfbError::Encoder("no encoder registered for queued rectangle"))?;
        let written = encoder.write_rect(&mut buf, &client.pixel_format, rect.region, &rect.contents)?;
        shared.record_stats(rect.encoding, rect.contents.len(), written);
        shared.pool.recycle(rect.contents);
    }

    #[cfg(feature = "debug-logging")]
    info!("sending {rect_count} rectangles, {} bytes", buf.len());

    shared.write_all(&buf).await?;

    if sent_geometry {
        let mut client = shared.client.lock().expect("client lock poisoned");
        client.width = fb.width();
        client.height = fb.height();
    }
    update.request = None;
    Ok(true)
}
