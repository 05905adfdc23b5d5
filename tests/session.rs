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

//! End-to-end protocol tests driving a full session over an in-memory
//! duplex stream, asserting the literal byte sequences a conforming client
//! sees on the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rfbsession::{
    CaptureHints, Framebuffer, FramebufferSource, MoveRect, PixelFormat, Point, Rect,
    ResizeStatus, Result, SessionListeners, SessionOptions, SessionState, VncServerSession,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const BANNER: &[u8] = b"RFB 003.008\n";
const RGB888_WIRE: [u8; 16] = [
    0x20, 0x18, 0x00, 0x01, 0x00, 0xff, 0x00, 0xff, 0x00, 0xff, 0x10, 0x08, 0x00, 0x00, 0x00,
    0x00,
];

/// The 2x1 framebuffer named "t" used throughout: one red and one green
/// pixel in rgb888.
fn tiny_framebuffer() -> Arc<Framebuffer> {
    Arc::new(
        Framebuffer::with_data(
            "t",
            2,
            1,
            PixelFormat::rgb888(),
            vec![0xff, 0x00, 0x00, 0xff, 0x00, 0xff, 0x00, 0xff],
        )
        .unwrap(),
    )
}

struct StaticSource {
    fb: Arc<Framebuffer>,
    hints: Option<CaptureHints>,
    resizable: bool,
}

impl StaticSource {
    fn new(fb: Arc<Framebuffer>) -> Self {
        Self {
            fb,
            hints: None,
            resizable: false,
        }
    }
}

impl FramebufferSource for StaticSource {
    fn capture(&mut self) -> Result<Option<Arc<Framebuffer>>> {
        Ok(Some(self.fb.clone()))
    }

    fn hints(&mut self) -> Option<CaptureHints> {
        self.hints.take()
    }

    fn supports_resizing(&self) -> bool {
        self.resizable
    }

    fn set_desktop_size(&mut self, width: u16, height: u16) -> ResizeStatus {
        if !self.resizable {
            return ResizeStatus::Prohibited;
        }
        self.fb = Arc::new(Framebuffer::new(
            self.fb.name().to_string(),
            width,
            height,
            self.fb.format().clone(),
        ));
        ResizeStatus::Success
    }
}

async fn read_bytes(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for server bytes")
        .expect("stream closed while reading");
    buf
}

async fn expect_bytes(stream: &mut DuplexStream, expected: &[u8]) {
    let actual = read_bytes(stream, expected.len()).await;
    assert_eq!(actual, expected, "wire bytes differ from expectation");
}

/// Drives the None-auth handshake from the client side while the session
/// connects, returning the client stream and the live session.
async fn connect_none_auth(
    source: StaticSource,
    options: SessionOptions,
    listeners: SessionListeners,
) -> (DuplexStream, VncServerSession) {
    let (mut client, server) = tokio::io::duplex(1 << 16);
    let task =
        tokio::spawn(VncServerSession::connect(server, options, Box::new(source), listeners));

    expect_bytes(&mut client, BANNER).await;
    client.write_all(BANNER).await.unwrap();
    expect_bytes(&mut client, &[0x01, 0x01]).await;
    client.write_all(&[0x01]).await.unwrap();
    expect_bytes(&mut client, &[0x00, 0x00, 0x00, 0x00]).await;
    client.write_all(&[0x01]).await.unwrap();

    let session = task.await.unwrap().unwrap();
    (client, session)
}

fn update_request(incremental: bool, x: u16, y: u16, w: u16, h: u16) -> Vec<u8> {
    let mut msg = vec![3u8, u8::from(incremental)];
    msg.extend_from_slice(&x.to_be_bytes());
    msg.extend_from_slice(&y.to_be_bytes());
    msg.extend_from_slice(&w.to_be_bytes());
    msg.extend_from_slice(&h.to_be_bytes());
    msg
}

fn set_encodings(encodings: &[i32]) -> Vec<u8> {
    let mut msg = vec![2u8, 0];
    msg.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
    for &encoding in encodings {
        msg.extend_from_slice(&encoding.to_be_bytes());
    }
    msg
}

#[tokio::test]
async fn handshake_with_none_auth() {
    let (mut client, session) = connect_none_auth(
        StaticSource::new(tiny_framebuffer()),
        SessionOptions::default(),
        SessionListeners::default(),
    )
    .await;

    // ServerInit: 2x1, rgb888, name "t"
    expect_bytes(&mut client, &[0x00, 0x02, 0x00, 0x01]).await;
    expect_bytes(&mut client, &RGB888_WIRE).await;
    expect_bytes(&mut client, &[0x00, 0x00, 0x00, 0x01, 0x74]).await;

    assert_eq!(session.state(), SessionState::Running);
    let negotiated = session.client();
    assert_eq!((negotiated.width, negotiated.height), (2, 1));
    assert_eq!(negotiated.version, (3, 8));
}

#[tokio::test]
async fn non_incremental_update_sends_raw_pixels() {
    let (mut client, _session) = connect_none_auth(
        StaticSource::new(tiny_framebuffer()),
        SessionOptions::default(),
        SessionListeners::default(),
    )
    .await;
    read_bytes(&mut client, 25).await; // ServerInit

    client
        .write_all(&update_request(false, 0, 0, 2, 1))
        .await
        .unwrap();

    // FramebufferUpdate with one raw rectangle covering the framebuffer
    expect_bytes(&mut client, &[0x00, 0x00, 0x00, 0x01]).await;
    expect_bytes(
        &mut client,
        &[0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
    )
    .await;
    expect_bytes(
        &mut client,
        &[0xff, 0x00, 0x00, 0xff, 0x00, 0xff, 0x00, 0xff],
    )
    .await;
}

#[tokio::test]
async fn incremental_update_with_no_changes_stays_silent() {
    let (mut client, _session) = connect_none_auth(
        StaticSource::new(tiny_framebuffer()),
        SessionOptions::default(),
        SessionListeners::default(),
    )
    .await;
    read_bytes(&mut client, 25).await;

    // Prime the diff snapshot with a full update
    client
        .write_all(&update_request(false, 0, 0, 2, 1))
        .await
        .unwrap();
    read_bytes(&mut client, 4 + 12 + 8).await;

    // Nothing changed: the incremental request must produce no bytes
    client
        .write_all(&update_request(true, 0, 0, 2, 1))
        .await
        .unwrap();
    let mut probe = [0u8; 1];
    let outcome =
        tokio::time::timeout(Duration::from_millis(300), client.read_exact(&mut probe)).await;
    assert!(outcome.is_err(), "server sent bytes for an unchanged frame");
}

#[tokio::test]
async fn move_hints_become_copyrect() {
    let mut source = StaticSource::new(tiny_framebuffer());
    source.hints = Some(CaptureHints {
        moves: vec![MoveRect {
            src: Point::new(0, 0),
            dest: Rect::new(1, 0, 1, 1),
        }],
        ..CaptureHints::default()
    });

    let (mut client, _session) = connect_none_auth(
        source,
        SessionOptions::default(),
        SessionListeners::default(),
    )
    .await;
    read_bytes(&mut client, 25).await;

    client
        .write_all(&set_encodings(&[0, 1]))
        .await
        .unwrap();
    client
        .write_all(&update_request(true, 0, 0, 2, 1))
        .await
        .unwrap();

    expect_bytes(&mut client, &[0x00, 0x00, 0x00, 0x01]).await;
    // CopyRect rectangle at (1,0) 1x1, source (0,0)
    expect_bytes(
        &mut client,
        &[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01],
    )
    .await;
    expect_bytes(&mut client, &[0x00, 0x00, 0x00, 0x00]).await;
}

#[tokio::test]
async fn rejected_version_fails_cleanly() {
    let failed = Arc::new(AtomicBool::new(false));
    let connected = Arc::new(AtomicBool::new(false));
    let listeners = SessionListeners {
        connection_failed: Some(Box::new({
            let failed = failed.clone();
            move |_| failed.store(true, Ordering::SeqCst)
        })),
        connected: Some(Box::new({
            let connected = connected.clone();
            move |_| connected.store(true, Ordering::SeqCst)
        })),
        ..SessionListeners::default()
    };

    let (mut client, server) = tokio::io::duplex(1 << 16);
    let task = tokio::spawn(VncServerSession::connect(
        server,
        SessionOptions::default(),
        Box::new(StaticSource::new(tiny_framebuffer())),
        listeners,
    ));

    expect_bytes(&mut client, BANNER).await;
    client.write_all(b"RFB 003.003\n").await.unwrap();

    // Zero security types followed by a reason string
    expect_bytes(&mut client, &[0x00]).await;
    let len = {
        let raw = read_bytes(&mut client, 4).await;
        u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
    };
    assert!(len > 0);
    read_bytes(&mut client, len).await;

    assert!(task.await.unwrap().is_err());
    assert!(failed.load(Ordering::SeqCst));
    assert!(!connected.load(Ordering::SeqCst));
}

/// Standard VNC DES response: password bytes bit-reversed, challenge
/// encrypted as two ECB blocks.
fn vnc_des_response(challenge: &[u8; 16], password: &str) -> [u8; 16] {
    let mut key = [0u8; 8];
    for (i, &byte) in password.as_bytes().iter().take(8).enumerate() {
        key[i] = byte.reverse_bits();
    }
    let cipher = Des::new_from_slice(&key).unwrap();
    let mut response = [0u8; 16];
    for (i, chunk) in challenge.chunks_exact(8).enumerate() {
        let mut block_bytes = [0u8; 8];
        block_bytes.copy_from_slice(chunk);
        let mut block = block_bytes.into();
        cipher.encrypt_block(&mut block);
        response[i * 8..i * 8 + 8].copy_from_slice(&block);
    }
    response
}

#[tokio::test]
async fn vnc_auth_accepts_the_right_password() {
    let options = SessionOptions {
        password: Some("secret".to_string()),
        ..SessionOptions::default()
    };
    let (mut client, server) = tokio::io::duplex(1 << 16);
    let task = tokio::spawn(VncServerSession::connect(
        server,
        options,
        Box::new(StaticSource::new(tiny_framebuffer())),
        SessionListeners::default(),
    ));

    expect_bytes(&mut client, BANNER).await;
    client.write_all(BANNER).await.unwrap();
    expect_bytes(&mut client, &[0x01, 0x02]).await; // one method: VNC auth
    client.write_all(&[0x02]).await.unwrap();

    let challenge_bytes = read_bytes(&mut client, 16).await;
    let mut challenge = [0u8; 16];
    challenge.copy_from_slice(&challenge_bytes);
    let response = vnc_des_response(&challenge, "secret");
    client.write_all(&response).await.unwrap();

    expect_bytes(&mut client, &[0x00, 0x00, 0x00, 0x00]).await;
    client.write_all(&[0x01]).await.unwrap();
    read_bytes(&mut client, 25).await; // ServerInit

    let session = task.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Running);
}

#[tokio::test]
async fn vnc_auth_rejects_a_wrong_password() {
    let options = SessionOptions {
        password: Some("secret".to_string()),
        ..SessionOptions::default()
    };
    let (mut client, server) = tokio::io::duplex(1 << 16);
    let task = tokio::spawn(VncServerSession::connect(
        server,
        options,
        Box::new(StaticSource::new(tiny_framebuffer())),
        SessionListeners::default(),
    ));

    expect_bytes(&mut client, BANNER).await;
    client.write_all(BANNER).await.unwrap();
    expect_bytes(&mut client, &[0x01, 0x02]).await;
    client.write_all(&[0x02]).await.unwrap();

    let challenge_bytes = read_bytes(&mut client, 16).await;
    let mut challenge = [0u8; 16];
    challenge.copy_from_slice(&challenge_bytes);
    let response = vnc_des_response(&challenge, "wrong");
    client.write_all(&response).await.unwrap();

    // SecurityResult failed plus a reason string
    expect_bytes(&mut client, &[0x00, 0x00, 0x00, 0x01]).await;
    let len = {
        let raw = read_bytes(&mut client, 4).await;
        u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
    };
    read_bytes(&mut client, len).await;

    assert!(task.await.unwrap().is_err());
}

#[tokio::test]
async fn input_opcodes_fire_their_events_once() {
    let keys = Arc::new(Mutex::new(Vec::new()));
    let pointers = Arc::new(Mutex::new(Vec::new()));
    let clipboards = Arc::new(Mutex::new(Vec::new()));
    let listeners = SessionListeners {
        key_changed: Some(Box::new({
            let keys = keys.clone();
            move |args| keys.lock().unwrap().push((args.keysym, args.pressed))
        })),
        pointer_changed: Some(Box::new({
            let pointers = pointers.clone();
            move |args| {
                pointers
                    .lock()
                    .unwrap()
                    .push((args.x, args.y, args.button_mask));
            }
        })),
        remote_clipboard_changed: Some(Box::new({
            let clipboards = clipboards.clone();
            move |args| clipboards.lock().unwrap().push(args.text.clone())
        })),
        ..SessionListeners::default()
    };

    let (mut client, _session) = connect_none_auth(
        StaticSource::new(tiny_framebuffer()),
        SessionOptions::default(),
        listeners,
    )
    .await;
    read_bytes(&mut client, 25).await;

    // KeyEvent: press keysym 0x41
    client
        .write_all(&[4, 1, 0, 0, 0x00, 0x00, 0x00, 0x41])
        .await
        .unwrap();
    // PointerEvent: left button at (1, 0)
    client.write_all(&[5, 1, 0, 1, 0, 0]).await.unwrap();
    // ClientCutText: "hello"
    client
        .write_all(&[6, 0, 0, 0, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'])
        .await
        .unwrap();

    // The events fire on the session task; poll briefly
    for _ in 0..50 {
        if !clipboards.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(keys.lock().unwrap().as_slice(), &[(0x41, true)]);
    assert_eq!(pointers.lock().unwrap().as_slice(), &[(1, 0, 1)]);
    assert_eq!(clipboards.lock().unwrap().as_slice(), &["hello".to_string()]);
}

#[tokio::test]
async fn unknown_opcode_closes_the_session() {
    let closed = Arc::new(AtomicBool::new(false));
    let listeners = SessionListeners {
        closed: Some(Box::new({
            let closed = closed.clone();
            move |_| closed.store(true, Ordering::SeqCst)
        })),
        ..SessionListeners::default()
    };

    let (mut client, session) = connect_none_auth(
        StaticSource::new(tiny_framebuffer()),
        SessionOptions::default(),
        listeners,
    )
    .await;
    read_bytes(&mut client, 25).await;

    client.write_all(&[99]).await.unwrap();

    for _ in 0..100 {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn set_desktop_size_answers_with_extended_desktop_size() {
    let mut source = StaticSource::new(tiny_framebuffer());
    source.resizable = true;

    let (mut client, _session) = connect_none_auth(
        source,
        SessionOptions::default(),
        SessionListeners::default(),
    )
    .await;
    read_bytes(&mut client, 25).await;

    client
        .write_all(&set_encodings(&[0, -308]))
        .await
        .unwrap();

    // SetDesktopSize 100x50 with one screen
    let mut msg = vec![251u8, 0, 0, 100, 0, 50, 1, 0];
    msg.extend_from_slice(&[0u8; 16]);
    client.write_all(&msg).await.unwrap();

    // Reply: one ExtendedDesktopSize rectangle, reason=client, status=ok
    expect_bytes(&mut client, &[0x00, 0x00, 0x00, 0x01]).await;
    expect_bytes(
        &mut client,
        &[0x00, 0x01, 0x00, 0x00, 0x00, 0x64, 0x00, 0x32, 0xff, 0xff, 0xfe, 0xcc],
    )
    .await;
    let payload = read_bytes(&mut client, 20).await;
    assert_eq!(payload[0], 1); // one screen
    assert_eq!(&payload[12..16], &[0, 100, 0, 50]);
}

#[tokio::test]
async fn bell_bytes_never_interleave_with_updates() {
    const BELLS: usize = 20;
    const UPDATES: usize = 5;

    let (mut client, session) = connect_none_auth(
        StaticSource::new(tiny_framebuffer()),
        SessionOptions {
            max_update_rate: 60,
            ..SessionOptions::default()
        },
        SessionListeners::default(),
    )
    .await;
    read_bytes(&mut client, 25).await;

    let bell_task = tokio::spawn(async move {
        for _ in 0..BELLS {
            session.bell().await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        session
    });

    let mut bells = 0;
    let mut updates = 0;
    let mut requested = 0;
    while bells < BELLS || updates < UPDATES {
        if requested == updates && requested < UPDATES {
            client
                .write_all(&update_request(false, 0, 0, 2, 1))
                .await
                .unwrap();
            requested += 1;
        }

        // Any torn message makes these reads misparse and fail loudly
        let msg_type = read_bytes(&mut client, 1).await[0];
        match msg_type {
            2 => bells += 1,
            0 => {
                let header = read_bytes(&mut client, 3).await;
                let rects = u16::from_be_bytes([header[1], header[2]]);
                for _ in 0..rects {
                    let rect_header = read_bytes(&mut client, 12).await;
                    let w = u16::from_be_bytes([rect_header[4], rect_header[5]]) as usize;
                    let h = u16::from_be_bytes([rect_header[6], rect_header[7]]) as usize;
                    let encoding = i32::from_be_bytes([
                        rect_header[8],
                        rect_header[9],
                        rect_header[10],
                        rect_header[11],
                    ]);
                    match encoding {
                        0 => {
                            read_bytes(&mut client, w * h * 4).await;
                        }
                        1 => {
                            read_bytes(&mut client, 4).await;
                        }
                        other => panic!("unexpected encoding {other}"),
                    }
                }
                updates += 1;
            }
            other => panic!("corrupted stream: unexpected message type {other}"),
        }
    }

    let _session = bell_task.await.unwrap();
}
