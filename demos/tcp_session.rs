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

//! TCP VNC server demo.
//!
//! Accepts connections on port 5900 and exports an animated test pattern.
//! Each accepted stream gets its own session and its own framebuffer; any
//! transport that implements `AsyncRead + AsyncWrite` would work the same
//! way (TLS, WebSocket, a Unix socket).
//!
//! Usage:
//!   cargo run --example tcp_session
//!
//! Then connect with:
//!   vncviewer localhost:5900

use std::error::Error;
use std::sync::Arc;

use rfbsession::{
    Framebuffer, FramebufferSource, PixelFormat, Result, SessionListeners, SessionOptions,
    VncServerSession,
};
use tokio::net::TcpListener;

const WIDTH: u16 = 800;
const HEIGHT: u16 = 600;

/// A capture source that redraws a scrolling gradient on every tick.
struct TestPattern {
    fb: Arc<Framebuffer>,
    frame: u32,
}

impl TestPattern {
    fn new() -> Self {
        Self {
            fb: Arc::new(Framebuffer::new(
                "rfbsession demo",
                WIDTH,
                HEIGHT,
                PixelFormat::rgb888(),
            )),
            frame: 0,
        }
    }
}

impl FramebufferSource for TestPattern {
    fn capture(&mut self) -> Result<Option<Arc<Framebuffer>>> {
        self.frame = self.frame.wrapping_add(1);
        let shift = self.frame as usize;
        {
            let stride = self.fb.stride();
            let mut data = self.fb.lock();
            for y in 0..usize::from(HEIGHT) {
                for x in 0..usize::from(WIDTH) {
                    let offset = y * stride + x * 4;
                    data[offset] = ((x + shift) * 255 / usize::from(WIDTH)) as u8; // B
                    data[offset + 1] = (y * 255 / usize::from(HEIGHT)) as u8; // G
                    data[offset + 2] = (((x + y + shift) / 4) % 256) as u8; // R
                    data[offset + 3] = 0;
                }
            }
        }
        Ok(Some(self.fb.clone()))
    }
}

fn print_listeners() -> SessionListeners {
    SessionListeners {
        connected: Some(Box::new(|_| println!("client connected"))),
        closed: Some(Box::new(|args| println!("session closed: {}", args.reason))),
        connection_failed: Some(Box::new(|args| {
            println!("connection failed: {}", args.reason);
        })),
        key_changed: Some(Box::new(|args| {
            let action = if args.pressed { "pressed" } else { "released" };
            println!("key {:#06x} {}", args.keysym, action);
        })),
        pointer_changed: Some(Box::new(|args| {
            println!(
                "pointer at ({}, {}) buttons {:03b}",
                args.x, args.y, args.button_mask
            );
        })),
        remote_clipboard_changed: Some(Box::new(|args| {
            println!(
                "clipboard: {}...",
                args.text.chars().take(30).collect::<String>()
            );
        })),
        ..SessionListeners::default()
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn Error>> {
    env_logger::init();

    let listener = TcpListener::bind("0.0.0.0:5900").await?;
    println!("VNC server listening on port 5900");
    println!("Connect with: vncviewer localhost:5900");

    loop {
        let (stream, addr) = listener.accept().await?;
        println!("connection from {addr}");
        stream.set_nodelay(true)?;

        tokio::spawn(async move {
            let options = SessionOptions {
                max_update_rate: 30,
                ..SessionOptions::default()
            };
            match VncServerSession::connect(
                stream,
                options,
                Box::new(TestPattern::new()),
                print_listeners(),
            )
            .await
            {
                Ok(mut session) => {
                    // The handle also exposes bell() and clipboard pushes;
                    // here it just keeps the session alive until it ends.
                    session.join().await;
                }
                Err(e) => eprintln!("session setup failed: {e}"),
            }
        });
    }
}
