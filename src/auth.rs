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

//! VNC authentication.
//!
//! Implements VNC Authentication (security type 2) as specified in RFC 6143
//! Section 7.2.2: a 16-byte random challenge the client encrypts with DES
//! using the shared password as the key, with the historical quirk that the
//! bits of every password byte are reversed first.
//!
//! The session talks to authentication through the [`PasswordChallenge`]
//! trait so hosts can swap in their own verifier (token lookup, PAM, a
//! one-time password). [`VncAuth`] is the standard implementation.
//!
//! # Security Note
//!
//! VNC Authentication is a legacy protocol and has known security
//! limitations. It should only be used on trusted networks or in
//! conjunction with TLS tunneling.

use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::Rng;

/// Challenge generation and response verification for the security
/// handshake.
///
/// Implementations must be deterministic in `verify_response` for a given
/// challenge/response pair; the session may additionally let a
/// `PasswordProvided` listener override the verdict.
pub trait PasswordChallenge: Send + Sync {
    /// Produces the 16 random bytes sent to the client.
    fn generate_challenge(&self) -> [u8; 16];

    /// Checks the client's encrypted response against the challenge.
    fn verify_response(&self, challenge: &[u8; 16], response: &[u8; 16]) -> bool;
}

/// The standard DES challenge-response verifier.
///
/// With no password configured every response is rejected; combined with
/// the security-type negotiation this means password-less servers never
/// offer VNC authentication in the first place.
pub struct VncAuth {
    password: Option<String>,
}

impl VncAuth {
    /// Creates a verifier for the given password.
    #[must_use]
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }

    /// Encrypts a 16-byte challenge with the VNC password.
    ///
    /// The password is truncated or zero-padded to 8 bytes and each byte is
    /// bit-reversed before use as the DES key. The challenge is encrypted
    /// as two 8-byte blocks in ECB mode.
    fn encrypt_challenge(challenge: &[u8; 16], password: &str) -> [u8; 16] {
        let mut key = [0u8; 8];
        for (i, &byte) in password.as_bytes().iter().take(8).enumerate() {
            key[i] = reverse_bits(byte);
        }

        let cipher = Des::new_from_slice(&key).expect("8-byte key");

        let mut encrypted = [0u8; 16];
        for (block_index, chunk) in challenge.chunks_exact(8).enumerate() {
            let mut block_bytes = [0u8; 8];
            block_bytes.copy_from_slice(chunk);
            let mut block = block_bytes.into();
            cipher.encrypt_block(&mut block);
            encrypted[block_index * 8..block_index * 8 + 8].copy_from_slice(&block);
        }

        // The key holds password-derived material
        key.fill(0);
        encrypted
    }
}

impl PasswordChallenge for VncAuth {
    fn generate_challenge(&self) -> [u8; 16] {
        let mut rng = rand::rng();
        let mut challenge = [0u8; 16];
        rng.fill(&mut challenge);
        challenge
    }

    fn verify_response(&self, challenge: &[u8; 16], response: &[u8; 16]) -> bool {
        let Some(ref password) = self.password else {
            return false;
        };
        let mut expected = Self::encrypt_challenge(challenge, password);
        let matches = constant_time_eq(response, &expected);
        expected.fill(0);
        matches
    }
}

/// Compares two buffers without data-dependent early exit.
fn constant_time_eq(a: &[u8; 16], b: &[u8; 16]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Reverses the bits within a single byte.
///
/// VNC authentication inherits a historical quirk where password bytes
/// have their bits reversed before being used as a DES key.
fn reverse_bits(byte: u8) -> u8 {
    let mut result = 0u8;
    for i in 0..8 {
        if byte & (1 << i) != 0 {
            result |= 1 << (7 - i);
        }
    }
    result
}
