// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Session identifier and listener token generation.
//!
//! `id` is a public, 8-hex-char handle used in URLs and log lines; `token`
//! is a 32-hex-char secret that gates listener admission. Both are drawn
//! from the OS RNG via `rand`, never from a predictable source.

use rand::RngCore;

fn random_hex(num_bytes: usize) -> String {
    let mut bytes = vec![0u8; num_bytes];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generates an 8-hex-char public session identifier.
pub fn new_session_id() -> String {
    random_hex(4)
}

/// Generates a 32-hex-char unguessable listener token.
pub fn new_session_token() -> String {
    random_hex(16)
}
