//! Daemon auth tokens
//!
//! Each daemon start gets a fresh random token, handed to the daemon through
//! its environment and echoed back in `connection.json`. The orchestrator
//! treats it as opaque.

use rand::Rng;

/// Length of the token in bytes (before hex encoding)
const TOKEN_BYTES: usize = 32;

/// Generate a new random token as a 64-character hex string
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
