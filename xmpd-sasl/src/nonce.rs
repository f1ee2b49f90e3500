//! Random identifiers for nonces, stream ids and generated resources.

use rand::RngCore;

/// Returns 128 random bits as 32 lowercase hex digits.
#[must_use]
pub fn generate_id() -> String {
    let mut bytes = [0_u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
