use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::constants::STATIC_SESSION_TOKEN;
use crate::utils::current_timestamp_millis;

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generate a random lowercase hex identifier, used for stream names
///
/// Random bytes are salted with the current time and hashed, then cut to `length`
/// characters (at most 64).
pub fn generate_unique_string(length: usize) -> String {
    let mut salt = vec![0u8; length.max(1)];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut hash = sha256_hex(&format!("{}-{}", to_hex(&salt), current_timestamp_millis()));
    hash.truncate(length);
    hash
}

/// Produces session tokens for newly connected clients
///
/// With dynamic generation the token is derived from a caller-supplied salt
/// (remote address, remote port and announced local address). Without it every
/// client shares the single static session. Tokens are not checked for collisions.
#[derive(Debug, Clone, Copy)]
pub struct SubdomainGenerator {
    dynamic: bool,
    length: usize,
}

impl SubdomainGenerator {
    pub fn new(dynamic: bool, length: usize) -> Self {
        Self { dynamic, length }
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn session_token(&self, salt: &str) -> String {
        if !self.dynamic {
            return STATIC_SESSION_TOKEN.to_string();
        }

        let mut hash = sha256_hex(salt);
        hash.truncate(self.length);
        hash
    }
}
