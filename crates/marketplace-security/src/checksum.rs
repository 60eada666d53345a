use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compares a computed digest against a publisher-supplied one, ignoring case and surrounding
/// whitespace. A malformed expected digest is an error, not a mismatch.
pub fn verify_sha256_digest(actual_hex: &str, expected_hex: &str) -> Result<bool> {
    let expected = normalize_hex_digest(expected_hex)?;
    Ok(actual_hex.eq_ignore_ascii_case(&expected))
}

fn normalize_hex_digest(value: &str) -> Result<String> {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.len() != 64 || !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "invalid sha256 digest '{value}': expected 64 hex characters"
        ));
    }
    Ok(normalized)
}

#[derive(Clone, Default)]
pub struct Sha256Stream {
    hasher: Sha256,
    len: u64,
}

impl Sha256Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
