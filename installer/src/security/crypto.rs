// Cryptographic utilities

use anyhow::Result;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

/// Length of generated secrets, both in raw random bytes and in output characters.
pub const SECRET_LENGTH: usize = 120;

/// Generate a secret suitable for the environment file (salt, cookie validation key).
///
/// 120 bytes from the OS CSPRNG, base64 encoded, with `+` `/` `=` translated to `_` `-` `.`
/// and truncated to 120 characters. Consumers rely on the resulting alphabet
/// `[A-Za-z0-9_\-.]`.
pub fn generate_secret() -> Result<String> {
    let mut bytes = [0u8; SECRET_LENGTH];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("Failed to generate random bytes for secret"))?;
    Ok(encode_secret(&bytes))
}

/// Deterministic half of [`generate_secret`].
pub fn encode_secret(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD
        .encode(bytes)
        .chars()
        .take(SECRET_LENGTH)
        .map(|c| match c {
            '+' => '_',
            '/' => '-',
            '=' => '.',
            other => other,
        })
        .collect()
}

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compute a safe fingerprint for a secret (hash prefix only; never log the raw secret).
pub fn secret_fingerprint(input: &str) -> String {
    sha256_hex(input.as_bytes())[..12].to_string()
}
