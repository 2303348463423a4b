//! chap-sha1 authentication.
//!
//! The greeting carries a base64 salt; the client proves knowledge of the
//! password without sending it:
//!
//! ```text
//! step1    = sha1(password)
//! step2    = sha1(step1)
//! step3    = sha1(salt[..20] ++ step2)
//! scramble = step1 XOR step3
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Size of the greeting sent by the server on connect.
pub const GREETING_SIZE: usize = 128;

const SCRAMBLE_SIZE: usize = 20;

/// Parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// First line, e.g. "Tarantool 2.11.1 (Binary) 1c3b3e6f-..."
    pub version: String,
    /// Base64 salt from the second line
    pub salt: String,
}

impl Greeting {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < GREETING_SIZE {
            return Err(Error::Protocol("Incomplete greeting".to_string()));
        }

        let version = String::from_utf8_lossy(&raw[..64]).trim().to_string();
        if !version.starts_with("Tarantool") {
            return Err(Error::Protocol(format!("Unexpected greeting: {}", version)));
        }
        let salt = String::from_utf8_lossy(&raw[64..GREETING_SIZE]).trim().to_string();

        Ok(Self { version, salt })
    }
}

/// Compute the chap-sha1 scramble for `password` and the greeting salt.
pub fn scramble(salt: &str, password: &str) -> Result<[u8; SCRAMBLE_SIZE]> {
    let salt = STANDARD
        .decode(salt.as_bytes())
        .map_err(|e| Error::Protocol(format!("Invalid salt: {}", e)))?;
    if salt.len() < SCRAMBLE_SIZE {
        return Err(Error::Protocol("Salt is too short".to_string()));
    }

    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SIZE]);
    hasher.update(step2);
    let step3 = hasher.finalize();

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = step1[i] ^ step3[i];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting_bytes(version: &str, salt: &str) -> Vec<u8> {
        let mut raw = vec![b' '; GREETING_SIZE];
        raw[..version.len()].copy_from_slice(version.as_bytes());
        raw[63] = b'\n';
        raw[64..64 + salt.len()].copy_from_slice(salt.as_bytes());
        raw[127] = b'\n';
        raw
    }

    #[test]
    fn test_parse_greeting() {
        let raw = greeting_bytes("Tarantool 2.11.1 (Binary) uuid", "c2FsdHNhbHRzYWx0c2FsdHNhbHQ=");
        let greeting = Greeting::parse(&raw).unwrap();
        assert_eq!(greeting.version, "Tarantool 2.11.1 (Binary) uuid");
        assert_eq!(greeting.salt, "c2FsdHNhbHRzYWx0c2FsdHNhbHQ=");
    }

    #[test]
    fn test_parse_rejects_foreign_greeting() {
        let raw = greeting_bytes("SSH-2.0-OpenSSH", "");
        assert!(Greeting::parse(&raw).is_err());
        assert!(Greeting::parse(b"Tarantool").is_err());
    }

    #[test]
    fn test_scramble_reverses_with_stored_hash() {
        // The server stores step2 and checks sha1(scramble XOR step3) == step2.
        let salt = STANDARD.encode([7u8; 32]);
        let out = scramble(&salt, "secret").unwrap();

        let step1 = Sha1::digest(b"secret");
        let step2 = Sha1::digest(step1);
        let mut hasher = Sha1::new();
        hasher.update([7u8; SCRAMBLE_SIZE]);
        hasher.update(step2);
        let step3 = hasher.finalize();

        let recovered: Vec<u8> = out.iter().zip(step3.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(Sha1::digest(&recovered), step2);
    }

    #[test]
    fn test_scramble_rejects_short_salt() {
        let salt = STANDARD.encode([1u8; 8]);
        assert!(scramble(&salt, "secret").is_err());
    }
}
