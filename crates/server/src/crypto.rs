//! Small crypto helpers shared by `credentials` and `store`.
//!
//! Follows this lineage's existing idiom of reading `/dev/urandom` directly
//! and doing a manual XOR-accumulate constant-time compare, rather than
//! pulling in a dedicated constant-time-compare crate.

use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io::Read;

/// Constant-time byte comparison to prevent timing side-channel attacks.
/// Returns true only if both slices have equal length and identical contents.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Read `n` cryptographically random bytes from `/dev/urandom`.
fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    let f = std::fs::File::open("/dev/urandom").expect("failed to open /dev/urandom");
    (&f).read_exact(&mut bytes).expect("failed to read random bytes");
    bytes
}

/// Generate a random hex token of `n` random bytes (string length `2*n`).
pub fn random_token_hex(n: usize) -> String {
    let bytes = random_bytes(n);
    let mut hex = String::with_capacity(n * 2);
    for b in &bytes {
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}

/// SHA-256 digest of `data`, hex-encoded.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let digest = Sha256::digest(data.as_ref());
    let mut hex = String::with_capacity(64);
    for b in digest.as_slice() {
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}

/// Salted digest of an agent-scoped shared secret. The `agent_id` acts as the
/// salt: identical secrets on two different agents never collide on the
/// stored digest.
pub fn hash_agent_secret(agent_id: &str, secret: &str) -> String {
    sha256_hex(format!("{agent_id}:{secret}"))
}

/// Hex alphabet for pairing codes: 32 symbols, omitting visually ambiguous
/// characters (no 0/O/1/I).
const PAIRING_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Generate an 8-character pairing code from the unambiguous alphabet.
pub fn generate_pairing_code() -> String {
    let raw = random_bytes(8);
    raw.iter()
        .map(|b| PAIRING_ALPHABET[(*b as usize) % PAIRING_ALPHABET.len()] as char)
        .collect()
}

/// Generate a server-side opaque id (device id, account id, refresh/access
/// bearer value) as a hex string.
pub fn generate_id(n_bytes: usize) -> String {
    random_token_hex(n_bytes)
}
