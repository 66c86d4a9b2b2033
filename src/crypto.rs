//! Hashing and address derivation for Lodestone
//!
//! Addresses are derived from a plain-text credential through a chained
//! double-SHA-256 walk over hex strings. The scheme, like the block solution
//! digest layout, is a wire contract with existing wallets and miners, so
//! every step is byte-exact: hashes are re-hashed as their lowercase hex
//! rendering, not as raw digest bytes.

use sha2::{Digest, Sha256};

/// Length of the block hash prefix mixed into solution digests, and of the
/// `short_hash` field exposed on block JSON.
pub const SHORT_HASH_LENGTH: usize = 12;

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn sha256_hex_str(s: &str) -> String {
    sha256_hex(s.as_bytes())
}

/// Credential hash stored against an account: SHA-256 over the address
/// string immediately followed by the private key string.
pub fn credential_hash(address: &str, privatekey: &str) -> String {
    sha256_hex_str(&format!("{}{}", address, privatekey))
}

/// Map a byte to the base36-ish alphabet used in v2 addresses. Values past
/// `z` collapse onto `e`, which is why that letter is overrepresented in
/// real addresses.
fn hex_to_base36(input: u8) -> char {
    let byte = 48 + input / 7;
    let c = if byte + 39 > 122 {
        101
    } else if byte > 57 {
        byte + 39
    } else {
        byte
    };
    c as char
}

/// Derive a v2 address from a private key.
///
/// Nine candidate bytes are collected from a double-SHA-256 chain, then
/// consumed in an order driven by further hashing until all nine have been
/// picked.
pub fn make_v2_address(key: &str, prefix: &str) -> String {
    let mut chars: [Option<u8>; 9] = [None; 9];
    let mut address = String::from(prefix);
    let mut hash = sha256_hex_str(&sha256_hex_str(key));

    for slot in chars.iter_mut() {
        *slot = u8::from_str_radix(&hash[0..2], 16).ok();
        hash = sha256_hex_str(&sha256_hex_str(&hash));
    }

    let mut picked = 0;
    while picked < 9 {
        let index =
            usize::from_str_radix(&hash[2 * picked..2 * picked + 2], 16).unwrap_or(0) % 9;
        match chars[index].take() {
            Some(byte) => {
                address.push(hex_to_base36(byte));
                picked += 1;
            }
            None => hash = sha256_hex_str(&hash),
        }
    }

    address
}

/// Syntactic address check. v2 addresses are the configured prefix plus
/// nine lowercase base36 characters; legacy v1 addresses are ten lowercase
/// hex characters and only pass when `allow_v1` is set.
pub fn is_valid_address(address: &str, prefix: &str, allow_v1: bool) -> bool {
    if address.len() == prefix.len() + 9
        && address.starts_with(prefix)
        && address[prefix.len()..]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return true;
    }
    allow_v1 && address.len() == 10 && address.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// The solution digest a miner must land under the work threshold:
/// `sha256(solver ++ last_block_hash[0..12] ++ raw nonce bytes)` as hex.
pub fn solution_hash(solver: &str, last_block_hash: &str, nonce: &[u8]) -> String {
    let prefix = last_block_hash
        .as_bytes()
        .get(..SHORT_HASH_LENGTH)
        .unwrap_or_else(|| last_block_hash.as_bytes());
    let mut input = Vec::with_capacity(solver.len() + prefix.len() + nonce.len());
    input.extend_from_slice(solver.as_bytes());
    input.extend_from_slice(prefix);
    input.extend_from_slice(nonce);
    sha256_hex(&input)
}

/// Numeric value of a solution digest: its first twelve hex digits as an
/// integer. The work inequality is tested against this 48-bit prefix.
pub fn solution_value(hash_hex: &str) -> u64 {
    match hash_hex.get(..SHORT_HASH_LENGTH) {
        Some(prefix) => u64::from_str_radix(prefix, 16).unwrap_or(u64::MAX),
        None => u64::MAX,
    }
}
