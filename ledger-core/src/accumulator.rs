//! Transaction accumulator chain
//!
//! Each committed transaction extends a running 32-byte accumulator:
//! `next = SHA256(SHA256(parent || child))`. The same double hash over a raw
//! payload yields the transaction identifier.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Length of accumulators and transaction identifiers
pub const HASH_LENGTH: usize = 32;

/// A 32-byte accumulator or identifier hash
pub type Hash32 = [u8; HASH_LENGTH];

/// Accumulator before the first transaction
pub const PRE_GENESIS_ACCUMULATOR: Hash32 = [0u8; HASH_LENGTH];

fn double_sha256(data: &[u8]) -> Hash32 {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

fn check_length(bytes: &[u8]) -> Result<()> {
    if bytes.len() != HASH_LENGTH {
        return Err(Error::InvalidHashLength {
            expected: HASH_LENGTH,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Accumulator after appending `child` to `parent`
pub fn compute_next(parent: &[u8], child: &[u8]) -> Result<Hash32> {
    check_length(parent)?;
    check_length(child)?;

    let mut concatenated = [0u8; HASH_LENGTH * 2];
    concatenated[..HASH_LENGTH].copy_from_slice(parent);
    concatenated[HASH_LENGTH..].copy_from_slice(child);
    Ok(double_sha256(&concatenated))
}

/// Whether `claimed_next` is the accumulator obtained by appending `child` to `parent`.
///
/// A claim of the wrong length is simply invalid; wrong-length inputs are an error.
pub fn is_valid_continuation(parent: &[u8], child: &[u8], claimed_next: &[u8]) -> Result<bool> {
    let next = compute_next(parent, child)?;
    Ok(claimed_next == next.as_slice())
}

/// Identifier hash of a raw transaction payload
pub fn hash_payload(payload: &[u8]) -> Hash32 {
    double_sha256(payload)
}

/// Whether `claimed_hash` identifies `payload`
pub fn is_valid_payload_hash(payload: &[u8], claimed_hash: &[u8]) -> bool {
    claimed_hash == hash_payload(payload).as_slice()
}
