use sha2::{Digest, Sha256};

/// Computes a deterministic SHA-256 checksum over a serialized backup
/// payload, hex encoded. Recorded in the backup metadata at write time and
/// verified when chunks are reassembled on restore.
pub fn content_checksum(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}
