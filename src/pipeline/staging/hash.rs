use base64::Engine;
use sha2::{Digest, Sha256};

/// SHA-256 of the staged bytes, base64 encoded. Recorded on the preview so
/// the original can be matched later without storing a second copy.
pub fn content_hash(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    base64::engine::general_purpose::STANDARD.encode(hash)
}
