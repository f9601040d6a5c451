//! Integrity and identifier hashes

use sha1::{Digest, Sha1};

use crate::error::{BytecodeError, Result};
use crate::format::{FileHeader, HASH_SIZE};

/// SHA-1 digest.
pub type Sha1Hash = [u8; HASH_SIZE];

/// SHA-1 of `data`.
pub fn sha1(data: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn structured_len(buffer: &[u8]) -> Result<usize> {
    let header = FileHeader::read(buffer)?;
    let file_length = header.file_length as usize;
    if file_length < HASH_SIZE || file_length > buffer.len() {
        return Err(BytecodeError::FileLengthMismatch {
            file_length,
            buffer_len: buffer.len(),
        });
    }
    Ok(file_length)
}

/// The footer hash stored in `buffer`.
pub fn bytecode_hash(buffer: &[u8]) -> Result<Sha1Hash> {
    let end = structured_len(buffer)?;
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&buffer[end - HASH_SIZE..end]);
    Ok(out)
}

/// Whether the footer matches the hash of everything before it.
pub fn hash_is_valid(buffer: &[u8]) -> bool {
    match structured_len(buffer) {
        Ok(end) => sha1(&buffer[..end - HASH_SIZE])[..] == buffer[end - HASH_SIZE..end],
        Err(_) => false,
    }
}

/// Recomputes the footer in place.
pub fn update_hash(buffer: &mut [u8]) -> Result<()> {
    let end = structured_len(buffer)?;
    let digest = sha1(&buffer[..end - HASH_SIZE]);
    buffer[end - HASH_SIZE..end].copy_from_slice(&digest);
    Ok(())
}

/// Jenkins one-at-a-time hash over UTF-16 code units.
pub fn jenkins_hash_utf16(units: impl IntoIterator<Item = u16>) -> u32 {
    let mut hash: u32 = 0;
    for unit in units {
        hash = hash.wrapping_add(unit as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// Identifier hash of `s`.
pub fn identifier_hash(s: &str) -> u32 {
    jenkins_hash_utf16(s.encode_utf16())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_known_vector() {
        let digest = sha1(b"abc");
        assert_eq!(digest[..4], [0xa9, 0x99, 0x3e, 0x36]);
    }

    #[test]
    fn jenkins_is_stable_and_distinguishes() {
        assert_eq!(identifier_hash(""), 0);
        assert_eq!(identifier_hash("length"), identifier_hash("length"));
        assert_ne!(identifier_hash("length"), identifier_hash("lengtH"));
        assert_eq!(
            identifier_hash("ab"),
            jenkins_hash_utf16([b'a' as u16, b'b' as u16])
        );
    }

    #[test]
    fn hash_helpers_reject_garbage() {
        assert!(!hash_is_valid(&[0u8; 16]));
        assert!(bytecode_hash(&[0u8; 16]).is_err());
    }
}
