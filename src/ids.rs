//! Hash-addressed identity.
//!
//! Every primary entity carries a 32-bit ID derived from its stable
//! attributes via SHA-256, so ingestion can be restarted, re-ordered, or
//! partially replayed without renumbering, and cross-table references
//! survive a full table rebuild.
//!
//! SQLite stores the IDs as `INTEGER`; [`Id`] is `u32` in memory and
//! widened to `i64` at the storage boundary.

use sha2::{Digest, Sha256};

/// 32-bit hash-addressed entity ID.
pub type Id = u32;

/// First four bytes of SHA-256 over `data`, big-endian.
pub fn hash_bytes(data: &[u8]) -> Id {
    let digest = Sha256::digest(data);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Full SHA-256 hex digest, used for content hashes (documents, chunks).
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Catalog entry ID: hash of the absolute source path.
pub fn catalog_id(source: &str) -> Id {
    hash_bytes(source.as_bytes())
}

/// Chunk ID: hash of `(catalog_id, chunk_index)`.
pub fn chunk_id(catalog: Id, chunk_index: usize) -> Id {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&catalog.to_be_bytes());
    buf.extend_from_slice(&(chunk_index as u64).to_be_bytes());
    hash_bytes(&buf)
}

/// Concept ID: hash of the normalized name.
pub fn concept_id(name: &str) -> Id {
    hash_bytes(normalize_name(name).as_bytes())
}

/// Category ID: hash of the normalized name.
pub fn category_id(name: &str) -> Id {
    hash_bytes(normalize_name(name).as_bytes())
}

/// Page ID: hash of `(catalog_id, page_number)`.
pub fn page_id(catalog: Id, page_number: u32) -> Id {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&catalog.to_be_bytes());
    buf.extend_from_slice(&page_number.to_be_bytes());
    hash_bytes(&buf)
}

/// Normalize an entity name: lower-case, trim, collapse internal whitespace.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        assert_eq!(catalog_id("/books/a.pdf"), catalog_id("/books/a.pdf"));
        assert_ne!(catalog_id("/books/a.pdf"), catalog_id("/books/b.pdf"));
    }

    #[test]
    fn chunk_ids_distinct_per_index() {
        let c = catalog_id("/books/a.pdf");
        assert_ne!(chunk_id(c, 0), chunk_id(c, 1));
        assert_eq!(chunk_id(c, 3), chunk_id(c, 3));
    }

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_name("  Machine   Learning "), "machine learning");
        assert_eq!(normalize_name("Innovation"), "innovation");
    }

    #[test]
    fn concept_id_uses_normalized_name() {
        assert_eq!(concept_id("  Machine  Learning"), concept_id("machine learning"));
    }

    #[test]
    fn content_hash_is_hex_sha256() {
        let h = content_hash(b"hello");
        assert_eq!(h.len(), 64);
        assert_eq!(content_hash(b"hello"), h);
        assert_ne!(content_hash(b"hello!"), h);
    }
}
