//! Retrieved passage type (§3 Chunk).

use serde::{Deserialize, Serialize};

/// A retrieved passage with identity, metadata, and retrieval score.
///
/// Invariant: `user_id`, `doc_id`, `tenant_id`, `chunk_id` are all nonempty.
/// This is enforced at ingest time by an external pipeline; the retrieval
/// stage assumes it, but `Chunk::validate` lets internal code check it
/// defensively at the Compressor boundary (§8 invariant 2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub vector_id: String,
    pub doc_id: String,
    pub chunk_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub text: String,
    pub score: f64,
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn validate(&self) -> bool {
        !self.user_id.is_empty()
            && !self.doc_id.is_empty()
            && !self.tenant_id.is_empty()
            && !self.chunk_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(chunk_id: &str) -> Chunk {
        Chunk {
            vector_id: "v1".to_string(),
            doc_id: "d1".to_string(),
            chunk_id: chunk_id.to_string(),
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            text: "some passage text".to_string(),
            score: 0.8,
            embedding: None,
        }
    }

    #[test]
    fn valid_chunk_passes() {
        assert!(chunk("c1").validate());
    }

    #[test]
    fn empty_chunk_id_fails() {
        assert!(!chunk("").validate());
    }
}
