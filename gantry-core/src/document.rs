//! Opaque documents flowing through the router.
//!
//! The router never decodes document contents: it moves encoded payloads
//! between shard replies and client batches, and orders them by the sort key
//! a shard extracted alongside each payload.

use bytes::Bytes;

use crate::sort::SortKey;

/// One encoded document plus its optional extracted sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    payload: Bytes,
    sort_key: Option<SortKey>,
}

impl Document {
    /// Creates a document with no sort key.
    #[must_use]
    pub const fn new(payload: Bytes) -> Self {
        Self {
            payload,
            sort_key: None,
        }
    }

    /// Creates a document tagged with an extracted sort key.
    #[must_use]
    pub const fn with_sort_key(payload: Bytes, sort_key: SortKey) -> Self {
        Self {
            payload,
            sort_key: Some(sort_key),
        }
    }

    /// Returns the encoded payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the extracted sort key, if the producing shard attached one.
    #[must_use]
    pub const fn sort_key(&self) -> Option<&SortKey> {
        self.sort_key.as_ref()
    }

    /// Returns the encoded size in bytes, used for reply-size budgeting.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::SortValue;

    #[test]
    fn test_document_size() {
        let doc = Document::new(Bytes::from_static(b"0123456789"));
        assert_eq!(doc.size_bytes(), 10);
        assert!(doc.sort_key().is_none());
    }

    #[test]
    fn test_document_sort_key() {
        let doc = Document::with_sort_key(
            Bytes::from_static(b"x"),
            SortKey::single(SortValue::Int(4)),
        );
        assert_eq!(doc.sort_key().unwrap().len(), 1);
    }
}
