//! 📦 Common data structures: the building blocks of seglift.
//!
//! 🎬 COLD OPEN: INT. S3 BUCKET, SA-EAST-1, 3:47 AM
//!
//! A thousand log segments sit in a prefix, each one stamped with the second
//! it was born. They will be downloaded five at a time. They will finish in
//! whatever order the network feels like. And then, somehow, they must be
//! handed downstream in the exact order they were listed. These two structs
//! are the luggage tags that make that possible.
//!
//! 🧠 Knowledge graph:
//! - `ObjectDescriptor`: created once by the selector, read-only afterwards.
//!   Its `sequence_index` is the one true ordering. Nothing else gets a vote.
//! - `IndexedPayload`: created by a fetch worker on success, owned by the
//!   reorder buffer until flushed, then owned by the consumer.
//!
//! 🦆

use crate::content::SegmentContent;

/// 🏷️ A selected remote object: its key, the timestamp parsed out of its name,
/// and the position it was assigned at selection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// 🗝️ Full object key, prefix included
    pub key: String,
    /// ⏱️ Unix epoch seconds, parsed from the key's name
    pub timestamp: i64,
    /// 🔢 0-based, unique, defines total emission order
    pub sequence_index: usize,
}

impl ObjectDescriptor {
    /// 🏗️ Bundle a key, its timestamp and its index.
    pub fn new(key: impl Into<String>, timestamp: i64, sequence_index: usize) -> Self {
        Self {
            key: key.into(),
            timestamp,
            sequence_index,
        }
    }

    /// 📄 The last path segment of the key. `pid/rds_log_a_1` → `rds_log_a_1`.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// 📦 A fetched segment tagged with its position in the ordered selection.
///
/// The content is exclusively owned by the payload. Drop it (or call
/// [`IndexedPayload::release`]) and the bytes, spooled temp file included, are gone.
#[derive(Debug)]
pub struct IndexedPayload {
    /// 🔢 Same value as `descriptor.sequence_index`, hoisted for the hot path
    pub index: usize,
    pub descriptor: ObjectDescriptor,
    pub content: SegmentContent,
}

impl IndexedPayload {
    /// 🏗️ Wrap fetched content for the descriptor. The index comes from the descriptor,
    /// so a worker cannot accidentally tag content with someone else's number.
    pub fn new(descriptor: ObjectDescriptor, content: SegmentContent) -> Self {
        Self {
            index: descriptor.sequence_index,
            descriptor,
            content,
        }
    }

    /// 🗑️ Release the content without emitting it anywhere.
    pub fn release(self) {
        self.content.release(&self.descriptor.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_file_name_drops_the_prefix() {
        let descriptor = ObjectDescriptor::new("pid/rds_log_abc_1698228000", 1698228000, 0);
        assert_eq!(descriptor.file_name(), "rds_log_abc_1698228000");
    }

    #[test]
    fn the_one_where_a_bare_key_is_its_own_file_name() {
        let descriptor = ObjectDescriptor::new("rds_log_abc_1698228000", 1698228000, 0);
        assert_eq!(descriptor.file_name(), "rds_log_abc_1698228000");
    }

    #[test]
    fn the_one_where_the_payload_inherits_the_descriptor_index() {
        let descriptor = ObjectDescriptor::new("pid/rds_log_abc_1", 1, 7);
        let payload = IndexedPayload::new(descriptor, SegmentContent::Memory(b"hi".to_vec()));
        assert_eq!(payload.index, 7);
    }
}
