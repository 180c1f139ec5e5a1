use std::fmt::{Display, Formatter};

use crate::firestore::model::{DocumentKey, FieldPath, ObjectValue, SnapshotVersion};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentType {
    /// Placeholder for a key with no known state.
    Invalid,
    FoundDocument,
    /// The backend confirmed that no document exists at this version.
    NoDocument,
    /// Known to exist at a version, but contents were never observed (patch ack).
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// Document state as tracked by the local cache.
///
/// Constructed through the `new_*` functions only; transitions mutate the
/// instance in place. Values handed across the cache boundary are copies
/// made with [`MutableDocument::mutable_copy`].
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: ObjectValue,
    document_state: DocumentState,
}

impl MutableDocument {
    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            create_time: SnapshotVersion::min(),
            data: ObjectValue::empty(),
            document_state: DocumentState::Synced,
        }
    }

    pub fn new_found_document(
        key: DocumentKey,
        version: SnapshotVersion,
        create_time: SnapshotVersion,
        data: ObjectValue,
    ) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_found_document(version, data);
        document.create_time = create_time;
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_unknown_document(version);
        document
    }

    pub fn convert_to_found_document(
        &mut self,
        version: SnapshotVersion,
        data: ObjectValue,
    ) -> &mut Self {
        // A document that was missing gains its create time from this version.
        if self.create_time.is_min()
            && matches!(
                self.document_type,
                DocumentType::NoDocument | DocumentType::Invalid
            )
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = ObjectValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = ObjectValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    /// Local writes have no server version until they are acknowledged.
    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn mutable_copy(&self) -> Self {
        self.clone()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn document_state(&self) -> DocumentState {
        self.document_state
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ObjectValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    /// Unacknowledged local writes only. Acknowledged writes still waiting
    /// for the watch stream show up as [`Self::has_committed_mutations`].
    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations()
    }

    /// Only found documents carry data that queries can match.
    pub fn is_valid_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    /// `true` for placeholders of keys whose state has never been observed.
    pub fn is_invalid_document(&self) -> bool {
        self.document_type == DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }
}

impl Display for MutableDocument {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Document({}, {}, {:?}, {:?})",
            self.key, self.version, self.document_type, self.document_state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn invalid_document_defaults() {
        let doc = MutableDocument::new_invalid_document(key());
        assert!(!doc.is_valid_document());
        assert!(doc.is_invalid_document());
        assert!(doc.version().is_min());
        assert!(!doc.has_pending_writes());
    }

    #[test]
    fn local_mutations_reset_version() {
        let mut doc =
            MutableDocument::new_found_document(key(), version(5), version(1), ObjectValue::empty());
        doc.set_has_local_mutations();
        assert!(doc.has_local_mutations());
        assert!(doc.version().is_min());
    }

    #[test]
    fn conversions_update_state() {
        let mut doc = MutableDocument::new_no_document(key(), version(2));
        assert!(doc.is_no_document());
        assert!(!doc.is_valid_document());
        doc.convert_to_found_document(version(3), ObjectValue::empty());
        assert!(doc.is_found_document());
        assert_eq!(doc.create_time(), version(3));
        doc.convert_to_unknown_document(version(4));
        assert!(doc.is_unknown_document());
        assert!(doc.has_committed_mutations());
    }

    #[test]
    fn mutable_copy_is_independent() {
        let original = MutableDocument::new_no_document(key(), version(2));
        let mut copy = original.mutable_copy();
        copy.set_has_local_mutations();
        assert!(!original.has_local_mutations());
    }

    #[test]
    fn committed_mutations_are_not_pending_writes() {
        let mut doc =
            MutableDocument::new_found_document(key(), version(5), version(1), ObjectValue::empty());
        doc.set_has_committed_mutations();
        assert!(doc.has_committed_mutations());
        assert!(!doc.has_pending_writes());
    }
}
