use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Server-assigned version of a document or target snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    /// The version carried by documents that have not been confirmed by the backend.
    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    pub fn max() -> Self {
        Self {
            timestamp: Timestamp::new(253_402_300_799, 999_999_999),
        }
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.seconds * 1_000_000 + i64::from(self.timestamp.nanos) / 1_000
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::min()
    }
}

impl From<Timestamp> for SnapshotVersion {
    fn from(timestamp: Timestamp) -> Self {
        Self::new(timestamp)
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SnapshotVersion({}.{:09})",
            self.timestamp.seconds, self.timestamp.nanos
        )
    }
}
