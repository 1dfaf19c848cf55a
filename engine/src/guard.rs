//! Per-row version conflict resolution.
//!
//! The guard decides whether an incoming change is newer than the stored
//! state. The rule: apply only if no row exists, or the incoming version is
//! strictly greater than the stored one. Equal or lesser versions are
//! skipped without error, so redelivery and reordering on the bus are
//! absorbed silently. Ties favor the already-applied state.

use crate::{event::EventKind, Attributes, Version};

/// What to do with one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No stored row; create it
    Insert,
    /// Stored row is older; overwrite it
    Replace,
    /// Stored row is older; remove it
    Remove,
    /// Stored row is as new or newer; leave it untouched
    SkipStale,
    /// Destroy for a row that does not exist; nothing to do
    SkipAbsent,
}

impl Decision {
    /// Whether this decision results in a storage write.
    pub fn is_write(&self) -> bool {
        matches!(self, Decision::Insert | Decision::Replace | Decision::Remove)
    }
}

pub struct VersionGuard;

impl VersionGuard {
    /// Decide the fate of one row given its stored version (absent if the
    /// row does not exist) and the incoming event version.
    pub fn decide(stored: Option<Version>, incoming: Version, kind: EventKind) -> Decision {
        match (kind, stored) {
            (EventKind::Update, None) => Decision::Insert,
            (EventKind::Update, Some(current)) if incoming > current => Decision::Replace,
            (EventKind::Update, Some(_)) => Decision::SkipStale,
            (EventKind::Destroy, None) => Decision::SkipAbsent,
            (EventKind::Destroy, Some(current)) if incoming > current => Decision::Remove,
            (EventKind::Destroy, Some(_)) => Decision::SkipStale,
        }
    }

    /// Read the stored version out of a row. A row without a parseable
    /// version stamp (created locally, never synced) counts as version 0 and
    /// loses to any incoming change.
    pub fn stored_version(row: &Attributes, version_column: &str) -> Version {
        row.get(version_column).and_then(|v| v.as_u64()).unwrap_or(0)
    }
}
