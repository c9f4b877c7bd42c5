//! Conflict detection logic.
//!
//! Backends call [`ConflictDetector::classify`] for every entry a sync wants
//! to move from its local version to a target version. The detector is pure;
//! the backend applies the decision.

use tracing::debug;

use crate::backend::ConflictKind;
use crate::status::ChangeKinds;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a sync knows about one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCandidate {
    /// Version the local content was synced to; 0 if never downloaded.
    pub local_version: u64,
    /// Version the sync wants to bring the entry to.
    pub target_version: u64,
    /// Pending change kinds recorded against the entry.
    pub pending: ChangeKinds,
    /// On-disk content no longer matches the synced baseline.
    pub disk_differs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// The entry is not touched by syncs (pending add, branch or delete).
    Skip,
    /// Already at the target version.
    UpToDate,
    /// Safe to overwrite with the target content.
    Overwrite,
    /// The entry diverged; record a conflict and leave the content alone.
    Conflict(ConflictKind),
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateless divergence classifier.
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn classify(candidate: &SyncCandidate) -> SyncDecision {
        let decision = if candidate
            .pending
            .intersects(ChangeKinds::ADD | ChangeKinds::BRANCH | ChangeKinds::DELETE)
        {
            SyncDecision::Skip
        } else if candidate.local_version == candidate.target_version {
            SyncDecision::UpToDate
        } else if candidate
            .pending
            .intersects(ChangeKinds::EDIT | ChangeKinds::MERGE)
        {
            SyncDecision::Conflict(ConflictKind::Upstream)
        } else if candidate.disk_differs {
            SyncDecision::Conflict(ConflictKind::LocalOnly)
        } else {
            SyncDecision::Overwrite
        };

        if let SyncDecision::Conflict(kind) = decision {
            debug!(
                local_version = candidate.local_version,
                target_version = candidate.target_version,
                ?kind,
                "divergence detected"
            );
        }
        decision
    }
}
