//! Conflict detection and resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- deciding, for each entry a sync wants to move, whether
//!    it can be overwritten or has diverged from upstream.
//! 2. **Resolution** -- closing a conflict by accepting the local copy, with
//!    one forced refresh for conflicts that only exist locally.

pub mod detector;
pub mod resolver;

pub use detector::{ConflictDetector, SyncCandidate, SyncDecision};
pub use resolver::{ConflictResolver, ConflictedRevisions};
