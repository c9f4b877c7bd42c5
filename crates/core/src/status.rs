//! Status derivation.
//!
//! The status engine turns the raw signals a backend reports for an entry
//! (tracking record, pending change kinds, lock, conflict) into a normalized
//! [`FileState`]. Everything here is pure: no I/O, no backend calls.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{ConflictRecord, TrackedItem};
use crate::revision::Revision;

// ---------------------------------------------------------------------------
// Change kinds
// ---------------------------------------------------------------------------

/// A set of pending change kinds recorded against one entry.
///
/// Kinds coexist: an entry that is both edited and locked carries
/// `EDIT | LOCK`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeKinds(u8);

impl ChangeKinds {
    pub const NONE: Self = Self(0);
    pub const ADD: Self = Self(1 << 0);
    pub const EDIT: Self = Self(1 << 1);
    pub const DELETE: Self = Self(1 << 2);
    pub const RENAME: Self = Self(1 << 3);
    pub const BRANCH: Self = Self(1 << 4);
    pub const MERGE: Self = Self(1 << 5);
    pub const LOCK: Self = Self(1 << 6);

    const NAMES: [(Self, &'static str); 7] = [
        (Self::ADD, "add"),
        (Self::EDIT, "edit"),
        (Self::DELETE, "delete"),
        (Self::RENAME, "rename"),
        (Self::BRANCH, "branch"),
        (Self::MERGE, "merge"),
        (Self::LOCK, "lock"),
    ];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every kind in `other` is present.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if at least one kind in `other` is present.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// A copy with `other` removed.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for ChangeKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for ChangeKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(kind, _)| self.contains(*kind))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("+"))
    }
}

// ---------------------------------------------------------------------------
// Normalized state
// ---------------------------------------------------------------------------

/// Normalized local status of a working-copy entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalStatus {
    NotUnderCm,
    Added,
    Deleted,
    Modified,
    Unmodified,
    Conflicted,
    Unknown,
}

impl fmt::Display for LocalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotUnderCm => write!(f, "NOT_UNDER_CM"),
            Self::Added => write!(f, "ADDED"),
            Self::Deleted => write!(f, "DELETED"),
            Self::Modified => write!(f, "MODIFIED"),
            Self::Unmodified => write!(f, "UNMODIFIED"),
            Self::Conflicted => write!(f, "CONFLICTED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A side-channel property reported next to the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProperty {
    pub name: String,
    pub kind: String,
    /// Whether the property represents a local modification.
    pub is_modification: bool,
}

impl FileProperty {
    fn new(name: &str, kind: &str, is_modification: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            is_modification,
        }
    }
}

pub const PROPERTY_KIND_LATEST: &str = "latest";

/// The normalized state of one entry, recomputed on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub status: LocalStatus,
    pub revision: Option<Revision>,
    pub has_lock: bool,
    pub properties: Vec<FileProperty>,
}

impl FileState {
    /// State of an entry the backend does not know about.
    pub fn untracked() -> Self {
        Self {
            status: LocalStatus::NotUnderCm,
            revision: None,
            has_lock: false,
            properties: vec![latest_marker(true)],
        }
    }

    pub fn property(&self, name: &str) -> Option<&FileProperty> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Backend-defined data returned alongside a [`FileState`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateExtension {
    /// Local content is at the latest known revision.
    pub is_latest: bool,
    /// Most recent revision the backend knows for the entry.
    pub latest_revision: Option<Revision>,
    /// Open conflict on the entry, if any.
    pub conflict: Option<ConflictRecord>,
}

/// A [`FileState`] paired with its [`StateExtension`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryState {
    pub file_state: FileState,
    pub extension: StateExtension,
}

impl EntryState {
    pub fn untracked() -> Self {
        Self {
            file_state: FileState::untracked(),
            extension: StateExtension {
                is_latest: true,
                ..StateExtension::default()
            },
        }
    }

    pub fn status(&self) -> LocalStatus {
        self.file_state.status
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derive the status of an entry.
///
/// `record` is `None` when the backend has no tracking record at all. The
/// checks run in a fixed order and the first match wins; `LOCK` is checked
/// last so that `EDIT | LOCK` is reported as modified.
pub fn derive_status(record: Option<ChangeKinds>, has_conflict: bool) -> LocalStatus {
    let Some(changes) = record else {
        return LocalStatus::NotUnderCm;
    };
    if changes.is_empty() {
        return LocalStatus::Unmodified;
    }
    if has_conflict {
        return LocalStatus::Conflicted;
    }
    if changes.intersects(ChangeKinds::ADD | ChangeKinds::RENAME | ChangeKinds::BRANCH) {
        return LocalStatus::Added;
    }
    if changes.contains(ChangeKinds::DELETE) {
        return LocalStatus::Deleted;
    }
    if changes.intersects(ChangeKinds::EDIT | ChangeKinds::MERGE) {
        return LocalStatus::Modified;
    }
    if changes == ChangeKinds::LOCK {
        return LocalStatus::Unmodified;
    }
    LocalStatus::Unknown
}

/// Side-channel properties: rename, branch and merge markers followed by
/// exactly one latest marker.
pub fn derive_properties(changes: ChangeKinds, is_latest: bool) -> Vec<FileProperty> {
    let mut properties = Vec::new();
    if changes.contains(ChangeKinds::RENAME) {
        properties.push(FileProperty::new("rename", "rename", true));
    }
    if changes.contains(ChangeKinds::BRANCH) {
        properties.push(FileProperty::new("branch", "branch", true));
    }
    if changes.contains(ChangeKinds::MERGE) {
        properties.push(FileProperty::new("merge", "merge", true));
    }
    properties.push(latest_marker(is_latest));
    properties
}

fn latest_marker(is_latest: bool) -> FileProperty {
    let name = if is_latest { "latest" } else { "not latest" };
    FileProperty::new(name, PROPERTY_KIND_LATEST, false)
}

/// Project a backend tracking record and its conflict into an [`EntryState`].
pub fn project(item: Option<&TrackedItem>, conflict: Option<&ConflictRecord>) -> EntryState {
    let Some(item) = item else {
        return EntryState::untracked();
    };

    let status = derive_status(Some(item.pending), conflict.is_some());
    if status == LocalStatus::Unknown {
        warn!(
            path = %item.local_path.display(),
            pending = %item.pending,
            "backend reported a change combination with no status mapping"
        );
    }

    let is_latest = item.local_version == item.latest_version.unwrap_or(0);
    let revision = match item.latest_version {
        Some(_) if item.local_version > 0 => {
            Some(Revision::at_path(item.local_version, item.server_path.clone()))
        }
        _ => None,
    };
    let latest_revision = item
        .latest_version
        .map(|v| Revision::at_path(v, item.server_path.clone()));

    EntryState {
        file_state: FileState {
            status,
            revision,
            has_lock: item.locked,
            properties: derive_properties(item.pending, is_latest),
        },
        extension: StateExtension {
            is_latest,
            latest_revision,
            conflict: conflict.cloned(),
        },
    }
}
