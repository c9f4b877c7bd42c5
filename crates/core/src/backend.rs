//! Backend contract.
//!
//! A backing repository is reached through two traits: [`Repository`] is the
//! session-level connection that locates or creates the workspace bound to a
//! sandbox root, and [`RepositoryClient`] is that workspace, through which all
//! per-entry operations flow. The records exchanged here are wire-neutral;
//! the adapter interprets them with the status and conflict engines.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::BatchOutcome;
use crate::errors::BackendError;
use crate::features::FeatureSet;
use crate::revision::Revision;
use crate::status::ChangeKinds;

/// Stable failure codes reported by backends.
pub mod codes {
    pub const ITEM_EXISTS: &str = "ItemExists";
    pub const ITEM_NOT_FOUND: &str = "ItemNotFound";
    pub const ITEM_LOCKED: &str = "ItemLocked";
    /// Deleting an entry whose parent is already pending delete.
    pub const PENDING_PARENT_DELETE: &str = "PendingParentDelete";
    /// Undoing an entry that has nothing pending.
    pub const ITEM_NOT_CHECKED_OUT: &str = "ItemNotCheckedOut";
    pub const OUT_OF_DATE: &str = "OutOfDate";
    pub const UNRESOLVED_CONFLICT: &str = "UnresolvedConflict";
    pub const TICKET_NOT_FOUND: &str = "TicketNotFound";
    pub const NOT_MAPPED: &str = "NotMapped";
    pub const FILE_NOT_FOUND: &str = "FileNotFound";
    pub const FORBIDDEN_NAME: &str = "ForbiddenName";
    pub const WORKSPACE_EXISTS: &str = "WorkspaceExists";
    pub const IO: &str = "Io";
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Folder,
}

/// What the backend knows about one entry of the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedItem {
    pub local_path: PathBuf,
    pub server_path: String,
    pub kind: ItemKind,
    /// Change kinds pending in this workspace.
    pub pending: ChangeKinds,
    /// Changeset the local content was synced to; 0 if never downloaded.
    pub local_version: u64,
    /// Most recent changeset on the server; `None` if the server has none.
    pub latest_version: Option<u64>,
    /// Any workspace holds a lock on the entry.
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Theirs is a distinct, committed upstream change.
    Upstream,
    /// Only the sandbox's own unrecorded edit against a stale baseline.
    LocalOnly,
}

/// An open conflict on one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub local_path: PathBuf,
    pub kind: ConflictKind,
    pub base: Option<Revision>,
    pub theirs: Revision,
}

impl ConflictRecord {
    pub fn new(
        local_path: PathBuf,
        kind: ConflictKind,
        base: Option<Revision>,
        theirs: Revision,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_path,
            kind,
            base,
            theirs,
        }
    }
}

/// A pending change as reported for checkin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChangeRecord {
    pub local_path: PathBuf,
    pub server_path: String,
    pub changes: ChangeKinds,
}

/// Scope of a query or undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSpec {
    pub path: PathBuf,
    pub recursive: bool,
}

impl ItemSpec {
    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recursive: false,
        }
    }

    pub fn recursive(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recursive: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionTarget {
    Latest,
    Changeset(u64),
}

/// One entry of a sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub spec: ItemSpec,
    pub target: VersionTarget,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Rewrite content that is already at the target version.
    pub force_redownload: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckinRequest {
    pub changes: Vec<PendingChangeRecord>,
    pub comment: String,
    pub ticket_ids: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    AcceptYours,
    AcceptTheirs,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A workspace: one sandbox root bound to a repository path.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    fn workspace_name(&self) -> &str;

    fn sandbox_root(&self) -> &Path;

    /// Repository path of a local path, if it lies inside the mapping.
    fn server_path_for(&self, local: &Path) -> Option<String>;

    /// Detect local edits the workspace has not recorded yet.
    async fn scan(&self) -> Result<(), BackendError>;

    async fn pend_add(&self, paths: &[PathBuf]) -> BatchOutcome;

    async fn pend_delete(&self, paths: &[PathBuf]) -> BatchOutcome;

    async fn pend_rename(&self, old: &Path, new: &Path) -> Result<(), BackendError>;

    /// Acquire checkin locks.
    async fn set_lock(&self, paths: &[PathBuf]) -> BatchOutcome;

    /// Undo pending changes, releasing locks.
    async fn undo(&self, specs: &[ItemSpec]) -> BatchOutcome;

    async fn pend_branch(
        &self,
        source: &Path,
        target: &Path,
        version: VersionTarget,
    ) -> Result<(), BackendError>;

    async fn merge(
        &self,
        source: &Path,
        target: &Path,
        from: Option<u64>,
        to: VersionTarget,
    ) -> Result<(), BackendError>;

    async fn query_items(&self, specs: &[ItemSpec]) -> Result<Vec<TrackedItem>, BackendError>;

    async fn query_conflicts(
        &self,
        specs: &[ItemSpec],
    ) -> Result<Vec<ConflictRecord>, BackendError>;

    async fn pending_changes(
        &self,
        specs: &[ItemSpec],
    ) -> Result<Vec<PendingChangeRecord>, BackendError>;

    /// Submit changes atomically. `None` when nothing produced a changeset.
    async fn check_in(&self, request: CheckinRequest) -> Result<Option<u64>, BackendError>;

    async fn get(&self, requests: &[GetRequest], options: GetOptions) -> BatchOutcome;

    /// Write the content of `server_path` at `version` to `dest`.
    async fn download(
        &self,
        server_path: &str,
        version: u64,
        dest: &Path,
    ) -> Result<(), BackendError>;

    /// Revisions of `server_path`, most recent first.
    async fn query_history(
        &self,
        server_path: &str,
        max_entries: usize,
    ) -> Result<Vec<Revision>, BackendError>;

    /// Returns whether the conflict is closed afterwards.
    async fn resolve_conflict(
        &self,
        conflict: &ConflictRecord,
        resolution: Resolution,
    ) -> Result<bool, BackendError>;

    async fn server_path_exists(&self, server_path: &str) -> Result<bool, BackendError>;
}

/// A connection to a backing repository.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Human-readable system name.
    fn system_name(&self) -> &str;

    fn short_name(&self) -> &str;

    /// Name of the folder that marks a sandbox root.
    fn metadata_folder(&self) -> &str;

    fn supported_features(&self) -> FeatureSet;

    async fn workspace_for(
        &self,
        sandbox_root: &Path,
    ) -> Result<Option<Box<dyn RepositoryClient>>, BackendError>;

    async fn create_workspace(
        &self,
        repository_path: &str,
        sandbox_root: &Path,
    ) -> Result<Box<dyn RepositoryClient>, BackendError>;
}
