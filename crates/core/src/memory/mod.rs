//! In-memory reference repository.
//!
//! [`MemoryRepository`] keeps the server side (versioned items, changesets,
//! locks, workspaces) in memory behind an `Arc<Mutex<..>>`, so clones share
//! one repository and several sandboxes can work against it concurrently.
//! Sandbox content lives on the real file system. Every
//! [`MemoryWorkspace`] call completes synchronously under the lock.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cmbridge_core::memory::MemoryRepository;
//! use cmbridge_core::session::Session;
//!
//! let repository = MemoryRepository::new("alice");
//! repository.register_ticket(42);
//! let session = Session::open(Arc::new(repository));
//! assert!(session.is_open());
//! ```

mod commit;
mod server;
mod state;
mod sync;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use self::server::{is_under, parent, Server, SERVER_ROOT};
use self::state::{Mapping, WorkspaceState};
use crate::backend::{
    codes, CheckinRequest, ConflictRecord, GetOptions, GetRequest, ItemKind, ItemSpec,
    PendingChangeRecord, Repository, RepositoryClient, Resolution, TrackedItem, VersionTarget,
};
use crate::batch::BatchOutcome;
use crate::errors::BackendError;
use crate::features::FeatureSet;
use crate::revision::Revision;
use crate::status::ChangeKinds;

/// Folder that marks a sandbox root.
pub const METADATA_FOLDER: &str = ".cmbridge";

const MARKER_FILE: &str = "workspace.toml";

/// Contents of the marker file written into a new sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceMarker {
    pub workspace: String,
    pub repository_path: String,
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RepoState {
    server: Server,
    workspaces: BTreeMap<String, WorkspaceState>,
    next_workspace: u64,
}

impl RepoState {
    fn split(&mut self, name: &str) -> Result<(&mut Server, &mut WorkspaceState), BackendError> {
        let workspace = self.workspaces.get_mut(name).ok_or_else(|| {
            BackendError::new(codes::NOT_MAPPED, format!("workspace {name} no longer exists"))
        })?;
        Ok((&mut self.server, workspace))
    }
}

/// Shared in-memory repository.
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    inner: Arc<Mutex<RepoState>>,
    user: String,
    features: FeatureSet,
}

impl MemoryRepository {
    /// An empty repository; `user` authors changesets made through it.
    pub fn new(user: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            inner: Arc::new(Mutex::new(RepoState {
                server: Server::new(&user),
                workspaces: BTreeMap::new(),
                next_workspace: 1,
            })),
            user,
            features: FeatureSet::all(),
        }
    }

    /// Advertise a different feature set.
    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    /// The same repository, acting as another user.
    pub fn as_user(&self, user: impl Into<String>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            user: user.into(),
            features: self.features.clone(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Make `ticket_id` available for checkin association.
    pub fn register_ticket(&self, ticket_id: u64) {
        self.state().server.tickets.insert(ticket_id);
    }

    pub fn latest_changeset(&self) -> u64 {
        self.state().server.latest_changeset()
    }

    /// Get the lock on the shared state, recovering from a poisoned mutex.
    fn state(&self) -> MutexGuard<'_, RepoState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("repository mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn client(&self, name: String, mapping: Mapping) -> Box<dyn RepositoryClient> {
        Box::new(MemoryWorkspace {
            repository: self.clone(),
            name,
            mapping,
        })
    }
}

/// Create any missing folders on the way to `path` in one changeset.
fn ensure_server_folders(server: &mut Server, author: &str, path: &str) {
    let mut missing = Vec::new();
    let mut current = Some(path.to_string());
    while let Some(p) = current {
        if server.live_item_at(&p).is_some() {
            break;
        }
        current = parent(&p);
        missing.push(p);
    }
    if missing.is_empty() {
        return;
    }
    let changeset = server.open_changeset(author, &format!("Create {path}"), Vec::new());
    for folder in missing.into_iter().rev() {
        server.create_item(ItemKind::Folder, &folder, None, changeset, ChangeKinds::ADD);
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn system_name(&self) -> &str {
        "cmbridge in-memory repository"
    }

    fn short_name(&self) -> &str {
        "memory"
    }

    fn metadata_folder(&self) -> &str {
        METADATA_FOLDER
    }

    fn supported_features(&self) -> FeatureSet {
        self.features.clone()
    }

    async fn workspace_for(
        &self,
        sandbox_root: &Path,
    ) -> Result<Option<Box<dyn RepositoryClient>>, BackendError> {
        let found = self
            .state()
            .workspaces
            .values()
            .find(|ws| ws.mapping.root == sandbox_root)
            .map(|ws| (ws.name.clone(), ws.mapping.clone()));
        Ok(found.map(|(name, mapping)| self.client(name, mapping)))
    }

    #[instrument(skip(self), fields(root = %sandbox_root.display()))]
    async fn create_workspace(
        &self,
        repository_path: &str,
        sandbox_root: &Path,
    ) -> Result<Box<dyn RepositoryClient>, BackendError> {
        if !is_under(repository_path, SERVER_ROOT) {
            return Err(BackendError::new(
                codes::NOT_MAPPED,
                format!("'{repository_path}' is not a repository path"),
            ));
        }

        let (name, mapping) = {
            let mut state = self.state();
            if state
                .workspaces
                .values()
                .any(|ws| ws.mapping.root == sandbox_root)
            {
                return Err(BackendError::new(
                    codes::WORKSPACE_EXISTS,
                    format!("a workspace already maps '{}'", sandbox_root.display()),
                ));
            }
            ensure_server_folders(&mut state.server, &self.user, repository_path);

            let name = format!("{}-ws{}", self.user, state.next_workspace);
            state.next_workspace += 1;
            let mapping = Mapping {
                root: sandbox_root.to_path_buf(),
                server_root: repository_path.to_string(),
            };
            state
                .workspaces
                .insert(name.clone(), WorkspaceState::new(name.clone(), mapping.clone()));
            (name, mapping)
        };

        let marker_dir = sandbox_root.join(METADATA_FOLDER);
        std::fs::create_dir_all(&marker_dir)?;
        let marker = WorkspaceMarker {
            workspace: name.clone(),
            repository_path: repository_path.to_string(),
        };
        let text = toml::to_string(&marker)
            .map_err(|e| BackendError::new(codes::IO, format!("cannot write marker: {e}")))?;
        std::fs::write(marker_dir.join(MARKER_FILE), text)?;

        info!(workspace = %name, repository_path, "created workspace");
        Ok(self.client(name, mapping))
    }
}

// ---------------------------------------------------------------------------
// Workspace client
// ---------------------------------------------------------------------------

/// A workspace of a [`MemoryRepository`].
#[derive(Debug)]
pub struct MemoryWorkspace {
    repository: MemoryRepository,
    name: String,
    mapping: Mapping,
}

impl MemoryWorkspace {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut Server, &mut WorkspaceState) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut state = self.repository.state();
        let (server, workspace) = state.split(&self.name)?;
        f(server, workspace)
    }

    fn with_batch(
        &self,
        paths: &[PathBuf],
        f: impl FnOnce(&mut Server, &mut WorkspaceState) -> BatchOutcome,
    ) -> BatchOutcome {
        match self.with_state(|server, workspace| Ok(f(server, workspace))) {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut outcome = BatchOutcome::new();
                for path in paths {
                    outcome.record(path, e.clone());
                }
                outcome
            }
        }
    }

    fn resolve_target(&self, target: VersionTarget) -> u64 {
        match target {
            VersionTarget::Latest => self.repository.latest_changeset(),
            VersionTarget::Changeset(n) => n,
        }
    }
}

#[async_trait]
impl RepositoryClient for MemoryWorkspace {
    fn workspace_name(&self) -> &str {
        &self.name
    }

    fn sandbox_root(&self) -> &Path {
        &self.mapping.root
    }

    fn server_path_for(&self, local: &Path) -> Option<String> {
        self.mapping.server_path(local)
    }

    async fn scan(&self) -> Result<(), BackendError> {
        self.with_state(|_, workspace| workspace.scan())
    }

    async fn pend_add(&self, paths: &[PathBuf]) -> BatchOutcome {
        self.with_batch(paths, |server, workspace| workspace.pend_add(server, paths))
    }

    async fn pend_delete(&self, paths: &[PathBuf]) -> BatchOutcome {
        self.with_batch(paths, |_, workspace| workspace.pend_delete(paths))
    }

    async fn pend_rename(&self, old: &Path, new: &Path) -> Result<(), BackendError> {
        self.with_state(|server, workspace| workspace.pend_rename(server, old, new))
    }

    async fn set_lock(&self, paths: &[PathBuf]) -> BatchOutcome {
        self.with_batch(paths, |server, workspace| workspace.set_lock(server, paths))
    }

    async fn undo(&self, specs: &[ItemSpec]) -> BatchOutcome {
        let paths: Vec<PathBuf> = specs.iter().map(|s| s.path.clone()).collect();
        self.with_batch(&paths, |server, workspace| workspace.undo(server, specs))
    }

    async fn pend_branch(
        &self,
        source: &Path,
        target: &Path,
        version: VersionTarget,
    ) -> Result<(), BackendError> {
        let changeset = self.resolve_target(version);
        self.with_state(|server, workspace| workspace.pend_branch(server, source, target, changeset))
    }

    async fn merge(
        &self,
        source: &Path,
        target: &Path,
        from: Option<u64>,
        to: VersionTarget,
    ) -> Result<(), BackendError> {
        let to = self.resolve_target(to);
        self.with_state(|server, workspace| workspace.merge(server, source, target, from, to))
    }

    async fn query_items(&self, specs: &[ItemSpec]) -> Result<Vec<TrackedItem>, BackendError> {
        self.with_state(|server, workspace| workspace.query_items(server, specs))
    }

    async fn query_conflicts(
        &self,
        specs: &[ItemSpec],
    ) -> Result<Vec<ConflictRecord>, BackendError> {
        self.with_state(|_, workspace| workspace.query_conflicts(specs))
    }

    async fn pending_changes(
        &self,
        specs: &[ItemSpec],
    ) -> Result<Vec<PendingChangeRecord>, BackendError> {
        self.with_state(|_, workspace| workspace.pending_changes(specs))
    }

    async fn check_in(&self, request: CheckinRequest) -> Result<Option<u64>, BackendError> {
        let author = self.repository.user.clone();
        self.with_state(|server, workspace| workspace.check_in(server, &author, request))
    }

    async fn get(&self, requests: &[GetRequest], options: GetOptions) -> BatchOutcome {
        let paths: Vec<PathBuf> = requests.iter().map(|r| r.spec.path.clone()).collect();
        self.with_batch(&paths, |server, workspace| {
            workspace.get(server, requests, options)
        })
    }

    async fn download(
        &self,
        server_path: &str,
        version: u64,
        dest: &Path,
    ) -> Result<(), BackendError> {
        self.with_state(|server, workspace| workspace.download(server, server_path, version, dest))
    }

    async fn query_history(
        &self,
        server_path: &str,
        max_entries: usize,
    ) -> Result<Vec<Revision>, BackendError> {
        self.with_state(|server, workspace| {
            let item_id = workspace
                .entries
                .get(server_path)
                .and_then(|e| e.item_id)
                .or_else(|| server.live_item_at(server_path).map(|i| i.id))
                .ok_or_else(|| state::not_found(server_path))?;
            let item = server
                .items
                .get(&item_id)
                .ok_or_else(|| state::not_found(server_path))?;
            Ok(item
                .versions()
                .take(max_entries)
                .map(|v| server.revision(v))
                .collect())
        })
    }

    async fn resolve_conflict(
        &self,
        conflict: &ConflictRecord,
        resolution: Resolution,
    ) -> Result<bool, BackendError> {
        self.with_state(|server, workspace| workspace.resolve(server, conflict, resolution))
    }

    async fn server_path_exists(&self, server_path: &str) -> Result<bool, BackendError> {
        self.with_state(|server, _| Ok(server.live_item_at(server_path).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ConflictKind;

    #[tokio::test]
    async fn test_create_workspace_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("sandbox");
        let repository = MemoryRepository::new("alice");

        let client = repository
            .create_workspace("$/proj/main", &root)
            .await
            .unwrap();
        assert_eq!(client.sandbox_root(), root.as_path());
        assert!(client.server_path_exists("$/proj").await.unwrap());
        assert!(client.server_path_exists("$/proj/main").await.unwrap());

        let text = std::fs::read_to_string(root.join(METADATA_FOLDER).join(MARKER_FILE)).unwrap();
        let marker: WorkspaceMarker = toml::from_str(&text).unwrap();
        assert_eq!(marker.repository_path, "$/proj/main");
        assert_eq!(marker.workspace, client.workspace_name());

        let again = repository.create_workspace("$/proj/main", &root).await;
        assert!(matches!(again, Err(e) if e.code == codes::WORKSPACE_EXISTS));
    }

    #[tokio::test]
    async fn test_workspace_for_finds_existing_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let repository = MemoryRepository::new("alice");
        assert!(repository.workspace_for(dir.path()).await.unwrap().is_none());

        repository.create_workspace("$/proj", dir.path()).await.unwrap();
        let other_user = repository.as_user("bob");
        let client = other_user.workspace_for(dir.path()).await.unwrap().unwrap();
        assert_eq!(client.server_path_for(&dir.path().join("a.txt")).as_deref(), Some("$/proj/a.txt"));
    }

    #[tokio::test]
    async fn test_add_checkin_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let repository = MemoryRepository::new("alice");
        let client = repository.create_workspace("$/proj", dir.path()).await.unwrap();

        let file = dir.path().join("a.txt");
        std::fs::write(&file, "v1").unwrap();
        assert!(client.pend_add(&[file.clone()]).await.is_clean());

        let changes = client.pending_changes(&[ItemSpec::recursive(dir.path())]).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].changes, ChangeKinds::ADD);

        let cs = client
            .check_in(CheckinRequest {
                changes,
                comment: "first".into(),
                ticket_ids: Vec::new(),
            })
            .await
            .unwrap()
            .unwrap();

        let history = client.query_history("$/proj/a.txt", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].number(), cs);
        assert_eq!(history[0].info().comment.as_deref(), Some("first"));
        assert_eq!(history[0].info().author.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_metadata_folder_cannot_be_added() {
        let dir = tempfile::tempdir().unwrap();
        let repository = MemoryRepository::new("alice");
        let client = repository.create_workspace("$/proj", dir.path()).await.unwrap();

        let outcome = client.pend_add(&[dir.path().join(METADATA_FOLDER)]).await;
        assert_eq!(outcome.failures()[0].error.code, codes::FORBIDDEN_NAME);
    }

    async fn commit_all(client: &dyn RepositoryClient, root: &Path) -> u64 {
        client.scan().await.unwrap();
        let changes = client.pending_changes(&[ItemSpec::recursive(root)]).await.unwrap();
        client
            .check_in(CheckinRequest {
                changes,
                comment: "commit".into(),
                ticket_ids: Vec::new(),
            })
            .await
            .unwrap()
            .unwrap()
    }

    async fn sync_latest(client: &dyn RepositoryClient, root: &Path) {
        let request = GetRequest {
            spec: ItemSpec::recursive(root),
            target: VersionTarget::Latest,
        };
        assert!(client.get(&[request], GetOptions::default()).await.is_clean());
    }

    #[tokio::test]
    async fn test_local_only_conflict_needs_refresh_before_resolving() {
        let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let repository = MemoryRepository::new("alice");
        let a = repository.create_workspace("$/proj", dir_a.path()).await.unwrap();
        let file_a = dir_a.path().join("e.txt");
        std::fs::write(&file_a, "base").unwrap();
        assert!(a.pend_add(&[file_a.clone()]).await.is_clean());
        commit_all(&*a, dir_a.path()).await;

        let b = repository
            .as_user("bob")
            .create_workspace("$/proj", dir_b.path())
            .await
            .unwrap();
        sync_latest(&*b, dir_b.path()).await;

        std::fs::write(&file_a, "from a").unwrap();
        let theirs = commit_all(&*a, dir_a.path()).await;

        // Edited on disk, never scanned.
        let file_b = dir_b.path().join("e.txt");
        std::fs::write(&file_b, "from b").unwrap();
        sync_latest(&*b, dir_b.path()).await;

        let spec = [ItemSpec::single(&file_b)];
        let conflicts = b.query_conflicts(&spec).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        let local_only = conflicts[0].clone();
        assert_eq!(local_only.kind, ConflictKind::LocalOnly);
        assert_eq!(local_only.theirs.number(), theirs);
        assert!(!b.resolve_conflict(&local_only, Resolution::AcceptYours).await.unwrap());
        assert_eq!(b.query_conflicts(&spec).await.unwrap().len(), 1);

        b.scan().await.unwrap();
        sync_latest(&*b, dir_b.path()).await;
        let refreshed = b.query_conflicts(&spec).await.unwrap();
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].kind, ConflictKind::Upstream);
        assert_eq!(refreshed[0].id, local_only.id);

        assert!(b.resolve_conflict(&refreshed[0], Resolution::AcceptYours).await.unwrap());
        assert!(b.query_conflicts(&spec).await.unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&file_b).unwrap(), "from b");
    }
}
