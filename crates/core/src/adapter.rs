//! The working-copy adapter: the public operation surface over one sandbox.
//!
//! Every operation goes through the workspace client resolved at
//! [`WorkingCopyAdapter::connect`], interprets backend records with the
//! status and conflict engines, and turns batch outcomes into a single
//! [`AdapterError`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::backend::{
    codes, CheckinRequest, GetOptions, GetRequest, ItemSpec, RepositoryClient, VersionTarget,
};
use crate::checkin::CheckinDataProvider;
use crate::config::AdapterConfig;
use crate::conflict::{ConflictResolver, ConflictedRevisions};
use crate::errors::AdapterError;
use crate::features::{Feature, FeatureSet};
use crate::revision::{Revision, RevisionRange, RevisionSpec};
use crate::session::Session;
use crate::status::{project, EntryState, FileState, LocalStatus};

/// Manages one sandbox against a backing repository.
pub struct WorkingCopyAdapter {
    session: Session,
    sandbox_root: PathBuf,
    checkin_provider: Arc<dyn CheckinDataProvider>,
    config: AdapterConfig,
    features: FeatureSet,
    workspace: Option<Box<dyn RepositoryClient>>,
}

impl std::fmt::Debug for WorkingCopyAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingCopyAdapter")
            .field("sandbox_root", &self.sandbox_root)
            .field("session", &self.session)
            .field("connected", &self.workspace.is_some())
            .finish()
    }
}

impl WorkingCopyAdapter {
    pub fn new(
        session: Session,
        sandbox_root: impl Into<PathBuf>,
        checkin_provider: Arc<dyn CheckinDataProvider>,
        config: AdapterConfig,
    ) -> Self {
        Self {
            session,
            sandbox_root: sandbox_root.into(),
            checkin_provider,
            config,
            features: FeatureSet::default(),
            workspace: None,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle & capabilities
    // -----------------------------------------------------------------------

    /// Resolve the workspace bound to the sandbox root.
    #[instrument(skip(self), fields(sandbox = %self.sandbox_root.display()))]
    pub async fn connect(&mut self) -> Result<(), AdapterError> {
        let repository = self.session.repository()?;
        let workspace = repository
            .workspace_for(&self.sandbox_root)
            .await?
            .ok_or_else(|| AdapterError::NoWorkspace(self.sandbox_root.clone()))?;
        self.features = repository
            .supported_features()
            .without(&self.config.adapter.disabled_features);
        info!(workspace = workspace.workspace_name(), "connected");
        self.workspace = Some(workspace);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(workspace) = self.workspace.take() {
            info!(workspace = workspace.workspace_name(), "disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.workspace.is_some()
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn system_name(&self) -> Result<&str, AdapterError> {
        Ok(self.session.repository()?.system_name())
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn is_feature_supported(&self, feature: Feature) -> bool {
        self.features.contains(feature)
    }

    /// Names that may not be put under version control.
    pub fn forbidden_file_names(&self) -> Result<Vec<String>, AdapterError> {
        Ok(vec![self.session.repository()?.metadata_folder().to_string()])
    }

    /// Checkins with no pending change are no-ops, never empty changesets.
    pub fn can_commit_empty(&self) -> bool {
        false
    }

    fn client(&self) -> Result<&dyn RepositoryClient, AdapterError> {
        self.session.repository()?;
        self.workspace.as_deref().ok_or(AdapterError::NotConnected)
    }

    fn require(&self, feature: Feature) -> Result<(), AdapterError> {
        if self.features.contains(feature) {
            Ok(())
        } else {
            Err(AdapterError::UnsupportedFeature(feature))
        }
    }

    fn check_in_sandbox<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a PathBuf>,
    ) -> Result<(), AdapterError> {
        for path in paths {
            if !path.starts_with(&self.sandbox_root) {
                return Err(AdapterError::NotInSandbox(path.clone()));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pending changes
    // -----------------------------------------------------------------------

    /// Put untracked entries under version control.
    #[instrument(skip_all, fields(sandbox = %self.sandbox_root.display(), entries = entries.len()))]
    pub async fn add(&mut self, entries: &[PathBuf]) -> Result<(), AdapterError> {
        self.check_in_sandbox(entries)?;
        let states = self.get_entry_states(entries).await?;
        let tracked: Vec<PathBuf> = states
            .into_iter()
            .filter(|(_, state)| state.status() != LocalStatus::NotUnderCm)
            .map(|(path, _)| path)
            .collect();
        if !tracked.is_empty() {
            return Err(AdapterError::AlreadyTracked { paths: tracked });
        }

        self.client()?
            .pend_add(entries)
            .await
            .into_result("add", &[])?;
        info!("pended adds");
        Ok(())
    }

    /// Pend deletes. Removing a folder removes its whole subtree locally.
    #[instrument(skip_all, fields(sandbox = %self.sandbox_root.display(), entries = entries.len()))]
    pub async fn remove(&mut self, entries: &[PathBuf]) -> Result<(), AdapterError> {
        self.check_in_sandbox(entries)?;
        self.client()?
            .pend_delete(entries)
            .await
            .into_result("delete", &[codes::PENDING_PARENT_DELETE])
    }

    /// Take checkin locks; fails at once if another sandbox holds one.
    #[instrument(skip_all, fields(sandbox = %self.sandbox_root.display(), entries = entries.len()))]
    pub async fn checkout(&mut self, entries: &[PathBuf]) -> Result<(), AdapterError> {
        self.require(Feature::Lock)?;
        self.check_in_sandbox(entries)?;
        self.client()?
            .set_lock(entries)
            .await
            .into_result("checkout", &[])
    }

    /// Undo every pending change at or below each entry.
    #[instrument(skip_all, fields(sandbox = %self.sandbox_root.display(), entries = entries.len()))]
    pub async fn uncheckout(&mut self, entries: &[PathBuf]) -> Result<(), AdapterError> {
        self.check_in_sandbox(entries)?;
        let specs: Vec<ItemSpec> = entries.iter().map(ItemSpec::recursive).collect();
        self.client()?
            .undo(&specs)
            .await
            .into_result("undo", &[codes::ITEM_NOT_CHECKED_OUT])
    }

    #[instrument(skip(self), fields(sandbox = %self.sandbox_root.display()))]
    pub async fn move_file(&mut self, old: &Path, new: &Path) -> Result<(), AdapterError> {
        self.require(Feature::Move)?;
        self.check_in_sandbox([&old.to_path_buf(), &new.to_path_buf()])?;
        self.client()?.pend_rename(old, new).await?;
        Ok(())
    }

    /// Branch `source` into `target` at `spec` (`""` for latest, `"42"`).
    #[instrument(skip(self), fields(sandbox = %self.sandbox_root.display()))]
    pub async fn branch(&mut self, source: &Path, target: &Path, spec: &str) -> Result<(), AdapterError> {
        self.require(Feature::BranchMerge)?;
        let version = match RevisionSpec::parse(spec)? {
            RevisionSpec::Latest => VersionTarget::Latest,
            RevisionSpec::Number(n) => VersionTarget::Changeset(n),
        };
        self.client()?.pend_branch(source, target, version).await?;
        Ok(())
    }

    /// Merge `range` (`""` for everything, `"7"`, `"3-9"`) from `source`
    /// into `target`.
    #[instrument(skip(self), fields(sandbox = %self.sandbox_root.display()))]
    pub async fn merge(&mut self, source: &Path, target: &Path, range: &str) -> Result<(), AdapterError> {
        self.require(Feature::BranchMerge)?;
        let range = RevisionRange::parse(range)?;
        let to = match range.to() {
            RevisionSpec::Latest => VersionTarget::Latest,
            RevisionSpec::Number(n) => VersionTarget::Changeset(n),
        };
        self.client()?.merge(source, target, range.from(), to).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkin
    // -----------------------------------------------------------------------

    /// Check in the pending changes of `entries` (not recursive).
    pub async fn checkin(
        &mut self,
        entries: &[PathBuf],
        comment: Option<&str>,
    ) -> Result<Option<Revision>, AdapterError> {
        self.check_in_sandbox(entries)?;
        let specs: Vec<ItemSpec> = entries.iter().map(ItemSpec::single).collect();
        self.submit(&specs, comment).await
    }

    /// Check in every pending change at or below `directory`.
    pub async fn checkin_directory(
        &mut self,
        directory: &Path,
        comment: Option<&str>,
    ) -> Result<Option<Revision>, AdapterError> {
        self.check_in_sandbox([&directory.to_path_buf()])?;
        self.submit(&[ItemSpec::recursive(directory)], comment).await
    }

    #[instrument(skip_all, fields(sandbox = %self.sandbox_root.display()))]
    async fn submit(
        &self,
        specs: &[ItemSpec],
        comment: Option<&str>,
    ) -> Result<Option<Revision>, AdapterError> {
        let client = self.client()?;
        client.scan().await?;

        let changes = client.pending_changes(specs).await?;
        if changes.is_empty() {
            debug!("nothing to check in");
            return Ok(None);
        }

        let data = self.checkin_provider.get_data(comment)?;
        if !data.should_submit {
            info!("checkin cancelled by provider");
            return Ok(None);
        }
        let comment = comment
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string)
            .or(data.comment)
            .unwrap_or_default();

        let count = changes.len();
        let changeset = client
            .check_in(CheckinRequest {
                changes,
                comment,
                ticket_ids: data.ticket_ids,
            })
            .await?;
        match changeset {
            Some(number) => info!(changeset = number, entries = count, "checked in"),
            None => info!(entries = count, "checkin released locks only"),
        }
        Ok(changeset.map(Revision::new))
    }

    // -----------------------------------------------------------------------
    // Syncing
    // -----------------------------------------------------------------------

    /// Sync `directory` recursively to latest, rewriting current content.
    #[instrument(skip(self), fields(sandbox = %self.sandbox_root.display()))]
    pub async fn update(&mut self, directory: &Path) -> Result<(), AdapterError> {
        self.check_in_sandbox([&directory.to_path_buf()])?;
        let request = GetRequest {
            spec: ItemSpec::recursive(directory),
            target: VersionTarget::Latest,
        };
        self.client()?
            .get(&[request], GetOptions { force_redownload: true })
            .await
            .into_result("update", &[])
    }

    /// Sync `entries` (not recursive) to latest.
    #[instrument(skip_all, fields(sandbox = %self.sandbox_root.display(), entries = entries.len()))]
    pub async fn get_latest(&mut self, entries: &[PathBuf]) -> Result<(), AdapterError> {
        self.check_in_sandbox(entries)?;
        let requests: Vec<GetRequest> = entries
            .iter()
            .map(|path| GetRequest {
                spec: ItemSpec::single(path),
                target: VersionTarget::Latest,
            })
            .collect();
        self.client()?
            .get(&requests, GetOptions::default())
            .await
            .into_result("get", &[])
    }

    /// Revert each entry's content to the given revision.
    #[instrument(skip_all, fields(sandbox = %self.sandbox_root.display(), entries = revisions.len()))]
    pub async fn get_revision(
        &mut self,
        revisions: &BTreeMap<PathBuf, Revision>,
    ) -> Result<(), AdapterError> {
        self.require(Feature::GetRevision)?;
        self.check_in_sandbox(revisions.keys())?;
        let requests: Vec<GetRequest> = revisions
            .iter()
            .map(|(path, revision)| GetRequest {
                spec: ItemSpec::single(path),
                target: VersionTarget::Changeset(revision.number()),
            })
            .collect();
        self.client()?
            .get(&requests, GetOptions { force_redownload: true })
            .await
            .into_result("get revision", &[])
    }

    /// Write each entry's content at its revision to its destination.
    ///
    /// Content is looked up by the path the revision carries, so entries
    /// renamed since still export correctly.
    #[instrument(skip_all, fields(sandbox = %self.sandbox_root.display(), entries = revisions.len()))]
    pub async fn export(
        &mut self,
        revisions: &BTreeMap<PathBuf, Revision>,
        destinations: &BTreeMap<PathBuf, PathBuf>,
    ) -> Result<(), AdapterError> {
        self.require(Feature::Export)?;
        self.check_in_sandbox(revisions.keys())?;
        let client = self.client()?;

        let mut jobs = Vec::new();
        for (entry, revision) in revisions {
            if entry.is_dir() {
                debug!(entry = %entry.display(), "skipping directory export");
                continue;
            }
            let dest = destinations
                .get(entry)
                .ok_or_else(|| AdapterError::MissingDestination(entry.clone()))?;
            let path = revision
                .path()
                .ok_or(AdapterError::MissingRevisionPath(revision.number()))?;
            jobs.push((path, revision.number(), dest));
        }

        for (path, number, dest) in jobs {
            client.download(path, number, dest).await?;
            debug!(path, revision = number, dest = %dest.display(), "exported");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // History & conflicts
    // -----------------------------------------------------------------------

    /// Revisions of `entry`, most recent first.
    #[instrument(skip(self), fields(sandbox = %self.sandbox_root.display()))]
    pub async fn list_revisions(&mut self, entry: &Path) -> Result<Vec<Revision>, AdapterError> {
        self.require(Feature::ListRevisions)?;
        let client = self.client()?;
        let server_path = client
            .server_path_for(entry)
            .ok_or_else(|| AdapterError::NotInSandbox(entry.to_path_buf()))?;
        let revisions = client
            .query_history(&server_path, self.config.history.max_entries)
            .await?;
        debug!(count = revisions.len(), "listed revisions");
        Ok(revisions)
    }

    pub async fn get_revision_causing_conflict(
        &mut self,
        entry: &Path,
    ) -> Result<ConflictedRevisions, AdapterError> {
        self.require(Feature::GetConflictRevision)?;
        let record = ConflictResolver::new(self.client()?)
            .find_conflict(entry)
            .await?;
        Ok(ConflictedRevisions::from(&record))
    }

    /// Close the conflict on `entry`, keeping the local copy.
    pub async fn resolve_conflict(&mut self, entry: &Path) -> Result<(), AdapterError> {
        self.require(Feature::Resolve)?;
        ConflictResolver::new(self.client()?).resolve(entry).await
    }

    // -----------------------------------------------------------------------
    // State queries
    // -----------------------------------------------------------------------

    /// Scan, then derive the state of each entry.
    pub async fn get_entry_states(
        &mut self,
        entries: &[PathBuf],
    ) -> Result<BTreeMap<PathBuf, EntryState>, AdapterError> {
        let client = self.client()?;
        client.scan().await?;
        let specs: Vec<ItemSpec> = entries.iter().map(ItemSpec::single).collect();
        let items = client.query_items(&specs).await?;
        let conflicts = client.query_conflicts(&specs).await?;

        Ok(entries
            .iter()
            .map(|path| {
                let item = items.iter().find(|i| &i.local_path == path);
                let conflict = conflicts.iter().find(|c| &c.local_path == path);
                (path.clone(), project(item, conflict))
            })
            .collect())
    }

    pub async fn get_file_state(
        &mut self,
        entries: &[PathBuf],
    ) -> Result<BTreeMap<PathBuf, FileState>, AdapterError> {
        Ok(self
            .get_entry_states(entries)
            .await?
            .into_iter()
            .map(|(path, state)| (path, state.file_state))
            .collect())
    }

    /// States of every entry the backend knows at or below `root`.
    pub async fn get_state_for_all_known_files_recursively(
        &mut self,
        root: &Path,
    ) -> Result<BTreeMap<PathBuf, FileState>, AdapterError> {
        let client = self.client()?;
        client.scan().await?;
        let spec = [ItemSpec::recursive(root)];
        let items = client.query_items(&spec).await?;
        let conflicts = client.query_conflicts(&spec).await?;

        Ok(items
            .iter()
            .map(|item| {
                let conflict = conflicts.iter().find(|c| c.local_path == item.local_path);
                (item.local_path.clone(), project(Some(item), conflict).file_state)
            })
            .collect())
    }

    pub async fn is_latest(
        &mut self,
        entries: &[PathBuf],
    ) -> Result<BTreeMap<PathBuf, bool>, AdapterError> {
        self.require(Feature::IsLatest)?;
        Ok(self
            .get_entry_states(entries)
            .await?
            .into_iter()
            .map(|(path, state)| (path, state.extension.is_latest))
            .collect())
    }

    /// Most recent revision the repository has for `entry`.
    pub async fn latest_revision(&mut self, entry: &Path) -> Result<Option<Revision>, AdapterError> {
        self.require(Feature::LatestRevision)?;
        let mut states = self.get_entry_states(&[entry.to_path_buf()]).await?;
        Ok(states
            .remove(entry)
            .and_then(|state| state.extension.latest_revision))
    }

    /// Whether each entry exists in the repository.
    pub async fn is_stored(
        &mut self,
        entries: &[PathBuf],
    ) -> Result<BTreeMap<PathBuf, bool>, AdapterError> {
        let client = self.client()?;
        let mut stored = BTreeMap::new();
        for entry in entries {
            let exists = match client.server_path_for(entry) {
                Some(server_path) => client.server_path_exists(&server_path).await?,
                None => false,
            };
            stored.insert(entry.clone(), exists);
        }
        Ok(stored)
    }

    /// Repository path `directory` is mapped to.
    pub fn repository_specifier(&self, directory: &Path) -> Result<String, AdapterError> {
        self.client()?
            .server_path_for(directory)
            .ok_or_else(|| AdapterError::NotInSandbox(directory.to_path_buf()))
    }
}
