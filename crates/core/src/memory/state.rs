//! Workspace side of the in-memory repository: the sandbox mapping, tracked
//! entries, pending changes and queries.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::server::{is_under, join, parent, rebase, Server};
use super::METADATA_FOLDER;
use crate::backend::{
    codes, ConflictKind, ConflictRecord, ItemKind, ItemSpec, PendingChangeRecord, TrackedItem,
};
use crate::batch::BatchOutcome;
use crate::digest::{content_digest, file_digest};
use crate::errors::BackendError;
use crate::status::ChangeKinds;

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Binding of a local sandbox root to a repository path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub root: PathBuf,
    pub server_root: String,
}

impl Mapping {
    pub fn server_path(&self, local: &Path) -> Option<String> {
        let relative = local.strip_prefix(&self.root).ok()?;
        let mut path = self.server_root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(name) => path = join(&path, &name.to_string_lossy()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }

    pub fn local_path(&self, server_path: &str) -> Option<PathBuf> {
        if server_path == self.server_root {
            return Some(self.root.clone());
        }
        let prefix = format!("{}/", self.server_root.trim_end_matches('/'));
        let relative = server_path.strip_prefix(&prefix)?;
        Some(relative.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }

    pub fn map(&self, local: &Path) -> Result<String, BackendError> {
        self.server_path(local).ok_or_else(|| {
            BackendError::new(
                codes::NOT_MAPPED,
                format!("'{}' is not mapped in this workspace", local.display()),
            )
        })
    }

    pub fn local(&self, server_path: &str) -> Result<PathBuf, BackendError> {
        self.local_path(server_path).ok_or_else(|| {
            BackendError::new(
                codes::NOT_MAPPED,
                format!("'{server_path}' is outside the workspace mapping"),
            )
        })
    }

    pub fn is_metadata(&self, local: &Path) -> bool {
        local
            .strip_prefix(&self.root)
            .map(|rel| rel.components().any(|c| c.as_os_str() == METADATA_FOLDER))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BranchSource {
    pub item_id: u64,
    pub changeset: u64,
}

/// One entry known to the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    /// Server item; `None` until a pending add or branch is checked in.
    pub item_id: Option<u64>,
    pub kind: ItemKind,
    pub local_version: u64,
    pub pending: ChangeKinds,
    pub branch_source: Option<BranchSource>,
    /// Digest of the content at `local_version`.
    pub baseline: Option<String>,
}

impl Entry {
    pub fn pending_add(kind: ItemKind) -> Self {
        Self {
            item_id: None,
            kind,
            local_version: 0,
            pending: ChangeKinds::ADD,
            branch_source: None,
            baseline: None,
        }
    }

    pub fn synced(item_id: u64, kind: ItemKind, version: u64, baseline: Option<String>) -> Self {
        Self {
            item_id: Some(item_id),
            kind,
            local_version: version,
            pending: ChangeKinds::NONE,
            branch_source: None,
            baseline,
        }
    }
}

pub(crate) fn not_found(what: impl std::fmt::Display) -> BackendError {
    BackendError::new(codes::ITEM_NOT_FOUND, format!("{what} is not under version control"))
}

/// Write `content` (files) or create the directory (folders) at `local`.
/// Returns the new baseline.
pub(crate) fn materialize(
    local: &Path,
    kind: ItemKind,
    content: Option<&Arc<Vec<u8>>>,
) -> std::io::Result<Option<String>> {
    match kind {
        ItemKind::Folder => {
            fs::create_dir_all(local)?;
            Ok(None)
        }
        ItemKind::File => {
            if let Some(dir) = local.parent() {
                fs::create_dir_all(dir)?;
            }
            let bytes: &[u8] = content.map(|c| c.as_slice()).unwrap_or(&[]);
            fs::write(local, bytes)?;
            Ok(Some(content_digest(bytes)))
        }
    }
}

pub(crate) fn remove_local(local: &Path) -> std::io::Result<()> {
    if local.is_dir() {
        fs::remove_dir_all(local)
    } else if local.exists() {
        fs::remove_file(local)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Workspace state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct WorkspaceState {
    pub name: String,
    pub mapping: Mapping,
    /// Keyed by the entry's current repository path.
    pub entries: BTreeMap<String, Entry>,
    pub conflicts: BTreeMap<String, ConflictRecord>,
}

impl WorkspaceState {
    pub fn new(name: String, mapping: Mapping) -> Self {
        Self {
            name,
            mapping,
            entries: BTreeMap::new(),
            conflicts: BTreeMap::new(),
        }
    }

    pub fn keys_under(&self, key: &str, recursive: bool) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| if recursive { is_under(k, key) } else { k.as_str() == key })
            .cloned()
            .collect()
    }

    pub fn key_for_item(&self, item_id: u64) -> Option<String> {
        self.entries
            .iter()
            .find(|(_, e)| e.item_id == Some(item_id))
            .map(|(k, _)| k.clone())
    }

    fn known_items(&self) -> HashSet<u64> {
        self.entries.values().filter_map(|e| e.item_id).collect()
    }

    /// Move every entry and conflict at or below `old` to below `new`.
    pub fn rekey(&mut self, old: &str, new: &str) {
        let moved: Vec<(String, Entry)> = self
            .keys_under(old, true)
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (rebase(&k, old, new), e)))
            .collect();
        self.entries.extend(moved);

        let keys: Vec<String> = self
            .conflicts
            .keys()
            .filter(|k| is_under(k, old))
            .cloned()
            .collect();
        for key in keys {
            if let Some(mut conflict) = self.conflicts.remove(&key) {
                let new_key = rebase(&key, old, new);
                if let Some(local) = self.mapping.local_path(&new_key) {
                    conflict.local_path = local;
                }
                self.conflicts.insert(new_key, conflict);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scan
    // -----------------------------------------------------------------------

    /// Record an edit for every synced file whose content left its baseline.
    pub fn scan(&mut self) -> Result<(), BackendError> {
        let mapping = &self.mapping;
        for (key, entry) in self.entries.iter_mut() {
            if entry.kind != ItemKind::File
                || entry.baseline.is_none()
                || entry.pending.intersects(
                    ChangeKinds::ADD
                        | ChangeKinds::BRANCH
                        | ChangeKinds::DELETE
                        | ChangeKinds::EDIT
                        | ChangeKinds::MERGE,
                )
            {
                continue;
            }
            let Some(local) = mapping.local_path(key) else {
                continue;
            };
            if let Some(digest) = file_digest(&local)? {
                if Some(&digest) != entry.baseline.as_ref() {
                    entry.pending.insert(ChangeKinds::EDIT);
                    debug!(path = %key, "scan detected local edit");
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pending changes
    // -----------------------------------------------------------------------

    pub fn pend_add(&mut self, server: &Server, paths: &[PathBuf]) -> BatchOutcome {
        let mut outcome = BatchOutcome::new();
        for path in paths {
            if let Err(e) = self.add_one(server, path) {
                outcome.record(path, e);
            }
        }
        outcome
    }

    fn add_one(&mut self, server: &Server, path: &Path) -> Result<(), BackendError> {
        if self.mapping.is_metadata(path) {
            return Err(BackendError::new(
                codes::FORBIDDEN_NAME,
                format!("'{}' is reserved workspace metadata", path.display()),
            ));
        }
        let key = self.mapping.map(path)?;
        let metadata = fs::metadata(path).map_err(|_| {
            BackendError::new(
                codes::FILE_NOT_FOUND,
                format!("'{}' does not exist", path.display()),
            )
        })?;

        if let Some(existing) = self.entries.get(&key) {
            if existing.pending.contains(ChangeKinds::ADD) {
                return Ok(());
            }
            return Err(BackendError::new(
                codes::ITEM_EXISTS,
                format!("{key} is already under version control"),
            ));
        }
        if server.live_item_at(&key).is_some() {
            return Err(BackendError::new(
                codes::ITEM_EXISTS,
                format!("{key} already exists on the server"),
            ));
        }

        self.add_missing_ancestors(server, &key);
        let kind = if metadata.is_dir() {
            ItemKind::Folder
        } else {
            ItemKind::File
        };
        self.entries.insert(key.clone(), Entry::pending_add(kind));
        info!(path = %key, "pended add");
        Ok(())
    }

    /// Pend adds for untracked folders between the mapping root and `key`.
    pub fn add_missing_ancestors(&mut self, server: &Server, key: &str) {
        let mut missing = Vec::new();
        let mut current = parent(key);
        while let Some(path) = current {
            if !is_under(&path, &self.mapping.server_root)
                || self.entries.contains_key(&path)
                || server.live_item_at(&path).is_some()
            {
                break;
            }
            current = parent(&path);
            missing.push(path);
        }
        for path in missing {
            debug!(path = %path, "implicitly adding parent folder");
            self.entries.insert(path, Entry::pending_add(ItemKind::Folder));
        }
    }

    pub fn pend_delete(&mut self, paths: &[PathBuf]) -> BatchOutcome {
        let mut outcome = BatchOutcome::new();
        for path in paths {
            if let Err(e) = self.delete_one(path) {
                outcome.record(path, e);
            }
        }
        outcome
    }

    fn has_pending_delete_ancestor(&self, key: &str) -> bool {
        let mut current = parent(key);
        while let Some(path) = current {
            if self
                .entries
                .get(&path)
                .is_some_and(|e| e.pending.contains(ChangeKinds::DELETE))
            {
                return true;
            }
            current = parent(&path);
        }
        false
    }

    fn delete_one(&mut self, path: &Path) -> Result<(), BackendError> {
        let key = self.mapping.map(path)?;
        if self.has_pending_delete_ancestor(&key) {
            return Err(BackendError::new(
                codes::PENDING_PARENT_DELETE,
                format!("a parent of {key} is already pending delete"),
            ));
        }
        let entry = self.entries.get_mut(&key).ok_or_else(|| not_found(&key))?;

        if entry.item_id.is_none() {
            for k in self.keys_under(&key, true) {
                self.entries.remove(&k);
                self.conflicts.remove(&k);
            }
            info!(path = %key, "cancelled pending add");
            return Ok(());
        }

        entry.pending.remove(ChangeKinds::EDIT | ChangeKinds::MERGE);
        entry.pending.insert(ChangeKinds::DELETE);
        remove_local(path)?;

        // Pending adds below the folder go away with it.
        let new_children: Vec<String> = self
            .keys_under(&key, true)
            .into_iter()
            .filter(|k| self.entries.get(k).is_some_and(|e| e.item_id.is_none()))
            .collect();
        for k in new_children {
            self.entries.remove(&k);
        }
        info!(path = %key, "pended delete");
        Ok(())
    }

    pub fn pend_rename(&mut self, server: &Server, old: &Path, new: &Path) -> Result<(), BackendError> {
        if self.mapping.is_metadata(new) {
            return Err(BackendError::new(
                codes::FORBIDDEN_NAME,
                format!("'{}' is reserved workspace metadata", new.display()),
            ));
        }
        let old_key = self.mapping.map(old)?;
        let new_key = self.mapping.map(new)?;
        let entry = self.entries.get(&old_key).ok_or_else(|| not_found(&old_key))?;
        if entry.pending.contains(ChangeKinds::DELETE) {
            return Err(BackendError::new(
                codes::ITEM_NOT_FOUND,
                format!("{old_key} is pending delete"),
            ));
        }
        if self.entries.contains_key(&new_key)
            || server.live_item_at(&new_key).is_some()
            || new.exists()
        {
            return Err(BackendError::new(
                codes::ITEM_EXISTS,
                format!("{new_key} already exists"),
            ));
        }
        if !old.exists() {
            return Err(BackendError::new(
                codes::FILE_NOT_FOUND,
                format!("'{}' does not exist locally", old.display()),
            ));
        }
        if !new.parent().is_some_and(Path::is_dir) {
            return Err(BackendError::new(
                codes::FILE_NOT_FOUND,
                format!("target folder of '{}' does not exist", new.display()),
            ));
        }

        let item_id = entry.item_id;
        let local_version = entry.local_version;
        self.add_missing_ancestors(server, &new_key);
        fs::rename(old, new)?;
        self.rekey(&old_key, &new_key);

        if let Some(id) = item_id {
            let committed = server
                .items
                .get(&id)
                .and_then(|item| item.at(local_version))
                .map(|v| v.path.clone());
            if let Some(entry) = self.entries.get_mut(&new_key) {
                if committed.as_deref() == Some(new_key.as_str()) {
                    entry.pending.remove(ChangeKinds::RENAME);
                } else {
                    entry.pending.insert(ChangeKinds::RENAME);
                }
            }
        }
        info!(from = %old_key, to = %new_key, "pended rename");
        Ok(())
    }

    pub fn set_lock(&mut self, server: &mut Server, paths: &[PathBuf]) -> BatchOutcome {
        let mut outcome = BatchOutcome::new();
        for path in paths {
            if let Err(e) = self.lock_one(server, path) {
                outcome.record(path, e);
            }
        }
        outcome
    }

    fn lock_one(&mut self, server: &mut Server, path: &Path) -> Result<(), BackendError> {
        let key = self.mapping.map(path)?;
        let entry = self.entries.get_mut(&key).ok_or_else(|| not_found(&key))?;
        if let Some(id) = entry.item_id {
            if let Some(holder) = server.lock_holder(id) {
                if holder != self.name {
                    return Err(BackendError::new(
                        codes::ITEM_LOCKED,
                        format!("{key} is locked for checkin by workspace {holder}"),
                    ));
                }
            }
            server.locks.insert(id, self.name.clone());
        }
        entry.pending.insert(ChangeKinds::LOCK);
        info!(path = %key, "acquired checkin lock");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Undo
    // -----------------------------------------------------------------------

    pub fn undo(&mut self, server: &mut Server, specs: &[ItemSpec]) -> BatchOutcome {
        let mut outcome = BatchOutcome::new();
        for spec in specs {
            let key = match self.mapping.map(&spec.path) {
                Ok(key) => key,
                Err(e) => {
                    outcome.record(&spec.path, e);
                    continue;
                }
            };
            let keys: Vec<String> = self
                .keys_under(&key, spec.recursive)
                .into_iter()
                .filter(|k| self.entries.get(k).is_some_and(|e| !e.pending.is_empty()))
                .collect();
            if keys.is_empty() {
                outcome.record(
                    &spec.path,
                    BackendError::new(
                        codes::ITEM_NOT_CHECKED_OUT,
                        format!("no pending changes for {key}"),
                    ),
                );
                continue;
            }

            // Children first, then renames from the top down so moved folders
            // carry their children back with them.
            let mut renamed = Vec::new();
            for k in keys.iter().rev() {
                match self.undo_entry(server, k) {
                    Ok(Some(item_id)) => renamed.push(item_id),
                    Ok(None) => {}
                    Err(e) => outcome.record(&spec.path, e),
                }
            }
            for item_id in renamed.into_iter().rev() {
                if let Err(e) = self.undo_rename(server, item_id) {
                    outcome.record(&spec.path, e);
                }
            }
        }
        outcome
    }

    /// Undo everything but a rename; returns the item id if a rename remains.
    fn undo_entry(&mut self, server: &mut Server, key: &str) -> Result<Option<u64>, BackendError> {
        let Some(entry) = self.entries.get(key).cloned() else {
            return Ok(None);
        };
        let local = self.mapping.local(key)?;
        self.conflicts.remove(key);

        let Some(item_id) = entry.item_id else {
            self.entries.remove(key);
            if entry.pending.contains(ChangeKinds::BRANCH) {
                remove_local(&local)?;
            }
            info!(path = %key, "undid pending add");
            return Ok(None);
        };

        if entry.pending.contains(ChangeKinds::LOCK)
            && server.lock_holder(item_id) == Some(self.name.as_str())
        {
            server.locks.remove(&item_id);
        }
        if entry.pending.contains(ChangeKinds::DELETE) {
            self.restore_subtree(server, key)?;
        } else if entry.pending.intersects(ChangeKinds::EDIT | ChangeKinds::MERGE) {
            self.restore_entry(server, key)?;
        }

        let renamed = entry.pending.contains(ChangeKinds::RENAME);
        if let Some(e) = self.entries.get_mut(key) {
            e.pending = if renamed {
                ChangeKinds::RENAME
            } else {
                ChangeKinds::NONE
            };
        }
        info!(path = %key, undone = %entry.pending, "undid pending changes");
        Ok(renamed.then_some(item_id))
    }

    fn undo_rename(&mut self, server: &Server, item_id: u64) -> Result<(), BackendError> {
        let Some(key) = self.key_for_item(item_id) else {
            return Ok(());
        };
        let local_version = self.entries.get(&key).map(|e| e.local_version).unwrap_or(0);
        let original = server
            .items
            .get(&item_id)
            .and_then(|item| item.at(local_version))
            .map(|v| v.path.clone())
            .ok_or_else(|| not_found(&key))?;

        if original != key {
            let from = self.mapping.local(&key)?;
            let to = self.mapping.local(&original)?;
            if let Some(dir) = to.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::rename(&from, &to)?;
            self.rekey(&key, &original);
        }
        if let Some(entry) = self.entries.get_mut(&original) {
            entry.pending.remove(ChangeKinds::RENAME);
        }
        info!(from = %key, to = %original, "undid rename");
        Ok(())
    }

    /// Rewrite an entry's content at its local version.
    fn restore_entry(&mut self, server: &Server, key: &str) -> Result<(), BackendError> {
        let local = self.mapping.local(key)?;
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(());
        };
        let Some(version) = entry
            .item_id
            .and_then(|id| server.items.get(&id))
            .and_then(|item| item.live_at(entry.local_version))
        else {
            return Ok(());
        };
        entry.baseline = materialize(&local, entry.kind, version.content.as_ref())?;
        Ok(())
    }

    fn restore_subtree(&mut self, server: &Server, key: &str) -> Result<(), BackendError> {
        for k in self.keys_under(key, true) {
            self.restore_entry(server, &k)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Branch & merge
    // -----------------------------------------------------------------------

    pub fn pend_branch(
        &mut self,
        server: &Server,
        source: &Path,
        target: &Path,
        changeset: u64,
    ) -> Result<(), BackendError> {
        let source_key = self.mapping.map(source)?;
        let target_key = self.mapping.map(target)?;
        if self.entries.contains_key(&target_key) || server.live_item_at(&target_key).is_some() {
            return Err(BackendError::new(
                codes::ITEM_EXISTS,
                format!("{target_key} already exists"),
            ));
        }
        let source_item = server
            .item_at_version(&source_key, changeset)
            .ok_or_else(|| not_found(format!("{source_key} at changeset {changeset}")))?;
        let source_path = source_item
            .live_at(changeset)
            .map(|v| v.path.clone())
            .unwrap_or_else(|| source_key.clone());

        self.add_missing_ancestors(server, &target_key);
        let mut created = 0usize;
        for item in server.items.values() {
            let Some(version) = item.live_at(changeset) else {
                continue;
            };
            if !is_under(&version.path, &source_path) {
                continue;
            }
            let key = rebase(&version.path, &source_path, &target_key);
            let local = self.mapping.local(&key)?;
            let baseline = materialize(&local, item.kind, version.content.as_ref())?;
            self.entries.insert(
                key,
                Entry {
                    item_id: None,
                    kind: item.kind,
                    local_version: 0,
                    pending: ChangeKinds::BRANCH,
                    branch_source: Some(BranchSource {
                        item_id: item.id,
                        changeset,
                    }),
                    baseline,
                },
            );
            created += 1;
        }
        info!(source = %source_key, target = %target_key, changeset, created, "pended branch");
        Ok(())
    }

    pub fn merge(
        &mut self,
        server: &Server,
        source: &Path,
        target: &Path,
        from: Option<u64>,
        to: u64,
    ) -> Result<(), BackendError> {
        let source_key = self.mapping.map(source)?;
        let target_key = self.mapping.map(target)?;
        if !self.entries.contains_key(&target_key) {
            return Err(not_found(&target_key));
        }
        let source_item = server
            .item_at_version(&source_key, to)
            .ok_or_else(|| not_found(format!("{source_key} at changeset {to}")))?;
        let source_path = source_item
            .live_at(to)
            .map(|v| v.path.clone())
            .unwrap_or_else(|| source_key.clone());
        let lower = from.unwrap_or(1);

        let mut merged = 0usize;
        for item in server.items.values() {
            let Some(version) = item.live_at(to) else {
                continue;
            };
            if !is_under(&version.path, &source_path) {
                continue;
            }
            let in_range = item
                .versions()
                .any(|v| v.changeset >= lower && v.changeset <= to);
            if !in_range {
                continue;
            }
            let key = rebase(&version.path, &source_path, &target_key);
            let local = self.mapping.local(&key)?;

            match self.entries.get_mut(&key) {
                Some(entry) if entry.item_id.is_some() => {
                    if item.kind == ItemKind::Folder {
                        continue;
                    }
                    let current = file_digest(&local)?;
                    let incoming = version.content.as_ref().map(|c| content_digest(c));
                    if current == incoming {
                        continue;
                    }
                    let edited = entry.pending.intersects(ChangeKinds::EDIT | ChangeKinds::MERGE)
                        || (entry.baseline.is_some() && current != entry.baseline);
                    entry.pending.insert(ChangeKinds::MERGE);
                    if edited {
                        // Local work is never overwritten; the caller resolves.
                        let base = entry
                            .item_id
                            .and_then(|id| server.items.get(&id))
                            .and_then(|target_item| target_item.at(entry.local_version))
                            .map(|v| server.revision(v));
                        let mut record = ConflictRecord::new(
                            local,
                            ConflictKind::Upstream,
                            base,
                            server.revision(version),
                        );
                        if let Some(existing) = self.conflicts.get(&key) {
                            record.id = existing.id;
                        }
                        self.conflicts.insert(key.clone(), record);
                        info!(path = %key, theirs = version.changeset, "merge conflict recorded");
                    } else {
                        materialize(&local, item.kind, version.content.as_ref())?;
                    }
                }
                Some(_) => continue,
                None => {
                    let baseline = materialize(&local, item.kind, version.content.as_ref())?;
                    self.entries.insert(
                        key,
                        Entry {
                            item_id: None,
                            kind: item.kind,
                            local_version: 0,
                            pending: ChangeKinds::BRANCH | ChangeKinds::MERGE,
                            branch_source: Some(BranchSource {
                                item_id: item.id,
                                changeset: version.changeset,
                            }),
                            baseline,
                        },
                    );
                }
            }
            merged += 1;
        }
        if merged == 0 {
            debug!(source = %source_key, target = %target_key, "nothing to merge");
        } else {
            info!(source = %source_key, target = %target_key, merged, "pended merge");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn tracked(&self, server: &Server, key: &str, entry: &Entry) -> Option<TrackedItem> {
        let item = entry.item_id.and_then(|id| server.items.get(&id));
        Some(TrackedItem {
            local_path: self.mapping.local_path(key)?,
            server_path: key.to_string(),
            kind: entry.kind,
            pending: entry.pending,
            local_version: entry.local_version,
            latest_version: item.map(|i| i.latest().changeset),
            locked: match entry.item_id {
                Some(id) => server.lock_holder(id).is_some(),
                None => entry.pending.contains(ChangeKinds::LOCK),
            },
        })
    }

    pub fn query_items(
        &self,
        server: &Server,
        specs: &[ItemSpec],
    ) -> Result<Vec<TrackedItem>, BackendError> {
        let known = self.known_items();
        let mut seen = BTreeSet::new();
        let mut items = Vec::new();

        for spec in specs {
            let key = self.mapping.map(&spec.path)?;
            for k in self.keys_under(&key, spec.recursive) {
                if let Some(entry) = self.entries.get(&k) {
                    if seen.insert(k.clone()) {
                        items.extend(self.tracked(server, &k, entry));
                    }
                }
            }

            // Server items this workspace has not downloaded yet.
            for item in server.live_items_under(&key) {
                let path = &item.latest().path;
                if known.contains(&item.id)
                    || (!spec.recursive && *path != key)
                    || !is_under(path, &self.mapping.server_root)
                    || self.entries.contains_key(path)
                {
                    continue;
                }
                let Some(local_path) = self.mapping.local_path(path) else {
                    continue;
                };
                if seen.insert(path.clone()) {
                    items.push(TrackedItem {
                        local_path,
                        server_path: path.clone(),
                        kind: item.kind,
                        pending: ChangeKinds::NONE,
                        local_version: 0,
                        latest_version: Some(item.latest().changeset),
                        locked: server.lock_holder(item.id).is_some(),
                    });
                }
            }
        }
        Ok(items)
    }

    pub fn query_conflicts(&self, specs: &[ItemSpec]) -> Result<Vec<ConflictRecord>, BackendError> {
        let mut conflicts = Vec::new();
        for spec in specs {
            let key = self.mapping.map(&spec.path)?;
            conflicts.extend(
                self.conflicts
                    .iter()
                    .filter(|(k, _)| if spec.recursive { is_under(k, &key) } else { **k == key })
                    .map(|(_, c)| c.clone()),
            );
        }
        Ok(conflicts)
    }

    pub fn pending_changes(
        &self,
        specs: &[ItemSpec],
    ) -> Result<Vec<PendingChangeRecord>, BackendError> {
        let mut seen = BTreeSet::new();
        let mut changes = Vec::new();
        for spec in specs {
            let key = self.mapping.map(&spec.path)?;
            for k in self.keys_under(&key, spec.recursive) {
                let Some(entry) = self.entries.get(&k) else {
                    continue;
                };
                if entry.pending.is_empty() || !seen.insert(k.clone()) {
                    continue;
                }
                changes.push(PendingChangeRecord {
                    local_path: self.mapping.local(&k)?,
                    server_path: k,
                    changes: entry.pending,
                });
            }
        }
        Ok(changes)
    }
}
