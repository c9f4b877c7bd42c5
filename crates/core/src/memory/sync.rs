//! Syncing, downloads and conflict resolution for in-memory workspaces.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::server::{is_under, ItemVersion, Server};
use super::state::{materialize, not_found, remove_local, Entry, WorkspaceState};
use crate::backend::{
    codes, ConflictKind, ConflictRecord, GetOptions, GetRequest, ItemKind, Resolution,
    VersionTarget,
};
use crate::batch::BatchOutcome;
use crate::conflict::{ConflictDetector, SyncCandidate, SyncDecision};
use crate::digest::{content_digest, file_digest};
use crate::errors::BackendError;
use crate::status::ChangeKinds;

impl WorkspaceState {
    pub fn get(
        &mut self,
        server: &Server,
        requests: &[GetRequest],
        options: GetOptions,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::new();
        for request in requests {
            let path = &request.spec.path;
            let key = match self.mapping.map(path) {
                Ok(key) => key,
                Err(e) => {
                    outcome.record(path, e);
                    continue;
                }
            };
            let target = match request.target {
                VersionTarget::Latest => server.latest_changeset(),
                VersionTarget::Changeset(n) => n,
            };
            let mut touched = false;

            // Entries may be rekeyed while syncing, so walk them by item id.
            let item_ids: Vec<u64> = self
                .keys_under(&key, request.spec.recursive)
                .iter()
                .filter_map(|k| self.entries.get(k).and_then(|e| e.item_id))
                .collect();
            for item_id in item_ids {
                touched = true;
                if let Err(e) = self.sync_item(server, item_id, target, options) {
                    outcome.record(path, e);
                }
            }

            match self.download_new(server, &key, request.spec.recursive, target) {
                Ok(count) => touched |= count > 0,
                Err(e) => outcome.record(path, e),
            }

            if !touched && !self.entries.contains_key(&key) {
                outcome.record(path, not_found(&key));
            }
        }
        outcome
    }

    fn sync_item(
        &mut self,
        server: &Server,
        item_id: u64,
        target: u64,
        options: GetOptions,
    ) -> Result<(), BackendError> {
        let Some(key) = self.key_for_item(item_id) else {
            return Ok(());
        };
        let Some(entry) = self.entries.get(&key).cloned() else {
            return Ok(());
        };
        let local = self.mapping.local(&key)?;
        let item = server.items.get(&item_id).ok_or_else(|| not_found(&key))?;

        let disk_differs = self.disk_differs(&key, &entry)?;
        let clean = entry.pending.without(ChangeKinds::LOCK).is_empty() && !disk_differs;

        let Some(version) = item.live_at(target) else {
            // Deleted upstream or not yet created at the target version.
            if self.subtree_clean(&key)? {
                remove_local(&local)?;
                for k in self.keys_under(&key, true) {
                    self.entries.remove(&k);
                    self.conflicts.remove(&k);
                }
                info!(path = %key, target, "removed entry absent at target version");
                return Ok(());
            }
            let Some(deleted) = item.at(target) else {
                return Ok(());
            };
            let candidate = SyncCandidate {
                local_version: entry.local_version,
                target_version: deleted.changeset,
                pending: entry.pending,
                disk_differs,
            };
            if let SyncDecision::Conflict(kind) = ConflictDetector::classify(&candidate) {
                self.record_conflict(server, &key, local, &entry, kind, deleted);
            }
            return Ok(());
        };

        let candidate = SyncCandidate {
            local_version: entry.local_version,
            target_version: version.changeset,
            pending: entry.pending,
            disk_differs,
        };
        match ConflictDetector::classify(&candidate) {
            SyncDecision::Skip => {}
            SyncDecision::UpToDate => {
                let missing = match entry.kind {
                    ItemKind::File => !local.is_file(),
                    ItemKind::Folder => !local.is_dir(),
                };
                if clean && (options.force_redownload || missing) {
                    let baseline = materialize(&local, entry.kind, version.content.as_ref())?;
                    if let Some(e) = self.entries.get_mut(&key) {
                        e.baseline = baseline;
                    }
                    debug!(path = %key, "refreshed current content");
                }
            }
            SyncDecision::Overwrite => {
                let moved_to = (version.path != key
                    && entry.pending.without(ChangeKinds::LOCK).is_empty()
                    && !self.entries.contains_key(&version.path))
                .then(|| self.mapping.local_path(&version.path))
                .flatten();

                let dest = match &moved_to {
                    Some(dest) => {
                        if local.exists() {
                            if let Some(dir) = dest.parent() {
                                fs::create_dir_all(dir)?;
                            }
                            fs::rename(&local, dest)?;
                        }
                        dest.clone()
                    }
                    None => local,
                };
                let baseline = materialize(&dest, entry.kind, version.content.as_ref())?;
                if let Some(e) = self.entries.get_mut(&key) {
                    e.local_version = version.changeset;
                    e.baseline = baseline;
                }
                if moved_to.is_some() {
                    self.rekey(&key, &version.path);
                }
                info!(path = %version.path, version = version.changeset, "synced entry");
            }
            SyncDecision::Conflict(kind) => {
                self.record_conflict(server, &key, local, &entry, kind, version);
            }
        }
        Ok(())
    }

    /// On-disk content of a synced file no longer matches its baseline.
    fn disk_differs(&self, key: &str, entry: &Entry) -> Result<bool, BackendError> {
        if entry.kind != ItemKind::File || entry.baseline.is_none() {
            return Ok(false);
        }
        let local = self.mapping.local(key)?;
        Ok(file_digest(&local)?.is_some_and(|d| Some(&d) != entry.baseline.as_ref()))
    }

    /// No entry at or below `key` carries local work.
    fn subtree_clean(&self, key: &str) -> Result<bool, BackendError> {
        for k in self.keys_under(key, true) {
            let Some(entry) = self.entries.get(&k) else {
                continue;
            };
            if !entry.pending.without(ChangeKinds::LOCK).is_empty() || self.disk_differs(&k, entry)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Record or refresh the conflict on `key`, keeping an existing id.
    fn record_conflict(
        &mut self,
        server: &Server,
        key: &str,
        local: PathBuf,
        entry: &Entry,
        kind: ConflictKind,
        theirs: &ItemVersion,
    ) {
        let base = entry
            .item_id
            .and_then(|id| server.items.get(&id))
            .and_then(|item| item.at(entry.local_version))
            .filter(|_| entry.local_version > 0)
            .map(|v| server.revision(v));
        let mut record = ConflictRecord::new(local, kind, base, server.revision(theirs));
        if let Some(existing) = self.conflicts.get(key) {
            record.id = existing.id;
        }
        self.conflicts.insert(key.to_string(), record);
        info!(
            path = %key,
            ?kind,
            theirs = theirs.changeset,
            deleted = theirs.deleted,
            "conflict recorded"
        );
    }

    /// Bring down items the workspace does not track yet.
    fn download_new(
        &mut self,
        server: &Server,
        key: &str,
        recursive: bool,
        target: u64,
    ) -> Result<usize, BackendError> {
        let known: HashSet<u64> = self.entries.values().filter_map(|e| e.item_id).collect();
        let mut fresh: Vec<(String, u64, ItemKind)> = server
            .items
            .values()
            .filter(|item| !known.contains(&item.id))
            .filter_map(|item| {
                let version = item.live_at(target)?;
                let in_scope = if recursive {
                    is_under(&version.path, key)
                } else {
                    version.path == key
                };
                (in_scope
                    && is_under(&version.path, &self.mapping.server_root)
                    && !self.entries.contains_key(&version.path))
                .then(|| (version.path.clone(), item.id, item.kind))
            })
            .collect();
        fresh.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, item_id, kind) in &fresh {
            let Some(version) = server.items.get(item_id).and_then(|i| i.live_at(target)) else {
                continue;
            };
            let local = self.mapping.local(path)?;
            let baseline = materialize(&local, *kind, version.content.as_ref())?;
            self.entries.insert(
                path.clone(),
                Entry::synced(*item_id, *kind, version.changeset, baseline),
            );
            debug!(path = %path, version = version.changeset, "downloaded new entry");
        }
        Ok(fresh.len())
    }

    pub fn download(
        &self,
        server: &Server,
        server_path: &str,
        changeset: u64,
        dest: &Path,
    ) -> Result<(), BackendError> {
        let item = server
            .item_at_version(server_path, changeset)
            .ok_or_else(|| not_found(format!("{server_path} at changeset {changeset}")))?;
        if item.kind == ItemKind::Folder {
            return Ok(());
        }
        let version = item
            .live_at(changeset)
            .ok_or_else(|| not_found(server_path))?;
        materialize(dest, ItemKind::File, version.content.as_ref())?;
        debug!(path = %server_path, changeset, dest = %dest.display(), "downloaded content");
        Ok(())
    }

    /// Returns whether the conflict is closed.
    pub fn resolve(
        &mut self,
        server: &Server,
        conflict: &ConflictRecord,
        resolution: Resolution,
    ) -> Result<bool, BackendError> {
        let Some(key) = self
            .conflicts
            .iter()
            .find(|(_, c)| c.id == conflict.id)
            .map(|(k, _)| k.clone())
        else {
            return Ok(true);
        };
        let Some(current) = self.conflicts.get(&key).cloned() else {
            return Ok(true);
        };
        if current.kind == ConflictKind::LocalOnly {
            debug!(path = %key, "local-only conflict cannot be resolved before a refresh");
            return Ok(false);
        }

        let local = self.mapping.local(&key)?;
        let theirs = current.theirs.number();
        let item_id = self
            .entries
            .get(&key)
            .ok_or_else(|| not_found(&key))?
            .item_id;
        let own = item_id
            .and_then(|id| server.items.get(&id))
            .and_then(|item| item.versions().find(|v| v.changeset == theirs));

        match own {
            Some(version) if version.deleted => {
                self.resolve_deleted(server, &key, &local, resolution)?;
            }
            Some(version) => {
                let entry = self.entries.get_mut(&key).ok_or_else(|| not_found(&key))?;
                match resolution {
                    Resolution::AcceptYours => {
                        entry.baseline = version.content.as_ref().map(|c| content_digest(c));
                        entry.pending.insert(ChangeKinds::EDIT);
                    }
                    Resolution::AcceptTheirs => {
                        entry.baseline = materialize(&local, entry.kind, version.content.as_ref())?;
                        entry.pending.remove(ChangeKinds::EDIT | ChangeKinds::MERGE);
                    }
                }
                entry.local_version = theirs;
            }
            None => {
                // Theirs is a merge source; the entry stays at its own version.
                let source = current
                    .theirs
                    .path()
                    .and_then(|path| server.item_at_version(path, theirs))
                    .and_then(|item| item.live_at(theirs))
                    .ok_or_else(|| {
                        BackendError::new(
                            codes::ITEM_NOT_FOUND,
                            format!("{key} has no merge source at {theirs}"),
                        )
                    })?;
                let entry = self.entries.get_mut(&key).ok_or_else(|| not_found(&key))?;
                if resolution == Resolution::AcceptTheirs {
                    materialize(&local, entry.kind, source.content.as_ref())?;
                    entry.pending.remove(ChangeKinds::EDIT);
                }
                entry.pending.insert(ChangeKinds::MERGE);
            }
        }
        self.conflicts.remove(&key);
        info!(path = %key, ?resolution, theirs, "conflict resolved");
        Ok(true)
    }

    /// Close a conflict whose theirs side deleted the entry.
    ///
    /// Keeping the local copy pends it as a fresh add; taking theirs drops
    /// the entry and its local content.
    fn resolve_deleted(
        &mut self,
        server: &Server,
        key: &str,
        local: &Path,
        resolution: Resolution,
    ) -> Result<(), BackendError> {
        match resolution {
            Resolution::AcceptYours => {
                let ancestors: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|(k, e)| {
                        k.as_str() != key
                            && is_under(key, k)
                            && e.item_id
                                .and_then(|id| server.items.get(&id))
                                .is_some_and(|item| !item.is_live())
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in ancestors {
                    debug!(path = %k, "re-adding folder deleted upstream");
                    self.entries.insert(k, Entry::pending_add(ItemKind::Folder));
                }
                let entry = self.entries.get_mut(key).ok_or_else(|| not_found(key))?;
                *entry = Entry::pending_add(entry.kind);
                self.add_missing_ancestors(server, key);
            }
            Resolution::AcceptTheirs => {
                remove_local(local)?;
                for k in self.keys_under(key, true) {
                    self.entries.remove(&k);
                    self.conflicts.remove(&k);
                }
            }
        }
        Ok(())
    }
}
