//! Atomic checkin for in-memory workspaces.
//!
//! Everything is validated and every file is read before the changeset is
//! opened, so a failing checkin leaves both the server and the workspace
//! untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::Arc;

use tracing::info;

use super::server::{parent, rebase, ItemVersion, Server};
use super::state::{not_found, WorkspaceState};
use crate::backend::{codes, CheckinRequest, ItemKind};
use crate::digest::content_digest;
use crate::errors::BackendError;
use crate::status::ChangeKinds;

type Contents = BTreeMap<String, Option<Arc<Vec<u8>>>>;

impl WorkspaceState {
    pub fn check_in(
        &mut self,
        server: &mut Server,
        author: &str,
        request: CheckinRequest,
    ) -> Result<Option<u64>, BackendError> {
        let scope = self.checkin_scope(&request)?;
        self.validate_checkin(server, &scope, &request)?;
        let contents = self.read_contents(&scope)?;

        let lock_only = scope
            .iter()
            .all(|k| self.entries.get(k).is_some_and(|e| e.pending == ChangeKinds::LOCK));
        if lock_only {
            for key in &scope {
                self.release_lock(server, key);
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.pending = ChangeKinds::NONE;
                }
            }
            info!(entries = scope.len(), "released locks, nothing to commit");
            return Ok(None);
        }

        let changeset = server.open_changeset(author, &request.comment, request.ticket_ids.clone());
        for key in &scope {
            let content = contents.get(key).cloned().flatten();
            self.commit_entry(server, key, changeset, content, &scope);
        }
        info!(changeset, entries = scope.len(), "checked in");
        Ok(Some(changeset))
    }

    /// Requested entries plus their pending-add parent folders.
    fn checkin_scope(&self, request: &CheckinRequest) -> Result<BTreeSet<String>, BackendError> {
        let mut scope = BTreeSet::new();
        for change in &request.changes {
            let key = &change.server_path;
            if !self.entries.get(key).is_some_and(|e| !e.pending.is_empty()) {
                return Err(BackendError::new(
                    codes::ITEM_NOT_FOUND,
                    format!("no pending change for {key}"),
                ));
            }
            scope.insert(key.clone());

            let mut current = parent(key);
            while let Some(path) = current {
                match self.entries.get(&path) {
                    Some(entry) if entry.item_id.is_none() => {
                        scope.insert(path.clone());
                    }
                    _ => break,
                }
                current = parent(&path);
            }
        }
        Ok(scope)
    }

    fn validate_checkin(
        &self,
        server: &Server,
        scope: &BTreeSet<String>,
        request: &CheckinRequest,
    ) -> Result<(), BackendError> {
        for ticket in &request.ticket_ids {
            if !server.tickets.contains(ticket) {
                return Err(BackendError::new(
                    codes::TICKET_NOT_FOUND,
                    format!("ticket {ticket} does not exist"),
                ));
            }
        }

        for key in scope {
            let entry = self.entries.get(key).ok_or_else(|| not_found(key))?;
            if self.conflicts.contains_key(key) {
                return Err(BackendError::new(
                    codes::UNRESOLVED_CONFLICT,
                    format!("{key} has an unresolved conflict"),
                ));
            }

            let Some(item_id) = entry.item_id else {
                if server.live_item_at(key).is_some() {
                    return Err(BackendError::new(
                        codes::ITEM_EXISTS,
                        format!("{key} was added by another workspace"),
                    ));
                }
                continue;
            };

            let item = server.items.get(&item_id).ok_or_else(|| not_found(key))?;
            if let Some(holder) = server.lock_holder(item_id) {
                if holder != self.name {
                    return Err(BackendError::new(
                        codes::ITEM_LOCKED,
                        format!("{key} is locked for checkin by workspace {holder}"),
                    ));
                }
            }
            let changes_content = entry.pending.intersects(
                ChangeKinds::EDIT | ChangeKinds::MERGE | ChangeKinds::DELETE | ChangeKinds::RENAME,
            );
            if changes_content
                && (!item.is_live() || item.latest().changeset > entry.local_version)
            {
                return Err(BackendError::new(
                    codes::OUT_OF_DATE,
                    format!(
                        "{key} is at changeset {} but the server has {}",
                        entry.local_version,
                        item.latest().changeset
                    ),
                ));
            }
            if entry.pending.contains(ChangeKinds::RENAME)
                && server
                    .live_item_at(key)
                    .is_some_and(|other| other.id != item_id)
            {
                return Err(BackendError::new(
                    codes::ITEM_EXISTS,
                    format!("{key} is taken by another item"),
                ));
            }
        }
        Ok(())
    }

    fn read_contents(&self, scope: &BTreeSet<String>) -> Result<Contents, BackendError> {
        let mut contents = Contents::new();
        for key in scope {
            let Some(entry) = self.entries.get(key) else {
                continue;
            };
            if entry.kind != ItemKind::File
                || entry.pending.contains(ChangeKinds::DELETE)
                || entry.pending == ChangeKinds::LOCK
            {
                continue;
            }
            let local = self.mapping.local(key)?;
            let bytes = fs::read(&local).map_err(|e| {
                BackendError::new(
                    codes::FILE_NOT_FOUND,
                    format!("cannot read '{}': {e}", local.display()),
                )
            })?;
            contents.insert(key.clone(), Some(Arc::new(bytes)));
        }
        Ok(contents)
    }

    fn release_lock(&self, server: &mut Server, key: &str) {
        if let Some(id) = self.entries.get(key).and_then(|e| e.item_id) {
            if server.lock_holder(id) == Some(self.name.as_str()) {
                server.locks.remove(&id);
            }
        }
    }

    fn commit_entry(
        &mut self,
        server: &mut Server,
        key: &str,
        changeset: u64,
        content: Option<Arc<Vec<u8>>>,
        scope: &BTreeSet<String>,
    ) {
        let Some(entry) = self.entries.get(key).cloned() else {
            // Removed together with a deleted parent.
            return;
        };
        self.release_lock(server, key);
        let changes = entry.pending.without(ChangeKinds::LOCK);
        let baseline = content.as_ref().map(|c| content_digest(c));

        let Some(item_id) = entry.item_id else {
            let id = server.create_item(entry.kind, key, content, changeset, changes);
            if let Some(e) = self.entries.get_mut(key) {
                e.item_id = Some(id);
                e.local_version = changeset;
                e.pending = ChangeKinds::NONE;
                e.branch_source = None;
                e.baseline = baseline;
            }
            return;
        };

        if changes.is_empty() {
            if let Some(e) = self.entries.get_mut(key) {
                e.pending = ChangeKinds::NONE;
            }
            return;
        }

        let Some(old_path) = server.items.get(&item_id).map(|i| i.latest().path.clone()) else {
            return;
        };

        if changes.contains(ChangeKinds::DELETE) {
            let doomed: Vec<u64> = server.live_items_under(&old_path).map(|i| i.id).collect();
            for id in doomed {
                if let Some(item) = server.items.get_mut(&id) {
                    let path = item.latest().path.clone();
                    item.push(ItemVersion {
                        changeset,
                        path,
                        content: None,
                        deleted: true,
                        changes: ChangeKinds::DELETE,
                    });
                }
                server.locks.remove(&id);
            }
            for k in self.keys_under(key, true) {
                self.entries.remove(&k);
                self.conflicts.remove(&k);
            }
            return;
        }

        if let Some(item) = server.items.get_mut(&item_id) {
            item.push(ItemVersion {
                changeset,
                path: key.to_string(),
                content: if entry.kind == ItemKind::File { content } else { None },
                deleted: false,
                changes,
            });
        }

        if entry.kind == ItemKind::Folder && old_path != key {
            self.commit_children_of_renamed_folder(server, item_id, &old_path, key, changeset, scope);
        }

        if let Some(e) = self.entries.get_mut(key) {
            e.local_version = changeset;
            e.pending = ChangeKinds::NONE;
            if entry.kind == ItemKind::File {
                e.baseline = baseline;
            }
        }
    }

    /// Children of a renamed folder get a new version at the new path.
    fn commit_children_of_renamed_folder(
        &mut self,
        server: &mut Server,
        folder_id: u64,
        old_path: &str,
        new_path: &str,
        changeset: u64,
        scope: &BTreeSet<String>,
    ) {
        let children: Vec<u64> = server
            .live_items_under(old_path)
            .filter(|i| i.id != folder_id)
            .map(|i| i.id)
            .collect();
        for child_id in children {
            let child_key = self.key_for_item(child_id);
            if child_key.as_ref().is_some_and(|k| scope.contains(k)) {
                continue;
            }
            let Some(child) = server.items.get_mut(&child_id) else {
                continue;
            };
            let previous = child.latest().clone();
            child.push(ItemVersion {
                changeset,
                path: rebase(&previous.path, old_path, new_path),
                content: previous.content.clone(),
                deleted: false,
                changes: ChangeKinds::RENAME,
            });
            if let Some(entry) = child_key.and_then(|k| self.entries.get_mut(&k)) {
                if entry.local_version == previous.changeset {
                    entry.local_version = changeset;
                }
            }
        }
    }
}
