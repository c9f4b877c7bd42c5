//! Server side of the in-memory repository: versioned items and changesets.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::backend::ItemKind;
use crate::revision::{Revision, RevisionInfo};
use crate::status::ChangeKinds;

pub(crate) const SERVER_ROOT: &str = "$/";

// ---------------------------------------------------------------------------
// Server paths
// ---------------------------------------------------------------------------

/// `path` is `ancestor` or lies below it.
pub(crate) fn is_under(path: &str, ancestor: &str) -> bool {
    if path == ancestor {
        return true;
    }
    let prefix = format!("{}/", ancestor.trim_end_matches('/'));
    path.starts_with(&prefix)
}

pub(crate) fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

pub(crate) fn parent(path: &str) -> Option<String> {
    if path == SERVER_ROOT {
        return None;
    }
    let (head, _) = path.rsplit_once('/')?;
    if head == "$" {
        Some(SERVER_ROOT.to_string())
    } else {
        Some(head.to_string())
    }
}

/// Move `path` from below `old_prefix` to below `new_prefix`.
pub(crate) fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> String {
    match path.strip_prefix(old_prefix) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => format!("{new_prefix}{rest}"),
        _ => path.to_string(),
    }
}

/// Number of path segments below the server root.
pub(crate) fn depth(path: &str) -> usize {
    path.trim_start_matches(SERVER_ROOT)
        .split('/')
        .filter(|s| !s.is_empty())
        .count()
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct ItemVersion {
    pub changeset: u64,
    pub path: String,
    /// File bytes; `None` for folders and deletions.
    pub content: Option<Arc<Vec<u8>>>,
    pub deleted: bool,
    pub changes: ChangeKinds,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerItem {
    pub id: u64,
    pub kind: ItemKind,
    current: ItemVersion,
    /// Older versions, oldest first.
    older: Vec<ItemVersion>,
}

impl ServerItem {
    pub fn latest(&self) -> &ItemVersion {
        &self.current
    }

    pub fn is_live(&self) -> bool {
        !self.current.deleted
    }

    /// The version in effect at `changeset`, if the item existed then.
    pub fn at(&self, changeset: u64) -> Option<&ItemVersion> {
        self.versions().find(|v| v.changeset <= changeset)
    }

    /// Live version at `changeset`.
    pub fn live_at(&self, changeset: u64) -> Option<&ItemVersion> {
        self.at(changeset).filter(|v| !v.deleted)
    }

    /// All versions, most recent first.
    pub fn versions(&self) -> impl Iterator<Item = &ItemVersion> {
        std::iter::once(&self.current).chain(self.older.iter().rev())
    }

    pub fn push(&mut self, version: ItemVersion) {
        let previous = std::mem::replace(&mut self.current, version);
        self.older.push(previous);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Changeset {
    pub id: u64,
    pub author: String,
    pub date: DateTime<Utc>,
    pub comment: String,
    pub ticket_ids: Vec<u64>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct Server {
    pub items: BTreeMap<u64, ServerItem>,
    pub changesets: Vec<Changeset>,
    /// Item id -> name of the workspace holding the checkin lock.
    pub locks: HashMap<u64, String>,
    /// Ticket ids checkins may reference.
    pub tickets: BTreeSet<u64>,
    next_item_id: u64,
}

impl Server {
    /// A server holding only the root folder, created in changeset 1.
    pub fn new(author: &str) -> Self {
        let mut server = Self {
            items: BTreeMap::new(),
            changesets: Vec::new(),
            locks: HashMap::new(),
            tickets: BTreeSet::new(),
            next_item_id: 1,
        };
        let cs = server.open_changeset(author, "Repository created", Vec::new());
        server.create_item(ItemKind::Folder, SERVER_ROOT, None, cs, ChangeKinds::ADD);
        server
    }

    pub fn latest_changeset(&self) -> u64 {
        self.changesets.last().map(|c| c.id).unwrap_or(0)
    }

    pub fn open_changeset(&mut self, author: &str, comment: &str, ticket_ids: Vec<u64>) -> u64 {
        let id = self.latest_changeset() + 1;
        self.changesets.push(Changeset {
            id,
            author: author.to_string(),
            date: Utc::now(),
            comment: comment.to_string(),
            ticket_ids,
        });
        id
    }

    pub fn create_item(
        &mut self,
        kind: ItemKind,
        path: &str,
        content: Option<Arc<Vec<u8>>>,
        changeset: u64,
        changes: ChangeKinds,
    ) -> u64 {
        let id = self.next_item_id;
        self.next_item_id += 1;
        self.items.insert(
            id,
            ServerItem {
                id,
                kind,
                current: ItemVersion {
                    changeset,
                    path: path.to_string(),
                    content,
                    deleted: false,
                    changes,
                },
                older: Vec::new(),
            },
        );
        id
    }

    /// The live item currently at `path`.
    pub fn live_item_at(&self, path: &str) -> Option<&ServerItem> {
        self.items
            .values()
            .find(|item| item.is_live() && item.latest().path == path)
    }

    /// The item whose version at `changeset` is live at `path`.
    pub fn item_at_version(&self, path: &str, changeset: u64) -> Option<&ServerItem> {
        self.items
            .values()
            .find(|item| item.live_at(changeset).is_some_and(|v| v.path == path))
    }

    /// Live items at `path` or below it.
    pub fn live_items_under<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a ServerItem> {
        self.items
            .values()
            .filter(move |item| item.is_live() && is_under(&item.latest().path, path))
    }

    pub fn lock_holder(&self, item_id: u64) -> Option<&str> {
        self.locks.get(&item_id).map(String::as_str)
    }

    /// Public view of one item version.
    pub fn revision(&self, version: &ItemVersion) -> Revision {
        let changeset = self.changesets.iter().find(|c| c.id == version.changeset);
        let mut info = RevisionInfo {
            path: Some(version.path.clone()),
            changes: Some(version.changes),
            ..RevisionInfo::default()
        };
        if let Some(cs) = changeset {
            info.author = Some(cs.author.clone());
            info.date = Some(cs.date);
            info.comment = Some(cs.comment.clone());
            if !cs.ticket_ids.is_empty() {
                let tickets: Vec<String> = cs.ticket_ids.iter().map(u64::to_string).collect();
                info.extra.insert("tickets".into(), tickets.join(","));
            }
        }
        Revision::with_info(version.changeset, info)
    }
}
