//! Conflict resolution.
//!
//! The only policy is accept-local: content reconciliation is the caller's
//! business, resolution just closes the conflict so the entry can be checked
//! in. File bytes are never touched.

use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::backend::{
    ConflictKind, ConflictRecord, GetOptions, GetRequest, ItemSpec, RepositoryClient, Resolution,
    VersionTarget,
};
use crate::digest::file_digest;
use crate::errors::AdapterError;
use crate::revision::Revision;
use crate::status::{project, LocalStatus};

/// The two revisions involved in a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictedRevisions {
    /// Revision the local edit was based on, when known.
    pub base: Option<Revision>,
    pub theirs: Revision,
}

impl From<&ConflictRecord> for ConflictedRevisions {
    fn from(record: &ConflictRecord) -> Self {
        Self {
            base: record.base.clone(),
            theirs: record.theirs.clone(),
        }
    }
}

/// Resolves conflicts of one workspace.
pub struct ConflictResolver<'a> {
    client: &'a dyn RepositoryClient,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(client: &'a dyn RepositoryClient) -> Self {
        Self { client }
    }

    /// Scan, query and return the open conflict on `path`.
    ///
    /// Fails with [`AdapterError::NotConflicted`] unless the entry's derived
    /// status is `CONFLICTED`.
    pub async fn find_conflict(&self, path: &Path) -> Result<ConflictRecord, AdapterError> {
        self.client.scan().await?;
        let spec = [ItemSpec::single(path)];
        let items = self.client.query_items(&spec).await?;
        let conflicts = self.client.query_conflicts(&spec).await?;

        let item = items.iter().find(|i| i.local_path == path);
        let conflict = conflicts.iter().find(|c| c.local_path == path);
        let state = project(item, conflict);

        match state.extension.conflict {
            Some(record) if state.status() == LocalStatus::Conflicted => Ok(record),
            _ => Err(AdapterError::NotConflicted(path.to_path_buf())),
        }
    }

    /// Close the conflict on `path`, keeping the local content.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn resolve(&self, path: &Path) -> Result<(), AdapterError> {
        let before = file_digest(path)?;

        let mut conflict = self.find_conflict(path).await?;
        if conflict.kind == ConflictKind::LocalOnly {
            // The backend can only close a conflict that has a committed
            // theirs side; one fresh sync turns this into an upstream one.
            debug!("refreshing local-only conflict before resolving");
            let request = GetRequest {
                spec: ItemSpec::single(path),
                target: VersionTarget::Latest,
            };
            self.client
                .get(&[request], GetOptions::default())
                .await
                .into_result("get", &[])?;
            conflict = self.find_conflict(path).await?;
        }

        let resolved = self
            .client
            .resolve_conflict(&conflict, Resolution::AcceptYours)
            .await?;
        if !resolved {
            return Err(AdapterError::ResolveFailed(path.to_path_buf()));
        }

        let after = file_digest(path)?;
        if before != after {
            warn!("backend changed file content while resolving with accept-yours");
        }
        info!(theirs = conflict.theirs.number(), "conflict resolved, keeping local copy");
        Ok(())
    }
}
