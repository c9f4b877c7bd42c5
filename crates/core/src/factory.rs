//! Builds adapters for sandboxes and creates new sandboxes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument};

use crate::adapter::WorkingCopyAdapter;
use crate::backend::{GetOptions, GetRequest, ItemSpec, VersionTarget};
use crate::checkin::CheckinDataProvider;
use crate::config::AdapterConfig;
use crate::errors::AdapterError;
use crate::session::Session;

pub struct AdapterFactory {
    session: Session,
    config: AdapterConfig,
    checkin_provider: Arc<dyn CheckinDataProvider>,
}

impl AdapterFactory {
    pub fn new(
        session: Session,
        config: AdapterConfig,
        checkin_provider: Arc<dyn CheckinDataProvider>,
    ) -> Self {
        Self {
            session,
            config,
            checkin_provider,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Nearest ancestor of `dir` (inclusive) holding the metadata folder.
    ///
    /// Only looks at the file system; the backend is not consulted.
    pub fn sandbox_root_of(&self, dir: &Path) -> Result<Option<PathBuf>, AdapterError> {
        let metadata = self.session.repository()?.metadata_folder();
        Ok(dir
            .ancestors()
            .find(|candidate| candidate.join(metadata).is_dir())
            .map(Path::to_path_buf))
    }

    pub fn is_sandbox_dir(&self, dir: &Path) -> Result<bool, AdapterError> {
        Ok(self.sandbox_root_of(dir)?.is_some())
    }

    /// A connected adapter for the sandbox containing `dir`.
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub async fn adapter_for_sandbox(&self, dir: &Path) -> Result<WorkingCopyAdapter, AdapterError> {
        let root = self
            .sandbox_root_of(dir)?
            .ok_or_else(|| AdapterError::NoWorkspace(dir.to_path_buf()))?;
        self.connect(root).await
    }

    /// Map `repository_path` to the new sandbox `dir` and download its
    /// latest content.
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub async fn retrieve_sandbox(
        &self,
        repository_path: &str,
        dir: &Path,
    ) -> Result<WorkingCopyAdapter, AdapterError> {
        let repository = self.session.repository()?;
        if self.is_sandbox_dir(dir)? || repository.workspace_for(dir).await?.is_some() {
            return Err(AdapterError::SandboxExists(dir.to_path_buf()));
        }

        fs::create_dir_all(dir)?;
        let client = repository.create_workspace(repository_path, dir).await?;
        let request = GetRequest {
            spec: ItemSpec::recursive(dir),
            target: VersionTarget::Latest,
        };
        client
            .get(&[request], GetOptions::default())
            .await
            .into_result("get", &[])?;
        info!(
            workspace = client.workspace_name(),
            repository_path, "retrieved sandbox"
        );

        self.connect(dir.to_path_buf()).await
    }

    async fn connect(&self, root: PathBuf) -> Result<WorkingCopyAdapter, AdapterError> {
        let mut adapter = WorkingCopyAdapter::new(
            self.session.clone(),
            root,
            Arc::clone(&self.checkin_provider),
            self.config.clone(),
        );
        adapter.connect().await?;
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkin::{CheckinData, StaticCheckinData};
    use crate::memory::MemoryRepository;

    fn factory(repository: MemoryRepository) -> AdapterFactory {
        AdapterFactory::new(
            Session::open(Arc::new(repository)),
            AdapterConfig::default(),
            Arc::new(StaticCheckinData::new(CheckinData::submit("factory"))),
        )
    }

    #[tokio::test]
    async fn test_retrieve_sandbox_marks_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path().join("ws");
        let factory = factory(MemoryRepository::new("alice"));

        assert!(!factory.is_sandbox_dir(&sandbox).unwrap());
        let adapter = factory.retrieve_sandbox("$/proj", &sandbox).await.unwrap();
        assert!(adapter.is_connected());
        assert!(factory.is_sandbox_dir(&sandbox).unwrap());
        assert!(factory.is_sandbox_dir(&sandbox.join("deep/nested")).unwrap());
        assert_eq!(
            factory.sandbox_root_of(&sandbox.join("deep")).unwrap(),
            Some(sandbox.clone())
        );
    }

    #[tokio::test]
    async fn test_retrieve_sandbox_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(MemoryRepository::new("alice"));
        factory.retrieve_sandbox("$/proj", dir.path()).await.unwrap();

        let err = factory.retrieve_sandbox("$/proj", dir.path()).await.unwrap_err();
        assert!(matches!(err, AdapterError::SandboxExists(_)));
    }

    #[tokio::test]
    async fn test_adapter_for_plain_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(MemoryRepository::new("alice"));
        let err = factory.adapter_for_sandbox(dir.path()).await.unwrap_err();
        assert!(matches!(err, AdapterError::NoWorkspace(_)));
    }
}
