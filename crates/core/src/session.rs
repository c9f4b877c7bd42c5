//! Explicit repository sessions.
//!
//! A [`Session`] owns the connection to one backing repository. Adapters are
//! built from a session instead of reaching for a process-wide connection,
//! and every adapter call fails with [`AdapterError::SessionClosed`] once the
//! session has been closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::backend::Repository;
use crate::errors::AdapterError;

struct SessionInner {
    id: Uuid,
    repository: Arc<dyn Repository>,
    open: AtomicBool,
}

/// A shared, cheaply cloneable handle to an open repository connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn open(repository: Arc<dyn Repository>) -> Self {
        let id = Uuid::new_v4();
        info!(session = %id, system = repository.system_name(), "opened repository session");
        Self {
            inner: Arc::new(SessionInner {
                id,
                repository,
                open: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Close the session for every clone sharing it. Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            info!(session = %self.inner.id, "closed repository session");
        }
    }

    /// The repository, or [`AdapterError::SessionClosed`].
    pub fn repository(&self) -> Result<&Arc<dyn Repository>, AdapterError> {
        if self.is_open() {
            Ok(&self.inner.repository)
        } else {
            Err(AdapterError::SessionClosed)
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("system", &self.inner.repository.system_name())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;

    #[test]
    fn test_close_is_shared_by_clones() {
        let session = Session::open(Arc::new(MemoryRepository::new("alice")));
        let clone = session.clone();
        assert!(clone.repository().is_ok());

        session.close();
        assert!(!clone.is_open());
        assert!(matches!(clone.repository(), Err(AdapterError::SessionClosed)));

        // Idempotent.
        session.close();
        assert_eq!(session.id(), clone.id());
    }
}
