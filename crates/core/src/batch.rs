//! Per-entry outcome accumulation for batched backend calls.
//!
//! A batched call (add, delete, lock, undo, sync) keeps going after an entry
//! fails and returns a [`BatchOutcome`] listing every failure. The adapter
//! converts it into a single error once the whole batch has run.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::backend::codes;
use crate::errors::{AdapterError, BackendError};

/// One entry that failed within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub path: PathBuf,
    pub error: BackendError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    failures: Vec<EntryFailure>,
}

impl BatchOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: &Path, error: BackendError) {
        self.failures.push(EntryFailure {
            path: path.to_path_buf(),
            error,
        });
    }

    pub fn merge(&mut self, other: BatchOutcome) {
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[EntryFailure] {
        &self.failures
    }

    /// Turn the outcome into a result for `operation`.
    ///
    /// Failures whose code is in `ignorable` are logged and dropped. Any
    /// remaining failures are combined into one message in entry order; a
    /// lock held elsewhere becomes [`AdapterError::ExclusivityViolation`].
    pub fn into_result(self, operation: &str, ignorable: &[&str]) -> Result<(), AdapterError> {
        let mut message = String::new();
        let mut locked = false;
        for failure in self.failures {
            if ignorable.contains(&failure.error.code.as_str()) {
                warn!(
                    operation,
                    path = %failure.path.display(),
                    code = %failure.error.code,
                    "ignoring backend failure"
                );
                continue;
            }
            locked |= failure.error.code == codes::ITEM_LOCKED;
            message.push_str(&format!("{} {}; ", failure.error.code, failure.error.message));
        }

        if message.is_empty() {
            Ok(())
        } else if locked {
            Err(AdapterError::ExclusivityViolation(message))
        } else {
            Err(AdapterError::Batch {
                operation: operation.to_string(),
                message,
            })
        }
    }
}
