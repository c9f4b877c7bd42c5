//! Checkin metadata collection.
//!
//! The adapter never prompts. Before a checkin it asks a
//! [`CheckinDataProvider`] for the comment and ticket ids to attach, and
//! whether to go ahead at all.

use crate::config::CheckinConfig;
use crate::errors::AdapterError;

/// Metadata for one checkin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckinData {
    /// `false` cancels the checkin with no side effect.
    pub should_submit: bool,
    pub comment: Option<String>,
    /// External ticket ids to associate with the changeset.
    pub ticket_ids: Vec<u64>,
}

impl CheckinData {
    pub fn submit(comment: impl Into<String>) -> Self {
        Self {
            should_submit: true,
            comment: Some(comment.into()),
            ticket_ids: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self::default()
    }

    pub fn with_tickets(mut self, ticket_ids: impl IntoIterator<Item = u64>) -> Self {
        self.ticket_ids = ticket_ids.into_iter().collect();
        self
    }
}

/// Supplies checkin metadata.
pub trait CheckinDataProvider: Send + Sync {
    /// `existing_comment` is the comment the caller passed, if any.
    fn get_data(&self, existing_comment: Option<&str>) -> Result<CheckinData, AdapterError>;
}

/// A provider that always answers with the same data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticCheckinData {
    data: CheckinData,
}

impl StaticCheckinData {
    pub fn new(data: CheckinData) -> Self {
        Self { data }
    }

    /// Submit with the configured default comment and tickets.
    pub fn from_config(config: &CheckinConfig) -> Self {
        Self::new(CheckinData {
            should_submit: true,
            comment: config.default_comment.clone(),
            ticket_ids: config.ticket_ids.clone(),
        })
    }
}

impl CheckinDataProvider for StaticCheckinData {
    fn get_data(&self, _existing_comment: Option<&str>) -> Result<CheckinData, AdapterError> {
        Ok(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_does_not_submit() {
        let data = CheckinData::cancelled();
        assert!(!data.should_submit);
        assert!(data.comment.is_none());
    }

    #[test]
    fn test_static_provider_from_config() {
        let config = CheckinConfig {
            default_comment: Some("nightly".into()),
            ticket_ids: vec![12, 14],
        };
        let data = StaticCheckinData::from_config(&config)
            .get_data(Some("ignored"))
            .unwrap();
        assert!(data.should_submit);
        assert_eq!(data.comment.as_deref(), Some("nightly"));
        assert_eq!(data.ticket_ids, vec![12, 14]);
    }
}
