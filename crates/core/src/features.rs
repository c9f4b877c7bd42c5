//! Optional adapter features.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An optional capability an adapter may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    Move,
    Lock,
    Export,
    Resolve,
    IsLatest,
    #[serde(rename = "latest-revision-lookup")]
    LatestRevision,
    GetRevision,
    GetConflictRevision,
    ListRevisions,
    #[serde(rename = "folders-are-versioned")]
    FoldersVersioned,
    CustomCommitDialog,
    BranchMerge,
}

impl Feature {
    pub const ALL: [Feature; 12] = [
        Feature::Move,
        Feature::Lock,
        Feature::Export,
        Feature::Resolve,
        Feature::IsLatest,
        Feature::LatestRevision,
        Feature::GetRevision,
        Feature::GetConflictRevision,
        Feature::ListRevisions,
        Feature::FoldersVersioned,
        Feature::CustomCommitDialog,
        Feature::BranchMerge,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::Lock => "lock",
            Self::Export => "export",
            Self::Resolve => "resolve",
            Self::IsLatest => "is-latest",
            Self::LatestRevision => "latest-revision-lookup",
            Self::GetRevision => "get-revision",
            Self::GetConflictRevision => "get-conflict-revision",
            Self::ListRevisions => "list-revisions",
            Self::FoldersVersioned => "folders-are-versioned",
            Self::CustomCommitDialog => "custom-commit-dialog",
            Self::BranchMerge => "branch-merge",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.tag() == s)
            .ok_or_else(|| format!("unknown feature '{s}'"))
    }
}

/// Immutable set of features supported by one adapter instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    features: BTreeSet<Feature>,
}

impl FeatureSet {
    pub fn new(features: impl IntoIterator<Item = Feature>) -> Self {
        Self {
            features: features.into_iter().collect(),
        }
    }

    pub fn all() -> Self {
        Self::new(Feature::ALL)
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// This set minus `disabled`.
    pub fn without(&self, disabled: &[Feature]) -> Self {
        Self {
            features: self
                .features
                .iter()
                .copied()
                .filter(|f| !disabled.contains(f))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.features.iter().copied()
    }
}
