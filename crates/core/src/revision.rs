//! Revisions and revision specifiers.
//!
//! A [`Revision`] is an immutable snapshot identifier. Revisions are ordered
//! by recency through their changeset number, and they carry the repository
//! path they refer to: renames change an entry's path between revisions, so
//! the path has to travel with the revision rather than be inferred from the
//! entry's current location.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RevisionError;
use crate::status::ChangeKinds;

/// Delimiter between the two ends of a revision range (`"3-9"`).
///
/// Revision identifiers are decimal numbers with an optional `C` prefix, so
/// the delimiter can never be part of one.
pub const RANGE_DELIMITER: char = '-';

// ---------------------------------------------------------------------------
// Revision
// ---------------------------------------------------------------------------

/// Metadata attached to a [`Revision`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    /// Repository path of the entry at this revision.
    pub path: Option<String>,
    /// Who committed the revision.
    pub author: Option<String>,
    /// When the revision was committed.
    pub date: Option<DateTime<Utc>>,
    /// Kinds of change the revision made to the entry.
    pub changes: Option<ChangeKinds>,
    /// Commit comment.
    pub comment: Option<String>,
    /// Backend-specific extras.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// An immutable revision identifier with attached metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    number: u64,
    info: RevisionInfo,
}

impl Revision {
    /// A revision with no metadata.
    pub fn new(number: u64) -> Self {
        Self {
            number,
            info: RevisionInfo::default(),
        }
    }

    /// A revision that refers to `path`.
    pub fn at_path(number: u64, path: impl Into<String>) -> Self {
        Self {
            number,
            info: RevisionInfo {
                path: Some(path.into()),
                ..RevisionInfo::default()
            },
        }
    }

    pub fn with_info(number: u64, info: RevisionInfo) -> Self {
        Self { number, info }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn info(&self) -> &RevisionInfo {
        &self.info
    }

    /// The repository path this revision refers to, if recorded.
    pub fn path(&self) -> Option<&str> {
        self.info.path.as_deref()
    }

    /// Strict recency order: a revision is never more recent than itself.
    pub fn is_more_recent_than(&self, other: &Revision) -> bool {
        self.number > other.number
    }

    /// The textual form accepted by [`RevisionSpec::parse`].
    pub fn string_representation(&self) -> String {
        self.number.to_string()
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.number)
    }
}

// ---------------------------------------------------------------------------
// Specifiers
// ---------------------------------------------------------------------------

/// The revision a branch is rooted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionSpec {
    /// The most recent revision.
    Latest,
    /// A specific changeset.
    Number(u64),
}

impl RevisionSpec {
    /// Parse `""` (latest), `"42"` or `"C42"`.
    pub fn parse(spec: &str) -> Result<Self, RevisionError> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Ok(Self::Latest);
        }
        parse_number(trimmed, spec).map(Self::Number)
    }
}

/// The revisions a merge integrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionRange {
    /// Every change up to the latest revision.
    All,
    /// Exactly one changeset.
    Single(u64),
    /// An inclusive range of changesets.
    Span { from: u64, to: u64 },
}

impl RevisionRange {
    /// Parse `""`, `"7"` or `"3-9"`.
    pub fn parse(spec: &str) -> Result<Self, RevisionError> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Ok(Self::All);
        }
        match trimmed.split_once(RANGE_DELIMITER) {
            None => parse_number(trimmed, spec).map(Self::Single),
            Some((from, to)) => {
                let from = parse_number(from.trim(), spec)?;
                let to = parse_number(to.trim(), spec)?;
                if from > to {
                    return Err(RevisionError::InvalidSpec {
                        spec: spec.to_string(),
                        detail: format!("range start {from} is after range end {to}"),
                    });
                }
                Ok(Self::Span { from, to })
            }
        }
    }

    /// Lower bound of the range; `None` means "from the beginning".
    pub fn from(&self) -> Option<u64> {
        match self {
            Self::All => None,
            Self::Single(n) => Some(*n),
            Self::Span { from, .. } => Some(*from),
        }
    }

    /// Upper bound of the range.
    pub fn to(&self) -> RevisionSpec {
        match self {
            Self::All => RevisionSpec::Latest,
            Self::Single(n) => RevisionSpec::Number(*n),
            Self::Span { to, .. } => RevisionSpec::Number(*to),
        }
    }
}

fn parse_number(text: &str, spec: &str) -> Result<u64, RevisionError> {
    let digits = text
        .strip_prefix('C')
        .or_else(|| text.strip_prefix('c'))
        .unwrap_or(text);
    match digits.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err(RevisionError::InvalidSpec {
            spec: spec.to_string(),
            detail: "changeset numbers start at 1".into(),
        }),
        Err(e) => Err(RevisionError::InvalidSpec {
            spec: spec.to_string(),
            detail: format!("'{text}' is not a changeset number: {e}"),
        }),
    }
}
