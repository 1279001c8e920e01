//! Resource kinds exposed by the catalog API and their invalidation tags

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the entity types served by a paginated list endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Singer,
    Record,
    Song,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Singer,
        ResourceKind::Record,
        ResourceKind::Song,
    ];

    /// Lowercase name used in cache keys
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Singer => "singer",
            ResourceKind::Record => "record",
            ResourceKind::Song => "song",
        }
    }

    /// Invalidation tag carried by every cached page of this kind
    pub fn tag(&self) -> &'static str {
        match self {
            ResourceKind::Singer => "SingerCache",
            ResourceKind::Record => "RecordCache",
            ResourceKind::Song => "SongCache",
        }
    }

    /// Kinds whose rows are removed along with a deleted row of this kind.
    ///
    /// Mirrors the ORM mapping: a singer owns its records, and both the
    /// record's link to its singer and a song's link to its record cascade
    /// removal as well.
    pub fn delete_cascades_to(&self) -> &'static [ResourceKind] {
        match self {
            ResourceKind::Singer => &[ResourceKind::Record],
            ResourceKind::Record => &[ResourceKind::Singer],
            ResourceKind::Song => &[ResourceKind::Record],
        }
    }

    /// Every kind whose cached pages a committed mutation makes stale.
    ///
    /// Delete cascades are followed transitively; each kind appears once,
    /// starting with `self`.
    pub fn affected_by(&self, mutation: MutationKind) -> Vec<ResourceKind> {
        let mut kinds = vec![*self];
        if mutation != MutationKind::Delete {
            return kinds;
        }

        let mut next = 0;
        while let Some(kind) = kinds.get(next).copied() {
            for cascaded in kind.delete_cascades_to() {
                if !kinds.contains(cascaded) {
                    kinds.push(*cascaded);
                }
            }
            next += 1;
        }
        kinds
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownResourceKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    /// Accepts singular or plural names, case-insensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let singular = lower.strip_suffix('s').unwrap_or(&lower);
        match singular {
            "singer" => Ok(ResourceKind::Singer),
            "record" => Ok(ResourceKind::Record),
            "song" => Ok(ResourceKind::Song),
            _ => Err(UnknownResourceKind(s.to_owned())),
        }
    }
}

/// Kind of write applied to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}
