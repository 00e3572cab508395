use serde::{Deserialize, Serialize};
use std::fmt;

/// A canonical organization from the registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    // Stable identifier (e.g. an EIN)
    pub id: String,

    // Name as it appears in the registry
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

impl RegistryEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            region: None,
            city: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }
}

/// A grant recipient awaiting assignment to a registry id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedRecord {
    pub id: i64,

    // Free-text recipient name from the source document
    pub name: String,

    // Region inherited from the parent entity (the granting foundation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_hint: Option<String>,

    // Registry id asserted directly by the source document, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asserted_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_id: Option<String>,
}

impl UnresolvedRecord {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            region_hint: None,
            asserted_id: None,
            resolved_id: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region_hint = Some(region.into());
        self
    }

    pub fn with_asserted_id(mut self, id: impl Into<String>) -> Self {
        self.asserted_id = Some(id.into());
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_id.is_some()
    }

    /// Where this record sits in the tier state machine. Once every tier has
    /// run, an unresolved record is final until the next run.
    pub fn state(&self, tiers_exhausted: bool) -> ResolutionState {
        match (self.is_resolved(), tiers_exhausted) {
            (true, _) => ResolutionState::Resolved,
            (false, false) => ResolutionState::Unresolved,
            (false, true) => ResolutionState::UnresolvedFinal,
        }
    }
}

/// How registry entries and records are partitioned before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingStrategy {
    /// Direct equality on a registry id asserted by the source document.
    ExactId,
    /// Buckets keyed by region; entries without a region are left out.
    ByRegion,
    /// Buckets keyed by the first `k` characters of the normalized name.
    ByPrefix(usize),
}

impl BlockingStrategy {
    pub fn is_fuzzy(&self) -> bool {
        !matches!(self, BlockingStrategy::ExactId)
    }
}

impl fmt::Display for BlockingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockingStrategy::ExactId => write!(f, "EXACT_ID"),
            BlockingStrategy::ByRegion => write!(f, "BY_REGION"),
            BlockingStrategy::ByPrefix(k) => write!(f, "BY_PREFIX({})", k),
        }
    }
}

/// One (blocking strategy, cutoff) pass over the unresolved set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub strategy: BlockingStrategy,
    pub cutoff: f64,
}

impl Tier {
    pub fn exact_id() -> Self {
        Self {
            strategy: BlockingStrategy::ExactId,
            cutoff: 100.0,
        }
    }

    pub fn by_region(cutoff: f64) -> Self {
        Self {
            strategy: BlockingStrategy::ByRegion,
            cutoff,
        }
    }

    pub fn by_prefix(length: usize, cutoff: f64) -> Self {
        Self {
            strategy: BlockingStrategy::ByPrefix(length),
            cutoff,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:.1}", self.strategy, self.cutoff)
    }
}

/// A proposed assignment produced by a matcher worker and consumed by the committer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub record_id: i64,
    pub registry_id: String,
    pub score: f64,
    // 1-based position of the tier that produced this candidate
    pub tier: usize,
}

/// Final per-record outcome once every tier has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionState {
    Unresolved,
    Resolved,
    UnresolvedFinal,
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionState::Unresolved => write!(f, "UNRESOLVED"),
            ResolutionState::Resolved => write!(f, "RESOLVED"),
            ResolutionState::UnresolvedFinal => write!(f, "UNRESOLVED_FINAL"),
        }
    }
}
