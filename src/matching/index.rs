use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use super::normalizer::Normalizer;
use super::types::{BlockingStrategy, RegistryEntry, UnresolvedRecord};
use super::TARGET_MATCH;

/// Normalized name → registry id, iterated in name order.
pub type Bucket = BTreeMap<String, String>;

/// Counters collected while building an index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub entries_indexed: usize,
    // Entries with no usable key (empty name, missing region, blank id)
    pub entries_skipped: usize,
    pub buckets: usize,
    // Entries that replaced an earlier entry with the same normalized name in the same bucket
    pub collisions: usize,
}

#[derive(Debug, Clone)]
enum IndexData {
    Ids(HashSet<String>),
    Buckets(HashMap<String, Bucket>),
}

/// Read-only blocking structure for one tier.
///
/// Built fresh from a registry snapshot at the start of each tier and shared
/// immutably between matcher workers.
#[derive(Debug, Clone)]
pub struct BlockingIndex {
    strategy: BlockingStrategy,
    data: IndexData,
    stats: IndexStats,
}

impl BlockingIndex {
    /// Build an index for `strategy` from an ordered registry snapshot.
    ///
    /// When two entries in one bucket normalize to the same name, the entry
    /// processed last wins. Snapshots are loaded in id order, so the winner is
    /// the entry with the greatest id.
    pub fn build(
        strategy: BlockingStrategy,
        registry: &[RegistryEntry],
        normalizer: &Normalizer,
    ) -> Self {
        let mut stats = IndexStats::default();

        let data = match strategy {
            BlockingStrategy::ExactId => {
                let mut ids = HashSet::with_capacity(registry.len());
                for entry in registry {
                    let id = entry.id.trim();
                    if id.is_empty() {
                        stats.entries_skipped += 1;
                        continue;
                    }
                    ids.insert(id.to_string());
                    stats.entries_indexed += 1;
                }
                stats.buckets = 1;
                IndexData::Ids(ids)
            }
            BlockingStrategy::ByRegion | BlockingStrategy::ByPrefix(_) => {
                let mut buckets: HashMap<String, Bucket> = HashMap::new();
                for entry in registry {
                    let normalized = normalizer.normalize(&entry.name);
                    let key = match entry_key(strategy, entry, &normalized) {
                        Some(key) if !entry.id.trim().is_empty() => key,
                        _ => {
                            stats.entries_skipped += 1;
                            continue;
                        }
                    };

                    let bucket = buckets.entry(key).or_default();
                    if let Some(previous) =
                        bucket.insert(normalized.clone(), entry.id.trim().to_string())
                    {
                        stats.collisions += 1;
                        debug!(
                            target: TARGET_MATCH,
                            "Bucket collision on '{}': {} replaced by {}",
                            normalized, previous, entry.id
                        );
                    }
                    stats.entries_indexed += 1;
                }
                stats.buckets = buckets.len();
                IndexData::Buckets(buckets)
            }
        };

        info!(
            target: TARGET_MATCH,
            "Built {} index: {} entries in {} buckets ({} skipped, {} collisions)",
            strategy, stats.entries_indexed, stats.buckets, stats.entries_skipped, stats.collisions
        );

        Self {
            strategy,
            data,
            stats,
        }
    }

    pub fn strategy(&self) -> BlockingStrategy {
        self.strategy
    }

    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    /// Membership check for the exact-id strategy. Always false for bucketed indexes.
    pub fn contains_id(&self, id: &str) -> bool {
        match &self.data {
            IndexData::Ids(ids) => ids.contains(id.trim()),
            IndexData::Buckets(_) => false,
        }
    }

    pub fn bucket(&self, key: &str) -> Option<&Bucket> {
        match &self.data {
            IndexData::Ids(_) => None,
            IndexData::Buckets(buckets) => buckets.get(key),
        }
    }

    /// Bucket key for a record under this index's strategy, derived from the
    /// record's already-normalized name.
    pub fn record_key(&self, record: &UnresolvedRecord, normalized: &str) -> Option<String> {
        match self.strategy {
            BlockingStrategy::ExactId => None,
            BlockingStrategy::ByRegion => record.region_hint.as_deref().and_then(region_key),
            BlockingStrategy::ByPrefix(k) => prefix_key(normalized, k),
        }
    }
}

fn entry_key(strategy: BlockingStrategy, entry: &RegistryEntry, normalized: &str) -> Option<String> {
    if normalized.is_empty() {
        return None;
    }
    match strategy {
        BlockingStrategy::ExactId => None,
        BlockingStrategy::ByRegion => entry.region.as_deref().and_then(region_key),
        BlockingStrategy::ByPrefix(k) => prefix_key(normalized, k),
    }
}

/// Regions compare case- and whitespace-insensitively ("ca " == "CA").
pub fn region_key(region: &str) -> Option<String> {
    let key = region.trim().to_uppercase();
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// First `k` characters of a normalized name, or the whole name when shorter.
pub fn prefix_key(normalized: &str, k: usize) -> Option<String> {
    if normalized.is_empty() {
        return None;
    }
    Some(normalized.chars().take(k.max(1)).collect())
}
