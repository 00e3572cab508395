use tracing::debug;

use super::index::BlockingIndex;
use super::normalizer::Normalizer;
use super::similarity::token_score;
use super::types::{BlockingStrategy, MatchCandidate, UnresolvedRecord};
use super::TARGET_MATCH;

const PERFECT_SCORE: f64 = 100.0;

/// Finds the best registry candidate for a single record.
///
/// Holds only shared references, so one matcher per worker (or one shared
/// across workers) is equally valid; matching never mutates anything.
#[derive(Debug, Clone, Copy)]
pub struct Matcher<'a> {
    normalizer: &'a Normalizer,
    index: &'a BlockingIndex,
}

impl<'a> Matcher<'a> {
    pub fn new(normalizer: &'a Normalizer, index: &'a BlockingIndex) -> Self {
        Self { normalizer, index }
    }

    /// Return the highest-scoring candidate at or above `cutoff`, if any.
    ///
    /// `tier` is the 1-based tier position recorded on the candidate.
    pub fn find_match(
        &self,
        record: &UnresolvedRecord,
        cutoff: f64,
        tier: usize,
    ) -> Option<MatchCandidate> {
        match self.index.strategy() {
            BlockingStrategy::ExactId => self.match_exact_id(record, tier),
            BlockingStrategy::ByRegion | BlockingStrategy::ByPrefix(_) => {
                self.match_fuzzy(record, cutoff, tier)
            }
        }
    }

    fn match_exact_id(&self, record: &UnresolvedRecord, tier: usize) -> Option<MatchCandidate> {
        let asserted = record.asserted_id.as_deref()?.trim();
        if asserted.is_empty() || !self.index.contains_id(asserted) {
            return None;
        }

        Some(MatchCandidate {
            record_id: record.id,
            registry_id: asserted.to_string(),
            score: PERFECT_SCORE,
            tier,
        })
    }

    fn match_fuzzy(
        &self,
        record: &UnresolvedRecord,
        cutoff: f64,
        tier: usize,
    ) -> Option<MatchCandidate> {
        let normalized = self.normalizer.normalize(&record.name);
        if normalized.is_empty() {
            return None;
        }

        let key = self.index.record_key(record, &normalized)?;
        let bucket = self.index.bucket(&key)?;

        // Only an identical name can score 100, so a verbatim hit is the answer
        if let Some(registry_id) = bucket.get(&normalized) {
            return Some(MatchCandidate {
                record_id: record.id,
                registry_id: registry_id.clone(),
                score: PERFECT_SCORE,
                tier,
            });
        }

        // Strictly-greater keeps the first of equal scores in bucket (name) order
        let mut best: Option<(&str, &str, f64)> = None;
        for (candidate, registry_id) in bucket {
            let score = token_score(&normalized, candidate);
            if best.map_or(true, |(_, _, top)| score > top) {
                best = Some((candidate.as_str(), registry_id.as_str(), score));
            }
        }

        let (candidate, registry_id, score) = best?;
        if score < cutoff {
            return None;
        }

        debug!(
            target: TARGET_MATCH,
            "Record {} '{}' matched '{}' ({}) with score {:.2} in bucket '{}'",
            record.id, normalized, candidate, registry_id, score, key
        );

        Some(MatchCandidate {
            record_id: record.id,
            registry_id: registry_id.to_string(),
            score,
            tier,
        })
    }
}
