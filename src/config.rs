use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::environment::{get_env_var_as_vec, get_env_var_parsed};
use crate::matching::normalizer::DEFAULT_STOPWORDS;
use crate::matching::{Normalizer, Tier};
use crate::TARGET_MATCH;

pub const DEFAULT_PREFIX_LENGTH: usize = 4;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_REGION_CUTOFF: f64 = 95.0;
pub const DEFAULT_PREFIX_CUTOFF: f64 = 85.0;

/// One tier as written in a config file, e.g.
/// `{"strategy": "by_prefix", "length": 5, "cutoff": 85}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TierConfig {
    ExactId {
        // Always 100; accepted only so configs can spell it out
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cutoff: Option<f64>,
    },
    ByRegion {
        cutoff: f64,
    },
    ByPrefix {
        // Falls back to `prefix_length`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        length: Option<usize>,
        cutoff: f64,
    },
}

/// Settings for a matching run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub tiers: Vec<TierConfig>,
    pub worker_count: usize,
    pub prefix_length: usize,
    pub batch_size: usize,
    pub stopwords: Vec<String>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierConfig::ExactId { cutoff: None },
                TierConfig::ByRegion {
                    cutoff: DEFAULT_REGION_CUTOFF,
                },
                TierConfig::ByPrefix {
                    length: None,
                    cutoff: DEFAULT_PREFIX_CUTOFF,
                },
            ],
            worker_count: default_worker_count(),
            prefix_length: DEFAULT_PREFIX_LENGTH,
            batch_size: DEFAULT_BATCH_SIZE,
            stopwords: DEFAULT_STOPWORDS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

/// Available cores minus one, never less than one.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .saturating_sub(1)
        .max(1)
}

impl MatchConfig {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: MatchConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(target: TARGET_MATCH, "Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `GRANTMATCH_*` environment variables on top of this config.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(workers) = get_env_var_parsed::<usize>("GRANTMATCH_WORKERS")? {
            self.worker_count = workers;
        }
        if let Some(batch_size) = get_env_var_parsed::<usize>("GRANTMATCH_BATCH_SIZE")? {
            self.batch_size = batch_size;
        }
        if let Some(length) = get_env_var_parsed::<usize>("GRANTMATCH_PREFIX_LENGTH")? {
            self.prefix_length = length;
        }
        let stopwords = get_env_var_as_vec("GRANTMATCH_STOPWORDS", ';');
        if !stopwords.is_empty() {
            self.stopwords = stopwords;
        }
        Ok(self)
    }

    /// Check every setting and resolve the tier list into runtime tiers.
    pub fn validate(&self) -> Result<Vec<Tier>> {
        if self.tiers.is_empty() {
            bail!("At least one tier must be configured");
        }
        if self.worker_count == 0 {
            bail!("worker_count must be positive");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.prefix_length == 0 {
            bail!("prefix_length must be positive");
        }

        self.tiers
            .iter()
            .enumerate()
            .map(|(i, tier)| self.resolve_tier(i + 1, tier))
            .collect()
    }

    fn resolve_tier(&self, position: usize, tier: &TierConfig) -> Result<Tier> {
        let resolved = match *tier {
            TierConfig::ExactId { cutoff } => {
                if let Some(cutoff) = cutoff.filter(|c| *c != 100.0) {
                    warn!(
                        target: TARGET_MATCH,
                        "Tier {}: exact_id ignores cutoff {} (always 100)", position, cutoff
                    );
                }
                Tier::exact_id()
            }
            TierConfig::ByRegion { cutoff } => Tier::by_region(cutoff),
            TierConfig::ByPrefix { length, cutoff } => {
                let length = length.unwrap_or(self.prefix_length);
                if length == 0 {
                    return Err(anyhow!("Tier {}: prefix length must be positive", position));
                }
                Tier::by_prefix(length, cutoff)
            }
        };

        if !(0.0..=100.0).contains(&resolved.cutoff) {
            bail!(
                "Tier {}: cutoff {} is outside 0-100",
                position,
                resolved.cutoff
            );
        }
        Ok(resolved)
    }

    pub fn normalizer(&self) -> Normalizer {
        Normalizer::with_stopwords(&self.stopwords)
    }
}
