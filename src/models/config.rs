//! Configuration model loaded from a YAML file plus environment overrides.

use serde::Deserialize;

/// Full application configuration.
///
/// Every knob has a serde default so an absent file still yields a usable
/// configuration; environment variables prefixed with `CARSEARCH__` override
/// file values (e.g. `CARSEARCH__DATABASE_URL`).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub zmq_address: String,
    pub harvest: HarvestConfig,
    pub validation: ValidationConfig,
    pub dedup: DedupConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "app.db".to_string(),
            zmq_address: "tcp://127.0.0.1:5555".to_string(),
            harvest: HarvestConfig::default(),
            validation: ValidationConfig::default(),
            dedup: DedupConfig::default(),
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path` (optional) with `CARSEARCH__*` environment overrides.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("CARSEARCH").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// One source adapter to run each cycle. `selector` is looked up in the
/// scraper registry. Fuzzy-dedup candidate ordering is configured
/// separately via [`DedupConfig::source_priority`].
#[derive(Clone, Debug, Deserialize)]
pub struct SourceConfig {
    pub selector: String,
    pub pages: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Concurrent adapter tasks, independent of how many sources exist.
    pub worker_pool: usize,
    /// Per-page fetch attempts before the page is skipped.
    pub page_retries: u32,
    /// Consecutive skipped pages after which an adapter aborts its run.
    pub max_consecutive_failures: u32,
    /// Minimum delay between page requests, per adapter.
    pub request_delay_secs: u64,
    /// Cycles a vehicle may go unseen before deactivation.
    pub retention_cycles: i32,
    pub sources: Vec<SourceConfig>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            worker_pool: 4,
            page_retries: 3,
            max_consecutive_failures: 3,
            request_delay_secs: 2,
            retention_cycles: 3,
            sources: vec![
                SourceConfig {
                    selector: "tucarro".to_string(),
                    pages: 10,
                },
                SourceConfig {
                    selector: "mercadolibre".to_string(),
                    pages: 10,
                },
                SourceConfig {
                    selector: "autocosmos".to_string(),
                    pages: 5,
                },
            ],
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub year_min: i32,
    pub year_max: i32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            year_min: 1960,
            year_max: 2030,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Relative price tolerance for the fuzzy tier. Starting point, not a
    /// validated constant; tune against observed duplicate rates.
    pub price_tolerance: f64,
    /// Trigram similarity threshold for descriptions in the fuzzy tier.
    pub text_similarity_threshold: f64,
    /// Source ids in comparison order for deterministic fuzzy matching.
    pub source_priority: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            price_tolerance: 0.05,
            text_similarity_threshold: 0.55,
            source_priority: vec![
                "tucarro".to_string(),
                "mercadolibre".to_string(),
                "autocosmos".to_string(),
            ],
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Texts per embedding batch.
    pub batch_size: usize,
    /// Attempts per batch before its vehicles stay pending.
    pub max_retries: u32,
    /// Base backoff between attempts, doubled each retry plus jitter.
    pub retry_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_retries: 3,
            retry_base_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Weight of vector similarity in the final score; the remainder goes to
    /// the soft-constraint match fraction.
    pub alpha: f64,
    /// ANN k multiplier over the requested limit, so re-ranking by soft
    /// attributes has slack to work with.
    pub oversample: usize,
    /// Budget for LLM constraint extraction before degrading to an empty set.
    pub extraction_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            oversample: 4,
            extraction_timeout_secs: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.search.alpha, 0.6);
        assert_eq!(cfg.dedup.price_tolerance, 0.05);
        assert_eq!(cfg.harvest.sources.len(), 3);
        assert!(cfg.validation.year_min < cfg.validation.year_max);
    }
}
