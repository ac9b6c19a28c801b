//! Hybrid search: hard constraints filter in SQL, vector similarity ranks,
//! soft attributes re-rank.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::domain::search::{ConstraintSet, SearchRequest, SearchResponse, SearchResult};
use crate::domain::vehicle::VehicleContent;
use crate::models::config::{SearchConfig, ValidationConfig};
use crate::processing::embedding::{search_top_k, Embedder, EmbeddingError};
use crate::query::{sanitize, ConstraintExtractor};
use crate::repository::{RepositoryError, VehicleReader};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Store(#[from] RepositoryError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("vector index failure: {0}")]
    Index(String),
}

/// The search core. Constraint extraction is optional and degrades to
/// pure-semantic ranking; the store and the embedder are required.
pub struct SearchEngine<R, E, X> {
    repo: R,
    embedder: Mutex<E>,
    extractor: Option<X>,
    validation: ValidationConfig,
    cfg: SearchConfig,
}

impl<R, E, X> SearchEngine<R, E, X>
where
    R: VehicleReader,
    E: Embedder,
    X: ConstraintExtractor,
{
    pub fn new(
        repo: R,
        embedder: E,
        extractor: Option<X>,
        validation: ValidationConfig,
        cfg: SearchConfig,
    ) -> Self {
        Self {
            repo,
            embedder: Mutex::new(embedder),
            extractor,
            validation,
            cfg,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let extracted = self.extract_constraints(&request.query_text).await;
        let merged = match &request.overrides {
            Some(overrides) => extracted.merged_with(overrides),
            None => extracted,
        };

        let vocabulary = self.repo.vocabulary()?;
        let constraints = sanitize(merged, &vocabulary, &self.validation);

        let candidates = self.repo.query_candidates(&constraints)?;
        if candidates.is_empty() {
            return Ok(SearchResponse {
                query_text: request.query_text.clone(),
                constraints,
                results: Vec::new(),
            });
        }

        let query_embedding = {
            let mut embedder = self.embedder.lock().await;
            embedder
                .embed(vec![request.query_text.clone()])?
                .into_iter()
                .next()
                .ok_or_else(|| SearchError::Index("embedder returned no vector".to_string()))?
        };

        let items: Vec<(i32, Vec<f32>)> = candidates
            .iter()
            .filter_map(|vehicle| vehicle.embedding.clone().map(|e| (vehicle.id, e)))
            .collect();
        let k = request.limit.max(1) * self.cfg.oversample.max(1);
        let hits =
            search_top_k(&query_embedding, &items, k).map_err(|e| SearchError::Index(e.to_string()))?;

        let by_id: HashMap<i32, _> = candidates
            .into_iter()
            .map(|vehicle| (vehicle.id, vehicle))
            .collect();

        let mut results: Vec<SearchResult> = hits
            .into_iter()
            .filter_map(|(key, distance)| by_id.get(&(key as i32)).cloned().map(|v| (v, distance)))
            .map(|(vehicle, distance)| {
                let similarity = (1.0 - f64::from(distance)).clamp(0.0, 1.0);
                let constraint_match = soft_match_fraction(&constraints, &vehicle.content);
                let score = self.cfg.alpha * similarity + (1.0 - self.cfg.alpha) * constraint_match;
                SearchResult {
                    vehicle,
                    similarity,
                    constraint_match,
                    score,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.vehicle.last_seen_at.cmp(&a.vehicle.last_seen_at))
        });
        results.truncate(request.limit);

        Ok(SearchResponse {
            query_text: request.query_text.clone(),
            constraints,
            results,
        })
    }

    /// Extraction is best-effort: timeouts and failures degrade to an empty
    /// constraint set rather than failing the search.
    async fn extract_constraints(&self, query_text: &str) -> ConstraintSet {
        let Some(extractor) = &self.extractor else {
            return ConstraintSet::default();
        };

        let budget = Duration::from_secs(self.cfg.extraction_timeout_secs);
        match timeout(budget, extractor.extract(query_text)).await {
            Ok(Ok(constraints)) => constraints,
            Ok(Err(e)) => {
                log::warn!("constraint extraction failed, searching without: {e}");
                ConstraintSet::default()
            }
            Err(_) => {
                log::warn!("constraint extraction timed out, searching without");
                ConstraintSet::default()
            }
        }
    }
}

/// Fraction of the specified soft attributes the vehicle satisfies. A
/// vehicle with the attribute unset does not match; no specified soft
/// attributes means a neutral 1.0.
pub fn soft_match_fraction(constraints: &ConstraintSet, content: &VehicleContent) -> f64 {
    let specified = constraints.soft_attribute_count();
    if specified == 0 {
        return 1.0;
    }

    let mut matched = 0usize;
    if let Some(transmission) = constraints.transmission {
        if content.transmission == Some(transmission) {
            matched += 1;
        }
    }
    if let Some(fuel_type) = constraints.fuel_type {
        if content.fuel_type == Some(fuel_type) {
            matched += 1;
        }
    }
    if let Some(color) = &constraints.color {
        let wanted = color.to_lowercase();
        if content
            .color
            .as_deref()
            .is_some_and(|c| c.to_lowercase().contains(&wanted))
        {
            matched += 1;
        }
    }
    if let Some(location) = &constraints.location {
        let wanted = location.to_lowercase();
        if content
            .location
            .as_deref()
            .is_some_and(|l| l.to_lowercase().contains(&wanted))
        {
            matched += 1;
        }
    }

    matched as f64 / specified as f64
}
