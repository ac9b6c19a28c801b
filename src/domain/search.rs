use serde::{Deserialize, Serialize};

use crate::domain::listing::{FuelType, Transmission};
use crate::domain::vehicle::Vehicle;

/// Structured constraints extracted from a free-text query.
///
/// Brand, model, year range and max price are hard constraints: candidates
/// violating them are excluded before ranking. Transmission, fuel type,
/// color and location are soft attributes that only influence the score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub price_max_usd: Option<f64>,
    pub transmission: Option<Transmission>,
    pub fuel_type: Option<FuelType>,
    pub color: Option<String>,
    pub location: Option<String>,
}

impl ConstraintSet {
    pub fn is_empty(&self) -> bool {
        self.brand.is_none()
            && self.model.is_none()
            && self.year_min.is_none()
            && self.year_max.is_none()
            && self.price_max_usd.is_none()
            && self.transmission.is_none()
            && self.fuel_type.is_none()
            && self.color.is_none()
            && self.location.is_none()
    }

    /// Field-wise merge where `overrides` wins wherever it is set.
    pub fn merged_with(&self, overrides: &ConstraintSet) -> ConstraintSet {
        ConstraintSet {
            brand: overrides.brand.clone().or_else(|| self.brand.clone()),
            model: overrides.model.clone().or_else(|| self.model.clone()),
            year_min: overrides.year_min.or(self.year_min),
            year_max: overrides.year_max.or(self.year_max),
            price_max_usd: overrides.price_max_usd.or(self.price_max_usd),
            transmission: overrides.transmission.or(self.transmission),
            fuel_type: overrides.fuel_type.or(self.fuel_type),
            color: overrides.color.clone().or_else(|| self.color.clone()),
            location: overrides.location.clone().or_else(|| self.location.clone()),
        }
    }

    /// Number of soft attributes the caller actually specified.
    pub fn soft_attribute_count(&self) -> usize {
        [
            self.transmission.is_some(),
            self.fuel_type.is_some(),
            self.color.is_some(),
            self.location.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// What the routing/API collaborator hands the core.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query_text: String,
    pub limit: usize,
    /// Explicit constraints that take precedence over extracted ones.
    pub overrides: Option<ConstraintSet>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub vehicle: Vehicle,
    pub similarity: f64,
    pub constraint_match: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query_text: String,
    /// The constraints actually applied, surfaced even for empty results.
    pub constraints: ConstraintSet,
    pub results: Vec<SearchResult>,
}
