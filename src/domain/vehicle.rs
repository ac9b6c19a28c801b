use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::listing::{FuelType, Transmission};

/// One source's sighting of a vehicle. `(source_id, external_id)` is unique
/// within a source and is the exact-tier dedup key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub source_id: String,
    pub external_id: String,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
}

/// The merged field set of a canonical vehicle. Split out from [`Vehicle`]
/// so the dedup engine can merge contents without touching identity or
/// embedding state.
#[derive(Debug, Clone, Serialize)]
pub struct VehicleContent {
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub price_usd: f64,
    pub mileage: Option<i32>,
    pub transmission: Option<Transmission>,
    pub fuel_type: Option<FuelType>,
    pub color: Option<String>,
    pub location: Option<String>,
    pub description: String,
    pub contact: Option<String>,
    pub url: String,
}

/// The deduplicated, queryable catalog unit.
///
/// `embedding` is present only after a successful embedding run for the
/// current `content_hash`; vehicles with `embedding == None` stay in the
/// catalog but are excluded from semantic search.
#[derive(Debug, Clone, Serialize)]
pub struct Vehicle {
    pub id: i32,
    pub content: VehicleContent,
    pub images: Vec<String>,
    pub sources: Vec<SourceRef>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub content_hash: String,
    pub last_seen_at: DateTime<Utc>,
    pub missed_cycles: i32,
    pub is_active: bool,
}

/// A vehicle observed for the first time this cycle.
#[derive(Debug, Clone)]
pub struct NewVehicle {
    pub content: VehicleContent,
    pub images: Vec<String>,
    pub sources: Vec<SourceRef>,
    pub content_hash: String,
    pub last_seen_at: DateTime<Utc>,
}

/// The merged state to write back for a re-observed vehicle.
///
/// `embedding_stale` is true when the content hash changed; the repository
/// clears the stored embedding in that case so the embedding stage picks the
/// vehicle up again.
#[derive(Debug, Clone)]
pub struct VehicleUpdate {
    pub id: i32,
    pub content: VehicleContent,
    pub images: Vec<String>,
    pub sources: Vec<SourceRef>,
    pub content_hash: String,
    pub embedding_stale: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// Distinct brands and models currently in the catalog, lowercased.
/// Used to reject hallucinated constraints from query understanding.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    pub brands: Vec<String>,
    pub models: Vec<String>,
}

impl Vocabulary {
    pub fn knows_brand(&self, brand: &str) -> bool {
        let lower = brand.to_lowercase();
        self.brands.iter().any(|b| *b == lower)
    }

    pub fn knows_model(&self, model: &str) -> bool {
        let lower = model.to_lowercase();
        self.models.iter().any(|m| *m == lower)
    }
}
