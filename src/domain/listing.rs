use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record as fetched from one source, before validation.
///
/// Owned by the adapter that produced it and discarded after normalization.
/// Adapters put whatever they managed to extract into `fields`; typed
/// coercion happens in [`crate::normalize`].
#[derive(Debug, Clone)]
pub struct RawListing {
    pub source_id: String,
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub fields: HashMap<String, String>,
    pub images: Vec<String>,
    pub raw_text: String,
    pub fetched_at: DateTime<Utc>,
}

impl RawListing {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            external_id: None,
            url: None,
            fields: HashMap::new(),
            images: Vec::new(),
            raw_text: String::new(),
            fetched_at: Utc::now(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transmission {
    Manual,
    Automatic,
}

impl Transmission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transmission::Manual => "Manual",
            Transmission::Automatic => "Automática",
        }
    }
}

impl fmt::Display for Transmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transmission {
    type Err = ();

    /// Maps the Spanish synonyms the sources use. Unknown values are an error
    /// so callers can fall back to `None` instead of guessing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        if lower.starts_with("autom") || lower == "at" || lower == "automatic" {
            Ok(Transmission::Automatic)
        } else if lower == "manual" || lower.starts_with("sincr") {
            Ok(Transmission::Manual)
        } else {
            Err(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuelType {
    Gasoline,
    Diesel,
    Electric,
    Hybrid,
}

impl FuelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FuelType::Gasoline => "Gasolina",
            FuelType::Diesel => "Diesel",
            FuelType::Electric => "Eléctrico",
            FuelType::Hybrid => "Híbrido",
        }
    }
}

impl fmt::Display for FuelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FuelType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        if lower.starts_with("gasolina") || lower == "gas" {
            Ok(FuelType::Gasoline)
        } else if lower.starts_with("diesel") || lower.starts_with("diésel") {
            Ok(FuelType::Diesel)
        } else if lower.starts_with("eléctric") || lower.starts_with("electric") {
            Ok(FuelType::Electric)
        } else if lower.starts_with("híbrid") || lower.starts_with("hibrid") {
            Ok(FuelType::Hybrid)
        } else {
            Err(())
        }
    }
}

/// A listing after validation: typed fields, invariants enforced.
///
/// Prices are catalog-canonical USD; listings without a parseable USD price
/// never make it past [`crate::normalize::normalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedListing {
    pub source_id: String,
    pub external_id: String,
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
    pub images: Vec<String>,
    pub contact: Option<String>,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
}
