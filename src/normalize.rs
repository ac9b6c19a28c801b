//! The strict schema boundary between scraped payloads and the catalog.
//!
//! Adapters hand over loosely-typed [`RawListing`]s; everything downstream
//! only ever sees [`NormalizedListing`]s that passed coercion and range
//! checks here. Rejections are logged and counted, never fatal to a cycle.

use regex::Regex;
use thiserror::Error;

use crate::domain::listing::{NormalizedListing, RawListing};
use crate::models::config::ValidationConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unparseable price: {0:?}")]
    InvalidPrice(String),
    #[error("no plausible year found in listing text")]
    MissingYear,
    #[error("year {0} outside configured range")]
    YearOutOfRange(i32),
}

/// Coerce a raw listing into the typed catalog shape, or reject it.
pub fn normalize(
    raw: &RawListing,
    cfg: &ValidationConfig,
) -> Result<NormalizedListing, ValidationError> {
    let external_id = raw
        .external_id
        .clone()
        .or_else(|| raw.field("external_id").map(str::to_string))
        .ok_or(ValidationError::MissingField("external_id"))?;

    let url = raw
        .url
        .clone()
        .ok_or(ValidationError::MissingField("url"))?;

    let title = raw
        .field("title")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ValidationError::MissingField("title"))?;

    let price_text = raw
        .field("price")
        .ok_or(ValidationError::MissingField("price"))?;
    let price_usd = parse_price(price_text)
        .ok_or_else(|| ValidationError::InvalidPrice(price_text.to_string()))?;

    let details = raw.field("details").unwrap_or("");
    let haystack = format!("{title} {details} {}", raw.raw_text);

    let year = raw
        .field("year")
        .and_then(|y| y.trim().parse::<i32>().ok())
        .or_else(|| extract_year(&haystack))
        .ok_or(ValidationError::MissingYear)?;
    if year < cfg.year_min || year > cfg.year_max {
        return Err(ValidationError::YearOutOfRange(year));
    }

    let (brand, model) = match (raw.field("brand"), raw.field("model")) {
        (Some(brand), Some(model)) => (brand.to_string(), model.to_string()),
        _ => split_title(title).ok_or(ValidationError::MissingField("brand"))?,
    };

    let description = raw
        .field("description")
        .map(str::to_string)
        .unwrap_or_else(|| haystack.trim().to_string());

    Ok(NormalizedListing {
        source_id: raw.source_id.clone(),
        external_id,
        brand,
        model,
        year,
        price_usd,
        mileage: extract_mileage(&haystack),
        transmission: raw
            .field("transmission")
            .or(Some(haystack.as_str()))
            .and_then(find_transmission),
        fuel_type: raw
            .field("fuel_type")
            .or(Some(haystack.as_str()))
            .and_then(find_fuel_type),
        color: raw.field("color").map(str::to_string),
        location: raw.field("location").map(str::to_string),
        description,
        images: raw.images.clone(),
        contact: raw.field("contact").map(str::to_string),
        url,
        scraped_at: raw.fetched_at,
    })
}

/// Parse a display price like `"$ 32.500"`, `"32,500 USD"` or `"27500"`.
///
/// Venezuelan listings use both `.` and `,` as thousand separators and the
/// amounts are whole dollars, so every non-digit is stripped.
pub fn parse_price(text: &str) -> Option<f64> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok().map(|value| value as f64)
}

/// Find a four-digit year (1960–2039) in free text.
pub fn extract_year(text: &str) -> Option<i32> {
    let re = Regex::new(r"\b(19[6-9]\d|20[0-3]\d)\b").unwrap();
    re.captures(text)
        .and_then(|captures| captures[1].parse().ok())
}

/// Find a mileage figure like `"45.000 km"` in free text.
pub fn extract_mileage(text: &str) -> Option<i32> {
    let cleaned = text.to_lowercase().replace(['.', ','], "");
    let re = Regex::new(r"(\d+)\s*(?:km|kilometros|kilómetros)\b").unwrap();
    re.captures(&cleaned)
        .and_then(|captures| captures[1].parse().ok())
}

fn find_transmission(text: &str) -> Option<crate::domain::listing::Transmission> {
    let lower = text.to_lowercase();
    for word in lower.split(|c: char| !c.is_alphanumeric()) {
        if let Ok(t) = word.parse() {
            return Some(t);
        }
    }
    None
}

fn find_fuel_type(text: &str) -> Option<crate::domain::listing::FuelType> {
    let lower = text.to_lowercase();
    for word in lower.split(|c: char| !c.is_alphanumeric()) {
        if let Ok(f) = word.parse() {
            return Some(f);
        }
    }
    None
}

/// Derive (brand, model) from a listing title: the first token is the
/// brand, everything after it up to the year token is the model.
pub fn split_title(title: &str) -> Option<(String, String)> {
    let mut parts = title.split_whitespace();
    let brand = parts.next()?.to_string();

    let model_parts: Vec<&str> = parts
        .take_while(|part| extract_year(part).is_none())
        .collect();
    if model_parts.is_empty() {
        return None;
    }
    Some((brand, model_parts.join(" ")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;

    use super::*;
    use crate::domain::listing::{FuelType, Transmission};

    fn raw(fields: &[(&str, &str)]) -> RawListing {
        RawListing {
            source_id: "tucarro".to_string(),
            external_id: Some("MLV1".to_string()),
            url: Some("https://example.com/MLV1".to_string()),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            images: vec![],
            raw_text: String::new(),
            fetched_at: Utc::now(),
        }
    }

    fn cfg() -> ValidationConfig {
        ValidationConfig {
            year_min: 1990,
            year_max: 2030,
        }
    }

    #[test]
    fn normalizes_a_complete_listing() {
        let raw = raw(&[
            ("title", "Toyota 4Runner 2019"),
            ("price", "$ 32.500"),
            ("details", "2019; 45.000 km; Automática; Gasolina"),
            ("location", "Caracas"),
        ]);

        let listing = normalize(&raw, &cfg()).expect("valid listing");

        assert_eq!(listing.brand, "Toyota");
        assert_eq!(listing.model, "4Runner");
        assert_eq!(listing.year, 2019);
        assert_eq!(listing.price_usd, 32_500.0);
        assert_eq!(listing.mileage, Some(45_000));
        assert_eq!(listing.transmission, Some(Transmission::Automatic));
        assert_eq!(listing.fuel_type, Some(FuelType::Gasoline));
        assert_eq!(listing.location.as_deref(), Some("Caracas"));
    }

    #[test]
    fn rejects_missing_external_id() {
        let mut listing = raw(&[("title", "Ford Fiesta 2015"), ("price", "4500")]);
        listing.external_id = None;

        assert_eq!(
            normalize(&listing, &cfg()),
            Err(ValidationError::MissingField("external_id"))
        );
    }

    #[test]
    fn rejects_unparseable_price() {
        let listing = raw(&[("title", "Ford Fiesta 2015"), ("price", "consultar")]);

        assert!(matches!(
            normalize(&listing, &cfg()),
            Err(ValidationError::InvalidPrice(_))
        ));
    }

    #[test]
    fn rejects_year_outside_configured_range() {
        let listing = raw(&[("title", "Ford Modelo T 2035"), ("price", "9000")]);

        assert_eq!(
            normalize(&listing, &cfg()),
            Err(ValidationError::YearOutOfRange(2035))
        );
    }

    #[test]
    fn rejects_listing_without_year() {
        let listing = raw(&[("title", "Ford Fiesta"), ("price", "4500")]);

        assert_eq!(normalize(&listing, &cfg()), Err(ValidationError::MissingYear));
    }

    #[test]
    fn price_parsing_handles_separator_styles() {
        assert_eq!(parse_price("$ 32.500"), Some(32_500.0));
        assert_eq!(parse_price("32,500 USD"), Some(32_500.0));
        assert_eq!(parse_price("27500"), Some(27_500.0));
        assert_eq!(parse_price("a convenir"), None);
    }

    #[test]
    fn title_split_stops_at_year() {
        assert_eq!(
            split_title("Toyota 4Runner Limited 2019"),
            Some(("Toyota".to_string(), "4Runner Limited".to_string()))
        );
        assert_eq!(split_title("Toyota"), None);
    }
}
