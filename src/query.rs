//! Query understanding: turn a free-text query into a [`ConstraintSet`]
//! via an LLM, then sanitize the result against the live catalog.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::search::ConstraintSet;
use crate::domain::vehicle::Vocabulary;
use crate::models::config::ValidationConfig;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const MESSAGES_PATH: &str = "/v1/messages";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-haiku-4-5";
const MAX_TOKENS: u32 = 256;

/// The model must answer with exactly this JSON shape; unknown or absent
/// facts stay null so nothing gets invented.
const SYSTEM_PROMPT: &str = "\
Eres un asistente de búsqueda de vehículos usados. Extrae restricciones \
estructuradas de la consulta del usuario.

Reglas:
1. Responde SOLO con un objeto JSON, sin prosa, sin markdown, sin bloques de código.
2. Usa exactamente estas claves: \"brand\", \"model\", \"year_min\", \"year_max\", \
\"price_max_usd\", \"transmission\", \"fuel_type\", \"color\", \"location\".
3. Si la consulta no menciona un dato, su valor es null. Nunca inventes valores.
4. \"transmission\" es \"manual\" o \"automatica\"; \"fuel_type\" es \"gasolina\", \
\"diesel\", \"electrico\" o \"hibrido\".
5. Los precios son montos en dólares; \"menos de 35000\" implica \"price_max_usd\": 35000.
6. Un solo año mencionado (\"del 2019\") implica year_min y year_max iguales.

Ejemplo de entrada: \"Toyota 4Runner 2018-2020 automática por menos de 35000\"
Ejemplo de salida: {\"brand\": \"Toyota\", \"model\": \"4Runner\", \"year_min\": 2018, \
\"year_max\": 2020, \"price_max_usd\": 35000, \"transmission\": \"automatica\", \
\"fuel_type\": null, \"color\": null, \"location\": null}";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("constraint extraction request failed: {0}")]
    Request(String),
    #[error("constraint extraction returned an unparseable response")]
    Parse,
}

/// Seam over constraint extraction so search can be tested without an LLM
/// and degrades to pure-semantic ranking when extraction fails.
#[async_trait]
pub trait ConstraintExtractor: Send + Sync {
    async fn extract(&self, query: &str) -> Result<ConstraintSet, QueryError>;
}

#[derive(serde::Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(serde::Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: String,
}

/// The raw JSON shape the model answers with; enums arrive as free text and
/// are mapped through the same parsers the scrapers use.
#[derive(Deserialize)]
struct RawConstraints {
    brand: Option<String>,
    model: Option<String>,
    year_min: Option<i32>,
    year_max: Option<i32>,
    price_max_usd: Option<f64>,
    transmission: Option<String>,
    fuel_type: Option<String>,
    color: Option<String>,
    location: Option<String>,
}

/// Extractor backed by the Anthropic Messages API (or any compatible
/// endpoint via `ANTHROPIC_BASE_URL`).
pub struct LlmConstraintExtractor {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl LlmConstraintExtractor {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let base: String = base_url.into();
        let url = format!("{}{}", base.trim_end_matches('/'), MESSAGES_PATH);
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            url,
        }
    }

    /// Reads `ANTHROPIC_API_KEY` (required), `ANTHROPIC_MODEL` and
    /// `ANTHROPIC_BASE_URL` from the environment. Returns `None` without a
    /// key; search then runs with empty constraint sets.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("ANTHROPIC_API_KEY").ok()?;
        let base =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Some(Self::new(key, model, base))
    }
}

/// Pull the first `{…}` block out of the response and deserialize it.
/// Tolerates prose or code fences around the object.
fn parse_constraints(text: &str) -> Option<ConstraintSet> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let raw: RawConstraints = serde_json::from_str(&text[start..=end]).ok()?;

    Some(ConstraintSet {
        brand: raw.brand.filter(|b| !b.trim().is_empty()),
        model: raw.model.filter(|m| !m.trim().is_empty()),
        year_min: raw.year_min,
        year_max: raw.year_max,
        price_max_usd: raw.price_max_usd,
        transmission: raw.transmission.and_then(|t| t.parse().ok()),
        fuel_type: raw.fuel_type.and_then(|f| f.parse().ok()),
        color: raw.color.filter(|c| !c.trim().is_empty()),
        location: raw.location.filter(|l| !l.trim().is_empty()),
    })
}

#[async_trait]
impl ConstraintExtractor for LlmConstraintExtractor {
    async fn extract(&self, query: &str) -> Result<ConstraintSet, QueryError> {
        let request = ApiRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: SYSTEM_PROMPT,
            messages: vec![ApiMessage {
                role: "user",
                content: query,
            }],
        };

        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| QueryError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(QueryError::Request(format!("API returned {status}")));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| QueryError::Request(e.to_string()))?;

        let text = api_response
            .content
            .into_iter()
            .next()
            .map(|block| block.text)
            .unwrap_or_default();

        parse_constraints(&text).ok_or(QueryError::Parse)
    }
}

/// Drop extracted values the catalog cannot honor: unknown brands and
/// models, years outside the validation range, non-positive prices, and
/// inverted year ranges.
pub fn sanitize(
    constraints: ConstraintSet,
    vocabulary: &Vocabulary,
    validation: &ValidationConfig,
) -> ConstraintSet {
    let mut out = constraints;

    if let Some(brand) = &out.brand {
        if !vocabulary.knows_brand(brand) {
            log::debug!("dropping unknown brand constraint: {brand}");
            out.brand = None;
        }
    }
    if let Some(model) = &out.model {
        if !vocabulary.knows_model(model) {
            log::debug!("dropping unknown model constraint: {model}");
            out.model = None;
        }
    }

    let in_range = |year: i32| year >= validation.year_min && year <= validation.year_max;
    if out.year_min.is_some_and(|y| !in_range(y)) {
        out.year_min = None;
    }
    if out.year_max.is_some_and(|y| !in_range(y)) {
        out.year_max = None;
    }
    if let (Some(min), Some(max)) = (out.year_min, out.year_max) {
        if min > max {
            out.year_min = None;
            out.year_max = None;
        }
    }

    if out.price_max_usd.is_some_and(|p| p <= 0.0) {
        out.price_max_usd = None;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::listing::{FuelType, Transmission};

    fn vocabulary() -> Vocabulary {
        Vocabulary {
            brands: vec!["toyota".to_string(), "ford".to_string()],
            models: vec!["4runner".to_string(), "fiesta".to_string()],
        }
    }

    #[test]
    fn parses_model_response_with_prose_around_json() {
        let text = r#"Aquí están las restricciones:
            {"brand": "Toyota", "model": "4Runner", "year_min": 2018,
             "year_max": 2020, "price_max_usd": 35000,
             "transmission": "automatica", "fuel_type": "gasolina",
             "color": null, "location": null}"#;

        let constraints = parse_constraints(text).expect("parses");

        assert_eq!(constraints.brand.as_deref(), Some("Toyota"));
        assert_eq!(constraints.year_min, Some(2018));
        assert_eq!(constraints.year_max, Some(2020));
        assert_eq!(constraints.price_max_usd, Some(35_000.0));
        assert_eq!(constraints.transmission, Some(Transmission::Automatic));
        assert_eq!(constraints.fuel_type, Some(FuelType::Gasoline));
    }

    #[test]
    fn unknown_enum_values_become_none() {
        let text = r#"{"brand": null, "model": null, "year_min": null,
            "year_max": null, "price_max_usd": null,
            "transmission": "cvt-magica", "fuel_type": "gnv",
            "color": "rojo", "location": null}"#;

        let constraints = parse_constraints(text).expect("parses");

        assert_eq!(constraints.transmission, None);
        assert_eq!(constraints.fuel_type, None);
        assert_eq!(constraints.color.as_deref(), Some("rojo"));
    }

    #[test]
    fn garbage_response_fails_to_parse() {
        assert!(parse_constraints("no json here").is_none());
    }

    #[test]
    fn sanitize_drops_unknown_brand_and_model() {
        let constraints = ConstraintSet {
            brand: Some("Lada".to_string()),
            model: Some("4Runner".to_string()),
            ..Default::default()
        };

        let sanitized = sanitize(constraints, &vocabulary(), &ValidationConfig::default());

        assert_eq!(sanitized.brand, None);
        assert_eq!(sanitized.model.as_deref(), Some("4Runner"));
    }

    #[test]
    fn sanitize_drops_inverted_year_range_and_bad_price() {
        let constraints = ConstraintSet {
            year_min: Some(2022),
            year_max: Some(2018),
            price_max_usd: Some(-5.0),
            ..Default::default()
        };

        let sanitized = sanitize(constraints, &vocabulary(), &ValidationConfig::default());

        assert_eq!(sanitized.year_min, None);
        assert_eq!(sanitized.year_max, None);
        assert_eq!(sanitized.price_max_usd, None);
    }
}
