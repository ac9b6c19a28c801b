//! Embedding prompts, hashing, the embedder seam and the per-cycle
//! embedding stage.

use std::error::Error;
use std::time::Duration;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error as ThisError;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::domain::vehicle::VehicleContent;
use crate::models::config::EmbeddingConfig;
use crate::repository::{RepositoryError, VehicleReader, VehicleWriter};

#[derive(Debug, ThisError)]
pub enum EmbeddingError {
    #[error("embedding model failure: {0}")]
    Model(String),
}

/// Seam over the embedding model so the pipeline and search can be tested
/// without loading model weights.
pub trait Embedder: Send {
    fn embed(&mut self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Production embedder backed by a local multilingual E5 model. Listings
/// are Spanish-language, so the multilingual checkpoint is not optional.
pub struct FastembedEmbedder {
    model: TextEmbedding,
}

impl FastembedEmbedder {
    pub fn new() -> Result<Self, EmbeddingError> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::MultilingualE5Large).with_show_download_progress(false),
        )
        .map_err(|e| EmbeddingError::Model(e.to_string()))?;
        Ok(Self { model })
    }
}

impl Embedder for FastembedEmbedder {
    fn embed(&mut self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let vectors = self
            .model
            .embed(texts, None)
            .map_err(|e| EmbeddingError::Model(e.to_string()))?;
        check_dimensions(&vectors)?;
        Ok(vectors.iter().map(|v| normalize_embedding(v)).collect())
    }
}

/// Guard against a swapped-out model checkpoint: stored blobs and the query
/// path both assume [`crate::EMBEDDING_DIMENSIONS`]-wide vectors.
fn check_dimensions(vectors: &[Vec<f32>]) -> Result<(), EmbeddingError> {
    match vectors.iter().find(|v| v.len() != crate::EMBEDDING_DIMENSIONS) {
        Some(v) => Err(EmbeddingError::Model(format!(
            "expected {} dimensions, model produced {}",
            crate::EMBEDDING_DIMENSIONS,
            v.len()
        ))),
        None => Ok(()),
    }
}

/// Maximum description characters included in the embedding prompt.
const DESCRIPTION_LIMIT: usize = 500;

/// Build the textual prompt describing a vehicle for embedding.
///
/// Field order is fixed and optional fields are skipped when absent, so the
/// same content always yields the same prompt. Labels are Spanish to match
/// the listing language the model sees at query time.
pub fn embedding_text(content: &VehicleContent) -> String {
    let mut lines = vec![
        format!("Marca: {}", content.brand),
        format!("Modelo: {}", content.model),
        format!("Año: {}", content.year),
        format!("Precio: {} USD", content.price_usd),
    ];
    if let Some(mileage) = content.mileage {
        lines.push(format!("Kilometraje: {mileage} km"));
    }
    if let Some(transmission) = content.transmission {
        lines.push(format!("Transmisión: {}", transmission.as_str()));
    }
    if let Some(fuel_type) = content.fuel_type {
        lines.push(format!("Combustible: {}", fuel_type.as_str()));
    }
    if let Some(color) = &content.color {
        lines.push(format!("Color: {color}"));
    }
    if let Some(location) = &content.location {
        lines.push(format!("Ubicación: {location}"));
    }
    let description: String = content.description.chars().take(DESCRIPTION_LIMIT).collect();
    lines.push(format!("Descripción: {description}"));
    lines.join("\n")
}

/// SHA-256 of the embedding prompt; a vehicle only needs re-embedding when
/// this changes.
pub fn content_hash(content: &VehicleContent) -> String {
    let digest = Sha256::digest(embedding_text(content).as_bytes());
    digest.iter().fold(String::new(), |mut hex, byte| {
        hex.push_str(&format!("{byte:02x}"));
        hex
    })
}

/// Normalize a vector to unit length.
///
/// Returns the original vector when the norm is zero.
pub fn normalize_embedding(vec: &[f32]) -> Vec<f32> {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        vec.to_vec()
    } else {
        vec.iter().map(|x| x / norm).collect()
    }
}

fn index_options(dimensions: usize, capacity: usize) -> IndexOptions {
    // Graph connectivity scales roughly with sqrt(N); the clamp keeps tiny
    // and huge candidate sets within usearch's sensible range.
    let connectivity = ((capacity as f64).sqrt() as usize).clamp(16, 64);
    IndexOptions {
        dimensions,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F32,
        connectivity,
        ..Default::default()
    }
}

/// Search the top-k closest vectors to the query embedding.
///
/// Builds an ephemeral index over the candidate set; candidate sets are
/// pre-filtered by hard constraints and stay small enough that rebuilding
/// per query beats maintaining a persistent index through merges.
pub fn search_top_k<T>(
    query_embedding: &[f32],
    items: &[(i32, T)],
    k: usize,
) -> Result<Vec<(u64, f32)>, Box<dyn Error>>
where
    T: AsRef<[f32]>,
{
    if items.is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let index = Index::new(&index_options(query_embedding.len(), items.len()))?;
    index.reserve(items.len())?;

    for (id, embedding) in items {
        index.add(*id as u64, embedding.as_ref())?;
    }

    let neighbors = index.search(query_embedding, k)?;

    Ok(neighbors
        .keys
        .iter()
        .zip(neighbors.distances.iter())
        .map(|(&key, &distance)| (key, distance))
        .collect())
}

#[derive(Debug, Default)]
pub struct EmbeddingStats {
    pub embedded: usize,
    /// Vehicles left without an embedding this cycle; they stay active but
    /// out of search until a later cycle succeeds.
    pub pending: usize,
    pub failed_batches: usize,
}

/// Embed every vehicle whose stored embedding is missing, in batches with
/// bounded retry. A batch that exhausts its retries is skipped, not fatal.
pub async fn run_embedding_stage<R, E>(
    repo: &R,
    embedder: &mut E,
    cfg: &EmbeddingConfig,
) -> Result<EmbeddingStats, RepositoryError>
where
    R: VehicleReader + VehicleWriter,
    E: Embedder,
{
    let pending = repo.list_pending_embedding()?;
    let mut stats = EmbeddingStats::default();

    for batch in pending.chunks(cfg.batch_size.max(1)) {
        let texts: Vec<String> = batch
            .iter()
            .map(|vehicle| embedding_text(&vehicle.content))
            .collect();

        match embed_with_retry(embedder, texts, cfg).await {
            Ok(vectors) => {
                for (vehicle, vector) in batch.iter().zip(vectors) {
                    repo.set_embedding(vehicle.id, &vector)?;
                    stats.embedded += 1;
                }
            }
            Err(e) => {
                log::error!(
                    "embedding batch of {} failed after {} attempts: {e}",
                    batch.len(),
                    cfg.max_retries
                );
                stats.failed_batches += 1;
                stats.pending += batch.len();
            }
        }
    }

    Ok(stats)
}

async fn embed_with_retry<E: Embedder>(
    embedder: &mut E,
    texts: Vec<String>,
    cfg: &EmbeddingConfig,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut last_error = EmbeddingError::Model("no attempts made".to_string());
    for attempt in 0..cfg.max_retries.max(1) {
        if attempt > 0 {
            let backoff = Duration::from_millis(
                cfg.retry_base_ms.saturating_mul(1 << attempt.min(6))
                    + rand::thread_rng().gen_range(0..250),
            );
            tokio::time::sleep(backoff).await;
        }
        match embedder.embed(texts.clone()) {
            Ok(vectors) => return Ok(vectors),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::listing::{FuelType, Transmission};

    fn content() -> VehicleContent {
        VehicleContent {
            brand: "Toyota".to_string(),
            model: "4Runner".to_string(),
            year: 2019,
            price_usd: 32_500.0,
            mileage: Some(45_000),
            transmission: Some(Transmission::Automatic),
            fuel_type: Some(FuelType::Gasoline),
            color: None,
            location: Some("Caracas".to_string()),
            description: "SR5 4x4 poco uso".to_string(),
            contact: None,
            url: "https://example.com/MLV1".to_string(),
        }
    }

    #[test]
    fn prompt_has_stable_field_order() {
        let text = embedding_text(&content());
        let marca = text.find("Marca:").unwrap();
        let anio = text.find("Año:").unwrap();
        let descripcion = text.find("Descripción:").unwrap();
        assert!(marca < anio && anio < descripcion);
        assert!(!text.contains("Color:"));
    }

    #[test]
    fn hash_changes_only_with_content() {
        let a = content();
        let mut b = content();
        assert_eq!(content_hash(&a), content_hash(&b));

        b.price_usd = 31_000.0;
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn normalize_embedding_handles_zero_vector() {
        assert_eq!(normalize_embedding(&[0.0, 0.0]), vec![0.0, 0.0]);
        let normalized = normalize_embedding(&[3.0, 4.0]);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn search_top_k_handles_empty_candidate_set() {
        let query = vec![0.2_f32, 0.8, 0.1, 0.4];
        let candidates: Vec<(i32, Vec<f32>)> = Vec::new();

        assert!(search_top_k(&query, &candidates, 5)
            .expect("search succeeds")
            .is_empty());
    }

    #[test]
    fn search_top_k_ranks_the_closest_vehicle_first() {
        // Toy four-dimensional stand-ins for vehicle embeddings; id 12 is
        // colinear with the query and must come back on top.
        let query = vec![0.9_f32, 0.1, 0.0, 0.4];
        let candidates = vec![
            (7, vec![0.0_f32, 1.0, 0.2, 0.0]),
            (12, vec![0.9_f32, 0.1, 0.0, 0.4]),
            (31, vec![0.5_f32, 0.5, 0.1, 0.2]),
        ];

        let hits = search_top_k(&query, &candidates, 2).expect("search succeeds");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 12);
        assert!(hits[0].1 <= hits[1].1);
    }

    #[test]
    fn mismatched_model_dimensions_are_rejected() {
        let good = vec![vec![0.0_f32; crate::EMBEDDING_DIMENSIONS]];
        assert!(check_dimensions(&good).is_ok());

        let bad = vec![vec![0.0_f32; 384]];
        assert!(check_dimensions(&bad).is_err());
    }
}
