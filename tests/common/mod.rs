//! Helpers for integration tests: a temporary database with the full
//! schema, plus deterministic in-memory stand-ins for the embedder, the
//! scrapers and the constraint extractor.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use tempfile::TempDir;

use carsearch::db::{establish_connection_pool, DbPool};
use carsearch::models::config::AppConfig;
use carsearch::domain::listing::RawListing;
use carsearch::domain::search::ConstraintSet;
use carsearch::processing::embedding::{normalize_embedding, Embedder, EmbeddingError};
use carsearch::query::{ConstraintExtractor, QueryError};
use carsearch::scrapers::{ScrapeError, ScrapeResult, SourceScraper};

const SCHEMA: &str = r#"
CREATE TABLE vehicles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    brand TEXT NOT NULL,
    model TEXT NOT NULL,
    year INTEGER NOT NULL,
    price_usd DOUBLE NOT NULL,
    mileage INTEGER,
    transmission TEXT,
    fuel_type TEXT,
    color TEXT,
    location TEXT,
    description TEXT NOT NULL,
    contact TEXT,
    url TEXT NOT NULL,
    embedding BLOB,
    content_hash TEXT NOT NULL,
    last_seen_at TIMESTAMP NOT NULL,
    missed_cycles INTEGER NOT NULL DEFAULT 0,
    is_active BOOLEAN NOT NULL DEFAULT 1
);

CREATE TABLE vehicle_sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vehicle_id INTEGER NOT NULL REFERENCES vehicles(id),
    source_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    url TEXT NOT NULL,
    scraped_at TIMESTAMP NOT NULL
);

CREATE TABLE vehicle_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vehicle_id INTEGER NOT NULL REFERENCES vehicles(id),
    url TEXT NOT NULL,
    position INTEGER NOT NULL
);

CREATE TABLE app_state (
    id INTEGER PRIMARY KEY,
    harvesting BOOLEAN NOT NULL DEFAULT 0
);
"#;

/// Temporary database used in integration tests.
pub struct TestDb {
    _dir: TempDir,
    pool: DbPool,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir.");
        let path = dir.path().join("test.db");
        let pool = establish_connection_pool(path.to_str().expect("utf-8 temp path"))
            .expect("Failed to establish SQLite connection.");
        let mut conn = pool
            .get()
            .expect("Failed to get SQLite connection from pool.");
        conn.batch_execute(SCHEMA).expect("Failed to create schema.");
        TestDb { _dir: dir, pool }
    }

    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }
}

/// Default configuration with retry pacing dialed down so failure-path
/// tests do not sleep through real backoff.
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.harvest.page_retries = 1;
    cfg.harvest.max_consecutive_failures = 1;
    cfg.harvest.request_delay_secs = 0;
    cfg.embedding.max_retries = 1;
    cfg.embedding.retry_base_ms = 1;
    cfg
}

const FAKE_DIMENSIONS: usize = 64;

/// Deterministic bag-of-tokens embedder: each lowercase token bumps a
/// hashed dimension, then the vector is unit-normalized. Texts sharing
/// tokens get high cosine similarity, which is all the pipeline needs.
pub struct FakeEmbedder {
    pub calls: Arc<AtomicUsize>,
    pub fail: Arc<AtomicBool>,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn embed_one(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; FAKE_DIMENSIONS];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            vector[(hasher.finish() as usize) % FAKE_DIMENSIONS] += 1.0;
        }
        normalize_embedding(&vector)
    }
}

impl Embedder for FakeEmbedder {
    fn embed(&mut self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Model("model offline".to_string()));
        }
        Ok(texts.iter().map(|text| Self::embed_one(text)).collect())
    }
}

/// Scraper stand-in serving canned pages, optionally failing every fetch.
pub struct FakeScraper {
    pub source_id: String,
    pub pages: Vec<Vec<RawListing>>,
    pub fail: bool,
}

impl FakeScraper {
    pub fn new(source_id: &str, pages: Vec<Vec<RawListing>>) -> Self {
        Self {
            source_id: source_id.to_string(),
            pages,
            fail: false,
        }
    }

    pub fn failing(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            pages: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl SourceScraper for FakeScraper {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, page: u32) -> ScrapeResult<Vec<RawListing>> {
        if self.fail {
            return Err(ScrapeError::Http("connection refused".to_string()));
        }
        Ok(self
            .pages
            .get((page - 1) as usize)
            .cloned()
            .unwrap_or_default())
    }
}

/// Extractor stand-in returning a fixed constraint set, or failing.
pub struct FakeExtractor {
    pub constraints: ConstraintSet,
    pub fail: bool,
}

impl FakeExtractor {
    pub fn returning(constraints: ConstraintSet) -> Self {
        Self {
            constraints,
            fail: false,
        }
    }
}

#[async_trait]
impl ConstraintExtractor for FakeExtractor {
    async fn extract(&self, _query: &str) -> Result<ConstraintSet, QueryError> {
        if self.fail {
            return Err(QueryError::Parse);
        }
        Ok(self.constraints.clone())
    }
}

/// A fully populated raw listing the validator accepts.
pub fn raw_listing(
    source_id: &str,
    external_id: &str,
    title: &str,
    price: &str,
    details: &str,
) -> RawListing {
    let mut listing = RawListing::new(source_id);
    listing.external_id = Some(external_id.to_string());
    listing.url = Some(format!("https://{source_id}.example/{external_id}"));
    listing.raw_text = format!("{title} {details}");
    listing
        .fields
        .insert("title".to_string(), title.to_string());
    listing
        .fields
        .insert("price".to_string(), price.to_string());
    listing
        .fields
        .insert("details".to_string(), details.to_string());
    listing
        .images
        .push(format!("https://{source_id}.example/img/{external_id}.jpg"));
    listing
}
