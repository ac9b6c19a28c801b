pub mod db;
pub mod dedup;
pub mod domain;
pub mod models;
pub mod normalize;
pub mod processing;
pub mod query;
pub mod repository;
pub mod scrapers;
pub mod search;

/// Output dimensionality of the multilingual E5 embedding model.
pub const EMBEDDING_DIMENSIONS: usize = 1024;
