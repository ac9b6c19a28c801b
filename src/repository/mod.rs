use thiserror::Error;

use crate::db::{DbConnection, DbPool};
use crate::domain::search::ConstraintSet;
use crate::domain::vehicle::{NewVehicle, Vehicle, VehicleUpdate, Vocabulary};

pub mod vehicle;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("entity not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Diesel-backed repository over the shared r2d2 pool.
#[derive(Clone)]
pub struct DieselRepository {
    pool: DbPool,
}

impl DieselRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub(crate) fn conn(&self) -> RepositoryResult<DbConnection> {
        Ok(self.pool.get()?)
    }
}

pub trait VehicleReader {
    /// Every active vehicle with sources and images attached.
    fn list_active(&self) -> RepositoryResult<Vec<Vehicle>>;

    /// The whole catalog, deactivated vehicles included. The dedup engine
    /// matches the cycle's listings against this set so a vehicle that
    /// reappears after retirement merges back into its original row
    /// instead of spawning a duplicate.
    fn list_all(&self) -> RepositoryResult<Vec<Vehicle>>;

    /// Active, embedded vehicles satisfying the hard constraints. Soft
    /// attributes are left to the ranking stage.
    fn query_candidates(&self, constraints: &ConstraintSet) -> RepositoryResult<Vec<Vehicle>>;

    /// Active vehicles whose stored embedding is missing or stale.
    fn list_pending_embedding(&self) -> RepositoryResult<Vec<Vehicle>>;

    /// Distinct brands and models for constraint sanitization.
    fn vocabulary(&self) -> RepositoryResult<Vocabulary>;
}

pub trait VehicleWriter {
    fn create_vehicles(&self, vehicles: &[NewVehicle]) -> RepositoryResult<usize>;

    /// Apply merged updates; clears the stored embedding wherever
    /// `embedding_stale` is set.
    fn apply_merges(&self, updates: &[VehicleUpdate]) -> RepositoryResult<usize>;

    fn set_embedding(&self, vehicle_id: i32, embedding: &[f32]) -> RepositoryResult<usize>;

    /// Bump `missed_cycles` for active vehicles not in `seen_ids` and
    /// deactivate those that exceeded `retention_cycles`. Returns the number
    /// deactivated.
    fn retire_unseen(&self, seen_ids: &[i32], retention_cycles: i32) -> RepositoryResult<usize>;
}

/// Single-flight lock for harvest cycles, stored in the database so it
/// survives across processes.
pub trait HarvestGuard {
    /// Returns false when another cycle already holds the lock.
    fn claim_harvest_lock(&self) -> RepositoryResult<bool>;
    fn release_harvest_lock(&self) -> RepositoryResult<()>;
}
