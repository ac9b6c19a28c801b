//! SQLite connection pool shared by every component that touches the catalog.

use diesel::r2d2::{ConnectionManager, Pool, PoolError, PooledConnection};
use diesel::sqlite::SqliteConnection;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Build the r2d2 pool for the given database URL.
///
/// The pool is created once in `main` (or a test harness) and passed
/// explicitly into the repository; nothing in the crate holds global
/// connection state.
pub fn establish_connection_pool(database_url: &str) -> Result<DbPool, PoolError> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    Pool::builder().build(manager)
}
