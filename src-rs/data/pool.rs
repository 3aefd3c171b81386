use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::{ManageConnection, Pool};
use rusqlite::{Connection, OpenFlags};

use super::DataError;

/// Opens one database file per logical name. Files are never created here, so
/// a missing database surfaces as a connection error.
#[derive(Debug, Clone)]
pub struct SqliteConnectionManager {
    path: PathBuf,
}

impl SqliteConnectionManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_size: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Lazily created pool per logical database name.
pub struct DatabasePools {
    data_dir: PathBuf,
    settings: PoolSettings,
    pools: RefCell<HashMap<String, Pool<SqliteConnectionManager>>>,
}

impl DatabasePools {
    pub fn new(data_dir: impl Into<PathBuf>, settings: PoolSettings) -> Self {
        Self {
            data_dir: data_dir.into(),
            settings,
            pools: RefCell::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self, database: &str) -> PathBuf {
        self.data_dir.join(format!("{database}.db"))
    }

    fn pool(&self, database: &str) -> Result<Pool<SqliteConnectionManager>, DataError> {
        if let Some(pool) = self.pools.borrow().get(database) {
            return Ok(pool.clone());
        }
        let manager = SqliteConnectionManager::new(self.database_path(database));
        let pool = Pool::builder()
            .max_size(self.settings.max_size.max(1))
            .min_idle(Some(0))
            .connection_timeout(self.settings.acquire_timeout)
            .build(manager)
            .map_err(|err| DataError::query(database, err))?;
        log::debug!(
            "[data] created pool for {database} (max {})",
            self.settings.max_size
        );
        self.pools
            .borrow_mut()
            .insert(database.to_string(), pool.clone());
        Ok(pool)
    }

    /// Runs `f` with a pooled connection. The connection goes back to the pool
    /// when `f` returns, whether it succeeded or not.
    pub fn with_connection<T>(
        &self,
        database: &str,
        f: impl FnOnce(&Connection) -> Result<T, DataError>,
    ) -> Result<T, DataError> {
        let pool = self.pool(database)?;
        let conn = pool.get().map_err(|err| {
            if pool.state().connections >= pool.max_size() {
                DataError::PoolExhausted(database.to_string())
            } else {
                DataError::query(database, err)
            }
        })?;
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed(dir: &Path, name: &str) {
        let conn = Connection::open(dir.join(format!("{name}.db"))).unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();
    }

    #[test]
    fn with_connection_runs_query_and_releases() {
        let dir = tempdir().unwrap();
        seed(dir.path(), "ctAlpha");
        let pools = DatabasePools::new(
            dir.path(),
            PoolSettings {
                max_size: 1,
                acquire_timeout: Duration::from_millis(200),
            },
        );
        for _ in 0..3 {
            let value: i64 = pools
                .with_connection("ctAlpha", |conn| {
                    conn.query_row("SELECT v FROM t", [], |row| row.get(0))
                        .map_err(|err| DataError::query("ctAlpha", err))
                })
                .unwrap();
            assert_eq!(value, 7);
        }
    }

    #[test]
    fn connection_is_released_after_error() {
        let dir = tempdir().unwrap();
        seed(dir.path(), "ctAlpha");
        let pools = DatabasePools::new(
            dir.path(),
            PoolSettings {
                max_size: 1,
                acquire_timeout: Duration::from_millis(200),
            },
        );
        let failed: Result<(), DataError> = pools.with_connection("ctAlpha", |_| {
            Err(DataError::Missing("forced".into()))
        });
        assert!(failed.is_err());
        assert!(pools.with_connection("ctAlpha", |_| Ok(())).is_ok());
    }

    #[test]
    fn nested_acquire_beyond_max_size_is_exhaustion() {
        let dir = tempdir().unwrap();
        seed(dir.path(), "ctAlpha");
        let pools = DatabasePools::new(
            dir.path(),
            PoolSettings {
                max_size: 1,
                acquire_timeout: Duration::from_millis(100),
            },
        );
        let result = pools.with_connection("ctAlpha", |_| {
            pools.with_connection("ctAlpha", |_| Ok(()))
        });
        assert!(matches!(result, Err(DataError::PoolExhausted(name)) if name == "ctAlpha"));
    }

    #[test]
    fn missing_database_is_a_query_error() {
        let dir = tempdir().unwrap();
        let pools = DatabasePools::new(
            dir.path(),
            PoolSettings {
                max_size: 2,
                acquire_timeout: Duration::from_millis(100),
            },
        );
        let result = pools.with_connection("ctMissing", |_| Ok(()));
        assert!(matches!(result, Err(DataError::Query { .. })));
    }
}
