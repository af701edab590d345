//! Connection pool registry.
//!
//! One deadpool-postgres pool per configured database, owned by the server
//! value for the process lifetime. Pool creation does not connect; the first
//! acquisition does, so a misconfigured secondary database surfaces on first
//! use rather than at boot.

use std::{collections::HashMap, time::Duration};

use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use crate::{
    config::DatabaseConfig,
    error::{InitError, QueryError}
};

/// Build one pool from a database entry.
pub fn create_pool(db: &DatabaseConfig) -> Result<Pool, InitError> {
    let mut cfg = Config::new();
    cfg.host = Some(db.host.clone());
    cfg.port = Some(db.port);
    cfg.dbname = Some(db.name.clone());
    cfg.user = Some(db.user.clone());
    cfg.password = Some(db.password.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(db.max_pool_size));

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| InitError::Pool {
            database: db.name.clone(),
            message:  e.to_string()
        })
}

/// Name -> pool map with the database-selection rules of the tool surface.
#[derive(Debug)]
pub struct PoolRegistry {
    pools: HashMap<String, Pool>
}

impl PoolRegistry {
    pub fn new(databases: &[DatabaseConfig]) -> Result<Self, InitError> {
        let mut pools = HashMap::with_capacity(databases.len());
        for db in databases {
            let pool = create_pool(db)?;
            tracing::info!(
                database = %db.name,
                host = %db.host,
                max_size = db.max_pool_size,
                "created connection pool"
            );
            pools.insert(db.name.clone(), pool);
        }
        Ok(Self {
            pools
        })
    }

    /// Resolve the target database for a request.
    ///
    /// A named database must exist. An unnamed request resolves to the sole
    /// configured database, or fails with `DATABASE_REQUIRED` when several
    /// are available.
    pub fn resolve(&self, database: Option<&str>) -> Result<(&str, &Pool), QueryError> {
        match database {
            Some(name) => self
                .pools
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| QueryError::NoSuchDatabase {
                    name: name.to_string()
                }),
            None if self.pools.len() == 1 => {
                let (name, pool) = self.pools.iter().next().expect("len checked");
                Ok((name.as_str(), pool))
            }
            None => Err(QueryError::DatabaseRequired)
        }
    }

    pub fn get(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Pool)> {
        self.pools.iter()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Close every pool, waiting up to `grace` for borrowed connections.
    pub async fn close_all(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        for (name, pool) in &self.pools {
            while pool.status().size > pool.status().available
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            pool.close();
            tracing::info!(database = %name, "connection pool closed");
        }
    }
}
