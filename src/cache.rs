//! Schema cache with coalesced lazy loading and background refresh.
//!
//! Summaries are shared-immutable [`Arc`] snapshots swapped under a lock;
//! readers keep whatever snapshot they resolved for the duration of one
//! request. A cold lookup triggers exactly one catalog load per database,
//! with concurrent callers awaiting the in-flight load rather than piling
//! on. The optional refresher re-loads every database on an interval; a
//! refresh that produces an unchanged content hash only bumps the entry's
//! freshness stamp, leaving the shared snapshot untouched.
//!
//! Failure semantics: a load failure surfaces to the caller as a typed
//! error; a refresh failure is logged and retried on the next tick while
//! the stale summary stays readable.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant}
};

use deadpool_postgres::Pool;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::{CacheConfig, SecurityConfig},
    error::QueryError,
    schema::{SchemaSummary, load_schema}
};

/// How long `stop_auto_refresh` waits before abandoning the task.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
struct CacheEntry {
    summary:      Arc<SchemaSummary>,
    refreshed_at: Instant
}

struct Refresher {
    shutdown: watch::Sender<bool>,
    handle:   JoinHandle<()>
}

/// Per-database schema summary cache.
pub struct SchemaCache {
    config:    CacheConfig,
    security:  SecurityConfig,
    entries:   RwLock<HashMap<String, CacheEntry>>,
    /// Per-database load-coalescing gates. This is the one lock in the
    /// service that is intentionally held across an await.
    gates:     tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    refresher: Mutex<Option<Refresher>>
}

impl SchemaCache {
    pub fn new(config: CacheConfig, security: SecurityConfig) -> Self {
        Self {
            config,
            security,
            entries: RwLock::new(HashMap::new()),
            gates: tokio::sync::Mutex::new(HashMap::new()),
            refresher: Mutex::new(None)
        }
    }

    /// Resolve the summary for `database`, loading it on a cold miss.
    ///
    /// With caching disabled every call loads fresh.
    pub async fn get(
        &self,
        database: &str,
        pool: &Pool
    ) -> Result<Arc<SchemaSummary>, QueryError> {
        if !self.config.enabled {
            let summary = load_schema(database, pool, &self.security).await?;
            return Ok(Arc::new(summary));
        }

        if let Some(summary) = self.lookup(database) {
            return Ok(summary);
        }

        let gate = {
            let mut gates = self.gates.lock().await;
            Arc::clone(
                gates
                    .entry(database.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            )
        };
        let _guard = gate.lock().await;

        // A concurrent caller may have finished the load while we waited.
        if let Some(summary) = self.lookup(database) {
            return Ok(summary);
        }
        self.load(database, pool).await
    }

    /// Unconditional reload from the live catalog.
    pub async fn load(
        &self,
        database: &str,
        pool: &Pool
    ) -> Result<Arc<SchemaSummary>, QueryError> {
        let summary = Arc::new(load_schema(database, pool, &self.security).await?);
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(
            database.to_string(),
            CacheEntry {
                summary:      Arc::clone(&summary),
                refreshed_at: Instant::now()
            }
        );
        Ok(summary)
    }

    /// Install a pre-built summary, bypassing the catalog load.
    pub fn put(&self, summary: SchemaSummary) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(
            summary.database.clone(),
            CacheEntry {
                summary:      Arc::new(summary),
                refreshed_at: Instant::now()
            }
        );
    }

    fn lookup(&self, database: &str) -> Option<Arc<SchemaSummary>> {
        let entries = self.entries.read().expect("cache lock poisoned");
        entries.get(database).map(|e| Arc::clone(&e.summary))
    }

    /// Seconds since each cached summary was last loaded or confirmed.
    pub fn ages(&self) -> Vec<(String, u64)> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let mut ages: Vec<_> = entries
            .iter()
            .map(|(name, e)| (name.clone(), e.refreshed_at.elapsed().as_secs()))
            .collect();
        ages.sort();
        ages
    }

    /// Start the background refresher over the given databases.
    ///
    /// A second call while one is running is a no-op.
    pub fn start_auto_refresh(
        self: &Arc<Self>,
        interval: Duration,
        pools: Vec<(String, Pool)>
    ) {
        let mut slot = self.refresher.lock().expect("refresher lock poisoned");
        if slot.is_some() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately and warms every database.
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for (name, pool) in &pools {
                            cache.refresh_one(name, pool).await;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("schema refresher stopping");
                        return;
                    }
                }
            }
        });
        *slot = Some(Refresher {
            shutdown,
            handle
        });
        tracing::info!(interval_secs = interval.as_secs(), "schema auto-refresh started");
    }

    async fn refresh_one(&self, database: &str, pool: &Pool) {
        let previous_hash = self.lookup(database).map(|s| s.content_hash);
        match load_schema(database, pool, &self.security).await {
            Ok(summary) => {
                let mut entries = self.entries.write().expect("cache lock poisoned");
                match entries.get_mut(database) {
                    Some(entry) if previous_hash == Some(summary.content_hash) => {
                        // Unchanged: readers keep their snapshot.
                        entry.refreshed_at = Instant::now();
                    }
                    _ => {
                        entries.insert(
                            database.to_string(),
                            CacheEntry {
                                summary:      Arc::new(summary),
                                refreshed_at: Instant::now()
                            }
                        );
                        tracing::info!(database = %database, "schema summary refreshed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(database = %database, error = %e, "schema refresh failed");
            }
        }
    }

    /// Stop the refresher, waiting at most [`STOP_TIMEOUT`] for it to exit.
    pub async fn stop_auto_refresh(&self) {
        let refresher = {
            let mut slot = self.refresher.lock().expect("refresher lock poisoned");
            slot.take()
        };
        let Some(Refresher {
            shutdown,
            mut handle
        }) = refresher
        else {
            return;
        };
        let _ = shutdown.send(true);
        if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            tracing::warn!("schema refresher did not stop in time; aborting");
            handle.abort();
        }
    }
}
