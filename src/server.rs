//! Server assembly and the host-facing tool surface.
//!
//! [`Server::init`] builds the whole pipeline as one explicit value - pools,
//! schema cache, generator, validator, executor, scorer, resilience and
//! metrics - so nothing lives in module-level state and tests can construct
//! hermetic instances. The host surface is a single `query` operation served
//! over newline-delimited JSON on stdin/stdout: one request object per input
//! line, one response object per output line.
//!
//! Shutdown order: stop the schema refresher (bounded wait), then drain the
//! pools with a five-second grace window.

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::Instrument;

use crate::{
    cache::SchemaCache,
    config::Settings,
    error::{ErrorCode, InitError},
    executor::SqlExecutor,
    generator::SqlGenerator,
    llm::{ChatModel, OpenAiClient},
    metrics::{GaugeSnapshot, MetricsCollector},
    orchestrator::QueryOrchestrator,
    pool::PoolRegistry,
    resilience::{CircuitBreaker, MultiRateLimiter},
    scorer::ResultValidator,
    trace::request_context,
    types::{QueryRequest, QueryResponse, ReturnType},
    validator::SqlValidator
};

/// Grace window for draining pools at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Fully initialized service.
pub struct Server {
    pools:        Arc<PoolRegistry>,
    cache:        Arc<SchemaCache>,
    orchestrator: QueryOrchestrator,
    metrics:      Arc<MetricsCollector>
}

impl Server {
    /// Build every component from validated settings.
    ///
    /// No schema is loaded here: the first request per database pays the
    /// lazy load, keeping startup fast. The auto-refresher (when caching is
    /// enabled) warms all databases on its first tick.
    pub async fn init(settings: Settings) -> Result<Self, InitError> {
        let model: Arc<dyn ChatModel> = Arc::new(OpenAiClient::new(settings.openai.clone()));
        Self::init_with_model(settings, model).await
    }

    /// Like [`Server::init`] but with an injected language model.
    pub async fn init_with_model(
        settings: Settings,
        model: Arc<dyn ChatModel>
    ) -> Result<Self, InitError> {
        let pools = Arc::new(PoolRegistry::new(&settings.databases)?);
        let cache = Arc::new(SchemaCache::new(
            settings.cache.clone(),
            settings.security.clone()
        ));
        let metrics = Arc::new(MetricsCollector::new());

        let generator = SqlGenerator::new(Arc::clone(&model));
        let validator = SqlValidator::new(&settings.security);
        let executor = SqlExecutor::new(settings.security.clone());
        let scorer = ResultValidator::new(Arc::clone(&model), settings.validation.clone());

        let breaker = CircuitBreaker::new(
            settings.resilience.circuit_breaker_threshold,
            Duration::from_secs(settings.resilience.circuit_breaker_timeout)
        );
        let limiter = MultiRateLimiter::new(
            settings.resilience.query_limit,
            settings.resilience.llm_limit
        );

        let budget = Duration::from_secs(
            settings.security.max_execution_time * (settings.resilience.max_retries as u64 + 2)
        );
        let orchestrator = QueryOrchestrator::new(
            generator,
            validator,
            executor,
            scorer,
            Arc::clone(&cache),
            Arc::clone(&pools),
            limiter,
            breaker,
            Arc::clone(&metrics),
            settings.resilience.clone(),
            budget
        );

        if settings.cache.enabled {
            let pool_list: Vec<_> = pools
                .iter()
                .map(|(name, pool)| (name.clone(), pool.clone()))
                .collect();
            cache.start_auto_refresh(
                Duration::from_secs(settings.cache.schema_ttl),
                pool_list
            );
        }

        tracing::info!(
            databases = ?pools.names(),
            cache_enabled = settings.cache.enabled,
            "server initialized"
        );

        Ok(Self {
            pools,
            cache,
            orchestrator,
            metrics
        })
    }

    /// The single tool operation exposed to the host.
    pub async fn query(
        &self,
        question: String,
        database: Option<String>,
        return_type: &str
    ) -> QueryResponse {
        let return_type = match return_type {
            "sql" => ReturnType::Sql,
            "result" => ReturnType::Result,
            other => {
                return QueryResponse::failure_with_code(
                    ErrorCode::InvalidParameter,
                    format!(
                        "Invalid return_type: '{}'. Must be 'sql' or 'result'.",
                        other
                    )
                );
            }
        };

        let guard = request_context();
        let request = QueryRequest {
            question,
            database,
            return_type
        };
        let response = self
            .orchestrator
            .execute_query(request)
            .instrument(guard.span().clone())
            .await;
        tracing::info!(
            request_id = %guard.id(),
            success = response.success,
            confidence = response.confidence,
            tokens_used = response.tokens_used,
            "request completed"
        );
        response
    }

    /// Serve the line-delimited JSON channel until EOF or interrupt.
    pub async fn run_stdio(&self) -> std::io::Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut lines = stdin.lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, shutting down");
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = self.dispatch_line(&line).await;
            let mut encoded =
                serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
            encoded.push(b'\n');
            stdout.write_all(&encoded).await?;
            stdout.flush().await?;
        }
        Ok(())
    }

    async fn dispatch_line(&self, line: &str) -> QueryResponse {
        #[derive(Deserialize)]
        struct RawRequest {
            question:    Option<String>,
            #[serde(default)]
            database:    Option<String>,
            #[serde(default)]
            return_type: Option<String>
        }

        let raw: RawRequest = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                return QueryResponse::failure_with_code(
                    ErrorCode::InvalidRequest,
                    format!("Invalid request parameters: {}", e)
                );
            }
        };
        let Some(question) = raw.question else {
            return QueryResponse::failure_with_code(
                ErrorCode::InvalidRequest,
                "Missing required field 'question'"
            );
        };
        let return_type = raw.return_type.unwrap_or_else(|| String::from("result"));
        self.query(question, raw.database, &return_type).await
    }

    /// Bind and spawn the `/metrics` endpoint.
    pub async fn start_metrics_server(&self, port: u16) -> Result<(), InitError> {
        let metrics = Arc::clone(&self.metrics);
        let cache = Arc::clone(&self.cache);
        let limiter = self.orchestrator.limiter().clone();
        let breaker = self.orchestrator.breaker().clone();

        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let metrics = Arc::clone(&metrics);
                let cache = Arc::clone(&cache);
                let limiter = limiter.clone();
                let breaker = breaker.clone();
                async move {
                    let gauges = GaugeSnapshot {
                        schema_cache_age:      cache.ages(),
                        rate_limiter_active:   vec![
                            ("query", limiter.query.active()),
                            ("llm", limiter.llm.active()),
                        ],
                        circuit_breaker_state: vec![("llm", breaker.state().as_gauge())]
                    };
                    metrics.render(&gauges)
                }
            })
        );

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| InitError::Metrics {
                port,
                message: e.to_string()
            })?;
        tracing::info!(port, "metrics server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "metrics server failed");
            }
        });
        Ok(())
    }

    /// Stop background work and drain pools.
    pub async fn shutdown(&self) {
        self.cache.stop_auto_refresh().await;
        self.pools.close_all(SHUTDOWN_GRACE).await;
        tracing::info!("shutdown complete");
    }
}
