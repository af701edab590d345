//! Request orchestration: the pipeline state machine.
//!
//! One request flows `ADMIT -> SELECT_DB -> LOAD_SCHEMA -> GENERATE ->
//! VALIDATE -> (EXECUTE -> SCORE)? -> RETURN`, with a bounded retry loop
//! from validation/execution/scoring failures back to generation. Lower
//! layers raise typed errors; this is the only component that decides
//! retry-or-surface and the only one that builds a [`QueryResponse`].
//! `execute_query` never returns an error: every failure mode becomes a
//! populated `error` field with `success = false`.

use std::{
    sync::Arc,
    time::{Duration, Instant}
};

use crate::{
    cache::SchemaCache,
    config::ResilienceConfig,
    error::QueryError,
    executor::SqlExecutor,
    generator::{AttemptFailure, SqlGenerator},
    metrics::MetricsCollector,
    pool::PoolRegistry,
    resilience::{CircuitBreaker, MultiRateLimiter},
    scorer::ResultValidator,
    types::{QueryRequest, QueryResponse, ReturnType},
    validator::SqlValidator
};

/// Sequences the full pipeline for each request.
pub struct QueryOrchestrator {
    generator:  SqlGenerator,
    validator:  SqlValidator,
    executor:   SqlExecutor,
    scorer:     ResultValidator,
    cache:      Arc<SchemaCache>,
    pools:      Arc<PoolRegistry>,
    limiter:    MultiRateLimiter,
    breaker:    CircuitBreaker,
    metrics:    Arc<MetricsCollector>,
    resilience: ResilienceConfig,
    /// Wall-clock ceiling for one whole request including retries.
    budget:     Duration
}

impl QueryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generator: SqlGenerator,
        validator: SqlValidator,
        executor: SqlExecutor,
        scorer: ResultValidator,
        cache: Arc<SchemaCache>,
        pools: Arc<PoolRegistry>,
        limiter: MultiRateLimiter,
        breaker: CircuitBreaker,
        metrics: Arc<MetricsCollector>,
        resilience: ResilienceConfig,
        budget: Duration
    ) -> Self {
        Self {
            generator,
            validator,
            executor,
            scorer,
            cache,
            pools,
            limiter,
            breaker,
            metrics,
            resilience,
            budget
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &MultiRateLimiter {
        &self.limiter
    }

    /// Run one request to completion. Never raises.
    pub async fn execute_query(&self, request: QueryRequest) -> QueryResponse {
        let started = Instant::now();
        let database_label = request.database.clone().unwrap_or_default();
        let response = self.run(request).await;

        let status = if response.success { "success" } else { "error" };
        self.metrics
            .record_request(status, &database_label, started.elapsed());
        response
    }

    async fn run(&self, request: QueryRequest) -> QueryResponse {
        if request.question.trim().is_empty() {
            let err = QueryError::InvalidParameter {
                message: String::from("question must not be empty"),
                details: None
            };
            return QueryResponse::failure(&err, None, 0);
        }

        // ADMIT
        let _permit = match self.limiter.query.acquire() {
            Ok(permit) => permit,
            Err(err) => return QueryResponse::failure(&err, None, 0)
        };

        // SELECT_DB
        let (database, pool) = match self.pools.resolve(request.database.as_deref()) {
            Ok(resolved) => resolved,
            Err(err) => return QueryResponse::failure(&err, None, 0)
        };

        // LOAD_SCHEMA - cache errors are fatal for the request.
        let schema = match self.cache.get(database, pool).await {
            Ok(schema) => schema,
            Err(err) => {
                tracing::error!(database = %database, error = %err, "schema load failed");
                return QueryResponse::failure(&err, None, 0);
            }
        };

        let deadline = Instant::now() + self.budget;
        let mut history: Vec<AttemptFailure> = Vec::new();
        let mut tokens_used: u64 = 0;
        let mut last_sql: Option<String> = None;
        let mut last_error = QueryError::Timeout {
            seconds: self.budget.as_secs()
        };

        for attempt in 0..=self.resilience.max_retries {
            if Instant::now() >= deadline {
                tracing::warn!(attempt, "request budget exhausted");
                break;
            }
            let retries_remain = attempt < self.resilience.max_retries;

            // GENERATE
            let generated = match self
                .call_llm("generate", || {
                    self.generator.generate(&request.question, &schema, &history)
                })
                .await
            {
                Ok(generated) => generated,
                Err(err @ QueryError::UpstreamUnavailable)
                | Err(err @ QueryError::RateLimited { .. }) => {
                    return QueryResponse::failure(&err, last_sql, tokens_used);
                }
                Err(err) => {
                    last_error = err;
                    if retries_remain {
                        continue;
                    }
                    break;
                }
            };
            tokens_used += generated.tokens_used;
            self.metrics
                .record_llm_tokens("generate", generated.tokens_used);
            let sql = generated.sql.clone();
            last_sql = Some(sql.clone());

            // VALIDATE
            if let Err(err) = self.validator.validate(&sql) {
                self.metrics.record_sql_rejected(err.code().as_str());
                tracing::warn!(error = %err, "generated SQL rejected");
                last_error = err;
                if retries_remain
                    && self.resilience.retry_on_security
                    && last_error.is_retryable_policy()
                {
                    history.push(AttemptFailure {
                        previous_sql:   sql,
                        failure_reason: last_error.to_string()
                    });
                    continue;
                }
                break;
            }

            if request.return_type == ReturnType::Sql {
                return QueryResponse::success(sql, None, generated.confidence, tokens_used);
            }

            // EXECUTE
            let result = match self.executor.execute(&sql, pool).await {
                Ok(result) => result,
                Err(err) => {
                    last_error = err;
                    if retries_remain && last_error.is_retryable_database() {
                        history.push(AttemptFailure {
                            previous_sql:   sql,
                            failure_reason: last_error.to_string()
                        });
                        continue;
                    }
                    break;
                }
            };
            self.metrics
                .record_db_duration(Duration::from_millis(result.duration_ms));

            // SCORE
            let mut confidence = generated.confidence;
            if self.scorer.enabled() {
                match self
                    .call_llm("score", || {
                        self.scorer.score(&request.question, &sql, &result.data.rows)
                    })
                    .await
                {
                    Ok(score) => {
                        tokens_used += score.tokens_used;
                        self.metrics.record_llm_tokens("score", score.tokens_used);
                        confidence = score.confidence;
                        if confidence < self.scorer.min_confidence() {
                            tracing::warn!(
                                confidence,
                                threshold = self.scorer.min_confidence(),
                                "result confidence below threshold"
                            );
                            if retries_remain {
                                let reason = score.rationale.unwrap_or_else(|| {
                                    String::from("result did not answer the question")
                                });
                                history.push(AttemptFailure {
                                    previous_sql:   sql,
                                    failure_reason: format!(
                                        "result scored {} (below {}): {}",
                                        confidence,
                                        self.scorer.min_confidence(),
                                        reason
                                    )
                                });
                                continue;
                            }
                            // No retries left: return the rows with the low
                            // score attached rather than discarding them.
                        }
                    }
                    Err(err) => {
                        // A result in hand beats a scoring failure; keep the
                        // generation confidence and move on.
                        tracing::warn!(error = %err, "result scoring unavailable");
                    }
                }
            }

            return QueryResponse::success(sql, Some(result.data), confidence, tokens_used);
        }

        QueryResponse::failure(&last_error, last_sql, tokens_used)
    }

    /// Run one LLM-backed call under the `llm` limiter scope and the
    /// breaker. An open breaker short-circuits without an outbound call.
    async fn call_llm<T, F, Fut>(&self, purpose: &str, call: F) -> Result<T, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>
    {
        if !self.breaker.allow_request() {
            tracing::warn!(purpose, "circuit breaker open, skipping LLM call");
            return Err(QueryError::UpstreamUnavailable);
        }
        let _permit = self.limiter.llm.acquire()?;

        let started = Instant::now();
        let result = call().await;
        let latency = started.elapsed();

        self.metrics.record_llm_call(purpose, latency);
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(err) if err.feeds_breaker() => self.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }
}
