//! Service metrics and Prometheus exposition.
//!
//! Each labeled series is an `AtomicU64` cell (durations a sum/count pair
//! of them); increments on the hot path are plain atomic adds, and the map
//! lock is taken for writing only when a label is seen for the first time.
//! Durations are exposed as `_sum` / `_count` pairs. Gauges (schema cache
//! age, limiter occupancy, breaker state) are computed at scrape time from
//! live component state, so the collector itself stays a plain bag of
//! monotonic values.

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering}
    },
    time::Duration
};

/// Counter family keyed by a label value.
#[derive(Debug, Default)]
struct LabeledCounter {
    values: RwLock<HashMap<String, AtomicU64>>
}

impl LabeledCounter {
    fn add(&self, label: &str, delta: u64) {
        {
            let values = self.values.read().expect("metrics lock poisoned");
            if let Some(cell) = values.get(label) {
                cell.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut values = self.values.write().expect("metrics lock poisoned");
        values
            .entry(label.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Vec<(String, u64)> {
        let values = self.values.read().expect("metrics lock poisoned");
        let mut out: Vec<_> = values
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        out.sort();
        out
    }
}

/// Per-label duration accumulator: microsecond sum plus sample count.
#[derive(Debug, Default)]
struct DurationCell {
    sum_us: AtomicU64,
    count:  AtomicU64
}

impl DurationCell {
    fn record(&self, duration: Duration) {
        self.sum_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Duration family keyed by a label value.
#[derive(Debug, Default)]
struct LabeledDuration {
    values: RwLock<HashMap<String, DurationCell>>
}

impl LabeledDuration {
    fn record(&self, label: &str, duration: Duration) {
        {
            let values = self.values.read().expect("metrics lock poisoned");
            if let Some(cell) = values.get(label) {
                cell.record(duration);
                return;
            }
        }
        let mut values = self.values.write().expect("metrics lock poisoned");
        values
            .entry(label.to_string())
            .or_insert_with(DurationCell::default)
            .record(duration);
    }

    fn snapshot(&self) -> Vec<(String, u64, u64)> {
        let values = self.values.read().expect("metrics lock poisoned");
        let mut out: Vec<_> = values
            .iter()
            .map(|(k, cell)| {
                (
                    k.clone(),
                    cell.sum_us.load(Ordering::Relaxed),
                    cell.count.load(Ordering::Relaxed)
                )
            })
            .collect();
        out.sort();
        out
    }
}

/// Central metrics collector shared by every component.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    /// `{status}:{database}` -> request count.
    query_requests:   LabeledCounter,
    /// LLM call count per purpose (`generate`, `score`).
    llm_calls:        LabeledCounter,
    /// LLM token totals per purpose.
    llm_tokens:       LabeledCounter,
    /// Validator rejections per reason.
    sql_rejected:     LabeledCounter,
    llm_latency:      LabeledDuration,
    db_duration:      LabeledDuration,
    request_duration: LabeledDuration
}

/// Live gauge values sampled at scrape time.
#[derive(Debug, Default)]
pub struct GaugeSnapshot {
    /// `(database, seconds since load)`.
    pub schema_cache_age: Vec<(String, u64)>,
    /// `(scope, active slots)`.
    pub rate_limiter_active: Vec<(&'static str, usize)>,
    /// `(dependency, encoded state)`; 0 = closed, 1 = half-open, 2 = open.
    pub circuit_breaker_state: Vec<(&'static str, u64)>
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, status: &str, database: &str, duration: Duration) {
        self.query_requests
            .add(&format!("{}:{}", status, database), 1);
        self.request_duration.record(status, duration);
    }

    pub fn record_llm_call(&self, purpose: &str, latency: Duration) {
        self.llm_calls.add(purpose, 1);
        self.llm_latency.record(purpose, latency);
    }

    pub fn record_llm_tokens(&self, purpose: &str, tokens: u64) {
        self.llm_tokens.add(purpose, tokens);
    }

    pub fn record_sql_rejected(&self, reason: &str) {
        self.sql_rejected.add(reason, 1);
    }

    pub fn record_db_duration(&self, duration: Duration) {
        self.db_duration.record("all", duration);
    }

    /// Render everything in the Prometheus text exposition format.
    pub fn render(&self, gauges: &GaugeSnapshot) -> String {
        let mut out = String::with_capacity(2048);

        out.push_str("# HELP pg_nlq_query_requests_total Total query requests\n");
        out.push_str("# TYPE pg_nlq_query_requests_total counter\n");
        for (label, value) in self.query_requests.snapshot() {
            let (status, database) = label.split_once(':').unwrap_or((label.as_str(), ""));
            out.push_str(&format!(
                "pg_nlq_query_requests_total{{status=\"{}\",database=\"{}\"}} {}\n",
                status, database, value
            ));
        }

        out.push_str("# HELP pg_nlq_llm_calls_total Total LLM calls\n");
        out.push_str("# TYPE pg_nlq_llm_calls_total counter\n");
        for (purpose, value) in self.llm_calls.snapshot() {
            out.push_str(&format!(
                "pg_nlq_llm_calls_total{{purpose=\"{}\"}} {}\n",
                purpose, value
            ));
        }

        out.push_str("# HELP pg_nlq_llm_tokens_total Total LLM tokens consumed\n");
        out.push_str("# TYPE pg_nlq_llm_tokens_total counter\n");
        for (purpose, value) in self.llm_tokens.snapshot() {
            out.push_str(&format!(
                "pg_nlq_llm_tokens_total{{purpose=\"{}\"}} {}\n",
                purpose, value
            ));
        }

        out.push_str("# HELP pg_nlq_sql_rejected_total Statements rejected by the validator\n");
        out.push_str("# TYPE pg_nlq_sql_rejected_total counter\n");
        for (reason, value) in self.sql_rejected.snapshot() {
            out.push_str(&format!(
                "pg_nlq_sql_rejected_total{{reason=\"{}\"}} {}\n",
                reason, value
            ));
        }

        render_duration(
            &mut out,
            "pg_nlq_llm_latency_seconds",
            "LLM call latency",
            "purpose",
            &self.llm_latency
        );
        render_duration(
            &mut out,
            "pg_nlq_db_query_duration_seconds",
            "Database execution time",
            "scope",
            &self.db_duration
        );
        render_duration(
            &mut out,
            "pg_nlq_request_duration_seconds",
            "End-to-end request time",
            "outcome",
            &self.request_duration
        );

        out.push_str("# HELP pg_nlq_schema_cache_age_seconds Age of the cached schema summary\n");
        out.push_str("# TYPE pg_nlq_schema_cache_age_seconds gauge\n");
        for (database, age) in &gauges.schema_cache_age {
            out.push_str(&format!(
                "pg_nlq_schema_cache_age_seconds{{database=\"{}\"}} {}\n",
                database, age
            ));
        }

        out.push_str("# HELP pg_nlq_rate_limiter_active Active admissions per scope\n");
        out.push_str("# TYPE pg_nlq_rate_limiter_active gauge\n");
        for (scope, active) in &gauges.rate_limiter_active {
            out.push_str(&format!(
                "pg_nlq_rate_limiter_active{{scope=\"{}\"}} {}\n",
                scope, active
            ));
        }

        out.push_str(
            "# HELP pg_nlq_circuit_breaker_state Breaker state (0=closed, 1=half, 2=open)\n"
        );
        out.push_str("# TYPE pg_nlq_circuit_breaker_state gauge\n");
        for (dependency, state) in &gauges.circuit_breaker_state {
            out.push_str(&format!(
                "pg_nlq_circuit_breaker_state{{dependency=\"{}\"}} {}\n",
                dependency, state
            ));
        }

        out
    }
}

fn render_duration(
    out: &mut String,
    name: &str,
    help: &str,
    label_key: &str,
    family: &LabeledDuration
) {
    out.push_str(&format!("# HELP {} {}\n", name, help));
    out.push_str(&format!("# TYPE {} summary\n", name));
    for (label, sum_us, count) in family.snapshot() {
        out.push_str(&format!(
            "{}_sum{{{}=\"{}\"}} {:.6}\n",
            name,
            label_key,
            label,
            sum_us as f64 / 1_000_000.0
        ));
        out.push_str(&format!(
            "{}_count{{{}=\"{}\"}} {}\n",
            name, label_key, label, count
        ));
    }
}
