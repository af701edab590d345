//! # pg-nlq
//!
//! Natural-language query service for PostgreSQL.
//!
//! `pg-nlq` exposes one tool to an agent host over a line-delimited JSON
//! channel: translate a question into a read-only SQL query, execute it
//! under hard resource bounds, and return verified results. The value is in
//! the orchestration core between the host protocol and the language model:
//!
//! 1. **Schema cache** - materializes database catalogs into a compact,
//!    prompt-friendly digest and keeps it fresh.
//! 2. **SQL generator** - prompts the model with the schema subset relevant
//!    to the question, plus the failure history of earlier attempts.
//! 3. **SQL validator** - parses the candidate into an AST and enforces a
//!    read-only, allow-listed dialect with table/column/function deny lists.
//! 4. **SQL executor** - runs the statement in a pooled, read-only,
//!    time- and row-bounded transaction.
//! 5. **Result validator** - optionally scores the rows against the
//!    question and triggers regeneration when confidence is low.
//! 6. **Resilience** - per-scope rate limiting, a circuit breaker on the
//!    LLM dependency, and bounded retries per error class.
//!
//! # Quick Start
//!
//! ```bash
//! export DATABASE_NAME=app DATABASE_USER=readonly DATABASE_PASSWORD=...
//! export OPENAI_API_KEY=sk-...
//! pg-nlq serve
//!
//! # then, one JSON object per line on stdin:
//! # {"question": "How many users are there?", "return_type": "sql"}
//! ```
//!
//! # Protocol
//!
//! Each input line is a request `{question, database?, return_type?}`; each
//! output line is a response `{success, generated_sql?, data?, error?,
//! confidence, tokens_used}`. All failures are reported in-band with a
//! stable `error.code`; the process only exits non-zero on initialization
//! failure.
//!
//! # Exit Codes
//!
//! - `0` - clean shutdown (EOF or interrupt)
//! - `1` - initialization failure
//!
//! Logs go to stderr; stdout carries only protocol responses.

use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pg_nlq::{
    cli::{Cli, Commands},
    config::Settings,
    server::Server
};

#[tokio::main]
async fn main() {
    match run().await {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            metrics_port,
            log_level
        } => {
            let mut settings = Settings::load(config.as_deref())?;
            if let Some(port) = metrics_port {
                settings.observability.metrics_enabled = true;
                settings.observability.metrics_port = port;
            }
            if let Some(level) = log_level {
                settings.observability.log_level = level;
            }

            init_tracing(
                &settings.observability.log_level,
                &settings.observability.log_format
            );

            let server = Server::init(settings.clone()).await?;
            if settings.observability.metrics_enabled {
                server
                    .start_metrics_server(settings.observability.metrics_port)
                    .await?;
            }

            let result = server.run_stdio().await;
            server.shutdown().await;
            result?;
            Ok(())
        }
    }
}

/// Stdout carries the protocol; all diagnostics go to stderr.
fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
