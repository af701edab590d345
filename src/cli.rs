use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// pg-nlq - natural-language queries against PostgreSQL
#[derive(Parser, Debug)]
#[command(name = "pg-nlq")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the query tool over stdin/stdout
    Serve {
        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the metrics port (implies metrics enabled)
        #[arg(long)]
        metrics_port: Option<u16>,

        /// Override the configured log level
        #[arg(long, env = "PG_NLQ_LOG_LEVEL")]
        log_level: Option<String>
    }
}
