use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pgfan")]
#[command(about = "Stream PostgreSQL logical replication into fan-out pipelines")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the configured pipelines continuously
    Pipeline {
        /// Path to the YAML configuration file
        #[arg(long)]
        config: PathBuf,
    },

    /// One-shot demo: stream decoded events to stdout until interrupted
    Stream {
        /// Path to the YAML configuration file
        #[arg(long)]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }
}
