pub mod config;
pub mod validate;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Stage-driven virtual-user load testing for HTTP targets", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load test scenario
    Run {
        /// Path to the scenario file (YAML/JSON)
        scenario: PathBuf,

        /// Print the final summary as JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Export final summary to a JSON file
        #[arg(long)]
        export_json: Option<PathBuf>,
    },
    /// Validate a scenario without running it
    Validate {
        /// Path to the scenario file (YAML/JSON)
        scenario: PathBuf,
    },
    /// Print the JSON Schema of the scenario file
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
