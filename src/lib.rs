pub mod cli;
pub mod engine;
pub mod stats;
pub mod utils;

pub use engine::{Engine, RunSummary};
pub use utils::parse_duration_str;
