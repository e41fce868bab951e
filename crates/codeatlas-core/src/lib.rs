pub mod analyzer;
pub mod config;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod tree;
pub mod types;

pub use analyzer::{LanguageAnalyzer, ParsedFile};
pub use config::Config;
pub use error::CoreError;
pub use graph::{extract_leaves, DependencyArtifact, DependencyGraph};
pub use pipeline::{sanitized_repo_name, save_artifact, AnalysisPipeline, RepoAnalysis};
pub use tree::{Module, ModuleTree};
pub use types::*;
