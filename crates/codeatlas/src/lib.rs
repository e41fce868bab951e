pub mod driver;

pub use driver::{
    analyze_repository, default_analyzers, run_generation, RunSummary, CLUSTER_TIMEOUT_SECS,
    STAGE1_TIMEOUT_SECS,
};
