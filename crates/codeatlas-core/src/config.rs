use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Token budget a module may occupy before the clusterer splits it further.
pub const MAX_TOKEN_PER_MODULE: usize = 32_768;
/// Token budget below which a delegated sub-module is documented by a leaf agent.
pub const MAX_TOKEN_PER_LEAF_MODULE: usize = 16_000;
/// Frontiers smaller than this are never clustered further.
pub const MIN_COMPONENTS_FOR_CLUSTERING: usize = 3;
/// Hard cap on the clustering prompt; the component listing is truncated to fit.
pub const MAX_CLUSTERING_PROMPT_TOKENS: usize = 100_000;
/// Safety margin under the 128k context window for agent prompts.
pub const MAX_LLM_CONTEXT: usize = 100_000;
/// Output cap used for truncation detection on clustering responses.
pub const MAX_LLM_OUTPUT_TOKENS: usize = 16_384;
/// Above this many total components the tiered module-tree view is used.
pub const LARGE_REPO_COMPONENT_THRESHOLD: usize = 500;
/// Target size of token-budget chunks produced by auto-split.
pub const TARGET_TOKENS_PER_CHUNK: usize = 80_000;
/// Auto-split recursion floor; past this depth oversized prompts proceed anyway.
pub const MAX_AUTO_SPLIT_DEPTH: usize = 5;
/// Delegation is forced until the tree is at least this deep.
pub const MIN_DEPTH: usize = 2;

pub const FIRST_MODULE_TREE_FILENAME: &str = "first_module_tree.json";
pub const MODULE_TREE_FILENAME: &str = "module_tree.json";
pub const OVERVIEW_FILENAME: &str = "overview.md";
pub const METADATA_FILENAME: &str = "metadata.json";

pub const CONFIG_FILENAME: &str = "codeatlas.toml";

/// Runtime configuration, loadable from `codeatlas.toml` and overridable
/// from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub repo_path: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_main_model")]
    pub main_model: String,
    #[serde(default = "default_cluster_model")]
    pub cluster_model: String,
    #[serde(default = "default_cluster_model")]
    pub fallback_model: String,
    #[serde(default = "default_base_url")]
    pub llm_base_url: String,
    /// Never serialized back out; provided via file, flag or environment.
    #[serde(default, skip_serializing)]
    pub llm_api_key: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_main_model() -> String {
    "gpt-4o".to_string()
}

fn default_cluster_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_max_depth() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            output_dir: PathBuf::from("atlas-docs"),
            main_model: default_main_model(),
            cluster_model: default_cluster_model(),
            fallback_model: default_cluster_model(),
            llm_base_url: default_base_url(),
            llm_api_key: String::new(),
            max_depth: default_max_depth(),
        }
    }
}

impl Config {
    /// Load configuration from a `codeatlas.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `codeatlas.toml` in the given directory, or return defaults.
    pub fn load_or_default(dir: &Path) -> Self {
        let config_path = dir.join(CONFIG_FILENAME);
        if config_path.exists() {
            Self::load(&config_path).unwrap_or_default()
        } else {
            Self::default()
        }
    }

    /// Generate default TOML content for `codeatlas init`.
    pub fn default_toml() -> String {
        r#"# codeatlas configuration
# Models and endpoint used for documentation generation.

repo_path = "."
output_dir = "atlas-docs"

# Model used by the per-module documentation agents.
main_model = "gpt-4o"
# Cheaper model used for module clustering.
cluster_model = "gpt-4o-mini"
# Model tried when the main model fails.
fallback_model = "gpt-4o-mini"

# Any OpenAI-compatible chat-completion endpoint. Models whose name contains
# "gemini" are routed to the native Gemini API instead.
llm_base_url = "https://api.openai.com/v1"
llm_api_key = ""

# Maximum module tree depth reachable through agent delegation.
max_depth = 10
"#
        .to_string()
    }
}
