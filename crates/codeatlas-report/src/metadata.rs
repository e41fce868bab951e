use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use codeatlas_core::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationInfo {
    pub timestamp: String,
    pub main_model: String,
    pub repo_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub total_components: usize,
    pub leaf_nodes: usize,
    pub max_depth: usize,
}

/// `metadata.json`, written at the end of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub generation_info: GenerationInfo,
    pub statistics: Statistics,
    pub files_generated: Vec<String>,
}

impl Metadata {
    pub fn new(
        main_model: &str,
        repo_path: &Path,
        commit_id: Option<String>,
        total_components: usize,
        leaf_nodes: usize,
        max_depth: usize,
    ) -> Self {
        Self {
            generation_info: GenerationInfo {
                timestamp: Utc::now().to_rfc3339(),
                main_model: main_model.to_string(),
                repo_path: repo_path.display().to_string(),
                commit_id,
            },
            statistics: Statistics {
                total_components,
                leaf_nodes,
                max_depth,
            },
            files_generated: Vec::new(),
        }
    }

    /// List every markdown and JSON artifact in the working directory and
    /// write `metadata.json` there.
    pub fn write(mut self, working_dir: &Path) -> Result<(), CoreError> {
        match std::fs::read_dir(working_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.ends_with(".md") || name.ends_with(".json") {
                        self.files_generated.push(name);
                    }
                }
                self.files_generated.sort();
            }
            Err(e) => warn!("could not list generated files: {e}"),
        }
        let path = working_dir.join(codeatlas_core::config::METADATA_FILENAME);
        std::fs::write(&path, serde_json::to_string_pretty(&self)?)?;
        Ok(())
    }
}
