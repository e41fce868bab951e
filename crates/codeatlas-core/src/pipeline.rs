use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::analyzer::LanguageAnalyzer;
use crate::error::CoreError;
use crate::graph::{extract_leaves, DependencyArtifact, DependencyGraph};
use crate::types::{module_path_of, Component, ComponentId, Edge, RawReference};

/// Directory names that never contain first-party source.
const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".hg",
    ".svn",
    "target",
    "dist",
    "build",
    "out",
    "vendor",
    "venv",
    ".venv",
    "__pycache__",
    ".cache",
    ".idea",
    ".vscode",
    "testdata",
];

/// Result of Stage 1: the immutable component table, every extracted edge,
/// the resolved-edge graph and the filtered leaf set.
#[derive(Debug)]
pub struct RepoAnalysis {
    pub components: BTreeMap<ComponentId, Component>,
    pub edges: Vec<Edge>,
    pub graph: DependencyGraph,
    pub leaves: Vec<ComponentId>,
}

struct FileResult {
    file_module_path: String,
    components: Vec<Component>,
    references: Vec<RawReference>,
}

/// Stage 1 pipeline: walk the repository, parse files in parallel with the
/// registered language analyzers, merge per-file results serially, resolve
/// edges by exact id match and extract the leaf set.
pub struct AnalysisPipeline {
    analyzers: Vec<Box<dyn LanguageAnalyzer>>,
}

impl AnalysisPipeline {
    pub fn new(analyzers: Vec<Box<dyn LanguageAnalyzer>>) -> Self {
        Self { analyzers }
    }

    /// Run a full analysis on the given repository root.
    pub fn analyze(&self, repo_root: &Path) -> Result<RepoAnalysis, CoreError> {
        self.analyze_with_cancel(repo_root, &CancellationToken::new())
    }

    /// Run a full analysis, checking the cancellation signal between files.
    pub fn analyze_with_cancel(
        &self,
        repo_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<RepoAnalysis, CoreError> {
        let mut components: BTreeMap<ComponentId, Component> = BTreeMap::new();
        let mut file_results: Vec<FileResult> = Vec::new();

        for analyzer in &self.analyzers {
            let extensions: Vec<&str> = analyzer.file_extensions().to_vec();

            let source_files: Vec<(PathBuf, String)> = WalkDir::new(repo_root)
                .into_iter()
                .filter_entry(|e| !is_skipped_dir(e))
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| {
                    let p = e.path();
                    let matches_ext = p
                        .extension()
                        .is_some_and(|ext| extensions.iter().any(|x| ext == *x));
                    if !matches_ext {
                        return false;
                    }
                    let path_str = p.to_string_lossy();
                    !path_str.ends_with("_test.go") && !path_str.ends_with(".d.ts")
                })
                .map(|e| {
                    let rel = e
                        .path()
                        .strip_prefix(repo_root)
                        .unwrap_or(e.path())
                        .to_string_lossy()
                        .replace('\\', "/");
                    (e.into_path(), rel)
                })
                .collect();

            if source_files.is_empty() {
                continue;
            }
            debug!(
                language = analyzer.language(),
                files = source_files.len(),
                "parsing source files"
            );

            let results: Vec<FileResult> = source_files
                .par_iter()
                .filter_map(|(file_path, rel_path)| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let content = match std::fs::read_to_string(file_path) {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(file = %file_path.display(), "failed to read: {e}");
                            return None;
                        }
                    };

                    let parsed = match analyzer.parse_file(file_path, rel_path, &content) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(file = %file_path.display(), "failed to parse: {e}");
                            return None;
                        }
                    };

                    let file_components = analyzer.extract_components(&parsed);
                    let references = analyzer.extract_references(&parsed, &file_components);

                    Some(FileResult {
                        file_module_path: module_path_of(rel_path),
                        components: file_components,
                        references,
                    })
                })
                .collect();

            if cancel.is_cancelled() {
                info!("dependency analysis cancelled");
                break;
            }

            // Serial merge point: the component table is keyed by id, the
            // references wait for the full table before resolution.
            for fr in &results {
                for component in &fr.components {
                    if components
                        .insert(component.id.clone(), component.clone())
                        .is_some()
                    {
                        warn!(id = %component.id, "duplicate component id, keeping last");
                    }
                }
            }
            file_results.extend(results);
        }

        if components.is_empty() {
            return Err(CoreError::EmptyRepository {
                path: repo_root.to_path_buf(),
            });
        }

        let edges = resolve_references(&components, &file_results);

        let mut graph = DependencyGraph::new();
        for component in components.values() {
            graph.add_component(component);
        }
        for edge in edges.iter().filter(|e| e.resolved) {
            graph.add_resolved_edge(edge);
        }

        let leaves = extract_leaves(&graph, &components);
        info!(
            components = components.len(),
            edges = edges.len(),
            resolved = edges.iter().filter(|e| e.resolved).count(),
            leaves = leaves.len(),
            "dependency analysis complete"
        );

        Ok(RepoAnalysis {
            components,
            edges,
            graph,
            leaves,
        })
    }

}

/// Write the per-repo dependency artifact into `output_dir`.
pub fn save_artifact(
    analysis: &RepoAnalysis,
    output_dir: &Path,
    repo_root: &Path,
) -> Result<PathBuf, CoreError> {
    let artifact = DependencyArtifact {
        components: analysis.components.clone(),
        edges: analysis.edges.clone(),
        leaves: analysis.leaves.clone(),
    };
    let file_name = format!("{}_dependency_graph.json", sanitized_repo_name(repo_root));
    let path = output_dir.join(file_name);
    std::fs::create_dir_all(output_dir)?;
    std::fs::write(&path, serde_json::to_string_pretty(&artifact)?)?;
    Ok(path)
}

/// Resolve raw references against the component table by exact id match
/// only: the callee name is qualified with the referencing file's module
/// path, and the edge is resolved iff that id exists in the table. There is
/// no fuzzy or name-based resolution; everything else stays an unresolved
/// edge, retained for the artifact but invisible to leaf detection.
fn resolve_references(
    components: &BTreeMap<ComponentId, Component>,
    file_results: &[FileResult],
) -> Vec<Edge> {
    let mut edges = Vec::new();
    for fr in file_results {
        for reference in &fr.references {
            if !components.contains_key(&reference.caller) {
                continue;
            }
            let candidate = ComponentId::new(&fr.file_module_path, &reference.callee_name);
            if components.contains_key(&candidate) {
                edges.push(Edge {
                    caller: reference.caller.clone(),
                    callee: candidate,
                    line: reference.line,
                    resolved: true,
                });
            } else {
                edges.push(Edge {
                    caller: reference.caller.clone(),
                    callee: ComponentId(reference.callee_name.clone()),
                    line: reference.line,
                    resolved: false,
                });
            }
        }
    }
    edges
}

fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Repo directory name with every non-alphanumeric character replaced by `_`.
pub fn sanitized_repo_name(repo_root: &Path) -> String {
    let name = repo_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
