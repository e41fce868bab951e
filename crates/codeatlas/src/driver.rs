use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use codeatlas_agent::{reconcile_with_leaves, Clusterer, DocScheduler};
use codeatlas_core::analyzer::LanguageAnalyzer;
use codeatlas_core::config::{
    Config, FIRST_MODULE_TREE_FILENAME, MODULE_TREE_FILENAME, OVERVIEW_FILENAME,
};
use codeatlas_core::error::CoreError;
use codeatlas_core::tree::{self, total_component_count, ModuleTree};
use codeatlas_core::types::{Component, ComponentId};
use codeatlas_core::{AnalysisPipeline, RepoAnalysis};
use codeatlas_go::GoAnalyzer;
use codeatlas_llm::{ChatProvider, TokenAccountant};
use codeatlas_report::{quick_overview, Metadata};
use codeatlas_rust::RustAnalyzer;
use codeatlas_typescript::TypeScriptAnalyzer;

/// Hard ceiling for dependency analysis; exceeding it is fatal.
pub const STAGE1_TIMEOUT_SECS: u64 = 300;
/// Timeout on the outermost clustering call; exceeding it falls back to the
/// deterministic directory grouping.
pub const CLUSTER_TIMEOUT_SECS: u64 = 30;

/// Figures reported back to the CLI after a run.
#[derive(Debug)]
pub struct RunSummary {
    pub total_components: usize,
    pub leaf_count: usize,
    pub module_count: usize,
    pub working_dir: PathBuf,
}

/// All registered language analyzers.
pub fn default_analyzers() -> Result<Vec<Box<dyn LanguageAnalyzer>>> {
    Ok(vec![
        Box::new(GoAnalyzer::new().context("go analyzer")?),
        Box::new(RustAnalyzer::new().context("rust analyzer")?),
        Box::new(TypeScriptAnalyzer::new().context("typescript analyzer")?),
    ])
}

/// Stage 1 with its hard timeout: parse the repository on a blocking thread
/// while the async side enforces the ceiling.
pub async fn analyze_repository(
    config: &Config,
    cancel: &CancellationToken,
) -> Result<RepoAnalysis, CoreError> {
    let repo_root = config.repo_path.clone();
    let child_cancel = cancel.child_token();
    let handle = tokio::task::spawn_blocking(move || {
        let analyzers = default_analyzers()
            .map_err(|e| CoreError::Incomplete { detail: e.to_string() })?;
        let pipeline = AnalysisPipeline::new(analyzers);
        pipeline.analyze_with_cancel(&repo_root, &child_cancel)
    });

    match tokio::time::timeout(Duration::from_secs(STAGE1_TIMEOUT_SECS), handle).await {
        Ok(joined) => joined.map_err(|e| CoreError::Incomplete {
            detail: format!("analysis task failed: {e}"),
        })?,
        Err(_) => {
            cancel.cancel();
            Err(CoreError::AnalysisTimeout {
                seconds: STAGE1_TIMEOUT_SECS,
            })
        }
    }
}

/// Stage 2 with cache, timeout, fallback and leaf reconciliation.
async fn cluster_leaves(
    config: &Config,
    provider: Arc<dyn ChatProvider>,
    components: Arc<BTreeMap<ComponentId, Component>>,
    leaves: &[ComponentId],
    working_dir: &PathBuf,
) -> Result<ModuleTree, CoreError> {
    let first_tree_path = working_dir.join(FIRST_MODULE_TREE_FILENAME);
    if first_tree_path.exists() {
        info!("reusing cached module tree from {FIRST_MODULE_TREE_FILENAME}");
        return tree::load_tree(&first_tree_path);
    }

    let clusterer = Clusterer::new(provider, Arc::clone(&components), config.clone());
    let mut module_tree = match tokio::time::timeout(
        Duration::from_secs(CLUSTER_TIMEOUT_SECS),
        clusterer.cluster(leaves),
    )
    .await
    {
        Ok(tree) => tree,
        Err(_) => {
            warn!("clustering timed out after {CLUSTER_TIMEOUT_SECS}s, using directory fallback");
            clusterer.directory_fallback(leaves, None)
        }
    };

    reconcile_with_leaves(&mut module_tree, leaves, &components);
    tree::validate(&module_tree, &components)?;

    if module_tree.is_empty() {
        return Err(CoreError::EmptyLeafSet);
    }
    tree::save_tree(&first_tree_path, &module_tree)?;
    Ok(module_tree)
}

/// Run the whole five-stage pipeline against the configured repository.
pub async fn run_generation(
    config: Config,
    provider: Arc<dyn ChatProvider>,
    accountant: Arc<TokenAccountant>,
    cancel: CancellationToken,
    commit_id: Option<String>,
) -> Result<RunSummary, CoreError> {
    let working_dir = config.output_dir.clone();
    std::fs::create_dir_all(&working_dir)?;

    // Stage 1: dependency analysis.
    accountant.set_stage("Stage 1: Dependency Analysis");
    let analysis = analyze_repository(&config, &cancel).await?;
    codeatlas_core::save_artifact(&analysis, &working_dir, &config.repo_path)?;
    if analysis.leaves.is_empty() {
        return Err(CoreError::EmptyLeafSet);
    }
    let components = Arc::new(analysis.components);
    let leaves = analysis.leaves;
    info!(
        components = components.len(),
        leaves = leaves.len(),
        "dependency analysis done"
    );

    // Stage 2: module clustering.
    accountant.set_stage("Stage 2: Module Clustering");
    let first_tree = cluster_leaves(
        &config,
        Arc::clone(&provider),
        Arc::clone(&components),
        &leaves,
        &working_dir,
    )
    .await?;
    let module_tree_path = working_dir.join(MODULE_TREE_FILENAME);
    let live_tree = if module_tree_path.exists() {
        tree::load_tree(&module_tree_path)?
    } else {
        first_tree.clone()
    };
    tree::save_tree(&module_tree_path, &live_tree)?;
    info!(modules = first_tree.len(), "module clustering done");

    // Quick overview: a usable artifact exists from here on.
    let overview_path = working_dir.join(OVERVIEW_FILENAME);
    if !overview_path.exists() && !first_tree.is_empty() {
        let repo_name = config
            .repo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repository".to_string());
        let quick = quick_overview(&repo_name, &first_tree);
        std::fs::write(&overview_path, quick)?;
        info!("quick overview written, the final overview will replace it");
    }

    // Stages 3/4: scheduled documentation agents.
    accountant.set_stage("Stage 4: Module Documentation");
    let large_repo = total_component_count(&first_tree)
        > codeatlas_core::config::LARGE_REPO_COMPONENT_THRESHOLD;
    let scheduler = DocScheduler::new(
        Arc::clone(&provider),
        config.clone(),
        Arc::clone(&components),
        working_dir.clone(),
        live_tree,
        large_repo,
        cancel.clone(),
    );
    scheduler.run(&first_tree).await?;
    let final_tree = scheduler.tree_snapshot();

    // Stage 5: metadata.
    accountant.set_stage("Complete");
    Metadata::new(
        &config.main_model,
        &config.repo_path,
        commit_id,
        components.len(),
        leaves.len(),
        config.max_depth,
    )
    .write(&working_dir)?;

    Ok(RunSummary {
        total_components: components.len(),
        leaf_count: leaves.len(),
        module_count: final_tree.len(),
        working_dir,
    })
}
