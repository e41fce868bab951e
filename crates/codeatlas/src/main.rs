use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use codeatlas::driver;
use codeatlas_core::config::{Config, CONFIG_FILENAME};
use codeatlas_core::AnalysisPipeline;
use codeatlas_llm::{HttpLlmClient, TokenAccountant};

#[derive(Parser)]
#[command(name = "codeatlas")]
#[command(about = "Generate a browsable architecture wiki for a source repository")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: analyze, cluster and document a repository
    Generate {
        /// Path to the repository root
        path: PathBuf,
        /// Output directory for the generated documentation
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Config file path (defaults to codeatlas.toml in the repository)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Model used by the documentation agents
        #[arg(long)]
        main_model: Option<String>,
        /// Model used for module clustering
        #[arg(long)]
        cluster_model: Option<String>,
        /// OpenAI-compatible endpoint base URL
        #[arg(long)]
        base_url: Option<String>,
        /// API key (falls back to CODEATLAS_API_KEY, then OPENAI_API_KEY)
        #[arg(long)]
        api_key: Option<String>,
        /// Commit id recorded in metadata.json
        #[arg(long)]
        commit_id: Option<String>,
        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Run dependency analysis only and write the dependency graph artifact
    Analyze {
        /// Path to the repository root
        path: PathBuf,
        /// Output directory for the artifact
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Create a default codeatlas.toml configuration file
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Generate {
            path,
            output,
            config,
            main_model,
            cluster_model,
            base_url,
            api_key,
            commit_id,
            verbose,
        } => {
            init_logging(verbose);
            cmd_generate(
                path,
                output,
                config,
                main_model,
                cluster_model,
                base_url,
                api_key,
                commit_id,
            )
            .await
        }
        Commands::Analyze {
            path,
            output,
            verbose,
        } => {
            init_logging(verbose);
            cmd_analyze(path, output)
        }
        Commands::Init { force } => cmd_init(force),
    };

    if let Err(e) = result {
        eprintln!("{} {e:#}", "error:".red().bold());
        process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_generate(
    path: PathBuf,
    output: Option<PathBuf>,
    config_path: Option<PathBuf>,
    main_model: Option<String>,
    cluster_model: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    commit_id: Option<String>,
) -> Result<()> {
    let mut config = match config_path {
        Some(explicit) => Config::load(&explicit)
            .with_context(|| format!("failed to load {}", explicit.display()))?,
        None => Config::load_or_default(&path),
    };
    config.repo_path = path
        .canonicalize()
        .with_context(|| format!("repository path {} not found", path.display()))?;
    if let Some(output) = output {
        config.output_dir = output;
    }
    if let Some(model) = main_model {
        config.main_model = model;
    }
    if let Some(model) = cluster_model {
        config.cluster_model = model;
    }
    if let Some(url) = base_url {
        config.llm_base_url = url;
    }
    if let Some(key) = api_key {
        config.llm_api_key = key;
    } else if config.llm_api_key.is_empty() {
        config.llm_api_key = std::env::var("CODEATLAS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .unwrap_or_default();
    }
    if config.llm_api_key.is_empty() {
        anyhow::bail!(
            "no API key configured: pass --api-key, set CODEATLAS_API_KEY, or add it to {CONFIG_FILENAME}"
        );
    }

    let accountant = Arc::new(TokenAccountant::new());
    let provider = Arc::new(HttpLlmClient::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
        Arc::clone(&accountant),
    )?);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, finishing the current unit and stopping");
            ctrl_c_cancel.cancel();
        }
    });

    let summary =
        driver::run_generation(config, provider, Arc::clone(&accountant), cancel, commit_id)
            .await?;

    println!("{}", "documentation generated".green().bold());
    println!("  components: {}", summary.total_components);
    println!("  leaves:     {}", summary.leaf_count);
    println!("  modules:    {}", summary.module_count);
    println!("  output:     {}", summary.working_dir.display());
    println!();
    print!("{}", accountant.summary());
    Ok(())
}

fn cmd_analyze(path: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let repo_root = path
        .canonicalize()
        .with_context(|| format!("repository path {} not found", path.display()))?;
    let output_dir = output.unwrap_or_else(|| PathBuf::from("atlas-docs"));

    let pipeline = AnalysisPipeline::new(driver::default_analyzers()?);
    let analysis = pipeline.analyze(&repo_root)?;
    let artifact = codeatlas_core::save_artifact(&analysis, &output_dir, &repo_root)?;

    println!("{}", "analysis complete".green().bold());
    println!("  components: {}", analysis.components.len());
    println!(
        "  edges:      {} ({} resolved)",
        analysis.edges.len(),
        analysis.edges.iter().filter(|e| e.resolved).count()
    );
    println!("  leaves:     {}", analysis.leaves.len());
    println!("  artifact:   {}", artifact.display());
    Ok(())
}

fn cmd_init(force: bool) -> Result<()> {
    let path = PathBuf::from(CONFIG_FILENAME);
    if path.exists() && !force {
        anyhow::bail!("{CONFIG_FILENAME} already exists (use --force to overwrite)");
    }
    std::fs::write(&path, Config::default_toml())?;
    println!("created {CONFIG_FILENAME}");
    Ok(())
}
