mod common;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use codeatlas_agent::DocScheduler;
use codeatlas_core::config::{Config, FIRST_MODULE_TREE_FILENAME, MODULE_TREE_FILENAME};
use codeatlas_core::error::CoreError;
use codeatlas_core::tree::{find_module, load_tree, Module, ModuleTree};
use codeatlas_core::types::{Component, ComponentId, ComponentKind};
use codeatlas_llm::TokenAccountant;
use codeatlas_report::{check_diagram, mermaid_blocks};

use common::StubProvider;

fn test_config(repo: &Path, output: &Path) -> Config {
    Config {
        repo_path: repo.to_path_buf(),
        output_dir: output.to_path_buf(),
        ..Config::default()
    }
}

async fn generate(
    config: Config,
    provider: Arc<StubProvider>,
) -> Result<codeatlas::RunSummary, CoreError> {
    codeatlas::run_generation(
        config,
        provider,
        Arc::new(TokenAccountant::new()),
        CancellationToken::new(),
        None,
    )
    .await
}

fn write_two_struct_repo(repo: &Path) {
    std::fs::write(
        repo.join("app.go"),
        r#"
package app

type Config struct {
    Name string
}

type Registry struct {
    Entries []string
}
"#,
    )
    .unwrap();
}

#[tokio::test]
async fn test_empty_repository_is_fatal_and_writes_nothing() {
    let repo = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubProvider::new());

    let err = generate(test_config(repo.path(), output.path()), Arc::clone(&provider))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::EmptyRepository { .. }), "{err}");

    let files: Vec<_> = std::fs::read_dir(output.path()).unwrap().collect();
    assert!(files.is_empty(), "no artifacts on a fatal stage-1 error");
    assert_eq!(provider.complete_calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.chat_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_single_file_repo_produces_main_module_docs() {
    let repo = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_two_struct_repo(repo.path());

    let provider = Arc::new(StubProvider::new());
    provider.push_turn(StubProvider::create_doc_turn(
        "main.md",
        "# main\n\nHolds the application configuration and registry.\n",
    ));
    provider.push_turn(StubProvider::text_turn("Done."));

    let summary = generate(test_config(repo.path(), output.path()), Arc::clone(&provider))
        .await
        .unwrap();
    assert_eq!(summary.total_components, 2);
    assert_eq!(summary.leaf_count, 2);
    assert_eq!(summary.module_count, 1);

    // Two components are below the clustering minimum: no cluster LLM call.
    assert_eq!(provider.complete_calls.load(Ordering::SeqCst), 0);

    let tree = load_tree(&output.path().join(MODULE_TREE_FILENAME)).unwrap();
    assert!(tree.contains_key("main"));
    assert_eq!(tree["main"].components.len(), 2);
    assert!(tree["main"].children.is_empty(), "no auto-split expected");

    let main_md = std::fs::read_to_string(output.path().join("main.md")).unwrap();
    assert!(main_md.contains("application configuration"));

    let overview = std::fs::read_to_string(output.path().join("overview.md")).unwrap();
    let blocks = mermaid_blocks(&overview);
    assert_eq!(blocks.len(), 1, "exactly one mermaid block in the overview");
    check_diagram(&blocks[0], &["main".to_string()]).unwrap();
}

#[tokio::test]
async fn test_metadata_and_dependency_artifact_written() {
    let repo_root = tempfile::tempdir().unwrap();
    let repo = repo_root.path().join("my-app.v1");
    std::fs::create_dir_all(&repo).unwrap();
    let output = tempfile::tempdir().unwrap();
    write_two_struct_repo(&repo);

    let provider = Arc::new(StubProvider::new());
    provider.push_turn(StubProvider::create_doc_turn("main.md", "# main\n\nx\n"));
    provider.push_turn(StubProvider::text_turn("Done."));

    generate(test_config(&repo, output.path()), provider)
        .await
        .unwrap();

    assert!(output.path().join("my_app_v1_dependency_graph.json").exists());

    let metadata: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(output.path().join("metadata.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(metadata["statistics"]["total_components"], 2);
    assert_eq!(metadata["statistics"]["leaf_nodes"], 2);
    let generated: Vec<String> = metadata["files_generated"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(generated.contains(&"overview.md".to_string()));
    assert!(generated.contains(&"main.md".to_string()));
    assert!(generated.contains(&"module_tree.json".to_string()));
}

#[tokio::test]
async fn test_resume_skips_existing_docs() {
    let repo = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_two_struct_repo(repo.path());

    let provider = Arc::new(StubProvider::new());
    provider.push_turn(StubProvider::create_doc_turn("main.md", "# main\n\nFirst run.\n"));
    provider.push_turn(StubProvider::text_turn("Done."));
    generate(test_config(repo.path(), output.path()), provider)
        .await
        .unwrap();

    let main_before = std::fs::read(output.path().join("main.md")).unwrap();
    let overview_before = std::fs::read(output.path().join("overview.md")).unwrap();
    let tree_before = std::fs::read(output.path().join(MODULE_TREE_FILENAME)).unwrap();

    // Lose the live tree but keep every markdown artifact.
    std::fs::remove_file(output.path().join(MODULE_TREE_FILENAME)).unwrap();
    assert!(output.path().join(FIRST_MODULE_TREE_FILENAME).exists());

    let second = Arc::new(StubProvider::new());
    generate(test_config(repo.path(), output.path()), Arc::clone(&second))
        .await
        .unwrap();

    assert_eq!(
        second.chat_calls.load(Ordering::SeqCst),
        0,
        "every module must be skipped through the idempotence gate"
    );
    assert_eq!(second.complete_calls.load(Ordering::SeqCst), 0);

    assert_eq!(std::fs::read(output.path().join("main.md")).unwrap(), main_before);
    assert_eq!(
        std::fs::read(output.path().join("overview.md")).unwrap(),
        overview_before
    );
    let tree_after = std::fs::read(output.path().join(MODULE_TREE_FILENAME)).unwrap();
    assert_eq!(tree_after, tree_before, "regenerated tree must be byte-equal");
}

#[tokio::test]
async fn test_idempotent_rerun_produces_identical_outputs() {
    let repo = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_two_struct_repo(repo.path());

    let provider = Arc::new(StubProvider::new());
    provider.push_turn(StubProvider::create_doc_turn("main.md", "# main\n\nStable.\n"));
    provider.push_turn(StubProvider::text_turn("Done."));
    generate(test_config(repo.path(), output.path()), provider)
        .await
        .unwrap();

    let list_files = |dir: &Path| -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n != "metadata.json")
            .collect();
        names.sort();
        names
    };
    let files_before = list_files(output.path());
    let tree_before = std::fs::read(output.path().join(MODULE_TREE_FILENAME)).unwrap();

    generate(test_config(repo.path(), output.path()), Arc::new(StubProvider::new()))
        .await
        .unwrap();

    assert_eq!(list_files(output.path()), files_before);
    assert_eq!(
        std::fs::read(output.path().join(MODULE_TREE_FILENAME)).unwrap(),
        tree_before
    );
}

fn synthetic_component(id: &str, rel: &str, tokens_worth: usize) -> (ComponentId, Component) {
    let cid = ComponentId(id.to_string());
    (
        cid.clone(),
        Component {
            id: cid,
            name: id.rsplit('.').next().unwrap().to_string(),
            kind: ComponentKind::Struct,
            file_path: PathBuf::from(rel),
            relative_path: rel.to_string(),
            source_code: "lorem ipsum dolor sit amet ".repeat(tokens_worth / 6 + 1),
            start_line: 1,
            end_line: 40,
        },
    )
}

/// Auto-split: a frontier whose rendered prompt exceeds the context budget
/// must be chunked into part_N children, the tree persisted, the children
/// documented and a parent overview linking each part written.
#[tokio::test]
async fn test_auto_split_creates_part_children_and_parent_overview() {
    let output = tempfile::tempdir().unwrap();

    let mut components: BTreeMap<ComponentId, Component> = BTreeMap::new();
    let mut ids = Vec::new();
    for i in 0..600 {
        let (id, component) = synthetic_component(
            &format!("big.file{i:03}.Widget{i:03}"),
            // Everything in one file under one directory so the directory
            // split collapses and token chunking takes over.
            "big/big.go",
            250,
        );
        ids.push(id.clone());
        components.insert(id, component);
    }

    let mut first_tree = ModuleTree::new();
    first_tree.insert("big".to_string(), Module::with_components("big", ids));

    let config = Config {
        repo_path: PathBuf::from("/tmp/synthetic"),
        output_dir: output.path().to_path_buf(),
        ..Config::default()
    };
    let provider = Arc::new(StubProvider::new());
    let scheduler = DocScheduler::new(
        Arc::clone(&provider) as Arc<dyn codeatlas_llm::ChatProvider>,
        config,
        Arc::new(components),
        output.path().to_path_buf(),
        first_tree.clone(),
        true,
        CancellationToken::new(),
    );
    scheduler.run(&first_tree).await.unwrap();

    let tree = load_tree(&output.path().join(MODULE_TREE_FILENAME)).unwrap();
    let big = find_module(&tree, &["big".to_string()]).unwrap();
    assert!(
        big.children.len() >= 2,
        "expected several part_N children, got {:?}",
        big.children.keys().collect::<Vec<_>>()
    );
    assert!(big.children.keys().all(|k| k.starts_with("part_")));

    // Every part got documented (placeholder docs from the default stub turn)
    // and the parent links to each of them.
    let parent = std::fs::read_to_string(output.path().join("big.md")).unwrap();
    let blocks = mermaid_blocks(&parent);
    assert_eq!(blocks.len(), 1);
    let children: Vec<String> = big.children.keys().cloned().collect();
    check_diagram(&blocks[0], &children).unwrap();
    for child in &children {
        assert!(output.path().join(format!("{child}.md")).exists());
        assert!(parent.contains(&format!("[{child}]({child}.md)")));
    }

    scheduler.verify_outputs().unwrap();
}
