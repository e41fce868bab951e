use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use codeatlas_core::config::{
    Config, MAX_AUTO_SPLIT_DEPTH, MAX_LLM_CONTEXT, MAX_TOKEN_PER_LEAF_MODULE, MIN_DEPTH,
    MODULE_TREE_FILENAME, OVERVIEW_FILENAME, TARGET_TOKENS_PER_CHUNK,
};
use codeatlas_core::error::CoreError;
use codeatlas_core::tree::{
    collect_module_names, find_module, find_module_mut, processing_order, save_tree, Module,
    ModuleTree,
};
use codeatlas_core::types::{Component, ComponentId};
use codeatlas_llm::{count_tokens, ChatMessage, ChatProvider};
use codeatlas_report::{first_heading_summary, is_quick_overview, parent_overview, ChildDoc};

use crate::cluster::normalize_module_name;
use crate::prompt::{
    complex_system_prompt, count_module_tokens, format_user_prompt, leaf_system_prompt,
};
use crate::tools::{ToolContext, ToolDispatcher, ToolOutcome};

/// Iteration cap for one module agent. The agent is done earlier when a turn
/// carries no tool calls.
pub const MAX_AGENT_ITERATIONS: usize = 24;

/// Stage 3/4: topological traversal of the module tree, one documentation
/// agent per module, pre-flight auto-split for oversized prompts and
/// deterministic parent synthesis.
pub struct DocScheduler {
    provider: Arc<dyn ChatProvider>,
    config: Config,
    components: Arc<BTreeMap<ComponentId, Component>>,
    working_dir: PathBuf,
    tree: Arc<Mutex<ModuleTree>>,
    dispatcher: ToolDispatcher,
    cancel: CancellationToken,
}

impl DocScheduler {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        config: Config,
        components: Arc<BTreeMap<ComponentId, Component>>,
        working_dir: PathBuf,
        initial_tree: ModuleTree,
        large_repo: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            config,
            components,
            working_dir,
            tree: Arc::new(Mutex::new(initial_tree)),
            dispatcher: ToolDispatcher::new(large_repo),
            cancel,
        }
    }

    /// The live module tree (mutated by auto-split and delegation).
    pub fn tree_snapshot(&self) -> ModuleTree {
        self.tree.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Process every module of `first_tree` children-before-parents, then
    /// synthesize the repository overview and verify the output contract.
    pub async fn run(&self, first_tree: &ModuleTree) -> Result<(), CoreError> {
        if self.components.is_empty() {
            return Err(CoreError::EmptyComponentTable);
        }

        let order = processing_order(first_tree);
        info!(modules = order.len(), "processing modules in topological order");

        let mut failed: Vec<String> = Vec::new();
        for (path, name) in &order {
            if self.cancel.is_cancelled() {
                info!("documentation generation cancelled");
                break;
            }
            let is_parent = find_module(first_tree, path)
                .map(|m| !m.children.is_empty())
                .unwrap_or(false);
            let result = if is_parent {
                self.synthesize_parent(path)
            } else {
                self.process_module(path.clone()).await
            };
            if let Err(e) = result {
                error!(module = %path.join("."), "module processing failed: {e}");
                failed.push(name.clone());
            }
        }
        if !failed.is_empty() {
            warn!(failed = failed.len(), "some modules failed: {failed:?}");
        }

        self.synthesize_root()?;
        self.persist_tree()?;
        self.verify_outputs()
    }

    /// Per-module loop: idempotence gate, classification, prompt build,
    /// pre-flight auto-split, agent run.
    fn process_module<'a>(
        &'a self,
        path: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let name = path.last().cloned().unwrap_or_default();
            let depth = path.len();

            if self.final_overview_exists() || self.doc_exists(&format!("{name}.md")) {
                info!(module = %name, "documentation already present, skipping");
                return Ok(());
            }

            let snapshot = self.tree_snapshot();
            let ids: Vec<ComponentId> = find_module(&snapshot, &path)
                .map(|m| m.components.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|id| self.components.contains_key(id))
                .collect();

            let complex = is_complex_module(&ids, &self.components);
            let user_prompt = format_user_prompt(&name, &ids, &self.components, &snapshot);
            let system = if complex {
                complex_system_prompt(&name)
            } else {
                leaf_system_prompt(&name)
            };

            // Pre-flight auto-split: the threshold sees the exact prompt text.
            let prompt_tokens = count_tokens(&system) + count_tokens(&user_prompt);
            if prompt_tokens > MAX_LLM_CONTEXT {
                if depth < MAX_AUTO_SPLIT_DEPTH {
                    info!(
                        module = %name,
                        prompt_tokens, "prompt exceeds context budget, auto-splitting"
                    );
                    return self.auto_split(&path, &ids, depth).await;
                }
                warn!(
                    module = %name,
                    prompt_tokens, "prompt oversized at maximum split depth, proceeding anyway"
                );
            }

            self.run_agent_loop(&path, &name, complex, &system, user_prompt)
                .await?;
            self.ensure_doc(&name, &ids)?;
            self.persist_tree()
        })
    }

    /// Split an oversized module into sub-modules before any LLM call:
    /// directory buckets at this depth's path segment, else deterministic
    /// token-budget chunks named `part_1..part_k`.
    async fn auto_split(
        &self,
        path: &[String],
        ids: &[ComponentId],
        depth: usize,
    ) -> Result<(), CoreError> {
        let name = path.last().cloned().unwrap_or_default();
        let mut groups = split_by_directory(ids, &self.components, depth);
        if groups.len() <= 1 {
            info!(module = %name, "directory split collapsed, chunking by token budget");
            groups = chunk_by_tokens(ids, &self.components);
        }

        {
            let mut tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
            let module = find_module_mut(&mut tree, path).ok_or_else(|| {
                CoreError::TreeInvariantViolation {
                    module: path.join("."),
                    detail: "auto-split target missing from tree".to_string(),
                }
            })?;
            for (child_name, child_ids) in &groups {
                module.children.insert(
                    child_name.clone(),
                    Module::with_components("", child_ids.clone()),
                );
            }
        }
        self.persist_tree()?;
        info!(module = %name, parts = groups.len(), "auto-split inserted sub-modules");

        for child_name in groups.keys() {
            let mut child_path = path.to_vec();
            child_path.push(child_name.clone());
            self.process_module(child_path).await?;
        }

        self.write_parent_file(&name, path)
    }

    /// The cooperative agent loop: chat turn, tool execution, repeat.
    /// Delegation calls are answered by recursing into sub-module runs.
    fn run_agent_loop<'a>(
        &'a self,
        path: &'a [String],
        name: &'a str,
        complex: bool,
        system: &'a str,
        user_prompt: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let depth = path.len();
            let defs = self.dispatcher.definitions(complex);
            let ctx = ToolContext {
                working_dir: self.working_dir.clone(),
                components: Arc::clone(&self.components),
                module_tree: Arc::clone(&self.tree),
            };
            let mut messages = vec![ChatMessage::user(user_prompt)];

            for iteration in 0..MAX_AGENT_ITERATIONS {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                let turn = match self
                    .provider
                    .chat(system, &messages, &defs, &self.config.main_model, None)
                    .await
                {
                    Ok(turn) => turn,
                    Err(err) if self.config.fallback_model != self.config.main_model => {
                        warn!(
                            module = name,
                            "main model failed ({err}), retrying with fallback model"
                        );
                        self.provider
                            .chat(system, &messages, &defs, &self.config.fallback_model, None)
                            .await
                            .map_err(|e| CoreError::LlmFailure(e.to_string()))?
                    }
                    Err(err) => return Err(CoreError::LlmFailure(err.to_string())),
                };

                let tool_calls = turn.tool_calls.clone();
                messages.push(ChatMessage::assistant(turn.text, tool_calls.clone()));
                if tool_calls.is_empty() {
                    info!(module = name, iteration, "agent finished");
                    return Ok(());
                }

                for call in &tool_calls {
                    let reply = match self.dispatcher.dispatch(&ctx, call) {
                        ToolOutcome::Reply(reply) => reply,
                        ToolOutcome::Delegate(specs) if complex => {
                            self.run_sub_modules(path.to_vec(), depth, specs).await?
                        }
                        ToolOutcome::Delegate(_) => {
                            "Error: this module does not support delegation".to_string()
                        }
                    };
                    messages.push(ChatMessage::tool_result(&call.id, &call.name, reply));
                }
            }
            warn!(module = name, "agent exhausted its iteration budget");
            Ok(())
        })
    }

    /// Execute a delegation request: insert each sub-module into the tree,
    /// run a sub-agent per entry and enforce the minimum-depth rule.
    fn run_sub_modules<'a>(
        &'a self,
        parent_path: Vec<String>,
        parent_depth: usize,
        specs: BTreeMap<String, Vec<ComponentId>>,
    ) -> Pin<Box<dyn Future<Output = Result<String, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut written = Vec::new();

            for (raw_name, raw_ids) in specs {
                let name = normalize_module_name(&raw_name);
                if name.is_empty() {
                    warn!(sub_module = %raw_name, "unusable sub-module name, skipping");
                    continue;
                }
                let ids: Vec<ComponentId> = raw_ids
                    .into_iter()
                    .filter(|id| {
                        let known = self.components.contains_key(id);
                        if !known {
                            warn!(id = %id, "delegated id missing from component table, skipping");
                        }
                        known
                    })
                    .collect();
                if ids.is_empty() {
                    continue;
                }

                {
                    let mut tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
                    let parent = find_module_mut(&mut tree, &parent_path).ok_or_else(|| {
                        CoreError::TreeInvariantViolation {
                            module: parent_path.join("."),
                            detail: "delegation parent missing from tree".to_string(),
                        }
                    })?;
                    parent
                        .children
                        .insert(name.clone(), Module::with_components("", ids.clone()));
                }
                self.persist_tree()?;

                let mut child_path = parent_path.clone();
                child_path.push(name.clone());
                let depth = parent_depth + 1;

                // Until MIN_DEPTH a sub-module with at least two components
                // gets a delegating agent; past it the normal criteria apply.
                let force = parent_depth < MIN_DEPTH && ids.len() >= 2;
                let normal = is_complex_module(&ids, &self.components)
                    && depth < self.config.max_depth
                    && count_module_tokens(&ids, &self.components) >= MAX_TOKEN_PER_LEAF_MODULE;
                let complex_agent = force || normal;

                if !self.doc_exists(&format!("{name}.md")) {
                    let snapshot = self.tree_snapshot();
                    let user_prompt =
                        format_user_prompt(&name, &ids, &self.components, &snapshot);
                    let system = if complex_agent {
                        complex_system_prompt(&name)
                    } else {
                        leaf_system_prompt(&name)
                    };
                    self.run_agent_loop(&child_path, &name, complex_agent, &system, user_prompt)
                        .await?;
                    self.ensure_doc(&name, &ids)?;
                }

                // Depth floor: a multi-file sub-module that came back flat is
                // split on directories so the tree reaches MIN_DEPTH.
                let child_is_flat = {
                    let tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
                    find_module(&tree, &child_path)
                        .map(|m| m.children.is_empty())
                        .unwrap_or(false)
                };
                if force && child_is_flat && file_span(&ids, &self.components) > 1 {
                    let auto = split_by_directory(&ids, &self.components, depth);
                    if auto.len() > 1 {
                        info!(
                            module = %name,
                            parts = auto.len(),
                            "forcing directory split to reach minimum depth"
                        );
                        self.run_sub_modules(child_path, depth, auto).await?;
                    }
                }

                written.push(format!("{name}.md"));
            }

            if written.is_empty() {
                return Ok("Error: no usable sub-module specs provided".to_string());
            }
            Ok(format!(
                "Generated successfully. Documentation files {} are saved in the working directory.",
                written.join(", ")
            ))
        })
    }

    /// Deterministic overview for an internal parent module, written to
    /// `<module_name>.md` once all of its descendants are documented.
    fn synthesize_parent(&self, path: &[String]) -> Result<(), CoreError> {
        let name = path.last().cloned().unwrap_or_default();
        if self.final_overview_exists() || self.doc_exists(&format!("{name}.md")) {
            info!(module = %name, "parent overview already present, skipping");
            return Ok(());
        }
        self.write_parent_file(&name, path)
    }

    /// Repository overview at the root, written last.
    fn synthesize_root(&self) -> Result<(), CoreError> {
        if self.final_overview_exists() {
            info!("repository overview already present, skipping");
            return Ok(());
        }
        let repo_name = self
            .config
            .repo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repository".to_string());
        let snapshot = self.tree_snapshot();
        let children = self.child_docs(&snapshot);
        let content = parent_overview(&repo_name, &children);
        self.write_doc(OVERVIEW_FILENAME, &content)
    }

    fn write_parent_file(&self, name: &str, path: &[String]) -> Result<(), CoreError> {
        let snapshot = self.tree_snapshot();
        let children_tree = find_module(&snapshot, path)
            .map(|m| m.children.clone())
            .unwrap_or_default();
        let children = self.child_docs(&children_tree);
        let content = parent_overview(name, &children);
        self.write_doc(&format!("{name}.md"), &content)
    }

    fn child_docs(&self, tree: &ModuleTree) -> Vec<ChildDoc> {
        tree.keys()
            .map(|child| {
                let doc_path = self.working_dir.join(format!("{child}.md"));
                let summary = std::fs::read_to_string(&doc_path)
                    .ok()
                    .as_deref()
                    .and_then(first_heading_summary);
                ChildDoc {
                    name: child.clone(),
                    summary,
                    exists: doc_path.exists(),
                }
            })
            .collect()
    }

    /// Fallback artifact when an agent never wrote its file: the module still
    /// gets a minimal page so links and the output contract hold.
    fn ensure_doc(&self, name: &str, ids: &[ComponentId]) -> Result<(), CoreError> {
        let file = format!("{name}.md");
        if self.doc_exists(&file) {
            return Ok(());
        }
        warn!(module = name, "agent produced no documentation file, writing placeholder");
        let mut content = format!("# {name}\n\nComponents in this module:\n\n");
        for id in ids {
            content.push_str(&format!("- `{id}`\n"));
        }
        self.write_doc(&file, &content)
    }

    fn doc_exists(&self, file: &str) -> bool {
        self.working_dir.join(file).exists()
    }

    /// The quick overview written after clustering is a placeholder; only a
    /// final overview closes the idempotence gate.
    fn final_overview_exists(&self) -> bool {
        match std::fs::read_to_string(self.working_dir.join(OVERVIEW_FILENAME)) {
            Ok(content) => !is_quick_overview(&content),
            Err(_) => false,
        }
    }

    fn write_doc(&self, file: &str, content: &str) -> Result<(), CoreError> {
        let path = self.working_dir.join(file);
        let tmp = self.working_dir.join(format!(".{file}.tmp"));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn persist_tree(&self) -> Result<(), CoreError> {
        let snapshot = self.tree_snapshot();
        save_tree(&self.working_dir.join(MODULE_TREE_FILENAME), &snapshot)
    }

    /// Output contract: the overview exists, the persisted tree is non-empty
    /// and every module named in it has a documentation file.
    pub fn verify_outputs(&self) -> Result<(), CoreError> {
        if !self.doc_exists(OVERVIEW_FILENAME) {
            return Err(CoreError::Incomplete {
                detail: "overview.md was not generated".to_string(),
            });
        }
        let snapshot = self.tree_snapshot();
        if snapshot.is_empty() {
            return Err(CoreError::Incomplete {
                detail: "module tree is empty".to_string(),
            });
        }
        let missing: Vec<String> = collect_module_names(&snapshot)
            .into_iter()
            .filter(|name| !self.doc_exists(&format!("{name}.md")))
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::Incomplete {
                detail: format!("modules without documentation: {missing:?}"),
            });
        }
        Ok(())
    }
}

/// A module is complex when its components span several files and there is
/// more than one of them; complex modules get the delegation tool.
pub fn is_complex_module(
    ids: &[ComponentId],
    components: &BTreeMap<ComponentId, Component>,
) -> bool {
    ids.len() > 1 && file_span(ids, components) > 1
}

fn file_span(ids: &[ComponentId], components: &BTreeMap<ComponentId, Component>) -> usize {
    ids.iter()
        .filter_map(|id| components.get(id))
        .map(|c| c.relative_path.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Bucket ids on the path segment at `depth`; empty map when everything
/// lands in a single bucket (the split achieved nothing).
pub fn split_by_directory(
    ids: &[ComponentId],
    components: &BTreeMap<ComponentId, Component>,
    depth: usize,
) -> BTreeMap<String, Vec<ComponentId>> {
    let mut groups: BTreeMap<String, Vec<ComponentId>> = BTreeMap::new();
    for id in ids {
        let Some(component) = components.get(id) else {
            continue;
        };
        let parts: Vec<&str> = component.relative_path.split('/').collect();
        let key = if parts.len() > depth {
            let normalized = normalize_module_name(parts[depth]);
            if normalized.is_empty() {
                "other".to_string()
            } else {
                normalized
            }
        } else {
            "other".to_string()
        };
        groups.entry(key).or_default().push(id.clone());
    }
    if groups.len() <= 1 {
        return BTreeMap::new();
    }
    groups
}

/// Deterministic token-budget chunking with stable `part_N` naming: ids are
/// taken in sorted order so a fixed leaf set always chunks the same way.
pub fn chunk_by_tokens(
    ids: &[ComponentId],
    components: &BTreeMap<ComponentId, Component>,
) -> BTreeMap<String, Vec<ComponentId>> {
    let mut sorted: Vec<ComponentId> = ids.to_vec();
    sorted.sort();

    let mut chunks: Vec<Vec<ComponentId>> = Vec::new();
    let mut current: Vec<ComponentId> = Vec::new();
    let mut current_tokens = 0usize;
    for id in sorted {
        let id_tokens = count_module_tokens(std::slice::from_ref(&id), components);
        if !current.is_empty() && current_tokens + id_tokens > TARGET_TOKENS_PER_CHUNK {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += id_tokens;
        current.push(id);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| (format!("part_{}", i + 1), chunk))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeatlas_core::types::ComponentKind;

    fn component(id: &str, rel: &str, source_len: usize) -> (ComponentId, Component) {
        let cid = ComponentId(id.to_string());
        (
            cid.clone(),
            Component {
                id: cid,
                name: id.rsplit('.').next().unwrap().to_string(),
                kind: ComponentKind::Struct,
                file_path: PathBuf::from(rel),
                relative_path: rel.to_string(),
                source_code: "x ".repeat(source_len),
                start_line: 1,
                end_line: 2,
            },
        )
    }

    fn table(entries: &[(&str, &str)]) -> BTreeMap<ComponentId, Component> {
        entries
            .iter()
            .map(|(id, rel)| component(id, rel, 4))
            .collect()
    }

    #[test]
    fn test_is_complex_module() {
        let components = table(&[("a.X", "a.go"), ("b.Y", "b.go"), ("a.Z", "a.go")]);
        let multi_file = vec![
            ComponentId("a.X".to_string()),
            ComponentId("b.Y".to_string()),
        ];
        assert!(is_complex_module(&multi_file, &components));

        let single_file = vec![
            ComponentId("a.X".to_string()),
            ComponentId("a.Z".to_string()),
        ];
        assert!(!is_complex_module(&single_file, &components));

        let single_component = vec![ComponentId("a.X".to_string())];
        assert!(!is_complex_module(&single_component, &components));
    }

    #[test]
    fn test_split_by_directory_at_depth() {
        let components = table(&[
            ("src.net.http.A", "src/net/http.go"),
            ("src.net.tcp.B", "src/net/tcp.go"),
            ("src.db.C", "src/db.go"),
        ]);
        let ids: Vec<ComponentId> = components.keys().cloned().collect();

        // Depth 1 buckets on the second path segment.
        let groups = split_by_directory(&ids, &components, 1);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["net"].len(), 2);
        assert_eq!(groups["db"].len(), 1);
    }

    #[test]
    fn test_split_by_directory_collapses_to_empty() {
        let components = table(&[("src.a.A", "src/a.go"), ("src.b.B", "src/b.go")]);
        let ids: Vec<ComponentId> = components.keys().cloned().collect();
        // Depth 0: everything under "src" -> one bucket -> no useful split.
        assert!(split_by_directory(&ids, &components, 0).is_empty());
    }

    #[test]
    fn test_chunk_by_tokens_stable_part_names() {
        let mut components = BTreeMap::new();
        let mut ids = Vec::new();
        for i in 0..40 {
            let (id, c) = component(&format!("m.f{i:02}.C{i:02}"), &format!("m/f{i:02}.go"), 30_000);
            ids.push(id.clone());
            components.insert(id, c);
        }
        let chunks = chunk_by_tokens(&ids, &components);
        assert!(chunks.len() > 1, "large input must produce several parts");
        assert!(chunks.contains_key("part_1"));
        assert!(chunks.contains_key(&format!("part_{}", chunks.len())));

        // Shuffled input produces identical chunks.
        let mut reversed = ids.clone();
        reversed.reverse();
        assert_eq!(chunks, chunk_by_tokens(&reversed, &components));

        // Chunks partition the id set.
        let total: usize = chunks.values().map(|v| v.len()).sum();
        assert_eq!(total, ids.len());
    }

    #[test]
    fn test_file_span() {
        let components = table(&[("a.X", "a.go"), ("b.Y", "b.go"), ("a.Z", "a.go")]);
        let ids: Vec<ComponentId> = components.keys().cloned().collect();
        assert_eq!(file_span(&ids, &components), 2);
    }
}
