use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use codeatlas_core::config::{
    Config, MAX_CLUSTERING_PROMPT_TOKENS, MAX_LLM_OUTPUT_TOKENS, MAX_TOKEN_PER_MODULE,
    MIN_COMPONENTS_FOR_CLUSTERING,
};
use codeatlas_core::tree::{insert_children, is_valid_module_name, Module, ModuleTree};
use codeatlas_core::types::{Component, ComponentId};
use codeatlas_llm::{count_tokens, ChatProvider};

use crate::prompt::{count_module_tokens, format_cluster_prompt, format_components_listing};

/// Margin kept free when truncating the component listing into the prompt.
const TRUNCATION_MARGIN_TOKENS: usize = 5_000;
/// A response within this many tokens of the output cap is suspected truncated.
const TRUNCATION_GUARD_TOKENS: usize = 100;
/// Re-bucket on two path segments when one first-segment bucket holds more.
const FALLBACK_REBUCKET_LIMIT: usize = 500;

/// Shape of one module inside the `<GROUPED_COMPONENTS>` JSON block.
#[derive(Debug, Deserialize)]
struct GroupedModule {
    #[serde(default)]
    path: String,
    #[serde(default)]
    components: Vec<String>,
}

/// Stage 2: recursive clustering of the leaf frontier into a module tree,
/// with a deterministic directory fallback behind every LLM decision.
pub struct Clusterer {
    provider: Arc<dyn ChatProvider>,
    components: Arc<BTreeMap<ComponentId, Component>>,
    config: Config,
}

impl Clusterer {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        components: Arc<BTreeMap<ComponentId, Component>>,
        config: Config,
    ) -> Self {
        Self {
            provider,
            components,
            config,
        }
    }

    /// Cluster the leaf set into a complete module tree.
    pub async fn cluster(&self, leaves: &[ComponentId]) -> ModuleTree {
        let mut root = ModuleTree::new();
        self.cluster_into(&mut root, Vec::new(), leaves.to_vec(), None)
            .await;
        root
    }

    /// Deterministic fallback, exposed for the outer timeout path.
    pub fn directory_fallback(
        &self,
        frontier: &[ComponentId],
        current_module: Option<&str>,
    ) -> ModuleTree {
        directory_based_modules(frontier, &self.components, current_module)
    }

    fn cluster_into<'a>(
        &'a self,
        root: &'a mut ModuleTree,
        path: Vec<String>,
        frontier: Vec<ComponentId>,
        current_module: Option<String>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let frontier: Vec<ComponentId> = frontier
                .into_iter()
                .filter(|id| {
                    let known = self.components.contains_key(id);
                    if !known {
                        warn!(id = %id, "dropping frontier id not present in component table");
                    }
                    known
                })
                .collect();

            let depth = path.len();
            info!(
                depth,
                frontier = frontier.len(),
                module = current_module.as_deref().unwrap_or("root"),
                "clustering level"
            );

            // Early-out guards: tiny frontiers and frontiers that already fit
            // one module stop here.
            if frontier.len() < MIN_COMPONENTS_FOR_CLUSTERING {
                if current_module.is_none() {
                    let _ = insert_children(root, &path, single_module_tree("main", frontier));
                }
                return;
            }
            let module_tokens = count_module_tokens(&frontier, &self.components);
            if module_tokens <= MAX_TOKEN_PER_MODULE {
                if current_module.is_none() {
                    let _ = insert_children(root, &path, single_module_tree("main", frontier));
                }
                return;
            }

            let level = self
                .cluster_level(&frontier, root, current_module.as_deref())
                .await;
            if insert_children(root, &path, level.clone()).is_err() {
                warn!(path = %path.join("."), "failed to merge clustered level");
                return;
            }

            for (name, module) in level {
                let mut child_path = path.clone();
                child_path.push(name.clone());
                self.cluster_into(root, child_path, module.components, Some(name))
                    .await;
            }
        })
    }

    /// One clustering decision: prompt the model, or fall back to directories
    /// on failure, truncation, parse error or an empty result.
    async fn cluster_level(
        &self,
        frontier: &[ComponentId],
        tree_so_far: &ModuleTree,
        current_module: Option<&str>,
    ) -> ModuleTree {
        let mut listing = format_components_listing(frontier, &self.components);
        let mut prompt = format_cluster_prompt(&listing, tree_so_far, current_module);

        let mut prompt_tokens = count_tokens(&prompt);
        if prompt_tokens > MAX_CLUSTERING_PROMPT_TOKENS {
            warn!(
                prompt_tokens,
                "clustering prompt too large, truncating component listing"
            );
            listing = truncate_listing(&listing, MAX_CLUSTERING_PROMPT_TOKENS - TRUNCATION_MARGIN_TOKENS);
            prompt = format_cluster_prompt(&listing, tree_so_far, current_module);
            prompt_tokens = count_tokens(&prompt);
        }

        info!(
            prompt_tokens,
            model = %self.config.cluster_model,
            "requesting module grouping"
        );
        let response = match self
            .provider
            .complete(&prompt, &self.config.cluster_model, None)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("clustering call failed ({err}), using directory fallback");
                return directory_based_modules(frontier, &self.components, current_module);
            }
        };

        let response_tokens = count_tokens(&response);
        let missing_tags = !response.contains("<GROUPED_COMPONENTS>")
            || !response.contains("</GROUPED_COMPONENTS>");
        if response_tokens >= MAX_LLM_OUTPUT_TOKENS - TRUNCATION_GUARD_TOKENS && missing_tags {
            warn!(
                response_tokens,
                "clustering response truncated, using directory fallback"
            );
            return directory_based_modules(frontier, &self.components, current_module);
        }

        match parse_grouped_components(&response) {
            Ok(parsed) if parsed.is_empty() => {
                warn!("model returned an empty grouping, using directory fallback");
                directory_based_modules(frontier, &self.components, current_module)
            }
            Ok(parsed) => {
                if parsed.len() == 1 {
                    // A single module is a valid outcome; visible in the log
                    // so a silently lazy model can be noticed.
                    info!(module = ?parsed.keys().next(), "model grouped everything into one module");
                }
                parsed
            }
            Err(reason) => {
                warn!("failed to parse clustering response ({reason}), using directory fallback");
                directory_based_modules(frontier, &self.components, current_module)
            }
        }
    }
}

/// Extract and parse the `<GROUPED_COMPONENTS>` JSON block.
fn parse_grouped_components(response: &str) -> Result<ModuleTree, String> {
    let inner = response
        .split("<GROUPED_COMPONENTS>")
        .nth(1)
        .and_then(|rest| rest.split("</GROUPED_COMPONENTS>").next())
        .ok_or_else(|| "missing GROUPED_COMPONENTS tags".to_string())?;

    let parsed: BTreeMap<String, GroupedModule> =
        serde_json::from_str(inner.trim()).map_err(|e| e.to_string())?;

    let mut tree = ModuleTree::new();
    for (raw_name, module) in parsed {
        let name = normalize_module_name(&raw_name);
        if name.is_empty() || module.components.is_empty() {
            continue;
        }
        tree.insert(
            name,
            Module {
                path: module.path,
                components: module.components.into_iter().map(ComponentId).collect(),
                children: ModuleTree::new(),
            },
        );
    }
    Ok(tree)
}

/// Line-wise truncation of the component listing to a token budget.
fn truncate_listing(listing: &str, budget: usize) -> String {
    let mut kept = Vec::new();
    let mut used = 0usize;
    for line in listing.lines() {
        let line_tokens = count_tokens(line);
        if used + line_tokens > budget {
            break;
        }
        kept.push(line);
        used += line_tokens;
    }
    kept.join("\n")
}

/// Deterministic grouping by top-level repository directory.
pub fn directory_based_modules(
    frontier: &[ComponentId],
    components: &BTreeMap<ComponentId, Component>,
    current_module: Option<&str>,
) -> ModuleTree {
    info!(frontier = frontier.len(), "building directory-based modules");

    let mut buckets = bucket_by_segments(frontier, components, 1);
    if buckets.len() <= 2 && buckets.values().any(|v| v.len() > FALLBACK_REBUCKET_LIMIT) {
        info!("too few first-segment buckets, re-bucketing on two segments");
        buckets = bucket_by_segments(frontier, components, 2);
    }

    if buckets.len() <= 1 {
        let name = current_module
            .map(normalize_module_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "main".to_string());
        return single_module_tree(&name, frontier.to_vec());
    }

    let mut tree = ModuleTree::new();
    for (key, ids) in buckets {
        let name = normalize_module_name(&key);
        let name = if name.is_empty() { "other".to_string() } else { name };
        // Buckets normalizing to the same name merge.
        tree.entry(name)
            .or_insert_with(|| Module::with_components(key.clone(), Vec::new()))
            .components
            .extend(ids);
    }
    tree
}

fn bucket_by_segments(
    frontier: &[ComponentId],
    components: &BTreeMap<ComponentId, Component>,
    segments: usize,
) -> BTreeMap<String, Vec<ComponentId>> {
    let mut buckets: BTreeMap<String, Vec<ComponentId>> = BTreeMap::new();
    for id in frontier {
        let Some(component) = components.get(id) else {
            continue;
        };
        let parts: Vec<&str> = component.relative_path.split('/').collect();
        let key = if parts.len() > segments {
            parts[..segments].join("_")
        } else if parts.len() > 1 {
            parts[..parts.len() - 1].join("_")
        } else {
            // Single file at the repo root: use the file stem.
            parts
                .first()
                .map(|f| f.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(f))
                .unwrap_or("root")
                .to_string()
        };
        buckets.entry(key).or_default().push(id.clone());
    }
    buckets
}

/// Normalize any string to a legal `snake_case` module name.
pub fn normalize_module_name(raw: &str) -> String {
    let mut name: String = raw
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            '-' | '.' | ' ' | '/' => '_',
            _ => '_',
        })
        .collect();
    while name.contains("__") {
        name = name.replace("__", "_");
    }
    let name = name.trim_matches('_').to_string();
    if name.is_empty() {
        return String::new();
    }
    let name = if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("_{name}")
    } else {
        name
    };
    debug_assert!(is_valid_module_name(&name));
    name
}

/// Make the tree's component union equal the leaf set exactly: unknown and
/// duplicate ids are dropped, emptied modules removed, and leaves the model
/// left out are re-attached by their top-level directory.
pub fn reconcile_with_leaves(
    tree: &mut ModuleTree,
    leaves: &[ComponentId],
    components: &BTreeMap<ComponentId, Component>,
) {
    use std::collections::BTreeSet;

    let leaf_set: BTreeSet<&ComponentId> = leaves.iter().collect();
    let mut claimed: BTreeSet<ComponentId> = BTreeSet::new();

    fn prune(
        tree: &mut ModuleTree,
        leaf_set: &std::collections::BTreeSet<&ComponentId>,
        claimed: &mut std::collections::BTreeSet<ComponentId>,
    ) {
        let names: Vec<String> = tree.keys().cloned().collect();
        for name in names {
            let Some(module) = tree.get_mut(&name) else { continue };
            module.components.retain(|id| {
                let keep = leaf_set.contains(id) && !claimed.contains(id);
                if !keep {
                    warn!(id = %id, module = %name, "dropping id not in the leaf set (or already claimed)");
                }
                if keep {
                    claimed.insert(id.clone());
                }
                keep
            });
            prune(&mut module.children, leaf_set, claimed);
            if module.components.is_empty() && module.children.is_empty() {
                tree.remove(&name);
            }
        }
    }
    prune(tree, &leaf_set, &mut claimed);

    let missing: Vec<ComponentId> = leaves
        .iter()
        .filter(|id| !claimed.contains(id))
        .cloned()
        .collect();
    if missing.is_empty() {
        return;
    }
    warn!(count = missing.len(), "re-attaching leaves the grouping left out");
    for (name, module) in directory_based_modules(&missing, components, None) {
        tree.entry(name)
            .or_insert_with(|| Module::with_components(module.path.clone(), Vec::new()))
            .components
            .extend(module.components);
    }
}

fn single_module_tree(name: &str, components: Vec<ComponentId>) -> ModuleTree {
    let mut tree = ModuleTree::new();
    tree.insert(name.to_string(), Module::with_components("", components));
    tree
}
