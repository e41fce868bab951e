use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Component, ComponentId};

/// Recursive module map. `BTreeMap` keeps serialization order stable so
/// re-runs produce byte-equal `module_tree.json`.
pub type ModuleTree = BTreeMap<String, Module>;

/// A named group of components with optional child modules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default)]
    pub components: Vec<ComponentId>,
    #[serde(default)]
    pub children: ModuleTree,
}

impl Module {
    pub fn with_components(path: impl Into<String>, components: Vec<ComponentId>) -> Self {
        Self {
            path: path.into(),
            components,
            children: ModuleTree::new(),
        }
    }
}

fn module_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-z_][a-z0-9_]*$").expect("static module name pattern"))
}

/// True iff `name` is a legal module name (`[a-z_][a-z0-9_]*`).
pub fn is_valid_module_name(name: &str) -> bool {
    module_name_re().is_match(name)
}

/// Find a module by its path of names from the root.
pub fn find_module<'a>(tree: &'a ModuleTree, path: &[String]) -> Option<&'a Module> {
    let (first, rest) = path.split_first()?;
    let module = tree.get(first)?;
    if rest.is_empty() {
        Some(module)
    } else {
        find_module(&module.children, rest)
    }
}

pub fn find_module_mut<'a>(tree: &'a mut ModuleTree, path: &[String]) -> Option<&'a mut Module> {
    let (first, rest) = path.split_first()?;
    let module = tree.get_mut(first)?;
    if rest.is_empty() {
        Some(module)
    } else {
        find_module_mut(&mut module.children, rest)
    }
}

/// Find a module anywhere in the tree by bare name (first match, depth-first).
pub fn find_module_by_name<'a>(tree: &'a ModuleTree, name: &str) -> Option<&'a Module> {
    for (key, module) in tree {
        if key == name {
            return Some(module);
        }
        if let Some(found) = find_module_by_name(&module.children, name) {
            return Some(found);
        }
    }
    None
}

/// Insert `new_modules` as children at `path` (the root map itself when the
/// path is empty). The per-node `path` field of merged children is cleared,
/// matching the persisted tree shape.
pub fn insert_children(
    tree: &mut ModuleTree,
    path: &[String],
    new_modules: ModuleTree,
) -> Result<(), CoreError> {
    let target = if path.is_empty() {
        tree
    } else {
        &mut find_module_mut(tree, path)
            .ok_or_else(|| CoreError::TreeInvariantViolation {
                module: path.join("."),
                detail: "insertion path not found in tree".to_string(),
            })?
            .children
    };
    for (name, mut module) in new_modules {
        if !path.is_empty() {
            module.path = String::new();
        }
        target.insert(name, module);
    }
    Ok(())
}

/// Total number of components across the whole tree.
pub fn total_component_count(tree: &ModuleTree) -> usize {
    tree.values()
        .map(|m| m.components.len() + total_component_count(&m.children))
        .sum()
}

/// Every module name in the tree, depth-first.
pub fn collect_module_names(tree: &ModuleTree) -> Vec<String> {
    let mut names = Vec::new();
    for (name, module) in tree {
        names.push(name.clone());
        names.extend(collect_module_names(&module.children));
    }
    names
}

/// Topological processing order: children before parents, as
/// `(path_from_root, module_name)` pairs. Parents appear immediately after
/// their last descendant so their docs can link to the children's files.
pub fn processing_order(tree: &ModuleTree) -> Vec<(Vec<String>, String)> {
    fn collect(tree: &ModuleTree, prefix: &[String], out: &mut Vec<(Vec<String>, String)>) {
        for (name, module) in tree {
            let mut path = prefix.to_vec();
            path.push(name.clone());
            if !module.children.is_empty() {
                collect(&module.children, &path, out);
            }
            out.push((path, name.clone()));
        }
    }
    let mut out = Vec::new();
    collect(tree, &[], &mut out);
    out
}

/// Validate the structural invariants of a module tree against the component
/// table: legal sibling names, sibling component disjointness, and every
/// referenced id present in the table.
pub fn validate(
    tree: &ModuleTree,
    components: &BTreeMap<ComponentId, Component>,
) -> Result<(), CoreError> {
    fn check_level(
        tree: &ModuleTree,
        components: &BTreeMap<ComponentId, Component>,
        parent: &str,
    ) -> Result<(), CoreError> {
        let mut seen: BTreeSet<&ComponentId> = BTreeSet::new();
        for (name, module) in tree {
            if !is_valid_module_name(name) {
                return Err(CoreError::TreeInvariantViolation {
                    module: format!("{parent}{name}"),
                    detail: "module name must match [a-z_][a-z0-9_]*".to_string(),
                });
            }
            for id in &module.components {
                if !components.contains_key(id) {
                    return Err(CoreError::TreeInvariantViolation {
                        module: format!("{parent}{name}"),
                        detail: format!("component id '{id}' missing from component table"),
                    });
                }
                if !seen.insert(id) {
                    return Err(CoreError::TreeInvariantViolation {
                        module: format!("{parent}{name}"),
                        detail: format!("component id '{id}' appears in two sibling modules"),
                    });
                }
            }
            check_level(
                &module.children,
                components,
                &format!("{parent}{name}."),
            )?;
        }
        Ok(())
    }
    check_level(tree, components, "")
}

/// Persist the tree as pretty JSON. `BTreeMap` keys give stable byte output.
pub fn save_tree(path: &Path, tree: &ModuleTree) -> Result<(), CoreError> {
    let json = serde_json::to_string_pretty(tree)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Load and structurally parse a tree; the caller decides whether to also
/// `validate` against the component table.
pub fn load_tree(path: &Path) -> Result<ModuleTree, CoreError> {
    let content = std::fs::read_to_string(path)?;
    let tree: ModuleTree = serde_json::from_str(&content)?;
    Ok(tree)
}
