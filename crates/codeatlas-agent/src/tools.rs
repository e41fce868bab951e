use std::collections::BTreeMap;
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{debug, warn};

use codeatlas_core::tree::{find_module_by_name, ModuleTree};
use codeatlas_core::types::{Component, ComponentId};
use codeatlas_llm::{ToolCall, ToolDef};

use crate::prompt::group_by_file;

/// Shared state the tools operate on. The module tree is the live tree,
/// mutated by delegation and auto-split and persisted after every change.
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub components: Arc<BTreeMap<ComponentId, Component>>,
    pub module_tree: Arc<Mutex<ModuleTree>>,
}

impl ToolContext {
    pub fn tree(&self) -> ModuleTree {
        self.module_tree
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Result of dispatching one tool call. Delegation is not executed here: the
/// scheduler owns sub-agent recursion and answers the call itself.
#[derive(Debug)]
pub enum ToolOutcome {
    Reply(String),
    Delegate(BTreeMap<String, Vec<ComponentId>>),
}

/// The fixed tool surface exposed to module agents. The two browse tools are
/// present only for large repositories, delegation only for complex modules.
pub struct ToolDispatcher {
    large_repo: bool,
}

impl ToolDispatcher {
    pub fn new(large_repo: bool) -> Self {
        Self { large_repo }
    }

    pub fn definitions(&self, complex: bool) -> Vec<ToolDef> {
        let mut defs = vec![read_code_components_def(), str_replace_editor_def()];
        if complex {
            defs.push(generate_sub_module_documentation_def());
        }
        if self.large_repo {
            defs.push(list_module_components_def());
            defs.push(get_module_summary_def());
        }
        defs
    }

    /// Validate and execute one call. Unsupported tools, bad arguments and
    /// out-of-root paths come back as error replies for the agent, never as
    /// host errors.
    pub fn dispatch(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutcome {
        debug!(tool = %call.name, "dispatching tool call");
        let args = match call.parse_arguments() {
            Ok(value) => value,
            Err(e) => return ToolOutcome::Reply(format!("Error: invalid tool arguments: {e}")),
        };
        match call.name.as_str() {
            "read_code_components" => read_code_components(ctx, &args),
            "str_replace_editor" => str_replace_editor(ctx, &args),
            "generate_sub_module_documentation" => parse_delegation(&args),
            "list_module_components" if self.large_repo => list_module_components(ctx, &args),
            "get_module_summary" if self.large_repo => get_module_summary(ctx, &args),
            other => ToolOutcome::Reply(format!("Error: unknown tool '{other}'")),
        }
    }
}

fn read_code_components_def() -> ToolDef {
    ToolDef {
        name: "read_code_components".to_string(),
        description: "Return the source code of the listed component ids.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "ids": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Component ids to read"
                }
            },
            "required": ["ids"]
        }),
    }
}

fn str_replace_editor_def() -> ToolDef {
    ToolDef {
        name: "str_replace_editor".to_string(),
        description: "File editor rooted at the working directory. Commands: \
                      create (path, file_text), view (path), insert (path, \
                      insert_line, new_str), str_replace (path, old_str, new_str)."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "enum": ["create", "view", "insert", "str_replace"]
                },
                "path": {"type": "string", "description": "Path relative to the working directory"},
                "file_text": {"type": "string"},
                "old_str": {"type": "string"},
                "new_str": {"type": "string"},
                "insert_line": {"type": "integer"}
            },
            "required": ["command", "path"]
        }),
    }
}

fn generate_sub_module_documentation_def() -> ToolDef {
    ToolDef {
        name: "generate_sub_module_documentation".to_string(),
        description: "Delegate documentation of sub-modules to sub-agents. \
                      Pass a mapping from sub-module name to its component ids."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "sub_module_specs": {
                    "type": "object",
                    "additionalProperties": {
                        "type": "array",
                        "items": {"type": "string"}
                    },
                    "description": "e.g. {\"storage\": [\"pkg.store.Store\"], \"api\": [\"pkg.api.Router\"]}"
                }
            },
            "required": ["sub_module_specs"]
        }),
    }
}

fn list_module_components_def() -> ToolDef {
    ToolDef {
        name: "list_module_components".to_string(),
        description: "List every component id of a named module, grouped by file. \
                      Use when the module tree shows 'N items (use list_module_components to view)'."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "module_name": {"type": "string"}
            },
            "required": ["module_name"]
        }),
    }
}

fn get_module_summary_def() -> ToolDef {
    ToolDef {
        name: "get_module_summary".to_string(),
        description: "Counts, file paths and a component sample for a named module.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "module_name": {"type": "string"}
            },
            "required": ["module_name"]
        }),
    }
}

fn read_code_components(ctx: &ToolContext, args: &Value) -> ToolOutcome {
    let Some(ids) = args.get("ids").and_then(|v| v.as_array()) else {
        return ToolOutcome::Reply("Error: missing required parameter 'ids'".to_string());
    };
    let mut out = String::new();
    for id in ids {
        let Some(id) = id.as_str() else { continue };
        match ctx.components.get(&ComponentId(id.to_string())) {
            Some(component) => {
                out.push_str(&format!(
                    "## {id} ({}, lines {}-{})\n```\n{}\n```\n\n",
                    component.relative_path, component.start_line, component.end_line,
                    component.source_code
                ));
            }
            None => out.push_str(&format!("## {id}\nnot found\n\n")),
        }
    }
    if out.is_empty() {
        out.push_str("no components requested");
    }
    ToolOutcome::Reply(out)
}

/// Resolve a user-supplied path strictly inside the working directory.
fn resolve_in_working_dir(working_dir: &Path, raw: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(raw);
    let relative = if candidate.is_absolute() {
        candidate
            .strip_prefix(working_dir)
            .map_err(|_| format!("path '{raw}' is outside the working directory"))?
    } else {
        candidate
    };
    for part in relative.components() {
        match part {
            PathComponent::Normal(_) | PathComponent::CurDir => {}
            _ => return Err(format!("path '{raw}' is outside the working directory")),
        }
    }
    Ok(working_dir.join(relative))
}

/// Atomic write: temp file in the same directory, then rename.
fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = dir.join(format!(".{file_name}.tmp"));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

fn str_replace_editor(ctx: &ToolContext, args: &Value) -> ToolOutcome {
    let command = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
    let Some(raw_path) = args.get("path").and_then(|v| v.as_str()) else {
        return ToolOutcome::Reply("Error: missing required parameter 'path'".to_string());
    };
    let path = match resolve_in_working_dir(&ctx.working_dir, raw_path) {
        Ok(path) => path,
        Err(e) => return ToolOutcome::Reply(format!("Error: {e}")),
    };

    match command {
        "create" => {
            let Some(text) = args.get("file_text").and_then(|v| v.as_str()) else {
                return ToolOutcome::Reply("Error: create requires 'file_text'".to_string());
            };
            match atomic_write(&path, text) {
                Ok(()) => ToolOutcome::Reply(format!("Created {raw_path}")),
                Err(e) => ToolOutcome::Reply(format!("Error: failed to write {raw_path}: {e}")),
            }
        }
        "view" => match std::fs::read_to_string(&path) {
            Ok(content) => ToolOutcome::Reply(content),
            Err(e) => ToolOutcome::Reply(format!("Error: failed to read {raw_path}: {e}")),
        },
        "insert" => {
            let Some(new_str) = args.get("new_str").and_then(|v| v.as_str()) else {
                return ToolOutcome::Reply("Error: insert requires 'new_str'".to_string());
            };
            let line = args.get("insert_line").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    return ToolOutcome::Reply(format!("Error: failed to read {raw_path}: {e}"))
                }
            };
            let mut lines: Vec<&str> = content.lines().collect();
            let at = line.min(lines.len());
            lines.insert(at, new_str);
            let joined = lines.join("\n") + "\n";
            match atomic_write(&path, &joined) {
                Ok(()) => ToolOutcome::Reply(format!("Inserted into {raw_path} at line {at}")),
                Err(e) => ToolOutcome::Reply(format!("Error: failed to write {raw_path}: {e}")),
            }
        }
        "str_replace" => {
            let (Some(old_str), Some(new_str)) = (
                args.get("old_str").and_then(|v| v.as_str()),
                args.get("new_str").and_then(|v| v.as_str()),
            ) else {
                return ToolOutcome::Reply(
                    "Error: str_replace requires 'old_str' and 'new_str'".to_string(),
                );
            };
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    return ToolOutcome::Reply(format!("Error: failed to read {raw_path}: {e}"))
                }
            };
            let count = content.matches(old_str).count();
            if count == 0 {
                return ToolOutcome::Reply("Error: old_str not found in file".to_string());
            }
            if count > 1 {
                return ToolOutcome::Reply(format!(
                    "Error: old_str found {count} times, it must be unique"
                ));
            }
            let replaced = content.replacen(old_str, new_str, 1);
            match atomic_write(&path, &replaced) {
                Ok(()) => ToolOutcome::Reply(format!("Edited {raw_path}")),
                Err(e) => ToolOutcome::Reply(format!("Error: failed to write {raw_path}: {e}")),
            }
        }
        other => ToolOutcome::Reply(format!("Error: unknown editor command '{other}'")),
    }
}

fn parse_delegation(args: &Value) -> ToolOutcome {
    let Some(specs) = args.get("sub_module_specs").and_then(|v| v.as_object()) else {
        return ToolOutcome::Reply(
            "Error: missing required parameter 'sub_module_specs'".to_string(),
        );
    };
    let mut parsed = BTreeMap::new();
    for (name, ids) in specs {
        let Some(ids) = ids.as_array() else {
            return ToolOutcome::Reply(format!(
                "Error: sub-module '{name}' must map to an array of component ids"
            ));
        };
        let ids: Vec<ComponentId> = ids
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| ComponentId(s.to_string()))
            .collect();
        if ids.is_empty() {
            warn!(sub_module = %name, "delegation spec with no usable ids, skipping");
            continue;
        }
        parsed.insert(name.clone(), ids);
    }
    if parsed.is_empty() {
        return ToolOutcome::Reply("Error: no usable sub-module specs provided".to_string());
    }
    ToolOutcome::Delegate(parsed)
}

fn list_module_components(ctx: &ToolContext, args: &Value) -> ToolOutcome {
    let Some(module_name) = args.get("module_name").and_then(|v| v.as_str()) else {
        return ToolOutcome::Reply("Error: missing required parameter 'module_name'".to_string());
    };
    let tree = ctx.tree();
    let Some(module) = find_module_by_name(&tree, module_name) else {
        let top: Vec<&String> = tree.keys().collect();
        return ToolOutcome::Reply(format!(
            "Module '{module_name}' not found. Top-level modules: {top:?}"
        ));
    };
    if module.components.is_empty() {
        return ToolOutcome::Reply(format!("Module '{module_name}' has no components."));
    }

    let grouped = group_by_file(&module.components, &ctx.components);
    let mut lines = vec![
        format!("# Module: {module_name}"),
        format!("# Total components: {}", module.components.len()),
        format!("# Files: {}", grouped.len()),
        String::new(),
    ];
    for (path, ids) in grouped {
        lines.push(format!("## {path}"));
        for id in ids {
            lines.push(format!("  - {id}"));
        }
        lines.push(String::new());
    }
    if !module.children.is_empty() {
        lines.push("# Child modules:".to_string());
        for (child, info) in &module.children {
            lines.push(format!("  - {child} ({} components)", info.components.len()));
        }
    }
    ToolOutcome::Reply(lines.join("\n"))
}

fn get_module_summary(ctx: &ToolContext, args: &Value) -> ToolOutcome {
    let Some(module_name) = args.get("module_name").and_then(|v| v.as_str()) else {
        return ToolOutcome::Reply("Error: missing required parameter 'module_name'".to_string());
    };
    let tree = ctx.tree();
    let Some(module) = find_module_by_name(&tree, module_name) else {
        return ToolOutcome::Reply(format!("Module '{module_name}' not found."));
    };

    let grouped = group_by_file(&module.components, &ctx.components);
    let mut lines = vec![
        format!("# Module Summary: {module_name}"),
        String::new(),
        "## Statistics".to_string(),
        format!("- Total components: {}", module.components.len()),
        format!("- Unique files: {}", grouped.len()),
        format!("- Child modules: {}", module.children.len()),
        String::new(),
    ];
    if !grouped.is_empty() {
        lines.push("## File Paths".to_string());
        for path in grouped.keys().take(20) {
            lines.push(format!("  - {path}"));
        }
        if grouped.len() > 20 {
            lines.push(format!("  ... and {} more files", grouped.len() - 20));
        }
        lines.push(String::new());
    }
    if !module.children.is_empty() {
        lines.push("## Child Modules".to_string());
        for (child, info) in &module.children {
            lines.push(format!(
                "  - {child}: {} components, {} sub-modules",
                info.components.len(),
                info.children.len()
            ));
        }
        lines.push(String::new());
    }
    if !module.components.is_empty() {
        lines.push("## Sample Components (first 10)".to_string());
        for id in module.components.iter().take(10) {
            lines.push(format!("  - {id}"));
        }
        if module.components.len() > 10 {
            lines.push(format!("  ... and {} more", module.components.len() - 10));
        }
    }
    ToolOutcome::Reply(lines.join("\n"))
}
