use std::collections::BTreeMap;

use codeatlas_core::config::LARGE_REPO_COMPONENT_THRESHOLD;
use codeatlas_core::tree::{total_component_count, ModuleTree};
use codeatlas_core::types::{Component, ComponentId};
use codeatlas_llm::count_tokens;

/// System prompt for agents documenting a module that is large enough to be
/// split into sub-modules.
const COMPLEX_SYSTEM_PROMPT: &str = r#"<ROLE>
You are a software documentation assistant. You document one module of a
repository at a time, working from its core code components.
</ROLE>

<OBJECTIVES>
Produce documentation that lets a developer understand:
1. What the module does and why it exists
2. Its architecture and the relationships between its components
3. How it connects to the other modules of the repository
</OBJECTIVES>

<OUTPUT>
1. The main file `{module_name}.md` in the working directory: a brief
   introduction, an architecture section with a diagram, and a description of
   each sub-module that links to the sub-module's own documentation file.
2. For genuinely separable parts, delegate with
   `generate_sub_module_documentation`; each sub-module gets its own
   `<sub_module>.md` written by a sub-agent.
3. Link to other modules' documentation files instead of restating their
   content. All documentation files live flat in one directory, so links are
   always `[label](other_module.md)`.
</OUTPUT>

<DIAGRAMS>
Use ONLY "graph TD" or "flowchart TD" mermaid diagrams. Never use
classDiagram, sequenceDiagram or any other diagram type. Every node uses a
bracketed label and navigable nodes get a click line:

```mermaid
graph TD
    core[Core]
    storage[Storage]
    api[API]

    core --> storage
    core --> api

    click storage "storage.md" "View the storage module"
    click api "api.md" "View the API module"
```
</DIAGRAMS>

<WORKFLOW>
1. Read the provided components; fetch anything else you need with
   read_code_components.
2. Create `{module_name}.md` with str_replace_editor.
3. Delegate sub-modules that span several files with
   generate_sub_module_documentation.
4. Finish by making one editing pass over `{module_name}.md` so every
   generated sub-module file is cross-referenced.
</WORKFLOW>"#;

/// System prompt for agents documenting a leaf module in a single file.
const LEAF_SYSTEM_PROMPT: &str = r#"<ROLE>
You are a software documentation assistant. You document one module of a
repository, working from its core code components.
</ROLE>

<OBJECTIVES>
Produce documentation that lets a developer understand:
1. What the module does and why it exists
2. Its architecture and the relationships between its components
3. How it connects to the other modules of the repository
</OBJECTIVES>

<OUTPUT>
Write the complete `{module_name}.md` into the working directory: a brief
introduction followed by thorough documentation of the components, with
mermaid diagrams where structure helps. Link to other modules' documentation
(`[label](other_module.md)`) instead of restating their content.
</OUTPUT>

<DIAGRAMS>
Use ONLY "graph TD" or "flowchart TD" mermaid diagrams. Never use
classDiagram, sequenceDiagram or any other diagram type. Navigable nodes get
a click line: click node "file.md" "tooltip".
</DIAGRAMS>

<WORKFLOW>
1. Read the provided components; fetch anything else you need with
   read_code_components.
2. Write `{module_name}.md` with str_replace_editor.
</WORKFLOW>"#;

const USER_PROMPT: &str = r#"Generate documentation for the {module_name} module from the module tree and
core components below.

<MODULE_TREE>
{module_tree}
</MODULE_TREE>
Note: documentation files for every module live flat in the working
directory, so a reference to another module is written [label]({module}.md)
regardless of tree depth.

<CORE_COMPONENT_CODES>
{core_component_codes}
</CORE_COMPONENT_CODES>"#;

const CLUSTER_ROOT_PROMPT: &str = r#"Here is the list of potential core components of a repository (not all of
them are essential, that is expected):
<POTENTIAL_CORE_COMPONENTS>
{components}
</POTENTIAL_CORE_COMPONENTS>

IMPORTANT: output the <GROUPED_COMPONENTS> block FIRST, before any reasoning
or commentary.

Group the components into modules by file path and logical relationship.
Respond starting immediately with:
<GROUPED_COMPONENTS>
{
    "module_name_1": {
        "path": "path/to/module",
        "components": ["component_id_1", "component_id_2"]
    },
    "module_name_2": {
        "path": "path/to/other/module",
        "components": ["component_id_3"]
    }
}
</GROUPED_COMPONENTS>

Rules:
- Group by top-level directories and naming patterns
- Keep groups manageable (5-50 components each where possible)
- Use snake_case module names
- Skip test and example components
- No text of any kind before the <GROUPED_COMPONENTS> tag"#;

const CLUSTER_MODULE_PROMPT: &str = r#"Here is the module tree of a repository:
<MODULE_TREE>
{module_tree}
</MODULE_TREE>

Here is the list of potential core components of the module {module_name}
(not all of them are essential, that is expected):
<POTENTIAL_CORE_COMPONENTS>
{components}
</POTENTIAL_CORE_COMPONENTS>

IMPORTANT: output the <GROUPED_COMPONENTS> block FIRST, before any reasoning
or commentary.

Group the components into smaller sub-modules by file path and logical
relationship. Respond starting immediately with:
<GROUPED_COMPONENTS>
{
    "submodule_name_1": {
        "path": "path/to/submodule",
        "components": ["component_id_1", "component_id_2"]
    }
}
</GROUPED_COMPONENTS>

Rules:
- Group by subdirectories and logical relationships
- Keep groups manageable (5-50 components each where possible)
- Use snake_case sub-module names
- No text of any kind before the <GROUPED_COMPONENTS> tag"#;

pub fn complex_system_prompt(module_name: &str) -> String {
    COMPLEX_SYSTEM_PROMPT.replace("{module_name}", module_name)
}

pub fn leaf_system_prompt(module_name: &str) -> String {
    LEAF_SYSTEM_PROMPT.replace("{module_name}", module_name)
}

/// Language tag for a fenced code block, from the file extension.
pub fn fence_language(relative_path: &str) -> &'static str {
    match relative_path.rsplit('.').next().unwrap_or("") {
        "rs" => "rust",
        "go" => "go",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" => "python",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "md" => "markdown",
        "sh" => "bash",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        _ => "text",
    }
}

/// Group ids by their file's relative path, preserving id order within a file.
pub fn group_by_file<'a>(
    ids: &'a [ComponentId],
    components: &'a BTreeMap<ComponentId, Component>,
) -> BTreeMap<&'a str, Vec<&'a ComponentId>> {
    let mut grouped: BTreeMap<&str, Vec<&ComponentId>> = BTreeMap::new();
    for id in ids {
        if let Some(component) = components.get(id) {
            grouped
                .entry(component.relative_path.as_str())
                .or_default()
                .push(id);
        }
    }
    grouped
}

/// The per-module source bundle: components grouped by file, each with its
/// line range and exact source text. Whole files are never inlined.
pub fn format_source_bundle(
    ids: &[ComponentId],
    components: &BTreeMap<ComponentId, Component>,
) -> String {
    let mut out = String::new();
    for (path, file_ids) in group_by_file(ids, components) {
        out.push_str(&format!("# File: {path}\n\n"));
        let lang = fence_language(path);
        for id in file_ids {
            let component = &components[id];
            out.push_str(&format!("## Component: {id}\n"));
            out.push_str(&format!(
                "Lines {}-{}\n",
                component.start_line, component.end_line
            ));
            out.push_str(&format!("```{lang}\n"));
            out.push_str(&component.source_code);
            out.push_str("\n```\n\n");
        }
    }
    out
}

/// Token count of a module's source bundle. Thresholds are always checked
/// against this exact rendering.
pub fn count_module_tokens(
    ids: &[ComponentId],
    components: &BTreeMap<ComponentId, Component>,
) -> usize {
    count_tokens(&format_source_bundle(ids, components))
}

/// Names-only listing (`# file` then one id per line) used by the clusterer.
pub fn format_components_listing(
    ids: &[ComponentId],
    components: &BTreeMap<ComponentId, Component>,
) -> String {
    let mut out = String::new();
    for (path, file_ids) in group_by_file(ids, components) {
        out.push_str(&format!("# {path}\n"));
        for id in file_ids {
            out.push_str(&format!("\t{id}\n"));
        }
    }
    out
}

/// Full module-tree rendering: every node with its complete component list.
pub fn format_module_tree_full(tree: &ModuleTree, current_module: &str) -> String {
    let mut lines = Vec::new();
    fn recurse(tree: &ModuleTree, current: &str, indent: usize, lines: &mut Vec<String>) {
        let pad = "  ".repeat(indent);
        for (name, module) in tree {
            if name == current {
                lines.push(format!("{pad}{name} (current module)"));
            } else {
                lines.push(format!("{pad}{name}"));
            }
            let ids: Vec<&str> = module.components.iter().map(|c| c.as_str()).collect();
            lines.push(format!("{pad}   Core components: {}", ids.join(", ")));
            if !module.children.is_empty() {
                lines.push(format!("{pad}   Children:"));
                recurse(&module.children, current, indent + 2, lines);
            }
        }
    }
    recurse(tree, current_module, 0, &mut lines);
    lines.join("\n")
}

/// Tiered module-tree rendering for large repositories: the current module
/// and its immediate children carry full component listings; every other
/// module shows only a count and is reachable through the browse tools.
pub fn format_module_tree_tiered(tree: &ModuleTree, current_module: &str) -> String {
    let mut lines = vec![
        "# Repository Module Structure".to_string(),
        "# Large repository: only the current module carries its full component list."
            .to_string(),
        "# Use the list_module_components tool to inspect any other module.".to_string(),
        String::new(),
    ];
    fn recurse(
        tree: &ModuleTree,
        current: &str,
        indent: usize,
        parent_is_current: bool,
        lines: &mut Vec<String>,
    ) {
        let pad = "  ".repeat(indent);
        for (name, module) in tree {
            let is_current = name == current;
            if is_current {
                lines.push(format!("{pad}{name} (current module)"));
            } else {
                lines.push(format!("{pad}{name}"));
            }
            if is_current || parent_is_current {
                let ids: Vec<&str> = module.components.iter().map(|c| c.as_str()).collect();
                lines.push(format!("{pad}   Core components: {}", ids.join(", ")));
            } else {
                lines.push(format!(
                    "{pad}   Components: {} items (use list_module_components to view)",
                    module.components.len()
                ));
            }
            if !module.children.is_empty() {
                lines.push(format!("{pad}   Children:"));
                recurse(&module.children, current, indent + 2, is_current, lines);
            }
        }
    }
    recurse(tree, current_module, 0, false, &mut lines);
    lines.join("\n")
}

/// Assemble the user prompt for a module agent. Repositories above the
/// component threshold get the tiered tree view.
pub fn format_user_prompt(
    module_name: &str,
    ids: &[ComponentId],
    components: &BTreeMap<ComponentId, Component>,
    tree: &ModuleTree,
) -> String {
    let tree_view = if total_component_count(tree) > LARGE_REPO_COMPONENT_THRESHOLD {
        format_module_tree_tiered(tree, module_name)
    } else {
        format_module_tree_full(tree, module_name)
    };
    USER_PROMPT
        .replace("{module_name}", module_name)
        .replace("{module_tree}", &tree_view)
        .replace("{core_component_codes}", &format_source_bundle(ids, components))
}

/// Clustering prompt: the repository-level wording at the root, the
/// module-level wording (with the tree rendered) when refining a module.
pub fn format_cluster_prompt(
    listing: &str,
    tree: &ModuleTree,
    current_module: Option<&str>,
) -> String {
    match current_module {
        None => CLUSTER_ROOT_PROMPT.replace("{components}", listing),
        Some(module_name) => CLUSTER_MODULE_PROMPT
            .replace("{module_tree}", &format_module_tree_full(tree, module_name))
            .replace("{module_name}", module_name)
            .replace("{components}", listing),
    }
}
