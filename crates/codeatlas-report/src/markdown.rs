use tracing::warn;

use codeatlas_core::tree::{total_component_count, ModuleTree};

use crate::diagram::{children_diagram, tree_diagram};

/// A child module as seen by the overview synthesizer.
#[derive(Debug, Clone)]
pub struct ChildDoc {
    pub name: String,
    /// One-paragraph summary pulled from the child's markdown, if available.
    pub summary: Option<String>,
    /// Whether `<name>.md` exists in the working directory.
    pub exists: bool,
}

/// Closing line of the quick overview. Its presence is how a later run (or a
/// later stage of this run) tells a placeholder overview from a final one.
pub const QUICK_OVERVIEW_MARKER: &str =
    "Detailed documentation for each module is being generated; module links \
     become active as their files are written.";

/// True iff an `overview.md` body is the structure-only placeholder.
pub fn is_quick_overview(content: &str) -> bool {
    content.contains(QUICK_OVERVIEW_MARKER)
}

/// Structure-only overview written right after clustering so a usable
/// artifact exists even if later stages fail. Overwritten by the final
/// overview.
pub fn quick_overview(repo_name: &str, tree: &ModuleTree) -> String {
    let diagram = tree_diagram(repo_name, tree);
    let mut out = String::new();
    out.push_str(&format!("# {repo_name} - Repository Overview\n\n"));
    out.push_str("## Introduction\n\n");
    out.push_str(&format!(
        "This repository contains {} top-level modules with a total of {} components.\n\n",
        tree.len(),
        total_component_count(tree)
    ));
    out.push_str("## Architecture Overview\n\n");
    out.push_str("```mermaid\n");
    out.push_str(&diagram);
    out.push_str("```\n\n");
    out.push_str("## Modules\n\n");
    for (name, module) in tree {
        out.push_str(&format!("### {name}\n"));
        if !module.path.is_empty() {
            out.push_str(&format!("- **Path**: `{}`\n", module.path));
        }
        out.push_str(&format!("- **Components**: {}\n", module.components.len()));
        if !module.children.is_empty() {
            out.push_str(&format!("- **Sub-modules**: {}\n", module.children.len()));
        }
        out.push('\n');
    }
    out.push_str(QUICK_OVERVIEW_MARKER);
    out.push('\n');
    out
}

/// Deterministic overview for a parent module (or the repository root) whose
/// children are already documented: a short intro, a navigable diagram and a
/// linked section per child. Children without documentation are listed
/// without a link.
pub fn parent_overview(title: &str, children: &[ChildDoc]) -> String {
    let diagram_children: Vec<(String, String, bool)> = children
        .iter()
        .map(|c| (c.name.clone(), format!("{}.md", c.name), c.exists))
        .collect();
    let diagram = children_diagram(title, &diagram_children);

    let mut out = String::new();
    out.push_str(&format!("# {title}\n\n"));
    out.push_str(&format!(
        "The `{title}` module is organized into {} sub-modules, each documented in its own file.\n\n",
        children.len()
    ));
    out.push_str("## Architecture\n\n");
    out.push_str("```mermaid\n");
    out.push_str(&diagram);
    out.push_str("```\n\n");
    out.push_str("## Sub-modules\n\n");
    for child in children {
        if child.exists {
            out.push_str(&format!("### [{}]({}.md)\n\n", child.name, child.name));
        } else {
            warn!(child = %child.name, "child documentation missing, emitting unlinked entry");
            out.push_str(&format!("### {}\n\n", child.name));
        }
        if let Some(summary) = &child.summary {
            out.push_str(summary);
            out.push_str("\n\n");
        }
    }
    out
}

/// First paragraph of prose after the first heading of a markdown document.
/// Used to seed child summaries in parent overviews.
pub fn first_heading_summary(markdown: &str) -> Option<String> {
    let mut seen_heading = false;
    let mut paragraph = String::new();
    for line in markdown.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            if seen_heading && !paragraph.is_empty() {
                break;
            }
            seen_heading = true;
            continue;
        }
        if !seen_heading {
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with("```") {
            if !paragraph.is_empty() {
                break;
            }
            continue;
        }
        if !paragraph.is_empty() {
            paragraph.push(' ');
        }
        paragraph.push_str(trimmed);
    }
    if paragraph.is_empty() {
        None
    } else {
        Some(paragraph)
    }
}
