use codeatlas_core::tree::ModuleTree;

/// Sanitize a string to be a valid Mermaid node ID.
pub fn sanitize_mermaid_id(s: &str) -> String {
    s.replace("::", "_")
        .replace(['/', '.', '-', ' '], "_")
        .replace(['<', '>'], "")
}

/// Diagram for a parent overview: one node per immediate child, one edge from
/// the parent to each child and one `click` per child whose documentation
/// file exists.
///
/// `children` is `(module_name, doc_file, navigable)`.
pub fn children_diagram(parent_label: &str, children: &[(String, String, bool)]) -> String {
    let parent_id = sanitize_mermaid_id(parent_label);
    let mut out = String::new();
    out.push_str("graph TD\n");
    out.push_str(&format!("    {parent_id}[\"{parent_label}\"]\n"));
    for (name, _, _) in children {
        let id = sanitize_mermaid_id(name);
        out.push_str(&format!("    {id}[\"{name}\"]\n"));
    }
    out.push('\n');
    for (name, _, _) in children {
        let id = sanitize_mermaid_id(name);
        out.push_str(&format!("    {parent_id} --> {id}\n"));
    }
    out.push('\n');
    for (name, file, navigable) in children {
        if !navigable {
            continue;
        }
        let id = sanitize_mermaid_id(name);
        out.push_str(&format!("    click {id} \"{file}\" \"View {name} module\"\n"));
    }
    out
}

/// Structure diagram for the quick overview: the whole module tree, every
/// module clickable since each will receive a documentation file.
pub fn tree_diagram(repo_name: &str, tree: &ModuleTree) -> String {
    let root_id = sanitize_mermaid_id(repo_name);
    let mut nodes = vec![format!("    {root_id}[\"{repo_name}\"]")];
    let mut edges = Vec::new();
    let mut clicks = Vec::new();

    fn walk(
        tree: &ModuleTree,
        parent_id: &str,
        nodes: &mut Vec<String>,
        edges: &mut Vec<String>,
        clicks: &mut Vec<String>,
    ) {
        for (name, module) in tree {
            let id = sanitize_mermaid_id(name);
            nodes.push(format!("    {id}[\"{name}\"]"));
            edges.push(format!("    {parent_id} --> {id}"));
            clicks.push(format!("    click {id} \"{name}.md\" \"View {name} module\""));
            walk(&module.children, &id, nodes, edges, clicks);
        }
    }
    walk(tree, &root_id, &mut nodes, &mut edges, &mut clicks);

    let mut out = String::new();
    out.push_str("graph TD\n");
    for line in nodes {
        out.push_str(&line);
        out.push('\n');
    }
    out.push('\n');
    for line in edges {
        out.push_str(&line);
        out.push('\n');
    }
    out.push('\n');
    for line in clicks {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Fenced mermaid blocks contained in a markdown document.
pub fn mermaid_blocks(markdown: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in markdown.lines() {
        match &mut current {
            None if line.trim_start().starts_with("```mermaid") => {
                current = Some(String::new());
            }
            Some(block) => {
                if line.trim() == "```" {
                    blocks.push(std::mem::take(block));
                    current = None;
                } else {
                    block.push_str(line);
                    block.push('\n');
                }
            }
            None => {}
        }
    }
    blocks
}

/// Check the overview diagram contract: the block opens with `graph TD` or
/// `flowchart TD`, brackets are balanced and there is one `click` per
/// navigable child. Returns a description of the first violation.
pub fn check_diagram(block: &str, navigable_children: &[String]) -> Result<(), String> {
    let first_line = block.lines().next().unwrap_or("").trim();
    if first_line != "graph TD" && first_line != "flowchart TD" {
        return Err(format!("diagram must open with graph TD, got '{first_line}'"));
    }
    let opens = block.matches('[').count();
    let closes = block.matches(']').count();
    if opens != closes {
        return Err(format!("unbalanced brackets: {opens} '[' vs {closes} ']'"));
    }
    for child in navigable_children {
        let expected = format!("\"{child}.md\"");
        let has_click = block
            .lines()
            .any(|l| l.trim_start().starts_with("click ") && l.contains(&expected));
        if !has_click {
            return Err(format!("missing click target for child '{child}'"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeatlas_core::tree::Module;
    use codeatlas_core::types::ComponentId;

    fn children() -> Vec<(String, String, bool)> {
        vec![
            ("parser".to_string(), "parser.md".to_string(), true),
            ("runtime".to_string(), "runtime.md".to_string(), true),
        ]
    }

    #[test]
    fn test_sanitize_mermaid_id() {
        assert_eq!(sanitize_mermaid_id("a.b/c-d e"), "a_b_c_d_e");
        assert_eq!(sanitize_mermaid_id("x::y"), "x_y");
    }

    #[test]
    fn test_children_diagram_contract() {
        let diagram = children_diagram("vm", &children());
        assert!(diagram.starts_with("graph TD\n"));
        assert!(diagram.contains("vm[\"vm\"]"));
        assert!(diagram.contains("vm --> parser"));
        assert!(diagram.contains("click parser \"parser.md\""));
        let names: Vec<String> = vec!["parser".to_string(), "runtime".to_string()];
        check_diagram(&diagram, &names).unwrap();
    }

    #[test]
    fn test_non_navigable_child_has_no_click() {
        let kids = vec![("ghost".to_string(), "ghost.md".to_string(), false)];
        let diagram = children_diagram("root", &kids);
        assert!(!diagram.contains("click ghost"));
    }

    #[test]
    fn test_tree_diagram_covers_nested_modules() {
        let mut inner = ModuleTree::new();
        inner.insert(
            "codec".to_string(),
            Module::with_components("", vec![ComponentId("a.C".to_string())]),
        );
        let mut tree = ModuleTree::new();
        tree.insert(
            "server".to_string(),
            Module {
                path: "server".to_string(),
                components: vec![],
                children: inner,
            },
        );
        let diagram = tree_diagram("myrepo", &tree);
        assert!(diagram.contains("myrepo --> server"));
        assert!(diagram.contains("server --> codec"));
        assert!(diagram.contains("click codec \"codec.md\""));
    }

    #[test]
    fn test_mermaid_block_extraction() {
        let md = "# Title\n\n```mermaid\ngraph TD\n    a[\"a\"]\n```\n\ntext\n";
        let blocks = mermaid_blocks(md);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].starts_with("graph TD"));
    }

    #[test]
    fn test_check_diagram_rejects_wrong_type() {
        let err = check_diagram("classDiagram\n", &[]).unwrap_err();
        assert!(err.contains("graph TD"));
    }

    #[test]
    fn test_check_diagram_rejects_unbalanced() {
        let err = check_diagram("graph TD\n    a[\"a\"\n", &[]).unwrap_err();
        assert!(err.contains("unbalanced"));
    }
}
