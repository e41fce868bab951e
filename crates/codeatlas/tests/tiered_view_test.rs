use std::collections::BTreeMap;
use std::path::PathBuf;

use codeatlas_agent::format_user_prompt;
use codeatlas_core::tree::{Module, ModuleTree};
use codeatlas_core::types::{Component, ComponentId, ComponentKind};

fn build_repo(per_module: usize) -> (BTreeMap<ComponentId, Component>, ModuleTree) {
    let mut components = BTreeMap::new();
    let mut tree = ModuleTree::new();
    for module in ["alpha", "beta"] {
        let mut ids = Vec::new();
        for i in 0..per_module {
            let rel = format!("{module}/file{i}.go");
            let id = ComponentId(format!("{module}.file{i}.Type{i}"));
            ids.push(id.clone());
            components.insert(
                id.clone(),
                Component {
                    id,
                    name: format!("Type{i}"),
                    kind: ComponentKind::Struct,
                    file_path: PathBuf::from(&rel),
                    relative_path: rel,
                    source_code: format!("type Type{i} struct {{}}"),
                    start_line: 1,
                    end_line: 1,
                },
            );
        }
        tree.insert(module.to_string(), Module::with_components(module, ids));
    }
    (components, tree)
}

/// Above the large-repo threshold the current module keeps its listing while
/// sibling modules collapse to a count plus a tool hint.
#[test]
fn test_tiered_view_above_threshold() {
    let (components, tree) = build_repo(301); // 602 total > 500
    let ids = tree["alpha"].components.clone();
    let prompt = format_user_prompt("alpha", &ids, &components, &tree);

    assert!(
        prompt.contains("use list_module_components to view"),
        "sibling modules must be summarized"
    );
    assert!(prompt.contains("alpha (current module)"));

    // The line right under the current module header is its full listing,
    // never the summarized form.
    let lines: Vec<&str> = prompt.lines().collect();
    let header = lines
        .iter()
        .position(|l| l.contains("alpha (current module)"))
        .unwrap();
    assert!(lines[header + 1].contains("Core components:"));
    assert!(!lines[header + 1].contains("use list_module_components"));

    // The summarized sibling carries the count.
    assert!(prompt.contains("Components: 301 items (use list_module_components to view)"));
}

/// Below the threshold every module carries its full listing.
#[test]
fn test_full_view_below_threshold() {
    let (components, tree) = build_repo(10);
    let ids = tree["alpha"].components.clone();
    let prompt = format_user_prompt("alpha", &ids, &components, &tree);

    assert!(!prompt.contains("use list_module_components to view"));
    assert!(prompt.contains("alpha (current module)"));
    assert!(prompt.contains("beta.file0.Type0"), "siblings fully listed");
}
