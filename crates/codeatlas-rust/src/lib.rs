use std::path::Path;

use anyhow::{Context, Result};
use tree_sitter::{Language, Node, Parser, Query, QueryCursor, StreamingIterator};

use codeatlas_core::analyzer::{enclosing_component, LanguageAnalyzer, ParsedFile};
use codeatlas_core::types::*;

/// Primitive types, std prelude names and macros; references to these are dropped.
const RUST_BUILTINS: &[&str] = &[
    "i8", "i16", "i32", "i64", "i128", "isize", "u8", "u16", "u32", "u64", "u128", "usize", "f32",
    "f64", "bool", "char", "str", "String", "Vec", "Option", "Result", "Box", "Rc", "Arc", "Cell",
    "RefCell", "HashMap", "HashSet", "BTreeMap", "BTreeSet", "VecDeque", "PathBuf", "Path",
    "Self", "self", "Some", "None", "Ok", "Err", "Default", "Clone", "Copy", "Debug", "Display",
    "From", "Into", "Iterator", "Send", "Sync", "Sized", "Drop", "Fn", "FnMut", "FnOnce",
    "println", "print", "eprintln", "format", "vec", "panic", "assert", "assert_eq", "write",
    "writeln", "todo", "unreachable", "matches", "drop",
];

/// Rust language analyzer using tree-sitter.
pub struct RustAnalyzer {
    language: Language,
    struct_query: Query,
    enum_query: Query,
    trait_query: Query,
    function_query: Query,
    impl_fn_query: Query,
}

impl RustAnalyzer {
    pub fn new() -> Result<Self> {
        let language: Language = tree_sitter_rust::LANGUAGE.into();

        let struct_query = Query::new(
            &language,
            r#"
            (struct_item name: (type_identifier) @name) @decl
            "#,
        )
        .context("failed to compile struct query")?;

        let enum_query = Query::new(
            &language,
            r#"
            (enum_item name: (type_identifier) @name) @decl
            "#,
        )
        .context("failed to compile enum query")?;

        let trait_query = Query::new(
            &language,
            r#"
            (trait_item name: (type_identifier) @name) @decl
            "#,
        )
        .context("failed to compile trait query")?;

        // Free functions: direct children of the file or of an inline module.
        let function_query = Query::new(
            &language,
            r#"
            (source_file (function_item name: (identifier) @name) @decl)
            (mod_item body: (declaration_list (function_item name: (identifier) @name) @decl))
            "#,
        )
        .context("failed to compile function query")?;

        let impl_fn_query = Query::new(
            &language,
            r#"
            (impl_item
              type: [(type_identifier) @receiver
                     (generic_type type: (type_identifier) @receiver)]
              body: (declaration_list
                (function_item name: (identifier) @name) @decl))
            "#,
        )
        .context("failed to compile impl query")?;

        Ok(Self {
            language,
            struct_query,
            enum_query,
            trait_query,
            function_query,
            impl_fn_query,
        })
    }

    fn collect_declarations(
        &self,
        query: &Query,
        parsed: &ParsedFile,
        kind: ComponentKind,
        components: &mut Vec<Component>,
    ) {
        let module_path = module_path_of(&parsed.relative_path);
        let mut cursor = QueryCursor::new();
        let name_idx = capture_index(query, "name");
        let decl_idx = capture_index(query, "decl");
        let receiver_idx = query
            .capture_names()
            .iter()
            .position(|n| *n == "receiver");

        let mut matches = cursor.matches(query, parsed.tree.root_node(), parsed.content.as_bytes());
        while let Some(m) = matches.next() {
            let mut name = String::new();
            let mut receiver = String::new();
            let mut decl: Option<Node> = None;

            for capture in m.captures {
                if capture.index as usize == name_idx {
                    name = node_text(capture.node, &parsed.content);
                } else if capture.index as usize == decl_idx {
                    decl = Some(capture.node);
                } else if Some(capture.index as usize) == receiver_idx {
                    receiver = node_text(capture.node, &parsed.content);
                }
            }

            let Some(decl) = decl else { continue };
            if name.is_empty() {
                continue;
            }
            let qualified = if kind == ComponentKind::Method {
                if receiver.is_empty() {
                    continue;
                }
                format!("{receiver}.{name}")
            } else {
                name.clone()
            };

            components.push(Component {
                id: ComponentId::new(&module_path, &qualified),
                name: qualified,
                kind,
                file_path: parsed.path.clone(),
                relative_path: parsed.relative_path.clone(),
                source_code: node_text(decl, &parsed.content),
                start_line: decl.start_position().row + 1,
                end_line: decl.end_position().row + 1,
            });
        }
    }
}

impl LanguageAnalyzer for RustAnalyzer {
    fn language(&self) -> &'static str {
        "rust"
    }

    fn file_extensions(&self) -> &[&str] {
        &["rs"]
    }

    fn parse_file(&self, path: &Path, relative_path: &str, content: &str) -> Result<ParsedFile> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.language)
            .context("failed to set Rust language")?;
        let tree = parser
            .parse(content, None)
            .context("failed to parse Rust file")?;
        Ok(ParsedFile {
            path: path.to_path_buf(),
            relative_path: relative_path.to_string(),
            tree,
            content: content.to_string(),
        })
    }

    fn extract_components(&self, parsed: &ParsedFile) -> Vec<Component> {
        let mut components = Vec::new();
        self.collect_declarations(&self.struct_query, parsed, ComponentKind::Struct, &mut components);
        self.collect_declarations(&self.enum_query, parsed, ComponentKind::Struct, &mut components);
        self.collect_declarations(
            &self.trait_query,
            parsed,
            ComponentKind::Interface,
            &mut components,
        );
        self.collect_declarations(
            &self.function_query,
            parsed,
            ComponentKind::Function,
            &mut components,
        );
        self.collect_declarations(&self.impl_fn_query, parsed, ComponentKind::Method, &mut components);
        components
    }

    fn extract_references(
        &self,
        parsed: &ParsedFile,
        components: &[Component],
    ) -> Vec<RawReference> {
        let mut references = Vec::new();
        let mut cursor = parsed.tree.walk();
        walk_for_references(&mut cursor, parsed, components, &mut references);
        references.sort_by(|a, b| (a.line, &a.callee_name).cmp(&(b.line, &b.callee_name)));
        references.dedup();
        references
    }
}

fn walk_for_references(
    cursor: &mut tree_sitter::TreeCursor,
    parsed: &ParsedFile,
    components: &[Component],
    references: &mut Vec<RawReference>,
) {
    loop {
        let node = cursor.node();

        match node.kind() {
            "call_expression" => {
                if let Some(callee) = call_target(node, &parsed.content) {
                    push_line_reference(node, &callee, parsed, components, references);
                }
            }
            "field_declaration" | "ordered_field_declaration_list" => {
                for ty in type_identifiers_in(node, &parsed.content) {
                    push_line_reference(node, &ty, parsed, components, references);
                }
            }
            "impl_item" => {
                // `impl Trait for Type` is an interface edge from Type to Trait.
                if let (Some(trait_node), Some(type_node)) = (
                    node.child_by_field_name("trait"),
                    node.child_by_field_name("type"),
                ) {
                    let trait_name = simple_type_name(trait_node, &parsed.content);
                    let type_name = simple_type_name(type_node, &parsed.content);
                    if let (Some(trait_name), Some(type_name)) = (trait_name, type_name) {
                        push_named_reference(
                            &type_name,
                            &trait_name,
                            node.start_position().row + 1,
                            components,
                            references,
                        );
                    }
                }
            }
            _ => {}
        }

        if cursor.goto_first_child() {
            walk_for_references(cursor, parsed, components, references);
            cursor.goto_parent();
        }
        if !cursor.goto_next_sibling() {
            break;
        }
    }
}

/// Called name for a call expression: bare identifier, method name of a
/// field expression, or the type segment of a `Type::assoc` path.
fn call_target(node: Node, source: &str) -> Option<String> {
    let func = node.child_by_field_name("function")?;
    match func.kind() {
        "identifier" => Some(node_text(func, source)),
        "field_expression" => func
            .child_by_field_name("field")
            .map(|f| node_text(f, source)),
        "scoped_identifier" => {
            // `Store::new` -> Store; `module::helper` -> helper.
            let path = func.child_by_field_name("path")?;
            let last_path_segment = node_text(path, source);
            let segment = last_path_segment
                .rsplit("::")
                .next()
                .unwrap_or(&last_path_segment)
                .to_string();
            if segment.chars().next().is_some_and(|c| c.is_uppercase()) {
                Some(segment)
            } else {
                func.child_by_field_name("name").map(|n| node_text(n, source))
            }
        }
        _ => None,
    }
}

fn simple_type_name(node: Node, source: &str) -> Option<String> {
    match node.kind() {
        "type_identifier" => Some(node_text(node, source)),
        "generic_type" => node
            .child_by_field_name("type")
            .and_then(|t| simple_type_name(t, source)),
        _ => None,
    }
}

fn type_identifiers_in(node: Node, source: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        if n.kind() == "type_identifier" {
            out.push(node_text(n, source));
        }
        for i in 0..n.child_count() as u32 {
            if let Some(child) = n.child(i) {
                stack.push(child);
            }
        }
    }
    out
}

fn push_line_reference(
    node: Node,
    callee: &str,
    parsed: &ParsedFile,
    components: &[Component],
    references: &mut Vec<RawReference>,
) {
    if callee.is_empty() || RUST_BUILTINS.contains(&callee) {
        return;
    }
    let line = node.start_position().row + 1;
    let Some(caller) = enclosing_component(components, line) else {
        return;
    };
    if caller.name == callee {
        return;
    }
    references.push(RawReference {
        caller: caller.id.clone(),
        callee_name: callee.to_string(),
        line,
    });
}

/// Reference attributed to a component found by bare name rather than by
/// source span (used for impl-trait edges, whose impl block lies outside the
/// type's declaration).
fn push_named_reference(
    caller_name: &str,
    callee: &str,
    line: usize,
    components: &[Component],
    references: &mut Vec<RawReference>,
) {
    if RUST_BUILTINS.contains(&callee) || caller_name == callee {
        return;
    }
    let Some(caller) = components.iter().find(|c| c.name == caller_name) else {
        return;
    };
    references.push(RawReference {
        caller: caller.id.clone(),
        callee_name: callee.to_string(),
        line,
    });
}

fn capture_index(query: &Query, name: &str) -> usize {
    query
        .capture_names()
        .iter()
        .position(|n| *n == name)
        .unwrap_or(0)
}

fn node_text(node: Node, source: &str) -> String {
    source[node.byte_range()].to_string()
}
