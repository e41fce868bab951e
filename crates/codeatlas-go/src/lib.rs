use std::path::Path;

use anyhow::{Context, Result};
use tree_sitter::{Language, Node, Parser, Query, QueryCursor, StreamingIterator};

use codeatlas_core::analyzer::{enclosing_component, LanguageAnalyzer, ParsedFile};
use codeatlas_core::types::*;

/// Go built-in types and functions; references to these are dropped.
const GO_BUILTINS: &[&str] = &[
    "string", "int", "int8", "int16", "int32", "int64", "uint", "uint8", "uint16", "uint32",
    "uint64", "uintptr", "float32", "float64", "complex64", "complex128", "bool", "byte", "rune",
    "error", "any", "len", "cap", "new", "make", "append", "copy", "delete", "panic", "recover",
    "print", "println", "close", "min", "max", "clear", "nil",
];

/// Go language analyzer using tree-sitter.
pub struct GoAnalyzer {
    language: Language,
    struct_query: Query,
    interface_query: Query,
    function_query: Query,
    method_query: Query,
}

impl GoAnalyzer {
    pub fn new() -> Result<Self> {
        let language: Language = tree_sitter_go::LANGUAGE.into();

        let struct_query = Query::new(
            &language,
            r#"
            (type_declaration
              (type_spec
                name: (type_identifier) @name
                type: (struct_type))) @decl
            "#,
        )
        .context("failed to compile struct query")?;

        let interface_query = Query::new(
            &language,
            r#"
            (type_declaration
              (type_spec
                name: (type_identifier) @name
                type: (interface_type))) @decl
            "#,
        )
        .context("failed to compile interface query")?;

        let function_query = Query::new(
            &language,
            r#"
            (function_declaration
              name: (identifier) @name) @decl
            "#,
        )
        .context("failed to compile function query")?;

        let method_query = Query::new(
            &language,
            r#"
            (method_declaration
              receiver: (parameter_list
                (parameter_declaration
                  type: [(pointer_type (type_identifier) @receiver)
                         (type_identifier) @receiver]))
              name: (field_identifier) @name) @decl
            "#,
        )
        .context("failed to compile method query")?;

        Ok(Self {
            language,
            struct_query,
            interface_query,
            function_query,
            method_query,
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

impl LanguageAnalyzer for GoAnalyzer {
    fn language(&self) -> &'static str {
        "go"
    }

    fn file_extensions(&self) -> &[&str] {
        &["go"]
    }

    fn parse_file(&self, path: &Path, relative_path: &str, content: &str) -> Result<ParsedFile> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.language)
            .context("failed to set Go language")?;
        let tree = parser
            .parse(content, None)
            .context("failed to parse Go file")?;
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
        self.collect_declarations(
            &self.interface_query,
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
        self.collect_declarations(&self.method_query, parsed, ComponentKind::Method, &mut components);
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

/// Recursively walk the tree collecting call targets, struct field types and
/// embedded types, attributed to the innermost enclosing component.
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
                    push_reference(node, &callee, parsed, components, references);
                }
            }
            "field_declaration" => {
                // Struct field (named) or embedded type (anonymous).
                for ty in type_identifiers_in(node, &parsed.content) {
                    push_reference(node, &ty, parsed, components, references);
                }
            }
            "type_elem" => {
                // Interface embedding: `type R interface { io.Reader }`.
                for ty in type_identifiers_in(node, &parsed.content) {
                    push_reference(node, &ty, parsed, components, references);
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

/// The called name: bare identifier, or the selector field for `x.Method`.
fn call_target(node: Node, source: &str) -> Option<String> {
    let func = node.child_by_field_name("function")?;
    match func.kind() {
        "identifier" => Some(node_text(func, source)),
        "selector_expression" => func
            .child_by_field_name("field")
            .map(|f| node_text(f, source)),
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

fn push_reference(
    node: Node,
    callee: &str,
    parsed: &ParsedFile,
    components: &[Component],
    references: &mut Vec<RawReference>,
) {
    if callee.is_empty() || GO_BUILTINS.contains(&callee) {
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
