use std::path::Path;

use anyhow::{Context, Result};
use tree_sitter::{Language, Node, Parser, Query, QueryCursor, StreamingIterator};

use codeatlas_core::analyzer::{enclosing_component, LanguageAnalyzer, ParsedFile};
use codeatlas_core::types::*;

/// Built-in and host types; references to these are dropped.
const TS_BUILTINS: &[&str] = &[
    "string", "number", "boolean", "any", "void", "unknown", "never", "object", "undefined",
    "null", "Array", "Promise", "Map", "Set", "WeakMap", "WeakSet", "Record", "Partial",
    "Required", "Readonly", "Pick", "Omit", "Date", "Error", "RegExp", "Function", "Symbol",
    "console", "JSON", "Math", "Object", "String", "Number", "Boolean", "require", "parseInt",
    "parseFloat", "fetch", "setTimeout", "setInterval", "clearTimeout", "clearInterval",
    "structuredClone", "isNaN",
];

/// TypeScript language analyzer using tree-sitter.
pub struct TypeScriptAnalyzer {
    language: Language,
    class_query: Query,
    interface_query: Query,
    function_query: Query,
    method_query: Query,
}

impl TypeScriptAnalyzer {
    pub fn new() -> Result<Self> {
        let language: Language = tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into();

        let class_query = Query::new(
            &language,
            r#"
            (class_declaration name: (type_identifier) @name) @decl
            (abstract_class_declaration name: (type_identifier) @name) @decl
            "#,
        )
        .context("failed to compile class query")?;

        let interface_query = Query::new(
            &language,
            r#"
            (interface_declaration name: (type_identifier) @name) @decl
            "#,
        )
        .context("failed to compile interface query")?;

        let function_query = Query::new(
            &language,
            r#"
            (function_declaration name: (identifier) @name) @decl
            "#,
        )
        .context("failed to compile function query")?;

        let method_query = Query::new(
            &language,
            r#"
            (class_declaration
              name: (type_identifier) @receiver
              body: (class_body
                (method_definition name: (property_identifier) @name) @decl))
            "#,
        )
        .context("failed to compile method query")?;

        Ok(Self {
            language,
            class_query,
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
                if receiver.is_empty() || name == "constructor" {
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

impl LanguageAnalyzer for TypeScriptAnalyzer {
    fn language(&self) -> &'static str {
        "typescript"
    }

    fn file_extensions(&self) -> &[&str] {
        &["ts"]
    }

    fn parse_file(&self, path: &Path, relative_path: &str, content: &str) -> Result<ParsedFile> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.language)
            .context("failed to set TypeScript language")?;
        let tree = parser
            .parse(content, None)
            .context("failed to parse TypeScript file")?;
        Ok(ParsedFile {
            path: path.to_path_buf(),
            relative_path: relative_path.to_string(),
            tree,
            content: content.to_string(),
        })
    }

    fn extract_components(&self, parsed: &ParsedFile) -> Vec<Component> {
        let mut components = Vec::new();
        self.collect_declarations(&self.class_query, parsed, ComponentKind::Class, &mut components);
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
            "new_expression" => {
                if let Some(ctor) = node.child_by_field_name("constructor") {
                    if ctor.kind() == "identifier" {
                        push_reference(node, &node_text(ctor, &parsed.content), parsed, components, references);
                    }
                }
            }
            // Class member and interface property type annotations.
            "public_field_definition" | "property_signature" => {
                for ty in type_identifiers_in(node, &parsed.content) {
                    push_reference(node, &ty, parsed, components, references);
                }
            }
            // `extends` / `implements` clauses sit inside the class span, so
            // the enclosing-component lookup attributes them to the class.
            "extends_clause" | "implements_clause" | "extends_type_clause" => {
                for ty in heritage_names(node, &parsed.content) {
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

fn call_target(node: Node, source: &str) -> Option<String> {
    let func = node.child_by_field_name("function")?;
    match func.kind() {
        "identifier" => Some(node_text(func, source)),
        "member_expression" => func
            .child_by_field_name("property")
            .map(|p| node_text(p, source)),
        _ => None,
    }
}

fn heritage_names(node: Node, source: &str) -> Vec<String> {
    let mut out = Vec::new();
    for i in 0..node.child_count() as u32 {
        if let Some(child) = node.child(i) {
            match child.kind() {
                "identifier" | "type_identifier" => out.push(node_text(child, source)),
                "generic_type" => {
                    if let Some(name) = child.child_by_field_name("name") {
                        out.push(node_text(name, source));
                    }
                }
                _ => {}
            }
        }
    }
    out
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
    if callee.is_empty() || TS_BUILTINS.contains(&callee) {
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
