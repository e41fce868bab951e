use std::path::{Path, PathBuf};

use anyhow::Result;
use tree_sitter::Tree;

use crate::types::{Component, RawReference};

/// A parsed source file with its tree-sitter AST and original content.
pub struct ParsedFile {
    pub path: PathBuf,
    pub relative_path: String,
    pub tree: Tree,
    pub content: String,
}

/// Trait that each language analyzer must implement.
///
/// Analyzers are pure: a fixed file yields the same components and references
/// on every run. They never raise on malformed source; a parse error returns
/// `Err` from `parse_file` and the pipeline skips the file.
pub trait LanguageAnalyzer: Send + Sync {
    /// Language name (e.g., "go", "rust")
    fn language(&self) -> &'static str;

    /// File extensions this analyzer handles (e.g., &["go"])
    fn file_extensions(&self) -> &[&str];

    /// Parse a source file into a ParsedFile.
    fn parse_file(&self, path: &Path, relative_path: &str, content: &str) -> Result<ParsedFile>;

    /// Extract named components (classes, interfaces, structs, functions,
    /// methods) from a parsed file. Anonymous and local declarations are
    /// skipped; `source_code` holds the exact declaration text.
    fn extract_components(&self, parsed: &ParsedFile) -> Vec<Component>;

    /// Extract raw references (calls, field types, base types, embeddings)
    /// attributed to the enclosing component. Built-in targets are dropped.
    fn extract_references(&self, parsed: &ParsedFile, components: &[Component])
        -> Vec<RawReference>;
}

/// Find the component whose source span contains the given line, preferring
/// the innermost (shortest) span. Shared by analyzers to attribute call
/// sites to their enclosing declaration.
pub fn enclosing_component(components: &[Component], line: usize) -> Option<&Component> {
    components
        .iter()
        .filter(|c| c.start_line <= line && line <= c.end_line)
        .min_by_key(|c| c.end_line - c.start_line)
}
