use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Unique identifier for a component: `<module_path>.<qualified_name>`,
/// e.g. `src.server.router.Router` or `pkg.store.Store.Get`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub String);

impl ComponentId {
    pub fn new(module_path: &str, qualified_name: &str) -> Self {
        Self(format!("{module_path}.{qualified_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final segment of the dotted id (the bare component name).
    pub fn short_name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the dotted module path for a repo-relative file path:
/// separators become dots and the final extension is stripped.
/// e.g. `src/server/router.go` -> `src.server.router`
pub fn module_path_of(relative_path: &str) -> String {
    let normalized = relative_path.replace('\\', "/");
    let without_ext = match normalized.rfind('.') {
        Some(idx) if idx > normalized.rfind('/').map_or(0, |s| s + 1) => &normalized[..idx],
        _ => normalized.as_str(),
    };
    without_ext.replace('/', ".")
}

/// Kind of extracted code component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Class,
    Interface,
    Struct,
    Function,
    Method,
}

impl ComponentKind {
    /// Kinds eligible for leaf selection. `Function` is admitted only when a
    /// repository has none of these (C-style codebases); see graph::extract_leaves.
    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            ComponentKind::Class | ComponentKind::Interface | ComponentKind::Struct
        )
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Class => write!(f, "class"),
            ComponentKind::Interface => write!(f, "interface"),
            ComponentKind::Struct => write!(f, "struct"),
            ComponentKind::Function => write!(f, "function"),
            ComponentKind::Method => write!(f, "method"),
        }
    }
}

/// A code component extracted by a language analyzer.
/// Immutable after Stage 1; `source_code` is the exact declaration text and
/// is reproduced verbatim in prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    pub name: String,
    pub kind: ComponentKind,
    pub file_path: PathBuf,
    pub relative_path: String,
    pub source_code: String,
    pub start_line: usize,
    pub end_line: usize,
}

/// A raw reference emitted by an analyzer before resolution: the caller is a
/// known component, the callee is only a name. The graph builder turns these
/// into edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReference {
    pub caller: ComponentId,
    pub callee_name: String,
    pub line: usize,
}

/// A directed dependency edge. `resolved` is true iff the callee exists in
/// the component table; unresolved edges are retained for the artifact but
/// ignored for leaf detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub caller: ComponentId,
    pub callee: ComponentId,
    pub line: usize,
    pub resolved: bool,
}
