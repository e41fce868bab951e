pub mod diagram;
pub mod markdown;
pub mod metadata;

pub use diagram::{check_diagram, children_diagram, mermaid_blocks, sanitize_mermaid_id, tree_diagram};
pub use markdown::{
    first_heading_summary, is_quick_overview, parent_overview, quick_overview, ChildDoc,
    QUICK_OVERVIEW_MARKER,
};
pub use metadata::Metadata;
