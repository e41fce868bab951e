pub mod client;
pub mod counter;
pub mod error;
pub mod types;
pub mod usage;

pub use client::{default_max_output_tokens, ChatProvider, HttpLlmClient};
pub use counter::count_tokens;
pub use error::LlmError;
pub use types::{ChatMessage, ChatTurn, ToolCall, ToolDef, Usage};
pub use usage::{price_call, LlmCall, TokenAccountant, Totals};
