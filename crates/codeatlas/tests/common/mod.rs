#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use codeatlas_llm::{ChatMessage, ChatProvider, ChatTurn, LlmError, ToolCall, ToolDef};

/// Scripted stand-in for the HTTP client: tests queue completions and chat
/// turns; defaults keep unscripted flows moving.
#[derive(Default)]
pub struct StubProvider {
    completions: Mutex<VecDeque<String>>,
    turns: Mutex<VecDeque<ChatTurn>>,
    pub complete_calls: AtomicUsize,
    pub chat_calls: AtomicUsize,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&self, response: &str) {
        self.completions
            .lock()
            .unwrap()
            .push_back(response.to_string());
    }

    pub fn push_turn(&self, turn: ChatTurn) {
        self.turns.lock().unwrap().push_back(turn);
    }

    pub fn text_turn(text: &str) -> ChatTurn {
        ChatTurn {
            text: Some(text.to_string()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_turn(name: &str, arguments: Value) -> ChatTurn {
        ChatTurn {
            text: None,
            tool_calls: vec![ToolCall {
                id: format!("call_{name}"),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
        }
    }

    pub fn create_doc_turn(file: &str, content: &str) -> ChatTurn {
        Self::tool_turn(
            "str_replace_editor",
            serde_json::json!({"command": "create", "path": file, "file_text": content}),
        )
    }
}

#[async_trait]
impl ChatProvider for StubProvider {
    async fn complete(
        &self,
        _prompt: &str,
        _model: &str,
        _max_output_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "lol".to_string()))
    }

    async fn chat(
        &self,
        _system: &str,
        _messages: &[ChatMessage],
        _tools: &[ToolDef],
        _model: &str,
        _max_output_tokens: Option<u32>,
    ) -> Result<ChatTurn, LlmError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Self::text_turn("Documentation complete.")))
    }
}
