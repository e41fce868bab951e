use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::counter::count_tokens;
use crate::error::LlmError;
use crate::types::{ChatMessage, ChatTurn, ToolCall, ToolDef, Usage};
use crate::usage::TokenAccountant;

const REQUEST_TIMEOUT_SECS: u64 = 180;
const MAX_ATTEMPTS: u32 = 3;
const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Default output budget: 16 384 for the gpt-4o family, 32 768 otherwise.
pub fn default_max_output_tokens(model: &str) -> u32 {
    if model.starts_with("gpt-4o") {
        16_384
    } else {
        32_768
    }
}

/// Seam between the orchestration layers and the actual HTTP client, so tests
/// can script responses.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Plain completion at temperature 0. One `LlmCall` is recorded whether
    /// or not the call succeeds.
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        max_output_tokens: Option<u32>,
    ) -> Result<String, LlmError>;

    /// One tool-calling turn against the model.
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        model: &str,
        max_output_tokens: Option<u32>,
    ) -> Result<ChatTurn, LlmError>;
}

/// HTTP chat-completion client. OpenAI-compatible by default; model names
/// containing "gemini" are routed to the native Gemini API.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    accountant: Arc<TokenAccountant>,
}

impl HttpLlmClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        accountant: Arc<TokenAccountant>,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            accountant,
        })
    }

    fn is_gemini(model: &str) -> bool {
        model.contains("gemini")
    }

    /// Issue one turn with retry on transient failures, recording exactly one
    /// `LlmCall` for the whole logical request.
    async fn request_turn(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        model: &str,
        max_output_tokens: u32,
    ) -> Result<ChatTurn, LlmError> {
        let started = Instant::now();
        let prompt_estimate = estimate_prompt_tokens(system, messages);

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let result = if Self::is_gemini(model) {
                self.gemini_turn(system, messages, tools, model, max_output_tokens)
                    .await
            } else {
                self.openai_turn(system, messages, tools, model, max_output_tokens)
                    .await
            };
            match result {
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    warn!(model, attempt, "llm call failed ({err}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                }
                other => break other,
            }
        };

        let duration = started.elapsed();
        match outcome {
            Ok((turn, usage)) => {
                let prompt_tokens = if usage.prompt_tokens > 0 {
                    usage.prompt_tokens
                } else {
                    prompt_estimate
                };
                let completion_tokens = if usage.completion_tokens > 0 {
                    usage.completion_tokens
                } else {
                    turn.text.as_deref().map(count_tokens).unwrap_or(0)
                };
                self.accountant
                    .record(model, prompt_tokens, completion_tokens, duration, None);
                Ok(turn)
            }
            Err(err) => {
                self.accountant.record(
                    model,
                    prompt_estimate,
                    0,
                    duration,
                    Some(err.to_string()),
                );
                Err(err)
            }
        }
    }

    async fn openai_turn(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        model: &str,
        max_output_tokens: u32,
    ) -> Result<(ChatTurn, Usage), LlmError> {
        let mut wire_messages: Vec<Value> = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            wire_messages.push(json!({"role": "system", "content": system}));
        }
        for message in messages {
            wire_messages.push(openai_message(message));
        }

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "temperature": 0,
            "max_tokens": max_output_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(openai_tool).collect());
        }

        debug!(model, "openai-compatible request");
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), &text));
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        Ok((
            ChatTurn {
                text: choice.message.content,
                tool_calls,
            },
            parsed.usage.unwrap_or_default(),
        ))
    }

    async fn gemini_turn(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        model: &str,
        max_output_tokens: u32,
    ) -> Result<(ChatTurn, Usage), LlmError> {
        let contents: Vec<Value> = messages.iter().map(gemini_content).collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": 0,
                "maxOutputTokens": max_output_tokens,
            },
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }

        debug!(model, "gemini request");
        let url = format!("{GEMINI_API_URL}/{model}:generateContent");
        let response = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), &text));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response has no candidates".to_string()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for (i, part) in candidate.content.parts.into_iter().enumerate() {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCall {
                    // Gemini has no call ids; synthesize stable ones per turn.
                    id: format!("call_{i}"),
                    name: call.name,
                    arguments: call.args.to_string(),
                });
            }
        }

        let usage = parsed
            .usage_metadata
            .map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
            })
            .unwrap_or_default();

        Ok((
            ChatTurn {
                text: if text.is_empty() { None } else { Some(text) },
                tool_calls,
            },
            usage,
        ))
    }
}

#[async_trait]
impl ChatProvider for HttpLlmClient {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        max_output_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        let max = max_output_tokens.unwrap_or_else(|| default_max_output_tokens(model));
        let messages = [ChatMessage::user(prompt)];
        let turn = self.request_turn("", &messages, &[], model, max).await?;
        turn.text
            .ok_or_else(|| LlmError::InvalidResponse("completion had no text".to_string()))
    }

    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        model: &str,
        max_output_tokens: Option<u32>,
    ) -> Result<ChatTurn, LlmError> {
        let max = max_output_tokens.unwrap_or_else(|| default_max_output_tokens(model));
        self.request_turn(system, messages, tools, model, max).await
    }
}

fn estimate_prompt_tokens(system: &str, messages: &[ChatMessage]) -> usize {
    let mut total = count_tokens(system);
    for message in messages {
        if let Some(content) = &message.content {
            total += count_tokens(content);
        }
        for call in &message.tool_calls {
            total += count_tokens(&call.arguments) + count_tokens(&call.name);
        }
    }
    total
}

fn classify_reqwest_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout {
            seconds: REQUEST_TIMEOUT_SECS,
        }
    } else {
        LlmError::Network(err)
    }
}

fn classify_http_error(status: u16, body: &str) -> LlmError {
    let lowered = body.to_lowercase();
    match status {
        401 | 403 => LlmError::AuthFailed(truncate(body, 200)),
        429 => LlmError::RateLimited {
            retry_after_secs: 30,
        },
        400 if lowered.contains("context_length") || lowered.contains("context length") => {
            LlmError::ContextLengthExceeded(truncate(body, 200))
        }
        _ => LlmError::Provider {
            status,
            message: truncate(body, 200),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

fn openai_message(message: &ChatMessage) -> Value {
    let mut out = json!({"role": message.role});
    if let Some(content) = &message.content {
        out["content"] = json!(content);
    } else {
        out["content"] = Value::Null;
    }
    if !message.tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {"name": tc.name, "arguments": tc.arguments},
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &message.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    out
}

fn openai_tool(tool: &ToolDef) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
    })
}

/// Map a chat message onto the Gemini content format.
fn gemini_content(message: &ChatMessage) -> Value {
    match message.role.as_str() {
        "assistant" => {
            let mut parts = Vec::new();
            if let Some(content) = &message.content {
                parts.push(json!({"text": content}));
            }
            for call in &message.tool_calls {
                let args: Value =
                    serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                parts.push(json!({"functionCall": {"name": call.name, "args": args}}));
            }
            json!({"role": "model", "parts": parts})
        }
        "tool" => {
            let name = message.name.clone().unwrap_or_default();
            let response = message.content.clone().unwrap_or_default();
            json!({
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        "name": name,
                        "response": {"content": response},
                    }
                }]
            })
        }
        _ => json!({
            "role": "user",
            "parts": [{"text": message.content.clone().unwrap_or_default()}]
        }),
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunctionCall,
}

#[derive(Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize, Default)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: usize,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_budgets() {
        assert_eq!(default_max_output_tokens("gpt-4o"), 16_384);
        assert_eq!(default_max_output_tokens("gpt-4o-mini"), 16_384);
        assert_eq!(default_max_output_tokens("gemini-2.0-flash"), 32_768);
        assert_eq!(default_max_output_tokens("llama-3.1-70b"), 32_768);
    }

    #[test]
    fn test_gemini_routing_by_model_name() {
        assert!(HttpLlmClient::is_gemini("gemini-2.0-flash"));
        assert!(HttpLlmClient::is_gemini("models/gemini-1.5-pro"));
        assert!(!HttpLlmClient::is_gemini("gpt-4o"));
    }

    #[test]
    fn test_http_error_classification() {
        assert!(matches!(
            classify_http_error(401, "bad key"),
            LlmError::AuthFailed(_)
        ));
        assert!(matches!(
            classify_http_error(429, "slow down"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_http_error(400, "maximum context_length is 128000"),
            LlmError::ContextLengthExceeded(_)
        ));
        assert!(matches!(
            classify_http_error(503, "overloaded"),
            LlmError::Provider { status: 503, .. }
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(LlmError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(LlmError::Timeout { seconds: 1 }.is_retryable());
        assert!(LlmError::Provider {
            status: 500,
            message: String::new()
        }
        .is_retryable());
        assert!(!LlmError::AuthFailed("x".to_string()).is_retryable());
        assert!(!LlmError::ContextLengthExceeded("x".to_string()).is_retryable());
    }

    #[test]
    fn test_openai_message_serialization() {
        let msg = ChatMessage::assistant(
            None,
            vec![ToolCall {
                id: "call_9".to_string(),
                name: "str_replace_editor".to_string(),
                arguments: r#"{"op":"create"}"#.to_string(),
            }],
        );
        let wire = openai_message(&msg);
        assert_eq!(wire["role"], "assistant");
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "str_replace_editor");
    }

    #[test]
    fn test_gemini_tool_result_mapping() {
        let msg = ChatMessage::tool_result("call_0", "read_code_components", "source text");
        let wire = gemini_content(&msg);
        assert_eq!(wire["role"], "user");
        assert_eq!(
            wire["parts"][0]["functionResponse"]["name"],
            "read_code_components"
        );
    }

    #[test]
    fn test_openai_response_parsing() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "read_code_components", "arguments": "{\"ids\":[]}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 16}
        }"#;
        let parsed: OpenAiResponse = serde_json::from_str(raw).unwrap();
        let usage = parsed.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 120);
        let calls = parsed.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "read_code_components");
    }

    #[test]
    fn test_gemini_response_parsing() {
        let raw = r#"{
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "done"},
                        {"functionCall": {"name": "list_module_components", "args": {"module_name": "core"}}}
                    ]
                }
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 4}
        }"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        let part = &parsed.candidates[0].content.parts[1];
        assert_eq!(
            part.function_call.as_ref().unwrap().name,
            "list_module_components"
        );
    }
}
