use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-token pricing in dollars per million tokens, keyed by model-name
/// prefix. Longest matching prefix wins.
const PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1", 2.00, 8.00),
    ("gemini-2.0-flash", 0.10, 0.40),
    ("gemini-1.5-pro", 1.25, 5.00),
    ("gemini-1.5-flash", 0.075, 0.30),
];

/// Pricing assumed for models absent from the table: a mid-range default so
/// totals stay plausible rather than silently zero.
const DEFAULT_PRICE: (f64, f64) = (1.00, 4.00);

/// Price one call. Computed once, at record time.
pub fn price_call(model: &str, prompt_tokens: usize, completion_tokens: usize) -> f64 {
    let (input, output) = PRICING
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(DEFAULT_PRICE);
    (prompt_tokens as f64 * input + completion_tokens as f64 * output) / 1_000_000.0
}

/// Record of a single chat completion, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub model: String,
    pub stage: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub duration: Duration,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Totals {
    pub calls: usize,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub cost: f64,
}

#[derive(Default)]
struct AccountantState {
    stage: String,
    calls: Vec<LlmCall>,
}

/// Append-only log of LLM calls with a current stage label.
///
/// Passed explicitly (usually behind an `Arc`) instead of living as a process
/// global, so tests can own their accountant.
#[derive(Default)]
pub struct TokenAccountant {
    state: Mutex<AccountantState>,
}

impl TokenAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AccountantState> {
        // Recover the inner state on poison; the log is append-only.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_stage(&self, label: impl Into<String>) {
        self.lock().stage = label.into();
    }

    pub fn current_stage(&self) -> String {
        self.lock().stage.clone()
    }

    /// Record a completed call. The stage label is the one current at record
    /// time and the cost is derived here, never retroactively.
    pub fn record(
        &self,
        model: &str,
        prompt_tokens: usize,
        completion_tokens: usize,
        duration: Duration,
        error: Option<String>,
    ) {
        let mut state = self.lock();
        let stage = state.stage.clone();
        // Failed calls are still billed for their prompt.
        let completion_tokens = if error.is_some() { 0 } else { completion_tokens };
        state.calls.push(LlmCall {
            model: model.to_string(),
            stage,
            prompt_tokens,
            completion_tokens,
            duration,
            success: error.is_none(),
            cost: price_call(model, prompt_tokens, completion_tokens),
            error,
        });
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn calls(&self) -> Vec<LlmCall> {
        self.lock().calls.clone()
    }

    pub fn totals(&self) -> Totals {
        let state = self.lock();
        fold(state.calls.iter())
    }

    pub fn stage_totals(&self) -> BTreeMap<String, Totals> {
        let state = self.lock();
        let mut by_stage: BTreeMap<String, Totals> = BTreeMap::new();
        for call in &state.calls {
            let entry = by_stage.entry(call.stage.clone()).or_default();
            entry.calls += 1;
            entry.prompt_tokens += call.prompt_tokens;
            entry.completion_tokens += call.completion_tokens;
            entry.cost += call.cost;
        }
        by_stage
    }

    /// Human-readable end-of-run summary.
    pub fn summary(&self) -> String {
        let totals = self.totals();
        let mut out = String::new();
        let _ = writeln!(out, "LLM usage summary");
        let _ = writeln!(out, "-----------------");
        for (stage, t) in self.stage_totals() {
            let _ = writeln!(
                out,
                "{stage}: {} calls, {} prompt + {} completion tokens, ${:.4}",
                t.calls, t.prompt_tokens, t.completion_tokens, t.cost
            );
        }
        let _ = writeln!(
            out,
            "total: {} calls, {} prompt + {} completion tokens, ${:.4}",
            totals.calls, totals.prompt_tokens, totals.completion_tokens, totals.cost
        );
        out
    }
}

fn fold<'a>(calls: impl Iterator<Item = &'a LlmCall>) -> Totals {
    let mut totals = Totals::default();
    for call in calls {
        totals.calls += 1;
        totals.prompt_tokens += call.prompt_tokens;
        totals.completion_tokens += call.completion_tokens;
        totals.cost += call.cost;
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_prefix_matching() {
        // Dated model names match their family prefix.
        let dated = price_call("gpt-4o-2024-08-06", 1_000_000, 0);
        assert!((dated - 2.50).abs() < 1e-9);
        // The mini prefix is longer and must win over the family prefix.
        let mini = price_call("gpt-4o-mini-2024-07-18", 1_000_000, 0);
        assert!((mini - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_uses_default_price() {
        let cost = price_call("mystery-model", 1_000_000, 1_000_000);
        assert!((cost - 5.00).abs() < 1e-9);
    }

    #[test]
    fn test_failed_call_charges_prompt_only() {
        let accountant = TokenAccountant::new();
        accountant.set_stage("Stage 2: Module Clustering");
        accountant.record(
            "gpt-4o",
            1000,
            500,
            Duration::from_secs(1),
            Some("rate limited".to_string()),
        );
        let calls = accountant.calls();
        assert_eq!(calls[0].prompt_tokens, 1000);
        assert_eq!(calls[0].completion_tokens, 0);
        assert!(!calls[0].success);
        assert!(calls[0].cost > 0.0);
    }

    #[test]
    fn test_cost_conservation_across_stages() {
        let accountant = TokenAccountant::new();
        accountant.set_stage("Stage 2: Module Clustering");
        accountant.record("gpt-4o-mini", 100, 50, Duration::from_secs(1), None);
        accountant.record("gpt-4o-mini", 200, 80, Duration::from_secs(1), None);
        accountant.set_stage("Stage 4: Module Documentation");
        accountant.record("gpt-4o", 5000, 1000, Duration::from_secs(2), None);

        let per_call: f64 = accountant.calls().iter().map(|c| c.cost).sum();
        let per_stage: f64 = accountant.stage_totals().values().map(|t| t.cost).sum();
        let total = accountant.totals().cost;
        assert!((per_call - per_stage).abs() < 1e-12);
        assert!((per_call - total).abs() < 1e-12);
    }

    #[test]
    fn test_stage_label_captured_at_record_time() {
        let accountant = TokenAccountant::new();
        accountant.set_stage("a");
        accountant.record("m", 1, 1, Duration::ZERO, None);
        accountant.set_stage("b");
        accountant.record("m", 1, 1, Duration::ZERO, None);
        let stages = accountant.stage_totals();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages["a"].calls, 1);
        assert_eq!(stages["b"].calls, 1);
    }

    #[test]
    fn test_summary_mentions_totals() {
        let accountant = TokenAccountant::new();
        accountant.set_stage("Stage 2: Module Clustering");
        accountant.record("gpt-4o", 10, 5, Duration::ZERO, None);
        let summary = accountant.summary();
        assert!(summary.contains("Stage 2"));
        assert!(summary.contains("total: 1 calls"));
    }
}
