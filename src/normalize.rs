use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::ModelError;

pub const REVIEW_HEADER: &str = "## AI Code Review";
pub const ATTRIBUTION_FOOTER: &str = "*This review was generated automatically by ai-review.*";

const EMPTY_RESPONSE_MESSAGE: &str = "AI returned empty response after processing";

/// Non-greedy so that two reasoning blocks in one reply do not swallow the
/// answer between them. `<think>`/`<thinking>` open and close tags are both
/// accepted because providers disagree on the tag name.
static REASONING_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<think(?:ing)?>.*?</think(?:ing)?>").expect("reasoning block regex compiles")
});

/// A flat brace-delimited span (no nested braces) containing a "review" key.
static EMBEDDED_REVIEW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{[^{}]*"review"[^{}]*\}"#).expect("embedded review regex compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Uncertain,
}

impl Verdict {
    fn from_raw(value: Option<&str>) -> Self {
        match value.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
            Some("pass") => Self::Pass,
            Some("fail") => Self::Fail,
            _ => Self::Uncertain,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewResult {
    pub review: String,
    #[serde(rename = "fail_pass_workflow")]
    pub verdict: Verdict,
    pub labels_added: Vec<String>,
}

impl ReviewResult {
    /// Envelope for a failed provider exchange. The ladder never runs for
    /// these; the error detail becomes the visible review body.
    pub fn from_model_error(error: &ModelError) -> Self {
        let mut body = format!(
            "The review request to the model provider failed.\n\n> {}",
            error.message
        );
        if let Some(code) = &error.code {
            body.push_str(&format!("\n\nError code: `{code}`"));
        }
        build_result(&body, Verdict::Uncertain, Vec::new())
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("failed to serialize review result")
    }
}

enum StageOutcome {
    Matched(ReviewResult),
    NoMatch,
}

/// Turn whatever the model returned into a well-formed review envelope.
///
/// Ordered fallback ladder; the first stage that produces a result wins:
/// reasoning-block stripping and fence stripping always run, then strict
/// JSON parse, embedded-object recovery, plain-text wrap, and finally the
/// empty-response fallback. Total: this function always returns a value.
pub fn normalize(raw: &str) -> ReviewResult {
    let stripped = strip_reasoning_blocks(raw);
    let unfenced = strip_json_fence(&stripped);
    let trimmed = unfenced.trim();

    if trimmed.is_empty() {
        return empty_response_fallback();
    }

    if let StageOutcome::Matched(result) = parse_strict(trimmed) {
        return result;
    }

    if let StageOutcome::Matched(result) = recover_embedded_object(trimmed) {
        return result;
    }

    wrap_plain_text(trimmed)
}

fn strip_reasoning_blocks(raw: &str) -> String {
    REASONING_BLOCK_RE
        .replace_all(raw, "")
        .trim_start()
        .to_string()
}

/// Drop a leading ```json fence line and its matching closing fence line,
/// keeping the body between them. Anything that does not start with a JSON
/// fence passes through untouched; an unterminated fence keeps the body.
fn strip_json_fence(text: &str) -> String {
    let trimmed = text.trim_start();
    let Some(opener_end) = trimmed.find('\n') else {
        return text.to_string();
    };
    if !trimmed[..opener_end].trim_end().eq_ignore_ascii_case("```json") {
        return text.to_string();
    }

    let body = &trimmed[opener_end + 1..];
    match body.rfind("```") {
        Some(idx) if body[idx + 3..].trim().is_empty() => body[..idx].to_string(),
        _ => body.to_string(),
    }
}

fn parse_strict(text: &str) -> StageOutcome {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => review_from_value(&value),
        Err(_) => StageOutcome::NoMatch,
    }
}

fn recover_embedded_object(text: &str) -> StageOutcome {
    let Some(candidate) = EMBEDDED_REVIEW_RE.find(text) else {
        return StageOutcome::NoMatch;
    };

    match serde_json::from_str::<Value>(candidate.as_str()) {
        Ok(value) => review_from_value(&value),
        Err(_) => StageOutcome::NoMatch,
    }
}

/// Accept a parsed payload only when `review` is a non-empty string. An
/// empty review counts as a failed parse so a later stage can still salvage
/// visible output. Missing verdict and labels take their defaults.
fn review_from_value(value: &Value) -> StageOutcome {
    let Some(object) = value.as_object() else {
        return StageOutcome::NoMatch;
    };
    let Some(review) = object.get("review").and_then(Value::as_str) else {
        return StageOutcome::NoMatch;
    };
    if review.trim().is_empty() {
        return StageOutcome::NoMatch;
    }

    let verdict = Verdict::from_raw(object.get("fail_pass_workflow").and_then(Value::as_str));
    let labels_added = object
        .get("labels_added")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    StageOutcome::Matched(build_result(review, verdict, labels_added))
}

fn wrap_plain_text(text: &str) -> ReviewResult {
    build_result(text, Verdict::Uncertain, Vec::new())
}

fn empty_response_fallback() -> ReviewResult {
    build_result(EMPTY_RESPONSE_MESSAGE, Verdict::Uncertain, Vec::new())
}

fn build_result(body: &str, verdict: Verdict, labels_added: Vec<String>) -> ReviewResult {
    ReviewResult {
        review: ensure_footer(&ensure_header(body)),
        verdict,
        labels_added,
    }
}

fn ensure_header(body: &str) -> String {
    if body.trim_start().starts_with(REVIEW_HEADER) {
        body.to_string()
    } else {
        format!("{REVIEW_HEADER}\n\n{body}")
    }
}

fn ensure_footer(body: &str) -> String {
    if body.contains(ATTRIBUTION_FOOTER) {
        body.to_string()
    } else {
        format!("{}\n\n---\n{ATTRIBUTION_FOOTER}", body.trim_end())
    }
}
