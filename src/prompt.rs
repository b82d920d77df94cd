use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::config::LlmConfig;
use crate::diff::DiffData;
use crate::github::ReviewContext;
use crate::llm::truncate_text;

const EMBEDDED_PROMPT_SYSTEM: &str = include_str!("../prompts/system.txt");
const EMBEDDED_PROMPT_OUTPUT_CONTRACT: &str = include_str!("../prompts/output_contract.json");

/// Each comment quoted into the prompt is clamped to keep long threads from
/// crowding out the diff.
const MAX_COMMENT_CHARS_PER_PROMPT_ENTRY: usize = 400;

#[derive(Debug, Clone)]
pub struct PromptPack {
    pub system: String,
    pub output_contract: String,
}

#[derive(Debug, Clone)]
pub struct ReviewPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

pub fn load_prompt_pack(config: &LlmConfig) -> anyhow::Result<PromptPack> {
    Ok(PromptPack {
        system: read_prompt_file(&config.prompt_system_file)?,
        output_contract: read_prompt_file(&config.prompt_output_contract_file)?,
    })
}

fn read_prompt_file(path: &str) -> anyhow::Result<String> {
    match fs::read_to_string(Path::new(path)) {
        Ok(content) => Ok(content),
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound
                && let Some(embedded) = embedded_prompt_for_path(path)
            {
                return Ok(embedded.to_string());
            }
            Err(err).with_context(|| format!("failed to read prompt file '{}'", path))
        }
    }
}

fn embedded_prompt_for_path(path: &str) -> Option<&'static str> {
    let normalized = path.trim().replace('\\', "/");
    let mut key = normalized.as_str();
    while let Some(stripped) = key.strip_prefix("./") {
        key = stripped;
    }

    match key {
        "prompts/system.txt" => Some(EMBEDDED_PROMPT_SYSTEM),
        "prompts/output_contract.json" => Some(EMBEDDED_PROMPT_OUTPUT_CONTRACT),
        _ => None,
    }
}

/// Assemble the two prompt halves. The system half carries the reviewer
/// instructions and the output contract; the user half carries the PR
/// context (when running against a real PR) and the diff.
pub fn build_review_prompt(
    pack: &PromptPack,
    context: Option<&ReviewContext>,
    diff: &DiffData,
) -> ReviewPrompt {
    let system_prompt = format!(
        "{}\n\nRespond with a single JSON object matching this contract, and nothing else:\n{}",
        pack.system.trim_end(),
        pack.output_contract.trim_end()
    );

    let mut user_prompt = String::new();
    if let Some(context) = context {
        push_pr_section(&mut user_prompt, context);
        push_check_run_section(&mut user_prompt, context);
        push_comment_section(&mut user_prompt, context);
    }

    user_prompt.push_str(&format!(
        "Diff stats: added={}, removed={}, files_changed={}\n\n",
        diff.total_added,
        diff.total_removed,
        diff.files.len()
    ));
    user_prompt.push_str("Unified diff under review:\n```diff\n");
    user_prompt.push_str(diff.text.trim_end());
    user_prompt.push_str("\n```\n");

    ReviewPrompt {
        system_prompt,
        user_prompt,
    }
}

fn push_pr_section(out: &mut String, context: &ReviewContext) {
    let pr = &context.pr;
    out.push_str(&format!(
        "Pull request #{} targeting '{}'\n",
        pr.number, pr.base_branch
    ));
    out.push_str(&format!("Title: {}\n", pr.title));
    out.push_str(&format!("Author: {}\n", pr.author_login));
    if pr.draft {
        out.push_str("State: draft\n");
    }
    if !pr.labels.is_empty() {
        out.push_str(&format!("Labels: {}\n", pr.labels.join(", ")));
    }
    out.push('\n');
}

fn push_check_run_section(out: &mut String, context: &ReviewContext) {
    if context.check_runs.is_empty() {
        return;
    }

    out.push_str("Check runs:\n");
    for run in &context.check_runs {
        let outcome = run.conclusion.as_deref().unwrap_or(&run.status);
        out.push_str(&format!("- {}: {}\n", run.name, outcome));
    }
    out.push('\n');
}

fn push_comment_section(out: &mut String, context: &ReviewContext) {
    if context.comments.is_empty() {
        return;
    }

    out.push_str("Recent discussion:\n");
    for comment in &context.comments {
        out.push_str(&format!(
            "- {}: {}\n",
            comment.author,
            truncate_text(
                comment.body.replace('\n', " ").trim(),
                MAX_COMMENT_CHARS_PER_PROMPT_ENTRY
            )
        ));
    }
    out.push('\n');
}
