mod config;
mod diff;
mod filtering;
mod github;
mod llm;
mod normalize;
mod prompt;

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};

use crate::config::{AppConfig, DEFAULT_CONFIG_PATH};
use crate::diff::{DiffData, collect_diff, filter_and_measure, guess_base_ref, read_diff_input};
use crate::filtering::FileFilter;
use crate::github::{ReviewContext, collect_review_context};
use crate::llm::request_review;
use crate::normalize::{ReviewResult, normalize};
use crate::prompt::{build_review_prompt, load_prompt_pack};

#[cfg(test)]
pub(crate) fn test_global_lock() -> &'static std::sync::Mutex<()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Review the change set and emit the result envelope (default)
    Review,
    /// Validate merged configuration and exit
    ValidateConfig,
    /// Probe the configured model provider and exit
    ProbeProvider,
}

#[derive(Debug, Parser)]
#[command(
    name = "ai-review",
    version,
    about = "Collects PR context, requests an AI review, and emits a normalized JSON verdict",
    subcommand_value_name = "COMMAND"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<CliCommand>,

    #[arg(long, env = "AI_REVIEW_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Base ref to diff against when no diff file is provided
    #[arg(long, env = "AI_REVIEW_BASE_REF", global = true)]
    base_ref: Option<String>,

    /// Pre-computed unified diff to review; use '-' for stdin
    #[arg(long, env = "AI_REVIEW_DIFF_FILE", global = true)]
    diff_file: Option<PathBuf>,

    /// Also write the result envelope to this file
    #[arg(long, env = "AI_REVIEW_OUTPUT_FILE", global = true)]
    output_file: Option<PathBuf>,

    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    set: Vec<String>,
}

/// In PR mode the GitHub context comes from the Actions environment; local
/// mode reviews a diff with no collector metadata.
#[derive(Debug, Clone)]
enum Mode {
    Pr {
        event_path: String,
        repo: String,
        token: String,
    },
    Local,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_with_overrides(&cli.config, &cli.set)?;

    match cli.command.clone().unwrap_or(CliCommand::Review) {
        CliCommand::ValidateConfig => {
            println!("Config valid: {}", cli.config.display());
            Ok(())
        }
        CliCommand::ProbeProvider => run_probe(&config),
        CliCommand::Review => run_review(&cli, &config),
    }
}

fn resolve_mode() -> Mode {
    let event_path = std::env::var("GITHUB_EVENT_PATH");
    let repo = std::env::var("GITHUB_REPOSITORY");
    let token = std::env::var("GITHUB_TOKEN");

    match (event_path, repo, token) {
        (Ok(event_path), Ok(repo), Ok(token)) => Mode::Pr {
            event_path,
            repo,
            token,
        },
        _ => Mode::Local,
    }
}

fn run_review(cli: &Cli, config: &AppConfig) -> anyhow::Result<()> {
    // Pre-flight. Anything that fails up to the model call exits with a
    // plain-text error and no envelope; from the model call on, every path
    // emits exactly one envelope.
    llm::provider_api_key(&config.llm)?;
    let filter = FileFilter::from_config(&config.filters)?;

    let context = match resolve_mode() {
        Mode::Pr {
            event_path,
            repo,
            token,
        } => Some(collect_review_context(
            &token,
            &event_path,
            &repo,
            config.limits.max_comment_history,
        )?),
        Mode::Local => None,
    };

    let raw_diff = load_raw_diff(cli, context.as_ref())?;
    if raw_diff.trim().is_empty() {
        bail!("diff input is empty; nothing to review");
    }
    if raw_diff.len() > config.limits.max_diff_bytes {
        bail!(
            "diff input is {} bytes, which exceeds limits.max_diff_bytes={}",
            raw_diff.len(),
            config.limits.max_diff_bytes
        );
    }

    let diff = filter_and_measure(&raw_diff, &filter)?;
    if diff.text.trim().is_empty() {
        bail!("all changed files are excluded by filters; nothing to review");
    }

    let pack = load_prompt_pack(&config.llm)?;
    let prompt = build_review_prompt(&pack, context.as_ref(), &diff);

    let result = match request_review(&config.llm, &config.debug, &prompt) {
        Ok(raw) => normalize(&raw),
        Err(error) => {
            // The envelope still goes out; the non-zero exit tells the
            // workflow that the exchange itself failed.
            emit_result(cli, &ReviewResult::from_model_error(&error))?;
            bail!("model request failed: {error}");
        }
    };

    emit_result(cli, &result)
}

fn load_raw_diff(cli: &Cli, context: Option<&ReviewContext>) -> anyhow::Result<String> {
    if let Some(path) = &cli.diff_file {
        return read_diff_input(path);
    }

    let base_ref = if let Some(base) = &cli.base_ref {
        base.clone()
    } else if let Some(context) = context {
        context.pr.base_ref.clone()
    } else if let Some(guessed) = guess_base_ref() {
        guessed
    } else {
        bail!(
            "base ref not provided and no default remote branch was found (tried origin/main and origin/master)"
        );
    };

    collect_diff(&base_ref)
}

fn run_probe(config: &AppConfig) -> anyhow::Result<()> {
    llm::provider_api_key(&config.llm)?;
    let pack = load_prompt_pack(&config.llm)?;

    let probe_diff = DiffData {
        text: "diff --git a/probe.txt b/probe.txt\n+++ b/probe.txt\n@@ -0,0 +1 @@\n+probe\n"
            .to_string(),
        files: vec!["probe.txt".to_string()],
        total_added: 1,
        total_removed: 0,
    };
    let prompt = build_review_prompt(&pack, None, &probe_diff);

    match request_review(&config.llm, &config.debug, &prompt) {
        Ok(_) => {
            println!("LLM provider probe succeeded for '{}'.", config.llm.provider);
            Ok(())
        }
        Err(error) => bail!("provider probe failed: {error}"),
    }
}

fn emit_result(cli: &Cli, result: &ReviewResult) -> anyhow::Result<()> {
    let rendered = result.to_json()?;

    if let Some(path) = &cli.output_file {
        fs::write(path, &rendered)
            .with_context(|| format!("failed to write output file {}", path.display()))?;
    }

    println!("{rendered}");
    Ok(())
}
