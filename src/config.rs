use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, bail};
use globset::Glob;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CONFIG_PATH: &str = ".ai-review.yaml";

pub const SUPPORTED_PROVIDERS: [&str; 4] = [
    "openai-api",
    "openai-compatible",
    "anthropic-api",
    "gemini-api",
];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub limits: LimitsConfig,
    pub filters: FilterConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    pub provider: String,
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
    pub provider_timeout_secs: u64,
    pub prompt_system_file: String,
    pub prompt_output_contract_file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_diff_bytes: usize,
    pub max_comment_history: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    pub exclude_globs: Vec<String>,
    pub ignore_file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    pub log_raw_response: bool,
    pub artifact_dir: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai-api".to_string(),
            base_url: String::new(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.1,
            max_output_tokens: 1600,
            provider_timeout_secs: 120,
            prompt_system_file: "prompts/system.txt".to_string(),
            prompt_output_contract_file: "prompts/output_contract.json".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_diff_bytes: 300_000,
            max_comment_history: 20,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exclude_globs: Vec::new(),
            ignore_file: ".ai-review-ignore".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_raw_response: false,
            artifact_dir: "ai-review-debug".to_string(),
        }
    }
}

impl AppConfig {
    /// Merge order: config file (when present), then `AI_REVIEW_CFG_*`
    /// environment overrides, then `--set key=value` CLI overrides. The
    /// result is validated once and treated as immutable afterwards.
    pub fn load_with_overrides(
        config_path: &Path,
        cli_overrides: &[String],
    ) -> anyhow::Result<Self> {
        let mut cfg = if config_path.exists() {
            load_file(config_path)?
        } else {
            Self::default()
        };

        let mut env_overrides = env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix("AI_REVIEW_CFG_").map(|suffix| {
                    let key = suffix.to_lowercase().replace("__", ".");
                    (key, v)
                })
            })
            .collect::<Vec<_>>();
        env_overrides.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, value) in env_overrides {
            apply_override(&mut cfg, &key, &value).with_context(|| {
                format!(
                    "invalid env override AI_REVIEW_CFG_{}",
                    key.replace('.', "__").to_uppercase()
                )
            })?;
        }

        for raw in cli_overrides {
            let (key, value) = raw
                .split_once('=')
                .with_context(|| format!("invalid --set override '{raw}', expected key=value"))?;
            apply_override(&mut cfg, key.trim(), value.trim())
                .with_context(|| format!("invalid --set override '{raw}'"))?;
        }

        cfg.validate_semantics()?;
        Ok(cfg)
    }

    fn validate_semantics(&self) -> anyhow::Result<()> {
        if !SUPPORTED_PROVIDERS.contains(&self.llm.provider.as_str()) {
            bail!(
                "llm.provider must be one of {}; got '{}'",
                SUPPORTED_PROVIDERS.join("|"),
                self.llm.provider
            );
        }
        if self.llm.model.trim().is_empty() {
            bail!("llm.model must be non-empty");
        }
        if self.llm.api_key_env.trim().is_empty() {
            bail!("llm.api_key_env must be non-empty");
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature must be between 0.0 and 2.0");
        }
        if self.llm.max_output_tokens < 1 {
            bail!("llm.max_output_tokens must be >= 1");
        }
        if self.llm.provider_timeout_secs < 1 {
            bail!("llm.provider_timeout_secs must be >= 1");
        }
        if self.llm.prompt_system_file.trim().is_empty() {
            bail!("llm.prompt_system_file must be non-empty");
        }
        if self.llm.prompt_output_contract_file.trim().is_empty() {
            bail!("llm.prompt_output_contract_file must be non-empty");
        }
        if self.limits.max_diff_bytes < 1 {
            bail!("limits.max_diff_bytes must be >= 1");
        }
        for pattern in &self.filters.exclude_globs {
            Glob::new(pattern)
                .with_context(|| format!("invalid filters.exclude_globs glob '{pattern}'"))?;
        }
        Ok(())
    }
}

fn load_file(path: &Path) -> anyhow::Result<AppConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value = parse_config_value(path, &text)?;
    serde_json::from_value(value)
        .with_context(|| format!("failed to decode config from {}", path.display()))
}

fn parse_config_value(path: &Path, text: &str) -> anyhow::Result<Value> {
    let ext = path
        .extension()
        .and_then(|v| v.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let as_yaml = || -> anyhow::Result<Value> {
        let parsed: serde_yaml::Value = serde_yaml::from_str(text)
            .with_context(|| format!("failed to parse YAML in {}", path.display()))?;
        serde_json::to_value(parsed).context("failed to convert YAML to JSON value")
    };
    let as_toml = || -> anyhow::Result<Value> {
        let parsed: toml::Value = toml::from_str(text)
            .with_context(|| format!("failed to parse TOML in {}", path.display()))?;
        serde_json::to_value(parsed).context("failed to convert TOML to JSON value")
    };

    match ext.as_str() {
        "yaml" | "yml" => as_yaml(),
        "toml" => as_toml(),
        _ => as_yaml().or_else(|_| as_toml()).with_context(|| {
            format!(
                "failed to parse config {}; expected YAML or TOML",
                path.display()
            )
        }),
    }
}

fn apply_override(cfg: &mut AppConfig, key: &str, value: &str) -> anyhow::Result<()> {
    match key {
        "llm.provider" => cfg.llm.provider = value.to_string(),
        "llm.base_url" => cfg.llm.base_url = value.to_string(),
        "llm.model" => cfg.llm.model = value.to_string(),
        "llm.api_key_env" => cfg.llm.api_key_env = value.to_string(),
        "llm.temperature" => cfg.llm.temperature = parse_f64(key, value)?,
        "llm.max_output_tokens" => cfg.llm.max_output_tokens = parse_u32(key, value)?,
        "llm.provider_timeout_secs" => cfg.llm.provider_timeout_secs = parse_u64(key, value)?,
        "llm.prompt_system_file" => cfg.llm.prompt_system_file = value.to_string(),
        "llm.prompt_output_contract_file" => {
            cfg.llm.prompt_output_contract_file = value.to_string()
        }

        "limits.max_diff_bytes" => cfg.limits.max_diff_bytes = parse_usize(key, value)?,
        "limits.max_comment_history" => cfg.limits.max_comment_history = parse_usize(key, value)?,

        "filters.exclude_globs" => cfg.filters.exclude_globs = parse_csv(value),
        "filters.ignore_file" => cfg.filters.ignore_file = value.to_string(),

        "debug.log_raw_response" => cfg.debug.log_raw_response = parse_bool(key, value)?,
        "debug.artifact_dir" => cfg.debug.artifact_dir = value.to_string(),

        _ => bail!("unknown config key '{key}'"),
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{key} must be a boolean, got '{value}'"),
    }
}

fn parse_usize(key: &str, value: &str) -> anyhow::Result<usize> {
    value
        .parse::<usize>()
        .with_context(|| format!("{key} must be a positive integer, got '{value}'"))
}

fn parse_u32(key: &str, value: &str) -> anyhow::Result<u32> {
    value
        .parse::<u32>()
        .with_context(|| format!("{key} must be a positive integer, got '{value}'"))
}

fn parse_u64(key: &str, value: &str) -> anyhow::Result<u64> {
    value
        .parse::<u64>()
        .with_context(|| format!("{key} must be a positive integer, got '{value}'"))
}

fn parse_f64(key: &str, value: &str) -> anyhow::Result<f64> {
    value
        .parse::<f64>()
        .with_context(|| format!("{key} must be a number, got '{value}'"))
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{AppConfig, apply_override, parse_csv};

    struct EnvGuard {
        key: String,
        previous: Option<OsString>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let previous = std::env::var_os(key);
            unsafe { std::env::set_var(key, value) };
            Self {
                key: key.to_string(),
                previous,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(prev) = &self.previous {
                unsafe { std::env::set_var(&self.key, prev) };
            } else {
                unsafe { std::env::remove_var(&self.key) };
            }
        }
    }

    fn unique_temp_file(name: &str, extension: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "ai-review-config-{name}-{}-{nanos}.{extension}",
            std::process::id()
        ))
    }

    #[test]
    fn default_config_passes_validation() {
        let cfg =
            AppConfig::load_with_overrides(Path::new("/nonexistent/cfg.yaml"), &[]).expect("load");
        assert_eq!(cfg.llm.provider, "openai-api");
        assert_eq!(cfg.limits.max_diff_bytes, 300_000);
    }

    #[test]
    fn loads_yaml_config_file() {
        let _lock = crate::test_global_lock()
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let path = unique_temp_file("load-yaml", "yaml");
        std::fs::write(
            &path,
            r#"
llm:
  provider: anthropic-api
  model: claude-sonnet-4-5
  api_key_env: ANTHROPIC_API_KEY
limits:
  max_diff_bytes: 1024
"#,
        )
        .expect("write test yaml");

        let cfg = AppConfig::load_with_overrides(&path, &[]).expect("load yaml");
        let _ = std::fs::remove_file(&path);

        assert_eq!(cfg.llm.provider, "anthropic-api");
        assert_eq!(cfg.llm.model, "claude-sonnet-4-5");
        assert_eq!(cfg.limits.max_diff_bytes, 1024);
        assert_eq!(cfg.limits.max_comment_history, 20);
    }

    #[test]
    fn loads_toml_config_file() {
        let _lock = crate::test_global_lock()
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let path = unique_temp_file("load-toml", "toml");
        std::fs::write(
            &path,
            r#"
[llm]
model = "gpt-4o"

[filters]
exclude_globs = ["**/*.lock"]
"#,
        )
        .expect("write test toml");

        let cfg = AppConfig::load_with_overrides(&path, &[]).expect("load toml");
        let _ = std::fs::remove_file(&path);

        assert_eq!(cfg.llm.model, "gpt-4o");
        assert_eq!(cfg.filters.exclude_globs, vec!["**/*.lock".to_string()]);
    }

    #[test]
    fn rejects_unknown_config_field() {
        let path = unique_temp_file("unknown-field", "yaml");
        std::fs::write(&path, "unknown_key: true\n").expect("write test yaml");

        let err = AppConfig::load_with_overrides(&path, &[])
            .expect_err("unknown field should fail");
        let _ = std::fs::remove_file(&path);
        assert!(err.to_string().contains("failed to decode config"));
    }

    #[test]
    fn env_override_applies_after_file() {
        let _lock = crate::test_global_lock()
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let _set = EnvGuard::set("AI_REVIEW_CFG_LLM__MODEL", "env-model");

        let cfg =
            AppConfig::load_with_overrides(Path::new("/nonexistent/cfg.yaml"), &[]).expect("load");
        assert_eq!(cfg.llm.model, "env-model");
    }

    #[test]
    fn cli_set_override_wins_over_env() {
        let _lock = crate::test_global_lock()
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let _set = EnvGuard::set("AI_REVIEW_CFG_LLM__MODEL", "env-model");

        let cfg = AppConfig::load_with_overrides(
            Path::new("/nonexistent/cfg.yaml"),
            &["llm.model=cli-model".to_string()],
        )
        .expect("load");
        assert_eq!(cfg.llm.model, "cli-model");
    }

    #[test]
    fn set_override_without_equals_is_rejected() {
        let err = AppConfig::load_with_overrides(
            Path::new("/nonexistent/cfg.yaml"),
            &["llm.model".to_string()],
        )
        .expect_err("missing '=' should fail");
        assert!(err.to_string().contains("expected key=value"));
    }

    #[test]
    fn unknown_override_key_is_rejected() {
        let mut cfg = AppConfig::default();
        let err = apply_override(&mut cfg, "llm.banana", "1").expect_err("unknown key");
        assert!(err.to_string().contains("unknown config key"));
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let cases = [
            ("llm.provider=smoke-signal", "llm.provider"),
            ("llm.temperature=3.5", "llm.temperature"),
            ("limits.max_diff_bytes=0", "limits.max_diff_bytes"),
            ("llm.provider_timeout_secs=0", "llm.provider_timeout_secs"),
        ];

        for (override_kv, needle) in cases {
            let err = AppConfig::load_with_overrides(
                Path::new("/nonexistent/cfg.yaml"),
                &[override_kv.to_string()],
            )
            .expect_err("invalid value should fail validation");
            assert!(err.to_string().contains(needle), "{override_kv}: {err}");
        }
    }

    #[test]
    fn validation_rejects_bad_exclude_glob() {
        let err = AppConfig::load_with_overrides(
            Path::new("/nonexistent/cfg.yaml"),
            &["filters.exclude_globs=src/[".to_string()],
        )
        .expect_err("bad glob should fail");
        assert!(err.to_string().contains("invalid filters.exclude_globs"));
    }

    #[test]
    fn csv_values_are_trimmed_and_empties_dropped() {
        assert_eq!(
            parse_csv(" a , ,b,"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn numeric_override_parsing_reports_key_name() {
        let mut cfg = AppConfig::default();
        let err = apply_override(&mut cfg, "limits.max_diff_bytes", "lots")
            .expect_err("non-numeric should fail");
        assert!(err.to_string().contains("limits.max_diff_bytes"));
    }
}
