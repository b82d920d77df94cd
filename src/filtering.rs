use std::fs;
use std::path::Path;

use anyhow::Context;
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::FilterConfig;

/// Decides which changed files stay in the diff sent for review. Everything
/// passes unless an exclusion matches; there is no include list.
#[derive(Debug)]
pub struct FileFilter {
    exclude: GlobSet,
}

impl FileFilter {
    pub fn from_config(config: &FilterConfig) -> anyhow::Result<Self> {
        let mut excludes = default_exclude_globs();
        excludes.extend(config.exclude_globs.clone());

        let ignore_path = Path::new(&config.ignore_file);
        if ignore_path.exists() {
            excludes.extend(read_ignore_patterns(ignore_path)?);
        }

        let exclude = build_glob_set(&excludes).context("failed to build exclude glob set")?;

        Ok(Self { exclude })
    }

    pub fn is_allowed_path(&self, path: &str) -> bool {
        let norm = normalize(path);
        !self.exclude.is_match(&norm) && !is_lockfile(&norm)
    }
}

fn build_glob_set(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if pattern.trim().is_empty() {
            continue;
        }
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{pattern}'"))?);
    }

    builder.build().context("glob set build failed")
}

fn read_ignore_patterns(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read ignore file {}", path.display()))?;

    let mut out = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.ends_with('/') {
            out.push(format!("{}**", line));
        } else {
            out.push(line.to_string());
        }
    }

    Ok(out)
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

fn default_exclude_globs() -> Vec<String> {
    vec![
        "**/node_modules/**".to_string(),
        "**/vendor/**".to_string(),
        "**/dist/**".to_string(),
        "**/build/**".to_string(),
        "**/target/**".to_string(),
        "**/coverage/**".to_string(),
        "**/*.min.js".to_string(),
        "**/*.map".to_string(),
    ]
}

fn is_lockfile(path: &str) -> bool {
    path.ends_with("package-lock.json")
        || path.ends_with("pnpm-lock.yaml")
        || path.ends_with("yarn.lock")
        || path.ends_with("Cargo.lock")
        || path.ends_with("composer.lock")
        || path.ends_with("Gemfile.lock")
        || path.ends_with("poetry.lock")
        || path.ends_with("packages.lock.json")
        || path.ends_with("go.sum")
}
