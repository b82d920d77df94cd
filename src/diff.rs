use std::io::Read;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, bail};
use regex::Regex;

use crate::filtering::FileFilter;

/// The diff as it will be sent for review, plus the stats the prompt header
/// reports.
#[derive(Debug, Clone, Default)]
pub struct DiffData {
    pub text: String,
    pub files: Vec<String>,
    pub total_added: usize,
    pub total_removed: usize,
}

/// Run `git diff` against the base ref, like the PR workflow does when no
/// pre-computed diff file is handed in.
pub fn collect_diff(base_ref: &str) -> anyhow::Result<String> {
    let output = Command::new("git")
        .arg("diff")
        .arg("--no-color")
        .arg(format!("{base_ref}...HEAD"))
        .output()
        .context("failed to execute git diff")?;

    if !output.status.success() {
        bail!(
            "git diff failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Read a pre-computed diff from a file, or from stdin when the path is `-`.
pub fn read_diff_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read diff from stdin")?;
        return Ok(text);
    }

    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read diff file {}", path.display()))
}

pub fn guess_base_ref() -> Option<String> {
    for candidate in ["origin/main", "origin/master"] {
        let status = Command::new("git")
            .arg("rev-parse")
            .arg("--verify")
            .arg(candidate)
            .output()
            .ok()?;
        if status.status.success() {
            return Some(candidate.to_string());
        }
    }

    None
}

/// Drop whole per-file sections for excluded paths and compute stats over
/// what remains. Section boundaries are the `diff --git` headers, which also
/// carry the file path.
pub fn filter_and_measure(diff_text: &str, filter: &FileFilter) -> anyhow::Result<DiffData> {
    let hunk_re =
        Regex::new(r"^@@ -\d+(?:,\d+)? \+\d+(?:,\d+)? @@").context("failed to compile hunk regex")?;

    let mut data = DiffData::default();
    // Content before the first `diff --git` header (or a plain unified diff
    // without git headers) is kept as-is.
    let mut keep_current = true;
    let mut section_lines: Vec<&str> = Vec::new();

    for raw_line in diff_text.lines() {
        if raw_line.starts_with("diff --git ") {
            flush_section(keep_current, &mut section_lines, &mut data.text);

            let path = section_path(raw_line);
            keep_current = match &path {
                Some(p) => filter.is_allowed_path(p),
                None => true,
            };
            if keep_current && let Some(p) = path {
                data.files.push(p);
            }
            section_lines.push(raw_line);
            continue;
        }

        section_lines.push(raw_line);

        if !keep_current {
            continue;
        }

        if raw_line.starts_with("+++") || raw_line.starts_with("---") {
            continue;
        }
        if hunk_re.is_match(raw_line) {
            continue;
        }
        if raw_line.starts_with('+') {
            data.total_added += 1;
        } else if raw_line.starts_with('-') {
            data.total_removed += 1;
        }
    }
    flush_section(keep_current, &mut section_lines, &mut data.text);

    Ok(data)
}

fn flush_section(keep: bool, section: &mut Vec<&str>, out: &mut String) {
    if keep {
        for line in section.iter() {
            out.push_str(line);
            out.push('\n');
        }
    }
    section.clear();
}

/// Extract the changed file path from a `diff --git a/X b/Y` header. The b
/// side wins; a deleted file only has a meaningful a side.
fn section_path(header: &str) -> Option<String> {
    let rest = header.strip_prefix("diff --git ")?;
    let mut parts = rest.split_whitespace();
    let a_side = parts.next()?;
    let b_side = parts.next();

    let strip = |raw: &str| -> Option<String> {
        let path = raw
            .strip_prefix("b/")
            .or_else(|| raw.strip_prefix("a/"))
            .unwrap_or(raw);
        if path == "/dev/null" {
            None
        } else {
            Some(path.to_string())
        }
    };

    b_side.and_then(strip).or_else(|| strip(a_side))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::time::{SystemTime, UNIX_EPOCH};

    use crate::config::FilterConfig;
    use crate::filtering::FileFilter;

    use super::{collect_diff, filter_and_measure, read_diff_input, section_path};

    const SAMPLE_DIFF: &str = "diff --git a/src/lib.rs b/src/lib.rs\n\
--- a/src/lib.rs\n\
+++ b/src/lib.rs\n\
@@ -1,2 +1,3 @@\n\
 pub fn a() {}\n\
+pub fn b() {}\n\
-fn gone() {}\n\
diff --git a/dist/app.min.js b/dist/app.min.js\n\
--- a/dist/app.min.js\n\
+++ b/dist/app.min.js\n\
@@ -1 +1 @@\n\
+var x=1;\n";

    fn default_filter() -> FileFilter {
        FileFilter::from_config(&FilterConfig::default()).expect("filter build")
    }

    fn unique_temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "ai-review-diff-{name}-{}-{nanos}",
            std::process::id()
        ))
    }

    fn run_git(repo: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .expect("git command should execute");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    struct CwdGuard {
        original: PathBuf,
    }

    impl CwdGuard {
        fn push(path: &Path) -> Self {
            let original = std::env::current_dir().expect("get current dir");
            std::env::set_current_dir(path).expect("set current dir");
            Self { original }
        }
    }

    impl Drop for CwdGuard {
        fn drop(&mut self) {
            let _ = std::env::set_current_dir(&self.original);
        }
    }

    #[test]
    fn excluded_sections_are_dropped_and_stats_counted() {
        let data = filter_and_measure(SAMPLE_DIFF, &default_filter()).expect("filter diff");

        assert_eq!(data.files, vec!["src/lib.rs".to_string()]);
        assert!(data.text.contains("pub fn b()"));
        assert!(!data.text.contains("app.min.js"));
        assert_eq!(data.total_added, 1);
        assert_eq!(data.total_removed, 1);
    }

    #[test]
    fn empty_diff_measures_empty() {
        let data = filter_and_measure("", &default_filter()).expect("filter diff");
        assert!(data.text.is_empty());
        assert!(data.files.is_empty());
    }

    #[test]
    fn fully_excluded_diff_leaves_no_text() {
        let diff = "diff --git a/Cargo.lock b/Cargo.lock\n\
--- a/Cargo.lock\n\
+++ b/Cargo.lock\n\
@@ -1 +1 @@\n\
+version = 4\n";
        let data = filter_and_measure(diff, &default_filter()).expect("filter diff");
        assert!(data.text.trim().is_empty());
    }

    #[test]
    fn section_path_strips_git_prefixes() {
        let header = "diff --git a/old.txt b/old.txt";
        assert_eq!(section_path(header).as_deref(), Some("old.txt"));
        assert!(section_path("not a header").is_none());
    }

    #[test]
    fn hunk_and_file_marker_lines_do_not_count_as_changes() {
        let diff = "diff --git a/src/a.rs b/src/a.rs\n\
--- a/src/a.rs\n\
+++ b/src/a.rs\n\
@@ -1 +1 @@\n\
+let a = 1;\n";
        let data = filter_and_measure(diff, &default_filter()).expect("filter diff");
        assert_eq!(data.total_added, 1);
        assert_eq!(data.total_removed, 0);
    }

    #[test]
    fn read_diff_input_reads_file_contents() {
        let path = unique_temp_dir("diff-input").with_extension("diff");
        std::fs::write(&path, SAMPLE_DIFF).expect("write diff fixture");

        let text = read_diff_input(&path).expect("read diff file");
        let _ = std::fs::remove_file(&path);
        assert_eq!(text, SAMPLE_DIFF);
    }

    #[test]
    fn read_diff_input_reports_missing_file() {
        let err = read_diff_input(Path::new("/nonexistent/never.diff"))
            .expect_err("missing file should fail");
        assert!(err.to_string().contains("failed to read diff file"));
    }

    #[test]
    fn collect_diff_runs_against_real_repo() {
        let _lock = crate::test_global_lock()
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let repo = unique_temp_dir("collect");
        std::fs::create_dir_all(&repo).expect("create repo dir");
        run_git(&repo, &["init"]);
        run_git(&repo, &["config", "user.email", "ai-review@example.com"]);
        run_git(&repo, &["config", "user.name", "AI Review"]);

        std::fs::write(repo.join("main.rs"), "fn main() {}\n").expect("write base file");
        run_git(&repo, &["add", "."]);
        run_git(&repo, &["commit", "-m", "initial"]);

        std::fs::write(repo.join("main.rs"), "fn main() { run(); }\n").expect("update file");
        run_git(&repo, &["add", "."]);
        run_git(&repo, &["commit", "-m", "change"]);

        let _cwd = CwdGuard::push(&repo);
        let diff = collect_diff("HEAD~1").expect("collect diff");
        drop(_cwd);
        let _ = std::fs::remove_dir_all(&repo);

        assert!(diff.contains("main.rs"));
        assert!(diff.contains("+fn main() { run(); }"));
    }
}
