use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

/// Outcome of the post-loop static check over mutated files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok,
    Failed { errors: Vec<String> },
}

impl ValidationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ValidationOutcome::Ok)
    }

    pub fn errors(&self) -> &[String] {
        match self {
            ValidationOutcome::Ok => &[],
            ValidationOutcome::Failed { errors } => errors,
        }
    }
}

/// Static compile/type-shaped check scoped to the mutated files. Not a real
/// compiler: delimiter balance, unterminated strings and conflict markers
/// catch the mutations a model most commonly breaks.
#[derive(Clone)]
pub struct ValidationGate {
    workspace_root: PathBuf,
}

impl ValidationGate {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.workspace_root
    }

    pub async fn check(&self, mutated_paths: &[String]) -> ValidationOutcome {
        let mut errors = Vec::new();
        for path in mutated_paths {
            let absolute = self.workspace_root.join(path);
            let content = match fs::read_to_string(&absolute).await {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    // Deleted since mutation; nothing left to check.
                    continue;
                }
                Err(err) => {
                    errors.push(format!("{path}: unreadable during validation: {err}"));
                    continue;
                }
            };
            errors.extend(check_file(path, &content));
        }
        if errors.is_empty() {
            ValidationOutcome::Ok
        } else {
            ValidationOutcome::Failed { errors }
        }
    }
}

fn is_code_extension(path: &str) -> bool {
    let ext = Path::new(path)
        .extension()
        .and_then(|v| v.to_str())
        .unwrap_or("");
    matches!(
        ext,
        "rs" | "ts" | "tsx" | "js" | "jsx" | "py" | "go" | "java" | "c" | "h" | "cpp" | "json"
    )
}

fn check_file(path: &str, content: &str) -> Vec<String> {
    let mut errors = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        if line.starts_with("<<<<<<<") || line.starts_with(">>>>>>>") {
            errors.push(format!("{path}:{}: merge conflict marker", idx + 1));
        }
    }

    if is_code_extension(path) {
        if let Some(error) = check_delimiter_balance(path, content) {
            errors.push(error);
        }
    }

    errors
}

/// Walks the text once, skipping string and char literals and line comments,
/// and verifies `{[(` nesting closes in order.
fn check_delimiter_balance(path: &str, content: &str) -> Option<String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    for (line_idx, line) in content.lines().enumerate() {
        let mut chars = line.chars().peekable();
        let mut in_string: Option<char> = None;
        while let Some(ch) = chars.next() {
            if let Some(quote) = in_string {
                if ch == '\\' {
                    chars.next();
                } else if ch == quote {
                    in_string = None;
                }
                continue;
            }
            match ch {
                '"' | '\'' => in_string = Some(ch),
                '/' if chars.peek() == Some(&'/') => break,
                '#' if path.ends_with(".py") => break,
                '{' | '[' | '(' => stack.push((ch, line_idx + 1)),
                '}' | ']' | ')' => {
                    let expected = match ch {
                        '}' => '{',
                        ']' => '[',
                        _ => '(',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        _ => {
                            return Some(format!(
                                "{path}:{}: unmatched `{ch}`",
                                line_idx + 1
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        // A single-quoted char literal that never closed on this line is far
        // more likely an apostrophe (Rust lifetimes, prose); strings do not
        // span lines in this checker.
    }
    stack
        .first()
        .map(|(open, line)| format!("{path}:{line}: unclosed `{open}`"))
}

/// Where validated mutations get committed as a single batch. Deployments
/// plug a VCS remote in here; the default stages the batch locally.
#[async_trait]
pub trait CommitSink: Send + Sync {
    async fn commit_batch(&self, files: Vec<CommitFile>, message: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct CommitFile {
    pub path: String,
    pub content: String,
}

/// Stages each batch under `<state>/commits/<batch-id>/`.
pub struct LocalBatchSink {
    commits_dir: PathBuf,
}

impl LocalBatchSink {
    pub async fn new(state_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let commits_dir = state_dir.as_ref().join("commits");
        fs::create_dir_all(&commits_dir).await?;
        Ok(Self { commits_dir })
    }
}

#[async_trait]
impl CommitSink for LocalBatchSink {
    async fn commit_batch(&self, files: Vec<CommitFile>, message: &str) -> anyhow::Result<String> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let dir = self.commits_dir.join(&batch_id);
        fs::create_dir_all(&dir).await?;
        for file in &files {
            let sanitized = file.path.replace(['/', '\\'], "__");
            fs::write(dir.join(sanitized), &file.content).await?;
        }
        fs::write(
            dir.join("BATCH.json"),
            serde_json::to_string_pretty(&serde_json::json!({
                "message": message,
                "files": files.iter().map(|f| f.path.clone()).collect::<Vec<_>>(),
            }))?,
        )
        .await?;
        Ok(batch_id)
    }
}

/// Reads every mutated file for the batch. A read failure here is blocking:
/// the caller takes the rollback path instead of silently dropping the file.
pub async fn collect_commit_batch(
    workspace_root: &Path,
    mutated_paths: &[String],
) -> anyhow::Result<Vec<CommitFile>> {
    let mut files = Vec::with_capacity(mutated_paths.len());
    for path in mutated_paths {
        let absolute = workspace_root.join(path);
        let content = fs::read_to_string(&absolute)
            .await
            .map_err(|err| anyhow::anyhow!("batch commit read failed for `{path}`: {err}"))?;
        files.push(CommitFile {
            path: path.clone(),
            content,
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn balanced_file_passes() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("ok.rs"), "fn main() { let x = [1, 2]; }")
            .await
            .expect("write");
        let gate = ValidationGate::new(dir.path());
        let outcome = gate.check(&["ok.rs".to_string()]).await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn unbalanced_braces_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("bad.rs"), "fn main() { let x = 1;")
            .await
            .expect("write");
        let gate = ValidationGate::new(dir.path());
        let outcome = gate.check(&["bad.rs".to_string()]).await;
        assert!(!outcome.is_ok());
        assert!(outcome.errors()[0].contains("unclosed `{`"));
    }

    #[tokio::test]
    async fn conflict_markers_fail_any_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("README.md"),
            "intro\n<<<<<<< HEAD\nours\n",
        )
        .await
        .expect("write");
        let gate = ValidationGate::new(dir.path());
        let outcome = gate.check(&["README.md".to_string()]).await;
        assert!(!outcome.is_ok());
        assert!(outcome.errors()[0].contains("merge conflict marker"));
    }

    #[test]
    fn braces_inside_strings_and_comments_are_ignored() {
        assert!(check_delimiter_balance("a.rs", "let s = \"{[(\"; // {{{").is_none());
        assert!(check_delimiter_balance("a.py", "x = 1  # unbalanced { here").is_none());
    }

    #[test]
    fn mismatched_closer_is_reported_with_line() {
        let error = check_delimiter_balance("a.rs", "fn f() { )\n}").expect("error");
        assert!(error.contains("a.rs:1"));
        assert!(error.contains("unmatched `)`"));
    }

    #[tokio::test]
    async fn commit_batch_read_failure_is_blocking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = collect_commit_batch(dir.path(), &["missing.rs".to_string()])
            .await
            .expect_err("expected blocking error");
        assert!(err.to_string().contains("missing.rs"));
    }

    #[tokio::test]
    async fn local_sink_stages_batch_with_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = LocalBatchSink::new(dir.path()).await.expect("sink");
        let batch_id = sink
            .commit_batch(
                vec![CommitFile {
                    path: "src/lib.rs".to_string(),
                    content: "pub fn f() {}".to_string(),
                }],
                "patch lib",
            )
            .await
            .expect("commit");
        let staged = dir.path().join("commits").join(&batch_id);
        assert!(staged.join("src__lib.rs").exists());
        assert!(staged.join("BATCH.json").exists());
    }
}
