//! Diff retrieval and changed-hunk lookup

use super::model::ReviewSubject;
use super::sandbox::{Capability, SandboxContext};
use crate::error::{HermesError, Result};
use async_trait::async_trait;

/// Changed line range on the new side of a diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub file: String,
    pub start: u32,
    pub end: u32,
}

/// Hunks of a unified diff, indexed by file
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    hunks: Vec<Hunk>,
}

impl ChangeSet {
    /// Collect new-side hunk ranges.
    ///
    /// Body lines are counted against the hunk header, so an added line that
    /// happens to read `+++ ...` is never taken for a file header.
    pub fn parse(diff: &str) -> Self {
        let mut hunks = Vec::new();
        let mut file: Option<String> = None;
        // Old and new lines still expected in the current hunk
        let mut remaining = (0u32, 0u32);

        for line in diff.lines() {
            if remaining != (0, 0) && !line.starts_with("@@") {
                match line.as_bytes().first() {
                    Some(b'+') => remaining.1 = remaining.1.saturating_sub(1),
                    Some(b'-') => remaining.0 = remaining.0.saturating_sub(1),
                    Some(b' ') | None => {
                        remaining.0 = remaining.0.saturating_sub(1);
                        remaining.1 = remaining.1.saturating_sub(1);
                    }
                    Some(b'\\') => {}
                    // Truncated hunk; fall through to header handling
                    Some(_) => remaining = (0, 0),
                }
                if remaining != (0, 0) || line.starts_with(['+', '-', ' ', '\\']) || line.is_empty() {
                    continue;
                }
            }

            if let Some(path) = line.strip_prefix("+++ ") {
                let path = path.split('\t').next().unwrap_or(path).trim();
                file = match path {
                    "/dev/null" => None,
                    p => Some(p.strip_prefix("b/").unwrap_or(p).to_string()),
                };
            } else if line.starts_with("@@") {
                let Some(((_, old_len), (start, new_len))) = parse_ranges(line) else {
                    remaining = (0, 0);
                    continue;
                };
                remaining = (old_len, new_len);
                let Some(file) = &file else {
                    continue;
                };
                // A pure deletion still anchors at the line after the cut
                let end = start.saturating_add(new_len.max(1) - 1);
                hunks.push(Hunk {
                    file: file.clone(),
                    start,
                    end,
                });
            }
        }

        Self { hunks }
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }

    pub fn files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = self.hunks.iter().map(|h| h.file.as_str()).collect();
        files.dedup();
        files
    }

    /// Whether `start..=end` of `path` overlaps a changed hunk
    pub fn touches(&self, path: &str, start: u32, end: u32) -> bool {
        let path = path.strip_prefix("./").unwrap_or(path);
        let (start, end) = (start.min(end), start.max(end));
        self.hunks
            .iter()
            .any(|h| h.file == path && start <= h.end && end >= h.start)
    }
}

/// `@@ -a,b +c,d @@` -> `((a, b), (c, d))`; omitted lengths default to 1
fn parse_ranges(header: &str) -> Option<((u32, u32), (u32, u32))> {
    let mut parts = header.split_whitespace().skip(1);
    let old = parse_range(parts.next()?.strip_prefix('-')?)?;
    let new = parse_range(parts.next()?.strip_prefix('+')?)?;
    Some((old, new))
}

fn parse_range(range: &str) -> Option<(u32, u32)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

/// Where a reviewer gets the diff for a subject without an inline one
#[async_trait]
pub trait DiffSource: Send + Sync {
    async fn diff(&self, subject: &ReviewSubject, sandbox: &SandboxContext) -> Result<String>;
}

/// Runs `git diff` inside the sandbox
#[derive(Debug, Clone, Default)]
pub struct GitCliDiffSource;

#[async_trait]
impl DiffSource for GitCliDiffSource {
    async fn diff(&self, subject: &ReviewSubject, sandbox: &SandboxContext) -> Result<String> {
        sandbox.require(Capability::ReadDiff)?;

        let base = subject
            .base
            .clone()
            .unwrap_or_else(|| format!("{}^", subject.commit));
        let output = sandbox
            .command("git")
            .args(["diff", "--no-color", "--no-ext-diff", "--unified=3"])
            .arg(&base)
            .arg(&subject.commit)
            .output()
            .await
            .map_err(|e| HermesError::ReviewerFailed(format!("Failed to execute git diff: {}", e)))?;

        if !output.status.success() {
            return Err(HermesError::ReviewerFailed(format!(
                "git diff {}..{} failed: {}",
                base,
                subject.commit,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "\
diff --git a/src/auth.rs b/src/auth.rs
index 1111111..2222222 100644
--- a/src/auth.rs
+++ b/src/auth.rs
@@ -10,6 +10,8 @@ fn login() {
     let user = lookup();
+    check(user);
+    audit(user);
@@ -40,3 +42 @@
-    old();
diff --git a/old.rs b/old.rs
deleted file mode 100644
--- a/old.rs
+++ /dev/null
@@ -1,3 +0,0 @@
-gone
";

    #[test]
    fn test_parse_hunks() {
        let changes = ChangeSet::parse(DIFF);
        assert_eq!(
            changes.hunks(),
            &[
                Hunk {
                    file: "src/auth.rs".to_string(),
                    start: 10,
                    end: 17
                },
                Hunk {
                    file: "src/auth.rs".to_string(),
                    start: 42,
                    end: 42
                },
            ]
        );
        assert_eq!(changes.files(), vec!["src/auth.rs"]);
    }

    #[test]
    fn test_touches_overlap() {
        let changes = ChangeSet::parse(DIFF);
        assert!(changes.touches("src/auth.rs", 12, 12));
        assert!(changes.touches("./src/auth.rs", 1, 10));
        assert!(changes.touches("src/auth.rs", 42, 40));
        assert!(!changes.touches("src/auth.rs", 18, 41));
        assert!(!changes.touches("src/other.rs", 12, 12));
        assert!(!changes.touches("old.rs", 1, 3));
    }

    #[test]
    fn test_empty_diff() {
        assert!(ChangeSet::parse("").is_empty());
    }

    #[test]
    fn test_added_line_shaped_like_header_keeps_file() {
        let diff = "\
--- a/src/counter.c
+++ b/src/counter.c
@@ -3,2 +3,4 @@
 int counter;
+++ counter;
+--- counter;
 return counter;
@@ -20 +22 @@
-old
+new
";
        let changes = ChangeSet::parse(diff);
        assert_eq!(
            changes.hunks(),
            &[
                Hunk {
                    file: "src/counter.c".to_string(),
                    start: 3,
                    end: 6
                },
                Hunk {
                    file: "src/counter.c".to_string(),
                    start: 22,
                    end: 22
                },
            ]
        );
        assert!(!changes.touches("counter;", 1, 100));
    }

    #[test]
    fn test_hunk_at_end_of_line_range_saturates() {
        let diff = format!("+++ b/big.rs\n@@ -1,1 +{},10 @@\n", u32::MAX - 2);
        let changes = ChangeSet::parse(&diff);
        assert_eq!(changes.hunks()[0].start, u32::MAX - 2);
        assert_eq!(changes.hunks()[0].end, u32::MAX);
    }
}
