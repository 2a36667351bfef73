/// Unified diff parsing and application.
///
/// Parsing strategy:
///   1. Strip an optional markdown fence, read the `---`/`+++` headers to
///      classify the patch (CREATE when the old side is /dev/null, DELETE
///      when the new side is, MODIFY otherwise)
///   2. Split into hunks on `@@ ... @@` headers
///   3. Locate each hunk by matching context + removal lines; the `@@` line
///      number is only a search hint
///   4. Apply hunks top-to-bottom, replacing the matched region
///
/// Application runs strict first (exact line match), then fuzzy (context
/// lines match after collapsing horizontal whitespace); insertion lines are
/// always emitted verbatim. A failed application is captured as a
/// `DiffFailureInfo` record so the repair loop can show the model exactly
/// what went wrong.
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::client::strip_code_fence;
use crate::project_fs::ProjectFs;

// ── Failure capture ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffFailureInfo {
    pub file: String,
    pub diff: String,
    /// Pre-apply snapshot of the target file.
    #[serde(rename = "fileContent")]
    pub file_content: String,
    pub error: String,
}

// ── Patch data structures ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchAction {
    Create,
    Delete,
    Modify,
}

#[derive(Debug, Clone)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone)]
pub struct Hunk {
    /// Hunk body in diff order. Context + removals form the match needle;
    /// context + additions form the replacement, so every addition stays at
    /// its own position even when a hunk carries several separate edits.
    lines: Vec<HunkLine>,
    /// Hint from the @@ header (0-based), used as a tie-breaker.
    line_hint: usize,
}

#[derive(Debug, Clone)]
pub struct ParsedPatch {
    pub action: PatchAction,
    hunks: Vec<Hunk>,
}

impl ParsedPatch {
    /// Full content of a CREATE patch: every addition line in order.
    pub fn created_content(&self) -> String {
        let mut out = self
            .hunks
            .iter()
            .flat_map(|h| {
                h.lines.iter().filter_map(|l| match l {
                    HunkLine::Add(s) => Some(s.as_str()),
                    _ => None,
                })
            })
            .collect::<Vec<_>>()
            .join("\n");
        out.push('\n');
        out
    }
}

/// Cheap shape check used to route generated content: full file vs diff.
pub fn looks_like_diff(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with("```diff") || trimmed.starts_with("--- ") || trimmed.starts_with("@@ ")
}

// ── Parser ────────────────────────────────────────────────────────────────────

pub fn parse(diff: &str) -> Result<ParsedPatch> {
    let body = strip_code_fence(diff);
    if body.trim().is_empty() {
        return Err(anyhow!("empty diff"));
    }

    let mut old_side: Option<&str> = None;
    let mut new_side: Option<&str> = None;
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            old_side = Some(rest.trim());
            continue;
        }
        if let Some(rest) = line.strip_prefix("+++ ") {
            new_side = Some(rest.trim());
            continue;
        }
        if line.starts_with("@@") {
            if let Some(h) = current.take() {
                hunks.push(h);
            }
            current = Some(Hunk {
                lines: Vec::new(),
                line_hint: parse_hunk_start(line).saturating_sub(1),
            });
        } else if let Some(ref mut h) = current {
            if let Some(rest) = line.strip_prefix('-') {
                h.lines.push(HunkLine::Remove(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix('+') {
                h.lines.push(HunkLine::Add(rest.to_string()));
            } else {
                // Context line — strip the leading space if present
                let ctx = line.strip_prefix(' ').unwrap_or(line);
                h.lines.push(HunkLine::Context(ctx.to_string()));
            }
        }
    }
    if let Some(h) = current {
        hunks.push(h);
    }

    if hunks.is_empty() {
        return Err(anyhow!("no @@ hunks found in diff"));
    }

    let action = match (old_side, new_side) {
        (Some(old), _) if old.ends_with("/dev/null") || old == "/dev/null" => PatchAction::Create,
        (_, Some(new)) if new.ends_with("/dev/null") || new == "/dev/null" => PatchAction::Delete,
        _ => PatchAction::Modify,
    };

    Ok(ParsedPatch { action, hunks })
}

/// Extract the old-file start line from "@@ -N,n +M,m @@".
fn parse_hunk_start(header: &str) -> usize {
    header
        .split_whitespace()
        .find(|s| s.starts_with('-'))
        .and_then(|s| s[1..].split(',').next())
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(1)
}

// ── Application ───────────────────────────────────────────────────────────────

/// Strict application: context and removal lines must match exactly.
pub fn apply_strict(content: &str, patch: &ParsedPatch) -> Result<String> {
    apply_hunks(content, &patch.hunks, false)
}

/// Fuzzy application: exact matches are preferred, but context/removal lines
/// may also match after horizontal whitespace is collapsed. Strict success
/// implies fuzzy success.
pub fn apply_fuzzy(content: &str, patch: &ParsedPatch) -> Result<String> {
    apply_hunks(content, &patch.hunks, true)
}

fn apply_hunks(content: &str, hunks: &[Hunk], fuzzy: bool) -> Result<String> {
    let mut current = content.to_string();
    for (idx, hunk) in hunks.iter().enumerate() {
        current = apply_hunk(&current, hunk, fuzzy)
            .map_err(|e| anyhow!("hunk {}/{} failed: {e}", idx + 1, hunks.len()))?;
    }
    Ok(current)
}

fn apply_hunk(content: &str, hunk: &Hunk, fuzzy: bool) -> Result<String> {
    if hunk.lines.is_empty() {
        return Ok(content.to_string());
    }

    let file_lines: Vec<&str> = content.lines().collect();
    let needle: Vec<&str> = hunk
        .lines
        .iter()
        .filter_map(|l| match l {
            HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
            HunkLine::Add(_) => None,
        })
        .collect();
    // The new-file side of the hunk. Additions are emitted verbatim, never
    // whitespace-normalized, each at its own position in the hunk body.
    let replacement: Vec<&str> = hunk
        .lines
        .iter()
        .filter_map(|l| match l {
            HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
            HunkLine::Remove(_) => None,
        })
        .collect();

    if needle.is_empty() {
        // Pure insertion — position comes from the hint
        let insert_at = hunk.line_hint.min(file_lines.len());
        let mut out_lines: Vec<&str> = file_lines[..insert_at].to_vec();
        out_lines.extend_from_slice(&replacement);
        out_lines.extend_from_slice(&file_lines[insert_at..]);
        return Ok(rejoin(content, out_lines));
    }

    let (start, end) = find_needle(&file_lines, &needle, hunk.line_hint, fuzzy).ok_or_else(|| {
        anyhow!(
            "context lines not found in file.\nExpected to find:\n{}\nFile content near hint (line {}):\n{}",
            needle.iter().map(|l| format!("  {l}")).collect::<Vec<_>>().join("\n"),
            hunk.line_hint + 1,
            context_around(&file_lines, hunk.line_hint, 6),
        )
    })?;

    let mut out_lines: Vec<&str> = file_lines[..start].to_vec();
    out_lines.extend_from_slice(&replacement);
    out_lines.extend_from_slice(&file_lines[end..]);
    Ok(rejoin(content, out_lines))
}

fn rejoin(original: &str, lines: Vec<&str>) -> String {
    let mut out = lines.join("\n");
    if original.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Search for `needle` in `file_lines`. Exact candidates win; fuzzy mode
/// falls back to whitespace-collapsed comparison. Multiple candidates are
/// resolved by proximity to the hint.
fn find_needle(
    file_lines: &[&str],
    needle: &[&str],
    hint: usize,
    fuzzy: bool,
) -> Option<(usize, usize)> {
    let n = needle.len();
    if n == 0 || file_lines.len() < n {
        return None;
    }

    let exact = collect_matches(file_lines, needle, |a, b| a == b);
    let candidates = if !exact.is_empty() {
        exact
    } else if fuzzy {
        collect_matches(file_lines, needle, |a, b| collapse_ws(a) == collapse_ws(b))
    } else {
        return None;
    };

    let best = candidates
        .iter()
        .min_by_key(|&&s| (s as isize - hint as isize).unsigned_abs())
        .copied()?;
    Some((best, best + n))
}

fn collect_matches<F>(file_lines: &[&str], needle: &[&str], eq: F) -> Vec<usize>
where
    F: Fn(&str, &str) -> bool,
{
    let n = needle.len();
    let mut out = Vec::new();
    'outer: for start in 0..=file_lines.len().saturating_sub(n) {
        for (i, &nl) in needle.iter().enumerate() {
            if !eq(file_lines[start + i], nl) {
                continue 'outer;
            }
        }
        out.push(start);
    }
    out
}

/// Collapse runs of horizontal whitespace to a single space and trim.
fn collapse_ws(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn context_around(lines: &[&str], centre: usize, radius: usize) -> String {
    let lo = centre.saturating_sub(radius);
    let hi = (centre + radius).min(lines.len());
    lines[lo..hi]
        .iter()
        .enumerate()
        .map(|(i, l)| format!("  {:>4}: {l}\n", lo + i + 1))
        .collect()
}

// ── Inversion ─────────────────────────────────────────────────────────────────

/// Build the inverse patch: every addition becomes a removal and vice
/// versa, in place, with context untouched. Reverse-applying the inverse of
/// a well-formed patch restores the original content exactly.
pub fn invert(patch: &ParsedPatch) -> ParsedPatch {
    let action = match patch.action {
        PatchAction::Create => PatchAction::Delete,
        PatchAction::Delete => PatchAction::Create,
        PatchAction::Modify => PatchAction::Modify,
    };
    ParsedPatch {
        action,
        hunks: patch.hunks.iter().map(invert_hunk).collect(),
    }
}

fn invert_hunk(h: &Hunk) -> Hunk {
    let lines = h
        .lines
        .iter()
        .map(|l| match l {
            HunkLine::Context(s) => HunkLine::Context(s.clone()),
            HunkLine::Remove(s) => HunkLine::Add(s.clone()),
            HunkLine::Add(s) => HunkLine::Remove(s.clone()),
        })
        .collect();
    Hunk { lines, line_hint: h.line_hint }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Applies diffs against the project tree, capturing failures for the
/// repair loop. The most recent failure is kept in memory; every failure is
/// also appended to the failure log as JSONL.
pub struct PatchEngine {
    failure_log: String,
    last_failure: Option<DiffFailureInfo>,
}

impl PatchEngine {
    pub fn new(failure_log: impl Into<String>) -> Self {
        Self {
            failure_log: failure_log.into(),
            last_failure: None,
        }
    }

    pub fn last_failure(&self) -> Option<&DiffFailureInfo> {
        self.last_failure.as_ref()
    }

    /// Apply a unified diff to `path`. Strict first, fuzzy second; returns
    /// `true` iff the change landed on disk.
    pub fn apply_diff(&mut self, fs: &ProjectFs, path: &str, diff: &str) -> bool {
        let snapshot = fs.read(path).ok().flatten().unwrap_or_default();

        let patch = match parse(diff) {
            Ok(p) => p,
            Err(e) => {
                self.record_failure(fs, path, diff, &snapshot, &e.to_string());
                return false;
            }
        };

        match patch.action {
            PatchAction::Delete => match fs.remove(path) {
                // A missing file is already in the desired state
                Ok(_) => true,
                Err(e) => {
                    self.record_failure(fs, path, diff, &snapshot, &e.to_string());
                    false
                }
            },
            PatchAction::Create => {
                let content = patch.created_content();
                match fs.write(path, &content) {
                    Ok(()) => true,
                    Err(e) => {
                        self.record_failure(fs, path, diff, &snapshot, &e.to_string());
                        false
                    }
                }
            }
            PatchAction::Modify => {
                let current = match fs.read(path) {
                    Ok(Some(c)) => c,
                    Ok(None) => {
                        self.record_failure(fs, path, diff, "", "target file does not exist");
                        return false;
                    }
                    Err(e) => {
                        self.record_failure(fs, path, diff, &snapshot, &e.to_string());
                        return false;
                    }
                };

                let patched = match apply_strict(&current, &patch) {
                    Ok(p) => p,
                    Err(strict_err) => match apply_fuzzy(&current, &patch) {
                        Ok(p) => {
                            tracing::debug!(path, "strict apply failed, fuzzy succeeded: {strict_err}");
                            p
                        }
                        Err(e) => {
                            self.record_failure(fs, path, diff, &current, &e.to_string());
                            return false;
                        }
                    },
                };

                if patched.trim().is_empty() {
                    self.record_failure(
                        fs,
                        path,
                        diff,
                        &current,
                        "patch would blank the file; send a DELETE diff instead",
                    );
                    return false;
                }

                match fs.write(path, &patched) {
                    Ok(()) => true,
                    Err(e) => {
                        self.record_failure(fs, path, diff, &current, &e.to_string());
                        false
                    }
                }
            }
        }
    }

    fn record_failure(&mut self, fs: &ProjectFs, path: &str, diff: &str, content: &str, error: &str) {
        let info = DiffFailureInfo {
            file: path.to_string(),
            diff: diff.to_string(),
            file_content: content.to_string(),
            error: error.to_string(),
        };
        tracing::warn!(path, error, "diff application failed");
        if let Err(e) = fs.append_jsonl(&self.failure_log, &info) {
            tracing::warn!("could not append to {}: {e}", self.failure_log);
        }
        self.last_failure = Some(info);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
