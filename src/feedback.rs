/// Post-apply feedback loops.
///
/// Each loop runs a project tool after a successful apply phase and reports
/// success plus the combined tool output. The engine feeds a failing loop's
/// log back into regeneration; loops themselves never abort a pass.
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::client::ModelClient;
use crate::patch::{looks_like_diff, PatchEngine};
use crate::project_fs::ProjectFs;

const TYPECHECK_CMD: &str = "npx tsc --noEmit";
const COVERAGE_CMD: &str = "npx jest --coverage --coverageReporters=json-summary --silent";
const COVERAGE_SUMMARY_PATH: &str = "coverage/coverage-summary.json";
const TOOL_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub success: bool,
    pub log: String,
}

#[async_trait]
pub trait FeedbackLoop: Send + Sync {
    fn name(&self) -> &'static str;
    /// Whether this loop applies to the project at all. Inapplicable loops
    /// are skipped, not failed.
    fn applicable(&self, root: &Path) -> bool;
    async fn run(&self, root: &Path) -> LoopOutcome;
}

// ── Tool runner ───────────────────────────────────────────────────────────────

struct ToolResult {
    output: String,
    exit_code: i32,
}

/// Run a shell command in `root`, merging stdout and stderr.
async fn run_tool(root: &Path, cmd: &str) -> ToolResult {
    let fut = Command::new("sh").arg("-c").arg(cmd).current_dir(root).output();
    let output = match timeout(Duration::from_secs(TOOL_TIMEOUT_SECS), fut).await {
        Ok(Ok(o)) => o,
        Ok(Err(e)) => {
            return ToolResult { output: format!("[tool failed to start: {e}]"), exit_code: -1 };
        }
        Err(_) => {
            return ToolResult {
                output: format!("[tool timed out after {TOOL_TIMEOUT_SECS}s]"),
                exit_code: -1,
            };
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => String::new(),
        (true, false) => stderr.to_string(),
        (false, true) => stdout.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    };
    ToolResult { output: combined, exit_code }
}

// ── TypeScript loop ───────────────────────────────────────────────────────────

/// Type-checks the project after apply. Active when a tsconfig exists or the
/// config forces it.
pub struct TypeScriptLoop {
    pub forced: bool,
}

#[async_trait]
impl FeedbackLoop for TypeScriptLoop {
    fn name(&self) -> &'static str {
        "typescript"
    }

    fn applicable(&self, root: &Path) -> bool {
        self.forced || root.join("tsconfig.json").exists()
    }

    async fn run(&self, root: &Path) -> LoopOutcome {
        let result = run_tool(root, TYPECHECK_CMD).await;
        LoopOutcome { success: result.exit_code == 0, log: result.output }
    }
}

// ── Coverage loop ─────────────────────────────────────────────────────────────

/// Runs the test suite with coverage, finds the worst-covered file and asks
/// the model for tests, then re-measures. Succeeds only when every line is
/// covered (or the project produces no coverage data at all).
pub struct CoverageLoop<'a> {
    pub client: &'a dyn ModelClient,
    pub fs: &'a ProjectFs,
    pub iterations: u32,
    pub failure_log: String,
}

#[derive(Debug, PartialEq)]
struct WorstFile {
    path: String,
    pct: f64,
}

#[async_trait]
impl FeedbackLoop for CoverageLoop<'_> {
    fn name(&self) -> &'static str {
        "coverage"
    }

    fn applicable(&self, root: &Path) -> bool {
        self.iterations > 0 && root.join("package.json").exists()
    }

    async fn run(&self, root: &Path) -> LoopOutcome {
        let mut log = String::new();
        for iteration in 1..=self.iterations {
            let result = run_tool(root, COVERAGE_CMD).await;
            log.push_str(&format!("[coverage run {iteration}]\n{}\n", result.output));

            let summary = match self.fs.read(COVERAGE_SUMMARY_PATH) {
                Ok(Some(raw)) => raw,
                _ => {
                    log.push_str("no coverage summary produced; nothing to raise\n");
                    return LoopOutcome { success: true, log };
                }
            };
            let Some(worst) = worst_covered_file(&summary) else {
                log.push_str("coverage summary had no per-file entries\n");
                return LoopOutcome { success: true, log };
            };
            if worst.pct >= 100.0 {
                log.push_str("all lines covered\n");
                return LoopOutcome { success: true, log };
            }
            log.push_str(&format!("lowest line coverage: {} at {:.1}%\n", worst.path, worst.pct));

            if !self.generate_tests_for(&worst).await {
                log.push_str("test generation failed\n");
                return LoopOutcome { success: false, log };
            }
        }
        log.push_str("coverage iterations exhausted below full coverage\n");
        LoopOutcome { success: false, log }
    }
}

impl CoverageLoop<'_> {
    /// Ask the model for a test file targeting `worst` and apply the answer,
    /// either as raw content (with a FILE: header) or as a unified diff.
    async fn generate_tests_for(&self, worst: &WorstFile) -> bool {
        let source = self
            .fs
            .read(&worst.path)
            .ok()
            .flatten()
            .unwrap_or_default();
        let prompt = format!(
            "The file {path} has {pct:.1}% line coverage. Write tests that cover its \
             uncovered lines.\n\nRespond in one of two forms:\n\
             1. A new or replacement test file: first line exactly `FILE: <relative path>`, \
             followed by the complete file content.\n\
             2. A unified diff extending an existing test file.\n\n\
             Source of {path}:\n{source}",
            path = worst.path,
            pct = worst.pct,
        );

        let response = match self.client.raw_text(&prompt, false).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("coverage test generation failed: {e}");
                return false;
            }
        };

        if looks_like_diff(&response) {
            let mut patcher = PatchEngine::new(self.failure_log.clone());
            let target = default_test_path(&worst.path);
            return patcher.apply_diff(self.fs, &target, &response);
        }

        let (target, content) = match split_file_header(&response) {
            Some(pair) => pair,
            None => (default_test_path(&worst.path), response.clone()),
        };
        self.fs.write(&target, &content).is_ok()
    }
}

/// Lowest line-coverage file from a jest `json-summary` report. The `total`
/// entry is not a file.
fn worst_covered_file(summary_json: &str) -> Option<WorstFile> {
    let value: serde_json::Value = serde_json::from_str(summary_json).ok()?;
    let object = value.as_object()?;
    let mut worst: Option<WorstFile> = None;
    for (path, stats) in object {
        if path == "total" {
            continue;
        }
        let Some(pct) = stats["lines"]["pct"].as_f64() else {
            continue;
        };
        if worst.as_ref().is_none_or(|w| pct < w.pct) {
            worst = Some(WorstFile { path: path.clone(), pct });
        }
    }
    worst
}

/// `FILE: path` header convention for raw test-file responses.
fn split_file_header(response: &str) -> Option<(String, String)> {
    let mut lines = response.lines();
    let first = lines.next()?.trim();
    let path = first.strip_prefix("FILE:")?.trim();
    if path.is_empty() {
        return None;
    }
    let content = lines.collect::<Vec<_>>().join("\n");
    Some((path.to_string(), format!("{content}\n")))
}

fn default_test_path(source_path: &str) -> String {
    match source_path.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.test.{ext}"),
        None => format!("{source_path}.test"),
    }
}
