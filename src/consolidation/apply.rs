/// Apply phase: put generated content on disk, in plan order.
///
/// Full-content results are written atomically (tmp + rename). Content that
/// arrives shaped like a unified diff is routed through the patch engine,
/// with the repair loop as the fallback when it doesn't apply.
use crate::client::ModelClient;
use crate::patch::{looks_like_diff, PatchEngine};
use crate::project_fs::ProjectFs;

use super::generate::{FileContentMap, DELETE_SENTINEL};
use super::plan::OpAction;
use super::repair;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Written,
    Patched,
    Deleted,
    /// Deletion of a file that was already absent.
    Skipped,
    Failed(String),
}

impl FileOutcome {
    pub fn label(&self) -> &str {
        match self {
            FileOutcome::Written => "written",
            FileOutcome::Patched => "patched",
            FileOutcome::Deleted => "deleted",
            FileOutcome::Skipped => "skipped",
            FileOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub per_file: Vec<(String, FileOutcome)>,
}

impl ApplyReport {
    fn push(&mut self, path: &str, outcome: FileOutcome) {
        match &outcome {
            FileOutcome::Failed(_) => self.failed += 1,
            FileOutcome::Skipped => self.skipped += 1,
            _ => self.success += 1,
        }
        self.per_file.push((path.to_string(), outcome));
    }
}

pub async fn apply(
    fs: &ProjectFs,
    patcher: &mut PatchEngine,
    client: &dyn ModelClient,
    map: &FileContentMap,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for (op, content) in map {
        let path = op.file_path.as_str();
        if op.action == OpAction::Delete || content == DELETE_SENTINEL {
            let outcome = match fs.remove(path) {
                Ok(true) => FileOutcome::Deleted,
                Ok(false) => FileOutcome::Skipped,
                Err(e) => FileOutcome::Failed(e.to_string()),
            };
            report.push(path, outcome);
            continue;
        }

        let outcome = if looks_like_diff(content) {
            if patcher.apply_diff(fs, path, content)
                || repair::repair(client, fs, patcher, path, content).await
            {
                FileOutcome::Patched
            } else {
                let error = patcher
                    .last_failure()
                    .map(|f| f.error.clone())
                    .unwrap_or_else(|| "diff did not apply".to_string());
                FileOutcome::Failed(error)
            }
        } else {
            match fs.write_atomic(path, content) {
                Ok(()) => FileOutcome::Written,
                Err(e) => FileOutcome::Failed(e.to_string()),
            }
        };
        report.push(path, outcome);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::MockClient;
    use crate::consolidation::plan::Operation;

    const FAILURE_LOG: &str = ".kai/logs/diff_failures.jsonl";

    fn fixture() -> (tempfile::TempDir, ProjectFs, PatchEngine) {
        let dir = tempfile::tempdir().unwrap();
        let pfs = ProjectFs::new(dir.path(), ".kai/logs", ".kai/project_analysis.json");
        (dir, pfs, PatchEngine::new(FAILURE_LOG))
    }

    fn entry(action: OpAction, path: &str, content: &str) -> (Operation, String) {
        (
            Operation { action, file_path: path.to_string(), rationale: None },
            content.to_string(),
        )
    }

    #[tokio::test]
    async fn test_full_content_written_atomically() {
        let (_dir, pfs, mut patcher) = fixture();
        let mock = MockClient::new();
        let map = vec![entry(OpAction::Create, "src/new.ts", "export const x = 1;\n")];
        let report = apply(&pfs, &mut patcher, &mock, &map).await;
        assert_eq!(report.success, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(pfs.read("src/new.ts").unwrap().unwrap(), "export const x = 1;\n");
        assert_eq!(report.per_file[0].1, FileOutcome::Written);
    }

    #[tokio::test]
    async fn test_delete_and_missing_delete() {
        let (_dir, pfs, mut patcher) = fixture();
        let mock = MockClient::new();
        pfs.write("present.ts", "x\n").unwrap();
        let map = vec![
            entry(OpAction::Delete, "present.ts", DELETE_SENTINEL),
            entry(OpAction::Delete, "absent.ts", DELETE_SENTINEL),
        ];
        let report = apply(&pfs, &mut patcher, &mock, &map).await;
        assert_eq!(report.success, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert!(pfs.read("present.ts").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_diff_shaped_content_routed_through_patcher() {
        let (_dir, pfs, mut patcher) = fixture();
        let mock = MockClient::new();
        pfs.write("mod.ts", "let value = 1;\n").unwrap();
        let diff = "--- a/mod.ts\n+++ b/mod.ts\n@@ -1 +1 @@\n-let value = 1;\n+let value = 2;\n";
        let map = vec![entry(OpAction::Modify, "mod.ts", diff)];
        let report = apply(&pfs, &mut patcher, &mock, &map).await;
        assert_eq!(report.per_file[0].1, FileOutcome::Patched);
        assert_eq!(pfs.read("mod.ts").unwrap().unwrap(), "let value = 2;\n");
    }

    #[tokio::test]
    async fn test_unrepairable_diff_is_failed() {
        let (_dir, pfs, mut patcher) = fixture();
        // Repair responds with an empty diff → immediate exit.
        let mock = MockClient::new();
        mock.push_raw("");
        pfs.write("mod.ts", "actual\n").unwrap();
        let diff = "@@ -1 +1 @@\n-no such line\n+replacement\n";
        let map = vec![entry(OpAction::Modify, "mod.ts", diff)];
        let report = apply(&pfs, &mut patcher, &mock, &map).await;
        assert_eq!(report.failed, 1);
        assert!(matches!(report.per_file[0].1, FileOutcome::Failed(_)));
        // File untouched.
        assert_eq!(pfs.read("mod.ts").unwrap().unwrap(), "actual\n");
    }

    #[tokio::test]
    async fn test_apply_order_matches_plan_order() {
        let (_dir, pfs, mut patcher) = fixture();
        let mock = MockClient::new();
        let map = vec![
            entry(OpAction::Create, "b.ts", "b\n"),
            entry(OpAction::Create, "a.ts", "a\n"),
        ];
        let report = apply(&pfs, &mut patcher, &mock, &map).await;
        let order: Vec<&str> = report.per_file.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(order, vec!["b.ts", "a.ts"]);
    }
}
