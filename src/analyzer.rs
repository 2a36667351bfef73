/// Project analysis: classify every file, summarize the interesting ones
/// through the secondary model, and persist the result as the analysis
/// cache the context builder reads.
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::client::ModelClient;
use crate::error::KaiError;
use crate::project_fs::ProjectFs;

/// Files above either threshold are catalogued but not summarized.
pub const LARGE_FILE_LOC: usize = 1500;
pub const LARGE_FILE_BYTES: u64 = 200 * 1024;

// ── Cache model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Binary,
    TextLarge,
    TextAnalyze,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisCacheEntry {
    /// Project-relative POSIX path; unique within the cache.
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    /// Size in bytes.
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// ISO-8601.
    #[serde(rename = "lastAnalyzed")]
    pub last_analyzed: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisCache {
    #[serde(rename = "overallSummary", skip_serializing_if = "Option::is_none")]
    pub overall_summary: Option<String>,
    pub entries: Vec<AnalysisCacheEntry>,
}

impl AnalysisCache {
    /// Load the persisted cache; `None` when it hasn't been built yet.
    pub fn load(fs: &ProjectFs, cache_path: &str) -> Result<Option<Self>, KaiError> {
        match fs.read(cache_path)? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| KaiError::Parse(format!("analysis cache: {e}"))),
        }
    }

    pub fn entry(&self, file_path: &str) -> Option<&AnalysisCacheEntry> {
        self.entries.iter().find(|e| e.file_path == file_path)
    }
}

// ── Analyzer ──────────────────────────────────────────────────────────────────

pub struct ProjectAnalyzer<'a> {
    fs: &'a ProjectFs,
    client: &'a dyn ModelClient,
    cache_path: String,
}

impl<'a> ProjectAnalyzer<'a> {
    pub fn new(fs: &'a ProjectFs, client: &'a dyn ModelClient, cache_path: &str) -> Self {
        Self { fs, client, cache_path: cache_path.to_string() }
    }

    /// Full analysis pass. Per-file summarization errors leave the summary
    /// empty and keep going; only IO and serialization problems abort. The
    /// cache lands on disk atomically (tmp + rename).
    pub async fn analyze(&self) -> Result<AnalysisCache, KaiError> {
        let mut entries = Vec::new();

        for rel in self.fs.enumerate_all() {
            let abs = self.fs.resolve(&rel)?;
            let size = std::fs::metadata(&abs).map(|m| m.len()).unwrap_or(0);

            if !self.fs.is_text(&abs) {
                entries.push(entry(rel, FileKind::Binary, size, None, None));
                continue;
            }

            let Some(content) = self.fs.read(&rel)? else {
                continue;
            };
            let loc = content.lines().count();

            if loc > LARGE_FILE_LOC || size > LARGE_FILE_BYTES {
                entries.push(entry(rel, FileKind::TextLarge, size, Some(loc), None));
                continue;
            }

            let summary = match self.client.raw_text(&summarize_prompt(&rel, &content), true).await {
                Ok(text) => Some(text.trim().to_string()),
                Err(e) => {
                    tracing::warn!(file = %rel, "summarization failed, leaving empty: {e}");
                    None
                }
            };
            entries.push(entry(rel, FileKind::TextAnalyze, size, Some(loc), summary));
        }

        let overall_summary = self.overall_summary(&entries).await;
        let cache = AnalysisCache { overall_summary, entries };

        let json = serde_json::to_string_pretty(&cache)
            .map_err(|e| KaiError::Parse(format!("analysis cache serialize: {e}")))?;
        self.fs.write_atomic(&self.cache_path, &json)?;
        tracing::info!(files = cache.entries.len(), "analysis cache written");
        Ok(cache)
    }

    async fn overall_summary(&self, entries: &[AnalysisCacheEntry]) -> Option<String> {
        let per_file: Vec<String> = entries
            .iter()
            .filter_map(|e| e.summary.as_ref().map(|s| format!("{}: {s}", e.file_path)))
            .collect();
        if per_file.is_empty() {
            return None;
        }
        match self.client.raw_text(&overall_prompt(&per_file.join("\n")), true).await {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) => {
                tracing::warn!("overall summary failed, leaving empty: {e}");
                None
            }
        }
    }
}

fn entry(
    file_path: String,
    kind: FileKind,
    size: u64,
    loc: Option<usize>,
    summary: Option<String>,
) -> AnalysisCacheEntry {
    AnalysisCacheEntry {
        file_path,
        kind,
        size,
        loc,
        summary,
        last_analyzed: Utc::now().to_rfc3339(),
    }
}

fn summarize_prompt(path: &str, content: &str) -> String {
    format!(
        "Summarize this source file in 2-3 sentences: what it contains and what role it plays.\n\
         Reply with the summary only.\n\nFile: {path}\n\n{content}"
    )
}

fn overall_prompt(per_file: &str) -> String {
    format!(
        "Below are one-line summaries of every analyzed file in a project. \
         Write a short overview (3-5 sentences) of what this project is and how it is organized.\n\n{per_file}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::MockClient;

    const CACHE: &str = ".kai/project_analysis.json";

    fn fixture() -> (tempfile::TempDir, ProjectFs) {
        let dir = tempfile::tempdir().unwrap();
        let pfs = ProjectFs::new(dir.path(), ".kai/logs", CACHE);
        (dir, pfs)
    }

    #[tokio::test]
    async fn test_classification_and_summaries() {
        let (dir, pfs) = fixture();
        pfs.write("src/small.ts", "export const x = 1;\n").unwrap();
        let big = "const line = 1;\n".repeat(LARGE_FILE_LOC + 1);
        pfs.write("src/huge.ts", &big).unwrap();
        std::fs::write(dir.path().join("logo.png"), [0u8, 1, 2, 0, 255]).unwrap();

        let mock = MockClient::new();
        mock.push_raw("Exports a constant.");
        mock.push_raw("A tiny TypeScript project.");

        let analyzer = ProjectAnalyzer::new(&pfs, &mock, CACHE);
        let cache = analyzer.analyze().await.unwrap();

        let small = cache.entry("src/small.ts").unwrap();
        assert_eq!(small.kind, FileKind::TextAnalyze);
        assert_eq!(small.summary.as_deref(), Some("Exports a constant."));
        assert_eq!(small.loc, Some(1));

        let huge = cache.entry("src/huge.ts").unwrap();
        assert_eq!(huge.kind, FileKind::TextLarge);
        assert!(huge.summary.is_none());

        let png = cache.entry("logo.png").unwrap();
        assert_eq!(png.kind, FileKind::Binary);
        assert!(png.loc.is_none());

        assert_eq!(cache.overall_summary.as_deref(), Some("A tiny TypeScript project."));
    }

    #[tokio::test]
    async fn test_summarize_error_leaves_none_and_continues() {
        let (_dir, pfs) = fixture();
        pfs.write("a.ts", "let a = 1;\n").unwrap();
        pfs.write("b.ts", "let b = 2;\n").unwrap();

        let mock = MockClient::new();
        mock.push_raw_err(crate::error::ModelErrorKind::SafetyBlock);
        mock.push_raw("Declares b.");
        mock.push_raw("Small project.");

        let analyzer = ProjectAnalyzer::new(&pfs, &mock, CACHE);
        let cache = analyzer.analyze().await.unwrap();
        assert!(cache.entry("a.ts").unwrap().summary.is_none());
        assert_eq!(cache.entry("b.ts").unwrap().summary.as_deref(), Some("Declares b."));
    }

    #[tokio::test]
    async fn test_cache_persisted_and_reloadable() {
        let (_dir, pfs) = fixture();
        pfs.write("x.ts", "export {};\n").unwrap();
        let mock = MockClient::new();
        mock.push_raw("Empty module.");
        mock.push_raw("Overview.");

        ProjectAnalyzer::new(&pfs, &mock, CACHE).analyze().await.unwrap();
        let loaded = AnalysisCache::load(&pfs, CACHE).unwrap().unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.overall_summary.as_deref(), Some("Overview."));

        // Wire format uses the documented field names.
        let raw = pfs.read(CACHE).unwrap().unwrap();
        assert!(raw.contains("\"filePath\""));
        assert!(raw.contains("\"lastAnalyzed\""));
        assert!(raw.contains("\"overallSummary\""));
        assert!(raw.contains("\"text_analyze\""));
    }

    #[test]
    fn test_load_missing_cache_is_none() {
        let (_dir, pfs) = fixture();
        assert!(AnalysisCache::load(&pfs, CACHE).unwrap().is_none());
    }
}
