/// Context construction for model prompts.
///
/// Three modes:
///   full           — every text file, whitespace-optimized, no cap
///   analysis_cache — the per-file summaries from the analysis cache
///   dynamic        — model-selected relevant files under a token budget
///
/// Dynamic mode asks the secondary model which files matter for the current
/// query, then loads exactly those, skipping anything that would blow the
/// prompt budget. When selection fails or returns nothing, the cache
/// summary is the fallback.
use crate::analyzer::{AnalysisCache, FileKind};
use crate::client::ModelClient;
use crate::conversation::Message;
use crate::project_fs::{to_posix, ProjectFs};
use crate::tokens;

/// Fixed overhead assumed for the system instruction and prompt scaffolding
/// when computing the dynamic-mode file budget.
const BASE_PROMPT_OVERHEAD: usize = 500;
/// Tail of the conversation included in the relevance prompt.
const HISTORY_TAIL: usize = 4;
/// Per-message preview length in the history summary.
const HISTORY_PREVIEW_CHARS: usize = 100;
/// Summary preview length in the file catalog.
const CATALOG_SUMMARY_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct ContextResult {
    pub text: String,
    pub token_count: usize,
}

impl ContextResult {
    fn from_text(text: String) -> Self {
        let token_count = tokens::estimate(&text);
        Self { text, token_count }
    }
}

pub struct ContextBuilder<'a> {
    fs: &'a ProjectFs,
    client: &'a dyn ModelClient,
    max_prompt_tokens: usize,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(fs: &'a ProjectFs, client: &'a dyn ModelClient, max_prompt_tokens: usize) -> Self {
        Self { fs, client, max_prompt_tokens }
    }

    // ── Full mode ─────────────────────────────────────────────────────────────

    /// Whole codebase, uncapped. Files that optimize down to nothing are
    /// skipped.
    pub fn build_full(&self) -> ContextResult {
        let mut text = String::from("Code Base Context:\n");
        for rel in self.fs.enumerate() {
            let Ok(Some(content)) = self.fs.read(&rel) else {
                continue;
            };
            let optimized = optimize_whitespace(&content);
            if optimized.is_empty() {
                continue;
            }
            text.push_str(&file_block(&rel, &optimized));
        }
        ContextResult::from_text(text)
    }

    // ── Analysis-cache mode ───────────────────────────────────────────────────

    pub fn build_from_cache(&self, cache: &AnalysisCache) -> ContextResult {
        let mut text = String::from("Project Analysis Overview:\n");
        text.push_str(cache.overall_summary.as_deref().unwrap_or("(No overall summary)"));
        text.push_str("\n\nFile Details:\n");
        for entry in &cache.entries {
            let tag = match entry.kind {
                FileKind::Binary => " [binary]",
                FileKind::TextLarge => " [large]",
                FileKind::TextAnalyze => "",
            };
            let loc = entry.loc.map(|n| format!(", {n} LOC")).unwrap_or_default();
            let summary = entry.summary.as_deref().unwrap_or("(Not summarized)");
            text.push_str(&format!(
                "- {}{tag} ({:.1} KB{loc}): {summary}\n",
                entry.file_path,
                entry.size as f64 / 1024.0,
            ));
        }
        ContextResult::from_text(text)
    }

    // ── Dynamic mode ──────────────────────────────────────────────────────────

    /// Token-budgeted context from model-selected files. Never fails: any
    /// problem with selection degrades to the cache summary.
    pub async fn build_dynamic(
        &self,
        cache: &AnalysisCache,
        query: &str,
        history: &[Message],
    ) -> ContextResult {
        let history_summary = history_summary(history);
        let base_estimate =
            tokens::estimate(query) + tokens::estimate(&history_summary) + BASE_PROMPT_OVERHEAD;
        let file_budget = self.max_prompt_tokens.saturating_sub(base_estimate);

        let prompt = relevance_prompt(cache, query, &history_summary, file_budget);
        let selection = match self.client.raw_text(&prompt, true).await {
            Ok(response) => sanitize_selection(&response),
            Err(e) => {
                tracing::warn!("relevance selection failed, falling back to cache summary: {e}");
                return self.build_from_cache(cache);
            }
        };

        if selection.is_empty() {
            tracing::info!("relevance selection returned no files, using cache summary");
            return self.build_from_cache(cache);
        }

        let mut text = String::from("Code Base Context:\n");
        let mut total = base_estimate + tokens::estimate(&text);
        let mut included = 0usize;
        for rel in &selection {
            let Ok(Some(content)) = self.fs.read(rel) else {
                tracing::warn!(file = %rel, "selected file unreadable, skipping");
                continue;
            };
            let block = file_block(rel, &optimize_whitespace(&content));
            let block_tokens = tokens::estimate(&block);
            if total + block_tokens > self.max_prompt_tokens {
                tracing::warn!(file = %rel, "selected file exceeds remaining budget, skipping");
                continue;
            }
            text.push_str(&block);
            total += block_tokens;
            included += 1;
        }

        if included == 0 {
            return self.build_from_cache(cache);
        }
        ContextResult::from_text(text)
    }

    /// Would the full context fit under the prompt cap?
    pub fn full_fits(&self) -> bool {
        self.build_full().token_count <= self.max_prompt_tokens
    }

    /// Does the cache's own formatted form fit under the prompt cap?
    pub fn cache_fits(&self, cache: &AnalysisCache) -> bool {
        self.build_from_cache(cache).token_count <= self.max_prompt_tokens
    }
}

// ── Formatting helpers ────────────────────────────────────────────────────────

fn file_block(rel: &str, content: &str) -> String {
    format!("\n---\nFile: {rel}\n```\n{content}\n```\n")
}

/// Strip trailing horizontal whitespace per line, collapse runs of three or
/// more newlines to two, normalize CRLF, trim the whole string.
pub fn optimize_whitespace(s: &str) -> String {
    let unified = s.replace("\r\n", "\n");
    let mut out = unified
        .split('\n')
        .map(|line| line.trim_end_matches([' ', '\t']))
        .collect::<Vec<_>>()
        .join("\n");
    while out.contains("\n\n\n") {
        out = out.replace("\n\n\n", "\n\n");
    }
    out.trim().to_string()
}

/// Tail of the conversation with per-message previews, for the relevance
/// prompt.
fn history_summary(history: &[Message]) -> String {
    let tail = history.len().saturating_sub(HISTORY_TAIL);
    history[tail..]
        .iter()
        .map(|m| {
            let preview: String = m.content.chars().take(HISTORY_PREVIEW_CHARS).collect();
            format!("{}: {preview}", m.role)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn relevance_prompt(
    cache: &AnalysisCache,
    query: &str,
    history_summary: &str,
    file_budget: usize,
) -> String {
    let mut catalog = String::new();
    for entry in &cache.entries {
        let summary: String = entry
            .summary
            .as_deref()
            .unwrap_or("")
            .chars()
            .take(CATALOG_SUMMARY_CHARS)
            .collect();
        let kind = match entry.kind {
            FileKind::Binary => "binary",
            FileKind::TextLarge => "large",
            FileKind::TextAnalyze => "source",
        };
        catalog.push_str(&format!(
            "{} ({kind}, {:.1} KB): {summary}\n",
            entry.file_path,
            entry.size as f64 / 1024.0
        ));
    }

    let history_section = if history_summary.is_empty() {
        String::new()
    } else {
        format!("\nRecent conversation:\n{history_summary}\n")
    };

    format!(
        "You select which project files are relevant to a request.\n\n\
         Available files:\n{catalog}\n\
         Request: {query}\n{history_section}\n\
         The selected files must fit within roughly {file_budget} tokens.\n\
         Reply with one relative file path per line, most relevant first. \
         Reply with the single word NONE if no file content is needed."
    )
}

/// Normalize separators, drop escapes and absolutes, dedupe preserving
/// order. `NONE` (or nothing usable) yields an empty list.
fn sanitize_selection(response: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in response.lines() {
        let candidate = line.trim().trim_matches('`');
        if candidate.is_empty() || candidate.eq_ignore_ascii_case("none") {
            continue;
        }
        let posix = to_posix(candidate);
        if posix.is_empty() || posix.starts_with("..") || posix.starts_with('/') {
            continue;
        }
        if !out.contains(&posix) {
            out.push(posix);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalysisCacheEntry;
    use crate::client::testing::MockClient;
    use crate::conversation::Role;

    fn fixture() -> (tempfile::TempDir, ProjectFs) {
        let dir = tempfile::tempdir().unwrap();
        let pfs = ProjectFs::new(dir.path(), ".kai/logs", ".kai/project_analysis.json");
        (dir, pfs)
    }

    fn cache_with(paths: &[&str]) -> AnalysisCache {
        AnalysisCache {
            overall_summary: Some("A demo project.".to_string()),
            entries: paths
                .iter()
                .map(|p| AnalysisCacheEntry {
                    file_path: p.to_string(),
                    kind: FileKind::TextAnalyze,
                    size: 512,
                    loc: Some(20),
                    summary: Some(format!("Summary of {p}")),
                    last_analyzed: "2024-01-01T00:00:00Z".to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_optimize_whitespace() {
        let input = "line one   \r\nline two\t\n\n\n\nline three\n";
        assert_eq!(optimize_whitespace(input), "line one\nline two\n\nline three");
    }

    #[test]
    fn test_full_mode_includes_fenced_files() {
        let (_dir, pfs) = fixture();
        pfs.write("src/a.ts", "const a = 1;   \n").unwrap();
        pfs.write("empty.ts", "   \n\n").unwrap();
        let mock = MockClient::new();
        let builder = ContextBuilder::new(&pfs, &mock, 32_000);
        let result = builder.build_full();
        assert!(result.text.starts_with("Code Base Context:\n"));
        assert!(result.text.contains("File: src/a.ts"));
        assert!(result.text.contains("const a = 1;"));
        // Whitespace-only files are skipped entirely.
        assert!(!result.text.contains("empty.ts"));
        assert_eq!(result.token_count, tokens::estimate(&result.text));
    }

    #[test]
    fn test_cache_mode_format() {
        let (_dir, pfs) = fixture();
        let mock = MockClient::new();
        let builder = ContextBuilder::new(&pfs, &mock, 32_000);
        let mut cache = cache_with(&["src/a.ts"]);
        cache.entries.push(AnalysisCacheEntry {
            file_path: "logo.png".to_string(),
            kind: FileKind::Binary,
            size: 2048,
            loc: None,
            summary: None,
            last_analyzed: "t".to_string(),
        });
        let result = builder.build_from_cache(&cache);
        assert!(result.text.starts_with("Project Analysis Overview:\nA demo project."));
        assert!(result.text.contains("File Details:"));
        assert!(result.text.contains("src/a.ts (0.5 KB, 20 LOC): Summary of src/a.ts"));
        assert!(result.text.contains("logo.png [binary] (2.0 KB): (Not summarized)"));
    }

    #[tokio::test]
    async fn test_dynamic_includes_exactly_selected_files() {
        let (_dir, pfs) = fixture();
        pfs.write("src/auth.ts", "export function auth() {}\n").unwrap();
        pfs.write("src/middleware/auth_mw.ts", "export const mw = 1;\n").unwrap();
        pfs.write("src/unrelated.ts", "export const nope = 0;\n").unwrap();

        let mock = MockClient::new();
        mock.push_raw("src/auth.ts\nsrc/middleware/auth_mw.ts\n");
        let builder = ContextBuilder::new(&pfs, &mock, 32_000);
        let cache = cache_with(&["src/auth.ts", "src/middleware/auth_mw.ts", "src/unrelated.ts"]);
        let history = vec![Message {
            role: Role::User,
            content: "Where is auth?".to_string(),
            timestamp: "t".to_string(),
        }];
        let result = builder.build_dynamic(&cache, "Where is auth?", &history).await;

        assert!(result.text.contains("File: src/auth.ts"));
        assert!(result.text.contains("File: src/middleware/auth_mw.ts"));
        assert!(!result.text.contains("unrelated"));
        assert!(result.token_count <= 32_000);
    }

    #[tokio::test]
    async fn test_dynamic_none_falls_back_to_cache() {
        let (_dir, pfs) = fixture();
        let mock = MockClient::new();
        mock.push_raw("NONE");
        let builder = ContextBuilder::new(&pfs, &mock, 32_000);
        let cache = cache_with(&["src/a.ts"]);
        let result = builder.build_dynamic(&cache, "anything", &[]).await;
        assert!(result.text.starts_with("Project Analysis Overview:"));
    }

    #[tokio::test]
    async fn test_dynamic_relevance_error_falls_back_to_cache() {
        let (_dir, pfs) = fixture();
        let mock = MockClient::new();
        mock.push_raw_err(crate::error::ModelErrorKind::SafetyBlock);
        let builder = ContextBuilder::new(&pfs, &mock, 32_000);
        let cache = cache_with(&["src/a.ts"]);
        let result = builder.build_dynamic(&cache, "anything", &[]).await;
        assert!(result.text.starts_with("Project Analysis Overview:"));
    }

    #[tokio::test]
    async fn test_dynamic_skips_file_exceeding_budget() {
        let (_dir, pfs) = fixture();
        pfs.write("big.ts", &"x".repeat(4000)).unwrap();
        pfs.write("small.ts", "tiny\n").unwrap();

        let mock = MockClient::new();
        mock.push_raw("big.ts\nsmall.ts\n");
        // Budget is tight: the big file can't fit, the small one can.
        let builder = ContextBuilder::new(&pfs, &mock, 700);
        let cache = cache_with(&["big.ts", "small.ts"]);
        let result = builder.build_dynamic(&cache, "q", &[]).await;
        assert!(!result.text.contains("File: big.ts"));
        assert!(result.text.contains("File: small.ts"));
        assert!(result.token_count <= 700);
    }

    #[test]
    fn test_sanitize_selection() {
        let raw = "src/a.ts\n`src/b.ts`\n../etc/passwd\n/abs/path\nsrc\\win.ts\nsrc/a.ts\n\nNONE\n";
        assert_eq!(
            sanitize_selection(raw),
            vec!["src/a.ts".to_string(), "src/b.ts".to_string(), "src/win.ts".to_string()]
        );
        assert!(sanitize_selection("NONE").is_empty());
        assert!(sanitize_selection("none\n").is_empty());
    }

    #[test]
    fn test_history_summary_tail_four_with_preview() {
        let long = "z".repeat(300);
        let history: Vec<Message> = (0..6)
            .map(|i| Message {
                role: Role::User,
                content: if i == 5 { long.clone() } else { format!("msg {i}") },
                timestamp: "t".to_string(),
            })
            .collect();
        let summary = history_summary(&history);
        assert!(!summary.contains("msg 0"));
        assert!(!summary.contains("msg 1"));
        assert!(summary.contains("msg 2"));
        assert!(summary.contains("msg 4"));
        // Preview capped at 100 chars.
        let last_line = summary.lines().last().unwrap();
        assert!(last_line.len() <= "User: ".len() + 100);
    }
}
