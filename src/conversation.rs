/// Append-only conversation logs.
///
/// One JSONL file per named conversation under the chats dir. Every line is
/// a typed entry tagged on `type`; legacy records (`prompt`/`response`
/// instead of `content`) are mapped during load, and anything unreadable is
/// skipped with a warning rather than failing the whole log.
use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::KaiError;
use crate::project_fs::ProjectFs;

// ── Message ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        f.write_str(s)
    }
}

/// Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// ISO-8601.
    pub timestamp: String,
}

/// Plain-text transcript for prompt building.
pub fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Persisted entries ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogEntry {
    Request {
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Legacy field, mapped to `content` on load.
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        timestamp: String,
    },
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Legacy field, mapped to `content` on load.
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        timestamp: String,
    },
    System {
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        timestamp: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        error: String,
        timestamp: String,
    },
}

impl LogEntry {
    /// Entries that carry a usable message become one; errors and records
    /// with no content are skipped (`None`).
    fn into_message(self) -> Option<Message> {
        match self {
            LogEntry::Request { role, content, prompt, timestamp } => {
                let content = non_empty(content.or(prompt))?;
                Some(Message { role: role.unwrap_or(Role::User), content, timestamp })
            }
            LogEntry::Response { role, content, response, timestamp } => {
                let content = non_empty(content.or(response))?;
                Some(Message { role: role.unwrap_or(Role::Assistant), content, timestamp })
            }
            LogEntry::System { content, timestamp, .. } => {
                let content = non_empty(content)?;
                Some(Message { role: Role::System, content, timestamp })
            }
            LogEntry::Error { .. } => None,
        }
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|c| !c.is_empty())
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

// ── Conversation log ──────────────────────────────────────────────────────────

pub struct ConversationLog {
    rel_path: String,
    messages: Vec<Message>,
}

impl ConversationLog {
    /// Open a named conversation, reconstructing the message list from disk.
    /// A missing file is an empty conversation.
    pub fn open(fs: &ProjectFs, chats_dir: &str, name: &str) -> Result<Self, KaiError> {
        let rel_path = format!("{chats_dir}/{name}.jsonl");
        let mut messages = Vec::new();
        for (lineno, line) in fs.read_jsonl(&rel_path)?.iter().enumerate() {
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => {
                    let is_error = matches!(entry, LogEntry::Error { .. });
                    match entry.into_message() {
                        Some(msg) => messages.push(msg),
                        None if is_error => {
                            tracing::warn!(conversation = name, line = lineno + 1, "skipping error entry");
                        }
                        None => {
                            tracing::warn!(
                                conversation = name,
                                line = lineno + 1,
                                "skipping entry with no content"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(conversation = name, line = lineno + 1, "skipping unreadable entry: {e}");
                }
            }
        }
        Ok(Self { rel_path, messages })
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append a message: durable on disk before it appears in memory.
    pub fn append(&mut self, fs: &ProjectFs, role: Role, content: impl Into<String>) -> Result<(), KaiError> {
        let content = content.into();
        let timestamp = now_iso();
        let entry = match role {
            Role::User => LogEntry::Request {
                role: Some(Role::User),
                content: Some(content.clone()),
                prompt: None,
                timestamp: timestamp.clone(),
            },
            Role::Assistant => LogEntry::Response {
                role: Some(Role::Assistant),
                content: Some(content.clone()),
                response: None,
                timestamp: timestamp.clone(),
            },
            Role::System => LogEntry::System {
                role: Some(Role::System),
                content: Some(content.clone()),
                timestamp: timestamp.clone(),
            },
        };
        fs.append_jsonl(&self.rel_path, &entry)?;
        self.messages.push(Message { role, content, timestamp });
        Ok(())
    }

    /// Record an error entry. Not part of the message list.
    pub fn append_error(&self, fs: &ProjectFs, error: impl Into<String>) -> Result<(), KaiError> {
        let entry = LogEntry::Error {
            role: Some(Role::System),
            error: error.into(),
            timestamp: now_iso(),
        };
        fs.append_jsonl(&self.rel_path, &entry)
    }
}

// ── Directory operations ──────────────────────────────────────────────────────

/// The failure log shares the chats dir but is not a conversation.
const NON_CONVERSATION_FILES: &[&str] = &["diff_failures"];

/// Conversation names in the chats dir, sorted.
pub fn list(fs: &ProjectFs, chats_dir: &str) -> Result<Vec<String>, KaiError> {
    let dir = fs.root().join(chats_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = std::fs::read_dir(&dir)?
        .flatten()
        .filter_map(|e| {
            let path: PathBuf = e.path();
            if path.extension().is_some_and(|x| x == "jsonl") {
                path.file_stem().map(|s| s.to_string_lossy().into_owned())
            } else {
                None
            }
        })
        .filter(|name| !NON_CONVERSATION_FILES.contains(&name.as_str()))
        .collect();
    names.sort();
    Ok(names)
}

/// Remove a conversation log. Returns `false` when it didn't exist.
pub fn delete(fs: &ProjectFs, chats_dir: &str, name: &str) -> Result<bool, KaiError> {
    fs.remove(&format!("{chats_dir}/{name}.jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHATS: &str = ".kai/logs";

    fn fixture() -> (tempfile::TempDir, ProjectFs) {
        let dir = tempfile::tempdir().unwrap();
        let pfs = ProjectFs::new(dir.path(), CHATS, ".kai/project_analysis.json");
        (dir, pfs)
    }

    #[test]
    fn test_append_then_load_round_trip() {
        let (_dir, pfs) = fixture();
        let mut log = ConversationLog::open(&pfs, CHATS, "demo").unwrap();
        log.append(&pfs, Role::User, "hello").unwrap();
        log.append(&pfs, Role::Assistant, "hi there").unwrap();
        log.append(&pfs, Role::System, "note").unwrap();

        let reloaded = ConversationLog::open(&pfs, CHATS, "demo").unwrap();
        assert_eq!(reloaded.messages(), log.messages());
        assert_eq!(reloaded.last_message().unwrap().content, "note");
    }

    #[test]
    fn test_legacy_entries_map_to_messages() {
        let (_dir, pfs) = fixture();
        pfs.write(
            &format!("{CHATS}/old.jsonl"),
            concat!(
                "{\"type\":\"request\",\"prompt\":\"x\",\"timestamp\":\"2023-01-01T00:00:00Z\"}\n",
                "{\"type\":\"error\",\"error\":\"boom\",\"timestamp\":\"2023-01-01T00:00:01Z\"}\n",
                "{\"type\":\"response\",\"response\":\"y\",\"timestamp\":\"2023-01-01T00:00:02Z\"}\n",
            ),
        )
        .unwrap();
        let log = ConversationLog::open(&pfs, CHATS, "old").unwrap();
        let messages = log.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "x");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "y");
    }

    #[test]
    fn test_unknown_and_malformed_entries_skipped() {
        let (_dir, pfs) = fixture();
        pfs.write(
            &format!("{CHATS}/noisy.jsonl"),
            concat!(
                "{\"type\":\"telemetry\",\"data\":1}\n",
                "not json at all\n",
                "{\"type\":\"request\",\"role\":\"user\",\"content\":\"kept\",\"timestamp\":\"t\"}\n",
                "{\"type\":\"request\",\"timestamp\":\"t\"}\n",
            ),
        )
        .unwrap();
        let log = ConversationLog::open(&pfs, CHATS, "noisy").unwrap();
        assert_eq!(log.messages().len(), 1);
        assert_eq!(log.messages()[0].content, "kept");
    }

    #[test]
    fn test_load_is_idempotent() {
        let (_dir, pfs) = fixture();
        let mut log = ConversationLog::open(&pfs, CHATS, "idem").unwrap();
        log.append(&pfs, Role::User, "once").unwrap();
        let first = ConversationLog::open(&pfs, CHATS, "idem").unwrap();
        let second = ConversationLog::open(&pfs, CHATS, "idem").unwrap();
        assert_eq!(first.messages(), second.messages());
    }

    #[test]
    fn test_error_entries_not_in_messages() {
        let (_dir, pfs) = fixture();
        let mut log = ConversationLog::open(&pfs, CHATS, "err").unwrap();
        log.append(&pfs, Role::User, "question").unwrap();
        log.append_error(&pfs, "model exploded").unwrap();
        let reloaded = ConversationLog::open(&pfs, CHATS, "err").unwrap();
        assert_eq!(reloaded.messages().len(), 1);
        // The raw file still holds both lines.
        assert_eq!(pfs.read_jsonl(&format!("{CHATS}/err.jsonl")).unwrap().len(), 2);
    }

    #[test]
    fn test_list_excludes_failure_log() {
        let (_dir, pfs) = fixture();
        let mut a = ConversationLog::open(&pfs, CHATS, "alpha").unwrap();
        a.append(&pfs, Role::User, "x").unwrap();
        let mut b = ConversationLog::open(&pfs, CHATS, "beta").unwrap();
        b.append(&pfs, Role::User, "y").unwrap();
        pfs.append_jsonl(&format!("{CHATS}/diff_failures.jsonl"), &serde_json::json!({"file": "f"}))
            .unwrap();
        assert_eq!(list(&pfs, CHATS).unwrap(), vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn test_delete() {
        let (_dir, pfs) = fixture();
        let mut log = ConversationLog::open(&pfs, CHATS, "gone").unwrap();
        log.append(&pfs, Role::User, "x").unwrap();
        assert!(delete(&pfs, CHATS, "gone").unwrap());
        assert!(!delete(&pfs, CHATS, "gone").unwrap());
        assert!(list(&pfs, CHATS).unwrap().is_empty());
    }

    #[test]
    fn test_transcript_format() {
        let messages = vec![
            Message { role: Role::User, content: "a".into(), timestamp: "t".into() },
            Message { role: Role::Assistant, content: "b".into(), timestamp: "t".into() },
        ];
        assert_eq!(transcript(&messages), "User: a\nAssistant: b");
    }
}
