/// Plan derivation: conversation + context → an ordered list of file
/// operations, via structured generation.
///
/// The model's JSON is validated before acceptance; an invalid response is
/// retried up to the generation retry budget and then fails the pass with a
/// planning error.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::{ModelClient, StructuredRequest};
use crate::config::Config;
use crate::conversation::{transcript, Message};
use crate::error::KaiError;
use crate::project_fs::to_posix;

// ── Plan data structures ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpAction {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub action: OpAction,
    /// Project-relative POSIX path, unique within a plan.
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OperationPlan {
    pub operations: Vec<Operation>,
}

// ── Generation ────────────────────────────────────────────────────────────────

const PLAN_SYSTEM: &str = r#"You are Kai's consolidation planner. Given a conversation about code changes and the project context, list every file operation required to realize the discussed changes.

Respond with ONLY valid JSON in this exact shape:

{
  "operations": [
    { "action": "CREATE" | "MODIFY" | "DELETE", "filePath": "relative/path", "rationale": "one short sentence" }
  ]
}

Rules:
- filePath is always relative to the project root, POSIX separators
- List an operation only for files that actually need to change
- An empty operations array is valid when the conversation requires no changes"#;

pub async fn build_plan(
    client: &dyn ModelClient,
    config: &Config,
    conversation: &[Message],
    context: &str,
) -> Result<OperationPlan, KaiError> {
    let prompt = plan_prompt(conversation, context);
    let max_attempts = config.model.generation_max_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let value = client
            .generate_structured(&StructuredRequest {
                system: PLAN_SYSTEM.to_string(),
                prompt: prompt.clone(),
                use_secondary: false,
            })
            .await
            .map_err(|e| KaiError::Planning(e.to_string()))?;

        match validate_plan(value) {
            Ok(plan) => return Ok(plan),
            Err(e) => {
                tracing::warn!(attempt, "rejected plan response: {e}");
                last_error = e;
            }
        }
    }

    Err(KaiError::Planning(format!(
        "no valid plan after {max_attempts} attempts: {last_error}"
    )))
}

fn plan_prompt(conversation: &[Message], context: &str) -> String {
    format!(
        "{context}\n\nConversation:\n{}\n\nList the file operations needed to apply every \
         change discussed above.",
        transcript(conversation)
    )
}

// ── Validation ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawPlan {
    operations: Vec<RawOperation>,
}

#[derive(Deserialize)]
struct RawOperation {
    action: String,
    #[serde(rename = "filePath")]
    file_path: String,
    #[serde(default)]
    rationale: Option<String>,
}

/// Normalize and validate the raw response. Unknown actions and escaping
/// paths reject the whole response; duplicate paths merge with the last
/// action winning.
fn validate_plan(value: Value) -> Result<OperationPlan, String> {
    let raw: RawPlan =
        serde_json::from_value(value).map_err(|e| format!("response does not match schema: {e}"))?;

    let mut operations: Vec<Operation> = Vec::new();
    for op in raw.operations {
        let action = match op.action.as_str() {
            "CREATE" => OpAction::Create,
            "MODIFY" => OpAction::Modify,
            "DELETE" => OpAction::Delete,
            other => return Err(format!("unknown action '{other}'")),
        };
        let path = to_posix(&op.file_path);
        if path.is_empty() {
            return Err("empty filePath".to_string());
        }
        if path.starts_with('/') || path.starts_with("..") || path.split('/').any(|c| c == "..") {
            return Err(format!("filePath escapes the project root: '{}'", op.file_path));
        }
        let candidate = Operation { action, file_path: path, rationale: op.rationale };
        match operations.iter_mut().find(|o| o.file_path == candidate.file_path) {
            Some(existing) => *existing = candidate,
            None => operations.push(candidate),
        }
    }

    Ok(OperationPlan { operations })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::MockClient;
    use crate::conversation::Role;
    use serde_json::json;

    fn message(content: &str) -> Message {
        Message { role: Role::User, content: content.to_string(), timestamp: "t".to_string() }
    }

    #[test]
    fn test_validate_accepts_well_formed_plan() {
        let plan = validate_plan(json!({
            "operations": [
                {"action": "CREATE", "filePath": "src/new.ts", "rationale": "requested"},
                {"action": "DELETE", "filePath": "src/old.ts"}
            ]
        }))
        .unwrap();
        assert_eq!(plan.operations.len(), 2);
        assert_eq!(plan.operations[0].action, OpAction::Create);
        assert_eq!(plan.operations[1].rationale, None);
    }

    #[test]
    fn test_validate_rejects_unknown_action() {
        let err = validate_plan(json!({
            "operations": [{"action": "RENAME", "filePath": "a.ts"}]
        }))
        .unwrap_err();
        assert!(err.contains("unknown action"));
    }

    #[test]
    fn test_validate_rejects_escaping_paths() {
        for bad in ["../up.ts", "/abs.ts", "a/../../b.ts"] {
            let result = validate_plan(json!({
                "operations": [{"action": "CREATE", "filePath": bad}]
            }));
            assert!(result.is_err(), "expected rejection for {bad}");
        }
    }

    #[test]
    fn test_validate_normalizes_separators() {
        let plan = validate_plan(json!({
            "operations": [{"action": "MODIFY", "filePath": ".\\src\\a.ts"}]
        }))
        .unwrap();
        assert_eq!(plan.operations[0].file_path, "src/a.ts");
    }

    #[test]
    fn test_validate_duplicate_paths_last_action_wins() {
        let plan = validate_plan(json!({
            "operations": [
                {"action": "CREATE", "filePath": "x.ts"},
                {"action": "MODIFY", "filePath": "y.ts"},
                {"action": "DELETE", "filePath": "x.ts"}
            ]
        }))
        .unwrap();
        assert_eq!(plan.operations.len(), 2);
        assert_eq!(plan.operations[0].file_path, "x.ts");
        assert_eq!(plan.operations[0].action, OpAction::Delete);
    }

    #[tokio::test]
    async fn test_build_plan_retries_invalid_then_succeeds() {
        let mock = MockClient::new();
        mock.push_structured(json!({"operations": [{"action": "BOGUS", "filePath": "a.ts"}]}));
        mock.push_structured(json!({"operations": [{"action": "CREATE", "filePath": "a.ts"}]}));
        let config = Config::default();
        let plan = build_plan(&mock, &config, &[message("add a.ts")], "Code Base Context:\n")
            .await
            .unwrap();
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(mock.structured_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_build_plan_exhausts_to_planning_error() {
        let mock = MockClient::new();
        let mut config = Config::default();
        config.model.generation_max_retries = 1;
        for _ in 0..2 {
            mock.push_structured(json!({"wrong": true}));
        }
        let err = build_plan(&mock, &config, &[message("x")], "ctx").await.unwrap_err();
        assert!(matches!(err, KaiError::Planning(_)));
    }
}
