/// Content generation: one model call per planned operation, producing the
/// full final file content (or the deletion sentinel).
///
/// Calls for distinct files run concurrently with a bounded degree of
/// parallelism; `buffered` keeps completion in plan order so downstream
/// writes are deterministic regardless of which call finishes first.
use std::time::Duration;

use futures_util::stream::{self, StreamExt, TryStreamExt};

use crate::client::{strip_code_fence, ChatMessage, ModelClient};
use crate::config::Config;
use crate::conversation::{transcript, Message};
use crate::error::KaiError;
use crate::project_fs::ProjectFs;
use crate::prompts::CONSOLIDATION_SYSTEM_PROMPT;

use super::plan::{OpAction, Operation, OperationPlan};

/// Sentinel content marking an operation as a deletion.
pub const DELETE_SENTINEL: &str = "DELETE_FILE";

/// Bounded fan-out for generation calls.
const MAX_CONCURRENT_GENERATIONS: usize = 4;

/// Generated content per operation, in plan order.
pub type FileContentMap = Vec<(Operation, String)>;

pub async fn generate_all(
    client: &dyn ModelClient,
    config: &Config,
    fs: &ProjectFs,
    plan: &OperationPlan,
    context: &str,
    conversation: &[Message],
) -> Result<FileContentMap, KaiError> {
    let history = transcript(conversation);
    stream::iter(
        plan.operations
            .iter()
            .map(|op| generate_one(client, config, fs, op, context, &history)),
    )
    .buffered(MAX_CONCURRENT_GENERATIONS)
    .try_collect()
    .await
}

async fn generate_one(
    client: &dyn ModelClient,
    config: &Config,
    fs: &ProjectFs,
    op: &Operation,
    context: &str,
    history: &str,
) -> Result<(Operation, String), KaiError> {
    if op.action == OpAction::Delete {
        return Ok((op.clone(), DELETE_SENTINEL.to_string()));
    }

    let current = fs.read(&op.file_path)?;
    let prompt = generation_prompt(op, current.as_deref(), context, history);
    let max_attempts = config.model.generation_max_retries + 1;
    let base_delay = Duration::from_millis(config.model.generation_retry_base_delay_ms);

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match client
            .chat(CONSOLIDATION_SYSTEM_PROMPT, &[ChatMessage::user(prompt.clone())], false)
            .await
        {
            Ok(text) => {
                let content = strip_code_fence(&text).to_string();
                if !content.trim().is_empty() {
                    return Ok((op.clone(), content));
                }
                tracing::warn!(file = %op.file_path, attempt, "empty generation response");
            }
            Err(e) => {
                return Err(KaiError::Generation(format!("{}: {e}", op.file_path)));
            }
        }
        if attempt >= max_attempts {
            return Err(KaiError::Generation(format!(
                "empty content for {} after {max_attempts} attempts",
                op.file_path
            )));
        }
        tokio::time::sleep(base_delay * 2u32.saturating_pow(attempt - 1)).await;
    }
}

fn generation_prompt(
    op: &Operation,
    current: Option<&str>,
    context: &str,
    history: &str,
) -> String {
    let mut prompt = format!("{context}\n\nConversation:\n{history}\n\nTarget file: {}\n", op.file_path);
    match current {
        Some(existing) => {
            prompt.push_str(&format!("\nCurrent content of {}:\n{existing}\n", op.file_path));
        }
        None => prompt.push_str("\nThis file does not exist yet.\n"),
    }
    if let Some(rationale) = &op.rationale {
        prompt.push_str(&format!("\nPlanned change: {rationale}\n"));
    }
    prompt.push_str("\nProduce the complete final content of this file.");
    prompt
}
