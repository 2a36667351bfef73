/// Iterative diff repair: when a diff fails to apply, show the model the
/// broken diff, the current file and the failure reason, and ask for a
/// corrected diff. Always uses the primary model. An empty response ends
/// the loop immediately.
use crate::client::{strip_code_fence, ModelClient};
use crate::patch::PatchEngine;
use crate::project_fs::ProjectFs;

pub const MAX_REPAIR_ATTEMPTS: u32 = 10;

/// Returns `true` iff a corrected diff ultimately applied.
pub async fn repair(
    client: &dyn ModelClient,
    fs: &ProjectFs,
    patcher: &mut PatchEngine,
    path: &str,
    broken_diff: &str,
) -> bool {
    let mut diff = broken_diff.to_string();

    for attempt in 1..=MAX_REPAIR_ATTEMPTS {
        let error = patcher
            .last_failure()
            .map(|f| f.error.clone())
            .unwrap_or_else(|| "diff did not apply".to_string());
        let current = fs.read(path).ok().flatten().unwrap_or_default();
        let prompt = repair_prompt(path, &current, &diff, &error);

        let response = match client.raw_text(&prompt, false).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path, attempt, "repair call failed: {e}");
                return false;
            }
        };
        let corrected = strip_code_fence(&response).to_string();
        if corrected.trim().is_empty() {
            tracing::warn!(path, attempt, "model returned an empty diff, giving up");
            return false;
        }

        if patcher.apply_diff(fs, path, &corrected) {
            tracing::info!(path, attempt, "repaired diff applied");
            return true;
        }
        diff = corrected;
    }

    tracing::warn!(path, "diff repair exhausted after {MAX_REPAIR_ATTEMPTS} attempts");
    false
}

fn repair_prompt(path: &str, current: &str, diff: &str, error: &str) -> String {
    format!(
        "A unified diff failed to apply to {path}.\n\n\
         Error:\n{error}\n\n\
         Current content of {path}:\n{current}\n\n\
         Broken diff:\n{diff}\n\n\
         Produce a corrected unified diff that applies cleanly to the current \
         content shown above. Respond with the diff only."
    )
}
