/// The consolidation engine.
///
/// Owns the config, project filesystem and model client, and drives the
/// pass state machine:
///
///   PLAN → GENERATE → APPLY → LOOP(0..n) → (SUCCESS | EXHAUSTED)
///
/// A failing feedback loop appends its log to the conversation as a system
/// message and re-enters generation, up to `autofix_iterations`. Plan,
/// generation and apply failures abort the pass; the conversation log stays
/// consistent either way.
pub mod apply;
pub mod generate;
pub mod plan;
pub mod repair;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::analyzer::{AnalysisCache, ProjectAnalyzer};
use crate::client::{ChatMessage, ModelClient};
use crate::config::{Config, ContextMode};
use crate::context::{ContextBuilder, ContextResult};
use crate::conversation::{ConversationLog, Message, Role};
use crate::error::KaiError;
use crate::feedback::{CoverageLoop, FeedbackLoop, TypeScriptLoop};
use crate::patch::PatchEngine;
use crate::project_fs::ProjectFs;
use crate::prompts::CHAT_SYSTEM_PROMPT;

use apply::ApplyReport;

#[derive(Debug)]
pub enum PassOutcome {
    /// Every operation applied and every applicable loop passed.
    Success(ApplyReport),
    /// Applied, but a feedback loop still failed after the autofix budget.
    Exhausted(ApplyReport),
    Cancelled,
}

pub struct Engine {
    config: Config,
    fs: ProjectFs,
    client: Box<dyn ModelClient>,
    cancel: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: Config, fs: ProjectFs, client: Box<dyn ModelClient>) -> Self {
        Self { config, fs, client, cancel: Arc::new(AtomicBool::new(false)) }
    }

    pub fn fs(&self) -> &ProjectFs {
        &self.fs
    }

    /// Shared flag for cooperative cancellation between stages.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn failure_log(&self) -> String {
        format!("{}/diff_failures.jsonl", self.config.project.chats_dir)
    }

    // ── Chat ──────────────────────────────────────────────────────────────────

    /// Append a user message, call the primary model with built context,
    /// append and return the assistant response.
    pub async fn chat(&self, name: &str, prompt: &str) -> Result<String> {
        self.fs.ensure_gitignore()?;
        let chats_dir = self.config.project.chats_dir.clone();
        let mut log = ConversationLog::open(&self.fs, &chats_dir, name)?;
        log.append(&self.fs, Role::User, prompt)?;

        let context = self.build_context(Some(prompt), log.messages()).await?;
        let system = format!("{CHAT_SYSTEM_PROMPT}\n\n{}", context.text);
        let reply = match self.client.chat(&system, &wire_history(log.messages()), false).await {
            Ok(r) => r,
            Err(e) => {
                log.append_error(&self.fs, e.to_string())?;
                return Err(e.into());
            }
        };
        log.append(&self.fs, Role::Assistant, reply.clone())?;
        Ok(reply)
    }

    // ── Consolidation pass ────────────────────────────────────────────────────

    pub async fn consolidate(&self, name: &str) -> Result<PassOutcome> {
        let failure_log = self.failure_log();
        let typescript = TypeScriptLoop { forced: self.config.project.typescript_autofix };
        let coverage = CoverageLoop {
            client: self.client.as_ref(),
            fs: &self.fs,
            iterations: self.config.project.coverage_iterations,
            failure_log,
        };
        let loops: [&dyn FeedbackLoop; 2] = [&typescript, &coverage];
        self.consolidate_with(name, &loops).await
    }

    pub(crate) async fn consolidate_with(
        &self,
        name: &str,
        loops: &[&dyn FeedbackLoop],
    ) -> Result<PassOutcome> {
        self.fs.ensure_gitignore()?;
        let chats_dir = self.config.project.chats_dir.clone();
        let mut log = ConversationLog::open(&self.fs, &chats_dir, name)?;
        if log.messages().is_empty() {
            anyhow::bail!("conversation '{name}' is empty — chat first, then consolidate");
        }

        let query = last_user_content(log.messages());
        let context = self.build_context(query.as_deref(), log.messages()).await?;
        tracing::info!(tokens = context.token_count, "context built");

        if self.check_cancelled(&log)? {
            return Ok(PassOutcome::Cancelled);
        }

        // ── PLAN ──────────────────────────────────────────────────────────────
        let plan = match plan::build_plan(
            self.client.as_ref(),
            &self.config,
            log.messages(),
            &context.text,
        )
        .await
        {
            Ok(p) => p,
            Err(e) => {
                log.append_error(&self.fs, e.to_string())?;
                return Err(e.into());
            }
        };
        tracing::info!(operations = plan.operations.len(), "plan ready");

        let mut autofix_used = 0u32;
        loop {
            if self.check_cancelled(&log)? {
                return Ok(PassOutcome::Cancelled);
            }

            // ── GENERATE ──────────────────────────────────────────────────────
            let map = match generate::generate_all(
                self.client.as_ref(),
                &self.config,
                &self.fs,
                &plan,
                &context.text,
                log.messages(),
            )
            .await
            {
                Ok(m) => m,
                Err(e) => {
                    log.append_error(&self.fs, e.to_string())?;
                    return Err(e.into());
                }
            };

            if self.check_cancelled(&log)? {
                return Ok(PassOutcome::Cancelled);
            }

            // ── APPLY ─────────────────────────────────────────────────────────
            let mut patcher = PatchEngine::new(self.failure_log());
            let report = apply::apply(&self.fs, &mut patcher, self.client.as_ref(), &map).await;
            if report.failed > 0 {
                let detail = report
                    .per_file
                    .iter()
                    .filter_map(|(p, o)| match o {
                        apply::FileOutcome::Failed(e) => Some(format!("{p}: {e}")),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                log.append_error(&self.fs, format!("apply phase failed: {detail}"))?;
                return Err(KaiError::Patch(detail).into());
            }

            // ── LOOPS ─────────────────────────────────────────────────────────
            let Some((loop_name, loop_log)) = self.run_loops(loops).await else {
                return Ok(PassOutcome::Success(report));
            };

            log.append(
                &self.fs,
                Role::System,
                format!("{loop_name} feedback loop failed:\n{loop_log}"),
            )?;
            autofix_used += 1;
            if autofix_used > self.config.project.autofix_iterations {
                tracing::warn!(loop_name, "autofix budget exhausted");
                return Ok(PassOutcome::Exhausted(report));
            }
            tracing::info!(loop_name, attempt = autofix_used, "re-entering generation");
        }
    }

    /// First failing applicable loop, in declaration order.
    async fn run_loops(&self, loops: &[&dyn FeedbackLoop]) -> Option<(&'static str, String)> {
        for feedback in loops {
            if !feedback.applicable(self.fs.root()) {
                continue;
            }
            let outcome = feedback.run(self.fs.root()).await;
            tracing::info!(name = feedback.name(), success = outcome.success, "feedback loop finished");
            if !outcome.success {
                return Some((feedback.name(), outcome.log));
            }
        }
        None
    }

    fn check_cancelled(&self, log: &ConversationLog) -> Result<bool, KaiError> {
        if !self.cancel.load(Ordering::Relaxed) {
            return Ok(false);
        }
        log.append_error(&self.fs, "consolidation pass cancelled")?;
        tracing::warn!("consolidation pass cancelled");
        Ok(true)
    }

    // ── Context ───────────────────────────────────────────────────────────────

    async fn build_context(
        &self,
        query: Option<&str>,
        history: &[Message],
    ) -> Result<ContextResult> {
        let builder = ContextBuilder::new(
            &self.fs,
            self.client.as_ref(),
            self.config.model.max_prompt_tokens as usize,
        );
        let mode = match self.config.context.mode {
            Some(mode) => mode,
            None => self.auto_mode(&builder).await?,
        };
        match mode {
            ContextMode::Full => Ok(builder.build_full()),
            ContextMode::AnalysisCache => {
                let cache = self.ensure_cache().await?;
                Ok(builder.build_from_cache(&cache))
            }
            ContextMode::Dynamic => {
                let cache = self.ensure_cache().await?;
                Ok(builder.build_dynamic(&cache, query.unwrap_or(""), history).await)
            }
        }
    }

    /// Compute what auto-selection would choose right now, without
    /// persisting anything. `context-mode` runs this, shows the result and
    /// saves it to config once the user confirms.
    pub async fn auto_select_mode(&self) -> Result<ContextMode> {
        let builder = ContextBuilder::new(
            &self.fs,
            self.client.as_ref(),
            self.config.model.max_prompt_tokens as usize,
        );
        self.auto_mode(&builder).await
    }

    /// First-run mode selection: full when it fits, otherwise the cache
    /// summary, otherwise dynamic. Persisting the choice is the caller's
    /// business — nothing is written to config here.
    async fn auto_mode(&self, builder: &ContextBuilder<'_>) -> Result<ContextMode> {
        if builder.full_fits() {
            tracing::info!("auto-selected full context mode");
            return Ok(ContextMode::Full);
        }
        let cache = self.ensure_cache().await?;
        let mode = if builder.cache_fits(&cache) {
            ContextMode::AnalysisCache
        } else {
            ContextMode::Dynamic
        };
        tracing::info!(%mode, "auto-selected context mode");
        Ok(mode)
    }

    async fn ensure_cache(&self) -> Result<AnalysisCache> {
        let cache_path = self.config.analysis.cache_file_path.clone();
        if let Some(cache) = AnalysisCache::load(&self.fs, &cache_path)? {
            return Ok(cache);
        }
        tracing::info!("analysis cache missing, building it now");
        self.analyze().await
    }

    /// Rebuild the analysis cache unconditionally.
    pub async fn analyze(&self) -> Result<AnalysisCache> {
        let analyzer = ProjectAnalyzer::new(
            &self.fs,
            self.client.as_ref(),
            &self.config.analysis.cache_file_path,
        );
        Ok(analyzer.analyze().await?)
    }
}

fn wire_history(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::User => ChatMessage::user(m.content.clone()),
            Role::Assistant => ChatMessage::assistant(m.content.clone()),
            Role::System => ChatMessage::system(m.content.clone()),
        })
        .collect()
}

fn last_user_content(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
}
