/// Project configuration, persisted as YAML at `.kai/config.yaml`.
///
/// Every field has a default so a missing file (or a partial one) resolves
/// cleanly. Unknown keys are tolerated. The API key never lives in the file —
/// it comes from the `PRIMARY_MODEL_API_KEY` environment variable.
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KaiError;

pub const CONFIG_FILE: &str = ".kai/config.yaml";
pub const API_KEY_ENV: &str = "PRIMARY_MODEL_API_KEY";
pub const ENDPOINT_ENV: &str = "KAI_MODEL_ENDPOINT";

// ── Context mode ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    Full,
    AnalysisCache,
    Dynamic,
}

impl FromStr for ContextMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ContextMode::Full),
            "analysis_cache" => Ok(ContextMode::AnalysisCache),
            "dynamic" => Ok(ContextMode::Dynamic),
            other => Err(format!(
                "unknown context mode '{other}' (expected full, analysis_cache or dynamic)"
            )),
        }
    }
}

impl fmt::Display for ContextMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextMode::Full => "full",
            ContextMode::AnalysisCache => "analysis_cache",
            ContextMode::Dynamic => "dynamic",
        };
        f.write_str(s)
    }
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Identifier of the primary model, used for planning and generation.
    #[serde(default = "default_primary_name")]
    pub primary_name: String,
    /// Cheaper/faster model used for summaries and relevance selection.
    #[serde(default = "default_secondary_name")]
    pub secondary_name: String,
    /// OpenAI-compatible chat completions endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Output cap per call.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Total prompt cap, enforced by the context builder.
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: u32,
    /// Retry budget for generation steps.
    #[serde(default = "default_generation_max_retries")]
    pub generation_max_retries: u32,
    /// Base backoff in milliseconds, doubled per retry.
    #[serde(default = "default_retry_base_delay_ms")]
    pub generation_retry_base_delay_ms: u64,
}

fn default_primary_name() -> String {
    "gpt-4o".to_string()
}

fn default_secondary_name() -> String {
    "gpt-4o-mini".to_string()
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_max_output_tokens() -> u32 {
    8_192
}

fn default_max_prompt_tokens() -> u32 {
    32_000
}

fn default_generation_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            primary_name: default_primary_name(),
            secondary_name: default_secondary_name(),
            endpoint: default_endpoint(),
            max_output_tokens: default_max_output_tokens(),
            max_prompt_tokens: default_max_prompt_tokens(),
            generation_max_retries: default_generation_max_retries(),
            generation_retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Conversation log directory, relative to the project root.
    #[serde(default = "default_chats_dir")]
    pub chats_dir: String,
    /// Enable the TypeScript feedback loop even without a tsconfig.
    #[serde(default)]
    pub typescript_autofix: bool,
    /// Max regeneration cycles per feedback loop failure.
    #[serde(default = "default_autofix_iterations")]
    pub autofix_iterations: u32,
    /// Max iterations for the coverage raiser.
    #[serde(default = "default_coverage_iterations")]
    pub coverage_iterations: u32,
}

fn default_chats_dir() -> String {
    ".kai/logs".to_string()
}

fn default_autofix_iterations() -> u32 {
    2
}

fn default_coverage_iterations() -> u32 {
    3
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            chats_dir: default_chats_dir(),
            typescript_autofix: false,
            autofix_iterations: default_autofix_iterations(),
            coverage_iterations: default_coverage_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Analysis cache path, relative to the project root.
    #[serde(default = "default_cache_file_path")]
    pub cache_file_path: String,
}

fn default_cache_file_path() -> String {
    ".kai/project_analysis.json".to_string()
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cache_file_path: default_cache_file_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Absent means auto-select on first use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ContextMode>,
}

// ── Config file ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub context: ContextConfig,
}

impl Config {
    /// Load from `<root>/.kai/config.yaml`, or return defaults if the file
    /// doesn't exist yet.
    pub fn load(root: &Path) -> Result<Self, KaiError> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| KaiError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Persist to `<root>/.kai/config.yaml` (tmp + rename in the same dir).
    pub fn save(&self, root: &Path) -> Result<(), KaiError> {
        let path = root.join(CONFIG_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| KaiError::Config(format!("failed to serialize config: {e}")))?;
        let tmp = tmp_sibling(&path);
        fs::write(&tmp, yaml)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// The API key is required for every model-calling command.
    pub fn api_key() -> Result<String, KaiError> {
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(KaiError::Config(format!(
                "{API_KEY_ENV} is not set — export it before running model commands"
            ))),
        }
    }

    /// Endpoint, with an optional environment override.
    pub fn endpoint(&self) -> String {
        std::env::var(ENDPOINT_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.model.endpoint.clone())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}
