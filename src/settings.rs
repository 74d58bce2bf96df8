use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{config::ConfigManager, pipeline::PipelineTask};

pub const ENV_HUB_URL: &str = "INTERPRETER_HUB_URL";
pub const ENV_HISTORY_SIZE: &str = "INTERPRETER_HISTORY_SIZE";
pub const ENV_DEBUG: &str = "INTERPRETER_DEBUG";
pub const ENV_STAGE_TIMEOUT: &str = "INTERPRETER_STAGE_TIMEOUT_SECS";

/// Upper bound for `completed_retention_secs` (ten years).
pub const MAX_RETENTION_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings YAML: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error("could not load {task} template {path}: {reason}")]
    Template {
        task: PipelineTask,
        path: PathBuf,
        reason: String,
    },

    #[error("invalid value `{value}` for {key}")]
    Override { key: String, value: String },
}

/// The settings file.
///
/// ```yaml
/// hub:
///   ws_url: ws://localhost:8000/ws/bot
/// interpreter:
///   interpreter_names:
///     rewrite: Interpreter bot 1
///     route: Interpreter bot 2
///     completion: Interpreter bot 3
///   answerers:
///     - name: First bot
///       description: Answers questions about subjects A, B and C.
///   templates:
///     rewrite: prompts/rewrite.hbs
///     route: prompts/route.hbs
///     completion: prompts/completion.hbs
///   history_size: 10
///   debug: false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Settings {
    pub hub: HubSettings,
    pub interpreter: InterpreterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HubSettings {
    /// WebSocket address of the hub (`ws://...`).
    pub ws_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InterpreterSettings {
    /// Display names of the participants doing each interpretation task.
    /// The same participant may do several.
    pub interpreter_names: InterpreterNames,
    /// Answerers in the order the routing prompt numbers them (from 1).
    pub answerers: Vec<AnswererEntry>,
    pub templates: TemplatePaths,
    /// Messages of context given to the prompts. Values below 1 count as 1.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Echo every internal exchange into the conversation.
    #[serde(default)]
    pub debug: bool,
    /// Abort pipelines stuck in one stage for this long. `null` keeps them forever.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: Option<u64>,
    /// Sent to the conversation when a pipeline is aborted. Silent when absent.
    #[serde(default)]
    pub fallback_message: Option<String>,
    /// How long finished pipeline ids are remembered to ignore redelivered questions.
    #[serde(default = "default_retention")]
    pub completed_retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InterpreterNames {
    pub rewrite: String,
    pub route: String,
    pub completion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AnswererEntry {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TemplatePaths {
    pub rewrite: PathBuf,
    pub route: PathBuf,
    pub completion: PathBuf,
}

fn default_history_size() -> usize {
    10
}

fn default_stage_timeout() -> Option<u64> {
    Some(600)
}

fn default_retention() -> u64 {
    3600
}

impl InterpreterNames {
    /// `None` for `Answer`, which has no fixed participant.
    pub fn name_for(&self, task: PipelineTask) -> Option<&str> {
        match task {
            PipelineTask::Rewrite => Some(&self.rewrite),
            PipelineTask::Route => Some(&self.route),
            PipelineTask::Completion => Some(&self.completion),
            PipelineTask::Answer => None,
        }
    }
}

impl TemplatePaths {
    pub fn path_for(&self, task: PipelineTask) -> Option<&Path> {
        match task {
            PipelineTask::Rewrite => Some(&self.rewrite),
            PipelineTask::Route => Some(&self.route),
            PipelineTask::Completion => Some(&self.completion),
            PipelineTask::Answer => None,
        }
    }

    fn resolve_against(&mut self, base: &Path) {
        for path in [&mut self.rewrite, &mut self.route, &mut self.completion] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

impl InterpreterSettings {
    pub fn effective_history_size(&self) -> usize {
        self.history_size.max(1)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

impl Settings {
    /// Read, parse and validate a settings file. Relative template paths are
    /// taken relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings = Self::from_yaml_str(&text)?;
        if let Some(base) = path.parent() {
            settings.interpreter.templates.resolve_against(base);
        }
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, SettingsError> {
        Ok(serde_yaml_bw::from_str(text)?)
    }

    /// Apply `INTERPRETER_*` overrides.
    pub async fn apply_overrides(&mut self, config: &ConfigManager) -> Result<(), SettingsError> {
        if let Some(url) = config.get(ENV_HUB_URL).await {
            self.hub.ws_url = url;
        }
        if let Some(value) = config.get(ENV_HISTORY_SIZE).await {
            self.interpreter.history_size = parse_override(ENV_HISTORY_SIZE, &value)?;
        }
        if let Some(value) = config.get(ENV_DEBUG).await {
            self.interpreter.debug = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(override_error(ENV_DEBUG, &value)),
            };
        }
        if let Some(value) = config.get(ENV_STAGE_TIMEOUT).await {
            self.interpreter.stage_timeout_secs = match value.trim() {
                "" | "none" | "off" => None,
                v => Some(parse_override(ENV_STAGE_TIMEOUT, v)?),
            };
        }
        Ok(())
    }

    /// Checks that need nothing but the settings themselves.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let url = self.hub.ws_url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SettingsError::Invalid(format!(
                "hub.ws_url must start with ws:// or wss://, got `{url}`"
            )));
        }

        let names = &self.interpreter.interpreter_names;
        for task in PipelineTask::INTERPRETED {
            if names.name_for(task).is_some_and(|n| n.trim().is_empty()) {
                return Err(SettingsError::Invalid(format!("interpreter name for {task} is empty")));
            }
        }

        if self.interpreter.answerers.is_empty() {
            return Err(SettingsError::Invalid("at least one answerer is required".into()));
        }
        let mut seen = HashSet::new();
        for answerer in &self.interpreter.answerers {
            if !seen.insert(answerer.name.as_str()) {
                return Err(SettingsError::Invalid(format!(
                    "answerer `{}` is listed twice",
                    answerer.name
                )));
            }
        }

        let retention = self.interpreter.completed_retention_secs;
        if retention > MAX_RETENTION_SECS {
            return Err(SettingsError::Invalid(format!(
                "completed_retention_secs must be at most {MAX_RETENTION_SECS}, got {retention}"
            )));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| override_error(key, value))
}

fn override_error(key: &str, value: &str) -> SettingsError {
    SettingsError::Override {
        key: key.to_string(),
        value: value.to_string(),
    }
}
