use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use parley_ai::{ParameterSet, ParleyError, ProviderConfig, ProviderKind};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONF_DIR_NAME: &str = ".parley";
const CONFIG_FILE_NAME: &str = "parley.toml";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEFAULT_TITLE_PROMPT: &str = "Write a short title of at most six words for a conversation \
that starts with the user's message. Reply with the title only, without quotes.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path} failed: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path} failed: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("missing [{0}] section")]
    MissingSection(&'static str),
    #[error("[{section}] {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
    #[error(transparent)]
    Provider(#[from] ParleyError),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ParleyTomlFile {
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    title_prompt: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    log_dir: Option<String>,
    #[serde(default)]
    log_stderr: bool,
    #[serde(default)]
    llm: Option<ParleyTomlLlm>,
    #[serde(default)]
    title_llm: Option<ParleyTomlLlm>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ParleyTomlLlm {
    provider: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    parameters: ParameterSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub level: String,
    pub dir: PathBuf,
    pub stderr: bool,
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub chat: ProviderConfig,
    pub title: ProviderConfig,
    pub log: LogConfig,
}

pub fn default_config_path() -> PathBuf {
    home_dir().join(DEFAULT_CONF_DIR_NAME).join(CONFIG_FILE_NAME)
}

pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: ParleyTomlFile = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    resolve_config(parsed, &|key| env::var(key).ok())
}

/// Parses TOML text, reading env fallbacks through `lookup_env`.
pub fn parse_config(
    content: &str,
    lookup_env: &dyn Fn(&str) -> Option<String>,
) -> Result<AppConfig, ConfigError> {
    let parsed: ParleyTomlFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: PathBuf::from(CONFIG_FILE_NAME),
        source,
    })?;
    resolve_config(parsed, lookup_env)
}

fn resolve_config(
    parsed: ParleyTomlFile,
    lookup_env: &dyn Fn(&str) -> Option<String>,
) -> Result<AppConfig, ConfigError> {
    let llm = parsed.llm.ok_or(ConfigError::MissingSection("llm"))?;
    let system_prompt = non_empty(parsed.system_prompt)
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    let title_prompt =
        non_empty(parsed.title_prompt).unwrap_or_else(|| DEFAULT_TITLE_PROMPT.to_string());

    let chat = provider_config("llm", &llm, system_prompt, lookup_env)?;
    let title = provider_config(
        "title_llm",
        parsed.title_llm.as_ref().unwrap_or(&llm),
        title_prompt,
        lookup_env,
    )?;

    let log = LogConfig {
        level: non_empty(parsed.log_level).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        dir: non_empty(parsed.log_dir)
            .map(|dir| expand_home_path(&dir))
            .unwrap_or_else(default_log_dir),
        stderr: parsed.log_stderr,
    };

    Ok(AppConfig { chat, title, log })
}

fn provider_config(
    section: &'static str,
    llm: &ParleyTomlLlm,
    system_prompt: String,
    lookup_env: &dyn Fn(&str) -> Option<String>,
) -> Result<ProviderConfig, ConfigError> {
    let kind: ProviderKind = llm.provider.parse()?;
    if llm.model.trim().is_empty() {
        return Err(ConfigError::Invalid {
            section,
            message: "`model` is required".to_string(),
        });
    }

    let max_tokens = llm.max_tokens.or(llm.parameters.max_tokens);
    if kind == ProviderKind::Anthropic && max_tokens.is_none() {
        return Err(ConfigError::Invalid {
            section,
            message: "`max_tokens` is required for anthropic".to_string(),
        });
    }

    let base_url = match kind {
        ProviderKind::Ollama => llm.host.clone().or_else(|| lookup_env("OLLAMA_HOST")),
        _ => llm.endpoint.clone().or_else(|| llm.host.clone()),
    };
    let api_key = match api_key_env(kind) {
        Some(var) => non_empty(llm.api_key.clone()).or_else(|| lookup_env(var)),
        None => None,
    };

    let mut config = ProviderConfig::new(kind, llm.model.trim());
    config.base_url = non_empty(base_url);
    config.api_key = non_empty(api_key);
    config.max_tokens = max_tokens;
    config.system_prompt = system_prompt;
    config.params = llm.parameters.clone();
    Ok(config)
}

fn api_key_env(kind: ProviderKind) -> Option<&'static str> {
    match kind {
        ProviderKind::Ollama => None,
        ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
        ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
        ProviderKind::OpenRouter => Some("OPENROUTER_API_KEY"),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn default_log_dir() -> PathBuf {
    home_dir().join(DEFAULT_CONF_DIR_NAME).join("logs")
}

fn expand_home_path(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        return home_dir();
    }
    if let Some(suffix) = trimmed.strip_prefix("~/") {
        return home_dir().join(suffix);
    }
    PathBuf::from(trimmed)
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
