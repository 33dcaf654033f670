//! Configuration for the pipeline workers.
//!
//! Every worker reads its settings from environment variables once at
//! startup. All keys are optional and fall back to development defaults,
//! so a bare `cargo run` against a local Redis works out of the box.

use std::env;

use crate::error::{PipelineError, Result};

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Self {
        match value {
            "production" => Self::Production,
            _ => Self::Development,
        }
    }
}

/// Settings shared by every worker.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Deployment environment (development | production).
    pub environment: Environment,
    /// Log level passed to the tracing filter (DEBUG | INFO | WARNING | ERROR).
    pub log_level: String,
    /// Redis connection URL for the stream bus.
    pub redis_url: String,
    /// Whether the proactive rules loop runs.
    pub enable_proactive_rules: bool,
}

impl Settings {
    /// Load shared settings from the environment.
    pub fn from_env() -> Self {
        Self {
            environment: Environment::parse(&var_or("ENVIRONMENT", "development")),
            log_level: var_or("LOG_LEVEL", "INFO"),
            redis_url: var_or("REDIS_URL", "redis://localhost:6379"),
            enable_proactive_rules: bool_var_or("ENABLE_PROACTIVE_RULES", true),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    /// Translate the configured log level into a tracing directive.
    pub fn tracing_directive(&self) -> &'static str {
        match self.log_level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" => "warn",
            "ERROR" => "error",
            _ => "info",
        }
    }
}

/// Gateway worker settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub base: Settings,
    /// Bind address for the HTTP/WebSocket listener.
    pub host: String,
    /// Listen port.
    pub port: u16,
}

impl GatewaySettings {
    pub fn from_env() -> Result<Self> {
        let port = var_or("GATEWAY_PORT", "8080")
            .parse::<u16>()
            .map_err(|e| PipelineError::Config(format!("invalid GATEWAY_PORT: {e}")))?;
        Ok(Self {
            base: Settings::from_env(),
            host: var_or("GATEWAY_HOST", "0.0.0.0"),
            port,
        })
    }
}

/// ASR worker settings.
#[derive(Debug, Clone)]
pub struct AsrSettings {
    pub base: Settings,
    /// Recognizer model identifier (e.g. `tiny.en`).
    pub whisper_model: String,
    /// Device hint forwarded to the engine (`cpu` | `cuda`).
    pub whisper_device: String,
    /// Base URL of the recognizer engine endpoint.
    pub whisper_url: String,
}

impl AsrSettings {
    pub fn from_env() -> Self {
        Self {
            base: Settings::from_env(),
            whisper_model: var_or("WHISPER_MODEL", "tiny.en"),
            whisper_device: var_or("WHISPER_DEVICE", "cpu"),
            whisper_url: var_or("WHISPER_URL", "http://localhost:8178"),
        }
    }
}

/// LLM worker settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base: Settings,
    /// Backend selector; only `ollama` is currently implemented.
    pub llm_backend: String,
    /// Base URL of the Ollama server.
    pub ollama_url: String,
    /// Model name requested from the backend.
    pub llm_model: String,
}

impl LlmSettings {
    pub fn from_env() -> Self {
        Self {
            base: Settings::from_env(),
            llm_backend: var_or("LLM_BACKEND", "ollama"),
            ollama_url: var_or("OLLAMA_URL", "http://localhost:11434"),
            llm_model: var_or("LLM_MODEL", "qwen2:0.5b"),
        }
    }
}

/// TTS worker settings.
#[derive(Debug, Clone)]
pub struct TtsSettings {
    pub base: Settings,
    /// Voice identifier requested from the synthesizer.
    pub piper_voice: String,
    /// Local directory for voice model files.
    pub piper_model_path: String,
    /// Base URL of the synthesizer engine endpoint.
    pub piper_url: String,
}

impl TtsSettings {
    pub fn from_env() -> Self {
        Self {
            base: Settings::from_env(),
            piper_voice: var_or("PIPER_VOICE", "en_US-lessac-medium"),
            piper_model_path: var_or("PIPER_MODEL_PATH", "./models"),
            piper_url: var_or("PIPER_URL", "http://localhost:5000"),
        }
    }
}

/// Orchestrator worker settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub base: Settings,
    /// Path of the SQLite conversation store.
    pub database_path: String,
    /// Path of the YAML proactive-rules file.
    pub rules_config_path: String,
}

impl OrchestratorSettings {
    pub fn from_env() -> Self {
        Self {
            base: Settings::from_env(),
            database_path: var_or("DATABASE_PATH", "./data/hearth.db"),
            rules_config_path: var_or("RULES_CONFIG_PATH", "./config/rules/default_rules.yaml"),
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn bool_var_or(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let s = Settings {
            environment: Environment::Development,
            log_level: "INFO".to_owned(),
            redis_url: "redis://localhost:6379".to_owned(),
            enable_proactive_rules: true,
        };
        assert!(s.is_development());
        assert_eq!(s.tracing_directive(), "info");
    }

    #[test]
    fn environment_parses_production() {
        assert_eq!(Environment::parse("production"), Environment::Production);
        assert_eq!(Environment::parse("anything-else"), Environment::Development);
    }

    #[test]
    fn log_levels_map_to_directives() {
        let mut s = Settings::from_env();
        s.log_level = "DEBUG".to_owned();
        assert_eq!(s.tracing_directive(), "debug");
        s.log_level = "WARNING".to_owned();
        assert_eq!(s.tracing_directive(), "warn");
        s.log_level = "ERROR".to_owned();
        assert_eq!(s.tracing_directive(), "error");
    }
}
