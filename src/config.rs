//! Generator settings, layered as defaults < JSON file < environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{AssistantError, Result};

pub const CONFIG_FILE_VAR: &str = "QUERY_ASSISTANT_CONFIG";

const DEFAULT_MODEL_ID: &str = "benjamintli/duckdb-sqlcoder-0.5B";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Metal on macOS, CPU elsewhere.
    #[default]
    Auto,
    Cpu,
    Metal,
}

impl FromStr for DevicePreference {
    type Err = AssistantError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "metal" => Ok(DevicePreference::Metal),
            other => Err(AssistantError::Config(format!("unknown device `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub model_id: String,
    pub revision: String,
    pub weights_file: String,
    pub cache_dir: Option<PathBuf>,
    pub device: DevicePreference,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: "main".to_string(),
            weights_file: "model.safetensors".to_string(),
            cache_dir: None,
            device: DevicePreference::Auto,
            max_new_tokens: 256,
            temperature: 0.0,
            repeat_penalty: 1.10,
            repeat_last_n: 64,
            seed: 299792458,
        }
    }
}

impl GeneratorConfig {
    /// Reads the process environment, including the optional config file.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with a caller-supplied variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = match var(CONFIG_FILE_VAR) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(v) = var("QUERY_ASSISTANT_MODEL_ID") {
            config.model_id = v;
        }
        if let Some(v) = var("QUERY_ASSISTANT_REVISION") {
            config.revision = v;
        }
        if let Some(v) = var("QUERY_ASSISTANT_WEIGHTS_FILE") {
            config.weights_file = v;
        }
        if let Some(v) = var("QUERY_ASSISTANT_CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("QUERY_ASSISTANT_DEVICE") {
            config.device = v.parse()?;
        }
        if let Some(v) = var("QUERY_ASSISTANT_MAX_NEW_TOKENS") {
            config.max_new_tokens = parse_var("QUERY_ASSISTANT_MAX_NEW_TOKENS", &v)?;
        }
        if let Some(v) = var("QUERY_ASSISTANT_TEMPERATURE") {
            config.temperature = parse_var("QUERY_ASSISTANT_TEMPERATURE", &v)?;
        }
        if let Some(v) = var("QUERY_ASSISTANT_REPEAT_PENALTY") {
            config.repeat_penalty = parse_var("QUERY_ASSISTANT_REPEAT_PENALTY", &v)?;
        }
        if let Some(v) = var("QUERY_ASSISTANT_REPEAT_LAST_N") {
            config.repeat_last_n = parse_var("QUERY_ASSISTANT_REPEAT_LAST_N", &v)?;
        }
        if let Some(v) = var("QUERY_ASSISTANT_SEED") {
            config.seed = parse_var("QUERY_ASSISTANT_SEED", &v)?;
        }

        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| AssistantError::Config(format!("cannot read {path}: {e}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| AssistantError::Config(format!("cannot parse {path}: {e}")))
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AssistantError::Config(format!("{key}={value}: {e}")))
}
