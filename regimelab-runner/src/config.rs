//! Configuration file loading.
//!
//! The configuration object is read from TOML or JSON (chosen by file
//! extension) and compiled once; every semantic error surfaces at load with
//! the offending id and context.

use crate::error::RunnerError;
use anyhow::{Context, Result};
use regimelab_core::config::{CompiledConfig, PlatformConfig};
use regimelab_core::engine::BacktestInput;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// On-disk configuration syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "toml" => Some(ConfigFormat::Toml),
            "json" => Some(ConfigFormat::Json),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConfigFormat::Toml => "TOML",
            ConfigFormat::Json => "JSON",
        }
    }
}

/// Parse configuration text without compiling it.
pub fn parse_config(text: &str, format: ConfigFormat) -> Result<PlatformConfig, RunnerError> {
    let parsed = match format {
        ConfigFormat::Toml => toml::from_str(text).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
    };
    parsed.map_err(|message| RunnerError::Parse {
        format: format.name(),
        message,
    })
}

/// Parse and compile configuration text.
pub fn compile_config(text: &str, format: ConfigFormat) -> Result<Arc<CompiledConfig>, RunnerError> {
    let config = parse_config(text, format)?;
    Ok(Arc::new(config.compile()?))
}

/// Read a configuration file.
pub fn load_config(path: &Path) -> Result<PlatformConfig> {
    let format = ConfigFormat::from_path(path).ok_or_else(|| RunnerError::UnsupportedFormat {
        path: path.to_path_buf(),
    })?;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    parse_config(&text, format).with_context(|| format!("Invalid config {}", path.display()))
}

/// Read and compile a configuration file.
pub fn load_compiled(path: &Path) -> Result<Arc<CompiledConfig>> {
    let config = load_config(path)?;
    let compiled = config
        .compile()
        .with_context(|| format!("Config {} failed validation", path.display()))?;
    info!(
        path = %path.display(),
        regimes = compiled.regimes.len(),
        strategy_sets = compiled.strategy_sets.len(),
        rules = compiled.rules.len(),
        config_hash = %compiled.config_hash,
        "config loaded"
    );
    Ok(Arc::new(compiled))
}

/// Read one symbol's bars and snapshots from a JSON dataset file.
pub fn load_input(path: &Path) -> Result<BacktestInput> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset {}", path.display()))?;
    let input: BacktestInput = serde_json::from_str(&text)
        .with_context(|| format!("Failed to deserialize dataset {}", path.display()))?;
    input
        .validate()
        .with_context(|| format!("Dataset {} cannot be simulated", path.display()))?;
    Ok(input)
}
