//! Configuration
//!
//! Defaults, then an optional TOML file, then `TETHER_*` environment
//! overrides, in that order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    /// Resident capacity of each pool map
    pub pool_capacity: usize,
    pub max_turns: u32,
    /// Registered project roots; empty disables scope checks
    pub project_roots: Vec<PathBuf>,
    /// Model ids dispatched through the terminal-class runner
    pub terminal_models: Vec<String>,
    pub api_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            pool_capacity: 8,
            max_turns: 24,
            project_roots: Vec::new(),
            terminal_models: vec![
                "claude".to_string(),
                "gemini".to_string(),
                "codex".to_string(),
            ],
            api_url: "https://api.deepseek.com/v1/chat/completions".to_string(),
            api_key: None,
            default_model: "deepseek-chat".to_string(),
        }
    }
}

impl Config {
    /// Load: defaults <- optional TOML file <- environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match file.map(PathBuf::from).or_else(default_config_path) {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config at {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Invalid config at {}", path.display()))?
            }
            _ => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("TETHER_DATABASE_URL") {
            self.database_url = val;
        }
        if let Ok(val) = std::env::var("TETHER_POOL_CAPACITY") {
            if let Ok(capacity) = val.parse() {
                self.pool_capacity = capacity;
            }
        }
        if let Ok(val) = std::env::var("TETHER_MAX_TURNS") {
            if let Ok(max_turns) = val.parse() {
                self.max_turns = max_turns;
            }
        }
        if let Ok(val) = std::env::var("TETHER_PROJECT_ROOTS") {
            self.project_roots = std::env::split_paths(&val).collect();
        }
        if let Ok(val) = std::env::var("TETHER_TERMINAL_MODELS") {
            self.terminal_models = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(val) = std::env::var("TETHER_API_URL") {
            self.api_url = val;
        }
        if let Ok(val) = std::env::var("TETHER_API_KEY") {
            self.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("TETHER_MODEL") {
            self.default_model = val;
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tether").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pool_capacity, 8);
        assert_eq!(config.max_turns, 24);
        assert!(config.project_roots.is_empty());
    }

    #[test]
    fn test_toml_overrides_merge_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            pool_capacity = 2
            terminal_models = ["claude"]
            "#,
        )
        .unwrap();
        assert_eq!(config.pool_capacity, 2);
        assert_eq!(config.terminal_models, vec!["claude"]);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_turns, 24);
    }
}
