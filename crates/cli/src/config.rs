//! Configuration management for the CLI

use crate::output::OutputFormat;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// CLI configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Gate base URL
    pub api_url: Option<String>,
    /// Admin bearer token
    pub token: Option<String>,
    /// Default output format
    pub default_format: Option<String>,
}

impl Config {
    /// Load from `path`, or from the default location when not given. A
    /// missing default file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file {:?}", config_path))?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    /// `~/.config/tgctl/config.json`
    fn default_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("tgctl").join("config.json"))
    }
}

/// Settings after applying flags and environment over the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub api_url: String,
    pub token: Option<String>,
    pub format: OutputFormat,
}

impl Config {
    pub fn resolve(
        self,
        api_url: Option<String>,
        token: Option<String>,
        format: Option<OutputFormat>,
    ) -> Resolved {
        Resolved {
            api_url: api_url
                .or(self.api_url)
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            token: token.or(self.token),
            format: format
                .or_else(|| self.default_format.as_deref().and_then(OutputFormat::from_name))
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flags_override_file() {
        let config = Config {
            api_url: Some("http://gate:9000".to_string()),
            token: Some("from-file".to_string()),
            default_format: Some("json".to_string()),
        };

        let resolved = config.resolve(None, Some("from-flag".to_string()), None);
        assert_eq!(resolved.api_url, "http://gate:9000");
        assert_eq!(resolved.token.as_deref(), Some("from-flag"));
        assert_eq!(resolved.format, OutputFormat::Json);
    }

    #[test]
    fn test_defaults_without_file() {
        let resolved = Config::default().resolve(None, None, None);
        assert_eq!(resolved.api_url, DEFAULT_API_URL);
        assert_eq!(resolved.token, None);
        assert_eq!(resolved.format, OutputFormat::Table);
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tgctl.json");
        std::fs::write(&path, r#"{"api_url":"http://gate:9000"}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.api_url.as_deref(), Some("http://gate:9000"));

        assert!(Config::load(Some(&dir.path().join("missing.json"))).is_err());
    }
}
