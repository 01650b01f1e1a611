use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "autolinker/0.2";
pub const DEFAULT_QUERY_LIMIT: usize = 500;
pub const DEFAULT_MAX_TITLES: usize = 10_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_QUERY_LIMIT: usize = 5_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AutolinkConfig {
    #[serde(default)]
    pub autolink: AutolinkSection,
}

/// The `[autolink]` table of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AutolinkSection {
    pub api_url: Option<String>,
    pub query_limit: Option<usize>,
    pub max_titles: Option<usize>,
    pub namespace: Option<i32>,
    #[serde(default)]
    pub exclude_links_to: Vec<String>,
    pub only_within_class_name: Option<String>,
    pub category_name: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Fully resolved settings handed to each component at construction time.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AutolinkSettings {
    pub api_url: Option<String>,
    pub query_limit: usize,
    pub max_titles: usize,
    pub namespace: i32,
    pub exclude_links_to: BTreeSet<String>,
    pub only_within_class_name: Option<String>,
    pub category_name: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl Default for AutolinkSettings {
    fn default() -> Self {
        AutolinkConfig::default().resolve_with_lookup(|_| None)
    }
}

impl AutolinkConfig {
    /// Resolve settings with env > config > default precedence.
    pub fn resolve(&self) -> AutolinkSettings {
        self.resolve_with_lookup(|key| env::var(key).ok())
    }

    pub fn resolve_with_lookup<F>(&self, lookup_env: F) -> AutolinkSettings
    where
        F: Fn(&str) -> Option<String>,
    {
        let section = &self.autolink;
        let env_text = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let env_number = |key: &str| env_text(key).and_then(|value| value.parse::<u64>().ok());

        let api_url = env_text("AUTOLINK_API_URL").or_else(|| non_empty(&section.api_url));
        let query_limit = env_number("AUTOLINK_QUERY_LIMIT")
            .map(|value| usize::try_from(value).unwrap_or(MAX_QUERY_LIMIT))
            .or(section.query_limit)
            .unwrap_or(DEFAULT_QUERY_LIMIT);
        let max_titles = env_number("AUTOLINK_MAX_TITLES")
            .map(|value| usize::try_from(value).unwrap_or(usize::MAX))
            .or(section.max_titles)
            .unwrap_or(DEFAULT_MAX_TITLES);
        let only_within_class_name =
            env_text("AUTOLINK_CLASS_NAME").or_else(|| non_empty(&section.only_within_class_name));
        let category_name =
            env_text("AUTOLINK_CATEGORY").or_else(|| non_empty(&section.category_name));
        let user_agent = env_text("AUTOLINK_USER_AGENT")
            .or_else(|| non_empty(&section.user_agent))
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let timeout_ms = env_number("AUTOLINK_HTTP_TIMEOUT_MS")
            .or(section.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        AutolinkSettings {
            api_url,
            query_limit: clamp_query_limit(query_limit),
            max_titles,
            namespace: section.namespace.unwrap_or(0),
            exclude_links_to: section
                .exclude_links_to
                .iter()
                .map(|title| title.trim().to_string())
                .filter(|title| !title.is_empty())
                .collect(),
            only_within_class_name,
            category_name,
            user_agent,
            timeout_ms,
        }
    }
}

impl AutolinkSettings {
    pub fn is_enabled(&self) -> bool {
        self.api_url.is_some()
    }
}

pub fn clamp_query_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_QUERY_LIMIT)
}

/// Load and parse an AutolinkConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<AutolinkConfig> {
    if !config_path.exists() {
        return Ok(AutolinkConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: AutolinkConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
