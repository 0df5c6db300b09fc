use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides `backend.token`.
pub const TOKEN_ENV: &str = "EPW_BACKEND_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub testing: TestingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from(".epw/state.sqlite")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChannelConfig {
    /// Expire correlated requests after this many seconds. Unset means
    /// requests wait for their reply indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TestingConfig {
    #[serde(default = "default_row_limit")]
    pub row_limit: u32,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            row_limit: default_row_limit(),
        }
    }
}

fn default_row_limit() -> u32 {
    100
}

impl Config {
    /// A config pointing at `base_url` with every other section defaulted.
    pub fn for_backend(base_url: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig {
                base_url: base_url.into(),
                token: None,
                timeout_secs: default_timeout_secs(),
                max_retries: default_max_retries(),
            },
            workspace: WorkspaceConfig::default(),
            state: StateConfig::default(),
            channel: ChannelConfig::default(),
            testing: TestingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.trim().is_empty() {
            config.backend.token = Some(token);
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let url = &config.backend.base_url;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("backend.base_url must start with http:// or https:// (got '{}')", url);
    }

    if config.backend.timeout_secs == 0 {
        anyhow::bail!("backend.timeout_secs must be > 0");
    }

    if config.testing.row_limit < 1 {
        anyhow::bail!("testing.row_limit must be >= 1");
    }

    if config.channel.request_timeout_secs == Some(0) {
        anyhow::bail!("channel.request_timeout_secs must be > 0 when set");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config("[backend]\nbase_url = \"http://localhost:8080\"\n").unwrap();
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(config.backend.max_retries, 2);
        assert!(config.workspace.roots.is_empty());
        assert_eq!(config.state.path, PathBuf::from(".epw/state.sqlite"));
        assert_eq!(config.testing.row_limit, 100);
        assert!(config.channel.request_timeout_secs.is_none());
    }

    #[test]
    fn full_config_parses() {
        let config = parse_config(
            r#"
[backend]
base_url = "https://flapi.internal"
timeout_secs = 5
max_retries = 0

[workspace]
roots = ["/work/project"]
fallback_dir = "/work/project/.params"

[state]
path = "/tmp/epw.sqlite"

[channel]
request_timeout_secs = 60

[testing]
row_limit = 25
"#,
        )
        .unwrap();
        assert_eq!(config.workspace.roots, vec![PathBuf::from("/work/project")]);
        assert_eq!(
            config.workspace.fallback_dir,
            Some(PathBuf::from("/work/project/.params"))
        );
        assert_eq!(config.channel.request_timeout_secs, Some(60));
        assert_eq!(config.testing.row_limit, 25);
    }

    #[test]
    fn rejects_non_http_base_url() {
        let err = parse_config("[backend]\nbase_url = \"ftp://x\"\n").unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err =
            parse_config("[backend]\nbase_url = \"http://x\"\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }
}
