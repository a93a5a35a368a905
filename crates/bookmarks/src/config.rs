use std::path::PathBuf;

/// Default GitHub REST API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// CLI configuration resolved from arguments and environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// GitHub token with the `gist` scope (`GITHUB_TOKEN`)
    pub token: Option<String>,
    /// Gist holding the bookmark document (`BOOKMARKS_GIST_ID`)
    pub gist_id: Option<String>,
    /// Local state file (`BOOKMARKS_STATE`)
    pub state_path: PathBuf,
    pub api_base: String,
}

impl Config {
    /// Build the configuration.
    ///
    /// `state` supports ~ for the home directory and defaults to
    /// `<data dir>/bookmarks/state.json`.
    pub fn new(
        token: Option<String>,
        gist_id: Option<String>,
        state: Option<String>,
        api_base: Option<String>,
    ) -> Result<Self, ConfigError> {
        let state_path = match state.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(path) => expand_tilde(path),
            None => default_state_path()?,
        };
        Ok(Self {
            token: token.filter(|t| !t.trim().is_empty()),
            gist_id: gist_id.filter(|g| !g.trim().is_empty()),
            state_path,
            api_base: api_base
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }

    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.token.as_deref().ok_or(ConfigError::MissingToken)
    }
}

/// `<data dir>/bookmarks/state.json`
pub fn default_state_path() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .map(|dir| dir.join("bookmarks").join("state.json"))
        .ok_or(ConfigError::MissingDataDir)
}

/// Expand ~ or ~/ prefix to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("GITHUB_TOKEN environment variable not set (or pass --token)")]
    MissingToken,

    #[error("Could not determine a data directory; set BOOKMARKS_STATE")]
    MissingDataDir,
}
