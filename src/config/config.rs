use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub editor: EditorConfig,
    pub behavior: BehaviorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root of the explorer app, e.g. "http://localhost:8000/explorer/"
    pub base_url: String,

    /// Connection alias used until `\connect` picks another
    pub default_connection: String,

    /// Name of the CSRF cookie when the page does not advertise one
    pub csrf_cookie_name: String,

    /// Read the token from the page's hidden form field instead of the cookie
    pub csrf_cookie_httponly: bool,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Quiet period before re-matching tables after an editor change
    pub doc_changed_debounce_ms: u64,

    /// Quiet period before re-matching tables after assistant input
    pub request_input_debounce_ms: u64,

    /// Highlight SQL when printing the buffer
    pub syntax_highlighting: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Enable REPL line history
    pub enable_history: bool,

    /// Maximum history entries
    pub max_history_entries: usize,

    /// Where `\export` drops pivot.csv (defaults to the downloads dir)
    pub download_dir: Option<PathBuf>,

    /// Open the assistant panel on start even without a database error
    pub expand_assistant: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/explorer/".to_string(),
            default_connection: "default".to_string(),
            csrf_cookie_name: "csrftoken".to_string(),
            csrf_cookie_httponly: false,
            timeout_secs: 60,
        }
    }
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            doc_changed_debounce_ms: 500,
            request_input_debounce_ms: 300,
            syntax_highlighting: true,
        }
    }
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            enable_history: true,
            max_history_entries: 500,
            download_dir: None,
            expand_assistant: false,
        }
    }
}

impl Config {
    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        if !config_path.exists() {
            return Ok(Self::default().with_env_overrides());
        }
        Self::load_from(&config_path).map(Self::with_env_overrides)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// `EXPLORER_URL` wins over the file so scripts can point elsewhere
    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("EXPLORER_URL") {
            self.server.base_url = url;
        }
        self
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(&config_path, contents)?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("explorer-cli").join("config.toml"))
    }

    /// Create a default config file with comments
    pub fn create_default_with_comments() -> String {
        r#"# Explorer CLI Configuration File
# Location: ~/.config/explorer-cli/config.toml (Linux)

[server]
# Root URL of the SQL Explorer app (EXPLORER_URL overrides this)
base_url = "http://localhost:8000/explorer/"

# Connection alias selected on start
default_connection = "default"

# CSRF cookie name; pages that render csrfCookieName take precedence
csrf_cookie_name = "csrftoken"

# Set when the server marks the CSRF cookie HttpOnly
csrf_cookie_httponly = false

# Request timeout in seconds
timeout_secs = 60

[editor]
# Milliseconds of quiet before relevant tables are re-matched
doc_changed_debounce_ms = 500
request_input_debounce_ms = 300

# Highlight SQL when printing the buffer
syntax_highlighting = true

[behavior]
enable_history = true
max_history_entries = 500

# Where \export writes pivot.csv (defaults to the downloads directory)
# download_dir = "/path/to/downloads"

# Show the assistant panel on start
expand_assistant = false
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.editor.doc_changed_debounce_ms, 500);
        assert_eq!(config.editor.request_input_debounce_ms, 300);
        assert_eq!(config.server.csrf_cookie_name, "csrftoken");
        assert!(!config.server.csrf_cookie_httponly);
    }

    #[test]
    fn test_commented_default_parses() {
        let config: Config = toml::from_str(&Config::create_default_with_comments()).unwrap();
        assert_eq!(config.server.base_url, "http://localhost:8000/explorer/");
        assert_eq!(config.behavior.max_history_entries, 500);
        assert!(config.behavior.download_dir.is_none());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str("[server]\ncsrf_cookie_httponly = true\n").unwrap();
        assert!(config.server.csrf_cookie_httponly);
        assert_eq!(config.server.timeout_secs, 60);
        assert_eq!(config.editor.doc_changed_debounce_ms, 500);
    }
}
