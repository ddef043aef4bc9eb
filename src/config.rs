//! Configuration file parser for ~/.config/millrace/config.toml.
//!
//! The config file is optional — a missing file yields `Config::default()`,
//! which carries a single local account. Unknown keys are ignored by serde
//! (with `deny_unknown_fields` off), though we log a warning when the file
//! contains potential typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::storage::AccountKind;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database file override. Relative paths resolve against the config
    /// directory; the default is `items.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Sync sources, one `[[accounts]]` entry each.
    pub accounts: Vec<AccountConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            accounts: vec![AccountConfig::local_default()],
        }
    }
}

/// One `[[accounts]]` entry.
///
/// `kind` decides which other fields matter: local accounts need nothing
/// beyond a name, Fever and FreshRSS accounts need `url`, `login` and
/// `password`. Credentials are checked at sync time, not at load time, so
/// a misconfigured account fails its own sync instead of blocking startup.
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub kind: AccountKind,
    /// Server root, e.g. `https://reader.example.com/api/greader.php` for
    /// FreshRSS or `https://example.com/fever/` for Fever. Unused for local.
    pub url: Option<String>,
    pub login: Option<String>,
    pub password: Option<SecretString>,
}

impl AccountConfig {
    /// The account every fresh install starts with: plain RSS/Atom fetching.
    pub fn local_default() -> Self {
        Self {
            name: "Local".to_string(),
            kind: AccountKind::Local,
            url: None,
            login: None,
            password: None,
        }
    }
}

// Credentials stay out of logs and panics.
impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged
    ///   as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to prevent memory exhaustion from
        // a maliciously large or corrupted config file.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {} // Size is within limits, proceed
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse the TOML content first as a raw table to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = ["database_path", "accounts"];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            accounts = config.accounts.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// The database file this configuration points at.
    ///
    /// Relative overrides resolve against `config_dir` so a config file can
    /// be copied between machines without baking in an absolute home path.
    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        match &self.database_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => config_dir.join(path),
            None => config_dir.join("items.db"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.database_path.is_none());
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].name, "Local");
        assert_eq!(config.accounts[0].kind, AccountKind::Local);
        assert!(config.accounts[0].password.is_none());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/millrace_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].kind, AccountKind::Local);
    }

    #[test]
    fn test_empty_file_returns_default() {
        let dir = std::env::temp_dir().join("millrace_config_test_empty");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.accounts.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let dir = std::env::temp_dir().join("millrace_config_test_partial");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "database_path = \"custom.db\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database_path.as_deref(), Some(Path::new("custom.db")));
        assert_eq!(config.accounts.len(), 1); // default local account

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let dir = std::env::temp_dir().join("millrace_config_test_full");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let content = r#"
database_path = "/var/lib/millrace/items.db"

[[accounts]]
name = "Local"
kind = "local"

[[accounts]]
name = "Home server"
kind = "fever"
url = "https://reader.example.com/fever/"
login = "alice"
password = "hunter2"

[[accounts]]
name = "FreshRSS"
kind = "freshrss"
url = "https://reader.example.com/api/greader.php"
login = "alice"
password = "hunter2"
"#;
        std::fs::write(&path, content).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/var/lib/millrace/items.db"))
        );
        assert_eq!(config.accounts.len(), 3);
        assert_eq!(config.accounts[1].kind, AccountKind::Fever);
        assert_eq!(config.accounts[1].login.as_deref(), Some("alice"));
        assert_eq!(
            config.accounts[1]
                .password
                .as_ref()
                .map(|p| p.expose_secret()),
            Some("hunter2")
        );
        assert_eq!(config.accounts[2].kind, AccountKind::FreshRss);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = std::env::temp_dir().join("millrace_config_test_invalid");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "this is not [valid toml").unwrap();

        let result = Config::load(&path);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        // Verify error message contains useful info
        let msg = err.to_string();
        assert!(msg.contains("Invalid TOML"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let dir = std::env::temp_dir().join("millrace_config_test_unknown");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let content = r#"
database_path = "items.db"
totally_fake_key = "should not fail"
another_unknown = 42
"#;
        std::fs::write(&path, content).unwrap();

        // Should succeed (unknown keys ignored)
        let config = Config::load(&path).unwrap();
        assert_eq!(config.database_path.as_deref(), Some(Path::new("items.db")));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_account_kind_returns_error() {
        let dir = std::env::temp_dir().join("millrace_config_test_badkind");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let content = r#"
[[accounts]]
name = "Mystery"
kind = "gopher"
"#;
        std::fs::write(&path, content).unwrap();

        let result = Config::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_account_missing_name_returns_error() {
        let dir = std::env::temp_dir().join("millrace_config_test_noname");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[[accounts]]\nkind = \"local\"\n").unwrap();

        let result = Config::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let dir = std::env::temp_dir().join("millrace_config_test_whitespace");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "   \n  \n  ").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.accounts.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    // File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("millrace_config_test_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        // Write a file just over 1MB
        let content = "a".repeat(1_048_577);
        std::fs::write(&path, content).unwrap();

        let result = Config::load(&path);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_at_size_limit_accepted() {
        let dir = std::env::temp_dir().join("millrace_config_test_at_limit");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        // Write a valid TOML file exactly at 1MB (padded with comments)
        let mut content = "database_path = \"items.db\"\n".to_string();
        while content.len() < 1_048_576 - 20 {
            content.push_str("# padding comment\n");
        }
        content.truncate(1_048_576);
        std::fs::write(&path, &content).unwrap();

        let result = Config::load(&path);
        assert!(result.is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }

    // Debug output masks passwords
    #[test]
    fn test_debug_masks_password() {
        let account = AccountConfig {
            name: "Home server".to_string(),
            kind: AccountKind::Fever,
            url: Some("https://reader.example.com/fever/".to_string()),
            login: Some("alice".to_string()),
            password: Some(SecretString::from("super-secret-12345")),
        };

        let debug_output = format!("{:?}", account);
        assert!(
            !debug_output.contains("super-secret-12345"),
            "Debug output should not contain the password"
        );
        assert!(
            debug_output.contains("<redacted>"),
            "Debug output should show <redacted> for the password"
        );
        // Non-secret fields stay visible.
        assert!(debug_output.contains("alice"));
    }

    #[test]
    fn test_debug_shows_none_when_no_password() {
        let config = Config::default();
        let debug_output = format!("{:?}", config);
        assert!(
            debug_output.contains("None"),
            "Debug output should show None when no password is set"
        );
        assert!(
            !debug_output.contains("<redacted>"),
            "Debug output should not show <redacted> when no password"
        );
    }

    #[test]
    fn test_database_path_resolution() {
        let dir = Path::new("/home/alice/.config/millrace");

        let default = Config::default();
        assert_eq!(default.database_path(dir), dir.join("items.db"));

        let relative = Config {
            database_path: Some(PathBuf::from("custom.db")),
            ..Config::default()
        };
        assert_eq!(relative.database_path(dir), dir.join("custom.db"));

        let absolute = Config {
            database_path: Some(PathBuf::from("/var/lib/millrace/items.db")),
            ..Config::default()
        };
        assert_eq!(
            absolute.database_path(dir),
            Path::new("/var/lib/millrace/items.db")
        );
    }
}
