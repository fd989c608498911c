//! Configuration file management for `tskd`.
//!
//! Provides a TOML-based config file at `~/.config/tskd/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use tskd_core::token::TokenConfig;
use tskd_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded token secret (64 hex chars = 32 bytes).
    pub token_secret: String,
}

/// Where the scheduler daemon's local backends (§2 Cacher/Syncer/CAS,
/// §6 Executor) keep their state, and how they reach the git host.
///
/// `remote_base` empty means no scheduler daemon is started by `tskd
/// serve`: there is nothing useful to sync against, so the command
/// falls back to serving the HTTP API only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Prefix joined with a job's `repo` to form a fetchable git URL,
    /// e.g. `https://chromium.googlesource.com`.
    pub remote_base: String,
    pub mirror_root: String,
    pub worktree_root: String,
    pub cas_root: String,
    pub local_executor_concurrency: u32,
    pub tick_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            remote_base: String::new(),
            mirror_root: config_dir().join("git-mirrors").to_string_lossy().into_owned(),
            worktree_root: config_dir().join("worktrees").to_string_lossy().into_owned(),
            cas_root: config_dir().join("cas").to_string_lossy().into_owned(),
            local_executor_concurrency: 4,
            tick_interval_secs: 10,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the tskd config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/tskd` or `~/.config/tskd`. We
/// intentionally ignore the platform-specific `dirs::config_dir()` (which
/// returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tskd");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tskd")
}

/// Return the path to the tskd config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Token secret generation
// -----------------------------------------------------------------------

/// Generate a random token secret: 32 random bytes, hex-encoded (64 chars).
pub fn generate_token_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct TskdConfig {
    pub db_config: DbConfig,
    pub token_config: TokenConfig,
    pub scheduler: SchedulerSection,
}

impl TskdConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `TSKD_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Token secret: `TSKD_TOKEN_SECRET` env > `config_file.auth.token_secret` (hex-decoded) > error
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("TSKD_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let token_config = if let Ok(secret_hex) = std::env::var("TSKD_TOKEN_SECRET") {
            let bytes = hex::decode(&secret_hex).context("TSKD_TOKEN_SECRET env var is not valid hex")?;
            TokenConfig::new(bytes)
        } else if let Some(ref cfg) = file_config {
            let bytes = hex::decode(&cfg.auth.token_secret).context("invalid hex in config file token_secret")?;
            TokenConfig::new(bytes)
        } else {
            bail!("token secret not found; set TSKD_TOKEN_SECRET or run `tskd init` to create a config file");
        };

        let scheduler = file_config.map(|cfg| cfg.scheduler).unwrap_or_default();

        Ok(Self { db_config, token_config, scheduler })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn generate_token_secret_is_64_hex_chars() {
        let secret = generate_token_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generate_token_secret_is_random() {
        let a = generate_token_secret();
        let b = generate_token_secret();
        assert_ne!(a, b);
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            auth: AuthSection {
                token_secret: "aa".repeat(32),
            },
            scheduler: SchedulerSection::default(),
        };

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.auth.token_secret, original.auth.token_secret);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = env_lock().lock().unwrap();
        unsafe { std::env::set_var("TSKD_DATABASE_URL", "postgresql://env:5432/envdb") };
        unsafe { std::env::set_var("TSKD_TOKEN_SECRET", "aa".repeat(32)) };

        let config = TskdConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("TSKD_DATABASE_URL") };
        unsafe { std::env::remove_var("TSKD_TOKEN_SECRET") };
    }

    #[test]
    fn resolve_with_env_var_when_no_cli_flag() {
        let _lock = env_lock().lock().unwrap();
        unsafe { std::env::set_var("TSKD_DATABASE_URL", "postgresql://env:5432/envdb") };
        unsafe { std::env::set_var("TSKD_TOKEN_SECRET", "aa".repeat(32)) };

        let config = TskdConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("TSKD_DATABASE_URL") };
        unsafe { std::env::remove_var("TSKD_TOKEN_SECRET") };
    }

    #[test]
    fn resolve_defaults_db_url_when_nothing_set() {
        let _lock = env_lock().lock().unwrap();
        unsafe { std::env::remove_var("TSKD_DATABASE_URL") };
        unsafe { std::env::set_var("TSKD_TOKEN_SECRET", "aa".repeat(32)) };

        let config = TskdConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);

        unsafe { std::env::remove_var("TSKD_TOKEN_SECRET") };
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(path.ends_with("tskd/config.toml"));
    }
}
