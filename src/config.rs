use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub repository: RepositoryConfig,
    pub ssh: SshConfig,
    pub http: HttpConfig,
    pub auth: AuthConfig,
    pub git: GitConfig,
    pub hooks: HooksConfig,
}

impl Config {
    /// True when detailed errors may be echoed back to git clients.
    pub fn is_dev(&self) -> bool {
        self.app.run_mode == RunMode::Dev
    }

    /// Path of this executable as written into hook shims and used for the
    /// SSH re-exec.
    pub fn app_path(&self) -> Result<PathBuf> {
        match &self.app.app_path {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().context("failed to resolve current executable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Dev,
    #[default]
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub run_mode: RunMode,
    /// Directory receiving the `serv.log` / `hooks.log` files of the
    /// short-lived subprocess roles.
    pub log_dir: PathBuf,
    /// Overrides the executable path baked into hook shims.
    pub app_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Prod,
            log_dir: PathBuf::from("log"),
            app_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file shared by the server and every hook process.
    pub path: PathBuf,
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/gitgate.db"),
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Repository storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Bare repositories live at `{root}/{owner}/{name}.git`.
    pub root: PathBuf,
    /// Turns off the smart/dumb HTTP transport regardless of credentials.
    pub disable_http_git: bool,
    /// Interpreter named in the shebang of generated hook shims.
    pub script_type: String,
    /// Directory (inside each repository) searched for operator hooks.
    pub custom_hooks_dir: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/repositories"),
            disable_http_git: false,
            script_type: "bash".to_string(),
            custom_hooks_dir: "custom_hooks".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub disabled: bool,
    pub listen_host: String,
    pub listen_port: u16,
    /// Host keys are generated here on first start.
    pub host_key_dir: PathBuf,
    /// Cipher names offered during key exchange; empty keeps library defaults.
    pub ciphers: Vec<String>,
    pub inactivity_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            listen_host: "0.0.0.0".to_string(),
            listen_port: 2222,
            host_key_dir: PathBuf::from("data/ssh"),
            ciphers: Vec::new(),
            inactivity_timeout_secs: 600,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: String,
    /// Value for `Access-Control-Allow-Origin`; empty disables CORS handling.
    pub access_control_allow_origin: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            access_control_allow_origin: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Auth policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Forced sign-in: public repositories stop being anonymously readable.
    pub require_signin_view: bool,
}

// ---------------------------------------------------------------------------
// Git subprocesses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub binary: String,
    /// Upper bound on any single git invocation. Unbounded when absent.
    pub timeout_secs: Option<u64>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
            timeout_secs: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Post-push hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Base URL of the internal task trigger endpoint, e.g.
    /// `http://localhost:3000/`. Empty skips the trigger.
    pub local_root_url: String,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.database.max_connections > 0,
        "database.max_connections must be at least 1"
    );
    anyhow::ensure!(
        !config.repository.custom_hooks_dir.is_empty()
            && !config.repository.custom_hooks_dir.contains(".."),
        "repository.custom_hooks_dir must be a plain directory name"
    );
    anyhow::ensure!(
        !config.git.binary.is_empty(),
        "git.binary must not be empty"
    );
    if let Some(timeout) = config.git.timeout_secs {
        anyhow::ensure!(timeout > 0, "git.timeout_secs must be positive when set");
    }
    if !config.hooks.local_root_url.is_empty() {
        anyhow::ensure!(
            config.hooks.local_root_url.ends_with('/'),
            "hooks.local_root_url must end with '/'"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.ssh.listen_port, 2222);
        assert_eq!(config.git.binary, "git");
        assert!(config.git.timeout_secs.is_none());
        assert!(!config.is_dev());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = r#"
app:
  run_mode: dev
ssh:
  listen_port: 22
  ciphers: ["aes256-ctr"]
auth:
  require_signin_view: true
"#;
        let config = parse_config(yaml).unwrap();
        assert!(config.is_dev());
        assert_eq!(config.ssh.listen_port, 22);
        assert_eq!(config.ssh.ciphers, vec!["aes256-ctr".to_string()]);
        assert_eq!(config.ssh.listen_host, "0.0.0.0");
        assert!(config.auth.require_signin_view);
        assert_eq!(config.repository.custom_hooks_dir, "custom_hooks");
    }

    #[test]
    fn rejects_traversing_custom_hooks_dir() {
        let yaml = "repository:\n  custom_hooks_dir: ../escape\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn rejects_zero_timeout() {
        let yaml = "git:\n  timeout_secs: 0\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn local_root_url_needs_trailing_slash() {
        assert!(parse_config("hooks:\n  local_root_url: http://localhost:3000\n").is_err());
        assert!(parse_config("hooks:\n  local_root_url: http://localhost:3000/\n").is_ok());
    }
}
