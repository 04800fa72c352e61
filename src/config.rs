//! Configuration for the rss-agent service.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (RSS_AGENT_HOME, RSS_AGENT_PROJECT_ROOT)
//! 2. Config file (.rss-agent/config.yaml)
//! 3. Defaults (~/.rss-agent, current directory as project root)
//!
//! Config file discovery:
//! - Searches current directory and parents for .rss-agent/config.yaml
//! - `paths.home` is relative to the .rss-agent/ directory; other paths are
//!   relative to the project root (the directory containing .rss-agent/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::CommandExecutor;
use crate::core::OrchestratorSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const CONFIG_DIR: &str = ".rss-agent";
pub const ENV_HOME: &str = "RSS_AGENT_HOME";
pub const ENV_PROJECT_ROOT: &str = "RSS_AGENT_PROJECT_ROOT";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub runs: Option<RunsConfig>,
    #[serde(default)]
    pub stream: Option<StreamConfig>,
    #[serde(default)]
    pub artifacts: Option<ArtifactsConfig>,
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Service state directory (relative to .rss-agent/)
    pub home: Option<String>,
    /// Where the report pipeline lives and writes its output
    pub project_root: Option<String>,
    /// SQLite database (relative to home)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunsConfig {
    pub max_concurrent_runs: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub subscriber_capacity: Option<usize>,
    pub grace_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsConfig {
    pub preview_max_chars: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub program: Option<String>,
    pub script: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Service state directory (database, lock file)
    pub home: PathBuf,
    /// Working directory of the pipeline; artifacts must stay inside it
    pub project_root: PathBuf,
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub server: ServerSettings,
    pub runs: RunSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSettings {
    pub max_concurrent_runs: usize,
    pub subscriber_capacity: usize,
    pub grace_seconds: u64,
    pub preview_max_chars: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 1,
            subscriber_capacity: 256,
            grace_seconds: 30,
            preview_max_chars: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSettings {
    pub program: String,
    pub script: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            script: "main.py".to_string(),
        }
    }
}

impl ResolvedConfig {
    /// Exclusive lock held by a running server
    pub fn lock_path(&self) -> PathBuf {
        self.home.join("server.lock")
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings::new(&self.project_root)
            .with_max_concurrent_runs(self.runs.max_concurrent_runs)
            .with_subscriber_capacity(self.runs.subscriber_capacity)
            .with_release_grace(Duration::from_secs(self.runs.grace_seconds))
            .with_preview_max_chars(self.runs.preview_max_chars)
    }

    pub fn command_executor(&self) -> CommandExecutor {
        CommandExecutor::new(&self.project_root)
            .with_program(&self.pipeline.program)
            .with_script(&self.pipeline.script)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Environment overrides, read once per load
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    project_root: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var(ENV_HOME).ok(),
            project_root: std::env::var(ENV_PROJECT_ROOT).ok(),
        }
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    resolve_config(find_config_file(), EnvOverrides::from_env(), &cwd)
}

fn resolve_config(
    config_file: Option<PathBuf>,
    env: EnvOverrides,
    cwd: &Path,
) -> Result<ResolvedConfig> {
    let config = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // .rss-agent/ and the directory that contains it
    let config_dir = config_file.as_deref().and_then(Path::parent);
    let base_dir = config_dir.and_then(Path::parent).unwrap_or(cwd);

    let home = match (env.home, &config.paths.home, config_dir) {
        (Some(env_home), _, _) => PathBuf::from(env_home),
        (None, Some(home_path), Some(dir)) => resolve_path(dir, home_path),
        _ => dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR),
    };

    let project_root = match (env.project_root, &config.paths.project_root) {
        (Some(env_root), _) => PathBuf::from(env_root),
        (None, Some(root)) => resolve_path(base_dir, root),
        (None, None) => base_dir.to_path_buf(),
    };

    let database = match config.paths.database {
        Some(ref db) => resolve_path(&home, db),
        None => home.join("runs.db"),
    };

    let defaults = ServerSettings::default();
    let server = ServerSettings {
        host: config
            .server
            .as_ref()
            .and_then(|s| s.host.clone())
            .unwrap_or(defaults.host),
        port: config
            .server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(defaults.port),
    };

    let defaults = RunSettings::default();
    let runs = RunSettings {
        max_concurrent_runs: config
            .runs
            .as_ref()
            .and_then(|r| r.max_concurrent_runs)
            .unwrap_or(defaults.max_concurrent_runs)
            .max(1),
        subscriber_capacity: config
            .stream
            .as_ref()
            .and_then(|s| s.subscriber_capacity)
            .unwrap_or(defaults.subscriber_capacity)
            .max(1),
        grace_seconds: config
            .stream
            .as_ref()
            .and_then(|s| s.grace_seconds)
            .unwrap_or(defaults.grace_seconds),
        preview_max_chars: config
            .artifacts
            .as_ref()
            .and_then(|a| a.preview_max_chars)
            .unwrap_or(defaults.preview_max_chars),
    };

    let defaults = PipelineSettings::default();
    let pipeline = PipelineSettings {
        program: config
            .pipeline
            .as_ref()
            .and_then(|p| p.program.clone())
            .unwrap_or(defaults.program),
        script: config
            .pipeline
            .as_ref()
            .and_then(|p| p.script.clone())
            .unwrap_or(defaults.script),
    };

    Ok(ResolvedConfig {
        home,
        project_root,
        database,
        config_file,
        server,
        runs,
        pipeline,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
