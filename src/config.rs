//! Configuration for stagegate.
//!
//! Settings are read from `.stagegate/stagegate.toml` and layered:
//! file → environment (`STAGEGATE_*`, `.env` honoured) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! max_stage_revisions = 3
//! max_item_revisions = 3
//! conflict_retries = 5
//!
//! [engine.stage_revisions]
//! plan = 5
//!
//! [store]
//! backend = "sqlite"
//! path = ".stagegate/sessions.db"
//!
//! [workers]
//! stage_command = ["python3", "workers/stage.py"]
//! subtask_command = ["python3", "workers/subtask.py"]
//! working_dir = "."
//! timeout_secs = 600
//! max_in_flight = 4
//!
//! [workers.roles]
//! frontend = ["node", "workers/frontend.js"]
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 200
//! max_deferrals = 10
//!
//! [janitor]
//! idle_timeout_secs = 0
//! sweep_interval_secs = 60
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//! event_buffer = 256
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stagegate_common::Stage;

use crate::pipeline::EngineSettings;
use crate::worker::RetryPolicy;

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".stagegate";
/// Name of the configuration file inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "stagegate.toml";

/// Revision limits and write-conflict handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Human-requested revisions allowed per gated stage
    #[serde(default = "default_max_revisions")]
    pub max_stage_revisions: u32,
    /// Automatic revisions allowed per work item
    #[serde(default = "default_max_revisions")]
    pub max_item_revisions: u32,
    /// Reload-and-reapply attempts on a version conflict
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    /// Per-stage overrides of `max_stage_revisions`, keyed by stage name
    #[serde(default)]
    pub stage_revisions: BTreeMap<String, u32>,
}

fn default_max_revisions() -> u32 {
    3
}

fn default_conflict_retries() -> u32 {
    5
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_stage_revisions: default_max_revisions(),
            max_item_revisions: default_max_revisions(),
            conflict_retries: default_conflict_retries(),
            stage_revisions: BTreeMap::new(),
        }
    }
}

/// Which session store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Sqlite => write!(f, "sqlite"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            _ => anyhow::bail!("Invalid store backend '{}'. Valid values: sqlite, memory", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database path, relative to the project directory unless absolute
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(STATE_DIR).join("sessions.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

/// External worker processes. Commands are argv arrays, never shell strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkersSection {
    /// Command producing gated stage artifacts
    #[serde(default)]
    pub stage_command: Vec<String>,
    /// Default command running work item subtasks
    #[serde(default)]
    pub subtask_command: Vec<String>,
    /// Per-role subtask commands, keyed by work item role tag
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<String>>,
    /// Directory workers run in, relative to the project directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// A worker call running longer is killed and retried as transient; 0 = no limit
    #[serde(default)]
    pub timeout_secs: u64,
    /// Worker calls allowed in flight across all sessions; 0 = unbounded
    #[serde(default)]
    pub max_in_flight: usize,
}

impl WorkersSection {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_deferrals() -> u32 {
    10
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_deferrals: default_max_deferrals(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorSection {
    /// Sessions idle longer than this are failed; 0 disables the janitor
    #[serde(default)]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for JanitorSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 0,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl JanitorSection {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Capacity of each per-session event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

fn default_event_buffer() -> usize {
    256
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Filter directive; overridden by `-v` flags and `RUST_LOG`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files; console only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// The `stagegate.toml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagegateToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub workers: WorkersSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub janitor: JanitorSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl StagegateToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stagegate.toml")
    }

    /// Load from `<state_dir>/stagegate.toml`, or defaults if absent.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize stagegate.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `STAGEGATE_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STAGEGATE_STORE_BACKEND") {
            self.store.backend = v.parse()?;
        }
        if let Some(v) = lookup("STAGEGATE_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("STAGEGATE_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("STAGEGATE_PORT") {
            self.server.port = v
                .parse()
                .with_context(|| format!("Invalid STAGEGATE_PORT '{}'", v))?;
        }
        if let Some(v) = lookup("STAGEGATE_MAX_STAGE_REVISIONS") {
            self.engine.max_stage_revisions = v
                .parse()
                .with_context(|| format!("Invalid STAGEGATE_MAX_STAGE_REVISIONS '{}'", v))?;
        }
        if let Some(v) = lookup("STAGEGATE_MAX_ITEM_REVISIONS") {
            self.engine.max_item_revisions = v
                .parse()
                .with_context(|| format!("Invalid STAGEGATE_MAX_ITEM_REVISIONS '{}'", v))?;
        }
        if let Some(v) = lookup("STAGEGATE_IDLE_TIMEOUT_SECS") {
            self.janitor.idle_timeout_secs = v
                .parse()
                .with_context(|| format!("Invalid STAGEGATE_IDLE_TIMEOUT_SECS '{}'", v))?;
        }
        if let Some(v) = lookup("STAGEGATE_STAGE_COMMAND") {
            self.workers.stage_command = split_command(&v);
        }
        if let Some(v) = lookup("STAGEGATE_SUBTASK_COMMAND") {
            self.workers.subtask_command = split_command(&v);
        }
        if let Some(v) = lookup("STAGEGATE_WORKER_TIMEOUT_SECS") {
            self.workers.timeout_secs = v
                .parse()
                .with_context(|| format!("Invalid STAGEGATE_WORKER_TIMEOUT_SECS '{}'", v))?;
        }
        if let Some(v) = lookup("STAGEGATE_MAX_IN_FLIGHT") {
            self.workers.max_in_flight = v
                .parse()
                .with_context(|| format!("Invalid STAGEGATE_MAX_IN_FLIGHT '{}'", v))?;
        }
        if let Some(v) = lookup("STAGEGATE_LOG_LEVEL") {
            self.logging.level = Some(v);
        }
        if let Some(v) = lookup("STAGEGATE_LOG_JSON") {
            self.logging.json = matches!(v.trim(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// Revision limit for a gated stage, honouring per-stage overrides.
    pub fn max_revisions_for(&self, stage: Stage) -> u32 {
        self.engine
            .stage_revisions
            .iter()
            .find(|(name, _)| name.parse::<Stage>().ok() == Some(stage))
            .map(|(_, max)| *max)
            .unwrap_or(self.engine.max_stage_revisions)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_deferrals: self.retry.max_deferrals,
        }
    }

    pub fn to_engine_settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::default()
            .with_max_item_revisions(self.engine.max_item_revisions)
            .with_conflict_retries(self.engine.conflict_retries)
            .with_retry_policy(self.retry_policy());
        for stage in Stage::GATED {
            settings = settings.with_stage_revisions(stage, self.max_revisions_for(stage));
        }
        settings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_stage_revisions == 0 {
            warnings.push(
                "max_stage_revisions is 0: any revise decision will fail the session".to_string(),
            );
        }
        if self.engine.max_item_revisions == 0 {
            warnings.push(
                "max_item_revisions is 0: the first failed check fails the work item".to_string(),
            );
        }
        for name in self.engine.stage_revisions.keys() {
            match name.parse::<Stage>() {
                Ok(stage) if stage.is_gated() => {}
                _ => warnings.push(format!(
                    "Unknown gated stage '{}' in [engine.stage_revisions]",
                    name
                )),
            }
        }
        if self.workers.stage_command.is_empty() {
            warnings.push("No [workers] stage_command configured".to_string());
        }
        if self.workers.subtask_command.is_empty() && self.workers.roles.is_empty() {
            warnings.push("No [workers] subtask_command configured".to_string());
        }
        for (role, cmd) in &self.workers.roles {
            if cmd.is_empty() {
                warnings.push(format!("Empty command for role '{}'", role));
            }
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; treating as 1".to_string());
        }
        if let Some(ref level) = self.logging.level
            && tracing_subscriber::EnvFilter::try_new(level).is_err()
        {
            warnings.push(format!("Invalid logging level '{}'", level));
        }

        warnings
    }
}

/// Split a command line from an environment variable into argv.
fn split_command(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct StagegateConfig {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub toml: StagegateToml,
    /// CLI override: verbosity count
    pub verbose: u8,
}

impl StagegateConfig {
    /// Load file settings only.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let toml = StagegateToml::load_or_default(&state_dir)?;
        Ok(Self {
            project_dir,
            state_dir,
            toml,
            verbose: 0,
        })
    }

    /// Load file settings, then `.env` and `STAGEGATE_*` overrides.
    pub fn load(project_dir: PathBuf) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        let _ = dotenvy::from_path(config.project_dir.join(".env"));
        config.toml.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn store_path(&self) -> PathBuf {
        self.resolve(&self.toml.store.path)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.dir.as_ref().map(|dir| self.resolve(dir))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
