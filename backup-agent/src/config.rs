//! Configuration management for the backup agent.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`CHAIN_BACKUP__BACKUP__MAX_LEVEL=3`).

use crate::chain::{IncrementalPolicy, MaxLevelAction};
use crate::engine::{TarSettings, WaitSettings};
use crate::executor::ExecutorOptions;
use crate::storage::{FtpSettings, S3Settings, SshSettings, SwiftSettings};
use crate::utils::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "CHAIN_BACKUP";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub backup: BackupConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Prefix of every backup name; the machine hostname by default
    pub hostname: String,

    /// Parent of per-run temporary directories
    pub work_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub backup_name: String,

    pub no_incremental: bool,

    pub max_level: Option<u32>,

    pub always_level: Option<u32>,

    /// Days after which a new level-0 chain is started
    pub restart_always_level: Option<u64>,

    pub max_level_action: MaxLevelAction,

    /// Chunks in flight between producer and consumer
    pub queue_size: usize,

    /// Chunk size of engines and storages, in bytes (default: 64MB)
    pub max_segment_size: usize,

    /// Deadline of cloud resource waits, in seconds
    pub timeout: u64,

    /// Poll interval of cloud resource waits, in seconds
    pub poll_interval: u64,

    /// Upload bandwidth cap in bytes per second (unlimited if unset)
    pub upload_limit: Option<u64>,

    /// Download bandwidth cap in bytes per second (unlimited if unset)
    pub download_limit: Option<u64>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_name: "backup".to_string(),
            no_incremental: false,
            max_level: None,
            always_level: None,
            restart_always_level: None,
            max_level_action: MaxLevelAction::Fresh,
            queue_size: 10,
            max_segment_size: 64 * 1024 * 1024,
            timeout: 120,
            poll_interval: 5,
            upload_limit: None,
            download_limit: None,
        }
    }
}

impl BackupConfig {
    pub fn policy(&self) -> IncrementalPolicy {
        IncrementalPolicy {
            no_incremental: self.no_incremental,
            max_level: self.max_level,
            always_level: self.always_level,
            restart_always_level: self.restart_always_level,
            max_level_action: self.max_level_action,
        }
    }
}

/// Where backups are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    Local { path: PathBuf },
    Ssh(SshSettings),
    Ftp(FtpSettings),
    Ftps(FtpSettings),
    Swift(SwiftSettings),
    S3(S3Settings),
    /// Every backup is written to all of `storages`.
    Multiple { storages: Vec<StorageConfig> },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            path: PathBuf::from("/var/lib/chain-backup"),
        }
    }
}

/// What is backed up.
///
/// `volume`, `image` and `instance` drive OpenStack APIs through clients
/// handed to [`crate::engine::from_config`]; the command-line agent has no
/// such clients and only runs `tar`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineConfig {
    Tar(TarSettings),
    Volume,
    Image,
    Instance,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Tar(TarSettings::default())
    }
}

impl EngineConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineConfig::Tar(_) => "tar",
            EngineConfig::Volume => "volume",
            EngineConfig::Image => "image",
            EngineConfig::Instance => "instance",
        }
    }

    /// True for engines that need injected cloud clients.
    pub fn needs_cloud_clients(&self) -> bool {
        !matches!(self, EngineConfig::Tar(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load `path` (if any) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| AgentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, without environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let backup = &self.backup;
        if backup.backup_name.is_empty() {
            return Err(AgentError::Config("backup_name must not be empty".to_string()));
        }
        if backup.queue_size == 0 || backup.max_segment_size == 0 {
            return Err(AgentError::Config(
                "queue_size and max_segment_size must be positive".to_string(),
            ));
        }
        if backup.poll_interval == 0 {
            return Err(AgentError::Config("poll_interval must be positive".to_string()));
        }
        if backup.upload_limit == Some(0) || backup.download_limit == Some(0) {
            return Err(AgentError::Config(
                "upload_limit and download_limit must be positive when set".to_string(),
            ));
        }
        if let StorageConfig::Multiple { storages } = &self.storage {
            if storages.is_empty() {
                return Err(AgentError::Config(
                    "multiple storage needs at least one backend".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Reject engines the command-line agent cannot build.
    pub fn check_standalone(&self) -> Result<()> {
        if self.engine.needs_cloud_clients() {
            return Err(AgentError::Config(format!(
                "engine type \"{}\" needs cloud clients from an embedding program; \
                 the command-line agent only runs the tar engine",
                self.engine.kind()
            )));
        }
        Ok(())
    }

    /// `{hostname}_{backup_name}`, the prefix of every backup identifier
    pub fn hostname_backup_name(&self) -> String {
        format!("{}_{}", self.agent.hostname, self.backup.backup_name)
    }

    pub fn wait_settings(&self) -> WaitSettings {
        WaitSettings {
            poll_interval: Duration::from_secs(self.backup.poll_interval),
            timeout: Duration::from_secs(self.backup.timeout),
        }
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            queue_size: self.backup.queue_size,
            work_dir: self.agent.work_dir.clone(),
            upload_limit: self.backup.upload_limit,
            download_limit: self.backup.download_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Compression;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.backup.queue_size, 10);
        assert_eq!(config.backup.max_segment_size, 67_108_864);
        assert_eq!(config.backup.max_level_action, MaxLevelAction::Fresh);
        assert_eq!(config.log.level, "info");
        assert!(matches!(config.storage, StorageConfig::Local { .. }));
        assert!(matches!(config.engine, EngineConfig::Tar(_)));
        assert_eq!(config.wait_settings().timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_full_file() {
        let config = Config::from_toml_str(
            r#"
            [agent]
            hostname = "db1"

            [backup]
            backup_name = "pgdata"
            max_level = 3
            max_level_action = "skip"
            restart_always_level = 7

            [storage]
            type = "multiple"

            [[storage.storages]]
            type = "local"
            path = "/mnt/a"

            [[storage.storages]]
            type = "ssh"
            host = "backup.example.com"
            username = "backup"
            path = "/srv/backups"

            [engine]
            type = "tar"
            compression = "zstd"
            exclude = "*.tmp"
            "#,
        )
        .unwrap();

        assert_eq!(config.hostname_backup_name(), "db1_pgdata");
        let policy = config.backup.policy();
        assert_eq!(policy.max_level, Some(3));
        assert_eq!(policy.max_level_action, MaxLevelAction::Skip);
        assert_eq!(policy.restart_always_level, Some(7));

        match &config.storage {
            StorageConfig::Multiple { storages } => {
                assert_eq!(storages.len(), 2);
                match &storages[1] {
                    StorageConfig::Ssh(ssh) => assert_eq!(ssh.port, 22),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        match &config.engine {
            EngineConfig::Tar(tar) => {
                assert_eq!(tar.compression, Compression::Zstd);
                assert_eq!(tar.exclude.as_deref(), Some("*.tmp"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cloud_engine_and_object_storage() {
        let config = Config::from_toml_str(
            r#"
            [storage]
            type = "s3"
            storage_path = "backups/agent"
            endpoint = "http://127.0.0.1:9000"
            access_key = "minio"
            secret_key = "minio123"

            [engine]
            type = "volume"
            "#,
        )
        .unwrap();
        assert!(matches!(config.storage, StorageConfig::S3(_)));
        assert!(matches!(config.engine, EngineConfig::Volume));

        let err = config.check_standalone().unwrap_err();
        assert!(matches!(err, AgentError::Config(ref m) if m.contains("\"volume\"")));
        assert!(Config::default().check_standalone().is_ok());
    }

    #[test]
    fn test_bandwidth_limits() {
        let config = Config::from_toml_str("[backup]\nupload_limit = 1048576").unwrap();
        let options = config.executor_options();
        assert_eq!(options.upload_limit, Some(1_048_576));
        assert_eq!(options.download_limit, None);

        assert!(matches!(
            Config::from_toml_str("[backup]\ndownload_limit = 0"),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            Config::from_toml_str("[backup]\nqueue_size = 0"),
            Err(AgentError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[storage]\ntype = \"multiple\"\nstorages = []"),
            Err(AgentError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[storage]\ntype = \"tape\""),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_load_file_through_config_crate() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "[agent]\nhostname = \"web\"\n[backup]\nbackup_name = \"site\"\nalways_level = 2\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.hostname_backup_name(), "web_site");
        assert_eq!(config.backup.always_level, Some(2));
    }
}
