//! GNU tar engine with incremental snapshots and optional openssl encryption.
//!
//! Backups run `tar --create --listed-incremental=<manifest>` so each level
//! only carries what changed since the manifest was written. Restores feed
//! every level, in order, into `tar --incremental --extract`.

use crate::chain::Backup;
use crate::engine::{require_key, BackupEngine, EngineMetadata};
use crate::streaming::{BoundedChannel, ChunkStream};
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

pub const ENGINE_NAME: &str = "tar";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    None,
}

impl Compression {
    fn tar_flag(&self) -> Option<&'static str> {
        match self {
            Compression::Gzip => Some("-z"),
            Compression::Bzip2 => Some("-j"),
            Compression::Xz => Some("-J"),
            Compression::Zstd => Some("--zstd"),
            Compression::None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
            Compression::None => "none",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "bzip2" => Ok(Compression::Bzip2),
            "xz" => Ok(Compression::Xz),
            "zstd" => Ok(Compression::Zstd),
            "none" => Ok(Compression::None),
            other => Err(AgentError::Parse(format!("unknown compression {:?}", other))),
        }
    }
}

/// Which links tar follows instead of archiving them as links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dereference {
    Soft,
    Hard,
    All,
}

impl Dereference {
    fn flags(&self) -> &'static str {
        match self {
            Dereference::Soft => "--dereference",
            Dereference::Hard => "--hard-dereference",
            Dereference::All => "--hard-dereference --dereference",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TarSettings {
    pub compression: Compression,
    /// File holding the openssl passphrase; enables encryption.
    pub encrypt_pass_file: Option<PathBuf>,
    pub dereference_symlink: Option<Dereference>,
    pub exclude: Option<String>,
    /// Restore only lists the archive contents.
    pub dry_run: bool,
    pub tar_path: String,
    pub openssl_path: String,
    /// Read size on tar's stdout.
    pub chunk_size: usize,
}

impl Default for TarSettings {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            encrypt_pass_file: None,
            dereference_symlink: None,
            exclude: None,
            dry_run: false,
            tar_path: "tar".to_string(),
            openssl_path: "openssl".to_string(),
            chunk_size: 1024 * 1024,
        }
    }
}

/// Single-quote `value` for bash.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Shell pipeline producing the (possibly encrypted) archive on stdout.
pub fn backup_command(settings: &TarSettings, path: &str, manifest: &Path) -> String {
    let mut parts = vec![quote(&settings.tar_path), "--create".to_string()];
    parts.extend(settings.compression.tar_flag().map(str::to_string));
    parts.push(
        "--warning=none --no-check-device --one-file-system --preserve-permissions \
         --same-owner --seek --ignore-failed-read"
            .to_string(),
    );
    if let Some(mode) = settings.dereference_symlink {
        parts.push(mode.flags().to_string());
    }
    parts.push(format!("--listed-incremental={}", quote_path(manifest)));
    if let Some(exclude) = &settings.exclude {
        parts.push(format!("--exclude={}", quote(exclude)));
    }
    parts.push(quote(path));
    let tar = parts.join(" ");

    match &settings.encrypt_pass_file {
        Some(key) => format!(
            "set -o pipefail; {} | {} enc -aes-256-cfb -pass file:{}",
            tar,
            quote(&settings.openssl_path),
            quote_path(key)
        ),
        None => tar,
    }
}

/// Shell pipeline consuming one level on stdin.
pub fn restore_command(settings: &TarSettings, compression: Compression, destination: &str) -> String {
    let mut parts = vec![quote(&settings.tar_path)];
    parts.extend(compression.tar_flag().map(str::to_string));
    if settings.dry_run {
        parts.push("--incremental --list --ignore-zeros --warning=none".to_string());
    } else {
        parts.push("--incremental --extract --ignore-zeros --warning=none --overwrite".to_string());
        parts.push(format!("--directory {}", quote(destination)));
    }
    let tar = parts.join(" ");

    match &settings.encrypt_pass_file {
        Some(key) => format!(
            "set -o pipefail; {} enc -d -aes-256-cfb -pass file:{} | {}",
            quote(&settings.openssl_path),
            quote_path(key),
            tar
        ),
        None => tar,
    }
}

fn shell(command: &str) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(command).kill_on_drop(true);
    cmd
}

/// A spawned pipeline with its stderr being drained in the background.
struct Running {
    child: Child,
    stderr: JoinHandle<String>,
}

impl Running {
    fn spawn(mut command: Command, stdin: Stdio, stdout: Stdio) -> Result<Self> {
        let mut child = command
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()?;
        let stderr = child.stderr.take();
        let stderr = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut text).await;
            }
            text
        });
        Ok(Self { child, stderr })
    }

    async fn finish(mut self, what: &str) -> Result<()> {
        let status = self.child.wait().await?;
        let stderr = self.stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(AgentError::Engine(format!(
                "{} failed ({}): {}",
                what,
                status,
                stderr.trim()
            )));
        }
        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", what, stderr.trim());
        }
        Ok(())
    }
}

struct Producer {
    reader: ReaderStream<ChildStdout>,
    process: Running,
}

pub struct TarEngine {
    settings: TarSettings,
}

impl TarEngine {
    pub fn new(settings: TarSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TarSettings {
        &self.settings
    }
}

#[async_trait]
impl BackupEngine for TarEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn backup_data(&self, resource: &str, manifest_path: &Path) -> Result<ChunkStream> {
        let command = backup_command(&self.settings, resource, manifest_path);
        info!("Execution command: {}", command);

        let mut process = Running::spawn(shell(&command), Stdio::null(), Stdio::piped())?;
        let stdout = process
            .child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Engine("tar stdout not captured".to_string()))?;
        let producer = Producer {
            reader: ReaderStream::with_capacity(stdout, self.settings.chunk_size.max(1)),
            process,
        };

        Ok(stream::unfold(Some(producer), |state| async move {
            let mut producer = state?;
            match producer.reader.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), Some(producer))),
                Some(Err(e)) => Some((Err(e.into()), None)),
                None => match producer.process.finish("tar backup").await {
                    Ok(()) => None,
                    Err(e) => Some((Err(e), None)),
                },
            }
        })
        .boxed())
    }

    async fn prepare_restore(&self, destination: &str, overwrite: bool) -> Result<()> {
        if self.settings.dry_run {
            return Ok(());
        }
        tokio::fs::create_dir_all(destination).await?;
        let mut entries = tokio::fs::read_dir(destination).await?;
        if !overwrite && entries.next_entry().await?.is_some() {
            return Err(AgentError::Policy(format!(
                "restore directory {} is not empty",
                destination
            )));
        }
        Ok(())
    }

    async fn restore_level(
        &self,
        destination: &str,
        channel: Arc<BoundedChannel>,
        backup: &Backup,
        metadata: &EngineMetadata,
    ) -> Result<()> {
        require_key(metadata, self.settings.encrypt_pass_file.is_some())?;
        let compression = match metadata.compression.as_deref() {
            Some(name) => name.parse()?,
            None => self.settings.compression,
        };
        let command = restore_command(&self.settings, compression, destination);
        info!("Restoring {} with: {}", backup, command);

        let stdout = if self.settings.dry_run { Stdio::inherit() } else { Stdio::null() };
        let mut process = Running::spawn(shell(&command), Stdio::piped(), stdout)?;
        let mut stdin = process
            .child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Engine("tar stdin not captured".to_string()))?;

        let fed = async {
            let mut total = 0u64;
            while let Some(chunk) = channel.recv().await? {
                stdin.write_all(&chunk).await?;
                total += chunk.len() as u64;
            }
            stdin.shutdown().await?;
            Ok::<_, AgentError>(total)
        }
        .await;
        drop(stdin);

        match fed {
            Ok(total) => {
                process.finish("tar restore").await?;
                info!("Restored {} ({} bytes)", backup, total);
                Ok(())
            }
            // tar's own failure explains a broken pipe better than the write error.
            Err(e) => Err(process.finish("tar restore").await.err().unwrap_or(e)),
        }
    }

    async fn metadata(&self, _resource: &str) -> Result<EngineMetadata> {
        Ok(EngineMetadata {
            engine: ENGINE_NAME.to_string(),
            compression: Some(self.settings.compression.as_str().to_string()),
            encryption: self.settings.encrypt_pass_file.is_some(),
            extra: Default::default(),
        })
    }
}
