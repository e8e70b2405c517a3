//! SFTP storage over ssh2.
//!
//! ssh2 is blocking, so every operation opens its own session on the
//! blocking pool.

use crate::storage::blocking::{pump, read_blocking, run_blocking, write_blocking};
use crate::storage::fslike::{join, FsBackend, FsLikeStorage};
use crate::storage::StorageKind;
use crate::streaming::ChunkStream;
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use ssh2::{ErrorCode, RenameFlags, Session, Sftp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// `LIBSSH2_FX_NO_SUCH_FILE`
const SFTP_NO_SUCH_FILE: i32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    /// Private key file; password auth is used when absent.
    #[serde(default)]
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub password: Option<String>,
    /// Remote directory holding the backups.
    pub path: String,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Clone)]
pub struct SftpFs {
    settings: Arc<SshSettings>,
}

pub type SshStorage = FsLikeStorage<SftpFs>;

impl FsLikeStorage<SftpFs> {
    pub fn ssh(settings: SshSettings, chunk_size: usize) -> Self {
        let root = settings.path.clone();
        FsLikeStorage::new(
            SftpFs {
                settings: Arc::new(settings),
            },
            root,
            chunk_size,
        )
    }
}

fn is_missing(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

fn open_error(path: &str, e: ssh2::Error) -> AgentError {
    if is_missing(&e) {
        AgentError::NotFound(path.to_string())
    } else {
        e.into()
    }
}

impl SftpFs {
    /// Authenticated session plus its SFTP channel.
    fn connect(settings: &SshSettings) -> Result<(Session, Sftp)> {
        let tcp = TcpStream::connect((settings.host.as_str(), settings.port))?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        match (&settings.key, &settings.password) {
            (Some(key), _) => session.userauth_pubkey_file(&settings.username, None, key, None)?,
            (None, Some(password)) => session.userauth_password(&settings.username, password)?,
            (None, None) => {
                return Err(AgentError::Config(
                    "ssh storage needs either a key or a password".to_string(),
                ))
            }
        }
        if !session.authenticated() {
            return Err(AgentError::Storage(format!(
                "ssh authentication failed for {}@{}",
                settings.username, settings.host
            )));
        }
        debug!("Connected to {}:{}", settings.host, settings.port);

        let sftp = session.sftp()?;
        Ok((session, sftp))
    }

    async fn with_sftp<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let settings = Arc::clone(&self.settings);
        run_blocking(move || {
            let (_session, sftp) = Self::connect(&settings)?;
            op(&sftp)
        })
        .await
    }
}

fn rmtree(sftp: &Sftp, dir: &Path) -> Result<()> {
    let entries = match sftp.readdir(dir) {
        Ok(entries) => entries,
        Err(e) if is_missing(&e) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for (path, stat) in entries {
        if stat.is_dir() {
            rmtree(sftp, &path)?;
        } else {
            sftp.unlink(&path)?;
        }
    }
    sftp.rmdir(dir)?;
    Ok(())
}

#[async_trait]
impl FsBackend for SftpFs {
    fn kind(&self) -> StorageKind {
        StorageKind::Ssh
    }

    async fn listdir(&self, dir: &str) -> Result<Vec<String>> {
        let dir = PathBuf::from(dir);
        self.with_sftp(move |sftp| match sftp.readdir(&dir) {
            Ok(entries) => Ok(entries
                .into_iter()
                .filter_map(|(path, _)| path.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect()),
            Err(e) if is_missing(&e) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn create_dirs(&self, dir: &str) -> Result<()> {
        let dir = dir.to_string();
        self.with_sftp(move |sftp| {
            let mut current = String::new();
            for part in dir.split('/') {
                current = if current.is_empty() && dir.starts_with('/') {
                    format!("/{}", part)
                } else {
                    join(&current, part)
                };
                if part.is_empty() || sftp.stat(Path::new(&current)).is_ok() {
                    continue;
                }
                sftp.mkdir(Path::new(&current), 0o755)?;
            }
            Ok(())
        })
        .await
    }

    async fn rmtree(&self, dir: &str) -> Result<()> {
        let dir = PathBuf::from(dir);
        self.with_sftp(move |sftp| rmtree(sftp, &dir)).await
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            let mut file = sftp.open(Path::new(&path)).map_err(|e| open_error(&path, e))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            Ok(Bytes::from(data))
        })
        .await
    }

    async fn write_file(&self, path: &str, data: Bytes) -> Result<()> {
        let path = PathBuf::from(path);
        self.with_sftp(move |sftp| {
            let mut file = sftp.create(&path)?;
            file.write_all(&data)?;
            Ok(())
        })
        .await
    }

    async fn read_stream(&self, path: &str, chunk_size: usize) -> Result<ChunkStream> {
        let settings = Arc::clone(&self.settings);
        let path = path.to_string();
        Ok(read_blocking(move |tx| {
            let (_session, sftp) = Self::connect(&settings)?;
            let mut file = sftp.open(Path::new(&path)).map_err(|e| open_error(&path, e))?;
            pump(&mut file, chunk_size, tx)
        }))
    }

    async fn write_stream(&self, path: &str, chunks: ChunkStream) -> Result<u64> {
        let settings = Arc::clone(&self.settings);
        let path = PathBuf::from(path);
        write_blocking(chunks, move |incoming| {
            let (_session, sftp) = Self::connect(&settings)?;
            let mut file = sftp.create(&path)?;
            let mut written = 0u64;
            for chunk in incoming {
                file.write_all(&chunk)?;
                written += chunk.len() as u64;
            }
            file.flush()?;
            Ok(written)
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = PathBuf::from(from);
        let to = PathBuf::from(to);
        self.with_sftp(move |sftp| {
            sftp.rename(&from, &to, Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC))?;
            Ok(())
        })
        .await
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let path = PathBuf::from(path);
        self.with_sftp(move |sftp| match sftp.unlink(&path) {
            Err(e) if !is_missing(&e) => Err(e.into()),
            _ => Ok(()),
        })
        .await
    }
}
