//! FTP and FTPS storage over suppaftp.

use crate::storage::blocking::{pump, read_blocking, run_blocking, write_blocking};
use crate::storage::fslike::{join, FsBackend, FsLikeStorage};
use crate::storage::StorageKind;
use crate::streaming::ChunkStream;
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};
use std::sync::Arc;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, NativeTlsConnector, NativeTlsFtpStream, Status};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpSettings {
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Remote directory holding the backups.
    pub path: String,
}

fn default_ftp_port() -> u16 {
    21
}

#[derive(Clone)]
pub struct FtpFs {
    settings: Arc<FtpSettings>,
    tls: bool,
}

pub type FtpStorage = FsLikeStorage<FtpFs>;

impl FsLikeStorage<FtpFs> {
    /// Plain FTP, or explicit FTPS when `tls` is set.
    pub fn ftp(settings: FtpSettings, tls: bool, chunk_size: usize) -> Self {
        let root = settings.path.clone();
        FsLikeStorage::new(
            FtpFs {
                settings: Arc::new(settings),
                tls,
            },
            root,
            chunk_size,
        )
    }
}

fn is_missing(e: &FtpError) -> bool {
    matches!(e, FtpError::UnexpectedResponse(response) if response.status == Status::FileUnavailable)
}

fn open_error(path: &str, e: FtpError) -> AgentError {
    if is_missing(&e) {
        AgentError::NotFound(path.to_string())
    } else {
        e.into()
    }
}

/// Last path component of an NLST entry; servers differ on returning full paths.
fn entry_name(entry: &str) -> &str {
    entry.trim_end_matches('/').rsplit('/').next().unwrap_or(entry)
}

impl FtpFs {
    fn connect(settings: &FtpSettings, tls: bool) -> Result<NativeTlsFtpStream> {
        let mut ftp = NativeTlsFtpStream::connect((settings.host.as_str(), settings.port))?;
        if tls {
            let connector = TlsConnector::new()
                .map_err(|e| AgentError::Storage(format!("cannot build TLS connector: {}", e)))?;
            ftp = ftp.into_secure(NativeTlsConnector::from(connector), &settings.host)?;
        }
        ftp.login(&settings.username, &settings.password)?;
        ftp.transfer_type(FileType::Binary)?;
        debug!("Connected to ftp{}://{}:{}", if tls { "s" } else { "" }, settings.host, settings.port);
        Ok(ftp)
    }

    async fn with_ftp<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut NativeTlsFtpStream) -> Result<T> + Send + 'static,
    {
        let settings = Arc::clone(&self.settings);
        let tls = self.tls;
        run_blocking(move || {
            let mut ftp = Self::connect(&settings, tls)?;
            let result = op(&mut ftp);
            let _ = ftp.quit();
            result
        })
        .await
    }
}

/// Entry names of an NLST answer; a missing directory (550) lists empty.
fn listing(dir: &str, answer: std::result::Result<Vec<String>, FtpError>) -> Result<Vec<String>> {
    match answer {
        Ok(entries) => Ok(entries
            .iter()
            .map(|e| entry_name(e).to_string())
            .filter(|n| !n.is_empty() && n != "." && n != "..")
            .collect()),
        Err(e) if is_missing(&e) => {
            debug!("{} does not exist, listing it as empty", dir);
            Ok(Vec::new())
        }
        Err(e) => Err(AgentError::Storage(format!("cannot list {}: {}", dir, e))),
    }
}

fn list(ftp: &mut NativeTlsFtpStream, dir: &str) -> Result<Vec<String>> {
    listing(dir, ftp.nlst(Some(dir)))
}

fn rmtree(ftp: &mut NativeTlsFtpStream, dir: &str) -> Result<()> {
    for name in list(ftp, dir)? {
        let path = join(dir, &name);
        if ftp.rm(&path).is_err() {
            rmtree(ftp, &path)?;
        }
    }
    match ftp.rmdir(dir) {
        Err(e) if !is_missing(&e) => Err(e.into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl FsBackend for FtpFs {
    fn kind(&self) -> StorageKind {
        if self.tls {
            StorageKind::Ftps
        } else {
            StorageKind::Ftp
        }
    }

    async fn listdir(&self, dir: &str) -> Result<Vec<String>> {
        let dir = dir.to_string();
        self.with_ftp(move |ftp| list(ftp, &dir)).await
    }

    async fn create_dirs(&self, dir: &str) -> Result<()> {
        let dir = dir.to_string();
        self.with_ftp(move |ftp| {
            let mut current = if dir.starts_with('/') { "/".to_string() } else { String::new() };
            for part in dir.split('/').filter(|p| !p.is_empty()) {
                current = join(&current, part);
                // Already existing directories answer 550 as well.
                let _ = ftp.mkdir(&current);
            }
            Ok(())
        })
        .await
    }

    async fn rmtree(&self, dir: &str) -> Result<()> {
        let dir = dir.to_string();
        self.with_ftp(move |ftp| rmtree(ftp, &dir)).await
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let path = path.to_string();
        self.with_ftp(move |ftp| {
            let data = ftp.retr_as_buffer(&path).map_err(|e| open_error(&path, e))?;
            Ok(Bytes::from(data.into_inner()))
        })
        .await
    }

    async fn write_file(&self, path: &str, data: Bytes) -> Result<()> {
        let path = path.to_string();
        self.with_ftp(move |ftp| {
            ftp.put_file(&path, &mut Cursor::new(data.as_ref()))?;
            Ok(())
        })
        .await
    }

    async fn read_stream(&self, path: &str, chunk_size: usize) -> Result<ChunkStream> {
        let settings = Arc::clone(&self.settings);
        let tls = self.tls;
        let path = path.to_string();
        Ok(read_blocking(move |tx| {
            let mut ftp = Self::connect(&settings, tls)?;
            let mut data = ftp.retr_as_stream(&path).map_err(|e| open_error(&path, e))?;
            pump(&mut data, chunk_size, tx)?;
            ftp.finalize_retr_stream(data)?;
            let _ = ftp.quit();
            Ok(())
        }))
    }

    async fn write_stream(&self, path: &str, chunks: ChunkStream) -> Result<u64> {
        let settings = Arc::clone(&self.settings);
        let tls = self.tls;
        let path = path.to_string();
        write_blocking(chunks, move |incoming| {
            let mut ftp = Self::connect(&settings, tls)?;
            let mut data = ftp.put_with_stream(&path)?;
            let mut written = 0u64;
            for chunk in incoming {
                data.write_all(&chunk)?;
                written += chunk.len() as u64;
            }
            ftp.finalize_put_stream(data)?;
            let _ = ftp.quit();
            Ok(written)
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = from.to_string();
        let to = to.to_string();
        self.with_ftp(move |ftp| {
            ftp.rename(&from, &to)?;
            Ok(())
        })
        .await
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.with_ftp(move |ftp| match ftp.rm(&path) {
            Err(e) if !is_missing(&e) => Err(e.into()),
            _ => Ok(()),
        })
        .await
    }
}
