//! Backup and restore pipelines.
//!
//! A backup resolves the parent to extend, fetches its manifest, streams the
//! engine's output into storage through one [`BoundedChannel`] and finally
//! stores the new manifest and engine metadata. A level that fails on the
//! way is discarded from storage. A restore replays levels
//! `0..=target` of one chain strictly in order and stops at the first
//! failing level.

use crate::chain::{
    find_one, restore_target_level, select_parent, select_restore_chain, Backup, BackupId,
    IncrementalPolicy, ParentSelection,
};
use crate::engine::{BackupEngine, EngineMetadata};
use crate::storage::{Storage, StorageInfo};
use crate::streaming::{throttle, BoundedChannel, ErrorLog, QueuedWorker, DEFAULT_CAPACITY};
use crate::transfer::progress::{format_bytes, format_duration, format_speed, TransferProgress};
use crate::transfer::progress_stream::{ProgressCallback, ProgressStream};
use crate::utils::errors::{AgentError, Phase, Result};
use crate::utils::time::now_timestamp;
use futures_util::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// File name of the engine manifest inside the per-run work directory.
const MANIFEST_FILE: &str = "engine_manifest";

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Chunks in flight between producer and consumer.
    pub queue_size: usize,
    /// Parent of the per-run temporary directory; the system temp dir if unset.
    pub work_dir: Option<PathBuf>,
    /// Bytes per second sent to storage during a backup.
    pub upload_limit: Option<u64>,
    /// Bytes per second read from storage during a restore.
    pub download_limit: Option<u64>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_CAPACITY,
            work_dir: None,
            upload_limit: None,
            download_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub resource: String,
    pub hostname_backup_name: String,
    pub policy: IncrementalPolicy,
    /// Timestamp of the new backup; now if unset.
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub hostname_backup_name: String,
    pub destination: String,
    pub restore_from_date: Option<u64>,
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub backup: BackupId,
    pub level: u32,
    pub bytes: u64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackupOutcome {
    Completed(BackupResult),
    /// The chain is at its maximum level and the policy says skip.
    Skipped { hostname_backup_name: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub chain: BackupId,
    pub levels: Vec<u32>,
    pub bytes: u64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelSummary {
    pub backup: BackupId,
    pub level: u32,
    pub timestamp: u64,
    pub tar_meta: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainSummary {
    pub backup: BackupId,
    pub timestamp: u64,
    pub levels: Vec<LevelSummary>,
}

impl ChainSummary {
    fn of(chain: &Backup) -> Self {
        Self {
            backup: chain.id().clone(),
            timestamp: chain.timestamp(),
            levels: chain
                .chain()
                .into_iter()
                .map(|b| LevelSummary {
                    backup: b.id().clone(),
                    level: b.level(),
                    timestamp: b.timestamp(),
                    tar_meta: b.tar_meta(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoReport {
    pub storages: Vec<StorageInfo>,
    pub chains: Vec<ChainSummary>,
    /// Most recent backup at or before the requested date.
    pub latest: Option<BackupId>,
}

/// Callback that logs throughput and keeps the final byte count.
fn counting_progress(label: String, total: Arc<AtomicU64>) -> ProgressCallback {
    Arc::new(move |p: &TransferProgress| {
        total.store(p.transferred_bytes, Ordering::Relaxed);
        info!(
            "{}: {} transferred ({})",
            label,
            format_bytes(p.transferred_bytes),
            format_speed(p.bytes_per_second)
        );
    })
}

/// Main pipeline executor
pub struct BackupExecutor {
    storage: Arc<dyn Storage>,
    engine: Arc<dyn BackupEngine>,
    options: ExecutorOptions,
    cancel_token: CancellationToken,
}

impl BackupExecutor {
    /// Create a new executor (no cancellation support)
    pub fn new(storage: Arc<dyn Storage>, engine: Arc<dyn BackupEngine>, options: ExecutorOptions) -> Self {
        Self::with_cancel(storage, engine, options, CancellationToken::new())
    }

    /// Create a new executor whose transfers stop when `cancel_token` fires
    pub fn with_cancel(
        storage: Arc<dyn Storage>,
        engine: Arc<dyn BackupEngine>,
        options: ExecutorOptions,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            storage,
            engine,
            options,
            cancel_token,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn channel(&self) -> Arc<BoundedChannel> {
        BoundedChannel::with_token(self.options.queue_size, self.cancel_token.child_token())
    }

    async fn work_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("chain-backup-");
        let dir = match &self.options.work_dir {
            Some(parent) => {
                tokio::fs::create_dir_all(parent).await?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Turn the failures of one transfer into a single error.
    fn transfer_result(&self, errors: ErrorLog) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        errors.into_result()
    }

    /// Take the next backup of `request.resource`.
    pub async fn backup(&self, request: &BackupRequest) -> Result<BackupOutcome> {
        let start_time = Instant::now();
        let name = request.hostname_backup_name.as_str();
        let timestamp = request.timestamp.unwrap_or_else(now_timestamp);

        let chains = self
            .storage
            .find_all(name)
            .await
            .map_err(|e| e.in_phase(Phase::ParentResolution))?;

        let (backup, parent) = match select_parent(&chains, &request.policy, timestamp) {
            ParentSelection::Skip => {
                info!("Nothing to do for {}: maximum level reached", name);
                return Ok(BackupOutcome::Skipped {
                    hostname_backup_name: name.to_string(),
                });
            }
            ParentSelection::Fresh => (Backup::full(name, timestamp), None),
            ParentSelection::Extend(parent) => {
                let backup = Backup::next_level(parent, timestamp)
                    .map_err(|e| e.in_phase(Phase::ParentResolution))?;
                (backup, Some(parent))
            }
        };
        info!(
            "Starting level {} backup {} of {} (engine: {}, storage: {})",
            backup.level(),
            backup,
            request.resource,
            self.engine.name(),
            self.storage.kind()
        );

        let work_dir = self.work_dir().await.map_err(|e| e.in_phase(Phase::ManifestFetch))?;
        let manifest_path = work_dir.path().join(MANIFEST_FILE);
        if let Some(parent) = parent {
            self.storage
                .download_meta_file(parent, &manifest_path)
                .await
                .map_err(|e| e.in_phase(Phase::ManifestFetch))?;
            info!("Fetched manifest of {}", parent);
        }

        let bytes = match self.stream_backup(&request.resource, &backup, &manifest_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.discard(&backup).await;
                return Err(e.in_phase(Phase::Stream));
            }
        };

        if let Err(e) = self.post_backup(&request.resource, &backup, &manifest_path).await {
            self.discard(&backup).await;
            return Err(e.in_phase(Phase::PostBackup));
        }

        let duration_secs = start_time.elapsed().as_secs();
        info!(
            "Backup {} completed: {} in {}",
            backup,
            format_bytes(bytes),
            format_duration(duration_secs)
        );
        Ok(BackupOutcome::Completed(BackupResult {
            backup: backup.id().clone(),
            level: backup.level(),
            bytes,
            duration_secs,
        }))
    }

    /// Drop what a failed run stored for `backup`; the run's own error wins.
    async fn discard(&self, backup: &Backup) {
        match self.storage.discard(backup).await {
            Ok(()) => warn!("Discarded incomplete backup {}", backup),
            Err(e) => warn!("Incomplete backup {} could not be discarded: {}", backup, e),
        }
    }

    async fn stream_backup(&self, resource: &str, backup: &Backup, manifest_path: &Path) -> Result<u64> {
        let channel = self.channel();
        let errors = ErrorLog::new();
        let total = Arc::new(AtomicU64::new(0));

        let producer = {
            let engine = Arc::clone(&self.engine);
            let resource = resource.to_string();
            let manifest_path = manifest_path.to_path_buf();
            let progress = counting_progress(format!("backup {}", backup), Arc::clone(&total));
            let limit = self.options.upload_limit;
            QueuedWorker::spawn("engine", Arc::clone(&channel), errors.clone(), move |channel| async move {
                let data = engine.backup_data(&resource, &manifest_path).await?;
                let data = ProgressStream::new(data, progress).boxed();
                channel.put_messages(throttle(data, limit)).await
            })
        };
        let consumer = {
            let storage = Arc::clone(&self.storage);
            let backup = backup.clone();
            QueuedWorker::spawn("storage", Arc::clone(&channel), errors.clone(), move |channel| async move {
                storage.write_backup(channel, &backup).await
            })
        };

        // Failures are collected in `errors`; join only to wait for both sides.
        let _ = producer.join().await;
        let _ = consumer.join().await;
        self.transfer_result(errors)?;
        Ok(total.load(Ordering::Relaxed))
    }

    async fn post_backup(&self, resource: &str, backup: &Backup, manifest_path: &Path) -> Result<()> {
        if tokio::fs::try_exists(manifest_path).await? {
            self.storage.upload_meta_file(backup, manifest_path).await?;
        } else {
            warn!("Engine {} left no manifest; {} cannot be extended", self.engine.name(), backup);
        }
        let metadata = self.engine.metadata(resource).await?;
        self.storage.upload_engine_metadata(backup, &metadata).await
    }

    /// Replay one chain of `request.hostname_backup_name` into `request.destination`.
    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreResult> {
        let start_time = Instant::now();
        let name = request.hostname_backup_name.as_str();
        let date = request.restore_from_date;

        let chains = self
            .storage
            .find_all(name)
            .await
            .map_err(|e| e.in_phase(Phase::ChainLookup))?;
        if chains.is_empty() {
            return Err(AgentError::NoBackups(name.to_string()).in_phase(Phase::ChainLookup));
        }
        let chain = select_restore_chain(&chains, date).ok_or_else(|| {
            AgentError::NoBackups(format!("{} at or before {}", name, date.unwrap_or_default()))
                .in_phase(Phase::ChainLookup)
        })?;
        let target = restore_target_level(chain, date);
        info!("Restoring chain {} up to level {} into {}", chain, target, request.destination);

        self.engine
            .prepare_restore(&request.destination, request.overwrite)
            .await
            .map_err(|e| e.in_phase(Phase::RestorePrepare))?;

        let mut levels = Vec::new();
        let mut bytes = 0;
        for level in 0..=target {
            let backup = chain
                .increment(level)
                .ok_or_else(|| AgentError::NotFound(format!("level {} of {}", level, chain)))
                .map_err(|e| e.in_phase(Phase::RestoreLevel(level)))?;
            info!("Restoring level {} ({})", level, backup);
            bytes += self
                .restore_level(backup, &request.destination)
                .await
                .map_err(|e| e.in_phase(Phase::RestoreLevel(level)))?;
            levels.push(level);
        }

        let duration_secs = start_time.elapsed().as_secs();
        info!(
            "Restore of {} completed: {} levels, {} in {}",
            chain,
            levels.len(),
            format_bytes(bytes),
            format_duration(duration_secs)
        );
        Ok(RestoreResult {
            chain: chain.id().clone(),
            levels,
            bytes,
            duration_secs,
        })
    }

    async fn level_metadata(&self, backup: &Backup) -> Result<EngineMetadata> {
        let metadata = match self.storage.download_engine_metadata(backup).await {
            Ok(metadata) => metadata,
            Err(e) if matches!(e.root(), AgentError::NotFound(_)) => {
                warn!("No engine metadata for {}, assuming {} defaults", backup, self.engine.name());
                return Ok(EngineMetadata::for_engine(self.engine.name()));
            }
            Err(e) => return Err(e),
        };
        if metadata.engine != self.engine.name() {
            return Err(AgentError::Policy(format!(
                "{} was taken by engine {}, not {}",
                backup,
                metadata.engine,
                self.engine.name()
            )));
        }
        Ok(metadata)
    }

    async fn restore_level(&self, backup: &Backup, destination: &str) -> Result<u64> {
        let metadata = self.level_metadata(backup).await?;
        let channel = self.channel();
        let errors = ErrorLog::new();
        let total = Arc::new(AtomicU64::new(0));

        let reader = {
            let storage = Arc::clone(&self.storage);
            let backup = backup.clone();
            let progress = counting_progress(format!("restore {}", backup), Arc::clone(&total));
            let limit = self.options.download_limit;
            QueuedWorker::spawn("storage", Arc::clone(&channel), errors.clone(), move |channel| async move {
                let data = storage.backup_blocks(&backup).await?;
                let data = ProgressStream::new(data, progress).boxed();
                channel.put_messages(throttle(data, limit)).await
            })
        };
        let writer = {
            let engine = Arc::clone(&self.engine);
            let backup = backup.clone();
            let destination = destination.to_string();
            QueuedWorker::spawn("engine", Arc::clone(&channel), errors.clone(), move |channel| async move {
                engine
                    .restore_level(&destination, channel, &backup, &metadata)
                    .await
            })
        };

        let _ = reader.join().await;
        let _ = writer.join().await;
        self.transfer_result(errors)?;
        Ok(total.load(Ordering::Relaxed))
    }

    /// Delete every chain of `hostname_backup_name` last updated before `cutoff`.
    pub async fn remove_older_than(&self, hostname_backup_name: &str, cutoff: u64) -> Result<Vec<BackupId>> {
        let removed = self
            .storage
            .remove_older_than(cutoff, hostname_backup_name)
            .await?;
        info!("Removed {} chains of {} older than {}", removed.len(), hostname_backup_name, cutoff);
        Ok(removed)
    }

    /// Storage summary plus the chains of `hostname_backup_name`.
    pub async fn info(&self, hostname_backup_name: &str, recent_to_date: Option<u64>) -> Result<InfoReport> {
        let storages = self.storage.info().await?;
        let chains = self.storage.find_all(hostname_backup_name).await?;
        Ok(InfoReport {
            storages,
            latest: find_one(&chains, recent_to_date).map(|b| b.id().clone()),
            chains: chains.iter().map(ChainSummary::of).collect(),
        })
    }
}
