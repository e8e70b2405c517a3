//! Full/incremental backup lineage.
//!
//! A level-0 [`Backup`] owns its increments; an incremental backup only
//! remembers the timestamp of the level-0 backup it belongs to.

pub mod parse;
pub mod policy;

use crate::storage::Storage;
use crate::utils::errors::{AgentError, Result};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

pub use parse::parse_backups;
pub use policy::{
    find_one, restore_target_level, select_parent, select_restore_chain, IncrementalPolicy,
    MaxLevelAction, ParentSelection,
};

/// Prefix of the engine manifest stored next to each backup.
pub const TAR_METADATA_PREFIX: &str = "tar_metadata_";

/// Prefix of the JSON engine-metadata blob stored next to each backup.
pub const ENGINE_METADATA_PREFIX: &str = "engine_metadata_";

/// Suffix of backup data still being written; never listed as a backup.
pub const PARTIAL_SUFFIX: &str = ".partial";

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(.*)_(\d+)_(\d+?)$").expect("static regex"))
}

/// `{hostname_backup_name}_{timestamp}_{level}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupId {
    pub hostname_backup_name: String,
    pub timestamp: u64,
    pub level: u32,
}

impl BackupId {
    pub fn new(hostname_backup_name: impl Into<String>, timestamp: u64, level: u32) -> Self {
        Self {
            hostname_backup_name: hostname_backup_name.into(),
            timestamp,
            level,
        }
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.hostname_backup_name, self.timestamp, self.level)
    }
}

impl Serialize for BackupId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for BackupId {
    type Err = AgentError;

    fn from_str(value: &str) -> Result<Self> {
        let caps = id_pattern()
            .captures(value)
            .ok_or_else(|| AgentError::Parse(format!("cannot parse backup from string: {}", value)))?;

        let timestamp = caps[2]
            .parse::<u64>()
            .map_err(|e| AgentError::Parse(format!("bad timestamp in {}: {}", value, e)))?;
        let level = caps[3]
            .parse::<u32>()
            .map_err(|e| AgentError::Parse(format!("bad level in {}: {}", value, e)))?;

        Ok(Self::new(&caps[1], timestamp, level))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lineage {
    Full,
    Increment { full_timestamp: u64 },
}

/// One point-in-time backup artifact.
#[derive(Clone)]
pub struct Backup {
    id: BackupId,
    tar_meta: bool,
    lineage: Lineage,
    /// Levels >= 1; only populated on level-0 backups.
    increments: BTreeMap<u32, Backup>,
    latest_level: u32,
    storage: Option<Arc<dyn Storage>>,
}

impl Backup {
    /// A fresh level-0 backup.
    pub fn full(hostname_backup_name: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: BackupId::new(hostname_backup_name, timestamp, 0),
            tar_meta: false,
            lineage: Lineage::Full,
            increments: BTreeMap::new(),
            latest_level: 0,
            storage: None,
        }
    }

    /// An increment at `level` belonging to the level-0 backup `full`.
    pub fn increment_of(full: &Backup, timestamp: u64, level: u32) -> Result<Self> {
        if full.level() != 0 {
            return Err(AgentError::Policy(format!(
                "{} is not a level-0 backup",
                full.id
            )));
        }
        if level == 0 {
            return Err(AgentError::Policy(
                "level 0 backups cannot be created as increments".to_string(),
            ));
        }
        Ok(Self {
            id: BackupId::new(full.hostname_backup_name(), timestamp, level),
            tar_meta: false,
            lineage: Lineage::Increment {
                full_timestamp: full.timestamp(),
            },
            increments: BTreeMap::new(),
            latest_level: level,
            storage: None,
        })
    }

    /// The backup that extends `parent` by one level.
    pub fn next_level(parent: &Backup, timestamp: u64) -> Result<Self> {
        if !parent.tar_meta {
            return Err(AgentError::Policy(format!(
                "{} has no metadata and cannot be extended",
                parent.id
            )));
        }
        let level = parent.level() + 1;
        Ok(Self {
            id: BackupId::new(parent.hostname_backup_name(), timestamp, level),
            tar_meta: false,
            lineage: Lineage::Increment {
                full_timestamp: parent.full_backup_timestamp(),
            },
            increments: BTreeMap::new(),
            latest_level: level,
            storage: None,
        })
    }

    pub fn with_tar_meta(mut self, tar_meta: bool) -> Self {
        self.tar_meta = tar_meta;
        self
    }

    pub fn id(&self) -> &BackupId {
        &self.id
    }

    pub fn hostname_backup_name(&self) -> &str {
        &self.id.hostname_backup_name
    }

    pub fn timestamp(&self) -> u64 {
        self.id.timestamp
    }

    pub fn level(&self) -> u32 {
        self.id.level
    }

    pub fn tar_meta(&self) -> bool {
        self.tar_meta
    }

    pub fn set_tar_meta(&mut self, tar_meta: bool) {
        self.tar_meta = tar_meta;
    }

    /// True iff this backup is its own level-0 ancestor.
    pub fn is_full_backup(&self) -> bool {
        self.lineage == Lineage::Full
    }

    pub fn full_backup_timestamp(&self) -> u64 {
        match self.lineage {
            Lineage::Full => self.id.timestamp,
            Lineage::Increment { full_timestamp } => full_timestamp,
        }
    }

    pub fn full_backup_id(&self) -> BackupId {
        BackupId::new(self.hostname_backup_name(), self.full_backup_timestamp(), 0)
    }

    /// Backup at `level` of this chain; level 0 is the backup itself.
    pub fn increment(&self, level: u32) -> Option<&Backup> {
        if level == 0 && self.is_full_backup() {
            return Some(self);
        }
        self.increments.get(&level)
    }

    /// Every level of the chain, ascending, including level 0.
    pub fn levels(&self) -> Vec<u32> {
        if !self.is_full_backup() {
            return Vec::new();
        }
        std::iter::once(0).chain(self.increments.keys().copied()).collect()
    }

    /// Every backup of the chain, ascending by level.
    pub fn chain(&self) -> Vec<&Backup> {
        self.levels().into_iter().filter_map(|l| self.increment(l)).collect()
    }

    /// The highest-level backup added to this chain.
    pub fn latest_update(&self) -> &Backup {
        self.increment(self.latest_level).unwrap_or(self)
    }

    /// Attach `increment` to this level-0 backup.
    ///
    /// An occupied level is only replaced by a newer timestamp.
    pub fn add_increment(&mut self, increment: Backup) -> Result<()> {
        if self.level() != 0 {
            return Err(AgentError::Policy(
                "cannot add increment to increment".to_string(),
            ));
        }
        if increment.level() == 0 {
            return Err(AgentError::Policy(
                "cannot add increment with level 0".to_string(),
            ));
        }
        if increment.full_backup_timestamp() != self.timestamp()
            || increment.hostname_backup_name() != self.hostname_backup_name()
        {
            return Err(AgentError::Policy(format!(
                "{} does not belong to chain {}",
                increment.id, self.id
            )));
        }

        let level = increment.level();
        let replace = self
            .increments
            .get(&level)
            .map_or(true, |existing| increment.timestamp() > existing.timestamp());
        if replace {
            self.increments.insert(level, increment);
        }
        if self.latest_level <= level {
            self.latest_level = level;
        }
        Ok(())
    }

    pub fn tar_metadata_name(&self) -> String {
        format!("{}{}", TAR_METADATA_PREFIX, self.id)
    }

    pub fn engine_metadata_name(&self) -> String {
        format!("{}{}", ENGINE_METADATA_PREFIX, self.id)
    }

    /// Storage this backup was listed from, if it differs from the default one.
    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.storage.as_ref()
    }

    /// Record `storage` as the origin of this backup and all its increments.
    pub fn attach_storage(&mut self, storage: Arc<dyn Storage>) {
        for increment in self.increments.values_mut() {
            increment.attach_storage(Arc::clone(&storage));
        }
        self.storage = Some(storage);
    }
}

impl fmt::Display for Backup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

impl fmt::Debug for Backup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backup")
            .field("id", &self.id.to_string())
            .field("tar_meta", &self.tar_meta)
            .field("full_backup_timestamp", &self.full_backup_timestamp())
            .field("levels", &self.increments.keys().collect::<Vec<_>>())
            .field("latest_level", &self.latest_level)
            .field("storage", &self.storage.as_ref().map(|s| s.kind()))
            .finish()
    }
}

impl PartialEq for Backup {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.tar_meta == other.tar_meta
            && self.lineage == other.lineage
            && self.increments.len() == other.increments.len()
    }
}
