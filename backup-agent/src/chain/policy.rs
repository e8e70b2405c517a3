//! Choosing what to extend on backup and what to replay on restore.

use super::Backup;
use crate::utils::time::days_to_seconds;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What to do once the latest increment reached `max_level`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxLevelAction {
    /// Start a new level-0 chain.
    #[default]
    Fresh,
    /// Do not back up at all.
    Skip,
}

/// The incremental knobs of a backup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalPolicy {
    /// Always take a level-0 backup.
    pub no_incremental: bool,

    /// Highest level a chain may reach.
    pub max_level: Option<u32>,

    /// Once reached, keep re-taking this level on top of `always_level - 1`.
    pub always_level: Option<u32>,

    /// Start a new chain when the latest increment is older than this many days.
    pub restart_always_level: Option<u64>,

    pub max_level_action: MaxLevelAction,
}

/// Outcome of parent selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParentSelection<'a> {
    /// Take a new level-0 backup.
    Fresh,
    /// Take `parent.level() + 1` on top of `parent`.
    Extend(&'a Backup),
    /// Nothing to do (`max_level` reached with [`MaxLevelAction::Skip`]).
    Skip,
}

impl ParentSelection<'_> {
    /// Level the new backup will have, if one is taken.
    pub fn next_level(&self) -> Option<u32> {
        match self {
            ParentSelection::Fresh => Some(0),
            ParentSelection::Extend(parent) => Some(parent.level() + 1),
            ParentSelection::Skip => None,
        }
    }
}

/// Pick the backup the next run should build on.
///
/// `chains` are the level-0 backups of one name, `now` is unix seconds.
pub fn select_parent<'a>(
    chains: &'a [Backup],
    policy: &IncrementalPolicy,
    now: u64,
) -> ParentSelection<'a> {
    if policy.no_incremental {
        debug!("Incremental backups disabled");
        return ParentSelection::Fresh;
    }
    let Some(full) = chains.iter().max_by_key(|b| b.timestamp()) else {
        return ParentSelection::Fresh;
    };
    let latest = full.latest_update();

    let candidate = match (policy.max_level, policy.always_level, policy.restart_always_level) {
        (Some(max), _, _) if latest.level() >= max => {
            info!("Chain {} reached max level {}", full, max);
            return match policy.max_level_action {
                MaxLevelAction::Fresh => ParentSelection::Fresh,
                MaxLevelAction::Skip => ParentSelection::Skip,
            };
        }
        (_, Some(always), _) if latest.level() >= always => {
            if always == 0 {
                return ParentSelection::Fresh;
            }
            match full.increment(always - 1) {
                Some(parent) => parent,
                None => {
                    warn!("Chain {} has no level {}, starting over", full, always - 1);
                    return ParentSelection::Fresh;
                }
            }
        }
        (_, _, Some(days)) if now.saturating_sub(latest.timestamp()) > days_to_seconds(days) => {
            info!("Latest backup {} is older than {} days, starting over", latest, days);
            return ParentSelection::Fresh;
        }
        _ => latest,
    };

    if !candidate.tar_meta() {
        warn!("Backup {} has no metadata, taking a full backup", candidate);
        return ParentSelection::Fresh;
    }
    ParentSelection::Extend(candidate)
}

/// Level-0 chain a restore starts from.
///
/// With a date this is the *oldest* chain at or before it that has metadata;
/// without one, the newest chain.
pub fn select_restore_chain(chains: &[Backup], restore_from_date: Option<u64>) -> Option<&Backup> {
    match restore_from_date {
        Some(date) => chains
            .iter()
            .filter(|b| b.timestamp() <= date && b.tar_meta())
            .min_by_key(|b| b.timestamp()),
        None => chains.iter().max_by_key(|b| b.timestamp()),
    }
}

/// Highest level of `chain` to replay.
pub fn restore_target_level(chain: &Backup, restore_from_date: Option<u64>) -> u32 {
    let Some(date) = restore_from_date else {
        return chain.latest_update().level();
    };
    let mut level = 0;
    while chain
        .increment(level + 1)
        .is_some_and(|b| b.timestamp() <= date)
    {
        level += 1;
    }
    level
}

/// Most recent backup (any level) at or before `recent_to_date`.
pub fn find_one(chains: &[Backup], recent_to_date: Option<u64>) -> Option<&Backup> {
    let within = |b: &&Backup| recent_to_date.map_or(true, |date| b.timestamp() <= date);
    let full = chains.iter().filter(within).max_by_key(|b| b.timestamp())?;
    full.chain().into_iter().filter(within).max_by_key(|b| b.timestamp())
}
