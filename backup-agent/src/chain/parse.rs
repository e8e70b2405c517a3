//! Turning a flat storage listing into backup chains.

use super::{Backup, BackupId, ENGINE_METADATA_PREFIX, PARTIAL_SUFFIX, TAR_METADATA_PREFIX};
use std::collections::HashSet;
use tracing::{debug, error, warn};

/// Group backend object names into level-0 backups with their increments.
///
/// Names look like `{name}_{timestamp}_{level}`; a `tar_metadata_` sibling
/// marks the backup as having a manifest. Unfinished uploads, unparseable
/// names and increments without a preceding level 0 are logged and dropped.
pub fn parse_backups<I, S>(names: I) -> Vec<Backup>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut metadata = HashSet::new();
    let mut data = Vec::new();
    for name in names {
        let name = name.as_ref();
        if name.ends_with(PARTIAL_SUFFIX) {
            debug!("Ignoring unfinished upload {}", name);
        } else if let Some(stripped) = name.strip_prefix(TAR_METADATA_PREFIX) {
            metadata.insert(stripped.to_string());
        } else if !name.starts_with(ENGINE_METADATA_PREFIX) {
            data.push(name.to_string());
        }
    }

    let mut parsed: Vec<(BackupId, bool)> = Vec::with_capacity(data.len());
    for name in data {
        match name.parse::<BackupId>() {
            Ok(id) => {
                let tar_meta = metadata.contains(&name);
                parsed.push((id, tar_meta));
            }
            Err(e) => error!("Skipping unparseable backup name {:?}: {}", name, e),
        }
    }
    parsed.sort_by_key(|(id, _)| (id.timestamp, id.level));

    let mut fulls: Vec<Backup> = Vec::new();
    for (id, tar_meta) in parsed {
        if id.level == 0 {
            fulls.push(Backup::full(id.hostname_backup_name, id.timestamp).with_tar_meta(tar_meta));
            continue;
        }

        let Some(current) = fulls
            .iter_mut()
            .rev()
            .find(|f| f.hostname_backup_name() == id.hostname_backup_name)
        else {
            warn!("Incremental backup without parent: {}", id);
            continue;
        };

        let attached = Backup::increment_of(current, id.timestamp, id.level)
            .map(|inc| inc.with_tar_meta(tar_meta))
            .and_then(|inc| current.add_increment(inc));
        if let Err(e) = attached {
            error!("Cannot attach {} to {}: {}", id, current, e);
        }
    }

    fulls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_with_metadata_sibling() {
        let chains = parse_backups(["a_1000_0", "a_2000_1", "tar_metadata_a_1000_0"]);
        assert_eq!(chains.len(), 1);

        let full = &chains[0];
        assert_eq!(full.timestamp(), 1000);
        assert_eq!(full.level(), 0);
        assert!(full.tar_meta());

        let inc = full.increment(1).unwrap();
        assert_eq!(inc.timestamp(), 2000);
        assert_eq!(inc.level(), 1);
        assert!(!inc.tar_meta());
        assert_eq!(full.latest_update().level(), 1);
    }

    #[test]
    fn test_orphan_increment_is_dropped() {
        let chains = parse_backups(["a_100_2"]);
        assert!(chains.is_empty());
    }

    #[test]
    fn test_garbage_does_not_abort_listing() {
        let chains = parse_backups(["README", "a_1000_0", "a_x_1", "engine_metadata_a_1000_0"]);
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].levels(), vec![0]);
    }

    #[test]
    fn test_unfinished_upload_is_not_a_level() {
        let chains = parse_backups(["a_1000_0", "tar_metadata_a_1000_0", "a_2000_1.partial"]);
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].levels(), vec![0]);
        assert!(parse_backups(["a_1000_0.partial"]).is_empty());
    }

    #[test]
    fn test_increments_attach_to_preceding_full() {
        let chains = parse_backups([
            "a_3000_1",
            "a_1000_0",
            "a_2000_1",
            "a_2500_0",
            "a_3500_2",
            "tar_metadata_a_2500_0",
            "tar_metadata_a_3000_1",
        ]);
        assert_eq!(chains.len(), 2);

        assert_eq!(chains[0].timestamp(), 1000);
        assert_eq!(chains[0].levels(), vec![0, 1]);
        assert_eq!(chains[0].increment(1).unwrap().timestamp(), 2000);

        assert_eq!(chains[1].timestamp(), 2500);
        assert_eq!(chains[1].levels(), vec![0, 1, 2]);
        assert!(chains[1].increment(1).unwrap().tar_meta());
        assert_eq!(chains[1].latest_update().timestamp(), 3500);
    }

    #[test]
    fn test_names_are_kept_apart() {
        let chains = parse_backups(["a_1000_0", "b_1500_0", "a_2000_1"]);
        assert_eq!(chains.len(), 2);
        let a = chains.iter().find(|c| c.hostname_backup_name() == "a").unwrap();
        assert_eq!(a.levels(), vec![0, 1]);
    }
}
