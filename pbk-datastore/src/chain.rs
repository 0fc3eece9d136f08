//! Backup chain resolution.
//!
//! Everything in here works on a snapshot of the catalog (see
//! [`Catalog::list`](crate::Catalog::list)), nothing is cached between operations.

use std::collections::HashSet;

use anyhow::Error;

use pbk_api_types::{BackupId, BackupStatus, Lsn, TimeLineId};

use crate::error::CatalogError;
use crate::manifest::BackupRecord;
use crate::wal::TimelineHistory;

pub fn find_backup(list: &[BackupRecord], backup_id: BackupId) -> Option<&BackupRecord> {
    list.iter().find(|backup| backup.backup_id == backup_id)
}

fn broken(backup_id: BackupId, reason: String) -> Error {
    CatalogError::BrokenChain { backup_id, reason }.into()
}

/// The chain of `backup_id`, ordered from its full backup to the backup itself.
///
/// With `validate` set, every member must be in a usable state. `MERGING` and `MERGED`
/// members are accepted, so an interrupted merge can be resumed.
pub fn resolve_chain(
    list: &[BackupRecord],
    backup_id: BackupId,
    validate: bool,
) -> Result<Vec<BackupRecord>, Error> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();

    let mut current = find_backup(list, backup_id)
        .ok_or(CatalogError::BackupNotFound { backup_id })?;

    loop {
        if !seen.insert(current.backup_id) {
            return Err(broken(
                backup_id,
                format!("parent links of {} form a cycle", current.backup_id),
            ));
        }
        if validate {
            if current.status.is_bad() {
                return Err(broken(
                    backup_id,
                    format!("backup {} has status {}", current.backup_id, current.status),
                ));
            }
            if current.status == BackupStatus::Running {
                return Err(broken(
                    backup_id,
                    format!("backup {} is still running", current.backup_id),
                ));
            }
        }
        chain.push(current.clone());

        let parent_id = match current.parent_backup_id {
            None if current.is_full() => break,
            None => {
                return Err(broken(
                    backup_id,
                    format!(
                        "{} backup {} has no parent",
                        current.backup_mode, current.backup_id
                    ),
                ))
            }
            Some(parent_id) => parent_id,
        };

        current = find_backup(list, parent_id).ok_or_else(|| {
            broken(
                backup_id,
                format!("parent {parent_id} of backup {} is missing", current.backup_id),
            )
        })?;
    }

    chain.reverse();
    Ok(chain)
}

/// Most recent valid full backup on `history`'s timeline, or else on its nearest ancestor
/// timeline that has one.
pub fn find_latest_valid_full<'a>(
    list: &'a [BackupRecord],
    history: &TimelineHistory,
) -> Result<&'a BackupRecord, Error> {
    let timelines = std::iter::once(history.timeline()).chain(history.ancestors().map(|(tli, _)| tli));
    for tli in timelines {
        let found = list
            .iter()
            .rev()
            .filter(|backup| backup.is_full() && backup.current_tli == tli)
            .filter(|backup| backup.status.is_valid())
            .find(|backup| history.contains(tli, backup.stop_lsn));
        if let Some(full) = found {
            return Ok(full);
        }
    }
    Err(CatalogError::NoValidFullBackup {
        timeline: history.timeline(),
    }
    .into())
}

/// The chain a new incremental backup builds on, ending with its parent.
///
/// Candidates are tried newest first. Members still being merged are returned as well, the
/// caller finds them locked.
pub fn find_parent_chain(
    list: &[BackupRecord],
    history: &TimelineHistory,
) -> Result<Vec<BackupRecord>, Error> {
    // fails early if there is nothing to build on at all
    find_latest_valid_full(list, history)?;

    for candidate in list.iter().rev() {
        if !matches!(
            candidate.status,
            BackupStatus::Ok | BackupStatus::Done | BackupStatus::Merging | BackupStatus::Merged
        ) {
            continue;
        }
        if !history.contains(candidate.current_tli, candidate.stop_lsn) {
            continue;
        }
        match resolve_chain(list, candidate.backup_id, true) {
            Ok(chain) => return Ok(chain),
            Err(err) => log::debug!("skipping parent candidate {} - {err}", candidate.backup_id),
        }
    }
    Err(CatalogError::NoValidFullBackup {
        timeline: history.timeline(),
    }
    .into())
}

/// A backup starting at `start_lsn` on `tli` must not start before its parent stopped.
pub fn check_lsn_order(parent: &BackupRecord, start_lsn: Lsn, tli: TimeLineId) -> Result<(), Error> {
    if parent.current_tli == tli && start_lsn < parent.stop_lsn {
        return Err(CatalogError::BackupFromThePast {
            parent: parent.backup_id,
            parent_stop_lsn: parent.stop_lsn,
            start_lsn,
            timeline: tli,
        }
        .into());
    }
    Ok(())
}

/// Check LSN ordering between all neighbours of a resolved chain.
pub fn check_chain_lsn(chain: &[BackupRecord]) -> Result<(), Error> {
    for pair in chain.windows(2) {
        let (parent, child) = (&pair[0], &pair[1]);
        check_lsn_order(parent, child.start_lsn, child.current_tli)?;
    }
    Ok(())
}

/// The chain segment a merge of `backup_id` folds, full backup first.
pub fn merge_segment(list: &[BackupRecord], backup_id: BackupId) -> Result<Vec<BackupRecord>, Error> {
    let chain = resolve_chain(list, backup_id, true)?;
    if chain.len() < 2 {
        anyhow::bail!("backup {backup_id} is a full backup, there is nothing to merge");
    }
    for member in chain.iter() {
        if let Some(dest) = member.merge_dest_backup {
            if dest != backup_id {
                anyhow::bail!(
                    "backup {} takes part in an unfinished merge into {dest}",
                    member.backup_id
                );
            }
        }
    }
    Ok(chain)
}

/// Direct children of `backup_id`.
pub fn children(list: &[BackupRecord], backup_id: BackupId) -> Vec<&BackupRecord> {
    list.iter()
        .filter(|backup| backup.parent_backup_id == Some(backup_id))
        .collect()
}

/// All backups depending on `backup_id`, parents before their children.
pub fn descendants(list: &[BackupRecord], backup_id: BackupId) -> Vec<&BackupRecord> {
    let mut result: Vec<&BackupRecord> = Vec::new();
    let mut seen = HashSet::from([backup_id]);
    let mut queue = vec![backup_id];
    while let Some(id) = queue.pop() {
        for child in children(list, id) {
            if seen.insert(child.backup_id) {
                result.push(child);
                queue.push(child.backup_id);
            }
        }
    }
    result.sort_by_key(|backup| (backup.start_time, backup.backup_id));
    result
}

/// Why a backup is not usable as base for restore or further increments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainState {
    Valid,
    /// An ancestor has a bad status.
    Invalid(BackupId),
    /// An ancestor is missing or the parent links are broken.
    Broken,
}

/// Classify the chain of a backup without failing.
pub fn chain_state(list: &[BackupRecord], backup_id: BackupId) -> ChainState {
    let chain = match resolve_chain(list, backup_id, false) {
        Ok(chain) => chain,
        Err(_) => return ChainState::Broken,
    };
    let ancestors = &chain[..chain.len() - 1];
    match ancestors.iter().find(|backup| backup.status.is_bad()) {
        Some(bad) => ChainState::Invalid(bad.backup_id),
        None => ChainState::Valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pbk_api_types::BackupMode;

    fn record(
        start: i64,
        mode: BackupMode,
        parent: Option<&BackupRecord>,
        lsn: (u64, u64),
        tli: TimeLineId,
    ) -> BackupRecord {
        let id = BackupId::from_start_time(1_700_000_000 + start).unwrap();
        let mut record = BackupRecord::new(id, mode, parent, Lsn(lsn.0), tli, false).unwrap();
        record.stop_lsn = Lsn(lsn.1);
        record.status = BackupStatus::Ok;
        record
    }

    fn catalog() -> Vec<BackupRecord> {
        let full = record(0, BackupMode::Full, None, (0x100, 0x200), 1);
        let incr1 = record(100, BackupMode::Page, Some(&full), (0x300, 0x400), 1);
        let incr2 = record(200, BackupMode::Delta, Some(&incr1), (0x500, 0x600), 1);
        vec![full, incr1, incr2]
    }

    #[test]
    fn resolve_full_to_target() -> Result<(), Error> {
        let list = catalog();
        let chain = resolve_chain(&list, list[2].backup_id, true)?;
        let ids: Vec<_> = chain.iter().map(|b| b.backup_id).collect();
        assert_eq!(ids, vec![list[0].backup_id, list[1].backup_id, list[2].backup_id]);
        check_chain_lsn(&chain)?;
        Ok(())
    }

    #[test]
    fn broken_chains() {
        let mut list = catalog();
        list[1].status = BackupStatus::Corrupt;
        let err = resolve_chain(&list, list[2].backup_id, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::BrokenChain { .. })
        ));
        assert!(resolve_chain(&list, list[2].backup_id, false).is_ok());
        assert_eq!(
            chain_state(&list, list[2].backup_id),
            ChainState::Invalid(list[1].backup_id)
        );

        let mut list = catalog();
        list.remove(1);
        assert!(resolve_chain(&list, list[1].backup_id, false).is_err());
        assert_eq!(chain_state(&list, list[1].backup_id), ChainState::Broken);

        let mut list = catalog();
        list[0].backup_mode = BackupMode::Page;
        list[0].parent_backup_id = Some(list[2].backup_id);
        let err = resolve_chain(&list, list[2].backup_id, false).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn latest_full_falls_back_to_ancestor_timeline() -> Result<(), Error> {
        let mut list = catalog();
        let history = TimelineHistory::parse(2, "1\t0/700\tpromoted\n")?;
        assert_eq!(find_latest_valid_full(&list, &history)?.backup_id, list[0].backup_id);

        let full2 = record(300, BackupMode::Full, None, (0x800, 0x900), 2);
        list.push(full2);
        assert_eq!(find_latest_valid_full(&list, &history)?.backup_id, list[3].backup_id);

        list[3].status = BackupStatus::Error;
        list[0].status = BackupStatus::Corrupt;
        let err = find_latest_valid_full(&list, &history).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::NoValidFullBackup { timeline: 2 })
        ));
        Ok(())
    }

    #[test]
    fn parent_candidate_skips_unusable_backups() -> Result<(), Error> {
        let mut list = catalog();
        list[2].status = BackupStatus::Error;
        let chain = find_parent_chain(&list, &TimelineHistory::implicit(1))?;
        assert_eq!(chain.last().map(|b| b.backup_id), Some(list[1].backup_id));

        // a backup past the switch point is not part of timeline 2's history
        let history = TimelineHistory::parse(2, "1\t0/350\tpromoted\n")?;
        let chain = find_parent_chain(&list, &history)?;
        assert_eq!(chain.last().map(|b| b.backup_id), Some(list[0].backup_id));
        Ok(())
    }

    #[test]
    fn backup_from_the_past() {
        let list = catalog();
        let err = check_lsn_order(&list[2], Lsn(0x250), 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::BackupFromThePast { .. })
        ));
        assert!(check_lsn_order(&list[2], Lsn(0x600), 1).is_ok());
        assert!(check_lsn_order(&list[2], Lsn(0x250), 2).is_ok());
    }

    #[test]
    fn dependents() -> Result<(), Error> {
        let mut list = catalog();
        let branch = record(300, BackupMode::Ptrack, Some(&list[1]), (0x700, 0x800), 1);
        list.push(branch);

        assert_eq!(children(&list, list[1].backup_id).len(), 2);
        let ids: Vec<_> = descendants(&list, list[0].backup_id)
            .iter()
            .map(|b| b.backup_id)
            .collect();
        assert_eq!(ids, vec![list[1].backup_id, list[2].backup_id, list[3].backup_id]);

        assert_eq!(merge_segment(&list, list[2].backup_id)?.len(), 3);
        assert!(merge_segment(&list, list[0].backup_id).is_err());
        Ok(())
    }
}
