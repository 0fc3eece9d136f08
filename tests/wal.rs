use anyhow::Error;

use pbk_api_types::{BackupMode, BackupStatus, Lsn};
use pbk_datastore::{catalog_error, BackupRecord, Catalog, CatalogError, PushOutcome, WalSegment};
use probackup::backup::{
    archive_push, create_backup, delete_backup, purge_wal, restore_backup, verify_backup,
    BackupOptions, DirectoryTarget, RestoreOptions, VerifyOptions, VerifyOutcome,
};

mod common;
use common::{read_file, take_backup, MemorySource, TestCatalog, SEGMENT_SIZE};

const FILES: &[(&str, &[u8])] = &[
    ("global/pg_control", b"control"),
    ("base/1/1259", b"pg_class"),
];

fn segment_name(lsn: u64) -> String {
    WalSegment::for_lsn(1, Lsn(lsn), SEGMENT_SIZE).file_name(SEGMENT_SIZE)
}

fn push_segments(catalog: &Catalog, lsns: &[u64]) -> Result<(), Error> {
    for lsn in lsns {
        let data = vec![0u8; SEGMENT_SIZE as usize];
        archive_push(catalog, &segment_name(*lsn), &mut &data[..])?;
    }
    Ok(())
}

/// Full backup relying on archived WAL.
fn archive_backup(
    env: &TestCatalog,
    catalog: &Catalog,
    start: u64,
    stop: u64,
) -> Result<BackupRecord, Error> {
    env.clock.advance(60);
    create_backup(
        catalog,
        &mut MemorySource::new(start, stop, FILES),
        &BackupOptions::new(BackupMode::Full),
    )
}

#[test]
fn push_is_idempotent() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let catalog = env.process(1)?;

    let name = segment_name(0x2000028);
    assert_eq!(name, "000000010000000000000020");

    let data = vec![7u8; SEGMENT_SIZE as usize];
    assert_eq!(archive_push(&catalog, &name, &mut &data[..])?, PushOutcome::Stored);
    assert_eq!(
        archive_push(&catalog, &name, &mut &data[..])?,
        PushOutcome::AlreadyArchived
    );

    let other = vec![8u8; SEGMENT_SIZE as usize];
    assert!(archive_push(&catalog, &name, &mut &other[..]).is_err());
    assert_eq!(std::fs::read(catalog.wal_path().join(&name))?, data);

    let short = vec![0u8; 1024];
    assert!(archive_push(&catalog, &segment_name(0x2100000), &mut &short[..]).is_err());
    assert!(archive_push(&catalog, "postgresql.conf", &mut &data[..]).is_err());
    assert!(archive_push(&catalog, "../000000010000000000000021", &mut &data[..]).is_err());

    let history = b"1\t0/5000000\tno recovery target specified\n";
    assert_eq!(
        archive_push(&catalog, "00000002.history", &mut &history[..])?,
        PushOutcome::Stored
    );
    Ok(())
}

#[test]
fn validation_needs_archived_wal() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let catalog = env.process(1)?;

    push_segments(&catalog, &[0x2000028, 0x2100000])?;
    let complete = archive_backup(&env, &catalog, 0x2000028, 0x2100100)?;
    let outcome = verify_backup(&catalog, complete.backup_id, &VerifyOptions::default())?;
    assert_eq!(outcome, VerifyOutcome::Ok);

    // segment 0x22 gets lost after the backup
    push_segments(&catalog, &[0x2200000])?;
    let incomplete = archive_backup(&env, &catalog, 0x2100200, 0x2200100)?;
    std::fs::remove_file(catalog.wal_path().join(segment_name(0x2200000)))?;
    let unchecked = VerifyOptions { check_wal: false };
    assert_eq!(
        verify_backup(&catalog, incomplete.backup_id, &unchecked)?,
        VerifyOutcome::Ok
    );

    let err = verify_backup(&catalog, incomplete.backup_id, &VerifyOptions::default()).unwrap_err();
    assert!(err.to_string().contains("000000010000000000000022"), "{err}");
    assert_eq!(
        catalog.read(incomplete.backup_id)?.status,
        BackupStatus::Corrupt
    );
    assert_eq!(catalog.read(complete.backup_id)?.status, BackupStatus::Ok);
    Ok(())
}

#[test]
fn backup_without_archived_wal_fails() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let catalog = env.process(1)?;

    let err = archive_backup(&env, &catalog, 0x2000028, 0x2000100).unwrap_err();
    assert!(
        matches!(catalog_error(&err), Some(CatalogError::WalMissing { segment, .. })
            if *segment == segment_name(0x2000028)),
        "{err}"
    );
    assert_eq!(probackup::exit_code(&Err(err)), 11);

    let list = catalog.list()?;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].status, BackupStatus::Error);
    assert!(catalog.locks().list_locks(list[0].backup_id)?.is_empty());

    let err = catalog
        .wal_archive()
        .check_range(list[0].backup_id, 1, list[0].start_lsn, list[0].stop_lsn)
        .unwrap_err();
    assert!(matches!(catalog_error(&err), Some(CatalogError::WalMissing { .. })));
    Ok(())
}

#[test]
fn backup_waits_for_wal_archiving() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let mut config = TestCatalog::config();
    config.archive_timeout = 30;
    let catalog = env.process_with_config(1, config)?;
    let archiver = env.process(2)?;

    let backup = std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(std::time::Duration::from_millis(300));
            push_segments(&archiver, &[0x2000028]).expect("archiving failed");
        });
        archive_backup(&env, &catalog, 0x2000028, 0x2000100)
    })?;
    assert_eq!(backup.status, BackupStatus::Ok);
    Ok(())
}

#[test]
fn restore_needs_archived_wal() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let catalog = env.process(1)?;

    push_segments(&catalog, &[0x2000028])?;
    let backup = archive_backup(&env, &catalog, 0x2000028, 0x2000100)?;
    assert_eq!(backup.status, BackupStatus::Ok);
    std::fs::remove_file(catalog.wal_path().join(segment_name(0x2000028)))?;

    let restore_dir = env.path().join("restore");
    let mut target = DirectoryTarget::new(&restore_dir)?;
    let err = restore_backup(&catalog, backup.backup_id, &mut target, &RestoreOptions::default())
        .unwrap_err();
    assert!(matches!(catalog_error(&err), Some(CatalogError::WalMissing { .. })), "{err}");
    assert_eq!(probackup::exit_code(&Err(err)), 11);
    assert_eq!(catalog.read(backup.backup_id)?.status, BackupStatus::Corrupt);
    assert!(!restore_dir.join("base/1/1259").exists());

    // the operator may still take the data files
    let unchecked = RestoreOptions { no_validate: true };
    let chain = restore_backup(&catalog, backup.backup_id, &mut target, &unchecked)?;
    assert_eq!(chain.len(), 1);
    assert_eq!(read_file(&restore_dir.join("base/1/1259")), b"pg_class".to_vec());
    Ok(())
}

#[test]
fn purge_keeps_wal_of_oldest_backup() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let catalog = env.process(1)?;

    push_segments(&catalog, &[0x1e00000, 0x1f00000, 0x2000000, 0x2100000])?;

    // nothing to keep WAL for yet
    assert!(purge_wal(&catalog, false)?.is_empty());
    assert_eq!(catalog.wal_archive().list_segments()?.len(), 4);

    let backup = archive_backup(&env, &catalog, 0x2000028, 0x2000100)?;

    let removable = purge_wal(&catalog, true)?;
    assert_eq!(
        removable,
        vec![segment_name(0x1e00000), segment_name(0x1f00000)]
    );
    assert_eq!(catalog.wal_archive().list_segments()?.len(), 4);

    assert_eq!(purge_wal(&catalog, false)?, removable);
    let left: Vec<String> = catalog
        .wal_archive()
        .list_segments()?
        .iter()
        .map(|segment| segment.file_name(SEGMENT_SIZE))
        .collect();
    assert_eq!(left, vec![segment_name(0x2000000), segment_name(0x2100000)]);

    verify_backup(&catalog, backup.backup_id, &VerifyOptions::default())?;

    delete_backup(&catalog, backup.backup_id, false)?;
    assert!(purge_wal(&catalog, false)?.is_empty());
    assert_eq!(catalog.wal_archive().list_segments()?.len(), 2);
    Ok(())
}

#[test]
fn incremental_after_timeline_switch_uses_ancestor_backup() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let catalog = env.process(1)?;

    let before_switch = take_backup(
        &catalog,
        &env.clock,
        BackupMode::Full,
        &mut MemorySource::new(0x2000028, 0x2000100, FILES),
    )?;
    // taken on timeline 1 after timeline 2 branched off
    let after_switch = take_backup(
        &catalog,
        &env.clock,
        BackupMode::Full,
        &mut MemorySource::new(0x6000028, 0x6000100, FILES),
    )?;
    assert_eq!(after_switch.current_tli, 1);

    let history = b"1\t0/5000000\tno recovery target specified\n";
    archive_push(&catalog, "00000002.history", &mut &history[..])?;

    let mut source = MemorySource::new(0x7000028, 0x7000100, FILES);
    source.timeline = 2;
    let incr = take_backup(&catalog, &env.clock, BackupMode::Delta, &mut source)?;
    assert_eq!(incr.current_tli, 2);
    assert_eq!(incr.parent_tli, 1);
    assert_eq!(incr.parent_backup_id, Some(before_switch.backup_id));
    Ok(())
}
