use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;

use pbk_api_types::{BackupId, LockMode};
use pbk_datastore::lock::{ClaimState, LockContent, LockFile};
use pbk_datastore::{catalog_error, CatalogError, CatalogStorage, Clock, LockOutcome};

mod common;
use common::{HookedStorage, TestCatalog, LOCK_TTL};

fn backup_id() -> BackupId {
    BackupId::from_start_time(1_700_000_000).unwrap()
}

#[test]
fn exclusive_lock_is_mutually_exclusive() -> Result<(), Error> {
    let env = Arc::new(TestCatalog::new()?);
    let holders = Arc::new(AtomicUsize::new(0));
    let acquired = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for pid in 10..18 {
        let env = Arc::clone(&env);
        let holders = Arc::clone(&holders);
        let acquired = Arc::clone(&acquired);
        handles.push(std::thread::spawn(move || -> Result<(), Error> {
            let catalog = env.process(pid)?;
            for _ in 0..200 {
                let outcome = catalog.locks().try_lock(
                    backup_id(),
                    LockMode::Exclusive,
                    Some(Duration::from_secs(20)),
                )?;
                if let LockOutcome::Acquired(guard) = outcome {
                    assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                    std::thread::sleep(Duration::from_millis(5));
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                    acquired.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
            }
            panic!("process {pid} never got the lock");
        }));
    }
    for handle in handles {
        handle.join().expect("locking thread panicked")?;
    }

    assert_eq!(acquired.load(Ordering::SeqCst), 8);
    assert!(env.process(1)?.locks().list_locks(backup_id())?.is_empty());
    Ok(())
}

#[test]
fn shared_locks_coexist() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let (p1, p2, p3) = (env.process(1)?, env.process(2)?, env.process(3)?);

    let shared1 = p1.locks().acquire(backup_id(), LockMode::Shared, None)?;
    let shared2 = p2.locks().acquire(backup_id(), LockMode::Shared, None)?;
    assert!(p3
        .locks()
        .try_lock(backup_id(), LockMode::Exclusive, None)?
        .is_conflict());

    drop(shared1);
    drop(shared2);
    let exclusive = p3.locks().acquire(backup_id(), LockMode::Exclusive, None)?;

    let err = p1
        .locks()
        .acquire(backup_id(), LockMode::Shared, None)
        .unwrap_err();
    assert!(matches!(
        catalog_error(&err),
        Some(CatalogError::LockConflict { .. })
    ));

    p3.locks().release(exclusive)?;
    assert!(p1.locks().list_locks(backup_id())?.is_empty());
    Ok(())
}

#[test]
fn stale_lock_is_reclaimed_once() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let (p1, p2) = (env.process(1)?, env.process(2)?);

    // process 2 dies while holding the lock
    let guard = p2.locks().acquire(backup_id(), LockMode::Exclusive, None)?;
    std::mem::forget(guard);

    assert!(p1
        .locks()
        .try_lock(backup_id(), LockMode::Shared, None)?
        .is_conflict());

    env.expire_locks();
    let guard = p1.locks().acquire(backup_id(), LockMode::Shared, None)?;
    let locks = p1.locks().list_locks(backup_id())?;
    assert_eq!(locks.len(), 1);
    assert_eq!(&locks[0].file, guard.lock_file());
    Ok(())
}

#[test]
fn renewed_lock_stays_live() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let (p1, p2) = (env.process(1)?, env.process(2)?);

    let guard = p2.locks().acquire(backup_id(), LockMode::Exclusive, None)?;
    env.clock.advance(40);
    p2.locks().renew(&guard)?;
    env.clock.advance(40);

    assert!(p1
        .locks()
        .try_lock(backup_id(), LockMode::Exclusive, None)?
        .is_conflict());
    assert_eq!(p1.locks().live_locks(backup_id())?.len(), 1);
    Ok(())
}

#[test]
fn waiting_for_a_held_lock_times_out() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let (p1, p2) = (env.process(1)?, env.process(2)?);

    let _guard = p2.locks().acquire(backup_id(), LockMode::Exclusive, None)?;
    let outcome = p1.locks().try_lock(
        backup_id(),
        LockMode::Shared,
        Some(Duration::from_millis(50)),
    )?;
    assert!(matches!(outcome, LockOutcome::TimedOut(_)));
    Ok(())
}

#[test]
fn lost_lock_is_detected_on_renewal() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let (p1, p2) = (env.process(1)?, env.process(2)?);

    let guard = p1.locks().acquire(backup_id(), LockMode::Exclusive, None)?;
    env.expire_locks();
    assert_eq!(p2.locks().expire_stale(backup_id())?, 1);

    let err = p1.locks().renew(&guard).unwrap_err();
    assert!(matches!(catalog_error(&err), Some(CatalogError::LockLost { .. })));
    Ok(())
}

#[test]
fn foreign_files_in_lock_dir_are_ignored() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let p1 = env.process(1)?;

    let lock_dir = p1.locks().lock_dir().to_path_buf();
    std::fs::write(lock_dir.join(format!("{}_garbage", backup_id())), b"xx")?;
    std::fs::write(lock_dir.join(".tmp_AbCdEf"), b"{")?;

    let guard = p1.locks().acquire(backup_id(), LockMode::Exclusive, None)?;
    assert_eq!(p1.locks().list_locks(backup_id())?.len(), 1);
    drop(guard);
    Ok(())
}

/// An in flight claim of holder `9999-<seq>@rival`, stamped with the catalog clock.
fn rival_claim(
    env: &TestCatalog,
    seq: u32,
    mode: LockMode,
) -> Result<(LockFile, Vec<u8>), Error> {
    let file = LockFile {
        backup_id: backup_id(),
        holder: format!("9999-{seq}@rival"),
        mode,
    };
    let content = LockContent {
        backup_id: backup_id(),
        mode,
        state: ClaimState::InFlight,
        pid: 9999,
        hostname: "rival".to_string(),
        timestamp: env.clock.now(),
    };
    Ok((file, serde_json::to_vec(&content)?))
}

#[test]
fn exclusive_lock_stays_exclusive_with_clock_ahead_of_file_times() -> Result<(), Error> {
    let env = Arc::new(TestCatalog::starting_now()?);
    // every file time now lies more than a TTL in the past
    env.clock.advance(LOCK_TTL + 1);

    for round in 0..20u32 {
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for idx in 0..6u32 {
            let env = Arc::clone(&env);
            let holders = Arc::clone(&holders);
            let max_holders = Arc::clone(&max_holders);
            handles.push(std::thread::spawn(move || -> Result<(), Error> {
                let catalog = env.process(100 + round * 10 + idx)?;
                let outcome = catalog
                    .locks()
                    .try_lock(backup_id(), LockMode::Exclusive, None)?;
                if let LockOutcome::Acquired(guard) = outcome {
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().expect("locking thread panicked")?;
        }
        assert!(
            max_holders.load(Ordering::SeqCst) <= 1,
            "round {round}: exclusive lock held twice"
        );
    }
    assert!(env.process(1)?.locks().list_locks(backup_id())?.is_empty());
    Ok(())
}

#[test]
fn claim_in_flight_ages_by_catalog_clock() -> Result<(), Error> {
    let env = TestCatalog::starting_now()?;
    env.clock.advance(LOCK_TTL + 1);
    let p1 = env.process(1)?;

    let (rival, data) = rival_claim(&env, 0, LockMode::Exclusive)?;
    let path = p1.locks().lock_dir().join(rival.file_name());
    std::fs::write(&path, data)?;

    // the file time is old, the claim itself is fresh
    let outcome = p1.locks().try_lock(backup_id(), LockMode::Shared, None)?;
    match outcome {
        LockOutcome::Conflict(info) => {
            assert_eq!(info.file, rival);
            assert!(info.in_flight());
        }
        _ => panic!("claim in flight was ignored"),
    }
    assert!(path.exists());

    // the claimer never finished
    env.clock.advance(LOCK_TTL + 1);
    let guard = p1.locks().acquire(backup_id(), LockMode::Shared, None)?;
    assert!(!path.exists());
    assert_eq!(p1.locks().list_locks(backup_id())?.len(), 1);
    drop(guard);
    Ok(())
}

#[test]
fn lock_races_give_up_after_configured_retries() -> Result<(), Error> {
    let env = Arc::new(TestCatalog::starting_now()?);
    let attempts = Arc::new(AtomicUsize::new(0));

    // every claim we create is followed by a conflicting claim of a rival, which goes away
    // together with ours
    let storage = {
        let env = Arc::clone(&env);
        let attempts = Arc::clone(&attempts);
        let (rival, _) = rival_claim(&env, 0, LockMode::Exclusive)?;
        let rival_name = rival.file_name();
        let rival_name2 = rival_name.clone();
        HookedStorage::new()
            .after_create_new(move |storage, path| {
                if path.file_name().and_then(|name| name.to_str()) == Some(rival_name.as_str()) {
                    return;
                }
                attempts.fetch_add(1, Ordering::SeqCst);
                let (_, data) = rival_claim(&env, 0, LockMode::Exclusive).unwrap();
                storage
                    .create_new(&path.with_file_name(&rival_name), &data)
                    .unwrap();
            })
            .after_remove(move |storage, path| {
                if path.file_name().and_then(|name| name.to_str()) != Some(rival_name2.as_str()) {
                    storage.remove(&path.with_file_name(&rival_name2)).unwrap();
                }
            })
    };
    let mut config = TestCatalog::config();
    config.lock_race_retries = 3;
    let p1 = env.process_on(1, config, Arc::new(storage))?;

    let outcome = p1
        .locks()
        .try_lock(backup_id(), LockMode::Exclusive, None)?;
    match outcome {
        LockOutcome::Conflict(info) => assert_eq!(info.file.holder, "9999-0@rival"),
        _ => panic!("lock granted despite a racing claim"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(p1.locks().list_locks(backup_id())?.is_empty());
    Ok(())
}

#[test]
fn claim_removed_before_it_is_final_is_retried() -> Result<(), Error> {
    let env = TestCatalog::starting_now()?;
    let attempts = Arc::new(AtomicUsize::new(0));

    // someone takes our first claim for stale and removes it
    let storage = {
        let attempts = Arc::clone(&attempts);
        HookedStorage::new().after_create_new(move |storage, path| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                storage.remove(path).unwrap();
            }
        })
    };
    let p1 = env.process_on(1, TestCatalog::config(), Arc::new(storage))?;

    let guard = p1
        .locks()
        .acquire(backup_id(), LockMode::Exclusive, None)?;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let locks = p1.locks().list_locks(backup_id())?;
    assert_eq!(locks.len(), 1);
    assert_eq!(&locks[0].file, guard.lock_file());
    assert!(!locks[0].in_flight());
    Ok(())
}

#[test]
fn expired_shared_locks_are_cleaned_up_by_shared_lockers() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let (p1, p2) = (env.process(1)?, env.process(2)?);

    for _ in 0..3 {
        std::mem::forget(p2.locks().acquire(backup_id(), LockMode::Shared, None)?);
    }
    assert_eq!(p1.locks().list_locks(backup_id())?.len(), 3);

    env.expire_locks();
    let guard = p1.locks().acquire(backup_id(), LockMode::Shared, None)?;
    let locks = p1.locks().list_locks(backup_id())?;
    assert_eq!(locks.len(), 1);
    assert_eq!(&locks[0].file, guard.lock_file());
    Ok(())
}

#[test]
fn same_pid_on_two_hosts_gets_distinct_locks() -> Result<(), Error> {
    let env = TestCatalog::new()?;
    let node1 = pbk_datastore::ProcessIdentity::new(4711, "node1");
    let node2 = pbk_datastore::ProcessIdentity::new(4711, "node2");
    assert_ne!(node1.next_holder(), node2.next_holder());

    let p1 = env.process(4711)?;
    let guard = p1.locks().acquire(backup_id(), LockMode::Shared, None)?;
    assert_eq!(guard.lock_file().holder, "4711-0@testhost");
    Ok(())
}
