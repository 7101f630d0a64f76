//! Reclamation of share-mode state left behind by dead processes.

use crate::common::*;
use opcoord::{FileKey, MemRecordStore, OpenIdentity, OplockKind};
use std::sync::Arc;

// ============================================================================
// Startup sweep
// ============================================================================

#[test]
fn crashed_holder_is_reclaimed_at_peer_startup() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1]);
    let key = FileKey::new(7, 300);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    p1.open_file(&mut conn1, key, OpenIdentity::new(10, 0), &batch_request())
        .unwrap();

    // P1 crashes: no close, no shutdown sweep.
    drop(p1);
    probe.kill(1);
    probe.spawn(3);

    // P3's startup sweep reclaims the dead entry, so its own open runs
    // against an empty record and earns the full Batch grant.
    let mut p3 = start_process(Arc::clone(&store), &probe, 3);
    let mut conn3 = AckingConn::new(OplockKind::LevelII);
    let grant = p3
        .open_file(&mut conn3, key, OpenIdentity::new(30, 0), &batch_request())
        .unwrap();
    assert_eq!(grant.oplock, OplockKind::Batch);
    assert!(conn3.released.is_empty());

    let lock = p3.table().lock(key);
    let record = lock.get().unwrap().unwrap();
    assert_eq!(record.entries.len(), 1);
    assert_eq!(record.entries[0].pid, 3);
}

// ============================================================================
// Sweeping stale timeout leftovers
// ============================================================================

#[test]
fn stale_entry_from_timed_out_break_is_swept() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1, 2]);
    let key = FileKey::new(7, 301);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    p1.open_file(&mut conn1, key, OpenIdentity::new(10, 0), &batch_request())
        .unwrap();

    // P1 dies without cleanup; nobody answers its break port anymore,
    // but the messenger socket also closes, so P2's break request can
    // only run out its budget.
    drop(p1);

    let mut p2 = start_process(Arc::clone(&store), &probe, 2);
    let mut conn2 = AckingConn::new(OplockKind::LevelII);
    let grant = p2
        .open_file(&mut conn2, key, OpenIdentity::new(20, 0), &batch_request())
        .unwrap();
    assert_eq!(grant.oplock, OplockKind::LevelII);

    // The stale Batch entry persists until a sweep notices the pid is
    // gone.
    probe.kill(1);
    let reclaimed = p2.table().garbage_collect(&probe, false).unwrap();
    assert_eq!(reclaimed, 1);

    let lock = p2.table().lock(key);
    let record = lock.get().unwrap().unwrap();
    assert_eq!(record.entries.len(), 1);
    assert_eq!(record.entries[0].pid, 2);
}

// ============================================================================
// Shutdown sweep
// ============================================================================

#[test]
fn shutdown_sweep_reclaims_leaked_own_entries() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1]);
    let key = FileKey::new(7, 302);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    p1.open_file(&mut conn1, key, OpenIdentity::new(10, 0), &plain_request())
        .unwrap();

    // A clean exit would close the handle first; the shutdown sweep
    // reclaims what was leaked and reports it.
    assert_eq!(p1.shutdown(&probe).unwrap(), 1);
    assert!(store.is_empty());
}

#[test]
fn clean_shutdown_reclaims_nothing() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1]);
    let key = FileKey::new(7, 303);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    let grant = p1
        .open_file(&mut conn1, key, OpenIdentity::new(10, 0), &plain_request())
        .unwrap();
    p1.close_file(grant.handle).unwrap();
    assert_eq!(p1.shutdown(&probe).unwrap(), 0);
}
