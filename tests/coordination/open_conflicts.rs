//! Share-mode conflict scenarios across cooperating processes.

use crate::common::*;
use opcoord::{
    CoordError, FileKey, MemRecordStore, OpenIdentity, OplockKind, ShareAccess,
};
use std::sync::Arc;

// ============================================================================
// Grants
// ============================================================================

#[test]
fn first_open_grants_batch_visible_to_peers() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1, 2]);
    let key = FileKey::new(7, 100);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    let grant = p1
        .open_file(&mut conn1, key, OpenIdentity::new(10, 0), &batch_request())
        .unwrap();
    assert_eq!(grant.oplock, OplockKind::Batch);

    // A second process sees the entry through its own table view.
    let p2 = start_process(Arc::clone(&store), &probe, 2);
    let lock = p2.table().lock(key);
    let record = lock.get().unwrap().unwrap();
    assert_eq!(record.entries.len(), 1);
    assert_eq!(record.entries[0].pid, 1);
    assert_eq!(record.entries[0].oplock, OplockKind::Batch);
    assert_eq!(record.entries[0].break_port, p1.port());
}

#[test]
fn concurrent_readers_share_deny_none() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1, 2]);
    let key = FileKey::new(7, 101);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut p2 = start_process(Arc::clone(&store), &probe, 2);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    let mut conn2 = AckingConn::new(OplockKind::LevelII);

    p1.open_file(&mut conn1, key, OpenIdentity::new(10, 0), &plain_request())
        .unwrap();
    p2.open_file(&mut conn2, key, OpenIdentity::new(20, 0), &plain_request())
        .unwrap();

    let lock = p1.table().lock(key);
    assert_eq!(lock.get().unwrap().unwrap().entries.len(), 2);
}

// ============================================================================
// Violations
// ============================================================================

#[test]
fn deny_write_blocks_peer_writer() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1, 2]);
    let key = FileKey::new(7, 102);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    let mut deny_write = plain_request();
    deny_write.share_access = ShareAccess::READ | ShareAccess::DELETE;
    p1.open_file(&mut conn1, key, OpenIdentity::new(10, 0), &deny_write)
        .unwrap();

    let mut p2 = start_process(Arc::clone(&store), &probe, 2);
    let mut conn2 = AckingConn::new(OplockKind::LevelII);
    let err = p2
        .open_file(&mut conn2, key, OpenIdentity::new(20, 0), &plain_request())
        .unwrap_err();
    assert!(matches!(err, CoordError::SharingViolation));

    // The rejected open left nothing behind.
    let lock = p2.table().lock(key);
    let record = lock.get().unwrap().unwrap();
    assert_eq!(record.entries.len(), 1);
    assert!(record.pending_opens.is_empty());
}

#[test]
fn delete_pending_blocks_peer_open() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1, 2]);
    let key = FileKey::new(7, 103);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    let grant = p1
        .open_file(&mut conn1, key, OpenIdentity::new(10, 0), &plain_request())
        .unwrap();
    p1.set_delete_on_close(grant.handle, true).unwrap();

    let mut p2 = start_process(Arc::clone(&store), &probe, 2);
    let mut conn2 = AckingConn::new(OplockKind::LevelII);
    let err = p2
        .open_file(&mut conn2, key, OpenIdentity::new(20, 0), &plain_request())
        .unwrap_err();
    assert!(matches!(err, CoordError::DeletePending));

    // Clearing the flag lets opens through again.
    p1.set_delete_on_close(grant.handle, false).unwrap();
    p2.open_file(&mut conn2, key, OpenIdentity::new(20, 1), &plain_request())
        .unwrap();
}

#[test]
fn delete_on_close_open_rejected_while_file_is_shared() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1, 2]);
    let key = FileKey::new(7, 104);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    p1.open_file(&mut conn1, key, OpenIdentity::new(10, 0), &plain_request())
        .unwrap();

    let mut p2 = start_process(Arc::clone(&store), &probe, 2);
    let mut conn2 = AckingConn::new(OplockKind::LevelII);
    let mut request = plain_request();
    request.delete_on_close = true;
    let err = p2
        .open_file(&mut conn2, key, OpenIdentity::new(20, 0), &request)
        .unwrap_err();
    assert!(matches!(err, CoordError::SharingViolation));
}

// ============================================================================
// Close
// ============================================================================

#[test]
fn last_close_deletes_the_record() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1, 2]);
    let key = FileKey::new(7, 105);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut p2 = start_process(Arc::clone(&store), &probe, 2);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    let mut conn2 = AckingConn::new(OplockKind::LevelII);

    let g1 = p1
        .open_file(&mut conn1, key, OpenIdentity::new(10, 0), &plain_request())
        .unwrap();
    let g2 = p2
        .open_file(&mut conn2, key, OpenIdentity::new(20, 0), &plain_request())
        .unwrap();

    p1.close_file(g1.handle).unwrap();
    {
        let lock = p2.table().lock(key);
        assert_eq!(lock.get().unwrap().unwrap().entries.len(), 1);
    }
    p2.close_file(g2.handle).unwrap();
    let lock = p2.table().lock(key);
    assert!(lock.get().unwrap().is_none());
    drop(lock);
    assert!(store.is_empty());
}
