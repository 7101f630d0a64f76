//! Oplock break scenarios between peer processes.

use crate::common::*;
use opcoord::{
    AccessMask, FileKey, MemRecordStore, OpenIdentity, OplockKind, ShareAccess, ShareModeEntry,
};
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// ============================================================================
// Wire break round trip
// ============================================================================

#[test]
fn peer_break_downgrades_batch_to_level_two() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1, 2]);
    let key = FileKey::new(7, 200);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    let g1 = p1
        .open_file(&mut conn1, key, OpenIdentity::new(10, 0), &batch_request())
        .unwrap();
    assert_eq!(g1.oplock, OplockKind::Batch);

    // P1 services its break socket on its own thread, standing in for
    // the server's idle loop.
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    let servicer = thread::spawn(move || {
        while !done_flag.load(Ordering::SeqCst) {
            p1.service_incoming(&mut conn1, Duration::from_millis(20))
                .unwrap();
        }
        (p1, conn1)
    });

    let mut p2 = start_process(Arc::clone(&store), &probe, 2);
    let mut conn2 = AckingConn::new(OplockKind::LevelII);
    let g2 = p2
        .open_file(&mut conn2, key, OpenIdentity::new(20, 0), &batch_request())
        .unwrap();
    assert_eq!(g2.oplock, OplockKind::LevelII);

    done.store(true, Ordering::SeqCst);
    let (p1, conn1) = servicer.join().unwrap();

    // P1's client really was told to release, and its handle now holds
    // the downgraded kind.
    assert_eq!(conn1.released.len(), 1);
    assert_eq!(
        p1.handles().get(g1.handle).unwrap().oplock,
        OplockKind::LevelII
    );
    assert!(!p1.runtime().tracks_oplocks());

    let lock = p2.table().lock(key);
    let record = lock.get().unwrap().unwrap();
    assert_eq!(record.entries.len(), 2);
    assert_eq!(record.exclusive_holders(), 0);
    assert!(record.pending_opens.is_empty());
}

#[test]
fn self_break_never_crosses_the_wire() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1]);
    let key = FileKey::new(7, 201);

    let mut p1 = start_process(store, &probe, 1);
    let mut conn = AckingConn::new(OplockKind::LevelII);
    let first = p1
        .open_file(&mut conn, key, OpenIdentity::new(10, 0), &batch_request())
        .unwrap();
    assert_eq!(first.oplock, OplockKind::Batch);

    // Nobody services the socket: if the break went over the wire this
    // open could only complete via the (slow) timeout path. It resolves
    // the conflict directly instead.
    let start = std::time::Instant::now();
    let second = p1
        .open_file(&mut conn, key, OpenIdentity::new(10, 1), &batch_request())
        .unwrap();
    assert_eq!(second.oplock, OplockKind::LevelII);
    assert!(start.elapsed() < fast_config().break_timeout);
    assert_eq!(conn.released, vec![first.handle]);
}

// ============================================================================
// Dead peers
// ============================================================================

#[test]
fn unanswered_break_times_out_and_open_proceeds() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[2, 999]);
    let key = FileKey::new(7, 202);

    // A peer that bound a socket and then hung: the entry is live per
    // the probe, but no reply will ever come.
    let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let mut p2 = start_process(Arc::clone(&store), &probe, 2);
    {
        let lock = p2.table().lock(key);
        lock.append_entry(ShareModeEntry {
            pid: 999,
            access_mask: AccessMask::READ_DATA | AccessMask::WRITE_DATA,
            share_access: ShareAccess::DENY_NONE,
            oplock: OplockKind::Batch,
            break_port: silent.local_addr().unwrap().port(),
            open_identity: OpenIdentity::new(5, 0),
            delete_on_close: false,
        })
        .unwrap();
    }

    let mut conn = AckingConn::new(OplockKind::LevelII);
    let grant = p2
        .open_file(&mut conn, key, OpenIdentity::new(20, 0), &batch_request())
        .unwrap();
    // Best-effort: the open proceeded, downgraded because the stale
    // entry still occupies the record.
    assert_eq!(grant.oplock, OplockKind::LevelII);
    let lock = p2.table().lock(key);
    let record = lock.get().unwrap().unwrap();
    assert_eq!(record.entries.len(), 2);
    assert!(record.entries.iter().any(|e| e.pid == 999));
}

// ============================================================================
// Mutual breaks
// ============================================================================

#[test]
fn simultaneous_cross_breaks_do_not_deadlock() {
    init_tracing();
    let store = Arc::new(MemRecordStore::new());
    let probe = LivenessMap::with(&[1, 2]);
    let f1 = FileKey::new(7, 203);
    let f2 = FileKey::new(7, 204);

    let mut p1 = start_process(Arc::clone(&store), &probe, 1);
    let mut p2 = start_process(Arc::clone(&store), &probe, 2);
    let mut conn1 = AckingConn::new(OplockKind::LevelII);
    let mut conn2 = AckingConn::new(OplockKind::LevelII);

    p1.open_file(&mut conn1, f1, OpenIdentity::new(10, 0), &batch_request())
        .unwrap();
    p2.open_file(&mut conn2, f2, OpenIdentity::new(20, 0), &batch_request())
        .unwrap();

    // Each process now opens the other's file at the same moment; both
    // block awaiting a reply, and each must service the other's break
    // request mid-wait for either to make progress.
    let barrier = Arc::new(Barrier::new(2));
    let b1 = Arc::clone(&barrier);
    let b2 = Arc::clone(&barrier);

    let t1 = thread::spawn(move || {
        b1.wait();
        let grant = p1
            .open_file(&mut conn1, f2, OpenIdentity::new(10, 1), &batch_request())
            .unwrap();
        (grant, conn1)
    });
    let t2 = thread::spawn(move || {
        b2.wait();
        let grant = p2
            .open_file(&mut conn2, f1, OpenIdentity::new(20, 1), &batch_request())
            .unwrap();
        (grant, conn2)
    });

    let (g1, conn1) = t1.join().unwrap();
    let (g2, conn2) = t2.join().unwrap();
    assert_eq!(g1.oplock, OplockKind::LevelII);
    assert_eq!(g2.oplock, OplockKind::LevelII);
    // Both sides actually executed the incoming break, neither merely
    // timed out.
    assert_eq!(conn1.released.len(), 1);
    assert_eq!(conn2.released.len(), 1);

    for key in [f1, f2] {
        let view = store_view(&store, &probe);
        let lock = view.lock(key);
        let record = lock.get().unwrap().unwrap();
        assert_eq!(record.entries.len(), 2);
        assert_eq!(record.exclusive_holders(), 0);
    }
}

/// A throwaway table view over the shared store, for assertions after
/// the owning coordinators moved into threads.
fn store_view(
    store: &Arc<MemRecordStore>,
    probe: &LivenessMap,
) -> opcoord::ShareModeTable<MemRecordStore> {
    opcoord::ShareModeTable::open(Arc::clone(store), probe, 42).unwrap()
}
