//! Condition ping-pong between an owning and an attaching segment handle.
//! Each side maps the backing file separately, the way two processes would.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use shmem::{Condition, LockStrategy, Segment, SegmentOptions, ShmemError, WaitPolicy};

const PING: usize = 0;
const PONG: usize = 128;

fn pair(dir: &tempfile::TempDir) -> (Segment, Segment) {
    let owner = SegmentOptions::new()
        .size(4096)
        .dir(dir.path())
        .create()
        .expect("create segment");
    let peer = SegmentOptions::new()
        .os_id(owner.os_id())
        .dir(dir.path())
        .open()
        .expect("open segment");
    (owner, peer)
}

fn ping_pong(strategy: LockStrategy) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (owner, peer) = pair(&dir);
    let ping = owner
        .new_condition(PING, strategy, true)
        .expect("ping condition");
    let pong = owner
        .new_condition(PONG, strategy, true)
        .expect("pong condition");
    let counter = owner.view(1024, 8).expect("counter view");

    let (ready_tx, ready_rx) = bounded(1);
    let responder = thread::spawn(move || {
        let ping = peer
            .existing_condition(PING, strategy)
            .expect("attach ping");
        let pong = peer
            .existing_condition(PONG, strategy)
            .expect("attach pong");
        let counter = peer.view(1024, 8).expect("counter view");
        ready_tx.send(()).expect("ready");
        for round in 0..50u64 {
            assert!(ping.wait(Duration::from_secs(5)).expect("wait ping"));
            let mut buf = [0u8; 8];
            counter.read_at(0, &mut buf).expect("read counter");
            assert_eq!(u64::from_ne_bytes(buf), round * 2);
            counter
                .write_at(0, &(round * 2 + 1).to_ne_bytes())
                .expect("write counter");
            pong.signal().expect("signal pong");
        }
        peer.close().expect("close peer");
    });

    ready_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("responder ready");
    for round in 0..50u64 {
        counter
            .write_at(0, &(round * 2).to_ne_bytes())
            .expect("write counter");
        ping.signal().expect("signal ping");
        assert!(pong.wait(Duration::from_secs(5)).expect("wait pong"));
        let mut buf = [0u8; 8];
        counter.read_at(0, &mut buf).expect("read counter");
        assert_eq!(u64::from_ne_bytes(buf), round * 2 + 1);
    }
    responder.join().expect("responder");
    owner.close().expect("close owner");
}

/// Smoke test: strict alternation through spin-backed conditions.
#[test]
fn spin_ping_pong() {
    ping_pong(LockStrategy::Spin);
}

/// Smoke test: strict alternation through pthread-backed conditions.
#[test]
fn os_ping_pong() {
    ping_pong(LockStrategy::Os);
}

#[test]
fn timeout_is_honoured_for_both_strategies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (owner, _peer) = pair(&dir);
    for (offset, strategy) in [(0, LockStrategy::Spin), (256, LockStrategy::Os)] {
        let condition = owner
            .new_condition(offset, strategy, true)
            .expect("condition");
        let started = Instant::now();
        assert!(!condition.wait(Duration::from_millis(150)).expect("wait"));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(140), "{strategy:?}: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{strategy:?}: {elapsed:?}");
    }
}

/// Closing the segment unblocks a blocked waiter with `Destroyed`.
#[test]
fn segment_close_unblocks_waiter() {
    let policy = WaitPolicy {
        os_slice: Duration::from_millis(50),
        ..WaitPolicy::default()
    };
    for strategy in [LockStrategy::Spin, LockStrategy::Os] {
        let dir = tempfile::tempdir().expect("tempdir");
        let (owner, peer) = pair(&dir);
        Condition::create(&owner, 0, strategy, true, policy.clone()).expect("condition");
        let condition = Condition::attach(&peer, 0, strategy, policy.clone()).expect("attach");

        let (started_tx, started_rx) = bounded(1);
        let waiter = thread::spawn(move || {
            started_tx.send(()).expect("started");
            condition.wait(Duration::from_secs(10))
        });
        started_rx.recv().expect("waiter started");
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        peer.close().expect("close peer");
        let outcome = waiter.join().expect("waiter");
        assert!(
            matches!(outcome, Err(ShmemError::Destroyed(_))),
            "{strategy:?}: {outcome:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(2));
        owner.close().expect("close owner");
    }
}
