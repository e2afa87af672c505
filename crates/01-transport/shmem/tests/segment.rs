//! Segment lifecycle across independent mappings: discovery through flinks,
//! teardown ordering and destroyed-state propagation.

use std::sync::{Arc, Mutex};
use std::thread;

use shmem::{
    Dependent, LockStrategy, Resource, Segment, SegmentOptions, ShmemError, TeardownError,
};

struct CloseWitness {
    segment: Segment,
    observed: Mutex<Option<bool>>,
}

impl Dependent for CloseWitness {
    fn teardown(&self) -> Result<(), TeardownError> {
        // Dependents run while the mapping is still live.
        let view = self.segment.view(0, 8)?;
        view.write_at(0, &[0xEE; 8])?;
        *self.observed.lock().expect("witness lock") = Some(self.segment.is_destroyed());
        Ok(())
    }
}

#[test]
fn peer_discovers_segment_through_flink() {
    let dir = tempfile::tempdir().expect("tempdir");
    let link = dir.path().join("demo.link");
    let owner = SegmentOptions::new()
        .size(8192)
        .dir(dir.path())
        .flink(&link)
        .create()
        .expect("create");
    owner
        .view(4000, 5)
        .expect("view")
        .write_at(0, b"hello")
        .expect("write");

    let peer = {
        let link = link.clone();
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let peer = SegmentOptions::new()
                .flink(&link)
                .dir(&dir)
                .open()
                .expect("open by link");
            let mut buf = [0u8; 5];
            peer.view(4000, 5)
                .expect("view")
                .read_at(0, &mut buf)
                .expect("read");
            peer.view(4005, 3)
                .expect("view")
                .write_at(0, b"!!!")
                .expect("write");
            peer.close().expect("close peer");
            buf
        })
    };
    assert_eq!(&peer.join().expect("peer thread"), b"hello");

    let mut reply = [0u8; 3];
    owner
        .view(4005, 3)
        .expect("view")
        .read_at(0, &mut reply)
        .expect("read reply");
    assert_eq!(&reply, b"!!!");

    owner.close().expect("close owner");
    assert!(!link.exists());
}

#[test]
fn dependents_run_before_unmap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let owner = SegmentOptions::new()
        .size(256)
        .dir(dir.path())
        .create()
        .expect("create");
    let peer = SegmentOptions::new()
        .os_id(owner.os_id())
        .dir(dir.path())
        .open()
        .expect("open");

    let witness = Arc::new(CloseWitness {
        segment: owner.clone(),
        observed: Mutex::new(None),
    });
    let witness_dyn: Arc<dyn Dependent> = witness.clone();
    owner
        .register_dependent(Arc::downgrade(&witness_dyn))
        .expect("register");

    owner.close().expect("close");
    assert_eq!(*witness.observed.lock().expect("witness lock"), Some(false));

    let mut buf = [0u8; 8];
    peer.view(0, 8)
        .expect("peer view")
        .read_at(0, &mut buf)
        .expect("peer read");
    assert_eq!(buf, [0xEE; 8]);
    peer.close().expect("close peer");
}

#[test]
fn conditions_on_closed_segment_report_destroyed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let segment = SegmentOptions::new()
        .size(1024)
        .dir(dir.path())
        .create()
        .expect("create");
    let condition = segment
        .new_condition(0, LockStrategy::Os, true)
        .expect("condition");
    segment.close().expect("close");

    assert!(matches!(
        condition.signal(),
        Err(ShmemError::Destroyed(Resource::Segment))
    ));
    assert!(matches!(
        segment.new_condition(128, LockStrategy::Spin, true),
        Err(ShmemError::Destroyed(Resource::Segment))
    ));
    assert!(matches!(
        segment.existing_condition(0, LockStrategy::Os),
        Err(ShmemError::Destroyed(Resource::Segment))
    ));
}
