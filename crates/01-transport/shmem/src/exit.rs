//! Process-exit cleanup for segments opened with `destroy_on_exit`.
//!
//! Segments register themselves once; a single `atexit` handler closes whatever is
//! still open, newest first. [`run_exit_hooks`] can also be called directly (for
//! example from a signal handler's cleanup path) and only ever runs once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::segment::SegmentShared;

static INSTALL: Once = Once::new();
static RAN: AtomicBool = AtomicBool::new(false);

fn registry() -> &'static Mutex<Vec<Weak<SegmentShared>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Weak<SegmentShared>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

pub(crate) fn register(segment: &Arc<SegmentShared>) {
    INSTALL.call_once(|| {
        // SAFETY: `on_exit` is a plain `extern "C"` function that never unwinds.
        if unsafe { libc::atexit(on_exit) } != 0 {
            warn!("failed to install segment exit hook");
        }
    });
    let mut segments = registry().lock();
    segments.retain(|weak| weak.strong_count() > 0);
    segments.push(Arc::downgrade(segment));
}

extern "C" fn on_exit() {
    let _ = std::panic::catch_unwind(run_exit_hooks);
}

/// Closes every registered segment that is still open. Runs at most once per process.
pub fn run_exit_hooks() {
    if RAN.swap(true, Ordering::AcqRel) {
        return;
    }
    let segments = std::mem::take(&mut *registry().lock());
    for segment in segments.into_iter().rev() {
        let Some(segment) = segment.upgrade() else {
            continue;
        };
        if segment.is_destroyed() {
            continue;
        }
        warn!(os_id = %segment.os_id(), "closing segment left open at exit");
        if let Err(err) = segment.close() {
            warn!(os_id = %segment.os_id(), %err, "failed to close segment at exit");
        }
    }
}

/// True once [`run_exit_hooks`] has run.
pub fn hooks_ran() -> bool {
    RAN.load(Ordering::Acquire)
}
