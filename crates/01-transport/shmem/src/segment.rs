//! Shared-memory segments and bounds-checked views into them.
//!
//! A [`Segment`] owns one mapping. Every native access (typed views, byte copies,
//! borrowed slices) pins the mapping through a shared lock, while [`Segment::close`]
//! marks the segment destroyed, tears down registered [`Dependent`]s in reverse order
//! and only then takes the exclusive lock to unmap. Nothing can observe unmapped memory.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::exit;
use crate::mapping::{self, Mapping};
use crate::{Resource, ShmemError, ShmemResult};

/// Types that can be viewed in place inside a segment.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, valid for every bit pattern a peer process may
/// leave behind (including all zeroes), and mutate only through interior mutability
/// that is sound across processes (atomics, process-shared pthread objects).
pub unsafe trait SharedLayout: Sync {}

/// Error type returned by [`Dependent::teardown`].
pub type TeardownError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Resource living inside a segment that must be torn down before it is unmapped.
pub trait Dependent: Send + Sync {
    fn teardown(&self) -> Result<(), TeardownError>;
}

/// Handle returned by [`Segment::register_dependent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DependentId(u64);

/// Builder for creating or opening a [`Segment`].
#[derive(Clone, Debug, Default)]
pub struct SegmentOptions {
    size: Option<usize>,
    os_id: Option<String>,
    flink: Option<PathBuf>,
    dir: Option<PathBuf>,
    destroy_on_exit: bool,
}

impl SegmentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn os_id(mut self, os_id: impl Into<String>) -> Self {
        self.os_id = Some(os_id.into());
        self
    }

    /// Path of the link file that publishes the segment id to peers.
    pub fn flink(mut self, flink: impl Into<PathBuf>) -> Self {
        self.flink = Some(flink.into());
        self
    }

    /// Directory holding the backing files; defaults to [`crate::default_dir`].
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Close the segment from a process exit hook if it is still open.
    pub fn destroy_on_exit(mut self, destroy_on_exit: bool) -> Self {
        self.destroy_on_exit = destroy_on_exit;
        self
    }

    /// Creates a new segment owned by this process.
    pub fn create(&self) -> ShmemResult<Segment> {
        let size = self
            .size
            .ok_or_else(|| ShmemError::invalid("segment size is required"))?;
        if size == 0 {
            return Err(ShmemError::invalid("segment size must be positive"));
        }
        if let Some(flink) = &self.flink {
            if flink.exists() {
                return Err(ShmemError::LinkExists(flink.clone()));
            }
        }

        let dir = self.resolved_dir();
        let os_id = self.os_id.clone().unwrap_or_else(mapping::generate_os_id);
        let mut mapping = Mapping::create(&dir, &os_id, size)?;
        if let Some(flink) = &self.flink {
            mapping::write_flink(flink, &os_id)?;
            mapping.set_flink(flink.clone());
        }

        debug!(%os_id, size, dir = %dir.display(), "created segment");
        Ok(self.finish(mapping, os_id, dir, true))
    }

    /// Opens a segment created by another party, by id or by flink.
    pub fn open(&self) -> ShmemResult<Segment> {
        let os_id = match (&self.os_id, &self.flink) {
            (Some(os_id), _) => os_id.clone(),
            (None, Some(flink)) => mapping::read_flink(flink)?,
            (None, None) => {
                return Err(ShmemError::invalid(
                    "an os id or flink is required to open a segment",
                ))
            }
        };
        let dir = self.resolved_dir();
        let mapping = Mapping::open(&dir, &os_id)?;
        debug!(%os_id, size = mapping.len(), "opened segment");
        Ok(self.finish(mapping, os_id, dir, false))
    }

    fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(mapping::default_dir)
    }

    fn finish(&self, mapping: Mapping, os_id: String, dir: PathBuf, owner: bool) -> Segment {
        let shared = Arc::new(SegmentShared {
            size: mapping.len(),
            mapping: RwLock::new(Some(mapping)),
            owner,
            os_id,
            flink: self.flink.clone(),
            dir,
            closing: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            dependents: Mutex::new(Vec::new()),
            next_dependent: AtomicU64::new(1),
        });
        if self.destroy_on_exit {
            exit::register(&shared);
        }
        Segment { shared }
    }
}

/// A mapped shared-memory region.
///
/// Cloning yields another handle to the same mapping; [`Segment::close`] on any handle
/// destroys it for all of them.
#[derive(Clone)]
pub struct Segment {
    shared: Arc<SegmentShared>,
}

pub(crate) struct SegmentShared {
    mapping: RwLock<Option<Mapping>>,
    size: usize,
    owner: bool,
    os_id: String,
    flink: Option<PathBuf>,
    dir: PathBuf,
    closing: AtomicBool,
    destroyed: AtomicBool,
    dependents: Mutex<Vec<(DependentId, Weak<dyn Dependent>)>>,
    next_dependent: AtomicU64,
}

impl Segment {
    /// Creates an owned segment of `size` bytes in the default directory.
    pub fn create(size: usize) -> ShmemResult<Self> {
        SegmentOptions::new().size(size).create()
    }

    pub fn open_os_id(os_id: &str) -> ShmemResult<Self> {
        SegmentOptions::new().os_id(os_id).open()
    }

    pub fn open_flink(flink: impl AsRef<Path>) -> ShmemResult<Self> {
        SegmentOptions::new().flink(flink.as_ref()).open()
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// True for the process that created the segment.
    pub fn is_owner(&self) -> bool {
        self.shared.owner
    }

    pub fn os_id(&self) -> &str {
        &self.shared.os_id
    }

    pub fn flink(&self) -> Option<&Path> {
        self.shared.flink.as_deref()
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Checks that `[offset, offset + len)` is a non-empty range inside the segment.
    pub fn validate_range(&self, offset: usize, len: usize) -> ShmemResult<()> {
        if len == 0 {
            return Err(ShmemError::invalid("view length must be positive"));
        }
        let size = self.shared.size;
        let fits = offset < size && offset.checked_add(len).is_some_and(|end| end <= size);
        if !fits {
            return Err(ShmemError::OutOfBounds { offset, len, size });
        }
        Ok(())
    }

    /// Returns a view over `len` bytes starting at `offset`.
    pub fn view(&self, offset: usize, len: usize) -> ShmemResult<ByteView> {
        self.ensure_live()?;
        self.validate_range(offset, len)?;
        Ok(ByteView {
            segment: self.clone(),
            offset,
            len,
        })
    }

    /// Registers a resource to be torn down when the segment closes.
    pub fn register_dependent(&self, dependent: Weak<dyn Dependent>) -> ShmemResult<DependentId> {
        let mut dependents = self.shared.dependents.lock();
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(ShmemError::Destroyed(Resource::Segment));
        }
        let id = DependentId(self.shared.next_dependent.fetch_add(1, Ordering::Relaxed));
        dependents.retain(|(_, weak)| weak.strong_count() > 0);
        dependents.push((id, dependent));
        Ok(id)
    }

    pub fn unregister_dependent(&self, id: DependentId) {
        self.shared
            .dependents
            .lock()
            .retain(|(existing, _)| *existing != id);
    }

    /// Tears down dependents, then unmaps. Idempotent.
    ///
    /// Blocks until every outstanding view guard has been dropped, so it must not be
    /// called from a thread that still holds one.
    pub fn close(&self) -> ShmemResult<()> {
        self.shared.close()
    }

    pub(crate) fn ensure_live(&self) -> ShmemResult<()> {
        if self.is_destroyed() {
            return Err(ShmemError::Destroyed(Resource::Segment));
        }
        Ok(())
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("os_id", &self.shared.os_id)
            .field("size", &self.shared.size)
            .field("owner", &self.shared.owner)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl SegmentShared {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn os_id(&self) -> &str {
        &self.os_id
    }

    pub(crate) fn close(&self) -> ShmemResult<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let dependents = mem::take(&mut *self.dependents.lock());
        for (id, dependent) in dependents.into_iter().rev() {
            let Some(dependent) = dependent.upgrade() else {
                continue;
            };
            if let Err(err) = dependent.teardown() {
                warn!(os_id = %self.os_id, dependent = id.0, %err, "dependent teardown failed");
            }
        }

        self.destroyed.store(true, Ordering::Release);
        let mapping = self.mapping.write().take();
        drop(mapping);
        debug!(os_id = %self.os_id, owner = self.owner, "closed segment");
        Ok(())
    }
}

impl Drop for SegmentShared {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            debug!(os_id = %self.os_id, "segment released without close");
        }
    }
}

/// Bounds-checked window into a segment.
#[derive(Clone, Debug)]
pub struct ByteView {
    segment: Segment,
    offset: usize,
    len: usize,
}

impl ByteView {
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Offset of the view inside its segment.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `dst.len()` bytes starting at `at` (relative to the view) into `dst`.
    pub fn read_at(&self, at: usize, dst: &mut [u8]) -> ShmemResult<()> {
        self.check_range(at, dst.len())?;
        let (_guard, base) = self.pin()?;
        // SAFETY: the range was checked against the view, and the guard keeps the mapping alive.
        unsafe { ptr::copy_nonoverlapping(base.add(at), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Copies `src` into the view starting at `at`.
    pub fn write_at(&self, at: usize, src: &[u8]) -> ShmemResult<()> {
        self.check_range(at, src.len())?;
        let (_guard, base) = self.pin()?;
        // SAFETY: the range was checked against the view, and the guard keeps the mapping alive.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), base.add(at), src.len()) };
        Ok(())
    }

    /// Runs `f` against the view's leading bytes interpreted as `T`.
    pub fn with<T: SharedLayout, R>(&self, f: impl FnOnce(&T) -> R) -> ShmemResult<R> {
        if mem::size_of::<T>() > self.len {
            return Err(ShmemError::invalid(format!(
                "{} bytes do not fit in a {} byte view",
                mem::size_of::<T>(),
                self.len
            )));
        }
        let (_guard, base) = self.pin()?;
        if base as usize % mem::align_of::<T>() != 0 {
            return Err(ShmemError::invalid(format!(
                "offset {} is not {}-byte aligned",
                self.offset,
                mem::align_of::<T>()
            )));
        }
        // SAFETY: `T: SharedLayout` is valid for any bytes and only mutates through interior
        // mutability; the range is in bounds and aligned, and the guard outlives the borrow.
        Ok(f(unsafe { &*(base as *const T) }))
    }

    /// Borrows the view as a byte slice.
    ///
    /// # Safety
    /// No other party, in this or another process, may write the viewed bytes while the
    /// guard is alive.
    pub unsafe fn lock(&self) -> ShmemResult<ViewGuard<'_>> {
        let (guard, base) = self.pin()?;
        Ok(ViewGuard {
            _guard: guard,
            ptr: base,
            len: self.len,
        })
    }

    /// Borrows the view as a mutable byte slice.
    ///
    /// # Safety
    /// The caller must have exclusive access to the viewed bytes, across processes, for
    /// as long as the guard is alive.
    pub unsafe fn lock_mut(&self) -> ShmemResult<ViewGuardMut<'_>> {
        let (guard, base) = self.pin()?;
        Ok(ViewGuardMut {
            _guard: guard,
            ptr: base,
            len: self.len,
        })
    }

    fn check_range(&self, at: usize, len: usize) -> ShmemResult<()> {
        if at.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(ShmemError::OutOfBounds {
                offset: at,
                len,
                size: self.len,
            });
        }
        Ok(())
    }

    fn pin(&self) -> ShmemResult<(RwLockReadGuard<'_, Option<Mapping>>, *mut u8)> {
        let shared = &self.segment.shared;
        if shared.is_destroyed() {
            return Err(ShmemError::Destroyed(Resource::Segment));
        }
        let guard = shared.mapping.read_recursive();
        let base = guard
            .as_ref()
            .map(Mapping::as_ptr)
            .ok_or(ShmemError::Destroyed(Resource::Segment))?;
        // SAFETY: `offset + len` was validated against the mapping length when the view was made.
        let ptr = unsafe { base.add(self.offset) };
        Ok((guard, ptr))
    }
}

/// Read-only borrow of a [`ByteView`]; pins the mapping while alive.
pub struct ViewGuard<'a> {
    _guard: RwLockReadGuard<'a, Option<Mapping>>,
    ptr: *const u8,
    len: usize,
}

impl Deref for ViewGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the mapping is pinned by `_guard` and the caller of `lock` vouched for exclusivity.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Mutable borrow of a [`ByteView`]; pins the mapping while alive.
pub struct ViewGuardMut<'a> {
    _guard: RwLockReadGuard<'a, Option<Mapping>>,
    ptr: *mut u8,
    len: usize,
}

impl Deref for ViewGuardMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: see `ViewGuard::deref`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for ViewGuardMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: the caller of `lock_mut` vouched for exclusive access to the range.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn segment(size: usize) -> (tempfile::TempDir, Segment) {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = SegmentOptions::new()
            .size(size)
            .dir(dir.path())
            .create()
            .expect("create segment");
        (dir, segment)
    }

    fn peer(dir: &tempfile::TempDir, owner: &Segment) -> Segment {
        SegmentOptions::new()
            .os_id(owner.os_id())
            .dir(dir.path())
            .open()
            .expect("open segment")
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl Dependent for Recorder {
        fn teardown(&self) -> Result<(), TeardownError> {
            self.log.lock().push(self.name);
            if self.fail {
                return Err("teardown failed".into());
            }
            Ok(())
        }
    }

    /// Smoke test: bytes written by the owner are visible to an opener.
    #[test]
    fn owner_and_peer_share_bytes() {
        let (dir, owner) = segment(4096);
        assert!(owner.is_owner());
        assert_eq!(owner.size(), 4096);

        let peer = peer(&dir, &owner);
        assert!(!peer.is_owner());
        assert_eq!(peer.size(), 4096);

        owner
            .view(100, 8)
            .expect("owner view")
            .write_at(0, &42u64.to_ne_bytes())
            .expect("write");
        let mut buf = [0u8; 8];
        peer.view(100, 8)
            .expect("peer view")
            .read_at(0, &mut buf)
            .expect("read");
        assert_eq!(u64::from_ne_bytes(buf), 42);
    }

    #[test]
    fn zero_size_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = SegmentOptions::new()
            .size(0)
            .dir(dir.path())
            .create()
            .expect_err("zero size");
        assert!(matches!(err, ShmemError::InvalidArgument(_)));
    }

    #[test]
    fn view_edges() {
        let (_dir, segment) = segment(64);
        segment.view(0, 64).expect("whole segment");
        segment.view(63, 1).expect("last byte");
        assert!(matches!(
            segment.view(0, 0),
            Err(ShmemError::InvalidArgument(_))
        ));
        assert!(matches!(
            segment.view(64, 1),
            Err(ShmemError::OutOfBounds { .. })
        ));
        assert!(matches!(
            segment.view(60, 5),
            Err(ShmemError::OutOfBounds { .. })
        ));
        assert!(matches!(
            segment.view(1, usize::MAX),
            Err(ShmemError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn view_access_is_bounded_by_the_view() {
        let (_dir, segment) = segment(64);
        let view = segment.view(16, 8).expect("view");
        assert!(matches!(
            view.write_at(4, &[0u8; 8]),
            Err(ShmemError::OutOfBounds { size: 8, .. })
        ));
        view.write_at(4, &[1, 2, 3, 4]).expect("write tail");
        let mut buf = [0u8; 8];
        view.read_at(0, &mut buf).expect("read");
        assert_eq!(buf, [0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn typed_access_checks_alignment() {
        let (_dir, segment) = segment(64);
        let aligned = segment.view(8, 8).expect("aligned view");
        aligned
            .with::<AtomicU64Layout, _>(|value| value.0.store(7, Ordering::Relaxed))
            .expect("aligned access");
        let misaligned = segment.view(4, 8).expect("misaligned view");
        assert!(matches!(
            misaligned.with::<AtomicU64Layout, _>(|_| ()),
            Err(ShmemError::InvalidArgument(_))
        ));
        let short = segment.view(8, 4).expect("short view");
        assert!(matches!(
            short.with::<AtomicU64Layout, _>(|_| ()),
            Err(ShmemError::InvalidArgument(_))
        ));
    }

    #[repr(C)]
    struct AtomicU64Layout(AtomicU64);
    unsafe impl SharedLayout for AtomicU64Layout {}

    #[test]
    fn close_destroys_views_and_is_idempotent() {
        let (dir, segment) = segment(128);
        let view = segment.view(0, 16).expect("view");
        let backing = dir.path().join(segment.os_id());
        assert!(backing.exists());

        segment.close().expect("close");
        segment.close().expect("second close");
        assert!(segment.is_destroyed());
        assert!(!backing.exists());

        assert!(matches!(
            view.write_at(0, &[1]),
            Err(ShmemError::Destroyed(Resource::Segment))
        ));
        assert!(matches!(
            segment.view(0, 16),
            Err(ShmemError::Destroyed(Resource::Segment))
        ));
        // SAFETY: no other writers; the call must fail before touching memory.
        assert!(unsafe { view.lock() }.is_err());
    }

    #[test]
    fn dependents_tear_down_in_reverse_order() {
        let (_dir, segment) = segment(64);
        let log = Arc::new(Mutex::new(Vec::new()));
        let first: Arc<dyn Dependent> = Arc::new(Recorder {
            name: "first",
            log: log.clone(),
            fail: true,
        });
        let second: Arc<dyn Dependent> = Arc::new(Recorder {
            name: "second",
            log: log.clone(),
            fail: false,
        });
        let dropped: Arc<dyn Dependent> = Arc::new(Recorder {
            name: "dropped",
            log: log.clone(),
            fail: false,
        });
        let removed: Arc<dyn Dependent> = Arc::new(Recorder {
            name: "removed",
            log: log.clone(),
            fail: false,
        });

        segment
            .register_dependent(Arc::downgrade(&first))
            .expect("register first");
        segment
            .register_dependent(Arc::downgrade(&dropped))
            .expect("register dropped");
        let removed_id = segment
            .register_dependent(Arc::downgrade(&removed))
            .expect("register removed");
        segment
            .register_dependent(Arc::downgrade(&second))
            .expect("register second");
        segment.unregister_dependent(removed_id);
        drop(dropped);

        segment.close().expect("close tolerates failing dependents");
        assert_eq!(*log.lock(), vec!["second", "first"]);

        let late: Arc<dyn Dependent> = Arc::new(Recorder {
            name: "late",
            log,
            fail: false,
        });
        assert!(matches!(
            segment.register_dependent(Arc::downgrade(&late)),
            Err(ShmemError::Destroyed(Resource::Segment))
        ));
    }

    #[test]
    fn close_waits_for_pinned_views() {
        let (_dir, segment) = segment(64);
        let view = segment.view(0, 8).expect("view");
        let released = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            // SAFETY: nothing else writes these bytes during the test.
            let guard = unsafe { view.lock() }.expect("lock view");
            let closer = {
                let segment = segment.clone();
                let released = released.clone();
                scope.spawn(move || {
                    segment.close().expect("close");
                    assert_eq!(released.load(Ordering::SeqCst), 1);
                })
            };
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert_eq!(guard.len(), 8);
            released.store(1, Ordering::SeqCst);
            drop(guard);
            closer.join().expect("closer thread");
        });
        assert!(segment.is_destroyed());
    }

    #[test]
    fn flink_publishes_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let link = dir.path().join("segment.link");
        let owner = SegmentOptions::new()
            .size(256)
            .dir(dir.path())
            .flink(&link)
            .create()
            .expect("create with link");
        assert_eq!(owner.flink(), Some(link.as_path()));

        let err = SegmentOptions::new()
            .size(256)
            .dir(dir.path())
            .flink(&link)
            .create()
            .expect_err("link already taken");
        assert!(matches!(err, ShmemError::LinkExists(_)));

        let peer = SegmentOptions::new()
            .flink(&link)
            .dir(dir.path())
            .open()
            .expect("open by link");
        assert_eq!(peer.os_id(), owner.os_id());
        assert_eq!(peer.size(), 256);

        owner.close().expect("close owner");
        assert!(!link.exists());
    }

    #[test]
    fn open_requires_identity() {
        let err = SegmentOptions::new().open().expect_err("no identity");
        assert!(matches!(err, ShmemError::InvalidArgument(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Views succeed exactly for non-empty ranges inside the segment.
        #[test]
        fn view_bounds_follow_segment_size(offset in 0usize..160, len in 0usize..160) {
            let (_dir, segment) = segment(128);
            let fits = len > 0 && offset < 128 && offset + len <= 128;
            prop_assert_eq!(segment.view(offset, len).is_ok(), fits);
        }
    }
}
