//! File-backed mappings that hold segment memory.
//!
//! Segments live as plain files under a shared-memory directory (`/dev/shm` on Linux)
//! and are mapped with `memmap2`. The creator owns the backing file and removes it,
//! together with its flink, once the mapping is released.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::{ShmemError, ShmemResult};

/// Environment variable overriding the directory segments are created in.
pub const DIR_ENV: &str = "SHMEM_DIR";

/// Directory used when no explicit segment directory is configured.
///
/// Resolution order: `$SHMEM_DIR`, `/dev/shm` when present, `$TMPDIR/shmem`.
pub fn default_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DIR_ENV) {
        return PathBuf::from(dir);
    }
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        return dev_shm.to_path_buf();
    }
    std::env::temp_dir().join("shmem")
}

pub(crate) fn generate_os_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    format!(
        "shmem_{}_{:x}_{}",
        std::process::id(),
        nanos,
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

pub(crate) fn validate_os_id(id: &str) -> ShmemResult<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\0']) {
        return Err(ShmemError::invalid(format!("malformed segment id {id:?}")));
    }
    Ok(())
}

/// Publishes `os_id` at `path`, failing if a link already exists there.
///
/// The id is written to a scratch file first and hard-linked into place so a peer
/// never observes a partially written link.
pub(crate) fn write_flink(path: &Path, os_id: &str) -> ShmemResult<()> {
    let scratch = scratch_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&scratch)?;
        file.write_all(os_id.as_bytes())?;
    }
    let linked = fs::hard_link(&scratch, path);
    let _ = fs::remove_file(&scratch);
    match linked {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            Err(ShmemError::LinkExists(path.to_path_buf()))
        }
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn read_flink(path: &Path) -> ShmemResult<String> {
    let raw = fs::read_to_string(path)?;
    let id = raw.trim().to_owned();
    validate_os_id(&id)?;
    Ok(id)
}

fn scratch_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// A live mapping of a segment's backing file.
#[derive(Debug)]
pub(crate) struct Mapping {
    _map: MmapMut,
    ptr: NonNull<u8>,
    len: usize,
    path: PathBuf,
    flink: Option<PathBuf>,
    owner: bool,
}

// SAFETY: `ptr` addresses the bytes of `_map`, which is owned by this value and is itself
// Send + Sync. All mutation of the mapped bytes happens through atomics or under the
// exclusivity rules of the caller.
unsafe impl Send for Mapping {}
// SAFETY: see above.
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Creates and maps a fresh, zero-filled backing file of `size` bytes.
    pub(crate) fn create(dir: &Path, os_id: &str, size: usize) -> ShmemResult<Self> {
        validate_os_id(os_id)?;
        fs::create_dir_all(dir)?;
        let path = dir.join(os_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mapped = u64::try_from(size)
            .map_err(|_| ShmemError::invalid(format!("segment size {size} is too large")))
            .and_then(|len| file.set_len(len).map_err(ShmemError::from))
            .and_then(|()| Self::map(&file, size));
        match mapped {
            Ok(map) => Self::from_map(map, path, true),
            Err(err) => {
                let _ = fs::remove_file(&path);
                Err(err)
            }
        }
    }

    /// Maps an existing backing file; the size is whatever the creator allocated.
    pub(crate) fn open(dir: &Path, os_id: &str) -> ShmemResult<Self> {
        validate_os_id(os_id)?;
        let path = dir.join(os_id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = usize::try_from(file.metadata()?.len())
            .map_err(|_| ShmemError::invalid(format!("segment {os_id} is too large to map")))?;
        if size == 0 {
            return Err(ShmemError::invalid(format!("segment {os_id} is empty")));
        }
        let map = Self::map(&file, size)?;
        Self::from_map(map, path, false)
    }

    fn map(file: &File, size: usize) -> ShmemResult<MmapMut> {
        // SAFETY: the backing file is only resized by its creator before mapping, and the
        // mapped bytes are accessed exclusively through raw pointers handed out under the
        // segment's mapping lock.
        let map = unsafe { MmapOptions::new().len(size).map_mut(file)? };
        Ok(map)
    }

    fn from_map(mut map: MmapMut, path: PathBuf, owner: bool) -> ShmemResult<Self> {
        let len = map.len();
        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| ShmemError::invalid("mapping returned a null address"))?;
        Ok(Self {
            _map: map,
            ptr,
            len,
            path,
            flink: None,
            owner,
        })
    }

    pub(crate) fn set_flink(&mut self, flink: PathBuf) {
        self.flink = Some(flink);
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        if let Some(flink) = &self.flink {
            if let Err(err) = fs::remove_file(flink) {
                debug!(flink = %flink.display(), %err, "failed to remove segment link");
            }
        }
        if let Err(err) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), %err, "failed to remove segment file");
        }
    }
}
