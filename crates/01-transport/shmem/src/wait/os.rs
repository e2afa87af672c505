use std::cell::UnsafeCell;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::warn;

use super::{cell_flags, is_initialized, NativeWait, FLAG_AUTO_RESET};
use crate::segment::SharedLayout;
use crate::{ShmemError, ShmemResult};

#[cfg(target_os = "linux")]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Wait cell backed by a process-shared pthread mutex and condition variable.
///
/// `signaled` is only mutated with the mutex held; it is atomic so it can be
/// inspected without locking.
#[repr(C, align(8))]
pub struct OsCell {
    flags: AtomicU32,
    signaled: AtomicU32,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: the pthread objects are initialized with PTHREAD_PROCESS_SHARED and are only
// touched through the pthread API, which synchronizes internally.
unsafe impl Sync for OsCell {}
// SAFETY: plain C data; zeroed memory reads as "uninitialized" through `flags`.
unsafe impl SharedLayout for OsCell {}

impl fmt::Debug for OsCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsCell")
            .field("initialized", &self.is_initialized())
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

fn check(op: &'static str, code: libc::c_int) -> ShmemResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(ShmemError::os(op, code))
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_wait_clock(attr: *mut libc::pthread_condattr_t) -> ShmemResult<()> {
    check(
        "pthread_condattr_setclock",
        libc::pthread_condattr_setclock(attr, WAIT_CLOCK),
    )
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_wait_clock(_attr: *mut libc::pthread_condattr_t) -> ShmemResult<()> {
    Ok(())
}

/// Makes the mutex robust, so a holder dying hands the lock on with `EOWNERDEAD`.
#[cfg(target_os = "linux")]
unsafe fn set_robust(attr: *mut libc::pthread_mutexattr_t) -> ShmemResult<()> {
    check(
        "pthread_mutexattr_setrobust",
        libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST),
    )
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_robust(_attr: *mut libc::pthread_mutexattr_t) -> ShmemResult<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
unsafe fn make_consistent(mutex: *mut libc::pthread_mutex_t) -> ShmemResult<()> {
    check("pthread_mutex_consistent", libc::pthread_mutex_consistent(mutex))
}

#[cfg(not(target_os = "linux"))]
unsafe fn make_consistent(_mutex: *mut libc::pthread_mutex_t) -> ShmemResult<()> {
    Ok(())
}

fn deadline_after(timeout: Duration) -> ShmemResult<libc::timespec> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: clock_gettime writes a full timespec on success.
    if unsafe { libc::clock_gettime(WAIT_CLOCK, now.as_mut_ptr()) } != 0 {
        let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(ShmemError::os("clock_gettime", code));
    }
    // SAFETY: initialized by the successful call above.
    let mut deadline = unsafe { now.assume_init() };

    let nanos = deadline.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let secs = i64::try_from(timeout.as_secs())
        .unwrap_or(i64::MAX)
        .saturating_add(nanos / NANOS_PER_SEC);
    let tv_sec = (deadline.tv_sec as i64).saturating_add(secs);
    deadline.tv_sec = libc::time_t::try_from(tv_sec).unwrap_or(libc::time_t::MAX);
    deadline.tv_nsec = (nanos % NANOS_PER_SEC) as _;
    Ok(deadline)
}

impl OsCell {
    fn init_primitives(&self) -> ShmemResult<()> {
        // SAFETY: attribute objects are initialized before use and destroyed afterwards; the
        // mutex and condvar are initialized in place, in memory nobody else uses yet.
        unsafe {
            let mut mutex_attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            check(
                "pthread_mutexattr_init",
                libc::pthread_mutexattr_init(mutex_attr.as_mut_ptr()),
            )?;
            let result = check(
                "pthread_mutexattr_setpshared",
                libc::pthread_mutexattr_setpshared(
                    mutex_attr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                ),
            )
            .and_then(|()| set_robust(mutex_attr.as_mut_ptr()))
            .and_then(|()| {
                check(
                    "pthread_mutex_init",
                    libc::pthread_mutex_init(self.mutex.get(), mutex_attr.as_ptr()),
                )
            });
            libc::pthread_mutexattr_destroy(mutex_attr.as_mut_ptr());
            result?;

            let mut cond_attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
            check(
                "pthread_condattr_init",
                libc::pthread_condattr_init(cond_attr.as_mut_ptr()),
            )?;
            let result = check(
                "pthread_condattr_setpshared",
                libc::pthread_condattr_setpshared(
                    cond_attr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                ),
            )
            .and_then(|()| set_wait_clock(cond_attr.as_mut_ptr()))
            .and_then(|()| {
                check(
                    "pthread_cond_init",
                    libc::pthread_cond_init(self.cond.get(), cond_attr.as_ptr()),
                )
            });
            libc::pthread_condattr_destroy(cond_attr.as_mut_ptr());
            result
        }
    }

    fn lock(&self) -> ShmemResult<()> {
        // SAFETY: the mutex was initialized process-shared by `init`.
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        self.locked("pthread_mutex_lock", rc)
    }

    /// Interprets the return code of a call that (re)acquires the mutex.
    ///
    /// `EOWNERDEAD` means the previous holder died with the lock held. The guarded
    /// state is a single atomic word, so it is always consistent and the lock is kept.
    fn locked(&self, op: &'static str, rc: libc::c_int) -> ShmemResult<()> {
        if rc == libc::EOWNERDEAD {
            warn!(op, "condition lock holder died; recovering the lock");
            // SAFETY: EOWNERDEAD leaves the mutex locked by this thread.
            return unsafe { make_consistent(self.mutex.get()) };
        }
        check(op, rc)
    }

    fn unlock(&self) -> ShmemResult<()> {
        // SAFETY: only called by the thread that locked the mutex.
        check("pthread_mutex_unlock", unsafe {
            libc::pthread_mutex_unlock(self.mutex.get())
        })
    }

    /// Must be called with the mutex held.
    fn take(&self) -> bool {
        if self.auto_reset() {
            self.signaled.swap(0, Ordering::AcqRel) == 1
        } else {
            self.signaled.load(Ordering::Acquire) == 1
        }
    }
}

impl NativeWait for OsCell {
    fn init(&self, auto_reset: bool) -> ShmemResult<()> {
        self.init_primitives()?;
        self.signaled.store(0, Ordering::Relaxed);
        self.flags.store(cell_flags(auto_reset), Ordering::Release);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        is_initialized(self.flags.load(Ordering::Acquire))
    }

    fn auto_reset(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_AUTO_RESET != 0
    }

    fn try_wait(&self, timeout: Duration) -> ShmemResult<bool> {
        let deadline = deadline_after(timeout)?;
        self.lock()?;
        let outcome = loop {
            if self.take() {
                break Ok(true);
            }
            // SAFETY: the mutex is held by this thread and the condvar was initialized with
            // the same clock `deadline` is measured against.
            let rc = unsafe {
                libc::pthread_cond_timedwait(self.cond.get(), self.mutex.get(), &deadline)
            };
            match rc {
                0 => continue,
                libc::ETIMEDOUT => break Ok(self.take()),
                libc::EOWNERDEAD => match self.locked("pthread_cond_timedwait", rc) {
                    Ok(()) => continue,
                    Err(err) => break Err(err),
                },
                code => break Err(ShmemError::os("pthread_cond_timedwait", code)),
            }
        };
        self.unlock()?;
        outcome
    }

    fn signal(&self) -> ShmemResult<()> {
        self.lock()?;
        self.signaled.store(1, Ordering::Release);
        // SAFETY: the condvar was initialized process-shared by `init`.
        let rc = unsafe {
            if self.auto_reset() {
                libc::pthread_cond_signal(self.cond.get())
            } else {
                libc::pthread_cond_broadcast(self.cond.get())
            }
        };
        self.unlock()?;
        check("pthread_cond_signal", rc)
    }

    fn clear(&self) -> ShmemResult<()> {
        self.lock()?;
        self.signaled.store(0, Ordering::Release);
        self.unlock()
    }

    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire) == 1
    }
}
