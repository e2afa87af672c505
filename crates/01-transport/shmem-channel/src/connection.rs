//! Turn-based, zero-copy access to the channel buffers.
//!
//! Each side owns one buffer for writing. A writer waits for its write turn, fills the
//! buffer in place and hands it to the peer by signalling the peer's read slot. The
//! reader releases the buffer back by signalling the writer's write slot. Guards do the
//! hand-over on drop.

use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use shmem::{CancelToken, ShmemError, ShmemResult, ViewGuard, ViewGuardMut};

use crate::channel::{Busy, ChannelInner};
use crate::control::Slot;
use crate::{ChannelError, ChannelResult, Role};

/// One accepted or connected session on a channel.
///
/// A connection is invalidated by either side closing, by the channel or segment being
/// destroyed, or by a newer handshake on the same channel. Once invalidated it stays
/// closed, even if the peer later publishes the same pid again.
pub struct Connection {
    channel: Arc<ChannelInner>,
    generation: u64,
    epoch: u64,
    local_pid: u64,
    remote_pid: u64,
    closed: AtomicBool,
    remote_closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        channel: Arc<ChannelInner>,
        generation: u64,
        epoch: u64,
        local_pid: u64,
        remote_pid: u64,
    ) -> Self {
        Self {
            channel,
            generation,
            epoch,
            local_pid,
            remote_pid,
            closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> Role {
        self.channel.role
    }

    pub fn local_pid(&self) -> u64 {
        self.local_pid
    }

    pub fn remote_pid(&self) -> u64 {
        self.remote_pid
    }

    /// Bytes available to one write.
    pub fn write_capacity(&self) -> usize {
        self.channel.write_buffer().len()
    }

    pub fn read_capacity(&self) -> usize {
        self.channel.read_buffer().len()
    }

    pub fn is_closed(&self) -> bool {
        let channel = &*self.channel;
        if self.closed.load(Ordering::Acquire)
            || self.remote_closed.load(Ordering::Acquire)
            || channel.is_destroyed()
            || channel.segment_destroyed()
            || self.is_superseded()
        {
            return true;
        }
        let role = channel.role;
        let current = match (
            channel.control.pid(role),
            channel.control.pid(role.peer()),
            channel.control.accept_epoch(),
        ) {
            (Ok(local), Ok(remote), Ok(epoch)) => {
                local == self.local_pid && remote == self.remote_pid && epoch == self.epoch
            }
            _ => false,
        };
        if !current {
            self.remote_closed.store(true, Ordering::Release);
        }
        !current
    }

    /// Waits for the write turn and borrows the outgoing buffer.
    pub fn write(&self, timeout: Duration) -> ChannelResult<WriteGuard<'_>> {
        self.write_with(timeout, None)
    }

    pub fn write_with(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> ChannelResult<WriteGuard<'_>> {
        let channel = &*self.channel;
        self.ensure_open()?;
        let busy = Busy::enter(&channel.in_flight.writing);
        if let Err(err) = self.await_turn(Slot::write(channel.role), timeout, cancel) {
            drop(busy);
            return Err(self.fail(err));
        }
        self.ensure_open()?;

        // SAFETY: holding the write turn means the peer has released this buffer and will
        // not touch it until we signal its read slot, which happens when the guard drops.
        let bytes = unsafe { channel.write_buffer().lock_mut() }?;
        trace!(role = %channel.role, len = bytes.len(), "write turn acquired");
        Ok(WriteGuard {
            connection: self,
            bytes,
            position: 0,
            finished: false,
            _busy: busy,
        })
    }

    /// Waits for the peer's next message and borrows the incoming buffer.
    pub fn read(&self, timeout: Duration) -> ChannelResult<ReadGuard<'_>> {
        self.read_with(timeout, None)
    }

    pub fn read_with(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> ChannelResult<ReadGuard<'_>> {
        let channel = &*self.channel;
        self.ensure_open()?;
        let busy = Busy::enter(&channel.in_flight.reading);
        if let Err(err) = self.await_turn(Slot::read(channel.role), timeout, cancel) {
            drop(busy);
            return Err(self.fail(err));
        }
        self.ensure_open()?;

        // SAFETY: the peer signalled our read slot after finishing its write and will not
        // write again until we signal its write slot, which happens when the guard drops.
        let bytes = unsafe { channel.read_buffer().lock() }?;
        trace!(role = %channel.role, len = bytes.len(), "read turn acquired");
        Ok(ReadGuard {
            connection: self,
            bytes,
            position: 0,
            finished: false,
            _busy: busy,
        })
    }

    /// Closes this side of the connection. Idempotent.
    ///
    /// Must not be called while this thread holds a read or write guard of the same
    /// channel: close waits for in-flight operations to finish.
    pub fn close(&self) -> ChannelResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.is_superseded() {
            return Ok(());
        }
        self.channel.close_connection(false)
    }

    fn is_superseded(&self) -> bool {
        self.channel.generation() != self.generation
    }

    /// Channel or segment destroyed first, then connection closed.
    fn ensure_open(&self) -> ChannelResult<()> {
        self.channel.ensure_live()?;
        if self.is_closed() {
            return Err(ChannelError::closed("connection closed"));
        }
        Ok(())
    }

    fn await_turn(
        &self,
        slot: Slot,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> ChannelResult<()> {
        let processes = &self.channel.processes;
        let remote = self.remote_pid;
        let mut liveness = |_elapsed: Duration| -> ShmemResult<()> {
            if processes.is_alive(remote) {
                Ok(())
            } else {
                Err(ShmemError::RemoteProcessDied { pid: remote })
            }
        };
        let signaled = self
            .channel
            .condition(slot)
            .wait_with(timeout, cancel, Some(&mut liveness))?;
        if !signaled {
            return Err(ChannelError::Timeout(timeout));
        }
        Ok(())
    }

    fn fail(&self, err: ChannelError) -> ChannelError {
        match err {
            ChannelError::Shmem(cause @ ShmemError::RemoteProcessDied { .. }) => {
                warn!(remote_pid = self.remote_pid, "remote process died, closing connection");
                if let Err(close_err) = self.close() {
                    debug!(%close_err, "close after remote death failed");
                }
                ChannelError::ClosedConnection {
                    reason: format!("remote process {} died", self.remote_pid),
                    cause: Some(cause),
                }
            }
            other => other,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.close() {
            debug!(%err, "failed to close connection on drop");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.channel.role)
            .field("generation", &self.generation)
            .field("epoch", &self.epoch)
            .field("local_pid", &self.local_pid)
            .field("remote_pid", &self.remote_pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Exclusive borrow of this side's outgoing buffer.
///
/// Dropping the guard (or calling [`WriteGuard::commit`]) hands the buffer to the peer.
/// Writes through [`io::Write`] append from the start of the buffer.
pub struct WriteGuard<'a> {
    connection: &'a Connection,
    bytes: ViewGuardMut<'a>,
    position: usize,
    finished: bool,
    _busy: Busy<'a>,
}

impl WriteGuard<'_> {
    /// Hands the buffer to the peer and reports signalling errors.
    pub fn commit(mut self) -> ChannelResult<()> {
        self.finish()
    }

    /// Bytes written so far through [`io::Write`].
    pub fn position(&self) -> usize {
        self.position
    }

    fn finish(&mut self) -> ChannelResult<()> {
        if std::mem::replace(&mut self.finished, true) {
            return Ok(());
        }
        let channel = &*self.connection.channel;
        channel.ensure_live()?;
        channel.condition(Slot::read(channel.role.peer())).signal()?;
        trace!(role = %channel.role, written = self.position, "write committed");
        Ok(())
    }
}

impl Deref for WriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl io::Write for WriteGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let dst = &mut self.bytes[self.position..];
        let n = buf.len().min(dst.len());
        dst[..n].copy_from_slice(&buf[..n]);
        self.position += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard")
            .field("len", &self.bytes.len())
            .field("position", &self.position)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            debug!(%err, "failed to hand over write turn");
        }
    }
}

/// Shared borrow of the peer's buffer.
///
/// Dropping the guard (or calling [`ReadGuard::release`]) gives the write turn back
/// to the peer.
pub struct ReadGuard<'a> {
    connection: &'a Connection,
    bytes: ViewGuard<'a>,
    position: usize,
    finished: bool,
    _busy: Busy<'a>,
}

impl ReadGuard<'_> {
    pub fn release(mut self) -> ChannelResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> ChannelResult<()> {
        if std::mem::replace(&mut self.finished, true) {
            return Ok(());
        }
        let channel = &*self.connection.channel;
        channel.ensure_live()?;
        channel.condition(Slot::write(channel.role.peer())).signal()?;
        trace!(role = %channel.role, "read released");
        Ok(())
    }
}

impl Deref for ReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl io::Read for ReadGuard<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let src = &self.bytes[self.position..];
        let n = buf.len().min(src.len());
        buf[..n].copy_from_slice(&src[..n]);
        self.position += n;
        Ok(n)
    }
}

impl fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard")
            .field("len", &self.bytes.len())
            .field("position", &self.position)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            debug!(%err, "failed to release read turn");
        }
    }
}
