//! Channel endpoints: layout, handshake and close ordering.
//!
//! The creator of the segment is the server and the opener is the client. Each `accept`
//! opens an accept epoch in the control block; `connect` claims it and the two sides
//! rendezvous on the connect condition. Each successful handshake produces a fresh
//! [`Connection`]. Closing a connection publishes pid 0 for the local side,
//! signals every condition and waits for in-flight operations to drain. Only then
//! may the segment be unmapped.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use shmem::{
    poll_until, ByteView, CancelToken, Condition, Dependent, DependentId, LockStrategy,
    ProcessProvider, Resource, Segment, ShmemError, TeardownError,
};

use crate::control::{ControlBlock, Geometry, Slot, NOT_CONNECTED};
use crate::{ChannelAddress, ChannelConfig, ChannelError, ChannelResult, Connection};

/// Which end of the channel this process holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Server => "server",
            Role::Client => "client",
        })
    }
}

/// Lifecycle of a channel endpoint as seen from this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelState {
    Uninitialized = 0,
    Establishing = 1,
    Connected = 2,
    LocallyClosed = 3,
    RemotelyClosed = 4,
    Closed = 5,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ChannelState::Establishing,
            2 => ChannelState::Connected,
            3 => ChannelState::LocallyClosed,
            4 => ChannelState::RemotelyClosed,
            5 => ChannelState::Closed,
            _ => ChannelState::Uninitialized,
        }
    }
}

/// Counts threads currently inside connect/accept, read or write.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    pub(crate) connecting: AtomicUsize,
    pub(crate) reading: AtomicUsize,
    pub(crate) writing: AtomicUsize,
}

impl InFlight {
    fn is_idle(&self) -> bool {
        self.connecting.load(Ordering::Acquire) == 0
            && self.reading.load(Ordering::Acquire) == 0
            && self.writing.load(Ordering::Acquire) == 0
    }
}

/// Marks one in-flight operation until dropped.
pub(crate) struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
    pub(crate) fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Busy(counter)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One end of a shared-memory channel.
///
/// Cheap to clone; all clones share the same endpoint state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    pub(crate) role: Role,
    segment: Segment,
    pub(crate) control: ControlBlock,
    conditions: Vec<Condition>,
    server_buffer: ByteView,
    client_buffer: ByteView,
    pub(crate) processes: Arc<dyn ProcessProvider>,
    config: ChannelConfig,
    pub(crate) in_flight: InFlight,
    state: AtomicU8,
    generation: AtomicU64,
    destroyed: AtomicBool,
    registration: Mutex<Option<DependentId>>,
}

impl Channel {
    /// Lays out (server) or attaches to (client) a channel in `segment`.
    ///
    /// The role follows segment ownership. Servers use `config.lock_strategy`; clients
    /// adopt whatever strategy the server recorded.
    pub fn new(
        segment: Segment,
        config: ChannelConfig,
        processes: Arc<dyn ProcessProvider>,
    ) -> ChannelResult<Self> {
        if segment.is_destroyed() {
            return Err(ShmemError::Destroyed(Resource::Segment).into());
        }
        let role = if segment.is_owner() {
            Role::Server
        } else {
            Role::Client
        };
        let planned = match role {
            Role::Server => Some(Geometry::plan(segment.size(), config.lock_strategy)?),
            Role::Client => None,
        };
        let control = ControlBlock::new(&segment)?;
        let geometry = match planned {
            Some(geometry) => geometry,
            None => control.load(segment.size())?,
        };

        let mut conditions = Vec::with_capacity(Slot::ALL.len());
        for slot in Slot::ALL {
            let offset = Geometry::condition_offset(geometry.strategy, slot);
            let condition = match role {
                Role::Server => Condition::create(
                    &segment,
                    offset,
                    geometry.strategy,
                    true,
                    config.wait.clone(),
                )?,
                Role::Client => {
                    Condition::attach(&segment, offset, geometry.strategy, config.wait.clone())?
                }
            };
            conditions.push(condition);
        }

        let (server_offset, server_len) = geometry.server_buffer;
        let (client_offset, client_len) = geometry.client_buffer;
        let server_buffer = segment.view(server_offset, server_len)?;
        let client_buffer = segment.view(client_offset, client_len)?;
        if role == Role::Server {
            control.initialize(&geometry)?;
        }

        let inner = Arc::new(ChannelInner {
            role,
            segment,
            control,
            conditions,
            server_buffer,
            client_buffer,
            processes,
            config,
            in_flight: InFlight::default(),
            state: AtomicU8::new(ChannelState::Uninitialized as u8),
            generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            registration: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        let weak: Weak<dyn Dependent> = weak;
        let id = inner.segment.register_dependent(weak)?;
        *inner.registration.lock() = Some(id);

        debug!(
            %role,
            os_id = inner.segment.os_id(),
            strategy = ?geometry.strategy,
            server_buffer = server_len,
            client_buffer = client_len,
            "channel ready"
        );
        Ok(Self { inner })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_server(&self) -> bool {
        self.inner.role == Role::Server
    }

    pub fn segment(&self) -> &Segment {
        &self.inner.segment
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Address a peer can use to open this channel.
    pub fn address(&self) -> ChannelAddress {
        match self.inner.segment.flink() {
            Some(flink) => ChannelAddress::Link(flink.to_path_buf()),
            None => ChannelAddress::OsId(self.inner.segment.os_id().to_owned()),
        }
    }

    pub fn server_pid(&self) -> ChannelResult<u64> {
        self.inner.ensure_live()?;
        Ok(self.inner.control.pid(Role::Server)?)
    }

    pub fn client_pid(&self) -> ChannelResult<u64> {
        self.inner.ensure_live()?;
        Ok(self.inner.control.pid(Role::Client)?)
    }

    pub fn lock_strategy(&self) -> ChannelResult<LockStrategy> {
        self.inner.ensure_live()?;
        self.inner.control.lock_strategy()
    }

    /// Size of the buffer this side writes into.
    pub fn write_buffer_size(&self) -> usize {
        self.inner.write_buffer().len()
    }

    /// Size of the buffer this side reads from.
    pub fn read_buffer_size(&self) -> usize {
        self.inner.read_buffer().len()
    }

    pub fn state(&self) -> ChannelState {
        let stored = ChannelState::from_u8(self.inner.state.load(Ordering::Acquire));
        if stored == ChannelState::Connected {
            let remote = self.inner.control.pid(self.inner.role.peer());
            if matches!(remote, Ok(NOT_CONNECTED)) {
                return ChannelState::RemotelyClosed;
            }
        }
        stored
    }

    /// True once the channel itself (not just a connection) has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Waits for a client to connect. Server only.
    pub fn accept(&self, timeout: Duration) -> ChannelResult<Connection> {
        self.accept_with(timeout, None)
    }

    pub fn accept_with(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> ChannelResult<Connection> {
        let inner = &self.inner;
        inner.require_role(Role::Server, "accept")?;
        inner.ensure_live()?;
        let _busy = Busy::enter(&inner.in_flight.connecting);
        let result = inner.accept_inner(timeout, cancel);
        if let Err(err) = &result {
            inner.abandon_handshake(err);
        }
        result
    }

    /// Connects to a server that is (or will soon be) accepting. Client only.
    pub fn connect(&self, timeout: Duration) -> ChannelResult<Connection> {
        self.connect_with(timeout, None)
    }

    pub fn connect_with(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> ChannelResult<Connection> {
        let inner = &self.inner;
        inner.require_role(Role::Client, "connect")?;
        inner.ensure_live()?;
        let _busy = Busy::enter(&inner.in_flight.connecting);
        let result = inner.connect_inner(timeout, cancel);
        if let Err(err) = &result {
            inner.abandon_handshake(err);
        }
        result
    }

    /// Closes the current connection (if any) and destroys this endpoint. Idempotent.
    ///
    /// Blocked accept/connect/read/write calls return `Destroyed`. The segment stays
    /// mapped; close it separately.
    pub fn close(&self) -> ChannelResult<()> {
        self.inner.close()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.inner.role)
            .field("segment", &self.inner.segment)
            .field("state", &self.state())
            .finish()
    }
}

impl ChannelInner {
    fn accept_inner(
        self: &Arc<Self>,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> ChannelResult<Connection> {
        let generation = self.begin_handshake();
        for condition in &self.conditions {
            condition.clear()?;
        }
        let epoch = self.control.open_accept()?;
        let pid = self.processes.current_pid();
        self.control.set_pid(Role::Server, pid)?;
        debug!(pid, epoch, "accepting");

        if !self.condition(Slot::Connect).wait_with(timeout, cancel, None)? {
            return Err(ChannelError::Timeout(timeout));
        }

        self.ensure_live()?;
        let client = self.control.pid(Role::Client)?;
        if self.control.pid(Role::Server)? != pid
            || client == NOT_CONNECTED
            || self.control.connect_epoch()? != epoch
        {
            return Err(ChannelError::closed("connection closed during accept"));
        }

        self.condition(Slot::ClientWrite).signal()?;
        self.condition(Slot::ServerWrite).signal()?;
        Ok(self.establish(generation, epoch, pid, client))
    }

    fn connect_inner(
        self: &Arc<Self>,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> ChannelResult<Connection> {
        let generation = self.begin_handshake();
        let pid = self.processes.current_pid();
        debug!(pid, "connecting");

        // Only an accept nobody has claimed yet can complete this handshake.
        let mut claimed = None;
        let ready = poll_until(timeout, self.config.connect_poll, cancel, || {
            if self.is_destroyed() {
                return Ok(true);
            }
            claimed = self.control.claim_accept()?;
            Ok(claimed.is_some())
        })?;
        if !ready {
            return Err(ChannelError::Timeout(timeout));
        }

        self.ensure_live()?;
        let epoch =
            claimed.ok_or_else(|| ChannelError::closed("connection closed during connect"))?;
        self.control.set_pid(Role::Client, pid)?;
        let server = self.control.pid(Role::Server)?;
        if server == NOT_CONNECTED {
            return Err(ChannelError::closed("server stopped accepting during connect"));
        }

        self.condition(Slot::Connect).signal()?;
        Ok(self.establish(generation, epoch, pid, server))
    }

    /// Starts a handshake; connections from earlier handshakes become stale.
    fn begin_handshake(&self) -> u64 {
        self.set_state(ChannelState::Establishing);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn establish(
        self: &Arc<Self>,
        generation: u64,
        epoch: u64,
        local: u64,
        remote: u64,
    ) -> Connection {
        self.set_state(ChannelState::Connected);
        debug!(role = %self.role, local, remote, generation, epoch, "connection established");
        Connection::new(self.clone(), generation, epoch, local, remote)
    }

    fn abandon_handshake(&self, err: &ChannelError) {
        if err.is_destroyed() || self.is_destroyed() {
            return;
        }
        debug!(role = %self.role, %err, "handshake failed");
        if let Err(reset) = self.control.set_pid(self.role, NOT_CONNECTED) {
            debug!(%reset, "failed to reset pid after handshake");
        }
        self.set_state(ChannelState::Uninitialized);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn condition(&self, slot: Slot) -> &Condition {
        &self.conditions[slot as usize]
    }

    pub(crate) fn write_buffer(&self) -> &ByteView {
        match self.role {
            Role::Server => &self.server_buffer,
            Role::Client => &self.client_buffer,
        }
    }

    pub(crate) fn read_buffer(&self) -> &ByteView {
        match self.role {
            Role::Server => &self.client_buffer,
            Role::Client => &self.server_buffer,
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn segment_destroyed(&self) -> bool {
        self.segment.is_destroyed()
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn require_role(&self, role: Role, operation: &'static str) -> ChannelResult<()> {
        if self.role != role {
            return Err(ChannelError::IllegalRole {
                role: self.role,
                operation,
            });
        }
        Ok(())
    }

    /// Channel destroyed first, then segment destroyed.
    pub(crate) fn ensure_live(&self) -> ChannelResult<()> {
        if self.is_destroyed() {
            return Err(ShmemError::Destroyed(Resource::Channel).into());
        }
        if self.segment.is_destroyed() {
            return Err(ShmemError::Destroyed(Resource::Segment).into());
        }
        Ok(())
    }

    /// Publishes pid 0 for this side, wakes every waiter on both sides and waits for
    /// in-flight operations to leave shared memory.
    pub(crate) fn close_connection(&self, force: bool) -> ChannelResult<()> {
        if !force && self.is_destroyed() {
            return Ok(());
        }
        if self.segment.is_destroyed() {
            return Err(ShmemError::Destroyed(Resource::Segment).into());
        }

        self.control.set_pid(self.role, NOT_CONNECTED)?;
        for condition in &self.conditions {
            condition.signal()?;
        }
        if !force {
            self.set_state(ChannelState::LocallyClosed);
        }

        let close_timeout = self.config.close_timeout;
        let idle = poll_until(close_timeout, self.config.close_poll, None, || {
            Ok(self.in_flight.is_idle())
        })?;
        if !idle {
            warn!(role = %self.role, "operations still in flight after close");
            return Err(ChannelError::Timeout(close_timeout));
        }
        debug!(role = %self.role, force, "connection closed");
        Ok(())
    }

    fn close(&self) -> ChannelResult<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.close_connection(true);
        self.set_state(ChannelState::Closed);
        if let Some(id) = self.registration.lock().take() {
            self.segment.unregister_dependent(id);
        }
        debug!(role = %self.role, os_id = self.segment.os_id(), "channel closed");
        result
    }
}

impl Dependent for ChannelInner {
    fn teardown(&self) -> Result<(), TeardownError> {
        self.close().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmem::{OsProcessProvider, SegmentOptions};

    fn server(size: usize) -> (tempfile::TempDir, Channel) {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = SegmentOptions::new()
            .size(size)
            .dir(dir.path())
            .create()
            .expect("segment");
        let channel = Channel::new(
            segment,
            ChannelConfig::default(),
            Arc::new(OsProcessProvider),
        )
        .expect("channel");
        (dir, channel)
    }

    #[test]
    fn new_server_is_uninitialized_and_disconnected() {
        let (_dir, channel) = server(8192);
        assert!(channel.is_server());
        assert_eq!(channel.state(), ChannelState::Uninitialized);
        assert_eq!(channel.server_pid().expect("server pid"), 0);
        assert_eq!(channel.client_pid().expect("client pid"), 0);
        assert_eq!(channel.lock_strategy().expect("strategy"), LockStrategy::Spin);
        assert!(matches!(channel.address(), ChannelAddress::OsId(_)));
    }

    #[test]
    fn tiny_segment_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = SegmentOptions::new()
            .size(64)
            .dir(dir.path())
            .create()
            .expect("segment");
        let err = Channel::new(
            segment,
            ChannelConfig::default(),
            Arc::new(OsProcessProvider),
        )
        .expect_err("too small");
        assert!(matches!(
            err,
            ChannelError::Shmem(ShmemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn close_is_idempotent_and_blocks_operations() {
        let (_dir, channel) = server(4096);
        channel.close().expect("close");
        channel.close().expect("close again");
        assert!(channel.is_closed());
        assert_eq!(channel.state(), ChannelState::Closed);
        let err = channel
            .accept(Duration::from_millis(10))
            .expect_err("destroyed");
        assert!(matches!(
            err,
            ChannelError::Shmem(ShmemError::Destroyed(Resource::Channel))
        ));
        assert!(channel.server_pid().expect_err("destroyed").is_destroyed());
    }

    #[test]
    fn busy_guard_tracks_in_flight_operations() {
        let in_flight = InFlight::default();
        assert!(in_flight.is_idle());
        {
            let _reading = Busy::enter(&in_flight.reading);
            let _writing = Busy::enter(&in_flight.writing);
            assert!(!in_flight.is_idle());
        }
        assert!(in_flight.is_idle());
    }
}
