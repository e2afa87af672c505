//! Control block and geometry of a channel segment.
//!
//! ```text
//! 0    magic u8 | version u8 | pad[6]
//! 8    server pid u64
//! 16   client pid u64
//! 24   lock strategy u8 | pad[7]
//! 32   server buffer size u64
//! 40   client buffer size u64
//! 48   accept epoch u64
//! 56   connect epoch u64
//! 64   connect | server write | server read | client write | client read   (conditions)
//! ..   server buffer | client buffer
//! ```
//!
//! Fields are native-endian atomics. The creator publishes `magic` last, so a peer
//! that sees the magic also sees every other field.
//!
//! Every `accept` opens a new accept epoch; a `connect` claims it by copying it into
//! the connect epoch. An accept whose epoch has been claimed is spent, so a client
//! can only connect after the server has accepted again.

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use shmem::{ByteView, LockStrategy, Segment, SharedLayout, ShmemError, ShmemResult};

use crate::{ChannelError, ChannelResult, Role};

pub(crate) const MAGIC: u8 = 0x2A;
pub(crate) const VERSION: u8 = 1;
/// Pid value meaning "this side is not connected".
pub(crate) const NOT_CONNECTED: u64 = 0;

#[repr(C, align(8))]
pub(crate) struct ControlHeader {
    magic: AtomicU8,
    version: AtomicU8,
    _pad0: [u8; 6],
    server_pid: AtomicU64,
    client_pid: AtomicU64,
    lock_strategy: AtomicU8,
    _pad1: [u8; 7],
    server_buffer_size: AtomicU64,
    client_buffer_size: AtomicU64,
    accept_epoch: AtomicU64,
    connect_epoch: AtomicU64,
}

// SAFETY: atomics and padding only; every bit pattern is a valid value.
unsafe impl SharedLayout for ControlHeader {}

pub(crate) const CONTROL_SIZE: usize = mem::size_of::<ControlHeader>();

/// Index of each condition in the slot array following the control block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    Connect = 0,
    ServerWrite = 1,
    ServerRead = 2,
    ClientWrite = 3,
    ClientRead = 4,
}

pub(crate) const SLOT_COUNT: usize = 5;

impl Slot {
    pub(crate) const ALL: [Slot; SLOT_COUNT] = [
        Slot::Connect,
        Slot::ServerWrite,
        Slot::ServerRead,
        Slot::ClientWrite,
        Slot::ClientRead,
    ];

    pub(crate) fn write(role: Role) -> Slot {
        match role {
            Role::Server => Slot::ServerWrite,
            Role::Client => Slot::ClientWrite,
        }
    }

    pub(crate) fn read(role: Role) -> Slot {
        match role {
            Role::Server => Slot::ServerRead,
            Role::Client => Slot::ClientRead,
        }
    }
}

/// Byte offsets of everything after the control block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub(crate) strategy: LockStrategy,
    pub(crate) server_buffer: (usize, usize),
    pub(crate) client_buffer: (usize, usize),
}

impl Geometry {
    fn data_start(strategy: LockStrategy) -> usize {
        CONTROL_SIZE + SLOT_COUNT * strategy.backing_size()
    }

    pub(crate) fn condition_offset(strategy: LockStrategy, slot: Slot) -> usize {
        CONTROL_SIZE + slot as usize * strategy.backing_size()
    }

    /// Splits the space after the conditions: server gets the floor half, client the rest.
    pub(crate) fn plan(segment_size: usize, strategy: LockStrategy) -> ChannelResult<Self> {
        let start = Self::data_start(strategy);
        let available = segment_size.saturating_sub(start);
        if available < 2 {
            return Err(ShmemError::invalid(format!(
                "segment of {segment_size} bytes leaves no room for buffers after {start} bytes of control data"
            ))
            .into());
        }
        let server = available / 2;
        Ok(Self::from_sizes(strategy, server, available - server))
    }

    /// Rebuilds the geometry from sizes recorded by the creator.
    pub(crate) fn recorded(
        segment_size: usize,
        strategy: LockStrategy,
        server: u64,
        client: u64,
    ) -> ChannelResult<Self> {
        let start = Self::data_start(strategy);
        let fits = usize::try_from(server)
            .ok()
            .zip(usize::try_from(client).ok())
            .filter(|&(server, client)| server > 0 && client > 0)
            .and_then(|(server, client)| {
                start
                    .checked_add(server)?
                    .checked_add(client)
                    .filter(|end| *end <= segment_size)
                    .map(|_| (server, client))
            });
        let (server, client) = fits.ok_or_else(|| {
            ChannelError::protocol(format!(
                "recorded buffers ({server} + {client} bytes) do not fit a {segment_size} byte segment"
            ))
        })?;
        Ok(Self::from_sizes(strategy, server, client))
    }

    fn from_sizes(strategy: LockStrategy, server: usize, client: usize) -> Self {
        let start = Self::data_start(strategy);
        Self {
            strategy,
            server_buffer: (start, server),
            client_buffer: (start + server, client),
        }
    }
}

/// Typed access to the control block at offset 0.
#[derive(Clone, Debug)]
pub(crate) struct ControlBlock {
    view: ByteView,
}

impl ControlBlock {
    pub(crate) fn new(segment: &Segment) -> ShmemResult<Self> {
        Ok(Self {
            view: segment.view(0, CONTROL_SIZE)?,
        })
    }

    /// Writes a fresh header; `magic` is published last.
    pub(crate) fn initialize(&self, geometry: &Geometry) -> ShmemResult<()> {
        self.view.with(|header: &ControlHeader| {
            header.server_pid.store(NOT_CONNECTED, Ordering::Relaxed);
            header.client_pid.store(NOT_CONNECTED, Ordering::Relaxed);
            header.accept_epoch.store(0, Ordering::Relaxed);
            header.connect_epoch.store(0, Ordering::Relaxed);
            header
                .lock_strategy
                .store(geometry.strategy.as_u8(), Ordering::Relaxed);
            header
                .server_buffer_size
                .store(geometry.server_buffer.1 as u64, Ordering::Relaxed);
            header
                .client_buffer_size
                .store(geometry.client_buffer.1 as u64, Ordering::Relaxed);
            header.version.store(VERSION, Ordering::Relaxed);
            header.magic.store(MAGIC, Ordering::Release);
        })
    }

    /// Validates a header written by the creator and returns its geometry.
    pub(crate) fn load(&self, segment_size: usize) -> ChannelResult<Geometry> {
        let (magic, version, strategy, server, client) =
            self.view.with(|header: &ControlHeader| {
                (
                    header.magic.load(Ordering::Acquire),
                    header.version.load(Ordering::Relaxed),
                    header.lock_strategy.load(Ordering::Relaxed),
                    header.server_buffer_size.load(Ordering::Relaxed),
                    header.client_buffer_size.load(Ordering::Relaxed),
                )
            })?;
        if magic != MAGIC {
            return Err(ChannelError::protocol(format!(
                "control block magic is {magic:#04x}, expected {MAGIC:#04x} (segment not initialized as a channel?)"
            )));
        }
        if version != VERSION {
            return Err(ChannelError::protocol(format!(
                "control block version {version}, expected {VERSION}"
            )));
        }
        let strategy = LockStrategy::from_u8(strategy).ok_or_else(|| {
            ChannelError::protocol(format!("unknown lock strategy {strategy}"))
        })?;
        Geometry::recorded(segment_size, strategy, server, client)
    }

    pub(crate) fn pid(&self, role: Role) -> ShmemResult<u64> {
        self.view.with(|header: &ControlHeader| {
            header.pid_field(role).load(Ordering::Acquire)
        })
    }

    pub(crate) fn set_pid(&self, role: Role, pid: u64) -> ShmemResult<()> {
        self.view.with(|header: &ControlHeader| {
            header.pid_field(role).store(pid, Ordering::Release)
        })
    }

    /// Opens a new accept epoch and returns it. Server only.
    pub(crate) fn open_accept(&self) -> ShmemResult<u64> {
        self.view.with(|header: &ControlHeader| {
            header.accept_epoch.fetch_add(1, Ordering::AcqRel) + 1
        })
    }

    pub(crate) fn accept_epoch(&self) -> ShmemResult<u64> {
        self.view
            .with(|header: &ControlHeader| header.accept_epoch.load(Ordering::Acquire))
    }

    pub(crate) fn connect_epoch(&self) -> ShmemResult<u64> {
        self.view
            .with(|header: &ControlHeader| header.connect_epoch.load(Ordering::Acquire))
    }

    /// Claims the server's pending accept, if there is one. Client only.
    ///
    /// Returns the claimed epoch. `None` means the server is not accepting or its
    /// current accept already belongs to another connect.
    pub(crate) fn claim_accept(&self) -> ShmemResult<Option<u64>> {
        self.view.with(|header: &ControlHeader| {
            if header.server_pid.load(Ordering::Acquire) == NOT_CONNECTED {
                return None;
            }
            let accept = header.accept_epoch.load(Ordering::Acquire);
            let claimed = header.connect_epoch.load(Ordering::Acquire);
            if accept == claimed {
                return None;
            }
            header
                .connect_epoch
                .compare_exchange(claimed, accept, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| accept)
        })
    }

    pub(crate) fn lock_strategy(&self) -> ChannelResult<LockStrategy> {
        let raw = self
            .view
            .with(|header: &ControlHeader| header.lock_strategy.load(Ordering::Relaxed))?;
        LockStrategy::from_u8(raw)
            .ok_or_else(|| ChannelError::protocol(format!("unknown lock strategy {raw}")))
    }
}

impl ControlHeader {
    fn pid_field(&self, role: Role) -> &AtomicU64 {
        match role {
            Role::Server => &self.server_pid,
            Role::Client => &self.client_pid,
        }
    }
}
