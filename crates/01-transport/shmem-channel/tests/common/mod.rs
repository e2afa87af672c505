//! Shared fixtures: a server/client pair on one flink-addressed segment, with fake
//! process identities so tests can "kill" either side.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use shmem_channel::{
    Channel, ChannelBuilder, ChannelConfig, Connection, LockStrategy, ProcessProvider,
};

pub const SERVER_PID: u64 = 100;
pub const CLIENT_PID: u64 = 200;
pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const SHORT: Duration = Duration::from_millis(50);

/// Liveness oracle shared by every fake process in a test.
#[derive(Clone, Debug, Default)]
pub struct World {
    dead: Arc<Mutex<HashSet<u64>>>,
}

impl World {
    pub fn process(&self, pid: u64) -> Arc<dyn ProcessProvider> {
        Arc::new(FakeProcess {
            pid,
            dead: self.dead.clone(),
        })
    }

    pub fn kill(&self, pid: u64) {
        self.dead.lock().insert(pid);
    }

    /// Lets a "restarted" process reuse its pid.
    pub fn revive(&self, pid: u64) {
        self.dead.lock().remove(&pid);
    }
}

#[derive(Debug)]
struct FakeProcess {
    pid: u64,
    dead: Arc<Mutex<HashSet<u64>>>,
}

impl ProcessProvider for FakeProcess {
    fn current_pid(&self) -> u64 {
        self.pid
    }

    fn is_alive(&self, pid: u64) -> bool {
        pid != 0 && !self.dead.lock().contains(&pid)
    }
}

pub fn fast_config(strategy: LockStrategy) -> ChannelConfig {
    let mut config = ChannelConfig::default().with_lock_strategy(strategy);
    config.wait.tick_interval = Duration::from_millis(20);
    config.wait.os_slice = Duration::from_millis(20);
    config.connect_poll = Duration::from_millis(5);
    config.close_poll = Duration::from_millis(5);
    config
}

pub struct Pair {
    pub world: World,
    pub server: Channel,
    pub client: Channel,
    dir: tempfile::TempDir,
}

impl Pair {
    pub fn new(size: usize, strategy: LockStrategy) -> Self {
        Self::with_server_config(size, fast_config(strategy))
    }

    pub fn with_server_config(size: usize, config: ChannelConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let world = World::default();
        let server = ChannelBuilder::new()
            .size(size)
            .dir(dir.path())
            .flink(dir.path().join("channel.link"))
            .destroy_on_exit(false)
            .config(config)
            .process_provider(world.process(SERVER_PID))
            .create_server()
            .expect("create server");
        // The client's own strategy preference is ignored in favour of the server's.
        let client = ChannelBuilder::new()
            .dir(dir.path())
            .address(&server.address())
            .destroy_on_exit(false)
            .config(fast_config(LockStrategy::Spin))
            .process_provider(world.process(CLIENT_PID))
            .create_client()
            .expect("create client");
        Self {
            world,
            server,
            client,
            dir,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Runs accept and connect concurrently and returns `(server, client)` connections.
    pub fn connect(&self) -> (Connection, Connection) {
        thread::scope(|scope| {
            let accept = scope.spawn(|| self.server.accept(TIMEOUT));
            let client = self.client.connect(TIMEOUT).expect("connect");
            let server = accept
                .join()
                .expect("accept thread panicked")
                .expect("accept");
            (server, client)
        })
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        let _ = self.client.segment().close();
        let _ = self.server.segment().close();
    }
}

pub fn send_u64(connection: &Connection, value: u64) {
    let mut guard = connection.write(TIMEOUT).expect("write turn");
    guard[..8].copy_from_slice(&value.to_ne_bytes());
    guard.commit().expect("commit");
}

pub fn recv_u64(connection: &Connection) -> u64 {
    let guard = connection.read(TIMEOUT).expect("read turn");
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&guard[..8]);
    guard.release().expect("release");
    u64::from_ne_bytes(raw)
}

/// Gives a blocked thread time to reach its wait.
pub fn settle() {
    thread::sleep(Duration::from_millis(100));
}
