use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use shmem::{LockStrategy, OsProcessProvider, ProcessProvider, SegmentOptions, ShmemError};

use crate::{Channel, ChannelAddress, ChannelConfig, ChannelResult};

/// Creates or opens the segment behind a channel and lays the channel out in it.
#[derive(Clone, Debug)]
pub struct ChannelBuilder {
    size: Option<usize>,
    os_id: Option<String>,
    flink: Option<PathBuf>,
    dir: Option<PathBuf>,
    destroy_on_exit: bool,
    config: ChannelConfig,
    processes: Arc<dyn ProcessProvider>,
}

impl Default for ChannelBuilder {
    fn default() -> Self {
        Self {
            size: None,
            os_id: None,
            flink: None,
            dir: None,
            destroy_on_exit: true,
            config: ChannelConfig::default(),
            processes: Arc::new(OsProcessProvider),
        }
    }
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total segment size. Required by [`ChannelBuilder::create_server`].
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn os_id(mut self, os_id: impl Into<String>) -> Self {
        self.os_id = Some(os_id.into());
        self
    }

    pub fn flink(mut self, flink: impl Into<PathBuf>) -> Self {
        self.flink = Some(flink.into());
        self
    }

    pub fn address(self, address: &ChannelAddress) -> Self {
        match address {
            ChannelAddress::Link(path) => self.flink(path.clone()),
            ChannelAddress::OsId(id) => self.os_id(id.clone()),
        }
    }

    /// Directory holding segment backing files.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn destroy_on_exit(mut self, destroy_on_exit: bool) -> Self {
        self.destroy_on_exit = destroy_on_exit;
        self
    }

    pub fn lock_strategy(mut self, lock_strategy: LockStrategy) -> Self {
        self.config.lock_strategy = lock_strategy;
        self
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn process_provider(mut self, processes: Arc<dyn ProcessProvider>) -> Self {
        self.processes = processes;
        self
    }

    /// Creates a fresh segment and becomes its server.
    pub fn create_server(&self) -> ChannelResult<Channel> {
        let size = self
            .size
            .ok_or_else(|| ShmemError::invalid("a channel size is required to create a server"))?;
        let segment = self.segment_options().size(size).create()?;
        self.finish(segment)
    }

    /// Opens an existing segment by os id or flink and becomes its client.
    pub fn create_client(&self) -> ChannelResult<Channel> {
        if self.os_id.is_none() && self.flink.is_none() {
            return Err(ShmemError::invalid("an os id or flink is required to open a channel").into());
        }
        let segment = self.segment_options().open()?;
        self.finish(segment)
    }

    fn finish(&self, segment: shmem::Segment) -> ChannelResult<Channel> {
        match Channel::new(segment.clone(), self.config.clone(), self.processes.clone()) {
            Ok(channel) => Ok(channel),
            Err(err) => {
                if let Err(close_err) = segment.close() {
                    debug!(%close_err, "failed to close segment after channel setup error");
                }
                Err(err)
            }
        }
    }

    fn segment_options(&self) -> SegmentOptions {
        let mut options = SegmentOptions::new().destroy_on_exit(self.destroy_on_exit);
        if let Some(os_id) = &self.os_id {
            options = options.os_id(os_id.clone());
        }
        if let Some(flink) = &self.flink {
            options = options.flink(flink.clone());
        }
        if let Some(dir) = &self.dir {
            options = options.dir(dir.clone());
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelError, Role};

    #[test]
    fn server_requires_size() {
        let err = ChannelBuilder::new().create_server().expect_err("no size");
        assert!(matches!(
            err,
            ChannelError::Shmem(ShmemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn client_requires_an_address() {
        let err = ChannelBuilder::new().create_client().expect_err("no address");
        assert!(matches!(
            err,
            ChannelError::Shmem(ShmemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn server_and_client_from_builder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = ChannelBuilder::new()
            .size(8192)
            .dir(dir.path())
            .flink(dir.path().join("echo.link"))
            .lock_strategy(LockStrategy::Os)
            .create_server()
            .expect("server");
        assert_eq!(server.role(), Role::Server);

        let client = ChannelBuilder::new()
            .dir(dir.path())
            .address(&server.address())
            .create_client()
            .expect("client");
        assert_eq!(client.role(), Role::Client);
        assert_eq!(client.lock_strategy().expect("strategy"), LockStrategy::Os);
        assert_eq!(client.write_buffer_size(), server.read_buffer_size());

        client.segment().close().expect("close client");
        server.segment().close().expect("close server");
    }

    #[test]
    fn failed_setup_releases_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ChannelBuilder::new()
            .size(16)
            .dir(dir.path())
            .create_server()
            .expect_err("too small");
        assert!(matches!(
            err,
            ChannelError::Shmem(ShmemError::InvalidArgument(_))
        ));
        let leftovers = std::fs::read_dir(dir.path()).expect("read dir").count();
        assert_eq!(leftovers, 0);
    }
}
