//! Textual channel addresses.
//!
//! * `shmem:///path/to/link` – discover the segment through a flink file.
//! * `shmem+id://<os id>` – open the segment id directly (`shmem+osid://` is accepted too).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use shmem::ShmemError;

use crate::ChannelError;

const LINK_SCHEME: &str = "shmem://";
const ID_SCHEME: &str = "shmem+id://";
const ID_SCHEME_ALIAS: &str = "shmem+osid://";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelAddress {
    Link(PathBuf),
    OsId(String),
}

impl FromStr for ChannelAddress {
    type Err = ChannelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ChannelError::from(ShmemError::invalid(format!("bad channel address {raw:?}")));
        if let Some(path) = raw.strip_prefix(LINK_SCHEME) {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(ChannelAddress::Link(PathBuf::from(path)));
        }
        let id = raw
            .strip_prefix(ID_SCHEME)
            .or_else(|| raw.strip_prefix(ID_SCHEME_ALIAS))
            .ok_or_else(invalid)?;
        if id.is_empty() || id.contains('/') {
            return Err(invalid());
        }
        Ok(ChannelAddress::OsId(id.to_owned()))
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAddress::Link(path) => write!(f, "{LINK_SCHEME}{}", path.display()),
            ChannelAddress::OsId(id) => write!(f, "{ID_SCHEME}{id}"),
        }
    }
}
