use crate::bus::{BusError, Channel};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which of the two asynchronous transfers an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Program,
    Read,
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferKind::Program => f.write_str("page program"),
            TransferKind::Read => f.write_str("page read"),
        }
    }
}

/// Errors surfaced by the memory-card driver.
///
/// [`Error::Bus`] is fatal for a probe run. Everything else is scoped to one
/// card and lets the caller move on to the next channel.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} has no device attached")]
    NotAttached(Channel),

    #[error("card id {id:#06x} selects unassigned sector size class {index}")]
    UndefinedGeometry { id: u16, index: u8 },

    #[error("{channel} did not respond within {waited:?}")]
    DeviceUnresponsive { channel: Channel, waited: Duration },

    #[error("{kind} already in flight on {channel}")]
    TransferInFlight { channel: Channel, kind: TransferKind },

    #[error("{kind} on {channel} was dropped by the bus before completing")]
    TransferAbandoned { channel: Channel, kind: TransferKind },

    #[error("offset {0:#x} does not fit the card address field")]
    AddressOutOfRange(u32),

    #[error("latency of {latency} dummy bytes exceeds the {max}-byte latency buffer")]
    LatencyOutOfRange { latency: u32, max: usize },

    #[error("bus failure: {0}")]
    Bus(#[from] BusError),
}
