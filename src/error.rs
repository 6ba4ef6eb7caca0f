use crate::network::SocketError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PxeError {
    #[error("Socket operation failed")]
    Socket(#[from] SocketError),

    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("Failed to encode DHCP message")]
    Encode(#[from] dhcproto::error::EncodeError),

    #[error("Failed to decode DHCP message")]
    Decode(#[from] dhcproto::error::DecodeError),

    #[error("Malformed DHCP packet: {0}")]
    MalformedOption(String),

    #[error("Offer store is full")]
    CapacityExceeded,

    #[error("Offer carries no usable boot information")]
    NoBootInfo,

    #[error("Offer requires multicast TFTP, which is not supported")]
    UnsupportedOffer,

    #[error("No selectable offer")]
    NoUsableOffer,

    #[error("All BINL candidates exhausted without a valid reply")]
    BinlResolutionFailed,

    #[error("Resolved boot packet carries no boot file name")]
    MissingBootFile,

    #[error("Timed out waiting for a reply")]
    Timeout,

    #[error("Aborted by callback")]
    Aborted,

    #[error("No matching response")]
    NoResponse,

    #[error("ICMP error received during the exchange")]
    IcmpError,

    #[error("Failed to parse MAC address: {0}")]
    MacParse(String),

    #[error("Interface '{0}' not found or has no MAC address")]
    InterfaceInvalid(String),

    #[error("State machine reached a critical failure: {0}")]
    Critical(String),
}

/// Terminal status of a failed boot attempt, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStatus {
    Timeout,
    Aborted,
    NoResponse,
    IcmpError,
}

impl PxeError {
    /// Collapses the detailed error onto the status reported to the caller.
    pub fn status(&self) -> BootStatus {
        match self {
            PxeError::Timeout => BootStatus::Timeout,
            PxeError::IcmpError => BootStatus::IcmpError,
            PxeError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                BootStatus::IcmpError
            }
            PxeError::Io(e) if e.kind() == io::ErrorKind::TimedOut => BootStatus::Timeout,
            PxeError::NoResponse
            | PxeError::BinlResolutionFailed
            | PxeError::MissingBootFile
            | PxeError::MalformedOption(_)
            | PxeError::NoBootInfo
            | PxeError::UnsupportedOffer => BootStatus::NoResponse,
            _ => BootStatus::Aborted,
        }
    }
}

/// Maps a socket error onto the crate error, keeping ICMP-induced failures distinct.
pub(crate) fn map_io_error(err: io::Error) -> PxeError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable => PxeError::IcmpError,
        _ => PxeError::Io(err),
    }
}
