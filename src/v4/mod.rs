//! DHCPv4 protocol implementation
//!
//! This module contains the DHCPv4-specific implementation including:
//! - Request construction with the PXE client identification options
//! - The DORA state machine and its driver

pub mod handler;
pub mod message;


pub use handler::{DhcpV4Handler, DoraTransport, ExchangeTiming};
pub use message::{build_boot_request, build_dhcp_discover, build_dhcp_request, ClientOptions};
