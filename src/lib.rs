//! # pxeboot - PXE network boot discovery client
//!
//! pxeboot runs the DHCP side of a PXE network boot: it broadcasts a
//! DHCPDISCOVER carrying the PXE client identification, caches and classifies
//! every offer, picks the best one, completes the lease and, when needed,
//! resolves the boot file through BINL servers or PXE boot server discovery.
//! The result is the station address plus the server and file a TFTP
//! transfer should fetch.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pxeboot::network::{UdpBootTransport, UdpChannel};
//! use pxeboot::v4::{DoraTransport, ExchangeTiming};
//! use pxeboot::{ClientConfig, PxeBootClient};
//! use bytes::Bytes;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mac_addr = Bytes::from_static(&[0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4]);
//!     let config = ClientConfig::new("eth0".to_string(), mac_addr);
//!     let channel = UdpChannel::bind(&config.interface, config.client_port)?;
//!     let dhcp = DoraTransport::new(channel.clone(), ExchangeTiming::from_config(&config));
//!     let boot = UdpBootTransport::new(channel, &config);
//!     let session = PxeBootClient::new(config, dhcp, boot).run()?;
//!     println!("Boot {} from {}", session.target.boot_file_name, session.target.server_address);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod pxe;
pub mod v4;

pub use client::{
    BootSession, BootTarget, DhcpBinding, DhcpEvent, DhcpEventHandler, DhcpTransport,
    EventResponse, InspectVerdict, PacketDirection, PacketInspector, PxeBootClient,
    StationAddress,
};
pub use config::{Args, ClientConfig};
pub use error::{BootStatus, PxeError};
