//! Sockets bound to the boot interface and the UDP transports built on them

mod transport;

pub use transport::{UdpBootTransport, UdpChannel};

/// DHCP transport running the DORA state machine over the interface socket.
pub type UdpDhcpTransport = crate::v4::DoraTransport<UdpChannel>;

use crate::error::PxeError;
use bytes::{BufMut, Bytes, BytesMut};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket},
};
use thiserror::Error;
use tokio::net::UdpSocket as TokioUdpSocket;

/// Defines all possible errors for socket operations.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Failed to create a new socket")]
    CreateSocket(#[source] io::Error),

    #[error("Failed to enable broadcast on socket")]
    SetBroadcast(#[source] io::Error),

    #[error("Failed to set SO_BINDTODEVICE on interface '{interface}'")]
    BindToDevice {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind socket to address")]
    BindSocket(#[source] io::Error),

    #[error("Failed to set SO_REUSEADDR on socket")]
    SetReuseAddress(#[source] io::Error),

    #[error("Failed to set socket to non-blocking mode")]
    SetNonBlocking(#[source] io::Error),

    #[error("Failed to configure multicast sending")]
    SetMulticast(#[source] io::Error),

    #[error("Failed to convert socket to TokioUdpSocket")]
    ConvertToTokio(#[source] io::Error),

    #[allow(dead_code)]
    #[error("Binding to a specific device is not implemented on this platform")]
    NotImplemented,
}

/// Creates a `tokio::net::UdpSocket` pinned to `interface` and bound to `port`.
///
/// The socket can send DHCP broadcasts and multicast boot server discovery.
/// `SO_BINDTODEVICE` keeps multicast traffic on the pinned interface.
#[cfg(target_os = "linux")]
pub fn new_tokio_socket_bound_to_device(
    interface: &str,
    port: u16,
) -> Result<TokioUdpSocket, SocketError> {
    use socket2::{Domain, Socket, Type};
    use std::os::fd::AsRawFd;

    // Create a socket2 socket, which allows setting options before binding.
    let socket2 =
        Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(SocketError::CreateSocket)?;

    // Set `SO_BROADCAST`. This is required for sending broadcast messages.
    socket2
        .set_broadcast(true)
        .map_err(SocketError::SetBroadcast)?;

    // Set `SO_REUSEADDR`. Allows binding to an address that is already in use.
    socket2
        .set_reuse_address(true)
        .map_err(SocketError::SetReuseAddress)?;

    // Discovery multicast stays on the local segment and is not looped back.
    socket2
        .set_multicast_ttl_v4(1)
        .and_then(|()| socket2.set_multicast_loop_v4(false))
        .map_err(SocketError::SetMulticast)?;

    // Set `SO_BINDTODEVICE`. This is an unsafe raw syscall.
    // It is safe here because we use a valid file descriptor and correct parameters.
    let ret = unsafe {
        libc::setsockopt(
            socket2.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SocketError::BindToDevice {
            interface: interface.to_string(),
            source: io::Error::last_os_error(),
        });
    }

    // Bind the socket to the address and port.
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket2.bind(&addr.into()).map_err(SocketError::BindSocket)?;

    // Convert to a standard socket, then into a Tokio socket.
    let std_socket: StdUdpSocket = socket2.into();
    std_socket
        .set_nonblocking(true)
        .map_err(SocketError::SetNonBlocking)?;
    TokioUdpSocket::from_std(std_socket).map_err(SocketError::ConvertToTokio)
}

/// Fallback for non-Linux systems where `SO_BINDTODEVICE` is not available.
#[cfg(not(target_os = "linux"))]
pub fn new_tokio_socket_bound_to_device(
    _interface: &str,
    _port: u16,
) -> Result<TokioUdpSocket, SocketError> {
    Err(SocketError::NotImplemented)
}
/// Parses a MAC address string (e.g., "0a:1b:2c:3d:4e:5f") into a `Bytes` object.
pub fn parse_mac_address(mac_str: &str) -> Result<Bytes, PxeError> {
    let mut bytes = BytesMut::new();
    for byte_str in mac_str.split(':') {
        if !byte_str.is_empty() {
            let byte = u8::from_str_radix(byte_str, 16)
                .map_err(|e| PxeError::MacParse(format!("{mac_str}: {e}")))?;
            bytes.put_u8(byte);
        }
    }
    if bytes.is_empty() || bytes.len() > 16 {
        return Err(PxeError::MacParse(mac_str.to_string()));
    }
    Ok(bytes.freeze())
}

/// Reads the hardware (MAC) address of `interface` from sysfs.
pub fn interface_mac_address(interface: &str) -> Result<Bytes, PxeError> {
    let mac_path = format!("/sys/class/net/{interface}/address");
    let mac_str = std::fs::read_to_string(&mac_path)
        .map_err(|_| PxeError::InterfaceInvalid(interface.to_string()))?;
    parse_mac_address(mac_str.trim())
}
