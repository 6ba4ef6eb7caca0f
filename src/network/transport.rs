use super::new_tokio_socket_bound_to_device;
use crate::{
    config::ClientConfig,
    error::{map_io_error, PxeError},
    pxe::discover::{BootReply, BootServiceTransport, Destination},
    v4::handler::Datagram,
};
use bytes::Bytes;
use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    runtime::{Builder, Runtime},
    time,
};

const RECV_BUFFER_LEN: usize = 1500;

/// UDP socket on the boot interface plus the runtime that drives it.
///
/// The PXE client is synchronous; every socket operation is a short
/// `block_on` on a current-thread runtime owned by the channel.
#[derive(Clone)]
pub struct UdpChannel {
    runtime: Arc<Runtime>,
    socket: Arc<UdpSocket>,
}

impl UdpChannel {
    pub fn bind(interface: &str, port: u16) -> Result<Self, PxeError> {
        let runtime = Arc::new(Builder::new_current_thread().enable_all().build()?);
        // Registering the socket needs a reactor.
        let socket = {
            let _guard = runtime.enter();
            new_tokio_socket_bound_to_device(interface, port)?
        };
        tracing::debug!("Socket bound to {} port {}", interface, port);

        Ok(Self {
            runtime,
            socket: Arc::new(socket),
        })
    }

    fn recv_within(&self, timeout: Duration) -> Result<Option<(Vec<u8>, SocketAddr)>, PxeError> {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let received = self
            .runtime
            .block_on(async { time::timeout(timeout, self.socket.recv_from(&mut buf)).await });
        match received {
            Ok(Ok((len, addr))) => {
                tracing::trace!("Received {} bytes from {}", len, addr);
                Ok(Some((buf[..len].to_vec(), addr)))
            }
            Ok(Err(e)) => {
                tracing::error!("Socket receive error: {}", e);
                Err(map_io_error(e))
            }
            Err(_) => Ok(None),
        }
    }

    /// Datagrams already queued on the socket, without waiting.
    fn drain(&self) -> Result<Vec<(Vec<u8>, SocketAddr)>, PxeError> {
        let mut drained = Vec::new();
        let mut buf = [0u8; RECV_BUFFER_LEN];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, addr)) => drained.push((buf[..len].to_vec(), addr)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(drained),
                Err(e) => return Err(map_io_error(e)),
            }
        }
    }
}

impl Datagram for UdpChannel {
    fn send_to(&mut self, packet: &[u8], destination: SocketAddr) -> Result<(), PxeError> {
        let sent = self
            .runtime
            .block_on(self.socket.send_to(packet, destination))
            .map_err(map_io_error)?;
        tracing::debug!("Sent {} bytes to {}", sent, destination);
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, PxeError> {
        Ok(self.recv_within(timeout)?.map(|(data, _)| data))
    }
}

/// Boot service discovery over UDP: port 4011 for unicast and multicast,
/// the DHCP server port for broadcast.
pub struct UdpBootTransport {
    channel: UdpChannel,
    broadcast_address: Ipv4Addr,
    server_port: u16,
    boot_server_port: u16,
}

impl UdpBootTransport {
    pub fn new(channel: UdpChannel, config: &ClientConfig) -> Self {
        Self {
            channel,
            broadcast_address: config.broadcast_address,
            server_port: config.server_port,
            boot_server_port: config.boot_server_port,
        }
    }

    fn address_of(&self, destination: Destination) -> SocketAddr {
        match destination {
            Destination::Unicast(ip) | Destination::Multicast(ip) => {
                SocketAddr::from((ip, self.boot_server_port))
            }
            Destination::Broadcast => SocketAddr::from((self.broadcast_address, self.server_port)),
        }
    }
}

impl BootServiceTransport for UdpBootTransport {
    fn transmit_receive(
        &mut self,
        request: &[u8],
        destination: Destination,
        timeout: Duration,
    ) -> Result<Vec<BootReply>, PxeError> {
        let addr = self.address_of(destination);
        self.channel.send_to(request, addr)?;

        let Some(first) = self.channel.recv_within(timeout)? else {
            return Ok(Vec::new());
        };
        let mut replies = vec![first];
        replies.extend(self.channel.drain()?);

        Ok(replies
            .into_iter()
            .filter_map(|(data, source)| match source {
                SocketAddr::V4(v4) => Some(BootReply {
                    source: *v4.ip(),
                    packet: Bytes::from(data),
                }),
                SocketAddr::V6(_) => None,
            })
            .collect())
    }
}
