//! Boot service discovery
//!
//! Sends a DHCPREQUEST-shaped discovery to a boot server (port 4011) or to the
//! broadcast address and waits for a matching reply. The same round trip is
//! used to resolve BINL offers, without the boot-item vendor option.

use super::offer::{CachedOffer, OfferKind};
use super::packet::{ParsedPacket, OP_BOOT_REPLY};
use super::store::OfferStore;
use super::vendor::{
    BootItem, VendorOptionSet, DISCOVER_DISABLE_BROADCAST, DISCOVER_DISABLE_MULTICAST,
    DISCOVER_USE_SERVER_LIST, VENDOR_BOOT_SERVERS,
};
use crate::error::PxeError;
use crate::v4::message::{build_boot_request, ClientOptions};
use bytes::Bytes;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Attempts per discovery request.
pub const BOOT_REQUEST_RETRIES: u32 = 4;
/// Timeout of the first attempt; attempt `n` waits `n` times as long.
pub const BOOT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(Ipv4Addr),
    Multicast(Ipv4Addr),
    Broadcast,
}

/// One datagram received in answer to a discovery request.
#[derive(Debug, Clone)]
pub struct BootReply {
    pub source: Ipv4Addr,
    pub packet: Bytes,
}

/// Send/receive primitive used by discovery.
pub trait BootServiceTransport {
    /// Sends `request` and returns every reply received before `timeout`.
    ///
    /// An empty result or `PxeError::Timeout` both mean nothing arrived.
    fn transmit_receive(
        &mut self,
        request: &[u8],
        destination: Destination,
        timeout: Duration,
    ) -> Result<Vec<BootReply>, PxeError>;
}

impl<T: BootServiceTransport + ?Sized> BootServiceTransport for &mut T {
    fn transmit_receive(
        &mut self,
        request: &[u8],
        destination: Destination,
        timeout: Duration,
    ) -> Result<Vec<BootReply>, PxeError> {
        (**self).transmit_receive(request, destination, timeout)
    }
}

/// Acceptable reply source for a boot server type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootServerFilter {
    pub server_type: u16,
    accept_any_response: bool,
    address: Ipv4Addr,
}

impl BootServerFilter {
    /// With `address == None` any reply is accepted.
    pub fn new(server_type: u16, address: Option<Ipv4Addr>) -> Self {
        Self {
            server_type,
            accept_any_response: address.is_none(),
            address: address.unwrap_or(Ipv4Addr::UNSPECIFIED),
        }
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        (!self.accept_any_response).then_some(self.address)
    }

    pub fn accepts_any(&self) -> bool {
        self.accept_any_response
    }
}

/// Where to send a discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverTarget {
    Unicast(Ipv4Addr),
    /// Unicast candidates tried in turn.
    ServerList(Vec<Ipv4Addr>),
    Multicast(Ipv4Addr),
    Broadcast,
}

/// Discovery parameters derived from a PXE10 offer's vendor options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverInfo {
    pub use_multicast: bool,
    pub use_broadcast: bool,
    pub use_unicast: bool,
    pub must_use_list: bool,
    pub multicast_address: Option<Ipv4Addr>,
    pub servers: Vec<BootServerFilter>,
}

impl DiscoverInfo {
    pub fn from_vendor(vendor: &VendorOptionSet, server_type: u16) -> Self {
        let ctrl = vendor.discover_ctrl().unwrap_or(0);
        let multicast_address = vendor.discover_mcast_ip().filter(|ip| !ip.is_unspecified());
        let servers: Vec<_> = vendor
            .boot_servers()
            .filter(|entry| entry.server_type == server_type)
            .flat_map(|entry| entry.addresses)
            .map(|ip| BootServerFilter::new(server_type, Some(ip)))
            .collect();
        let must_use_list = ctrl & DISCOVER_USE_SERVER_LIST != 0;

        Self {
            use_multicast: ctrl & DISCOVER_DISABLE_MULTICAST == 0 && multicast_address.is_some(),
            use_broadcast: ctrl & DISCOVER_DISABLE_BROADCAST == 0,
            use_unicast: vendor.is_set(VENDOR_BOOT_SERVERS) && !servers.is_empty(),
            must_use_list,
            multicast_address,
            servers,
        }
    }

    /// Unicast to the server list, then multicast, then broadcast.
    pub fn target(&self) -> Option<DiscoverTarget> {
        if self.use_unicast {
            let list = self.servers.iter().filter_map(|s| s.address()).collect();
            return Some(DiscoverTarget::ServerList(list));
        }
        match self.multicast_address {
            Some(ip) if self.use_multicast => return Some(DiscoverTarget::Multicast(ip)),
            _ => {}
        }
        self.use_broadcast.then_some(DiscoverTarget::Broadcast)
    }

    /// Reply filters; empty unless the offer restricts replies to listed servers.
    pub fn filters(&self) -> &[BootServerFilter] {
        if self.must_use_list {
            &self.servers
        } else {
            &[]
        }
    }
}

pub struct BootServiceDiscovery<'a, B: BootServiceTransport + ?Sized> {
    transport: &'a mut B,
    options: &'a ClientOptions,
    station_ip: Ipv4Addr,
    retries: u32,
    base_timeout: Duration,
}

impl<'a, B: BootServiceTransport + ?Sized> BootServiceDiscovery<'a, B> {
    pub fn new(transport: &'a mut B, options: &'a ClientOptions, station_ip: Ipv4Addr) -> Self {
        Self {
            transport,
            options,
            station_ip,
            retries: BOOT_REQUEST_RETRIES,
            base_timeout: BOOT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timing(mut self, retries: u32, base_timeout: Duration) -> Self {
        self.retries = retries.max(1);
        self.base_timeout = base_timeout;
        self
    }

    /// Runs one boot service discovery and returns the first matching reply.
    ///
    /// `initial` adds the boot-item vendor option carrying `item`.
    pub fn discover(
        &mut self,
        item: BootItem,
        target: &DiscoverTarget,
        filters: &[BootServerFilter],
        initial: bool,
    ) -> Result<BootReply, PxeError> {
        match target {
            DiscoverTarget::Unicast(ip) => {
                self.exchange(item, Destination::Unicast(*ip), filters, initial)
            }
            DiscoverTarget::Multicast(ip) => {
                self.exchange(item, Destination::Multicast(*ip), filters, initial)
            }
            DiscoverTarget::Broadcast => self.exchange(item, Destination::Broadcast, filters, initial),
            DiscoverTarget::ServerList(list) => {
                let mut last = PxeError::NoResponse;
                for ip in list {
                    match self.exchange(item, Destination::Unicast(*ip), filters, initial) {
                        Ok(reply) => return Ok(reply),
                        Err(
                            e @ (PxeError::Timeout | PxeError::NoResponse | PxeError::IcmpError),
                        ) => {
                            tracing::debug!("boot server {} gave no usable reply: {}", ip, e);
                            last = e;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(last)
            }
        }
    }

    fn exchange(
        &mut self,
        item: BootItem,
        destination: Destination,
        filters: &[BootServerFilter],
        initial: bool,
    ) -> Result<BootReply, PxeError> {
        let xid: u32 = rand::random();
        let mut request = build_boot_request(
            self.options,
            xid,
            self.station_ip,
            destination == Destination::Broadcast,
            initial.then_some(item),
        )?;

        for attempt in 1..=self.retries {
            let timeout = self.base_timeout * attempt;
            let secs = (self.base_timeout * (attempt - 1)).as_secs();
            request[8..10].copy_from_slice(&(secs.min(u16::MAX as u64) as u16).to_be_bytes());

            tracing::debug!(
                "boot request xid={:08x} to {:?}, attempt {}/{}, timeout {:?}",
                xid,
                destination,
                attempt,
                self.retries,
                timeout
            );
            let replies = match self.transport.transmit_receive(&request, destination, timeout) {
                Ok(replies) if !replies.is_empty() => replies,
                Ok(_) | Err(PxeError::Timeout) => {
                    tracing::warn!("no reply to boot request from {:?}", destination);
                    continue;
                }
                Err(e) => return Err(e),
            };

            return Self::match_reply(replies, xid, item.server_type, filters)
                .ok_or(PxeError::NoResponse);
        }

        Err(PxeError::Timeout)
    }

    fn match_reply(
        replies: Vec<BootReply>,
        xid: u32,
        server_type: u16,
        filters: &[BootServerFilter],
    ) -> Option<BootReply> {
        let accept_any = filters.is_empty() || filters.iter().any(BootServerFilter::accepts_any);

        replies.into_iter().find(|reply| {
            let Ok(packet) = ParsedPacket::parse(&reply.packet) else {
                tracing::debug!("ignoring malformed reply from {}", reply.source);
                return false;
            };
            if packet.opcode() != OP_BOOT_REPLY || packet.xid() != xid {
                return false;
            }
            if accept_any {
                return true;
            }
            let server = match packet.siaddr() {
                ip if ip.is_unspecified() => reply.source,
                ip => ip,
            };
            let matched = filters
                .iter()
                .any(|f| f.server_type == server_type && f.address() == Some(server));
            if !matched {
                tracing::debug!("reply from unlisted boot server {}", server);
            }
            matched
        })
    }

    /// Asks the server behind a BINL offer for the boot file.
    ///
    /// The reply is accepted only if it classifies as PXE10 or carries a boot
    /// file name.
    pub fn resolve_binl(&mut self, offer: &CachedOffer) -> Result<CachedOffer, PxeError> {
        let server = offer.packet.boot_server_address().ok_or_else(|| {
            tracing::debug!("BINL offer has neither next-server nor server identifier");
            PxeError::NoResponse
        })?;

        let reply = self.discover(
            BootItem::default(),
            &DiscoverTarget::Unicast(server),
            &[],
            false,
        )?;
        let resolved = CachedOffer::parse(&reply.packet)?;
        if resolved.kind != OfferKind::Pxe10 && !resolved.has_bootfile() {
            tracing::debug!("BINL reply from {} has no discovery options or boot file", server);
            return Err(PxeError::NoResponse);
        }
        Ok(resolved)
    }

    /// Tries each candidate slot in order until one resolves.
    ///
    /// Fails with `IcmpError` when the last candidate was rejected by the
    /// network, otherwise with `BinlResolutionFailed`.
    pub fn resolve_binl_candidates(
        &mut self,
        store: &OfferStore,
        candidates: &[usize],
    ) -> Result<(usize, CachedOffer), PxeError> {
        let mut icmp = false;
        for slot in candidates {
            let Some(offer) = store.get(*slot) else {
                continue;
            };
            match self.resolve_binl(offer) {
                Ok(resolved) => {
                    tracing::info!("BINL offer #{} resolved", slot);
                    return Ok((*slot, resolved));
                }
                Err(e) => {
                    tracing::warn!("BINL offer #{} failed: {}", slot, e);
                    icmp = matches!(e, PxeError::IcmpError);
                }
            }
        }
        if icmp {
            return Err(PxeError::IcmpError);
        }
        Err(PxeError::BinlResolutionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pxe::codec::OptionWriter;
    use crate::pxe::packet::PacketBuilder;
    use crate::pxe::vendor::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Scripted {
        replies: VecDeque<Result<Vec<BootReply>, PxeError>>,
        sent: Vec<(Vec<u8>, Destination, Duration)>,
    }

    impl BootServiceTransport for Scripted {
        fn transmit_receive(
            &mut self,
            request: &[u8],
            destination: Destination,
            timeout: Duration,
        ) -> Result<Vec<BootReply>, PxeError> {
            self.sent.push((request.to_vec(), destination, timeout));
            self.replies.pop_front().unwrap_or(Err(PxeError::Timeout))
        }
    }

    fn options() -> ClientOptions {
        ClientOptions {
            mac_address: Bytes::from_static(&[0, 0x0c, 0x29, 1, 2, 3]),
            architecture: 7,
            undi_major: 3,
            undi_minor: 16,
            uuid: None,
            max_message_size: 1472,
        }
    }

    fn xid_of(request: &[u8]) -> u32 {
        u32::from_be_bytes([request[4], request[5], request[6], request[7]])
    }

    #[test]
    fn test_timeouts_grow_per_attempt() {
        let mut transport = Scripted::default();
        let opts = options();
        let mut discovery = BootServiceDiscovery::new(&mut transport, &opts, Ipv4Addr::new(10, 0, 0, 5));

        let err = discovery
            .discover(
                BootItem::default(),
                &DiscoverTarget::Unicast(Ipv4Addr::new(10, 0, 0, 1)),
                &[],
                false,
            )
            .unwrap_err();
        assert!(matches!(err, PxeError::Timeout));

        let timeouts: Vec<_> = transport.sent.iter().map(|s| s.2.as_secs()).collect();
        assert_eq!(timeouts, vec![1, 2, 3, 4]);
        let secs: Vec<_> = transport
            .sent
            .iter()
            .map(|s| u16::from_be_bytes([s.0[8], s.0[9]]))
            .collect();
        assert_eq!(secs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_filter_rejects_unlisted_server() {
        // The reply is built after the request so its xid can match.
        struct Echo {
            siaddr: Ipv4Addr,
        }
        impl BootServiceTransport for Echo {
            fn transmit_receive(
                &mut self,
                request: &[u8],
                _destination: Destination,
                _timeout: Duration,
            ) -> Result<Vec<BootReply>, PxeError> {
                let packet = PacketBuilder::reply(xid_of(request))
                    .siaddr(self.siaddr)
                    .message_type(5)
                    .bootfile("x")
                    .build();
                Ok(vec![BootReply {
                    source: self.siaddr,
                    packet,
                }])
            }
        }

        let opts = options();
        let filters = [BootServerFilter::new(3, Some(Ipv4Addr::new(10, 0, 0, 1)))];
        let item = BootItem {
            server_type: 3,
            layer: 0,
        };

        let mut wrong = Echo {
            siaddr: Ipv4Addr::new(10, 0, 0, 9),
        };
        let result = BootServiceDiscovery::new(&mut wrong, &opts, Ipv4Addr::new(10, 0, 0, 5))
            .discover(item, &DiscoverTarget::Broadcast, &filters, true);
        assert!(matches!(result, Err(PxeError::NoResponse)));

        let mut right = Echo {
            siaddr: Ipv4Addr::new(10, 0, 0, 1),
        };
        let result = BootServiceDiscovery::new(&mut right, &opts, Ipv4Addr::new(10, 0, 0, 5))
            .discover(item, &DiscoverTarget::Broadcast, &filters, true);
        assert!(result.is_ok());

        let any = [BootServerFilter::new(3, None)];
        let result = BootServiceDiscovery::new(&mut wrong, &opts, Ipv4Addr::new(10, 0, 0, 5))
            .discover(item, &DiscoverTarget::Broadcast, &any, true);
        assert!(result.is_ok());
    }

    #[test]
    fn test_wrong_xid_is_ignored() {
        let mut transport = Scripted::default();
        transport.replies.push_back(Ok(vec![BootReply {
            source: Ipv4Addr::new(10, 0, 0, 1),
            packet: PacketBuilder::reply(0).message_type(5).build(),
        }]));
        let opts = options();
        let result = BootServiceDiscovery::new(&mut transport, &opts, Ipv4Addr::new(10, 0, 0, 5))
            .discover(
                BootItem::default(),
                &DiscoverTarget::Unicast(Ipv4Addr::new(10, 0, 0, 1)),
                &[],
                false,
            );
        // xid 0 is astronomically unlikely to be the random request xid
        assert!(matches!(result, Err(PxeError::NoResponse)));
    }

    #[test]
    fn test_initial_discovery_carries_boot_item() {
        let mut transport = Scripted::default();
        let opts = options();
        let item = BootItem {
            server_type: 0x0c,
            layer: 1,
        };
        let _ = BootServiceDiscovery::new(&mut transport, &opts, Ipv4Addr::new(10, 0, 0, 5))
            .with_timing(1, Duration::from_millis(10))
            .discover(item, &DiscoverTarget::Broadcast, &[], true);

        let (request, destination, _) = &transport.sent[0];
        assert_eq!(*destination, Destination::Broadcast);
        let mut raw = request.clone();
        raw.resize(raw.len().max(300), 0);
        let packet = ParsedPacket::parse(&raw).unwrap();
        assert_eq!(packet.ciaddr(), Ipv4Addr::new(10, 0, 0, 5));
        let vendor = VendorOptionSet::decode(packet.option(crate::pxe::packet::OptionIndex::Vendor).unwrap());
        assert_eq!(vendor.boot_item(), Some(item));
    }

    #[test]
    fn test_discover_info_from_vendor() {
        let mut w = OptionWriter::new();
        w.u8(VENDOR_DISCOVER_CTRL, DISCOVER_DISABLE_BROADCAST | DISCOVER_USE_SERVER_LIST)
            .ipv4(VENDOR_DISCOVER_MCAST, Ipv4Addr::new(224, 0, 2, 1))
            .option(
                VENDOR_BOOT_SERVERS,
                &[0, 5, 1, 10, 0, 0, 1, 0, 6, 1, 10, 0, 0, 2],
            )
            .end();
        let vendor = VendorOptionSet::decode(&crate::pxe::codec::RawOption {
            tag: crate::pxe::codec::TAG_VENDOR,
            data: w.finish(),
        });

        let info = DiscoverInfo::from_vendor(&vendor, 6);
        assert!(!info.use_broadcast);
        assert!(info.use_multicast);
        assert!(info.use_unicast);
        assert_eq!(
            info.target(),
            Some(DiscoverTarget::ServerList(vec![Ipv4Addr::new(10, 0, 0, 2)]))
        );
        assert_eq!(info.filters().len(), 1);

        let plain = DiscoverInfo::from_vendor(&VendorOptionSet::default(), 0);
        assert_eq!(plain.target(), Some(DiscoverTarget::Broadcast));
        assert!(plain.filters().is_empty());
    }

    #[test]
    fn test_boot_server_list_used_without_control_bit() {
        let mut w = OptionWriter::new();
        w.option(VENDOR_BOOT_SERVERS, &[0, 5, 1, 10, 0, 0, 1]).end();
        let vendor = VendorOptionSet::decode(&crate::pxe::codec::RawOption {
            tag: crate::pxe::codec::TAG_VENDOR,
            data: w.finish(),
        });

        let info = DiscoverInfo::from_vendor(&vendor, 5);
        assert_eq!(
            info.target(),
            Some(DiscoverTarget::ServerList(vec![Ipv4Addr::new(10, 0, 0, 1)]))
        );
        // Replies are only verified when bit 2 is set.
        assert!(info.filters().is_empty());

        let other_type = DiscoverInfo::from_vendor(&vendor, 6);
        assert_eq!(other_type.target(), Some(DiscoverTarget::Broadcast));
    }

    /// Boot servers by unicast address: one answers, some fail with ICMP,
    /// the rest stay silent.
    struct Servers {
        answering: Option<Ipv4Addr>,
        unreachable: Vec<Ipv4Addr>,
        sent: Vec<Destination>,
    }

    impl BootServiceTransport for Servers {
        fn transmit_receive(
            &mut self,
            request: &[u8],
            destination: Destination,
            _timeout: Duration,
        ) -> Result<Vec<BootReply>, PxeError> {
            self.sent.push(destination);
            let Destination::Unicast(ip) = destination else {
                return Ok(Vec::new());
            };
            if self.unreachable.contains(&ip) {
                return Err(PxeError::IcmpError);
            }
            if self.answering != Some(ip) {
                return Ok(Vec::new());
            }
            Ok(vec![BootReply {
                source: ip,
                packet: PacketBuilder::reply(xid_of(request))
                    .message_type(5)
                    .bootfile("boot.0")
                    .build(),
            }])
        }
    }

    #[test]
    fn test_server_list_moves_on_to_next_candidate() {
        let first = Ipv4Addr::new(10, 0, 0, 1);
        let second = Ipv4Addr::new(10, 0, 0, 2);
        let mut transport = Servers {
            answering: Some(second),
            unreachable: Vec::new(),
            sent: Vec::new(),
        };
        let opts = options();

        let reply = BootServiceDiscovery::new(&mut transport, &opts, Ipv4Addr::new(10, 0, 0, 5))
            .with_timing(1, Duration::from_millis(10))
            .discover(
                BootItem::default(),
                &DiscoverTarget::ServerList(vec![first, second]),
                &[],
                true,
            )
            .unwrap();

        assert_eq!(reply.source, second);
        assert_eq!(
            transport.sent,
            vec![Destination::Unicast(first), Destination::Unicast(second)]
        );
    }

    #[test]
    fn test_server_list_survives_unreachable_candidate() {
        let first = Ipv4Addr::new(10, 0, 0, 1);
        let second = Ipv4Addr::new(10, 0, 0, 2);
        let opts = options();

        let mut transport = Servers {
            answering: Some(second),
            unreachable: vec![first],
            sent: Vec::new(),
        };
        let reply = BootServiceDiscovery::new(&mut transport, &opts, Ipv4Addr::new(10, 0, 0, 5))
            .with_timing(1, Duration::from_millis(10))
            .discover(
                BootItem::default(),
                &DiscoverTarget::ServerList(vec![first, second]),
                &[],
                true,
            )
            .unwrap();
        assert_eq!(reply.source, second);

        let mut transport = Servers {
            answering: None,
            unreachable: vec![first, second],
            sent: Vec::new(),
        };
        let err = BootServiceDiscovery::new(&mut transport, &opts, Ipv4Addr::new(10, 0, 0, 5))
            .discover(
                BootItem::default(),
                &DiscoverTarget::ServerList(vec![first, second]),
                &[],
                true,
            )
            .unwrap_err();
        assert!(matches!(err, PxeError::IcmpError));
        assert_eq!(transport.sent.len(), 2);
    }

    #[test]
    fn test_unreachable_binl_server_reports_icmp_error() {
        let binl_server = Ipv4Addr::new(10, 0, 1, 1);
        let mut store = OfferStore::default();
        let slot = store
            .accept(
                &PacketBuilder::reply(1)
                    .message_type(2)
                    .siaddr(binl_server)
                    .server_id(binl_server)
                    .class_id("PXEClient")
                    .build(),
            )
            .unwrap()
            .unwrap();
        let opts = options();

        let mut transport = Servers {
            answering: None,
            unreachable: vec![binl_server],
            sent: Vec::new(),
        };
        let err = BootServiceDiscovery::new(&mut transport, &opts, Ipv4Addr::new(10, 0, 0, 5))
            .resolve_binl_candidates(&store, &[slot])
            .unwrap_err();
        assert!(matches!(err, PxeError::IcmpError));
        assert_eq!(err.status(), crate::error::BootStatus::IcmpError);

        let mut transport = Servers {
            answering: None,
            unreachable: Vec::new(),
            sent: Vec::new(),
        };
        let err = BootServiceDiscovery::new(&mut transport, &opts, Ipv4Addr::new(10, 0, 0, 5))
            .with_timing(1, Duration::from_millis(10))
            .resolve_binl_candidates(&store, &[slot])
            .unwrap_err();
        assert!(matches!(err, PxeError::BinlResolutionFailed));
    }
}
