//! PXE boot client
//!
//! This module contains the DHCP transaction controller:
//! - Offer collection while the DHCP transport runs the DORA exchange
//! - Offer selection when the transport asks for it
//! - BINL / proxy resolution and boot server discovery after the lease is bound

use crate::{
    config::ClientConfig,
    error::PxeError,
    pxe::{
        discover::{BootServiceDiscovery, BootServiceTransport, DiscoverInfo},
        offer::{CachedOffer, OfferKind},
        packet::ParsedPacket,
        select::{select, SelectionMode, SelectionResult},
        store::OfferStore,
        vendor::BootItem,
    },
    v4::message::ClientOptions,
};
use bytes::Bytes;
use std::net::Ipv4Addr;

/// Points of the DHCP exchange at which the transport calls back.
#[derive(Debug)]
pub enum DhcpEvent<'a> {
    DiscoverSent(&'a [u8]),
    RequestSent(&'a [u8]),
    OfferReceived(&'a [u8]),
    /// The collection window closed; the handler picks the offer to request.
    SelectOffer,
    AckReceived(&'a [u8]),
}

/// Handler verdict returned to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventResponse {
    Continue,
    /// Keep collecting offers.
    NotReady,
    Abort,
    /// Use this packet instead (the selected offer on `SelectOffer`).
    Replace(Bytes),
}

pub trait DhcpEventHandler {
    fn handle_event(&mut self, event: DhcpEvent<'_>) -> EventResponse;
}

/// Lease obtained by the DHCP transport.
#[derive(Debug, Clone)]
pub struct DhcpBinding {
    pub client_address: Ipv4Addr,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub discover: Bytes,
    pub ack: Bytes,
}

/// DHCP exchange primitive.
///
/// `start` blocks until the lease is bound or the exchange fails, calling the
/// handler inline at every event.
pub trait DhcpTransport {
    fn configure(&mut self, options: ClientOptions) -> Result<(), PxeError>;
    fn start(&mut self, handler: &mut dyn DhcpEventHandler) -> Result<DhcpBinding, PxeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectVerdict {
    Continue,
    Abort,
}

/// Caller hook invoked for every DHCP packet sent or received.
pub trait PacketInspector {
    fn inspect(&mut self, direction: PacketDirection, packet: &[u8]) -> InspectVerdict;
}

impl<F> PacketInspector for F
where
    F: FnMut(PacketDirection, &[u8]) -> InspectVerdict,
{
    fn inspect(&mut self, direction: PacketDirection, packet: &[u8]) -> InspectVerdict {
        self(direction, packet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationAddress {
    pub client_address: Ipv4Addr,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
}

/// What the file transfer needs after a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootTarget {
    pub server_address: Ipv4Addr,
    pub boot_file_name: String,
    pub boot_file_size_hint: Option<u32>,
    pub block_size_hint: u16,
}

#[derive(Debug, Clone)]
pub struct BootSession {
    pub station: StationAddress,
    pub target: BootTarget,
    pub primary_kind: OfferKind,
    pub proxy_kind: Option<OfferKind>,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum PxeState {
    Idle,
    Discovering,
    OfferSelection,
    BinlResolution,
    Bound,
    Failed,
}

/// Offer that supplies the boot file, with the server it came from when the
/// packet itself does not name one.
struct ResolvedProxy {
    offer: CachedOffer,
    server: Option<Ipv4Addr>,
}

impl ResolvedProxy {
    fn cached(offer: &CachedOffer) -> Self {
        Self {
            offer: offer.clone(),
            server: None,
        }
    }
}

/// Per-attempt event handler: owns the offer store for the attempt.
struct OfferCollector<'a> {
    store: OfferStore,
    mode: SelectionMode,
    selection: Option<SelectionResult>,
    no_selectable_offer: bool,
    ack: Option<Bytes>,
    inspector: Option<&'a mut dyn PacketInspector>,
}

impl OfferCollector<'_> {
    fn inspect(&mut self, direction: PacketDirection, packet: &[u8]) -> bool {
        match self.inspector.as_mut() {
            Some(inspector) => inspector.inspect(direction, packet) == InspectVerdict::Continue,
            None => true,
        }
    }
}

impl DhcpEventHandler for OfferCollector<'_> {
    fn handle_event(&mut self, event: DhcpEvent<'_>) -> EventResponse {
        match event {
            DhcpEvent::DiscoverSent(packet) | DhcpEvent::RequestSent(packet) => {
                if !self.inspect(PacketDirection::Sent, packet) {
                    return EventResponse::Abort;
                }
                EventResponse::Continue
            }
            DhcpEvent::OfferReceived(packet) => {
                if !self.inspect(PacketDirection::Received, packet) {
                    return EventResponse::Abort;
                }
                match self.store.accept(packet) {
                    Ok(_) => {}
                    Err(PxeError::CapacityExceeded) => {
                        tracing::debug!("offer store full, dropping offer");
                    }
                    Err(e) => tracing::warn!("discarding offer: {}", e),
                }
                if self.store.is_full() {
                    EventResponse::Continue
                } else {
                    EventResponse::NotReady
                }
            }
            DhcpEvent::SelectOffer => match select(&self.store, self.mode) {
                Ok(selection) => {
                    let Some(offer) = self.store.get(selection.primary) else {
                        return EventResponse::Abort;
                    };
                    tracing::info!(
                        "selected offer #{} ({:?}) of {} cached",
                        selection.primary,
                        offer.kind,
                        self.store.len()
                    );
                    let packet = offer.packet.as_bytes().clone();
                    self.selection = Some(selection);
                    EventResponse::Replace(packet)
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    self.no_selectable_offer = true;
                    EventResponse::Abort
                }
            },
            DhcpEvent::AckReceived(packet) => {
                if !self.inspect(PacketDirection::Received, packet) {
                    return EventResponse::Abort;
                }
                self.ack = Some(Bytes::copy_from_slice(packet));
                EventResponse::Continue
            }
        }
    }
}

pub struct PxeBootClient<D, B> {
    config: ClientConfig,
    options: ClientOptions,
    dhcp: D,
    boot: B,
    inspector: Option<Box<dyn PacketInspector + Send>>,
    state: PxeState,
}

impl<D: DhcpTransport, B: BootServiceTransport> PxeBootClient<D, B> {
    pub fn new(config: ClientConfig, dhcp: D, boot: B) -> Self {
        let options = ClientOptions::from_config(&config);
        Self {
            config,
            options,
            dhcp,
            boot,
            inspector: None,
            state: PxeState::Idle,
        }
    }

    pub fn with_inspector(mut self, inspector: impl PacketInspector + Send + 'static) -> Self {
        self.inspector = Some(Box::new(inspector));
        self
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            PxeState::Idle => "Idle",
            PxeState::Discovering => "Discovering",
            PxeState::OfferSelection => "OfferSelection",
            PxeState::BinlResolution => "BinlResolution",
            PxeState::Bound => "Bound",
            PxeState::Failed => "Failed",
        }
    }

    fn transition(&mut self, state: PxeState) {
        tracing::debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Runs one discovery attempt with a fresh offer store.
    pub fn run(&mut self) -> Result<BootSession, PxeError> {
        match self.attempt() {
            Ok(session) => {
                self.transition(PxeState::Bound);
                tracing::info!(
                    "PXE bind successful: {} boots {} from {}",
                    session.station.client_address,
                    session.target.boot_file_name,
                    session.target.server_address
                );
                Ok(session)
            }
            Err(e) => {
                self.transition(PxeState::Failed);
                tracing::error!("PXE discovery failed ({:?}): {}", e.status(), e);
                Err(e)
            }
        }
    }

    fn attempt(&mut self) -> Result<BootSession, PxeError> {
        self.transition(PxeState::Discovering);
        self.dhcp.configure(self.options.clone())?;

        let mut collector = OfferCollector {
            store: OfferStore::new(self.config.offer_capacity),
            mode: self.config.selection_mode,
            selection: None,
            no_selectable_offer: false,
            ack: None,
            inspector: self
                .inspector
                .as_deref_mut()
                .map(|i| i as &mut dyn PacketInspector),
        };

        let binding = match self.dhcp.start(&mut collector) {
            Ok(binding) => binding,
            Err(PxeError::Aborted) if collector.no_selectable_offer => {
                return Err(PxeError::NoUsableOffer)
            }
            Err(e) => return Err(e),
        };

        let OfferCollector {
            store,
            selection,
            ack,
            ..
        } = collector;
        self.transition(PxeState::OfferSelection);
        let selection = selection.ok_or_else(|| {
            PxeError::Critical("transport bound without an offer selection".to_string())
        })?;
        let ack = ack.unwrap_or_else(|| binding.ack.clone());

        let primary = store
            .get(selection.primary)
            .ok_or_else(|| PxeError::Critical("selected offer is not cached".to_string()))?;
        let proxy = self.resolve_proxy(&store, primary, selection, binding.client_address)?;
        let proxy_kind = proxy.as_ref().map(|p| p.offer.kind);

        let (boot_offer, fallback_server) = match proxy {
            Some(proxy) => (proxy.offer, proxy.server),
            None => match CachedOffer::parse(&ack) {
                Ok(acked) if acked.has_bootfile() || acked.kind == OfferKind::Pxe10 => {
                    (acked, None)
                }
                _ => (primary.clone(), None),
            },
        };
        let target = self.boot_target(boot_offer, fallback_server, binding.client_address)?;

        Ok(BootSession {
            station: StationAddress {
                client_address: binding.client_address,
                subnet_mask: binding.subnet_mask,
                router: binding.router,
            },
            target,
            primary_kind: primary.kind,
            proxy_kind,
        })
    }

    /// Finds the offer that supplies the boot file when the primary does not.
    fn resolve_proxy(
        &mut self,
        store: &OfferStore,
        primary: &CachedOffer,
        selection: SelectionResult,
        station: Ipv4Addr,
    ) -> Result<Option<ResolvedProxy>, PxeError> {
        match primary.kind {
            OfferKind::Binl => self.resolve_binl(store, &[selection.primary], station).map(Some),
            OfferKind::DhcpOnly => match self.config.selection_mode {
                SelectionMode::Sorted => match selection.proxy_kind {
                    Some(OfferKind::Binl) => {
                        self.resolve_binl(store, store.binl_index(), station).map(Some)
                    }
                    Some(kind) => Ok(store
                        .proxy_index(kind)
                        .and_then(|slot| store.get(slot))
                        .map(ResolvedProxy::cached)),
                    None => Ok(None),
                },
                SelectionMode::FirstReceived if store.got_proxy_offer() => {
                    self.first_received_proxy(store, station).map(Some)
                }
                SelectionMode::FirstReceived => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn resolve_binl(
        &mut self,
        store: &OfferStore,
        candidates: &[usize],
        station: Ipv4Addr,
    ) -> Result<ResolvedProxy, PxeError> {
        self.transition(PxeState::BinlResolution);
        let (slot, offer) = BootServiceDiscovery::new(&mut self.boot, &self.options, station)
            .resolve_binl_candidates(store, candidates)?;
        Ok(ResolvedProxy {
            offer,
            server: store
                .get(slot)
                .and_then(|binl| binl.packet.boot_server_address()),
        })
    }

    /// PXE10, then WfM11a, then each BINL proxy, then any other proxy in
    /// arrival order.
    fn first_received_proxy(
        &mut self,
        store: &OfferStore,
        station: Ipv4Addr,
    ) -> Result<ResolvedProxy, PxeError> {
        for kind in [OfferKind::Pxe10, OfferKind::Wfm11a] {
            if let Some(offer) = store.proxy_index(kind).and_then(|slot| store.get(slot)) {
                return Ok(ResolvedProxy::cached(offer));
            }
        }

        if !store.binl_index().is_empty() {
            if let Ok(resolved) = self.resolve_binl(store, store.binl_index(), station) {
                return Ok(resolved);
            }
        }

        store
            .offers()
            .iter()
            .find(|offer| offer.is_proxy_offer() && offer.kind != OfferKind::Binl)
            .map(ResolvedProxy::cached)
            .ok_or(PxeError::BinlResolutionFailed)
    }

    /// Boot server and file from the effective packet, running PXE boot
    /// server discovery first when a PXE10 offer left the file unspecified.
    fn boot_target(
        &mut self,
        offer: CachedOffer,
        fallback_server: Option<Ipv4Addr>,
        station: Ipv4Addr,
    ) -> Result<BootTarget, PxeError> {
        let (packet, fallback_server) = if offer.has_bootfile() || offer.kind != OfferKind::Pxe10 {
            (offer.packet, fallback_server)
        } else {
            let server_type = self
                .config
                .boot_type
                .or_else(|| offer.vendor_options.boot_menu().next().map(|e| e.server_type))
                .unwrap_or(0);
            let info = DiscoverInfo::from_vendor(&offer.vendor_options, server_type);
            let target = info.target().ok_or(PxeError::NoResponse)?;
            tracing::info!("discovering boot server type {} via {:?}", server_type, target);

            let reply = BootServiceDiscovery::new(&mut self.boot, &self.options, station).discover(
                BootItem {
                    server_type,
                    layer: 0,
                },
                &target,
                info.filters(),
                true,
            )?;
            let parsed = ParsedPacket::parse(&reply.packet)?;
            (parsed, Some(reply.source))
        };

        let boot_file_name = packet.boot_file_name().ok_or(PxeError::MissingBootFile)?;
        let server_address = packet
            .boot_server_address()
            .or(fallback_server)
            .ok_or(PxeError::NoResponse)?;

        Ok(BootTarget {
            server_address,
            boot_file_name,
            boot_file_size_hint: packet.boot_file_size_hint(),
            block_size_hint: self.config.block_size,
        })
    }
}
