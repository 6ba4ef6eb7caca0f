//! Offer classification

use super::packet::{OptionIndex, ParsedPacket};
use super::vendor::VendorOptionSet;
use crate::error::PxeError;

/// Class identifier prefix advertised by PXE servers and clients.
pub const PXE_CLASS_ID: &[u8; 9] = b"PXEClient";

/// Kind of a received offer, in discovery priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OfferKind {
    /// DHCP/proxy offer with PXE discovery options.
    Pxe10,
    /// DHCP/proxy offer with multicast TFTP options only.
    Wfm11a,
    /// PXE offer without discovery options; needs a BINL round trip.
    Binl,
    /// DHCP offer without PXE extensions.
    DhcpOnly,
    /// BOOTP reply (no DHCP message type).
    Bootp,
}

impl OfferKind {
    pub const COUNT: usize = 5;

    pub const ALL: [OfferKind; Self::COUNT] = [
        OfferKind::Pxe10,
        OfferKind::Wfm11a,
        OfferKind::Binl,
        OfferKind::DhcpOnly,
        OfferKind::Bootp,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// One accepted offer.
#[derive(Debug, Clone)]
pub struct CachedOffer {
    pub packet: ParsedPacket,
    pub is_pxe_offer: bool,
    pub kind: OfferKind,
    pub vendor_options: VendorOptionSet,
}

impl CachedOffer {
    /// Parses and classifies a raw reply.
    pub fn parse(data: &[u8]) -> Result<Self, PxeError> {
        let packet = ParsedPacket::parse(data)?;
        Self::from_packet(packet)
    }

    pub fn from_packet(packet: ParsedPacket) -> Result<Self, PxeError> {
        let is_pxe_offer = is_pxe_class(&packet);
        let vendor_options = match packet.option(OptionIndex::Vendor) {
            Some(vendor) if is_pxe_offer => VendorOptionSet::decode(vendor),
            _ => VendorOptionSet::default(),
        };
        let kind = classify(&packet, is_pxe_offer, &vendor_options)?;
        Ok(Self {
            packet,
            is_pxe_offer,
            kind,
            vendor_options,
        })
    }

    pub fn is_proxy_offer(&self) -> bool {
        self.packet.is_proxy_offer()
    }

    pub fn has_bootfile(&self) -> bool {
        self.packet.has_bootfile()
    }
}

/// Option 60 begins with `"PXEClient"`.
pub fn is_pxe_class(packet: &ParsedPacket) -> bool {
    packet
        .option(OptionIndex::ClassId)
        .is_some_and(|opt| opt.data.starts_with(PXE_CLASS_ID))
}

/// Decides the kind of an offer.
///
/// BOOTP replies without a boot file and offers carrying only multicast TFTP
/// parameters are rejected. Discovery options take precedence over MTFTP
/// options when both are present.
pub fn classify(
    packet: &ParsedPacket,
    is_pxe_offer: bool,
    vendor: &VendorOptionSet,
) -> Result<OfferKind, PxeError> {
    if packet.message_type().is_none() {
        return if packet.has_bootfile() {
            Ok(OfferKind::Bootp)
        } else {
            Err(PxeError::NoBootInfo)
        };
    }

    if is_pxe_offer && vendor.has_discovery_options() {
        Ok(OfferKind::Pxe10)
    } else if is_pxe_offer && vendor.has_mtftp_options() {
        tracing::debug!("discarding WfM11a offer: multicast TFTP is not supported");
        Err(PxeError::UnsupportedOffer)
    } else if is_pxe_offer {
        Ok(OfferKind::Binl)
    } else {
        Ok(OfferKind::DhcpOnly)
    }
}
