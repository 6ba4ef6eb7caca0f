//! Offer selection
//!
//! Picks the offer used to finish the DHCP exchange and, when that offer is a
//! plain DHCP lease, the kind of proxy offer that supplies the boot file.

use super::offer::OfferKind;
use super::store::OfferStore;
use crate::error::PxeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Rank offers by discovery priority.
    #[default]
    Sorted,
    /// Take the first usable offer in arrival order.
    FirstReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionResult {
    /// Slot of the primary offer in the store.
    pub primary: usize,
    /// Proxy kind that must supply the boot file; only set in sorted mode for
    /// a plain DHCP primary.
    pub proxy_kind: Option<OfferKind>,
}

impl SelectionResult {
    fn primary(primary: usize) -> Self {
        Self {
            primary,
            proxy_kind: None,
        }
    }

    fn paired(primary: usize, proxy_kind: OfferKind) -> Self {
        Self {
            primary,
            proxy_kind: Some(proxy_kind),
        }
    }
}

pub fn select(store: &OfferStore, mode: SelectionMode) -> Result<SelectionResult, PxeError> {
    match mode {
        SelectionMode::Sorted => select_sorted(store),
        SelectionMode::FirstReceived => select_first_received(store),
    }
}

/// Priority order: PXE10, WfM11a, DHCP + proxy PXE10, DHCP + proxy WfM11a,
/// BINL, DHCP + proxy BINL, DHCP with boot file, BOOTP.
pub fn select_sorted(store: &OfferStore) -> Result<SelectionResult, PxeError> {
    let first = |kind| store.offer_index(kind).first().copied();
    let dhcp_only = first(OfferKind::DhcpOnly);

    if let Some(slot) = first(OfferKind::Pxe10) {
        return Ok(SelectionResult::primary(slot));
    }
    if let Some(slot) = first(OfferKind::Wfm11a) {
        return Ok(SelectionResult::primary(slot));
    }
    if let Some(slot) = dhcp_only {
        if store.proxy_index(OfferKind::Pxe10).is_some() {
            return Ok(SelectionResult::paired(slot, OfferKind::Pxe10));
        }
        if store.proxy_index(OfferKind::Wfm11a).is_some() {
            return Ok(SelectionResult::paired(slot, OfferKind::Wfm11a));
        }
    }
    if let Some(slot) = first(OfferKind::Binl) {
        return Ok(SelectionResult::primary(slot));
    }
    if let Some(slot) = dhcp_only {
        if !store.binl_index().is_empty() {
            return Ok(SelectionResult::paired(slot, OfferKind::Binl));
        }
    }

    let with_bootfile = store
        .offer_index(OfferKind::DhcpOnly)
        .iter()
        .copied()
        .find(|slot| store.get(*slot).is_some_and(|offer| offer.has_bootfile()));
    with_bootfile
        .or(store.bootp_index())
        .map(SelectionResult::primary)
        .ok_or(PxeError::NoUsableOffer)
}

/// First address-carrying offer in arrival order, skipping plain DHCP offers
/// that have no boot file when no proxy offer was received.
pub fn select_first_received(store: &OfferStore) -> Result<SelectionResult, PxeError> {
    store
        .offers()
        .iter()
        .enumerate()
        .filter(|(_, offer)| !offer.is_proxy_offer())
        .find(|(_, offer)| {
            offer.kind != OfferKind::DhcpOnly || store.got_proxy_offer() || offer.has_bootfile()
        })
        .map(|(slot, _)| SelectionResult::primary(slot))
        .ok_or(PxeError::NoUsableOffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pxe::codec::OptionWriter;
    use crate::pxe::packet::PacketBuilder;
    use crate::pxe::vendor::VENDOR_BOOT_MENU;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    fn leased() -> PacketBuilder {
        PacketBuilder::reply(1)
            .yiaddr(Ipv4Addr::new(10, 0, 0, 100))
            .message_type(2)
    }

    fn proxy() -> PacketBuilder {
        PacketBuilder::reply(1).message_type(2)
    }

    fn pxe10(builder: PacketBuilder) -> Bytes {
        let mut w = OptionWriter::new();
        w.option(VENDOR_BOOT_MENU, &[0, 1, 0]).end();
        builder.class_id("PXEClient").vendor(&w.finish()).build()
    }

    fn binl(builder: PacketBuilder) -> Bytes {
        builder.class_id("PXEClient").build()
    }

    fn store_of(packets: &[Bytes]) -> OfferStore {
        let mut store = OfferStore::default();
        for packet in packets {
            store.accept(packet).unwrap();
        }
        store
    }

    #[test]
    fn test_pxe10_beats_binl_in_either_order() {
        let store = store_of(&[binl(leased()), pxe10(leased())]);
        let selected = select_sorted(&store).unwrap();
        assert_eq!(store.get(selected.primary).unwrap().kind, OfferKind::Pxe10);

        let store = store_of(&[pxe10(leased()), binl(leased())]);
        let selected = select_sorted(&store).unwrap();
        assert_eq!(store.get(selected.primary).unwrap().kind, OfferKind::Pxe10);
    }

    #[test]
    fn test_dhcp_paired_with_proxy_pxe10_beats_binl() {
        let store = store_of(&[binl(leased()), leased().build(), pxe10(proxy())]);
        let selected = select_sorted(&store).unwrap();

        assert_eq!(selected.primary, 1);
        assert_eq!(selected.proxy_kind, Some(OfferKind::Pxe10));
    }

    #[test]
    fn test_dhcp_paired_with_proxy_binl() {
        let store = store_of(&[leased().build(), binl(proxy()), binl(proxy())]);
        let selected = select_sorted(&store).unwrap();

        assert_eq!(selected.primary, 0);
        assert_eq!(selected.proxy_kind, Some(OfferKind::Binl));
    }

    #[test]
    fn test_dhcp_with_bootfile_then_bootp() {
        let store = store_of(&[
            PacketBuilder::reply(1)
                .yiaddr(Ipv4Addr::new(10, 0, 0, 7))
                .file(b"legacy")
                .build(),
            leased().build(),
            leased().bootfile("pxelinux.0").build(),
        ]);
        assert_eq!(select_sorted(&store).unwrap(), SelectionResult::primary(2));

        let store = store_of(&[
            leased().build(),
            PacketBuilder::reply(1)
                .yiaddr(Ipv4Addr::new(10, 0, 0, 7))
                .file(b"legacy")
                .build(),
        ]);
        assert_eq!(select_sorted(&store).unwrap(), SelectionResult::primary(1));
    }

    #[test]
    fn test_nothing_selectable() {
        let store = store_of(&[leased().build()]);
        assert!(matches!(select_sorted(&store), Err(PxeError::NoUsableOffer)));
        assert!(matches!(
            select_first_received(&store),
            Err(PxeError::NoUsableOffer)
        ));
    }

    #[test]
    fn test_first_received_skips_dhcp_without_bootfile() {
        let store = store_of(&[
            binl(proxy()),
            leased().build(),
            leased().bootfile("x").build(),
        ]);
        // A proxy arrived, so the bare DHCP offer is usable.
        assert_eq!(select_first_received(&store).unwrap().primary, 1);

        let store = store_of(&[leased().build(), leased().bootfile("x").build()]);
        assert_eq!(select_first_received(&store).unwrap().primary, 1);
    }

    #[test]
    fn test_first_received_takes_arrival_order_over_priority() {
        let store = store_of(&[binl(leased()), leased().build(), pxe10(leased())]);
        let selected = select_first_received(&store).unwrap();

        assert_eq!(selected.primary, 0);
        assert_eq!(selected.proxy_kind, None);
    }
}
