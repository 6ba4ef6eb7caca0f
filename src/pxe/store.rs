//! Bounded collection of the offers received during one discovery attempt
//!
//! Offers are appended in arrival order and indexed per kind so the selector
//! and the BINL resolution can look them up without rescanning.

use super::offer::{CachedOffer, OfferKind};
use crate::error::PxeError;

/// Offer capacity of one discovery attempt.
pub const DEFAULT_OFFER_CAPACITY: usize = 16;

#[derive(Debug)]
pub struct OfferStore {
    capacity: usize,
    offers: Vec<CachedOffer>,
    /// Address-carrying offers per kind, arrival order.
    offer_index: [Vec<usize>; OfferKind::COUNT],
    /// First proxy offer per kind (Binl proxies live in `binl_index`).
    proxy_index: [Option<usize>; OfferKind::COUNT],
    /// Every proxy Binl offer, arrival order.
    binl_index: Vec<usize>,
    bootp_index: Option<usize>,
    got_proxy_offer: bool,
}

impl Default for OfferStore {
    fn default() -> Self {
        Self::new(DEFAULT_OFFER_CAPACITY)
    }
}

impl OfferStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            offers: Vec::with_capacity(capacity),
            offer_index: Default::default(),
            proxy_index: [None; OfferKind::COUNT],
            binl_index: Vec::new(),
            bootp_index: None,
            got_proxy_offer: false,
        }
    }

    /// Parses, classifies and caches one reply.
    ///
    /// Returns the slot of the accepted offer, `Ok(None)` when a "first one
    /// wins" rule discarded it, or the reason it was rejected.
    pub fn accept(&mut self, data: &[u8]) -> Result<Option<usize>, PxeError> {
        if self.is_full() {
            return Err(PxeError::CapacityExceeded);
        }

        let offer = CachedOffer::parse(data)?;
        let slot = self.offers.len();

        match offer.kind {
            OfferKind::Bootp => {
                if self.bootp_index.is_some() {
                    tracing::debug!("discarding extra BOOTP offer");
                    return Ok(None);
                }
                self.bootp_index = Some(slot);
            }
            kind if offer.is_proxy_offer() => {
                self.got_proxy_offer = true;
                if kind == OfferKind::Binl {
                    self.binl_index.push(slot);
                } else if self.proxy_index[kind.index()].is_none() {
                    self.proxy_index[kind.index()] = Some(slot);
                } else {
                    tracing::debug!("discarding extra {:?} proxy offer", kind);
                    return Ok(None);
                }
            }
            kind => {
                debug_assert!(self.offer_index[kind.index()].len() < self.capacity);
                self.offer_index[kind.index()].push(slot);
            }
        }

        tracing::debug!(
            "cached offer #{} kind={:?} proxy={} from {:?}",
            slot,
            offer.kind,
            offer.is_proxy_offer(),
            offer.packet.server_identifier()
        );
        self.offers.push(offer);
        Ok(Some(slot))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.offers.len() >= self.capacity
    }

    pub fn get(&self, slot: usize) -> Option<&CachedOffer> {
        self.offers.get(slot)
    }

    /// Accepted offers in arrival order.
    pub fn offers(&self) -> &[CachedOffer] {
        &self.offers
    }

    /// Number of address-carrying servers seen for `kind`.
    pub fn server_count(&self, kind: OfferKind) -> usize {
        self.offer_index[kind.index()].len()
    }

    /// Slots of address-carrying offers of `kind`, arrival order.
    pub fn offer_index(&self, kind: OfferKind) -> &[usize] {
        &self.offer_index[kind.index()]
    }

    pub fn proxy_index(&self, kind: OfferKind) -> Option<usize> {
        self.proxy_index[kind.index()]
    }

    pub fn binl_index(&self) -> &[usize] {
        &self.binl_index
    }

    pub fn bootp_index(&self) -> Option<usize> {
        self.bootp_index
    }

    pub fn got_proxy_offer(&self) -> bool {
        self.got_proxy_offer
    }
}
