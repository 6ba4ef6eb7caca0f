//! PXE offer handling: option codec, packet views, offer classification,
//! caching, selection and boot server discovery.

pub mod codec;
pub mod discover;
pub mod offer;
pub mod packet;
pub mod select;
pub mod store;
pub mod vendor;

pub use offer::{CachedOffer, OfferKind};
pub use packet::ParsedPacket;
pub use select::{SelectionMode, SelectionResult};
pub use store::OfferStore;
