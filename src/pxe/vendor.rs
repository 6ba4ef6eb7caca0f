//! PXE vendor sub-options carried in DHCP option 43
//!
//! A single linear scan records every sub-option tag in a 256-bit "seen"
//! bitmap and decodes the tags this client understands. Variable-length lists
//! (boot servers, boot menu, credential types) are kept as views into the
//! packet buffer and decoded lazily by iterators.

use super::codec::{OptionSpans, OptionWriter, RawOption};
use bytes::Bytes;
use std::net::Ipv4Addr;

pub const VENDOR_MTFTP_IP: u8 = 1;
pub const VENDOR_MTFTP_CPORT: u8 = 2;
pub const VENDOR_MTFTP_SPORT: u8 = 3;
pub const VENDOR_MTFTP_TMOUT: u8 = 4;
pub const VENDOR_MTFTP_DELAY: u8 = 5;
pub const VENDOR_DISCOVER_CTRL: u8 = 6;
pub const VENDOR_DISCOVER_MCAST: u8 = 7;
pub const VENDOR_BOOT_SERVERS: u8 = 8;
pub const VENDOR_BOOT_MENU: u8 = 9;
pub const VENDOR_MENU_PROMPT: u8 = 10;
pub const VENDOR_MCAST_ALLOC: u8 = 11;
pub const VENDOR_CREDENTIAL_TYPES: u8 = 12;
pub const VENDOR_BOOT_ITEM: u8 = 71;

/// Discovery-control bits (sub-option 6).
pub const DISCOVER_DISABLE_BROADCAST: u8 = 0x01;
pub const DISCOVER_DISABLE_MULTICAST: u8 = 0x02;
pub const DISCOVER_USE_SERVER_LIST: u8 = 0x04;

const DISCOVERY_TAGS: [u8; 5] = [
    VENDOR_DISCOVER_CTRL,
    VENDOR_DISCOVER_MCAST,
    VENDOR_BOOT_SERVERS,
    VENDOR_BOOT_MENU,
    VENDOR_MENU_PROMPT,
];

const MTFTP_TAGS: [u8; 5] = [
    VENDOR_MTFTP_IP,
    VENDOR_MTFTP_CPORT,
    VENDOR_MTFTP_SPORT,
    VENDOR_MTFTP_TMOUT,
    VENDOR_MTFTP_DELAY,
];

/// Boot server type and layer requested by, or echoed to, the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootItem {
    pub server_type: u16,
    pub layer: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastAlloc {
    pub base: Ipv4Addr,
    pub block: u16,
    pub range: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuPrompt {
    pub timeout: u8,
    pub prompt: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootServerEntry {
    pub server_type: u16,
    pub addresses: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootMenuEntry {
    pub server_type: u16,
    pub description: Bytes,
}

impl BootMenuEntry {
    pub fn description_lossy(&self) -> String {
        String::from_utf8_lossy(&self.description).into_owned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorOptionSet {
    bitmap: [u32; 8],
    mtftp_ip: Option<Ipv4Addr>,
    mtftp_client_port: Option<u16>,
    mtftp_server_port: Option<u16>,
    mtftp_timeout: Option<u8>,
    mtftp_delay: Option<u8>,
    discover_ctrl: Option<u8>,
    discover_mcast_ip: Option<Ipv4Addr>,
    boot_servers: Option<Bytes>,
    boot_menu: Option<Bytes>,
    menu_prompt: Option<MenuPrompt>,
    mcast_alloc: Option<MulticastAlloc>,
    credential_types: Option<Bytes>,
    boot_item: Option<BootItem>,
}

fn ipv4(data: &[u8]) -> Option<Ipv4Addr> {
    (data.len() >= 4).then(|| Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn be16(data: &[u8]) -> Option<u16> {
    (data.len() >= 2).then(|| u16::from_be_bytes([data[0], data[1]]))
}

impl VendorOptionSet {
    /// Decodes the payload of a vendor option.
    pub fn decode(vendor: &RawOption) -> Self {
        let mut set = Self::default();
        let buf = &vendor.data;

        for span in OptionSpans::new(buf) {
            set.mark(span.tag);
            let data = buf.slice(span.start..span.start + span.len);
            match span.tag {
                VENDOR_MTFTP_IP => set.mtftp_ip = ipv4(&data),
                VENDOR_MTFTP_CPORT => set.mtftp_client_port = be16(&data),
                VENDOR_MTFTP_SPORT => set.mtftp_server_port = be16(&data),
                VENDOR_MTFTP_TMOUT => set.mtftp_timeout = data.first().copied(),
                VENDOR_MTFTP_DELAY => set.mtftp_delay = data.first().copied(),
                VENDOR_DISCOVER_CTRL => set.discover_ctrl = data.first().copied(),
                VENDOR_DISCOVER_MCAST => set.discover_mcast_ip = ipv4(&data),
                VENDOR_BOOT_SERVERS => set.boot_servers = Some(data),
                VENDOR_BOOT_MENU => set.boot_menu = Some(data),
                VENDOR_MENU_PROMPT => {
                    set.menu_prompt = data.first().map(|timeout| MenuPrompt {
                        timeout: *timeout,
                        prompt: data.slice(1..),
                    })
                }
                VENDOR_MCAST_ALLOC => {
                    set.mcast_alloc = (data.len() >= 8).then(|| MulticastAlloc {
                        base: Ipv4Addr::new(data[0], data[1], data[2], data[3]),
                        block: u16::from_be_bytes([data[4], data[5]]),
                        range: u16::from_be_bytes([data[6], data[7]]),
                    })
                }
                VENDOR_CREDENTIAL_TYPES => set.credential_types = Some(data),
                VENDOR_BOOT_ITEM => {
                    set.boot_item = (data.len() >= 4).then(|| BootItem {
                        server_type: u16::from_be_bytes([data[0], data[1]]),
                        layer: u16::from_be_bytes([data[2], data[3]]),
                    })
                }
                other => tracing::trace!("ignoring vendor sub-option {}", other),
            }
        }

        set
    }

    fn mark(&mut self, tag: u8) {
        self.bitmap[(tag / 32) as usize] |= 1 << (tag % 32);
    }

    /// Whether sub-option `tag` appeared, understood or not.
    pub fn is_set(&self, tag: u8) -> bool {
        self.bitmap[(tag / 32) as usize] & (1 << (tag % 32)) != 0
    }

    pub fn bitmap(&self) -> &[u32; 8] {
        &self.bitmap
    }

    /// Any of discovery control, discovery multicast, boot servers, boot menu
    /// or menu prompt were offered.
    pub fn has_discovery_options(&self) -> bool {
        DISCOVERY_TAGS.iter().any(|tag| self.is_set(*tag))
    }

    /// Every multicast TFTP parameter was offered.
    pub fn has_mtftp_options(&self) -> bool {
        MTFTP_TAGS.iter().all(|tag| self.is_set(*tag))
    }

    pub fn mtftp_ip(&self) -> Option<Ipv4Addr> {
        self.mtftp_ip
    }

    pub fn mtftp_client_port(&self) -> Option<u16> {
        self.mtftp_client_port
    }

    pub fn mtftp_server_port(&self) -> Option<u16> {
        self.mtftp_server_port
    }

    pub fn mtftp_timeout(&self) -> Option<u8> {
        self.mtftp_timeout
    }

    pub fn mtftp_delay(&self) -> Option<u8> {
        self.mtftp_delay
    }

    pub fn discover_ctrl(&self) -> Option<u8> {
        self.discover_ctrl
    }

    pub fn discover_mcast_ip(&self) -> Option<Ipv4Addr> {
        self.discover_mcast_ip
    }

    pub fn menu_prompt(&self) -> Option<&MenuPrompt> {
        self.menu_prompt.as_ref()
    }

    pub fn mcast_alloc(&self) -> Option<MulticastAlloc> {
        self.mcast_alloc
    }

    pub fn boot_item(&self) -> Option<BootItem> {
        self.boot_item
    }

    pub fn boot_servers(&self) -> BootServers<'_> {
        BootServers {
            data: self.boot_servers.as_deref().unwrap_or_default(),
        }
    }

    pub fn boot_menu(&self) -> BootMenu {
        BootMenu {
            data: self.boot_menu.clone().unwrap_or_default(),
        }
    }

    pub fn credential_types(&self) -> impl Iterator<Item = u32> + '_ {
        self.credential_types
            .as_deref()
            .unwrap_or_default()
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
    }
}

/// Iterator over `{type, ip-count, ip[]}` boot server entries.
pub struct BootServers<'a> {
    data: &'a [u8],
}

impl Iterator for BootServers<'_> {
    type Item = BootServerEntry;

    fn next(&mut self) -> Option<BootServerEntry> {
        if self.data.len() < 3 {
            return None;
        }
        let server_type = u16::from_be_bytes([self.data[0], self.data[1]]);
        let count = self.data[2] as usize;
        let end = 3 + count * 4;
        if end > self.data.len() {
            self.data = &[];
            return None;
        }
        let addresses = self.data[3..end]
            .chunks_exact(4)
            .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
            .collect();
        self.data = &self.data[end..];
        Some(BootServerEntry {
            server_type,
            addresses,
        })
    }
}

/// Iterator over `{type, description-length, description}` boot menu entries.
pub struct BootMenu {
    data: Bytes,
}

impl Iterator for BootMenu {
    type Item = BootMenuEntry;

    fn next(&mut self) -> Option<BootMenuEntry> {
        if self.data.len() < 3 {
            return None;
        }
        let server_type = u16::from_be_bytes([self.data[0], self.data[1]]);
        let end = 3 + self.data[2] as usize;
        if end > self.data.len() {
            self.data.clear();
            return None;
        }
        let description = self.data.slice(3..end);
        self.data = self.data.slice(end..);
        Some(BootMenuEntry {
            server_type,
            description,
        })
    }
}

/// Vendor option payload carrying only the boot-item sub-option.
pub fn encode_boot_item(item: BootItem) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&item.server_type.to_be_bytes());
    payload.extend_from_slice(&item.layer.to_be_bytes());

    let mut w = OptionWriter::new();
    w.option(VENDOR_BOOT_ITEM, &payload).end();
    w.finish().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pxe::codec::TAG_VENDOR;

    fn vendor(build: impl FnOnce(&mut OptionWriter)) -> RawOption {
        let mut w = OptionWriter::new();
        build(&mut w);
        w.end();
        RawOption {
            tag: TAG_VENDOR,
            data: w.finish(),
        }
    }

    #[test]
    fn test_boot_menu_sets_discovery_bit() {
        let opt = vendor(|w| {
            w.option(VENDOR_BOOT_MENU, &[0x80, 0x00, 4, b'B', b'o', b'o', b't']);
        });
        let set = VendorOptionSet::decode(&opt);

        assert!(set.is_set(VENDOR_BOOT_MENU));
        assert!(set.has_discovery_options());
        assert!(!set.has_mtftp_options());

        let entries: Vec<_> = set.boot_menu().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].server_type, 0x8000);
        assert_eq!(entries[0].description_lossy(), "Boot");
    }

    #[test]
    fn test_mtftp_bits_require_all_five() {
        let opt = vendor(|w| {
            w.ipv4(VENDOR_MTFTP_IP, Ipv4Addr::new(224, 1, 1, 1))
                .u16(VENDOR_MTFTP_CPORT, 1758)
                .u16(VENDOR_MTFTP_SPORT, 1759)
                .u8(VENDOR_MTFTP_TMOUT, 1);
        });
        assert!(!VendorOptionSet::decode(&opt).has_mtftp_options());

        let opt = vendor(|w| {
            w.ipv4(VENDOR_MTFTP_IP, Ipv4Addr::new(224, 1, 1, 1))
                .u16(VENDOR_MTFTP_CPORT, 1758)
                .u16(VENDOR_MTFTP_SPORT, 1759)
                .u8(VENDOR_MTFTP_TMOUT, 1)
                .u8(VENDOR_MTFTP_DELAY, 2);
        });
        let set = VendorOptionSet::decode(&opt);
        assert!(set.has_mtftp_options());
        assert!(!set.has_discovery_options());
        assert_eq!(set.mtftp_client_port(), Some(1758));
        assert_eq!(set.mtftp_delay(), Some(2));
    }

    #[test]
    fn test_unknown_tag_only_sets_bit() {
        let opt = vendor(|w| {
            w.option(200, b"whatever");
        });
        let set = VendorOptionSet::decode(&opt);

        assert!(set.is_set(200));
        assert_eq!(set.bitmap()[200 / 32], 1 << (200 % 32));
        assert_eq!(set.discover_ctrl(), None);
    }

    #[test]
    fn test_boot_servers_and_discovery_control() {
        let opt = vendor(|w| {
            w.u8(VENDOR_DISCOVER_CTRL, DISCOVER_DISABLE_BROADCAST | DISCOVER_USE_SERVER_LIST)
                .option(
                    VENDOR_BOOT_SERVERS,
                    &[0x00, 0x01, 2, 10, 0, 0, 1, 10, 0, 0, 2, 0x00, 0x02, 1, 10, 0, 0, 3],
                );
        });
        let set = VendorOptionSet::decode(&opt);

        assert_eq!(
            set.discover_ctrl(),
            Some(DISCOVER_DISABLE_BROADCAST | DISCOVER_USE_SERVER_LIST)
        );
        let servers: Vec<_> = set.boot_servers().collect();
        assert_eq!(servers.len(), 2);
        assert_eq!(
            servers[0].addresses,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
        assert_eq!(servers[1].server_type, 2);
    }

    #[test]
    fn test_truncated_boot_server_list_stops() {
        let opt = vendor(|w| {
            w.option(VENDOR_BOOT_SERVERS, &[0x00, 0x01, 3, 10, 0, 0, 1]);
        });
        assert_eq!(VendorOptionSet::decode(&opt).boot_servers().count(), 0);
    }

    #[test]
    fn test_menu_prompt_and_credentials() {
        let opt = vendor(|w| {
            w.option(VENDOR_MENU_PROMPT, b"\x05Press F8")
                .option(VENDOR_CREDENTIAL_TYPES, &[0, 0, 0, 1, 0, 0, 0, 2]);
        });
        let set = VendorOptionSet::decode(&opt);

        let prompt = set.menu_prompt().unwrap();
        assert_eq!(prompt.timeout, 5);
        assert_eq!(&prompt.prompt[..], b"Press F8");
        assert_eq!(set.credential_types().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_boot_item_encoding_decodes_back() {
        let item = BootItem {
            server_type: 0x8001,
            layer: 3,
        };
        let opt = RawOption {
            tag: TAG_VENDOR,
            data: Bytes::from(encode_boot_item(item)),
        };
        assert_eq!(VendorOptionSet::decode(&opt).boot_item(), Some(item));
    }
}
