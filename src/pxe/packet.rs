//! Parsed view over one received BOOTP/DHCP packet
//!
//! The packet is copied once into an owned buffer, the interesting options are
//! located, and the buffer is frozen. Every option handed out afterwards is a
//! `Bytes` slice of that buffer, so views stay valid for as long as any of
//! them (or the packet) is alive.

use super::codec::{
    self, OptionSpan, OptionWriter, RawOption, OVERLOAD_FILE, TAG_BOOTFILE, TAG_BOOTFILE_LEN,
    TAG_CLASS_ID, TAG_END, TAG_MSG_TYPE, TAG_OVERLOAD, TAG_SERVER_ID, TAG_VENDOR,
};
use crate::error::PxeError;
use bytes::{Bytes, BytesMut};
use std::net::Ipv4Addr;

pub const BOOTP_HEADER_LEN: usize = 236;
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
pub const OPTIONS_OFFSET: usize = BOOTP_HEADER_LEN + MAGIC_COOKIE.len();

pub const OP_BOOT_REPLY: u8 = 2;

const CHADDR: std::ops::Range<usize> = 28..44;
const SNAME: std::ops::Range<usize> = 44..108;
const FILE: std::ops::Range<usize> = 108..236;

/// Options looked up eagerly when a packet is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionIndex {
    BootfileLen,
    Vendor,
    Overload,
    MsgType,
    ServerId,
    ClassId,
    Bootfile,
}

impl OptionIndex {
    pub const COUNT: usize = 7;

    const ALL: [OptionIndex; Self::COUNT] = [
        OptionIndex::BootfileLen,
        OptionIndex::Vendor,
        OptionIndex::Overload,
        OptionIndex::MsgType,
        OptionIndex::ServerId,
        OptionIndex::ClassId,
        OptionIndex::Bootfile,
    ];

    pub fn tag(self) -> u8 {
        match self {
            OptionIndex::BootfileLen => TAG_BOOTFILE_LEN,
            OptionIndex::Vendor => TAG_VENDOR,
            OptionIndex::Overload => TAG_OVERLOAD,
            OptionIndex::MsgType => TAG_MSG_TYPE,
            OptionIndex::ServerId => TAG_SERVER_ID,
            OptionIndex::ClassId => TAG_CLASS_ID,
            OptionIndex::Bootfile => TAG_BOOTFILE,
        }
    }
}

/// Where the boot file name was recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootfileSource {
    /// Regular option area (or absent).
    Options,
    /// Nested option stream inside the overloaded `file` field.
    OverloadedFile,
    /// Literal `file` header field.
    HeaderField,
}

#[derive(Debug, Clone)]
pub struct ParsedPacket {
    buffer: Bytes,
    options: [Option<RawOption>; OptionIndex::COUNT],
}

impl ParsedPacket {
    /// Parses a raw packet, copying it into a buffer owned by the result.
    pub fn parse(data: &[u8]) -> Result<Self, PxeError> {
        if data.len() < OPTIONS_OFFSET {
            return Err(PxeError::MalformedOption(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }
        if data[BOOTP_HEADER_LEN..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return Err(PxeError::MalformedOption("bad magic cookie".to_string()));
        }

        let mut buf = BytesMut::from(data);
        let mut spans: [Option<OptionSpan>; OptionIndex::COUNT] = [None; OptionIndex::COUNT];
        for index in OptionIndex::ALL {
            spans[index as usize] =
                codec::find_span(&buf[OPTIONS_OFFSET..], index.tag()).map(|span| OptionSpan {
                    start: span.start + OPTIONS_OFFSET,
                    ..span
                });
        }

        let (bootfile, source) = Self::handle_overload(&mut buf, &spans);
        spans[OptionIndex::Bootfile as usize] = bootfile;

        let buffer = buf.freeze();
        let mut options: [Option<RawOption>; OptionIndex::COUNT] = Default::default();
        for index in OptionIndex::ALL {
            options[index as usize] = spans[index as usize].map(|span| RawOption {
                tag: index.tag(),
                data: buffer.slice(span.start..span.start + span.len),
            });
        }

        // No room left inside the file field for the terminator.
        if source == BootfileSource::OverloadedFile {
            if let Some(opt) = &mut options[OptionIndex::Bootfile as usize] {
                if opt.data.last().is_some_and(|b| *b != 0) {
                    let mut owned = opt.data.to_vec();
                    owned.push(0);
                    opt.data = Bytes::from(owned);
                }
            }
        }

        tracing::trace!(
            "parsed packet xid={:08x} yiaddr={} bootfile={:?}",
            u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
            Ipv4Addr::new(buffer[16], buffer[17], buffer[18], buffer[19]),
            source
        );

        Ok(Self { buffer, options })
    }

    /// Resolves the boot file option, honoring option overload.
    ///
    /// With the "file" overload bit set, the `file` header field is scanned as
    /// a nested option stream and the bootfile payload found there is NUL
    /// terminated in place when the field has room. Without overload, a
    /// non-empty literal `file` field stands in for a missing bootfile option.
    fn handle_overload(
        buf: &mut BytesMut,
        spans: &[Option<OptionSpan>; OptionIndex::COUNT],
    ) -> (Option<OptionSpan>, BootfileSource) {
        let current = spans[OptionIndex::Bootfile as usize];
        let overload = spans[OptionIndex::Overload as usize]
            .filter(|span| span.len > 0)
            .map(|span| buf[span.start]);

        if let Some(flags) = overload {
            if flags & OVERLOAD_FILE != 0 {
                let nested = codec::find_span(&buf[FILE], TAG_BOOTFILE).map(|span| OptionSpan {
                    start: span.start + FILE.start,
                    ..span
                });
                let Some(mut span) = nested else {
                    return (current, BootfileSource::Options);
                };
                let end = span.start + span.len;
                if span.len > 0 && buf[end - 1] != 0 && end < FILE.end {
                    buf[end] = 0;
                    span.len += 1;
                }
                return (Some(span), BootfileSource::OverloadedFile);
            }
            return (current, BootfileSource::Options);
        }

        if current.is_none() && buf[FILE.start] != 0 {
            let len = buf[FILE]
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(FILE.len());
            let span = OptionSpan {
                tag: TAG_BOOTFILE,
                start: FILE.start,
                len,
            };
            return (Some(span), BootfileSource::HeaderField);
        }

        (current, BootfileSource::Options)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.buffer
    }

    pub fn opcode(&self) -> u8 {
        self.buffer[0]
    }

    pub fn hlen(&self) -> u8 {
        self.buffer[2]
    }

    pub fn xid(&self) -> u32 {
        u32::from_be_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]])
    }

    pub fn secs(&self) -> u16 {
        u16::from_be_bytes([self.buffer[8], self.buffer[9]])
    }

    fn addr_at(&self, offset: usize) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buffer[offset],
            self.buffer[offset + 1],
            self.buffer[offset + 2],
            self.buffer[offset + 3],
        )
    }

    pub fn ciaddr(&self) -> Ipv4Addr {
        self.addr_at(12)
    }

    /// "Your" address; unspecified for proxy offers.
    pub fn yiaddr(&self) -> Ipv4Addr {
        self.addr_at(16)
    }

    /// Next-server address from the header.
    pub fn siaddr(&self) -> Ipv4Addr {
        self.addr_at(20)
    }

    /// Client hardware address, limited to `hlen` bytes.
    pub fn chaddr(&self) -> &[u8] {
        let len = (self.hlen() as usize).min(CHADDR.len());
        &self.buffer[CHADDR.start..CHADDR.start + len]
    }

    pub fn sname(&self) -> &[u8] {
        &self.buffer[SNAME]
    }

    pub fn file(&self) -> &[u8] {
        &self.buffer[FILE]
    }

    pub fn option(&self, index: OptionIndex) -> Option<&RawOption> {
        self.options[index as usize].as_ref()
    }

    /// Scans the option area for an arbitrary tag.
    pub fn find_option(&self, tag: u8) -> Option<RawOption> {
        codec::parse_option(&self.buffer.slice(OPTIONS_OFFSET..), tag)
    }

    /// DHCP message type; `None` when absent or zero (a BOOTP reply).
    pub fn message_type(&self) -> Option<u8> {
        self.option(OptionIndex::MsgType)
            .and_then(RawOption::first)
            .filter(|t| *t != 0)
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.option(OptionIndex::ServerId)
            .filter(|opt| opt.len() >= 4)
            .map(|opt| Ipv4Addr::new(opt.data[0], opt.data[1], opt.data[2], opt.data[3]))
    }

    pub fn has_bootfile(&self) -> bool {
        self.option(OptionIndex::Bootfile).is_some()
    }

    /// Boot file name with any trailing NULs removed.
    pub fn boot_file_name(&self) -> Option<String> {
        let opt = self.option(OptionIndex::Bootfile)?;
        let end = opt.data.iter().position(|b| *b == 0).unwrap_or(opt.len());
        let name = String::from_utf8_lossy(&opt.data[..end]).into_owned();
        (!name.is_empty()).then_some(name)
    }

    /// Boot file size in bytes, from the 512-byte block count of option 13.
    pub fn boot_file_size_hint(&self) -> Option<u32> {
        self.option(OptionIndex::BootfileLen)
            .filter(|opt| opt.len() >= 2)
            .map(|opt| u32::from(u16::from_be_bytes([opt.data[0], opt.data[1]])) * 512)
    }

    /// A proxy offer leases no address.
    pub fn is_proxy_offer(&self) -> bool {
        self.yiaddr().is_unspecified()
    }

    /// Boot server address: `siaddr`, falling back to the server identifier.
    pub fn boot_server_address(&self) -> Option<Ipv4Addr> {
        let siaddr = self.siaddr();
        if !siaddr.is_unspecified() {
            return Some(siaddr);
        }
        self.server_identifier().filter(|ip| !ip.is_unspecified())
    }
}

/// Builds raw BOOTP/DHCP packets with full control over the header fields.
#[derive(Debug)]
pub struct PacketBuilder {
    header: [u8; BOOTP_HEADER_LEN],
    options: OptionWriter,
}

impl PacketBuilder {
    /// A BOOTREPLY for an Ethernet client with the given transaction id.
    pub fn reply(xid: u32) -> Self {
        let mut header = [0u8; BOOTP_HEADER_LEN];
        header[0] = OP_BOOT_REPLY;
        header[1] = 1;
        header[2] = 6;
        header[4..8].copy_from_slice(&xid.to_be_bytes());
        Self {
            header,
            options: OptionWriter::new(),
        }
    }

    pub fn opcode(mut self, op: u8) -> Self {
        self.header[0] = op;
        self
    }

    pub fn chaddr(mut self, mac: &[u8]) -> Self {
        let len = mac.len().min(CHADDR.len());
        self.header[2] = len as u8;
        self.header[CHADDR.start..CHADDR.start + len].copy_from_slice(&mac[..len]);
        self
    }

    pub fn yiaddr(mut self, addr: Ipv4Addr) -> Self {
        self.header[16..20].copy_from_slice(&addr.octets());
        self
    }

    pub fn siaddr(mut self, addr: Ipv4Addr) -> Self {
        self.header[20..24].copy_from_slice(&addr.octets());
        self
    }

    /// Raw contents of the `file` header field (truncated to 128 bytes).
    pub fn file(mut self, file: &[u8]) -> Self {
        let len = file.len().min(FILE.len());
        self.header[FILE.start..FILE.start + len].copy_from_slice(&file[..len]);
        self
    }

    pub fn option(mut self, tag: u8, data: &[u8]) -> Self {
        self.options.option(tag, data);
        self
    }

    pub fn message_type(self, msg_type: u8) -> Self {
        self.option(TAG_MSG_TYPE, &[msg_type])
    }

    pub fn server_id(self, addr: Ipv4Addr) -> Self {
        self.option(TAG_SERVER_ID, &addr.octets())
    }

    pub fn class_id(self, class_id: &str) -> Self {
        self.option(TAG_CLASS_ID, class_id.as_bytes())
    }

    pub fn bootfile(self, name: &str) -> Self {
        self.option(TAG_BOOTFILE, name.as_bytes())
    }

    pub fn vendor(self, vendor: &[u8]) -> Self {
        self.option(TAG_VENDOR, vendor)
    }

    pub fn build(self) -> Bytes {
        let mut out = BytesMut::with_capacity(OPTIONS_OFFSET + self.options.len() + 1);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&MAGIC_COOKIE);
        out.extend_from_slice(&self.options.finish());
        out.extend_from_slice(&[TAG_END]);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pxe::codec::OVERLOAD_SNAME;

    #[test]
    fn test_rejects_short_packet() {
        let err = ParsedPacket::parse(&[0u8; 100]).unwrap_err();
        assert!(matches!(err, PxeError::MalformedOption(_)));
    }

    #[test]
    fn test_rejects_bad_cookie() {
        let mut raw = PacketBuilder::reply(1).build().to_vec();
        raw[236] = 0;
        assert!(ParsedPacket::parse(&raw).is_err());
    }

    #[test]
    fn test_header_fields() {
        let raw = PacketBuilder::reply(0xdeadbeef)
            .chaddr(&[0, 1, 2, 3, 4, 5])
            .yiaddr(Ipv4Addr::new(10, 0, 0, 5))
            .siaddr(Ipv4Addr::new(10, 0, 0, 1))
            .message_type(2)
            .server_id(Ipv4Addr::new(10, 0, 0, 2))
            .build();
        let packet = ParsedPacket::parse(&raw).unwrap();

        assert_eq!(packet.opcode(), OP_BOOT_REPLY);
        assert_eq!(packet.xid(), 0xdeadbeef);
        assert_eq!(packet.chaddr(), &[0, 1, 2, 3, 4, 5]);
        assert_eq!(packet.yiaddr(), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(packet.siaddr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(packet.message_type(), Some(2));
        assert_eq!(packet.server_identifier(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(!packet.is_proxy_offer());
    }

    #[test]
    fn test_overloaded_file_field_is_nul_terminated() {
        let mut nested = OptionWriter::new();
        nested.option(TAG_BOOTFILE, b"pxelinux.0").end();
        let raw = PacketBuilder::reply(7)
            .message_type(2)
            .option(TAG_OVERLOAD, &[OVERLOAD_FILE])
            .file(&nested.finish())
            .build();
        let packet = ParsedPacket::parse(&raw).unwrap();

        let opt = packet.option(OptionIndex::Bootfile).unwrap();
        assert_eq!(&opt.data[..], b"pxelinux.0\0");
        assert_eq!(packet.boot_file_name().as_deref(), Some("pxelinux.0"));
        // The terminator was written into the packet's own copy of the file field.
        assert_eq!(packet.file()[2 + 10], 0);
    }

    #[test]
    fn test_overload_with_full_file_field_copies_name() {
        let name = [b'x'; 126];
        let mut nested = OptionWriter::new();
        nested.option(TAG_BOOTFILE, &name);
        let raw = PacketBuilder::reply(7)
            .option(TAG_OVERLOAD, &[OVERLOAD_FILE | OVERLOAD_SNAME])
            .file(&nested.finish())
            .build();
        let packet = ParsedPacket::parse(&raw).unwrap();

        let opt = packet.option(OptionIndex::Bootfile).unwrap();
        assert_eq!(opt.len(), 127);
        assert_eq!(opt.data.last(), Some(&0));
        assert_eq!(packet.boot_file_name().unwrap().len(), 126);
    }

    #[test]
    fn test_literal_file_field_used_without_overload() {
        let raw = PacketBuilder::reply(7).file(b"boot/grubx64.efi").build();
        let packet = ParsedPacket::parse(&raw).unwrap();

        assert!(packet.has_bootfile());
        assert_eq!(packet.boot_file_name().as_deref(), Some("boot/grubx64.efi"));
    }

    #[test]
    fn test_bootfile_option_wins_over_literal_field() {
        let raw = PacketBuilder::reply(7)
            .file(b"literal")
            .bootfile("from-option")
            .build();
        let packet = ParsedPacket::parse(&raw).unwrap();

        assert_eq!(packet.boot_file_name().as_deref(), Some("from-option"));
    }

    #[test]
    fn test_bootfile_size_hint_in_blocks() {
        let raw = PacketBuilder::reply(7)
            .option(TAG_BOOTFILE_LEN, &[0x00, 0x40])
            .build();
        let packet = ParsedPacket::parse(&raw).unwrap();
        assert_eq!(packet.boot_file_size_hint(), Some(64 * 512));
    }

    #[test]
    fn test_boot_server_falls_back_to_server_id() {
        let raw = PacketBuilder::reply(7)
            .server_id(Ipv4Addr::new(192, 168, 0, 9))
            .build();
        let packet = ParsedPacket::parse(&raw).unwrap();

        assert!(packet.is_proxy_offer());
        assert_eq!(packet.boot_server_address(), Some(Ipv4Addr::new(192, 168, 0, 9)));
    }
}
