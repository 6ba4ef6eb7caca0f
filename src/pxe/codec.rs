//! DHCP option TLV codec
//!
//! Options are `{tag, length, data}` triples. Tag 0 is a single padding byte
//! with no length field and tag 255 terminates the stream. The same scanner is
//! used for top-level DHCP options, for the overloaded `file` header field and
//! for the nested PXE vendor sub-options.

use bytes::{BufMut as _, Bytes, BytesMut};

pub const TAG_PAD: u8 = 0;
pub const TAG_SUBNET_MASK: u8 = 1;
pub const TAG_ROUTER: u8 = 3;
pub const TAG_DNS: u8 = 6;
pub const TAG_HOSTNAME: u8 = 12;
pub const TAG_BOOTFILE_LEN: u8 = 13;
pub const TAG_DOMAIN_NAME: u8 = 15;
pub const TAG_ROOT_PATH: u8 = 17;
pub const TAG_VENDOR: u8 = 43;
pub const TAG_OVERLOAD: u8 = 52;
pub const TAG_MSG_TYPE: u8 = 53;
pub const TAG_SERVER_ID: u8 = 54;
pub const TAG_CLASS_ID: u8 = 60;
pub const TAG_TFTP_SERVER: u8 = 66;
pub const TAG_BOOTFILE: u8 = 67;
pub const TAG_CLIENT_ARCH: u8 = 93;
pub const TAG_CLIENT_NII: u8 = 94;
pub const TAG_CLIENT_UUID: u8 = 97;
pub const TAG_END: u8 = 255;

/// Bit in the overload option value meaning "the `file` field holds options".
pub const OVERLOAD_FILE: u8 = 0x01;
/// Bit in the overload option value meaning "the `sname` field holds options".
pub const OVERLOAD_SNAME: u8 = 0x02;

/// Size of the tag + length prefix of a non-pad option.
pub const OPTION_HEADER_LEN: usize = 2;

/// One option found while scanning a TLV stream.
///
/// `data` is a view into the buffer the option was found in; cloning it never
/// copies the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOption {
    pub tag: u8,
    pub data: Bytes,
}

impl RawOption {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// First payload byte, if any.
    pub fn first(&self) -> Option<u8> {
        self.data.first().copied()
    }
}

/// Byte range of an option payload inside a scanned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OptionSpan {
    pub tag: u8,
    pub start: usize,
    pub len: usize,
}

/// Iterator over the options of a TLV stream, stopping at the end tag, at the
/// end of the buffer, or at the first option whose payload would run past it.
pub(crate) struct OptionSpans<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> OptionSpans<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }
}

impl Iterator for OptionSpans<'_> {
    type Item = OptionSpan;

    fn next(&mut self) -> Option<OptionSpan> {
        loop {
            let tag = *self.buf.get(self.offset)?;
            match tag {
                TAG_END => return None,
                TAG_PAD => self.offset += 1,
                _ => {
                    let len = *self.buf.get(self.offset + 1)? as usize;
                    let start = self.offset + OPTION_HEADER_LEN;
                    if start + len > self.buf.len() {
                        return None;
                    }
                    self.offset = start + len;
                    return Some(OptionSpan { tag, start, len });
                }
            }
        }
    }
}

/// Finds the first option with `tag` in a TLV stream.
pub(crate) fn find_span(buf: &[u8], tag: u8) -> Option<OptionSpan> {
    OptionSpans::new(buf).find(|span| span.tag == tag)
}

/// Returns the first option matching `tag`, or `None` if the scan reaches the
/// end of `buffer` or an end tag first.
pub fn parse_option(buffer: &Bytes, tag: u8) -> Option<RawOption> {
    find_span(buffer, tag).map(|span| RawOption {
        tag,
        data: buffer.slice(span.start..span.start + span.len),
    })
}

/// Returns every option of the stream in order.
pub fn parse_all(buffer: &Bytes) -> Vec<RawOption> {
    OptionSpans::new(buffer)
        .map(|span| RawOption {
            tag: span.tag,
            data: buffer.slice(span.start..span.start + span.len),
        })
        .collect()
}

/// Builds a TLV option stream.
#[derive(Debug, Default)]
pub struct OptionWriter {
    buf: BytesMut,
}

impl OptionWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one option. Payloads longer than 255 bytes are truncated.
    pub fn option(&mut self, tag: u8, data: &[u8]) -> &mut Self {
        let data = &data[..data.len().min(u8::MAX as usize)];
        self.buf.put_u8(tag);
        self.buf.put_u8(data.len() as u8);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn u8(&mut self, tag: u8, value: u8) -> &mut Self {
        self.option(tag, &[value])
    }

    pub fn u16(&mut self, tag: u8, value: u16) -> &mut Self {
        self.option(tag, &value.to_be_bytes())
    }

    pub fn ipv4(&mut self, tag: u8, addr: std::net::Ipv4Addr) -> &mut Self {
        self.option(tag, &addr.octets())
    }

    pub fn pad(&mut self) -> &mut Self {
        self.buf.put_u8(TAG_PAD);
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.buf.put_u8(TAG_END);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_padding() {
        let mut w = OptionWriter::new();
        w.pad().pad().u8(TAG_MSG_TYPE, 2).end();
        let buf = w.finish();

        let opt = parse_option(&buf, TAG_MSG_TYPE).unwrap();
        assert_eq!(opt.first(), Some(2));
        assert_eq!(opt.len(), 1);
    }

    #[test]
    fn test_parse_stops_at_end_tag() {
        let mut w = OptionWriter::new();
        w.u8(TAG_MSG_TYPE, 2).end().option(TAG_BOOTFILE, b"hidden");
        let buf = w.finish();

        assert!(parse_option(&buf, TAG_BOOTFILE).is_none());
    }

    #[test]
    fn test_parse_truncated_option() {
        let buf = Bytes::from_static(&[TAG_MSG_TYPE, 1, 5, TAG_BOOTFILE, 10, b'a', b'b']);
        assert!(parse_option(&buf, TAG_MSG_TYPE).is_some());
        assert!(parse_option(&buf, TAG_BOOTFILE).is_none());
    }

    #[test]
    fn test_parse_returns_first_match() {
        let mut w = OptionWriter::new();
        w.option(TAG_BOOTFILE, b"first").option(TAG_BOOTFILE, b"second");
        let buf = w.finish();

        assert_eq!(&parse_option(&buf, TAG_BOOTFILE).unwrap().data[..], b"first");
        assert_eq!(parse_all(&buf).len(), 2);
    }

    #[test]
    fn test_option_is_view_into_buffer() {
        let mut w = OptionWriter::new();
        w.option(TAG_CLASS_ID, b"PXEClient");
        let buf = w.finish();

        let opt = parse_option(&buf, TAG_CLASS_ID).unwrap();
        assert_eq!(opt.data.as_ptr(), buf[OPTION_HEADER_LEN..].as_ptr());
    }
}
