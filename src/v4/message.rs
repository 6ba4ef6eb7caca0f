use crate::{
    config::ClientConfig,
    error::PxeError,
    pxe::{
        codec::{
            TAG_BOOTFILE, TAG_BOOTFILE_LEN, TAG_CLASS_ID, TAG_CLIENT_ARCH, TAG_CLIENT_NII,
            TAG_CLIENT_UUID, TAG_DNS, TAG_DOMAIN_NAME, TAG_HOSTNAME, TAG_ROOT_PATH, TAG_ROUTER,
            TAG_SUBNET_MASK, TAG_TFTP_SERVER, TAG_VENDOR,
        },
        vendor::{encode_boot_item, BootItem},
    },
};
use bytes::{BufMut as _, Bytes, BytesMut};
use dhcproto::{
    v4::{self, OptionCode},
    Encodable as _, Encoder,
};
use std::net::Ipv4Addr;

/// Network interface type advertised in option 94 (UNDI).
const UNDI_TYPE: u8 = 1;

/// Client identification carried by every request this client sends.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub mac_address: Bytes,
    pub architecture: u16,
    pub undi_major: u8,
    pub undi_minor: u8,
    pub uuid: Option<[u8; 16]>,
    pub max_message_size: u16,
}

impl ClientOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            mac_address: config.mac_address.clone(),
            architecture: config.architecture,
            undi_major: config.undi_version.0,
            undi_minor: config.undi_version.1,
            uuid: config.uuid,
            max_message_size: config.max_message_size,
        }
    }

    /// `PXEClient:Arch:AAAAA:UNDI:MMMmmm`
    pub fn class_id(&self) -> String {
        format!(
            "PXEClient:Arch:{:05}:UNDI:{:03}{:03}",
            self.architecture, self.undi_major, self.undi_minor
        )
    }

    fn parameter_request_list() -> Vec<OptionCode> {
        let mut list: Vec<OptionCode> = [
            TAG_SUBNET_MASK,
            TAG_ROUTER,
            TAG_DNS,
            TAG_HOSTNAME,
            TAG_BOOTFILE_LEN,
            TAG_DOMAIN_NAME,
            TAG_ROOT_PATH,
            TAG_VENDOR,
            TAG_CLASS_ID,
            TAG_TFTP_SERVER,
            TAG_BOOTFILE,
        ]
        .into_iter()
        .map(OptionCode::from)
        .collect();
        // PXE site-specific options.
        list.extend((128u8..=135).map(OptionCode::from));
        list
    }

    fn insert_into(&self, msg: &mut v4::Message) {
        // Client Identifier (Option 61): htype Ethernet followed by the MAC address
        let mut client_id_data = BytesMut::new();
        client_id_data.put_u8(1);
        client_id_data.extend_from_slice(&self.mac_address);
        msg.opts_mut().insert(v4::DhcpOption::ClientIdentifier(
            client_id_data.freeze().to_vec(),
        ));

        msg.opts_mut()
            .insert(v4::DhcpOption::ParameterRequestList(
                Self::parameter_request_list(),
            ));
        msg.opts_mut()
            .insert(v4::DhcpOption::MaxMessageSize(self.max_message_size));
        msg.opts_mut().insert(v4::DhcpOption::ClassIdentifier(
            self.class_id().into_bytes(),
        ));

        msg.opts_mut().insert(unknown(
            TAG_CLIENT_ARCH,
            self.architecture.to_be_bytes().to_vec(),
        ));
        msg.opts_mut().insert(unknown(
            TAG_CLIENT_NII,
            vec![UNDI_TYPE, self.undi_major, self.undi_minor],
        ));
        if let Some(uuid) = self.uuid {
            // Type 0 followed by the 16-byte machine GUID
            let mut data = Vec::with_capacity(17);
            data.push(0);
            data.extend_from_slice(&uuid);
            msg.opts_mut().insert(unknown(TAG_CLIENT_UUID, data));
        }
    }

    fn base_message(&self, xid: u32) -> v4::Message {
        let mut msg = v4::Message::default();
        msg.set_opcode(v4::Opcode::BootRequest)
            .set_chaddr(&self.mac_address)
            .set_htype(v4::HType::Eth)
            .set_hops(0)
            .set_xid(xid)
            .set_secs(0);
        self.insert_into(&mut msg);
        msg
    }
}

fn unknown(tag: u8, data: Vec<u8>) -> v4::DhcpOption {
    v4::DhcpOption::Unknown(v4::UnknownOption::new(OptionCode::from(tag), data))
}

fn encode(msg: &v4::Message) -> Result<Vec<u8>, PxeError> {
    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer);
    msg.encode(&mut encoder)?;
    Ok(buffer)
}

/// Constructs a DHCP Discover message.
pub fn build_dhcp_discover(options: &ClientOptions, xid: u32) -> Result<Vec<u8>, PxeError> {
    let mut msg = options.base_message(xid);
    msg.set_flags(v4::Flags::default().set_broadcast());

    // Add DHCP Message Type Option (53) - DHCPDISCOVER (1)
    msg.opts_mut()
        .insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));

    encode(&msg)
}

/// Constructs a DHCP Request for the selected offer.
pub fn build_dhcp_request(
    options: &ClientOptions,
    xid: u32,
    offered_ip: Ipv4Addr,
    server_ip: Ipv4Addr,
) -> Result<Vec<u8>, PxeError> {
    let mut msg = options.base_message(xid);
    msg.set_flags(v4::Flags::default().set_broadcast())
        .set_ciaddr(Ipv4Addr::UNSPECIFIED); // not confirmed yet

    msg.opts_mut()
        .insert(v4::DhcpOption::MessageType(v4::MessageType::Request));
    msg.opts_mut()
        .insert(v4::DhcpOption::RequestedIpAddress(offered_ip));
    msg.opts_mut()
        .insert(v4::DhcpOption::ServerIdentifier(server_ip));

    encode(&msg)
}

/// Constructs a boot service discovery request.
///
/// `boot_item` is only present for an initial PXE discovery; BINL resolution
/// sends the plain client identification.
pub fn build_boot_request(
    options: &ClientOptions,
    xid: u32,
    station_ip: Ipv4Addr,
    broadcast: bool,
    boot_item: Option<BootItem>,
) -> Result<Vec<u8>, PxeError> {
    let mut msg = options.base_message(xid);
    msg.set_ciaddr(station_ip);
    if broadcast {
        msg.set_flags(v4::Flags::default().set_broadcast());
    }

    msg.opts_mut()
        .insert(v4::DhcpOption::MessageType(v4::MessageType::Request));
    if let Some(item) = boot_item {
        msg.opts_mut()
            .insert(unknown(TAG_VENDOR, encode_boot_item(item)));
    }

    encode(&msg)
}
