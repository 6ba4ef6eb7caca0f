use crate::{error::PxeError, pxe::select::SelectionMode, pxe::store::DEFAULT_OFFER_CAPACITY};
use clap::Parser;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The network interface to bind to (e.g., 'eth0', 'lo')
    #[arg(short, long)]
    pub interface: String,

    /// Take the first usable offer instead of ranking offers by priority
    #[arg(long)]
    pub first_received: bool,

    /// Client system architecture advertised in option 93
    #[arg(long, default_value_t = 0)]
    pub arch: u16,

    /// Machine UUID as 32 hex digits (dashes allowed), sent in option 97
    #[arg(long)]
    pub uuid: Option<String>,

    /// Maximum number of offers cached per attempt
    #[arg(long, default_value_t = DEFAULT_OFFER_CAPACITY)]
    pub capacity: usize,

    /// DHCPDISCOVER retransmissions before giving up
    #[arg(long, default_value_t = 4)]
    pub retries: u32,

    /// Boot server type to discover (defaults to the first boot menu entry)
    #[arg(long)]
    pub boot_type: Option<u16>,

    /// TFTP block size hint handed to the file transfer
    #[arg(long, default_value_t = 1468)]
    pub block_size: u16,
}

pub struct ClientConfig {
    pub interface: String,
    pub mac_address: bytes::Bytes,
    pub client_port: u16,
    pub server_port: u16,
    pub boot_server_port: u16,
    pub broadcast_address: Ipv4Addr,
    pub initial_timeout: Duration,
    pub request_timeout: Duration,
    pub discover_retries: u32,
    pub offer_capacity: usize,
    pub selection_mode: SelectionMode,
    pub architecture: u16,
    pub undi_version: (u8, u8),
    pub uuid: Option<[u8; 16]>,
    pub boot_type: Option<u16>,
    pub block_size: u16,
    pub max_message_size: u16,
}

impl ClientConfig {
    pub fn new(interface: String, mac_address: bytes::Bytes) -> Self {
        Self {
            interface,
            mac_address,
            client_port: 68,
            server_port: 67,
            boot_server_port: 4011,
            broadcast_address: Ipv4Addr::BROADCAST,
            initial_timeout: Duration::from_secs(4),
            request_timeout: Duration::from_secs(4),
            discover_retries: 4,
            offer_capacity: DEFAULT_OFFER_CAPACITY,
            selection_mode: SelectionMode::Sorted,
            architecture: 0,
            undi_version: (3, 0),
            uuid: None,
            boot_type: None,
            block_size: 1468,
            max_message_size: 1472,
        }
    }

    /// Applies the command line on top of the defaults.
    pub fn from_args(args: &Args, mac_address: bytes::Bytes) -> Result<Self, PxeError> {
        let mut config = Self::new(args.interface.clone(), mac_address);
        if args.first_received {
            config.selection_mode = SelectionMode::FirstReceived;
        }
        config.architecture = args.arch;
        config.uuid = args.uuid.as_deref().map(parse_uuid).transpose()?;
        config.offer_capacity = args.capacity.max(1);
        config.discover_retries = args.retries.max(1);
        config.boot_type = args.boot_type;
        config.block_size = args.block_size;
        Ok(config)
    }
}

fn parse_uuid(text: &str) -> Result<[u8; 16], PxeError> {
    let digits: Vec<u8> = text.bytes().filter(|b| *b != b'-').collect();
    if digits.len() != 32 {
        return Err(PxeError::Critical(format!("UUID must have 32 hex digits: {text}")));
    }
    let mut uuid = [0u8; 16];
    for (byte, pair) in uuid.iter_mut().zip(digits.chunks(2)) {
        let hex = std::str::from_utf8(pair)
            .map_err(|_| PxeError::Critical(format!("invalid UUID: {text}")))?;
        *byte = u8::from_str_radix(hex, 16)
            .map_err(|_| PxeError::Critical(format!("invalid UUID: {text}")))?;
    }
    Ok(uuid)
}
