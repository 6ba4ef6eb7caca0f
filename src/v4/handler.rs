//! DHCPv4 state machine implementation
//!
//! This module implements the DORA (Discover, Offer, Request, Acknowledge)
//! exchange used by the PXE client. Offers are not judged here: every offer is
//! handed to the event handler, which decides when collection stops and which
//! offer gets requested.

use super::message::{build_dhcp_discover, build_dhcp_request, ClientOptions};
use crate::{
    client::{DhcpBinding, DhcpEvent, DhcpEventHandler, DhcpTransport, EventResponse},
    config::ClientConfig,
    error::PxeError,
};
use bytes::Bytes;
use dhcproto::{v4, Decodable};
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

/// Actions returned by the state machine, executed by the driver
#[derive(Debug)]
pub enum Action {
    /// Send the packet, then wait for a reply for the given duration.
    Send(Vec<u8>, SocketAddr, Duration),
    Wait(Duration),
    Bind(DhcpBinding),
}

/// External events the state machine reacts to
#[derive(Debug)]
pub enum Event<'a> {
    PacketReceived(&'a [u8]),
    Timeout,
}

/// Datagram primitive the driver runs the exchange over.
pub trait Datagram {
    fn send_to(&mut self, packet: &[u8], destination: SocketAddr) -> Result<(), PxeError>;
    /// Returns `None` when nothing arrived within `timeout`.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, PxeError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ExchangeTiming {
    pub server: SocketAddr,
    /// Collection window of the first DISCOVER; doubled on every retransmission.
    pub initial_timeout: Duration,
    pub request_timeout: Duration,
    pub retries: u32,
}

impl ExchangeTiming {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            server: SocketAddr::from((config.broadcast_address, config.server_port)),
            initial_timeout: config.initial_timeout,
            request_timeout: config.request_timeout,
            retries: config.discover_retries.max(1),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum DhcpV4State {
    Init,
    Selecting,
    Requesting,
    Bound,
}

pub struct DhcpV4Handler {
    state: DhcpV4State,
    options: ClientOptions,
    timing: ExchangeTiming,
    xid: u32,
    attempt: u32,
    deadline: Instant,
    offers_seen: usize,
    discover: Bytes,
    offer: Option<v4::Message>,
    request: Option<Vec<u8>>,
}

impl DhcpV4Handler {
    pub fn new(options: ClientOptions, timing: ExchangeTiming) -> Self {
        Self {
            state: DhcpV4State::Init,
            options,
            timing,
            xid: rand::random(),
            attempt: 0,
            deadline: Instant::now(),
            offers_seen: 0,
            discover: Bytes::new(),
            offer: None,
            request: None,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            DhcpV4State::Init => "Init",
            DhcpV4State::Selecting => "Selecting",
            DhcpV4State::Requesting => "Requesting",
            DhcpV4State::Bound => "Bound",
        }
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn handle_event(
        &mut self,
        event: Event,
        handler: &mut dyn DhcpEventHandler,
    ) -> Result<Action, PxeError> {
        tracing::trace!("Handling event {:?} in state {:?}", event, self.state);
        match self.state {
            DhcpV4State::Init => self.handle_init(handler),
            DhcpV4State::Selecting => self.handle_selecting(event, handler),
            DhcpV4State::Requesting => self.handle_requesting_response(event, handler),
            DhcpV4State::Bound => Err(PxeError::Critical(
                "event delivered after the lease was bound".to_string(),
            )),
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn handle_init(&mut self, handler: &mut dyn DhcpEventHandler) -> Result<Action, PxeError> {
        self.attempt += 1;
        let window = self.timing.initial_timeout * 2u32.saturating_pow(self.attempt - 1);
        let discover_packet = build_dhcp_discover(&self.options, self.xid)?;
        if handler.handle_event(DhcpEvent::DiscoverSent(&discover_packet)) == EventResponse::Abort {
            return Err(PxeError::Aborted);
        }

        tracing::info!(
            "Sending DHCPDISCOVER xid={:08x} (attempt {}/{}, window {:?})",
            self.xid,
            self.attempt,
            self.timing.retries,
            window
        );
        self.discover = Bytes::copy_from_slice(&discover_packet);
        self.deadline = Instant::now() + window;
        self.state = DhcpV4State::Selecting;
        Ok(Action::Send(discover_packet, self.timing.server, window))
    }

    fn decode_reply(&self, data: &[u8]) -> Option<v4::Message> {
        let msg = match v4::Message::decode(&mut v4::Decoder::new(data)) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Failed to decode DHCP message: {}", e);
                return None;
            }
        };
        if msg.opcode() != v4::Opcode::BootReply || msg.xid() != self.xid {
            tracing::debug!("XID mismatch, ignoring packet");
            return None;
        }
        Some(msg)
    }

    fn handle_selecting(
        &mut self,
        event: Event,
        handler: &mut dyn DhcpEventHandler,
    ) -> Result<Action, PxeError> {
        match event {
            Event::PacketReceived(data) => {
                let Some(msg) = self.decode_reply(data) else {
                    return Ok(Action::Wait(self.remaining()));
                };
                // BOOTP replies are collected too.
                match msg.opts().get(v4::OptionCode::MessageType) {
                    Some(v4::DhcpOption::MessageType(v4::MessageType::Offer)) => {}
                    _ if is_bootp(&msg) => {}
                    other => {
                        tracing::debug!("Not a DHCP OFFER message: {:?}", other);
                        return Ok(Action::Wait(self.remaining()));
                    }
                }

                tracing::info!("Received offer, offered IP: {}", msg.yiaddr());
                self.offers_seen += 1;
                match handler.handle_event(DhcpEvent::OfferReceived(data)) {
                    EventResponse::Abort => Err(PxeError::Aborted),
                    EventResponse::NotReady => Ok(Action::Wait(self.remaining())),
                    // The handler has seen enough.
                    _ => self.handle_select(handler),
                }
            }
            Event::Timeout if self.offers_seen > 0 => self.handle_select(handler),
            Event::Timeout if self.attempt < self.timing.retries => {
                tracing::warn!("Timeout in Selecting state, retrying discovery");
                self.handle_init(handler)
            }
            Event::Timeout => {
                tracing::error!("No offer after {} DHCPDISCOVER attempts", self.attempt);
                Err(PxeError::Timeout)
            }
        }
    }

    fn handle_select(&mut self, handler: &mut dyn DhcpEventHandler) -> Result<Action, PxeError> {
        let EventResponse::Replace(packet) = handler.handle_event(DhcpEvent::SelectOffer) else {
            return Err(PxeError::Aborted);
        };
        let offer = v4::Message::decode(&mut v4::Decoder::new(&packet))?;

        if is_bootp(&offer) {
            tracing::info!("BOOTP offer selected, binding {} without a request", offer.yiaddr());
            self.state = DhcpV4State::Bound;
            return Ok(Action::Bind(self.extract_binding(&offer, packet)));
        }

        self.offer = Some(offer);
        self.attempt = 0;
        self.state = DhcpV4State::Requesting;
        self.handle_requesting(handler)
    }

    fn handle_requesting(&mut self, handler: &mut dyn DhcpEventHandler) -> Result<Action, PxeError> {
        let Some(ref offer) = self.offer else {
            return Err(PxeError::Critical("No offer available for request".to_string()));
        };

        if self.request.is_none() {
            let server_id = match offer.opts().get(v4::OptionCode::ServerIdentifier) {
                Some(v4::DhcpOption::ServerIdentifier(ip)) => *ip,
                _ => {
                    return Err(PxeError::MalformedOption(
                        "No server identifier in offer".to_string(),
                    ))
                }
            };
            let request = build_dhcp_request(&self.options, self.xid, offer.yiaddr(), server_id)?;
            if handler.handle_event(DhcpEvent::RequestSent(&request)) == EventResponse::Abort {
                return Err(PxeError::Aborted);
            }
            tracing::info!("Requesting {} from {}", offer.yiaddr(), server_id);
            self.request = Some(request);
        }

        self.attempt += 1;
        let request = self.request.clone().unwrap_or_default();
        self.deadline = Instant::now() + self.timing.request_timeout;
        Ok(Action::Send(request, self.timing.server, self.timing.request_timeout))
    }

    fn handle_requesting_response(
        &mut self,
        event: Event,
        handler: &mut dyn DhcpEventHandler,
    ) -> Result<Action, PxeError> {
        match event {
            Event::PacketReceived(data) => {
                let Some(msg) = self.decode_reply(data) else {
                    return Ok(Action::Wait(self.remaining()));
                };
                match msg.opts().get(v4::OptionCode::MessageType) {
                    Some(v4::DhcpOption::MessageType(v4::MessageType::Ack)) => {
                        if handler.handle_event(DhcpEvent::AckReceived(data))
                            == EventResponse::Abort
                        {
                            return Err(PxeError::Aborted);
                        }
                        self.state = DhcpV4State::Bound;
                        Ok(Action::Bind(
                            self.extract_binding(&msg, Bytes::copy_from_slice(data)),
                        ))
                    }
                    Some(v4::DhcpOption::MessageType(v4::MessageType::Nak)) => {
                        tracing::warn!("Received DHCP NAK, restarting discovery");
                        self.state = DhcpV4State::Init;
                        self.offer = None;
                        self.request = None;
                        self.offers_seen = 0;
                        self.attempt = 0;
                        self.xid = rand::random();
                        self.handle_init(handler)
                    }
                    _ => Ok(Action::Wait(self.remaining())),
                }
            }
            Event::Timeout if self.attempt < self.timing.retries => {
                tracing::warn!("Timeout waiting for DHCP ACK, retrying request");
                self.handle_requesting(handler)
            }
            Event::Timeout => Err(PxeError::Timeout),
        }
    }

    fn extract_binding(&self, msg: &v4::Message, ack: Bytes) -> DhcpBinding {
        let subnet_mask = match msg.opts().get(v4::OptionCode::SubnetMask) {
            Some(v4::DhcpOption::SubnetMask(mask)) => Some(*mask),
            _ => None,
        };
        let router = match msg.opts().get(v4::OptionCode::Router) {
            Some(v4::DhcpOption::Router(routers)) => routers.first().copied(),
            _ => None,
        };

        DhcpBinding {
            client_address: msg.yiaddr(),
            subnet_mask,
            router: router.filter(|ip| *ip != Ipv4Addr::UNSPECIFIED),
            discover: self.discover.clone(),
            ack,
        }
    }
}

/// A reply without a message type, or with type 0, is plain BOOTP.
fn is_bootp(msg: &v4::Message) -> bool {
    matches!(
        msg.opts().get(v4::OptionCode::MessageType),
        None | Some(v4::DhcpOption::MessageType(v4::MessageType::Unknown(0)))
    )
}

/// Runs the exchange to completion over `io`.
pub fn drive<D: Datagram + ?Sized>(
    machine: &mut DhcpV4Handler,
    io: &mut D,
    handler: &mut dyn DhcpEventHandler,
) -> Result<DhcpBinding, PxeError> {
    let mut next_action = machine.handle_event(Event::Timeout, handler)?;

    loop {
        tracing::debug!("State: {}", machine.state_name());
        let wait = match next_action {
            Action::Send(packet, addr, wait) => {
                io.send_to(&packet, addr)?;
                wait
            }
            Action::Wait(wait) => wait,
            Action::Bind(binding) => {
                tracing::info!("DHCP Bind Successful! Address: {}", binding.client_address);
                return Ok(binding);
            }
        };

        next_action = match io.recv(wait)? {
            Some(data) => machine.handle_event(Event::PacketReceived(&data), handler)?,
            None => machine.handle_event(Event::Timeout, handler)?,
        };
    }
}

/// `DhcpTransport` running the DORA state machine over any datagram channel.
pub struct DoraTransport<D> {
    io: D,
    timing: ExchangeTiming,
    options: Option<ClientOptions>,
}

impl<D: Datagram> DoraTransport<D> {
    pub fn new(io: D, timing: ExchangeTiming) -> Self {
        Self {
            io,
            timing,
            options: None,
        }
    }

    pub fn io(&self) -> &D {
        &self.io
    }
}

impl<D: Datagram> DhcpTransport for DoraTransport<D> {
    fn configure(&mut self, options: ClientOptions) -> Result<(), PxeError> {
        self.options = Some(options);
        Ok(())
    }

    fn start(&mut self, handler: &mut dyn DhcpEventHandler) -> Result<DhcpBinding, PxeError> {
        let options = self
            .options
            .clone()
            .ok_or_else(|| PxeError::Critical("DHCP transport is not configured".to_string()))?;
        let mut machine = DhcpV4Handler::new(options, self.timing);
        drive(&mut machine, &mut self.io, handler)
    }
}
