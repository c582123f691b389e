//! Conformance harness for the Teredo relay: a scripted network, a fake
//! Teredo server and a recording host.

use std::io;
use std::net::Ipv6Addr;

use teredo_relay::wire::{self, encode_echo_reply};
use teredo_relay::{Inbound, Relay, RelayHooks, Transport};

pub mod network_simulator;
pub mod teredo_server;

pub use network_simulator::{SentDatagram, SimulatedNetwork};
pub use teredo_server::{FakeServer, NatBehavior};

/// Host side of the relay; remembers every callback.
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub delivered: Vec<Vec<u8>>,
    pub ups: Vec<Ipv6Addr>,
    pub downs: usize,
    /// Make [`RelayHooks::send_ipv6_packet`] fail.
    pub refuse_delivery: bool,
}

impl RelayHooks for RecordingHost {
    fn send_ipv6_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        if self.refuse_delivery {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun device gone"));
        }
        self.delivered.push(packet.to_vec());
        Ok(())
    }

    fn notify_up(&mut self, addr: Ipv6Addr) -> io::Result<()> {
        self.ups.push(addr);
        Ok(())
    }

    fn notify_down(&mut self) -> io::Result<()> {
        self.downs += 1;
        Ok(())
    }
}

/// Let `server` answer every solicitation the relay has sent, then feed the
/// replies back. Returns how many replies were delivered.
pub fn serve_qualification<T, H>(relay: &mut Relay<T, H>, net: &SimulatedNetwork, server: &FakeServer) -> usize
where
    T: Transport,
    H: RelayHooks,
{
    let mut answered = 0;
    for sent in net.take_sent() {
        if let Some((from, ra)) = server.answer(sent.dest, &sent.payload) {
            net.inject(from, ra);
            answered += 1;
        }
    }
    while net.pending() > 0 {
        match relay.try_receive() {
            Ok(Inbound::Idle) => break,
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "relay rejected reply"),
        }
    }
    answered
}

/// Build an IPv6 UDP packet carrying `payload`.
pub fn ipv6_packet(src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![0x60, 0, 0, 0];
    p.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    p.extend_from_slice(&[17, 64]);
    p.extend_from_slice(&src.octets());
    p.extend_from_slice(&dst.octets());
    p.extend_from_slice(payload);
    p
}

/// What a native IPv6 host does with an echo request: the matching reply,
/// sent back from the request's destination.
pub fn echo_back(request: &[u8]) -> Option<Vec<u8>> {
    let dgram = wire::decode(request).ok()?;
    let nonce = wire::echo_request_nonce(&dgram)?;
    Some(encode_echo_reply(dgram.header.dst, dgram.header.src, &nonce))
}
