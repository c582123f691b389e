//! Minimal Teredo server answering qualification probes, with a NAT model
//! in front of the client.

use std::net::{Ipv4Addr, SocketAddrV4};

use teredo_relay::wire::{self, encode_advertisement, encode_origin, RS_SOURCE_CONE, TEREDO_PORT};
use teredo_relay::TEREDO_PREFIX;
use tracing::debug;

/// NAT between the client and the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatBehavior {
    /// Any host may reach the mapping once it exists.
    Cone,
    /// Only hosts the client already sent to may answer.
    Restricted,
    /// A fresh port per destination.
    Symmetric,
}

#[derive(Debug, Clone)]
pub struct FakeServer {
    primary: Ipv4Addr,
    nat: NatBehavior,
    mapping: SocketAddrV4,
}

impl FakeServer {
    pub fn new(primary: Ipv4Addr, nat: NatBehavior, mapping: SocketAddrV4) -> Self {
        Self { primary, nat, mapping }
    }

    pub fn primary(&self) -> Ipv4Addr {
        self.primary
    }

    pub fn secondary(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.primary).wrapping_add(1))
    }

    pub fn primary_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.primary, TEREDO_PORT)
    }

    /// The client's NAT rebinds to a new external endpoint.
    pub fn remap(&mut self, mapping: SocketAddrV4) {
        self.mapping = mapping;
    }

    pub fn mapping(&self) -> SocketAddrV4 {
        self.mapping
    }

    /// Answer a Router Solicitation the client sent to `to`.
    ///
    /// Returns the advertisement and the address it comes from, or `None`
    /// when the datagram is not for this server or the NAT would drop the
    /// reply.
    pub fn answer(&self, to: SocketAddrV4, rs: &[u8]) -> Option<(SocketAddrV4, Vec<u8>)> {
        if to.port() != TEREDO_PORT || (*to.ip() != self.primary && *to.ip() != self.secondary()) {
            return None;
        }
        let dgram = wire::decode(rs).ok()?;
        let nonce = dgram.auth?.nonce;
        let cone_probe = dgram.header.src == RS_SOURCE_CONE;

        // Cone probes are answered from the other address.
        let reply_ip = match (cone_probe, *to.ip() == self.primary) {
            (true, true) => self.secondary(),
            (true, false) => self.primary,
            (false, _) => *to.ip(),
        };
        if cone_probe && self.nat != NatBehavior::Cone {
            debug!(%reply_ip, "nat dropped cone reply");
            return None;
        }

        let observed = match self.nat {
            NatBehavior::Symmetric if *to.ip() != self.primary => {
                SocketAddrV4::new(*self.mapping.ip(), self.mapping.port().wrapping_add(1))
            }
            _ => self.mapping,
        };
        let ra = encode_advertisement(&nonce, observed, TEREDO_PREFIX, self.primary, dgram.header.src);
        Some((SocketAddrV4::new(reply_ip, TEREDO_PORT), ra))
    }

    /// Wrap `packet` the way the server relays it from a client at `origin`.
    pub fn forward(origin: SocketAddrV4, packet: &[u8]) -> Vec<u8> {
        let mut out = encode_origin(origin).to_vec();
        out.extend_from_slice(packet);
        out
    }
}
