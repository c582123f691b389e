#![forbid(unsafe_code)]

//! Remote node bookkeeping and the per-peer routing state machine.
//!
//! Every peer starts [`RoutingMode::Indirect`]: its traffic goes through a
//! Teredo server. When both ends allow it, the relay negotiates a direct path
//! with bubbles; the peer becomes [`RoutingMode::TrustedDirect`] once a packet
//! arrives straight from its mapped endpoint. Native IPv6 peers have no
//! mapping in their address; their relay is only trusted once it echoes a
//! nonce sent through our server. Like the qualification machine, the
//! methods here only decide; the relay performs the I/O.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddrV4};

use rand::Rng;
use teredo_core::RelayConfig;
use thiserror::Error;
use tokio::time::Instant;

use crate::address::TeredoAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// Through the server path.
    Indirect,
    /// Bubbles sent to the mapped endpoint, waiting for the peer to answer.
    PendingDirect,
    /// Direct UDP to the mapped endpoint.
    TrustedDirect,
}

/// Whether a direct path to `remote` may be attempted. Two restricted NATs
/// cannot open toward each other, and only Teredo peers expose a mapping.
#[must_use]
pub fn direct_allowed(local_cone: bool, remote: &TeredoAddress) -> bool {
    remote.is_teredo() && (local_cone || remote.is_cone())
}

/// Where an outbound packet goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    Direct(SocketAddrV4),
    Indirect,
    /// Packet stored in the peer; a first bubble must go to the endpoint.
    HoldAndBubble(SocketAddrV4),
}

/// Effect of a validated packet received from the peer's mapped endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectOutcome {
    /// Negotiation completed; the held packet (if any) can go out directly.
    Promoted(Option<Vec<u8>>),
    /// Already trusted.
    Refreshed,
    /// The peer reached us directly while we still route through the server.
    Unsolicited,
}

/// Maintenance verdict for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Nothing,
    Bubble(SocketAddrV4),
    /// Bubbles exhausted; the held packet must travel indirectly.
    FallBack(Option<Vec<u8>>),
    /// Trusted path went quiet.
    Demoted,
    Evict,
}

#[derive(Debug, Clone)]
pub struct Peer {
    remote_ipv6: Ipv6Addr,
    remote_mapped: Option<SocketAddrV4>,
    mode: RoutingMode,
    last_activity: Instant,
    last_transmit: Option<Instant>,
    bubble_retry_count: u8,
    next_bubble: Instant,
    held: Option<Vec<u8>>,
    last_bubble_reply: Option<Instant>,
    challenge: Option<([u8; 8], Instant)>,
}

impl Peer {
    fn new(remote_ipv6: Ipv6Addr, remote_mapped: Option<SocketAddrV4>, now: Instant) -> Self {
        Self {
            remote_ipv6,
            remote_mapped,
            mode: RoutingMode::Indirect,
            last_activity: now,
            last_transmit: None,
            bubble_retry_count: 0,
            next_bubble: now,
            held: None,
            last_bubble_reply: None,
            challenge: None,
        }
    }

    pub fn remote_ipv6(&self) -> Ipv6Addr {
        self.remote_ipv6
    }

    pub fn remote_mapped(&self) -> Option<SocketAddrV4> {
        self.remote_mapped
    }

    /// Fresh nonce to challenge a native peer's relay with, unless the relay
    /// is already known or a challenge went out less than a probe timeout ago.
    pub fn challenge(&mut self, now: Instant, cfg: &RelayConfig) -> Option<[u8; 8]> {
        if self.remote_mapped.is_some() {
            return None;
        }
        if let Some((_, at)) = self.challenge {
            if now.saturating_duration_since(at) < cfg.qualification_timeout() {
                return None;
            }
        }
        let nonce: [u8; 8] = rand::thread_rng().gen();
        self.challenge = Some((nonce, now));
        Some(nonce)
    }

    /// Whether `nonce` answers the outstanding challenge.
    pub fn answers_challenge(&self, nonce: &[u8; 8]) -> bool {
        matches!(self.challenge, Some((n, _)) if &n == nonce)
    }

    /// Pin `endpoint` as the peer's relay and route to it directly.
    pub fn confirm_relay(&mut self, endpoint: SocketAddrV4, now: Instant) {
        self.challenge = None;
        self.remote_mapped = Some(endpoint);
        self.mode = RoutingMode::TrustedDirect;
        self.touch(now);
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn last_transmit(&self) -> Option<Instant> {
        self.last_transmit
    }

    pub fn bubble_retry_count(&self) -> u8 {
        self.bubble_retry_count
    }

    pub fn has_held_packet(&self) -> bool {
        self.held.is_some()
    }

    /// Mark inbound traffic from the peer, whichever path it took.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Pick the path for `packet`; it is copied into the peer when held.
    /// While bubbles are outstanding the peer already holds one packet and
    /// later ones travel indirectly.
    pub fn route_outbound(
        &mut self,
        packet: &[u8],
        now: Instant,
        direct_ok: bool,
        cfg: &RelayConfig,
    ) -> Outbound {
        let carried_traffic = self.last_transmit.is_some();
        self.last_transmit = Some(now);
        match (self.mode, self.remote_mapped) {
            (RoutingMode::TrustedDirect, Some(endpoint)) => Outbound::Direct(endpoint),
            (RoutingMode::Indirect, Some(endpoint)) if direct_ok && carried_traffic => {
                self.mode = RoutingMode::PendingDirect;
                self.held = Some(packet.to_vec());
                self.bubble_retry_count = 1;
                self.next_bubble = now + cfg.bubble_interval();
                Outbound::HoldAndBubble(endpoint)
            }
            _ => Outbound::Indirect,
        }
    }

    /// A packet that passed anti-spoofing came straight from the mapped endpoint.
    pub fn on_direct(&mut self, now: Instant) -> DirectOutcome {
        self.touch(now);
        match self.mode {
            RoutingMode::PendingDirect => {
                self.mode = RoutingMode::TrustedDirect;
                self.bubble_retry_count = 0;
                DirectOutcome::Promoted(self.held.take())
            }
            RoutingMode::TrustedDirect => DirectOutcome::Refreshed,
            RoutingMode::Indirect => DirectOutcome::Unsolicited,
        }
    }

    /// Whether an unsolicited direct bubble deserves a bubble back. At most
    /// one reply per bubble interval, so two indirect peers cannot ping-pong.
    pub fn answer_bubble(&mut self, now: Instant, cfg: &RelayConfig) -> bool {
        match self.last_bubble_reply {
            Some(t) if now.saturating_duration_since(t) < cfg.bubble_interval() => false,
            _ => {
                self.last_bubble_reply = Some(now);
                true
            }
        }
    }

    /// Whether [`Peer::tick`] would emit a datagram at `now`.
    pub fn send_due(&self, now: Instant) -> bool {
        self.mode == RoutingMode::PendingDirect && self.remote_mapped.is_some() && now >= self.next_bubble
    }

    /// Advance timers.
    pub fn tick(&mut self, now: Instant, cfg: &RelayConfig) -> Tick {
        let last_seen = self.last_transmit.map_or(self.last_activity, |t| t.max(self.last_activity));
        if now.saturating_duration_since(last_seen) >= cfg.peer_idle_timeout() {
            return Tick::Evict;
        }
        match (self.mode, self.remote_mapped) {
            (RoutingMode::PendingDirect, Some(endpoint)) if now >= self.next_bubble => {
                if self.bubble_retry_count < cfg.bubble_retries {
                    self.bubble_retry_count += 1;
                    self.next_bubble = now + cfg.bubble_interval();
                    Tick::Bubble(endpoint)
                } else {
                    self.mode = RoutingMode::Indirect;
                    self.bubble_retry_count = 0;
                    Tick::FallBack(self.held.take())
                }
            }
            (RoutingMode::TrustedDirect, _)
                if now.saturating_duration_since(self.last_activity) >= cfg.direct_idle_timeout() =>
            {
                self.mode = RoutingMode::Indirect;
                if !TeredoAddress::from(self.remote_ipv6).is_teredo() {
                    // A native peer's relay must prove itself again.
                    self.remote_mapped = None;
                }
                Tick::Demoted
            }
            _ => Tick::Nothing,
        }
    }
}

/// Allocation refused because the table is at capacity.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("peer table full ({0} entries)")]
pub struct TableFull(pub usize);

/// Sole owner of every [`Peer`], keyed by remote IPv6 address.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<Ipv6Addr, Peer>,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self { peers: HashMap::new(), max_peers }
    }

    pub fn find(&self, addr: &Ipv6Addr) -> Option<&Peer> {
        self.peers.get(addr)
    }

    /// Return the peer for `addr`, creating it in `Indirect` mode if unseen.
    pub fn allocate(
        &mut self,
        addr: Ipv6Addr,
        mapped: Option<SocketAddrV4>,
        now: Instant,
    ) -> Result<&mut Peer, TableFull> {
        let len = self.peers.len();
        if len >= self.max_peers && !self.peers.contains_key(&addr) {
            return Err(TableFull(len));
        }
        Ok(self.peers.entry(addr).or_insert_with(|| Peer::new(addr, mapped, now)))
    }

    pub fn remove(&mut self, addr: &Ipv6Addr) -> Option<Peer> {
        self.peers.remove(addr)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Peer) -> bool) {
        self.peers.retain(|_, p| keep(p));
    }
}
