#![forbid(unsafe_code)]

//! The relay session: packet pipeline and maintenance.
//!
//! A [`Relay`] runs in one of two modes fixed at construction:
//!
//! * **relay** (manual): a prefix is configured, no qualification runs, and
//!   only Teredo destinations are routable;
//! * **client**: the address is obtained by qualifying against a server and
//!   stays valid only while keepalives succeed.
//!
//! Everything is caller-driven. `send` and `process` never wait; `receive`
//! awaits socket readiness and then handles exactly one datagram.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

use teredo_core::RelayConfig;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::address::TeredoAddress;
use crate::icmp::{UnreachableNotifier, UnreachableReason};
use crate::peer::{direct_allowed, DirectOutcome, Outbound, PeerTable, Tick};
use crate::probe::{Phase, ProbeState};
use crate::qualification::{Event, Qualifier, Reply, Step};
use crate::transport::{Transport, UdpTransport};
use crate::wire::{self, Datagram, Ipv6Header, TEREDO_PORT};
use crate::{Error, Result};

/// Largest UDP payload accepted from the socket.
const RECV_BUFFER: usize = 65_535;

/// Most datagrams one [`Relay::process`] call sends for peer maintenance.
/// Peers left over stay due and are served by the next call.
pub const MAINTENANCE_SEND_BUDGET: usize = 16;

/// Host integration: where decapsulated packets go and who hears about
/// address changes.
pub trait RelayHooks {
    /// Deliver a decapsulated IPv6 packet (or a locally generated ICMPv6
    /// error) to the host stack.
    fn send_ipv6_packet(&mut self, packet: &[u8]) -> io::Result<()>;

    /// The client obtained `addr`.
    fn notify_up(&mut self, _addr: Ipv6Addr) -> io::Result<()> {
        Ok(())
    }

    /// The client lost its address.
    fn notify_down(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Monotonic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub sent: u64,
    pub received: u64,
    pub delivered: u64,
    pub bubbles_sent: u64,
    pub bubbles_received: u64,
    pub malformed: u64,
    pub spoofed: u64,
    pub unroutable: u64,
    pub icmp_sent: u64,
    pub hook_failures: u64,
}

/// Why an inbound datagram was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    /// Failed the source checks.
    Spoofed,
    /// Inner source is our own address.
    Reflected,
    /// Client mode: inner destination is not our address.
    NotForUs,
    /// Client mode: data arrived before qualification.
    NotQualified,
    /// Qualification traffic the session cannot use.
    Unexpected,
}

/// What one inbound datagram amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Handed to [`RelayHooks::send_ipv6_packet`].
    Delivered,
    Bubble,
    /// Consumed by qualification.
    Qualification,
    /// Echo reply that authenticated a native peer's relay; consumed.
    RelayConfirmed,
    Dropped(DropReason),
    /// Readiness was spurious; nothing was read.
    Idle,
}

/// How a datagram reached us, once its source is vouched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Direct,
    Server,
    /// Echo reply carrying a native peer's outstanding challenge nonce.
    Learned,
}

/// A Teredo relay or client bound to one UDP endpoint.
pub struct Relay<T: Transport, H: RelayHooks> {
    transport: T,
    hooks: H,
    config: RelayConfig,
    local_address: TeredoAddress,
    qualifier: Option<Qualifier>,
    peers: PeerTable,
    notifier: UnreachableNotifier,
    stats: RelayStats,
    recv_buf: Vec<u8>,
}

impl<H: RelayHooks> Relay<UdpTransport, H> {
    /// Bind `ipv4:port` and start a manual relay.
    pub async fn bind_relay(
        port: u16,
        ipv4: Ipv4Addr,
        prefix: u32,
        cone: bool,
        config: RelayConfig,
        hooks: H,
    ) -> Result<Self> {
        let transport = UdpTransport::bind(SocketAddrV4::new(ipv4, port)).await?;
        Self::new_relay(transport, prefix, cone, config, hooks)
    }

    /// Bind `ipv4:port` and start a client of `server_ip`.
    pub async fn bind_client(
        port: u16,
        ipv4: Ipv4Addr,
        server_ip: Ipv4Addr,
        config: RelayConfig,
        hooks: H,
    ) -> Result<Self> {
        let transport = UdpTransport::bind(SocketAddrV4::new(ipv4, port)).await?;
        Self::new_client(transport, server_ip, config, hooks)
    }
}

impl<T: Transport, H: RelayHooks> Relay<T, H> {
    /// Relay with a manually configured prefix. No qualification runs.
    pub fn new_relay(transport: T, prefix: u32, cone: bool, config: RelayConfig, hooks: H) -> Result<Self> {
        let local_address = TeredoAddress::relay(prefix, cone);
        if !local_address.is_teredo() {
            warn!(prefix = format_args!("{prefix:#010x}"), "relay prefix is not the teredo prefix; relay stays down");
        }
        let relay = Self::assemble(transport, hooks, config, local_address, None)?;
        info!(%local_address, cone, "teredo relay started");
        Ok(relay)
    }

    /// Client of `server_ip`. Qualification starts on the first [`Relay::process`].
    pub fn new_client(transport: T, server_ip: Ipv4Addr, config: RelayConfig, hooks: H) -> Result<Self> {
        if server_ip.is_unspecified() {
            return Err(teredo_core::CoreError::invalid("teredo server address must be set").into());
        }
        let qualifier = Qualifier::new(server_ip, Instant::now());
        let relay = Self::assemble(transport, hooks, config, TeredoAddress::UNSPECIFIED, Some(qualifier))?;
        info!(server = %server_ip, "teredo client started");
        Ok(relay)
    }

    fn assemble(
        transport: T,
        hooks: H,
        config: RelayConfig,
        local_address: TeredoAddress,
        qualifier: Option<Qualifier>,
    ) -> Result<Self> {
        config.validate()?;
        let now = Instant::now();
        Ok(Self {
            transport,
            hooks,
            peers: PeerTable::new(config.max_peers),
            notifier: UnreachableNotifier::new(config.icmp_rate_limit, now),
            config,
            local_address,
            qualifier,
            stats: RelayStats::default(),
            recv_buf: vec![0; RECV_BUFFER],
        })
    }

    pub fn local_address(&self) -> TeredoAddress {
        self.local_address
    }

    pub fn prefix(&self) -> u32 {
        self.local_address.prefix()
    }

    /// Server the client qualifies against; unspecified for a relay.
    pub fn server_ip(&self) -> Ipv4Addr {
        self.qualifier.as_ref().map_or(Ipv4Addr::UNSPECIFIED, Qualifier::server)
    }

    pub fn server_ip2(&self) -> Ipv4Addr {
        self.qualifier.as_ref().map_or(Ipv4Addr::UNSPECIFIED, Qualifier::server2)
    }

    pub fn is_cone(&self) -> bool {
        self.local_address.is_cone()
    }

    pub fn mapped_port(&self) -> u16 {
        self.local_address.mapped_port()
    }

    pub fn mapped_ip(&self) -> Ipv4Addr {
        self.local_address.mapped_ipv4()
    }

    pub fn is_client(&self) -> bool {
        !self.server_ip().is_unspecified()
    }

    pub fn is_relay(&self) -> bool {
        !self.is_client()
    }

    /// Relays run while their prefix is valid; clients additionally need to
    /// be qualified.
    pub fn is_running(&self) -> bool {
        let qualified = self.qualifier.as_ref().map_or(true, |q| q.probe().phase == Phase::Qualified);
        qualified && self.local_address.is_teredo()
    }

    /// Qualification state; `None` for a relay.
    pub fn probe(&self) -> Option<&ProbeState> {
        self.qualifier.as_ref().map(Qualifier::probe)
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Resolves once a datagram may be waiting.
    pub async fn readable(&self) -> Result<()> {
        Ok(self.transport.readable().await?)
    }

    /// Tunnel one IPv6 packet from the host.
    #[instrument(level = "debug", skip_all, fields(len = packet.len()))]
    pub fn send(&mut self, packet: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(match self.probe().map(|p| p.phase) {
                Some(Phase::Failed) => Error::QualificationFailed,
                _ => Error::NotRunning,
            });
        }
        let header = match Ipv6Header::parse(packet) {
            Ok(h) => h,
            Err(e) => {
                self.stats.malformed += 1;
                return Err(e);
            }
        };
        let dst = TeredoAddress::from(header.dst);
        if self.is_relay() && !dst.is_teredo() {
            debug!(dst = %header.dst, "relay cannot route outside the teredo prefix");
            return self.unroutable(UnreachableReason::AddressUnreachable, packet);
        }

        let now = Instant::now();
        let mapped = dst.is_teredo().then(|| dst.mapped_endpoint());
        let direct_ok = direct_allowed(self.local_address.is_cone(), &dst);
        let (route, challenge) = match self.peers.allocate(header.dst, mapped, now) {
            Ok(peer) => {
                let route = peer.route_outbound(packet, now, direct_ok, &self.config);
                let challenge = if dst.is_teredo() { None } else { peer.challenge(now, &self.config) };
                (route, challenge)
            }
            Err(full) => {
                warn!(dst = %header.dst, "{full}");
                return self.unroutable(UnreachableReason::NoRoute, packet);
            }
        };

        let sent = match route {
            Outbound::Direct(endpoint) => self.transmit(packet, endpoint),
            Outbound::Indirect => {
                let server = self.server_path(&dst);
                self.transmit(packet, server)
            }
            Outbound::HoldAndBubble(endpoint) => {
                info!(peer = %header.dst, %endpoint, "negotiating direct path");
                self.send_bubble(header.dst, endpoint)
            }
        };
        if let (Ok(()), Some(nonce)) = (&sent, challenge) {
            self.challenge_relay(header.dst, &nonce);
        }
        sent
    }

    /// Wait for the socket and handle one datagram.
    pub async fn receive(&mut self) -> Result<Inbound> {
        self.transport.readable().await?;
        self.try_receive()
    }

    /// Handle at most one datagram without waiting.
    pub fn try_receive(&mut self) -> Result<Inbound> {
        let mut buf = std::mem::take(&mut self.recv_buf);
        let result = match self.transport.try_recv_from(&mut buf) {
            Ok((len, src)) => self.handle_datagram(&buf[..len], src),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Inbound::Idle),
            Err(e) => Err(e.into()),
        };
        self.recv_buf = buf;
        result
    }

    /// Demultiplex one UDP payload received from `src`.
    #[instrument(level = "debug", skip_all, fields(%src, len = data.len()))]
    pub fn handle_datagram(&mut self, data: &[u8], src: SocketAddr) -> Result<Inbound> {
        self.stats.received += 1;
        let SocketAddr::V4(src) = src else {
            return Ok(self.drop_datagram(DropReason::Malformed));
        };
        let dgram = match wire::decode(data) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "undecodable datagram");
                return Ok(self.drop_datagram(DropReason::Malformed));
            }
        };
        let now = Instant::now();

        if dgram.auth.is_some() || dgram.is_router_advertisement() {
            return self.on_qualification_reply(now, src, &dgram);
        }

        if self.is_client() && !self.is_running() {
            return Ok(self.drop_datagram(DropReason::NotQualified));
        }
        if self.local_address.is_teredo() && dgram.header.src == self.local_address.to_ipv6() {
            return Ok(self.drop_datagram(DropReason::Reflected));
        }
        if self.is_client() && dgram.header.dst != self.local_address.to_ipv6() {
            return Ok(self.drop_datagram(DropReason::NotForUs));
        }
        let path = match self.classify(src, &dgram) {
            Ok(path) => path,
            Err(e) => {
                debug!(inner = %dgram.header.src, error = %e, "source check failed");
                return Ok(self.drop_datagram(DropReason::Spoofed));
            }
        };

        self.on_peer_traffic(now, src, &dgram, path);

        if path == Path::Learned {
            return Ok(Inbound::RelayConfirmed);
        }
        if dgram.is_bubble() {
            self.stats.bubbles_received += 1;
            return Ok(Inbound::Bubble);
        }
        if let Err(e) = self.hooks.send_ipv6_packet(dgram.packet) {
            self.stats.hook_failures += 1;
            warn!(error = %e, "ipv6 delivery failed");
            return Err(e.into());
        }
        self.stats.delivered += 1;
        Ok(Inbound::Delivered)
    }

    /// Advance qualification, keepalives and every peer's timers.
    ///
    /// All work runs even when a send fails; the first failure is returned.
    #[instrument(level = "debug", skip_all)]
    pub fn process(&mut self) -> Result<()> {
        let now = Instant::now();
        let mut outcome = Ok(());
        if let Some(q) = self.qualifier.as_mut() {
            let step = q.poll(now, &self.config, self.local_address);
            outcome = self.apply_step(step);
        }
        if let Err(e) = self.maintain_peers(now) {
            outcome = outcome.and(Err(e));
        }
        outcome
    }

    fn on_qualification_reply(&mut self, now: Instant, src: SocketAddrV4, dgram: &Datagram<'_>) -> Result<Inbound> {
        let Some(q) = self.qualifier.as_mut() else {
            return Ok(self.drop_datagram(DropReason::Unexpected));
        };
        if src.port() != TEREDO_PORT || !q.is_server(*src.ip()) {
            debug!(%src, "qualification traffic from a stranger");
            return Ok(self.drop_datagram(DropReason::Spoofed));
        }
        let (Some(auth), Some(mapping)) = (dgram.auth, dgram.origin) else {
            return Ok(self.drop_datagram(DropReason::Unexpected));
        };
        let adv = match wire::parse_advertisement(dgram) {
            Ok(adv) => adv,
            Err(e) => {
                debug!(error = %e, "unusable router advertisement");
                return Ok(self.drop_datagram(DropReason::Malformed));
            }
        };
        let reply = Reply { from: src, nonce: auth.nonce, mapping, adv };
        let step = q.on_advertisement(now, &self.config, &reply, self.local_address);
        self.apply_step(step)?;
        Ok(Inbound::Qualification)
    }

    /// Anti-spoofing: decide whether `src` may speak for the inner source.
    fn classify(&self, src: SocketAddrV4, dgram: &Datagram<'_>) -> Result<Path> {
        let inner = TeredoAddress::from(dgram.header.src);
        let from_own_server = self.is_client() && src.port() == TEREDO_PORT && src.ip() == &self.server_ip();

        if inner.is_teredo() {
            let claimed = inner.mapped_endpoint();
            if src == claimed {
                return Ok(Path::Direct);
            }
            let via_server =
                src.port() == TEREDO_PORT && (*src.ip() == inner.server_ip() || from_own_server);
            if via_server && dgram.origin == Some(claimed) {
                return Ok(Path::Server);
            }
            return Err(Error::AntiSpoofRejected);
        }

        if self.is_client() {
            let peer = self.peers.find(&dgram.header.src);
            let answered = wire::echo_reply_nonce(dgram)
                .zip(peer)
                .is_some_and(|(nonce, peer)| peer.answers_challenge(&nonce));
            if answered {
                return Ok(Path::Learned);
            }
            if from_own_server {
                return Ok(Path::Server);
            }
            if peer.and_then(|p| p.remote_mapped()) == Some(src) {
                return Ok(Path::Direct);
            }
        }
        Err(Error::AntiSpoofRejected)
    }

    fn on_peer_traffic(&mut self, now: Instant, src: SocketAddrV4, dgram: &Datagram<'_>, path: Path) {
        let remote = dgram.header.src;
        let inner = TeredoAddress::from(remote);
        let mapped = inner.is_teredo().then(|| inner.mapped_endpoint());
        let direct_ok = direct_allowed(self.local_address.is_cone(), &inner);

        let (outcome, reply_bubble) = match self.peers.allocate(remote, mapped, now) {
            Ok(peer) => match path {
                Path::Server => {
                    peer.touch(now);
                    (None, false)
                }
                Path::Learned => {
                    info!(peer = %remote, relay = %src, "relay endpoint confirmed");
                    peer.confirm_relay(src, now);
                    (None, false)
                }
                Path::Direct => {
                    let outcome = peer.on_direct(now);
                    let reply = outcome == DirectOutcome::Unsolicited
                        && dgram.is_bubble()
                        && direct_ok
                        && peer.answer_bubble(now, &self.config);
                    (Some(outcome), reply)
                }
            },
            Err(full) => {
                debug!(peer = %remote, "{full}; traffic not tracked");
                (None, false)
            }
        };

        if let Some(DirectOutcome::Promoted(held)) = outcome {
            info!(peer = %remote, endpoint = %src, "direct path confirmed");
            if let Some(packet) = held {
                if let Err(e) = self.transmit(&packet, src) {
                    debug!(error = %e, "held packet lost");
                }
            }
        }
        if reply_bubble {
            if let Err(e) = self.send_bubble(remote, src) {
                debug!(error = %e, "bubble reply lost");
            }
        }
    }

    fn maintain_peers(&mut self, now: Instant) -> Result<()> {
        let mut work = Vec::new();
        let mut budget = MAINTENANCE_SEND_BUDGET;
        let mut deferred = 0usize;
        let cfg = &self.config;
        for peer in self.peers.iter_mut() {
            if peer.send_due(now) {
                if budget == 0 {
                    deferred += 1;
                    continue;
                }
                budget -= 1;
            }
            match peer.tick(now, cfg) {
                Tick::Nothing => {}
                tick => work.push((peer.remote_ipv6(), tick)),
            }
        }
        if deferred > 0 {
            debug!(deferred, "send budget spent, remaining peers wait for the next call");
        }

        let mut outcome = Ok(());
        for (remote, tick) in work {
            let sent = match tick {
                Tick::Bubble(endpoint) => self.send_bubble(remote, endpoint),
                Tick::FallBack(held) => {
                    info!(peer = %remote, "direct path unconfirmed, back to server path");
                    match held {
                        Some(packet) => {
                            let server = self.server_path(&TeredoAddress::from(remote));
                            self.transmit(&packet, server)
                        }
                        None => Ok(()),
                    }
                }
                Tick::Demoted => {
                    info!(peer = %remote, "direct path idle, back to server path");
                    Ok(())
                }
                Tick::Evict => {
                    debug!(peer = %remote, "evicting idle peer");
                    self.peers.remove(&remote);
                    Ok(())
                }
                Tick::Nothing => Ok(()),
            };
            if let Err(e) = sent {
                outcome = outcome.and(Err(e));
            }
        }
        outcome
    }

    fn apply_step(&mut self, step: Step) -> Result<()> {
        match step.event {
            Some(Event::Up(addr)) => {
                self.local_address = addr;
                if let Err(e) = self.hooks.notify_up(addr.to_ipv6()) {
                    self.hook_failed("up", &e);
                }
            }
            Some(Event::Down) => {
                self.local_address = TeredoAddress::UNSPECIFIED;
                self.peers.clear();
                if let Err(e) = self.hooks.notify_down() {
                    self.hook_failed("down", &e);
                }
            }
            None => {}
        }
        if let Some(s) = step.solicit {
            let rs = wire::encode_solicitation(&s.nonce, s.cone);
            debug!(to = %s.to, cone = s.cone, "router solicitation");
            self.transmit(&rs, SocketAddrV4::new(s.to, TEREDO_PORT))?;
        }
        Ok(())
    }

    /// The server a packet for `dst` goes through when not sent directly.
    fn server_path(&self, dst: &TeredoAddress) -> SocketAddrV4 {
        let server = if dst.is_teredo() { dst.server_ip() } else { self.server_ip() };
        SocketAddrV4::new(server, TEREDO_PORT)
    }

    fn transmit(&mut self, buf: &[u8], dest: SocketAddrV4) -> Result<()> {
        match self.transport.try_send_to(buf, dest) {
            Ok(_) => {
                self.stats.sent += 1;
                Ok(())
            }
            Err(e) => {
                debug!(%dest, error = %e, "udp send failed");
                Err(e.into())
            }
        }
    }

    /// Send `nonce` to a native peer through our server. Whichever endpoint
    /// echoes it back is the peer's relay.
    fn challenge_relay(&mut self, remote: Ipv6Addr, nonce: &[u8; 8]) {
        let echo = wire::encode_echo_request(self.local_address.to_ipv6(), remote, nonce);
        let server = SocketAddrV4::new(self.server_ip(), TEREDO_PORT);
        match self.transmit(&echo, server) {
            Ok(()) => debug!(peer = %remote, "relay challenge sent"),
            Err(e) => debug!(peer = %remote, error = %e, "relay challenge lost"),
        }
    }

    fn send_bubble(&mut self, remote: Ipv6Addr, endpoint: SocketAddrV4) -> Result<()> {
        let bubble = wire::encode_bubble(self.local_address.to_ipv6(), remote);
        self.transmit(&bubble, endpoint)?;
        self.stats.bubbles_sent += 1;
        Ok(())
    }

    fn unroutable(&mut self, reason: UnreachableReason, packet: &[u8]) -> Result<()> {
        self.stats.unroutable += 1;
        self.notify_unreachable(reason, packet);
        Err(Error::Unroutable(reason))
    }

    /// Hand an ICMPv6 Destination Unreachable for `original` to the host.
    /// Best-effort: suppressed, rate-limited and hook failures are only counted.
    pub fn notify_unreachable(&mut self, reason: UnreachableReason, original: &[u8]) {
        let our_addr = (self.is_client() && self.is_running()).then(|| self.local_address.to_ipv6());
        if let Some(msg) = self.notifier.notify(Instant::now(), reason, original, our_addr) {
            match self.hooks.send_ipv6_packet(&msg) {
                Ok(()) => self.stats.icmp_sent += 1,
                Err(e) => self.hook_failed("unreachable", &e),
            }
        }
    }

    fn drop_datagram(&mut self, reason: DropReason) -> Inbound {
        match reason {
            DropReason::Malformed => self.stats.malformed += 1,
            DropReason::Spoofed => self.stats.spoofed += 1,
            _ => {}
        }
        debug!(?reason, "datagram dropped");
        Inbound::Dropped(reason)
    }

    fn hook_failed(&mut self, hook: &'static str, e: &io::Error) {
        self.stats.hook_failures += 1;
        warn!(hook, error = %e, "host hook failed");
    }
}
