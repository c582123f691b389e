#![forbid(unsafe_code)]

//! Client qualification against a Teredo server (RFC 4380 §5.2.1).
//!
//! The machine never touches the socket. [`Qualifier::poll`] and
//! [`Qualifier::on_advertisement`] return a [`Step`] describing the
//! solicitation to emit and the up/down transition to report; the relay
//! executes it. This keeps every timer decision testable with plain values.

use std::net::{Ipv4Addr, SocketAddrV4};

use teredo_core::RelayConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::{TeredoAddress, FLAG_CONE};
use crate::probe::{Phase, ProbeState};
use crate::wire::Advertisement;

/// A Router Solicitation the relay must send to `to:3544`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Solicit {
    pub to: Ipv4Addr,
    pub cone: bool,
    pub nonce: [u8; 8],
}

/// A validated Router Advertisement as the machine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// UDP source of the advertisement.
    pub from: SocketAddrV4,
    /// Nonce echoed in the authentication header.
    pub nonce: [u8; 8],
    /// Client mapping from the origin indication.
    pub mapping: SocketAddrV4,
    pub adv: Advertisement,
}

/// Qualification transitions visible to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Up(TeredoAddress),
    Down,
}

/// Work produced by one advance of the machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Step {
    pub solicit: Option<Solicit>,
    pub event: Option<Event>,
}

/// Qualification state machine for one client.
#[derive(Debug, Clone)]
pub struct Qualifier {
    probe: ProbeState,
    server: Ipv4Addr,
    server2: Ipv4Addr,
    awaiting_refresh: bool,
}

impl Qualifier {
    /// `server2` is the server's secondary address, conventionally the
    /// primary address plus one.
    pub fn new(server: Ipv4Addr, now: Instant) -> Self {
        let server2 = Ipv4Addr::from(u32::from(server).wrapping_add(1));
        Self { probe: ProbeState::new(now), server, server2, awaiting_refresh: false }
    }

    pub fn probe(&self) -> &ProbeState {
        &self.probe
    }

    pub fn server(&self) -> Ipv4Addr {
        self.server
    }

    pub fn server2(&self) -> Ipv4Addr {
        self.server2
    }

    /// Whether `ip` is one of the two server addresses.
    pub fn is_server(&self, ip: Ipv4Addr) -> bool {
        ip == self.server || ip == self.server2
    }

    /// Deadline-driven advance; called from maintenance.
    pub fn poll(&mut self, now: Instant, cfg: &RelayConfig, current: TeredoAddress) -> Step {
        match self.probe.phase {
            Phase::Idle => self.start_cycle(now, cfg),
            Phase::Failed => {
                if now >= self.probe.server_retry_deadline {
                    debug!("qualification restart delay elapsed");
                    self.probe.enter(Phase::Idle);
                }
                Step::default()
            }
            Phase::ProbingConeNat | Phase::ProbingRestrictedNat if now >= self.probe.next_probe_deadline => {
                self.on_probe_timeout(now, cfg)
            }
            Phase::Qualified if now >= self.probe.next_probe_deadline => {
                if self.awaiting_refresh {
                    self.on_refresh_timeout(now, cfg, current)
                } else {
                    self.awaiting_refresh = true;
                    let to = self.server;
                    self.solicit(now, cfg, to, current.is_cone())
                }
            }
            _ => Step::default(),
        }
    }

    /// Feed a server reply; `current` is the address the relay holds now.
    pub fn on_advertisement(
        &mut self,
        now: Instant,
        cfg: &RelayConfig,
        reply: &Reply,
        current: TeredoAddress,
    ) -> Step {
        let Reply { from, mapping, adv, .. } = *reply;
        if !self.is_server(*from.ip()) || reply.nonce != self.probe.nonce {
            debug!(%from, "unsolicited router advertisement ignored");
            return Step::default();
        }

        match self.probe.phase {
            Phase::ProbingConeNat if *from.ip() == self.server2 => {
                self.qualify(now, cfg, &adv, mapping, true)
            }
            Phase::ProbingConeNat => {
                // The primary address answered a cone probe: restricted NAT,
                // confirm the mapping through the secondary address.
                self.probe.enter(Phase::ProbingRestrictedNat);
                self.confirm(now, cfg, mapping)
            }
            Phase::ProbingRestrictedNat => match self.probe.pending_mapping {
                None => self.confirm(now, cfg, mapping),
                Some(seen) if seen == mapping => self.qualify(now, cfg, &adv, mapping, false),
                Some(seen) => {
                    warn!(%seen, %mapping, "mapping depends on destination (symmetric NAT)");
                    self.fail(now, cfg)
                }
            },
            Phase::Qualified => {
                if mapping == current.mapped_endpoint() {
                    self.awaiting_refresh = false;
                    self.probe.retry_count.reset();
                    self.probe.next_probe_deadline = now + cfg.refresh_interval();
                    Step::default()
                } else {
                    info!(old = %current.mapped_endpoint(), new = %mapping, "NAT mapping changed, requalifying");
                    let mut step = self.start_cycle(now, cfg);
                    step.event = Some(Event::Down);
                    step
                }
            }
            Phase::Idle | Phase::Failed => Step::default(),
        }
    }

    fn start_cycle(&mut self, now: Instant, cfg: &RelayConfig) -> Step {
        self.awaiting_refresh = false;
        self.probe.enter(Phase::ProbingConeNat);
        let to = self.server;
        self.solicit(now, cfg, to, true)
    }

    fn confirm(&mut self, now: Instant, cfg: &RelayConfig, mapping: SocketAddrV4) -> Step {
        self.probe.retry_count.reset();
        self.probe.pending_mapping = Some(mapping);
        let to = self.server2;
        self.solicit(now, cfg, to, false)
    }

    fn on_probe_timeout(&mut self, now: Instant, cfg: &RelayConfig) -> Step {
        self.probe.retry_count.bump();
        let count = self.probe.retry_count.get();
        debug!(phase = %self.probe.phase, count, "qualification probe timed out");
        if count < cfg.qualification_retries {
            let to = self.probe.probed_server;
            let cone = self.probe.phase == Phase::ProbingConeNat;
            return self.solicit(now, cfg, to, cone);
        }
        match self.probe.phase {
            Phase::ProbingConeNat => {
                // Restricted NATs drop the cone reply from the secondary address.
                self.probe.enter(Phase::ProbingRestrictedNat);
                let to = self.server;
                self.solicit(now, cfg, to, false)
            }
            _ => self.fail(now, cfg),
        }
    }

    fn on_refresh_timeout(&mut self, now: Instant, cfg: &RelayConfig, current: TeredoAddress) -> Step {
        self.probe.retry_count.bump();
        if self.probe.retry_count.get() < cfg.qualification_retries {
            let to = self.server;
            return self.solicit(now, cfg, to, current.is_cone());
        }
        warn!("server stopped answering keepalives");
        self.fail(now, cfg)
    }

    fn qualify(
        &mut self,
        now: Instant,
        cfg: &RelayConfig,
        adv: &Advertisement,
        mapping: SocketAddrV4,
        cone: bool,
    ) -> Step {
        let flags = if cone { FLAG_CONE } else { 0 };
        let addr = TeredoAddress::new(adv.prefix, adv.server, flags, mapping);
        self.probe.enter(Phase::Qualified);
        self.awaiting_refresh = false;
        self.probe.next_probe_deadline = now + cfg.refresh_interval();
        info!(%addr, cone, "qualified");
        Step { solicit: None, event: Some(Event::Up(addr)) }
    }

    fn fail(&mut self, now: Instant, cfg: &RelayConfig) -> Step {
        self.probe.phase = Phase::Failed;
        self.probe.pending_mapping = None;
        self.awaiting_refresh = false;
        self.probe.server_retry_deadline = now + cfg.restart_delay();
        warn!(retry_in = ?cfg.restart_delay(), "qualification failed");
        Step { solicit: None, event: Some(Event::Down) }
    }

    fn solicit(&mut self, now: Instant, cfg: &RelayConfig, to: Ipv4Addr, cone: bool) -> Step {
        let nonce = self.probe.renew_nonce();
        self.probe.probed_server = to;
        self.probe.next_probe_deadline = now + cfg.qualification_timeout();
        Step { solicit: Some(Solicit { to, cone, nonce }), event: None }
    }
}
