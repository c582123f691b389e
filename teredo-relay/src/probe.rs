#![forbid(unsafe_code)]

//! Qualification bookkeeping owned by the relay.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use rand::Rng;
use tokio::time::Instant;

/// Where the client stands in the qualification procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing outstanding; a probe cycle starts on the next maintenance pass.
    Idle,
    /// Solicitations carry the cone flag and the server answers from its
    /// secondary address.
    ProbingConeNat,
    /// Solicitations without the cone flag, then a confirmation probe to the
    /// secondary address to check the mapping does not depend on destination.
    ProbingRestrictedNat,
    /// Address assigned; keepalive solicitations refresh the NAT binding.
    Qualified,
    /// Retry budget exhausted; waiting out the restart delay.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::ProbingConeNat => "probing-cone",
            Phase::ProbingRestrictedNat => "probing-restricted",
            Phase::Qualified => "qualified",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Retry counter bounded to the 0..=7 range of the original 3-bit field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RetryCount(u8);

impl RetryCount {
    pub const MAX: u8 = 7;

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Saturating increment.
    pub fn bump(&mut self) {
        self.0 = (self.0 + 1).min(Self::MAX);
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Single probe context, reused across qualification cycles.
#[derive(Debug, Clone)]
pub struct ProbeState {
    pub phase: Phase,
    pub retry_count: RetryCount,
    pub nonce: [u8; 8],
    pub next_probe_deadline: Instant,
    /// When a failed client may start over.
    pub server_retry_deadline: Instant,
    /// Address the outstanding solicitation was sent to.
    pub probed_server: Ipv4Addr,
    /// Mapping seen by the first restricted-phase reply, awaiting confirmation.
    pub pending_mapping: Option<SocketAddrV4>,
}

impl ProbeState {
    pub fn new(now: Instant) -> Self {
        Self {
            phase: Phase::Idle,
            retry_count: RetryCount::default(),
            nonce: [0; 8],
            next_probe_deadline: now,
            server_retry_deadline: now,
            probed_server: Ipv4Addr::UNSPECIFIED,
            pending_mapping: None,
        }
    }

    /// Draw the nonce for the next solicitation.
    pub fn renew_nonce(&mut self) -> [u8; 8] {
        self.nonce = rand::thread_rng().gen();
        self.nonce
    }

    /// Enter `phase` with a fresh retry budget.
    pub fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.retry_count.reset();
        self.pending_mapping = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_count_saturates() {
        let mut c = RetryCount::default();
        for _ in 0..20 {
            c.bump();
        }
        assert_eq!(c.get(), RetryCount::MAX);
        c.reset();
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn nonce_changes_between_probes() {
        let mut p = ProbeState::new(Instant::now());
        let a = p.renew_nonce();
        let b = p.renew_nonce();
        assert_ne!(a, b);
        assert_eq!(p.nonce, b);
    }

    #[test]
    fn enter_clears_cycle_state() {
        let mut p = ProbeState::new(Instant::now());
        p.retry_count.bump();
        p.pending_mapping = Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        p.enter(Phase::ProbingRestrictedNat);
        assert_eq!(p.phase, Phase::ProbingRestrictedNat);
        assert_eq!(p.retry_count.get(), 0);
        assert!(p.pending_mapping.is_none());
    }
}
