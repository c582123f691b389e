#![forbid(unsafe_code)]

//! ICMPv6 Destination Unreachable generation (RFC 4443 §3.1).
//!
//! Errors are never generated about ICMPv6 errors, unspecified or multicast
//! sources, or multicast destinations, and never faster than the configured
//! per-second budget.

use std::fmt;
use std::net::Ipv6Addr;
use std::time::Duration;

use tokio::time::Instant;

use crate::wire::{icmpv6_checksum, IPPROTO_ICMPV6, IPV6_HEADER_LEN};

const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_HEADER_LEN: usize = 8;
/// An error message must fit the IPv6 minimum MTU.
const MIN_IPV6_MTU: usize = 1280;
const MAX_QUOTED: usize = MIN_IPV6_MTU - IPV6_HEADER_LEN - ICMPV6_HEADER_LEN;
const HOP_LIMIT: u8 = 255;

/// Destination Unreachable codes used by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnreachableReason {
    /// Peer table exhausted.
    NoRoute = 0,
    /// Destination outside the Teredo prefix while acting as a relay.
    AddressUnreachable = 3,
    PortUnreachable = 4,
}

impl UnreachableReason {
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for UnreachableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnreachableReason::NoRoute => "no route to destination",
            UnreachableReason::AddressUnreachable => "address unreachable",
            UnreachableReason::PortUnreachable => "port unreachable",
        };
        f.write_str(s)
    }
}

/// Whether `packet` may be answered with an ICMPv6 error at all.
#[must_use]
pub fn should_notify(packet: &[u8]) -> bool {
    if packet.len() < IPV6_HEADER_LEN || packet[0] >> 4 != 6 {
        return false;
    }
    let src = addr_at(packet, 8);
    let dst = addr_at(packet, 24);
    if src.is_unspecified() || src.is_multicast() || dst.is_multicast() {
        return false;
    }
    // Types below 128 are errors.
    !(packet[6] == IPPROTO_ICMPV6 && packet.len() > IPV6_HEADER_LEN && packet[IPV6_HEADER_LEN] < 128)
}

fn addr_at(packet: &[u8], at: usize) -> Ipv6Addr {
    let mut o = [0u8; 16];
    o.copy_from_slice(&packet[at..at + 16]);
    Ipv6Addr::from(o)
}

/// Build the error for `original`, quoting as much of it as fits.
///
/// The message comes from `our_addr` when given, otherwise from the
/// unreachable destination itself, and goes back to the original source.
#[must_use]
pub fn build_dest_unreachable(
    original: &[u8],
    reason: UnreachableReason,
    our_addr: Option<Ipv6Addr>,
) -> Option<Vec<u8>> {
    if original.len() < IPV6_HEADER_LEN {
        return None;
    }
    let src = our_addr.unwrap_or_else(|| addr_at(original, 24));
    let dst = addr_at(original, 8);
    let quoted = &original[..original.len().min(MAX_QUOTED)];

    let mut icmp = Vec::with_capacity(ICMPV6_HEADER_LEN + quoted.len());
    icmp.extend_from_slice(&[ICMPV6_DEST_UNREACHABLE, reason.code(), 0, 0, 0, 0, 0, 0]);
    icmp.extend_from_slice(quoted);
    let sum = icmpv6_checksum(src, dst, &icmp);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());

    let mut out = Vec::with_capacity(IPV6_HEADER_LEN + icmp.len());
    out.extend_from_slice(&[0x60, 0, 0, 0]);
    out.extend_from_slice(&(icmp.len() as u16).to_be_bytes());
    out.push(IPPROTO_ICMPV6);
    out.push(HOP_LIMIT);
    out.extend_from_slice(&src.octets());
    out.extend_from_slice(&dst.octets());
    out.extend_from_slice(&icmp);
    Some(out)
}

/// Fixed one-second window limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    per_second: u32,
    window_start: Instant,
    used: u32,
}

impl RateLimiter {
    pub fn new(per_second: u32, now: Instant) -> Self {
        Self { per_second, window_start: now, used: 0 }
    }

    /// Take one token if the current window has any left.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.used = 0;
        }
        if self.used < self.per_second {
            self.used += 1;
            true
        } else {
            false
        }
    }
}

/// Filter plus limiter in front of [`build_dest_unreachable`].
#[derive(Debug, Clone)]
pub struct UnreachableNotifier {
    limiter: RateLimiter,
}

impl UnreachableNotifier {
    pub fn new(per_second: u32, now: Instant) -> Self {
        Self { limiter: RateLimiter::new(per_second, now) }
    }

    /// The ICMPv6 packet to hand to the host, or `None` when suppressed.
    pub fn notify(
        &mut self,
        now: Instant,
        reason: UnreachableReason,
        original: &[u8],
        our_addr: Option<Ipv6Addr>,
    ) -> Option<Vec<u8>> {
        if !should_notify(original) || !self.limiter.try_acquire(now) {
            return None;
        }
        build_dest_unreachable(original, reason, our_addr)
    }
}
