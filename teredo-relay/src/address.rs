#![forbid(unsafe_code)]

//! Structured view of Teredo IPv6 addresses (RFC 4380 §4).
//!
//! Layout:
//! `[ 32b prefix | 32b server_ipv4 | 16b flags | 16b ~port | 32b ~client_ipv4 ]`.
//!
//! The mapped port and IPv4 address are stored ones-complemented so that NATs
//! rewriting payload bytes that look like their own external address leave the
//! Teredo address alone. Every accessor here undoes the obfuscation; callers
//! always deal in clear values.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};

/// Teredo service prefix `2001:0000::/32`.
pub const TEREDO_PREFIX: u32 = 0x2001_0000;

/// Cone bit of the flags field.
pub const FLAG_CONE: u16 = 0x8000;

/// Whether `prefix` is the Teredo service prefix.
#[must_use]
pub fn is_valid_prefix(prefix: u32) -> bool {
    prefix == TEREDO_PREFIX
}

/// A 128-bit address interpreted through the Teredo field layout.
///
/// Any IPv6 address can be viewed this way; the fields are only meaningful
/// when [`TeredoAddress::is_teredo`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TeredoAddress([u8; 16]);

impl TeredoAddress {
    /// All-zero address, held by relays in manual mode until a prefix is set
    /// and by clients before qualification.
    pub const UNSPECIFIED: TeredoAddress = TeredoAddress([0; 16]);

    /// Build an address from clear field values.
    #[must_use]
    pub fn new(prefix: u32, server: Ipv4Addr, flags: u16, mapped: SocketAddrV4) -> Self {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&prefix.to_be_bytes());
        b[4..8].copy_from_slice(&server.octets());
        b[8..10].copy_from_slice(&flags.to_be_bytes());
        b[10..12].copy_from_slice(&(!mapped.port()).to_be_bytes());
        b[12..16].copy_from_slice(&(!u32::from(*mapped.ip())).to_be_bytes());
        TeredoAddress(b)
    }

    /// Convenience for the common client case: service prefix, cone bit from `cone`.
    #[must_use]
    pub fn client(server: Ipv4Addr, mapped: SocketAddrV4, cone: bool) -> Self {
        Self::new(TEREDO_PREFIX, server, if cone { FLAG_CONE } else { 0 }, mapped)
    }

    /// Address of a relay: prefix and flags only, every other field zero.
    #[must_use]
    pub fn relay(prefix: u32, cone: bool) -> Self {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&prefix.to_be_bytes());
        if cone {
            b[8..10].copy_from_slice(&FLAG_CONE.to_be_bytes());
        }
        TeredoAddress(b)
    }

    #[must_use]
    pub fn prefix(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    #[must_use]
    pub fn server_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[4], self.0[5], self.0[6], self.0[7])
    }

    #[must_use]
    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.0[8], self.0[9]])
    }

    #[must_use]
    pub fn is_cone(&self) -> bool {
        self.flags() & FLAG_CONE != 0
    }

    /// External UDP port of the client, de-obfuscated.
    #[must_use]
    pub fn mapped_port(&self) -> u16 {
        !u16::from_be_bytes([self.0[10], self.0[11]])
    }

    /// External IPv4 address of the client, de-obfuscated.
    #[must_use]
    pub fn mapped_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(!u32::from_be_bytes([self.0[12], self.0[13], self.0[14], self.0[15]]))
    }

    #[must_use]
    pub fn mapped_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.mapped_ipv4(), self.mapped_port())
    }

    /// True when the prefix is the Teredo service prefix.
    #[must_use]
    pub fn is_teredo(&self) -> bool {
        is_valid_prefix(self.prefix())
    }

    #[must_use]
    pub fn octets(&self) -> [u8; 16] {
        self.0
    }

    #[must_use]
    pub fn to_ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }
}

impl From<Ipv6Addr> for TeredoAddress {
    fn from(addr: Ipv6Addr) -> Self {
        TeredoAddress(addr.octets())
    }
}

impl From<TeredoAddress> for Ipv6Addr {
    fn from(addr: TeredoAddress) -> Self {
        Ipv6Addr::from(addr.0)
    }
}

impl fmt::Display for TeredoAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ipv6())
    }
}
