#![forbid(unsafe_code)]

//! Teredo (RFC 4380) relay and client engine.
//!
//! * [`address`]: field view of Teredo IPv6 addresses.
//! * [`wire`]: encapsulation codec, bubbles, Router Solicitation/Advertisement.
//! * [`qualification`]: client NAT probing and keepalive state machine.
//! * [`peer`]: peer table and per-peer direct/indirect routing.
//! * [`relay`]: the caller-driven session tying it all to a UDP [`transport`].
//! * [`icmp`]: ICMPv6 Destination Unreachable for undeliverable packets.

use thiserror::Error;

pub mod address;
pub mod icmp;
pub mod peer;
pub mod probe;
pub mod qualification;
pub mod relay;
pub mod transport;
pub mod wire;

pub use address::{is_valid_prefix, TeredoAddress, TEREDO_PREFIX};
pub use icmp::UnreachableReason;
pub use peer::{Peer, PeerTable, RoutingMode};
pub use probe::{Phase, ProbeState, RetryCount};
pub use relay::{DropReason, Inbound, Relay, RelayHooks, RelayStats};
pub use teredo_core::RelayConfig;
pub use transport::{Transport, UdpTransport};

/// Errors surfaced by the relay.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket failure, including `WouldBlock` on a full send buffer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("destination unreachable: {0}")]
    Unroutable(UnreachableReason),

    /// Qualification gave up; the client waits out the restart delay.
    #[error("qualification failed")]
    QualificationFailed,

    #[error("source address check failed")]
    AntiSpoofRejected,

    /// The client has no address yet.
    #[error("relay is not running")]
    NotRunning,

    #[error(transparent)]
    Core(#[from] teredo_core::CoreError),
}

pub type Result<T> = std::result::Result<T, Error>;
