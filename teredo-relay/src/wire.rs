#![forbid(unsafe_code)]

//! Teredo encapsulation codec (RFC 4380 §5.1.1).
//!
//! A Teredo UDP payload is an IPv6 packet, optionally preceded by an
//! authentication header and/or an origin indication, in that order:
//!
//! ```text
//! +------------------+
//! | Authentication   |  (optional, type 0x0001, carries the probe nonce)
//! +------------------+
//! | Origin Indication|  (optional, type 0x0000, 8 bytes)
//! +------------------+
//! |   IPv6 Packet    |
//! +------------------+
//! ```
//!
//! Besides the decoder this module emits the packet kinds a client or relay
//! originates itself: bubbles, Router Solicitations, the ICMPv6 echo used to
//! authenticate a native peer's relay, and (for test servers) Router
//! Advertisements.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};

use crate::address::is_valid_prefix;
use crate::{Error, Result};

/// Well-known Teredo server UDP port.
pub const TEREDO_PORT: u16 = 3544;

pub const IPV6_HEADER_LEN: usize = 40;
pub const IPPROTO_ICMPV6: u8 = 58;
/// "No Next Header", used by bubbles.
pub const IPPROTO_NONE: u8 = 59;

const INDICATOR_ORIGIN: u16 = 0x0000;
const INDICATOR_AUTH: u16 = 0x0001;
const ORIGIN_LEN: usize = 8;
const AUTH_FIXED_LEN: usize = 4 + 8 + 1;

const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMPV6_ROUTER_SOLICITATION: u8 = 133;
const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;
const RA_HEADER_LEN: usize = 16;
const ND_OPT_PREFIX_INFO: u8 = 3;
const ND_OPT_MTU: u8 = 5;

const HOP_LIMIT_ND: u8 = 255;
const HOP_LIMIT_ECHO: u8 = 64;
// type, code, checksum, identifier, sequence, then the nonce as echo data.
const ECHO_LEN: usize = 8 + 8;

/// Link-local source of a Router Solicitation probing for a cone NAT.
pub const RS_SOURCE_CONE: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0x8000, 0xffff, 0xffff, 0xffff);
/// Link-local source of a Router Solicitation without the cone flag.
pub const RS_SOURCE_RESTRICTED: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0xffff, 0xffff, 0xffff);
/// All-routers multicast group.
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// Fixed part of an IPv6 header; extension headers are left in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header {
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6Header {
    /// Parse the header of a complete IPv6 packet. The declared payload length
    /// must account for every byte after the header.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < IPV6_HEADER_LEN {
            return Err(Error::MalformedPacket("short ipv6 packet"));
        }
        if packet[0] >> 4 != 6 {
            return Err(Error::MalformedPacket("not ipv6"));
        }
        let payload_len = u16::from_be_bytes([packet[4], packet[5]]);
        if usize::from(payload_len) != packet.len() - IPV6_HEADER_LEN {
            return Err(Error::MalformedPacket("ipv6 length mismatch"));
        }
        Ok(Self {
            payload_len,
            next_header: packet[6],
            hop_limit: packet[7],
            src: ipv6_at(packet, 8),
            dst: ipv6_at(packet, 24),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[0x60, 0, 0, 0]);
        out.extend_from_slice(&self.payload_len.to_be_bytes());
        out.push(self.next_header);
        out.push(self.hop_limit);
        out.extend_from_slice(&self.src.octets());
        out.extend_from_slice(&self.dst.octets());
    }

    /// A bubble carries nothing past the IPv6 header.
    #[must_use]
    pub fn is_bubble(&self) -> bool {
        self.payload_len == 0 && self.next_header == IPPROTO_NONE
    }
}

fn ipv6_at(buf: &[u8], at: usize) -> Ipv6Addr {
    let mut o = [0u8; 16];
    o.copy_from_slice(&buf[at..at + 16]);
    Ipv6Addr::from(o)
}

/// Authentication header; only the nonce and confirmation byte matter here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthHeader {
    pub nonce: [u8; 8],
    pub confirmation: u8,
}

/// A decoded Teredo UDP payload.
#[derive(Debug, Clone, Copy)]
pub struct Datagram<'a> {
    pub auth: Option<AuthHeader>,
    /// Clear (de-obfuscated) origin, set by servers when forwarding.
    pub origin: Option<SocketAddrV4>,
    pub header: Ipv6Header,
    /// The full IPv6 packet, header included.
    pub packet: &'a [u8],
}

impl Datagram<'_> {
    #[must_use]
    pub fn is_bubble(&self) -> bool {
        self.header.is_bubble()
    }

    /// ICMPv6 type when the packet is a plain (no extension header) ICMPv6 message.
    #[must_use]
    pub fn icmpv6_type(&self) -> Option<u8> {
        if self.header.next_header == IPPROTO_ICMPV6 && self.packet.len() > IPV6_HEADER_LEN {
            Some(self.packet[IPV6_HEADER_LEN])
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_router_advertisement(&self) -> bool {
        self.icmpv6_type() == Some(ICMPV6_ROUTER_ADVERTISEMENT)
    }
}

/// Split a UDP payload into its indicators and IPv6 packet.
pub fn decode(data: &[u8]) -> Result<Datagram<'_>> {
    let mut rest = data;
    let mut auth = None;
    let mut origin = None;

    if indicator(rest) == Some(INDICATOR_AUTH) {
        if rest.len() < AUTH_FIXED_LEN {
            return Err(Error::MalformedPacket("short authentication header"));
        }
        let id_len = usize::from(rest[2]);
        let au_len = usize::from(rest[3]);
        let total = AUTH_FIXED_LEN + id_len + au_len;
        if rest.len() < total {
            return Err(Error::MalformedPacket("truncated authentication header"));
        }
        let at = 4 + id_len + au_len;
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&rest[at..at + 8]);
        auth = Some(AuthHeader { nonce, confirmation: rest[at + 8] });
        rest = &rest[total..];
    }

    if indicator(rest) == Some(INDICATOR_ORIGIN) {
        if rest.len() < ORIGIN_LEN {
            return Err(Error::MalformedPacket("short origin indication"));
        }
        let port = !u16::from_be_bytes([rest[2], rest[3]]);
        let ip = !u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
        origin = Some(SocketAddrV4::new(Ipv4Addr::from(ip), port));
        rest = &rest[ORIGIN_LEN..];
    }

    let header = Ipv6Header::parse(rest)?;
    Ok(Datagram { auth, origin, header, packet: rest })
}

// Indicators start with a zero byte; IPv6 packets with a 0x6 nibble.
fn indicator(buf: &[u8]) -> Option<u16> {
    if buf.len() >= 2 && buf[0] == 0 {
        Some(u16::from_be_bytes([buf[0], buf[1]]))
    } else {
        None
    }
}

/// Origin indication bytes for `origin`.
#[must_use]
pub fn encode_origin(origin: SocketAddrV4) -> [u8; ORIGIN_LEN] {
    let mut out = [0u8; ORIGIN_LEN];
    out[0..2].copy_from_slice(&INDICATOR_ORIGIN.to_be_bytes());
    out[2..4].copy_from_slice(&(!origin.port()).to_be_bytes());
    out[4..8].copy_from_slice(&(!u32::from(*origin.ip())).to_be_bytes());
    out
}

fn encode_auth(out: &mut Vec<u8>, nonce: &[u8; 8]) {
    out.extend_from_slice(&INDICATOR_AUTH.to_be_bytes());
    out.push(0); // client identifier length
    out.push(0); // authentication value length
    out.extend_from_slice(nonce);
    out.push(0); // confirmation
}

/// Empty IPv6 packet from `src` to `dst`.
#[must_use]
pub fn encode_bubble(src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
    let mut out = Vec::with_capacity(IPV6_HEADER_LEN);
    Ipv6Header { payload_len: 0, next_header: IPPROTO_NONE, hop_limit: HOP_LIMIT_ND, src, dst }
        .write(&mut out);
    out
}

/// Router Solicitation sent to a Teredo server during qualification.
#[must_use]
pub fn encode_solicitation(nonce: &[u8; 8], cone: bool) -> Vec<u8> {
    let src = if cone { RS_SOURCE_CONE } else { RS_SOURCE_RESTRICTED };
    let mut icmp = [0u8; 8];
    icmp[0] = ICMPV6_ROUTER_SOLICITATION;
    let sum = icmpv6_checksum(src, ALL_ROUTERS, &icmp);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());

    let mut out = Vec::with_capacity(AUTH_FIXED_LEN + IPV6_HEADER_LEN + icmp.len());
    encode_auth(&mut out, nonce);
    Ipv6Header {
        payload_len: icmp.len() as u16,
        next_header: IPPROTO_ICMPV6,
        hop_limit: HOP_LIMIT_ND,
        src,
        dst: ALL_ROUTERS,
    }
    .write(&mut out);
    out.extend_from_slice(&icmp);
    out
}

/// ICMPv6 echo request carrying `nonce` as its data.
#[must_use]
pub fn encode_echo_request(src: Ipv6Addr, dst: Ipv6Addr, nonce: &[u8; 8]) -> Vec<u8> {
    encode_echo(ICMPV6_ECHO_REQUEST, src, dst, nonce)
}

/// ICMPv6 echo reply carrying `nonce` back.
#[must_use]
pub fn encode_echo_reply(src: Ipv6Addr, dst: Ipv6Addr, nonce: &[u8; 8]) -> Vec<u8> {
    encode_echo(ICMPV6_ECHO_REPLY, src, dst, nonce)
}

fn encode_echo(kind: u8, src: Ipv6Addr, dst: Ipv6Addr, nonce: &[u8; 8]) -> Vec<u8> {
    let mut icmp = [0u8; ECHO_LEN];
    icmp[0] = kind;
    icmp[8..].copy_from_slice(nonce);
    let sum = icmpv6_checksum(src, dst, &icmp);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());

    let mut out = Vec::with_capacity(IPV6_HEADER_LEN + ECHO_LEN);
    Ipv6Header { payload_len: ECHO_LEN as u16, next_header: IPPROTO_ICMPV6, hop_limit: HOP_LIMIT_ECHO, src, dst }
        .write(&mut out);
    out.extend_from_slice(&icmp);
    out
}

/// Nonce of an echo request shaped like [`encode_echo_request`] output.
#[must_use]
pub fn echo_request_nonce(dgram: &Datagram<'_>) -> Option<[u8; 8]> {
    echo_nonce(dgram, ICMPV6_ECHO_REQUEST)
}

/// Nonce of an echo reply shaped like [`encode_echo_reply`] output.
#[must_use]
pub fn echo_reply_nonce(dgram: &Datagram<'_>) -> Option<[u8; 8]> {
    echo_nonce(dgram, ICMPV6_ECHO_REPLY)
}

fn echo_nonce(dgram: &Datagram<'_>, kind: u8) -> Option<[u8; 8]> {
    let icmp = dgram.packet.get(IPV6_HEADER_LEN..)?;
    if dgram.icmpv6_type() != Some(kind) || icmp.len() != ECHO_LEN || icmp[1] != 0 {
        return None;
    }
    if icmpv6_checksum(dgram.header.src, dgram.header.dst, icmp) != 0 {
        return None;
    }
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&icmp[8..]);
    Some(nonce)
}

/// What a client needs from a server's Router Advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    /// First 32 bits of the advertised /64.
    pub prefix: u32,
    /// Server IPv4 embedded in bits 32..64 of the advertised /64.
    pub server: Ipv4Addr,
    pub mtu: Option<u32>,
}

/// Extract the Teredo prefix from a Router Advertisement.
pub fn parse_advertisement(dgram: &Datagram<'_>) -> Result<Advertisement> {
    if !dgram.is_router_advertisement() {
        return Err(Error::MalformedPacket("not a router advertisement"));
    }
    let icmp = dgram
        .packet
        .get(IPV6_HEADER_LEN..)
        .ok_or(Error::MalformedPacket("bad router advertisement header"))?;
    if icmp.len() < RA_HEADER_LEN || icmp[1] != 0 {
        return Err(Error::MalformedPacket("bad router advertisement header"));
    }
    if icmpv6_checksum(dgram.header.src, dgram.header.dst, icmp) != 0 {
        return Err(Error::MalformedPacket("bad icmpv6 checksum"));
    }

    let mut opts = &icmp[RA_HEADER_LEN..];
    let mut found = None;
    let mut mtu = None;
    while opts.len() >= 2 {
        let len = usize::from(opts[1]) * 8;
        if len == 0 || len > opts.len() {
            return Err(Error::MalformedPacket("bad neighbor discovery option"));
        }
        match opts[0] {
            ND_OPT_PREFIX_INFO if len == 32 && opts[2] == 64 => {
                let prefix = u32::from_be_bytes([opts[16], opts[17], opts[18], opts[19]]);
                if is_valid_prefix(prefix) {
                    let server = Ipv4Addr::new(opts[20], opts[21], opts[22], opts[23]);
                    found = Some((prefix, server));
                }
            }
            ND_OPT_MTU if len == 8 => {
                mtu = Some(u32::from_be_bytes([opts[4], opts[5], opts[6], opts[7]]));
            }
            _ => {}
        }
        opts = &opts[len..];
    }

    let (prefix, server) = found.ok_or(Error::MalformedPacket("no teredo prefix option"))?;
    Ok(Advertisement { prefix, server, mtu })
}

/// Router Advertisement as a Teredo server sends it in reply to a
/// solicitation: authentication echoing `nonce`, origin indication with the
/// client's observed mapping, and a /64 prefix option of `prefix` + `server`.
#[must_use]
pub fn encode_advertisement(
    nonce: &[u8; 8],
    origin: SocketAddrV4,
    prefix: u32,
    server: Ipv4Addr,
    dst: Ipv6Addr,
) -> Vec<u8> {
    let src = Ipv6Addr::new(0xfe80, 0, 0, 0, 0x8000, 0xf227, 0xbec4, 0x6f6e);
    let mut icmp = Vec::with_capacity(RA_HEADER_LEN + 32);
    icmp.extend_from_slice(&[ICMPV6_ROUTER_ADVERTISEMENT, 0, 0, 0]);
    icmp.extend_from_slice(&[0, 0]); // cur hop limit, flags
    icmp.extend_from_slice(&0u16.to_be_bytes()); // router lifetime
    icmp.extend_from_slice(&[0; 8]); // reachable time, retrans timer
    icmp.extend_from_slice(&[ND_OPT_PREFIX_INFO, 4, 64, 0x40]);
    icmp.extend_from_slice(&u32::MAX.to_be_bytes()); // valid lifetime
    icmp.extend_from_slice(&u32::MAX.to_be_bytes()); // preferred lifetime
    icmp.extend_from_slice(&[0; 4]);
    icmp.extend_from_slice(&prefix.to_be_bytes());
    icmp.extend_from_slice(&server.octets());
    icmp.extend_from_slice(&[0; 8]);
    let sum = icmpv6_checksum(src, dst, &icmp);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());

    let mut out = Vec::with_capacity(AUTH_FIXED_LEN + ORIGIN_LEN + IPV6_HEADER_LEN + icmp.len());
    encode_auth(&mut out, nonce);
    out.extend_from_slice(&encode_origin(origin));
    Ipv6Header {
        payload_len: icmp.len() as u16,
        next_header: IPPROTO_ICMPV6,
        hop_limit: HOP_LIMIT_ND,
        src,
        dst,
    }
    .write(&mut out);
    out.extend_from_slice(&icmp);
    out
}

/// ICMPv6 checksum over the RFC 8200 pseudo-header. Returns zero when run
/// over a message whose checksum field is already correct.
#[must_use]
pub fn icmpv6_checksum(src: Ipv6Addr, dst: Ipv6Addr, msg: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut add = |bytes: &[u8]| {
        let mut chunks = bytes.chunks_exact(2);
        for c in &mut chunks {
            sum += u32::from(u16::from_be_bytes([c[0], c[1]]));
        }
        if let [last] = chunks.remainder() {
            sum += u32::from(*last) << 8;
        }
    };
    add(&src.octets());
    add(&dst.octets());
    add(&(msg.len() as u32).to_be_bytes());
    add(&[0, 0, 0, IPPROTO_ICMPV6]);
    add(msg);
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONCE: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

    #[test]
    fn solicitation_layout() {
        let rs = encode_solicitation(&NONCE, true);
        assert_eq!(&rs[0..4], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&rs[4..12], &NONCE);
        assert_eq!(rs[12], 0);
        let d = decode(&rs).unwrap();
        assert_eq!(d.auth.unwrap().nonce, NONCE);
        assert!(d.origin.is_none());
        assert_eq!(d.header.src, RS_SOURCE_CONE);
        assert_eq!(d.header.dst, ALL_ROUTERS);
        assert_eq!(d.header.hop_limit, 255);
        assert_eq!(d.icmpv6_type(), Some(133));
        assert_eq!(icmpv6_checksum(d.header.src, d.header.dst, &d.packet[IPV6_HEADER_LEN..]), 0);
    }

    #[test]
    fn restricted_solicitation_source() {
        let d_bytes = encode_solicitation(&NONCE, false);
        let d = decode(&d_bytes).unwrap();
        assert_eq!(d.header.src, RS_SOURCE_RESTRICTED);
    }

    #[test]
    fn advertisement_parses_back() {
        let origin = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 40000);
        let server = Ipv4Addr::new(192, 0, 2, 1);
        let ra = encode_advertisement(&NONCE, origin, 0x2001_0000, server, RS_SOURCE_CONE);
        let d = decode(&ra).unwrap();
        assert_eq!(d.auth.unwrap().nonce, NONCE);
        assert_eq!(d.origin, Some(origin));
        let adv = parse_advertisement(&d).unwrap();
        assert_eq!(adv.prefix, 0x2001_0000);
        assert_eq!(adv.server, server);
        assert_eq!(adv.mtu, None);
    }

    #[test]
    fn advertisement_with_foreign_prefix_rejected() {
        let origin = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 40000);
        let ra = encode_advertisement(&NONCE, origin, 0x2002_0000, Ipv4Addr::LOCALHOST, ALL_ROUTERS);
        let d = decode(&ra).unwrap();
        assert!(parse_advertisement(&d).is_err());
    }

    #[test]
    fn corrupted_advertisement_checksum_rejected() {
        let origin = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 40000);
        let mut ra = encode_advertisement(&NONCE, origin, 0x2001_0000, Ipv4Addr::LOCALHOST, ALL_ROUTERS);
        let last = ra.len() - 1;
        ra[last] ^= 0xff;
        let d = decode(&ra).unwrap();
        assert!(matches!(parse_advertisement(&d), Err(Error::MalformedPacket("bad icmpv6 checksum"))));
    }

    #[test]
    fn bubble_is_bare_header() {
        let src: Ipv6Addr = "2001:0:c000:201::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:0:c000:201::2".parse().unwrap();
        let b = encode_bubble(src, dst);
        assert_eq!(b.len(), IPV6_HEADER_LEN);
        let d = decode(&b).unwrap();
        assert!(d.is_bubble());
        assert_eq!(d.header.src, src);
        assert_eq!(d.header.dst, dst);
    }

    #[test]
    fn origin_indication_obfuscated() {
        let origin = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 100), 0x1234);
        let o = encode_origin(origin);
        assert_eq!(&o[0..2], &[0, 0]);
        assert_eq!(u16::from_be_bytes([o[2], o[3]]), 0x1234 ^ 0xffff);
        assert_eq!(u32::from_be_bytes([o[4], o[5], o[6], o[7]]), 0xC0A8_0164 ^ 0xffff_ffff);

        let mut dgram = o.to_vec();
        dgram.extend_from_slice(&encode_bubble(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST));
        assert_eq!(decode(&dgram).unwrap().origin, Some(origin));
    }

    #[test]
    fn echo_carries_nonce_both_ways() {
        let a: Ipv6Addr = "2001:0:c000:201::1".parse().unwrap();
        let b: Ipv6Addr = "2a00:1450::1".parse().unwrap();
        let req = encode_echo_request(a, b, &NONCE);
        let d = decode(&req).unwrap();
        assert_eq!(d.icmpv6_type(), Some(128));
        assert_eq!(echo_request_nonce(&d), Some(NONCE));
        assert_eq!(echo_reply_nonce(&d), None);

        let rep = encode_echo_reply(b, a, &NONCE);
        assert_eq!(echo_reply_nonce(&decode(&rep).unwrap()), Some(NONCE));
    }

    #[test]
    fn echo_with_bad_checksum_carries_nothing() {
        let mut rep = encode_echo_reply(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, &NONCE);
        let last = rep.len() - 1;
        rep[last] ^= 0x01;
        assert_eq!(echo_reply_nonce(&decode(&rep).unwrap()), None);
    }

    #[test]
    fn truncated_inputs_rejected() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x00, 0x01, 0x00]).is_err());
        assert!(decode(&[0x00, 0x00, 0xff, 0xff]).is_err());
        let mut b = encode_bubble(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST);
        b.push(0);
        assert!(matches!(decode(&b), Err(Error::MalformedPacket("ipv6 length mismatch"))));
    }

    #[test]
    fn checksum_odd_length() {
        // A one-byte message pads with a trailing zero.
        let a = icmpv6_checksum(Ipv6Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED, &[0xab]);
        let b = icmpv6_checksum(Ipv6Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED, &[0xab, 0x00]);
        assert_ne!(a, 0);
        // Lengths differ in the pseudo-header, so only check both are stable.
        assert_eq!(a, icmpv6_checksum(Ipv6Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED, &[0xab]));
        assert_ne!(a, b);
    }
}
