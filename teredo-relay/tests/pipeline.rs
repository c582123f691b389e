use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use teredo_relay::relay::MAINTENANCE_SEND_BUDGET;
use teredo_relay::wire::{encode_bubble, encode_origin, TEREDO_PORT};
use teredo_relay::{
    DropReason, Error, Inbound, Relay, RelayConfig, RelayHooks, RoutingMode, TeredoAddress, Transport,
    UnreachableReason, TEREDO_PREFIX,
};

const PEER_SERVER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

#[derive(Default)]
struct Wire {
    sent: Vec<(SocketAddrV4, Vec<u8>)>,
    inbox: VecDeque<(SocketAddr, Vec<u8>)>,
    full: bool,
}

#[derive(Clone, Default)]
struct Net(Arc<Mutex<Wire>>);

impl Net {
    fn sent(&self) -> Vec<(SocketAddrV4, Vec<u8>)> {
        self.0.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl Transport for Net {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([10, 0, 0, 1], 3545)))
    }

    fn try_send_to(&self, buf: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        let mut w = self.0.lock().unwrap();
        if w.full {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        w.sent.push((dest, buf.to_vec()));
        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (src, data) = self.0.lock().unwrap().inbox.pop_front().ok_or(io::ErrorKind::WouldBlock)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok((data.len(), src))
    }

    async fn readable(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Host {
    delivered: Vec<Vec<u8>>,
}

impl RelayHooks for Host {
    fn send_ipv6_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.delivered.push(packet.to_vec());
        Ok(())
    }
}

fn packet(src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![0x60, 0, 0, 0];
    p.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    p.extend_from_slice(&[17, 64]);
    p.extend_from_slice(&src.octets());
    p.extend_from_slice(&dst.octets());
    p.extend_from_slice(payload);
    p
}

fn native() -> Ipv6Addr {
    "2a00:1450:4001::68".parse().unwrap()
}

fn peer_addr() -> TeredoAddress {
    TeredoAddress::client(PEER_SERVER, SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000), false)
}

fn relay(net: &Net) -> Relay<Net, Host> {
    let _ = tracing_subscriber::fmt::try_init();
    Relay::new_relay(net.clone(), TEREDO_PREFIX, true, RelayConfig::default(), Host::default()).unwrap()
}

fn peer_server() -> SocketAddrV4 {
    SocketAddrV4::new(PEER_SERVER, TEREDO_PORT)
}

#[tokio::test]
async fn new_peer_goes_through_its_server() {
    let net = Net::default();
    let mut r = relay(&net);
    let p = packet(native(), peer_addr().to_ipv6(), b"hello");
    r.send(&p).unwrap();

    assert_eq!(net.sent(), vec![(peer_server(), p)]);
    let peer = r.peers().find(&peer_addr().to_ipv6()).unwrap();
    assert_eq!(peer.mode(), RoutingMode::Indirect);
    assert_eq!(r.stats().sent, 1);
}

#[tokio::test]
async fn relay_refuses_native_destination_with_unreachable() {
    let net = Net::default();
    let mut r = relay(&net);
    let p = packet(native(), "2a00:1450::1".parse().unwrap(), b"x");
    let err = r.send(&p).unwrap_err();
    assert!(matches!(err, Error::Unroutable(UnreachableReason::AddressUnreachable)));
    assert!(net.sent().is_empty());

    let icmp = &r.hooks().delivered[0];
    assert_eq!(icmp[6], 58);
    assert_eq!(&icmp[24..40], &native().octets());
    assert_eq!(icmp[40], 1);
    assert_eq!(icmp[41], 3);
    assert_eq!(r.stats().icmp_sent, 1);
}

#[tokio::test]
async fn explicit_unreachable_skips_multicast_sources() {
    let net = Net::default();
    let mut r = relay(&net);
    let dst = peer_addr().to_ipv6();
    r.notify_unreachable(UnreachableReason::PortUnreachable, &packet("ff02::1".parse().unwrap(), dst, b"x"));
    assert!(r.hooks().delivered.is_empty());

    r.notify_unreachable(UnreachableReason::PortUnreachable, &packet(native(), dst, b"x"));
    let icmp = &r.hooks().delivered[0];
    assert_eq!(&icmp[8..24], &dst.octets());
    assert_eq!(icmp[41], 4);
    assert_eq!(r.stats().icmp_sent, 1);
    assert_eq!(r.stats().unroutable, 0);
}

#[tokio::test]
async fn malformed_outbound_rejected() {
    let net = Net::default();
    let mut r = relay(&net);
    assert!(matches!(r.send(&[0x60, 0, 0]), Err(Error::MalformedPacket(_))));
    assert_eq!(r.stats().malformed, 1);
}

#[tokio::test]
async fn full_send_buffer_surfaces_immediately() {
    let net = Net::default();
    net.0.lock().unwrap().full = true;
    let mut r = relay(&net);
    let p = packet(native(), peer_addr().to_ipv6(), b"x");
    match r.send(&p) {
        Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
        other => panic!("expected WouldBlock, got {other:?}"),
    }
}

#[tokio::test]
async fn bubble_exchange_promotes_peer_to_direct() {
    let net = Net::default();
    let mut r = relay(&net);
    let peer = peer_addr();
    let first = packet(native(), peer.to_ipv6(), b"one");
    let second = packet(native(), peer.to_ipv6(), b"two");
    r.send(&first).unwrap();
    r.send(&second).unwrap();

    let sent = net.sent();
    assert_eq!(sent[1].0, peer.mapped_endpoint());
    assert_eq!(sent[1].1, encode_bubble(r.local_address().to_ipv6(), peer.to_ipv6()));
    assert_eq!(r.peers().find(&peer.to_ipv6()).unwrap().mode(), RoutingMode::PendingDirect);

    let reply = encode_bubble(peer.to_ipv6(), r.local_address().to_ipv6());
    let got = r.handle_datagram(&reply, SocketAddr::V4(peer.mapped_endpoint())).unwrap();
    assert_eq!(got, Inbound::Bubble);
    assert_eq!(r.peers().find(&peer.to_ipv6()).unwrap().mode(), RoutingMode::TrustedDirect);
    assert_eq!(net.sent().last().unwrap(), &(peer.mapped_endpoint(), second));

    let third = packet(native(), peer.to_ipv6(), b"three");
    r.send(&third).unwrap();
    assert_eq!(net.sent().last().unwrap(), &(peer.mapped_endpoint(), third));
}

#[tokio::test(start_paused = true)]
async fn unanswered_bubbles_fall_back_to_server() {
    let net = Net::default();
    let mut r = relay(&net);
    let peer = peer_addr();
    r.send(&packet(native(), peer.to_ipv6(), b"one")).unwrap();
    let held = packet(native(), peer.to_ipv6(), b"two");
    r.send(&held).unwrap();

    let cfg = r.config().clone();
    for _ in 0..cfg.bubble_retries {
        tokio::time::advance(cfg.bubble_interval()).await;
        r.process().unwrap();
    }
    assert_eq!(r.stats().bubbles_sent, u64::from(cfg.bubble_retries));
    assert_eq!(net.sent().last().unwrap(), &(peer_server(), held));
    assert_eq!(r.peers().find(&peer.to_ipv6()).unwrap().mode(), RoutingMode::Indirect);
}

#[tokio::test(start_paused = true)]
async fn maintenance_sends_are_bounded_per_call() {
    let net = Net::default();
    let mut r = relay(&net);
    let extra = 5;
    let peers: Vec<TeredoAddress> = (0..MAINTENANCE_SEND_BUDGET + extra)
        .map(|i| {
            let mapped = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000 + i as u16);
            TeredoAddress::client(PEER_SERVER, mapped, false)
        })
        .collect();
    for peer in &peers {
        r.send(&packet(native(), peer.to_ipv6(), b"one")).unwrap();
        r.send(&packet(native(), peer.to_ipv6(), b"two")).unwrap();
    }
    let negotiated = r.stats().bubbles_sent;
    assert_eq!(negotiated, peers.len() as u64);

    tokio::time::advance(r.config().bubble_interval()).await;
    r.process().unwrap();
    assert_eq!(r.stats().bubbles_sent - negotiated, MAINTENANCE_SEND_BUDGET as u64);
    r.process().unwrap();
    assert_eq!(r.stats().bubbles_sent - negotiated, peers.len() as u64);
    r.process().unwrap();
    assert_eq!(r.stats().bubbles_sent - negotiated, peers.len() as u64);
}

#[tokio::test(start_paused = true)]
async fn idle_peers_are_evicted() {
    let net = Net::default();
    let mut r = relay(&net);
    r.send(&packet(native(), peer_addr().to_ipv6(), b"x")).unwrap();
    tokio::time::advance(r.config().peer_idle_timeout()).await;
    r.process().unwrap();
    assert!(r.peers().is_empty());
}

#[tokio::test]
async fn direct_packet_from_client_delivered() {
    let net = Net::default();
    let mut r = relay(&net);
    let peer = peer_addr();
    let p = packet(peer.to_ipv6(), native(), b"up");
    net.0.lock().unwrap().inbox.push_back((SocketAddr::V4(peer.mapped_endpoint()), p.clone()));

    assert_eq!(r.receive().await.unwrap(), Inbound::Delivered);
    assert_eq!(r.hooks().delivered, vec![p]);
    assert_eq!(r.try_receive().unwrap(), Inbound::Idle);
}

#[tokio::test]
async fn forged_origin_never_reaches_host() {
    let net = Net::default();
    let mut r = relay(&net);
    let peer = peer_addr();
    let mut forged = encode_origin(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 66), 1)).to_vec();
    forged.extend_from_slice(&packet(peer.to_ipv6(), native(), b"evil"));

    let got = r.handle_datagram(&forged, SocketAddr::V4(peer_server())).unwrap();
    assert_eq!(got, Inbound::Dropped(DropReason::Spoofed));
    assert!(r.hooks().delivered.is_empty());
    assert_eq!(r.stats().spoofed, 1);

    // Right origin through the same server is accepted.
    let mut honest = encode_origin(peer.mapped_endpoint()).to_vec();
    honest.extend_from_slice(&packet(peer.to_ipv6(), native(), b"ok"));
    assert_eq!(r.handle_datagram(&honest, SocketAddr::V4(peer_server())).unwrap(), Inbound::Delivered);
}

#[tokio::test]
async fn garbage_datagram_counted() {
    let net = Net::default();
    let mut r = relay(&net);
    let got = r.handle_datagram(b"\x45garbage", SocketAddr::from(([203, 0, 113, 1], 5000))).unwrap();
    assert_eq!(got, Inbound::Dropped(DropReason::Malformed));
    assert_eq!(r.stats().malformed, 1);
}

#[tokio::test]
async fn relay_mode_ignores_advertisements() {
    let net = Net::default();
    let mut r = relay(&net);
    let ra = teredo_relay::wire::encode_advertisement(
        &[1; 8],
        peer_addr().mapped_endpoint(),
        TEREDO_PREFIX,
        PEER_SERVER,
        native(),
    );
    let got = r.handle_datagram(&ra, SocketAddr::V4(peer_server())).unwrap();
    assert_eq!(got, Inbound::Dropped(DropReason::Unexpected));
    assert!(r.is_relay());
    assert!(r.probe().is_none());
}
