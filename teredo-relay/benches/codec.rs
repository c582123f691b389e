use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};

use teredo_relay::wire::{decode, encode_advertisement, encode_bubble, encode_origin, parse_advertisement};
use teredo_relay::{TeredoAddress, TEREDO_PREFIX};

/// Decode cost of the three datagram shapes seen on a busy relay.
fn bench_decode(c: &mut Criterion) {
    let server = Ipv4Addr::new(192, 0, 2, 1);
    let peer = TeredoAddress::client(server, SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000), true);
    let native: Ipv6Addr = "2a00:1450:4001::68".parse().expect("literal");

    let bubble = encode_bubble(peer.to_ipv6(), native);

    // 1200-byte data packet behind an origin indication, as a server forwards it.
    let mut data = encode_bubble(peer.to_ipv6(), native);
    data[4..6].copy_from_slice(&1160u16.to_be_bytes());
    data[6] = 17;
    data.resize(1200, 0);
    let mut forwarded = encode_origin(peer.mapped_endpoint()).to_vec();
    forwarded.extend_from_slice(&data);

    let ra = encode_advertisement(&[7; 8], peer.mapped_endpoint(), TEREDO_PREFIX, server, native);

    c.bench_function("decode_bubble", |b| b.iter(|| decode(black_box(&bubble)).expect("bubble")));
    c.bench_function("decode_forwarded_1200", |b| b.iter(|| decode(black_box(&forwarded)).expect("data")));
    c.bench_function("parse_advertisement", |b| {
        b.iter(|| {
            let d = decode(black_box(&ra)).expect("ra");
            parse_advertisement(&d).expect("prefix")
        })
    });
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
