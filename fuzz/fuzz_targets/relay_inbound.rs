#![no_main]

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use libfuzzer_sys::fuzz_target;
use teredo_relay::{Relay, RelayConfig, RelayHooks, Transport, TEREDO_PREFIX};

struct Sink;

#[async_trait::async_trait]
impl Transport for Sink {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 3545)))
    }
    fn try_send_to(&self, buf: &[u8], _dest: SocketAddrV4) -> io::Result<usize> {
        Ok(buf.len())
    }
    fn try_recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        Err(io::ErrorKind::WouldBlock.into())
    }
    async fn readable(&self) -> io::Result<()> {
        Ok(())
    }
}

struct Host;

impl RelayHooks for Host {
    fn send_ipv6_packet(&mut self, _packet: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

// First six bytes pick the UDP source; the rest is the datagram. Whatever
// arrives, the inbound path must not panic.
fuzz_target!(|data: &[u8]| {
    if data.len() < 6 {
        return;
    }
    let src = SocketAddrV4::new(
        Ipv4Addr::new(data[0], data[1], data[2], data[3]),
        u16::from_be_bytes([data[4], data[5]]),
    );
    let Ok(mut relay) = Relay::new_relay(Sink, TEREDO_PREFIX, true, RelayConfig::default(), Host) else {
        return;
    };
    let _ = relay.handle_datagram(&data[6..], SocketAddr::V4(src));
    let _ = relay.process();
});
