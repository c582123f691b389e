#![forbid(unsafe_code)]

//! IPv4 UDP endpoint the relay tunnels through.
//!
//! Sends never wait: a full socket buffer surfaces as `WouldBlock` and the
//! caller decides what to drop. Receives are split into a readiness await and
//! a non-blocking read so the relay can process exactly one datagram per wakeup.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::info;

/// Datagram socket seam; the conformance harness swaps in a scripted network.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Non-blocking send of one datagram.
    fn try_send_to(&self, buf: &[u8], dest: SocketAddrV4) -> io::Result<usize>;

    /// Non-blocking receive of one datagram.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Resolves once a datagram may be available. Spurious wakeups are allowed.
    async fn readable(&self) -> io::Result<()>;
}

/// Tokio UDP socket built through `socket2`.
#[derive(Clone, Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind on `addr`; port 0 picks an ephemeral port.
    pub async fn bind(addr: SocketAddrV4) -> io::Result<Self> {
        let addr = SocketAddr::V4(addr);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        let std_sock: std::net::UdpSocket = socket.into();
        let udp = UdpSocket::from_std(std_sock)?;
        info!(local = %udp.local_addr()?, "teredo udp endpoint bound");
        Ok(Self { socket: Arc::new(udp) })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn try_send_to(&self, buf: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        self.socket.try_send_to(buf, SocketAddr::V4(dest))
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.try_recv_from(buf)
    }

    async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn loopback_datagram() {
        let a = UdpTransport::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let b = UdpTransport::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let SocketAddr::V4(b_addr) = b.local_addr().unwrap() else { panic!("ipv4 expected") };

        a.try_send_to(b"bubble", b_addr).unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = loop {
            b.readable().await.unwrap();
            match b.try_recv_from(&mut buf) {
                Ok(r) => break r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("recv failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"bubble");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn empty_socket_would_block() {
        let a = UdpTransport::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let mut buf = [0u8; 16];
        let err = a.try_recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
