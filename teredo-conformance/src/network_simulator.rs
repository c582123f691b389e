//! Scripted IPv4 network for driving a relay without sockets.
//!
//! Datagrams the relay sends are recorded; datagrams a test injects are
//! queued and handed out one per receive. The send buffer can be marked full
//! to exercise the non-blocking path.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use teredo_relay::Transport;
use tokio::sync::Notify;

/// A datagram the relay transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub dest: SocketAddrV4,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    sent: Vec<SentDatagram>,
    inbox: VecDeque<(SocketAddr, Vec<u8>)>,
    send_buffer_full: bool,
}

/// Cheaply cloneable handle; the relay owns one clone, the test another.
#[derive(Debug, Clone)]
pub struct SimulatedNetwork {
    local: SocketAddrV4,
    state: Arc<Mutex<State>>,
    arrivals: Arc<Notify>,
}

impl SimulatedNetwork {
    pub fn new(local: SocketAddrV4) -> Self {
        Self { local, state: Arc::default(), arrivals: Arc::new(Notify::new()) }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A test that panicked while holding the lock has already failed.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a datagram as if it arrived from `src`.
    pub fn inject(&self, src: SocketAddrV4, payload: Vec<u8>) {
        self.state().inbox.push_back((SocketAddr::V4(src), payload));
        self.arrivals.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.state().inbox.len()
    }

    /// Drain everything sent so far.
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.state().sent)
    }

    /// Everything sent so far, left in place.
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.state().sent.clone()
    }

    pub fn set_send_buffer_full(&self, full: bool) {
        self.state().send_buffer_full = full;
    }
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 3545))
    }
}

#[async_trait]
impl Transport for SimulatedNetwork {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::V4(self.local))
    }

    fn try_send_to(&self, buf: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        let mut state = self.state();
        if state.send_buffer_full {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        state.sent.push(SentDatagram { dest, payload: buf.to_vec() });
        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (src, payload) = self.state().inbox.pop_front().ok_or(io::ErrorKind::WouldBlock)?;
        if payload.len() > buf.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "datagram larger than buffer"));
        }
        buf[..payload.len()].copy_from_slice(&payload);
        Ok((payload.len(), src))
    }

    async fn readable(&self) -> io::Result<()> {
        if self.pending() == 0 {
            self.arrivals.notified().await;
        }
        Ok(())
    }
}
