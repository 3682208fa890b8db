use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::config::MAX_PACKET_SIZE;

/// The datagram channel the engine speaks over: fire-and-forget payloads,
/// polled receipt, no delivery or ordering guarantees. Payload hand-off may
/// cross threads inside the transport, but `receive` is always called from
/// the engine thread.
pub trait Transport {
    fn send_payload(&mut self, payload: &[u8]);
    /// The next queued payload, if any. Drained in a loop at the start of
    /// every update tick.
    fn receive(&mut self) -> Option<Vec<u8>>;
    /// Smoothed round-trip time in seconds, when the transport measures it.
    fn ping(&self) -> Option<f32> {
        None
    }
}

/// Nonblocking UDP with a pinned remote address.
pub struct UdpTransport {
    socket: UdpSocket,
    remote: SocketAddr,
    recv_buffer: [u8; MAX_PACKET_SIZE],
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(local: A, remote: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            remote,
            recv_buffer: [0u8; MAX_PACKET_SIZE],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl Transport for UdpTransport {
    fn send_payload(&mut self, payload: &[u8]) {
        if payload.len() > MAX_PACKET_SIZE {
            warn!("payload of {} bytes exceeds the datagram limit, dropped", payload.len());
            return;
        }
        if let Err(err) = self.socket.send_to(payload, self.remote) {
            warn!("send to {} failed: {}", self.remote, err);
        }
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, from)) => {
                    if from != self.remote {
                        continue;
                    }
                    return Some(self.recv_buffer[..size].to_vec());
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                Err(err) => {
                    warn!("receive failed: {}", err);
                    return None;
                }
            }
        }
    }
}

type SharedQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// Deterministic loss controls for a loopback link, shared with the test
/// that owns the handle.
#[derive(Debug, Default)]
struct LossControl {
    drop_next: u32,
    drop_all: bool,
    sent: u64,
    dropped: u64,
}

/// Remote control over one direction of a loopback pair.
#[derive(Clone)]
pub struct LossHandle {
    control: Arc<Mutex<LossControl>>,
}

impl LossHandle {
    /// Drop the next `count` sends on this direction.
    pub fn drop_next(&self, count: u32) {
        self.control.lock().unwrap().drop_next = count;
    }

    /// Drop everything until restored.
    pub fn set_drop_all(&self, drop_all: bool) {
        self.control.lock().unwrap().drop_all = drop_all;
    }

    pub fn dropped(&self) -> u64 {
        self.control.lock().unwrap().dropped
    }

    pub fn sent(&self) -> u64 {
        self.control.lock().unwrap().sent
    }
}

/// In-memory transport pair for tests and local sessions. Each side pushes
/// into the other's queue through a mutex, matching the thread-safe FIFO
/// hand-off contract.
pub struct LoopbackTransport {
    outbound: SharedQueue,
    inbound: SharedQueue,
    control: Arc<Mutex<LossControl>>,
    ping: Option<f32>,
}

impl LoopbackTransport {
    /// A connected pair: what one side sends, the other receives.
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let a_to_b: SharedQueue = Arc::default();
        let b_to_a: SharedQueue = Arc::default();
        let a = LoopbackTransport {
            outbound: Arc::clone(&a_to_b),
            inbound: Arc::clone(&b_to_a),
            control: Arc::default(),
            ping: None,
        };
        let b = LoopbackTransport {
            outbound: b_to_a,
            inbound: a_to_b,
            control: Arc::default(),
            ping: None,
        };
        (a, b)
    }

    /// Handle for scripting loss on this side's sends.
    pub fn loss_handle(&self) -> LossHandle {
        LossHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn set_ping(&mut self, ping: Option<f32>) {
        self.ping = ping;
    }
}

impl Transport for LoopbackTransport {
    fn send_payload(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= MAX_PACKET_SIZE);
        let mut control = self.control.lock().unwrap();
        control.sent += 1;
        if control.drop_all || control.drop_next > 0 {
            control.drop_next = control.drop_next.saturating_sub(1);
            control.dropped += 1;
            return;
        }
        drop(control);
        self.outbound.lock().unwrap().push_back(payload.to_vec());
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.inbound.lock().unwrap().pop_front()
    }

    fn ping(&self) -> Option<f32> {
        self.ping
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_delivers_in_order() {
        let (mut a, mut b) = LoopbackTransport::pair();
        a.send_payload(&[1]);
        a.send_payload(&[2]);
        assert_eq!(b.receive(), Some(vec![1]));
        assert_eq!(b.receive(), Some(vec![2]));
        assert_eq!(b.receive(), None);
    }

    #[test]
    fn loss_handle_drops_sends() {
        let (mut a, mut b) = LoopbackTransport::pair();
        let loss = a.loss_handle();
        loss.drop_next(1);
        a.send_payload(&[1]);
        a.send_payload(&[2]);
        assert_eq!(b.receive(), Some(vec![2]));
        assert_eq!(loss.dropped(), 1);
        assert_eq!(loss.sent(), 2);
    }

    #[test]
    fn directions_are_independent() {
        let (mut a, mut b) = LoopbackTransport::pair();
        a.loss_handle().set_drop_all(true);
        b.send_payload(&[9]);
        assert_eq!(a.receive(), Some(vec![9]));
        a.send_payload(&[1]);
        assert_eq!(b.receive(), None);
    }
}
