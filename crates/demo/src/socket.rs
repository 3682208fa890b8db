use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};

use log::warn;
use tickwire::{MAX_PACKET_SIZE, Transport};

type SharedQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// One client's side of the shared server socket: sends go straight out,
/// receives come from the queue the demultiplexer fills.
pub struct ClientChannel {
    socket: UdpSocket,
    remote: SocketAddr,
    queue: SharedQueue,
}

impl Transport for ClientChannel {
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
        self.queue.lock().unwrap().pop_front()
    }
}

/// Demultiplexes one UDP socket into per-remote channels, so every sender
/// becomes its own engine transport.
pub struct ServerSocket {
    socket: UdpSocket,
    queues: HashMap<SocketAddr, SharedQueue>,
    recv_buffer: [u8; MAX_PACKET_SIZE],
}

impl ServerSocket {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            queues: HashMap::new(),
            recv_buffer: [0u8; MAX_PACKET_SIZE],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Pumps pending datagrams into the per-remote queues. Returns a
    /// channel for every remote seen for the first time.
    pub fn poll(&mut self) -> io::Result<Vec<(SocketAddr, ClientChannel)>> {
        let mut joined = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, from)) => {
                    let queue = match self.queues.get(&from) {
                        Some(queue) => Arc::clone(queue),
                        None => {
                            let queue: SharedQueue = Arc::default();
                            self.queues.insert(from, Arc::clone(&queue));
                            joined.push((
                                from,
                                ClientChannel {
                                    socket: self.socket.try_clone()?,
                                    remote: from,
                                    queue: Arc::clone(&queue),
                                },
                            ));
                            queue
                        }
                    };
                    queue.lock().unwrap().push_back(self.recv_buffer[..size].to_vec());
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(joined)
    }

    pub fn forget(&mut self, remote: SocketAddr) {
        self.queues.remove(&remote);
    }
}
