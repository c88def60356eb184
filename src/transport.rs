//! A module which contains the best-effort datagram transport between node
//! IDs. Peers are addressed through a loopback UDP port scheme: the receiver
//! for node `id` listens on `50000 + id`, and the socket a node binds to
//! reach a peer sits on `50000 + src * 100 + dst`. The receiver recovers the
//! sender's ID from the remote port, so the scheme doubles as addressing and
//! sender identification. IDs must stay below 100 for the packing to work.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use net2::UdpBuilder;

use crate::NodeId;

/// Base of the port range the cluster occupies.
pub const BASE_PORT: u32 = 50_000;

/// Largest node ID representable by the port scheme.
pub const MAX_NODE_ID: NodeId = 99;

/// Receive buffer size used in the server receive loop.
const RECV_BUF_SIZE: usize = 4 * 1024;

/// The send half of the datagram channel, as consumed by the protocol roles.
/// Delivery is best effort: no ordering, no retransmission, no backpressure.
pub trait Transport {
    fn send_to(&self, dst: NodeId, data: &[u8]) -> io::Result<usize>;
}

fn ids_to_port(src: NodeId, dst: NodeId) -> u16 {
    (BASE_PORT + src * 100 + dst) as u16
}

fn port_to_ids(port: u16) -> Option<(NodeId, NodeId)> {
    let port = u32::from(port);
    if port < BASE_PORT || port >= BASE_PORT + 100 * 100 {
        return None;
    }
    let packed = port - BASE_PORT;
    Some((packed / 100, packed % 100))
}

fn server_addr(id: NodeId) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, ids_to_port(0, id))
}

fn client_addr(src: NodeId, dst: NodeId) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, ids_to_port(src, dst))
}

/// UDP transport for one node. Owns the bound receiver socket and an
/// append-only pool of per-destination sender sockets.
pub struct UdpTransport {
    id: NodeId,
    server: UdpSocket,
    pool: Mutex<HashMap<NodeId, UdpSocket>>,
}

impl UdpTransport {
    /// Binds the receiver socket for `id`. Fails fast on an occupied port or
    /// an ID the port scheme cannot carry.
    pub fn bind(id: NodeId) -> io::Result<UdpTransport> {
        if id > MAX_NODE_ID {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("node ID {} exceeds the addressable range 0..={}", id, MAX_NODE_ID),
            ));
        }
        let server = UdpBuilder::new_v4()?
            .reuse_address(true)?
            .bind(server_addr(id))?;
        Ok(UdpTransport {
            id,
            server,
            pool: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Starts the receive loop in its own thread. Every datagram is pushed
    /// into `events` as `(sender_id, bytes)`; the loop ends when the
    /// receiving side of the channel goes away.
    pub fn start(&self, events: Sender<(NodeId, Vec<u8>)>) -> io::Result<()> {
        let sock = self.server.try_clone()?;
        let id = self.id;
        thread::spawn(move || {
            let mut buf = vec![0u8; RECV_BUF_SIZE];
            loop {
                let (n, raddr) = match sock.recv_from(&mut buf) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("[{}] transport recv failed: {}", id, e);
                        thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                };
                let (src, dst) = match port_to_ids(raddr.port()) {
                    Some(ids) => ids,
                    None => {
                        warn!("[{}] datagram from foreign port {} discarded", id, raddr.port());
                        continue;
                    }
                };
                if dst != id {
                    warn!("[{}] wrong package received, dst: {}", id, dst);
                    continue;
                }
                if events.send((src, buf[..n].to_vec())).is_err() {
                    // reactor gone, shut the loop down
                    break;
                }
            }
        });
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, dst: NodeId, data: &[u8]) -> io::Result<usize> {
        let mut pool = self.pool.lock().expect("sender socket pool poisoned");
        if !pool.contains_key(&dst) {
            let sock = UdpBuilder::new_v4()?
                .reuse_address(true)?
                .bind(client_addr(self.id, dst))?;
            sock.connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, ids_to_port(0, dst)))?;
            pool.insert(dst, sock);
        }
        pool[&dst].send(data)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! A recording transport for driving role state machines in tests.

    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::io;
    use std::rc::Rc;

    use super::Transport;
    use crate::wire::{self, Message};
    use crate::NodeId;

    #[derive(Clone, Default)]
    pub struct MockTransport {
        sent: Rc<RefCell<Vec<(NodeId, Vec<u8>)>>>,
        unreachable: Rc<RefCell<HashSet<NodeId>>>,
    }

    impl MockTransport {
        pub fn new() -> MockTransport {
            MockTransport::default()
        }

        /// Makes every send to `dst` fail with a connection error.
        pub fn cut_link(&self, dst: NodeId) {
            self.unreachable.borrow_mut().insert(dst);
        }

        /// Drains and decodes everything sent so far, in send order.
        pub fn take_sent(&self) -> Vec<(NodeId, Message)> {
            self.sent
                .borrow_mut()
                .drain(..)
                .map(|(dst, bs)| {
                    let (m, n) = wire::decode_one(&bs).expect("mock captured a malformed frame");
                    assert_eq!(n, bs.len());
                    (dst, m)
                })
                .collect()
        }

        pub fn sent_count(&self) -> usize {
            self.sent.borrow().len()
        }
    }

    impl Transport for MockTransport {
        fn send_to(&self, dst: NodeId, data: &[u8]) -> io::Result<usize> {
            if self.unreachable.borrow().contains(&dst) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("link to {} cut", dst),
                ));
            }
            self.sent.borrow_mut().push((dst, data.to_vec()));
            Ok(data.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn port_packing() {
        assert_eq!(ids_to_port(0, 1), 50001);
        assert_eq!(ids_to_port(1, 2), 50102);
        assert_eq!(ids_to_port(99, 99), 59999);
        assert_eq!(port_to_ids(50102), Some((1, 2)));
        assert_eq!(port_to_ids(50001), Some((0, 1)));
        assert_eq!(port_to_ids(49999), None);
        assert_eq!(port_to_ids(60000), None);
    }

    #[test]
    fn oversized_id_rejected() {
        assert!(UdpTransport::bind(100).is_err());
    }

    #[test]
    fn loopback_send_and_receive() {
        let u1 = UdpTransport::bind(91).expect("bind 91");
        let u2 = UdpTransport::bind(92).expect("bind 92");

        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        u1.start(tx1).expect("start 91");
        u2.start(tx2).expect("start 92");

        let dat1 = b"hello,u2!000";
        let n = u1.send_to(92, dat1).expect("send 91->92");
        assert_eq!(n, dat1.len());
        let dat2 = b"hello,u1!000";
        u2.send_to(91, dat2).expect("send 92->91");

        let (src, got) = rx2.recv_timeout(Duration::from_secs(2)).expect("u2 recv");
        assert_eq!(src, 91);
        assert_eq!(got, dat1);
        let (src, got) = rx1.recv_timeout(Duration::from_secs(2)).expect("u1 recv");
        assert_eq!(src, 92);
        assert_eq!(got, dat2);
    }
}
