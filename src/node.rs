//! A module which contains the node: the process-wide state, the per-peer
//! frame reassembly buffers and the reactor loop that feeds decoded messages
//! to whichever roles this node runs.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::configurations::ClusterConfig;
use crate::error::{Error, Result};
use crate::synod::{Acceptor, Applier, Client, Learner, Proposer};
use crate::transport::{Transport, UdpTransport};
use crate::wire::{self, Message, Response};
use crate::NodeId;

/// The leader ID a node starts with, meaning "no leader known yet".
pub const NO_LEADER: NodeId = 0;

/// How long a proposer waits on a ballot before abandoning it and
/// re-running Phase 1 under a higher one.
pub const PHASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Process-wide protocol state shared by the roles on one node.
#[derive(Clone, Copy, Debug)]
pub struct NodeState {
    /// The instance the proposer on this node is currently working.
    pub instance_id: u32,
    /// The proposer whose Commit this node saw last; it may skip Phase 1.
    pub leader_id: NodeId,
}

impl Default for NodeState {
    fn default() -> NodeState {
        NodeState {
            instance_id: 1,
            leader_id: NO_LEADER,
        }
    }
}

/// Pending `(deadline, iid, ballot)` retry timers, drained at the top of the
/// reactor loop. Cancellation is implicit: a timer whose ballot is no longer
/// the live round for its instance fizzles in the proposer.
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u32, u32)>>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue::default()
    }

    /// Arms the retry timer for `(iid, bal)`, due after [`PHASE_TIMEOUT`].
    pub fn arm(&mut self, iid: u32, bal: u32) {
        self.arm_at(Instant::now() + PHASE_TIMEOUT, iid, bal);
    }

    pub fn arm_at(&mut self, deadline: Instant, iid: u32, bal: u32) {
        self.heap.push(Reverse((deadline, iid, bal)));
    }

    /// Time until the earliest timer, if any is armed.
    pub fn until_next(&self) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse((deadline, _, _))| deadline.saturating_duration_since(Instant::now()))
    }

    /// Pops the earliest timer if its deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<(u32, u32)> {
        match self.heap.peek() {
            Some(Reverse((deadline, _, _))) if *deadline <= now => {}
            _ => return None,
        }
        self.heap.pop().map(|Reverse((_, iid, bal))| (iid, bal))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// One process of the cluster. Owns the transport, the reassembly buffers
/// and whichever role handles its config grants it. All mutation happens on
/// the reactor, one inbound event at a time.
pub struct Node<T: Transport> {
    id: NodeId,
    cfg: Arc<ClusterConfig>,
    trans: T,
    state: NodeState,
    timers: TimerQueue,
    // per-peer byte accumulators; frames are length-prefixed so whole
    // frames can be carved out one at a time
    bufs: HashMap<NodeId, Vec<u8>>,
    client: Option<Client>,
    proposer: Option<Proposer>,
    acceptor: Option<Acceptor>,
    learner: Option<Learner>,
    events_tx: Sender<(NodeId, Vec<u8>)>,
    events_rx: Receiver<(NodeId, Vec<u8>)>,
}

impl Node<UdpTransport> {
    /// Boots a node from a cluster config file; the node's own ID is the
    /// `NodeID` field of the document.
    pub fn from_config_file(path: &str) -> Result<Node<UdpTransport>> {
        let cfg = ClusterConfig::load_from_file(path)?;
        let trans = UdpTransport::bind(cfg.node_id)?;
        Ok(Node::new(cfg, trans))
    }

    /// Starts the transport receive loop feeding this node's reactor.
    pub fn start(&self) -> Result<()> {
        self.trans.start(self.events_tx.clone())?;
        Ok(())
    }
}

impl<T: Transport> Node<T> {
    pub fn new(cfg: ClusterConfig, trans: T) -> Node<T> {
        let cfg = Arc::new(cfg);
        let id = cfg.node_id;
        let proposer = if cfg.is_proposer(id) {
            Some(Proposer::new(id, cfg.clone()))
        } else {
            None
        };
        let acceptor = if cfg.is_acceptor(id) {
            Some(Acceptor::new(id))
        } else {
            None
        };
        let learner = if cfg.is_learner(id) {
            Some(Learner::new(id))
        } else {
            None
        };
        // a server with no protocol role acts as a client
        let client = if proposer.is_none() && acceptor.is_none() && learner.is_none() {
            match cfg.default_leader() {
                Some(leader) => Some(Client::new(id, leader)),
                None => {
                    warn!("[{}] no proposers configured, client role disabled.", id);
                    None
                }
            }
        } else {
            None
        };
        let (events_tx, events_rx) = mpsc::channel();
        Node {
            id,
            cfg,
            trans,
            state: NodeState::default(),
            timers: TimerQueue::new(),
            bufs: HashMap::new(),
            client,
            proposer,
            acceptor,
            learner,
            events_tx,
            events_rx,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.cfg
    }

    pub fn instance_id(&self) -> u32 {
        self.state.instance_id
    }

    pub fn leader_id(&self) -> NodeId {
        self.state.leader_id
    }

    /// Installs the application callback chosen values are delivered to, in
    /// instance order. Only meaningful on a node with a learner role.
    pub fn set_applier(&mut self, applier: Box<dyn Applier>) {
        match self.learner.as_mut() {
            Some(l) => l.set_applier(applier),
            None => warn!("[{}] applier installed but this node is no learner.", self.id),
        }
    }

    /// Submits a value through this node's client role.
    pub fn submit(&self, seq: u32, val: wire::Value) -> std::io::Result<usize> {
        match self.client.as_ref() {
            Some(c) => c.submit(seq, val, &self.trans),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "this node runs no client role",
            )),
        }
    }

    /// The reactor: one datagram or timer expiry at a time, run to
    /// completion. Returns only if the event channel dies.
    pub fn run(&mut self) {
        loop {
            let event = match self.timers.until_next() {
                Some(wait) => match self.events_rx.recv_timeout(wait) {
                    Ok(ev) => Some(ev),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.events_rx.recv() {
                    Ok(ev) => Some(ev),
                    Err(_) => break,
                },
            };
            if let Some((src, data)) = event {
                self.on_recv(src, &data);
            }
            self.fire_timers();
        }
    }

    /// Transport delivery callback: accumulate, carve out whole frames,
    /// dispatch. A malformed frame throws away everything buffered from that
    /// peer.
    pub fn on_recv(&mut self, from: NodeId, data: &[u8]) {
        let mut buf = self.bufs.remove(&from).unwrap_or_default();
        buf.extend_from_slice(data);
        if let Err(e) = self.drain_frames(from, &mut buf) {
            warn!(
                "[{}] {} from {} ({} buffered bytes dropped).",
                self.id,
                e,
                from,
                buf.len()
            );
            buf.clear();
        }
        self.bufs.insert(from, buf);
    }

    /// Carves whole frames off the front of `buf` and dispatches them, until
    /// the buffer is drained or a frame fails to decode.
    fn drain_frames(&mut self, from: NodeId, buf: &mut Vec<u8>) -> Result<()> {
        while !buf.is_empty() {
            let (msg, consumed) = wire::decode_one(buf)?;
            buf.drain(..consumed);
            self.dispatch(msg, from);
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: Message, from: NodeId) {
        match msg {
            Message::Request(req) => {
                let status = match self.proposer.as_mut() {
                    None => {
                        let e = Error::NotProposerLeader;
                        warn!("[{}] request from {} dropped: {}", self.id, from, e);
                        Some(e.status())
                    }
                    Some(p) => match p.on_request(
                        &req,
                        from,
                        &mut self.state,
                        &mut self.timers,
                        &self.trans,
                    ) {
                        Ok(()) => None,
                        Err(e) => {
                            warn!("[{}] request seq {} aborted: {}", self.id, req.iid, e);
                            Some(e.status())
                        }
                    },
                };
                if let Some(ret) = status {
                    let rsp = Message::Response(Response { iid: req.iid, ret });
                    if let Err(e) = self.trans.send_to(from, &rsp.encode()) {
                        warn!("[{}] error response to {} failed: {}", self.id, from, e);
                    }
                }
            }
            Message::Response(rsp) => match self.client.as_ref() {
                Some(c) => c.on_response(&rsp, from),
                None => debug!("[{}] response from {} ignored, no client role.", self.id, from),
            },
            Message::Prepare(p1a) => match self.acceptor.as_mut() {
                Some(a) => a.on_prepare(&p1a, from, &self.trans),
                None => debug!("[{}] prepare from {} ignored, no acceptor role.", self.id, from),
            },
            Message::Promise(pro) => match self.proposer.as_mut() {
                Some(p) => p.on_promise(&pro, from, &self.trans),
                None => debug!("[{}] promise from {} ignored, no proposer role.", self.id, from),
            },
            Message::Accept(p2a) => {
                // the learner overhears accepts so a later commit can be
                // resolved to its value
                if let Some(l) = self.learner.as_mut() {
                    l.observe_accept(&p2a);
                }
                match self.acceptor.as_mut() {
                    Some(a) => a.on_accept(&p2a, from, &self.trans),
                    None => debug!("[{}] accept from {} ignored, no acceptor role.", self.id, from),
                }
            }
            Message::Accepted(acd) => match self.proposer.as_mut() {
                Some(p) => {
                    p.on_accepted(&acd, from, &mut self.state, &mut self.timers, &self.trans)
                }
                None => debug!("[{}] accepted from {} ignored, no proposer role.", self.id, from),
            },
            Message::Commit(cmt) => {
                self.observe_leader(from);
                if let Some(a) = self.acceptor.as_mut() {
                    a.on_commit(&cmt, from);
                }
                if let Some(l) = self.learner.as_mut() {
                    l.on_commit(&cmt, from);
                }
            }
        }
    }

    /// The leader rule, in one place: the last committer observed becomes
    /// the leader this node routes around.
    fn observe_leader(&mut self, from: NodeId) {
        if self.state.leader_id != from {
            info!("[{}] leader is now {} (last committer).", self.id, from);
        }
        self.state.leader_id = from;
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some((iid, bal)) = self.timers.pop_due(now) {
            if let Some(p) = self.proposer.as_mut() {
                p.on_timeout(iid, bal, &mut self.timers, &self.trans);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synod::Applier;
    use crate::transport::mock::MockTransport;
    use crate::wire::{
        Accepted, Commit, Message, Prepare, Request, Value, STATUS_NOT_LEADER, STATUS_OK,
    };
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;

    fn cluster_cfg(node_id: NodeId) -> ClusterConfig {
        ClusterConfig {
            node_id,
            server_list: vec![1, 2, 3, 9],
            proposer_list: vec![1],
            acceptor_list: vec![1, 2, 3],
            learner_list: vec![3],
        }
    }

    #[test]
    fn roles_follow_membership() {
        let n1 = Node::new(cluster_cfg(1), MockTransport::new());
        assert!(n1.proposer.is_some());
        assert!(n1.acceptor.is_some());
        assert!(n1.learner.is_none());
        assert!(n1.client.is_none());

        let n9 = Node::new(cluster_cfg(9), MockTransport::new());
        assert!(n9.proposer.is_none());
        assert!(n9.acceptor.is_none());
        assert!(n9.client.is_some());
    }

    #[test]
    fn malformed_frame_resets_peer_buffer() {
        let trans = MockTransport::new();
        let mut node = Node::new(cluster_cfg(2), trans.clone());

        // a valid prepare followed by a request whose value size is zero
        let mut data = Message::Prepare(Prepare { iid: 1, bal: 7 }).encode();
        data.extend_from_slice(&[
            4, 0, 0, 0, // len
            0x0a, 0, 0, 0, // typ: request
            5, 0, 0, 0, // iid
            0, 0, 0, 0, // val.siz == 0, malformed
        ]);
        node.on_recv(9, &data);

        // the valid frame was handled (a promise went out), the rest of the
        // buffer was thrown away
        let sent = trans.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].1, Message::Promise(_)));
        assert!(node.bufs[&9].is_empty());
    }

    #[test]
    fn request_without_proposer_answers_not_leader() {
        let trans = MockTransport::new();
        let mut node = Node::new(cluster_cfg(2), trans.clone());

        let req = Message::Request(Request {
            iid: 77,
            val: Value::new(vec![1]),
        });
        node.on_recv(9, &req.encode());

        let sent = trans.take_sent();
        assert_eq!(
            sent,
            vec![(
                9,
                Message::Response(crate::wire::Response {
                    iid: 77,
                    ret: STATUS_NOT_LEADER,
                })
            )]
        );
    }

    #[test]
    fn last_committer_becomes_leader() {
        let trans = MockTransport::new();
        let mut node = Node::new(cluster_cfg(2), trans);
        assert_eq!(node.leader_id(), NO_LEADER);

        node.on_recv(7, &Message::Commit(Commit { iid: 1, bal: 701 }).encode());
        assert_eq!(node.leader_id(), 7);
        node.on_recv(4, &Message::Commit(Commit { iid: 2, bal: 401 }).encode());
        assert_eq!(node.leader_id(), 4);
    }

    #[test]
    fn stray_role_traffic_is_ignored() {
        let trans = MockTransport::new();
        let mut node = Node::new(cluster_cfg(9), trans.clone());

        node.on_recv(
            1,
            &Message::Accepted(Accepted {
                iid: 1,
                acc: 1,
                bal: 101,
                val: Value::new(vec![1]),
            })
            .encode(),
        );
        node.on_recv(1, &Message::Prepare(Prepare { iid: 1, bal: 101 }).encode());
        assert_eq!(trans.sent_count(), 0);
    }

    #[test]
    fn due_timer_restarts_phase_one() {
        let trans = MockTransport::new();
        let mut node = Node::new(cluster_cfg(1), trans.clone());

        let req = Message::Request(Request {
            iid: 100,
            val: Value::new(vec![42, 0, 0, 0]),
        });
        node.on_recv(9, &req.encode());
        // prepares for ballot 101 went out (no leader yet)
        let sent = trans.take_sent();
        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[0].1, Message::Prepare(Prepare { bal: 101, .. })));

        // force the ballot timer due and fire it
        node.timers.arm_at(Instant::now(), 1, 101);
        node.fire_timers();

        let sent = trans.take_sent();
        assert_eq!(sent.len(), 3);
        for (_, m) in &sent {
            assert_eq!(*m, Message::Prepare(Prepare { iid: 1, bal: 102 }));
        }
    }

    /// Routes every send into a shared queue so a whole cluster can run in
    /// one test, one delivery at a time.
    #[derive(Clone)]
    struct Loopback {
        src: NodeId,
        queue: Rc<RefCell<VecDeque<(NodeId, NodeId, Vec<u8>)>>>,
    }

    impl Transport for Loopback {
        fn send_to(&self, dst: NodeId, data: &[u8]) -> io::Result<usize> {
            self.queue
                .borrow_mut()
                .push_back((self.src, dst, data.to_vec()));
            Ok(data.len())
        }
    }

    struct Sink(Rc<RefCell<Vec<(u32, Vec<u8>)>>>);

    impl Applier for Sink {
        fn apply(&mut self, iid: u32, val: &Value) {
            self.0.borrow_mut().push((iid, val.oct.clone()));
        }
    }

    fn pump(
        queue: &Rc<RefCell<VecDeque<(NodeId, NodeId, Vec<u8>)>>>,
        nodes: &mut HashMap<NodeId, Node<Loopback>>,
    ) {
        let mut hops = 0;
        loop {
            let item = queue.borrow_mut().pop_front();
            let (src, dst, data) = match item {
                Some(it) => it,
                None => break,
            };
            if let Some(node) = nodes.get_mut(&dst) {
                node.on_recv(src, &data);
            }
            hops += 1;
            assert!(hops < 1000, "message storm");
        }
    }

    #[test]
    fn three_acceptor_cluster_decides_and_elects() {
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        let mut nodes: HashMap<NodeId, Node<Loopback>> = HashMap::new();
        for &id in &[1u32, 2, 3, 9] {
            let trans = Loopback {
                src: id,
                queue: queue.clone(),
            };
            nodes.insert(id, Node::new(cluster_cfg(id), trans));
        }
        let applied = Rc::new(RefCell::new(Vec::new()));
        nodes
            .get_mut(&3)
            .unwrap()
            .set_applier(Box::new(Sink(applied.clone())));

        // the first decree runs both phases, nobody has committed yet
        nodes[&9]
            .submit(100, Value::new(vec![42, 0, 0, 0]))
            .expect("submit");
        pump(&queue, &mut nodes);

        assert_eq!(nodes[&1].instance_id(), 2);
        assert_eq!(applied.borrow().as_slice(), &[(1, vec![42, 0, 0, 0])]);
        // node 1 committed, so every server now follows it
        for id in 1..=3 {
            assert_eq!(nodes[&id].leader_id(), 1);
        }

        // the second decree takes the leader short path
        nodes[&9]
            .submit(101, Value::new(vec![84, 0, 0, 0]))
            .expect("submit");
        pump(&queue, &mut nodes);

        assert_eq!(nodes[&1].instance_id(), 3);
        assert_eq!(
            applied.borrow().as_slice(),
            &[(1, vec![42, 0, 0, 0]), (2, vec![84, 0, 0, 0])]
        );
    }

    #[test]
    fn client_gets_ok_response_end_to_end() {
        // watch the wire into the client node: a single submission must be
        // answered with STATUS_OK
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        let mut nodes: HashMap<NodeId, Node<Loopback>> = HashMap::new();
        for &id in &[1u32, 2, 3, 9] {
            let trans = Loopback {
                src: id,
                queue: queue.clone(),
            };
            nodes.insert(id, Node::new(cluster_cfg(id), trans));
        }
        nodes[&9]
            .submit(500, Value::new(vec![5]))
            .expect("submit");

        let mut responses = Vec::new();
        let mut hops = 0;
        loop {
            let item = queue.borrow_mut().pop_front();
            let (src, dst, data) = match item {
                Some(it) => it,
                None => break,
            };
            if dst == 9 {
                let (m, _) = wire::decode_one(&data).expect("frame to client");
                responses.push(m);
            }
            if let Some(node) = nodes.get_mut(&dst) {
                node.on_recv(src, &data);
            }
            hops += 1;
            assert!(hops < 1000, "message storm");
        }
        assert_eq!(
            responses,
            vec![Message::Response(crate::wire::Response {
                iid: 500,
                ret: STATUS_OK,
            })]
        );
    }
}
