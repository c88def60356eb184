//! The module that contains the structs representing clients, proposers,
//! acceptors and learners. It also contains the main logic of the protocol:
//! ballot selection, the two phases, value substitution and commit dispatch.
//!
//! Role handlers never run concurrently with each other; the node reactor
//! feeds them one decoded message at a time. All sends go through the
//! [`Transport`] handle the node passes in.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use log::Level;

use crate::configurations::ClusterConfig;
use crate::error::{Error, Result};
use crate::node::{NodeState, TimerQueue};
use crate::transport::Transport;
use crate::wire::{
    Accept, Accepted, Commit, Message, Prepare, Promise, Request, Response, Value, INVALID_BALLOT,
    STATUS_OK,
};
use crate::NodeId;

/// Where a proposer's current round for an instance stands.
///
/// ```text
/// Idle -> SendPrepare -> QuorumPromised -> SendAccept -> QuorumAccepted -> SendCommit
///             ^                                              |
///             +----------- (timeout, higher ballot) ---------+
/// ```
///
/// The established leader enters at `SendAccept` directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    SendPrepare,
    QuorumPromised,
    SendAccept,
    QuorumAccepted,
    SendCommit,
}

/// A client submission waiting for a decree of its own.
#[derive(Clone, Debug)]
struct PendingRequest {
    seq: u32,
    client: NodeId,
    val: Value,
}

/// Everything a proposer tracks for one instance while a ballot is in
/// flight. Bumping the ballot resets the tallies; the whole record is torn
/// down when the instance commits.
struct Round {
    bal: u32,
    phase: Phase,
    promises: HashMap<NodeId, Promise>,
    accepts: HashMap<NodeId, Accepted>,
    // the Accept actually sent for (iid, bal), if phase 2 has started
    p2a: Option<Accept>,
    // phase 2 carried a value inherited from an earlier ballot
    got_old_val: bool,
}

impl Default for Round {
    fn default() -> Round {
        Round {
            bal: 0,
            phase: Phase::Idle,
            promises: HashMap::new(),
            accepts: HashMap::new(),
            p2a: None,
            got_old_val: false,
        }
    }
}

impl Round {
    fn reset(&mut self, bal: u32) {
        self.bal = bal;
        self.phase = Phase::Idle;
        self.promises.clear();
        self.accepts.clear();
        self.p2a = None;
        self.got_old_val = false;
    }
}

/// The struct representing the proposer role. It drives Phase 1 and Phase 2
/// for one instance at a time and queues further client requests until the
/// current instance commits.
pub struct Proposer {
    id: NodeId,
    cfg: Arc<ClusterConfig>,
    quorum: usize,
    rounds: HashMap<u32, Round>,
    // per-instance ballot counter, seeded with id * 100 on first use
    counters: HashMap<u32, u32>,
    pending: VecDeque<PendingRequest>,
}

impl Proposer {
    pub fn new(id: NodeId, cfg: Arc<ClusterConfig>) -> Proposer {
        let quorum = cfg.quorum();
        Proposer {
            id,
            cfg,
            quorum,
            rounds: HashMap::new(),
            counters: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// A ballot strictly greater than any this proposer has issued for
    /// `iid`. Ballot bases are spaced by node ID, so concurrent proposers
    /// never collide and the numerically higher ID wins ties per round.
    fn next_ballot(&mut self, iid: u32) -> u32 {
        let counter = self.counters.entry(iid).or_insert(self.id * 100);
        *counter += 1;
        *counter
    }

    // Handlers

    /// Handles a Request sent by a client. The request is queued and a round
    /// is started for the node's current instance; a non-Ok return is turned
    /// into a Response by the demux.
    pub fn on_request<T: Transport>(
        &mut self,
        req: &Request,
        from: NodeId,
        state: &mut NodeState,
        timers: &mut TimerQueue,
        trans: &T,
    ) -> Result<()> {
        if log_enabled!(Level::Info) {
            info!(
                "[P={}] I will handle request seq {} from client {}.",
                self.id, req.iid, from
            );
        }
        self.pending.push_back(PendingRequest {
            seq: req.iid,
            client: from,
            val: req.val.clone(),
        });
        self.start_round(state, timers, trans)
    }

    /// Handles a Promise sent by an acceptor. Stale ballots and wrong-phase
    /// arrivals are dropped; a quorum of promises moves the round to
    /// Phase 2.
    pub fn on_promise<T: Transport>(&mut self, pro: &Promise, _from: NodeId, trans: &T) {
        let quorum = self.quorum;
        let fire = {
            let round = self.rounds.entry(pro.iid).or_insert_with(Round::default);
            if pro.bal != round.bal {
                debug!(
                    "[P={}] stale promise for instance {} at ballot {} (current {}), dropped.",
                    self.id, pro.iid, pro.bal, round.bal
                );
                return;
            }
            if round.phase != Phase::SendPrepare && round.phase != Phase::QuorumPromised {
                debug!(
                    "[P={}] promise for instance {} in phase {:?}, dropped.",
                    self.id, pro.iid, round.phase
                );
                return;
            }
            if round.promises.insert(pro.acc, pro.clone()).is_some() {
                debug!(
                    "[P={}] duplicate promise from acceptor {} for instance {}.",
                    self.id, pro.acc, pro.iid
                );
            }
            round.promises.len() >= quorum && round.phase == Phase::SendPrepare
        };
        if fire {
            if log_enabled!(Level::Info) {
                info!(
                    "[P={}] quorum of promises for instance {}.",
                    self.id, pro.iid
                );
            }
            self.phase2(pro.iid, trans);
        }
    }

    /// Handles an Accepted sent by an acceptor. A quorum of accepts commits
    /// the instance.
    pub fn on_accepted<T: Transport>(
        &mut self,
        acd: &Accepted,
        from: NodeId,
        state: &mut NodeState,
        timers: &mut TimerQueue,
        trans: &T,
    ) {
        if acd.acc != from {
            warn!(
                "[P={}] accepted claiming acceptor {} arrived from {}, dropped.",
                self.id, acd.acc, from
            );
            return;
        }
        let quorum = self.quorum;
        let fire = {
            let round = match self.rounds.get_mut(&acd.iid) {
                Some(r) => r,
                None => {
                    debug!(
                        "[P={}] accepted for unknown instance {}, dropped.",
                        self.id, acd.iid
                    );
                    return;
                }
            };
            if round.p2a.is_none() || acd.bal != round.bal {
                debug!(
                    "[P={}] no outstanding accept for instance {} at ballot {}, dropped.",
                    self.id, acd.iid, acd.bal
                );
                return;
            }
            if round.phase != Phase::SendAccept {
                debug!(
                    "[P={}] accepted for instance {} in phase {:?}, dropped.",
                    self.id, acd.iid, round.phase
                );
                return;
            }
            round.accepts.insert(acd.acc, acd.clone());
            if round.accepts.len() >= quorum {
                round.phase = Phase::QuorumAccepted;
                true
            } else {
                false
            }
        };
        if fire {
            self.commit(acd.iid, state, timers, trans);
        }
    }

    /// Fired by the reactor when the timer armed for `(iid, bal)` expires.
    /// A round still stuck on that ballot restarts Phase 1 under a strictly
    /// greater one; anything else means the timer was superseded.
    pub fn on_timeout<T: Transport>(
        &mut self,
        iid: u32,
        bal: u32,
        timers: &mut TimerQueue,
        trans: &T,
    ) {
        let stalled = match self.rounds.get(&iid) {
            Some(r) => r.bal == bal && r.phase != Phase::Idle,
            None => false,
        };
        if !stalled {
            return;
        }
        let nbal = self.next_ballot(iid);
        warn!(
            "[P={}] ballot {} for instance {} stalled, retrying phase 1 at ballot {}.",
            self.id, bal, iid, nbal
        );
        if let Some(round) = self.rounds.get_mut(&iid) {
            round.reset(nbal);
            round.phase = Phase::SendPrepare;
        }
        timers.arm(iid, nbal);
        if let Err(e) =
            self.broadcast_to_acceptors(&Message::Prepare(Prepare { iid, bal: nbal }), trans)
        {
            warn!("[P={}] phase 1 retry broadcast failed: {}", self.id, e);
        }
    }

    // Senders

    /// Starts a round for the node's current instance, proposing the head of
    /// the pending queue. The established leader skips Phase 1.
    fn start_round<T: Transport>(
        &mut self,
        state: &mut NodeState,
        timers: &mut TimerQueue,
        trans: &T,
    ) -> Result<()> {
        let val = match self.pending.front() {
            Some(p) => p.val.clone(),
            None => return Ok(()),
        };
        let iid = state.instance_id;
        let bal = self.next_ballot(iid);
        let leader = state.leader_id == self.id;
        let round = self.rounds.entry(iid).or_insert_with(Round::default);
        round.reset(bal);
        timers.arm(iid, bal);
        if leader {
            let p2a = Accept { iid, bal, val };
            round.phase = Phase::SendAccept;
            round.p2a = Some(p2a.clone());
            if log_enabled!(Level::Info) {
                info!(
                    "[P={}] leader short circuit: accept for instance {} at ballot {}.",
                    self.id, iid, bal
                );
            }
            self.broadcast_to_acceptors(&Message::Accept(p2a), trans)
        } else {
            round.phase = Phase::SendPrepare;
            if log_enabled!(Level::Info) {
                info!(
                    "[P={}] prepare for instance {} at ballot {}.",
                    self.id, iid, bal
                );
            }
            self.broadcast_to_acceptors(&Message::Prepare(Prepare { iid, bal }), trans)
        }
    }

    /// Phase 2: propose a value at the promised ballot. An acceptor that
    /// already voted binds us to the value of the highest such vote;
    /// otherwise the head of the pending queue rides this instance.
    fn phase2<T: Transport>(&mut self, iid: u32, trans: &T) {
        let p2a = {
            let round = match self.rounds.get_mut(&iid) {
                Some(r) => r,
                None => return,
            };
            round.phase = Phase::QuorumPromised;
            let mut prior: Option<&Promise> = None;
            for p in round.promises.values() {
                if p.max_vbal == INVALID_BALLOT {
                    continue;
                }
                let better = match prior {
                    Some(q) => p.max_vbal > q.max_vbal,
                    None => true,
                };
                if better {
                    prior = Some(p);
                }
            }
            let (val, got_old) = match prior {
                Some(p) => (p.max_val.clone(), true),
                None => match self.pending.front() {
                    Some(pend) => (pend.val.clone(), false),
                    None => {
                        warn!(
                            "[P={}] quorum promised for instance {} but nothing to propose.",
                            self.id, iid
                        );
                        return;
                    }
                },
            };
            if got_old && log_enabled!(Level::Info) {
                info!(
                    "[P={}] instance {} bound to a previously accepted value.",
                    self.id, iid
                );
            }
            let p2a = Accept {
                iid,
                bal: round.bal,
                val,
            };
            round.got_old_val = got_old;
            round.p2a = Some(p2a.clone());
            round.phase = Phase::SendAccept;
            p2a
        };
        if let Err(e) = self.broadcast_to_acceptors(&Message::Accept(p2a), trans) {
            warn!("[P={}] phase 2 broadcast failed: {}", self.id, e);
        }
    }

    /// The decree is quorum-accepted: tell every acceptor and learner,
    /// answer the client, advance the instance and take on the next pending
    /// request if there is one.
    fn commit<T: Transport>(
        &mut self,
        iid: u32,
        state: &mut NodeState,
        timers: &mut TimerQueue,
        trans: &T,
    ) {
        let bal = match self.rounds.get(&iid) {
            Some(r) => r.bal,
            None => return,
        };
        if log_enabled!(Level::Info) {
            info!(
                "[P={}] instance {} chosen at ballot {}, committing.",
                self.id, iid, bal
            );
        }
        let bytes = Message::Commit(Commit { iid, bal }).encode();
        let mut sent = 0usize;
        for dst in self.commit_targets() {
            match trans.send_to(dst, &bytes) {
                Ok(_) => sent += 1,
                Err(e) => warn!("[P={}] commit send to {} failed: {}", self.id, dst, e),
            }
        }
        if sent == 0 {
            // leave the round in QuorumAccepted; the ballot timer will run
            // phase 1 again and re-commit the same value
            warn!(
                "[P={}] commit broadcast for instance {} reached nobody.",
                self.id, iid
            );
            return;
        }
        if let Some(round) = self.rounds.get_mut(&iid) {
            round.phase = Phase::SendCommit;
        }
        if let Some(p) = self.pending.pop_front() {
            let rsp = Message::Response(Response {
                iid: p.seq,
                ret: STATUS_OK,
            });
            if let Err(e) = trans.send_to(p.client, &rsp.encode()) {
                warn!(
                    "[P={}] response to client {} failed: {}",
                    self.id, p.client, e
                );
            }
        }
        self.rounds.remove(&iid);
        self.counters.remove(&iid);
        state.instance_id += 1;
        if !self.pending.is_empty() {
            if let Err(e) = self.start_round(state, timers, trans) {
                warn!(
                    "[P={}] relaunch for instance {} failed: {}",
                    self.id, state.instance_id, e
                );
            }
        }
    }

    /// Sends one frame to every acceptor. Reaching fewer than a quorum makes
    /// the whole broadcast pointless, so that is reported as an error.
    fn broadcast_to_acceptors<T: Transport>(&self, m: &Message, trans: &T) -> Result<()> {
        let bytes = m.encode();
        let mut acked = 0usize;
        for &acc in &self.cfg.acceptor_list {
            match trans.send_to(acc, &bytes) {
                Ok(_) => acked += 1,
                Err(e) => {
                    warn!("[P={}] send to acceptor {} failed: {}", self.id, acc, e);
                    break;
                }
            }
        }
        if acked < self.quorum {
            return Err(Error::ClusterUnavailable {
                acked,
                quorum: self.quorum,
            });
        }
        Ok(())
    }

    /// Commits fan out to every acceptor and every learner, once each.
    fn commit_targets(&self) -> Vec<NodeId> {
        let mut targets = self.cfg.acceptor_list.clone();
        for &l in &self.cfg.learner_list {
            if !targets.contains(&l) {
                targets.push(l);
            }
        }
        targets
    }
}

/// Per-instance acceptor state. `max_bal` is the highest ballot promised,
/// `max_vbal` the ballot of the last accepted value and `max_val` that
/// value. All three only ever grow.
#[derive(Clone, Debug, Default)]
struct AcceptorState {
    max_bal: u32,
    max_vbal: u32,
    max_val: Value,
}

/// The struct representing the acceptor role: the durable memory of the
/// protocol. It answers Prepare with Promise and Accept with Accepted, and
/// silently drops anything below what it already promised.
pub struct Acceptor {
    id: NodeId,
    states: HashMap<u32, AcceptorState>,
}

impl Acceptor {
    pub fn new(id: NodeId) -> Acceptor {
        Acceptor {
            id,
            states: HashMap::new(),
        }
    }

    /// Handles a Prepare sent by a proposer: promise iff the ballot beats
    /// every ballot promised so far for this instance.
    pub fn on_prepare<T: Transport>(&mut self, p1a: &Prepare, from: NodeId, trans: &T) {
        let st = self.states.entry(p1a.iid).or_default();
        if p1a.bal <= st.max_bal {
            debug!(
                "[A={}] stale prepare for instance {} (ballot {} <= promised {}), dropped.",
                self.id, p1a.iid, p1a.bal, st.max_bal
            );
            return;
        }
        st.max_bal = p1a.bal;
        let max_vbal = if st.max_val.is_none() {
            INVALID_BALLOT
        } else {
            st.max_vbal
        };
        let m = Message::Promise(Promise {
            iid: p1a.iid,
            acc: self.id,
            bal: p1a.bal,
            max_vbal,
            max_val: st.max_val.clone(),
        });
        if log_enabled!(Level::Info) {
            info!(
                "[A={}] promising ballot {} for instance {} to proposer {}.",
                self.id, p1a.bal, p1a.iid, from
            );
        }
        if let Err(e) = trans.send_to(from, &m.encode()) {
            warn!("[A={}] promise to {} failed: {}", self.id, from, e);
        }
    }

    /// Handles an Accept sent by a proposer. The comparison is non-strict:
    /// a leader that skipped Phase 1 proposes against a 0 promise and must
    /// be admitted.
    pub fn on_accept<T: Transport>(&mut self, p2a: &Accept, from: NodeId, trans: &T) {
        let st = self.states.entry(p2a.iid).or_default();
        if p2a.bal < st.max_bal {
            debug!(
                "[A={}] stale accept for instance {} (ballot {} < promised {}), dropped.",
                self.id, p2a.iid, p2a.bal, st.max_bal
            );
            return;
        }
        st.max_bal = p2a.bal;
        st.max_vbal = p2a.bal;
        st.max_val = p2a.val.clone();
        let m = Message::Accepted(Accepted {
            iid: p2a.iid,
            acc: self.id,
            bal: p2a.bal,
            val: p2a.val.clone(),
        });
        if log_enabled!(Level::Info) {
            info!(
                "[A={}] accepted instance {} at ballot {}.",
                self.id, p2a.iid, p2a.bal
            );
        }
        if let Err(e) = trans.send_to(from, &m.encode()) {
            warn!("[A={}] accepted to {} failed: {}", self.id, from, e);
        }
    }

    /// A Commit has no per-instance effect on the acceptor; the leader
    /// bookkeeping and the learner hook live on the node.
    pub fn on_commit(&mut self, cmt: &Commit, from: NodeId) {
        if log_enabled!(Level::Info) {
            info!(
                "[A={}] instance {} committed at ballot {} by {}.",
                self.id, cmt.iid, cmt.bal, from
            );
        }
    }
}

/// The struct representing the client role: it frames values into Requests
/// for the configured leader and reports Responses. There is no retry; a
/// lost Response stays lost.
pub struct Client {
    id: NodeId,
    leader: NodeId,
}

impl Client {
    pub fn new(id: NodeId, leader: NodeId) -> Client {
        Client { id, leader }
    }

    /// Sends `(seq, val)` to the leader, returning the bytes written.
    pub fn submit<T: Transport>(&self, seq: u32, val: Value, trans: &T) -> io::Result<usize> {
        if val.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "client values must not be empty",
            ));
        }
        let m = Message::Request(Request { iid: seq, val });
        let n = trans.send_to(self.leader, &m.encode())?;
        if log_enabled!(Level::Info) {
            info!(
                "[C={}] request seq {} sent to proposer {} ({} bytes).",
                self.id, seq, self.leader, n
            );
        }
        Ok(n)
    }

    pub fn on_response(&self, rsp: &Response, from: NodeId) {
        info!(
            "[C={}] response for seq {} from {}: status {}.",
            self.id, rsp.iid, from, rsp.ret
        );
    }
}

/// Consumes chosen values in instance order. Implemented by the application
/// layer; the learner calls it from the reactor.
pub trait Applier {
    fn apply(&mut self, iid: u32, val: &Value);
}

/// The struct representing the learner role. Commits do not carry the value,
/// so the learner keeps the Accepts its node has seen and resolves each
/// Commit against that cache; a learner not co-located with an acceptor can
/// only log that a value it never saw was chosen.
pub struct Learner {
    id: NodeId,
    accepts: HashMap<u32, Accept>,
    chosen: HashMap<u32, Value>,
    // next instance to hand to the applier; values are delivered in order
    next_apply: u32,
    applier: Option<Box<dyn Applier>>,
}

impl Learner {
    pub fn new(id: NodeId) -> Learner {
        Learner {
            id,
            accepts: HashMap::new(),
            chosen: HashMap::new(),
            next_apply: 1,
            applier: None,
        }
    }

    pub fn set_applier(&mut self, applier: Box<dyn Applier>) {
        self.applier = Some(applier);
    }

    /// Remembers the latest Accept seen for an instance so a later Commit
    /// can be resolved to its value.
    pub fn observe_accept(&mut self, p2a: &Accept) {
        self.accepts.insert(p2a.iid, p2a.clone());
    }

    pub fn on_commit(&mut self, cmt: &Commit, from: NodeId) {
        match self.accepts.get(&cmt.iid) {
            Some(a) => {
                if log_enabled!(Level::Info) {
                    info!(
                        "[L={}] instance {} chosen at ballot {} (committed by {}).",
                        self.id, cmt.iid, cmt.bal, from
                    );
                }
                let val = a.val.clone();
                self.chosen.insert(cmt.iid, val);
                self.apply_in_order();
            }
            None => warn!(
                "[L={}] commit for instance {} but no accept was seen, value unknown.",
                self.id, cmt.iid
            ),
        }
    }

    /// Hands chosen values to the applier in strictly increasing instance
    /// order, holding back anything with a gap before it.
    fn apply_in_order(&mut self) {
        while let Some(val) = self.chosen.get(&self.next_apply) {
            match self.applier.as_mut() {
                Some(ap) => ap.apply(self.next_apply, val),
                None => println!("{:?}", val),
            }
            self.next_apply += 1;
        }
    }
}
