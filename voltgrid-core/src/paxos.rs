//! Single-decision Paxos engine.
//!
//! Every node runs the three roles concurrently:
//! - **Acceptor**: promises to ignore lower-numbered proposals, accepts
//!   the highest it has promised.
//! - **Proposer**: drives one round per decision through
//!   PREPARE/PROMISE then ACCEPT/ACCEPTED, each phase bounded by 500 ms.
//! - **Learner**: on CONSENSUS appends the decided commits to the log,
//!   applies their station side effects and resets the local acceptor.
//!   A decided value that does not chain means earlier commits were
//!   missed; the learner then requests the missing log suffix from the
//!   group (SYNC_REQUEST/SYNC_COMMITS) instead of appending.
//!
//! The proposer always proposes its own candidate value and ignores any
//! previously accepted value carried in promises; safety relies on one
//! proposer per logical decision (the coordinator serializes proposals
//! per node). Promises still carry `accepted_n`/`accepted_value` on the
//! wire so full value adoption can be added without a format change.

use crate::commit::{ChainViolation, Commit};
use crate::group::CompanyGroup;
use crate::types::CompanyId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

/// Timeout for each proposer phase (AWAITING_PROMISE and ACCEPT)
pub const PHASE_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-proposer monotonically increasing round ordering
pub type ProposalNumber = u64;

/// The value decided by one round: an ordered set of chained commits
pub type ProposalValue = Vec<Commit>;

/// Consensus messages exchanged between peer nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PaxosMessage {
    #[serde(rename = "PREPARE")]
    Prepare { n: ProposalNumber, from: CompanyId },

    #[serde(rename = "PROMISE")]
    Promise {
        n: ProposalNumber,
        #[serde(rename = "acceptedN")]
        accepted_n: Option<ProposalNumber>,
        #[serde(rename = "acceptedValue")]
        accepted_value: Option<ProposalValue>,
        from: CompanyId,
    },

    #[serde(rename = "ACCEPT")]
    Accept { n: ProposalNumber, value: ProposalValue, from: CompanyId },

    #[serde(rename = "ACCEPTED")]
    Accepted { n: ProposalNumber, from: CompanyId },

    #[serde(rename = "CONSENSUS")]
    Consensus { n: ProposalNumber, value: ProposalValue },

    #[serde(rename = "RESET")]
    Reset,

    /// A replica that cannot chain a decided value asks for the log
    /// suffix it is missing
    #[serde(rename = "SYNC_REQUEST")]
    SyncRequest {
        #[serde(rename = "fromIndex")]
        from_index: u64,
        from: CompanyId,
    },

    /// Ordered log suffix answering a `SYNC_REQUEST`
    #[serde(rename = "SYNC_COMMITS")]
    SyncCommits { commits: Vec<Commit> },
}

impl PaxosMessage {
    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Wire name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            PaxosMessage::Prepare { .. } => "PREPARE",
            PaxosMessage::Promise { .. } => "PROMISE",
            PaxosMessage::Accept { .. } => "ACCEPT",
            PaxosMessage::Accepted { .. } => "ACCEPTED",
            PaxosMessage::Consensus { .. } => "CONSENSUS",
            PaxosMessage::Reset => "RESET",
            PaxosMessage::SyncRequest { .. } => "SYNC_REQUEST",
            PaxosMessage::SyncCommits { .. } => "SYNC_COMMITS",
        }
    }
}

/// Acceptor role state, reset after every learned value
#[derive(Debug, Default)]
pub struct Acceptor {
    promised_n: Option<ProposalNumber>,
    accepted_n: Option<ProposalNumber>,
    accepted_value: Option<ProposalValue>,
}

impl Acceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// PREPARE(n): promise iff `n` is strictly greater than any prior
    /// promise. Returns the prior accepted pair to carry in the PROMISE;
    /// `None` means the message is silently dropped (the proposer reads
    /// rejection from its timeout).
    pub fn handle_prepare(
        &mut self,
        n: ProposalNumber,
    ) -> Option<(Option<ProposalNumber>, Option<ProposalValue>)> {
        if self.promised_n.is_some_and(|p| n <= p) {
            debug!("Acceptor: Ignoring PREPARE({}) below promise {:?}", n, self.promised_n);
            return None;
        }
        self.promised_n = Some(n);
        Some((self.accepted_n, self.accepted_value.clone()))
    }

    /// ACCEPT(n, v): accept iff `n` is at least the promised number
    pub fn handle_accept(&mut self, n: ProposalNumber, value: &ProposalValue) -> bool {
        if self.promised_n.is_some_and(|p| n < p) {
            debug!("Acceptor: Ignoring ACCEPT({}) below promise {:?}", n, self.promised_n);
            return false;
        }
        self.accepted_n = Some(n);
        self.accepted_value = Some(value.clone());
        true
    }

    /// RESET after a value is learned, so stale promises from the
    /// finished round cannot block the next one
    pub fn reset(&mut self) {
        self.promised_n = None;
        self.accepted_n = None;
        self.accepted_value = None;
    }
}

/// Proposer round phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProposerPhase {
    Idle,
    AwaitingPromise,
    Accepting,
}

/// Proposer role state; discarded at round end (success or timeout)
#[derive(Debug)]
pub struct Proposer {
    node_id: CompanyId,
    last_n: ProposalNumber,
    phase: ProposerPhase,
    quorum: usize,
    promises_received: HashSet<CompanyId>,
    accepts_received: HashSet<CompanyId>,
    proposed_value: Option<ProposalValue>,
    deadline: Option<Instant>,
}

impl Proposer {
    pub fn new(node_id: CompanyId) -> Self {
        // Random seed keeps concurrent proposers off the same numbers;
        // ordering stays plain numeric with no tie-breaker.
        let seed = rand::thread_rng().gen_range(0..1_000);
        Self {
            node_id,
            last_n: seed,
            phase: ProposerPhase::Idle,
            quorum: 0,
            promises_received: HashSet::new(),
            accepts_received: HashSet::new(),
            proposed_value: None,
            deadline: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == ProposerPhase::Idle
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// START_PROPOSING: pick a number strictly greater than any this
    /// proposer has used, broadcast PREPARE. `group_size` is the
    /// membership snapshot taken at round start.
    pub fn start(&mut self, value: ProposalValue, group_size: usize) -> ProposalNumber {
        self.last_n += 1;
        self.phase = ProposerPhase::AwaitingPromise;
        self.quorum = group_size / 2 + 1;
        self.promises_received.clear();
        self.accepts_received.clear();
        self.proposed_value = Some(value);
        self.deadline = Some(Instant::now() + PHASE_TIMEOUT);

        debug!(
            "Proposer: {} starting round n={} (quorum {} of {})",
            self.node_id, self.last_n, self.quorum, group_size
        );
        self.last_n
    }

    /// Collect a PROMISE; returns true exactly when the strict majority
    /// is first reached and the round moves to the ACCEPT phase.
    pub fn handle_promise(&mut self, n: ProposalNumber, from: CompanyId) -> bool {
        if self.phase != ProposerPhase::AwaitingPromise || n != self.last_n {
            return false;
        }
        self.promises_received.insert(from);
        if self.promises_received.len() < self.quorum {
            return false;
        }
        self.phase = ProposerPhase::Accepting;
        self.deadline = Some(Instant::now() + PHASE_TIMEOUT);
        debug!(
            "Proposer: {} majority promised for n={} ({} promises)",
            self.node_id,
            n,
            self.promises_received.len()
        );
        true
    }

    /// Collect an ACCEPTED; returns true exactly when the majority is
    /// first reached and the round terminates in CONSENSUS.
    pub fn handle_accepted(&mut self, n: ProposalNumber, from: CompanyId) -> bool {
        if self.phase != ProposerPhase::Accepting || n != self.last_n {
            return false;
        }
        self.accepts_received.insert(from);
        if self.accepts_received.len() < self.quorum {
            return false;
        }
        info!("Proposer: {} reached consensus for n={}", self.node_id, n);
        true
    }

    /// Candidate value of the in-flight round
    pub fn value(&self) -> Option<&ProposalValue> {
        self.proposed_value.as_ref()
    }

    pub fn current_n(&self) -> ProposalNumber {
        self.last_n
    }

    /// Whether the phase deadline has passed
    pub fn timed_out(&self, now: Instant) -> bool {
        self.phase != ProposerPhase::Idle && self.deadline.is_some_and(|d| now >= d)
    }

    /// Abandon the round; the caller retries with a fresh, higher number
    pub fn abandon(&mut self) -> Option<ProposalValue> {
        self.phase = ProposerPhase::Idle;
        self.deadline = None;
        self.promises_received.clear();
        self.accepts_received.clear();
        self.proposed_value.take()
    }
}

/// Decision liveness failures surfaced to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecideError {
    #[error("no majority within the round timeout")]
    Timeout,

    #[error("the proposed value was rejected")]
    Rejected,
}

/// The decision interface the reservation coordinator and membership
/// protocol drive. The Paxos engine is the built-in backend; an
/// external ledger could implement the same contract.
pub trait Decider {
    fn propose(
        &mut self,
        value: ProposalValue,
    ) -> impl std::future::Future<Output = Result<ProposalValue, DecideError>> + Send;
}

/// Where an outbound message should be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every peer in the group (the local roles are fed in-process)
    All,
    /// The named member only
    Peer(CompanyId),
}

/// A message the engine wants delivered
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: Target,
    pub msg: PaxosMessage,
}

/// Result of feeding the engine one event
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub outbound: Vec<Outbound>,
    /// Completion of this node's own in-flight round, if any
    pub decision: Option<Result<ProposalValue, DecideError>>,
}

impl EngineOutput {
    fn send(&mut self, to: Target, msg: PaxosMessage) {
        self.outbound.push(Outbound { to, msg });
    }
}

/// Per-node Paxos driver: owns the local acceptor and proposer, applies
/// learned values to the shared group state (the learner role), and
/// produces the messages to forward to peers.
pub struct PaxosEngine {
    node_id: CompanyId,
    acceptor: Acceptor,
    proposer: Proposer,
    group: Arc<RwLock<CompanyGroup>>,
}

impl PaxosEngine {
    pub fn new(node_id: CompanyId, group: Arc<RwLock<CompanyGroup>>) -> Self {
        Self {
            node_id: node_id.clone(),
            acceptor: Acceptor::new(),
            proposer: Proposer::new(node_id),
            group,
        }
    }

    pub fn node_id(&self) -> &CompanyId {
        &self.node_id
    }

    pub fn group(&self) -> &Arc<RwLock<CompanyGroup>> {
        &self.group
    }

    /// Whether a new round may be started
    pub fn is_idle(&self) -> bool {
        self.proposer.is_idle()
    }

    /// Deadline of the in-flight proposer phase, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.proposer.deadline()
    }

    /// Start one round proposing `value`. The quorum is computed from
    /// the membership snapshot at this moment; the local acceptor is fed
    /// in-process, so a single-member group decides synchronously.
    pub async fn start_round(&mut self, value: ProposalValue) -> EngineOutput {
        let group_size = self.group.read().await.member_count();
        let n = self.proposer.start(value, group_size);

        let mut out = EngineOutput::default();
        out.send(Target::All, PaxosMessage::Prepare { n, from: self.node_id.clone() });

        // Local acceptor short-circuit
        if self.acceptor.handle_prepare(n).is_some() {
            let own = self.node_id.clone();
            self.on_promise(n, own, &mut out).await;
        }
        out
    }

    /// React to one inbound consensus message
    pub async fn handle_message(&mut self, msg: PaxosMessage) -> EngineOutput {
        let mut out = EngineOutput::default();
        match msg {
            PaxosMessage::Prepare { n, from } => {
                if let Some((accepted_n, accepted_value)) = self.acceptor.handle_prepare(n) {
                    out.send(
                        Target::Peer(from),
                        PaxosMessage::Promise {
                            n,
                            accepted_n,
                            accepted_value,
                            from: self.node_id.clone(),
                        },
                    );
                }
            }

            PaxosMessage::Promise { n, from, .. } => {
                self.on_promise(n, from, &mut out).await;
            }

            PaxosMessage::Accept { n, value, from } => {
                if self.acceptor.handle_accept(n, &value) {
                    out.send(Target::Peer(from), PaxosMessage::Accepted { n, from: self.node_id.clone() });
                }
            }

            PaxosMessage::Accepted { n, from } => {
                self.on_accepted(n, from, &mut out).await;
            }

            PaxosMessage::Consensus { n, value } => {
                debug!("Learner: {} learned value for n={}", self.node_id, n);
                if let Err(e) = self.apply_decided(&value).await {
                    // A chain violation means prior commits were missed;
                    // ask the group for the suffix instead of appending.
                    let from_index = self.group.read().await.commits.next_index();
                    warn!(
                        "Learner: {} could not apply decided value: {} (requesting re-sync from index {})",
                        self.node_id, e, from_index
                    );
                    out.send(
                        Target::All,
                        PaxosMessage::SyncRequest { from_index, from: self.node_id.clone() },
                    );
                }
                self.acceptor.reset();
            }

            PaxosMessage::SyncRequest { from_index, from } => {
                let commits: Vec<Commit> =
                    self.group.read().await.commits.replay(from_index).cloned().collect();
                if commits.is_empty() {
                    debug!("Learner: {} has nothing past index {} for {}", self.node_id, from_index, from);
                } else {
                    info!(
                        "Learner: {} sending {} commits from index {} to {}",
                        self.node_id,
                        commits.len(),
                        from_index,
                        from
                    );
                    out.send(Target::Peer(from), PaxosMessage::SyncCommits { commits });
                }
            }

            PaxosMessage::SyncCommits { commits } => {
                match self.apply_decided(&commits).await {
                    Ok(()) => info!(
                        "Learner: {} caught up, log head at index {:?}",
                        self.node_id,
                        self.group.read().await.commits.last_commit_index
                    ),
                    Err(e) => warn!("Learner: {} sync suffix still does not chain: {}", self.node_id, e),
                }
            }

            PaxosMessage::Reset => self.acceptor.reset(),
        }
        out
    }

    /// Expire the in-flight round once its phase deadline passes
    pub fn tick(&mut self, now: Instant) -> Option<DecideError> {
        if !self.proposer.timed_out(now) {
            return None;
        }
        warn!(
            "Proposer: {} round n={} timed out without majority",
            self.node_id,
            self.proposer.current_n()
        );
        self.proposer.abandon();
        Some(DecideError::Timeout)
    }

    async fn on_promise(&mut self, n: ProposalNumber, from: CompanyId, out: &mut EngineOutput) {
        if !self.proposer.handle_promise(n, from) {
            return;
        }
        // Majority promised: broadcast ACCEPT with our own candidate
        // value (no value recovery from promises, see module docs).
        let value = self
            .proposer
            .value()
            .cloned()
            .expect("an in-flight round always carries a value");
        out.send(
            Target::All,
            PaxosMessage::Accept { n, value: value.clone(), from: self.node_id.clone() },
        );

        if self.acceptor.handle_accept(n, &value) {
            let own = self.node_id.clone();
            self.on_accepted(n, own, out).await;
        }
    }

    async fn on_accepted(&mut self, n: ProposalNumber, from: CompanyId, out: &mut EngineOutput) {
        if !self.proposer.handle_accepted(n, from) {
            return;
        }
        let value = self
            .proposer
            .abandon()
            .expect("an in-flight round always carries a value");

        // Notify every learner, then apply locally and reset the
        // acceptor so the finished round cannot block the next one.
        out.send(Target::All, PaxosMessage::Consensus { n, value: value.clone() });

        out.decision = Some(match self.apply_decided(&value).await {
            Ok(()) => Ok(value),
            Err(e) => {
                warn!("Learner: {} decided value failed to chain: {}", self.node_id, e);
                Err(DecideError::Rejected)
            }
        });
        self.acceptor.reset();
    }

    /// Learner write path: append each decided commit and apply its
    /// side effects. Commits already present are skipped so duplicate
    /// CONSENSUS deliveries stay idempotent.
    async fn apply_decided(&mut self, value: &ProposalValue) -> Result<(), ChainViolation> {
        let mut group = self.group.write().await;
        for commit in value {
            if group.commits.by_id(&commit.id).is_some() {
                debug!("Learner: Commit {} already applied", commit.id);
                continue;
            }
            group.commit_and_apply(commit.clone())?;
        }
        Ok(())
    }
}

/// Commands accepted by the engine task
pub enum EngineCommand {
    Propose {
        value: ProposalValue,
        reply: oneshot::Sender<Result<ProposalValue, DecideError>>,
    },
}

/// Cloneable handle submitting decisions to a running engine task
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

/// Create the command channel for [`run_engine`]
pub fn engine_channel(buffer: usize) -> (EngineHandle, mpsc::Receiver<EngineCommand>) {
    let (tx, rx) = mpsc::channel(buffer);
    (EngineHandle { tx }, rx)
}

impl Decider for EngineHandle {
    async fn propose(&mut self, value: ProposalValue) -> Result<ProposalValue, DecideError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Propose { value, reply: reply_tx })
            .await
            .map_err(|_| DecideError::Timeout)?;
        reply_rx.await.map_err(|_| DecideError::Timeout)?
    }
}

/// Engine task: drives one [`PaxosEngine`] over UDP until the command
/// channel closes.
///
/// Commands are only taken while no round is in flight, which
/// serializes this node's proposals; inbound peer messages and the
/// phase deadline are always serviced.
pub async fn run_engine(
    mut engine: PaxosEngine,
    transport: crate::transport::UdpTransport,
    mut commands: mpsc::Receiver<EngineCommand>,
) {
    let mut inbound = transport.start_receive();
    let mut pending: Option<oneshot::Sender<Result<ProposalValue, DecideError>>> = None;

    loop {
        let deadline = engine.deadline();
        tokio::select! {
            cmd = commands.recv(), if pending.is_none() => {
                let Some(EngineCommand::Propose { value, reply }) = cmd else {
                    debug!("Engine: {} command channel closed, stopping", engine.node_id());
                    return;
                };
                let out = engine.start_round(value).await;
                pending = Some(reply);
                deliver(&engine, &transport, out, &mut pending).await;
            }

            received = inbound.recv() => {
                let Some((msg, _from)) = received else { return };
                let out = engine.handle_message(msg).await;
                deliver(&engine, &transport, out, &mut pending).await;
            }

            _ = phase_expiry(deadline) => {
                if let Some(err) = engine.tick(Instant::now()) {
                    if let Some(reply) = pending.take() {
                        let _ = reply.send(Err(err));
                    }
                }
            }
        }
    }
}

/// Resolve targets against the current member list, send everything
/// out, and complete the pending proposal if this event decided it.
async fn deliver(
    engine: &PaxosEngine,
    transport: &crate::transport::UdpTransport,
    out: EngineOutput,
    pending: &mut Option<oneshot::Sender<Result<ProposalValue, DecideError>>>,
) {
    let peers = engine.group.read().await.peer_addresses(&engine.node_id);
    for outbound in out.outbound {
        match outbound.to {
            Target::All => {
                let addrs: Vec<String> = peers.iter().map(|(_, addr)| addr.clone()).collect();
                transport.broadcast(&outbound.msg, &addrs).await;
            }
            Target::Peer(id) => match peers.iter().find(|(peer_id, _)| peer_id == &id) {
                Some((_, addr)) => {
                    if let Err(e) = transport.send(&outbound.msg, addr).await {
                        warn!("Engine: Send to {} failed: {}", addr, e);
                    }
                }
                None => warn!("Engine: No address for member {}", id),
            },
        }
    }

    if let Some(result) = out.decision {
        if let Some(reply) = pending.take() {
            let _ = reply.send(result);
        }
    }
}

async fn phase_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{Commit, CommitData};
    use crate::types::{Company, StationsByCity};

    fn company(name: &str, address: &str) -> Company {
        Company { id: address.to_string(), name: name.to_string(), address: address.to_string() }
    }

    fn sample_value(group: &CompanyGroup) -> ProposalValue {
        vec![Commit::new(
            group.members[0].clone(),
            CommitData::ReserveStation { station_ids: vec![2], user_id: 7, start_time: 0, end_times: vec![1] },
            group.commits.next_index(),
            group.commits.next_parent().to_string(),
        )]
    }

    #[test]
    fn test_acceptor_promise_is_strictly_monotonic() {
        let mut acceptor = Acceptor::new();
        assert!(acceptor.handle_prepare(5).is_some());
        assert!(acceptor.handle_prepare(5).is_none());
        assert!(acceptor.handle_prepare(3).is_none());
        assert!(acceptor.handle_prepare(6).is_some());
    }

    #[test]
    fn test_acceptor_accept_honors_promise() {
        let mut acceptor = Acceptor::new();
        acceptor.handle_prepare(5);
        assert!(!acceptor.handle_accept(4, &vec![]));
        assert!(acceptor.handle_accept(5, &vec![]));
        // Equal or higher numbers are accepted
        assert!(acceptor.handle_accept(6, &vec![]));
    }

    #[test]
    fn test_promise_carries_previously_accepted_value() {
        let group = CompanyGroup::found(company("A", "127.0.0.1:7001"), StationsByCity::new());
        let value = sample_value(&group);

        let mut acceptor = Acceptor::new();
        acceptor.handle_prepare(1);
        assert!(acceptor.handle_accept(1, &value));

        let (accepted_n, accepted_value) = acceptor.handle_prepare(2).unwrap();
        assert_eq!(accepted_n, Some(1));
        assert_eq!(accepted_value.unwrap(), value);

        acceptor.reset();
        let (accepted_n, accepted_value) = acceptor.handle_prepare(1).unwrap();
        assert_eq!(accepted_n, None);
        assert!(accepted_value.is_none());
    }

    #[test]
    fn test_proposer_requires_strict_majority() {
        let mut proposer = Proposer::new("a".to_string());
        let n = proposer.start(vec![], 3);

        assert!(!proposer.handle_promise(n, "a".into()));
        assert!(proposer.handle_promise(n, "b".into()));
        // Already in ACCEPT phase, further promises are no-ops
        assert!(!proposer.handle_promise(n, "c".into()));

        assert!(!proposer.handle_accepted(n, "a".into()));
        assert!(proposer.handle_accepted(n, "c".into()));
    }

    #[test]
    fn test_proposer_ignores_stale_round_numbers() {
        let mut proposer = Proposer::new("a".to_string());
        let first = proposer.start(vec![], 1);
        proposer.abandon();
        let second = proposer.start(vec![], 1);

        assert!(second > first);
        assert!(!proposer.handle_promise(first, "b".into()));
    }

    #[test]
    fn test_proposal_numbers_strictly_increase() {
        let mut proposer = Proposer::new("a".to_string());
        let mut previous = 0;
        for _ in 0..5 {
            let n = proposer.start(vec![], 1);
            assert!(n > previous);
            previous = n;
            proposer.abandon();
        }
    }

    #[tokio::test]
    async fn test_single_member_round_decides_synchronously() {
        let group = Arc::new(RwLock::new(CompanyGroup::found(
            company("A", "127.0.0.1:7001"),
            StationsByCity::new(),
        )));
        let mut engine = PaxosEngine::new("127.0.0.1:7001".to_string(), group.clone());

        let value = sample_value(&*group.read().await);
        let out = engine.start_round(value.clone()).await;

        assert_eq!(out.decision, Some(Ok(value)));
        assert_eq!(group.read().await.commits.last_commit_index, Some(1));
        assert!(engine.is_idle());
    }

    #[tokio::test]
    async fn test_two_nodes_decide_and_replicate() {
        let group_a = Arc::new(RwLock::new(CompanyGroup::found(
            company("A", "127.0.0.1:7001"),
            StationsByCity::new(),
        )));
        // B holds the same replicated prefix
        let group_b = Arc::new(RwLock::new(group_a.read().await.clone()));
        {
            let b = company("B", "127.0.0.2:7001");
            group_a.write().await.members.push(b.clone());
            group_b.write().await.members.push(b);
        }

        let mut a = PaxosEngine::new("127.0.0.1:7001".to_string(), group_a.clone());
        let mut b = PaxosEngine::new("127.0.0.2:7001".to_string(), group_b.clone());

        let value = sample_value(&*group_a.read().await);
        let mut decision = None;

        // Deterministic message pump between the two engines
        let mut for_b: Vec<PaxosMessage> = Vec::new();
        let out = a.start_round(value.clone()).await;
        decision = decision.or(out.decision);
        for_b.extend(out.outbound.into_iter().map(|o| o.msg));

        while !for_b.is_empty() {
            let mut for_a = Vec::new();
            for msg in for_b.drain(..) {
                let out = b.handle_message(msg).await;
                for_a.extend(out.outbound.into_iter().map(|o| o.msg));
            }
            for msg in for_a {
                let out = a.handle_message(msg).await;
                decision = decision.or(out.decision);
                for_b.extend(out.outbound.into_iter().map(|o| o.msg));
            }
        }

        assert_eq!(decision, Some(Ok(value)));
        assert_eq!(group_a.read().await.commits.last_commit_index, Some(1));
        assert_eq!(
            group_b.read().await.commits.last_commit_id,
            group_a.read().await.commits.last_commit_id
        );
    }

    #[tokio::test]
    async fn test_round_times_out_without_majority() {
        let group = Arc::new(RwLock::new(CompanyGroup::found(
            company("A", "127.0.0.1:7001"),
            StationsByCity::new(),
        )));
        group.write().await.members.push(company("B", "127.0.0.2:7001"));
        group.write().await.members.push(company("C", "127.0.0.3:7001"));

        let mut engine = PaxosEngine::new("127.0.0.1:7001".to_string(), group.clone());
        let value = sample_value(&*group.read().await);

        let out = engine.start_round(value).await;
        assert!(out.decision.is_none());
        assert!(!engine.is_idle());

        // Nothing answers; past the deadline the round is abandoned
        assert!(engine.tick(Instant::now()).is_none());
        let late = Instant::now() + PHASE_TIMEOUT + Duration::from_millis(1);
        assert_eq!(engine.tick(late), Some(DecideError::Timeout));
        assert!(engine.is_idle());
        assert_eq!(group.read().await.commits.last_commit_index, Some(0));
    }

    #[tokio::test]
    async fn test_missed_round_recovers_through_sync() {
        let a_company = company("A", "127.0.0.1:7001");
        let b_company = company("B", "127.0.0.2:7001");
        let group_a = Arc::new(RwLock::new(CompanyGroup::found(a_company, StationsByCity::new())));
        group_a.write().await.members.push(b_company);
        let group_b = Arc::new(RwLock::new(group_a.read().await.clone()));

        let mut a = PaxosEngine::new("127.0.0.1:7001".to_string(), group_a.clone());
        let mut b = PaxosEngine::new("127.0.0.2:7001".to_string(), group_b.clone());

        // B never sees the first decided round (dropped datagram)
        let first = sample_value(&*group_a.read().await);
        a.handle_message(PaxosMessage::Consensus { n: 1, value: first }).await;

        // The next round chains onto the commit B is missing
        let second = sample_value(&*group_a.read().await);
        a.handle_message(PaxosMessage::Consensus { n: 2, value: second.clone() }).await;
        let out = b.handle_message(PaxosMessage::Consensus { n: 2, value: second }).await;

        // B notices the gap and asks the group for the suffix
        let request = out.outbound.into_iter().next().expect("a sync request goes out");
        assert_eq!(request.to, Target::All);
        let reply = a.handle_message(request.msg).await;
        let suffix = reply.outbound.into_iter().next().expect("the peer answers with commits");
        assert_eq!(suffix.to, Target::Peer("127.0.0.2:7001".to_string()));

        b.handle_message(suffix.msg).await;

        assert_eq!(group_b.read().await.commits.last_commit_index, Some(2));
        assert_eq!(
            group_b.read().await.commits.last_commit_id,
            group_a.read().await.commits.last_commit_id
        );
    }

    #[tokio::test]
    async fn test_duplicate_consensus_delivery_is_idempotent() {
        let group = Arc::new(RwLock::new(CompanyGroup::found(
            company("A", "127.0.0.1:7001"),
            StationsByCity::new(),
        )));
        let mut engine = PaxosEngine::new("127.0.0.1:7001".to_string(), group.clone());

        let value = sample_value(&*group.read().await);
        engine.handle_message(PaxosMessage::Consensus { n: 1, value: value.clone() }).await;
        engine.handle_message(PaxosMessage::Consensus { n: 1, value }).await;

        assert_eq!(group.read().await.commits.last_commit_index, Some(1));
    }

    #[test]
    fn test_message_wire_format() {
        let msg = PaxosMessage::Prepare { n: 4, from: "co-a".into() };
        let bytes = msg.to_bytes().unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("\"type\":\"PREPARE\""));

        match PaxosMessage::from_bytes(&bytes).unwrap() {
            PaxosMessage::Prepare { n, from } => {
                assert_eq!(n, 4);
                assert_eq!(from, "co-a");
            }
            other => panic!("wrong message type: {:?}", other),
        }
    }
}
