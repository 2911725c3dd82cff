//! Group membership protocol.
//!
//! Runs once at node startup. A node with no configured peer founds a
//! new group (terminal `CreateGroup`); otherwise it keeps sending a
//! join request to the configured member until delivery succeeds,
//! adopts the group state from `INITIAL_SYNC`, and completes when the
//! decided `APROVE_MEMBER_JOIN` commit for itself arrives (terminal
//! `Joined`). Admission is agreed by the existing quorum through a
//! Paxos round, never granted unilaterally.

use crate::commit::{ChainViolation, Commit, CommitData};
use crate::group::CompanyGroup;
use crate::paxos::{DecideError, Decider};
use crate::types::{Company, StationsByCity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Fixed backoff between join request retries
pub const JOIN_RETRY_DELAY: Duration = Duration::from_secs(3);

/// How long to wait for `INITIAL_SYNC` before re-sending the request
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Membership messages exchanged over the group transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GroupMessage {
    /// Sent by a joining node to a known member
    #[serde(rename = "JOIN_GROUP")]
    JoinGroup { company: Company, stations: StationsByCity },

    /// Full group snapshot sent back to the joiner
    #[serde(rename = "INITIAL_SYNC")]
    InitialSync {
        #[serde(rename = "companyGroup")]
        company_group: Box<CompanyGroup>,
    },

    /// The decided admission commit, forwarded to the joiner
    #[serde(rename = "APROVE_MEMBER_JOIN")]
    AproveMemberJoin { commit: Box<Commit> },
}

impl GroupMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// States of the startup state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    WaitingForContext,
    Starting,
    JoiningGroup,
    AwaitingApproval,
    RequestFailed,
    Syncing,
    /// Terminal: founded a new group
    CreateGroup,
    /// Terminal: admitted into an existing group
    Joined,
}

impl MembershipState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MembershipState::CreateGroup | MembershipState::Joined)
    }
}

/// Events fed into the machine by its driver
#[derive(Debug)]
pub enum MembershipEvent {
    /// Node identity and optional peer address are available
    ContextSet,
    /// The join request reached the peer
    JoinRequestDelivered,
    /// The join request could not be delivered
    DeliveryFailed,
    /// 3 s backoff elapsed in `RequestFailed`
    RetryTimerFired,
    /// 10 s elapsed in `AwaitingApproval` without a sync
    ApprovalTimerFired,
    /// The peer's full group state arrived
    InitialSync(Box<CompanyGroup>),
    /// The decided admission commit arrived
    ApprovalCommit(Box<Commit>),
}

/// Side effects the driver must execute after a transition
#[derive(Debug, PartialEq)]
pub enum MembershipEffect {
    /// Synthesize a new group locally (founder path)
    FoundGroup,
    /// Deliver the join request to the configured peer
    SendJoinRequest { to: String },
    /// Arm the 3 s retry backoff
    ArmRetryTimer,
    /// Arm the 10 s approval timeout
    ArmApprovalTimer,
    /// Adopt the received snapshot as local state
    AdoptGroup(Box<CompanyGroup>),
    /// Append the admission commit and merge the new member
    CommitApproval(Box<Commit>),
    /// The machine reached a terminal state
    Complete,
}

/// Startup membership state machine (one instance per node)
#[derive(Debug)]
pub struct Membership {
    company: Company,
    stations: StationsByCity,
    group_member_address: Option<String>,
    state: MembershipState,
}

impl Membership {
    /// `group_member_address` absent means "found a new group"
    pub fn new(company: Company, stations: StationsByCity, group_member_address: Option<String>) -> Self {
        Self {
            company,
            stations,
            group_member_address,
            state: MembershipState::WaitingForContext,
        }
    }

    pub fn state(&self) -> MembershipState {
        self.state
    }

    pub fn company(&self) -> &Company {
        &self.company
    }

    /// Stations this node contributes when joining
    pub fn stations(&self) -> &StationsByCity {
        &self.stations
    }

    /// Feed one event; returns the effects the driver must run.
    pub fn handle(&mut self, event: MembershipEvent) -> Vec<MembershipEffect> {
        let effects = match (self.state, event) {
            (MembershipState::WaitingForContext, MembershipEvent::ContextSet) => {
                self.state = MembershipState::Starting;
                match &self.group_member_address {
                    Some(addr) => {
                        self.state = MembershipState::JoiningGroup;
                        vec![MembershipEffect::SendJoinRequest { to: addr.clone() }]
                    }
                    None => {
                        self.state = MembershipState::CreateGroup;
                        vec![MembershipEffect::FoundGroup, MembershipEffect::Complete]
                    }
                }
            }

            (MembershipState::JoiningGroup, MembershipEvent::JoinRequestDelivered) => {
                info!("Membership: Join request delivered, awaiting approval");
                self.state = MembershipState::AwaitingApproval;
                vec![MembershipEffect::ArmApprovalTimer]
            }

            (MembershipState::JoiningGroup, MembershipEvent::DeliveryFailed) => {
                warn!("Membership: Join request delivery failed, retrying in {:?}", JOIN_RETRY_DELAY);
                self.state = MembershipState::RequestFailed;
                vec![MembershipEffect::ArmRetryTimer]
            }

            (MembershipState::RequestFailed, MembershipEvent::RetryTimerFired) => {
                self.state = MembershipState::JoiningGroup;
                let to = self
                    .group_member_address
                    .clone()
                    .expect("a joining node always has a peer address");
                vec![MembershipEffect::SendJoinRequest { to }]
            }

            (MembershipState::AwaitingApproval, MembershipEvent::InitialSync(group)) => {
                info!(
                    "Membership: Received initial sync ({} members, {} commits)",
                    group.members.len(),
                    group.commits.len()
                );
                self.state = MembershipState::Syncing;
                vec![MembershipEffect::AdoptGroup(group)]
            }

            (MembershipState::AwaitingApproval, MembershipEvent::ApprovalTimerFired) => {
                // Liveness guard against a lost reply
                warn!("Membership: No sync within {:?}, re-sending join request", APPROVAL_TIMEOUT);
                self.state = MembershipState::JoiningGroup;
                let to = self
                    .group_member_address
                    .clone()
                    .expect("a joining node always has a peer address");
                vec![MembershipEffect::SendJoinRequest { to }]
            }

            (MembershipState::Syncing, MembershipEvent::ApprovalCommit(commit)) => {
                info!("Membership: Join approved by the group (commit {})", commit.id);
                self.state = MembershipState::Joined;
                vec![MembershipEffect::CommitApproval(commit), MembershipEffect::Complete]
            }

            (state, event) => {
                debug!("Membership: Ignoring {:?} in state {:?}", event, state);
                Vec::new()
            }
        };
        effects
    }
}

/// Failures surfaced by the admission path
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("company {0} is already a group member")]
    AlreadyMember(String),

    #[error(transparent)]
    Decide(#[from] DecideError),
}

/// Admission side, run by the existing member a join request reached.
///
/// Proposes the `APROVE_MEMBER_JOIN` commit to the group; the decided
/// commit has already been applied locally by the learner when this
/// returns. The caller sends `INITIAL_SYNC` before calling and forwards
/// the returned commit to the joiner afterwards.
pub async fn admit_member<D: Decider>(
    group: &Arc<RwLock<CompanyGroup>>,
    decider: &mut D,
    proposing_company: Company,
    company: Company,
    stations: StationsByCity,
) -> Result<Commit, AdmissionError> {
    let commit = {
        let group = group.read().await;
        if group.is_member(&company.id) {
            return Err(AdmissionError::AlreadyMember(company.id));
        }
        Commit::new(
            proposing_company,
            CommitData::AproveMemberJoin { company: company.clone(), stations },
            group.commits.next_index(),
            group.commits.next_parent().to_string(),
        )
    };

    info!("Membership: Proposing admission of {} to the group", company.name);
    let decided = decider.propose(vec![commit]).await?;
    let commit = decided
        .into_iter()
        .next()
        .expect("an admission round decides exactly one commit");
    Ok(commit)
}

/// Apply the approval commit on the joining side: append to the log,
/// add the member and merge its stations (all via the commit's side
/// effect dispatch).
pub fn apply_approval(group: &mut CompanyGroup, commit: Commit) -> Result<(), ChainViolation> {
    group.commit_and_apply(commit)
}
