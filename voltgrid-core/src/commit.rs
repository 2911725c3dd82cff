//! Append-only, hash-chained commit log.
//!
//! Every agreed state transition in a reservation group is recorded as a
//! `Commit`. Commits form a totally ordered chain: `index` increases by
//! one from 0 and `previous_commit_id` must equal the id of the commit
//! at `index - 1`. Two replicas holding the same prefix agree on every
//! field of every commit in that prefix.

use crate::types::{Company, StationId, StationsByCity, UserId, unix_timestamp_ms};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Sentinel parent id of the genesis commit
pub const GENESIS_PARENT: &str = "none";

/// Typed payload of a commit; the wire form is `{"type": ..., "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CommitData {
    /// Atomic reservation of one or more stations for a user
    #[serde(rename = "RESERVE_STATION")]
    ReserveStation {
        #[serde(rename = "stationIds")]
        station_ids: Vec<StationId>,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "startTime")]
        start_time: u64,
        #[serde(rename = "endTimes")]
        end_times: Vec<u64>,
    },

    #[serde(rename = "CANCEL_RESERVATION")]
    CancelReservation {
        #[serde(rename = "stationId")]
        station_id: StationId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },

    /// A charging session started at a station
    #[serde(rename = "CHARGE")]
    Charge {
        #[serde(rename = "stationId")]
        station_id: StationId,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "startTime")]
        start_time: u64,
        #[serde(rename = "endTime")]
        end_time: u64,
        #[serde(rename = "chargeAmount")]
        charge_amount: f64,
    },

    /// A finished session was paid for
    #[serde(rename = "PAYMENT")]
    Payment {
        #[serde(rename = "stationId")]
        station_id: StationId,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "paymentAmount")]
        payment_amount: f64,
    },

    #[serde(rename = "CONFIRM")]
    Confirm {
        #[serde(rename = "stationId")]
        station_id: StationId,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "transactionId")]
        transaction_id: String,
    },

    #[serde(rename = "REJECT")]
    Reject {
        #[serde(rename = "stationId")]
        station_id: StationId,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "transactionId")]
        transaction_id: String,
    },

    #[serde(rename = "ABORT")]
    Abort {
        #[serde(rename = "stationId")]
        station_id: StationId,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "transactionId")]
        transaction_id: String,
    },

    /// Genesis commit of a group, written by its founder at index 0
    #[serde(rename = "GROUP_CREATION")]
    GroupCreation {
        company: Company,
        stations: StationsByCity,
    },

    /// A new company was admitted by the existing quorum
    // Wire spelling kept for compatibility with deployed nodes.
    #[serde(rename = "APROVE_MEMBER_JOIN")]
    AproveMemberJoin {
        company: Company,
        stations: StationsByCity,
    },
}

impl CommitData {
    /// Wire name of the commit type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            CommitData::ReserveStation { .. } => "RESERVE_STATION",
            CommitData::CancelReservation { .. } => "CANCEL_RESERVATION",
            CommitData::Charge { .. } => "CHARGE",
            CommitData::Payment { .. } => "PAYMENT",
            CommitData::Confirm { .. } => "CONFIRM",
            CommitData::Reject { .. } => "REJECT",
            CommitData::Abort { .. } => "ABORT",
            CommitData::GroupCreation { .. } => "GROUP_CREATION",
            CommitData::AproveMemberJoin { .. } => "APROVE_MEMBER_JOIN",
        }
    }
}

/// One immutable entry in a group's replicated log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub id: String,
    pub company: Company,
    pub timestamp: u64,
    #[serde(flatten)]
    pub data: CommitData,
    pub index: u64,
    pub previous_commit_id: String,
}

impl Commit {
    /// Create a commit chained onto `previous_commit_id` at `index`
    pub fn new(company: Company, data: CommitData, index: u64, previous_commit_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            company,
            timestamp: unix_timestamp_ms(),
            data,
            index,
            previous_commit_id: previous_commit_id.into(),
        }
    }

    /// Create the genesis commit (index 0, parent sentinel)
    pub fn genesis(company: Company, data: CommitData) -> Self {
        Self::new(company, data, 0, GENESIS_PARENT)
    }
}

/// Violation of the commit chain invariants on append
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainViolation {
    #[error("commit index {got} does not follow last index (expected {expected})")]
    IndexMismatch { expected: u64, got: u64 },

    #[error("previous commit id {got:?} does not match head {expected:?}")]
    ParentMismatch { expected: String, got: String },
}

/// Mutable index over the commit log; the only mutation point.
///
/// Append-only: existing entries are never edited or removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitIndex {
    pub first_commit_id: Option<String>,
    pub last_commit_id: Option<String>,
    pub last_commit_index: Option<u64>,
    pub commit_registry_by_id: HashMap<String, Commit>,
    pub commit_registry_by_index: HashMap<u64, Commit>,
}

impl CommitIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commits in the log
    pub fn len(&self) -> u64 {
        self.last_commit_index.map(|i| i + 1).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.last_commit_index.is_none()
    }

    /// The commit at the head of the chain
    pub fn last_commit(&self) -> Option<&Commit> {
        let id = self.last_commit_id.as_ref()?;
        self.commit_registry_by_id.get(id)
    }

    /// Parent id the next appended commit must reference
    pub fn next_parent(&self) -> &str {
        self.last_commit_id.as_deref().unwrap_or(GENESIS_PARENT)
    }

    /// Index the next appended commit must carry
    pub fn next_index(&self) -> u64 {
        self.last_commit_index.map(|i| i + 1).unwrap_or(0)
    }

    pub fn by_id(&self, id: &str) -> Option<&Commit> {
        self.commit_registry_by_id.get(id)
    }

    pub fn by_index(&self, index: u64) -> Option<&Commit> {
        self.commit_registry_by_index.get(&index)
    }

    /// Append a commit, enforcing the chain invariants.
    ///
    /// Fails without touching the index if `commit.index` is not
    /// `last_commit_index + 1` or `previous_commit_id` does not match the
    /// current head (the genesis commit must reference [`GENESIS_PARENT`]).
    pub fn append(&mut self, commit: Commit) -> Result<(), ChainViolation> {
        let expected_index = self.next_index();
        if commit.index != expected_index {
            return Err(ChainViolation::IndexMismatch {
                expected: expected_index,
                got: commit.index,
            });
        }

        let expected_parent = self.next_parent();
        if commit.previous_commit_id != expected_parent {
            return Err(ChainViolation::ParentMismatch {
                expected: expected_parent.to_string(),
                got: commit.previous_commit_id.clone(),
            });
        }

        debug!(
            "CommitLog: Appended {} commit {} at index {}",
            commit.data.kind(),
            commit.id,
            commit.index
        );

        if self.first_commit_id.is_none() {
            self.first_commit_id = Some(commit.id.clone());
        }
        self.last_commit_id = Some(commit.id.clone());
        self.last_commit_index = Some(commit.index);
        self.commit_registry_by_index.insert(commit.index, commit.clone());
        self.commit_registry_by_id.insert(commit.id.clone(), commit);

        Ok(())
    }

    /// Lazy ordered walk of the chain from `from_index` to the head.
    ///
    /// Used to bring a joining member up to date by re-applying each
    /// commit's side effect.
    pub fn replay(&self, from_index: u64) -> impl Iterator<Item = &Commit> + '_ {
        let end = self.last_commit_index.map(|i| i + 1).unwrap_or(0);
        (from_index..end).filter_map(move |i| self.commit_registry_by_index.get(&i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company() -> Company {
        Company {
            id: "10.0.0.1:8080".into(),
            name: "Volt SA".into(),
            address: "10.0.0.1:8080".into(),
        }
    }

    fn reserve_data(station_id: StationId) -> CommitData {
        CommitData::ReserveStation {
            station_ids: vec![station_id],
            user_id: 7,
            start_time: 1_000,
            end_times: vec![8_200_000],
        }
    }

    #[test]
    fn test_append_chains_commits() {
        let mut index = CommitIndex::new();

        let genesis = Commit::genesis(
            company(),
            CommitData::GroupCreation { company: company(), stations: StationsByCity::new() },
        );
        let genesis_id = genesis.id.clone();
        index.append(genesis).unwrap();

        let next = Commit::new(company(), reserve_data(2), 1, genesis_id.clone());
        index.append(next).unwrap();

        assert_eq!(index.last_commit_index, Some(1));
        assert_eq!(index.first_commit_id, Some(genesis_id.clone()));
        assert_eq!(index.by_index(1).unwrap().previous_commit_id, genesis_id);
        assert_eq!(index.by_index(0).unwrap().index, 0);
    }

    #[test]
    fn test_append_rejects_index_gap() {
        let mut index = CommitIndex::new();
        let genesis = Commit::genesis(
            company(),
            CommitData::GroupCreation { company: company(), stations: StationsByCity::new() },
        );
        let genesis_id = genesis.id.clone();
        index.append(genesis).unwrap();

        let skipped = Commit::new(company(), reserve_data(2), 3, genesis_id);
        let err = index.append(skipped).unwrap_err();
        assert_eq!(err, ChainViolation::IndexMismatch { expected: 1, got: 3 });

        // Log unchanged
        assert_eq!(index.last_commit_index, Some(0));
        assert!(index.by_index(3).is_none());
    }

    #[test]
    fn test_append_rejects_parent_mismatch() {
        let mut index = CommitIndex::new();
        let genesis = Commit::genesis(
            company(),
            CommitData::GroupCreation { company: company(), stations: StationsByCity::new() },
        );
        index.append(genesis).unwrap();

        let forged = Commit::new(company(), reserve_data(2), 1, "bogus-id");
        let err = index.append(forged).unwrap_err();
        assert!(matches!(err, ChainViolation::ParentMismatch { .. }));
        assert_eq!(index.last_commit_index, Some(0));
    }

    #[test]
    fn test_genesis_must_reference_sentinel() {
        let mut index = CommitIndex::new();
        let bad = Commit::new(company(), reserve_data(2), 0, "not-none");
        assert!(matches!(index.append(bad), Err(ChainViolation::ParentMismatch { .. })));
        assert!(index.is_empty());
    }

    #[test]
    fn test_replay_is_ordered_and_restartable() {
        let mut index = CommitIndex::new();
        let genesis = Commit::genesis(
            company(),
            CommitData::GroupCreation { company: company(), stations: StationsByCity::new() },
        );
        index.append(genesis).unwrap();
        for i in 1..=4 {
            let parent = index.next_parent().to_string();
            index.append(Commit::new(company(), reserve_data(i), i, parent)).unwrap();
        }

        let indices: Vec<u64> = index.replay(0).map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);

        // Restartable from an arbitrary point
        let tail: Vec<u64> = index.replay(3).map(|c| c.index).collect();
        assert_eq!(tail, vec![3, 4]);
    }

    #[test]
    fn test_wire_format_roundtrip_preserves_registries() {
        let mut index = CommitIndex::new();
        let genesis = Commit::genesis(
            company(),
            CommitData::GroupCreation { company: company(), stations: StationsByCity::new() },
        );
        index.append(genesis).unwrap();
        let parent = index.next_parent().to_string();
        index.append(Commit::new(company(), reserve_data(2), 1, parent)).unwrap();

        let json = serde_json::to_string(&index).unwrap();
        assert!(json.contains("\"type\":\"RESERVE_STATION\""));
        assert!(json.contains("\"previousCommitId\""));

        let parsed: CommitIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.last_commit_id, index.last_commit_id);
        assert_eq!(parsed.last_commit_index, index.last_commit_index);
        assert_eq!(parsed.commit_registry_by_id, index.commit_registry_by_id);
        assert_eq!(parsed.commit_registry_by_index.len(), 2);
    }
}
