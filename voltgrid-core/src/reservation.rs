//! Reservation coordinator: validates client requests and turns them
//! into commits agreed by the group.
//!
//! The coordinator never mutates station state itself. Every request is
//! validated against the current replicated state, encoded as a single
//! commit, and handed to the decision backend; the learner applies the
//! decided commit on every replica, including this one. If the round
//! times out or is rejected, local state is untouched and the caller
//! gets the failure.

use crate::commit::{Commit, CommitData};
use crate::group::CompanyGroup;
use crate::paxos::{DecideError, Decider};
use crate::types::{Company, Station, StationId, StationState, User, UserId, UserRegistry, unix_timestamp_ms};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Default charging window granted by a reservation
pub const CHARGING_SESSION_MS: u64 = 2 * 60 * 60 * 1000;

/// Why a reservation request was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReservationError {
    #[error("station {0} does not exist")]
    StationNotFound(StationId),

    #[error("user {0} is not registered")]
    UserNotFound(UserId),

    #[error("station {station_id} is {state}")]
    StationUnavailable { station_id: StationId, state: StationState },

    #[error("user {0} already holds a reservation")]
    UserAlreadyReserved(UserId),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("{} of the requested stations cannot be reserved", .0.len())]
    Stations(Vec<StationFailure>),

    #[error("the group did not reach agreement in time")]
    ConsensusTimeout,

    #[error("the group rejected the reservation")]
    ConsensusRejected,
}

/// Per-station failure detail for multi-station requests
#[derive(Debug, Clone, PartialEq)]
pub struct StationFailure {
    pub station_id: StationId,
    pub error: ReservationError,
}

impl From<DecideError> for ReservationError {
    fn from(err: DecideError) -> Self {
        match err {
            DecideError::Timeout => ReservationError::ConsensusTimeout,
            DecideError::Rejected => ReservationError::ConsensusRejected,
        }
    }
}

impl ReservationError {
    /// The station a failure is about, when it names one
    pub fn station_id(&self) -> Option<StationId> {
        match self {
            ReservationError::StationNotFound(id) => Some(*id),
            ReservationError::StationUnavailable { station_id, .. } => Some(*station_id),
            _ => None,
        }
    }

    /// Every failing station named by this error
    pub fn station_failures(&self) -> Vec<StationFailure> {
        match self {
            ReservationError::Stations(failures) => failures.clone(),
            other => other
                .station_id()
                .map(|station_id| vec![StationFailure { station_id, error: other.clone() }])
                .unwrap_or_default(),
        }
    }
}

/// Front door for all station mutations on this node.
///
/// Generic over the decision backend so tests can drive it with an
/// in-process decider instead of a live engine.
pub struct ReservationCoordinator<D: Decider> {
    company: Company,
    group: Arc<RwLock<CompanyGroup>>,
    users: Arc<RwLock<UserRegistry>>,
    decider: D,
}

impl<D: Decider> ReservationCoordinator<D> {
    pub fn new(
        company: Company,
        group: Arc<RwLock<CompanyGroup>>,
        users: Arc<RwLock<UserRegistry>>,
        decider: D,
    ) -> Self {
        Self { company, group, users, decider }
    }

    /// Register a user locally; registration does not go through consensus.
    pub async fn register_user(&self, user: User) -> Result<(), ReservationError> {
        let mut users = self.users.write().await;
        if !users.register(user.clone()) {
            return Err(ReservationError::InvalidInput(format!("user id {} already taken", user.id)));
        }
        info!("Reservation: Registered user {} ({})", user.id, user.name);
        Ok(())
    }

    /// Snapshot of a single station
    pub async fn station_info(&self, station_id: StationId) -> Result<Station, ReservationError> {
        let group = self.group.read().await;
        group
            .station(station_id)
            .cloned()
            .ok_or(ReservationError::StationNotFound(station_id))
    }

    /// Reserve one station for the user with the default charging window.
    ///
    /// Idempotent: if the user already holds a reservation on this exact
    /// station the call succeeds without a new commit.
    pub async fn reserve(&mut self, station_id: StationId, user_id: UserId) -> Result<Vec<String>, ReservationError> {
        {
            let group = self.group.read().await;
            if let Some(station) = group.station(station_id) {
                if station.reservations.contains(&user_id) {
                    info!("Reservation: User {} already on station {}, nothing to do", user_id, station_id);
                    return Ok(Vec::new());
                }
            }
        }
        let start_time = unix_timestamp_ms();
        self.reserve_many(vec![station_id], user_id, start_time, vec![start_time]).await
    }

    /// Reserve a set of stations atomically: either every station ends
    /// up reserved for the user on every replica, or none does.
    ///
    /// All stations are validated before anything is proposed, and the
    /// whole set travels in one commit, so partial application cannot
    /// happen even across concurrent proposers.
    pub async fn reserve_many(
        &mut self,
        station_ids: Vec<StationId>,
        user_id: UserId,
        start_time: u64,
        estimated_stop_times: Vec<u64>,
    ) -> Result<Vec<String>, ReservationError> {
        if station_ids.is_empty() {
            return Err(ReservationError::InvalidInput("no stations requested".to_string()));
        }
        if station_ids.len() != estimated_stop_times.len() {
            return Err(ReservationError::InvalidInput(
                "one estimated stop time is required per station".to_string(),
            ));
        }

        if !self.users.read().await.contains(user_id) {
            return Err(ReservationError::UserNotFound(user_id));
        }

        let commit = {
            let group = self.group.read().await;

            // Every failing station is reported, not just the first
            let mut failures = Vec::new();
            for &station_id in &station_ids {
                match group.station(station_id) {
                    None => failures.push(StationFailure {
                        station_id,
                        error: ReservationError::StationNotFound(station_id),
                    }),
                    Some(station) if station.state != StationState::Available => {
                        failures.push(StationFailure {
                            station_id,
                            error: ReservationError::StationUnavailable {
                                station_id,
                                state: station.state,
                            },
                        });
                    }
                    Some(_) => {}
                }
            }
            if !failures.is_empty() {
                return Err(ReservationError::Stations(failures));
            }

            if group.user_has_reservation(user_id) {
                return Err(ReservationError::UserAlreadyReserved(user_id));
            }

            Commit::new(
                self.company.clone(),
                CommitData::ReserveStation {
                    station_ids: station_ids.clone(),
                    user_id,
                    start_time,
                    // Each stop gets the full charging window after it
                    end_times: estimated_stop_times
                        .iter()
                        .map(|stop| stop + CHARGING_SESSION_MS)
                        .collect(),
                },
                group.commits.next_index(),
                group.commits.next_parent().to_string(),
            )
        };

        info!(
            "Reservation: Proposing reservation of stations {:?} for user {}",
            station_ids, user_id
        );
        let decided = self.decider.propose(vec![commit]).await.map_err(|err| {
            warn!("Reservation: Round for user {} failed: {}", user_id, err);
            ReservationError::from(err)
        })?;

        Ok(decided.into_iter().map(|c| c.id).collect())
    }

    /// Release the user's reservation on one station.
    pub async fn cancel(&mut self, station_id: StationId, user_id: UserId) -> Result<(), ReservationError> {
        let commit = {
            let group = self.group.read().await;
            let station = group
                .station(station_id)
                .ok_or(ReservationError::StationNotFound(station_id))?;
            if !station.reservations.contains(&user_id) {
                return Err(ReservationError::InvalidInput(format!(
                    "user {} holds no reservation on station {}",
                    user_id, station_id
                )));
            }
            Commit::new(
                self.company.clone(),
                CommitData::CancelReservation { station_id, user_id },
                group.commits.next_index(),
                group.commits.next_parent().to_string(),
            )
        };

        self.decider.propose(vec![commit]).await?;
        Ok(())
    }

    /// Begin a charging session on a station the user has reserved.
    pub async fn start_charging(&mut self, station_id: StationId, user_id: UserId) -> Result<(), ReservationError> {
        let commit = {
            let group = self.group.read().await;
            let station = group
                .station(station_id)
                .ok_or(ReservationError::StationNotFound(station_id))?;
            if station.state != StationState::Reserved || !station.reservations.contains(&user_id) {
                return Err(ReservationError::StationUnavailable {
                    station_id,
                    state: station.state,
                });
            }
            let start_time = unix_timestamp_ms();
            Commit::new(
                self.company.clone(),
                CommitData::Charge {
                    station_id,
                    user_id,
                    start_time,
                    end_time: start_time + CHARGING_SESSION_MS,
                    charge_amount: 0.0,
                },
                group.commits.next_index(),
                group.commits.next_parent().to_string(),
            )
        };

        self.decider.propose(vec![commit]).await?;
        Ok(())
    }

    /// Finish a charging session and settle the payment.
    pub async fn end_charging(
        &mut self,
        station_id: StationId,
        user_id: UserId,
        payment_amount: f64,
    ) -> Result<(), ReservationError> {
        let commit = {
            let group = self.group.read().await;
            let station = group
                .station(station_id)
                .ok_or(ReservationError::StationNotFound(station_id))?;
            if station.state != StationState::ChargingCar {
                return Err(ReservationError::StationUnavailable {
                    station_id,
                    state: station.state,
                });
            }
            Commit::new(
                self.company.clone(),
                CommitData::Payment { station_id, user_id, payment_amount },
                group.commits.next_index(),
                group.commits.next_parent().to_string(),
            )
        };

        self.decider.propose(vec![commit]).await?;
        Ok(())
    }
}
