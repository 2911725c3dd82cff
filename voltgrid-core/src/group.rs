//! Replicated group state: members, stations and the commit log.
//!
//! A `CompanyGroup` is the unit of agreement: a set of companies
//! sharing one commit log and one station namespace. It is created by
//! exactly one founder and grown one member at a time through
//! `APROVE_MEMBER_JOIN` commits. Applying a commit is the only way the
//! member list or station state changes after creation.

use crate::commit::{ChainViolation, Commit, CommitData, CommitIndex};
use crate::types::{Company, CompanyId, Station, StationId, StationState, StationsByCity, UserId, unix_timestamp_ms};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// The full replicated state exchanged during `INITIAL_SYNC`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyGroup {
    pub creation_date: u64,
    pub members: Vec<Company>,
    pub commits: CommitIndex,
    pub stations: StationsByCity,
}

impl CompanyGroup {
    /// Found a new group: write the genesis `GROUP_CREATION` commit at
    /// index 0 and apply it.
    pub fn found(company: Company, stations: StationsByCity) -> Self {
        let mut group = Self {
            creation_date: unix_timestamp_ms(),
            members: Vec::new(),
            commits: CommitIndex::new(),
            stations: StationsByCity::new(),
        };

        let genesis = Commit::genesis(
            company.clone(),
            CommitData::GroupCreation { company: company.clone(), stations },
        );
        // A fresh index cannot refuse the genesis commit.
        group
            .commit_and_apply(genesis)
            .expect("genesis commit chains onto an empty log");

        info!("Group: {} founded a new reservation group", company.name);
        group
    }

    /// Append a commit to the log, then apply its side effects.
    ///
    /// This is the learner/membership write path; nothing else mutates
    /// member or station state.
    pub fn commit_and_apply(&mut self, commit: Commit) -> Result<(), ChainViolation> {
        self.commits.append(commit.clone())?;
        self.apply(&commit);
        Ok(())
    }

    /// Type-dispatched side effect of a single commit.
    pub fn apply(&mut self, commit: &Commit) {
        match &commit.data {
            CommitData::GroupCreation { company, stations } => {
                self.members = vec![company.clone()];
                self.stations = stations.clone();
            }

            CommitData::AproveMemberJoin { company, stations } => {
                if !self.is_member(&company.id) {
                    self.members.push(company.clone());
                }
                for (city, stations) in stations {
                    self.stations.entry(city.clone()).or_default().extend(stations.iter().cloned());
                }
                info!("Group: Admitted member {} ({} members)", company.name, self.members.len());
            }

            CommitData::ReserveStation { station_ids, user_id, .. } => {
                for station_id in station_ids {
                    match self.station_mut(*station_id) {
                        Some(station) => {
                            if !station.reservations.contains(user_id) {
                                station.reservations.push(*user_id);
                            }
                            station.state = StationState::Reserved;
                        }
                        None => warn!("Group: Reservation commit names unknown station {}", station_id),
                    }
                }
            }

            CommitData::CancelReservation { station_id, user_id } => {
                if let Some(station) = self.station_mut(*station_id) {
                    station.reservations.retain(|u| u != user_id);
                    if station.reservations.is_empty() && station.state == StationState::Reserved {
                        station.state = StationState::Available;
                    }
                }
            }

            CommitData::Charge { station_id, .. } => {
                if let Some(station) = self.station_mut(*station_id) {
                    station.state = StationState::ChargingCar;
                }
            }

            CommitData::Payment { station_id, user_id, .. } => {
                if let Some(station) = self.station_mut(*station_id) {
                    station.reservations.retain(|u| u != user_id);
                    station.state = if station.reservations.is_empty() {
                        StationState::Available
                    } else {
                        StationState::Reserved
                    };
                }
            }

            // Two-phase bookkeeping records; no station side effect.
            CommitData::Confirm { .. } | CommitData::Reject { .. } | CommitData::Abort { .. } => {}
        }
    }

    /// Rebuild member and station state by replaying the whole log.
    ///
    /// Used after adopting a peer's log during a join, and as the
    /// recovery path when a chain violation indicates a missed commit.
    pub fn rebuild(&mut self) {
        self.members.clear();
        self.stations.clear();
        let commits: Vec<Commit> = self.commits.replay(0).cloned().collect();
        for commit in &commits {
            self.apply(commit);
        }
        info!("Group: Rebuilt state from {} commits", commits.len());
    }

    pub fn is_member(&self, company_id: &str) -> bool {
        self.members.iter().any(|m| m.id == company_id)
    }

    pub fn member(&self, company_id: &str) -> Option<&Company> {
        self.members.iter().find(|m| m.id == company_id)
    }

    /// Membership snapshot size used for per-round quorum computation
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Peer addresses, excluding `own_id`
    pub fn peer_addresses(&self, own_id: &CompanyId) -> Vec<(CompanyId, String)> {
        self.members
            .iter()
            .filter(|m| &m.id != own_id)
            .map(|m| (m.id.clone(), m.address.clone()))
            .collect()
    }

    pub fn station(&self, id: StationId) -> Option<&Station> {
        self.stations.values().flatten().find(|s| s.id == id)
    }

    pub fn station_mut(&mut self, id: StationId) -> Option<&mut Station> {
        self.stations.values_mut().flatten().find(|s| s.id == id)
    }

    /// Whether the user holds an active reservation anywhere in the group
    pub fn user_has_reservation(&self, user_id: UserId) -> bool {
        self.stations
            .values()
            .flatten()
            .any(|s| s.reservations.contains(&user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Location, stations_by_city};

    fn company(name: &str, address: &str) -> Company {
        Company { id: address.to_string(), name: name.to_string(), address: address.to_string() }
    }

    fn founder_group() -> CompanyGroup {
        let a = company("Company A", "10.0.0.1:8080");
        let stations = stations_by_city(vec![
            Station::new(2, Location { x: 200.0, y: 50.0 }, "Feira de Santana", &a.id),
            Station::new(12, Location { x: 0.0, y: 1.0 }, "Feira de Santana", &a.id),
        ]);
        CompanyGroup::found(a, stations)
    }

    #[test]
    fn test_found_writes_genesis() {
        let group = founder_group();
        assert_eq!(group.commits.last_commit_index, Some(0));
        assert_eq!(group.members.len(), 1);
        assert_eq!(group.members[0].name, "Company A");
        assert!(group.station(2).is_some());
        assert!(group.station(12).is_some());
    }

    #[test]
    fn test_member_join_merges_stations_by_city() {
        let mut group = founder_group();
        let b = company("Company B", "10.0.0.2:8080");
        let b_stations = stations_by_city(vec![Station::new(
            3,
            Location { x: 5.0, y: 5.0 },
            "Salvador",
            &b.id,
        )]);

        let join = Commit::new(
            group.members[0].clone(),
            CommitData::AproveMemberJoin { company: b.clone(), stations: b_stations },
            group.commits.next_index(),
            group.commits.next_parent().to_string(),
        );
        group.commit_and_apply(join).unwrap();

        assert_eq!(group.members.len(), 2);
        assert!(group.is_member(&b.id));
        assert_eq!(group.stations.get("Salvador").unwrap().len(), 1);
        assert_eq!(group.commits.last_commit_index, Some(1));
    }

    #[test]
    fn test_reserve_and_cancel_round_trip() {
        let mut group = founder_group();
        let a = group.members[0].clone();

        let reserve = Commit::new(
            a.clone(),
            CommitData::ReserveStation {
                station_ids: vec![2, 12],
                user_id: 7,
                start_time: 1_000,
                end_times: vec![7_201_000, 7_201_000],
            },
            group.commits.next_index(),
            group.commits.next_parent().to_string(),
        );
        group.commit_and_apply(reserve).unwrap();

        assert_eq!(group.station(2).unwrap().state, StationState::Reserved);
        assert_eq!(group.station(12).unwrap().reservations, vec![7]);
        assert!(group.user_has_reservation(7));

        let cancel = Commit::new(
            a,
            CommitData::CancelReservation { station_id: 2, user_id: 7 },
            group.commits.next_index(),
            group.commits.next_parent().to_string(),
        );
        group.commit_and_apply(cancel).unwrap();

        assert_eq!(group.station(2).unwrap().state, StationState::Available);
        assert!(group.station(2).unwrap().reservations.is_empty());
        // Station 12 still reserved for the user
        assert!(group.user_has_reservation(7));
    }

    #[test]
    fn test_charge_and_payment_drive_station_state() {
        let mut group = founder_group();
        let a = group.members[0].clone();

        for data in [
            CommitData::ReserveStation {
                station_ids: vec![2],
                user_id: 7,
                start_time: 0,
                end_times: vec![7_200_000],
            },
            CommitData::Charge { station_id: 2, user_id: 7, start_time: 0, end_time: 7_200_000, charge_amount: 32.5 },
        ] {
            let commit = Commit::new(
                a.clone(),
                data,
                group.commits.next_index(),
                group.commits.next_parent().to_string(),
            );
            group.commit_and_apply(commit).unwrap();
        }
        assert_eq!(group.station(2).unwrap().state, StationState::ChargingCar);

        let payment = Commit::new(
            a,
            CommitData::Payment { station_id: 2, user_id: 7, payment_amount: 18.0 },
            group.commits.next_index(),
            group.commits.next_parent().to_string(),
        );
        group.commit_and_apply(payment).unwrap();
        assert_eq!(group.station(2).unwrap().state, StationState::Available);
        assert!(!group.user_has_reservation(7));
    }

    #[test]
    fn test_sync_roundtrip_yields_identical_index() {
        let mut group = founder_group();
        let a = group.members[0].clone();
        let reserve = Commit::new(
            a,
            CommitData::ReserveStation { station_ids: vec![2], user_id: 7, start_time: 0, end_times: vec![1] },
            group.commits.next_index(),
            group.commits.next_parent().to_string(),
        );
        group.commit_and_apply(reserve).unwrap();

        let json = serde_json::to_string(&group).unwrap();
        let parsed: CompanyGroup = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.commits.last_commit_id, group.commits.last_commit_id);
        assert_eq!(parsed.commits.last_commit_index, group.commits.last_commit_index);
        assert_eq!(parsed.members, group.members);
        assert_eq!(
            parsed.commits.commit_registry_by_index.len(),
            group.commits.commit_registry_by_index.len()
        );
    }

    #[test]
    fn test_rebuild_replays_full_log() {
        let mut group = founder_group();
        let a = group.members[0].clone();
        let reserve = Commit::new(
            a,
            CommitData::ReserveStation { station_ids: vec![12], user_id: 9, start_time: 0, end_times: vec![1] },
            group.commits.next_index(),
            group.commits.next_parent().to_string(),
        );
        group.commit_and_apply(reserve).unwrap();

        // Wipe derived state, keep the log
        group.members.clear();
        group.stations.clear();
        group.rebuild();

        assert_eq!(group.members.len(), 1);
        assert_eq!(group.station(12).unwrap().reservations, vec![9]);
        assert_eq!(group.station(12).unwrap().state, StationState::Reserved);
    }
}
