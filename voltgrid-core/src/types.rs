//! Core types for the VoltGrid reservation group protocol

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a company (group member)
pub type CompanyId = String;

/// Unique identifier for a charging station
pub type StationId = u64;

/// Unique identifier for a registered user/vehicle
pub type UserId = u64;

/// City name, the key of the per-city station map
pub type City = String;

/// A company participating in a reservation group.
///
/// Immutable once created; `address` is the network endpoint the
/// company's node listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    pub address: String,
}

/// Planar station coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
}

/// Operational state of a charging station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StationState {
    Available,
    Reserved,
    ChargingCar,
}

impl std::fmt::Display for StationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StationState::Available => write!(f, "available"),
            StationState::Reserved => write!(f, "reserved"),
            StationState::ChargingCar => write!(f, "charging-car"),
        }
    }
}

/// A charging station owned by one company.
///
/// `reservations` is an ordered queue of user ids; only the learner and
/// membership callbacks mutate a station, and only after the
/// corresponding commit is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: StationId,
    pub location: Location,
    pub city: City,
    pub company_id: CompanyId,
    pub state: StationState,
    pub reservations: Vec<UserId>,
    pub suggestions: Vec<UserId>,
}

impl Station {
    /// Create a new available station
    pub fn new(id: StationId, location: Location, city: impl Into<City>, company_id: impl Into<CompanyId>) -> Self {
        Self {
            id,
            location,
            city: city.into(),
            company_id: company_id.into(),
            state: StationState::Available,
            reservations: Vec::new(),
            suggestions: Vec::new(),
        }
    }
}

/// Stations grouped by the city they are located in
pub type StationsByCity = HashMap<City, Vec<Station>>;

/// Build a per-city map from a flat station list
pub fn stations_by_city(stations: Vec<Station>) -> StationsByCity {
    let mut map = StationsByCity::new();
    for station in stations {
        map.entry(station.city.clone()).or_default().push(station);
    }
    map
}

/// A registered user (vehicle owner)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

/// Local registry of known users.
///
/// Registration is a per-node concern and does not go through consensus.
#[derive(Debug, Clone, Default)]
pub struct UserRegistry {
    users: HashMap<UserId, User>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user; returns false if the id was already taken
    pub fn register(&mut self, user: User) -> bool {
        match self.users.entry(user.id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(user);
                true
            }
        }
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.users.contains_key(&id)
    }

    pub fn get(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Current Unix timestamp in milliseconds
pub fn unix_timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_state_wire_format() {
        let json = serde_json::to_string(&StationState::ChargingCar).unwrap();
        assert_eq!(json, "\"charging-car\"");

        let parsed: StationState = serde_json::from_str("\"available\"").unwrap();
        assert_eq!(parsed, StationState::Available);
    }

    #[test]
    fn test_stations_by_city_groups() {
        let stations = vec![
            Station::new(2, Location { x: 200.0, y: 50.0 }, "Feira de Santana", "co-a"),
            Station::new(12, Location { x: 0.0, y: 1.0 }, "Feira de Santana", "co-a"),
            Station::new(3, Location { x: 5.0, y: 5.0 }, "Salvador", "co-b"),
        ];

        let map = stations_by_city(stations);
        assert_eq!(map.get("Feira de Santana").unwrap().len(), 2);
        assert_eq!(map.get("Salvador").unwrap().len(), 1);
    }

    #[test]
    fn test_user_registry_rejects_duplicate_id() {
        let mut registry = UserRegistry::new();
        assert!(registry.register(User { id: 7, name: "Ana".into() }));
        assert!(!registry.register(User { id: 7, name: "Bia".into() }));
        assert_eq!(registry.len(), 1);
    }
}
