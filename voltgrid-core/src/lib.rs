//! VoltGrid Core Library
//!
//! Distributed reservation protocol for EV charging station groups.
//! Implements single-decision Paxos over UDP, a hash-chained commit
//! log, quorum-approved group membership and atomic multi-station
//! reservations.

pub mod types;
pub mod commit;
pub mod group;
pub mod paxos;
pub mod membership;
pub mod reservation;
pub mod transport;

pub use types::*;
pub use commit::{Commit, CommitData, CommitIndex, ChainViolation, GENESIS_PARENT};
pub use group::CompanyGroup;
pub use paxos::{DecideError, Decider, EngineHandle, PaxosEngine, PaxosMessage, run_engine};
pub use membership::{GroupMessage, Membership, MembershipState};
pub use reservation::{ReservationCoordinator, ReservationError, StationFailure};
pub use transport::{ClientRequest, ClientResponse, GroupTransport, InboundFrame, UdpTransport};
