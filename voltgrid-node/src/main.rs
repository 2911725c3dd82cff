//! VoltGrid Node
//!
//! One company's node in a charging station reservation group: joins or
//! founds a group, runs the Paxos engine, and serves client requests.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use voltgrid_core::membership::{
    admit_member, apply_approval, GroupMessage, Membership, MembershipEffect, MembershipEvent,
    APPROVAL_TIMEOUT, JOIN_RETRY_DELAY,
};
use voltgrid_core::paxos::{engine_channel, run_engine, EngineHandle, PaxosEngine};
use voltgrid_core::reservation::{ReservationCoordinator, ReservationError};
use voltgrid_core::transport::{
    ClientRequest, ClientResponse, GroupTransport, InboundFrame, StationErrorEntry, UdpTransport,
};
use voltgrid_core::{
    stations_by_city, Company, CompanyGroup, Location, Station, StationsByCity, User, UserRegistry,
};

/// VoltGrid reservation group node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Company name
    #[arg(short, long)]
    name: String,

    /// Address to listen on (TCP for group/client traffic, UDP for consensus)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Address of an existing group member to join; omit to found a new group
    #[arg(short, long)]
    peer: Option<String>,

    /// JSON file with this company's stations
    #[arg(short, long)]
    stations: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// On-disk station entry; the owning company is always this node's
#[derive(Debug, Deserialize)]
struct StationSpec {
    id: u64,
    x: f64,
    y: f64,
    city: String,
}

fn load_stations(path: Option<&PathBuf>, company_id: &str) -> Result<StationsByCity, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(StationsByCity::new());
    };
    let raw = std::fs::read_to_string(path)?;
    let specs: Vec<StationSpec> = serde_json::from_str(&raw)?;
    let stations = specs
        .into_iter()
        .map(|s| Station::new(s.id, Location { x: s.x, y: s.y }, s.city, company_id))
        .collect();
    Ok(stations_by_city(stations))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("VoltGrid node \"{}\" starting on {}", args.name, args.address);

    let company = Company {
        id: args.address.clone(),
        name: args.name.clone(),
        address: args.address.clone(),
    };
    let stations = load_stations(args.stations.as_ref(), &company.id)?;

    let (group_transport, mut inbound) = GroupTransport::bind(&args.address).await?;
    info!("Listening on {}", group_transport.local_addr());

    // Join or found the group before serving anything else
    let mut machine = Membership::new(company.clone(), stations, args.peer.clone());
    let group = establish_group(&mut machine, &mut inbound).await?;
    info!(
        "Node: Group established ({} members, {} commits)",
        group.members.len(),
        group.commits.len()
    );
    let group = Arc::new(RwLock::new(group));

    // Consensus engine in its own task
    let udp = UdpTransport::bind(&args.address).await?;
    let engine = PaxosEngine::new(company.id.clone(), group.clone());
    let (handle, commands) = engine_channel(32);
    tokio::spawn(run_engine(engine, udp, commands));

    let users = Arc::new(RwLock::new(UserRegistry::new()));
    let mut coordinator =
        ReservationCoordinator::new(company.clone(), group.clone(), users, handle.clone());

    // Main event loop
    while let Some(frame) = inbound.recv().await {
        match frame {
            InboundFrame::Group { msg: GroupMessage::JoinGroup { company: joiner, stations }, .. } => {
                info!("Node: Join request from {} ({})", joiner.name, joiner.address);
                let group = group.clone();
                let mut decider = handle.clone();
                let own = company.clone();
                tokio::spawn(async move {
                    handle_join_request(group, &mut decider, own, joiner, stations).await;
                });
            }

            InboundFrame::Group { msg, from } => {
                warn!("Node: Unexpected {:?} from {} after joining", msg, from);
            }

            InboundFrame::Client { request, reply } => {
                let response = handle_client_request(&mut coordinator, request).await;
                let _ = reply.send(response);
            }
        }
    }

    Ok(())
}

/// Drive the membership machine to a terminal state.
///
/// Client requests arriving before the group exists are refused;
/// nothing else is serviced until this returns.
async fn establish_group(
    machine: &mut Membership,
    inbound: &mut mpsc::Receiver<InboundFrame>,
) -> Result<CompanyGroup, Box<dyn std::error::Error>> {
    let mut group: Option<CompanyGroup> = None;
    let mut retry_deadline: Option<Instant> = None;
    let mut approval_deadline: Option<Instant> = None;
    let mut events = vec![MembershipEvent::ContextSet];

    loop {
        while let Some(event) = events.pop() {
            for effect in machine.handle(event) {
                match effect {
                    MembershipEffect::FoundGroup => {
                        group = Some(CompanyGroup::found(
                            machine.company().clone(),
                            machine.stations().clone(),
                        ));
                    }
                    MembershipEffect::SendJoinRequest { to } => {
                        let join = GroupMessage::JoinGroup {
                            company: machine.company().clone(),
                            stations: machine.stations().clone(),
                        };
                        events.push(match GroupTransport::send_group(&to, &join).await {
                            Ok(()) => MembershipEvent::JoinRequestDelivered,
                            Err(e) => {
                                warn!("Node: Could not reach {}: {}", to, e);
                                MembershipEvent::DeliveryFailed
                            }
                        });
                    }
                    MembershipEffect::ArmRetryTimer => {
                        retry_deadline = Some(Instant::now() + JOIN_RETRY_DELAY);
                    }
                    MembershipEffect::ArmApprovalTimer => {
                        approval_deadline = Some(Instant::now() + APPROVAL_TIMEOUT);
                    }
                    MembershipEffect::AdoptGroup(adopted) => {
                        approval_deadline = None;
                        group = Some(*adopted);
                    }
                    MembershipEffect::CommitApproval(commit) => {
                        let group = group
                            .as_mut()
                            .ok_or("approval commit arrived before the group snapshot")?;
                        apply_approval(group, *commit)?;
                    }
                    MembershipEffect::Complete => {
                        return group.ok_or_else(|| "membership completed without a group".into());
                    }
                }
            }
        }

        tokio::select! {
            frame = inbound.recv() => {
                match frame.ok_or("transport closed during startup")? {
                    InboundFrame::Group { msg: GroupMessage::InitialSync { company_group }, .. } => {
                        events.push(MembershipEvent::InitialSync(company_group));
                    }
                    InboundFrame::Group { msg: GroupMessage::AproveMemberJoin { commit }, .. } => {
                        events.push(MembershipEvent::ApprovalCommit(commit));
                    }
                    InboundFrame::Group { msg, from } => {
                        warn!("Node: Ignoring {:?} from {} while joining", msg, from);
                    }
                    InboundFrame::Client { reply, .. } => {
                        let _ = reply.send(ClientResponse::error("node has not joined a group yet"));
                    }
                }
            }
            _ = sleep_until_opt(retry_deadline) => {
                retry_deadline = None;
                events.push(MembershipEvent::RetryTimerFired);
            }
            _ = sleep_until_opt(approval_deadline) => {
                approval_deadline = None;
                events.push(MembershipEvent::ApprovalTimerFired);
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Admission side: sync the joiner, put the admission through the
/// group, then forward the decided commit.
async fn handle_join_request(
    group: Arc<RwLock<CompanyGroup>>,
    decider: &mut EngineHandle,
    own: Company,
    joiner: Company,
    stations: StationsByCity,
) {
    let snapshot = group.read().await.clone();
    let sync = GroupMessage::InitialSync { company_group: Box::new(snapshot) };
    if let Err(e) = GroupTransport::send_group(&joiner.address, &sync).await {
        warn!("Node: Initial sync to {} failed: {}", joiner.address, e);
        return;
    }

    match admit_member(&group, decider, own, joiner.clone(), stations).await {
        Ok(commit) => {
            let approval = GroupMessage::AproveMemberJoin { commit: Box::new(commit) };
            if let Err(e) = GroupTransport::send_group(&joiner.address, &approval).await {
                warn!("Node: Approval delivery to {} failed: {}", joiner.address, e);
            }
        }
        Err(e) => warn!("Node: Admission of {} failed: {}", joiner.name, e),
    }
}

async fn handle_client_request(
    coordinator: &mut ReservationCoordinator<EngineHandle>,
    request: ClientRequest,
) -> ClientResponse {
    match request {
        ClientRequest::RegisterUser { user_id, name } => {
            match coordinator.register_user(User { id: user_id, name }).await {
                Ok(()) => ClientResponse::ok("user registered"),
                Err(e) => ClientResponse::error(e.to_string()),
            }
        }

        ClientRequest::Reserve { station_id, user_id } => {
            match coordinator.reserve(station_id, user_id).await {
                Ok(ids) => ClientResponse {
                    reservation_ids: Some(ids),
                    ..ClientResponse::ok("station reserved")
                },
                Err(e) => failure(e),
            }
        }

        ClientRequest::ReserveMany { station_ids, user_id, start_time, estimated_stop_times } => {
            match coordinator
                .reserve_many(station_ids, user_id, start_time, estimated_stop_times)
                .await
            {
                Ok(ids) => ClientResponse {
                    reservation_ids: Some(ids),
                    ..ClientResponse::ok("all stations reserved")
                },
                Err(e) => failure(e),
            }
        }

        ClientRequest::Cancel { station_id, user_id } => {
            match coordinator.cancel(station_id, user_id).await {
                Ok(()) => ClientResponse::ok("reservation cancelled"),
                Err(e) => failure(e),
            }
        }

        ClientRequest::StartCharging { station_id, user_id } => {
            match coordinator.start_charging(station_id, user_id).await {
                Ok(()) => ClientResponse::ok("charging started"),
                Err(e) => failure(e),
            }
        }

        ClientRequest::EndCharging { station_id, user_id, payment_amount } => {
            match coordinator.end_charging(station_id, user_id, payment_amount).await {
                Ok(()) => ClientResponse::ok("charging finished, payment settled"),
                Err(e) => failure(e),
            }
        }

        ClientRequest::StationInfo { station_id } => {
            match coordinator.station_info(station_id).await {
                Ok(station) => match serde_json::to_value(&station) {
                    Ok(data) => ClientResponse { data: Some(data), ..ClientResponse::ok("ok") },
                    Err(e) => ClientResponse::error(e.to_string()),
                },
                Err(e) => failure(e),
            }
        }
    }
}

fn failure(err: ReservationError) -> ClientResponse {
    let failures = err.station_failures();
    let station_errors = (!failures.is_empty()).then(|| {
        failures
            .into_iter()
            .map(|f| StationErrorEntry { station_id: f.station_id, reason: f.error.to_string() })
            .collect()
    });
    ClientResponse { station_errors, ..ClientResponse::error(err.to_string()) }
}
