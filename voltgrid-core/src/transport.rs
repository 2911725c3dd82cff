//! Network transports.
//!
//! Consensus traffic is fire-and-forget UDP between members; the group
//! protocol and client requests share one TCP listener speaking
//! newline-delimited JSON. A node binds both on the same address.

use crate::membership::GroupMessage;
use crate::paxos::PaxosMessage;
use crate::types::{StationId, UserId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Serde(#[from] serde_json::Error),
}

/// UDP endpoint for consensus messages.
///
/// Delivery is best effort; the round timeout in the engine is the only
/// loss handling.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket: Arc::new(socket) })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the receive loop; parse failures are logged and dropped.
    pub fn start_receive(&self) -> mpsc::Receiver<(PaxosMessage, SocketAddr)> {
        let (tx, rx) = mpsc::channel(1024);
        let socket = self.socket.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Transport: UDP receive failed: {}", e);
                        continue;
                    }
                };
                match PaxosMessage::from_bytes(&buf[..len]) {
                    Ok(msg) => {
                        debug!("Transport: {} from {}", msg.kind(), from);
                        if tx.send((msg, from)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Transport: Dropping malformed datagram from {}: {}", from, e),
                }
            }
        });

        rx
    }

    pub async fn send(&self, msg: &PaxosMessage, addr: &str) -> Result<(), TransportError> {
        let bytes = msg.to_bytes()?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Send to every address, logging per-peer failures instead of
    /// aborting the fan-out.
    pub async fn broadcast(&self, msg: &PaxosMessage, addrs: &[String]) {
        for addr in addrs {
            if let Err(e) = self.send(msg, addr).await {
                warn!("Transport: Send to {} failed: {}", addr, e);
            }
        }
    }
}

/// A request from a client application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ClientRequest {
    #[serde(rename = "registerUser")]
    RegisterUser {
        #[serde(rename = "userId")]
        user_id: UserId,
        name: String,
    },

    #[serde(rename = "reserve")]
    Reserve {
        #[serde(rename = "stationId")]
        station_id: StationId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },

    #[serde(rename = "reserveMultipleStations")]
    ReserveMany {
        #[serde(rename = "stationIds")]
        station_ids: Vec<StationId>,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "startTime")]
        start_time: u64,
        #[serde(rename = "estimatedStopTimes")]
        estimated_stop_times: Vec<u64>,
    },

    #[serde(rename = "cancelReservation")]
    Cancel {
        #[serde(rename = "stationId")]
        station_id: StationId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },

    #[serde(rename = "startCharging")]
    StartCharging {
        #[serde(rename = "stationId")]
        station_id: StationId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },

    #[serde(rename = "endCharging")]
    EndCharging {
        #[serde(rename = "stationId")]
        station_id: StationId,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "paymentAmount")]
        payment_amount: f64,
    },

    #[serde(rename = "getStationInfo")]
    StationInfo {
        #[serde(rename = "stationId")]
        station_id: StationId,
    },
}

/// Which station a failed multi-station request tripped on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationErrorEntry {
    pub station_id: StationId,
    pub reason: String,
}

/// Reply sent back on the same connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_errors: Option<Vec<StationErrorEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ClientResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            reservation_ids: None,
            station_errors: None,
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { success: false, ..Self::ok(message) }
    }
}

/// One parsed line from a TCP connection
#[derive(Debug)]
pub enum InboundFrame {
    /// Membership protocol traffic from a peer node
    Group { msg: GroupMessage, from: SocketAddr },
    /// A client request awaiting a reply on its connection
    Client {
        request: ClientRequest,
        reply: oneshot::Sender<ClientResponse>,
    },
}

// Members tag messages with "type", clients with "action"; untagged
// deserialization tries in declaration order.
#[derive(Deserialize)]
#[serde(untagged)]
enum InboundWire {
    Group(GroupMessage),
    Client(ClientRequest),
}

/// TCP listener shared by the group protocol and clients.
pub struct GroupTransport {
    local: SocketAddr,
}

impl GroupTransport {
    /// Bind and spawn the accept loop; frames arrive on the returned
    /// channel.
    pub async fn bind(addr: &str) -> Result<(Self, mpsc::Receiver<InboundFrame>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Transport: Accept failed: {}", e);
                        continue;
                    }
                };
                tokio::spawn(handle_connection(stream, peer, tx.clone()));
            }
        });

        Ok((Self { local }, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Deliver one group message to a peer. An `Err` here is the
    /// delivery failure the membership machine retries on.
    pub async fn send_group(addr: &str, msg: &GroupMessage) -> Result<(), TransportError> {
        let mut stream = TcpStream::connect(addr).await?;
        let mut bytes = msg.to_bytes()?;
        bytes.push(b'\n');
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<InboundFrame>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                debug!("Transport: Connection from {} closed: {}", peer, e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<InboundWire>(&line) {
            Ok(InboundWire::Group(msg)) => {
                if tx.send(InboundFrame::Group { msg, from: peer }).await.is_err() {
                    return;
                }
            }
            Ok(InboundWire::Client(request)) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx.send(InboundFrame::Client { request, reply: reply_tx }).await.is_err() {
                    return;
                }
                let response = reply_rx.await.unwrap_or_else(|_| {
                    ClientResponse::error("internal error: request handler dropped")
                });
                if write_response(&mut write_half, &response).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Transport: Unparseable line from {}: {}", peer, e);
                let _ = write_response(&mut write_half, &ClientResponse::error("malformed request")).await;
            }
        }
    }
}

async fn write_response(write_half: &mut OwnedWriteHalf, response: &ClientResponse) -> Result<(), TransportError> {
    let mut bytes = serde_json::to_vec(response)?;
    bytes.push(b'\n');
    write_half.write_all(&bytes).await?;
    write_half.flush().await?;
    Ok(())
}
