//! Per-connection record of one game-hosting backend.

use shared::{LoadLevel, MemberState, Packet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identity of a fleet member derived from its advertised address and ports.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberKey(String);

impl MemberKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_endpoint(ip: IpAddr, ports: &[u16]) -> Self {
        let mut key = ip.to_string();
        for port in ports {
            key.push(':');
            key.push_str(&port.to_string());
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identity that owns games: the key plus the server id announced at
/// registration. A restart under a new server id is a different member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    pub key: MemberKey,
    pub server_id: String,
}

impl MemberRef {
    pub fn new(key: MemberKey, server_id: impl Into<String>) -> Self {
        Self {
            key,
            server_id: server_id.into(),
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key, self.server_id)
    }
}

pub type ConnectionId = u64;

/// A packet queued for delivery by the network sender task.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub addr: SocketAddr,
    pub packet: Packet,
}

/// Live transport connection of a fleet member.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    outbox: mpsc::UnboundedSender<OutboundPacket>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        outbox: mpsc::UnboundedSender<OutboundPacket>,
    ) -> Self {
        Self {
            id,
            addr,
            outbox,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Tells the remote side the connection is over. Only the first call sends.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbox.send(OutboundPacket {
            addr: self.addr,
            packet: Packet::Disconnected {
                reason: reason.to_string(),
            },
        });
    }

    /// Retires this connection in favour of a new one at `next`. A member that
    /// registers again from the same address keeps that address live, so it is
    /// not sent a disconnect.
    pub fn supersede(&self, next: SocketAddr) {
        if next == self.addr {
            self.closed.store(true, Ordering::SeqCst);
        } else {
            self.close("superseded by a new connection");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FleetMember {
    pub member: MemberRef,
    pub connection: Option<ConnectionHandle>,
    pub state: MemberState,
    pub raw_level: LoadLevel,
    pub predicted_level: Option<LoadLevel>,
    pub peer_count: u32,
    pub game_count: u32,
    pub capabilities: Vec<String>,
    pub priority: u8,
}

impl FleetMember {
    /// New members start `Offline` until their declared state is applied.
    pub fn new(member: MemberRef, capabilities: Vec<String>, priority: u8) -> Self {
        Self {
            member,
            connection: None,
            state: MemberState::Offline,
            raw_level: LoadLevel::LOWEST,
            predicted_level: None,
            peer_count: 0,
            game_count: 0,
            capabilities,
            priority,
        }
    }

    /// Level reported to the balancer. Prediction can only raise it.
    pub fn effective_level(&self) -> LoadLevel {
        match self.predicted_level {
            Some(predicted) => self.raw_level.max(predicted),
            None => self.raw_level,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|connection| connection.id)
    }

    /// Attaches `connection`, returning the one it replaces.
    pub fn attach(&mut self, connection: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connection.replace(connection)
    }

    /// Detaches the connection only if it is the one currently attached.
    pub fn detach(&mut self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        if self.connection_id() == Some(connection_id) {
            self.connection.take()
        } else {
            None
        }
    }

}
