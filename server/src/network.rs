//! UDP intake routing fleet member and front-end packets to the components

use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::config::DirectoryConfig;
use crate::error::Result;
use crate::feedback::{LoadFeedbackHandle, SubscriberId};
use crate::fleet::member::{ConnectionHandle, ConnectionId, MemberKey, OutboundPacket};
use crate::fleet::peer::PeerHandle;
use crate::fleet::registry::{FleetRegistryHandle, Registration};
use crate::presence::PresenceHandle;

/// Messages sent from network tasks to the intake loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    MemberTimeout { addr: SocketAddr },
    Shutdown,
}

/// An attached fleet member as seen from the socket
#[derive(Debug, Clone)]
pub struct MemberLink {
    pub key: MemberKey,
    pub connection_id: ConnectionId,
    pub peer: PeerHandle,
    pub last_seen: Instant,
}

/// Fleet member connections indexed by source address
#[derive(Debug, Default)]
pub struct MemberLinks {
    links: HashMap<SocketAddr, MemberLink>,
}

impl MemberLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: SocketAddr, link: MemberLink) -> Option<MemberLink> {
        self.links.insert(addr, link)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&MemberLink> {
        self.links.get(addr)
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<MemberLink> {
        self.links.remove(addr)
    }

    pub fn touch(&mut self, addr: &SocketAddr) {
        if let Some(link) = self.links.get_mut(addr) {
            link.last_seen = Instant::now();
        }
    }

    /// Addresses silent for longer than `timeout`
    pub fn timed_out(&self, timeout: Duration) -> Vec<SocketAddr> {
        self.links
            .iter()
            .filter(|(_, link)| link.last_seen.elapsed() > timeout)
            .map(|(addr, _)| *addr)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Components the intake routes packets to
#[derive(Debug, Clone)]
pub struct Components {
    pub registry: FleetRegistryHandle,
    pub presence: PresenceHandle,
    pub feedback: LoadFeedbackHandle,
}

pub struct Server {
    socket: Arc<UdpSocket>,
    components: Components,
    links: Arc<RwLock<MemberLinks>>,
    stats_subscribers: HashMap<SocketAddr, SubscriberId>,
    member_timeout: Duration,
    next_connection_id: ConnectionId,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbox_tx: mpsc::UnboundedSender<OutboundPacket>,
    outbox_rx: Option<mpsc::UnboundedReceiver<OutboundPacket>>,
}

impl Server {
    pub async fn new(
        config: &DirectoryConfig,
        components: Components,
    ) -> Result<Self> {
        let address = config.bind_address();
        let socket = Arc::new(UdpSocket::bind(&address).await?);
        info!("Directory listening on {}", address);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            components,
            links: Arc::new(RwLock::new(MemberLinks::new())),
            stats_subscribers: HashMap::new(),
            member_timeout: config.member_timeout(),
            next_connection_id: 1,
            server_tx,
            server_rx,
            outbox_tx,
            outbox_rx: Some(outbox_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender that stops the intake loop when `ServerMessage::Shutdown` is sent
    pub fn control(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 4096];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[..len]) {
                        Ok(packet) => {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to decode packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outbound packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut outbox_rx) = self.outbox_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(OutboundPacket { addr, packet }) = outbox_rx.recv().await {
                if let Err(e) = send_packet_impl(&socket, &packet, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    /// Spawns task that reports silent fleet members
    fn spawn_timeout_checker(&self) {
        let links = Arc::clone(&self.links);
        let server_tx = self.server_tx.clone();
        let timeout = self.member_timeout;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = links.read().await.timed_out(timeout);
                for addr in timed_out {
                    if server_tx.send(ServerMessage::MemberTimeout { addr }).is_err() {
                        return;
                    }
                }
            }
        });
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.outbox_tx.send(OutboundPacket { addr, packet }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::RegisterMember {
                version,
                ports,
                server_id,
                capabilities,
                state,
                priority,
                load,
            } => {
                if version != PROTOCOL_VERSION {
                    warn!("Member at {} speaks protocol {}", addr, version);
                    self.send_packet(
                        Packet::Rejected {
                            reason: format!("unsupported protocol version {}", version),
                        },
                        addr,
                    );
                    return;
                }
                self.register_member(addr, ports, server_id, capabilities, state, priority, load)
                    .await;
            }

            Packet::UpdateMember { state, load } => {
                if let Some(link) = self.link(&addr).await {
                    if let Err(e) = self
                        .components
                        .registry
                        .post_update_load(link.key, state, load)
                    {
                        error!("Failed to forward load of {}: {}", addr, e);
                    }
                }
            }

            Packet::ExpectedGames { count } => {
                if let Some(link) = self.link(&addr).await {
                    log_closed(link.peer.expected_games(count));
                }
            }

            Packet::GameCreated {
                key,
                max_players,
                preserve,
            } => {
                if let Some(link) = self.link(&addr).await {
                    log_closed(link.peer.game_created(key, max_players, preserve));
                }
            }

            Packet::GameUpdated(update) => {
                if let Some(link) = self.link(&addr).await {
                    log_closed(link.peer.game_updated(update));
                }
            }

            Packet::GameRemoved { key, reason } => {
                if let Some(link) = self.link(&addr).await {
                    log_closed(link.peer.game_removed(key, reason));
                }
            }

            Packet::MemberHeartbeat => {
                self.link(&addr).await;
            }

            Packet::LeaveMember => {
                let link = self.links.write().await.remove(&addr);
                if let Some(link) = link {
                    match self.components.registry.leave(link.key.clone()).await {
                        Ok(_) => info!("Member {} left", link.key),
                        Err(e) => error!("Failed to remove member {}: {}", link.key, e),
                    }
                }
            }

            Packet::ClientConnected { user_id } => {
                log_closed(self.components.presence.client_connected(user_id));
            }

            Packet::ClientDisconnected { user_id } => {
                log_closed(self.components.presence.client_disconnected(user_id));
            }

            Packet::ClientJoinedGame {
                user_id,
                key,
                session_id,
            } => {
                log_closed(
                    self.components
                        .presence
                        .post_joined_game(user_id, key, session_id),
                );
            }

            Packet::ClientLeftGame {
                user_id,
                key,
                session_id,
            } => {
                log_closed(self.components.presence.left_game(user_id, key, session_id));
            }

            Packet::FindPresence {
                request_id,
                user_ids,
                filter,
            } => {
                // Answered off the intake loop so a slow lookup does not stall it.
                let presence = self.components.presence.clone();
                let outbox = self.outbox_tx.clone();
                tokio::spawn(async move {
                    match presence.find_presence(user_ids, filter).await {
                        Ok(results) => {
                            let _ = outbox.send(OutboundPacket {
                                addr,
                                packet: Packet::PresenceResult {
                                    request_id,
                                    results,
                                },
                            });
                        }
                        Err(e) => error!("Presence lookup {} failed: {}", request_id, e),
                    }
                });
            }

            Packet::SubscribeStats => self.subscribe_stats(addr).await,

            Packet::UnsubscribeStats => self.unsubscribe_stats(addr),

            Packet::Registered { .. }
            | Packet::Rejected { .. }
            | Packet::PresenceResult { .. }
            | Packet::Stats(_)
            | Packet::Disconnected { .. } => {
                warn!("Unexpected directory-bound packet from {}", addr);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn register_member(
        &mut self,
        addr: SocketAddr,
        ports: Vec<u16>,
        server_id: String,
        capabilities: Vec<String>,
        state: i32,
        priority: u8,
        load: shared::LoadReport,
    ) {
        let key = MemberKey::from_endpoint(addr.ip(), &ports);
        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;
        let connection = ConnectionHandle::new(connection_id, addr, self.outbox_tx.clone());

        let registration = Registration {
            key: key.clone(),
            server_id,
            capabilities,
            state,
            priority,
            load,
        };

        match self.components.registry.register(registration, connection).await {
            Ok(registered) => {
                let previous = self.links.write().await.insert(
                    addr,
                    MemberLink {
                        key,
                        connection_id,
                        peer: registered.peer,
                        last_seen: Instant::now(),
                    },
                );
                if let Some(previous) = previous {
                    debug!("Connection {} at {} replaced", previous.connection_id, addr);
                }
                self.send_packet(
                    Packet::Registered {
                        reused: registered.reused,
                    },
                    addr,
                );
            }
            Err(e) => {
                error!("Registration from {} failed: {}", addr, e);
                self.send_packet(
                    Packet::Rejected {
                        reason: e.to_string(),
                    },
                    addr,
                );
            }
        }
    }

    /// Marks `addr` as alive and returns its member link
    async fn link(&self, addr: &SocketAddr) -> Option<MemberLink> {
        let mut links = self.links.write().await;
        links.touch(addr);
        let link = links.get(addr).cloned();
        if link.is_none() {
            debug!("Packet from unregistered member at {}", addr);
        }
        link
    }

    async fn subscribe_stats(&mut self, addr: SocketAddr) {
        let feedback = &self.components.feedback;
        if let Ok(snapshot) = feedback.snapshot().await {
            self.send_packet(Packet::Stats(snapshot), addr);
        }
        if self.stats_subscribers.contains_key(&addr) {
            return;
        }

        let mut stats = match feedback.subscribe().await {
            Ok((id, stats)) => {
                self.stats_subscribers.insert(addr, id);
                stats
            }
            Err(e) => {
                error!("Stats subscription for {} failed: {}", addr, e);
                return;
            }
        };
        let outbox = self.outbox_tx.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = stats.recv().await {
                if outbox
                    .send(OutboundPacket {
                        addr,
                        packet: Packet::Stats(snapshot),
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        info!("{} subscribed to stats", addr);
    }

    /// Drops the subscription of `addr`; its forwarding task ends with it.
    fn unsubscribe_stats(&mut self, addr: SocketAddr) {
        let Some(id) = self.stats_subscribers.remove(&addr) else {
            debug!("{} was not subscribed to stats", addr);
            return;
        };
        if let Err(e) = self.components.feedback.unsubscribe(id) {
            error!("Failed to unsubscribe {}: {}", addr, e);
        }
        info!("{} unsubscribed from stats", addr);
    }

    async fn handle_timeout(&mut self, addr: SocketAddr) {
        let Some(link) = self.links.write().await.remove(&addr) else {
            return;
        };
        warn!("Member {} at {} timed out", link.key, addr);
        if let Err(e) = self
            .components
            .registry
            .post_disconnect(link.key, link.connection_id)
        {
            error!("Failed to report timeout of {}: {}", addr, e);
        }
    }

    /// Main intake loop
    pub async fn run(&mut self) -> Result<()> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        info!("Directory intake started");

        while let Some(message) = self.server_rx.recv().await {
            match message {
                ServerMessage::PacketReceived { packet, addr } => {
                    self.handle_packet(packet, addr).await;
                }
                ServerMessage::MemberTimeout { addr } => self.handle_timeout(addr).await,
                ServerMessage::Shutdown => {
                    info!("Directory intake shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

fn log_closed(result: Result<()>) {
    if let Err(e) = result {
        error!("Dropping packet: {}", e);
    }
}

async fn send_packet_impl(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) -> Result<()> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}
