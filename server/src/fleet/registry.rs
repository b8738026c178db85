//! Registry of fleet members and their connection lifecycle.
//!
//! A member that loses its connection is kept for a disconnect TTL so a quick
//! reconnect under the same server id resumes the same identity with its games
//! intact. A reconnect under a different server id evicts the old entry first.
//! The external placement balancer is kept in step with every transition.

use log::{debug, error, info, warn};
use shared::{LoadLevel, LoadReport, MemberState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::balancer::PlacementBalancer;
use super::member::{ConnectionHandle, ConnectionId, FleetMember, MemberKey, MemberRef};
use super::peer::{FleetPeer, PeerHandle};
use super::prediction::LoadPredictor;
use super::replication::ReplicationHooks;
use crate::config::DirectoryConfig;
use crate::directory::GameDirectoryHandle;
use crate::error::{DirectoryError, Result};
use crate::feedback::LoadFeedbackHandle;
use crate::timer::{schedule, TimerHandle, TimerToken};

const COMPONENT: &str = "fleet registry";

/// What a fleet member announces when it (re)connects.
#[derive(Debug, Clone)]
pub struct Registration {
    pub key: MemberKey,
    pub server_id: String,
    pub capabilities: Vec<String>,
    /// Raw state code; unknown codes are logged and ignored.
    pub state: i32,
    pub priority: u8,
    pub load: LoadReport,
}

#[derive(Debug, Clone)]
pub struct Registered {
    pub member: MemberRef,
    /// The existing entry was resumed instead of created.
    pub reused: bool,
    pub peer: PeerHandle,
}

/// Point-in-time view of one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub member: MemberRef,
    pub state: MemberState,
    pub connected: bool,
    pub raw_level: LoadLevel,
    pub effective_level: LoadLevel,
    pub peer_count: u32,
    pub game_count: u32,
    pub in_rotation: bool,
    pub removal_pending: bool,
}

#[derive(Debug)]
enum RegistryCommand {
    Register {
        registration: Registration,
        connection: ConnectionHandle,
        reply: oneshot::Sender<Registered>,
    },
    Disconnect {
        key: MemberKey,
        connection_id: ConnectionId,
        reply: Option<oneshot::Sender<bool>>,
    },
    Leave {
        key: MemberKey,
        reply: Option<oneshot::Sender<bool>>,
    },
    UpdateLoad {
        key: MemberKey,
        state: Option<i32>,
        load: LoadReport,
        reply: Option<oneshot::Sender<Result<LoadLevel>>>,
    },
    Member {
        key: MemberKey,
        reply: oneshot::Sender<Option<MemberSnapshot>>,
    },
    Members {
        reply: oneshot::Sender<Vec<MemberSnapshot>>,
    },
}

#[derive(Debug)]
enum RegistryTimer {
    RemovalDue { key: MemberKey, token: TimerToken },
}

struct MemberEntry {
    member: FleetMember,
    peer: Option<PeerHandle>,
    removal: Option<TimerHandle>,
    in_rotation: bool,
    predictor: Option<LoadPredictor>,
}

impl MemberEntry {
    fn snapshot(&self) -> MemberSnapshot {
        MemberSnapshot {
            member: self.member.member.clone(),
            state: self.member.state,
            connected: self.member.is_connected(),
            raw_level: self.member.raw_level,
            effective_level: self.member.effective_level(),
            peer_count: self.member.peer_count,
            game_count: self.member.game_count,
            in_rotation: self.in_rotation,
            removal_pending: self.removal.is_some(),
        }
    }
}

pub struct ServerFleetRegistry {
    members: HashMap<MemberKey, MemberEntry>,
    config: DirectoryConfig,
    directory: GameDirectoryHandle,
    hooks: Arc<dyn ReplicationHooks>,
    feedback: LoadFeedbackHandle,
    balancer: Arc<dyn PlacementBalancer>,
    commands: mpsc::UnboundedReceiver<RegistryCommand>,
    timer_tx: mpsc::UnboundedSender<RegistryTimer>,
    timer_rx: mpsc::UnboundedReceiver<RegistryTimer>,
}

impl ServerFleetRegistry {
    pub fn spawn(
        config: &DirectoryConfig,
        directory: GameDirectoryHandle,
        feedback: LoadFeedbackHandle,
        balancer: Arc<dyn PlacementBalancer>,
    ) -> FleetRegistryHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let registry = ServerFleetRegistry {
            members: HashMap::new(),
            config: config.clone(),
            hooks: Arc::new(directory.clone()),
            directory,
            feedback,
            balancer,
            commands: rx,
            timer_tx,
            timer_rx,
        };
        tokio::spawn(registry.run());

        FleetRegistryHandle { commands: tx }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(timer) = self.timer_rx.recv() => self.handle_timer(timer).await,
            }
        }

        let keys: Vec<MemberKey> = self.members.keys().cloned().collect();
        for key in keys {
            self.remove_member(&key, "directory shutting down").await;
        }
        debug!("Fleet registry stopped");
    }

    async fn handle_command(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Register {
                registration,
                connection,
                reply,
            } => {
                let registered = self.register(registration, connection).await;
                let _ = reply.send(registered);
            }

            RegistryCommand::Disconnect {
                key,
                connection_id,
                reply,
            } => {
                let detached = self.disconnect(&key, connection_id).await;
                respond(reply, detached);
            }

            RegistryCommand::Leave { key, reply } => {
                let removed = self.remove_member(&key, "member left").await;
                respond(reply, removed);
            }

            RegistryCommand::UpdateLoad {
                key,
                state,
                load,
                reply,
            } => {
                let result = self.update_load(&key, state, load);
                if let Err(e) = &result {
                    debug!("Load update ignored: {}", e);
                }
                respond(reply, result);
            }

            RegistryCommand::Member { key, reply } => {
                let _ = reply.send(self.members.get(&key).map(MemberEntry::snapshot));
            }

            RegistryCommand::Members { reply } => {
                let mut members: Vec<MemberSnapshot> =
                    self.members.values().map(MemberEntry::snapshot).collect();
                members.sort_by(|a, b| a.member.key.cmp(&b.member.key));
                let _ = reply.send(members);
            }
        }
    }

    async fn handle_timer(&mut self, timer: RegistryTimer) {
        match timer {
            RegistryTimer::RemovalDue { key, token } => {
                let due = self
                    .members
                    .get(&key)
                    .and_then(|entry| entry.removal.as_ref())
                    .map(|timer| timer.matches(token))
                    .unwrap_or(false);
                if due {
                    self.remove_member(&key, "disconnect TTL elapsed").await;
                }
            }
        }
    }

    async fn register(
        &mut self,
        registration: Registration,
        connection: ConnectionHandle,
    ) -> Registered {
        let Registration {
            key,
            server_id,
            capabilities,
            state,
            priority,
            load,
        } = registration;

        let existing = self
            .members
            .get(&key)
            .map(|entry| entry.member.member.server_id.clone());
        let reused = match existing {
            Some(current) if current == server_id => true,
            Some(current) => {
                let mismatch = DirectoryError::ServerIdMismatch {
                    key: key.clone(),
                    expected: current,
                    actual: server_id.clone(),
                };
                warn!("{}; evicting the stale entry", mismatch);
                self.remove_member(&key, "replaced by a new server instance")
                    .await;
                false
            }
            None => false,
        };

        let finish_check = self.config.replication_finish_check();
        let directory = self.directory.clone();
        let hooks = Arc::clone(&self.hooks);
        let predictor = LoadPredictor::from_config(&self.config);

        let entry = self
            .members
            .entry(key.clone())
            .or_insert_with(|| MemberEntry {
                member: FleetMember::new(
                    MemberRef::new(key.clone(), server_id),
                    capabilities.clone(),
                    priority,
                ),
                peer: None,
                removal: None,
                in_rotation: false,
                predictor,
            });

        if reused {
            if let Some(mut removal) = entry.removal.take() {
                removal.cancel();
                info!("Member {} reconnected within the disconnect TTL", key);
            }
            entry.member.capabilities = capabilities;
            entry.member.priority = priority;
        } else {
            info!("Member {} registered", entry.member.member);
        }

        let addr = connection.addr;
        if let Some(previous) = entry.member.attach(connection) {
            previous.supersede(addr);
        }
        // The old session must report before the new one starts.
        if let Some(peer) = entry.peer.take() {
            peer.shutdown().await;
        }
        let member = entry.member.member.clone();
        let peer = FleetPeer::spawn(member.clone(), directory, hooks, finish_check);
        entry.peer = Some(peer.clone());

        self.apply_declared(&key, Some(state), load);

        Registered {
            member,
            reused,
            peer,
        }
    }

    async fn disconnect(&mut self, key: &MemberKey, connection_id: ConnectionId) -> bool {
        let Some(entry) = self.members.get_mut(key) else {
            debug!("Disconnect for unknown member {}", key);
            return false;
        };
        if entry.member.detach(connection_id).is_none() {
            debug!("Ignoring stale disconnect of connection {} for {}", connection_id, key);
            return false;
        }

        if let Some(peer) = entry.peer.take() {
            peer.shutdown().await;
        }
        let ttl = self.config.disconnect_ttl();
        let removal_key = key.clone();
        entry.removal = Some(schedule(ttl, &self.timer_tx, move |token| {
            RegistryTimer::RemovalDue {
                key: removal_key,
                token,
            }
        }));
        info!("Member {} disconnected, removal in {:?}", key, ttl);

        self.sync_balancer(key);
        true
    }

    fn update_load(
        &mut self,
        key: &MemberKey,
        state: Option<i32>,
        load: LoadReport,
    ) -> Result<LoadLevel> {
        if !self.members.contains_key(key) {
            return Err(DirectoryError::UnknownMember(key.clone()));
        }
        self.apply_declared(key, state, load);
        self.members
            .get(key)
            .map(|entry| entry.member.effective_level())
            .ok_or_else(|| DirectoryError::UnknownMember(key.clone()))
    }

    /// Applies a declared state and load report, then reconciles the balancer.
    fn apply_declared(&mut self, key: &MemberKey, state: Option<i32>, load: LoadReport) {
        let Some(entry) = self.members.get_mut(key) else {
            return;
        };

        entry.member.raw_level = LoadLevel::new(load.raw_level);
        entry.member.peer_count = load.peer_count;
        entry.member.game_count = load.game_count;
        if let Some(predictor) = entry.predictor.as_mut() {
            entry.member.predicted_level = Some(predictor.sample(load.peer_count));
        }
        let member = entry.member.member.clone();

        if let Err(e) = self
            .feedback
            .member_report(member.clone(), load.peer_count, load.game_count)
        {
            warn!("Failed to report load of {}: {}", member, e);
        }

        if let Some(code) = state {
            match MemberState::try_from(code) {
                Ok(next) => self.transition(key, next),
                Err(code) => {
                    warn!("{} from {}; state unchanged", DirectoryError::InvalidState(code), member)
                }
            }
        }

        self.sync_balancer(key);
    }

    fn transition(&mut self, key: &MemberKey, next: MemberState) {
        let Some(entry) = self.members.get_mut(key) else {
            return;
        };
        let previous = entry.member.state;
        if previous == next {
            return;
        }
        entry.member.state = next;
        info!("Member {} is now {:?} (was {:?})", entry.member.member, next, previous);

        if next == MemberState::Offline {
            if let Err(e) = self.directory.member_offline(entry.member.member.clone()) {
                error!("Failed to release games of {}: {}", entry.member.member, e);
            }
        }
    }

    /// A member is in rotation while it is connected and `Normal`.
    fn sync_balancer(&mut self, key: &MemberKey) {
        let Some(entry) = self.members.get_mut(key) else {
            return;
        };
        let member = &entry.member;
        let wanted = member.is_connected() && member.state == MemberState::Normal;

        let result = match (entry.in_rotation, wanted) {
            (false, true) => self.balancer.add_member(
                &member.member,
                member.effective_level(),
                member.priority,
            ),
            (true, true) => self.balancer.update_member(
                &member.member,
                member.effective_level(),
                member.priority,
                member.state,
            ),
            (true, false) => self.balancer.remove_member(&member.member, member.priority),
            (false, false) => Ok(()),
        };
        if let Err(e) = result {
            error!("Balancer update for {} failed: {}", member.member, e);
        }
        entry.in_rotation = wanted;
    }

    /// Drops the entry for `key` and releases everything it owns.
    async fn remove_member(&mut self, key: &MemberKey, reason: &str) -> bool {
        let Some(mut entry) = self.members.remove(key) else {
            debug!("Remove for unknown member {}", key);
            return false;
        };

        if let Some(mut removal) = entry.removal.take() {
            removal.cancel();
        }
        if let Some(connection) = entry.member.connection.take() {
            connection.close(reason);
        }
        if let Some(peer) = entry.peer.take() {
            peer.shutdown().await;
        }
        if entry.in_rotation {
            if let Err(e) = self
                .balancer
                .remove_member(&entry.member.member, entry.member.priority)
            {
                error!("Balancer removal of {} failed: {}", entry.member.member, e);
            }
        }

        let member = entry.member.member;
        if let Err(e) = self.directory.member_removed(member.clone()) {
            error!("Failed to release games of {}: {}", member, e);
        }
        if let Err(e) = self.feedback.member_removed(member.clone()) {
            warn!("Failed to drop load of {}: {}", member, e);
        }
        info!("Member {} removed: {}", member, reason);
        true
    }
}

fn respond<T>(reply: Option<oneshot::Sender<T>>, value: T) {
    if let Some(reply) = reply {
        let _ = reply.send(value);
    }
}

#[derive(Debug, Clone)]
pub struct FleetRegistryHandle {
    commands: mpsc::UnboundedSender<RegistryCommand>,
}

impl FleetRegistryHandle {
    fn post(&self, command: RegistryCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx))?;
        rx.await.map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }

    /// Registers a member or resumes it after a reconnect, attaching
    /// `connection` and starting a new replication session.
    pub async fn register(
        &self,
        registration: Registration,
        connection: ConnectionHandle,
    ) -> Result<Registered> {
        self.request(|reply| RegistryCommand::Register {
            registration,
            connection,
            reply,
        })
        .await
    }

    /// Returns false when `connection_id` is not the attached connection.
    pub async fn disconnect(&self, key: MemberKey, connection_id: ConnectionId) -> Result<bool> {
        self.request(|reply| RegistryCommand::Disconnect {
            key,
            connection_id,
            reply: Some(reply),
        })
        .await
    }

    pub fn post_disconnect(&self, key: MemberKey, connection_id: ConnectionId) -> Result<()> {
        self.post(RegistryCommand::Disconnect {
            key,
            connection_id,
            reply: None,
        })
    }

    /// Removes the member right away, skipping the disconnect TTL.
    pub async fn leave(&self, key: MemberKey) -> Result<bool> {
        self.request(|reply| RegistryCommand::Leave {
            key,
            reply: Some(reply),
        })
        .await
    }

    pub async fn update_load(
        &self,
        key: MemberKey,
        state: Option<i32>,
        load: LoadReport,
    ) -> Result<LoadLevel> {
        self.request(|reply| RegistryCommand::UpdateLoad {
            key,
            state,
            load,
            reply: Some(reply),
        })
        .await?
    }

    pub fn post_update_load(
        &self,
        key: MemberKey,
        state: Option<i32>,
        load: LoadReport,
    ) -> Result<()> {
        self.post(RegistryCommand::UpdateLoad {
            key,
            state,
            load,
            reply: None,
        })
    }

    pub async fn member(&self, key: MemberKey) -> Result<Option<MemberSnapshot>> {
        self.request(|reply| RegistryCommand::Member { key, reply })
            .await
    }

    pub async fn members(&self) -> Result<Vec<MemberSnapshot>> {
        self.request(|reply| RegistryCommand::Members { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{GameDirectory, NewGame};
    use crate::feedback::LoadFeedbackAggregator;
    use crate::fleet::balancer::{BalancerCall, RecordingBalancer};
    use crate::fleet::member::OutboundPacket;
    use shared::{GameKey, Packet};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio_test::assert_ok;

    struct Fixture {
        registry: FleetRegistryHandle,
        directory: GameDirectoryHandle,
        balancer: Arc<RecordingBalancer>,
        outbox: mpsc::UnboundedSender<OutboundPacket>,
        sent: mpsc::UnboundedReceiver<OutboundPacket>,
    }

    fn fixture(config: DirectoryConfig) -> Fixture {
        let directory = GameDirectory::spawn(&config);
        let feedback = LoadFeedbackAggregator::spawn(&config);
        let balancer = Arc::new(RecordingBalancer::new());
        let registry =
            ServerFleetRegistry::spawn(&config, directory.clone(), feedback, balancer.clone());
        let (outbox, sent) = mpsc::unbounded_channel();
        Fixture {
            registry,
            directory,
            balancer,
            outbox,
            sent,
        }
    }

    fn config() -> DirectoryConfig {
        DirectoryConfig {
            disconnect_ttl_ms: 1000,
            ..Default::default()
        }
    }

    fn key() -> MemberKey {
        MemberKey::new("10.0.0.1:5055")
    }

    fn registration(server_id: &str, state: MemberState, raw_level: u8) -> Registration {
        Registration {
            key: key(),
            server_id: server_id.to_string(),
            capabilities: vec!["udp".to_string()],
            state: state.code(),
            priority: 1,
            load: LoadReport {
                raw_level,
                peer_count: 0,
                game_count: 0,
            },
        }
    }

    impl Fixture {
        fn connection(&self, id: ConnectionId) -> ConnectionHandle {
            let addr: SocketAddr = "10.0.0.1:5055".parse().unwrap();
            ConnectionHandle::new(id, addr, self.outbox.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_adds_normal_member_to_balancer() {
        let f = fixture(config());
        let registered = f
            .registry
            .register(registration("s1", MemberState::Normal, 2), f.connection(1))
            .await
            .unwrap();
        assert!(!registered.reused);

        let snapshot = f.registry.member(key()).await.unwrap().unwrap();
        assert!(snapshot.connected);
        assert!(snapshot.in_rotation);
        assert_eq!(snapshot.effective_level, LoadLevel::new(2));
        assert_eq!(
            f.balancer.calls(),
            vec![BalancerCall::Add(registered.member, LoadLevel::new(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_ttl_reuses_member() {
        let f = fixture(config());
        let first = f
            .registry
            .register(registration("s1", MemberState::Normal, 2), f.connection(1))
            .await
            .unwrap();
        assert_ok!(
            f.directory
                .create_if_absent(NewGame::new(GameKey::new("lobby", "g1"), 4, first.member.clone()))
                .await
        );

        assert!(f.registry.disconnect(key(), 1).await.unwrap());
        tokio::time::sleep(Duration::from_millis(999)).await;

        let second = f
            .registry
            .register(registration("s1", MemberState::Normal, 2), f.connection(2))
            .await
            .unwrap();
        assert!(second.reused);
        assert_eq!(second.member, first.member);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(f.registry.member(key()).await.unwrap().is_some());
        assert_eq!(
            f.directory.games_owned_by(&second.member).await,
            vec![GameKey::new("lobby", "g1")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_after_ttl() {
        let f = fixture(config());
        f.registry
            .register(registration("s1", MemberState::Normal, 2), f.connection(1))
            .await
            .unwrap();
        f.registry.disconnect(key(), 1).await.unwrap();

        let pending = f.registry.member(key()).await.unwrap().unwrap();
        assert!(pending.removal_pending);
        assert!(!pending.in_rotation);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(f.registry.member(key()).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_server_id_evicts_old_entry() {
        let mut f = fixture(config());
        let first = f
            .registry
            .register(registration("s1", MemberState::Normal, 2), f.connection(1))
            .await
            .unwrap();
        f.directory
            .create_if_absent(NewGame::new(GameKey::new("lobby", "g1"), 4, first.member.clone()))
            .await
            .unwrap();

        let second = f
            .registry
            .register(registration("s2", MemberState::Normal, 2), f.connection(2))
            .await
            .unwrap();
        assert!(!second.reused);
        assert_ne!(second.member, first.member);

        // Round trip through the directory so the eviction has been applied.
        f.directory.replication_status(first.member.clone()).await.unwrap();
        assert!(f.directory.games_owned_by(&second.member).await.is_empty());
        assert!(f.directory.get_game(&GameKey::new("lobby", "g1")).await.is_none());

        let closed = f.sent.recv().await.unwrap();
        assert!(matches!(closed.packet, Packet::Disconnected { .. }));
        assert!(f.balancer.calls().contains(&BalancerCall::Remove(first.member)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_disconnect_is_ignored() {
        let f = fixture(config());
        f.registry
            .register(registration("s1", MemberState::Normal, 2), f.connection(1))
            .await
            .unwrap();
        f.registry
            .register(registration("s1", MemberState::Normal, 2), f.connection(2))
            .await
            .unwrap();

        assert!(!f.registry.disconnect(key(), 1).await.unwrap());
        let snapshot = f.registry.member(key()).await.unwrap().unwrap();
        assert!(snapshot.connected);
        assert!(!snapshot.removal_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_from_same_address_keeps_connection_quiet() {
        let mut f = fixture(config());
        f.registry
            .register(registration("s1", MemberState::Normal, 2), f.connection(1))
            .await
            .unwrap();
        let retried = f
            .registry
            .register(registration("s1", MemberState::Normal, 2), f.connection(2))
            .await
            .unwrap();

        assert!(retried.reused);
        assert!(f.registry.member(key()).await.unwrap().unwrap().connected);
        assert!(f.sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_orphans_games_until_normal_again() {
        let f = fixture(config());
        let registered = f
            .registry
            .register(registration("s1", MemberState::Normal, 1), f.connection(1))
            .await
            .unwrap();
        let member = registered.member;
        let game = GameKey::new("lobby", "g1");
        assert_ok!(
            f.directory
                .create_if_absent(NewGame::new(game.clone(), 4, member.clone()))
                .await
        );
        let load = LoadReport {
            raw_level: 3,
            peer_count: 10,
            game_count: 1,
        };

        f.registry
            .update_load(key(), Some(MemberState::Offline.code()), load)
            .await
            .unwrap();
        let snapshot = f.registry.member(key()).await.unwrap().unwrap();
        assert_eq!(snapshot.state, MemberState::Offline);
        assert!(!snapshot.in_rotation);

        // Round trip through the directory so the release has been applied.
        f.directory.replication_status(member.clone()).await.unwrap();
        assert!(f.directory.get_game(&game).await.unwrap().is_orphaned());
        assert!(f.directory.games_owned_by(&member).await.is_empty());

        f.registry
            .update_load(key(), Some(MemberState::Normal.code()), load)
            .await
            .unwrap();
        assert_eq!(
            f.balancer.calls(),
            vec![
                BalancerCall::Add(member.clone(), LoadLevel::new(1)),
                BalancerCall::Remove(member.clone()),
                BalancerCall::Add(member, LoadLevel::new(3)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_removes_immediately() {
        let f = fixture(config());
        f.registry
            .register(registration("s1", MemberState::Normal, 2), f.connection(1))
            .await
            .unwrap();

        assert!(f.registry.leave(key()).await.unwrap());
        assert!(f.registry.member(key()).await.unwrap().is_none());
        assert!(!f.registry.leave(key()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions_drive_balancer() {
        let f = fixture(config());
        let registered = f
            .registry
            .register(registration("s1", MemberState::Normal, 1), f.connection(1))
            .await
            .unwrap();
        let member = registered.member;
        let load = LoadReport {
            raw_level: 3,
            peer_count: 10,
            game_count: 1,
        };

        f.registry
            .update_load(key(), Some(MemberState::OutOfRotation.code()), load)
            .await
            .unwrap();
        f.registry
            .update_load(key(), Some(MemberState::Normal.code()), load)
            .await
            .unwrap();
        f.registry.update_load(key(), None, load).await.unwrap();

        assert_eq!(
            f.balancer.calls(),
            vec![
                BalancerCall::Add(member.clone(), LoadLevel::new(1)),
                BalancerCall::Remove(member.clone()),
                BalancerCall::Add(member.clone(), LoadLevel::new(3)),
                BalancerCall::Update(member, LoadLevel::new(3), MemberState::Normal),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_state_is_ignored() {
        let f = fixture(config());
        f.registry
            .register(registration("s1", MemberState::Normal, 1), f.connection(1))
            .await
            .unwrap();

        let level = f
            .registry
            .update_load(key(), Some(42), LoadReport { raw_level: 4, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(level, LoadLevel::new(4));
        let snapshot = f.registry.member(key()).await.unwrap().unwrap();
        assert_eq!(snapshot.state, MemberState::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_member_load_update_fails() {
        let f = fixture(config());
        let err = f
            .registry
            .update_load(key(), None, LoadReport::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::UnknownMember(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prediction_only_raises_level() {
        let f = fixture(DirectoryConfig {
            prediction: true,
            prediction_window: 4,
            prediction_horizon: 4,
            peers_per_level: 10,
            ..config()
        });
        f.registry
            .register(registration("s1", MemberState::Normal, 1), f.connection(1))
            .await
            .unwrap();

        let mut last = LoadLevel::LOWEST;
        for peers in [10, 20, 30, 40] {
            last = f
                .registry
                .update_load(
                    key(),
                    None,
                    LoadReport {
                        raw_level: 1,
                        peer_count: peers,
                        game_count: 1,
                    },
                )
                .await
                .unwrap();
            assert!(last >= LoadLevel::new(1));
        }
        // 40 peers rising by 10 per sample, projected 4 samples ahead.
        assert_eq!(last, LoadLevel::new(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_balancer_failures_are_not_fatal() {
        let config = config();
        let directory = GameDirectory::spawn(&config);
        let feedback = LoadFeedbackAggregator::spawn(&config);
        let balancer = Arc::new(RecordingBalancer::failing());
        let registry = ServerFleetRegistry::spawn(&config, directory, feedback, balancer.clone());
        let (outbox, _sent) = mpsc::unbounded_channel();
        let addr: SocketAddr = "10.0.0.1:5055".parse().unwrap();

        registry
            .register(
                registration("s1", MemberState::Normal, 1),
                ConnectionHandle::new(1, addr, outbox),
            )
            .await
            .unwrap();
        let snapshot = registry.member(key()).await.unwrap().unwrap();
        assert!(snapshot.in_rotation);
        assert_eq!(balancer.calls().len(), 1);
    }
}
