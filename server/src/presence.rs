//! Presence tracking for authenticated users
//!
//! This module answers "is this user online, and in which game?" for the
//! front end. It handles:
//! - Directory connect and disconnect events per user id
//! - Game joins and leaves, including several concurrent sessions per identity
//! - Presence lookups filtered by the state of the game in the directory
//!
//! All mutation is serialized on the presence task, so connect, join and leave
//! events arriving from different connections never race each other.

use log::{debug, info, warn};
use shared::{FindPresenceResult, GameKey, PresenceFilter};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

use crate::config::DirectoryConfig;
use crate::directory::{GameDirectoryHandle, GameRecord};
use crate::error::{DirectoryError, Result};
use crate::feedback::LoadFeedbackHandle;

const COMPONENT: &str = "presence directory";

/// Presence of one user id
///
/// A record exists while the user is either connected to the directory or
/// inside a game. Once neither holds, the record is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceRecord {
    /// The user holds a live connection to the directory
    pub connected: bool,
    /// Game the user joined most recently and has not left
    pub active_game: Option<GameKey>,
    /// Every (game, session id) pair currently joined under this identity
    pub sessions: Vec<(GameKey, String)>,
}

impl PresenceRecord {
    fn is_empty(&self) -> bool {
        !self.connected && self.active_game.is_none()
    }
}

#[derive(Debug)]
enum PresenceCommand {
    Connected {
        user_id: String,
    },
    Disconnected {
        user_id: String,
    },
    Joined {
        user_id: String,
        key: GameKey,
        session_id: String,
        reply: Option<oneshot::Sender<usize>>,
    },
    Left {
        user_id: String,
        key: GameKey,
        session_id: String,
    },
    Find {
        user_ids: Vec<String>,
        filter: PresenceFilter,
        reply: oneshot::Sender<Vec<FindPresenceResult>>,
    },
    Record {
        user_id: String,
        reply: oneshot::Sender<Option<PresenceRecord>>,
    },
}

pub struct PresenceDirectory {
    records: HashMap<String, PresenceRecord>,
    max_sessions: usize,
    directory: GameDirectoryHandle,
    feedback: LoadFeedbackHandle,
    commands: mpsc::UnboundedReceiver<PresenceCommand>,
}

impl PresenceDirectory {
    /// Starts the presence task
    ///
    /// Game lookups for filtered queries go through `directory`; connect and
    /// disconnect transitions are forwarded to `feedback` so the connected
    /// clients total stays current.
    pub fn spawn(
        config: &DirectoryConfig,
        directory: GameDirectoryHandle,
        feedback: LoadFeedbackHandle,
    ) -> PresenceHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let presence = PresenceDirectory {
            records: HashMap::new(),
            max_sessions: config.max_sessions_per_user,
            directory,
            feedback,
            commands: rx,
        };
        tokio::spawn(presence.run());
        PresenceHandle { commands: tx }
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle_command(command).await;
        }
        debug!("Presence directory stopped");
    }

    async fn handle_command(&mut self, command: PresenceCommand) {
        match command {
            PresenceCommand::Connected { user_id } => self.connected(user_id),
            PresenceCommand::Disconnected { user_id } => self.disconnected(&user_id),
            PresenceCommand::Joined {
                user_id,
                key,
                session_id,
                reply,
            } => {
                let count = self.joined(user_id, key, session_id);
                if let Some(reply) = reply {
                    let _ = reply.send(count);
                }
            }
            PresenceCommand::Left {
                user_id,
                key,
                session_id,
            } => self.left(&user_id, &key, &session_id),
            PresenceCommand::Find {
                user_ids,
                filter,
                reply,
            } => {
                let results = self.find(&user_ids, filter).await;
                let _ = reply.send(results);
            }
            PresenceCommand::Record { user_id, reply } => {
                let _ = reply.send(self.records.get(&user_id).cloned());
            }
        }
    }

    fn connected(&mut self, user_id: String) {
        let record = self.records.entry(user_id.clone()).or_default();
        if record.connected {
            debug!("User {} connected twice", user_id);
            return;
        }
        record.connected = true;
        if let Err(e) = self.feedback.client_connected() {
            warn!("Failed to count connection of {}: {}", user_id, e);
        }
    }

    fn disconnected(&mut self, user_id: &str) {
        let Some(record) = self.records.get_mut(user_id) else {
            debug!("Disconnect of unknown user {}", user_id);
            return;
        };
        if !record.connected {
            return;
        }
        record.connected = false;
        if let Err(e) = self.feedback.client_disconnected() {
            warn!("Failed to count disconnection of {}: {}", user_id, e);
        }
        self.prune(user_id);
    }

    /// Records a join and returns the number of sessions the identity now
    /// holds. Exceeding the configured ceiling is logged, never rejected.
    fn joined(&mut self, user_id: String, key: GameKey, session_id: String) -> usize {
        let record = self.records.entry(user_id.clone()).or_default();
        let pair = (key.clone(), session_id);
        if !record.sessions.contains(&pair) {
            record.sessions.push(pair);
        }
        record.active_game = Some(key);

        let count = record.sessions.len();
        if count > self.max_sessions {
            warn!(
                "User {} holds {} concurrent sessions (limit {})",
                user_id, count, self.max_sessions
            );
        }
        count
    }

    fn left(&mut self, user_id: &str, key: &GameKey, session_id: &str) {
        let Some(record) = self.records.get_mut(user_id) else {
            debug!("Leave of unknown user {}", user_id);
            return;
        };
        record
            .sessions
            .retain(|(game, session)| !(game == key && session == session_id));
        if record.active_game.as_ref() == Some(key) {
            record.active_game = record.sessions.last().map(|(game, _)| game.clone());
        }
        self.prune(user_id);
    }

    fn prune(&mut self, user_id: &str) {
        if self.records.get(user_id).map(PresenceRecord::is_empty) == Some(true) {
            self.records.remove(user_id);
            info!("User {} is offline", user_id);
        }
    }

    /// Resolves presence for `user_ids` in request order
    ///
    /// The online flag only depends on the presence record. The game id is
    /// suppressed when the filter rejects the game or the directory no longer
    /// knows it while the filter asks for any property of it.
    async fn find(&self, user_ids: &[String], filter: PresenceFilter) -> Vec<FindPresenceResult> {
        let mut results = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let Some(record) = self.records.get(user_id) else {
                results.push(FindPresenceResult::default());
                continue;
            };

            let game_id = match &record.active_game {
                Some(key) => {
                    let game = self.directory.get_game(key).await;
                    passes(&filter, game.as_ref()).then(|| key.game_id.clone())
                }
                None => None,
            };
            results.push(FindPresenceResult {
                online: true,
                game_id,
            });
        }
        results
    }
}

fn passes(filter: &PresenceFilter, game: Option<&GameRecord>) -> bool {
    let unfiltered = !filter.require_confirmed && !filter.require_visible && !filter.require_open;
    match game {
        None => unfiltered,
        Some(game) => {
            (!filter.require_confirmed || game.created_on_member)
                && (!filter.require_visible || game.is_visible)
                && (!filter.require_open || game.is_open)
        }
    }
}

/// Cloneable entry point to the presence directory
#[derive(Debug, Clone)]
pub struct PresenceHandle {
    commands: mpsc::UnboundedSender<PresenceCommand>,
}

impl PresenceHandle {
    fn post(&self, command: PresenceCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PresenceCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx))?;
        rx.await.map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }

    pub fn client_connected(&self, user_id: impl Into<String>) -> Result<()> {
        self.post(PresenceCommand::Connected {
            user_id: user_id.into(),
        })
    }

    pub fn client_disconnected(&self, user_id: impl Into<String>) -> Result<()> {
        self.post(PresenceCommand::Disconnected {
            user_id: user_id.into(),
        })
    }

    /// Records a game join and returns the post-insert session count
    pub async fn joined_game(
        &self,
        user_id: impl Into<String>,
        key: GameKey,
        session_id: impl Into<String>,
    ) -> Result<usize> {
        let user_id = user_id.into();
        let session_id = session_id.into();
        self.request(|reply| PresenceCommand::Joined {
            user_id,
            key,
            session_id,
            reply: Some(reply),
        })
        .await
    }

    pub fn post_joined_game(
        &self,
        user_id: impl Into<String>,
        key: GameKey,
        session_id: impl Into<String>,
    ) -> Result<()> {
        self.post(PresenceCommand::Joined {
            user_id: user_id.into(),
            key,
            session_id: session_id.into(),
            reply: None,
        })
    }

    pub fn left_game(
        &self,
        user_id: impl Into<String>,
        key: GameKey,
        session_id: impl Into<String>,
    ) -> Result<()> {
        self.post(PresenceCommand::Left {
            user_id: user_id.into(),
            key,
            session_id: session_id.into(),
        })
    }

    /// Looks up presence for `user_ids`; results come back in the same order
    pub async fn find_presence(
        &self,
        user_ids: Vec<String>,
        filter: PresenceFilter,
    ) -> Result<Vec<FindPresenceResult>> {
        self.request(|reply| PresenceCommand::Find {
            user_ids,
            filter,
            reply,
        })
        .await
    }

    /// Current (game, session) pairs of `user_id`
    pub async fn sessions(&self, user_id: impl Into<String>) -> Result<Vec<(GameKey, String)>> {
        Ok(self
            .record(user_id)
            .await?
            .map(|record| record.sessions)
            .unwrap_or_default())
    }

    pub async fn record(&self, user_id: impl Into<String>) -> Result<Option<PresenceRecord>> {
        let user_id = user_id.into();
        self.request(|reply| PresenceCommand::Record { user_id, reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{GameDirectory, NewGame};
    use crate::feedback::LoadFeedbackAggregator;
    use crate::fleet::member::{MemberKey, MemberRef};
    use shared::GameUpdate;

    struct Fixture {
        presence: PresenceHandle,
        directory: GameDirectoryHandle,
        feedback: LoadFeedbackHandle,
    }

    fn fixture() -> Fixture {
        let config = DirectoryConfig {
            max_sessions_per_user: 2,
            ..Default::default()
        };
        let directory = GameDirectory::spawn(&config);
        let feedback = LoadFeedbackAggregator::spawn(&config);
        let presence = PresenceDirectory::spawn(&config, directory.clone(), feedback.clone());
        Fixture {
            presence,
            directory,
            feedback,
        }
    }

    fn owner() -> MemberRef {
        MemberRef::new(MemberKey::new("10.0.0.1:5055"), "s1")
    }

    fn key(id: &str) -> GameKey {
        GameKey::new("lobby", id)
    }

    #[tokio::test]
    async fn test_record_removed_when_offline_and_gameless() {
        let f = fixture();
        f.presence.client_connected("u1").unwrap();
        f.presence.joined_game("u1", key("g1"), "s1").await.unwrap();

        f.presence.client_disconnected("u1").unwrap();
        let record = f.presence.record("u1").await.unwrap().unwrap();
        assert!(!record.connected);
        assert_eq!(record.active_game, Some(key("g1")));

        f.presence.left_game("u1", key("g1"), "s1").unwrap();
        assert!(f.presence.record("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_count_and_dedup() {
        let f = fixture();
        assert_eq!(f.presence.joined_game("u1", key("g1"), "s1").await.unwrap(), 1);
        assert_eq!(f.presence.joined_game("u1", key("g1"), "s1").await.unwrap(), 1);
        assert_eq!(f.presence.joined_game("u1", key("g2"), "s2").await.unwrap(), 2);
        // Over the soft limit: counted and logged, not rejected.
        assert_eq!(f.presence.joined_game("u1", key("g3"), "s3").await.unwrap(), 3);

        f.presence.left_game("u1", key("g3"), "s3").unwrap();
        let sessions = f.presence.sessions("u1").await.unwrap();
        assert_eq!(
            sessions,
            vec![(key("g1"), "s1".to_string()), (key("g2"), "s2".to_string())]
        );
        let record = f.presence.record("u1").await.unwrap().unwrap();
        assert_eq!(record.active_game, Some(key("g2")));
    }

    #[tokio::test]
    async fn test_find_presence_in_request_order() {
        let f = fixture();
        f.directory
            .create_if_absent(NewGame::new(key("g1"), 4, owner()).confirmed())
            .await
            .unwrap();
        f.presence.client_connected("u2").unwrap();
        f.presence.joined_game("u1", key("g1"), "s1").await.unwrap();

        let results = f
            .presence
            .find_presence(
                vec!["u1".into(), "nobody".into(), "u2".into()],
                PresenceFilter::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            results,
            vec![
                FindPresenceResult {
                    online: true,
                    game_id: Some("g1".to_string())
                },
                FindPresenceResult::default(),
                FindPresenceResult {
                    online: true,
                    game_id: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_filters_suppress_game_but_not_online_flag() {
        let f = fixture();
        f.directory
            .create_if_absent(NewGame::new(key("g1"), 4, owner()))
            .await
            .unwrap();
        f.presence.joined_game("u1", key("g1"), "s1").await.unwrap();

        let confirmed = PresenceFilter {
            require_confirmed: true,
            ..Default::default()
        };
        let results = f
            .presence
            .find_presence(vec!["u1".into()], confirmed)
            .await
            .unwrap();
        assert!(results[0].online);
        assert_eq!(results[0].game_id, None);

        let mut update = GameUpdate::new(key("g1"));
        update.is_open = Some(false);
        f.directory.apply_update(update, owner()).await.unwrap();

        let results = f
            .presence
            .find_presence(vec!["u1".into()], confirmed)
            .await
            .unwrap();
        assert_eq!(results[0].game_id, Some("g1".to_string()));

        let open = PresenceFilter {
            require_open: true,
            ..Default::default()
        };
        let results = f
            .presence
            .find_presence(vec!["u1".into()], open)
            .await
            .unwrap();
        assert!(results[0].online);
        assert_eq!(results[0].game_id, None);
    }

    #[tokio::test]
    async fn test_connections_feed_client_total() {
        let f = fixture();
        f.presence.client_connected("u1").unwrap();
        f.presence.client_connected("u1").unwrap();
        f.presence.client_connected("u2").unwrap();
        f.presence.client_disconnected("u2").unwrap();

        // Round trip so every forwarded delta has been queued.
        f.presence.record("u1").await.unwrap();
        assert_eq!(f.feedback.snapshot().await.unwrap().connected_clients, 1);
    }
}
