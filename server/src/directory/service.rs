//! The game directory task and the handle other components talk to it through.
//!
//! Every mutation runs on the directory task in arrival order. The game table
//! is additionally shared behind an `RwLock` so listings can be served without
//! a round trip through the queue; the task only holds the write lock for the
//! duration of a single table operation.

use log::{debug, error, info, warn};
use shared::{GameKey, GameUpdate, RemoveReason};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::exclusion::ExclusionList;
use super::game::{GameRecord, NewGame};
use super::table::{GameTable, RemoveOutcome, SweepReport, UpdateOutcome};
use crate::config::DirectoryConfig;
use crate::error::{DirectoryError, Result};
use crate::fleet::member::MemberRef;
use crate::fleet::replication::{ReplicationHooks, ReplicationOutcome};
use crate::timer::{schedule, TimerToken};

const COMPONENT: &str = "game directory";

/// What the directory knows about a member's replication handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    Replicating,
    Finished(ReplicationOutcome),
    /// The member went away mid-handshake; its game list is partial.
    Stopped,
}

/// Games released by `member_offline` / `member_removed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub orphaned: usize,
    pub deleted: usize,
}

#[derive(Debug)]
enum DirectoryCommand {
    Create {
        game: NewGame,
        reply: oneshot::Sender<Result<()>>,
    },
    Update {
        update: GameUpdate,
        owner: MemberRef,
        reply: Option<oneshot::Sender<UpdateOutcome>>,
    },
    Remove {
        key: GameKey,
        owner: MemberRef,
        reason: RemoveReason,
        reply: Option<oneshot::Sender<RemoveOutcome>>,
    },
    RemoveLobby {
        lobby: String,
        reply: oneshot::Sender<usize>,
    },
    MemberOffline {
        member: MemberRef,
        reply: Option<oneshot::Sender<ReleaseSummary>>,
    },
    MemberRemoved {
        member: MemberRef,
        reply: Option<oneshot::Sender<ReleaseSummary>>,
    },
    Exclude {
        user_id: String,
        reply: Option<oneshot::Sender<bool>>,
    },
    IsExcluded {
        user_id: String,
        reply: oneshot::Sender<bool>,
    },
    Replication {
        member: MemberRef,
        status: ReplicationStatus,
    },
    ReplicationStatus {
        member: MemberRef,
        reply: oneshot::Sender<Option<ReplicationStatus>>,
    },
    Sweep {
        reply: oneshot::Sender<SweepReport>,
    },
}

/// Messages the directory schedules for itself.
#[derive(Debug)]
enum DirectoryTimer {
    ExclusionExpired { user_id: String, token: TimerToken },
}

pub struct GameDirectory {
    table: Arc<RwLock<GameTable>>,
    exclusions: ExclusionList,
    replication: HashMap<MemberRef, ReplicationStatus>,
    expiry_grace: Duration,
    sweep_interval: Duration,
    ban_expiry: Duration,
    commands: mpsc::UnboundedReceiver<DirectoryCommand>,
    timer_tx: mpsc::UnboundedSender<DirectoryTimer>,
    timer_rx: mpsc::UnboundedReceiver<DirectoryTimer>,
}

impl GameDirectory {
    /// Starts the directory task and returns a handle to it.
    pub fn spawn(config: &DirectoryConfig) -> GameDirectoryHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let table = Arc::new(RwLock::new(GameTable::new()));

        let directory = GameDirectory {
            table: Arc::clone(&table),
            exclusions: ExclusionList::new(),
            replication: HashMap::new(),
            expiry_grace: config.expiry_grace(),
            sweep_interval: config.expiry_sweep_interval(),
            ban_expiry: config.ban_expiry(),
            commands: rx,
            timer_tx,
            timer_rx,
        };
        tokio::spawn(directory.run());

        GameDirectoryHandle {
            commands: tx,
            table,
        }
    }

    async fn run(mut self) {
        let mut sweep = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(timer) = self.timer_rx.recv() => self.handle_timer(timer),
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }

        debug!("Game directory stopped");
    }

    async fn handle_command(&mut self, command: DirectoryCommand) {
        match command {
            DirectoryCommand::Create { game, reply } => {
                let result = self.table.write().await.create_if_absent(game);
                if let Err(e) = &result {
                    warn!("Create rejected: {}", e);
                }
                let _ = reply.send(result);
            }

            DirectoryCommand::Update {
                update,
                owner,
                reply,
            } => {
                let outcome = self.table.write().await.apply_update(&update, &owner);
                respond(reply, outcome);
            }

            DirectoryCommand::Remove {
                key,
                owner,
                reason,
                reply,
            } => {
                let outcome = self
                    .table
                    .write()
                    .await
                    .remove(&key, &owner, reason, Instant::now());
                respond(reply, outcome);
            }

            DirectoryCommand::RemoveLobby { lobby, reply } => {
                let removed = self.table.write().await.remove_lobby(&lobby);
                info!("Lobby {} torn down, {} games removed", lobby, removed);
                let _ = reply.send(removed);
            }

            DirectoryCommand::MemberOffline { member, reply } => {
                let summary = self.release(&member, false).await;
                info!(
                    "Member {} went offline, {} games waiting for reclaim",
                    member, summary.orphaned
                );
                respond(reply, summary);
            }

            DirectoryCommand::MemberRemoved { member, reply } => {
                let summary = self.release(&member, true).await;
                self.replication.remove(&member);
                info!(
                    "Member {} removed: {} games preserved, {} deleted",
                    member, summary.orphaned, summary.deleted
                );
                respond(reply, summary);
            }

            DirectoryCommand::Exclude { user_id, reply } => {
                let delay = self.ban_expiry;
                let timers = &self.timer_tx;
                let expired_user = user_id.clone();
                let added = self.exclusions.exclude(&user_id, || {
                    schedule(delay, timers, move |token| DirectoryTimer::ExclusionExpired {
                        user_id: expired_user,
                        token,
                    })
                });
                if added {
                    info!("Excluded {} for {:?}", user_id, delay);
                }
                respond(reply, added);
            }

            DirectoryCommand::IsExcluded { user_id, reply } => {
                let _ = reply.send(self.exclusions.is_excluded(&user_id));
            }

            DirectoryCommand::Replication { member, status } => {
                match status {
                    ReplicationStatus::Replicating => {
                        debug!("Replication started for {}", member)
                    }
                    ReplicationStatus::Finished(outcome) => {
                        info!("Replication of {} finished ({})", member, outcome)
                    }
                    ReplicationStatus::Stopped => {
                        info!("Replication of {} stopped, game list is partial", member)
                    }
                }
                self.replication.insert(member, status);
            }

            DirectoryCommand::ReplicationStatus { member, reply } => {
                let _ = reply.send(self.replication.get(&member).copied());
            }

            DirectoryCommand::Sweep { reply } => {
                let report = self.sweep().await;
                let _ = reply.send(report);
            }
        }
    }

    fn handle_timer(&mut self, timer: DirectoryTimer) {
        match timer {
            DirectoryTimer::ExclusionExpired { user_id, token } => {
                if self.exclusions.expire(&user_id, token) {
                    info!("Exclusion of {} expired", user_id);
                }
            }
        }
    }

    async fn release(&mut self, member: &MemberRef, delete_unpreserved: bool) -> ReleaseSummary {
        let (orphaned, deleted) = self.table.write().await.release_member(
            member,
            delete_unpreserved,
            Instant::now(),
        );
        ReleaseSummary { orphaned, deleted }
    }

    async fn sweep(&mut self) -> SweepReport {
        let report = self
            .table
            .write()
            .await
            .sweep(Instant::now(), self.expiry_grace);

        for key in &report.expired {
            info!("Preserved game {} expired", key);
        }
        if !report.reclaimed.is_empty() {
            debug!("{} reclaimed games left the expiry list", report.reclaimed.len());
        }
        report
    }
}

fn respond<T>(reply: Option<oneshot::Sender<T>>, value: T) {
    if let Some(reply) = reply {
        let _ = reply.send(value);
    }
}

/// Cloneable entry point to the game directory.
#[derive(Debug, Clone)]
pub struct GameDirectoryHandle {
    commands: mpsc::UnboundedSender<DirectoryCommand>,
    table: Arc<RwLock<GameTable>>,
}

impl GameDirectoryHandle {
    fn post(&self, command: DirectoryCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DirectoryCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx))?;
        rx.await.map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }

    /// Inserts `game` unless its key is taken. The first writer wins.
    pub async fn create_if_absent(&self, game: NewGame) -> Result<()> {
        self.request(|reply| DirectoryCommand::Create { game, reply })
            .await?
    }

    pub async fn apply_update(&self, update: GameUpdate, owner: MemberRef) -> Result<UpdateOutcome> {
        self.request(|reply| DirectoryCommand::Update {
            update,
            owner,
            reply: Some(reply),
        })
        .await
    }

    /// Queues an update without waiting for its outcome.
    pub fn post_update(&self, update: GameUpdate, owner: MemberRef) -> Result<()> {
        self.post(DirectoryCommand::Update {
            update,
            owner,
            reply: None,
        })
    }

    pub async fn remove(
        &self,
        key: GameKey,
        owner: MemberRef,
        reason: RemoveReason,
    ) -> Result<RemoveOutcome> {
        self.request(|reply| DirectoryCommand::Remove {
            key,
            owner,
            reason,
            reply: Some(reply),
        })
        .await
    }

    pub fn post_remove(&self, key: GameKey, owner: MemberRef, reason: RemoveReason) -> Result<()> {
        self.post(DirectoryCommand::Remove {
            key,
            owner,
            reason,
            reply: None,
        })
    }

    pub async fn remove_lobby(&self, lobby: impl Into<String>) -> Result<usize> {
        let lobby = lobby.into();
        self.request(|reply| DirectoryCommand::RemoveLobby { lobby, reply })
            .await
    }

    /// Moves every game of `member` onto the expiry list.
    pub fn member_offline(&self, member: MemberRef) -> Result<()> {
        self.post(DirectoryCommand::MemberOffline {
            member,
            reply: None,
        })
    }

    /// Preserves the member's preserved games as orphans and deletes the rest.
    pub fn member_removed(&self, member: MemberRef) -> Result<()> {
        self.post(DirectoryCommand::MemberRemoved {
            member,
            reply: None,
        })
    }

    pub async fn release_member(&self, member: MemberRef) -> Result<ReleaseSummary> {
        self.request(|reply| DirectoryCommand::MemberRemoved {
            member,
            reply: Some(reply),
        })
        .await
    }

    /// Bars `user_id` until the ban auto-expiry elapses. Returns false if the
    /// user was already excluded; the original expiry is kept.
    pub async fn exclude_actor(&self, user_id: impl Into<String>) -> Result<bool> {
        let user_id = user_id.into();
        self.request(|reply| DirectoryCommand::Exclude {
            user_id,
            reply: Some(reply),
        })
        .await
    }

    pub async fn is_excluded(&self, user_id: impl Into<String>) -> Result<bool> {
        let user_id = user_id.into();
        self.request(|reply| DirectoryCommand::IsExcluded { user_id, reply })
            .await
    }

    pub async fn replication_status(&self, member: MemberRef) -> Result<Option<ReplicationStatus>> {
        self.request(|reply| DirectoryCommand::ReplicationStatus { member, reply })
            .await
    }

    /// Runs an expiry sweep now instead of waiting for the next interval.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.request(|reply| DirectoryCommand::Sweep { reply }).await
    }

    pub async fn get_game(&self, key: &GameKey) -> Option<GameRecord> {
        self.table.read().await.get(key).cloned()
    }

    pub async fn list_games(&self, lobby: &str) -> Vec<GameRecord> {
        self.table.read().await.list(lobby)
    }

    pub async fn game_count(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn games_owned_by(&self, member: &MemberRef) -> Vec<GameKey> {
        self.table.read().await.owned_by(member)
    }

    fn notify(&self, member: &MemberRef, status: ReplicationStatus) {
        if let Err(e) = self.post(DirectoryCommand::Replication {
            member: member.clone(),
            status,
        }) {
            error!("Failed to report replication of {}: {}", member, e);
        }
    }
}

impl ReplicationHooks for GameDirectoryHandle {
    fn replication_started(&self, member: &MemberRef) {
        self.notify(member, ReplicationStatus::Replicating);
    }

    fn replication_finished(&self, member: &MemberRef, outcome: ReplicationOutcome) {
        self.notify(member, ReplicationStatus::Finished(outcome));
    }

    fn replication_stopped(&self, member: &MemberRef) {
        self.notify(member, ReplicationStatus::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::member::MemberKey;
    use tokio_test::{assert_err, assert_ok};

    fn member(name: &str) -> MemberRef {
        MemberRef::new(MemberKey::new(name), "s1")
    }

    fn key(id: &str) -> GameKey {
        GameKey::new("lobby", id)
    }

    fn config() -> DirectoryConfig {
        DirectoryConfig {
            expiry_grace_minutes: 1,
            expiry_sweep_minutes: 1,
            token_lifetime_secs: 60,
            ban_expiry_multiplier: 2,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_conflict_is_reported() {
        let directory = GameDirectory::spawn(&config());

        assert_ok!(
            directory
                .create_if_absent(NewGame::new(key("g1"), 4, member("m1")))
                .await
        );
        let err = assert_err!(
            directory
                .create_if_absent(NewGame::new(key("g1"), 4, member("m2")))
                .await
        );
        assert!(err.is_conflict());
        assert_eq!(directory.game_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserved_game_expires_after_grace() {
        let directory = GameDirectory::spawn(&config());
        let owner = member("m1");
        directory
            .create_if_absent(NewGame::new(key("g1"), 4, owner.clone()).preserved())
            .await
            .unwrap();

        let outcome = directory
            .remove(key("g1"), owner, RemoveReason::Closed)
            .await
            .unwrap();
        assert_eq!(outcome, RemoveOutcome::Preserved);
        assert_eq!(directory.list_games("lobby").await.len(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(directory.get_game(&key("g1")).await.is_some());

        // Grace ends at 60s, so the next sweep deletes it.
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert!(directory.get_game(&key("g1")).await.is_none());
        assert!(directory.list_games("lobby").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusion_expires() {
        let directory = GameDirectory::spawn(&config());

        assert!(directory.exclude_actor("u1").await.unwrap());
        assert!(directory.is_excluded("u1").await.unwrap());

        tokio::time::sleep(Duration::from_secs(60)).await;
        // Re-excluding keeps the original timer.
        assert!(!directory.exclude_actor("u1").await.unwrap());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!directory.is_excluded("u1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_offline_then_reclaim() {
        let directory = GameDirectory::spawn(&config());
        let owner = member("m1");
        directory
            .create_if_absent(NewGame::new(key("g1"), 4, owner.clone()))
            .await
            .unwrap();

        directory.member_offline(owner.clone()).unwrap();
        // Round trip through the queue so the offline command has run.
        assert!(!directory.is_excluded("nobody").await.unwrap());
        assert!(directory.games_owned_by(&owner).await.is_empty());
        // Offline games stay listed while they wait for the member.
        assert!(directory.get_game(&key("g1")).await.unwrap().is_orphaned());

        let mut update = GameUpdate::new(key("g1"));
        update.replication = true;
        let outcome = directory.apply_update(update, owner.clone()).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Reclaimed);

        let report = directory.sweep_now().await.unwrap();
        assert_eq!(report.reclaimed, vec![key("g1")]);
        assert_eq!(directory.games_owned_by(&owner).await, vec![key("g1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_removed_keeps_only_preserved() {
        let directory = GameDirectory::spawn(&config());
        let owner = member("m1");
        directory
            .create_if_absent(NewGame::new(key("keep"), 4, owner.clone()).preserved())
            .await
            .unwrap();
        directory
            .create_if_absent(NewGame::new(key("drop"), 4, owner.clone()))
            .await
            .unwrap();

        let summary = directory.release_member(owner).await.unwrap();
        assert_eq!(summary, ReleaseSummary { orphaned: 1, deleted: 1 });
        assert!(directory.get_game(&key("keep")).await.is_some());
        assert!(directory.get_game(&key("drop")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replication_hooks_update_status() {
        let directory = GameDirectory::spawn(&config());
        let owner = member("m1");

        assert_eq!(directory.replication_status(owner.clone()).await.unwrap(), None);
        directory.replication_started(&owner);
        assert_eq!(
            directory.replication_status(owner.clone()).await.unwrap(),
            Some(ReplicationStatus::Replicating)
        );
        directory.replication_finished(&owner, ReplicationOutcome::Forced);
        assert_eq!(
            directory.replication_status(owner.clone()).await.unwrap(),
            Some(ReplicationStatus::Finished(ReplicationOutcome::Forced))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_lobby() {
        let directory = GameDirectory::spawn(&config());
        for id in ["a", "b"] {
            directory
                .create_if_absent(NewGame::new(key(id), 4, member("m1")))
                .await
                .unwrap();
        }
        assert_eq!(directory.remove_lobby("lobby").await.unwrap(), 2);
        assert_eq!(directory.game_count().await, 0);
    }
}
