//! Per-connection task of an attached fleet member.
//!
//! Game events from one member connection are processed here in arrival order
//! and forwarded to the game directory. The task also owns the member's
//! replication session: it counts replicated games, accepts the expected
//! count and enforces the finish-check deadline.

use log::{debug, info, warn};
use shared::{GameKey, GameUpdate, RemoveReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::member::MemberRef;
use super::replication::{
    ReplicaOutcome, ReplicationHooks, ReplicationOutcome, ReplicationPhase, ReplicationSession,
};
use crate::directory::{GameDirectoryHandle, NewGame};
use crate::error::{DirectoryError, Result};
use crate::timer::{schedule, TimerHandle, TimerToken};

const COMPONENT: &str = "fleet peer";

/// Replication progress of one attached connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatus {
    pub phase: ReplicationPhase,
    pub observed: Option<u32>,
    pub expected: Option<u32>,
}

#[derive(Debug)]
enum PeerCommand {
    GameCreated {
        key: GameKey,
        max_players: u32,
        preserve: bool,
    },
    GameUpdated(GameUpdate),
    GameRemoved {
        key: GameKey,
        reason: RemoveReason,
    },
    ExpectedGames(u32),
    Status(oneshot::Sender<PeerStatus>),
    Stop(oneshot::Sender<()>),
}

#[derive(Debug)]
enum PeerTimer {
    FinishCheck(TimerToken),
}

pub struct FleetPeer {
    member: MemberRef,
    session: ReplicationSession,
    finish_check: Option<TimerHandle>,
    hooks: Arc<dyn ReplicationHooks>,
    directory: GameDirectoryHandle,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    timer_rx: mpsc::UnboundedReceiver<PeerTimer>,
    // Keeps the timer channel open while no finish check is armed.
    _timer_tx: mpsc::UnboundedSender<PeerTimer>,
}

impl FleetPeer {
    /// Starts replication for a freshly attached connection of `member`.
    pub fn spawn(
        member: MemberRef,
        directory: GameDirectoryHandle,
        hooks: Arc<dyn ReplicationHooks>,
        finish_check: Duration,
    ) -> PeerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        hooks.replication_started(&member);
        let timer = schedule(finish_check, &timer_tx, PeerTimer::FinishCheck);

        let peer = FleetPeer {
            member: member.clone(),
            session: ReplicationSession::new(),
            finish_check: Some(timer),
            hooks,
            directory,
            commands: rx,
            timer_rx,
            _timer_tx: timer_tx,
        };
        tokio::spawn(peer.run());

        PeerHandle {
            member,
            commands: tx,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PeerCommand::Stop(reply)) => {
                        self.stop();
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(PeerTimer::FinishCheck(token)) = self.timer_rx.recv() => {
                    self.finish_check(token);
                }
            }
        }
        self.stop();
    }

    async fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::GameCreated {
                key,
                max_players,
                preserve,
            } => {
                let mut game = NewGame::new(key, max_players, self.member.clone()).confirmed();
                game.preserve = preserve;
                if let Err(e) = self.directory.create_if_absent(game).await {
                    debug!("Create from {} not applied: {}", self.member, e);
                }
            }

            PeerCommand::GameUpdated(update) => {
                let replica = update.replication;
                if let Err(e) = self.directory.post_update(update, self.member.clone()) {
                    warn!("Dropping update from {}: {}", self.member, e);
                }
                if replica {
                    self.record_replica();
                }
            }

            PeerCommand::GameRemoved { key, reason } => {
                if let Err(e) = self.directory.post_remove(key, self.member.clone(), reason) {
                    warn!("Dropping remove from {}: {}", self.member, e);
                }
            }

            PeerCommand::ExpectedGames(count) => {
                if self.session.expected_declared() {
                    debug!("{} declared its expected game count again", self.member);
                } else if self.session.declare_expected(count) {
                    self.finish(ReplicationOutcome::Natural);
                }
            }

            PeerCommand::Status(reply) => {
                let _ = reply.send(PeerStatus {
                    phase: self.session.phase(),
                    observed: self.session.observed(),
                    expected: self.session.expected(),
                });
            }

            PeerCommand::Stop(_) => {}
        }
    }

    fn record_replica(&mut self) {
        match self.session.record_replica() {
            ReplicaOutcome::Counted => {}
            ReplicaOutcome::Completed => self.finish(ReplicationOutcome::Natural),
            ReplicaOutcome::AfterCompletion => {
                warn!(
                    "Replicated game from {} arrived after replication completed",
                    self.member
                );
            }
            ReplicaOutcome::Ignored => {}
        }
    }

    fn finish_check(&mut self, token: TimerToken) {
        let current = self
            .finish_check
            .as_ref()
            .map(|timer| timer.matches(token))
            .unwrap_or(false);
        if !current {
            return;
        }
        self.finish_check = None;

        if let Some((observed, expected)) = self.session.force_complete() {
            warn!(
                "Replication of {} force-completed after timeout: observed {:?}, expected {:?}",
                self.member, observed, expected
            );
            self.hooks
                .replication_finished(&self.member, ReplicationOutcome::Forced);
        }
    }

    fn finish(&mut self, outcome: ReplicationOutcome) {
        if let Some(mut timer) = self.finish_check.take() {
            timer.cancel();
        }
        info!(
            "Replication of {} complete with {:?} games",
            self.member,
            self.session.observed()
        );
        self.hooks.replication_finished(&self.member, outcome);
    }

    fn stop(&mut self) {
        if let Some(mut timer) = self.finish_check.take() {
            timer.cancel();
        }
        if self.session.stop() {
            self.hooks.replication_stopped(&self.member);
        }
        debug!("Peer task of {} stopped", self.member);
    }
}

/// Sends the game events of one member connection to its peer task.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    member: MemberRef,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    pub fn member(&self) -> &MemberRef {
        &self.member
    }

    fn post(&self, command: PeerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }

    pub fn game_created(&self, key: GameKey, max_players: u32, preserve: bool) -> Result<()> {
        self.post(PeerCommand::GameCreated {
            key,
            max_players,
            preserve,
        })
    }

    pub fn game_updated(&self, update: GameUpdate) -> Result<()> {
        self.post(PeerCommand::GameUpdated(update))
    }

    pub fn game_removed(&self, key: GameKey, reason: RemoveReason) -> Result<()> {
        self.post(PeerCommand::GameRemoved { key, reason })
    }

    pub fn expected_games(&self, count: u32) -> Result<()> {
        self.post(PeerCommand::ExpectedGames(count))
    }

    pub async fn status(&self) -> Result<PeerStatus> {
        let (tx, rx) = oneshot::channel();
        self.post(PeerCommand::Status(tx))?;
        rx.await.map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }

    /// Tears the peer down and waits until its session is closed. An
    /// unfinished replication is reported as stopped before this returns.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        // Already gone if the task ended on its own.
        if self.post(PeerCommand::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }
}
