//! Fleet-wide totals and throttled stats publishing.
//!
//! Members report absolute peer and game counts; the aggregator turns each
//! report into a delta against that member's last contribution and applies it
//! to the running totals. When a member is removed its last contribution is
//! subtracted, so totals are never recomputed from scratch.
//!
//! Publishing is debounced: the first change after a broadcast arms a timer
//! (only when someone is subscribed) and every later change inside the same
//! interval rides along with that single broadcast.

use log::{debug, warn};
use shared::StatsSnapshot;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::config::DirectoryConfig;
use crate::error::{DirectoryError, Result};
use crate::fleet::member::MemberRef;
use crate::timer::{schedule, TimerHandle, TimerToken};

const COMPONENT: &str = "load feedback aggregator";

pub type SubscriberId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Contribution {
    players: u32,
    games: u32,
}

#[derive(Debug)]
enum FeedbackCommand {
    MemberReport {
        member: MemberRef,
        players: u32,
        games: u32,
    },
    MemberRemoved {
        member: MemberRef,
    },
    ClientDelta(i64),
    Subscribe {
        reply: oneshot::Sender<(SubscriberId, mpsc::UnboundedReceiver<StatsSnapshot>)>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    Snapshot {
        reply: oneshot::Sender<StatsSnapshot>,
    },
}

#[derive(Debug)]
enum FeedbackTimer {
    PublishDue(TimerToken),
}

pub struct LoadFeedbackAggregator {
    contributions: HashMap<MemberRef, Contribution>,
    connected_clients: i64,
    total_players: i64,
    total_games: i64,
    subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<StatsSnapshot>>,
    next_subscriber: SubscriberId,
    pending_publish: Option<TimerHandle>,
    publish_interval: Duration,
    commands: mpsc::UnboundedReceiver<FeedbackCommand>,
    timer_tx: mpsc::UnboundedSender<FeedbackTimer>,
    timer_rx: mpsc::UnboundedReceiver<FeedbackTimer>,
}

impl LoadFeedbackAggregator {
    pub fn spawn(config: &DirectoryConfig) -> LoadFeedbackHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let aggregator = LoadFeedbackAggregator {
            contributions: HashMap::new(),
            connected_clients: 0,
            total_players: 0,
            total_games: 0,
            subscribers: HashMap::new(),
            next_subscriber: 1,
            pending_publish: None,
            publish_interval: config.stats_publish_interval(),
            commands: rx,
            timer_tx,
            timer_rx,
        };
        tokio::spawn(aggregator.run());

        LoadFeedbackHandle { commands: tx }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(FeedbackTimer::PublishDue(token)) = self.timer_rx.recv() => {
                    self.publish(token);
                }
            }
        }
        debug!("Load feedback aggregator stopped");
    }

    fn handle_command(&mut self, command: FeedbackCommand) {
        match command {
            FeedbackCommand::MemberReport {
                member,
                players,
                games,
            } => {
                let previous = self
                    .contributions
                    .insert(member, Contribution { players, games })
                    .unwrap_or_default();
                let changed = self.apply_delta(
                    0,
                    players as i64 - previous.players as i64,
                    games as i64 - previous.games as i64,
                );
                if changed {
                    self.schedule_publish();
                }
            }

            FeedbackCommand::MemberRemoved { member } => {
                if let Some(last) = self.contributions.remove(&member) {
                    debug!(
                        "Subtracting {} players and {} games of removed member {}",
                        last.players, last.games, member
                    );
                    if self.apply_delta(0, -(last.players as i64), -(last.games as i64)) {
                        self.schedule_publish();
                    }
                }
            }

            FeedbackCommand::ClientDelta(delta) => {
                if self.apply_delta(delta, 0, 0) {
                    self.schedule_publish();
                }
            }

            FeedbackCommand::Subscribe { reply } => {
                let id = self.next_subscriber;
                self.next_subscriber += 1;
                let (tx, rx) = mpsc::unbounded_channel();
                self.subscribers.insert(id, tx);
                debug!("Stats subscriber {} added", id);
                let _ = reply.send((id, rx));
            }

            FeedbackCommand::Unsubscribe { id } => {
                if self.subscribers.remove(&id).is_some() {
                    debug!("Stats subscriber {} removed", id);
                }
                if self.subscribers.is_empty() {
                    if let Some(mut timer) = self.pending_publish.take() {
                        timer.cancel();
                    }
                }
            }

            FeedbackCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Applies signed deltas to the totals. Returns true if anything changed.
    fn apply_delta(&mut self, clients: i64, players: i64, games: i64) -> bool {
        if clients == 0 && players == 0 && games == 0 {
            return false;
        }
        self.connected_clients = clamp_total("connected clients", self.connected_clients + clients);
        self.total_players = clamp_total("players", self.total_players + players);
        self.total_games = clamp_total("games", self.total_games + games);
        true
    }

    fn schedule_publish(&mut self) {
        if self.pending_publish.is_some() || self.subscribers.is_empty() {
            return;
        }
        self.pending_publish = Some(schedule(
            self.publish_interval,
            &self.timer_tx,
            FeedbackTimer::PublishDue,
        ));
    }

    fn publish(&mut self, token: TimerToken) {
        match &self.pending_publish {
            Some(timer) if timer.matches(token) => {}
            _ => return,
        }
        self.pending_publish = None;

        let snapshot = self.snapshot();
        self.subscribers.retain(|id, subscriber| {
            let open = subscriber.send(snapshot).is_ok();
            if !open {
                debug!("Dropping closed stats subscriber {}", id);
            }
            open
        });
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connected_clients: to_u32(self.connected_clients),
            total_players: to_u32(self.total_players),
            total_games: to_u32(self.total_games),
        }
    }
}

fn clamp_total(name: &str, value: i64) -> i64 {
    if value < 0 {
        warn!("Aggregate {} went negative ({}), clamping to 0", name, value);
        0
    } else {
        value
    }
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone)]
pub struct LoadFeedbackHandle {
    commands: mpsc::UnboundedSender<FeedbackCommand>,
}

impl LoadFeedbackHandle {
    fn post(&self, command: FeedbackCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }

    /// Records the absolute counts last reported by `member`.
    pub fn member_report(&self, member: MemberRef, players: u32, games: u32) -> Result<()> {
        self.post(FeedbackCommand::MemberReport {
            member,
            players,
            games,
        })
    }

    pub fn member_removed(&self, member: MemberRef) -> Result<()> {
        self.post(FeedbackCommand::MemberRemoved { member })
    }

    pub fn client_connected(&self) -> Result<()> {
        self.post(FeedbackCommand::ClientDelta(1))
    }

    pub fn client_disconnected(&self) -> Result<()> {
        self.post(FeedbackCommand::ClientDelta(-1))
    }

    pub async fn subscribe(
        &self,
    ) -> Result<(SubscriberId, mpsc::UnboundedReceiver<StatsSnapshot>)> {
        let (tx, rx) = oneshot::channel();
        self.post(FeedbackCommand::Subscribe { reply: tx })?;
        rx.await.map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> Result<()> {
        self.post(FeedbackCommand::Unsubscribe { id })
    }

    pub async fn snapshot(&self) -> Result<StatsSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.post(FeedbackCommand::Snapshot { reply: tx })?;
        rx.await.map_err(|_| DirectoryError::ComponentClosed(COMPONENT))
    }
}
