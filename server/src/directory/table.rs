//! The authoritative map of active games plus the expiry list of orphans.
//!
//! The table is plain synchronous state. The directory task mutates it under a
//! short write lock; lobby queries read it directly under a read lock.

use log::{debug, info};
use shared::{GameKey, GameUpdate, RemoveReason};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use super::expiry::ExpiryList;
use super::game::{GameRecord, NewGame};
use crate::error::{DirectoryError, Result};
use crate::fleet::member::MemberRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The game was unknown and recreated from a reinitialize update.
    Recreated,
    /// An orphaned game was taken back by a replicating member.
    Reclaimed,
    IgnoredUnknown,
    IgnoredStaleOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Kept in listings without an owner until the grace period ends.
    Preserved,
    IgnoredUnknown,
    IgnoredStaleOwner,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys dropped from the expiry list because their game has an owner again.
    pub reclaimed: Vec<GameKey>,
    /// Games deleted because their grace period ran out.
    pub expired: Vec<GameKey>,
}

#[derive(Debug, Default)]
pub struct GameTable {
    games: HashMap<GameKey, GameRecord>,
    /// Keys of the games each member currently owns. Orphans are in no set.
    by_owner: HashMap<MemberRef, HashSet<GameKey>>,
    expiry: ExpiryList<GameKey>,
}

fn index_owner(
    index: &mut HashMap<MemberRef, HashSet<GameKey>>,
    owner: &MemberRef,
    key: &GameKey,
) {
    index.entry(owner.clone()).or_default().insert(key.clone());
}

fn unindex_owner(
    index: &mut HashMap<MemberRef, HashSet<GameKey>>,
    owner: &MemberRef,
    key: &GameKey,
) {
    if let Some(keys) = index.get_mut(owner) {
        keys.remove(key);
        if keys.is_empty() {
            index.remove(owner);
        }
    }
}

impl GameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &GameKey) -> Option<&GameRecord> {
        self.games.get(key)
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    pub fn expiry_len(&self) -> usize {
        self.expiry.len()
    }

    /// Visible games of `lobby`, including preserved orphans, ordered by id.
    pub fn list(&self, lobby: &str) -> Vec<GameRecord> {
        let mut games: Vec<GameRecord> = self
            .games
            .values()
            .filter(|game| game.key.lobby == lobby && game.is_visible)
            .cloned()
            .collect();
        games.sort_by(|a, b| a.key.game_id.cmp(&b.key.game_id));
        games
    }

    pub fn owned_by(&self, member: &MemberRef) -> Vec<GameKey> {
        let mut keys: Vec<GameKey> = self
            .by_owner
            .get(member)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// First writer wins; a second create for the same key is a conflict.
    pub fn create_if_absent(&mut self, game: NewGame) -> Result<()> {
        if self.games.contains_key(&game.key) {
            return Err(DirectoryError::GameExists(game.key));
        }
        info!("Game {} created on {}", game.key, game.owner);
        index_owner(&mut self.by_owner, &game.owner, &game.key);
        self.games.insert(game.key.clone(), GameRecord::new(game));
        Ok(())
    }

    pub fn apply_update(&mut self, update: &GameUpdate, owner: &MemberRef) -> UpdateOutcome {
        let Some(record) = self.games.get_mut(&update.key) else {
            if update.reinitialize {
                info!("Game {} recreated from {}", update.key, owner);
                index_owner(&mut self.by_owner, owner, &update.key);
                self.games.insert(
                    update.key.clone(),
                    GameRecord::from_update(update, owner.clone()),
                );
                return UpdateOutcome::Recreated;
            }
            debug!("Ignoring update for unknown game {} from {}", update.key, owner);
            return UpdateOutcome::IgnoredUnknown;
        };

        if record.is_owned_by(owner) {
            record.apply(update);
            return UpdateOutcome::Updated;
        }

        if record.is_orphaned() && (update.reinitialize || update.replication) {
            info!("Game {} reclaimed by {}", update.key, owner);
            record.reclaim(owner.clone());
            index_owner(&mut self.by_owner, owner, &update.key);
            record.apply(update);
            return UpdateOutcome::Reclaimed;
        }

        debug!(
            "Ignoring stale update for {} from {} (owner {:?})",
            update.key, owner, record.owner
        );
        UpdateOutcome::IgnoredStaleOwner
    }

    pub fn remove(
        &mut self,
        key: &GameKey,
        owner: &MemberRef,
        reason: RemoveReason,
        now: Instant,
    ) -> RemoveOutcome {
        let Some(record) = self.games.get_mut(key) else {
            debug!("Ignoring remove for unknown game {} from {}", key, owner);
            return RemoveOutcome::IgnoredUnknown;
        };

        if !record.is_owned_by(owner) {
            debug!("Ignoring stale remove for {} from {}", key, owner);
            return RemoveOutcome::IgnoredStaleOwner;
        }

        if reason.is_graceful() && record.preserve {
            record.orphan(now);
            unindex_owner(&mut self.by_owner, owner, key);
            self.expiry.push_back(key.clone(), now);
            debug!("Game {} preserved in listings after close", key);
            return RemoveOutcome::Preserved;
        }

        self.delete(key);
        info!("Game {} removed ({:?})", key, reason);
        RemoveOutcome::Removed
    }

    /// Orphans the games of `member`. Preserved games always go to the expiry
    /// list; the rest are deleted when `delete_unpreserved` is set.
    ///
    /// Returns `(orphaned, deleted)` counts.
    pub fn release_member(
        &mut self,
        member: &MemberRef,
        delete_unpreserved: bool,
        now: Instant,
    ) -> (usize, usize) {
        let keys = self.by_owner.remove(member).unwrap_or_default();
        let mut orphaned = 0;
        let mut deleted = 0;

        for key in keys {
            let preserve = self.games.get(&key).map(|g| g.preserve).unwrap_or(false);
            if delete_unpreserved && !preserve {
                self.delete(&key);
                deleted += 1;
            } else if let Some(record) = self.games.get_mut(&key) {
                record.orphan(now);
                self.expiry.push_back(key, now);
                orphaned += 1;
            }
        }

        (orphaned, deleted)
    }

    pub fn remove_lobby(&mut self, lobby: &str) -> usize {
        let keys: Vec<GameKey> = self
            .games
            .keys()
            .filter(|key| key.lobby == lobby)
            .cloned()
            .collect();
        for key in &keys {
            self.delete(key);
        }
        keys.len()
    }

    /// Walks the expiry list oldest first, stopping at the first orphan whose
    /// grace period has not elapsed yet.
    pub fn sweep(&mut self, now: Instant, grace: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        while let Some((key, since)) = self.expiry.front().map(|(k, s)| (k.clone(), s)) {
            match self.games.get(&key) {
                None => {
                    self.expiry.remove(&key);
                }
                Some(record) if !record.is_orphaned() => {
                    self.expiry.remove(&key);
                    report.reclaimed.push(key);
                }
                Some(_) => {
                    if now.saturating_duration_since(since) < grace {
                        break;
                    }
                    self.delete(&key);
                    report.expired.push(key);
                }
            }
        }

        report
    }

    fn delete(&mut self, key: &GameKey) {
        if let Some(owner) = self.games.remove(key).and_then(|game| game.owner) {
            unindex_owner(&mut self.by_owner, &owner, key);
        }
        self.expiry.remove(key);
    }
}
