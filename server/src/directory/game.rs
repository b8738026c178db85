use shared::{GameKey, GameUpdate};
use std::collections::HashMap;
use tokio::time::Instant;

use crate::fleet::member::MemberRef;

/// Parameters for a game entering the directory.
#[derive(Debug, Clone)]
pub struct NewGame {
    pub key: GameKey,
    pub max_players: u32,
    pub owner: MemberRef,
    /// Keep the game listed for a grace period after its member closes it.
    pub preserve: bool,
    /// The owning member already reported the game as running.
    pub confirmed: bool,
}

impl NewGame {
    pub fn new(key: GameKey, max_players: u32, owner: MemberRef) -> Self {
        Self {
            key,
            max_players,
            owner,
            preserve: false,
            confirmed: false,
        }
    }

    pub fn preserved(mut self) -> Self {
        self.preserve = true;
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct GameRecord {
    pub key: GameKey,
    pub max_players: u32,
    /// `None` while the game is orphaned and waiting on the expiry list.
    pub owner: Option<MemberRef>,
    pub is_open: bool,
    pub is_visible: bool,
    pub created_on_member: bool,
    pub preserve: bool,
    pub player_count: u32,
    pub properties: HashMap<String, String>,
    pub orphaned_at: Option<Instant>,
}

impl GameRecord {
    pub fn new(game: NewGame) -> Self {
        Self {
            key: game.key,
            max_players: game.max_players,
            owner: Some(game.owner),
            is_open: true,
            is_visible: true,
            created_on_member: game.confirmed,
            preserve: game.preserve,
            player_count: 0,
            properties: HashMap::new(),
            orphaned_at: None,
        }
    }

    /// Builds a record from an update for a game the directory no longer knows.
    pub fn from_update(update: &GameUpdate, owner: MemberRef) -> Self {
        let mut record = Self::new(NewGame::new(
            update.key.clone(),
            update.max_players.unwrap_or(0),
            owner,
        ));
        record.apply(update);
        record
    }

    pub fn is_owned_by(&self, member: &MemberRef) -> bool {
        self.owner.as_ref() == Some(member)
    }

    pub fn is_orphaned(&self) -> bool {
        self.owner.is_none()
    }

    /// Merges the fields present in `update`. Any accepted update from the
    /// owner confirms the game exists on the member.
    pub fn apply(&mut self, update: &GameUpdate) {
        if let Some(max_players) = update.max_players {
            self.max_players = max_players;
        }
        if let Some(is_open) = update.is_open {
            self.is_open = is_open;
        }
        if let Some(is_visible) = update.is_visible {
            self.is_visible = is_visible;
        }
        if let Some(preserve) = update.preserve {
            self.preserve = preserve;
        }
        if let Some(player_count) = update.player_count {
            self.player_count = player_count;
        }
        for (name, value) in &update.properties {
            self.properties.insert(name.clone(), value.clone());
        }
        self.created_on_member = true;
    }

    pub fn orphan(&mut self, now: Instant) {
        self.owner = None;
        self.orphaned_at = Some(now);
    }

    pub fn reclaim(&mut self, owner: MemberRef) {
        self.owner = Some(owner);
        self.orphaned_at = None;
    }
}
