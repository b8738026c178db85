use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_LOAD_LEVEL: u8 = 9;

/// Load bucket reported by fleet members and consumed by the placement balancer.
///
/// Levels run from 0 (idle) to `MAX_LOAD_LEVEL` (saturated); out-of-range raw
/// values are clamped on construction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LoadLevel(u8);

impl LoadLevel {
    pub const LOWEST: LoadLevel = LoadLevel(0);
    pub const HIGHEST: LoadLevel = LoadLevel(MAX_LOAD_LEVEL);

    pub fn new(raw: u8) -> Self {
        Self(raw.min(MAX_LOAD_LEVEL))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Lifecycle state of a fleet member as declared by the member itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberState {
    Offline,
    Normal,
    OutOfRotation,
}

impl MemberState {
    pub fn code(self) -> i32 {
        match self {
            MemberState::Offline => 0,
            MemberState::Normal => 1,
            MemberState::OutOfRotation => 2,
        }
    }
}

impl TryFrom<i32> for MemberState {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(MemberState::Offline),
            1 => Ok(MemberState::Normal),
            2 => Ok(MemberState::OutOfRotation),
            other => Err(other),
        }
    }
}

/// Counters a fleet member reports with every load update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub raw_level: u8,
    pub peer_count: u32,
    pub game_count: u32,
}

/// Games are unique per lobby namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GameKey {
    pub lobby: String,
    pub game_id: String,
}

impl GameKey {
    pub fn new(lobby: impl Into<String>, game_id: impl Into<String>) -> Self {
        Self {
            lobby: lobby.into(),
            game_id: game_id.into(),
        }
    }
}

impl fmt::Display for GameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.lobby, self.game_id)
    }
}

/// Game state pushed by the owning fleet member.
///
/// `replication` marks updates sent while the member replays its game list
/// after (re)connecting. `reinitialize` asks the directory to recreate the
/// record if it no longer knows the game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameUpdate {
    pub key: GameKey,
    pub reinitialize: bool,
    pub replication: bool,
    pub max_players: Option<u32>,
    pub is_open: Option<bool>,
    pub is_visible: Option<bool>,
    pub preserve: Option<bool>,
    pub player_count: Option<u32>,
    pub properties: HashMap<String, String>,
}

impl GameUpdate {
    pub fn new(key: GameKey) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }
}

impl Default for GameKey {
    fn default() -> Self {
        GameKey::new("", "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveReason {
    /// The game ended normally on its fleet member.
    Closed,
    Failed,
    Evicted,
}

impl RemoveReason {
    pub fn is_graceful(self) -> bool {
        matches!(self, RemoveReason::Closed)
    }
}

/// Conditions under which a presence lookup still reports the user's game.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceFilter {
    pub require_confirmed: bool,
    pub require_visible: bool,
    pub require_open: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindPresenceResult {
    pub online: bool,
    pub game_id: Option<String>,
}

/// Fleet-wide totals published to stats subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub connected_clients: u32,
    pub total_players: u32,
    pub total_games: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Fleet member -> directory
    RegisterMember {
        version: u32,
        ports: Vec<u16>,
        server_id: String,
        capabilities: Vec<String>,
        state: i32,
        priority: u8,
        load: LoadReport,
    },
    UpdateMember {
        state: Option<i32>,
        load: LoadReport,
    },
    ExpectedGames {
        count: u32,
    },
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
    MemberHeartbeat,
    LeaveMember,

    // Front end -> directory
    ClientConnected {
        user_id: String,
    },
    ClientDisconnected {
        user_id: String,
    },
    ClientJoinedGame {
        user_id: String,
        key: GameKey,
        session_id: String,
    },
    ClientLeftGame {
        user_id: String,
        key: GameKey,
        session_id: String,
    },
    FindPresence {
        request_id: u32,
        user_ids: Vec<String>,
        filter: PresenceFilter,
    },
    SubscribeStats,
    UnsubscribeStats,

    // Directory -> peers
    Registered {
        reused: bool,
    },
    Rejected {
        reason: String,
    },
    PresenceResult {
        request_id: u32,
        results: Vec<FindPresenceResult>,
    },
    Stats(StatsSnapshot),
    Disconnected {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_level_clamps() {
        assert_eq!(LoadLevel::new(3).value(), 3);
        assert_eq!(LoadLevel::new(200), LoadLevel::HIGHEST);
        assert!(LoadLevel::new(2) < LoadLevel::new(5));
    }

    #[test]
    fn test_member_state_codes() {
        for state in [
            MemberState::Offline,
            MemberState::Normal,
            MemberState::OutOfRotation,
        ] {
            assert_eq!(MemberState::try_from(state.code()), Ok(state));
        }
        assert_eq!(MemberState::try_from(7), Err(7));
        assert_eq!(MemberState::try_from(-1), Err(-1));
    }

    #[test]
    fn test_only_closed_is_graceful() {
        assert!(RemoveReason::Closed.is_graceful());
        assert!(!RemoveReason::Failed.is_graceful());
        assert!(!RemoveReason::Evicted.is_graceful());
    }

    #[test]
    fn test_packet_serialization_register() {
        let packet = Packet::RegisterMember {
            version: PROTOCOL_VERSION,
            ports: vec![5055, 5056],
            server_id: "gs-1".to_string(),
            capabilities: vec!["udp".to_string()],
            state: MemberState::Normal.code(),
            priority: 2,
            load: LoadReport {
                raw_level: 4,
                peer_count: 120,
                game_count: 7,
            },
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::RegisterMember {
                ports,
                server_id,
                state,
                load,
                ..
            } => {
                assert_eq!(ports, vec![5055, 5056]);
                assert_eq!(server_id, "gs-1");
                assert_eq!(state, 1);
                assert_eq!(load.peer_count, 120);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_game_update() {
        let mut update = GameUpdate::new(GameKey::new("default", "g1"));
        update.replication = true;
        update.player_count = Some(3);
        update
            .properties
            .insert("map".to_string(), "harbor".to_string());

        let serialized = bincode::serialize(&Packet::GameUpdated(update.clone())).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::GameUpdated(decoded) => assert_eq!(decoded, update),
            _ => panic!("Wrong packet type after deserialization"),
        }
    }
}
