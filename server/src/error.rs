//! Error types shared by the directory components.

use shared::GameKey;
use thiserror::Error;

use crate::fleet::member::MemberKey;

pub type Result<T> = std::result::Result<T, DirectoryError>;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("game {0} already exists")]
    GameExists(GameKey),

    #[error("unknown fleet member {0}")]
    UnknownMember(MemberKey),

    #[error("fleet member {key} re-registered with server id {actual}, expected {expected}")]
    ServerIdMismatch {
        key: MemberKey,
        expected: String,
        actual: String,
    },

    #[error("invalid member state code {0}")]
    InvalidState(i32),

    /// The component's task queue is gone, usually during shutdown.
    #[error("{0} is no longer running")]
    ComponentClosed(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

impl DirectoryError {
    /// Conflicts are resolved deterministically and reported, never fatal.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DirectoryError::GameExists(_) | DirectoryError::ServerIdMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let exists = DirectoryError::GameExists(GameKey::new("lobby", "g1"));
        assert!(exists.is_conflict());
        assert_eq!(exists.to_string(), "game lobby/g1 already exists");

        let closed = DirectoryError::ComponentClosed("game directory");
        assert!(!closed.is_conflict());
        assert_eq!(closed.to_string(), "game directory is no longer running");
    }
}
