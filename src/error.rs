use crate::game::GameId;
use thiserror::Error;

/// Precondition failures surfaced to callers. Absent data is never an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unknown game: {0}")]
    UnknownGame(String),

    #[error("collection not found: {0}")]
    MissingCollection(String),

    #[error("{} is not the collection's game ({})", .game.display_name(), .expected.display_name())]
    GameMismatch { game: GameId, expected: GameId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_subject() {
        assert_eq!(
            EngineError::UnknownGame("eu5".to_string()).to_string(),
            "unknown game: eu5"
        );
        assert_eq!(
            EngineError::GameMismatch {
                game: GameId::Stellaris,
                expected: GameId::Imperator,
            }
            .to_string(),
            "Stellaris is not the collection's game (Imperator: Rome)"
        );
    }
}
