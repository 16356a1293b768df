use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    #[error("Invalid user id: {0:?}")]
    InvalidUid(String),

    #[error("Not a one-to-one topic: {0:?}")]
    NotP2P(String),

    #[error("Invalid access mode character: {0:?}")]
    InvalidAccessMode(char),
}
