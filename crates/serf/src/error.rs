use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerfError {
    #[error("invalid filter pattern: {0}")]
    InvalidFilter(#[from] regex::Error),
    #[error(transparent)]
    Member(#[from] memberlist::error::MemberError),
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("{0}")]
    Keyring(String),
    #[error("no such query outstanding")]
    UnknownQuery,
}

pub type SerfResult<T> = Result<T, SerfError>;
