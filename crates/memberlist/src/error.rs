use thiserror::Error;

/// Internal error type for the membership engine. Nothing reachable
/// from untrusted peer bytes should ever panic; message-handling paths log
/// and drop instead of propagating these — this type exists for the paths
/// that *do* need to propagate (config validation, local API misuse,
/// transport setup).
#[derive(Debug, Error)]
pub enum MemberError {
    #[error("invalid bind address: {0}")]
    InvalidBindAddress(String),
    #[error("invalid key length {0}, expected 16 or 32 bytes")]
    InvalidKeyLength(usize),
    #[error("keyring is empty")]
    EmptyKeyring,
    #[error("no such key installed")]
    UnknownKey,
    #[error("cannot remove the primary encryption key")]
    CannotRemovePrimaryKey,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("encryption error")]
    Crypto,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("no alive peer available")]
    NoAlivePeer,
    #[error("push/pull timed out")]
    PushPullTimeout,
}

pub type MemberResult<T> = Result<T, MemberError>;
