//! Taxonomy of externally-visible error codes. Internal crates raise
//! their own `thiserror` enums; at the RPC/CLI boundary those get mapped down
//! to one of these codes plus a human message, separating "what kind of
//! failure" from "what happened".
#![allow(clippy::upper_case_acronyms)]
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

pub type ClusterResult<T> = Result<T, ClusterError>;

pub fn cluster_err<T>(code: ClusterCode, message: impl Into<String>) -> ClusterResult<T> {
    Err(ClusterError::new(code, message))
}

pub trait ClusterResultExt<T> {
    fn err_code(self, code: ClusterCode) -> ClusterResult<T>;
    fn internal(self) -> ClusterResult<T>;
}

impl<T, E: Display> ClusterResultExt<T> for Result<T, E> {
    fn err_code(self, code: ClusterCode) -> ClusterResult<T> {
        self.map_err(|e| ClusterError::new(code, e.to_string()))
    }
    fn internal(self) -> ClusterResult<T> {
        self.err_code(ClusterCode::ErrInternal)
    }
}

/// Config errors are fatal at startup, transient I/O is logged and swallowed
/// by the caller, peer/protocol errors surface per-peer or per-connection
/// without taking the node down.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClusterCode {
    ErrConfig,
    ErrIo,
    ErrUnauthorized,
    ErrInternal,
    ErrNodeUnreachable,
    ErrInvalidInput,
    ErrProtocol,
    ErrFrameTooLarge,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClusterError {
    code: ClusterCode,
    message: String,
}

impl std::error::Error for ClusterError {}

impl ClusterError {
    pub fn new(code: ClusterCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ClusterCode::ErrInternal, message)
    }

    pub fn code(&self) -> ClusterCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> ClusterError {
        ClusterError::new(ClusterCode::ErrIo, err.to_string())
    }
}

impl Display for ClusterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "[{:?}] {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_code_and_message() {
        let e = ClusterError::new(ClusterCode::ErrProtocol, "bad frame");
        assert_eq!(e.to_string(), "[ErrProtocol] bad frame");
    }
}
