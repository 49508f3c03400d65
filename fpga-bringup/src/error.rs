//! Error types for the bring-up sequencer

use serde::Serialize;
use thiserror::Error;

use crate::sequencer::BringupState;

/// Control-channel errors raised by the transport handle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Debug server unreachable at {uri}: {reason}")]
    Unreachable { uri: String, reason: String },

    #[error("Transport already connected")]
    AlreadyConnected,

    #[error("Transport not connected")]
    NotConnected,

    #[error("Connection lost: {0}")]
    Lost(String),

    #[error("Disconnect failed: {0}")]
    Disconnect(String),
}

/// Strict filter resolution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetResolutionError {
    #[error("No target matches filter '{filter}' (available: {})", .available.join(", "))]
    NoMatch { filter: String, available: Vec<String> },

    #[error(
        "Filter '{filter}' is ambiguous, it matches {} targets: {}",
        .matches.len(),
        .matches.join(", ")
    )]
    AmbiguousMatch { filter: String, matches: Vec<String> },
}

/// Operation issued on a target handle whose connection is gone
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Target handle for '{target}' is no longer valid (connection closed)")]
pub struct InvalidHandleError {
    pub target: String,
}

/// Main error type for a bring-up run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BringupError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Resolution(#[from] TargetResolutionError),

    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandleError),

    #[error("Loading hardware description on '{target}' failed: {reason}")]
    Load { target: String, reason: String },

    #[error("Programming '{target}' failed: {reason}")]
    Program { target: String, reason: String },

    #[error("Downloading image to '{target}' failed: {reason}")]
    Download { target: String, reason: String },

    #[error("Resetting '{target}' failed: {reason}")]
    Reset { target: String, reason: String },

    #[error("Deadline expired while {state}")]
    Timeout { state: BringupState },

    #[error("Invalid bring-up plan: {0}")]
    InvalidPlan(String),
}

/// Coarse classification of a failure, used for reporting and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connection,
    Resolution,
    InvalidHandle,
    Load,
    Program,
    Download,
    Reset,
    Timeout,
    InvalidPlan,
}

impl FailureKind {
    /// Process exit code reported for this failure kind
    pub fn exit_code(self) -> u8 {
        match self {
            FailureKind::Connection => 2,
            FailureKind::Resolution => 3,
            FailureKind::InvalidHandle => 4,
            FailureKind::Load => 5,
            FailureKind::Program => 6,
            FailureKind::Download => 7,
            FailureKind::Reset => 8,
            FailureKind::Timeout => 9,
            FailureKind::InvalidPlan => 10,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Connection => "connection",
            FailureKind::Resolution => "target resolution",
            FailureKind::InvalidHandle => "invalid handle",
            FailureKind::Load => "load",
            FailureKind::Program => "program",
            FailureKind::Download => "download",
            FailureKind::Reset => "reset",
            FailureKind::Timeout => "timeout",
            FailureKind::InvalidPlan => "invalid plan",
        };
        write!(f, "{}", name)
    }
}

impl BringupError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BringupError::Connection(_) => FailureKind::Connection,
            BringupError::Resolution(_) => FailureKind::Resolution,
            BringupError::InvalidHandle(_) => FailureKind::InvalidHandle,
            BringupError::Load { .. } => FailureKind::Load,
            BringupError::Program { .. } => FailureKind::Program,
            BringupError::Download { .. } => FailureKind::Download,
            BringupError::Reset { .. } => FailureKind::Reset,
            BringupError::Timeout { .. } => FailureKind::Timeout,
            BringupError::InvalidPlan(_) => FailureKind::InvalidPlan,
        }
    }
}

/// Configuration file and argument errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read plan file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML syntax: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),
}

impl From<ConfigError> for BringupError {
    fn from(error: ConfigError) -> Self {
        BringupError::InvalidPlan(error.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, BringupError>;
