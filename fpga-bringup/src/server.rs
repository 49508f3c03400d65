//! Debug server endpoint abstraction
//!
//! The sequencer only ever needs five primitives from the server: connect,
//! list targets, select a target, issue an operation on a target, and
//! disconnect. Wire framing is left to the implementations
//! ([`crate::xsdb_client::XsdbClient`], [`crate::sim::SimServer`]).

use async_trait::async_trait;
use std::path::PathBuf;

use crate::registry::TargetDescriptor;
use crate::target::ResetMode;

/// An operation issued on a selected target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOperation {
    /// Associate a hardware/register description with a logic target
    LoadHardware { path: PathBuf, load_register_map: bool },
    /// Program a configuration image into a logic target
    ProgramBitstream { path: PathBuf },
    /// Download an executable image into a processor core
    Download { path: PathBuf },
    /// Reset a processor core
    Reset { mode: ResetMode },
}

impl TargetOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            TargetOperation::LoadHardware { .. } => OperationKind::LoadHardware,
            TargetOperation::ProgramBitstream { .. } => OperationKind::ProgramBitstream,
            TargetOperation::Download { .. } => OperationKind::Download,
            TargetOperation::Reset { .. } => OperationKind::Reset,
        }
    }
}

/// Payload-free tag for [`TargetOperation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    LoadHardware,
    ProgramBitstream,
    Download,
    Reset,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::LoadHardware => write!(f, "loadhw"),
            OperationKind::ProgramBitstream => write!(f, "fpga"),
            OperationKind::Download => write!(f, "dow"),
            OperationKind::Reset => write!(f, "rst"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Connection to server lost: {0}")]
    ConnectionLost(String),

    #[error("Server rejected command: {0}")]
    Rejected(String),

    #[error("Command timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ServerError {
    /// Whether the control channel can still be trusted after this error
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ServerError::ConnectionLost(_) | ServerError::Timeout | ServerError::Protocol(_)
        )
    }
}

/// A remote debug/programming endpoint
#[async_trait]
pub trait DebugServer: Send {
    /// Open the control channel to the hardware server at `url`
    async fn connect(&mut self, url: &str) -> Result<(), ServerError>;

    /// Snapshot of all targets currently visible on the chain
    async fn list_targets(&mut self) -> Result<Vec<TargetDescriptor>, ServerError>;

    /// Make target `id` the active target
    async fn select_target(&mut self, id: u32) -> Result<(), ServerError>;

    /// Run `op` against target `id`; returns once the server reports completion
    async fn issue(&mut self, id: u32, op: &TargetOperation) -> Result<(), ServerError>;

    async fn disconnect(&mut self) -> Result<(), ServerError>;
}

#[async_trait]
impl<S: DebugServer + ?Sized> DebugServer for Box<S> {
    async fn connect(&mut self, url: &str) -> Result<(), ServerError> {
        (**self).connect(url).await
    }

    async fn list_targets(&mut self) -> Result<Vec<TargetDescriptor>, ServerError> {
        (**self).list_targets().await
    }

    async fn select_target(&mut self, id: u32) -> Result<(), ServerError> {
        (**self).select_target(id).await
    }

    async fn issue(&mut self, id: u32, op: &TargetOperation) -> Result<(), ServerError> {
        (**self).issue(id, op).await
    }

    async fn disconnect(&mut self) -> Result<(), ServerError> {
        (**self).disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_kind() {
        let op = TargetOperation::Download { path: PathBuf::from("app.elf") };
        assert_eq!(op.kind(), OperationKind::Download);
        assert_eq!(op.kind().to_string(), "dow");

        let op = TargetOperation::Reset { mode: ResetMode::Run };
        assert_eq!(op.kind(), OperationKind::Reset);
    }

    #[test]
    fn test_connection_loss_classification() {
        assert!(ServerError::ConnectionLost("eof".to_string()).is_connection_loss());
        assert!(ServerError::Timeout.is_connection_loss());
        assert!(!ServerError::Rejected("no such file".to_string()).is_connection_loss());
        assert!(!ServerError::Unreachable("refused".to_string()).is_connection_loss());
    }
}
