//! Simulated debug server
//!
//! An in-process [`DebugServer`] with a configurable target chain, failure
//! injection and a timestamped call log. Backs the `--simulate` dry-run mode
//! and the test suite.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::registry::TargetDescriptor;
use crate::server::{DebugServer, OperationKind, ServerError, TargetOperation};

/// One primitive observed by the simulated server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(String),
    ListTargets,
    Select(u32),
    Issue { target: u32, op: TargetOperation },
    Disconnect,
}

/// Shared, cloneable record of every call the server received
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<(Instant, Call)>>>,
}

impl CallLog {
    fn lock(&self) -> MutexGuard<'_, Vec<(Instant, Call)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: Call) {
        debug!("sim: {:?}", call);
        self.lock().push((Instant::now(), call));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().iter().map(|(_, call)| call.clone()).collect()
    }

    /// Calls with the (tokio) instant they were received
    pub fn timed(&self) -> Vec<(Instant, Call)> {
        self.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.lock().iter().filter(|(_, call)| predicate(call)).count()
    }
}

pub struct SimServer {
    chain: Arc<Mutex<Vec<TargetDescriptor>>>,
    log: CallLog,
    connect_error: Option<String>,
    disconnect_error: Option<String>,
    list_error: Option<String>,
    select_error: Option<String>,
    failures: HashMap<OperationKind, String>,
    lose_on: Option<OperationKind>,
    latency: HashMap<OperationKind, Duration>,
    connected: bool,
}

impl SimServer {
    pub fn new(chain: Vec<TargetDescriptor>) -> Self {
        Self {
            chain: Arc::new(Mutex::new(chain)),
            log: CallLog::default(),
            connect_error: None,
            disconnect_error: None,
            list_error: None,
            select_error: None,
            failures: HashMap::new(),
            lose_on: None,
            latency: HashMap::new(),
            connected: false,
        }
    }

    /// Arty A7 style chain: one Artix-7 carrying a single RISC-V soft core
    pub fn arty() -> Self {
        Self::new(vec![
            TargetDescriptor::new(1, "xc7a35t"),
            TargetDescriptor::new(2, "Debug Module at USER2").with_parent(1),
            TargetDescriptor::new(3, "Hart #0").with_parent(2).with_state("Running"),
        ])
    }

    pub fn fail_connect(mut self, reason: impl Into<String>) -> Self {
        self.connect_error = Some(reason.into());
        self
    }

    pub fn fail_disconnect(mut self, reason: impl Into<String>) -> Self {
        self.disconnect_error = Some(reason.into());
        self
    }

    /// Reject every `targets` listing with `reason`
    pub fn fail_list_targets(mut self, reason: impl Into<String>) -> Self {
        self.list_error = Some(reason.into());
        self
    }

    /// Reject every target selection with `reason`
    pub fn fail_select(mut self, reason: impl Into<String>) -> Self {
        self.select_error = Some(reason.into());
        self
    }

    /// Reject every `kind` operation with `reason`
    pub fn fail_on(mut self, kind: OperationKind, reason: impl Into<String>) -> Self {
        self.failures.insert(kind, reason.into());
        self
    }

    /// Drop the connection when a `kind` operation arrives
    pub fn lose_connection_on(mut self, kind: OperationKind) -> Self {
        self.lose_on = Some(kind);
        self
    }

    pub fn with_latency(mut self, kind: OperationKind, latency: Duration) -> Self {
        self.latency.insert(kind, latency);
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Live chain contents, editable between enumerations
    pub fn chain(&self) -> Arc<Mutex<Vec<TargetDescriptor>>> {
        self.chain.clone()
    }

    fn snapshot(&self) -> Vec<TargetDescriptor> {
        self.chain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn require_connection(&self) -> Result<(), ServerError> {
        if !self.connected {
            return Err(ServerError::ConnectionLost("not connected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DebugServer for SimServer {
    async fn connect(&mut self, url: &str) -> Result<(), ServerError> {
        self.log.record(Call::Connect(url.to_string()));
        if let Some(reason) = &self.connect_error {
            return Err(ServerError::Unreachable(reason.clone()));
        }
        if self.connected {
            return Err(ServerError::Rejected("already connected".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn list_targets(&mut self) -> Result<Vec<TargetDescriptor>, ServerError> {
        self.log.record(Call::ListTargets);
        self.require_connection()?;
        if let Some(reason) = &self.list_error {
            return Err(ServerError::Rejected(reason.clone()));
        }
        Ok(self.snapshot())
    }

    async fn select_target(&mut self, id: u32) -> Result<(), ServerError> {
        self.log.record(Call::Select(id));
        self.require_connection()?;
        if let Some(reason) = &self.select_error {
            return Err(ServerError::Rejected(reason.clone()));
        }
        if !self.snapshot().iter().any(|t| t.id == id) {
            return Err(ServerError::Rejected(format!("no target with id {}", id)));
        }
        Ok(())
    }

    async fn issue(&mut self, id: u32, op: &TargetOperation) -> Result<(), ServerError> {
        self.log.record(Call::Issue {
            target: id,
            op: op.clone(),
        });
        self.require_connection()?;

        let kind = op.kind();
        if let Some(latency) = self.latency.get(&kind) {
            tokio::time::sleep(*latency).await;
        }
        if self.lose_on == Some(kind) {
            self.connected = false;
            return Err(ServerError::ConnectionLost("connection reset by peer".to_string()));
        }
        if let Some(reason) = self.failures.get(&kind) {
            return Err(ServerError::Rejected(reason.clone()));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ServerError> {
        self.log.record(Call::Disconnect);
        self.connected = false;
        if let Some(reason) = &self.disconnect_error {
            return Err(ServerError::Rejected(reason.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_requires_connection() {
        let mut sim = SimServer::arty();
        assert!(sim.list_targets().await.is_err());
        sim.connect("tcp:127.0.0.1:3121").await.unwrap();
        assert_eq!(sim.list_targets().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let mut sim = SimServer::arty().fail_on(OperationKind::Download, "memory write error");
        sim.connect("tcp:127.0.0.1:3121").await.unwrap();
        let op = TargetOperation::Download { path: PathBuf::from("app.elf") };
        assert_eq!(
            sim.issue(3, &op).await,
            Err(ServerError::Rejected("memory write error".to_string()))
        );
        assert_eq!(sim.log().count(|c| matches!(c, Call::Issue { .. })), 1);
    }

    #[tokio::test]
    async fn test_select_unknown_target() {
        let mut sim = SimServer::arty();
        sim.connect("tcp:127.0.0.1:3121").await.unwrap();
        assert!(matches!(sim.select_target(42).await, Err(ServerError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_simulated() {
        let mut sim = SimServer::arty()
            .with_latency(OperationKind::ProgramBitstream, Duration::from_secs(20));
        sim.connect("tcp:127.0.0.1:3121").await.unwrap();
        let start = Instant::now();
        let op = TargetOperation::ProgramBitstream { path: PathBuf::from("design.bit") };
        sim.issue(1, &op).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(20));
    }
}
