//! Bring-up sequencer
//!
//! Drives one bring-up session from "disconnected" to "core running the
//! loaded program":
//!
//! ```text
//! Idle -> Connecting -> Connected -> LogicSelecting -> LogicConfiguring
//!      -> LogicProgramming -> SettlingAfterProgram -> CoreSelecting
//!      -> CoreLoading -> SettlingAfterLoad -> Resetting -> Disconnecting -> Done
//! ```
//!
//! Any failure ends in `Failed` after one best-effort disconnect. Nothing is
//! retried.

use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{BringupError, ConnectionError, Result};
use crate::registry::{TargetFilter, TargetRegistry};
use crate::server::DebugServer;
use crate::target::{require_path, LoadOptions, ResetMode};
use crate::transport::{ConnectionDescriptor, TransportHandle};

/// Settle time after programming and after download when none is configured
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BringupState {
    Idle,
    Connecting,
    Connected,
    LogicSelecting,
    LogicConfiguring,
    LogicProgramming,
    SettlingAfterProgram,
    CoreSelecting,
    CoreLoading,
    SettlingAfterLoad,
    Resetting,
    Disconnecting,
    Done,
    Failed,
}

impl std::fmt::Display for BringupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            BringupState::Idle => "idle",
            BringupState::Connecting => "connecting",
            BringupState::Connected => "connected",
            BringupState::LogicSelecting => "selecting logic target",
            BringupState::LogicConfiguring => "loading hardware description",
            BringupState::LogicProgramming => "programming logic",
            BringupState::SettlingAfterProgram => "settling after program",
            BringupState::CoreSelecting => "selecting core target",
            BringupState::CoreLoading => "downloading image",
            BringupState::SettlingAfterLoad => "settling after load",
            BringupState::Resetting => "resetting core",
            BringupState::Disconnecting => "disconnecting",
            BringupState::Done => "done",
            BringupState::Failed => "failed",
        };
        write!(f, "{}", text)
    }
}

/// Everything one bring-up run needs
#[derive(Debug, Clone, PartialEq)]
pub struct BringupPlan {
    pub connection: ConnectionDescriptor,
    /// Selects the programmable-logic device
    pub logic_filter: String,
    /// Hardware/platform description (.xsa)
    pub hardware_description: PathBuf,
    pub bitstream: PathBuf,
    pub logic_load_options: LoadOptions,
    /// Selects the processor core
    pub core_filter: String,
    pub elf: PathBuf,
    pub settle_after_program: Duration,
    pub settle_after_load: Duration,
    pub reset_mode: ResetMode,
    /// Upper bound for the whole run, disconnect excluded
    pub deadline: Option<Duration>,
}

impl Default for BringupPlan {
    fn default() -> Self {
        Self {
            connection: ConnectionDescriptor::default(),
            logic_filter: String::new(),
            hardware_description: PathBuf::new(),
            bitstream: PathBuf::new(),
            logic_load_options: LoadOptions::default(),
            core_filter: String::new(),
            elf: PathBuf::new(),
            settle_after_program: DEFAULT_SETTLE,
            settle_after_load: DEFAULT_SETTLE,
            reset_mode: ResetMode::default(),
            deadline: None,
        }
    }
}

/// Filters compiled from a validated plan
#[derive(Debug, Clone)]
pub struct PlanFilters {
    pub logic: TargetFilter,
    pub core: TargetFilter,
}

impl BringupPlan {
    /// Check the plan before anything touches the server.
    ///
    /// Paths are opaque; only non-emptiness is checked.
    pub fn validate(&self) -> Result<PlanFilters> {
        let invalid = BringupError::InvalidPlan;

        require_path("hardware_description", &self.hardware_description).map_err(invalid)?;
        require_path("bitstream", &self.bitstream).map_err(invalid)?;
        require_path("elf", &self.elf).map_err(invalid)?;

        let logic = TargetFilter::new(&self.logic_filter)
            .map_err(|e| BringupError::InvalidPlan(format!("logic_filter: {}", e)))?;
        let core = TargetFilter::new(&self.core_filter)
            .map_err(|e| BringupError::InvalidPlan(format!("core_filter: {}", e)))?;

        if self.deadline == Some(Duration::ZERO) {
            return Err(BringupError::InvalidPlan("deadline must be > 0".to_string()));
        }

        Ok(PlanFilters { logic, core })
    }
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq)]
pub enum BringupOutcome {
    Done,
    Failed {
        /// State the sequencer was in when the failure happened
        state: BringupState,
        reason: BringupError,
    },
}

#[derive(Debug, Clone)]
pub struct BringupReport {
    pub session_id: Uuid,
    pub outcome: BringupOutcome,
    /// Every state visited, in order
    pub transitions: Vec<BringupState>,
    /// Best-effort disconnect failure; never overrides the outcome
    pub disconnect_error: Option<ConnectionError>,
    pub elapsed: Duration,
}

impl BringupReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, BringupOutcome::Done)
    }

    pub fn final_state(&self) -> BringupState {
        match self.outcome {
            BringupOutcome::Done => BringupState::Done,
            BringupOutcome::Failed { .. } => BringupState::Failed,
        }
    }

    pub fn error(&self) -> Option<&BringupError> {
        match &self.outcome {
            BringupOutcome::Done => None,
            BringupOutcome::Failed { reason, .. } => Some(reason),
        }
    }

    /// 0 on success, otherwise the failure kind's code
    pub fn exit_code(&self) -> u8 {
        self.error().map_or(0, |e| e.kind().exit_code())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let failure = match &self.outcome {
            BringupOutcome::Done => serde_json::Value::Null,
            BringupOutcome::Failed { state, reason } => json!({
                "state": state,
                "kind": reason.kind(),
                "message": reason.to_string(),
            }),
        };
        json!({
            "session_id": self.session_id.to_string(),
            "final_state": self.final_state(),
            "failure": failure,
            "transitions": self.transitions,
            "disconnect_error": self.disconnect_error.as_ref().map(|e| e.to_string()),
            "elapsed_ms": self.elapsed.as_millis() as u64,
        })
    }
}

impl std::fmt::Display for BringupReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            BringupOutcome::Done => {
                write!(f, "Bring-up {} done in {:.1?}", self.session_id, self.elapsed)?;
            }
            BringupOutcome::Failed { state, reason } => {
                write!(
                    f,
                    "Bring-up {} failed while {} ({} error): {}",
                    self.session_id,
                    state,
                    reason.kind(),
                    reason
                )?;
            }
        }
        if let Some(e) = &self.disconnect_error {
            write!(f, "\nwarning: {}", e)?;
        }
        Ok(())
    }
}

/// One bring-up session over an owned debug server connection
pub struct Sequencer<S> {
    session_id: Uuid,
    transport: TransportHandle<S>,
    plan: BringupPlan,
    state: BringupState,
    transitions: Vec<BringupState>,
}

impl<S: DebugServer> Sequencer<S> {
    pub fn new(server: S, plan: BringupPlan) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            transport: TransportHandle::new(server),
            plan,
            state: BringupState::Idle,
            transitions: vec![BringupState::Idle],
        }
    }

    /// Run the whole session. The connection never outlives this call.
    pub async fn run(mut self) -> BringupReport {
        let started = Instant::now();
        info!(session = %self.session_id, "Starting bring-up against {}", self.plan.connection);

        let result = match self.plan.validate() {
            Ok(filters) => self.drive_with_deadline(&filters).await,
            Err(e) => Err(e),
        };

        let mut disconnect_error = None;
        let outcome = match result {
            Ok(()) => {
                self.enter(BringupState::Disconnecting);
                if let Err(e) = self.transport.disconnect().await {
                    warn!(session = %self.session_id, "Disconnect after bring-up failed: {}", e);
                    disconnect_error = Some(e);
                }
                self.enter(BringupState::Done);
                info!(session = %self.session_id, "Bring-up complete");
                BringupOutcome::Done
            }
            Err(reason) => {
                let state = self.state;
                error!(session = %self.session_id, "Bring-up failed while {}: {}", state, reason);

                // Nothing to tear down if the connection never came up
                if self.transport.needs_teardown() {
                    self.enter(BringupState::Disconnecting);
                    if let Err(e) = self.transport.disconnect().await {
                        warn!(session = %self.session_id, "Best-effort disconnect failed: {}", e);
                        disconnect_error = Some(e);
                    }
                }
                self.enter(BringupState::Failed);
                BringupOutcome::Failed { state, reason }
            }
        };

        BringupReport {
            session_id: self.session_id,
            outcome,
            transitions: self.transitions,
            disconnect_error,
            elapsed: started.elapsed(),
        }
    }

    async fn drive_with_deadline(&mut self, filters: &PlanFilters) -> Result<()> {
        let Some(deadline) = self.plan.deadline else {
            return self.drive(filters).await;
        };

        match tokio::time::timeout(deadline, self.drive(filters)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    session = %self.session_id,
                    "Deadline of {:?} expired while {}", deadline, self.state
                );
                Err(BringupError::Timeout { state: self.state })
            }
        }
    }

    async fn drive(&mut self, filters: &PlanFilters) -> Result<()> {
        self.enter(BringupState::Connecting);
        self.transport.connect(&self.plan.connection).await?;
        self.enter(BringupState::Connected);

        self.enter(BringupState::LogicSelecting);
        let logic = TargetRegistry::resolve(&mut self.transport, &filters.logic).await?;

        self.enter(BringupState::LogicConfiguring);
        logic
            .load_description(
                &mut self.transport,
                &self.plan.hardware_description,
                self.plan.logic_load_options,
            )
            .await?;

        self.enter(BringupState::LogicProgramming);
        logic.program(&mut self.transport, &self.plan.bitstream).await?;
        logic.stop();

        self.enter(BringupState::SettlingAfterProgram);
        settle(self.plan.settle_after_program).await;

        self.enter(BringupState::CoreSelecting);
        let core = TargetRegistry::resolve(&mut self.transport, &filters.core).await?;

        self.enter(BringupState::CoreLoading);
        core.download_image(&mut self.transport, &self.plan.elf).await?;

        self.enter(BringupState::SettlingAfterLoad);
        settle(self.plan.settle_after_load).await;

        self.enter(BringupState::Resetting);
        core.reset(&mut self.transport, self.plan.reset_mode).await?;
        core.stop();

        Ok(())
    }

    fn enter(&mut self, state: BringupState) {
        info!(session = %self.session_id, "{:?} -> {:?}", self.state, state);
        self.state = state;
        self.transitions.push(state);
    }
}

async fn settle(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    info!("Waiting {:?} for the target to settle", duration);
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::server::OperationKind;
    use crate::sim::{Call, SimServer};

    fn plan() -> BringupPlan {
        BringupPlan {
            logic_filter: "xc7a35t".to_string(),
            hardware_description: PathBuf::from("design.xsa"),
            bitstream: PathBuf::from("design.bit"),
            core_filter: "Hart".to_string(),
            elf: PathBuf::from("app.elf"),
            settle_after_program: Duration::ZERO,
            settle_after_load: Duration::ZERO,
            ..BringupPlan::default()
        }
    }

    #[test]
    fn test_default_plan_settles_three_seconds() {
        let plan = BringupPlan::default();
        assert_eq!(plan.settle_after_program, Duration::from_secs(3));
        assert_eq!(plan.settle_after_load, Duration::from_secs(3));
        assert_eq!(plan.reset_mode, ResetMode::Run);
        assert!(plan.deadline.is_none());
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        assert!(plan().validate().is_ok());

        let mut p = plan();
        p.elf = PathBuf::new();
        assert!(matches!(p.validate(), Err(BringupError::InvalidPlan(msg)) if msg.contains("elf")));

        let mut p = plan();
        p.core_filter = " ".to_string();
        assert!(matches!(
            p.validate(),
            Err(BringupError::InvalidPlan(msg)) if msg.contains("core_filter")
        ));

        let mut p = plan();
        p.deadline = Some(Duration::ZERO);
        assert!(p.validate().is_err());
    }

    #[tokio::test]
    async fn test_full_run_visits_every_state() {
        let report = Sequencer::new(SimServer::arty(), plan()).run().await;
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            report.transitions,
            vec![
                BringupState::Idle,
                BringupState::Connecting,
                BringupState::Connected,
                BringupState::LogicSelecting,
                BringupState::LogicConfiguring,
                BringupState::LogicProgramming,
                BringupState::SettlingAfterProgram,
                BringupState::CoreSelecting,
                BringupState::CoreLoading,
                BringupState::SettlingAfterLoad,
                BringupState::Resetting,
                BringupState::Disconnecting,
                BringupState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_plan_never_connects() {
        let sim = SimServer::arty();
        let log = sim.log();
        let mut p = plan();
        p.bitstream = PathBuf::new();

        let report = Sequencer::new(sim, p).run().await;
        assert_eq!(report.error().map(|e| e.kind()), Some(FailureKind::InvalidPlan));
        assert_eq!(report.transitions, vec![BringupState::Idle, BringupState::Failed]);
        assert!(log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_records_state() {
        let sim = SimServer::arty().fail_on(OperationKind::LoadHardware, "cannot open design.xsa");
        let report = Sequencer::new(sim, plan()).run().await;
        match &report.outcome {
            BringupOutcome::Failed { state, reason } => {
                assert_eq!(*state, BringupState::LogicConfiguring);
                assert_eq!(reason.kind(), FailureKind::Load);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(report.final_state(), BringupState::Failed);
        assert_eq!(
            &report.transitions[report.transitions.len() - 2..],
            &[BringupState::Disconnecting, BringupState::Failed]
        );
    }

    #[tokio::test]
    async fn test_disconnect_failure_does_not_override_reason() {
        let sim = SimServer::arty()
            .fail_on(OperationKind::Reset, "core did not respond")
            .fail_disconnect("socket reset");
        let report = Sequencer::new(sim, plan()).run().await;
        assert_eq!(report.error().map(|e| e.kind()), Some(FailureKind::Reset));
        assert!(matches!(report.disconnect_error, Some(ConnectionError::Disconnect(_))));
    }

    #[tokio::test]
    async fn test_disconnect_failure_after_success_is_a_warning() {
        let sim = SimServer::arty().fail_disconnect("socket reset");
        let report = Sequencer::new(sim, plan()).run().await;
        assert!(report.is_success());
        assert!(report.disconnect_error.is_some());
        assert!(report.to_string().contains("warning"));
    }

    #[tokio::test]
    async fn test_connect_failure_skips_disconnect() {
        let sim = SimServer::arty().fail_connect("connection refused");
        let log = sim.log();
        let report = Sequencer::new(sim, plan()).run().await;
        assert_eq!(report.exit_code(), FailureKind::Connection.exit_code());
        assert_eq!(log.count(|c| *c == Call::Disconnect), 0);
        assert_eq!(log.count(|c| matches!(c, Call::Issue { .. })), 0);
        assert_eq!(
            report.transitions,
            vec![BringupState::Idle, BringupState::Connecting, BringupState::Failed]
        );
    }

    #[tokio::test]
    async fn test_lost_connection_records_teardown() {
        let sim = SimServer::arty().lose_connection_on(OperationKind::LoadHardware);
        let log = sim.log();
        let report = Sequencer::new(sim, plan()).run().await;
        assert_eq!(report.exit_code(), FailureKind::Connection.exit_code());
        assert_eq!(log.count(|c| *c == Call::Disconnect), 1);
        assert_eq!(
            &report.transitions[report.transitions.len() - 2..],
            &[BringupState::Disconnecting, BringupState::Failed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let sim = SimServer::arty()
            .with_latency(OperationKind::ProgramBitstream, Duration::from_secs(60));
        let log = sim.log();
        let mut p = plan();
        p.deadline = Some(Duration::from_secs(10));

        let report = Sequencer::new(sim, p).run().await;
        assert_eq!(
            report.error(),
            Some(&BringupError::Timeout { state: BringupState::LogicProgramming })
        );
        assert_eq!(log.count(|c| *c == Call::Disconnect), 1);
        assert_eq!(
            log.count(|c| {
                matches!(c, Call::Issue { op, .. } if op.kind() == OperationKind::Download)
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_report_json() {
        let sim = SimServer::arty().fail_on(OperationKind::ProgramBitstream, "DONE pin low");
        let report = Sequencer::new(sim, plan()).run().await;
        let value = report.to_json();
        assert_eq!(value["final_state"], "failed");
        assert_eq!(value["failure"]["kind"], "program");
        assert_eq!(value["failure"]["state"], "logic_programming");
        assert!(value["failure"]["message"].as_str().unwrap().contains("DONE pin low"));
        assert_eq!(value["session_id"], report.session_id.to_string());
    }
}
