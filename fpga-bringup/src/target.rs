//! Target handles and the operations issued on them

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{BringupError, InvalidHandleError, Result};
use crate::registry::{TargetDescriptor, TargetKind};
use crate::server::{DebugServer, TargetOperation};
use crate::transport::TransportHandle;

/// Run state a processor core is left in after reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    /// Keep the core stopped at the reset vector
    Halt,
    /// Let the core execute the loaded program
    #[default]
    Run,
}

impl std::fmt::Display for ResetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetMode::Halt => write!(f, "halt"),
            ResetMode::Run => write!(f, "run"),
        }
    }
}

/// Options for associating a hardware description with a logic target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Also load the register map (xsdb `loadhw -regs`)
    pub load_register_map: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            load_register_map: true,
        }
    }
}

/// A live binding to one target, valid for the connection it was resolved on
#[derive(Debug)]
pub struct TargetHandle {
    descriptor: TargetDescriptor,
    epoch: u64,
}

impl TargetHandle {
    pub(crate) fn new(descriptor: TargetDescriptor, epoch: u64) -> Self {
        Self { descriptor, epoch }
    }

    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    /// Connection epoch this handle belongs to
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Associate a hardware/register description with a logic target
    pub async fn load_description<S: DebugServer>(
        &self,
        transport: &mut TransportHandle<S>,
        path: &Path,
        options: LoadOptions,
    ) -> Result<()> {
        let op = TargetOperation::LoadHardware {
            path: path.to_path_buf(),
            load_register_map: options.load_register_map,
        };
        self.issue(transport, TargetKind::ProgrammableLogic, op, |target, reason| {
            BringupError::Load { target, reason }
        })
        .await
    }

    /// Program a configuration image; blocks until the server reports completion
    pub async fn program<S: DebugServer>(
        &self,
        transport: &mut TransportHandle<S>,
        image_path: &Path,
    ) -> Result<()> {
        let op = TargetOperation::ProgramBitstream {
            path: image_path.to_path_buf(),
        };
        self.issue(transport, TargetKind::ProgrammableLogic, op, |target, reason| {
            BringupError::Program { target, reason }
        })
        .await
    }

    /// Download an executable image into the core's memory
    pub async fn download_image<S: DebugServer>(
        &self,
        transport: &mut TransportHandle<S>,
        image_path: &Path,
    ) -> Result<()> {
        let op = TargetOperation::Download {
            path: image_path.to_path_buf(),
        };
        self.issue(transport, TargetKind::ProcessorCore, op, |target, reason| {
            BringupError::Download { target, reason }
        })
        .await
    }

    pub async fn reset<S: DebugServer>(
        &self,
        transport: &mut TransportHandle<S>,
        mode: ResetMode,
    ) -> Result<()> {
        self.issue(
            transport,
            TargetKind::ProcessorCore,
            TargetOperation::Reset { mode },
            |target, reason| BringupError::Reset { target, reason },
        )
        .await
    }

    /// Stop tracking this target. The physical target keeps its run state.
    pub fn stop(self) {
        debug!("Released handle for target {} '{}'", self.descriptor.id, self.descriptor.name);
    }

    async fn issue<S: DebugServer>(
        &self,
        transport: &mut TransportHandle<S>,
        expected: TargetKind,
        op: TargetOperation,
        failed: impl FnOnce(String, String) -> BringupError,
    ) -> Result<()> {
        if !transport.is_live(self.epoch) {
            return Err(InvalidHandleError {
                target: self.descriptor.name.clone(),
            }
            .into());
        }

        let wrong_kind = match expected {
            TargetKind::ProgrammableLogic => self.descriptor.kind == TargetKind::ProcessorCore,
            TargetKind::ProcessorCore => self.descriptor.kind == TargetKind::ProgrammableLogic,
            TargetKind::Other => false,
        };
        if wrong_kind {
            return Err(failed(
                self.descriptor.name.clone(),
                format!(
                    "'{}' is a {} target, not a {} target",
                    op.kind(),
                    self.descriptor.kind,
                    expected
                ),
            ));
        }

        let kind = op.kind();
        info!("{} on target {} '{}'", describe(&op), self.descriptor.id, self.descriptor.name);
        let started = Instant::now();

        let outcome = transport.server_mut()?.issue(self.descriptor.id, &op).await;
        match outcome {
            Ok(()) => {
                debug!("{} finished in {:?}", kind, started.elapsed());
                Ok(())
            }
            Err(e) => {
                let target = self.descriptor.name.clone();
                Err(transport.fail(e, |reason| failed(target, reason)))
            }
        }
    }
}

fn describe(op: &TargetOperation) -> String {
    match op {
        TargetOperation::LoadHardware { path, load_register_map } => format!(
            "Loading hardware description {}{}",
            path.display(),
            if *load_register_map { " with register map" } else { "" }
        ),
        TargetOperation::ProgramBitstream { path } => {
            format!("Programming bitstream {}", path.display())
        }
        TargetOperation::Download { path } => format!("Downloading {}", path.display()),
        TargetOperation::Reset { mode } => format!("Resetting ({})", mode),
    }
}

/// Paths are opaque here; only non-emptiness is checked
pub(crate) fn require_path(field: &str, path: &Path) -> std::result::Result<PathBuf, String> {
    if path.as_os_str().is_empty() {
        return Err(format!("{} must not be empty", field));
    }
    Ok(path.to_path_buf())
}
