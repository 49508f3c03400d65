//! FPGA Bring-up Sequencer
//!
//! Drives a Xilinx hardware server from "disconnected" to "soft core running
//! the loaded program": connect, select the FPGA, load the hardware
//! description, program the bitstream, select the core, download the ELF,
//! reset, disconnect. Every step is fallible and nothing is retried.

pub mod config;
pub mod error;
pub mod registry;
pub mod sequencer;
pub mod server;
pub mod sim;
pub mod target;
pub mod transport;
pub mod xsdb_client;

pub use config::{Args, Config};
pub use error::{BringupError, FailureKind, Result};
pub use registry::{TargetDescriptor, TargetFilter, TargetKind, TargetRegistry};
pub use sequencer::{BringupOutcome, BringupPlan, BringupReport, BringupState, Sequencer};
pub use server::{DebugServer, TargetOperation};
pub use target::{LoadOptions, ResetMode, TargetHandle};
pub use transport::{ConnectionDescriptor, TransportHandle};
