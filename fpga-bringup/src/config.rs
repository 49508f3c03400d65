//! Configuration for fpga-bringup
//!
//! Precedence: built-in defaults, then the TOML plan file, then CLI flags.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::sequencer::{BringupPlan, DEFAULT_SETTLE};
use crate::target::{LoadOptions, ResetMode};
use crate::transport::ConnectionDescriptor;
use crate::xsdb_client::XsdbSettings;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "fpga-bringup")]
#[command(about = "Program an FPGA and boot its soft core through a Xilinx hardware server")]
#[command(version)]
pub struct Args {
    /// Path to a TOML bring-up plan
    #[arg(short, long)]
    pub plan: Option<PathBuf>,

    /// Hardware server URI (e.g. tcp:127.0.0.1:3121)
    #[arg(long)]
    pub url: Option<String>,

    /// Filter selecting the FPGA (e.g. "xc7a35t")
    #[arg(long)]
    pub logic_filter: Option<String>,

    /// Hardware description (.xsa)
    #[arg(long = "hw")]
    pub hardware_description: Option<PathBuf>,

    /// Bitstream (.bit)
    #[arg(long)]
    pub bitstream: Option<PathBuf>,

    /// Do not load the register map with the hardware description
    #[arg(long)]
    pub no_load_regs: bool,

    /// Filter selecting the processor core (e.g. "*Hart*")
    #[arg(long)]
    pub core_filter: Option<String>,

    /// Executable image (.elf)
    #[arg(long)]
    pub elf: Option<PathBuf>,

    /// Wait after programming the bitstream, in milliseconds
    #[arg(long)]
    pub settle_after_program_ms: Option<u64>,

    /// Wait after downloading the executable, in milliseconds
    #[arg(long)]
    pub settle_after_load_ms: Option<u64>,

    /// Core state after reset
    #[arg(long, value_enum)]
    pub reset_mode: Option<ResetMode>,

    /// Abort the whole bring-up after this many seconds
    #[arg(long)]
    pub deadline_secs: Option<u64>,

    /// xsdb command server address (host:port)
    #[arg(long)]
    pub xsdb_server: Option<String>,

    /// Launch this xsdb binary instead of using a running command server
    #[arg(long)]
    pub xsdb_path: Option<PathBuf>,

    /// Per-command reply timeout in seconds
    #[arg(long)]
    pub command_timeout_secs: Option<u64>,

    /// Run against a simulated board instead of a hardware server
    #[arg(long)]
    pub simulate: bool,

    /// Connect, print the target chain and exit
    #[arg(long)]
    pub list_targets: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Show the effective configuration and exit
    #[arg(long)]
    pub show_config: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file path (defaults to stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Plan file contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub logic: LogicConfig,
    pub core: CoreConfig,
    pub session: SessionConfig,
    pub xsdb: XsdbConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub url: ConnectionDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicConfig {
    pub filter: String,
    pub hardware_description: PathBuf,
    pub bitstream: PathBuf,
    pub load_register_map: bool,
    pub settle_ms: u64,
}

impl Default for LogicConfig {
    fn default() -> Self {
        Self {
            filter: String::new(),
            hardware_description: PathBuf::new(),
            bitstream: PathBuf::new(),
            load_register_map: LoadOptions::default().load_register_map,
            settle_ms: DEFAULT_SETTLE.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub filter: String,
    pub elf: PathBuf,
    pub settle_ms: u64,
    pub reset_mode: ResetMode,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            filter: String::new(),
            elf: PathBuf::new(),
            settle_ms: DEFAULT_SETTLE.as_millis() as u64,
            reset_mode: ResetMode::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XsdbConfig {
    pub server: String,
    pub xsdb_path: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub startup_timeout_secs: u64,
}

impl Default for XsdbConfig {
    fn default() -> Self {
        let settings = XsdbSettings::default();
        Self {
            server: settings.server,
            xsdb_path: settings.xsdb_path,
            command_timeout_secs: settings.command_timeout.as_secs(),
            startup_timeout_secs: settings.startup_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Load the plan file, or defaults when none is given
    pub fn load(plan_path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        let Some(path) = plan_path else {
            return Ok(Config::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults, plan file and CLI flags combined and validated
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = Self::load(args.plan.as_ref())?;
        config.merge_args(args)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge command line arguments into configuration
    pub fn merge_args(&mut self, args: &Args) -> Result<(), ConfigError> {
        if let Some(url) = &args.url {
            self.connection.url = url.parse().map_err(ConfigError::Invalid)?;
        }
        if let Some(filter) = &args.logic_filter {
            self.logic.filter = filter.clone();
        }
        if let Some(path) = &args.hardware_description {
            self.logic.hardware_description = path.clone();
        }
        if let Some(path) = &args.bitstream {
            self.logic.bitstream = path.clone();
        }
        if args.no_load_regs {
            self.logic.load_register_map = false;
        }
        if let Some(ms) = args.settle_after_program_ms {
            self.logic.settle_ms = ms;
        }
        if let Some(filter) = &args.core_filter {
            self.core.filter = filter.clone();
        }
        if let Some(path) = &args.elf {
            self.core.elf = path.clone();
        }
        if let Some(ms) = args.settle_after_load_ms {
            self.core.settle_ms = ms;
        }
        if let Some(mode) = args.reset_mode {
            self.core.reset_mode = mode;
        }
        if let Some(secs) = args.deadline_secs {
            self.session.deadline_secs = Some(secs);
        }
        if let Some(server) = &args.xsdb_server {
            self.xsdb.server = server.clone();
        }
        if let Some(path) = &args.xsdb_path {
            self.xsdb.xsdb_path = Some(path.clone());
        }
        if let Some(secs) = args.command_timeout_secs {
            self.xsdb.command_timeout_secs = secs;
        }
        Ok(())
    }

    /// Validate backend settings. The plan itself is checked by the sequencer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let port = self
            .xsdb
            .server
            .rsplit_once(':')
            .and_then(|(host, port)| (!host.is_empty()).then_some(port))
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "xsdb.server '{}' must be host:port",
                    self.xsdb.server
                ))
            })?;
        port.parse::<u16>()
            .map_err(|e| ConfigError::Invalid(format!("xsdb.server port '{}': {}", port, e)))?;

        if self.xsdb.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid("xsdb.command_timeout_secs must be > 0".to_string()));
        }
        if self.session.deadline_secs == Some(0) {
            return Err(ConfigError::Invalid("session.deadline_secs must be > 0".to_string()));
        }
        Ok(())
    }

    /// Generate TOML configuration string
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    pub fn plan(&self) -> BringupPlan {
        BringupPlan {
            connection: self.connection.url.clone(),
            logic_filter: self.logic.filter.clone(),
            hardware_description: self.logic.hardware_description.clone(),
            bitstream: self.logic.bitstream.clone(),
            logic_load_options: LoadOptions {
                load_register_map: self.logic.load_register_map,
            },
            core_filter: self.core.filter.clone(),
            elf: self.core.elf.clone(),
            settle_after_program: Duration::from_millis(self.logic.settle_ms),
            settle_after_load: Duration::from_millis(self.core.settle_ms),
            reset_mode: self.core.reset_mode,
            deadline: self.session.deadline_secs.map(Duration::from_secs),
        }
    }

    pub fn xsdb(&self) -> XsdbSettings {
        XsdbSettings {
            server: self.xsdb.server.clone(),
            xsdb_path: self.xsdb.xsdb_path.clone(),
            command_timeout: Duration::from_secs(self.xsdb.command_timeout_secs),
            startup_timeout: Duration::from_secs(self.xsdb.startup_timeout_secs),
        }
    }
}
