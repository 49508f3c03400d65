//! XSDB command-server client
//!
//! Talks to Xilinx `xsdb` running `xsdbserver start` (default port 3010).
//! xsdb in turn holds the TCF connection to `hw_server`.
//! Protocol: one TCL command per line. Each reply is one line starting with
//! `okay` or `error`, followed by the result text with newlines escaped.

use async_trait::async_trait;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::registry::TargetDescriptor;
use crate::server::{DebugServer, ServerError, TargetOperation};
use crate::target::ResetMode;

/// Default `xsdbserver` port
pub const DEFAULT_XSDB_PORT: u16 = 3010;

/// How to reach (or start) the xsdb command server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XsdbSettings {
    /// `host:port` of the xsdb command server
    pub server: String,
    /// Launch this xsdb binary instead of expecting a running server
    pub xsdb_path: Option<PathBuf>,
    /// Per-command reply timeout; programming a large bitstream is slow
    pub command_timeout: Duration,
    /// How long a launched xsdb gets to open its port
    pub startup_timeout: Duration,
}

impl Default for XsdbSettings {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", DEFAULT_XSDB_PORT),
            xsdb_path: None,
            command_timeout: Duration::from_secs(600),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

/// xsdb process we started, plus the script it runs
struct LaunchedXsdb {
    process: Child,
    _script: NamedTempFile,
}

pub struct XsdbClient {
    settings: XsdbSettings,
    stream: Option<BufReader<TcpStream>>,
    launched: Option<LaunchedXsdb>,
    /// Target xsdb currently considers active
    current_target: Option<u32>,
    /// A command was sent and its reply never read (e.g. dropped on a deadline)
    in_flight: bool,
}

impl XsdbClient {
    pub fn new(settings: XsdbSettings) -> Self {
        Self {
            settings,
            stream: None,
            launched: None,
            current_target: None,
            in_flight: false,
        }
    }

    /// Open the command channel, launching xsdb first if configured
    async fn ensure_channel(&mut self) -> Result<(), ServerError> {
        if self.stream.is_some() {
            return Ok(());
        }

        if let Some(xsdb_path) = self.settings.xsdb_path.clone() {
            if self.launched.is_some() && !self.is_running() {
                warn!("Launched xsdb has exited, starting it again");
                self.launched = None;
            }
            if self.launched.is_none() {
                self.launched = Some(self.launch(&xsdb_path)?);
            }
        }

        // Only a freshly launched xsdb needs time to open its port
        let patience = if self.launched.is_some() {
            self.settings.startup_timeout
        } else {
            Duration::ZERO
        };
        let stream = wait_for_connection(&self.settings.server, patience).await?;
        info!("Connected to xsdb command server at {}", self.settings.server);
        self.stream = Some(BufReader::new(stream));
        self.in_flight = false;
        Ok(())
    }

    fn launch(&self, xsdb_path: &Path) -> Result<LaunchedXsdb, ServerError> {
        let (host, port) = self.settings.server.rsplit_once(':').ok_or_else(|| {
            ServerError::Unreachable(format!(
                "Invalid xsdb server address '{}'",
                self.settings.server
            ))
        })?;

        let mut script = tempfile::Builder::new()
            .prefix("fpga-bringup-")
            .suffix(".tcl")
            .tempfile()
            .map_err(|e| ServerError::Unreachable(format!("Failed to create xsdb script: {}", e)))?;
        let contents = format!("xsdbserver start -host {} -port {}\nvwait forever\n", host, port);
        script
            .write_all(contents.as_bytes())
            .and_then(|_| script.flush())
            .map_err(|e| ServerError::Unreachable(format!("Failed to write xsdb script: {}", e)))?;

        info!("Starting xsdb: {} {} (port {})", xsdb_path.display(), script.path().display(), port);

        let process = Command::new(xsdb_path)
            .arg(script.path())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServerError::Unreachable(format!("Failed to spawn xsdb: {}", e)))?;

        Ok(LaunchedXsdb {
            process,
            _script: script,
        })
    }

    /// Send one TCL command and return the `okay` payload
    pub async fn send_command(&mut self, command: &str) -> Result<String, ServerError> {
        if self.in_flight {
            return Err(ServerError::Protocol(
                "previous command never completed, channel out of sync".to_string(),
            ));
        }
        if command.contains(['\n', '\r']) {
            return Err(ServerError::Rejected(format!(
                "command contains a line break: {:?}",
                command
            )));
        }
        let timeout = self.settings.command_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ServerError::ConnectionLost("xsdb channel not open".to_string()))?;

        debug!("xsdb command: {}", command);

        let mut payload = command.as_bytes().to_vec();
        payload.push(b'\n');
        self.in_flight = true;
        stream
            .get_mut()
            .write_all(&payload)
            .await
            .map_err(|e| ServerError::ConnectionLost(format!("Write failed: {}", e)))?;

        let mut line = String::new();
        match tokio::time::timeout(timeout, stream.read_line(&mut line)).await {
            Ok(Ok(0)) => {
                return Err(ServerError::ConnectionLost(
                    "xsdb closed the connection".to_string(),
                ))
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(ServerError::ConnectionLost(format!("Read failed: {}", e))),
            Err(_) => return Err(ServerError::Timeout),
        }
        self.in_flight = false;

        debug!("xsdb reply: {}", line.trim_end());
        parse_reply(&line)
    }

    /// Drop the channel and stop any xsdb we launched
    pub async fn shutdown(&mut self) {
        self.stream = None;
        self.current_target = None;
        self.in_flight = false;

        if let Some(mut launched) = self.launched.take() {
            info!("Stopping xsdb");
            if let Err(e) = launched.process.kill().await {
                warn!("Kill xsdb: {}", e);
            }
        }
    }

    /// Check if a launched xsdb is still running
    fn is_running(&mut self) -> bool {
        match self.launched.as_mut() {
            Some(launched) => matches!(launched.process.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn ensure_selected(&mut self, id: u32) -> Result<(), ServerError> {
        if self.current_target != Some(id) {
            self.select_target(id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DebugServer for XsdbClient {
    async fn connect(&mut self, url: &str) -> Result<(), ServerError> {
        self.ensure_channel().await?;
        self.current_target = None;
        match self.send_command(&format!("connect -url {}", url)).await {
            Ok(_) => Ok(()),
            Err(ServerError::Rejected(msg)) => Err(ServerError::Unreachable(msg)),
            Err(e) => Err(e),
        }
    }

    async fn list_targets(&mut self) -> Result<Vec<TargetDescriptor>, ServerError> {
        let output = self.send_command("targets").await?;
        let targets = parse_targets(&output)?;
        self.current_target = targets
            .iter()
            .zip(output.lines().filter(|l| !l.trim().is_empty()))
            .find(|(_, line)| is_selected_line(line))
            .map(|(t, _)| t.id);
        Ok(targets)
    }

    async fn select_target(&mut self, id: u32) -> Result<(), ServerError> {
        self.send_command(&format!("targets -set {}", id)).await?;
        self.current_target = Some(id);
        Ok(())
    }

    async fn issue(&mut self, id: u32, op: &TargetOperation) -> Result<(), ServerError> {
        self.ensure_selected(id).await?;
        for command in operation_commands(op)? {
            self.send_command(&command).await?;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ServerError> {
        let result = if self.in_flight || self.stream.is_none() {
            warn!("xsdb channel unusable, dropping it without a disconnect command");
            Ok(())
        } else {
            self.send_command("disconnect").await.map(|_| ())
        };
        self.shutdown().await;
        result
    }
}

/// Wait for the xsdb command port, retrying with backoff
async fn wait_for_connection(addr: &str, timeout: Duration) -> Result<TcpStream, ServerError> {
    let start = tokio::time::Instant::now();
    let mut delay = Duration::from_millis(50);

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(_) if start.elapsed() < timeout => {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_millis(500));
            }
            Err(e) => {
                return Err(ServerError::Unreachable(format!(
                    "Failed to connect to xsdb at {} after {:?}: {}",
                    addr, timeout, e
                )));
            }
        }
    }
}

/// TCL command(s) implementing one target operation.
///
/// Paths with a line break cannot travel on the line protocol and are rejected.
pub fn operation_commands(op: &TargetOperation) -> Result<Vec<String>, ServerError> {
    let commands = match op {
        TargetOperation::LoadHardware { path, load_register_map } => {
            let mut cmd = format!("loadhw -hw {}", wire_path(path)?);
            if *load_register_map {
                cmd.push_str(" -regs");
            }
            vec![cmd]
        }
        TargetOperation::ProgramBitstream { path } => {
            vec![format!("fpga -file {}", wire_path(path)?)]
        }
        TargetOperation::Download { path } => vec![format!("dow {}", wire_path(path)?)],
        TargetOperation::Reset { mode } => match mode {
            ResetMode::Halt => vec!["rst -processor -stop".to_string()],
            ResetMode::Run => vec!["rst -processor -start".to_string()],
        },
    };
    Ok(commands)
}

fn wire_path(path: &Path) -> Result<String, ServerError> {
    if path.to_string_lossy().contains(['\n', '\r']) {
        return Err(ServerError::Rejected(format!(
            "path {:?} contains a line break",
            path
        )));
    }
    Ok(tcl_quote(path))
}

/// Quote a path as a single TCL word
pub fn tcl_quote(path: &Path) -> String {
    let text = path.to_string_lossy();
    if !text.contains(['{', '}', '\\']) {
        return format!("{{{}}}", text);
    }
    let mut quoted = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        if matches!(c, '\\' | '{' | '}' | '[' | ']' | '$' | '"' | ' ' | ';') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted
}

/// Split an xsdbserver reply line into result or error
pub fn parse_reply(line: &str) -> Result<String, ServerError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (status, rest) = match line.split_once(' ') {
        Some((status, rest)) => (status, rest),
        None => (line, ""),
    };
    let payload = unescape(rest);
    match status {
        "okay" => Ok(payload),
        "error" => Err(ServerError::Rejected(payload.trim().to_string())),
        _ => Err(ServerError::Protocol(format!("Unexpected reply from xsdb: '{}'", line))),
    }
}

/// Undo the reply escaping in one pass: `\\` is a backslash, `\n` a newline.
/// Any other escape is kept as is.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn is_selected_line(line: &str) -> bool {
    line.trim_start()
        .split_whitespace()
        .next()
        .is_some_and(|id| id.ends_with('*'))
}

/// Parse `targets` output into descriptors.
///
/// ```text
///   1  xc7a35t
///      2  MicroBlaze Debug Module at USER2
///         3* MicroBlaze #0 (Running)
/// ```
/// Deeper indentation means a child of the previous shallower entry.
pub fn parse_targets(output: &str) -> Result<Vec<TargetDescriptor>, ServerError> {
    let line_re = Regex::new(r"^(\s*)(\d+)(\*?)\s+(.+?)(?:\s+\(([^()]*)\))?\s*$")
        .map_err(|e| ServerError::Protocol(e.to_string()))?;

    let mut targets = Vec::new();
    // (indent, id) of the open ancestors
    let mut stack: Vec<(usize, u32)> = Vec::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let caps = line_re
            .captures(line)
            .ok_or_else(|| ServerError::Protocol(format!("Unrecognized target line: '{}'", line)))?;

        let indent = caps[1].len();
        let id: u32 = caps[2]
            .parse()
            .map_err(|e| ServerError::Protocol(format!("Bad target id in '{}': {}", line, e)))?;

        while stack.last().is_some_and(|(depth, _)| *depth >= indent) {
            stack.pop();
        }

        let mut descriptor = TargetDescriptor::new(id, caps[4].trim());
        if let Some((_, parent)) = stack.last() {
            descriptor = descriptor.with_parent(*parent);
        }
        if let Some(state) = caps.get(5) {
            descriptor = descriptor.with_state(state.as_str());
        }

        stack.push((indent, id));
        targets.push(descriptor);
    }

    Ok(targets)
}
