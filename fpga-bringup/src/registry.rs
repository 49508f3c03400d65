//! Target discovery and strict filter resolution

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, Result, TargetResolutionError};
use crate::server::{DebugServer, ServerError};
use crate::target::TargetHandle;
use crate::transport::{ConnectionDescriptor, TransportHandle};

/// What a target on the chain is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    ProgrammableLogic,
    ProcessorCore,
    Other,
}

impl TargetKind {
    /// Classify a target from the name the server reports for it
    pub fn classify(name: &str) -> Self {
        let name = name.trim();
        let first = name.split_whitespace().next().unwrap_or("");

        if name.contains("Hart")
            || name.starts_with("MicroBlaze #")
            || name.contains("Cortex")
            || name.starts_with("ARM")
        {
            TargetKind::ProcessorCore
        } else if is_fpga_part(first) {
            TargetKind::ProgrammableLogic
        } else {
            TargetKind::Other
        }
    }
}

/// Xilinx part numbers: xc7a35t, xczu9eg, xa7z010, xqvu9p ...
fn is_fpga_part(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    let mut chars = lower.chars();
    chars.next() == Some('x')
        && matches!(chars.next(), Some('a' | 'c' | 'q'))
        && lower.chars().all(|c| c.is_ascii_alphanumeric())
        && lower.chars().any(|c| c.is_ascii_digit())
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::ProgrammableLogic => write!(f, "logic"),
            TargetKind::ProcessorCore => write!(f, "core"),
            TargetKind::Other => write!(f, "other"),
        }
    }
}

/// A target as seen at enumeration time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDescriptor {
    /// Server-assigned target number
    pub id: u32,
    pub name: String,
    pub kind: TargetKind,
    /// Run state text, e.g. "Running" or "Stopped"
    pub state: Option<String>,
    /// Enclosing target in the chain tree
    pub parent: Option<u32>,
}

impl TargetDescriptor {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            kind: TargetKind::classify(&name),
            name,
            state: None,
            parent: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_parent(mut self, parent: u32) -> Self {
        self.parent = Some(parent);
        self
    }
}

impl std::fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:>3}  {:<6} {}", self.id, self.kind.to_string(), self.name)?;
        if let Some(state) = &self.state {
            write!(f, " ({})", state)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Substring,
    Wildcard(Regex),
}

/// Name pattern selecting exactly one target.
///
/// Plain patterns match as substrings; patterns containing `*` or `?` must
/// match the whole name. The xsdb form `name =~ pattern` is accepted.
#[derive(Debug, Clone)]
pub struct TargetFilter {
    pattern: String,
    matcher: Matcher,
}

impl TargetFilter {
    pub fn new(expression: &str) -> std::result::Result<Self, String> {
        let mut pattern = expression.trim();
        if let Some(rest) = pattern.strip_prefix("name") {
            if let Some(rest) = rest.trim_start().strip_prefix("=~") {
                pattern = rest.trim();
            }
        }
        let pattern = pattern.trim_matches('"').trim();
        if pattern.is_empty() {
            return Err(format!("Target filter '{}' is empty", expression));
        }

        let matcher = if pattern.contains(['*', '?']) {
            let mut re = String::from("^");
            for c in pattern.chars() {
                match c {
                    '*' => re.push_str(".*"),
                    '?' => re.push('.'),
                    other => re.push_str(&regex::escape(&other.to_string())),
                }
            }
            re.push('$');
            let regex = Regex::new(&re)
                .map_err(|e| format!("Invalid target filter '{}': {}", expression, e))?;
            Matcher::Wildcard(regex)
        } else {
            Matcher::Substring
        };

        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            Matcher::Substring => name.contains(&self.pattern),
            Matcher::Wildcard(re) => re.is_match(name),
        }
    }
}

impl std::fmt::Display for TargetFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

impl std::str::FromStr for TargetFilter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Target enumeration and resolution through a transport handle
pub struct TargetRegistry;

impl TargetRegistry {
    /// Query every target currently visible on the chain.
    ///
    /// Each call re-queries the server; the result is a snapshot.
    pub async fn enumerate<S: DebugServer>(
        transport: &mut TransportHandle<S>,
    ) -> Result<Vec<TargetDescriptor>> {
        debug!("Enumerating targets");

        let listed = transport.server_mut()?.list_targets().await;
        let targets = listed.map_err(|e| {
            // A chain we cannot list leaves nothing to operate on
            let e = match e {
                ServerError::Rejected(reason) => {
                    ServerError::ConnectionLost(format!("target listing rejected: {}", reason))
                }
                other => other,
            };
            transport.fail(e, |reason| ConnectionError::Lost(reason).into())
        })?;

        info!("Found {} targets", targets.len());
        for target in &targets {
            debug!("  {}", target);
        }
        Ok(targets)
    }

    /// Resolve `filter` to exactly one target and select it on the server
    pub async fn resolve<S: DebugServer>(
        transport: &mut TransportHandle<S>,
        filter: &TargetFilter,
    ) -> Result<TargetHandle> {
        let targets = Self::enumerate(transport).await?;
        let descriptor = Self::pick(&targets, filter)?.clone();

        let selected = transport.server_mut()?.select_target(descriptor.id).await;
        if let Err(e) = selected {
            return Err(transport.fail(e, |reason| {
                warn!("Selecting target {} failed: {}", descriptor.id, reason);
                TargetResolutionError::NoMatch {
                    filter: filter.to_string(),
                    available: targets.iter().map(|t| t.name.clone()).collect(),
                }
                .into()
            }));
        }

        info!(
            "Selected target {} '{}' ({}) for filter '{}'",
            descriptor.id, descriptor.name, descriptor.kind, filter
        );
        Ok(TargetHandle::new(descriptor, transport.epoch()))
    }

    /// Connect, list the chain and disconnect again
    pub async fn survey<S: DebugServer>(
        transport: &mut TransportHandle<S>,
        connection: &ConnectionDescriptor,
    ) -> Result<Vec<TargetDescriptor>> {
        let listed = match transport.connect(connection).await {
            Ok(()) => Self::enumerate(transport).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = transport.disconnect().await {
            warn!("Disconnect after listing targets failed: {}", e);
        }
        listed
    }

    /// Strict match: exactly one descriptor, never "the first"
    pub fn pick<'a>(
        targets: &'a [TargetDescriptor],
        filter: &TargetFilter,
    ) -> std::result::Result<&'a TargetDescriptor, TargetResolutionError> {
        let matches: Vec<&TargetDescriptor> =
            targets.iter().filter(|t| filter.matches(&t.name)).collect();

        match matches.as_slice() {
            [only] => Ok(only),
            [] => Err(TargetResolutionError::NoMatch {
                filter: filter.to_string(),
                available: targets.iter().map(|t| t.name.clone()).collect(),
            }),
            many => Err(TargetResolutionError::AmbiguousMatch {
                filter: filter.to_string(),
                matches: many.iter().map(|t| t.name.clone()).collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BringupError;
    use crate::sim::{Call, SimServer};

    fn chain() -> Vec<TargetDescriptor> {
        vec![
            TargetDescriptor::new(1, "xc7a35t"),
            TargetDescriptor::new(2, "MicroBlaze Debug Module at USER2").with_parent(1),
            TargetDescriptor::new(3, "Hart #0").with_parent(2).with_state("Running"),
        ]
    }

    #[test]
    fn test_classify() {
        assert_eq!(TargetKind::classify("xc7a35t"), TargetKind::ProgrammableLogic);
        assert_eq!(TargetKind::classify("xczu9eg"), TargetKind::ProgrammableLogic);
        assert_eq!(TargetKind::classify("Hart #0"), TargetKind::ProcessorCore);
        assert_eq!(TargetKind::classify("MicroBlaze #0"), TargetKind::ProcessorCore);
        assert_eq!(TargetKind::classify("ARM Cortex-A9 MPCore #0"), TargetKind::ProcessorCore);
        assert_eq!(TargetKind::classify("MicroBlaze Debug Module at USER2"), TargetKind::Other);
        assert_eq!(TargetKind::classify("APU"), TargetKind::Other);
        assert_eq!(TargetKind::classify("xilinx_tcf"), TargetKind::Other);
    }

    #[test]
    fn test_filter_substring() {
        let filter = TargetFilter::new("Hart").unwrap();
        assert!(filter.matches("Hart #0"));
        assert!(filter.matches("RISC-V Hart #1"));
        assert!(!filter.matches("hart #0"));
    }

    #[test]
    fn test_filter_wildcard_matches_whole_name() {
        let filter = TargetFilter::new("*Hart*").unwrap();
        assert!(filter.matches("Hart #0"));

        let filter = TargetFilter::new("Hart*").unwrap();
        assert!(filter.matches("Hart #0"));
        assert!(!filter.matches("RISC-V Hart #0"));

        let filter = TargetFilter::new("xc7a??t").unwrap();
        assert!(filter.matches("xc7a35t"));
        assert!(!filter.matches("xc7a100t"));
    }

    #[test]
    fn test_filter_accepts_xsdb_syntax() {
        let filter = TargetFilter::new("name =~ *Hart*").unwrap();
        assert_eq!(filter.pattern(), "*Hart*");

        let filter = TargetFilter::new("name=~\"xc7a35t\"").unwrap();
        assert_eq!(filter.pattern(), "xc7a35t");
    }

    #[test]
    fn test_filter_metacharacters_are_literal() {
        let filter = TargetFilter::new("Hart #0*").unwrap();
        assert!(filter.matches("Hart #0 (Running)"));
        let filter = TargetFilter::new("a.c*").unwrap();
        assert!(!filter.matches("abc"));
    }

    #[test]
    fn test_empty_filter_rejected() {
        assert!(TargetFilter::new("").is_err());
        assert!(TargetFilter::new("   ").is_err());
        assert!(TargetFilter::new("name =~ ").is_err());
    }

    #[test]
    fn test_pick_exactly_one() {
        let targets = chain();
        let filter = TargetFilter::new("xc7a35t").unwrap();
        let picked = TargetRegistry::pick(&targets, &filter).unwrap();
        assert_eq!(picked.id, 1);
    }

    #[test]
    fn test_pick_no_match() {
        let targets = chain();
        let filter = TargetFilter::new("xc7z020").unwrap();
        let err = TargetRegistry::pick(&targets, &filter).unwrap_err();
        match err {
            TargetResolutionError::NoMatch { filter, available } => {
                assert_eq!(filter, "xc7z020");
                assert_eq!(available.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pick_ambiguous_never_takes_first() {
        let mut targets = chain();
        targets.push(TargetDescriptor::new(4, "Hart #1").with_parent(2));
        let err = TargetRegistry::pick(&targets, &TargetFilter::new("Hart").unwrap()).unwrap_err();
        assert_eq!(
            err,
            TargetResolutionError::AmbiguousMatch {
                filter: "Hart".to_string(),
                matches: vec!["Hart #0".to_string(), "Hart #1".to_string()],
            }
        );
    }

    #[test]
    fn test_pick_empty_chain() {
        let err = TargetRegistry::pick(&[], &TargetFilter::new("Hart").unwrap()).unwrap_err();
        assert!(matches!(err, TargetResolutionError::NoMatch { .. }));
    }

    #[tokio::test]
    async fn test_enumerate_requires_connection() {
        let mut transport = TransportHandle::new(SimServer::arty());
        let err = TargetRegistry::enumerate(&mut transport).await.unwrap_err();
        assert_eq!(err, BringupError::Connection(ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn test_resolve_selects_on_server() {
        let sim = SimServer::arty();
        let log = sim.log();
        let mut transport = TransportHandle::new(sim);
        transport.connect(&ConnectionDescriptor::default()).await.unwrap();

        let handle = TargetRegistry::resolve(&mut transport, &TargetFilter::new("Hart").unwrap())
            .await
            .unwrap();
        assert_eq!(handle.descriptor().name, "Hart #0");
        assert_eq!(handle.epoch(), 1);

        let calls = log.calls();
        assert_eq!(calls[1], Call::ListTargets);
        assert_eq!(calls[2], Call::Select(handle.descriptor().id));
    }

    #[tokio::test]
    async fn test_resolve_ambiguous_does_not_select() {
        let sim = SimServer::new(vec![
            TargetDescriptor::new(1, "xc7a35t"),
            TargetDescriptor::new(2, "Hart #0"),
            TargetDescriptor::new(3, "Hart #1"),
        ]);
        let log = sim.log();
        let mut transport = TransportHandle::new(sim);
        transport.connect(&ConnectionDescriptor::default()).await.unwrap();

        let err = TargetRegistry::resolve(&mut transport, &TargetFilter::new("Hart").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Resolution);
        assert!(!log.calls().iter().any(|c| matches!(c, Call::Select(_))));
    }

    #[tokio::test]
    async fn test_rejected_listing_is_a_lost_connection() {
        let sim = SimServer::arty().fail_list_targets("no hw_server connection");
        let log = sim.log();
        let mut transport = TransportHandle::new(sim);
        transport.connect(&ConnectionDescriptor::default()).await.unwrap();

        let err = TargetRegistry::enumerate(&mut transport).await.unwrap_err();
        assert!(matches!(
            err,
            BringupError::Connection(ConnectionError::Lost(ref reason))
                if reason.contains("no hw_server connection")
        ));
        assert!(!transport.is_connected());

        // Still torn down exactly once
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
        assert_eq!(log.count(|c| *c == Call::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_rejected_select_is_no_match() {
        let sim = SimServer::arty().fail_select("target 3 vanished");
        let mut transport = TransportHandle::new(sim);
        transport.connect(&ConnectionDescriptor::default()).await.unwrap();

        let err = TargetRegistry::resolve(&mut transport, &TargetFilter::new("Hart").unwrap())
            .await
            .unwrap_err();
        match err {
            BringupError::Resolution(TargetResolutionError::NoMatch { filter, available }) => {
                assert_eq!(filter, "Hart");
                assert_eq!(available.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_survey_always_disconnects() {
        let sim = SimServer::arty();
        let log = sim.log();
        let mut transport = TransportHandle::new(sim);

        let targets = TargetRegistry::survey(&mut transport, &ConnectionDescriptor::default())
            .await
            .unwrap();
        assert_eq!(targets.len(), 3);
        assert!(!transport.is_connected());
        assert_eq!(
            log.calls(),
            vec![
                Call::Connect("tcp:127.0.0.1:3121".to_string()),
                Call::ListTargets,
                Call::Disconnect,
            ]
        );
    }

    #[tokio::test]
    async fn test_enumerate_is_a_fresh_snapshot() {
        let sim = SimServer::arty();
        let chain = sim.chain();
        let mut transport = TransportHandle::new(sim);
        transport.connect(&ConnectionDescriptor::default()).await.unwrap();

        let before = TargetRegistry::enumerate(&mut transport).await.unwrap();
        chain.lock().unwrap().push(TargetDescriptor::new(9, "Hart #1"));
        let after = TargetRegistry::enumerate(&mut transport).await.unwrap();
        assert_eq!(after.len(), before.len() + 1);
    }
}
