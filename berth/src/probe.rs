//! OS-level port probing.
//!
//! A probe answers "is this TCP port on loopback actually bindable right
//! now?" by attempting a transient bind that is dropped immediately. The
//! trait split mirrors the rest of the crate: a system implementation for
//! production and a scripted one for deterministic tests.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::net::TcpListener;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::port::Port;

/// Default wall-clock budget for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// How long a system-usage lookup stays cached.
pub const USAGE_CACHE_TTL: Duration = Duration::from_secs(5);

/// Three-state outcome of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The port could be bound; it is free right now.
    Free,
    /// The bind failed with address-in-use.
    InUse,
    /// The probe itself failed; the port's state is unknown.
    Error(ProbeErrorKind),
}

/// Why a probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeErrorKind {
    /// The OS denied the bind for permission reasons.
    PermissionDenied,
    /// The probe exceeded its wall-clock budget.
    Timeout,
    /// Any other OS-level failure.
    Os,
}

/// What the system reports about a port's occupant, when a process-listing
/// tool is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemUsage {
    /// Protocol as reported (`tcp`).
    pub protocol: String,
    /// Owning process id, when the tool reports one.
    pub pid: Option<u32>,
    /// Owning process name, when the tool reports one.
    pub process: Option<String>,
}

/// Trait for probing port availability.
pub trait PortProber: Send + Sync {
    /// Probe a single port on loopback.
    ///
    /// Must not hold the port, must not block past the configured budget,
    /// and must never panic on error.
    fn probe(&self, port: Port) -> ProbeOutcome;

    /// Best-effort process information for an occupied port.
    ///
    /// The default implementation reports nothing.
    fn system_usage(&self, port: Port) -> Option<SystemUsage> {
        let _ = port;
        None
    }
}

/// Production prober using a transient loopback bind.
///
/// `SO_REUSEADDR` is deliberately left off so the probe sees the same
/// availability a real server would. Usage enrichment shells out to `ss`
/// (falling back to `lsof`) under the probe's wall-clock budget and caches
/// results for [`USAGE_CACHE_TTL`].
pub struct SystemProber {
    timeout: Duration,
    usage_cache: Mutex<HashMap<u16, (Instant, Option<SystemUsage>)>>,
}

impl SystemProber {
    /// Create a system prober with the default budget.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    /// Create a system prober with an explicit wall-clock budget.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            usage_cache: Mutex::new(HashMap::new()),
        }
    }

    fn lookup_usage(&self, port: Port) -> Option<SystemUsage> {
        parse_ss_output(
            &run_listing_tool("ss", &["-ltnpH"], self.timeout)?,
            port.value(),
        )
        .or_else(|| {
            parse_lsof_output(&run_listing_tool(
                "lsof",
                &["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN"],
                self.timeout,
            )?)
        })
    }
}

impl Default for SystemProber {
    fn default() -> Self {
        Self::new()
    }
}

impl PortProber for SystemProber {
    fn probe(&self, port: Port) -> ProbeOutcome {
        match TcpListener::bind(("127.0.0.1", port.value())) {
            Ok(listener) => {
                drop(listener);
                ProbeOutcome::Free
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => ProbeOutcome::InUse,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ProbeOutcome::Error(ProbeErrorKind::PermissionDenied)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                ProbeOutcome::Error(ProbeErrorKind::Timeout)
            }
            Err(_) => ProbeOutcome::Error(ProbeErrorKind::Os),
        }
    }

    fn system_usage(&self, port: Port) -> Option<SystemUsage> {
        let now = Instant::now();
        {
            let cache = self.usage_cache.lock();
            if let Some((fetched_at, usage)) = cache.get(&port.value()) {
                if now.duration_since(*fetched_at) < USAGE_CACHE_TTL {
                    return usage.clone();
                }
            }
        }

        let usage = self.lookup_usage(port);
        self.usage_cache
            .lock()
            .insert(port.value(), (now, usage.clone()));
        usage
    }
}

/// Run a listing tool, killing it if it outlives the budget.
fn run_listing_tool(tool: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let mut child = Command::new(tool)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    return None;
                }
                break;
            }
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(5)),
            Err(_) => return None,
        }
    }

    let mut stdout = String::new();
    child.stdout.take()?.read_to_string(&mut stdout).ok()?;
    Some(stdout)
}

/// Parse `ss -ltnpH` output for a specific local port.
fn parse_ss_output(output: &str, port: u16) -> Option<SystemUsage> {
    let needle = format!(":{port}");
    for line in output.lines() {
        let mut columns = line.split_whitespace();
        // LISTEN lines: State Recv-Q Send-Q Local:Port Peer:Port [Process]
        let Some(local) = columns.nth(3) else {
            continue;
        };
        if !local.ends_with(&needle) {
            continue;
        }
        let process_column = columns.nth(1).unwrap_or("");
        let process = process_column
            .split('"')
            .nth(1)
            .map(std::string::ToString::to_string);
        let pid = process_column
            .split("pid=")
            .nth(1)
            .and_then(|rest| rest.split(',').next())
            .and_then(|raw| raw.parse().ok());
        return Some(SystemUsage {
            protocol: "tcp".into(),
            pid,
            process,
        });
    }
    None
}

/// Parse `lsof -nP -iTCP:<port> -sTCP:LISTEN` output.
fn parse_lsof_output(output: &str) -> Option<SystemUsage> {
    let line = output.lines().nth(1)?;
    let mut columns = line.split_whitespace();
    let process = columns.next().map(std::string::ToString::to_string);
    let pid = columns.next().and_then(|raw| raw.parse().ok());
    Some(SystemUsage {
        protocol: "tcp".into(),
        pid,
        process,
    })
}

/// Deterministic prober for tests.
///
/// Ports marked occupied probe as `InUse`; ports marked failing probe as
/// `Error`; everything else probes as `Free`.
///
/// # Examples
///
/// ```
/// use berth::probe::{PortProber, ProbeOutcome, ScriptedProber};
/// use berth::Port;
///
/// let prober = ScriptedProber::new();
/// let port = Port::try_from(3000).unwrap();
/// assert_eq!(prober.probe(port), ProbeOutcome::Free);
///
/// prober.occupy(port);
/// assert_eq!(prober.probe(port), ProbeOutcome::InUse);
/// ```
#[derive(Default)]
pub struct ScriptedProber {
    occupied: Mutex<HashSet<u16>>,
    failing: Mutex<HashSet<u16>>,
    usage: Mutex<HashMap<u16, SystemUsage>>,
}

impl ScriptedProber {
    /// Create a prober where every port is free.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a port as occupied.
    pub fn occupy(&self, port: Port) {
        self.occupied.lock().insert(port.value());
    }

    /// Mark a port as free again.
    pub fn vacate(&self, port: Port) {
        self.occupied.lock().remove(&port.value());
    }

    /// Make probes of a port fail.
    pub fn fail(&self, port: Port) {
        self.failing.lock().insert(port.value());
    }

    /// Attach scripted system usage for a port.
    pub fn set_usage(&self, port: Port, usage: SystemUsage) {
        self.usage.lock().insert(port.value(), usage);
    }
}

impl PortProber for ScriptedProber {
    fn probe(&self, port: Port) -> ProbeOutcome {
        if self.failing.lock().contains(&port.value()) {
            ProbeOutcome::Error(ProbeErrorKind::Timeout)
        } else if self.occupied.lock().contains(&port.value()) {
            ProbeOutcome::InUse
        } else {
            ProbeOutcome::Free
        }
    }

    fn system_usage(&self, port: Port) -> Option<SystemUsage> {
        self.usage.lock().get(&port.value()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_probe_free_then_in_use() {
        // Bind an ephemeral listener ourselves, then probe it.
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let raw = listener.local_addr().unwrap().port();
        let port = Port::try_from(raw).unwrap();

        let prober = SystemProber::new();
        assert_eq!(prober.probe(port), ProbeOutcome::InUse);

        drop(listener);
        assert_eq!(prober.probe(port), ProbeOutcome::Free);
    }

    #[test]
    fn test_probe_does_not_hold_the_port() {
        let prober = SystemProber::new();
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let raw = listener.local_addr().unwrap().port();
        drop(listener);
        let port = Port::try_from(raw).unwrap();

        assert_eq!(prober.probe(port), ProbeOutcome::Free);
        // If the probe leaked its listener this second bind would fail.
        assert!(TcpListener::bind(("127.0.0.1", raw)).is_ok());
    }

    #[test]
    fn test_scripted_prober() {
        let prober = ScriptedProber::new();
        let port = Port::try_from(3000).unwrap();

        assert_eq!(prober.probe(port), ProbeOutcome::Free);
        prober.occupy(port);
        assert_eq!(prober.probe(port), ProbeOutcome::InUse);
        prober.vacate(port);
        assert_eq!(prober.probe(port), ProbeOutcome::Free);
        prober.fail(port);
        assert_eq!(
            prober.probe(port),
            ProbeOutcome::Error(ProbeErrorKind::Timeout)
        );
    }

    #[test]
    fn test_parse_ss_line() {
        let output = "LISTEN 0 4096 127.0.0.1:8080 0.0.0.0:* users:((\"node\",pid=12345,fd=23))\n";
        let usage = parse_ss_output(output, 8080).unwrap();
        assert_eq!(usage.pid, Some(12345));
        assert_eq!(usage.process.as_deref(), Some("node"));
        assert!(parse_ss_output(output, 8081).is_none());
    }

    #[test]
    fn test_parse_lsof_header_and_row() {
        let output = "COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME\n\
                      node 4242 dev 23u IPv4 0x0 0t0 TCP 127.0.0.1:8080 (LISTEN)\n";
        let usage = parse_lsof_output(output).unwrap();
        assert_eq!(usage.pid, Some(4242));
        assert_eq!(usage.process.as_deref(), Some("node"));
    }
}
