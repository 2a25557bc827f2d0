//! OS-level port and process reconciliation.
//!
//! An interactive caller typically re-runs `start` many times without ever
//! calling `stop`, so stray servers and tunnel agents from abandoned
//! processes pile up on the target port. In-memory handles are useless for
//! finding those; this module goes through the OS instead.
//!
//! Socket owners are discovered without root and without external tooling:
//! `/proc/net/tcp` and `/proc/net/tcp6` give the socket inodes bound to the
//! target port, and a scan of `/proc/<pid>/fd` maps each inode back to the
//! process holding it. Stray tunnel agents may not bind the forwarded port
//! at all, so those are matched by executable name system-wide.
//!
//! Everything here is best-effort by contract: a missing `/proc` entry, a
//! permission error, or an already-dead pid is recorded in the
//! [`ReconcileReport`] and never aborts the pass. The report says the pass
//! completed, not that the port is provably free. It is also a blunt
//! instrument: a port or name match is the only evidence that a victim
//! process is related to this tool.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// Executable name of the tunnel agent, used for the name-based sweep.
pub const AGENT_PROCESS_NAME: &str = "ngrok";

/// Grace period between SIGTERM and the SIGKILL follow-up.
const TERM_GRACE: Duration = Duration::from_millis(300);

/// TCP socket states considered "holding the port".
/// 0x01 = ESTABLISHED, 0x0A = LISTEN.
const HELD_STATES: [u8; 2] = [0x01, 0x0A];

/// Outcome of one reconciliation pass. Sub-step failures land in `errors`
/// rather than being propagated or silently dropped.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// The port that was reconciled.
    pub port: u16,
    /// Pids found holding the port, excluding the caller.
    pub port_pids: Vec<u32>,
    /// Pids matching the tunnel agent name.
    pub agent_pids: Vec<u32>,
    /// Pids actually terminated.
    pub killed: Vec<u32>,
    /// Per-step failures encountered along the way.
    pub errors: Vec<String>,
}

impl ReconcileReport {
    /// Whether the pass completed without recording any sub-step failure.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether anything at all was found to clean up.
    pub fn found_strays(&self) -> bool {
        !self.port_pids.is_empty() || !self.agent_pids.is_empty()
    }

    fn record_error(&mut self, step: &str, detail: impl std::fmt::Display) {
        warn!(step, %detail, "reconcile sub-step failed");
        self.errors.push(format!("{step}: {detail}"));
    }
}

/// Full reconciliation pass: free the target port, then sweep stray tunnel
/// agents by name. `exclude_pid` (normally the caller's own pid) is never
/// signalled.
pub fn reconcile(port: u16, exclude_pid: u32) -> ReconcileReport {
    let mut report = free_port(port, exclude_pid);
    kill_by_name(AGENT_PROCESS_NAME, exclude_pid, &mut report);
    info!(
        port,
        port_pids = report.port_pids.len(),
        agent_pids = report.agent_pids.len(),
        killed = report.killed.len(),
        errors = report.errors.len(),
        "reconciliation pass complete"
    );
    report
}

/// Terminate every process holding a socket on `port`, except `exclude_pid`.
pub fn free_port(port: u16, exclude_pid: u32) -> ReconcileReport {
    let mut report = ReconcileReport {
        port,
        ..ReconcileReport::default()
    };

    if port == 0 {
        report.record_error("free_port", "port 0 is not a valid target");
        return report;
    }

    let mut inodes = HashSet::new();
    for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match std::fs::read_to_string(path) {
            Ok(content) => inodes.extend(socket_inodes_on_port(&content, port)),
            // tcp6 may be absent on v4-only kernels; record and move on.
            Err(e) => report.record_error("read proc net", format!("{path}: {e}")),
        }
    }

    if inodes.is_empty() {
        debug!(port, "no sockets found on port");
        return report;
    }

    let pids = pids_owning_inodes(&inodes, &mut report);
    report.port_pids = pids
        .into_iter()
        .filter(|&pid| pid != exclude_pid)
        .collect();

    let targets = report.port_pids.clone();
    terminate_pids(&targets, &mut report);
    report
}

/// Terminate every process whose executable name matches `name`,
/// system-wide. Coarser than the port scan on purpose: a tunnel agent
/// forwards the port without necessarily binding it locally.
pub fn kill_by_name(name: &str, exclude_pid: u32, report: &mut ReconcileReport) {
    let mut matches = Vec::new();
    let proc_iter = match std::fs::read_dir("/proc") {
        Ok(iter) => iter,
        Err(e) => {
            report.record_error("list /proc", e);
            return;
        }
    };

    for entry in proc_iter.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == exclude_pid {
            continue;
        }
        if process_name_matches(&entry.path(), name) {
            matches.push(pid);
        }
    }

    if !matches.is_empty() {
        info!(name, pids = ?matches, "found stray agent processes");
    }
    report.agent_pids = matches.clone();
    terminate_pids(&matches, report);
}

/// SIGTERM each pid, give survivors a short grace period, then SIGKILL.
fn terminate_pids(pids: &[u32], report: &mut ReconcileReport) {
    if pids.is_empty() {
        return;
    }

    for &pid in pids {
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                debug!(pid, "sent SIGTERM");
                report.killed.push(pid);
            }
            // ESRCH means the process is already gone, which is success.
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => report.record_error("SIGTERM", format!("pid {pid}: {e}")),
        }
    }

    std::thread::sleep(TERM_GRACE);

    for &pid in pids {
        // Signal 0 probes liveness without delivering anything.
        if kill(Pid::from_raw(pid as i32), None).is_ok() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => debug!(pid, "sent SIGKILL to survivor"),
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => report.record_error("SIGKILL", format!("pid {pid}: {e}")),
            }
        }
    }
}

/// Extract socket inodes bound to `port` from `/proc/net/tcp[6]` content.
///
/// Each data line looks like:
/// ```text
///    0: 00000000:1F40 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 ...
/// ```
/// The local address is field 1 (`hexaddr:hexport`), the state field 3, and
/// the inode field 9. Malformed lines are skipped, not errors; the kernel
/// format is stable but a partial read should not sink the pass.
fn socket_inodes_on_port(content: &str, port: u16) -> Vec<u64> {
    let mut inodes = Vec::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }

        let Some(local_port) = parts[1]
            .rsplit(':')
            .next()
            .and_then(|hex| u16::from_str_radix(hex, 16).ok())
        else {
            continue;
        };
        if local_port != port {
            continue;
        }

        let Ok(state) = u8::from_str_radix(parts[3], 16) else {
            continue;
        };
        if !HELD_STATES.contains(&state) {
            continue;
        }

        if let Ok(inode) = parts[9].parse::<u64>() {
            if inode != 0 {
                inodes.push(inode);
            }
        }
    }

    inodes
}

/// Walk `/proc/<pid>/fd` for every process and collect pids holding any of
/// the given socket inodes. Unreadable fd tables (other users' processes)
/// are skipped silently; that is the common case, not a failure.
fn pids_owning_inodes(inodes: &HashSet<u64>, report: &mut ReconcileReport) -> Vec<u32> {
    let mut owners = Vec::new();
    let proc_iter = match std::fs::read_dir("/proc") {
        Ok(iter) => iter,
        Err(e) => {
            report.record_error("list /proc", e);
            return owners;
        }
    };

    for entry in proc_iter.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };

        let fd_dir = entry.path().join("fd");
        let Ok(fds) = std::fs::read_dir(&fd_dir) else {
            continue;
        };

        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = parse_socket_link(&target.to_string_lossy()) {
                if inodes.contains(&inode) {
                    owners.push(pid);
                    break;
                }
            }
        }
    }

    owners
}

/// Parse a `socket:[12345]` fd link target into its inode.
fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Match a process against an executable name via `/proc/<pid>/comm`, with
/// the first cmdline argument's basename as fallback (comm is truncated to
/// 15 bytes by the kernel).
fn process_name_matches(proc_dir: &Path, name: &str) -> bool {
    if let Ok(comm) = std::fs::read_to_string(proc_dir.join("comm")) {
        if comm.trim() == name {
            return true;
        }
    }

    if let Ok(cmdline) = std::fs::read(proc_dir.join("cmdline")) {
        if let Some(argv0) = cmdline.split(|&b| b == 0).next() {
            let argv0 = String::from_utf8_lossy(argv0);
            if Path::new(argv0.as_ref())
                .file_name()
                .is_some_and(|f| f == name)
            {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const PROC_NET_TCP_FIXTURE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   0: 00000000:1F40 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 4242 1 0000000000000000 100 0 0 10 0\n   1: 0100007F:1F40 0100007F:D431 01 00000000:00000000 00:00000000 00000000  1000        0 4243 1 0000000000000000 100 0 0 10 0\n   2: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 5555 1 0000000000000000 100 0 0 10 0\n   3: 0100007F:1F40 0100007F:D432 06 00000000:00000000 00:00000000 00000000  1000        0 4244 1 0000000000000000 100 0 0 10 0\n";

    #[test]
    fn inodes_for_matching_port_and_state() {
        // 0x1F40 = 8000: one LISTEN and one ESTABLISHED socket match,
        // the TIME_WAIT (06) one does not.
        let inodes = socket_inodes_on_port(PROC_NET_TCP_FIXTURE, 8000);
        assert_eq!(inodes, vec![4242, 4243]);
    }

    #[test]
    fn inodes_skip_other_ports() {
        let inodes = socket_inodes_on_port(PROC_NET_TCP_FIXTURE, 80);
        assert_eq!(inodes, vec![5555]);
        assert!(socket_inodes_on_port(PROC_NET_TCP_FIXTURE, 9999).is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let content = "header\ngarbage line\n   0: nonsense\n   1: 00000000:1F40 00000000:0000 ZZ x y z a b c d\n";
        assert!(socket_inodes_on_port(content, 8000).is_empty());
    }

    #[test]
    fn socket_link_parsing() {
        assert_eq!(parse_socket_link("socket:[98765]"), Some(98765));
        assert_eq!(parse_socket_link("pipe:[123]"), None);
        assert_eq!(parse_socket_link("/dev/null"), None);
        assert_eq!(parse_socket_link("socket:[not-a-number]"), None);
    }

    #[test]
    fn free_port_rejects_port_zero() {
        let report = free_port(0, std::process::id());
        assert!(!report.is_clean());
        assert!(report.killed.is_empty());
    }

    #[test]
    fn free_port_excludes_caller() {
        // Bind a listener ourselves: the only process on the port is us,
        // and we are excluded, so nothing may be killed.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let report = free_port(port, std::process::id());
        assert!(report.killed.is_empty());
        assert!(report.port_pids.is_empty());

        // We are demonstrably still alive and the listener still works.
        drop(listener);
    }

    #[test]
    fn free_port_on_quiet_port_is_clean_and_idempotent() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        // Listener dropped: nothing holds the port any more.
        let first = free_port(port, std::process::id());
        let second = free_port(port, std::process::id());
        assert!(first.killed.is_empty());
        assert!(second.killed.is_empty());
        assert!(!second.found_strays());
    }

    #[test]
    fn kill_by_name_without_matches() {
        let mut report = ReconcileReport::default();
        kill_by_name(
            "siteshare-test-no-such-process-name",
            std::process::id(),
            &mut report,
        );
        assert!(report.agent_pids.is_empty());
        assert!(report.killed.is_empty());
    }

    #[test]
    fn report_aggregates_errors() {
        let mut report = ReconcileReport::default();
        assert!(report.is_clean());
        report.record_error("step-a", "first failure");
        report.record_error("step-b", "second failure");
        assert!(!report.is_clean());
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].starts_with("step-a:"));
    }
}
