//! Best-effort termination of a process and its live descendants.
//!
//! Descendant enumeration is a capability: [`DescendantSource::descendants`]
//! returns `None` where the platform cannot list them, and callers fall back
//! to signalling the direct process only. Descendants are signalled deepest
//! first so that as few of them as possible get reparented before they are
//! reached.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use tracing::{debug, warn};

/// Lists live descendants of a process.
pub trait DescendantSource: Send + Sync {
    /// Live descendants of `pid`, deepest first. `None` when the platform
    /// does not support enumeration.
    fn descendants(&self, pid: u32) -> Option<Vec<u32>>;
}

/// Reads the process table from `/proc` (Linux).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcTable;

impl DescendantSource for ProcTable {
    fn descendants(&self, pid: u32) -> Option<Vec<u32>> {
        let entries = std::fs::read_dir("/proc").ok()?;
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in entries.flatten() {
            let Some(child) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                // Raced with exit.
                continue;
            };
            if let Some((state, ppid)) = parse_stat(&stat) {
                if state != 'Z' && state != 'X' {
                    children.entry(ppid).or_default().push(child);
                }
            }
        }
        Some(order_deepest_first(pid, &children))
    }
}

/// Enumeration not available; every query degrades to "unsupported".
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl DescendantSource for Unsupported {
    fn descendants(&self, _pid: u32) -> Option<Vec<u32>> {
        None
    }
}

/// The descendant source for this platform.
pub fn system() -> &'static dyn DescendantSource {
    static PROC: ProcTable = ProcTable;
    static NONE: Unsupported = Unsupported;
    if cfg!(target_os = "linux") && Path::new("/proc/self/stat").exists() {
        &PROC
    } else {
        &NONE
    }
}

/// Parse `(state, ppid)` out of a `/proc/<pid>/stat` line. The command name
/// is parenthesised and may itself contain spaces or parentheses, so fields
/// are counted from the last `)`.
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

fn order_deepest_first(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    // Breadth-first walk gives non-decreasing depth; reversing it puts the
    // deepest processes first.
    let mut order = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        for &kid in children.get(&parent).into_iter().flatten() {
            if seen.insert(kid) {
                order.push(kid);
                queue.push_back(kid);
            }
        }
    }
    order.reverse();
    order
}

/// Signal every live descendant of `pid`. Returns how many were signalled.
///
/// Does not touch `pid` itself; the owner of the process handle signals it
/// so the signal can never hit a reaped and reused pid.
pub fn kill_descendants(pid: u32, force: bool, source: &dyn DescendantSource) -> usize {
    match source.descendants(pid) {
        Some(descendants) => {
            for &child in &descendants {
                signal_pid(child, force);
            }
            if !descendants.is_empty() {
                debug!(pid, count = descendants.len(), force, "Signalled descendants");
            }
            descendants.len()
        }
        None => {
            debug!(pid, "Descendant enumeration unsupported, killing direct process only");
            0
        }
    }
}

/// Send SIGTERM (graceful) or SIGKILL (force) to `pid`. A process that is
/// already gone is not an error.
#[cfg(unix)]
pub fn signal_pid(pid: u32, force: bool) {
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; pid is a positive
    // value taken from the process table or our own child handle.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(raw, signal) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, error = %err, "Failed to send signal");
        }
    }
}

#[cfg(not(unix))]
pub fn signal_pid(pid: u32, _force: bool) {
    debug!(pid, "Signalling arbitrary pids is not supported on this platform");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_stat_handles_odd_command_names() {
        let line = "1234 (weird) name)) S 42 1234 1234 0 -1 4194560 100 0 0 0";
        assert_eq!(parse_stat(line), Some(('S', 42)));
    }

    #[test]
    fn parse_stat_rejects_garbage() {
        assert_eq!(parse_stat("no parens here"), None);
        assert_eq!(parse_stat("1 (x) R notanumber"), None);
    }

    #[test]
    fn deepest_descendants_come_first() {
        // 1 -> 2 -> 4 -> 5, 1 -> 3
        let children: HashMap<u32, Vec<u32>> =
            [(1, vec![2, 3]), (2, vec![4]), (4, vec![5]), (9, vec![10])]
                .into_iter()
                .collect();
        let order = order_deepest_first(1, &children);
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], 5);
        let pos = |p: u32| order.iter().position(|&x| x == p).unwrap();
        assert!(pos(4) < pos(2));
        assert!(!order.contains(&10));
    }

    #[test]
    fn unsupported_source_degrades() {
        assert_eq!(kill_descendants(u32::MAX, true, &Unsupported), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_table_sees_spawned_child() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let me = std::process::id();
        let found = ProcTable.descendants(me).unwrap();
        assert!(found.contains(&child.id()));
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
