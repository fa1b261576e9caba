//! OS-level process inspection and tree termination.
//!
//! Everything here is keyed by raw pid. A pid that no longer exists is never
//! an error: signalling it is a no-op and inspecting it yields [`ProcState::Gone`].

use std::{io, time::Duration};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Alive,
    /// Exited but not yet reaped by its parent.
    Zombie,
    Gone,
}

impl ProcState {
    pub fn has_exited(self) -> bool {
        !matches!(self, ProcState::Alive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Descendants first, root last.
    pub targets: Vec<u32>,
    /// Processes that outlived the grace period and received SIGKILL.
    pub force_killed: Vec<u32>,
    /// Still alive after SIGKILL. Non-empty means termination failed.
    pub remaining: Vec<u32>,
    pub signal_errors: Vec<String>,
}

impl TerminationReport {
    pub fn succeeded(&self) -> bool {
        self.remaining.is_empty()
    }
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    state: char,
    ppid: u32,
    pgrp: u32,
}

#[cfg(target_os = "linux")]
fn parse_stat(s: &str) -> Option<ProcStat> {
    // The command name may contain spaces and parens; fields resume after the last ')'.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let mut parts = rest.split_whitespace();
    let state = parts.next()?.chars().next()?;
    let ppid = parts.next()?.parse().ok()?;
    let pgrp = parts.next()?.parse().ok()?;
    Some(ProcStat { state, ppid, pgrp })
}

#[cfg(target_os = "linux")]
fn read_stat(pid: u32) -> Option<ProcStat> {
    let s = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&s)
}

#[cfg(unix)]
fn raw_pid(pid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid: {pid}"),
        )),
    }
}

#[cfg(unix)]
fn probe(pid: u32) -> ProcState {
    let Ok(raw) = raw_pid(pid) else {
        return ProcState::Gone;
    };
    let rc = unsafe { libc::kill(raw, 0) };
    if rc == 0 {
        return ProcState::Alive;
    }
    match io::Error::last_os_error().raw_os_error() {
        // Exists but owned by someone else.
        Some(libc::EPERM) => ProcState::Alive,
        _ => ProcState::Gone,
    }
}

#[cfg(target_os = "linux")]
pub fn inspect(pid: u32) -> ProcState {
    if pid == 0 {
        return ProcState::Gone;
    }
    match read_stat(pid) {
        Some(stat) if matches!(stat.state, 'Z' | 'X' | 'x') => ProcState::Zombie,
        Some(_) => ProcState::Alive,
        // /proc may be mounted with hidepid; fall back to a null signal.
        None => probe(pid),
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn inspect(pid: u32) -> ProcState {
    probe(pid)
}

#[cfg(not(unix))]
pub fn inspect(_pid: u32) -> ProcState {
    ProcState::Alive
}

pub fn is_alive(pid: u32) -> bool {
    inspect(pid) == ProcState::Alive
}

/// All transitive children of `root`, deepest first. Excludes `root`.
#[cfg(target_os = "linux")]
pub fn descendants(root: u32) -> Vec<u32> {
    use std::collections::HashMap;

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if let Some(stat) = read_stat(pid) {
            children.entry(stat.ppid).or_default().push(pid);
        }
    }

    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !out.contains(&kid) {
                    out.push(kid);
                    stack.push(kid);
                }
            }
        }
    }
    out.reverse();
    out
}

#[cfg(not(target_os = "linux"))]
pub fn descendants(_root: u32) -> Vec<u32> {
    // Covered by the process-group signal below.
    Vec::new()
}

/// Whether `pid` leads its own process group (true for children we spawn with setsid).
#[cfg(target_os = "linux")]
fn leads_group(pid: u32) -> bool {
    read_stat(pid).is_some_and(|s| s.pgrp == pid)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn leads_group(pid: u32) -> bool {
    let Ok(raw) = raw_pid(pid) else {
        return false;
    };
    unsafe { libc::getpgid(raw) == raw }
}

#[cfg(unix)]
fn deliver(target: libc::pid_t, sig: Signal) -> io::Result<()> {
    let rc = unsafe { libc::kill(target, sig.raw()) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(unix)]
pub fn signal(pid: u32, sig: Signal) -> io::Result<()> {
    deliver(raw_pid(pid)?, sig)
}

#[cfg(not(unix))]
pub fn signal(pid: u32, _sig: Signal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot signal pid {pid} on this platform"),
    ))
}

#[cfg(unix)]
fn signal_group(pgid: u32, sig: Signal) -> io::Result<()> {
    deliver(-raw_pid(pgid)?, sig)
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _sig: Signal) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn leads_group(_pid: u32) -> bool {
    false
}

fn signal_all(pids: &[u32], group: Option<u32>, sig: Signal, errors: &mut Vec<String>) {
    for &pid in pids {
        if let Err(e) = signal(pid, sig) {
            errors.push(format!("{sig:?} {pid}: {e}"));
        }
    }
    if let Some(pgid) = group
        && let Err(e) = signal_group(pgid, sig)
    {
        errors.push(format!("{sig:?} group {pgid}: {e}"));
    }
}

/// Polls until every pid has exited or `timeout` elapses. Returns the survivors.
pub async fn wait_for_exit(pids: &[u32], timeout: Duration) -> Vec<u32> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let alive: Vec<u32> = pids.iter().copied().filter(|&p| is_alive(p)).collect();
        if alive.is_empty() || tokio::time::Instant::now() >= deadline {
            return alive;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// SIGTERM to `root` and all its descendants, then SIGKILL to whatever is
/// still alive after `grace`, then a short wait to confirm.
pub async fn terminate_tree(root: u32, grace: Duration) -> TerminationReport {
    let mut report = TerminationReport {
        targets: descendants(root),
        ..Default::default()
    };
    report.targets.push(root);
    let group = leads_group(root).then_some(root);

    signal_all(
        &report.targets,
        group,
        Signal::Terminate,
        &mut report.signal_errors,
    );
    let survivors = wait_for_exit(&report.targets, grace).await;
    if survivors.is_empty() {
        return report;
    }

    tracing::warn!(
        root,
        ?survivors,
        grace_ms = grace.as_millis() as u64,
        "escalating to SIGKILL"
    );
    let group = group.filter(|&g| survivors.contains(&g));
    signal_all(&survivors, group, Signal::Kill, &mut report.signal_errors);
    report.remaining = wait_for_exit(&survivors, KILL_VERIFY_TIMEOUT).await;
    report.force_killed = survivors;
    report
}
