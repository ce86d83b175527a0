use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};
use tokio::time::{sleep, Instant};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// OS process-subtree operations used when a run is interrupted.
pub trait ProcessTree: Send + Sync {
    /// Every live descendant of `root`, excluding `root` and threads.
    fn descendants(&self, root: u32) -> Vec<u32>;

    fn kill(&self, pid: u32) -> Result<()>;

    fn is_running(&self, pid: u32) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProcessTree;

impl ProcessTree for SysinfoProcessTree {
    fn descendants(&self, root: u32) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes();

        let threads: HashSet<Pid> = system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                process
                    .tasks()
                    .map(|tasks| tasks.iter().filter(move |task| *task != pid).copied())
            })
            .flatten()
            .collect();

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in system.processes() {
            if threads.contains(pid) || process.status() == ProcessStatus::Zombie {
                continue;
            }
            if let Some(parent) = process.parent() {
                children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(pid.as_u32());
            }
        }

        let mut found = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(pid) = queue.pop_front() {
            for child in children.remove(&pid).unwrap_or_default() {
                found.push(child);
                queue.push_back(child);
            }
        }
        found
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let raw = i32::try_from(pid).with_context(|| format!("pid {pid} out of range"))?;
        match kill(NixPid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to kill process {pid}")),
        }
    }

    fn is_running(&self, pid: u32) -> bool {
        let mut system = System::new();
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return false;
        }
        system
            .process(pid)
            .map(|process| process.status() != ProcessStatus::Zombie)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    pub killed: Vec<u32>,
    /// Descendants still running when the wait expired.
    pub survivors: Vec<u32>,
}

/// Sends SIGKILL to every descendant of `root` and waits up to `wait` for
/// all of them to exit. Zombies count as exited.
pub async fn terminate_descendants(
    tree: &dyn ProcessTree,
    root: u32,
    wait: Duration,
) -> TerminationReport {
    let mut report = TerminationReport::default();
    for pid in tree.descendants(root) {
        match tree.kill(pid) {
            Ok(()) => report.killed.push(pid),
            Err(err) => tracing::warn!(pid, error = %err, "failed to kill descendant"),
        }
    }

    let deadline = Instant::now() + wait;
    let mut waiting = report.killed.clone();
    loop {
        waiting.retain(|pid| tree.is_running(*pid));
        if waiting.is_empty() || Instant::now() >= deadline {
            break;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }

    if !waiting.is_empty() {
        tracing::warn!(survivors = ?waiting, "descendants still running after kill");
    }
    report.survivors = waiting;
    report
}
