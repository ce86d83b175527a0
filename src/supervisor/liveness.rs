use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getppid, Pid};

/// Parent pid a process is re-parented to once its parent dies.
pub const ORPHAN_PARENT_PID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentStatus {
    Alive,
    /// Our parent pid became the orphan sentinel.
    Orphaned,
    /// Our parent pid changed to something other than the supervisor.
    Reparented { current: u32 },
    /// The supervisor pid no longer exists.
    Gone,
}

impl ParentStatus {
    pub fn is_alive(self) -> bool {
        self == ParentStatus::Alive
    }
}

/// Answers whether the process that owns the worker is still running.
pub trait ParentLiveness: Send + Sync {
    fn status(&self) -> ParentStatus;
}

/// Checks the supervisor through the OS. Child workers also compare
/// `getppid()` against the expected pid; in-process workers only check that
/// the owning pid exists.
#[derive(Debug, Clone, Copy)]
pub struct OsParentLiveness {
    parent_pid: u32,
    check_reparenting: bool,
}

impl OsParentLiveness {
    /// For a worker spawned as a child of `parent_pid`.
    pub fn parent(parent_pid: u32) -> Self {
        Self {
            parent_pid,
            check_reparenting: true,
        }
    }

    /// For a worker running inside the process `owner_pid`.
    pub fn owner(owner_pid: u32) -> Self {
        Self {
            parent_pid: owner_pid,
            check_reparenting: false,
        }
    }
}

impl ParentLiveness for OsParentLiveness {
    fn status(&self) -> ParentStatus {
        if self.check_reparenting {
            let current = getppid().as_raw() as u32;
            if current == ORPHAN_PARENT_PID {
                return ParentStatus::Orphaned;
            }
            if current != self.parent_pid {
                return ParentStatus::Reparented { current };
            }
        }

        let Ok(raw) = i32::try_from(self.parent_pid) else {
            return ParentStatus::Gone;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => ParentStatus::Alive,
            Err(Errno::ESRCH) => ParentStatus::Gone,
            // EPERM still proves the pid exists.
            Err(_) => ParentStatus::Alive,
        }
    }
}
