//! Exclusive device lease for remote runs and scratch directory handling.

use crate::supervisor::error::RunError;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const LEASE_FILE_NAME: &str = "device.lease";

/// Held while a remote run owns the machine. Only one lease file can exist
/// per lease directory; a file left behind by a pid that no longer exists is
/// reclaimed.
#[derive(Debug)]
pub struct DeviceLease {
    path: PathBuf,
}

impl DeviceLease {
    pub fn acquire(dir: &Path, run_id: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create lease directory {}", dir.display()))?;
        let path = dir.join(LEASE_FILE_NAME);

        let mut reclaimed = false;
        let mut file = loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .map(|contents| contents.trim().to_owned())
                        .unwrap_or_else(|_| "an unknown run".to_owned());
                    if reclaimed || !holder_is_gone(&holder) {
                        return Err(RunError::LeaseHeld { holder }.into());
                    }
                    tracing::warn!(path = %path.display(), holder, "reclaiming stale device lease");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => {
                            return Err(err).with_context(|| {
                                format!("failed to remove stale lease {}", path.display())
                            })
                        }
                    }
                    reclaimed = true;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create lease {}", path.display()))
                }
            }
        };

        writeln!(file, "run {run_id} (pid {})", std::process::id())
            .with_context(|| format!("failed to write lease {}", path.display()))?;
        tracing::debug!(path = %path.display(), run_id, "device lease acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to release lease {}", self.path.display()))
            }
        }
    }
}

/// Pid recorded by `acquire`, as in `run r1 (pid 5513)`.
fn recorded_pid(holder: &str) -> Option<i32> {
    let (_, rest) = holder.rsplit_once("(pid ")?;
    let (pid, _) = rest.split_once(')')?;
    pid.trim().parse().ok().filter(|pid| *pid > 0)
}

/// True only when the recorded holder pid no longer exists. Unreadable
/// holders count as alive.
fn holder_is_gone(holder: &str) -> bool {
    match recorded_pid(holder) {
        Some(pid) => matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH)),
        None => false,
    }
}

/// Removes `dir` and everything below it. A missing directory is fine.
pub async fn clear_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to clear {}", dir.display())),
    }
}
