// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Suspension of the gadget HAL while the gadget is rebound.
//!
//! The HAL keeps rewriting `UDC` to the value it expects. Stopping it for the
//! duration of an apply keeps it from racing the unbind/rebind sequence.

use std::fs::{self, File};
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use anyhow::{Context, bail};
use tracing::{debug, warn};

use crate::sys::{self, PROC_SUPER_MAGIC, check_fs_magic};

/// Sends `SIGSTOP` on creation and `SIGCONT` on drop.
#[derive(Debug)]
pub struct ProcessStopper {
    pidfd: OwnedFd,
}

impl ProcessStopper {
    pub fn new(pidfd: OwnedFd) -> io::Result<Self> {
        let stopper = Self { pidfd };
        stopper.signal(libc::SIGSTOP)?;
        Ok(stopper)
    }

    fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        debug!(operation = "hal_signal", signal, "Signalling gadget HAL");
        sys::pidfd_send_signal(self.pidfd.as_fd(), signal)
    }
}

impl Drop for ProcessStopper {
    fn drop(&mut self) {
        if let Err(err) = self.signal(libc::SIGCONT) {
            warn!(operation = "hal_resume", error = %err, "Failed to resume gadget HAL");
        }
    }
}

/// Open a pidfd for every process whose executable is named `name`.
///
/// Kernel threads, processes that exit mid-scan and processes we may not
/// inspect are skipped.
pub fn find_processes(proc_root: &Path, name: &str, verify_magic: bool) -> io::Result<Vec<OwnedFd>> {
    if verify_magic {
        check_fs_magic(File::open(proc_root)?, PROC_SUPER_MAGIC)?;
    }

    let mut found = Vec::new();
    for entry in fs::read_dir(proc_root)? {
        let entry = entry?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<libc::pid_t>().ok())
        else {
            continue;
        };

        let exe = match fs::read_link(entry.path().join("exe")) {
            Ok(exe) => exe,
            Err(e) if skippable(&e) => continue,
            Err(e) => return Err(e),
        };
        if exe.file_name().and_then(|n| n.to_str()) != Some(name) {
            continue;
        }

        match sys::pidfd_open(pid) {
            Ok(pidfd) => {
                debug!(operation = "hal_found", pid, exe = %exe.display(), "Found gadget HAL process");
                found.push(pidfd);
            }
            Err(e) if skippable(&e) || e.raw_os_error() == Some(libc::ESRCH) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(found)
}

fn skippable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    )
}

/// Stop every process named `name`. Finding none is an error.
pub fn suspend(name: &str, verify_magic: bool) -> anyhow::Result<Vec<ProcessStopper>> {
    let pidfds = find_processes(Path::new("/proc"), name, verify_magic)
        .context("Failed to search for gadget HAL process")?;
    if pidfds.is_empty() {
        bail!("Failed to find gadget HAL process: {name}");
    }

    pidfds
        .into_iter()
        .map(|pidfd| ProcessStopper::new(pidfd).context("Failed to stop gadget HAL process"))
        .collect()
}
