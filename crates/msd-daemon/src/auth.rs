// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-connection authorization.
//!
//! Access control itself is the SELinux policy's job: only the app's domain
//! may connect to the socket. The gate only checks that the policy is really
//! in force, and refuses the whole connection when it is not.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use msd_proto::SocketLocation;
use tracing::warn;

use crate::config::SelinuxConfig;
use crate::sys::{SELINUX_MAGIC, check_fs_magic};

/// Credentials of the connected peer as reported by `SO_PEERCRED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: Option<i32>,
    pub uid: u32,
    pub gid: u32,
}

impl PeerCredentials {
    pub fn is_self(&self) -> bool {
        self.pid == Some(std::process::id() as i32)
    }
}

pub trait AuthorizationGate: Send + Sync {
    /// Decide whether requests from `peer` may be served.
    fn authorize(&self, peer: &PeerCredentials) -> Result<()>;
}

/// Requires SELinux to be enforcing with our policy loaded.
pub struct SelinuxGate {
    enforce_path: PathBuf,
    verify_magic: bool,
    reject_self: bool,
    self_connect: Option<SocketLocation>,
}

impl SelinuxGate {
    pub fn new(config: &SelinuxConfig, verify_magic: bool, socket: SocketLocation) -> Self {
        Self {
            enforce_path: config.enforce_path.clone(),
            verify_magic,
            reject_self: config.reject_self_peer,
            self_connect: config.self_connect_check.then_some(socket),
        }
    }

    fn check_enforcing(&self) -> Result<()> {
        let path = &self.enforce_path;
        let file = File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
        let mut file = if self.verify_magic {
            check_fs_magic(file, SELINUX_MAGIC)
                .with_context(|| format!("Refusing to trust {}", path.display()))?
        } else {
            file
        };

        let mut value = [0u8; 1];
        file.read_exact(&mut value)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        if value[0] != b'1' {
            bail!("Denying connection because SELinux is not enforcing");
        }
        Ok(())
    }

    fn check_policy_loaded(&self, socket: &SocketLocation) -> Result<()> {
        // The policy forbids the daemon from connecting to itself.
        match socket.connect() {
            Ok(_) => bail!("Denying connection because SELinux policy is broken"),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Ok(()),
            Err(e) => Err(e).context("Self connection failed for unexpected reason"),
        }
    }
}

impl AuthorizationGate for SelinuxGate {
    fn authorize(&self, peer: &PeerCredentials) -> Result<()> {
        if self.reject_self && peer.is_self() {
            bail!("Denying connection from the daemon itself; SELinux rules are broken");
        }
        self.check_enforcing()?;
        if let Some(socket) = &self.self_connect {
            self.check_policy_loaded(socket)?;
        }
        Ok(())
    }
}

/// Accepts every connection. For development hosts without SELinux.
pub struct DisabledGate;

impl AuthorizationGate for DisabledGate {
    fn authorize(&self, peer: &PeerCredentials) -> Result<()> {
        warn!(
            operation = "authorize",
            uid = peer.uid,
            "SELinux checks are disabled; accepting connection unverified"
        );
        Ok(())
    }
}
