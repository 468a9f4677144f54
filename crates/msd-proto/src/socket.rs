// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Where the daemon listens.
//!
//! Production uses the abstract namespace name `msdd`. A filesystem path is
//! accepted as well so that tests and development hosts can run unprivileged
//! daemons side by side.

use std::fmt;
use std::io;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::PathBuf;

pub const DEFAULT_SOCKET_NAME: &str = "msdd";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketLocation {
    Abstract(String),
    Path(PathBuf),
}

impl Default for SocketLocation {
    fn default() -> Self {
        SocketLocation::Abstract(DEFAULT_SOCKET_NAME.to_string())
    }
}

impl SocketLocation {
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        match self {
            SocketLocation::Abstract(name) => abstract_addr(name),
            SocketLocation::Path(path) => SocketAddr::from_pathname(path),
        }
    }

    pub fn connect(&self) -> io::Result<UnixStream> {
        UnixStream::connect_addr(&self.socket_addr()?)
    }

    /// Bind a listener. A stale socket file left at a path location is replaced.
    pub fn bind(&self) -> io::Result<UnixListener> {
        if let SocketLocation::Path(path) = self {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        UnixListener::bind_addr(&self.socket_addr()?)
    }
}

impl fmt::Display for SocketLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketLocation::Abstract(name) => write!(f, "@{name}"),
            SocketLocation::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &str) -> io::Result<SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    SocketAddr::from_abstract_name(name)
}

#[cfg(target_os = "android")]
fn abstract_addr(name: &str) -> io::Result<SocketAddr> {
    use std::os::android::net::SocketAddrExt;
    SocketAddr::from_abstract_name(name)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn abstract_addr(name: &str) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("abstract socket @{name} requires Linux"),
    ))
}
