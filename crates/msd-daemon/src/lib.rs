// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! msdd: exposes files handed over by a client as USB mass storage devices.
//!
//! Clients pass open descriptors over the `msdd` abstract Unix socket. The
//! daemon points configfs mass storage LUNs at `/proc/<pid>/fd/<n>` so that it
//! never has to open the backing files itself.

pub mod auth;
pub mod config;
pub mod configfs;
pub mod gadget;
pub mod hal;
pub mod server;
pub mod session;
pub mod sys;

pub use auth::{AuthorizationGate, DisabledGate, PeerCredentials, SelinuxGate};
pub use config::{ConfigError, DaemonConfig};
pub use gadget::Gadget;
pub use server::DaemonServer;
pub use session::DaemonContext;
