// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Wire protocol spoken between `msdd` and its clients.
//!
//! A connection starts with a one-byte version handshake ([`handshake`]).
//! After that, each frame is a one-byte message id followed by an id-specific
//! body ([`messages`]). Integers are little-endian, `data` fields carry a u16
//! length prefix and collections a u8 count. File descriptors travel as
//! `SCM_RIGHTS` ancillary data attached to a single zero marker byte
//! ([`transport`]).

pub mod codec;
pub mod error;
pub mod handshake;
pub mod messages;
pub mod socket;
pub mod transport;

pub use error::{ErrorClass, ProtoError};
pub use handshake::{PROTOCOL_VERSION, accept_version, offer_version};
pub use messages::{
    ActiveMassStorageDevice, MassStorageDevice, Request, Response, message_id,
};
pub use socket::{DEFAULT_SOCKET_NAME, SocketLocation};
pub use transport::{FdTransport, MemoryTransport};
