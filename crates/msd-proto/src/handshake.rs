// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Single-byte version handshake performed before any framed message.

use std::io::{Read, Write};

use tracing::debug;

use crate::ProtoError;
use crate::codec::{read_u8, write_u8};

pub const PROTOCOL_VERSION: u8 = 1;

const ACK_ACCEPTED: u8 = 1;
const ACK_REJECTED: u8 = 0;

/// Client side: announce `version` and wait for the daemon's verdict.
pub fn offer_version<S: Read + Write + ?Sized>(stream: &mut S, version: u8) -> Result<(), ProtoError> {
    write_u8(stream, version)?;
    stream.flush()?;

    match read_u8(stream)? {
        ACK_ACCEPTED => {
            debug!(operation = "offer_version", version, "Protocol version accepted");
            Ok(())
        }
        ACK_REJECTED => Err(ProtoError::VersionRejected { version }),
        other => Err(ProtoError::InvalidAck(other)),
    }
}

/// Daemon side: read the client's version and accept or refuse it.
pub fn accept_version<S: Read + Write + ?Sized>(stream: &mut S) -> Result<u8, ProtoError> {
    let version = read_u8(stream)?;
    if version != PROTOCOL_VERSION {
        write_u8(stream, ACK_REJECTED)?;
        stream.flush()?;
        return Err(ProtoError::UnsupportedVersion(version));
    }

    write_u8(stream, ACK_ACCEPTED)?;
    stream.flush()?;
    Ok(version)
}
