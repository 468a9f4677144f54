// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::io;
use thiserror::Error;

/// Coarse classification used by callers to decide how to react.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The connection broke or carried a malformed frame.
    Transport,
    /// Both sides speak the framing but disagree on the protocol.
    Protocol,
    /// A value was too large to encode. Raised before any I/O.
    Resource,
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("Unexpected end of stream")]
    Eof,

    #[error("Invalid message ID: {0}")]
    UnknownMessage(u8),

    #[error("Expected {expected} message, but received {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Expected {expected} file descriptors, but received {actual}")]
    DescriptorCount { expected: usize, actual: usize },

    #[error("Descriptor marker byte is {0}, expected 0")]
    InvalidMarker(u8),

    #[error("Invalid boolean byte: {0}")]
    InvalidBool(u8),

    #[error("Text field is not valid UTF-8")]
    InvalidUtf8,

    #[error("Received data field of {len} bytes exceeds limit of {max}")]
    OversizedField { len: usize, max: usize },

    #[error("Data field of {len} bytes exceeds limit of {max}")]
    DataTooLong { len: usize, max: usize },

    #[error("Collection of {len} items exceeds limit of {max}")]
    TooManyItems { len: usize, max: usize },

    #[error("Daemon does not support protocol version {version}")]
    VersionRejected { version: u8 },

    #[error("Invalid protocol version acknowledgement: {0}")]
    InvalidAck(u8),

    #[error("Unsupported client protocol version: {0}")]
    UnsupportedVersion(u8),
}

impl ProtoError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProtoError::Io(_)
            | ProtoError::Eof
            | ProtoError::InvalidMarker(_)
            | ProtoError::InvalidBool(_)
            | ProtoError::InvalidUtf8
            | ProtoError::OversizedField { .. } => ErrorClass::Transport,
            ProtoError::UnknownMessage(_)
            | ProtoError::UnexpectedMessage { .. }
            | ProtoError::DescriptorCount { .. }
            | ProtoError::VersionRejected { .. }
            | ProtoError::InvalidAck(_)
            | ProtoError::UnsupportedVersion(_) => ErrorClass::Protocol,
            ProtoError::DataTooLong { .. } | ProtoError::TooManyItems { .. } => {
                ErrorClass::Resource
            }
        }
    }

    /// Whether the peer closed the connection at a frame boundary or mid-field.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtoError::Eof)
    }
}

impl From<io::Error> for ProtoError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProtoError::Eof
        } else {
            ProtoError::Io(err)
        }
    }
}
