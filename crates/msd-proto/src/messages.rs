// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Message catalog.
//!
//! | Id | Direction | Name                  | Body                                        |
//! |----|-----------|-----------------------|---------------------------------------------|
//! | 1  | response  | Error                 | data(message)                               |
//! | 2  | request   | GetFunctions          | empty                                       |
//! | 3  | response  | GetFunctionsResult    | u8 count, count × (data(config), data(function)) |
//! | 4  | request   | SetMassStorage        | u8 count, count × (marker+fd, cdrom, ro)    |
//! | 5  | response  | SetMassStorageAck     | empty                                       |
//! | 6  | request   | GetMassStorage        | empty                                       |
//! | 7  | response  | GetMassStorageResult  | u8 count, count × (data(path), cdrom, ro)   |

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use crate::codec::{
    MAX_DATA_LEN, check_data_len, check_item_count, read_bool, read_data, read_text,
    read_u8, write_bool, write_data, write_u8,
};
use crate::{FdTransport, ProtoError};

pub mod message_id {
    pub const ERROR: u8 = 1;
    pub const GET_FUNCTIONS: u8 = 2;
    pub const GET_FUNCTIONS_RESULT: u8 = 3;
    pub const SET_MASS_STORAGE: u8 = 4;
    pub const SET_MASS_STORAGE_ACK: u8 = 5;
    pub const GET_MASS_STORAGE: u8 = 6;
    pub const GET_MASS_STORAGE_RESULT: u8 = 7;
}

/// A backing file handed to the daemon by descriptor.
///
/// The sender may use a borrowed descriptor. Decoding always yields owned
/// descriptors, closed when the request is dropped.
#[derive(Debug)]
pub struct MassStorageDevice<F = OwnedFd> {
    pub fd: F,
    pub cdrom: bool,
    pub ro: bool,
}

/// A LUN as currently configured in the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveMassStorageDevice {
    pub file: PathBuf,
    pub cdrom: bool,
    pub ro: bool,
}

#[derive(Debug)]
pub enum Request<F = OwnedFd> {
    GetFunctions,
    SetMassStorage(Vec<MassStorageDevice<F>>),
    GetMassStorage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Error(String),
    /// Config entry name mapped to the function it links to.
    GetFunctionsResult(BTreeMap<String, String>),
    SetMassStorageAck,
    GetMassStorageResult(Vec<ActiveMassStorageDevice>),
}

fn name_of(id: u8) -> &'static str {
    match id {
        message_id::ERROR => "Error",
        message_id::GET_FUNCTIONS => "GetFunctions",
        message_id::GET_FUNCTIONS_RESULT => "GetFunctionsResult",
        message_id::SET_MASS_STORAGE => "SetMassStorage",
        message_id::SET_MASS_STORAGE_ACK => "SetMassStorageAck",
        message_id::GET_MASS_STORAGE => "GetMassStorage",
        message_id::GET_MASS_STORAGE_RESULT => "GetMassStorageResult",
        _ => "Unknown",
    }
}

impl<F: AsFd> Request<F> {
    pub fn message_id(&self) -> u8 {
        match self {
            Request::GetFunctions => message_id::GET_FUNCTIONS,
            Request::SetMassStorage(_) => message_id::SET_MASS_STORAGE,
            Request::GetMassStorage => message_id::GET_MASS_STORAGE,
        }
    }

    pub fn name(&self) -> &'static str {
        name_of(self.message_id())
    }

    /// Check every size limit. Nothing is written when this fails.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if let Request::SetMassStorage(devices) = self {
            check_item_count(devices.len())?;
        }
        Ok(())
    }

    pub fn write_to<T: FdTransport + ?Sized>(&self, transport: &mut T) -> Result<(), ProtoError> {
        self.validate()?;

        write_u8(transport, self.message_id())?;
        match self {
            Request::GetFunctions | Request::GetMassStorage => {}
            Request::SetMassStorage(devices) => {
                write_u8(transport, devices.len() as u8)?;
                for device in devices {
                    transport.send_with_descriptors(&[device.fd.as_fd()])?;
                    write_bool(transport, device.cdrom)?;
                    write_bool(transport, device.ro)?;
                }
            }
        }
        transport.flush()?;
        Ok(())
    }
}

impl Request<OwnedFd> {
    pub fn read_from<T: FdTransport + ?Sized>(transport: &mut T) -> Result<Self, ProtoError> {
        match read_u8(transport)? {
            message_id::GET_FUNCTIONS => Ok(Request::GetFunctions),
            message_id::GET_MASS_STORAGE => Ok(Request::GetMassStorage),
            message_id::SET_MASS_STORAGE => {
                let count = read_u8(transport)?;
                // Received descriptors are owned here and closed on any early return.
                let mut devices = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let fd = transport
                        .receive_with_descriptors(1)?
                        .pop()
                        .ok_or(ProtoError::DescriptorCount {
                            expected: 1,
                            actual: 0,
                        })?;
                    let cdrom = read_bool(transport)?;
                    let ro = read_bool(transport)?;
                    devices.push(MassStorageDevice { fd, cdrom, ro });
                }
                Ok(Request::SetMassStorage(devices))
            }
            id @ (message_id::ERROR
            | message_id::GET_FUNCTIONS_RESULT
            | message_id::SET_MASS_STORAGE_ACK
            | message_id::GET_MASS_STORAGE_RESULT) => Err(ProtoError::UnexpectedMessage {
                expected: "request",
                actual: name_of(id),
            }),
            id => Err(ProtoError::UnknownMessage(id)),
        }
    }
}

impl Response {
    /// Build an error response, truncating the text to what fits in a frame.
    pub fn error(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_DATA_LEN {
            let mut end = MAX_DATA_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Response::Error(message)
    }

    pub fn message_id(&self) -> u8 {
        match self {
            Response::Error(_) => message_id::ERROR,
            Response::GetFunctionsResult(_) => message_id::GET_FUNCTIONS_RESULT,
            Response::SetMassStorageAck => message_id::SET_MASS_STORAGE_ACK,
            Response::GetMassStorageResult(_) => message_id::GET_MASS_STORAGE_RESULT,
        }
    }

    pub fn name(&self) -> &'static str {
        name_of(self.message_id())
    }

    /// Check every size limit. Nothing is written when this fails.
    pub fn validate(&self) -> Result<(), ProtoError> {
        match self {
            Response::Error(message) => check_data_len(message.as_bytes()),
            Response::GetFunctionsResult(functions) => {
                check_item_count(functions.len())?;
                for (config, function) in functions {
                    check_data_len(config.as_bytes())?;
                    check_data_len(function.as_bytes())?;
                }
                Ok(())
            }
            Response::SetMassStorageAck => Ok(()),
            Response::GetMassStorageResult(devices) => {
                check_item_count(devices.len())?;
                for device in devices {
                    check_data_len(device.file.as_os_str().as_bytes())?;
                }
                Ok(())
            }
        }
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), ProtoError> {
        self.validate()?;

        // Responses carry no descriptors, so the whole frame goes out in one write.
        let mut frame = vec![self.message_id()];
        match self {
            Response::Error(message) => write_data(&mut frame, message.as_bytes())?,
            Response::GetFunctionsResult(functions) => {
                write_u8(&mut frame, functions.len() as u8)?;
                for (config, function) in functions {
                    write_data(&mut frame, config.as_bytes())?;
                    write_data(&mut frame, function.as_bytes())?;
                }
            }
            Response::SetMassStorageAck => {}
            Response::GetMassStorageResult(devices) => {
                write_u8(&mut frame, devices.len() as u8)?;
                for device in devices {
                    write_data(&mut frame, device.file.as_os_str().as_bytes())?;
                    write_bool(&mut frame, device.cdrom)?;
                    write_bool(&mut frame, device.ro)?;
                }
            }
        }

        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, ProtoError> {
        match read_u8(reader)? {
            message_id::ERROR => Ok(Response::Error(read_text(reader)?)),
            message_id::GET_FUNCTIONS_RESULT => {
                let count = read_u8(reader)?;
                let mut functions = BTreeMap::new();
                for _ in 0..count {
                    let config = read_text(reader)?;
                    let function = read_text(reader)?;
                    functions.insert(config, function);
                }
                Ok(Response::GetFunctionsResult(functions))
            }
            message_id::SET_MASS_STORAGE_ACK => Ok(Response::SetMassStorageAck),
            message_id::GET_MASS_STORAGE_RESULT => {
                let count = read_u8(reader)?;
                let mut devices = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let file = PathBuf::from(OsString::from_vec(read_data(reader)?));
                    let cdrom = read_bool(reader)?;
                    let ro = read_bool(reader)?;
                    devices.push(ActiveMassStorageDevice { file, cdrom, ro });
                }
                Ok(Response::GetMassStorageResult(devices))
            }
            id @ (message_id::GET_FUNCTIONS
            | message_id::SET_MASS_STORAGE
            | message_id::GET_MASS_STORAGE) => Err(ProtoError::UnexpectedMessage {
                expected: "response",
                actual: name_of(id),
            }),
            id => Err(ProtoError::UnknownMessage(id)),
        }
    }
}
