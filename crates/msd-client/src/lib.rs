// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Client for `msdd`.
//!
//! A connection is negotiated once in [`MsdClient::connect`] and can then issue
//! any number of sequential requests. Backing files are passed as open
//! descriptors, never as paths.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use msd_proto::{
    ActiveMassStorageDevice, ErrorClass, FdTransport, MassStorageDevice, PROTOCOL_VERSION,
    ProtoError, Request, Response, SocketLocation, offer_version,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub use msd_proto::DEFAULT_SOCKET_NAME;

/// How a backing file is presented to the USB host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Cdrom,
    DiskRo,
    DiskRw,
}

impl DeviceType {
    pub fn from_flags(cdrom: bool, ro: bool) -> Self {
        match (cdrom, ro) {
            (true, _) => DeviceType::Cdrom,
            (false, true) => DeviceType::DiskRo,
            (false, false) => DeviceType::DiskRw,
        }
    }

    pub fn cdrom(self) -> bool {
        self == DeviceType::Cdrom
    }

    pub fn ro(self) -> bool {
        self != DeviceType::DiskRw
    }

    /// Whether the backing file must be opened for writing.
    pub fn writable(self) -> bool {
        self == DeviceType::DiskRw
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceType::Cdrom => "cdrom",
            DeviceType::DiskRo => "disk-ro",
            DeviceType::DiskRw => "disk-rw",
        })
    }
}

/// A device to expose, borrowing the caller's open descriptor.
#[derive(Clone, Copy, Debug)]
pub struct DeviceRequest<'a> {
    pub fd: BorrowedFd<'a>,
    pub device_type: DeviceType,
}

/// A device the daemon reports as active.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveDevice {
    pub file: PathBuf,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

impl From<ActiveMassStorageDevice> for ActiveDevice {
    fn from(device: ActiveMassStorageDevice) -> Self {
        Self {
            file: device.file,
            device_type: DeviceType::from_flags(device.cdrom, device.ro),
        }
    }
}

/// How a [`ClientError`] should be treated by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection failed or broke. The connection is unusable.
    Transport,
    /// Client and daemon disagree on the protocol. The connection is unusable.
    Protocol,
    /// The request was too large to encode. Nothing was sent.
    Resource,
    /// The daemon answered with an error. The connection is still usable.
    Application,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon at {location}: {source}")]
    Connect {
        location: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("Daemon returned error: {0}")]
    Daemon(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connect { .. } => ErrorKind::Transport,
            ClientError::Proto(err) => match err.class() {
                ErrorClass::Transport => ErrorKind::Transport,
                ErrorClass::Protocol => ErrorKind::Protocol,
                ErrorClass::Resource => ErrorKind::Resource,
            },
            ClientError::Daemon(_) => ErrorKind::Application,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    pub fn is_application(&self) -> bool {
        self.kind() == ErrorKind::Application
    }

    /// The daemon refused our protocol version; a client update is required.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, ClientError::Proto(ProtoError::VersionRejected { .. }))
    }
}

/// Connection settings for [`MsdClient::connect`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    location: SocketLocation,
    protocol_version: u8,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder {
            location: SocketLocation::default(),
            protocol_version: PROTOCOL_VERSION,
            read_timeout: None,
            write_timeout: None,
        }
    }

    pub fn location(&self) -> &SocketLocation {
        &self.location
    }
}

/// Builder for [`ClientConfig`].
pub struct ClientConfigBuilder {
    location: SocketLocation,
    protocol_version: u8,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl ClientConfigBuilder {
    /// Connect to the abstract socket `name` instead of `msdd`.
    pub fn socket_name(mut self, name: impl Into<String>) -> Self {
        self.location = SocketLocation::Abstract(name.into());
        self
    }

    /// Connect to a filesystem socket.
    pub fn socket_path(mut self, path: impl AsRef<Path>) -> Self {
        self.location = SocketLocation::Path(path.as_ref().to_path_buf());
        self
    }

    pub fn location(mut self, location: SocketLocation) -> Self {
        self.location = location;
        self
    }

    /// Override the version offered in the handshake (defaults to [`PROTOCOL_VERSION`]).
    pub fn protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    /// Set the read timeout applied to the underlying socket.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout applied to the underlying socket.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ClientConfig {
        ClientConfig {
            location: self.location,
            protocol_version: self.protocol_version,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }
    }
}

pub struct MsdClient<T: FdTransport = UnixStream> {
    transport: T,
}

impl MsdClient<UnixStream> {
    /// Connect to the daemon and negotiate the protocol version.
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let connect_err = |source| ClientError::Connect {
            location: config.location.to_string(),
            source,
        };

        let stream = config.location.connect().map_err(connect_err)?;
        stream.set_read_timeout(config.read_timeout).map_err(connect_err)?;
        stream.set_write_timeout(config.write_timeout).map_err(connect_err)?;

        debug!(operation = "client_connect", location = %config.location, "Connected to daemon");
        Self::with_transport(stream, config.protocol_version)
    }
}

impl<T: FdTransport> MsdClient<T> {
    /// Negotiate over an already connected transport.
    pub fn with_transport(mut transport: T, protocol_version: u8) -> Result<Self, ClientError> {
        offer_version(&mut transport, protocol_version)?;
        Ok(Self { transport })
    }

    /// Query the gadget config entries and the functions they link to.
    pub fn get_functions(&mut self) -> Result<BTreeMap<String, String>, ClientError> {
        match self.round_trip(&Request::<BorrowedFd<'_>>::GetFunctions)? {
            Response::GetFunctionsResult(functions) => Ok(functions),
            other => Err(unexpected("GetFunctionsResult", &other)),
        }
    }

    /// Replace the active device set. An empty slice disables mass storage.
    pub fn set_mass_storage(&mut self, devices: &[DeviceRequest<'_>]) -> Result<(), ClientError> {
        let request = Request::SetMassStorage(
            devices
                .iter()
                .map(|device| MassStorageDevice {
                    fd: device.fd,
                    cdrom: device.device_type.cdrom(),
                    ro: device.device_type.ro(),
                })
                .collect(),
        );

        match self.round_trip(&request)? {
            Response::SetMassStorageAck => Ok(()),
            other => Err(unexpected("SetMassStorageAck", &other)),
        }
    }

    /// Query the devices currently exposed, in LUN order.
    pub fn get_mass_storage(&mut self) -> Result<Vec<ActiveDevice>, ClientError> {
        match self.round_trip(&Request::<BorrowedFd<'_>>::GetMassStorage)? {
            Response::GetMassStorageResult(devices) => {
                Ok(devices.into_iter().map(ActiveDevice::from).collect())
            }
            other => Err(unexpected("GetMassStorageResult", &other)),
        }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn round_trip(&mut self, request: &Request<BorrowedFd<'_>>) -> Result<Response, ClientError> {
        debug!(operation = "client_request", request = request.name(), "Sending request");
        request.write_to(&mut self.transport)?;

        match Response::read_from(&mut self.transport)? {
            Response::Error(message) => {
                debug!(operation = "client_response", error = %message, "Daemon returned error");
                Err(ClientError::Daemon(message))
            }
            response => {
                debug!(operation = "client_response", response = response.name(), "Received response");
                Ok(response)
            }
        }
    }
}

fn unexpected(expected: &'static str, actual: &Response) -> ClientError {
    ClientError::Proto(ProtoError::UnexpectedMessage {
        expected,
        actual: actual.name(),
    })
}

/// Match active devices back to the caller's own identities by path.
///
/// `known` pairs a caller-side key (a URI, a settings entry) with the path the
/// daemon is expected to report for it. The scan is linear for every active
/// device; both sides are bounded by the gadget's LUN limit.
pub fn correlate_active<'a, K>(
    active: &'a [ActiveDevice],
    known: &'a [(K, PathBuf)],
) -> Vec<(&'a ActiveDevice, Option<&'a K>)> {
    active
        .iter()
        .map(|device| {
            let key = known
                .iter()
                .find(|(_, path)| path.as_os_str() == device.file.as_os_str())
                .map(|(key, _)| key);
            (device, key)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use msd_proto::{MemoryTransport, accept_version};
    use std::os::fd::AsFd;
    use std::thread;

    /// Answer each request with the next scripted response.
    fn scripted_daemon(
        mut transport: MemoryTransport,
        responses: Vec<Response>,
    ) -> thread::JoinHandle<Vec<(u8, usize)>> {
        thread::spawn(move || {
            accept_version(&mut transport).unwrap();
            let mut seen = Vec::new();
            for response in responses {
                let request = Request::read_from(&mut transport).unwrap();
                let fd_count = match &request {
                    Request::SetMassStorage(devices) => devices.len(),
                    _ => 0,
                };
                seen.push((request.message_id(), fd_count));
                response.write_to(&mut transport).unwrap();
            }
            seen
        })
    }

    #[msd_test_utils::logged_test]
    fn device_type_flag_mapping() {
        for device_type in [DeviceType::Cdrom, DeviceType::DiskRo, DeviceType::DiskRw] {
            assert_eq!(
                DeviceType::from_flags(device_type.cdrom(), device_type.ro()),
                device_type
            );
        }
        assert_eq!(DeviceType::from_flags(true, false), DeviceType::Cdrom);
        assert_eq!(DeviceType::DiskRo.to_string(), "disk-ro");
        assert!(DeviceType::DiskRw.writable());
        assert!(!DeviceType::Cdrom.writable());
    }

    #[msd_test_utils::logged_test]
    fn three_verbs_over_one_connection() {
        let (client_end, daemon_end) = MemoryTransport::pair();
        let mut functions = BTreeMap::new();
        functions.insert("f1".to_string(), "ffs.adb".to_string());
        let active = ActiveMassStorageDevice {
            file: PathBuf::from("/sdcard/disk.img"),
            cdrom: false,
            ro: true,
        };
        let daemon = scripted_daemon(
            daemon_end,
            vec![
                Response::GetFunctionsResult(functions.clone()),
                Response::SetMassStorageAck,
                Response::GetMassStorageResult(vec![active]),
            ],
        );

        let file = tempfile::tempfile().unwrap();
        let mut client = MsdClient::with_transport(client_end, PROTOCOL_VERSION).unwrap();
        assert_eq!(client.get_functions().unwrap(), functions);
        client
            .set_mass_storage(&[DeviceRequest {
                fd: file.as_fd(),
                device_type: DeviceType::DiskRo,
            }])
            .unwrap();
        let devices = client.get_mass_storage().unwrap();
        assert_eq!(
            devices,
            vec![ActiveDevice {
                file: PathBuf::from("/sdcard/disk.img"),
                device_type: DeviceType::DiskRo,
            }]
        );

        drop(client);
        assert_eq!(
            daemon.join().unwrap(),
            vec![
                (msd_proto::message_id::GET_FUNCTIONS, 0),
                (msd_proto::message_id::SET_MASS_STORAGE, 1),
                (msd_proto::message_id::GET_MASS_STORAGE, 0),
            ]
        );
    }

    #[msd_test_utils::logged_test]
    fn daemon_error_is_application_error() {
        let (client_end, daemon_end) = MemoryTransport::pair();
        let daemon = scripted_daemon(
            daemon_end,
            vec![
                Response::Error("LUN limit exceeded".to_string()),
                Response::SetMassStorageAck,
            ],
        );

        let mut client = MsdClient::with_transport(client_end, PROTOCOL_VERSION).unwrap();
        let err = client.set_mass_storage(&[]).unwrap_err();
        assert!(err.is_application());
        assert_eq!(err.to_string(), "Daemon returned error: LUN limit exceeded");

        // The connection stays usable after an application error.
        client.set_mass_storage(&[]).unwrap();
        drop(client);
        daemon.join().unwrap();
    }

    #[msd_test_utils::logged_test]
    fn mismatched_response_is_protocol_error() {
        let (client_end, daemon_end) = MemoryTransport::pair();
        let daemon = scripted_daemon(daemon_end, vec![Response::SetMassStorageAck]);

        let mut client = MsdClient::with_transport(client_end, PROTOCOL_VERSION).unwrap();
        let err = client.get_functions().unwrap_err();
        assert!(err.is_protocol());
        drop(client);
        daemon.join().unwrap();
    }

    #[msd_test_utils::logged_test]
    fn version_refusal_is_distinguishable() {
        let (client_end, mut daemon_end) = MemoryTransport::pair();
        let daemon = thread::spawn(move || accept_version(&mut daemon_end));

        let err = MsdClient::with_transport(client_end, PROTOCOL_VERSION + 1)
            .err()
            .unwrap();
        assert!(err.is_protocol());
        assert!(err.is_version_mismatch());
        assert!(daemon.join().unwrap().is_err());
    }

    #[msd_test_utils::logged_test]
    fn too_many_devices_is_resource_error() {
        let (client_end, daemon_end) = MemoryTransport::pair();
        let daemon = scripted_daemon(daemon_end, Vec::new());
        let mut client = MsdClient::with_transport(client_end, PROTOCOL_VERSION).unwrap();

        let file = tempfile::tempfile().unwrap();
        let devices = vec![
            DeviceRequest {
                fd: file.as_fd(),
                device_type: DeviceType::Cdrom,
            };
            256
        ];
        let err = client.set_mass_storage(&devices).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        drop(client);
        daemon.join().unwrap();
    }

    #[msd_test_utils::logged_test]
    fn connect_failure_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::builder()
            .socket_path(dir.path().join("missing.sock"))
            .build();

        let err = MsdClient::connect(&config).err().unwrap();
        assert!(err.is_transport());
        assert!(err.to_string().contains("missing.sock"));
    }

    #[msd_test_utils::logged_test]
    fn correlation_matches_by_path() {
        let active = vec![
            ActiveDevice {
                file: PathBuf::from("/sdcard/a.img"),
                device_type: DeviceType::DiskRw,
            },
            ActiveDevice {
                file: PathBuf::from("/sdcard/unknown.iso"),
                device_type: DeviceType::Cdrom,
            },
        ];
        let known = vec![
            ("content://b", PathBuf::from("/sdcard/b.img")),
            ("content://a", PathBuf::from("/sdcard/a.img")),
        ];

        let matched = correlate_active(&active, &known);
        assert_eq!(matched[0].1, Some(&"content://a"));
        assert_eq!(matched[1].1, None);
    }
}
