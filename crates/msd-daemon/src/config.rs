// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon configuration.
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! `MSDD_*` environment variables (`MSDD_GADGET__MAX_LUNS=4`), command-line
//! flags (applied by the binary).

use std::path::{Component, Path, PathBuf};

use msd_proto::SocketLocation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_PREFIX: &str = "MSDD";

/// LUNs the kernel's mass storage function supports (`FSG_MAX_LUNS`).
pub const MAX_LUNS: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DaemonConfig {
    pub socket: SocketConfig,
    pub gadget: GadgetConfig,
    pub selinux: SelinuxConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SocketConfig {
    /// Abstract socket name.
    pub name: String,
    /// Filesystem socket used instead of the abstract name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            name: msd_proto::DEFAULT_SOCKET_NAME.to_string(),
            path: None,
        }
    }
}

impl SocketConfig {
    pub fn location(&self) -> SocketLocation {
        match &self.path {
            Some(path) => SocketLocation::Path(path.clone()),
            None => SocketLocation::Abstract(self.name.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GadgetConfig {
    pub root: PathBuf,
    /// Configuration directory under `configs/`.
    pub config: String,
    /// Staging slots are `<prefix>0` and `<prefix>1`.
    pub function_prefix: String,
    /// Name of the link from the configuration to the active function.
    pub link_name: String,
    pub max_luns: usize,
    pub udc_class_dir: PathBuf,
    /// Fixed controller; detected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udc: Option<String>,
    pub verify_fs_magic: bool,
    /// Executable name of the gadget HAL to stop while rebinding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hal_process: Option<String>,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/config/usb_gadget/g1"),
            config: "b.1".to_string(),
            function_prefix: "mass_storage.msd".to_string(),
            link_name: "msd".to_string(),
            max_luns: 8,
            udc_class_dir: PathBuf::from("/sys/class/udc"),
            udc: None,
            verify_fs_magic: true,
            hal_process: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SelinuxConfig {
    pub enforce: bool,
    pub enforce_path: PathBuf,
    /// Refuse connections whose peer is the daemon process itself.
    pub reject_self_peer: bool,
    /// Require that connecting to our own socket is denied.
    pub self_connect_check: bool,
}

impl Default for SelinuxConfig {
    fn default() -> Self {
        Self {
            enforce: true,
            enforce_path: PathBuf::from("/sys/fs/selinux/enforce"),
            reject_self_peer: true,
            self_connect_check: true,
        }
    }
}

fn single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl DaemonConfig {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: DaemonConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let gadget = &self.gadget;
        if !(1..=MAX_LUNS).contains(&gadget.max_luns) {
            return Err(ConfigError::Validation(format!(
                "gadget.max_luns must be between 1 and {MAX_LUNS}, got {}",
                gadget.max_luns
            )));
        }
        if !gadget.function_prefix.starts_with("mass_storage.")
            || !single_component(&gadget.function_prefix)
        {
            return Err(ConfigError::Validation(format!(
                "gadget.function_prefix must be a mass_storage.* name, got {:?}",
                gadget.function_prefix
            )));
        }
        for (key, value) in [("gadget.link_name", &gadget.link_name), ("gadget.config", &gadget.config)] {
            if !single_component(value) {
                return Err(ConfigError::Validation(format!(
                    "{key} must be a single path component, got {value:?}"
                )));
            }
        }
        if self.socket.path.is_none() && self.socket.name.is_empty() {
            return Err(ConfigError::Validation(
                "socket.name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
