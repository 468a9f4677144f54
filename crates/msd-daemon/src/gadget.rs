// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! USB gadget management on top of configfs.
//!
//! Mass storage functions alternate between two slots, `<prefix>0` and
//! `<prefix>1`. An apply builds the complete new function in the inactive
//! slot while the gadget stays bound, then swaps the configuration link
//! between an unbind and a rebind. Any failure before the swap leaves the
//! bound gadget untouched; a failure during the swap relinks the previous
//! function.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use msd_proto::{ActiveMassStorageDevice, MassStorageDevice};
use tracing::{debug, error, info, warn};

use crate::config::GadgetConfig;
use crate::configfs::{ConfigFs, EntryKind};
use crate::hal::{self, ProcessStopper};
use crate::sys;

const UDC: &str = "UDC";

fn function_dir(name: &str) -> PathBuf {
    Path::new("functions").join(name)
}

fn lun_dir(function: &str, lun: usize) -> PathBuf {
    function_dir(function).join(format!("lun.{lun}"))
}

fn bool_attr(value: bool) -> &'static [u8] {
    if value { b"1\n" } else { b"0\n" }
}

/// Only a non-cdrom LUN without `ro` accepts writes from the host.
fn lun_writable(device: &MassStorageDevice) -> bool {
    !device.cdrom && !device.ro
}

fn parse_bool(path: &Path, data: &[u8]) -> Result<bool> {
    match data {
        b"1" => Ok(true),
        b"0" => Ok(false),
        _ => bail!("configfs file did not contain boolean: {}: {data:?}", path.display()),
    }
}

fn is_errno(err: &io::Error, code: i32) -> bool {
    err.raw_os_error() == Some(code)
}

fn tolerate_missing(result: io::Result<()>) -> io::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub struct Gadget {
    fs: Box<dyn ConfigFs>,
    settings: GadgetConfig,
}

impl Gadget {
    pub fn new(fs: Box<dyn ConfigFs>, settings: GadgetConfig) -> Self {
        Self { fs, settings }
    }

    fn config_dir(&self) -> PathBuf {
        Path::new("configs").join(&self.settings.config)
    }

    fn link_path(&self) -> PathBuf {
        self.config_dir().join(&self.settings.link_name)
    }

    fn slot(&self, index: u8) -> String {
        format!("{}{index}", self.settings.function_prefix)
    }

    /// Config entries of the gadget configuration and the functions they link to.
    pub fn functions(&self) -> Result<BTreeMap<String, String>> {
        let dir = self.config_dir();
        let entries = self
            .fs
            .list(&dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

        let mut functions = BTreeMap::new();
        for entry in entries.into_iter().filter(|e| e.kind == EntryKind::Link) {
            let path = dir.join(&entry.name);
            let target = match self.fs.read_link(&path) {
                Ok(target) => target,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read link: {}", path.display()));
                }
            };
            let function = target
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("Failed to parse function name: {}", target.display()))?;
            functions.insert(entry.name, function.to_string());
        }
        Ok(functions)
    }

    /// The function our config entry links to, if any.
    fn active_function(&self) -> Result<Option<String>> {
        let link = self.link_path();
        match self.fs.read_link(&link) {
            Ok(target) => Ok(target.file_name().and_then(|n| n.to_str()).map(str::to_string)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read link: {}", link.display())),
        }
    }

    fn luns(&self, function: &str) -> io::Result<Vec<usize>> {
        let mut luns: Vec<usize> = self
            .fs
            .list(&function_dir(function))?
            .into_iter()
            .filter(|e| e.kind == EntryKind::Dir)
            .filter_map(|e| e.name.strip_prefix("lun.")?.parse().ok())
            .collect();
        luns.sort_unstable();
        Ok(luns)
    }

    /// Read an attribute without its trailing newline.
    fn read_attr(&self, path: &Path) -> Result<Vec<u8>> {
        let mut data = self
            .fs
            .read(path)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        if data.pop() != Some(b'\n') {
            bail!("configfs file did not end in newline: {}", path.display());
        }
        Ok(data)
    }

    fn write_attr(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.fs
            .write(path, data)
            .with_context(|| format!("Failed to write file: {}", path.display()))
    }

    /// Devices exposed by the linked function, in LUN order.
    pub fn active_devices(&self) -> Result<Vec<ActiveMassStorageDevice>> {
        let Some(function) = self.active_function()? else {
            return Ok(Vec::new());
        };
        let luns = self
            .luns(&function)
            .with_context(|| format!("Failed to list LUNs of function: {function}"))?;

        let mut devices = Vec::new();
        for lun in luns {
            let dir = lun_dir(&function, lun);
            let file = self.read_attr(&dir.join("file"))?;
            if file.is_empty() {
                continue;
            }
            let cdrom_path = dir.join("cdrom");
            let ro_path = dir.join("ro");
            let cdrom = parse_bool(&cdrom_path, &self.read_attr(&cdrom_path)?)?;
            let ro = parse_bool(&ro_path, &self.read_attr(&ro_path)?)?;

            devices.push(ActiveMassStorageDevice {
                file: PathBuf::from(OsString::from_vec(file)),
                cdrom,
                ro,
            });
        }
        Ok(devices)
    }

    /// Replace the exposed devices with `devices`. An empty list disables
    /// mass storage.
    pub fn apply(&self, devices: &[MassStorageDevice]) -> Result<()> {
        self.validate(devices)?;
        let old = self.active_function()?;
        if devices.is_empty() && old.is_none() {
            debug!(operation = "apply", "Mass storage already disabled");
            return Ok(());
        }
        let controller = self.controller()?;

        let slot = match &old {
            Some(name) if *name == self.slot(0) => self.slot(1),
            _ => self.slot(0),
        };
        if self
            .remove_function(&slot)
            .with_context(|| format!("Failed to clear staging function: {slot}"))?
        {
            debug!(operation = "apply", function = %slot, "Removed leftover staging function");
        }

        let staged = if devices.is_empty() {
            None
        } else {
            self.stage(&slot, devices)?;
            Some(slot)
        };

        let committed = self
            .suspend_hal()
            .and_then(|_hal| self.commit(staged.as_deref(), old.as_deref(), &controller));
        if let Err(err) = committed {
            if let Some(staged) = &staged {
                self.discard(staged);
            }
            return Err(err);
        }

        if let Some(old) = old.filter(|name| name.starts_with(&self.settings.function_prefix)) {
            match self.remove_function(&old) {
                Ok(_) => debug!(operation = "apply", function = %old, "Removed previous function"),
                Err(err) => {
                    warn!(operation = "apply", function = %old, error = %err, "Failed to remove previous function")
                }
            }
        }

        info!(
            operation = "apply",
            luns = devices.len(),
            controller = %controller,
            "Mass storage configuration applied"
        );
        Ok(())
    }

    fn validate(&self, devices: &[MassStorageDevice]) -> Result<()> {
        if devices.len() > self.settings.max_luns {
            bail!(
                "Too many devices: {} requested, at most {} supported",
                devices.len(),
                self.settings.max_luns
            );
        }

        for (lun, device) in devices.iter().enumerate() {
            let fd = device.fd.as_fd();
            if !sys::is_regular_file(fd).with_context(|| format!("Failed to stat device #{lun}"))? {
                bail!("Device #{lun} is not a regular file");
            }
            if lun_writable(device)
                && !sys::is_writable(fd).with_context(|| format!("Failed to query device #{lun}"))?
            {
                bail!("Device #{lun} is read-write but its descriptor is not writable");
            }
        }
        Ok(())
    }

    /// Pick the controller to bind to, without touching the gadget.
    fn controller(&self) -> Result<String> {
        if let Some(udc) = &self.settings.udc {
            return Ok(udc.clone());
        }

        let current = self.read_attr(Path::new(UDC))?;
        if !current.is_empty() {
            return String::from_utf8(current).context("Controller name is not UTF-8");
        }

        let class_dir = &self.settings.udc_class_dir;
        let mut candidates = Vec::new();
        for entry in fs::read_dir(class_dir)
            .with_context(|| format!("Cannot determine USB controller: failed to read {}", class_dir.display()))?
        {
            let entry = entry.with_context(|| format!("Failed to read directory entry: {}", class_dir.display()))?;
            candidates.push(entry.file_name().to_string_lossy().into_owned());
        }

        match candidates.as_slice() {
            [only] => Ok(only.clone()),
            [] => bail!("Cannot determine USB controller: none in {}", class_dir.display()),
            many => bail!("Cannot determine USB controller: multiple candidates: {}", many.join(", ")),
        }
    }

    /// Delete a function, extra LUNs first. Returns whether it existed.
    fn remove_function(&self, name: &str) -> io::Result<bool> {
        let luns = match self.luns(name) {
            Ok(luns) => luns,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        // lun.0 cannot be removed; it goes away with the function.
        for lun in luns.into_iter().filter(|lun| *lun != 0).rev() {
            tolerate_missing(self.fs.remove_dir(&lun_dir(name, lun)))?;
        }
        tolerate_missing(self.fs.remove_dir(&function_dir(name)))
    }

    fn discard(&self, name: &str) {
        if let Err(err) = self.remove_function(name) {
            warn!(operation = "discard", function = %name, error = %err, "Failed to remove staged function");
        }
    }

    fn stage(&self, slot: &str, devices: &[MassStorageDevice]) -> Result<()> {
        let dir = function_dir(slot);
        self.fs
            .create_dir(&dir)
            .with_context(|| format!("Failed to create function: {}", dir.display()))?;
        debug!(operation = "stage", function = %slot, luns = devices.len(), "Created staging function");

        if let Err(err) = self.populate(slot, devices) {
            self.discard(slot);
            return Err(err);
        }
        Ok(())
    }

    fn populate(&self, slot: &str, devices: &[MassStorageDevice]) -> Result<()> {
        let pid = std::process::id();
        for (lun, device) in devices.iter().enumerate() {
            let dir = lun_dir(slot, lun);
            match self.fs.create_dir(&dir) {
                Ok(()) => {}
                // lun.0 exists by default.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to create LUN: {}", dir.display())),
            }

            self.write_attr(&dir.join("cdrom"), bool_attr(device.cdrom))?;
            self.write_attr(&dir.join("ro"), bool_attr(!lun_writable(device)))?;

            // The file must be written last.
            let fd = device.fd.as_raw_fd();
            debug!(operation = "stage", lun, fd, cdrom = device.cdrom, ro = device.ro, "Associating LUN with descriptor");
            self.write_attr(&dir.join("file"), format!("/proc/{pid}/fd/{fd}\n").as_bytes())?;
        }
        Ok(())
    }

    fn suspend_hal(&self) -> Result<Vec<ProcessStopper>> {
        match &self.settings.hal_process {
            Some(name) => hal::suspend(name, self.settings.verify_fs_magic),
            None => Ok(Vec::new()),
        }
    }

    fn commit(&self, staged: Option<&str>, old: Option<&str>, controller: &str) -> Result<()> {
        self.unbind()?;

        let switched = self.unlink().and_then(|_| match staged {
            Some(staged) => self.link(staged),
            None => Ok(()),
        });
        if let Err(err) = switched.and_then(|()| self.bind(controller)) {
            self.restore(old, controller);
            return Err(err);
        }
        Ok(())
    }

    /// Best effort return to `old` after a failed commit.
    fn restore(&self, old: Option<&str>, controller: &str) {
        let restored = self
            .unbind()
            .and_then(|()| self.unlink())
            .and_then(|_| old.map_or(Ok(()), |old| self.link(old)))
            .and_then(|()| self.bind(controller));
        match restored {
            Ok(()) => info!(operation = "restore", function = ?old, "Restored previous configuration"),
            Err(err) => {
                let message = format!("{err:#}");
                error!(operation = "restore", function = ?old, error = %message, "Failed to restore previous configuration");
            }
        }
    }

    fn unbind(&self) -> Result<()> {
        debug!(operation = "unbind", "Disassociating gadget config from controller");
        match self.fs.write(Path::new(UDC), b"\n") {
            Ok(()) => Ok(()),
            // Already unbound.
            Err(e) if is_errno(&e, libc::ENODEV) => Ok(()),
            Err(e) => Err(e).context("Failed to unbind gadget from controller"),
        }
    }

    fn bind(&self, controller: &str) -> Result<()> {
        let dir = self.config_dir();
        let has_links = self
            .fs
            .list(&dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?
            .iter()
            .any(|e| e.kind == EntryKind::Link);
        if !has_links {
            debug!(operation = "bind", "No functions configured; leaving gadget unbound");
            return Ok(());
        }

        debug!(operation = "bind", controller = %controller, "Applying config to controller");
        self.write_attr(Path::new(UDC), format!("{controller}\n").as_bytes())
            .with_context(|| format!("Failed to bind gadget to controller: {controller}"))
    }

    fn unlink(&self) -> Result<bool> {
        let link = self.link_path();
        tolerate_missing(self.fs.remove_link(&link))
            .with_context(|| format!("Failed to delete config: {}", link.display()))
    }

    fn link(&self, function: &str) -> Result<()> {
        let link = self.link_path();
        self.fs
            .symlink(&function_dir(function), &link)
            .with_context(|| format!("Failed to create config: {}", link.display()))
    }

    /// Remove staging functions left behind by an interrupted apply.
    pub fn cleanup_stale_staging(&self) -> Result<()> {
        let active = self.active_function()?;
        for index in 0..2 {
            let slot = self.slot(index);
            if active.as_deref() == Some(slot.as_str()) {
                continue;
            }
            if self
                .remove_function(&slot)
                .with_context(|| format!("Failed to remove stale function: {slot}"))?
            {
                info!(operation = "cleanup", function = %slot, "Removed stale staging function");
            }
        }
        Ok(())
    }
}
