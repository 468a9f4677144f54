// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Access to the gadget's configfs tree.
//!
//! All paths are relative to the gadget root (e.g. `configs/b.1/msd`).
//! Errors are plain `io::Error`s so callers can react to the errno values
//! configfs uses to signal state (`ENODEV`, `EBUSY`, `ENOTEMPTY`).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::sys::{CONFIGFS_MAGIC, check_fs_magic};

#[cfg(test)]
pub mod memory;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Link,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
}

pub trait ConfigFs: Send {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Write an attribute in a single `write` call.
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    fn create_dir(&self, path: &Path) -> io::Result<()>;

    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Link `link` to the directory `target`.
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    fn read_link(&self, link: &Path) -> io::Result<PathBuf>;

    fn remove_link(&self, link: &Path) -> io::Result<()>;

    fn list(&self, dir: &Path) -> io::Result<Vec<Entry>>;
}

/// The real configfs mount.
pub struct KernelConfigFs {
    root: PathBuf,
    verify_magic: bool,
}

impl KernelConfigFs {
    pub fn open(root: impl Into<PathBuf>, verify_magic: bool) -> io::Result<Self> {
        let root = root.into();
        let fs = Self { root, verify_magic };
        fs.check(File::open(&fs.root)?)?;
        Ok(fs)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check(&self, file: File) -> io::Result<File> {
        if self.verify_magic {
            check_fs_magic(file, CONFIGFS_MAGIC)
        } else {
            Ok(file)
        }
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl ConfigFs for KernelConfigFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let full = self.full(path);
        let mut file = self.check(File::open(&full)?)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let full = self.full(path);
        trace!(operation = "configfs_write", path = %full.display(), len = data.len(), "Writing attribute");
        let mut file = self.check(OpenOptions::new().write(true).open(&full)?)?;
        let written = file.write(data)?;
        if written != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("{}: attribute not written in a single call", full.display()),
            ));
        }
        Ok(())
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(self.full(path))
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(self.full(path))
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        // The kernel resolves the target immediately, relative to the cwd.
        symlink(self.full(target), self.full(link))
    }

    fn read_link(&self, link: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.full(link))
    }

    fn remove_link(&self, link: &Path) -> io::Result<()> {
        fs::remove_file(self.full(link))
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.full(dir))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_symlink() {
                EntryKind::Link
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(Entry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
