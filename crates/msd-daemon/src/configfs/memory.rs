// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory gadget tree with the kernel's configfs rules.
//!
//! Seeded with an ADB function linked into `configs/b.1` and bound to
//! [`UDC`], the state a phone is in when the daemon starts.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ConfigFs, Entry, EntryKind};

pub const UDC: &str = "dummy_udc.0";

#[derive(Clone, Debug)]
enum Node {
    Dir,
    File(Vec<u8>),
    Link(PathBuf),
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<PathBuf, Node>,
    mutations: Vec<String>,
    fail_lun_file: Option<u8>,
    fail_link_to: Option<String>,
}

#[derive(Clone, Default)]
pub struct MemoryConfigFs {
    state: Arc<Mutex<State>>,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn name_of(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// `functions/<name>` when `path` lies inside a function directory.
fn function_of(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    let first = components.next()?;
    let second = components.next()?;
    (first.as_os_str() == "functions").then(|| Path::new("functions").join(second))
}

fn lun_of(path: &Path) -> Option<u8> {
    path.components()
        .filter_map(|c| c.as_os_str().to_str()?.strip_prefix("lun.")?.parse().ok())
        .next()
}

fn is_function_dir(path: &Path) -> bool {
    path.parent() == Some(Path::new("functions"))
}

fn is_mass_storage(function: &Path) -> bool {
    name_of(function).starts_with("mass_storage.")
}

impl State {
    fn children<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = (&'a PathBuf, &'a Node)> {
        self.nodes.iter().filter(move |(p, _)| p.parent() == Some(dir))
    }

    fn bound(&self) -> bool {
        matches!(self.nodes.get(Path::new("UDC")), Some(Node::File(v)) if v.as_slice() != b"\n")
    }

    fn linked(&self, target: &Path) -> bool {
        self.nodes
            .values()
            .any(|node| matches!(node, Node::Link(t) if t == target))
    }

    fn has_links(&self) -> bool {
        self.nodes
            .iter()
            .any(|(path, node)| path.starts_with("configs") && matches!(node, Node::Link(_)))
    }

    fn require_dir(&self, path: &Path) -> io::Result<()> {
        match self.nodes.get(path) {
            Some(Node::Dir) => Ok(()),
            Some(_) => Err(errno(libc::ENOTDIR)),
            None => Err(errno(libc::ENOENT)),
        }
    }

    fn insert_lun(&mut self, lun: &Path) {
        self.nodes.insert(lun.to_path_buf(), Node::Dir);
        self.nodes.insert(lun.join("file"), Node::File(b"\n".to_vec()));
        self.nodes.insert(lun.join("cdrom"), Node::File(b"0\n".to_vec()));
        self.nodes.insert(lun.join("ro"), Node::File(b"0\n".to_vec()));
    }

    fn remove_tree(&mut self, root: &Path) {
        self.nodes.retain(|path, _| !path.starts_with(root));
    }

    fn write_udc(&mut self, value: &[u8]) -> io::Result<Vec<u8>> {
        if value.is_empty() {
            if !self.bound() {
                return Err(errno(libc::ENODEV));
            }
            return Ok(b"\n".to_vec());
        }
        if self.bound() {
            return Err(errno(libc::EBUSY));
        }
        if !self.has_links() {
            return Err(errno(libc::ENODEV));
        }
        Ok([value, b"\n"].concat())
    }

    fn write_lun_attr(&mut self, path: &Path, lun: u8, value: &[u8]) -> io::Result<Vec<u8>> {
        if let Some(function) = function_of(path) {
            if self.linked(&function) && self.bound() {
                return Err(errno(libc::EBUSY));
            }
        }

        match name_of(path) {
            "file" => {
                if self.fail_lun_file == Some(lun) {
                    return Err(errno(libc::EIO));
                }
                if value.is_empty() {
                    return Ok(b"\n".to_vec());
                }
                // The kernel opens the path, which for /proc/<pid>/fd/<n>
                // lands on the descriptor's file.
                let source = Path::new(std::ffi::OsStr::from_bytes(value));
                let resolved = fs::read_link(source)?;
                Ok([resolved.as_os_str().as_bytes(), b"\n"].concat())
            }
            "cdrom" | "ro" => match value {
                b"0" | b"1" => Ok([value, b"\n"].concat()),
                _ => Err(errno(libc::EINVAL)),
            },
            _ => Ok(value.to_vec()),
        }
    }
}

impl MemoryConfigFs {
    pub fn new() -> Self {
        let fs = Self::default();
        {
            let mut state = fs.lock();
            for dir in ["", "functions", "functions/ffs.adb", "configs", "configs/b.1"] {
                state.nodes.insert(PathBuf::from(dir), Node::Dir);
            }
            state
                .nodes
                .insert(PathBuf::from("configs/b.1/f1"), Node::Link(PathBuf::from("functions/ffs.adb")));
            state
                .nodes
                .insert(PathBuf::from("UDC"), Node::File(format!("{UDC}\n").into_bytes()));
        }
        fs
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every mutating call made so far, successful or not.
    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    pub fn udc(&self) -> String {
        match self.lock().nodes.get(Path::new("UDC")) {
            Some(Node::File(v)) => String::from_utf8_lossy(v).trim_end().to_string(),
            _ => String::new(),
        }
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.lock().nodes.contains_key(path.as_ref())
    }

    /// Make writes to `lun.<lun>/file` of any function fail with `EIO`.
    pub fn fail_lun_file_write(&self, lun: Option<u8>) {
        self.lock().fail_lun_file = lun;
    }

    /// Make linking the named function fail with `EIO`.
    pub fn fail_link_to(&self, function: Option<&str>) {
        self.lock().fail_link_to = function.map(str::to_string);
    }

    /// Create a bare function directory, as a crashed run would leave behind.
    pub fn seed_function(&self, name: &str, luns: u8) {
        let mut state = self.lock();
        let function = Path::new("functions").join(name);
        state.nodes.insert(function.clone(), Node::Dir);
        for lun in 0..luns {
            state.insert_lun(&function.join(format!("lun.{lun}")));
        }
    }
}

impl ConfigFs for MemoryConfigFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        match self.lock().nodes.get(path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(errno(libc::EISDIR)),
            Some(Node::Link(_)) => Err(errno(libc::EINVAL)),
            None => Err(errno(libc::ENOENT)),
        }
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        state
            .mutations
            .push(format!("write {} {}", path.display(), String::from_utf8_lossy(data).trim_end()));

        match state.nodes.get(path) {
            Some(Node::File(_)) => {}
            Some(_) => return Err(errno(libc::EISDIR)),
            None => return Err(errno(libc::ENOENT)),
        }

        let value = data.strip_suffix(b"\n").unwrap_or(data);
        let stored = if path == Path::new("UDC") {
            state.write_udc(value)?
        } else if let Some(lun) = lun_of(path) {
            state.write_lun_attr(path, lun, value)?
        } else {
            data.to_vec()
        };
        state.nodes.insert(path.to_path_buf(), Node::File(stored));
        Ok(())
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        state.mutations.push(format!("mkdir {}", path.display()));

        let parent = path.parent().ok_or_else(|| errno(libc::EEXIST))?;
        state.require_dir(parent)?;
        if state.nodes.contains_key(path) {
            return Err(errno(libc::EEXIST));
        }

        if is_function_dir(path) && is_mass_storage(path) {
            state.nodes.insert(path.to_path_buf(), Node::Dir);
            state.insert_lun(&path.join("lun.0"));
        } else if is_function_dir(parent) && name_of(path).starts_with("lun.") {
            state.insert_lun(path);
        } else {
            state.nodes.insert(path.to_path_buf(), Node::Dir);
        }
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        state.mutations.push(format!("rmdir {}", path.display()));
        state.require_dir(path)?;

        if is_function_dir(path) {
            if state.linked(path) {
                return Err(errno(libc::EBUSY));
            }
            let extra_luns = state
                .children(path)
                .any(|(child, _)| name_of(child).starts_with("lun.") && name_of(child) != "lun.0");
            if extra_luns {
                return Err(errno(libc::ENOTEMPTY));
            }
            state.remove_tree(path);
        } else if path.parent().is_some_and(is_function_dir) && name_of(path).starts_with("lun.") {
            if name_of(path) == "lun.0" {
                return Err(errno(libc::EPERM));
            }
            state.remove_tree(path);
        } else {
            if state.children(path).next().is_some() {
                return Err(errno(libc::ENOTEMPTY));
            }
            state.nodes.remove(path);
        }
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        let mut state = self.lock();
        state
            .mutations
            .push(format!("link {} -> {}", link.display(), target.display()));

        state.require_dir(link.parent().unwrap_or(Path::new("")))?;
        state.require_dir(target)?;
        if state.nodes.contains_key(link) {
            return Err(errno(libc::EEXIST));
        }
        if state.bound() {
            return Err(errno(libc::EBUSY));
        }
        if state.fail_link_to.as_deref() == Some(name_of(target)) {
            return Err(errno(libc::EIO));
        }
        state
            .nodes
            .insert(link.to_path_buf(), Node::Link(target.to_path_buf()));
        Ok(())
    }

    fn read_link(&self, link: &Path) -> io::Result<PathBuf> {
        match self.lock().nodes.get(link) {
            Some(Node::Link(target)) => Ok(target.clone()),
            Some(_) => Err(errno(libc::EINVAL)),
            None => Err(errno(libc::ENOENT)),
        }
    }

    fn remove_link(&self, link: &Path) -> io::Result<()> {
        let mut state = self.lock();
        state.mutations.push(format!("unlink {}", link.display()));

        match state.nodes.get(link) {
            Some(Node::Link(_)) => {}
            Some(_) => return Err(errno(libc::EISDIR)),
            None => return Err(errno(libc::ENOENT)),
        }
        if state.bound() {
            return Err(errno(libc::EBUSY));
        }
        state.nodes.remove(link);
        Ok(())
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<Entry>> {
        let state = self.lock();
        state.require_dir(dir)?;
        Ok(state
            .children(dir)
            .map(|(path, node)| Entry {
                name: name_of(path).to_string(),
                kind: match node {
                    Node::Dir => EntryKind::Dir,
                    Node::File(_) => EntryKind::File,
                    Node::Link(_) => EntryKind::Link,
                },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn p(path: &str) -> &Path {
        Path::new(path)
    }

    #[msd_test_utils::logged_test]
    fn new_function_has_default_lun() {
        let fs = MemoryConfigFs::new();
        fs.create_dir(p("functions/mass_storage.msd0")).unwrap();

        assert!(fs.exists("functions/mass_storage.msd0/lun.0/file"));
        assert_eq!(
            fs.remove_dir(p("functions/mass_storage.msd0/lun.0")).unwrap_err().raw_os_error(),
            Some(libc::EPERM)
        );

        fs.create_dir(p("functions/mass_storage.msd0/lun.1")).unwrap();
        assert_eq!(
            fs.remove_dir(p("functions/mass_storage.msd0")).unwrap_err().raw_os_error(),
            Some(libc::ENOTEMPTY)
        );
        fs.remove_dir(p("functions/mass_storage.msd0/lun.1")).unwrap();
        fs.remove_dir(p("functions/mass_storage.msd0")).unwrap();
        assert!(!fs.exists("functions/mass_storage.msd0/lun.0"));
    }

    #[msd_test_utils::logged_test]
    fn udc_binding_rules() {
        let fs = MemoryConfigFs::new();
        assert_eq!(fs.udc(), UDC);

        assert_eq!(
            fs.remove_link(p("configs/b.1/f1")).unwrap_err().raw_os_error(),
            Some(libc::EBUSY)
        );
        fs.write(p("UDC"), b"\n").unwrap();
        assert_eq!(fs.write(p("UDC"), b"\n").unwrap_err().raw_os_error(), Some(libc::ENODEV));

        fs.remove_link(p("configs/b.1/f1")).unwrap();
        assert_eq!(
            fs.write(p("UDC"), format!("{UDC}\n").as_bytes()).unwrap_err().raw_os_error(),
            Some(libc::ENODEV)
        );
    }

    #[msd_test_utils::logged_test]
    fn file_attribute_resolves_descriptor() {
        let fs = MemoryConfigFs::new();
        fs.create_dir(p("functions/mass_storage.msd0")).unwrap();

        let backing = tempfile::NamedTempFile::new().unwrap();
        let value = format!("/proc/{}/fd/{}\n", std::process::id(), backing.as_file().as_raw_fd());
        fs.write(p("functions/mass_storage.msd0/lun.0/file"), value.as_bytes())
            .unwrap();

        let stored = fs.read(p("functions/mass_storage.msd0/lun.0/file")).unwrap();
        let expected = std::fs::canonicalize(backing.path()).unwrap();
        assert_eq!(stored, [expected.as_os_str().as_bytes(), b"\n"].concat());
    }

    #[msd_test_utils::logged_test]
    fn linked_lun_attributes_are_busy_while_bound() {
        let fs = MemoryConfigFs::new();
        fs.create_dir(p("functions/mass_storage.msd0")).unwrap();
        fs.write(p("UDC"), b"\n").unwrap();
        fs.symlink(p("functions/mass_storage.msd0"), p("configs/b.1/msd"))
            .unwrap();
        fs.write(p("UDC"), format!("{UDC}\n").as_bytes()).unwrap();

        assert_eq!(
            fs.write(p("functions/mass_storage.msd0/lun.0/ro"), b"1\n")
                .unwrap_err()
                .raw_os_error(),
            Some(libc::EBUSY)
        );
        assert_eq!(
            fs.remove_dir(p("functions/mass_storage.msd0")).unwrap_err().raw_os_error(),
            Some(libc::EBUSY)
        );
    }
}
