// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Thin wrappers over the raw syscalls the daemon needs.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

pub const CONFIGFS_MAGIC: u32 = 0x6265_6570;
pub const PROC_SUPER_MAGIC: u32 = 0x9fa0;
pub const SELINUX_MAGIC: u32 = 0xf97c_ff8c;

/// Fail unless `fd` lives on the filesystem identified by `magic`.
///
/// Guards against reading look-alike files from FUSE or bind mounts.
pub fn check_fs_magic<T: AsFd>(fd: T, magic: u32) -> io::Result<T> {
    let mut stat: libc::statfs = unsafe { mem::zeroed() };
    let ret = unsafe { libc::fstatfs(fd.as_fd().as_raw_fd(), &mut stat) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    // f_type is signed and of varying width depending on the target.
    let actual = stat.f_type as u64 as u32;
    if actual != magic {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("untrusted filesystem magic {actual:#x}, expected {magic:#x}"),
        ));
    }
    Ok(fd)
}

/// Whether `fd` refers to a regular file.
pub fn is_regular_file(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    let ret = unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_mode & libc::S_IFMT == libc::S_IFREG)
}

/// Whether `fd` was opened with write access.
pub fn is_writable(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let mode = flags & libc::O_ACCMODE;
    Ok(mode == libc::O_RDWR || mode == libc::O_WRONLY)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn pidfd_open(pid: libc::pid_t) -> io::Result<OwnedFd> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret as libc::c_int) })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn pidfd_send_signal(pidfd: BorrowedFd<'_>, signal: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            signal,
            std::ptr::null::<libc::siginfo_t>(),
            0u32,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn pidfd_open(_pid: libc::pid_t) -> io::Result<OwnedFd> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "pidfd requires Linux"))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn pidfd_send_signal(_pidfd: BorrowedFd<'_>, _signal: libc::c_int) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "pidfd requires Linux"))
}
