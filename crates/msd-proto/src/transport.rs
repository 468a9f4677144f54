// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Byte streams that can also carry file descriptors.
//!
//! A descriptor batch is always coupled to exactly one zero marker byte in the
//! stream. The receiver consumes that byte together with the ancillary data,
//! so a reader can never skip over a descriptor-carrying frame unnoticed.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::trace;

use crate::ProtoError;

const MARKER: u8 = 0;

pub trait FdTransport: Read + Write {
    /// Send one marker byte with `fds` attached.
    fn send_with_descriptors(&mut self, fds: &[BorrowedFd<'_>]) -> io::Result<()>;

    /// Receive one marker byte and exactly `count` descriptors.
    ///
    /// Descriptors that did arrive are closed when the count is wrong.
    fn receive_with_descriptors(&mut self, count: usize) -> Result<Vec<OwnedFd>, ProtoError>;
}

fn check_received(marker: u8, fds: Vec<OwnedFd>, count: usize) -> Result<Vec<OwnedFd>, ProtoError> {
    if marker != MARKER {
        return Err(ProtoError::InvalidMarker(marker));
    }
    if fds.len() != count {
        return Err(ProtoError::DescriptorCount {
            expected: count,
            actual: fds.len(),
        });
    }
    Ok(fds)
}

fn control_space(fd_count: usize) -> usize {
    let payload = (fd_count * mem::size_of::<RawFd>()) as libc::c_uint;
    unsafe { libc::CMSG_SPACE(payload) as usize }
}

impl FdTransport for UnixStream {
    fn send_with_descriptors(&mut self, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let payload_len = mem::size_of_val(raw.as_slice());
        let space = control_space(raw.len());
        // u64 backing keeps the buffer aligned for cmsghdr.
        let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

        let marker = [MARKER];
        let mut iov = libc::iovec {
            iov_base: marker.as_ptr() as *mut libc::c_void,
            iov_len: marker.len(),
        };

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if !raw.is_empty() {
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = space as _;

            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                if cmsg.is_null() {
                    return Err(io::Error::other("control buffer too small"));
                }
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(payload_len as libc::c_uint) as _;
                ptr::copy_nonoverlapping(
                    raw.as_ptr(),
                    libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                    raw.len(),
                );
            }
        }

        loop {
            let sent = unsafe { libc::sendmsg(self.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
            if sent < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if sent == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            trace!(operation = "send_with_descriptors", fd_count = raw.len(), "Sent descriptor batch");
            return Ok(());
        }
    }

    fn receive_with_descriptors(&mut self, count: usize) -> Result<Vec<OwnedFd>, ProtoError> {
        // Room for one extra descriptor so that surplus ones are counted, not truncated.
        let space = control_space(count + 1);
        let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

        let mut marker = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: marker.as_mut_ptr().cast(),
            iov_len: marker.len(),
        };

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let received = loop {
            let n = unsafe { libc::recvmsg(self.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            break n;
        };

        // Take ownership of everything that arrived before judging it.
        let mut fds = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    for i in 0..data_len / mem::size_of::<RawFd>() {
                        fds.push(OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i))));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if received == 0 {
            return Err(ProtoError::Eof);
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(ProtoError::DescriptorCount {
                expected: count,
                actual: fds.len().max(count + 1),
            });
        }

        trace!(operation = "receive_with_descriptors", fd_count = fds.len(), "Received descriptor batch");
        check_received(marker[0], fds, count)
    }
}

struct Chunk {
    data: VecDeque<u8>,
    fds: Vec<OwnedFd>,
}

#[derive(Default)]
struct Pipe {
    chunks: VecDeque<Chunk>,
    writer_closed: bool,
    reader_closed: bool,
}

#[derive(Default)]
struct Channel {
    pipe: Mutex<Pipe>,
    ready: Condvar,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, Pipe> {
        self.pipe.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, chunk: Chunk) -> io::Result<()> {
        let mut pipe = self.lock();
        if pipe.reader_closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        pipe.chunks.push_back(chunk);
        self.ready.notify_all();
        Ok(())
    }

    /// Block until data is available. Returns `None` at end of stream.
    fn wait_readable(&self) -> Option<MutexGuard<'_, Pipe>> {
        let mut pipe = self.lock();
        loop {
            if !pipe.chunks.is_empty() {
                return Some(pipe);
            }
            if pipe.writer_closed {
                return None;
            }
            pipe = self
                .ready
                .wait(pipe)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// In-process stand-in for a connected Unix socket pair.
///
/// Descriptors are duplicated on send, the way the kernel installs fresh
/// descriptors in the receiving process. A plain read that consumes a
/// descriptor-carrying byte closes the attached descriptors, as a real
/// socket does.
pub struct MemoryTransport {
    inbound: Arc<Channel>,
    outbound: Arc<Channel>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let a_to_b = Arc::new(Channel::default());
        let b_to_a = Arc::new(Channel::default());
        (
            MemoryTransport {
                inbound: b_to_a.clone(),
                outbound: a_to_b.clone(),
            },
            MemoryTransport {
                inbound: a_to_b,
                outbound: b_to_a,
            },
        )
    }

    /// Close the sending half, so the peer reads end of stream.
    pub fn shutdown_write(&self) {
        let mut pipe = self.outbound.lock();
        pipe.writer_closed = true;
        self.outbound.ready.notify_all();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown_write();
        self.inbound.lock().reader_closed = true;
    }
}

impl Read for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(mut pipe) = self.inbound.wait_readable() else {
            return Ok(0);
        };

        let mut written = 0;
        while written < buf.len() {
            let Some(chunk) = pipe.chunks.front_mut() else {
                break;
            };
            // Attached descriptors are discarded by a plain read.
            chunk.fds.clear();
            while written < buf.len() {
                match chunk.data.pop_front() {
                    Some(byte) => {
                        buf[written] = byte;
                        written += 1;
                    }
                    None => break,
                }
            }
            if chunk.data.is_empty() {
                pipe.chunks.pop_front();
            }
        }
        Ok(written)
    }
}

impl Write for MemoryTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.outbound.push(Chunk {
            data: buf.iter().copied().collect(),
            fds: Vec::new(),
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FdTransport for MemoryTransport {
    fn send_with_descriptors(&mut self, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        let fds = fds
            .iter()
            .map(|fd| fd.try_clone_to_owned())
            .collect::<io::Result<Vec<_>>>()?;
        self.outbound.push(Chunk {
            data: VecDeque::from([MARKER]),
            fds,
        })
    }

    fn receive_with_descriptors(&mut self, count: usize) -> Result<Vec<OwnedFd>, ProtoError> {
        let Some(mut pipe) = self.inbound.wait_readable() else {
            return Err(ProtoError::Eof);
        };
        let Some(chunk) = pipe.chunks.front_mut() else {
            return Err(ProtoError::Eof);
        };

        let marker = chunk.data.pop_front().unwrap_or(MARKER);
        let fds = mem::take(&mut chunk.fds);
        if chunk.data.is_empty() {
            pipe.chunks.pop_front();
        }
        drop(pipe);

        check_received(marker, fds, count)
    }
}
