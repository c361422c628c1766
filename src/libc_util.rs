use alloc_counter::no_alloc;
use std::ffi::{c_int, c_void, CStr};
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::error::{bail, bail_errno, ErrorKind, Result};

/// Create a Unix stream socket pair. Both ends are close-on-exec, so they never outlive the
/// bootstrap into whatever the init process execs.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn socket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut socket_fds = [0; 2];
    let 0.. = (unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            socket_fds.as_mut_ptr(),
        )
    }) else {
        bail_errno!("failed to create socketpair");
    };
    let [a, b] = socket_fds;
    Ok(unsafe { (OwnedFd::from_raw_fd(a), OwnedFd::from_raw_fd(b)) })
}

/// Send a value, interpretable as bytes, to a socket's file descriptor.
///
/// # Safety
///
/// `T` must be plain old data.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn socket_send<T: Copy>(sock_fd: RawFd, value: T) -> Result<()> {
    let size = mem::size_of::<T>();
    let bytes = std::slice::from_raw_parts((&value) as *const T as *const u8, size);
    socket_send_bytes(sock_fd, bytes)
}

/// Receive a value, interpretable as bytes, from a socket's file descriptor.
///
/// # Safety
///
/// Every bit pattern of `T` must be valid.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn socket_recv<T: Copy>(sock_fd: RawFd) -> Result<T> {
    let mut output_slot = mem::MaybeUninit::<T>::uninit();
    let size = mem::size_of::<T>();
    let buf = std::slice::from_raw_parts_mut(output_slot.as_mut_ptr().cast::<u8>(), size);
    socket_recv_bytes(sock_fd, buf)?;
    Ok(output_slot.assume_init())
}

/// Send a buffer in a single `send(2)` call. A short write is an error, and a closed peer is
/// reported as `EPIPE` rather than raising `SIGPIPE`.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn socket_send_bytes(sock_fd: RawFd, buf: &[u8]) -> Result<()> {
    let result = unsafe {
        libc::send(
            sock_fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };

    if result == -1 {
        bail_errno!(ErrorKind::Protocol, "failed to send to socket");
    }

    if (result as usize) != buf.len() {
        bail!(
            ErrorKind::Protocol,
            "failed to send socket message in single write call"
        );
    }

    Ok(())
}

/// Fill a buffer with a single `read(2)` call. EOF and short reads are errors.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn socket_recv_bytes(sock_fd: RawFd, buf: &mut [u8]) -> Result<()> {
    let result = read_once(sock_fd, buf).map_err(|e| e.kind(ErrorKind::Protocol))?;

    if result == 0 && !buf.is_empty() {
        bail!(
            ErrorKind::Protocol,
            "reached EOF while receiving from socket"
        );
    }

    if result != buf.len() {
        bail!(
            ErrorKind::Protocol,
            "failed to receive socket message in single read call"
        );
    }

    Ok(())
}

/// A single `read(2)`, returning how many bytes arrived.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn read_once(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let result = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if result == -1 {
        bail_errno!("failed to read from file descriptor");
    }
    Ok(result as usize)
}

/// A single `write(2)`. Works on pipes as well as sockets; a short write is an error.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn write_once(fd: RawFd, buf: &[u8]) -> Result<()> {
    let result = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if result == -1 {
        bail_errno!("failed to write to file descriptor");
    }
    if (result as usize) != buf.len() {
        bail!(ErrorKind::Io, "failed to write message in single write call");
    }
    Ok(())
}

/// Disassociate the calling process from the namespaces in `flags`.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn unshare(flags: c_int) -> Result<()> {
    let 0 = (unsafe { libc::unshare(flags) }) else {
        bail_errno!(ErrorKind::Namespace, "unshare(2) failed");
    };
    Ok(())
}

/// Become uid 0 and gid 0. Only meaningful right after entering a user namespace whose maps
/// cover root.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn become_root() -> Result<()> {
    let 0 = (unsafe { libc::setresuid(0, 0, 0) }) else {
        bail_errno!(ErrorKind::Identity, "setresuid(0, 0, 0) failed");
    };
    let 0 = (unsafe { libc::setresgid(0, 0, 0) }) else {
        bail_errno!(ErrorKind::Identity, "setresgid(0, 0, 0) failed");
    };
    Ok(())
}

/// Rename the calling thread, as shown by `ps` and `/proc/PID/comm`. Names are truncated by the
/// kernel to 15 bytes.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn set_process_name(name: &CStr) -> Result<()> {
    let name_ptr = name.as_ptr() as libc::c_ulong;
    let 0 = (unsafe { libc::prctl(libc::PR_SET_NAME, name_ptr, 0, 0, 0) }) else {
        bail_errno!("prctl(PR_SET_NAME) failed");
    };
    Ok(())
}
