use alloc_counter::no_alloc;
use std::ffi::c_ulong;

use crate::error::{bail_errno, ErrorKind, Result};
use crate::stage::Stage;

/// What a call to [`clone_parent`] returned, as seen by each of the two processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// The calling process. `child` is the pid of the new process.
    Parent { child: libc::pid_t },
    /// The new process.
    Child,
}

/// Outcome of [`spawn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spawn {
    /// We are still the spawning stage, and a descendant now exists with this pid.
    Created(libc::pid_t),
    /// We are the descendant, and should continue as this stage.
    Resumed(Stage),
}

/// Create a process which continues from this call on a copy of the caller's stack, as
/// `fork(2)` does, but as a sibling of the caller rather than its child.
///
/// `CLONE_PARENT` makes our own parent the new process' parent, so every stage of the bootstrap
/// ends up reapable by whoever started the original process.
///
/// The raw syscall is used because the libc wrapper insists on a fresh stack and entry point.
/// The new process starts with only the calling thread, so the caller must not hold locks
/// another thread could need.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn clone_parent() -> Result<Fork> {
    // NOTE: You MUST set `SIGCHLD` in order for `waitpid()` after `clone()` to work properly.
    let flags = (libc::CLONE_PARENT | libc::SIGCHLD) as c_ulong;

    // A null stack pointer makes the child share (a copy of) the caller's stack.
    let null: c_ulong = 0;

    // s390x takes the stack pointer first; everyone else takes the flags first.
    #[cfg(target_arch = "s390x")]
    let result = unsafe { libc::syscall(libc::SYS_clone, null, flags, null, null, null) };
    #[cfg(not(target_arch = "s390x"))]
    let result = unsafe { libc::syscall(libc::SYS_clone, flags, null, null, null, null) };

    match result {
        ..=-1 => bail_errno!(ErrorKind::Spawn, "clone(2) failed"),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent {
            child: pid as libc::pid_t,
        }),
    }
}

/// Spawn a descendant which resumes as `resume_as`.
///
/// Returns twice: [`Spawn::Created`] in the caller, [`Spawn::Resumed`] in the new process. The
/// new process must unwind straight back to the stage dispatcher with the tag it was given.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn spawn(resume_as: Stage) -> Result<Spawn> {
    match clone_parent()? {
        Fork::Parent { child } => Ok(Spawn::Created(child)),
        Fork::Child => Ok(Spawn::Resumed(resume_as)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncPair;

    #[test]
    fn clone_parent_creates_a_sibling() {
        let mut pair = SyncPair::new().unwrap();

        match spawn(Stage::Child).unwrap() {
            Spawn::Resumed(stage) => {
                // Only raw syscalls from here on: the test harness has other threads.
                let code = match pair.child_end() {
                    Ok(chan) => {
                        let ids = [unsafe { libc::getpid() }, unsafe { libc::getppid() }];
                        let tag = if stage == Stage::Child { 1 } else { 0 };
                        let sent = chan.send_pid(ids[0]).and_then(|()| chan.send_pid(ids[1]));
                        let sent = sent.and_then(|()| chan.send_pid(tag));
                        if sent.is_ok() {
                            0
                        } else {
                            1
                        }
                    }
                    Err(_) => 1,
                };
                unsafe { libc::_exit(code) };
            }
            Spawn::Created(child) => {
                let chan = pair.parent_end().unwrap();
                assert_eq!(chan.recv_pid().unwrap(), child);
                assert_eq!(chan.recv_pid().unwrap(), unsafe { libc::getppid() });
                assert_eq!(chan.recv_pid().unwrap(), 1, "resumed with the wrong stage");
                assert_ne!(child, unsafe { libc::getpid() });
            }
        }
    }
}
