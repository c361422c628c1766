use alloc_counter::no_alloc;
use std::fmt;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crate::error::{bail, Error, ErrorKind, Result};
use crate::libc_util::{socket_pair, socket_recv, socket_recv_bytes, socket_send, socket_send_bytes};

/// Control tags exchanged between stages. Sent as a native-endian `u32`.
///
/// Every `*Pls` a descendant sends is answered by exactly one matching `*Ack` before the
/// descendant continues.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMsg {
    /// Request parent to map our users.
    UsermapPls = 0x40,
    /// Mapping finished by the parent.
    UsermapAck = 0x41,
    /// Tell parent we're sending the PID.
    RecvpidPls = 0x42,
    /// PID was correctly received by parent.
    RecvpidAck = 0x43,
    /// The grandchild is ready to run.
    Grandchild = 0x44,
    /// The child or grandchild has finished.
    ChildFinish = 0x45,
    /// Tell parent to send mount sources. Never part of this handshake.
    MountsourcesPls = 0x46,
    /// All mount sources have been sent. Never part of this handshake.
    MountsourcesAck = 0x47,
}

impl SyncMsg {
    pub fn from_raw(raw: u32) -> Option<SyncMsg> {
        Some(match raw {
            0x40 => SyncMsg::UsermapPls,
            0x41 => SyncMsg::UsermapAck,
            0x42 => SyncMsg::RecvpidPls,
            0x43 => SyncMsg::RecvpidAck,
            0x44 => SyncMsg::Grandchild,
            0x45 => SyncMsg::ChildFinish,
            0x46 => SyncMsg::MountsourcesPls,
            0x47 => SyncMsg::MountsourcesAck,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            SyncMsg::UsermapPls => "SYNC_USERMAP_PLS",
            SyncMsg::UsermapAck => "SYNC_USERMAP_ACK",
            SyncMsg::RecvpidPls => "SYNC_RECVPID_PLS",
            SyncMsg::RecvpidAck => "SYNC_RECVPID_ACK",
            SyncMsg::Grandchild => "SYNC_GRANDCHILD",
            SyncMsg::ChildFinish => "SYNC_CHILD_FINISH",
            SyncMsg::MountsourcesPls => "SYNC_MOUNTSOURCES_PLS",
            SyncMsg::MountsourcesAck => "SYNC_MOUNTSOURCES_ACK",
        }
    }
}

impl fmt::Display for SyncMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One end of a sync socket. Blocking, and exact: a short read or write is an error.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    pub fn new(fd: OwnedFd) -> Channel {
        Channel { fd }
    }

    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn send(&self, msg: SyncMsg) -> Result<()> {
        unsafe { socket_send::<u32>(self.fd.as_raw_fd(), msg as u32) }
    }

    /// Receive the next tag as its raw value.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn recv_raw(&self) -> Result<u32> {
        unsafe { socket_recv::<u32>(self.fd.as_raw_fd()) }
    }

    /// Receive the next tag. Values outside the tag set are a protocol error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn recv(&self) -> Result<SyncMsg> {
        let raw = self.recv_raw()?;
        let Some(msg) = SyncMsg::from_raw(raw) else {
            bail!(ErrorKind::Protocol, "received unknown sync message");
        };
        Ok(msg)
    }

    /// Receive the next tag, which must be `expected`.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn expect(&self, expected: SyncMsg) -> Result<()> {
        let got = self.recv_raw()?;
        if got != expected as u32 {
            return Err(Error::new(ErrorKind::UnexpectedMessage { expected, got }));
        }
        Ok(())
    }

    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn send_bytes(&self, buf: &[u8]) -> Result<()> {
        socket_send_bytes(self.fd.as_raw_fd(), buf)
    }

    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn recv_bytes(&self, buf: &mut [u8]) -> Result<()> {
        socket_recv_bytes(self.fd.as_raw_fd(), buf)
    }

    /// Send a PID payload. Always follows a [`SyncMsg::RecvpidPls`] as a separate write.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn send_pid(&self, pid: libc::pid_t) -> Result<()> {
        self.send_bytes(&pid.to_ne_bytes())
    }

    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn recv_pid(&self) -> Result<libc::pid_t> {
        let mut buf = [0u8; mem::size_of::<libc::pid_t>()];
        self.recv_bytes(&mut buf)?;
        Ok(libc::pid_t::from_ne_bytes(buf))
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Both ends of a sync socket between a parent and one descendant, before they are split up.
///
/// Each process takes the end it speaks through and drops the other, so that when the peer exits
/// a blocked read observes EOF instead of hanging on a leaked copy.
#[derive(Debug)]
pub struct SyncPair {
    parent: Option<OwnedFd>,
    child: Option<OwnedFd>,
}

impl SyncPair {
    pub fn new() -> Result<SyncPair> {
        let (parent, child) = socket_pair()?;
        Ok(SyncPair {
            parent: Some(parent),
            child: Some(child),
        })
    }

    /// Take the parent's end, closing the child's.
    pub fn parent_end(&mut self) -> Result<Channel> {
        self.close_child();
        let Some(fd) = self.parent.take() else {
            bail!(ErrorKind::Protocol, "parent sync endpoint already taken");
        };
        Ok(Channel::new(fd))
    }

    /// Take the child's end, closing the parent's.
    pub fn child_end(&mut self) -> Result<Channel> {
        self.close_parent();
        let Some(fd) = self.child.take() else {
            bail!(ErrorKind::Protocol, "child sync endpoint already taken");
        };
        Ok(Channel::new(fd))
    }

    pub fn close_parent(&mut self) {
        drop(self.parent.take());
    }

    pub fn close_child(&mut self) {
        drop(self.child.take());
    }

    /// Close whatever this process still holds.
    pub fn close(&mut self) {
        self.close_parent();
        self.close_child();
    }

    pub fn holds_parent_end(&self) -> bool {
        self.parent.is_some()
    }

    pub fn holds_child_end(&self) -> bool {
        self.child.is_some()
    }

    pub fn is_closed(&self) -> bool {
        !self.holds_parent_end() && !self.holds_child_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_and_pids_cross_the_channel() {
        let mut pair = SyncPair::new().unwrap();
        let child = pair.child.take().map(Channel::new).unwrap();
        let parent = pair.parent_end().unwrap();
        assert!(pair.is_closed());

        child.send(SyncMsg::RecvpidPls).unwrap();
        child.send_pid(4242).unwrap();
        assert_eq!(parent.recv().unwrap(), SyncMsg::RecvpidPls);
        assert_eq!(parent.recv_pid().unwrap(), 4242);

        parent.send(SyncMsg::RecvpidAck).unwrap();
        child.expect(SyncMsg::RecvpidAck).unwrap();
    }

    #[test]
    fn expect_rejects_other_tags() {
        let (a, b) = socket_pair().unwrap();
        let (a, b) = (Channel::new(a), Channel::new(b));
        a.send(SyncMsg::RecvpidAck).unwrap();
        let err = b.expect(SyncMsg::UsermapAck).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::UnexpectedMessage {
                expected: SyncMsg::UsermapAck,
                got: 0x43
            }
        );
    }

    #[test]
    fn recv_rejects_unknown_tags() {
        let (a, b) = socket_pair().unwrap();
        let (a, b) = (Channel::new(a), Channel::new(b));
        a.send_bytes(&0x99u32.to_ne_bytes()).unwrap();
        let err = b.recv().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn raw_values_round_trip_through_names() {
        for raw in 0x40..=0x47 {
            let msg = SyncMsg::from_raw(raw).unwrap();
            assert_eq!(msg as u32, raw);
            assert!(msg.name().starts_with("SYNC_"));
        }
        assert_eq!(SyncMsg::from_raw(0x3f), None);
        assert_eq!(SyncMsg::from_raw(0x48), None);
    }

    #[test]
    fn dropping_the_unused_end_gives_the_peer_eof() {
        let mut pair = SyncPair::new().unwrap();
        let parent = pair.parent_end().unwrap();
        // The child end was closed by `parent_end`, so nobody can ever answer.
        let err = parent.recv().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert_eq!(err.cause, Some("reached EOF while receiving from socket"));
    }

    #[test]
    fn writes_toward_a_closed_end_break() {
        let mut pair = SyncPair::new().unwrap();
        let child = pair.child_end().unwrap();
        let err = child.send(SyncMsg::ChildFinish).unwrap_err();
        assert_eq!(err.errno, libc::EPIPE);
    }

    #[test]
    fn endpoints_are_taken_once() {
        let mut pair = SyncPair::new().unwrap();
        let _parent = pair.parent_end().unwrap();
        assert!(pair.parent_end().is_err());
        assert!(pair.child_end().is_err());
    }
}
