//! Decoding of the bootstrap configuration stream.
//!
//! The caller frames the configuration as a single netlink message: a 16-byte `nlmsghdr` whose
//! length covers the header itself, followed by `nlattr` records. Each record is a 4-byte header
//! (`nla_len`, `nla_type`, both native-endian `u16`, with `nla_len` covering the header) and a
//! value padded to a multiple of 4 bytes. Only one attribute type is understood; anything else is
//! rejected.

use std::ffi::c_int;
use std::os::fd::{AsRawFd, BorrowedFd};

use crate::error::{Error, ErrorKind, Result};
use crate::libc_util::read_once;

/// Attribute type carrying the clone flags as a native-endian `u32`.
pub const CLONE_FLAGS_ATTR: u16 = 27281;

/// Message type callers conventionally put in the `nlmsghdr`. It is not checked on decode.
pub const INIT_MSG: u16 = 62000;

/// Largest payload we are willing to allocate for.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

const NLMSG_HDRLEN: usize = 16;
const NLA_HDRLEN: usize = 4;
const NLA_ALIGNTO: usize = 4;

fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Ways the configuration stream can be malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid netlink header length {len}")]
    ShortHeader { len: usize },

    #[error("netlink message length {len} is smaller than its own header")]
    HeaderLength { len: u32 },

    #[error("netlink payload of {len} bytes exceeds the size limit")]
    PayloadTooLarge { len: usize },

    #[error("failed to read netlink payload, {got} != {expected}")]
    ShortPayload { expected: usize, got: usize },

    #[error("truncated attribute header at offset {offset} ({remaining} bytes left)")]
    TruncatedAttribute { offset: usize, remaining: usize },

    #[error("attribute at offset {offset} claims invalid length {len}")]
    AttributeLength { offset: usize, len: usize },

    #[error("unknown netlink message type {kind}")]
    UnknownAttribute { kind: u16 },

    #[error("clone flags attribute carries {len} bytes instead of 4")]
    FlagsLength { len: usize },
}

/// A namespace which can be requested through the clone flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Cgroup,
    Ipc,
    Network,
    Mount,
    Pid,
    User,
    Uts,
}

impl Namespace {
    pub const ALL: [Namespace; 7] = [
        Namespace::Cgroup,
        Namespace::Ipc,
        Namespace::Network,
        Namespace::Mount,
        Namespace::Pid,
        Namespace::User,
        Namespace::Uts,
    ];

    /// The `CLONE_NEW*` flag for this namespace.
    pub fn clone_flag(self) -> u32 {
        let flag = match self {
            Namespace::Cgroup => libc::CLONE_NEWCGROUP,
            Namespace::Ipc => libc::CLONE_NEWIPC,
            Namespace::Network => libc::CLONE_NEWNET,
            Namespace::Mount => libc::CLONE_NEWNS,
            Namespace::Pid => libc::CLONE_NEWPID,
            Namespace::User => libc::CLONE_NEWUSER,
            Namespace::Uts => libc::CLONE_NEWUTS,
        };
        flag as u32
    }
}

/// Bitset of namespaces to enter, as a struct of booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NamespaceSet {
    pub cgroup: bool,
    pub ipc: bool,
    pub network: bool,
    pub mount: bool,
    pub pid: bool,
    pub user: bool,
    pub uts: bool,
}

impl NamespaceSet {
    pub fn contains(&self, namespace: Namespace) -> bool {
        match namespace {
            Namespace::Cgroup => self.cgroup,
            Namespace::Ipc => self.ipc,
            Namespace::Network => self.network,
            Namespace::Mount => self.mount,
            Namespace::Pid => self.pid,
            Namespace::User => self.user,
            Namespace::Uts => self.uts,
        }
    }

    fn from_clone_flags(flags: u32) -> NamespaceSet {
        let has = |ns: Namespace| flags & ns.clone_flag() != 0;
        NamespaceSet {
            cgroup: has(Namespace::Cgroup),
            ipc: has(Namespace::Ipc),
            network: has(Namespace::Network),
            mount: has(Namespace::Mount),
            pid: has(Namespace::Pid),
            user: has(Namespace::User),
            uts: has(Namespace::Uts),
        }
    }
}

/// The decoded configuration. Immutable once decoded; every stage sees its own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NamespaceConfig {
    /// Namespace flags plus any other flags the caller wants passed to `unshare(2)`.
    pub clone_flags: u32,
}

impl NamespaceConfig {
    pub fn new(clone_flags: u32) -> NamespaceConfig {
        NamespaceConfig { clone_flags }
    }

    /// Request a new namespace.
    pub fn unshare(mut self, namespace: Namespace) -> NamespaceConfig {
        self.clone_flags |= namespace.clone_flag();
        self
    }

    pub fn namespaces(&self) -> NamespaceSet {
        NamespaceSet::from_clone_flags(self.clone_flags)
    }

    pub fn requests(&self, namespace: Namespace) -> bool {
        self.clone_flags & namespace.clone_flag() != 0
    }

    /// Flags for the stage-1 `unshare(2)`: everything except the user namespace, which has
    /// already been entered, and the cgroup namespace, which waits for stage-2.
    pub fn child_unshare_flags(&self) -> c_int {
        let deferred = Namespace::User.clone_flag() | Namespace::Cgroup.clone_flag();
        (self.clone_flags & !deferred) as c_int
    }

    /// Flags for the stage-2 `unshare(2)`: only the cgroup namespace, if requested.
    pub fn init_unshare_flags(&self) -> c_int {
        (self.clone_flags & Namespace::Cgroup.clone_flag()) as c_int
    }

    /// Read one framed configuration message from `fd`.
    ///
    /// Both the header and the payload must arrive in a single read each; anything short is a
    /// decode error rather than a reason to wait for more.
    pub fn read_from(fd: BorrowedFd<'_>) -> Result<NamespaceConfig> {
        let mut header = [0u8; NLMSG_HDRLEN];
        let len = read_once(fd.as_raw_fd(), &mut header)
            .map_err(|e| e.kind(ErrorKind::Config).cause("failed to read netlink header"))?;
        if len != NLMSG_HDRLEN {
            return Err(DecodeError::ShortHeader { len }.into());
        }

        let size = payload_len(&header)?;
        let mut payload = vec![0u8; size];
        if size > 0 {
            let got = read_once(fd.as_raw_fd(), &mut payload)
                .map_err(|e| e.kind(ErrorKind::Config).cause("failed to read netlink payload"))?;
            if got != size {
                return Err(DecodeError::ShortPayload {
                    expected: size,
                    got,
                }
                .into());
            }
        }

        NamespaceConfig::decode_payload(&payload).map_err(Error::from)
    }

    /// Decode the attribute records following the netlink header.
    pub fn decode_payload(payload: &[u8]) -> std::result::Result<NamespaceConfig, DecodeError> {
        let mut config = NamespaceConfig::default();
        let mut offset = 0;

        while offset < payload.len() {
            let rest = &payload[offset..];
            if rest.len() < NLA_HDRLEN {
                return Err(DecodeError::TruncatedAttribute {
                    offset,
                    remaining: rest.len(),
                });
            }

            let nla_len = u16::from_ne_bytes([rest[0], rest[1]]) as usize;
            let nla_type = u16::from_ne_bytes([rest[2], rest[3]]);
            if nla_len < NLA_HDRLEN || nla_len > rest.len() {
                return Err(DecodeError::AttributeLength {
                    offset,
                    len: nla_len,
                });
            }
            let value = &rest[NLA_HDRLEN..nla_len];

            match nla_type {
                CLONE_FLAGS_ATTR => {
                    let bytes: [u8; 4] = value
                        .try_into()
                        .map_err(|_| DecodeError::FlagsLength { len: value.len() })?;
                    config.clone_flags = u32::from_ne_bytes(bytes);
                }
                kind => return Err(DecodeError::UnknownAttribute { kind }),
            }

            // The final record may omit its padding.
            offset += nla_align(nla_len).min(rest.len());
        }

        Ok(config)
    }

    /// Encode this configuration as a complete framed message, as a caller would send it.
    pub fn encode(&self) -> Vec<u8> {
        let attr_len = NLA_HDRLEN + 4;
        let total_len = NLMSG_HDRLEN + nla_align(attr_len);

        let mut buf = Vec::with_capacity(total_len);
        // nlmsghdr: len, type, flags, seq, pid.
        buf.extend((total_len as u32).to_ne_bytes());
        buf.extend(INIT_MSG.to_ne_bytes());
        buf.extend(0u16.to_ne_bytes());
        buf.extend(0u32.to_ne_bytes());
        buf.extend(0u32.to_ne_bytes());
        // nlattr carrying the flags.
        buf.extend((attr_len as u16).to_ne_bytes());
        buf.extend(CLONE_FLAGS_ATTR.to_ne_bytes());
        buf.extend(self.clone_flags.to_ne_bytes());
        buf
    }
}

fn payload_len(header: &[u8; NLMSG_HDRLEN]) -> std::result::Result<usize, DecodeError> {
    let nlmsg_len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
    let Some(size) = (nlmsg_len as usize).checked_sub(NLMSG_HDRLEN) else {
        return Err(DecodeError::HeaderLength { len: nlmsg_len });
    };
    if size > MAX_PAYLOAD_LEN {
        return Err(DecodeError::PayloadTooLarge { len: size });
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libc_util::socket_pair;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    fn attr(kind: u16, value: &[u8]) -> Vec<u8> {
        let len = NLA_HDRLEN + value.len();
        let mut buf = Vec::new();
        buf.extend((len as u16).to_ne_bytes());
        buf.extend(kind.to_ne_bytes());
        buf.extend(value);
        buf.resize(nla_align(len), 0);
        buf
    }

    fn decode_message(msg: &[u8]) -> Result<NamespaceConfig> {
        let (tx, rx) = socket_pair().unwrap();
        UnixStream::from(tx).write_all(msg).unwrap();
        NamespaceConfig::read_from(rx.as_fd())
    }

    #[test]
    fn flags_survive_encoding() {
        let interesting = [
            0,
            1,
            u32::MAX,
            libc::CLONE_NEWUSER as u32 | libc::CLONE_NEWPID as u32,
            libc::CLONE_NEWCGROUP as u32,
            0x8000_0000,
        ];
        let sweep = (0..=u32::MAX).step_by(104_729);
        for flags in interesting.into_iter().chain(sweep) {
            let msg = NamespaceConfig::new(flags).encode();
            let decoded = NamespaceConfig::decode_payload(&msg[NLMSG_HDRLEN..]).unwrap();
            assert_eq!(decoded.clone_flags, flags);
        }
    }

    #[test]
    fn reads_framed_message_from_fd() {
        let config = NamespaceConfig::default()
            .unshare(Namespace::User)
            .unshare(Namespace::Pid);
        let decoded = decode_message(&config.encode()).unwrap();
        assert_eq!(decoded, config);
        assert!(decoded.namespaces().user);
        assert!(decoded.namespaces().pid);
        assert!(!decoded.namespaces().cgroup);
    }

    #[test]
    fn empty_payload_is_default_config() {
        let mut header = vec![0u8; NLMSG_HDRLEN];
        header[..4].copy_from_slice(&(NLMSG_HDRLEN as u32).to_ne_bytes());
        assert_eq!(decode_message(&header).unwrap(), NamespaceConfig::default());
        assert_eq!(
            NamespaceConfig::decode_payload(&[]).unwrap(),
            NamespaceConfig::default()
        );
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let mut payload = attr(CLONE_FLAGS_ATTR, &0x1234u32.to_ne_bytes());
        payload.extend(attr(27282, &[0, 0, 0, 0]));
        assert_eq!(
            NamespaceConfig::decode_payload(&payload),
            Err(DecodeError::UnknownAttribute { kind: 27282 })
        );
    }

    #[test]
    fn overlong_attribute_is_rejected() {
        let mut payload = attr(CLONE_FLAGS_ATTR, &0u32.to_ne_bytes());
        payload[0..2].copy_from_slice(&64u16.to_ne_bytes());
        assert_eq!(
            NamespaceConfig::decode_payload(&payload),
            Err(DecodeError::AttributeLength { offset: 0, len: 64 })
        );
    }

    #[test]
    fn undersized_attribute_is_rejected() {
        let payload = [2u8, 0, 0, 0];
        let mut payload = payload.to_vec();
        payload[0..2].copy_from_slice(&2u16.to_ne_bytes());
        assert_eq!(
            NamespaceConfig::decode_payload(&payload),
            Err(DecodeError::AttributeLength { offset: 0, len: 2 })
        );
    }

    #[test]
    fn truncated_attribute_header_is_rejected() {
        let mut payload = attr(CLONE_FLAGS_ATTR, &0u32.to_ne_bytes());
        payload.extend([1, 2]);
        assert_eq!(
            NamespaceConfig::decode_payload(&payload),
            Err(DecodeError::TruncatedAttribute {
                offset: 8,
                remaining: 2
            })
        );
    }

    #[test]
    fn flags_must_be_four_bytes() {
        let payload = attr(CLONE_FLAGS_ATTR, &[1, 2]);
        assert_eq!(
            NamespaceConfig::decode_payload(&payload),
            Err(DecodeError::FlagsLength { len: 2 })
        );
    }

    #[test]
    fn short_header_is_fatal() {
        let err = decode_message(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Decode(DecodeError::ShortHeader { len: 3 })
        );
    }

    #[test]
    fn header_smaller_than_itself_is_fatal() {
        let mut header = vec![0u8; NLMSG_HDRLEN];
        header[..4].copy_from_slice(&8u32.to_ne_bytes());
        let err = decode_message(&header).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Decode(DecodeError::HeaderLength { len: 8 }));
    }

    #[test]
    fn huge_payload_is_refused_before_allocating() {
        let mut header = vec![0u8; NLMSG_HDRLEN];
        header[..4].copy_from_slice(&u32::MAX.to_ne_bytes());
        let err = decode_message(&header).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::Decode(DecodeError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn short_payload_is_fatal() {
        let mut msg = NamespaceConfig::new(7).encode();
        msg.truncate(msg.len() - 2);
        let err = decode_message(&msg).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Decode(DecodeError::ShortPayload {
                expected: 8,
                got: 6
            })
        );
    }

    #[test]
    fn cgroup_is_deferred_to_init() {
        let config = NamespaceConfig::default()
            .unshare(Namespace::User)
            .unshare(Namespace::Mount)
            .unshare(Namespace::Cgroup);

        let child = config.child_unshare_flags();
        assert_eq!(child & libc::CLONE_NEWCGROUP, 0);
        assert_eq!(child & libc::CLONE_NEWUSER, 0);
        assert_ne!(child & libc::CLONE_NEWNS, 0);

        assert_eq!(config.init_unshare_flags(), libc::CLONE_NEWCGROUP);
        assert_eq!(NamespaceConfig::default().init_unshare_flags(), 0);
    }

    #[test]
    fn namespace_set_mirrors_flags() {
        let mut config = NamespaceConfig::default();
        for ns in Namespace::ALL {
            assert!(!config.namespaces().contains(ns));
            config = config.unshare(ns);
            assert!(config.namespaces().contains(ns));
            assert!(config.requests(ns));
        }
    }
}
