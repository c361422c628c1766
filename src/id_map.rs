use std::fmt::Write;

use crate::error::{Error, Result};

/// A uid or gid mapping table for a user namespace, in the format of `/proc/PID/uid_map`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdMap {
    mappings: Vec<Mapping>,
}

/// Map the range of IDs `[outer_id, outer_id + qty) --> [inner_id, inner_id + qty)`
#[derive(Clone, Debug, Copy, Eq, PartialEq)]
struct Mapping {
    inner_id: u32,
    outer_id: u32,
    qty: u32,
}

impl IdMap {
    pub fn new() -> IdMap {
        IdMap {
            mappings: Vec::new(),
        }
    }

    /// Create a mapping from the current UID to an inner UID.
    pub fn self_to_inner_uid(inner_uid: u32) -> IdMap {
        let uid = unsafe { libc::getuid() };
        let mut map = Self::new();
        map.map_one(uid, inner_uid);
        map
    }

    /// Create a mapping from the current GID to an inner GID.
    pub fn self_to_inner_gid(inner_gid: u32) -> IdMap {
        let gid = unsafe { libc::getgid() };
        let mut map = Self::new();
        map.map_one(gid, inner_gid);
        map
    }

    pub fn map_one(&mut self, outer_id: u32, inner_id: u32) -> &mut IdMap {
        self.map_many(outer_id, inner_id, 1)
    }

    pub fn map_many(&mut self, outer_id: u32, inner_id: u32, qty: u32) -> &mut IdMap {
        if qty > 0 {
            self.mappings.push(Mapping {
                inner_id,
                outer_id,
                qty,
            });
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Format the [`IdMap`] in the style of a `/proc/PID/uid_map` or `/proc/PID/gid_map` file.
    pub fn to_file_contents(&self) -> String {
        let mut contents = String::new();
        for m in &self.mappings {
            let _ = writeln!(contents, "{} {} {}", m.inner_id, m.outer_id, m.qty);
        }
        contents
    }
}

/// The maps the parent writes when a descendant enters a new user namespace.
#[derive(Clone, Debug, Default)]
pub struct IdMaps {
    pub uid_map: Option<IdMap>,
    pub gid_map: Option<IdMap>,
}

impl IdMaps {
    /// Write the configured maps for `pid`. The gid map is preceded by denying `setgroups(2)`,
    /// which the kernel requires before an unprivileged writer may set it.
    pub fn apply(&self, pid: libc::pid_t) -> Result<()> {
        if let Some(uid_map) = &self.uid_map {
            tracing::debug!(pid, "writing uid_map");
            std::fs::write(format!("/proc/{pid}/uid_map"), uid_map.to_file_contents())
                .map_err(Error::from)
                .map_err(|e| e.cause("failed to write uid_map"))?;
        }

        if let Some(gid_map) = &self.gid_map {
            tracing::debug!(pid, "writing gid_map");
            std::fs::write(format!("/proc/{pid}/setgroups"), "deny\n")
                .map_err(Error::from)
                .map_err(|e| e.cause("failed to disable setgroups"))?;
            std::fs::write(format!("/proc/{pid}/gid_map"), gid_map.to_file_contents())
                .map_err(Error::from)
                .map_err(|e| e.cause("failed to write gid_map"))?;
        }

        Ok(())
    }
}
