//! Multi-stage namespace bootstrap for a container's initial process tree.
//!
//! A [`Bootstrap`] reads a namespace configuration from a caller-supplied descriptor, then splits
//! into three processes: the original parent, a first descendant which enters the requested
//! namespaces, and an init process which is left running inside all of them. The parent reports
//! both descendant pids back over the descriptor; the init process returns to the caller.

mod libc_util;

mod bootstrap;
pub mod config;
mod error;
mod id_map;
pub mod spawn;
pub mod stage;
pub mod sync;

pub use bootstrap::{fatal, Bootstrap, INIT_PIPE_ENV};
pub use config::{DecodeError, Namespace, NamespaceConfig, NamespaceSet};
pub use error::{Error, ErrorKind, Result};
pub use id_map::{IdMap, IdMaps};
pub use stage::{Completed, InitHandoff, PidReport, Stage};

/// In test builds, use alloc_counter to verify at runtime that the functions which run right
/// after a clone do not allocate.
#[cfg(debug_assertions)]
#[global_allocator]
static ALLOC: alloc_counter::AllocCounterSystem = alloc_counter::AllocCounterSystem;
