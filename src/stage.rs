//! The stage state machine.
//!
//! One logical bootstrap runs as three processes. Every process enters [`StageMachine::run`]
//! with the stage it should play; a spawn inside a stage returns [`Spawn::Resumed`] in the new
//! process, which unwinds back to the dispatcher and continues as the stage it was tagged with.
//!
//! ```text
//!  PARENT (original)          CHILD (stage-1)               INIT (stage-2)
//!  spawn(CHILD) ------------> unshare(user)
//!                    <------- USERMAP_PLS
//!  write id maps
//!  USERMAP_ACK -------------> setresuid/setresgid(0)
//!                             unshare(rest but cgroup)
//!                             spawn(INIT) ----------------> (waits)
//!                    <------- RECVPID_PLS + pid
//!  RECVPID_ACK ------------->
//!                    <------- CHILD_FINISH, exit
//!  GRANDCHILD ---------------------------------------------> unshare(cgroup)
//!                    <------------------------------------- CHILD_FINISH
//!  write pid report, exit                                    return to caller
//! ```

use c_str_macro::c_str;
use serde::{Deserialize, Serialize};
use std::ffi::CStr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use tracing::{debug, info, span, Level};

use crate::config::{Namespace, NamespaceConfig};
use crate::error::{bail, Error, ErrorKind, Result};
use crate::id_map::IdMaps;
use crate::libc_util::{become_root, set_process_name, unshare, write_once};
use crate::spawn::{spawn, Spawn};
use crate::sync::{Channel, SyncMsg, SyncPair};

/// The role a process plays in the bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Decoding and channel creation in the original process. Never resumed to.
    Setup,
    /// The original process once the bootstrap has started.
    Parent,
    /// The first descendant, which enters the namespaces.
    Child,
    /// The second descendant, which is left running inside every namespace.
    Init,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Parent => "stage-0",
            Stage::Child => "stage-1",
            Stage::Init => "stage-2",
        }
    }

    fn process_name(self) -> Option<&'static CStr> {
        match self {
            Stage::Setup => None,
            Stage::Parent => Some(c_str!("nsx:[0:PARENT]")),
            Stage::Child => Some(c_str!("nsx:[1:CHILD]")),
            Stage::Init => Some(c_str!("nsx:[2:INIT]")),
        }
    }
}

/// The terminal output of the parent stage, written to the init pipe as one JSON line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidReport {
    pub stage1_pid: libc::pid_t,
    pub stage2_pid: libc::pid_t,
}

impl PidReport {
    pub fn to_json_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|_| Error::new(ErrorKind::Io).cause("failed to serialize pid report"))?;
        line.push('\n');
        Ok(line)
    }

    fn write_to(&self, fd: BorrowedFd<'_>) -> Result<()> {
        let line = self.to_json_line()?;
        write_once(fd.as_raw_fd(), line.as_bytes())
            .map_err(|e| e.context("failed to sync with caller: write(pid-JSON)"))
    }
}

/// What the init process is handed once every namespace is in place.
#[derive(Debug)]
pub struct InitHandoff {
    pub config: NamespaceConfig,
    /// The caller's descriptor, still open for whatever protocol follows.
    pub init_pipe: OwnedFd,
}

/// How a bootstrap finished, for the process that observes it.
#[derive(Debug)]
pub enum Completed {
    /// The original process: both descendants were spawned and reported.
    Parent(PidReport),
    /// The first descendant: its work is done and it should exit.
    Child { stage2_pid: libc::pid_t },
    /// The second descendant: continue with the caller's own logic.
    Init(InitHandoff),
}

enum Step {
    Enter(Stage),
    Finished(Outcome),
}

enum Outcome {
    Parent(PidReport),
    Child { stage2_pid: libc::pid_t },
    Init,
}

/// Options for the stages, fixed before anything is spawned.
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    pub id_maps: IdMaps,
    pub process_names: bool,
}

/// Per-process bootstrap state. Each process owns its own copy after a spawn.
#[derive(Debug)]
pub struct StageMachine {
    config: NamespaceConfig,
    options: StageOptions,
    init_pipe: OwnedFd,
    child_sync: SyncPair,
    init_sync: SyncPair,
}

impl StageMachine {
    /// The setup stage: tell the caller we are alive, decode the configuration, and create both
    /// sync sockets.
    pub fn setup(init_pipe: OwnedFd, options: StageOptions) -> Result<StageMachine> {
        let span = span!(Level::DEBUG, "setup");
        let _span_guard = span.enter();

        write_once(init_pipe.as_raw_fd(), &[0])
            .map_err(|e| e.context("could not inform the parent we are past initial setup"))?;

        let config = NamespaceConfig::read_from(init_pipe.as_fd())?;
        debug!(clone_flags = format_args!("{:#x}", config.clone_flags), "decoded config");

        let child_sync = SyncPair::new()
            .map_err(|e| e.context("failed to setup sync pipe between parent and child"))?;
        let init_sync = SyncPair::new()
            .map_err(|e| e.context("failed to setup sync pipe between parent and grandchild"))?;

        Ok(StageMachine {
            config,
            options,
            init_pipe,
            child_sync,
            init_sync,
        })
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Run stages starting from the parent, until this process' stage is finished.
    pub fn run(mut self) -> Result<Completed> {
        let mut stage = Stage::Parent;
        loop {
            let span = span!(Level::INFO, "stage", name = stage.name());
            let _span_guard = span.enter();

            if self.options.process_names {
                if let Some(name) = stage.process_name() {
                    set_process_name(name)?;
                }
            }

            let step = match stage {
                Stage::Setup => bail!(ErrorKind::Protocol, "setup is never resumed to"),
                Stage::Parent => self.parent()?,
                Stage::Child => self.child()?,
                Stage::Init => self.init()?,
            };

            match step {
                Step::Enter(next) => stage = next,
                Step::Finished(outcome) => return Ok(self.complete(outcome)),
            }
        }
    }

    fn complete(self, outcome: Outcome) -> Completed {
        match outcome {
            Outcome::Parent(report) => Completed::Parent(report),
            Outcome::Child { stage2_pid } => Completed::Child { stage2_pid },
            Outcome::Init => Completed::Init(InitHandoff {
                config: self.config,
                init_pipe: self.init_pipe,
            }),
        }
    }

    /// Endpoints for the parent, once stage-1 exists: its own end of both pairs. The stage-2 end
    /// only had to survive until stage-1 inherited it.
    fn parent_ends(&mut self) -> Result<(Channel, Channel)> {
        let child = self.child_sync.parent_end()?;
        let init = self.init_sync.parent_end()?;
        Ok((child, init))
    }

    /// Endpoints for stage-1: its end toward the parent. The stage-2 end stays open until
    /// stage-2 has been spawned.
    fn child_ends(&mut self) -> Result<Channel> {
        let parent = self.child_sync.child_end()?;
        self.init_sync.close_parent();
        Ok(parent)
    }

    fn init_ends(&mut self) -> Result<Channel> {
        let parent = self.init_sync.child_end()?;
        self.child_sync.close();
        Ok(parent)
    }

    fn parent(&mut self) -> Result<Step> {
        let spawned = spawn(Stage::Child).map_err(|e| e.context("unable to spawn stage-1"))?;
        let stage1_pid = match spawned {
            Spawn::Created(pid) => pid,
            Spawn::Resumed(stage) => return Ok(Step::Enter(stage)),
        };
        info!(stage1_pid, "spawned stage-1");

        let (child, init) = self.parent_ends()?;

        let stage2_pid = sync_with_child(&child, &self.config, stage1_pid, &self.options.id_maps)
            .map_err(|e| e.context("failed to sync with stage-1"))?;
        drop(child);

        sync_with_init(&init).map_err(|e| e.context("failed to sync with stage-2"))?;
        drop(init);

        let report = PidReport {
            stage1_pid,
            stage2_pid,
        };
        debug!(stage1_pid, stage2_pid, "forward stage-1 and stage-2 pids to caller");
        report.write_to(self.init_pipe.as_fd())?;

        Ok(Step::Finished(Outcome::Parent(report)))
    }

    fn child(&mut self) -> Result<Step> {
        let parent = self.child_ends()?;

        if self.config.requests(Namespace::User) {
            unshare(Namespace::User.clone_flag() as libc::c_int)
                .map_err(|e| e.context("failed to unshare user namespace"))?;
            request_id_mapping(&parent).map_err(|e| e.context("failed to sync with parent"))?;
            become_root().map_err(|e| e.context("failed to become root in user namespace"))?;
        }

        let flags = self.config.child_unshare_flags();
        if flags != 0 {
            debug!(
                flags = format_args!("{flags:#x}"),
                "unshare remaining namespaces (except cgroupns)"
            );
            unshare(flags).map_err(|e| {
                e.context("failed to unshare remaining namespaces (except cgroupns)")
            })?;
        }

        let spawned = spawn(Stage::Init).map_err(|e| e.context("unable to spawn stage-2"))?;
        let stage2_pid = match spawned {
            Spawn::Created(pid) => pid,
            Spawn::Resumed(stage) => return Ok(Step::Enter(stage)),
        };
        self.init_sync.close();

        debug!(stage2_pid, "request stage-0 to forward stage-2 pid");
        forward_pid(&parent, stage2_pid).map_err(|e| e.context("failed to sync with parent"))?;

        debug!("signal completion to stage-0");
        parent
            .send(SyncMsg::ChildFinish)
            .map_err(|e| e.context("failed to sync with parent: write(SYNC_CHILD_FINISH)"))?;

        Ok(Step::Finished(Outcome::Child { stage2_pid }))
    }

    fn init(&mut self) -> Result<Step> {
        let parent = self.init_ends()?;

        parent
            .expect(SyncMsg::Grandchild)
            .map_err(|e| e.context("failed to sync with parent: read(SYNC_GRANDCHILD)"))?;

        let flags = self.config.init_unshare_flags();
        if flags != 0 {
            debug!("unshare cgroup namespace");
            unshare(flags).map_err(|e| e.context("failed to unshare cgroup namespace"))?;
        }

        debug!("signal completion to stage-0");
        parent
            .send(SyncMsg::ChildFinish)
            .map_err(|e| e.context("failed to sync with parent: write(SYNC_CHILD_FINISH)"))?;

        Ok(Step::Finished(Outcome::Init))
    }
}

/// The parent's side of the stage-1 handshake. Returns the pid stage-1 forwards for stage-2.
///
/// The tags must arrive in exactly this order: `USERMAP_PLS` (only with a user namespace),
/// `RECVPID_PLS` with its pid, then `CHILD_FINISH`.
pub fn sync_with_child(
    chan: &Channel,
    config: &NamespaceConfig,
    stage1_pid: libc::pid_t,
    id_maps: &IdMaps,
) -> Result<libc::pid_t> {
    let mut expected = if config.requests(Namespace::User) {
        SyncMsg::UsermapPls
    } else {
        SyncMsg::RecvpidPls
    };
    let mut stage2_pid = None;

    loop {
        chan.expect(expected)?;

        match expected {
            SyncMsg::UsermapPls => {
                debug!("stage-1 requested userns mappings");
                id_maps.apply(stage1_pid)?;
                chan.send(SyncMsg::UsermapAck)?;
                expected = SyncMsg::RecvpidPls;
            }
            SyncMsg::RecvpidPls => {
                debug!("stage-1 requested pid to be forwarded");
                let pid = chan.recv_pid()?;
                chan.send(SyncMsg::RecvpidAck)?;
                stage2_pid = Some(pid);
                expected = SyncMsg::ChildFinish;
            }
            _ => break,
        }
    }

    debug!("stage-1 complete");
    stage2_pid.ok_or_else(|| Error::new(ErrorKind::Protocol).cause("stage-1 never sent a pid"))
}

/// The parent's side of the stage-2 handshake.
pub fn sync_with_init(chan: &Channel) -> Result<()> {
    debug!("signalling stage-2 to run");
    chan.send(SyncMsg::Grandchild)?;
    chan.expect(SyncMsg::ChildFinish)?;
    debug!("stage-2 complete");
    Ok(())
}

/// Ask the parent to write our id maps, and wait until it has.
pub fn request_id_mapping(parent: &Channel) -> Result<()> {
    debug!("request stage-0 to map user namespace");
    parent.send(SyncMsg::UsermapPls)?;
    parent.expect(SyncMsg::UsermapAck)
}

/// Tell the parent the pid of stage-2, and wait until it has it.
pub fn forward_pid(parent: &Channel, pid: libc::pid_t) -> Result<()> {
    parent.send(SyncMsg::RecvpidPls)?;
    parent.send_pid(pid)?;
    parent.expect(SyncMsg::RecvpidAck)
}
