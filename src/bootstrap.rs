use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::process;

use tracing::subscriber::NoSubscriber;
use tracing::{debug, error, info};

use crate::error::{bail, Error, ErrorKind, Result};
use crate::stage::{Completed, InitHandoff, StageMachine, StageOptions};
use crate::IdMap;

/// Environment variable naming the caller's descriptor.
pub const INIT_PIPE_ENV: &str = "_LIBCONTAINER_INITPIPE";

/// A bootstrap which has not started yet.
///
/// Running it turns the calling process into the parent of a two-stage descendant chain. It must
/// be run while the process is single-threaded: descendants are created with fork semantics and
/// only inherit the calling thread.
#[derive(Debug)]
pub struct Bootstrap {
    init_pipe: OwnedFd,
    options: StageOptions,
}

impl Bootstrap {
    /// Bootstrap over `init_pipe`, which carries the configuration in and the pid report out.
    pub fn new(init_pipe: impl Into<OwnedFd>) -> Bootstrap {
        Bootstrap {
            init_pipe: init_pipe.into(),
            options: StageOptions::default(),
        }
    }

    /// Adopt the descriptor named by [`INIT_PIPE_ENV`].
    ///
    /// Returns `None` when the variable is unset or empty, meaning the process was not started
    /// as a bootstrap.
    pub fn from_env() -> Result<Option<Bootstrap>> {
        let Some(value) = std::env::var_os(INIT_PIPE_ENV) else {
            return Ok(None);
        };
        if value.is_empty() {
            return Ok(None);
        }

        let Some(fd) = value.to_str().and_then(|v| v.parse::<RawFd>().ok()) else {
            bail!(ErrorKind::Config, "unable to parse _LIBCONTAINER_INITPIPE");
        };
        if fd < 0 {
            bail!(ErrorKind::Config, "bad value for _LIBCONTAINER_INITPIPE");
        }

        // Make sure the descriptor is actually open before taking ownership of it.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
            return Err(Error::last_os_error()
                .kind(ErrorKind::Config)
                .cause("_LIBCONTAINER_INITPIPE is not an open descriptor"));
        }

        debug!(fd, "adopting init pipe");
        Ok(Some(Bootstrap::new(unsafe { OwnedFd::from_raw_fd(fd) })))
    }

    /// Write this uid map for stage-1 when it enters a new user namespace.
    pub fn uid_map(mut self, map: IdMap) -> Bootstrap {
        self.options.id_maps.uid_map = Some(map);
        self
    }

    /// Write this gid map for stage-1 when it enters a new user namespace.
    pub fn gid_map(mut self, map: IdMap) -> Bootstrap {
        self.options.id_maps.gid_map = Some(map);
        self
    }

    /// Rename each stage's process so the tree is readable in `ps`.
    pub fn process_names(mut self, enabled: bool) -> Bootstrap {
        self.options.process_names = enabled;
        self
    }

    /// Run the bootstrap and report how it finished in this process.
    ///
    /// This returns in all three processes; nothing exits here. Use [`Bootstrap::enter`] to get
    /// the exit policy as well.
    pub fn run(self) -> Result<Completed> {
        StageMachine::setup(self.init_pipe, self.options)?.run()
    }

    /// Run the bootstrap, returning only in the init process.
    ///
    /// The parent and stage-1 exit with status 0 once their part is done. Any error in any
    /// process is logged, printed to stderr, and exits that process with status 1.
    pub fn enter(self) -> InitHandoff {
        match self.run() {
            Ok(Completed::Init(handoff)) => {
                info!("namespace setup complete, handing off");
                handoff
            }
            Ok(Completed::Parent(report)) => {
                info!(report.stage1_pid, report.stage2_pid, "bootstrap complete");
                process::exit(0)
            }
            Ok(Completed::Child { stage2_pid }) => {
                debug!(stage2_pid, "stage-1 complete");
                process::exit(0)
            }
            Err(err) => fatal(err),
        }
    }
}

/// Report `err` and terminate the current process.
pub fn fatal(err: Error) -> ! {
    report_fatal(&err, &mut std::io::stderr());
    process::exit(1)
}

/// Emit exactly one line for a fatal error: through the installed subscriber if there is one,
/// otherwise straight to `out`.
fn report_fatal(err: &Error, out: &mut impl Write) {
    let logging = tracing::dispatcher::get_default(|dispatch| !dispatch.is::<NoSubscriber>());
    if logging {
        error!("FATAL: {err}");
    } else {
        let _ = writeln!(out, "FATAL: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Namespace, NamespaceConfig};
    use crate::libc_util::socket_pair;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    // Environment variables are process-global, so keep every case in one test.
    #[test]
    fn init_pipe_from_env() {
        std::env::remove_var(INIT_PIPE_ENV);
        assert!(Bootstrap::from_env().unwrap().is_none());

        std::env::set_var(INIT_PIPE_ENV, "");
        assert!(Bootstrap::from_env().unwrap().is_none());

        std::env::set_var(INIT_PIPE_ENV, "three");
        assert_eq!(Bootstrap::from_env().unwrap_err().kind, ErrorKind::Config);

        std::env::set_var(INIT_PIPE_ENV, "-4");
        assert_eq!(Bootstrap::from_env().unwrap_err().kind, ErrorKind::Config);

        std::env::set_var(INIT_PIPE_ENV, "987654");
        let err = Bootstrap::from_env().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert_eq!(err.errno, libc::EBADF);

        std::env::remove_var(INIT_PIPE_ENV);
    }

    #[test]
    fn fatal_errors_are_one_line_on_stderr_without_a_subscriber() {
        let err = Error::new(ErrorKind::Identity).cause("setresuid(0, 0, 0) failed");
        let mut out = Vec::new();
        report_fatal(&err, &mut out);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "FATAL: setresuid(0, 0, 0) failed: identity error\n"
        );
    }

    #[test]
    fn fatal_errors_go_only_to_the_subscriber_when_one_is_installed() {
        let err = Error::new(ErrorKind::Identity).cause("setresuid(0, 0, 0) failed");
        let subscriber = tracing_subscriber::fmt()
            .with_writer(std::io::sink)
            .finish();
        let mut out = Vec::new();
        tracing::subscriber::with_default(subscriber, || report_fatal(&err, &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn setup_acknowledges_then_decodes() {
        let (caller, pipe) = socket_pair().unwrap();
        let mut caller = UnixStream::from(caller);
        let config = NamespaceConfig::default().unshare(Namespace::Uts);
        caller.write_all(&config.encode()).unwrap();

        let machine = StageMachine::setup(pipe, StageOptions::default()).unwrap();
        assert_eq!(machine.config(), &config);

        let mut byte = [0xffu8];
        caller.read_exact(&mut byte).unwrap();
        assert_eq!(byte, [0]);
    }

    #[test]
    fn setup_rejects_bad_config_before_spawning() {
        let (caller, pipe) = socket_pair().unwrap();
        let mut caller = UnixStream::from(caller);
        let mut msg = NamespaceConfig::default().encode();
        // Corrupt the attribute type.
        msg[18] ^= 0xff;
        caller.write_all(&msg).unwrap();

        let err = Bootstrap::new(pipe).run().unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::Decode(crate::config::DecodeError::UnknownAttribute { .. })
        ));
    }
}
