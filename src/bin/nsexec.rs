//! # nsexec
//!
//! Runs the namespace bootstrap over the descriptor named by `_LIBCONTAINER_INITPIPE`, then, in
//! the init process, execs the remaining arguments (if any).
//!
//! Without `_LIBCONTAINER_INITPIPE` this does nothing and exits successfully.

use std::os::unix::process::CommandExt;
use std::process;

use nsexec::{fatal, Bootstrap, Error, IdMap, Namespace};
use tracing::{debug, info};

fn configure_logging() {
    let default_verbosity = tracing_subscriber::filter::LevelFilter::INFO;
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_verbosity.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(tracing_subscriber::fmt::time::Uptime::default())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub fn main() {
    configure_logging();

    let bootstrap = match Bootstrap::from_env() {
        Ok(Some(bootstrap)) => bootstrap,
        Ok(None) => {
            debug!("no init pipe, nothing to do");
            return;
        }
        Err(err) => fatal(err),
    };

    // Map ourselves to root, so stage-1 can assume root if a user namespace is requested.
    let handoff = bootstrap
        .uid_map(IdMap::self_to_inner_uid(0))
        .gid_map(IdMap::self_to_inner_gid(0))
        .process_names(true)
        .enter();

    info!(
        user = handoff.config.requests(Namespace::User),
        pid = handoff.config.requests(Namespace::Pid),
        "init running"
    );

    let mut args = std::env::args_os().skip(1);
    let Some(program) = args.next() else {
        return;
    };

    let err = process::Command::new(&program).args(args).exec();
    fatal(Error::from(err).cause("failed to exec init program"));
}
