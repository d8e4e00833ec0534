//! Optional pre-forked worker pool. Listeners are bound by the master
//! before forking; every worker inherits the handles and the kernel
//! arbitrates accepts across them. Unix only.

#![cfg(unix)]

use crate::smtp::SmtpError;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub(crate) enum ForkOutcome {
    Master(Vec<Pid>),
    Worker,
}

/// Forks `count` workers. Must run before any executor threads exist -
/// the server forks right after binding, before spawning tasks.
pub(crate) fn fork_workers(count: usize) -> Result<ForkOutcome, SmtpError> {
    let mut children = Vec::with_capacity(count);
    for _ in 0..count {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => children.push(child),
            Ok(ForkResult::Child) => return Ok(ForkOutcome::Worker),
            Err(e) => return Err(SmtpError::Config(format!("fork failed: {}", e))),
        }
    }
    Ok(ForkOutcome::Master(children))
}

/// Lets a worker notice the master's SIGTERM through a flag it polls
/// between accepts.
pub(crate) fn register_termination(flag: &Arc<AtomicBool>) -> Result<(), SmtpError> {
    signal_hook::flag::register(signal_hook::consts::SIGTERM, flag.clone())
        .map_err(|e| SmtpError::Config(format!("cannot install SIGTERM handler: {}", e)))?;
    Ok(())
}

pub(crate) fn terminate(child: Pid) {
    if let Err(e) = kill(child, Signal::SIGTERM) {
        warn!("could not signal worker {}: {}", child, e);
    }
}

/// Blocks until the child is gone. Run it on a blocking task.
pub(crate) fn join_worker(child: Pid) {
    if let Err(e) = waitpid(child, None) {
        debug!("worker {} already reaped: {}", child, e);
    }
}
