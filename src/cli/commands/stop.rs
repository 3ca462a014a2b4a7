//! `autocoder stop`: read the PID file written by `start` and ask that
//! process to shut down gracefully (SIGTERM on Unix; the running process's
//! own `shutdown_requested` handler does the rest).

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::commands::{start::pid_file_path, EXIT_ERROR, EXIT_NOTHING_TO_DO, EXIT_SUCCESS};
use crate::runtime::Runtime;

pub fn run(runtime: &Runtime) -> Result<i32> {
    let path = pid_file_path(runtime);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!("no orchestrator pid file found, nothing to stop");
            return Ok(EXIT_NOTHING_TO_DO);
        }
        Err(err) => return Err(err).context(format!("reading pid file {}", path.display())),
    };

    let pid: i32 = contents
        .trim()
        .parse()
        .with_context(|| format!("pid file {} did not contain a valid pid", path.display()))?;

    match signal_stop(pid) {
        SignalOutcome::Signaled => {
            info!(pid, "signaled orchestrator to stop");
            Ok(EXIT_SUCCESS)
        }
        SignalOutcome::NoSuchProcess => {
            warn!(pid, "orchestrator pid file is stale, removing");
            std::fs::remove_file(&path).ok();
            Ok(EXIT_NOTHING_TO_DO)
        }
        SignalOutcome::Failed => Ok(EXIT_ERROR),
    }
}

enum SignalOutcome {
    Signaled,
    NoSuchProcess,
    Failed,
}

#[cfg(unix)]
fn signal_stop(pid: i32) -> SignalOutcome {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => SignalOutcome::Signaled,
        Err(nix::errno::Errno::ESRCH) => SignalOutcome::NoSuchProcess,
        Err(err) => {
            warn!(pid, error = %err, "failed to signal orchestrator");
            SignalOutcome::Failed
        }
    }
}

#[cfg(not(unix))]
fn signal_stop(_pid: i32) -> SignalOutcome {
    warn!("graceful stop by pid is only implemented on unix targets");
    SignalOutcome::Failed
}
