//! Signal handling for the serving process: child reaping, termination and
//! stack-dump diagnostics. Each runs as its own task.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::shutdown::ShutdownService;

const EXIT_CHANNEL_CAPACITY: usize = 256;

/// A reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub pid: i32,
    pub status: i32,
    pub timestamp: SystemTime,
}

/// Reaps every exited child on SIGCHLD and broadcasts what it collected.
pub struct Reaper {
    exits: broadcast::Sender<Exit>,
}

impl Default for Reaper {
    fn default() -> Self {
        let (exits, _) = broadcast::channel(EXIT_CHANNEL_CAPACITY);
        Self { exits }
    }
}

impl Reaper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Exit> {
        self.exits.subscribe()
    }

    /// Collects all children that have exited so far without blocking.
    pub fn reap_exited(&self) -> Vec<Exit> {
        let mut reaped = Vec::new();
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: waitpid only writes to `status`, which outlives the call.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                // 0: children remain but none exited; -1: ECHILD or EINTR
                break;
            }
            let exit = Exit {
                pid,
                status: exit_status(status),
                timestamp: SystemTime::now(),
            };
            trace!(pid = exit.pid, status = exit.status, "Reaped child");
            // No subscribers is fine.
            let _ = self.exits.send(exit);
            reaped.push(exit);
        }
        reaped
    }

    /// Reaps on every SIGCHLD until `shutdown` fires or the signal stream ends.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut sigchld = signal(SignalKind::child())?;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Reaper stopping");
                    return Ok(());
                }
                received = sigchld.recv() => {
                    if received.is_none() {
                        debug!("SIGCHLD stream closed, reaper exiting");
                        return Ok(());
                    }
                    self.reap_exited();
                }
            }
        }
    }
}

/// Exit code for a raw wait status; signal deaths map to `128 + signo`.
pub fn exit_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        status
    }
}

/// Starts shutdown on SIGTERM or SIGINT. Repeated signals are harmless.
pub async fn handle_exit_signals(shutdown: Arc<ShutdownService>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = shutdown.token();

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                shutdown.shutdown();
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                shutdown.shutdown();
            }
            _ = token.cancelled() => return Ok(()),
        }
    }
}

/// Logs a task dump on every SIGUSR1 until `shutdown` fires. Returns the
/// number of dumps written.
pub async fn handle_dump_signals(shutdown: CancellationToken) -> Result<usize> {
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut dumps = 0;
    loop {
        tokio::select! {
            received = sigusr1.recv() => {
                if received.is_none() {
                    return Ok(dumps);
                }
                info!("{}", dump_stacks());
                dumps += 1;
            }
            _ = shutdown.cancelled() => return Ok(dumps),
        }
    }
}

/// Runtime metrics plus the current backtrace, framed for grepping.
pub fn dump_stacks() -> String {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let metrics = handle.metrics();
            format!(
                "workers: {}\nalive tasks: {}\nglobal queue depth: {}",
                metrics.num_workers(),
                metrics.num_alive_tasks(),
                metrics.global_queue_depth()
            )
        }
        Err(_) => {
            warn!("Task dump requested outside the runtime");
            "no runtime".to_string()
        }
    };
    let backtrace = std::backtrace::Backtrace::force_capture();
    format!("=== BEGIN task dump ===\n{runtime}\n{backtrace}\n=== END task dump ===")
}

/// Serializes tests that deliver process-wide signals or reap any child.
#[cfg(test)]
pub(crate) static SIGNAL_TEST_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());
