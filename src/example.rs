//! A minimal [`Manager`] used by the bundled binary: one shim process per
//! container, located through its computed socket address.

use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::SystemTime;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::args::Invocation;
use crate::manager::{BootstrapParams, Manager, Protocol, RuntimeInfo, StartOpts, StopStatus};
use crate::socket;
use crate::sys;

/// Exit status reported for a shim torn down by delete (128 + SIGKILL).
pub const KILLED_EXIT_STATUS: u32 = 137;

#[derive(Debug, Clone)]
pub struct ExampleManager {
    name: String,
}

impl ExampleManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Re-executes this binary as the serving shim, handing it `listener` as fd 3.
    fn spawn_shim(
        &self,
        invocation: &Invocation,
        id: &str,
        opts: &StartOpts,
        listener: &std::os::unix::net::UnixListener,
    ) -> anyhow::Result<std::process::Child> {
        let exe = std::env::current_exe().context("resolving shim executable")?;
        let mut cmd = Command::new(exe);
        cmd.args(["-namespace", &invocation.namespace, "-id", id, "-address", &opts.address])
            .current_dir(&invocation.bundle)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        if opts.debug {
            cmd.arg("-debug");
        }

        let fd = listener.as_raw_fd();
        // SAFETY: only async-signal-safe calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                let ret = if fd == sys::INHERITED_LISTENER_FD {
                    libc::fcntl(fd, libc::F_SETFD, 0)
                } else {
                    libc::dup2(fd, sys::INHERITED_LISTENER_FD)
                };
                if ret < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn().context("spawning shim")
    }
}

#[async_trait]
impl Manager for ExampleManager {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &self,
        invocation: &Invocation,
        id: &str,
        opts: StartOpts,
    ) -> anyhow::Result<BootstrapParams> {
        let root = socket::socket_root(&opts.address);
        let address = socket::compute_address(&root, &invocation.namespace, id, false);
        let address_file = invocation.bundle.join(sys::ADDRESS_FILE);

        if socket::can_connect(&address).await {
            info!(address = %address, "Reusing running shim");
            sys::write_address(&address_file, &address)?;
            return Ok(BootstrapParams::new(address, Protocol::Ttrpc));
        }

        let listener = socket::listen(&address)?;
        let mut child = self.spawn_shim(invocation, id, &opts, &listener)?;
        drop(listener);
        debug!(pid = child.id(), address = %address, "Shim spawned");

        if let Err(e) = sys::write_address(&address_file, &address) {
            let _ = child.kill();
            let _ = child.wait();
            let _ = socket::remove(&address);
            return Err(e.into());
        }

        if let Err(e) = sys::adjust_oom_score(child.id()) {
            warn!("Failed to adjust OOM score for shim {}: {}", child.id(), e);
        }

        Ok(BootstrapParams::new(address, Protocol::Ttrpc))
    }

    async fn stop(&self, invocation: &Invocation, _id: &str) -> anyhow::Result<StopStatus> {
        match sys::read_address(&invocation.address_file()) {
            Ok(address) => match socket::remove(&address) {
                Ok(()) => debug!(address = %address, "Removed shim socket"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e).context("removing shim socket"),
            },
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        Ok(StopStatus {
            pid: 0,
            exit_status: KILLED_EXIT_STATUS,
            exited_at: SystemTime::now(),
        })
    }

    async fn info(&self, _invocation: &Invocation, options: &[u8]) -> anyhow::Result<RuntimeInfo> {
        Ok(RuntimeInfo {
            name: self.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            options: options.to_vec(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shimenv::ShimEnv;
    use std::path::Path;

    fn invocation(bundle: &Path, engine: &Path) -> Invocation {
        let args: Vec<String> = vec![
            "-namespace".into(),
            "default".into(),
            "-id".into(),
            "abc".into(),
            "-bundle".into(),
            bundle.display().to_string(),
            "-address".into(),
            engine.display().to_string(),
            "start".into(),
        ];
        Invocation::parse(&args, ShimEnv::default()).unwrap()
    }

    #[tokio::test]
    async fn test_start_reuses_running_shim() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), &dir.path().join("engine.sock"));
        let address = inv.computed_address(false);
        let _running = socket::listen(&address).unwrap();

        let manager = ExampleManager::new("io.shim.example.v1");
        let params = manager.start(&inv, "abc", inv.start_opts()).await.unwrap();
        assert_eq!(params, BootstrapParams::new(address.clone(), Protocol::Ttrpc));
        assert_eq!(sys::read_address(&inv.address_file()).unwrap(), address);
    }

    #[tokio::test]
    async fn test_stop_removes_recorded_socket() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), &dir.path().join("engine.sock"));
        let address = inv.computed_address(false);
        let listener = socket::listen(&address).unwrap();
        drop(listener);
        sys::write_address(&inv.address_file(), &address).unwrap();

        let manager = ExampleManager::new("io.shim.example.v1");
        let status = manager.stop(&inv, "abc").await.unwrap();
        assert_eq!(status.exit_status, KILLED_EXIT_STATUS);
        assert!(!socket::can_connect(&address).await);
        assert!(!Path::new(address.trim_start_matches("unix://")).exists());

        // nothing recorded is not an error
        let empty = tempfile::tempdir().unwrap();
        let inv = invocation(empty.path(), &empty.path().join("engine.sock"));
        manager.stop(&inv, "abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_info_echoes_options() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), &dir.path().join("engine.sock"));
        let info = ExampleManager::new("io.shim.example.v1")
            .info(&inv, b"\x01\x02")
            .await
            .unwrap();
        assert_eq!(info.name, "io.shim.example.v1");
        assert_eq!(info.options, vec![1, 2]);
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }
}
