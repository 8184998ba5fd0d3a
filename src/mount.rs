//! Bind-mount emulation through FUSE helpers, for hosts without native bind mounts.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, ShimError};
use crate::shimenv;

/// FUSE implementation used to run mount helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountBackend {
    #[default]
    Macfuse,
    MacfuseFskit,
    FuseT,
}

impl MountBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountBackend::Macfuse => "macfuse",
            MountBackend::MacfuseFskit => "macfuse-fskit",
            MountBackend::FuseT => "fuse-t",
        }
    }

    /// Backend selected by DARWIN_MOUNT_SYSTEM, `macfuse` when unset.
    pub fn from_env() -> Result<Self> {
        match shimenv::darwin_mount_system() {
            Some(value) => value.parse(),
            None => Ok(MountBackend::default()),
        }
    }
}

impl FromStr for MountBackend {
    type Err = ShimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "macfuse" => Ok(MountBackend::Macfuse),
            "macfuse-fskit" => Ok(MountBackend::MacfuseFskit),
            "fuse-t" => Ok(MountBackend::FuseT),
            other => Err(ShimError::Config(format!("invalid DARWIN_MOUNT_SYSTEM: {other}"))),
        }
    }
}

impl fmt::Display for MountBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

/// A fully resolved helper invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Mount {
    pub fn command(&self, target: &Path, backend: MountBackend) -> MountCommand {
        let program = if self.mount_type == "bind" {
            "bindfs".to_string()
        } else {
            format!("mount_{}", self.mount_type)
        };

        let mut args = Vec::new();
        // bindfs always behaves recursively
        for option in self.options.iter().filter(|o| o.as_str() != "rbind") {
            args.push("-o".to_string());
            args.push(option.clone());
        }

        let is_bindfs = program == "bindfs";
        if is_bindfs && backend == MountBackend::MacfuseFskit {
            args.push("-o".to_string());
            args.push("backend=fskit".to_string());
        }

        args.push(self.source.clone());
        args.push(target.display().to_string());

        let env = if is_bindfs && backend == MountBackend::FuseT {
            vec![
                ("LC_RPATH".to_string(), "/usr/local/lib".to_string()),
                (
                    "fuse_CFLAGS".to_string(),
                    "-I/usr/local/include/fuse -D_FILE_OFFSET_BITS=64 -D_DARWIN_C_SOURCE"
                        .to_string(),
                ),
                ("fuse_LIBS".to_string(), "-L/usr/local/lib -lfuse-t -pthread".to_string()),
            ]
        } else {
            Vec::new()
        };

        MountCommand { program, args, env }
    }

    /// Mounts onto `target` with the backend chosen by the environment.
    pub async fn mount(&self, target: &Path) -> Result<()> {
        let backend = MountBackend::from_env()?;
        let cmd = self.command(target, backend);
        debug!(program = %cmd.program, args = ?cmd.args, backend = %backend, "Mounting");

        let output = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .map_err(|e| ShimError::socket("spawn mount helper", &cmd.program, e))?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(ShimError::Mount {
                command: format!("{} {:?} ({})", cmd.program, cmd.args, output.status),
                output: combined,
            });
        }
        Ok(())
    }
}
