use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::error::{Result, ShimError};
use crate::manager::StartOpts;
use crate::shimenv::ShimEnv;
use crate::socket;

/// Flags passed by the container engine.
///
/// The engine spells long flags with a single dash (`-namespace x`); see
/// [`normalize_args`].
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(name = "shim")]
#[command(disable_version_flag = true)]
#[command(about = "Per-container supervisor hosting the task RPC endpoint", long_about = None)]
pub struct ShimFlags {
    /// Enable debug output in logs
    #[arg(long)]
    pub debug: bool,

    /// Show the shim version and exit
    #[arg(long = "v")]
    pub version: bool,

    /// Read runtime options from stdin, print runtime info to stdout, and exit
    #[arg(long)]
    pub info: bool,

    /// Namespace that owns the shim
    #[arg(long, default_value = "")]
    pub namespace: String,

    /// Id of the task
    #[arg(long, default_value = "")]
    pub id: String,

    /// Socket path to serve
    #[arg(long, default_value = "")]
    pub socket: String,

    /// Debug socket path to serve
    #[arg(long = "debug-socket", default_value = "")]
    pub debug_socket: String,

    /// Path to the bundle if not the working directory
    #[arg(long, default_value = "")]
    pub bundle: String,

    /// Engine address, used to root computed socket addresses
    #[arg(long, default_value = "")]
    pub address: String,

    /// Ignored; events are published to TTRPC_ADDRESS
    #[arg(long = "publish-binary", default_value = "")]
    pub publish_binary: String,

    /// Action to run; serves when omitted
    #[arg(value_enum)]
    pub action: Option<CliAction>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliAction {
    Start,
    Delete,
}

/// Flags that take a value in the following argument.
const VALUE_FLAGS: &[&str] = &[
    "namespace",
    "id",
    "socket",
    "debug-socket",
    "bundle",
    "address",
    "publish-binary",
];

/// Rewrites single-dash long flags (`-namespace`) to `--namespace`.
///
/// Values of value-taking flags are left untouched, as is everything after `--`.
pub fn normalize_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out = Vec::new();
    let mut expect_value = false;
    let mut passthrough = false;

    for arg in args.into_iter().map(Into::into) {
        if passthrough || expect_value {
            expect_value = false;
            out.push(arg);
            continue;
        }
        if arg == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }

        let name = match arg.strip_prefix("--") {
            Some(rest) => Some(rest.to_string()),
            None => arg.strip_prefix('-').filter(|r| !r.is_empty()).map(str::to_string),
        };
        match name {
            Some(name) => {
                let (flag, inline_value) = match name.split_once('=') {
                    Some((flag, _)) => (flag.to_string(), true),
                    None => (name.clone(), false),
                };
                expect_value = !inline_value && VALUE_FLAGS.contains(&flag.as_str());
                out.push(format!("--{name}"));
            }
            None => out.push(arg),
        }
    }
    out
}

/// What this process was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Version,
    Info,
    Start,
    Delete,
    Serve,
}

/// Flags and environment folded once per process; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub action: Action,
    pub debug: bool,
    pub namespace: String,
    pub id: String,
    pub socket: String,
    pub debug_socket: String,
    pub bundle: PathBuf,
    pub address: String,
    pub publish_binary: String,
    pub env: ShimEnv,
}

impl Invocation {
    /// Parses `args` (without the program name).
    pub fn parse(args: &[String], env: ShimEnv) -> Result<Self> {
        let argv = std::iter::once("shim".to_string()).chain(normalize_args(args.iter().cloned()));
        let flags = ShimFlags::try_parse_from(argv).map_err(|e| ShimError::Config(e.to_string()))?;
        Ok(Self::from_flags(flags, env))
    }

    pub fn from_flags(flags: ShimFlags, env: ShimEnv) -> Self {
        let action = if flags.version {
            Action::Version
        } else if flags.info {
            Action::Info
        } else {
            match flags.action {
                Some(CliAction::Start) => Action::Start,
                Some(CliAction::Delete) => Action::Delete,
                None => Action::Serve,
            }
        };

        let namespace = if flags.namespace.is_empty() {
            env.namespace.clone().unwrap_or_default()
        } else {
            flags.namespace
        };

        let bundle = if flags.bundle.is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(flags.bundle)
        };

        Self {
            action,
            debug: flags.debug,
            namespace,
            id: flags.id,
            socket: flags.socket,
            debug_socket: flags.debug_socket,
            bundle,
            address: flags.address,
            publish_binary: flags.publish_binary,
            env,
        }
    }

    pub fn require_namespace(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(ShimError::Config("shim namespace cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Computed address of this shim's primary or debug socket.
    pub fn computed_address(&self, debug: bool) -> String {
        let root = socket::socket_root(&self.address);
        socket::compute_address(&root, &self.namespace, &self.id, debug)
    }

    /// `--socket` when given, otherwise the computed primary address.
    pub fn primary_address(&self) -> String {
        if self.socket.is_empty() {
            self.computed_address(false)
        } else {
            format!("unix://{}", self.socket)
        }
    }

    /// `--debug-socket` when given, otherwise the computed debug address.
    pub fn debug_address(&self) -> String {
        if self.debug_socket.is_empty() {
            self.computed_address(true)
        } else {
            format!("unix://{}", self.debug_socket)
        }
    }

    pub fn address_file(&self) -> PathBuf {
        self.bundle.join(crate::sys::ADDRESS_FILE)
    }

    pub fn start_opts(&self) -> StartOpts {
        StartOpts {
            address: self.address.clone(),
            ttrpc_address: self.env.ttrpc_address.clone(),
            debug: self.debug,
        }
    }
}
