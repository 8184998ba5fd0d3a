//! Entry point of a shim binary: parses the invocation, runs exactly one
//! action and, for the serving action, owns shutdown and socket cleanup.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::args::{Action, Invocation};
use crate::builtin;
use crate::config::{BinaryOpt, Config};
use crate::error::{Result, ShimError};
use crate::logging;
use crate::manager::{DeleteResponse, Manager, SHIM_VERSION};
use crate::plugin::{self, PluginProperties, Registry};
use crate::reaper::{self, Reaper};
use crate::rpc::protocol;
use crate::rpc::{chain_unary_interceptors, RpcServer};
use crate::shimenv::ShimEnv;
use crate::shutdown::ShutdownService;
use crate::socket;
use crate::sys;
use crate::tuning;

/// How long shutdown consumers get to finish once serving has stopped.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runs a shim binary to completion.
///
/// Errors are logged and reported through the configured exit callback with
/// code 1; success returns normally.
pub fn run<M>(manager: M, registry: Registry, opts: impl IntoIterator<Item = BinaryOpt>)
where
    M: Manager + 'static,
{
    let mut config = Config::from_opts(opts);
    let exit = std::mem::replace(&mut config.exit_func, Box::new(|_| {}));

    let invocation = match Invocation::parse(&config.args, ShimEnv::load()) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("shim: {}: {e}", manager.name());
            exit(1);
            return;
        }
    };

    if !config.no_setup_logger {
        let writer = if invocation.action == Action::Serve {
            logging::bundle_writer(&invocation.bundle)
        } else {
            BoxMakeWriter::new(std::io::stderr)
        };
        logging::init(invocation.debug, writer);
    }

    let runtime = match tuning::build_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("shim: {}: building runtime: {}", manager.name(), e);
            exit(1);
            return;
        }
    };

    let span = tracing::info_span!("shim", runtime = %manager.name());
    let action = execute(&manager, registry, &mut config, &invocation);
    let result = runtime.block_on(action.instrument(span));
    // Blocking stdio reads must not hold the process open.
    runtime.shutdown_timeout(Duration::from_secs(1));

    if let Err(e) = result {
        error!("shim: {}: {}", manager.name(), e);
        exit(1);
    }
}

/// Runs the action selected by `invocation`.
pub async fn execute(
    manager: &dyn Manager,
    registry: Registry,
    config: &mut Config,
    invocation: &Invocation,
) -> Result<()> {
    match invocation.action {
        Action::Version => write_version(&mut config.stdout).await,
        Action::Info => run_info(manager, config, invocation).await,
        Action::Delete => {
            prepare(config, invocation)?;
            let span = tracing::info_span!(
                "delete",
                pid = std::process::id(),
                namespace = %invocation.namespace
            );
            run_delete(manager, config, invocation).instrument(span).await
        }
        Action::Start => {
            prepare(config, invocation)?;
            run_start(manager, config, invocation).await
        }
        Action::Serve => {
            prepare(config, invocation)?;
            let span = tracing::info_span!(
                "serve",
                pid = std::process::id(),
                namespace = %invocation.namespace
            );
            serve(registry, config, invocation).instrument(span).await
        }
    }
}

/// Checks shared by every namespaced action.
fn prepare(config: &Config, invocation: &Invocation) -> Result<()> {
    invocation.require_namespace()?;
    if !config.no_subreaper {
        sys::set_subreaper()?;
    }
    Ok(())
}

async fn write_output(stdout: &mut (dyn AsyncWrite + Send + Unpin), data: &[u8]) -> Result<()> {
    stdout.write_all(data).await?;
    stdout.flush().await?;
    Ok(())
}

async fn write_version(stdout: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
    let program = std::env::args()
        .next()
        .and_then(|arg| {
            Path::new(&arg)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
    let text = format!(
        "{program}:\n  Version:  {}\n  Protocol: {SHIM_VERSION}\n\n",
        env!("CARGO_PKG_VERSION")
    );
    write_output(stdout, text.as_bytes()).await
}

async fn run_info(
    manager: &dyn Manager,
    config: &mut Config,
    invocation: &Invocation,
) -> Result<()> {
    let mut options = Vec::new();
    config.stdin.read_to_end(&mut options).await?;
    let info = manager
        .info(invocation, &options)
        .await
        .map_err(|e| ShimError::manager("getting runtime info", e))?;
    let data = protocol::encode("runtime info", &info)?;
    write_output(&mut config.stdout, &data).await
}

async fn run_delete(
    manager: &dyn Manager,
    config: &mut Config,
    invocation: &Invocation,
) -> Result<()> {
    let sd = ShutdownService::new();
    // Reap while stop runs so its children do not linger as zombies.
    if !config.no_reaper {
        let token = sd.token();
        tokio::spawn(log_failure("reaper", Reaper::new().run(token)));
    }

    let result = manager.stop(invocation, &invocation.id).await;
    sd.shutdown();
    let status = result.map_err(|e| ShimError::manager("stopping manager", e))?;

    let data = protocol::encode("delete response", &DeleteResponse::from(status))?;
    write_output(&mut config.stdout, &data).await
}

async fn run_start(
    manager: &dyn Manager,
    config: &mut Config,
    invocation: &Invocation,
) -> Result<()> {
    if let Some(max) = invocation.env.max_shim_version {
        if i64::from(max) < i64::from(SHIM_VERSION) {
            return Err(ShimError::Config(format!(
                "engine supports shim protocol up to {max}, this shim requires {SHIM_VERSION}"
            )));
        }
    }

    let params = manager
        .start(invocation, &invocation.id, invocation.start_opts())
        .await
        .map_err(|e| ShimError::manager("starting manager", e))?;
    let data = serde_json::to_vec(&params)?;
    write_output(&mut config.stdout, &data).await
}

async fn log_failure<F, T>(what: &'static str, fut: F)
where
    F: std::future::Future<Output = Result<T>>,
{
    if let Err(e) = fut.await {
        warn!("{} stopped: {}", what, e);
    }
}

async fn serve(registry: Registry, config: &Config, invocation: &Invocation) -> Result<()> {
    let sd = ShutdownService::new();
    let token = sd.token();
    let mut activities = JoinSet::new();

    tuning::tune_allocator();
    activities.spawn(tuning::run_memory_trim(tuning::MEMORY_TRIM_INTERVAL, token.clone()));
    let exit_signals = reaper::handle_exit_signals(Arc::clone(&sd));
    activities.spawn(log_failure("exit signal handler", exit_signals));
    let dump_signals = reaper::handle_dump_signals(token.clone());
    activities.spawn(log_failure("dump signal handler", dump_signals));
    if !config.no_reaper {
        activities.spawn(log_failure("reaper", Reaper::new().run(token.clone())));
    }

    let result = serve_until_shutdown(registry, &sd, &mut activities, invocation).await;
    sd.shutdown();
    if let Err(e) = result {
        activities.abort_all();
        return Err(e);
    }

    let settle = async {
        sd.done().await;
        while activities.join_next().await.is_some() {}
    };
    tokio::time::timeout(SHUTDOWN_GRACE, settle)
        .await
        .map_err(|_| ShimError::ShutdownTimeout(SHUTDOWN_GRACE))?;
    info!("Shim stopped");
    Ok(())
}

async fn serve_until_shutdown(
    registry: Registry,
    sd: &Arc<ShutdownService>,
    activities: &mut JoinSet<()>,
    invocation: &Invocation,
) -> Result<()> {
    let mut plugins = Registry::new();
    plugins.register(builtin::shutdown_registration())?;
    plugins.register(builtin::publisher_registration(invocation.namespace.clone()))?;
    plugins.merge(registry)?;

    let properties = PluginProperties {
        bundle: invocation.bundle.clone(),
        grpc_address: invocation.address.clone(),
        ttrpc_address: invocation.env.ttrpc_address.clone(),
    };
    let composition = plugin::load(&plugins, &properties, sd)?;
    debug!(?composition, "Plugins loaded");

    let interceptor = chain_unary_interceptors(composition.interceptors);
    let mut server = RpcServer::new().with_interceptor(interceptor);
    for service in composition.services {
        service.register(&mut server)?;
    }
    let server = Arc::new(server);

    let mut cleanup = SocketCleanup::new(invocation);
    let listener = primary_listener(invocation)?;
    let token = sd.token();
    let serving = tokio::spawn(Arc::clone(&server).serve(listener, token.clone()));

    if invocation.debug {
        if let Some(debug_server) = composition.debug_server {
            match socket::listen(&invocation.debug_address()).and_then(socket::into_tokio) {
                Ok(listener) => {
                    let token = token.clone();
                    activities.spawn(async move {
                        if let Err(e) = debug_server.serve(listener, token).await {
                            warn!("Debug server failure: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Could not set up debug server: {}", e),
            }
        }
    }

    // The server returns once the token fires or accepting fails.
    let result = match serving.await {
        Ok(result) => result,
        Err(e) => Err(ShimError::Io(std::io::Error::other(e))),
    };
    cleanup.run();
    result
}

/// Listener for the RPC server: an inherited fd when `--socket` is empty and
/// one was passed, otherwise a fresh bind.
fn primary_listener(invocation: &Invocation) -> Result<tokio::net::UnixListener> {
    if invocation.socket.is_empty() {
        if let Some(listener) = sys::inherited_listener(sys::INHERITED_LISTENER_FD) {
            return socket::into_tokio(listener);
        }
    }
    socket::into_tokio(socket::listen(&invocation.primary_address())?)
}

/// Removes every socket a serving invocation may have created, once.
struct SocketCleanup {
    addresses: Vec<String>,
    done: bool,
}

impl SocketCleanup {
    fn new(invocation: &Invocation) -> Self {
        let mut addresses = Vec::new();
        if let Ok(address) = sys::read_address(&invocation.address_file()) {
            addresses.push(address);
        }
        for address in [invocation.primary_address(), invocation.debug_address()] {
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
        Self { addresses, done: false }
    }

    /// Returns how many socket files were removed. Later calls do nothing.
    fn run(&mut self) -> usize {
        if self.done {
            return 0;
        }
        self.done = true;

        let mut removed = 0;
        for address in &self.addresses {
            match socket::remove(address) {
                Ok(()) => {
                    debug!(address = %address, "Removed socket");
                    removed += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to remove socket {}: {}", address, e),
            }
        }
        removed
    }
}

impl Drop for SocketCleanup {
    fn drop(&mut self) {
        self.run();
    }
}
