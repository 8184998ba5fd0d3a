//! Environment variables read by the shim. Each accessor traces what it resolved.

use std::env;

/// Variables the shim consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    TtrpcAddress,
    GrpcAddress,
    Namespace,
    MaxShimVersion,
    TokioWorkerThreads,
    DarwinMountSystem,
}

impl EnvVar {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EnvVar::TtrpcAddress => "TTRPC_ADDRESS",
            EnvVar::GrpcAddress => "GRPC_ADDRESS",
            EnvVar::Namespace => "NAMESPACE",
            EnvVar::MaxShimVersion => "MAX_SHIM_VERSION",
            EnvVar::TokioWorkerThreads => "TOKIO_WORKER_THREADS",
            EnvVar::DarwinMountSystem => "DARWIN_MOUNT_SYSTEM",
        }
    }
}

/// Non-empty value of `var`, if set.
fn env_opt(var: EnvVar) -> Option<String> {
    env::var(var.as_str()).ok().filter(|v| !v.is_empty())
}

/// Engine RPC address used for publishing events ($TTRPC_ADDRESS)
pub fn ttrpc_address() -> String {
    let address = env_opt(EnvVar::TtrpcAddress).unwrap_or_default();
    tracing::trace!(address = %address, "TTRPC_ADDRESS env var");
    address
}

/// Engine gRPC address, consumed by plugins only ($GRPC_ADDRESS)
pub fn grpc_address() -> Option<String> {
    let val = env_opt(EnvVar::GrpcAddress);
    tracing::trace!(value = ?val, "GRPC_ADDRESS env var");
    val
}

/// Namespace fallback when no flag is given ($NAMESPACE)
pub fn namespace() -> Option<String> {
    let val = env_opt(EnvVar::Namespace);
    tracing::trace!(value = ?val, "NAMESPACE env var");
    val
}

/// Highest shim protocol version the engine accepts ($MAX_SHIM_VERSION).
/// Unparseable values are ignored.
pub fn max_shim_version() -> Option<u32> {
    let val = env_opt(EnvVar::MaxShimVersion).and_then(|v| v.trim().parse().ok());
    tracing::trace!(value = ?val, "MAX_SHIM_VERSION env var");
    val
}

/// Operator override of the runtime worker count ($TOKIO_WORKER_THREADS)
pub fn worker_threads_override() -> Option<String> {
    let val = env_opt(EnvVar::TokioWorkerThreads);
    tracing::trace!(value = ?val, "TOKIO_WORKER_THREADS env var");
    val
}

/// Mount backend selector for the mount helper ($DARWIN_MOUNT_SYSTEM)
pub fn darwin_mount_system() -> Option<String> {
    let val = env_opt(EnvVar::DarwinMountSystem);
    tracing::trace!(value = ?val, "DARWIN_MOUNT_SYSTEM env var");
    val
}

/// Snapshot of the variables that shape an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShimEnv {
    pub ttrpc_address: String,
    pub grpc_address: Option<String>,
    pub namespace: Option<String>,
    pub max_shim_version: Option<u32>,
}

impl ShimEnv {
    pub fn load() -> Self {
        Self {
            ttrpc_address: ttrpc_address(),
            grpc_address: grpc_address(),
            namespace: namespace(),
            max_shim_version: max_shim_version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(EnvVar::TtrpcAddress.as_str(), "TTRPC_ADDRESS");
        assert_eq!(EnvVar::MaxShimVersion.as_str(), "MAX_SHIM_VERSION");
        assert_eq!(EnvVar::DarwinMountSystem.as_str(), "DARWIN_MOUNT_SYSTEM");
    }
}
