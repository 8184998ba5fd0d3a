use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::rpc::Status;

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid address {address:?}: {reason}")]
    AddressParse { address: String, reason: String },

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("hybrid vsock handshake response error from {address}:{port}: {response:?}")]
    Handshake {
        address: String,
        port: u32,
        response: String,
    },

    #[error("timeout after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listen {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} failed for {}: {source}", path.display())]
    Socket {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load plugin {uri}: {source}")]
    PluginInit {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("plugin {0} is already registered")]
    DuplicatePlugin(String),

    #[error("plugin {0} provides a second debug server")]
    DuplicateDebugServer(String),

    #[error("no plugin provides an rpc service")]
    ServiceDiscovery,

    #[error("shim shutdown timeout after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("rpc: {0}")]
    Rpc(#[from] Status),

    #[error("encoding {what}: {reason}")]
    Encode { what: &'static str, reason: String },

    #[error("decoding {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("{command} failed: {output:?}")]
    Mount { command: String, output: String },

    #[error("{context}: {source}")]
    Manager {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShimError {
    pub(crate) fn address(address: &str, reason: impl Into<String>) -> Self {
        Self::AddressParse {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn socket(
        op: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Socket {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn manager(context: &'static str, source: anyhow::Error) -> Self {
        Self::Manager { context, source }
    }

    /// True for errors that carry an underlying "not found" io error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io(e) | Self::Socket { source: e, .. } => {
                e.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_carry_context() {
        let err = ShimError::Dial {
            address: "unix:///run/x.sock".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("unix:///run/x.sock"));

        let err = ShimError::socket(
            "chmod",
            "/run/s/abc",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().starts_with("chmod failed for /run/s/abc"));
    }

    #[test]
    fn test_is_not_found() {
        let err = ShimError::socket(
            "remove",
            "/tmp/none",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.is_not_found());
        assert!(!ShimError::ServiceDiscovery.is_not_found());
    }
}
