//! Socket addressing for the shim's control endpoints.
//!
//! Addresses are strings of the form `<scheme>://<opaque>` or a bare name:
//!
//! ```text
//! unix:///run/containerd/s/<sha256>   filesystem unix socket
//! vsock://<context id>:<port>         virtio vsock
//! hvsock://<unix path>:<port>         hybrid vsock (CONNECT handshake over unix)
//! <name>                              abstract unix socket, no filesystem entry
//! ```

mod connection;
mod vsock;

use std::fs::{DirBuilder, Permissions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::net::UnixStream;
use tracing::{debug, trace};

use crate::error::{Result, ShimError};

pub use connection::Connection;
pub use vsock::{parse_hybrid_vsock_address, parse_vsock_address};

const PROTO_UNIX: &str = "unix";
const PROTO_VSOCK: &str = "vsock";
const PROTO_HYBRID_VSOCK: &str = "hvsock";
const UNIX_PREFIX: &str = "unix://";
const ABSTRACT_SOCKET_PREFIX: char = '\0';

/// Dial timeout used by [`can_connect`].
pub const CAN_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Root used for computed socket addresses when the engine address gives none.
pub const DEFAULT_SOCKET_ROOT: &str = "/run/containerd";

/// Computes the well-known socket address for a shim.
///
/// The address is a pure function of its inputs: the joined
/// `root/namespace/id[/debug]` path is hashed with SHA-256 and the socket lives
/// under `<root>/s/<hex digest>`.
pub fn compute_address(root: &Path, namespace: &str, id: &str, debug: bool) -> String {
    let debug_component = if debug { "debug" } else { "" };
    let mut path = root.to_path_buf();
    // Empty components would leave a trailing slash in the hashed path.
    for component in [namespace, id, debug_component] {
        if !component.is_empty() {
            path.push(component);
        }
    }
    let digest = Sha256::digest(path.as_os_str().as_bytes());
    format!(
        "{UNIX_PREFIX}{}/{}",
        root.join("s").display(),
        hex::encode(digest)
    )
}

/// Directory that computed socket addresses are rooted at, derived from the
/// engine's own address (its parent directory).
pub fn socket_root(engine_address: &str) -> PathBuf {
    let path = engine_address
        .strip_prefix(UNIX_PREFIX)
        .unwrap_or(engine_address);
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from(DEFAULT_SOCKET_ROOT),
    }
}

/// A resolved unix socket location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixAddress {
    path: PathBuf,
    is_abstract: bool,
}

impl UnixAddress {
    /// Path handed to bind/connect. Abstract addresses start with a NUL byte.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }
}

/// Resolves a unix address: a `unix://` prefix denotes a filesystem socket,
/// anything else is treated as an abstract name.
pub fn resolve_unix_path(address: &str) -> UnixAddress {
    match address.strip_prefix(UNIX_PREFIX) {
        Some(path) => UnixAddress {
            path: PathBuf::from(path),
            is_abstract: false,
        },
        None => UnixAddress {
            path: PathBuf::from(format!("{ABSTRACT_SOCKET_PREFIX}{address}")),
            is_abstract: true,
        },
    }
}

/// Dials an address over the transport selected by its scheme.
///
/// Vsock connects ignore `timeout`; hybrid vsock uses it as the overall
/// handshake budget.
pub async fn dial(address: &str, timeout: Duration) -> Result<Connection> {
    let Some((proto, addr)) = address.split_once("://") else {
        return dial_unix(address, timeout).await;
    };
    match proto {
        PROTO_VSOCK => vsock::dial_vsock(addr).await,
        PROTO_HYBRID_VSOCK => vsock::dial_hybrid_vsock(addr, timeout).await,
        PROTO_UNIX => dial_unix(address, timeout).await,
        other => Err(ShimError::UnsupportedProtocol(other.to_string())),
    }
}

async fn dial_unix(address: &str, timeout: Duration) -> Result<Connection> {
    let sock = resolve_unix_path(address);
    trace!(address = %address, is_abstract = sock.is_abstract(), "Dialing unix socket");
    match tokio::time::timeout(timeout, UnixStream::connect(sock.path())).await {
        Ok(Ok(stream)) => Ok(Connection::Unix(stream)),
        Ok(Err(source)) => Err(ShimError::Dial {
            address: address.to_string(),
            source,
        }),
        Err(_) => Err(ShimError::Timeout {
            what: format!("dial {address}"),
            timeout,
        }),
    }
}

/// Permission bits for socket files and their parent directory.
fn socket_mode() -> u32 {
    // macOS needs +x to bind as non-root.
    if cfg!(target_os = "macos") {
        0o700
    } else {
        0o600
    }
}

/// Creates a listening unix socket for `address`.
///
/// Filesystem sockets get their parent directory created, any stale entry
/// removed, and the socket file restricted to the owner. Abstract sockets are
/// bound as-is.
pub fn listen(address: &str) -> Result<UnixListener> {
    let sock = resolve_unix_path(address);
    let path = sock.path();
    let mode = socket_mode();

    if !sock.is_abstract() {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .mode(mode)
                .create(parent)
                .map_err(|e| ShimError::socket("mkdir", path, e))?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ShimError::socket("remove stale socket", path, e)),
        }
    }

    let listener = bind(&sock).map_err(|source| ShimError::Listen {
        address: address.to_string(),
        source,
    })?;

    if !sock.is_abstract() {
        if let Err(e) = std::fs::set_permissions(path, Permissions::from_mode(mode)) {
            let _ = std::fs::remove_file(path);
            drop(listener);
            return Err(ShimError::socket("chmod", path, e));
        }
    }

    debug!(address = %address, "Listening");
    Ok(listener)
}

#[cfg(target_os = "linux")]
fn bind(sock: &UnixAddress) -> std::io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    if sock.is_abstract() {
        let name = &sock.path().as_os_str().as_bytes()[1..];
        UnixListener::bind_addr(&SocketAddr::from_abstract_name(name)?)
    } else {
        UnixListener::bind(sock.path())
    }
}

#[cfg(not(target_os = "linux"))]
fn bind(sock: &UnixAddress) -> std::io::Result<UnixListener> {
    UnixListener::bind(sock.path())
}

/// Registers a bound listener with the tokio reactor. Must run inside a runtime.
pub fn into_tokio(listener: UnixListener) -> Result<tokio::net::UnixListener> {
    listener.set_nonblocking(true)?;
    Ok(tokio::net::UnixListener::from_std(listener)?)
}

/// Removes the socket file behind `address`. Abstract addresses have none.
pub fn remove(address: &str) -> Result<()> {
    let sock = resolve_unix_path(address);
    if sock.is_abstract() {
        return Ok(());
    }
    std::fs::remove_file(sock.path()).map_err(|e| ShimError::socket("remove", sock.path(), e))
}

/// True only for an "address in use" failure raised while listening.
pub fn is_addr_in_use(err: &ShimError) -> bool {
    match err {
        ShimError::Listen { source, .. } => source.kind() == std::io::ErrorKind::AddrInUse,
        _ => false,
    }
}

/// Reports whether something is accepting connections at `address`.
pub async fn can_connect(address: &str) -> bool {
    match dial(address, CAN_CONNECT_TIMEOUT).await {
        Ok(conn) => {
            drop(conn);
            true
        }
        Err(e) => {
            trace!(address = %address, error = %e, "Socket not connectable");
            false
        }
    }
}
