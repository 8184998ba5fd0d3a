use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::Connection;
use crate::error::{Result, ShimError};

/// The handshake budget is split into this many retry slots.
const HYBRID_VSOCK_RETRIES: u32 = 10;
const MAX_HANDSHAKE_LINE: usize = 4096;

/// Parses `<context id>:<port>`.
pub fn parse_vsock_address(address: &str) -> Result<(u32, u32)> {
    let (cid, port) = address
        .split_once(':')
        .ok_or_else(|| {
            ShimError::address(address, "invalid vsock address, expected <cid>:<port>")
        })?;
    let cid = parse_u32_field(address, "context id", cid)?;
    let port = parse_u32_field(address, "port", port)?;
    Ok((cid, port))
}

/// Parses `<unix path>:<port>`.
pub fn parse_hybrid_vsock_address(address: &str) -> Result<(String, u32)> {
    let (path, port) = address.split_once(':').ok_or_else(|| {
        ShimError::address(address, "invalid hybrid vsock address, expected <path>:<port>")
    })?;
    let port = parse_u32_field(address, "port", port)?;
    Ok((path.to_string(), port))
}

fn parse_u32_field(address: &str, field: &str, value: &str) -> Result<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ShimError::address(
            address,
            format!("failed to parse vsock {field} {value:?}"),
        ));
    }
    let parsed: u64 = value
        .parse()
        .map_err(|e| ShimError::address(address, format!("vsock {field} {value}: {e}")))?;
    u32::try_from(parsed)
        .map_err(|_| ShimError::address(address, format!("vsock {field} {parsed} is invalid")))
}

#[cfg(target_os = "linux")]
pub(super) async fn dial_vsock(address: &str) -> Result<Connection> {
    let (cid, port) = parse_vsock_address(address)?;
    let stream = tokio_vsock::VsockStream::connect(tokio_vsock::VsockAddr::new(cid, port))
        .await
        .map_err(|source| ShimError::Dial {
            address: format!("vsock://{address}"),
            source,
        })?;
    Ok(Connection::Vsock(stream))
}

#[cfg(not(target_os = "linux"))]
pub(super) async fn dial_vsock(address: &str) -> Result<Connection> {
    parse_vsock_address(address)?;
    Err(ShimError::UnsupportedProtocol(
        "vsock is not available on this platform".to_string(),
    ))
}

pub(super) async fn dial_hybrid_vsock(address: &str, timeout: Duration) -> Result<Connection> {
    let (path, port) = parse_hybrid_vsock_address(address)?;
    hybrid_vsock_handshake(&path, port, timeout).await
}

/// Connects to the host-side unix socket and asks for `port` with a
/// `CONNECT <port>\n` line. A reply containing `OK` hands back the stream.
///
/// End-of-stream before a reply means the guest side is not listening yet:
/// the attempt is dropped and retried every `timeout / 10` until `timeout`
/// has elapsed overall.
async fn hybrid_vsock_handshake(path: &str, port: u32, timeout: Duration) -> Result<Connection> {
    let deadline = Instant::now() + timeout;
    let retry_interval = timeout / HYBRID_VSOCK_RETRIES;
    let timed_out = || ShimError::Timeout {
        what: format!("hybrid vsock handshake of {path}:{port}"),
        timeout,
    };
    let dial_error = |source| ShimError::Dial {
        address: format!("hvsock://{path}:{port}"),
        source,
    };

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out());
        }

        let mut stream = match tokio::time::timeout(remaining, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(dial_error(source)),
            Err(_) => return Err(timed_out()),
        };

        stream
            .write_all(format!("CONNECT {port}\n").as_bytes())
            .await
            .map_err(dial_error)?;

        match tokio::time::timeout(remaining, read_line(&mut stream)).await {
            Err(_) => return Err(timed_out()),
            Ok(Ok(response)) if response.contains("OK") => {
                debug!("Hybrid vsock handshake with {}:{} accepted", path, port);
                return Ok(Connection::Unix(stream));
            }
            Ok(Ok(response)) => {
                return Err(ShimError::Handshake {
                    address: path.to_string(),
                    port,
                    response,
                })
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                drop(stream);
                warn!("Read hybrid vsock got EOF, server may not be ready");
                let left = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(retry_interval.min(left)).await;
            }
            Ok(Err(source)) => return Err(dial_error(source)),
        }
    }
}

/// Reads one `\n`-terminated line without consuming anything past it, so the
/// stream is clean for the protocol that follows the handshake.
async fn read_line(stream: &mut UnixStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_HANDSHAKE_LINE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "hybrid vsock handshake response too long",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
