//! Wire types for the shim's RPC endpoint, using rkyv for zero-copy
//! serialization.
//!
//! Every message travels in a [`MessageFrame`]: a 4-byte little-endian length
//! followed by the archived bytes.

use rkyv::api::high::HighSerializer;
use rkyv::rancor::Error as RkyvError;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, ShimError};

/// Upper bound on a single frame. Larger frames indicate a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 << 20;

/// A unary call from client to server
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Request {
    pub service: String,
    pub method: String,
    pub payload: Vec<u8>,
    /// Free-form key/value metadata, e.g. the caller's namespace.
    pub metadata: Vec<(String, String)>,
}

impl Request {
    pub fn new(service: impl Into<String>, method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            payload,
            metadata: Vec::new(),
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Reply to a [`Request`]
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Response {
    Ok { payload: Vec<u8> },
    Error { code: u32, message: String },
}

/// Event forwarded to the engine by the publisher
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Envelope {
    pub timestamp: Timestamp,
    pub namespace: String,
    pub topic: String,
    pub event: Vec<u8>,
}

/// Seconds and nanoseconds since the unix epoch
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[rkyv(derive(Debug))]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(time: std::time::SystemTime) -> Self {
        match time.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => Self {
                seconds: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            // nanos stays positive, so whole seconds are rounded down
            Err(e) => {
                let d = e.duration();
                let seconds = -(d.as_secs() as i64);
                match d.subsec_nanos() {
                    0 => Self { seconds, nanos: 0 },
                    nanos => Self {
                        seconds: seconds - 1,
                        nanos: 1_000_000_000 - nanos,
                    },
                }
            }
        }
    }
}

/// Archives `value` with rkyv.
pub fn encode<T>(what: &'static str, value: &T) -> Result<Vec<u8>>
where
    T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    rkyv::to_bytes::<RkyvError>(value)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| ShimError::Encode {
            what,
            reason: e.to_string(),
        })
}

/// Validates and deserializes an archived `T`. The input need not be aligned.
pub fn decode<T>(what: &'static str, bytes: &[u8]) -> Result<T>
where
    T: Archive,
    T::Archived: for<'a> rkyv::bytecheck::CheckBytes<rkyv::api::high::HighValidator<'a, RkyvError>>
        + Deserialize<T, rkyv::api::high::HighDeserializer<RkyvError>>,
{
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<T, RkyvError>(&aligned).map_err(|e| ShimError::Decode {
        what,
        reason: e.to_string(),
    })
}

/// Message frame for the wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    pub fn encode(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }

    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    /// Reads one frame. `Ok(None)` means the peer closed cleanly between frames.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = Self::read_length(&len_buf);
        if len > MAX_FRAME_LEN {
            return Err(ShimError::Decode {
                what: "frame",
                reason: format!("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"),
            });
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    pub async fn write<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
        writer.write_all(&Self::encode(bytes)).await?;
        writer.flush().await?;
        Ok(())
    }
}
