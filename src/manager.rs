//! The lifecycle manager contract a shim binary implements, plus the messages
//! the one-shot actions write to stdout.

use std::time::SystemTime;

use async_trait::async_trait;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::args::Invocation;
use crate::rpc::protocol::Timestamp;

/// Protocol version announced by the start action.
pub const SHIM_VERSION: i32 = 2;

/// Options handed to [`Manager::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOpts {
    /// Engine address the shim was launched with.
    pub address: String,
    /// Engine RPC address used for publishing events.
    pub ttrpc_address: String,
    pub debug: bool,
}

/// Transport the engine should speak to the started shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ttrpc,
    Grpc,
}

/// Written as JSON to stdout by the start action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapParams {
    pub version: i32,
    pub address: String,
    pub protocol: Protocol,
}

impl BootstrapParams {
    pub fn new(address: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            version: SHIM_VERSION,
            address: address.into(),
            protocol,
        }
    }
}

/// Result of [`Manager::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopStatus {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: SystemTime,
}

/// Written to stdout by the delete action.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct DeleteResponse {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: Timestamp,
}

impl From<StopStatus> for DeleteResponse {
    fn from(status: StopStatus) -> Self {
        Self {
            pid: status.pid,
            exit_status: status.exit_status,
            exited_at: Timestamp::from(status.exited_at),
        }
    }
}

/// Written to stdout by the info action.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Eq, Default)]
#[rkyv(derive(Debug))]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
    pub revision: String,
    /// Options as read from stdin, possibly rewritten by the manager.
    pub options: Vec<u8>,
    pub annotations: Vec<(String, String)>,
}

/// Lifecycle operations for the one-shot actions.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Runtime name, e.g. `io.containerd.example.v1`.
    fn name(&self) -> &str;

    /// Starts (or finds) the long-running shim for `id`.
    async fn start(
        &self,
        invocation: &Invocation,
        id: &str,
        opts: StartOpts,
    ) -> anyhow::Result<BootstrapParams>;

    /// Cleans up after the shim for `id`.
    async fn stop(&self, invocation: &Invocation, id: &str) -> anyhow::Result<StopStatus>;

    /// Describes the runtime given serialized options read from stdin.
    async fn info(&self, invocation: &Invocation, options: &[u8]) -> anyhow::Result<RuntimeInfo>;
}
