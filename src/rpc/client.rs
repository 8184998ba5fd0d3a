use std::time::Duration;

use tracing::trace;

use super::protocol::{self, MessageFrame, Request, Response};
use crate::error::{Result, ShimError};
use crate::socket::{self, Connection};

/// A single connection to an RPC endpoint. Calls are sequential.
#[derive(Debug)]
pub struct RpcClient {
    address: String,
    conn: Connection,
}

impl RpcClient {
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let conn = socket::dial(address, timeout).await?;
        Ok(Self::from_connection(address, conn))
    }

    pub fn from_connection(address: &str, conn: Connection) -> Self {
        Self {
            address: address.to_string(),
            conn,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sends `request` and waits for its reply. Error replies come back as
    /// [`ShimError::Rpc`].
    pub async fn call(&mut self, request: Request) -> Result<Vec<u8>> {
        trace!("Calling /{}/{} on {}", request.service, request.method, self.address);
        let bytes = protocol::encode("request", &request)?;
        MessageFrame::write(&mut self.conn, &bytes).await?;

        let reply = MessageFrame::read(&mut self.conn).await?.ok_or_else(|| {
            ShimError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection before replying", self.address),
            ))
        })?;
        protocol::decode::<Response>("response", &reply)?.into_result()
    }
}
