use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::error::{Result, ShimError};
use crate::plugin::Plugin;
use crate::rpc::protocol::{self, Envelope, Request, Timestamp};
use crate::rpc::RpcClient;

pub const EVENTS_SERVICE: &str = "events";
pub const FORWARD_METHOD: &str = "forward";

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards task events to the engine over its RPC address.
#[derive(Debug, Clone)]
pub struct Publisher {
    address: String,
    namespace: String,
    timeout: Duration,
}

impl Publisher {
    /// `address` may be a bare filesystem path, as engines export it; it is
    /// dialed as a unix socket.
    pub fn new(address: impl Into<String>, namespace: impl Into<String>) -> Self {
        let address = address.into();
        let address = if address.is_empty() || address.contains("://") {
            address
        } else {
            format!("unix://{address}")
        };
        Self {
            address,
            namespace: namespace.into(),
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sends one event. Failures are returned to the caller, never retried.
    pub async fn publish(&self, topic: &str, event: Vec<u8>) -> Result<()> {
        if self.address.is_empty() {
            return Err(ShimError::Config("no engine address to publish events to".to_string()));
        }

        let envelope = Envelope {
            timestamp: Timestamp::from(SystemTime::now()),
            namespace: self.namespace.clone(),
            topic: topic.to_string(),
            event,
        };
        let payload = protocol::encode("event envelope", &envelope)?;

        let mut client = RpcClient::connect(&self.address, self.timeout).await?;
        let request = Request::new(EVENTS_SERVICE, FORWARD_METHOD, payload)
            .metadata("namespace", &self.namespace);
        tokio::time::timeout(self.timeout, client.call(request))
            .await
            .map_err(|_| ShimError::Timeout {
                what: format!("publishing {topic} to {}", self.address),
                timeout: self.timeout,
            })??;

        debug!(topic = %topic, "Published event");
        Ok(())
    }
}

impl Plugin for Publisher {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{CallInfo, MethodHandler, RpcServer, Status};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Sink(mpsc::UnboundedSender<(String, Envelope)>);

    #[async_trait]
    impl MethodHandler for Sink {
        async fn handle(
            &self,
            info: &CallInfo,
            payload: Vec<u8>,
        ) -> std::result::Result<Vec<u8>, Status> {
            if info.method != FORWARD_METHOD {
                return Err(Status::not_found(info.method.clone()));
            }
            let envelope: Envelope = protocol::decode("event envelope", &payload)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            let ns = info.metadata_value("namespace").unwrap_or_default().to_string();
            let _ = self.0.send((ns, envelope));
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_publish_forwards_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut server = RpcServer::new();
        server.register_service(EVENTS_SERVICE, Arc::new(Sink(tx))).unwrap();
        let token = CancellationToken::new();
        tokio::spawn(Arc::new(server).serve(listener, token.clone()));

        let publisher = Publisher::new(format!("unix://{}", path.display()), "default");
        publisher.publish("/tasks/exit", b"exit".to_vec()).await.unwrap();

        let (ns, envelope) = rx.recv().await.unwrap();
        assert_eq!(ns, "default");
        assert_eq!(envelope.namespace, "default");
        assert_eq!(envelope.topic, "/tasks/exit");
        assert_eq!(envelope.event, b"exit");
        assert!(envelope.timestamp.seconds > 0);
        token.cancel();
    }

    #[tokio::test]
    async fn test_publish_to_bare_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sock.ttrpc");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut server = RpcServer::new();
        server.register_service(EVENTS_SERVICE, Arc::new(Sink(tx))).unwrap();
        let token = CancellationToken::new();
        tokio::spawn(Arc::new(server).serve(listener, token.clone()));

        let publisher = Publisher::new(path.display().to_string(), "default");
        assert_eq!(publisher.address(), format!("unix://{}", path.display()));
        publisher.publish("/tasks/create", b"c".to_vec()).await.unwrap();

        let (_, envelope) = rx.recv().await.unwrap();
        assert_eq!(envelope.topic, "/tasks/create");
        token.cancel();
    }

    #[test]
    fn test_scheme_addresses_kept() {
        assert_eq!(Publisher::new("vsock://3:1024", "ns").address(), "vsock://3:1024");
        assert_eq!(Publisher::new("", "ns").address(), "");
    }

    #[tokio::test]
    async fn test_publish_without_listener_fails() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Publisher::new(
            format!("unix://{}", dir.path().join("missing.sock").display()),
            "default",
        )
        .with_timeout(Duration::from_millis(100));
        let err = publisher.publish("/tasks/exit", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ShimError::Dial { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_publish_without_address_is_config_error() {
        let err = Publisher::new("", "default").publish("/x", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ShimError::Config(_)));
    }
}
