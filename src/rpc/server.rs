use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::interceptor::{Next, UnaryServerInterceptor};
use super::protocol::{self, MessageFrame, Request, Response};
use super::{Code, Status};
use crate::error::Result;

/// What an interceptor or handler knows about the call in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub service: String,
    pub method: String,
    pub metadata: Vec<(String, String)>,
}

impl CallInfo {
    /// `/<service>/<method>`
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Serves every method of one registered service.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(
        &self,
        info: &CallInfo,
        payload: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, Status>;
}

#[derive(Default)]
pub struct RpcServer {
    services: BTreeMap<String, Arc<dyn MethodHandler>>,
    interceptor: Option<Arc<dyn UnaryServerInterceptor>>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interceptor(
        mut self,
        interceptor: Option<Arc<dyn UnaryServerInterceptor>>,
    ) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn register_service(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<()> {
        let name = name.into();
        if self.services.contains_key(&name) {
            let message = format!("service {name} already registered");
            return Err(Status::new(Code::AlreadyExists, message).into());
        }
        debug!("Registered rpc service: {}", name);
        self.services.insert(name, handler);
        Ok(())
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Runs one call through the interceptor chain and the service handler.
    pub async fn dispatch(&self, request: Request) -> Response {
        let Request {
            service,
            method,
            payload,
            metadata,
        } = request;
        let info = CallInfo {
            service,
            method,
            metadata,
        };

        let Some(handler) = self.services.get(&info.service) else {
            return Status::unimplemented(format!("service {} not registered", info.service)).into();
        };

        let result = match &self.interceptor {
            Some(interceptor) => {
                interceptor
                    .intercept(&info, payload, Next::handler(handler.as_ref()))
                    .await
            }
            None => handler.handle(&info, payload).await,
        };

        match result {
            Ok(payload) => Response::Ok { payload },
            Err(status) => status.into(),
        }
    }

    /// Accepts connections until `shutdown` fires or accepting fails.
    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("RPC server listening");

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&self);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, shutdown).await {
                                    warn!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            return Err(e.into());
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, closing rpc listener");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        &self,
        mut stream: UnixStream,
        shutdown: CancellationToken,
    ) -> Result<()> {
        trace!("New connection accepted");

        loop {
            let frame = tokio::select! {
                frame = MessageFrame::read(&mut stream) => frame?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let Some(bytes) = frame else {
                trace!("Connection closed by peer");
                return Ok(());
            };

            let response = match protocol::decode::<Request>("request", &bytes) {
                Ok(request) => {
                    trace!("Call /{}/{}", request.service, request.method);
                    self.dispatch(request).await
                }
                Err(e) => Status::invalid_argument(e.to_string()).into(),
            };

            MessageFrame::write(&mut stream, &protocol::encode("response", &response)?).await?;
        }
    }
}

impl From<Status> for Response {
    fn from(status: Status) -> Self {
        Response::Error {
            code: status.code() as u32,
            message: status.message().to_string(),
        }
    }
}

impl Response {
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self {
            Response::Ok { payload } => Ok(payload),
            Response::Error { code, message } => Err(Status::new(Code::from(code), message).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShimError;
    use crate::rpc::RpcClient;
    use std::path::Path;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Health;

    #[async_trait]
    impl MethodHandler for Health {
        async fn handle(
            &self,
            info: &CallInfo,
            payload: Vec<u8>,
        ) -> std::result::Result<Vec<u8>, Status> {
            match info.method.as_str() {
                "ping" => Ok(payload),
                "namespace" => {
                    let namespace = info.metadata_value("namespace").unwrap_or("");
                    Ok(namespace.as_bytes().to_vec())
                }
                other => Err(Status::not_found(format!("method {other}"))),
            }
        }
    }

    fn start(dir: &Path) -> (String, CancellationToken, JoinHandle<Result<()>>) {
        let path = dir.join("rpc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let mut server = RpcServer::new();
        server.register_service("health", Arc::new(Health)).unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(server).serve(listener, token.clone()));
        (format!("unix://{}", path.display()), token, handle)
    }

    #[test]
    fn test_register_rejects_duplicate_service() {
        let mut server = RpcServer::new();
        server.register_service("health", Arc::new(Health)).unwrap();
        let err = server.register_service("health", Arc::new(Health)).unwrap_err();
        assert!(matches!(err, ShimError::Rpc(ref s) if s.code() == Code::AlreadyExists));
        assert_eq!(server.services().collect::<Vec<_>>(), vec!["health"]);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_service_is_unimplemented() {
        let server = RpcServer::new();
        let response = server.dispatch(Request::new("nope", "ping", Vec::new())).await;
        assert!(matches!(response, Response::Error { code: 12, .. }));
    }

    #[tokio::test]
    async fn test_serve_multiple_calls_per_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (address, token, handle) = start(dir.path());

        let mut client = RpcClient::connect(&address, Duration::from_secs(1)).await.unwrap();
        let pong = client.call(Request::new("health", "ping", b"abc".to_vec())).await.unwrap();
        assert_eq!(pong, b"abc");

        let ns = client
            .call(Request::new("health", "namespace", Vec::new()).metadata("namespace", "k8s.io"))
            .await
            .unwrap();
        assert_eq!(ns, b"k8s.io");

        let err = client.call(Request::new("health", "bogus", Vec::new())).await.unwrap_err();
        assert!(matches!(err, ShimError::Rpc(ref s) if s.code() == Code::NotFound));

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_returns_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (_address, token, handle) = start(dir.path());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
