//! Plugins shipped with the shim: the two every serving process registers
//! (shutdown and publisher) and optional ones a binary may add.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::plugin::{
    DebugServer, Plugin, PluginType, Registration, Registry, RpcService, DEBUG_PLUGIN_ID,
};
use crate::publisher::Publisher;
use crate::reaper;
use crate::rpc::{CallInfo, MethodHandler, Next, RpcServer, Status, UnaryServerInterceptor};
use crate::shutdown::ShutdownService;

pub const SHUTDOWN_PLUGIN_ID: &str = "shutdown";
pub const PUBLISHER_PLUGIN_ID: &str = "publisher";
pub const HEALTH_PLUGIN_ID: &str = "health";
pub const LOGGING_PLUGIN_ID: &str = "logging";

pub const HEALTH_SERVICE: &str = "health";
pub const DEBUG_SERVICE: &str = "debug";

/// Exposes the invocation's shutdown service as a plugin.
pub fn shutdown_registration() -> Registration {
    Registration::new(PluginType::INTERNAL, SHUTDOWN_PLUGIN_ID, |ic| {
        Ok(Arc::clone(ic.shutdown()) as Arc<dyn Plugin>)
    })
}

/// Event publisher aimed at the engine's TTRPC address.
pub fn publisher_registration(namespace: impl Into<String>) -> Registration {
    let namespace = namespace.into();
    Registration::new(PluginType::EVENT, PUBLISHER_PLUGIN_ID, move |ic| {
        Ok(Arc::new(Publisher::new(ic.ttrpc_address(), namespace.clone())))
    })
}

/// Liveness service: `ping` echoes its payload, `shutdown` stops the shim.
pub struct HealthService {
    shutdown: Arc<ShutdownService>,
}

impl HealthService {
    pub fn new(shutdown: Arc<ShutdownService>) -> Self {
        Self { shutdown }
    }
}

#[async_trait]
impl MethodHandler for HealthService {
    async fn handle(
        &self,
        info: &CallInfo,
        payload: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, Status> {
        match info.method.as_str() {
            "ping" => Ok(payload),
            "shutdown" => {
                info!("Shutdown requested over rpc");
                self.shutdown.shutdown();
                Ok(Vec::new())
            }
            other => Err(Status::not_found(format!("{HEALTH_SERVICE} has no method {other}"))),
        }
    }
}

impl RpcService for HealthService {
    fn register(self: Arc<Self>, server: &mut RpcServer) -> Result<()> {
        server.register_service(HEALTH_SERVICE, self)
    }
}

impl Plugin for HealthService {
    fn rpc_service(self: Arc<Self>) -> Option<Arc<dyn RpcService>> {
        Some(self)
    }
}

pub fn health_registration() -> Registration {
    Registration::new(PluginType::TTRPC, HEALTH_PLUGIN_ID, |ic| {
        let sd = ic
            .get::<ShutdownService>(PluginType::INTERNAL, SHUTDOWN_PLUGIN_ID)
            .unwrap_or_else(|| Arc::clone(ic.shutdown()));
        Ok(Arc::new(HealthService::new(sd)))
    })
    .requires(PluginType::INTERNAL)
}

/// Logs every unary call with its outcome and latency.
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

#[async_trait]
impl UnaryServerInterceptor for LoggingInterceptor {
    async fn intercept(
        &self,
        info: &CallInfo,
        payload: Vec<u8>,
        next: Next<'_>,
    ) -> std::result::Result<Vec<u8>, Status> {
        let started = Instant::now();
        let result = next.run(info, payload).await;
        let method = info.full_method();
        let elapsed = started.elapsed();
        match &result {
            Ok(reply) => debug!(method = %method, bytes = reply.len(), ?elapsed, "rpc ok"),
            Err(status) => debug!(method = %method, code = %status.code(), ?elapsed, "rpc failed"),
        }
        result
    }
}

impl Plugin for LoggingInterceptor {
    fn unary_interceptor(self: Arc<Self>) -> Option<Arc<dyn UnaryServerInterceptor>> {
        Some(self)
    }
}

pub fn logging_registration() -> Registration {
    Registration::new(PluginType::TTRPC, LOGGING_PLUGIN_ID, |_| Ok(Arc::new(LoggingInterceptor)))
}

/// Diagnostics served on the debug socket; `stacks` returns a task dump.
#[derive(Debug, Default)]
pub struct DebugService;

#[async_trait]
impl MethodHandler for DebugService {
    async fn handle(
        &self,
        info: &CallInfo,
        _payload: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, Status> {
        match info.method.as_str() {
            "stacks" => Ok(reaper::dump_stacks().into_bytes()),
            other => Err(Status::not_found(format!("{DEBUG_SERVICE} has no method {other}"))),
        }
    }
}

#[async_trait]
impl DebugServer for DebugService {
    async fn serve(&self, listener: UnixListener, shutdown: CancellationToken) -> Result<()> {
        let mut server = RpcServer::new();
        server.register_service(DEBUG_SERVICE, Arc::new(DebugService))?;
        Arc::new(server).serve(listener, shutdown).await
    }
}

impl Plugin for DebugService {
    fn debug_server(self: Arc<Self>) -> Option<Arc<dyn DebugServer>> {
        Some(self)
    }
}

pub fn debug_registration() -> Registration {
    Registration::new(PluginType::DEBUG, DEBUG_PLUGIN_ID, |_| Ok(Arc::new(DebugService)))
}

/// Registers the health service, the logging interceptor and the debug server.
pub fn register_optional(registry: &mut Registry) -> Result<()> {
    registry.register(logging_registration())?;
    registry.register(health_registration())?;
    registry.register(debug_registration())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{self, PluginProperties};
    use crate::rpc::protocol::Request;
    use crate::rpc::{chain_unary_interceptors, Code, RpcClient};
    use std::time::Duration;

    fn call(service: &str, method: &str) -> CallInfo {
        CallInfo {
            service: service.into(),
            method: method.into(),
            metadata: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_health_ping_and_shutdown() {
        let sd = ShutdownService::new();
        let health = HealthService::new(Arc::clone(&sd));

        let echoed = health.handle(&call(HEALTH_SERVICE, "ping"), b"hi".to_vec()).await.unwrap();
        assert_eq!(echoed, b"hi");
        assert!(!sd.is_shutdown());

        health.handle(&call(HEALTH_SERVICE, "shutdown"), Vec::new()).await.unwrap();
        assert!(sd.is_shutdown());

        let err = health.handle(&call(HEALTH_SERVICE, "kill"), Vec::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_logging_interceptor_passes_through() {
        let interceptors: Vec<Arc<dyn UnaryServerInterceptor>> = vec![Arc::new(LoggingInterceptor)];
        let mut server = RpcServer::new().with_interceptor(chain_unary_interceptors(interceptors));
        server
            .register_service(HEALTH_SERVICE, Arc::new(HealthService::new(ShutdownService::new())))
            .unwrap();
        let response = server.dispatch(Request::new(HEALTH_SERVICE, "ping", b"x".to_vec())).await;
        assert_eq!(response.into_result().unwrap(), b"x");
    }

    #[test]
    fn test_builtins_compose() {
        let sd = ShutdownService::new();
        let mut registry = Registry::new();
        registry.register(shutdown_registration()).unwrap();
        registry.register(publisher_registration("default")).unwrap();
        register_optional(&mut registry).unwrap();

        let composition = plugin::load(&registry, &PluginProperties::default(), &sd).unwrap();
        assert_eq!(composition.services.len(), 1);
        assert_eq!(composition.interceptors.len(), 1);
        assert!(composition.debug_server.is_some());
        assert!(composition
            .plugins
            .get_by_id(PluginType::EVENT, PUBLISHER_PLUGIN_ID)
            .is_some());
    }

    #[tokio::test]
    async fn test_debug_server_dumps_stacks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let token = token.clone();
            async move { DebugService.serve(listener, token).await }
        });

        let address = format!("unix://{}", path.display());
        let mut client = RpcClient::connect(&address, Duration::from_secs(1)).await.unwrap();
        let dump = client.call(Request::new(DEBUG_SERVICE, "stacks", Vec::new())).await.unwrap();
        assert!(String::from_utf8(dump).unwrap().contains("=== BEGIN task dump ==="));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
