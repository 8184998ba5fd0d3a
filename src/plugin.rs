//! Plugin registration, ordered initialization and capability discovery.
//!
//! Callers build a [`Registry`] explicitly and hand it to the bootstrap. Each
//! initialized instance is checked for three optional capabilities: an RPC
//! service, a unary interceptor and a debug server.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, ShimError};
use crate::rpc::{RpcServer, UnaryServerInterceptor};
use crate::shutdown::ShutdownService;

/// Id reserved for the plugin that provides the debug server.
pub const DEBUG_PLUGIN_ID: &str = "debug";

pub const PROPERTY_STATE_DIR: &str = "shim.plugin.state";
pub const PROPERTY_GRPC_ADDRESS: &str = "shim.plugin.grpc.address";
pub const PROPERTY_TTRPC_ADDRESS: &str = "shim.plugin.ttrpc.address";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginType(pub &'static str);

impl PluginType {
    pub const INTERNAL: PluginType = PluginType("shim.internal.v1");
    pub const EVENT: PluginType = PluginType("shim.event.v1");
    pub const TTRPC: PluginType = PluginType("shim.ttrpc.v1");
    pub const DEBUG: PluginType = PluginType("shim.debug.v1");
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The plugin opted out; it is logged and left out of the set.
    #[error("skip plugin: {0}")]
    Skip(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub trait AsAny {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// An initialized plugin instance. Every capability is optional.
pub trait Plugin: AsAny + Send + Sync {
    fn rpc_service(self: Arc<Self>) -> Option<Arc<dyn RpcService>> {
        None
    }

    fn unary_interceptor(self: Arc<Self>) -> Option<Arc<dyn UnaryServerInterceptor>> {
        None
    }

    fn debug_server(self: Arc<Self>) -> Option<Arc<dyn DebugServer>> {
        None
    }
}

/// Registers one or more services on the shim's RPC server.
pub trait RpcService: Send + Sync {
    fn register(self: Arc<Self>, server: &mut RpcServer) -> Result<()>;
}

/// Serves diagnostics on the separate debug socket.
#[async_trait]
pub trait DebugServer: Send + Sync {
    async fn serve(&self, listener: UnixListener, shutdown: CancellationToken) -> Result<()>;
}

pub type InitResult = std::result::Result<Arc<dyn Plugin>, PluginError>;
pub type InitFn = Box<dyn Fn(&InitContext<'_>) -> InitResult + Send + Sync>;

pub struct Registration {
    pub plugin_type: PluginType,
    pub id: String,
    pub requires: Vec<PluginType>,
    init: InitFn,
}

impl Registration {
    pub fn new<F>(plugin_type: PluginType, id: impl Into<String>, init: F) -> Self
    where
        F: Fn(&InitContext<'_>) -> InitResult + Send + Sync + 'static,
    {
        Self {
            plugin_type,
            id: id.into(),
            requires: Vec::new(),
            init: Box::new(init),
        }
    }

    /// Declares that every plugin of `plugin_type` initializes first.
    pub fn requires(mut self, plugin_type: PluginType) -> Self {
        self.requires.push(plugin_type);
        self
    }

    /// `<type>.<id>`
    pub fn uri(&self) -> String {
        format!("{}.{}", self.plugin_type, self.id)
    }

    pub fn init(&self, ctx: &InitContext<'_>) -> InitResult {
        (self.init)(ctx)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("type", &self.plugin_type)
            .field("id", &self.id)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    registrations: Vec<Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: Registration) -> Result<()> {
        if self
            .registrations
            .iter()
            .any(|r| r.plugin_type == registration.plugin_type && r.id == registration.id)
        {
            return Err(ShimError::DuplicatePlugin(registration.uri()));
        }
        self.registrations.push(registration);
        Ok(())
    }

    /// Appends every registration of `other`, keeping its order.
    pub fn merge(&mut self, other: Registry) -> Result<()> {
        for registration in other.registrations {
            self.register(registration)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Registrations in initialization order: declaration order with every
    /// required type placed first. `exclude` drops registrations entirely.
    /// A cycle is broken at the registration visited first.
    pub fn graph(&self, exclude: impl Fn(&Registration) -> bool) -> Vec<&Registration> {
        let mut ordered = Vec::with_capacity(self.registrations.len());
        let mut seen = HashSet::new();
        for index in 0..self.registrations.len() {
            self.visit(index, &exclude, &mut seen, &mut ordered);
        }
        ordered
    }

    fn visit<'a>(
        &'a self,
        index: usize,
        exclude: &impl Fn(&Registration) -> bool,
        seen: &mut HashSet<usize>,
        ordered: &mut Vec<&'a Registration>,
    ) {
        let registration = &self.registrations[index];
        if exclude(registration) || !seen.insert(index) {
            return;
        }
        for required in &registration.requires {
            for (dep, candidate) in self.registrations.iter().enumerate() {
                if candidate.plugin_type == *required {
                    self.visit(dep, exclude, seen, ordered);
                }
            }
        }
        ordered.push(registration);
    }
}

/// Instances initialized so far, in initialization order.
#[derive(Default)]
pub struct PluginSet {
    instances: Vec<(PluginType, String, Arc<dyn Plugin>)>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        plugin_type: PluginType,
        id: &str,
        instance: Arc<dyn Plugin>,
    ) -> Result<()> {
        if self.get_by_id(plugin_type, id).is_some() {
            return Err(ShimError::DuplicatePlugin(format!("{plugin_type}.{id}")));
        }
        self.instances.push((plugin_type, id.to_string(), instance));
        Ok(())
    }

    pub fn get_by_id(&self, plugin_type: PluginType, id: &str) -> Option<&Arc<dyn Plugin>> {
        self.instances
            .iter()
            .find(|(t, i, _)| *t == plugin_type && i == id)
            .map(|(_, _, instance)| instance)
    }

    pub fn get_by_type(&self, plugin_type: PluginType) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.instances
            .iter()
            .filter(move |(t, _, _)| *t == plugin_type)
            .map(|(_, _, instance)| instance)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Values shared by every plugin of one invocation.
#[derive(Debug, Clone, Default)]
pub struct PluginProperties {
    pub bundle: PathBuf,
    pub grpc_address: String,
    pub ttrpc_address: String,
}

/// What a plugin sees while it initializes.
pub struct InitContext<'a> {
    registration: &'a Registration,
    properties: BTreeMap<&'static str, String>,
    shutdown: &'a Arc<ShutdownService>,
    initialized: &'a PluginSet,
}

impl<'a> InitContext<'a> {
    pub fn new(
        registration: &'a Registration,
        base: &PluginProperties,
        shutdown: &'a Arc<ShutdownService>,
        initialized: &'a PluginSet,
    ) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(
            PROPERTY_STATE_DIR,
            base.bundle.join(registration.uri()).display().to_string(),
        );
        properties.insert(PROPERTY_GRPC_ADDRESS, base.grpc_address.clone());
        properties.insert(PROPERTY_TTRPC_ADDRESS, base.ttrpc_address.clone());
        Self {
            registration,
            properties,
            shutdown,
            initialized,
        }
    }

    pub fn id(&self) -> &str {
        &self.registration.id
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Scratch directory owned by this plugin. Not created here.
    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(self.property(PROPERTY_STATE_DIR).unwrap_or_default())
    }

    pub fn grpc_address(&self) -> &str {
        self.property(PROPERTY_GRPC_ADDRESS).unwrap_or_default()
    }

    pub fn ttrpc_address(&self) -> &str {
        self.property(PROPERTY_TTRPC_ADDRESS).unwrap_or_default()
    }

    pub fn shutdown(&self) -> &Arc<ShutdownService> {
        self.shutdown
    }

    /// Typed lookup of an instance initialized earlier.
    pub fn get<T: Any + Send + Sync>(&self, plugin_type: PluginType, id: &str) -> Option<Arc<T>> {
        let instance = self.initialized.get_by_id(plugin_type, id)?;
        Arc::clone(instance).into_any().downcast::<T>().ok()
    }

    pub fn get_by_type(&self, plugin_type: PluginType) -> Vec<Arc<dyn Plugin>> {
        self.initialized.get_by_type(plugin_type).cloned().collect()
    }
}

/// Capabilities gathered from an initialized plugin graph.
pub struct Composition {
    pub plugins: PluginSet,
    pub services: Vec<Arc<dyn RpcService>>,
    pub interceptors: Vec<Arc<dyn UnaryServerInterceptor>>,
    pub debug_server: Option<Arc<dyn DebugServer>>,
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("plugins", &self.plugins.len())
            .field("services", &self.services.len())
            .field("interceptors", &self.interceptors.len())
            .field("debug_server", &self.debug_server.is_some())
            .finish()
    }
}

/// Initializes every registration in graph order and collects what the instances provide.
///
/// A plugin returning [`PluginError::Skip`] is left out; any other failure
/// aborts. Having no RPC service at all is a [`ShimError::ServiceDiscovery`].
pub fn load(
    registry: &Registry,
    properties: &PluginProperties,
    shutdown: &Arc<ShutdownService>,
) -> Result<Composition> {
    let mut plugins = PluginSet::new();
    let mut services = Vec::new();
    let mut interceptors = Vec::new();
    let mut debug_server = None;

    for registration in registry.graph(|_| false) {
        let uri = registration.uri();
        debug!(id = %uri, "Loading plugin");

        let instance = {
            let ctx = InitContext::new(registration, properties, shutdown, &plugins);
            match registration.init(&ctx) {
                Ok(instance) => instance,
                Err(PluginError::Skip(reason)) => {
                    info!(id = %uri, reason = %reason, "Skip loading plugin");
                    continue;
                }
                Err(PluginError::Failed(source)) => {
                    return Err(ShimError::PluginInit { uri, source });
                }
            }
        };

        if let Some(service) = Arc::clone(&instance).rpc_service() {
            debug!(id = %uri, "Registering rpc service");
            services.push(service);
        }
        if let Some(interceptor) = Arc::clone(&instance).unary_interceptor() {
            interceptors.push(interceptor);
        }
        if registration.id == DEBUG_PLUGIN_ID {
            if let Some(server) = Arc::clone(&instance).debug_server() {
                if debug_server.is_some() {
                    return Err(ShimError::DuplicateDebugServer(uri));
                }
                debug_server = Some(server);
            }
        }

        plugins.add(registration.plugin_type, &registration.id, instance)?;
    }

    if services.is_empty() {
        return Err(ShimError::ServiceDiscovery);
    }

    Ok(Composition {
        plugins,
        services,
        interceptors,
        debug_server,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{CallInfo, MethodHandler, Next, Status};
    use std::sync::Mutex;

    struct Marker(&'static str);
    impl Plugin for Marker {}

    struct Service;

    #[async_trait]
    impl MethodHandler for Service {
        async fn handle(
            &self,
            _info: &CallInfo,
            payload: Vec<u8>,
        ) -> std::result::Result<Vec<u8>, Status> {
            Ok(payload)
        }
    }

    impl RpcService for Service {
        fn register(self: Arc<Self>, server: &mut RpcServer) -> Result<()> {
            server.register_service("svc", self)
        }
    }

    impl Plugin for Service {
        fn rpc_service(self: Arc<Self>) -> Option<Arc<dyn RpcService>> {
            Some(self)
        }
    }

    struct Intercept;

    #[async_trait]
    impl UnaryServerInterceptor for Intercept {
        async fn intercept(
            &self,
            info: &CallInfo,
            payload: Vec<u8>,
            next: Next<'_>,
        ) -> std::result::Result<Vec<u8>, Status> {
            next.run(info, payload).await
        }
    }

    impl Plugin for Intercept {
        fn unary_interceptor(self: Arc<Self>) -> Option<Arc<dyn UnaryServerInterceptor>> {
            Some(self)
        }
    }

    fn marker(plugin_type: PluginType, id: &'static str) -> Registration {
        Registration::new(plugin_type, id, move |_| Ok(Arc::new(Marker(id))))
    }

    fn shared(plugin_type: PluginType, id: &str, plugin: Arc<dyn Plugin>) -> Registration {
        Registration::new(plugin_type, id, move |_| Ok(Arc::clone(&plugin)))
    }

    fn ids(graph: &[&Registration]) -> Vec<String> {
        graph.iter().map(|r| r.id.clone()).collect()
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = Registry::new();
        registry.register(marker(PluginType::EVENT, "publisher")).unwrap();
        registry.register(marker(PluginType::INTERNAL, "publisher")).unwrap();
        let err = registry.register(marker(PluginType::EVENT, "publisher")).unwrap_err();
        match err {
            ShimError::DuplicatePlugin(uri) => assert_eq!(uri, "shim.event.v1.publisher"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_merge_keeps_order_and_rejects_duplicates() {
        let mut builtins = Registry::new();
        builtins.register(marker(PluginType::INTERNAL, "shutdown")).unwrap();

        let mut extra = Registry::new();
        extra.register(marker(PluginType::TTRPC, "task")).unwrap();
        builtins.merge(extra).unwrap();
        assert_eq!(ids(&builtins.graph(|_| false)), vec!["shutdown", "task"]);

        let mut clash = Registry::new();
        clash.register(marker(PluginType::INTERNAL, "shutdown")).unwrap();
        assert!(matches!(builtins.merge(clash), Err(ShimError::DuplicatePlugin(_))));
    }

    #[test]
    fn test_graph_places_requirements_first() {
        let mut registry = Registry::new();
        registry
            .register(marker(PluginType::TTRPC, "task").requires(PluginType::EVENT))
            .unwrap();
        registry.register(marker(PluginType::INTERNAL, "shutdown")).unwrap();
        registry.register(marker(PluginType::EVENT, "publisher")).unwrap();

        assert_eq!(ids(&registry.graph(|_| false)), vec!["publisher", "task", "shutdown"]);
        // stable across calls
        assert_eq!(ids(&registry.graph(|_| false)), vec!["publisher", "task", "shutdown"]);
    }

    #[test]
    fn test_graph_breaks_cycles_and_filters() {
        let mut registry = Registry::new();
        registry
            .register(marker(PluginType::TTRPC, "a").requires(PluginType::EVENT))
            .unwrap();
        registry
            .register(marker(PluginType::EVENT, "b").requires(PluginType::TTRPC))
            .unwrap();
        registry.register(marker(PluginType::INTERNAL, "c")).unwrap();

        assert_eq!(ids(&registry.graph(|_| false)), vec!["b", "a", "c"]);
        assert_eq!(ids(&registry.graph(|r| r.id == "c")), vec!["b", "a"]);
    }

    #[test]
    fn test_load_collects_capabilities_and_skips() {
        let shutdown = ShutdownService::new();
        let mut registry = Registry::new();
        registry.register(marker(PluginType::INTERNAL, "plain")).unwrap();
        registry
            .register(shared(PluginType::TTRPC, "svc", Arc::new(Service)))
            .unwrap();
        registry
            .register(shared(PluginType::TTRPC, "intercept", Arc::new(Intercept)))
            .unwrap();
        registry
            .register(Registration::new(PluginType::TTRPC, "optional", |_| {
                Err(PluginError::Skip("not configured".into()))
            }))
            .unwrap();

        let composition = load(&registry, &PluginProperties::default(), &shutdown).unwrap();
        assert_eq!(composition.plugins.len(), 3);
        assert_eq!(composition.services.len(), 1);
        assert_eq!(composition.interceptors.len(), 1);
        assert!(composition.debug_server.is_none());
        assert!(composition.plugins.get_by_id(PluginType::TTRPC, "optional").is_none());
    }

    struct DebugPlugin;

    #[async_trait]
    impl DebugServer for DebugPlugin {
        async fn serve(&self, _listener: UnixListener, _shutdown: CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    impl Plugin for DebugPlugin {
        fn debug_server(self: Arc<Self>) -> Option<Arc<dyn DebugServer>> {
            Some(self)
        }
    }

    #[test]
    fn test_load_rejects_second_debug_server() {
        let shutdown = ShutdownService::new();
        let mut registry = Registry::new();
        registry
            .register(shared(PluginType::TTRPC, "svc", Arc::new(Service)))
            .unwrap();
        registry
            .register(shared(PluginType::DEBUG, DEBUG_PLUGIN_ID, Arc::new(DebugPlugin)))
            .unwrap();

        let composition = load(&registry, &PluginProperties::default(), &shutdown).unwrap();
        assert!(composition.debug_server.is_some());

        registry
            .register(shared(PluginType::INTERNAL, DEBUG_PLUGIN_ID, Arc::new(DebugPlugin)))
            .unwrap();
        let err = load(&registry, &PluginProperties::default(), &shutdown).unwrap_err();
        match err {
            ShimError::DuplicateDebugServer(uri) => assert_eq!(uri, "shim.internal.v1.debug"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_without_services_fails() {
        let shutdown = ShutdownService::new();
        let mut registry = Registry::new();
        registry.register(marker(PluginType::INTERNAL, "plain")).unwrap();

        let err = load(&registry, &PluginProperties::default(), &shutdown).unwrap_err();
        assert!(matches!(err, ShimError::ServiceDiscovery));
    }

    #[test]
    fn test_load_aborts_on_init_failure() {
        let shutdown = ShutdownService::new();
        let mut registry = Registry::new();
        registry
            .register(shared(PluginType::TTRPC, "svc", Arc::new(Service)))
            .unwrap();
        registry
            .register(Registration::new(PluginType::TTRPC, "broken", |_| {
                Err(anyhow::anyhow!("no state dir").into())
            }))
            .unwrap();

        let err = load(&registry, &PluginProperties::default(), &shutdown).unwrap_err();
        match err {
            ShimError::PluginInit { uri, .. } => assert_eq!(uri, "shim.ttrpc.v1.broken"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_init_context_properties() {
        let shutdown = ShutdownService::new();
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);

        let mut registry = Registry::new();
        registry
            .register(Registration::new(PluginType::TTRPC, "svc", move |ic| {
                let marker = ic.get::<Marker>(PluginType::INTERNAL, "plain").map(|m| m.0);
                let ttrpc = ic.ttrpc_address().to_string();
                *record.lock().unwrap() = Some((ic.state_dir(), ttrpc, marker));
                Ok(Arc::new(Service))
            }))
            .unwrap();
        registry.register(marker(PluginType::INTERNAL, "plain")).unwrap();

        let properties = PluginProperties {
            bundle: PathBuf::from("/run/bundle"),
            grpc_address: "/run/containerd.sock".into(),
            ttrpc_address: "/run/containerd.sock.ttrpc".into(),
        };

        // "plain" is declared after "svc" so it is not visible yet.
        load(&registry, &properties, &shutdown).unwrap();
        let (state_dir, ttrpc, marker_id) = seen.lock().unwrap().take().unwrap();
        assert_eq!(state_dir, PathBuf::from("/run/bundle/shim.ttrpc.v1.svc"));
        assert_eq!(ttrpc, "/run/containerd.sock.ttrpc");
        assert_eq!(marker_id, None);
    }

    #[test]
    fn test_typed_lookup_after_requirement() {
        let shutdown = ShutdownService::new();
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);

        let mut registry = Registry::new();
        registry
            .register(
                Registration::new(PluginType::TTRPC, "svc", move |ic| {
                    let marker = ic.get::<Marker>(PluginType::INTERNAL, "plain");
                    *record.lock().unwrap() = marker.map(|m| m.0);
                    Ok(Arc::new(Service))
                })
                .requires(PluginType::INTERNAL),
            )
            .unwrap();
        registry.register(marker(PluginType::INTERNAL, "plain")).unwrap();

        load(&registry, &PluginProperties::default(), &shutdown).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some("plain"));
    }
}
