//! Process-wide shutdown signal for one serving invocation.

use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::plugin::Plugin;
use crate::rpc::BoxFuture;

/// Work run once when the shim shuts down.
pub type ShutdownCallback = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Idempotent shutdown controller.
///
/// The first [`shutdown`](Self::shutdown) cancels the token and runs every
/// registered callback concurrently; [`done`](Self::done) resolves once they
/// have all finished.
pub struct ShutdownService {
    token: CancellationToken,
    finished: CancellationToken,
    callbacks: Mutex<Option<Vec<ShutdownCallback>>>,
}

impl ShutdownService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            finished: CancellationToken::new(),
            callbacks: Mutex::new(Some(Vec::new())),
        })
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Registers `callback` to run on shutdown. After shutdown it runs right away.
    pub fn register_callback<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: ShutdownCallback = Box::new(move || Box::pin(callback()));
        let mut pending = match self.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match pending.as_mut() {
            Some(list) => list.push(boxed),
            None => {
                drop(pending);
                tokio::spawn(async move {
                    if let Err(e) = boxed().await {
                        warn!("Shutdown callback failed: {:#}", e);
                    }
                });
            }
        }
    }

    /// Starts shutdown. Later calls are no-ops.
    pub fn shutdown(&self) {
        let callbacks = {
            let mut pending = match self.callbacks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match pending.take() {
                Some(callbacks) => callbacks,
                None => return,
            }
        };

        debug!(callbacks = callbacks.len(), "Shutting down");
        self.token.cancel();

        let finished = self.finished.clone();
        if callbacks.is_empty() {
            finished.cancel();
            return;
        }

        let mut set = JoinSet::new();
        for callback in callbacks {
            set.spawn(callback());
        }
        tokio::spawn(async move {
            while let Some(result) = set.join_next().await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Shutdown callback failed: {:#}", e),
                    Err(e) => warn!("Shutdown callback panicked: {}", e),
                }
            }
            finished.cancel();
        });
    }

    /// Resolves once shutdown has started.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Resolves once every callback registered before shutdown has finished.
    pub async fn done(&self) {
        self.finished.cancelled().await
    }
}

impl Plugin for ShutdownService {}
