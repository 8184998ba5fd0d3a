use std::sync::Arc;

use async_trait::async_trait;

use super::{BoxFuture, CallInfo, MethodHandler, Status};

/// Middleware invoked around every unary call.
///
/// Implementations call `next.run(info, payload)` to continue the chain, or
/// return early to short-circuit it.
#[async_trait]
pub trait UnaryServerInterceptor: Send + Sync {
    async fn intercept(
        &self,
        info: &CallInfo,
        payload: Vec<u8>,
        next: Next<'_>,
    ) -> Result<Vec<u8>, Status>;
}

/// The remainder of an interceptor chain.
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn UnaryServerInterceptor>],
    then: Then<'a>,
}

enum Then<'a> {
    Handler(&'a dyn MethodHandler),
    Next(Box<Next<'a>>),
}

impl<'a> Next<'a> {
    pub(crate) fn handler(handler: &'a dyn MethodHandler) -> Self {
        Self {
            interceptors: &[],
            then: Then::Handler(handler),
        }
    }

    pub fn run(
        self,
        info: &'a CallInfo,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<u8>, Status>> {
        Box::pin(async move {
            match self.interceptors.split_first() {
                Some((first, rest)) => {
                    let next = Next {
                        interceptors: rest,
                        then: self.then,
                    };
                    first.intercept(info, payload, next).await
                }
                None => match self.then {
                    Then::Handler(handler) => handler.handle(info, payload).await,
                    Then::Next(next) => next.run(info, payload).await,
                },
            }
        })
    }
}

struct ChainedInterceptor {
    interceptors: Vec<Arc<dyn UnaryServerInterceptor>>,
}

#[async_trait]
impl UnaryServerInterceptor for ChainedInterceptor {
    async fn intercept(
        &self,
        info: &CallInfo,
        payload: Vec<u8>,
        next: Next<'_>,
    ) -> Result<Vec<u8>, Status> {
        Next {
            interceptors: &self.interceptors,
            then: Then::Next(Box::new(next)),
        }
        .run(info, payload)
        .await
    }
}

/// Folds interceptors into one; the first one is the outermost.
pub fn chain_unary_interceptors(
    mut interceptors: Vec<Arc<dyn UnaryServerInterceptor>>,
) -> Option<Arc<dyn UnaryServerInterceptor>> {
    match interceptors.len() {
        0 => None,
        1 => interceptors.pop(),
        _ => Some(Arc::new(ChainedInterceptor { interceptors })),
    }
}
