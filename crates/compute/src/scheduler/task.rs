use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use pulse_core::StoreError;

/// Error raised by a job handler during one cycle.
///
/// Never escapes the scheduler: the cycle is logged, counted, and retried
/// after the backoff.
#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("Collection failed: {0}")]
    Failed(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// One periodic unit of collection work.
///
/// Implementations must tolerate being invoked again after a failure; no
/// state is carried between cycles by the scheduler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self) -> Result<(), CollectionError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CollectionError>> + Send,
{
    async fn run(&self) -> Result<(), CollectionError> {
        (self.0)().await
    }
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CollectionError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct BlockingHandler<F>(Arc<F>);

#[async_trait]
impl<F> JobHandler for BlockingHandler<F>
where
    F: Fn() -> Result<(), CollectionError> + Send + Sync + 'static,
{
    async fn run(&self) -> Result<(), CollectionError> {
        let f = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || f())
            .await
            .map_err(|e| CollectionError::Panicked(e.to_string()))?
    }
}

/// Wrap a synchronous closure as a [`JobHandler`] run on the blocking pool.
pub fn blocking_fn<F>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn() -> Result<(), CollectionError> + Send + Sync + 'static,
{
    Arc::new(BlockingHandler(Arc::new(f)))
}
