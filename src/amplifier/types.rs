use super::pool::WorkerPool;
use std::{future::Future, pin::Pin, sync::Arc};

pub type CallFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// Replays the downstream call a primary request just made. The amplifier
/// never looks at the outcome beyond logging and counting it.
pub trait SyntheticCall: Send + Sync + 'static {
    fn invoke(&self) -> CallFuture;
}

impl<F, Fut> SyntheticCall for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn invoke(&self) -> CallFuture {
        Box::pin(self())
    }
}

pub(crate) type SharedCall = Arc<dyn SyntheticCall>;
pub(crate) type SharedPool = Arc<WorkerPool>;
