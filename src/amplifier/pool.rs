use super::{config::MAX_POOL_SIZE, stats::AmplifierStats, types::CallFuture};
use crate::error::PoolError;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Semaphore},
    task::{JoinError, JoinHandle, JoinSet},
    time::timeout,
};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long a force-stopped dispatcher gets to abort its tasks before the
/// dispatcher itself is aborted.
pub const FORCE_STOP_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub finished: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub pool_id: u64,
    /// False when another caller had already drained the pool.
    pub drained_now: bool,
    pub forced: bool,
    pub outcome: DispatchOutcome,
}

/// Bounded executor for synthetic calls. At most `size` calls run at once;
/// the rest wait in the queue. Never resized: reconfiguration installs a new
/// pool and drains this one.
#[derive(Debug)]
pub struct WorkerPool {
    id: u64,
    size: usize,
    queue: Mutex<Option<mpsc::UnboundedSender<CallFuture>>>,
    dispatcher: Mutex<Option<JoinHandle<DispatchOutcome>>>,
    force_stop: CancellationToken,
}

impl WorkerPool {
    /// Spawns the dispatcher; must be called inside a Tokio runtime.
    /// `force_stop` is usually a child of the owner's shutdown token.
    pub(crate) fn start(
        id: u64,
        size: usize,
        force_stop: CancellationToken,
        stats: Arc<AmplifierStats>,
    ) -> Self {
        let size = size.clamp(1, MAX_POOL_SIZE);
        let (sender, receiver) = mpsc::unbounded_channel::<CallFuture>();
        let dispatcher = tokio::spawn(dispatcher_task(
            id,
            size,
            UnboundedReceiverStream::new(receiver),
            force_stop.clone(),
            stats,
        ));

        Self {
            id,
            size,
            queue: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
            force_stop,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().is_none()
    }

    pub fn submit(&self, call: CallFuture) -> Result<(), PoolError> {
        let queue = self.queue.lock();
        match queue.as_ref() {
            Some(sender) => sender
                .send(call)
                .map_err(|_| PoolError::Closed { pool_id: self.id }),
            None => Err(PoolError::Closed { pool_id: self.id }),
        }
    }

    /// Stops accepting submissions. Returns false if already closed.
    pub fn close(&self) -> bool {
        self.queue.lock().take().is_some()
    }

    /// Closes the pool and waits up to `grace` for queued and running calls,
    /// then force-cancels whatever is left.
    #[instrument(name = "pool_drain", level = "debug", skip_all, fields(pool_id = self.id, grace_ms = grace.as_millis()))]
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        self.close();

        let handle = self.dispatcher.lock().take();
        let Some(mut handle) = handle else {
            debug!("pool already drained");
            return DrainReport {
                pool_id: self.id,
                drained_now: false,
                forced: false,
                outcome: DispatchOutcome::default(),
            };
        };

        if let Ok(joined) = timeout(grace, &mut handle).await {
            let outcome = self.dispatcher_outcome(joined);
            info!(finished = outcome.finished, "worker pool drained");
            return DrainReport {
                pool_id: self.id,
                drained_now: true,
                forced: false,
                outcome,
            };
        }

        warn!("drain grace period expired, force-cancelling remaining calls");
        self.force_stop.cancel();
        let outcome = match timeout(FORCE_STOP_TIMEOUT, &mut handle).await {
            Ok(joined) => self.dispatcher_outcome(joined),
            Err(_) => {
                error!("dispatcher did not stop in time, aborting it");
                handle.abort();
                DispatchOutcome::default()
            }
        };
        info!(
            finished = outcome.finished,
            cancelled = outcome.cancelled,
            "worker pool force-stopped"
        );

        DrainReport {
            pool_id: self.id,
            drained_now: true,
            forced: true,
            outcome,
        }
    }

    fn dispatcher_outcome(&self, joined: Result<DispatchOutcome, JoinError>) -> DispatchOutcome {
        joined.unwrap_or_else(|err| {
            error!(pool_id = self.id, error = %err, "pool dispatcher task failed");
            DispatchOutcome::default()
        })
    }
}

#[instrument(
    name = "worker_pool",
    level = "debug",
    skip_all,
    fields(pool_id = id, pool_size = size)
)]
async fn dispatcher_task(
    id: u64,
    size: usize,
    mut queue: UnboundedReceiverStream<CallFuture>,
    force_stop: CancellationToken,
    stats: Arc<AmplifierStats>,
) -> DispatchOutcome {
    let slots = Arc::new(Semaphore::new(size));
    let mut running: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let mut accepting = true;
    let mut outcome = DispatchOutcome::default();

    loop {
        if !accepting && running.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            _ = force_stop.cancelled() => {
                outcome.cancelled += running.len() as u64;
                running.shutdown().await;
                break;
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                record_call(joined, &stats);
                outcome.finished += 1;
            }
            next = queue.next(), if accepting => match next {
                Some(call) => {
                    let slots = Arc::clone(&slots);
                    running.spawn(async move {
                        let _slot = slots.acquire_owned().await?;
                        call.await
                    });
                }
                None => {
                    accepting = false;
                    debug!(in_flight = running.len(), "queue closed, finishing in-flight calls");
                }
            },
        }
    }

    // calls still sitting in the channel never got a slot
    let mut receiver = queue.into_inner();
    receiver.close();
    while receiver.try_recv().is_ok() {
        outcome.cancelled += 1;
    }

    AmplifierStats::add(&stats.calls_cancelled, outcome.cancelled);
    debug!(
        finished = outcome.finished,
        cancelled = outcome.cancelled,
        "pool dispatcher stopped"
    );
    outcome
}

fn record_call(joined: Result<anyhow::Result<()>, JoinError>, stats: &AmplifierStats) {
    match joined {
        Ok(Ok(())) => AmplifierStats::bump(&stats.calls_succeeded),
        Ok(Err(err)) => {
            warn!(error = %err, "synthetic call failed");
            AmplifierStats::bump(&stats.calls_failed);
        }
        Err(err) if err.is_panic() => {
            error!("synthetic call panicked");
            AmplifierStats::bump(&stats.calls_panicked);
        }
        Err(_) => AmplifierStats::bump(&stats.calls_cancelled),
    }
}
