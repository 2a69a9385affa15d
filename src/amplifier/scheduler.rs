use super::{
    config::BurstConfig,
    stats::AmplifierStats,
    trigger::TriggerState,
    types::{SharedCall, SharedPool},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const EMISSION_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveEnd {
    Elapsed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveOutcome {
    pub wave_id: u64,
    pub batches: u64,
    pub submitted: u64,
    pub rejected: u64,
    pub end: WaveEnd,
}

/// Everything a wave captures when it is granted. Later config or pool
/// swaps do not reach a running wave.
pub(crate) struct WaveLaunch {
    pub id: u64,
    pub config: Arc<BurstConfig>,
    pub pool: SharedPool,
    pub call: SharedCall,
    pub state: Arc<TriggerState>,
    pub stats: Arc<AmplifierStats>,
}

/// Clears the active flag and signals completion however the wave task
/// exits, including being aborted before its first poll.
struct ActiveWaveGuard {
    state: Arc<TriggerState>,
    finished: watch::Sender<bool>,
}

impl Drop for ActiveWaveGuard {
    fn drop(&mut self) {
        self.state.release();
        self.finished.send_replace(true);
    }
}

/// Resolves once the wave it was taken from has ended.
#[derive(Debug, Clone)]
pub struct WaveFinished(watch::Receiver<bool>);

impl WaveFinished {
    pub async fn wait(mut self) {
        // a dropped sender also means the wave is gone
        let _ = self.0.wait_for(|finished| *finished).await;
    }

    pub fn is_finished(&self) -> bool {
        *self.0.borrow()
    }
}

#[derive(Debug)]
pub struct WaveHandle {
    id: u64,
    pool_id: u64,
    cancel: CancellationToken,
    finished: WaveFinished,
    task: JoinHandle<WaveOutcome>,
}

impl WaveHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Stops further emissions. Safe to call any number of times, before or
    /// after the wave ended on its own.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_finished()
    }

    pub fn finished(&self) -> WaveFinished {
        self.finished.clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub async fn join(self) -> Option<WaveOutcome> {
        match self.task.await {
            Ok(outcome) => Some(outcome),
            Err(err) if err.is_cancelled() => {
                debug!(wave_id = self.id, "burst wave task aborted");
                None
            }
            Err(err) => {
                error!(wave_id = self.id, error = %err, "burst wave task failed");
                None
            }
        }
    }
}

/// Spawns the wave. The caller must own the active flag (a granted trigger);
/// the wave releases it when it ends.
pub(crate) fn start_wave(launch: WaveLaunch, cancel: CancellationToken) -> WaveHandle {
    let (finished_tx, finished_rx) = watch::channel(false);
    let guard = ActiveWaveGuard {
        state: Arc::clone(&launch.state),
        finished: finished_tx,
    };
    let id = launch.id;
    let pool_id = launch.pool.id();

    AmplifierStats::bump(&launch.stats.waves_started);
    let task = tokio::spawn(wave_task(launch, cancel.clone(), guard));

    WaveHandle {
        id,
        pool_id,
        cancel,
        finished: WaveFinished(finished_rx),
        task,
    }
}

#[instrument(
    name = "burst_wave",
    level = "debug",
    skip_all,
    fields(
        wave_id = launch.id,
        pool_id = launch.pool.id(),
        requests_per_second = launch.config.requests_per_second,
        duration_secs = launch.config.burst_duration_secs
    )
)]
async fn wave_task(
    launch: WaveLaunch,
    cancel: CancellationToken,
    _guard: ActiveWaveGuard,
) -> WaveOutcome {
    let WaveLaunch {
        id,
        config,
        pool,
        call,
        stats,
        ..
    } = launch;

    info!(
        requests_per_second = config.requests_per_second,
        duration_secs = config.burst_duration_secs,
        cooldown_secs = config.cooldown_secs,
        planned_calls = config.calls_per_wave(),
        "starting burst wave"
    );

    let mut ticks = time::interval(EMISSION_PERIOD);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = time::sleep(Duration::from_secs(u64::from(config.burst_duration_secs)));
    tokio::pin!(deadline);

    let mut outcome = WaveOutcome {
        wave_id: id,
        batches: 0,
        submitted: 0,
        rejected: 0,
        end: WaveEnd::Elapsed,
    };

    // the deadline is checked before the tick so a wave never emits a
    // batch at the instant it is due to end
    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break WaveEnd::Cancelled,
            _ = &mut deadline => break WaveEnd::Elapsed,
            _ = ticks.tick() => {
                emit_batch(&config, &pool, &call, &stats, &mut outcome);
            }
        }
    };
    outcome.end = end;

    match end {
        WaveEnd::Elapsed => {
            AmplifierStats::bump(&stats.waves_completed);
            info!(
                batches = outcome.batches,
                submitted = outcome.submitted,
                rejected = outcome.rejected,
                next_grant_in_secs = config.cooldown_secs,
                "burst wave completed"
            );
        }
        WaveEnd::Cancelled => {
            AmplifierStats::bump(&stats.waves_cancelled);
            info!(
                batches = outcome.batches,
                submitted = outcome.submitted,
                rejected = outcome.rejected,
                "burst wave cancelled"
            );
        }
    }

    outcome
}

fn emit_batch(
    config: &BurstConfig,
    pool: &SharedPool,
    call: &SharedCall,
    stats: &AmplifierStats,
    outcome: &mut WaveOutcome,
) {
    let mut submitted = 0u64;
    let mut rejected = 0u64;
    let mut last_error = None;

    for _ in 0..config.requests_per_second {
        match pool.submit(call.invoke()) {
            Ok(()) => submitted += 1,
            Err(err) => {
                rejected += 1;
                last_error = Some(err);
            }
        }
    }

    outcome.batches += 1;
    outcome.submitted += submitted;
    outcome.rejected += rejected;
    AmplifierStats::bump(&stats.batches_emitted);
    AmplifierStats::add(&stats.calls_submitted, submitted);
    AmplifierStats::add(&stats.calls_rejected, rejected);

    if let Some(err) = last_error {
        warn!(rejected, error = %err, "worker pool refused synthetic calls");
    } else {
        debug!(batch = outcome.batches, submitted, "emitted burst batch");
    }
}
