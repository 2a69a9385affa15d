mod config;
mod pool;
mod scheduler;
mod stats;
mod trigger;
mod types;

pub use crate::error::{ConfigError, PoolError};
pub use config::{
    derived_pool_size, Adjustment, BurstConfig, ConfigApplied, ConfigUpdate, MAX_POOL_SIZE,
    MAX_REQUESTS_PER_SECOND,
};
pub use pool::{DispatchOutcome, DrainReport, WorkerPool, FORCE_STOP_TIMEOUT};
pub use scheduler::{WaveEnd, WaveFinished, WaveHandle, WaveOutcome};
pub use stats::StatsSnapshot;
pub use trigger::{TriggerDecision, TriggerEvaluator, TriggerPolicy, TriggerState};
pub use types::{CallFuture, SyntheticCall};

use crate::{clock::Clock, settings::AmplifierSettings};
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, instrument, warn};

use scheduler::WaveLaunch;
use stats::AmplifierStats;
use types::{SharedCall, SharedPool};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub already_shut_down: bool,
    pub wave_cancelled: bool,
    pub pool: Option<DrainReport>,
    pub retirements_forced: bool,
}

impl ShutdownReport {
    pub fn forced(&self) -> bool {
        self.retirements_forced || self.pool.is_some_and(|report| report.forced)
    }
}

/// Load amplifier embedded in a service. After each successful primary
/// request the host calls [`BurstAmplifier::on_request_completed`]; at most
/// one wave of synthetic calls runs at a time, off the request path.
///
/// Construct it inside a Tokio runtime: the worker pool dispatcher is
/// spawned immediately.
pub struct BurstAmplifier {
    service: String,
    clock: Arc<dyn Clock>,
    evaluator: TriggerEvaluator,
    config: RwLock<Arc<BurstConfig>>,
    pool: RwLock<SharedPool>,
    // also serializes wave launch against pool swaps
    wave: Mutex<Option<WaveHandle>>,
    retirements: TaskTracker,
    closing: CancellationToken,
    force: CancellationToken,
    shut_down: AtomicBool,
    next_wave_id: AtomicU64,
    next_pool_id: AtomicU64,
    retire_grace: Duration,
    stats: Arc<AmplifierStats>,
}

impl BurstAmplifier {
    pub fn new(settings: &AmplifierSettings, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        settings.policy.validate()?;
        let applied = settings.burst.validate()?;
        for adjustment in &applied.adjustments {
            warn!(service = %settings.service, ?adjustment, "burst config value clamped");
        }

        let stats = Arc::new(AmplifierStats::default());
        let force = CancellationToken::new();
        let pool = Arc::new(WorkerPool::start(
            1,
            applied.config.pool_size,
            force.child_token(),
            Arc::clone(&stats),
        ));

        info!(
            service = %settings.service,
            policy = ?settings.policy,
            cooldown_secs = applied.config.cooldown_secs,
            requests_per_second = applied.config.requests_per_second,
            duration_secs = applied.config.burst_duration_secs,
            pool_size = applied.config.pool_size,
            "initialised burst amplifier"
        );

        Ok(Self {
            service: settings.service.clone(),
            clock,
            evaluator: TriggerEvaluator::new(settings.policy, Arc::new(TriggerState::new())),
            config: RwLock::new(Arc::new(applied.config)),
            pool: RwLock::new(pool),
            wave: Mutex::new(None),
            retirements: TaskTracker::new(),
            closing: CancellationToken::new(),
            force,
            shut_down: AtomicBool::new(false),
            next_wave_id: AtomicU64::new(1),
            next_pool_id: AtomicU64::new(2),
            retire_grace: settings.retire_grace(),
            stats,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> Arc<BurstConfig> {
        Arc::clone(&self.config.read())
    }

    pub fn policy(&self) -> TriggerPolicy {
        self.evaluator.policy()
    }

    pub fn is_wave_active(&self) -> bool {
        self.evaluator.state().is_active()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.read().size()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Called once per successful primary request with a replay of the
    /// downstream call it made. Never blocks: a grant only spawns the wave.
    pub fn on_request_completed(&self, call: impl SyntheticCall) -> TriggerDecision {
        if self.closing.is_cancelled() {
            return TriggerDecision::ShutDown;
        }

        let config = self.config();
        let decision = self
            .evaluator
            .should_trigger(self.clock.now_secs(), &config);

        match decision {
            TriggerDecision::Granted { since_last_secs } => {
                info!(
                    service = %self.service,
                    since_last_secs = ?since_last_secs,
                    "triggering new burst wave"
                );
                self.launch_wave(Arc::new(call));
            }
            TriggerDecision::Cooldown { remaining_secs } => {
                AmplifierStats::bump(&self.stats.triggers_denied);
                debug!(
                    service = %self.service,
                    remaining_secs,
                    "skipping burst, cooldown in progress"
                );
            }
            other => {
                AmplifierStats::bump(&self.stats.triggers_denied);
                debug!(service = %self.service, decision = ?other, "skipping burst");
            }
        }

        decision
    }

    fn launch_wave(&self, call: SharedCall) {
        let mut slot = self.wave.lock();
        let launch = WaveLaunch {
            id: self.next_wave_id.fetch_add(1, Ordering::Relaxed),
            config: self.config(),
            pool: Arc::clone(&self.pool.read()),
            call,
            state: Arc::clone(self.evaluator.state()),
            stats: Arc::clone(&self.stats),
        };
        // any previous handle belongs to a wave that already released the flag
        *slot = Some(scheduler::start_wave(launch, self.closing.child_token()));
    }

    /// Validates and installs new burst parameters. The running wave keeps
    /// its own config and pool; the replaced pool is drained in the
    /// background once that wave is done.
    pub fn apply_config(&self, update: ConfigUpdate) -> Result<ConfigApplied, ConfigError> {
        let applied = update.validate().inspect_err(|err| {
            warn!(service = %self.service, error = %err, "rejected burst config update");
        })?;
        for adjustment in &applied.adjustments {
            warn!(service = %self.service, ?adjustment, "burst config value clamped");
        }

        let config = Arc::new(applied.config.clone());
        let slot = self.wave.lock();
        if self.closing.is_cancelled() {
            *self.config.write() = config;
            debug!(service = %self.service, "amplifier shut down, config stored without a new pool");
            return Ok(applied);
        }

        let new_pool = Arc::new(WorkerPool::start(
            self.next_pool_id.fetch_add(1, Ordering::Relaxed),
            config.pool_size,
            self.force.child_token(),
            Arc::clone(&self.stats),
        ));
        let new_pool_id = new_pool.id();
        *self.config.write() = config;
        let old_pool = std::mem::replace(&mut *self.pool.write(), new_pool);
        let wave_on_old_pool = slot
            .as_ref()
            .filter(|wave| wave.pool_id() == old_pool.id() && !wave.is_finished())
            .map(WaveHandle::finished);
        drop(slot);

        info!(
            service = %self.service,
            cooldown_secs = applied.config.cooldown_secs,
            requests_per_second = applied.config.requests_per_second,
            duration_secs = applied.config.burst_duration_secs,
            pool_size = applied.config.pool_size,
            pool_id = new_pool_id,
            retired_pool_id = old_pool.id(),
            waits_for_wave = wave_on_old_pool.is_some(),
            "updated burst parameters"
        );

        self.retirements.spawn(retire_pool(
            old_pool,
            wave_on_old_pool,
            self.retire_grace,
            Arc::clone(&self.stats),
        ));

        Ok(applied)
    }

    /// Cancels the active wave and drains the pools, waiting at most
    /// `grace` before force-cancelling. Idempotent; never fails.
    #[instrument(name = "amplifier_shutdown", level = "debug", skip_all, fields(service = %self.service, grace_ms = grace.as_millis()))]
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            debug!("burst amplifier already shut down");
            return ShutdownReport {
                already_shut_down: true,
                ..ShutdownReport::default()
            };
        }

        info!("shutting down burst amplifier");
        let deadline = Instant::now() + grace;
        let mut report = ShutdownReport::default();

        self.closing.cancel();
        let (wave, pool) = {
            let mut slot = self.wave.lock();
            (slot.take(), Arc::clone(&self.pool.read()))
        };

        if let Some(wave) = wave {
            report.wave_cancelled = !wave.is_finished();
            wave.cancel();
            if timeout_at(deadline, wave.finished().wait()).await.is_err() {
                warn!(wave_id = wave.id(), "burst wave did not stop before deadline, aborting");
                wave.abort();
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        report.pool = Some(pool.drain(remaining).await);

        self.retirements.close();
        if timeout_at(deadline, self.retirements.wait()).await.is_err() {
            warn!(
                pending = self.retirements.len(),
                "pool retirements still running at deadline, forcing"
            );
            report.retirements_forced = true;
        }

        self.force.cancel();
        if report.retirements_forced
            && timeout(FORCE_STOP_TIMEOUT, self.retirements.wait())
                .await
                .is_err()
        {
            warn!("pool retirements did not stop after force");
        }

        let snapshot = self.stats.snapshot();
        info!(
            wave_cancelled = report.wave_cancelled,
            forced = report.forced(),
            waves_started = snapshot.waves_started,
            calls_submitted = snapshot.calls_submitted,
            calls_succeeded = snapshot.calls_succeeded,
            calls_failed = snapshot.calls_failed,
            calls_cancelled = snapshot.calls_cancelled,
            calls_finished = snapshot.calls_finished(),
            "burst amplifier shut down"
        );

        report
    }
}

impl Drop for BurstAmplifier {
    fn drop(&mut self) {
        self.closing.cancel();
        self.force.cancel();
    }
}

#[instrument(name = "pool_retirement", level = "debug", skip_all, fields(pool_id = pool.id()))]
async fn retire_pool(
    pool: SharedPool,
    wave: Option<WaveFinished>,
    grace: Duration,
    stats: Arc<AmplifierStats>,
) {
    if let Some(wave) = wave {
        debug!("waiting for in-flight wave before draining retired pool");
        wave.wait().await;
    }

    let report = pool.drain(grace).await;
    AmplifierStats::bump(&stats.pools_retired);
    info!(
        forced = report.forced,
        finished = report.outcome.finished,
        cancelled = report.outcome.cancelled,
        "retired worker pool"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MonotonicClock};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn settings(cooldown: i64, rate: i64, duration: i64) -> AmplifierSettings {
        AmplifierSettings {
            service: "ts-travel-service".into(),
            burst: ConfigUpdate {
                cooldown_secs: cooldown,
                requests_per_second: rate,
                burst_duration_secs: duration,
                pool_size: None,
            },
            retire_grace_ms: 1_000,
            ..AmplifierSettings::default()
        }
    }

    fn amplifier(settings: &AmplifierSettings) -> BurstAmplifier {
        BurstAmplifier::new(settings, Arc::new(MonotonicClock::new())).expect("valid settings")
    }

    fn counting_call(counter: &Arc<AtomicUsize>) -> impl SyntheticCall {
        let counter = Arc::clone(counter);
        move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        }
    }

    fn stuck_call() -> impl SyntheticCall {
        || async {
            sleep(Duration::from_secs(3_600)).await;
            Ok::<(), anyhow::Error>(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_concurrent_request_starts_a_wave() {
        let amplifier = Arc::new(
            BurstAmplifier::new(&settings(60, 1, 1), Arc::new(ManualClock::new(1_000)))
                .expect("valid settings"),
        );
        let barrier = Arc::new(tokio::sync::Barrier::new(64));
        let calls = Arc::new(AtomicUsize::new(0));

        let requests: Vec<_> = (0..64)
            .map(|_| {
                let amplifier = Arc::clone(&amplifier);
                let barrier = Arc::clone(&barrier);
                let call = counting_call(&calls);
                tokio::spawn(async move {
                    barrier.wait().await;
                    amplifier.on_request_completed(call).is_granted()
                })
            })
            .collect();

        let mut granted = 0;
        for request in requests {
            if request.await.expect("request task") {
                granted += 1;
            }
        }

        assert_eq!(granted, 1);
        let snapshot = amplifier.stats();
        assert_eq!(snapshot.waves_started, 1);
        assert_eq!(snapshot.triggers_denied, 63);

        amplifier.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn sixty_second_cooldown_scenario() {
        let amplifier = amplifier(&settings(60, 5, 10));
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(amplifier.on_request_completed(counting_call(&calls)).is_granted());
        assert!(amplifier.is_wave_active());

        sleep(Duration::from_millis(10_500)).await;
        assert!(!amplifier.is_wave_active());
        assert_eq!(calls.load(Ordering::SeqCst), 50);
        assert_eq!(amplifier.stats().calls_submitted, 50);

        for _ in 0..49 {
            let decision = amplifier.on_request_completed(counting_call(&calls));
            assert!(matches!(decision, TriggerDecision::Cooldown { .. }));
            sleep(Duration::from_secs(1)).await;
        }

        // t = 59.5
        assert!(!amplifier.on_request_completed(counting_call(&calls)).is_granted());
        sleep(Duration::from_millis(500)).await;

        let granted = (0..16)
            .filter(|_| amplifier.on_request_completed(counting_call(&calls)).is_granted())
            .count();
        assert_eq!(granted, 1);

        amplifier.shutdown(Duration::from_secs(1)).await;
        assert_eq!(amplifier.stats().waves_started, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waves_never_overlap() {
        let amplifier = amplifier(&settings(0, 2, 5));
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(amplifier.on_request_completed(counting_call(&calls)).is_granted());
        for _ in 0..4 {
            sleep(Duration::from_secs(1)).await;
            assert_eq!(
                amplifier.on_request_completed(counting_call(&calls)),
                TriggerDecision::WaveActive
            );
        }

        sleep(Duration::from_millis(1_500)).await;
        assert!(!amplifier.is_wave_active());
        assert!(amplifier.on_request_completed(counting_call(&calls)).is_granted());

        sleep(Duration::from_secs(6)).await;
        let snapshot = amplifier.stats();
        assert_eq!(snapshot.waves_started, 2);
        assert_eq!(snapshot.waves_completed, 2);
        assert_eq!(snapshot.calls_submitted, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_hands_off_without_doing_wave_work() {
        let amplifier = amplifier(&settings(60, 10_000, 10_000));
        let calls = Arc::new(AtomicUsize::new(0));

        let started = std::time::Instant::now();
        let decision = amplifier.on_request_completed(counting_call(&calls));
        let elapsed = started.elapsed();

        assert!(decision.is_granted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(amplifier.stats().calls_submitted, 0);
        assert!(elapsed < std::time::Duration::from_millis(50));

        // cancelled before its first poll, the wave emits nothing
        let report = amplifier.shutdown(Duration::from_millis(100)).await;
        assert!(report.wave_cancelled);
        assert_eq!(amplifier.stats().calls_submitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconfiguring_mid_wave_keeps_the_running_wave_intact() {
        let amplifier = amplifier(&settings(0, 2, 4));
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(amplifier.on_request_completed(counting_call(&calls)).is_granted());
        sleep(Duration::from_millis(1_500)).await;

        let applied = amplifier
            .apply_config(ConfigUpdate {
                cooldown_secs: 0,
                requests_per_second: 3,
                burst_duration_secs: 4,
                pool_size: Some(7),
            })
            .expect("valid update");
        assert!(applied.adjustments.is_empty());
        assert_eq!(amplifier.pool_size(), 7);
        assert!(amplifier.is_wave_active());

        sleep(Duration::from_secs(3)).await;
        assert!(!amplifier.is_wave_active());
        let first_wave = amplifier.stats();
        assert_eq!(first_wave.calls_submitted, 8);
        assert_eq!(first_wave.calls_rejected, 0);
        assert_eq!(first_wave.waves_cancelled, 0);
        assert_eq!(first_wave.pools_retired, 1);

        assert!(amplifier.on_request_completed(counting_call(&calls)).is_granted());
        sleep(Duration::from_millis(4_500)).await;

        let snapshot = amplifier.stats();
        assert_eq!(snapshot.calls_submitted, 8 + 12);
        assert_eq!(snapshot.calls_rejected, 0);
        assert_eq!(snapshot.calls_succeeded, 20);
        assert_eq!(calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_reconfiguration_retires_old_pool_immediately() {
        let amplifier = amplifier(&settings(60, 5, 10));
        assert_eq!(amplifier.pool_size(), 10);

        amplifier
            .apply_config(ConfigUpdate {
                cooldown_secs: 30,
                requests_per_second: 2,
                burst_duration_secs: 3,
                pool_size: None,
            })
            .expect("valid update");
        sleep(Duration::from_millis(10)).await;

        assert_eq!(amplifier.pool_size(), 4);
        assert_eq!(amplifier.config().cooldown_secs, 30);
        assert_eq!(amplifier.stats().pools_retired, 1);
    }

    #[tokio::test]
    async fn rejected_update_leaves_config_untouched() {
        let amplifier = amplifier(&settings(60, 5, 10));
        let before = amplifier.config();

        let err = amplifier
            .apply_config(ConfigUpdate {
                cooldown_secs: 60,
                requests_per_second: -3,
                burst_duration_secs: 10,
                pool_size: None,
            })
            .expect_err("negative rate is rejected");

        assert!(matches!(err, ConfigError::Negative { .. }));
        assert_eq!(*amplifier.config(), *before);
        assert_eq!(amplifier.pool_size(), 10);
    }

    #[tokio::test]
    async fn zero_rate_update_is_clamped() {
        let amplifier = amplifier(&settings(60, 5, 10));
        let applied = amplifier
            .apply_config(ConfigUpdate {
                cooldown_secs: 60,
                requests_per_second: 0,
                burst_duration_secs: 10,
                pool_size: None,
            })
            .expect("zero rate is clamped");

        assert_eq!(applied.adjustments.len(), 1);
        assert_eq!(amplifier.config().requests_per_second, 1);
        assert_eq!(amplifier.pool_size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_synthetic_calls_stay_in_the_amplifier() {
        let amplifier = amplifier(&settings(60, 3, 2));

        let decision = amplifier.on_request_completed(|| async {
            Err::<(), _>(anyhow::anyhow!("order service timed out"))
        });
        assert!(decision.is_granted());

        sleep(Duration::from_millis(2_500)).await;
        let report = amplifier.shutdown(Duration::from_secs(1)).await;
        assert!(!report.forced());

        let snapshot = amplifier.stats();
        assert_eq!(snapshot.calls_submitted, 6);
        assert_eq!(snapshot.calls_failed, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_synthetic_calls_do_not_stop_later_waves() {
        let amplifier = amplifier(&settings(0, 2, 1));

        let decision = amplifier.on_request_completed(|| async {
            if true {
                panic!("synthetic replay blew up");
            }
            Ok::<(), anyhow::Error>(())
        });
        assert!(decision.is_granted());
        sleep(Duration::from_millis(1_500)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        assert!(amplifier.on_request_completed(counting_call(&calls)).is_granted());
        sleep(Duration::from_millis(1_500)).await;

        let snapshot = amplifier.stats();
        assert_eq!(snapshot.calls_panicked, 2);
        assert_eq!(snapshot.calls_succeeded, 2);
        assert_eq!(snapshot.calls_finished(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_with_active_wave_respects_grace() {
        let amplifier = amplifier(&settings(60, 2, 100));
        assert!(amplifier.on_request_completed(stuck_call()).is_granted());
        sleep(Duration::from_millis(2_500)).await;

        let grace = Duration::from_secs(1);
        let started = Instant::now();
        let report = amplifier.shutdown(grace).await;

        assert!(started.elapsed() <= grace + FORCE_STOP_TIMEOUT * 2);
        assert!(!report.already_shut_down);
        assert!(report.wave_cancelled);
        assert!(report.forced());
        assert!(!amplifier.is_wave_active());

        let snapshot = amplifier.stats();
        assert_eq!(snapshot.waves_cancelled, 1);
        assert_eq!(snapshot.calls_submitted, 6);
        assert_eq!(snapshot.calls_cancelled, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_closes_the_trigger() {
        let amplifier = amplifier(&settings(60, 1, 1));

        let first = amplifier.shutdown(Duration::from_secs(1)).await;
        assert!(!first.already_shut_down);
        assert!(!first.wave_cancelled);
        assert!(!first.forced());

        let second = amplifier.shutdown(Duration::from_secs(1)).await;
        assert!(second.already_shut_down);

        let calls = Arc::new(AtomicUsize::new(0));
        assert_eq!(
            amplifier.on_request_completed(counting_call(&calls)),
            TriggerDecision::ShutDown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_bounds_pending_retirements() {
        let amplifier = amplifier(&settings(0, 2, 50));
        assert!(amplifier.on_request_completed(stuck_call()).is_granted());
        sleep(Duration::from_millis(1_500)).await;

        amplifier
            .apply_config(ConfigUpdate {
                cooldown_secs: 0,
                requests_per_second: 1,
                burst_duration_secs: 1,
                pool_size: None,
            })
            .expect("valid update");

        let grace = Duration::from_millis(500);
        let started = Instant::now();
        let report = amplifier.shutdown(grace).await;

        assert!(started.elapsed() <= grace + FORCE_STOP_TIMEOUT * 2);
        assert!(report.wave_cancelled);
        assert!(report.retirements_forced);
        assert!(!amplifier.is_wave_active());
    }

    #[tokio::test]
    async fn invalid_policy_is_rejected_at_construction() {
        let settings = AmplifierSettings {
            policy: TriggerPolicy::CounterModulo { threshold: 0 },
            ..AmplifierSettings::default()
        };
        let result = BurstAmplifier::new(&settings, Arc::new(MonotonicClock::new()));
        assert!(matches!(
            result,
            Err(ConfigError::ZeroPolicyParameter { .. })
        ));
    }
}
