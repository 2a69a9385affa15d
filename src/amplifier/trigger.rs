use super::config::BurstConfig;
use crate::error::ConfigError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

const NEVER: u64 = u64::MAX;

/// How completed primary requests are turned into wave grants. One policy
/// per amplifier instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Grant once `cooldown_secs` have passed since the previous grant.
    #[default]
    ElapsedTime,
    /// Grant on every `threshold`-th completed request.
    CounterModulo { threshold: u64 },
    /// Grant when `threshold` requests completed within `window_secs`.
    SlidingWindow { window_secs: u64, threshold: usize },
}

impl TriggerPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            TriggerPolicy::ElapsedTime => Ok(()),
            TriggerPolicy::CounterModulo { threshold: 0 } => {
                Err(ConfigError::ZeroPolicyParameter {
                    policy: "counter_modulo",
                    field: "threshold",
                })
            }
            TriggerPolicy::SlidingWindow { threshold: 0, .. } => {
                Err(ConfigError::ZeroPolicyParameter {
                    policy: "sliding_window",
                    field: "threshold",
                })
            }
            TriggerPolicy::SlidingWindow { window_secs: 0, .. } => {
                Err(ConfigError::ZeroPolicyParameter {
                    policy: "sliding_window",
                    field: "window_secs",
                })
            }
            _ => Ok(()),
        }
    }
}

/// Scheduling metadata shared by every request path.
#[derive(Debug)]
pub struct TriggerState {
    last_burst_secs: AtomicU64,
    active: AtomicBool,
    requests: AtomicU64,
    window: Mutex<VecDeque<u64>>,
}

impl Default for TriggerState {
    fn default() -> Self {
        Self {
            last_burst_secs: AtomicU64::new(NEVER),
            active: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            window: Mutex::new(VecDeque::new()),
        }
    }
}

impl TriggerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_burst_secs(&self) -> Option<u64> {
        match self.last_burst_secs.load(Ordering::Acquire) {
            NEVER => None,
            secs => Some(secs),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn requests_seen(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    fn try_activate(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn record_grant(&self, now: u64) -> Option<u64> {
        match self.last_burst_secs.swap(now, Ordering::AcqRel) {
            NEVER => None,
            previous => Some(now.saturating_sub(previous)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    Granted { since_last_secs: Option<u64> },
    Cooldown { remaining_secs: u64 },
    WaveActive,
    BelowThreshold { seen: u64, needed: u64 },
    /// Another caller moved the grant timestamp first.
    Contended,
    ShutDown,
}

impl TriggerDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, TriggerDecision::Granted { .. })
    }
}

/// Single atomic decision point for starting waves. Only the caller that
/// receives `Granted` owns the active flag and must start (or release) the
/// wave.
#[derive(Debug)]
pub struct TriggerEvaluator {
    policy: TriggerPolicy,
    state: Arc<TriggerState>,
}

impl TriggerEvaluator {
    pub fn new(policy: TriggerPolicy, state: Arc<TriggerState>) -> Self {
        Self { policy, state }
    }

    pub fn policy(&self) -> TriggerPolicy {
        self.policy
    }

    pub fn state(&self) -> &Arc<TriggerState> {
        &self.state
    }

    pub fn should_trigger(&self, now: u64, config: &BurstConfig) -> TriggerDecision {
        match self.policy {
            TriggerPolicy::ElapsedTime => self.elapsed_time(now, config.cooldown_secs),
            TriggerPolicy::CounterModulo { threshold } => self.counter_modulo(now, threshold),
            TriggerPolicy::SlidingWindow {
                window_secs,
                threshold,
            } => self.sliding_window(now, window_secs, threshold),
        }
    }

    fn elapsed_time(&self, now: u64, cooldown_secs: u64) -> TriggerDecision {
        let state = &self.state;
        let last = state.last_burst_secs.load(Ordering::Acquire);
        if last != NEVER {
            let elapsed = now.saturating_sub(last);
            if elapsed < cooldown_secs {
                return TriggerDecision::Cooldown {
                    remaining_secs: cooldown_secs - elapsed,
                };
            }
        }

        if !state.try_activate() {
            return TriggerDecision::WaveActive;
        }

        match state
            .last_burst_secs
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => TriggerDecision::Granted {
                since_last_secs: (last != NEVER).then(|| now.saturating_sub(last)),
            },
            Err(_) => {
                state.release();
                TriggerDecision::Contended
            }
        }
    }

    fn counter_modulo(&self, now: u64, threshold: u64) -> TriggerDecision {
        let threshold = threshold.max(1);
        let seen = self.state.requests.fetch_add(1, Ordering::AcqRel) + 1;
        let position = seen % threshold;
        if position != 0 {
            return TriggerDecision::BelowThreshold {
                seen: position,
                needed: threshold,
            };
        }

        if !self.state.try_activate() {
            return TriggerDecision::WaveActive;
        }

        TriggerDecision::Granted {
            since_last_secs: self.state.record_grant(now),
        }
    }

    fn sliding_window(&self, now: u64, window_secs: u64, threshold: usize) -> TriggerDecision {
        let threshold = threshold.max(1);
        self.state.requests.fetch_add(1, Ordering::AcqRel);

        let recent = {
            let mut window = self.state.window.lock();
            window.push_back(now);
            while let Some(&oldest) = window.front() {
                if now.saturating_sub(oldest) > window_secs {
                    window.pop_front();
                } else {
                    break;
                }
            }
            while window.len() > threshold {
                window.pop_front();
            }
            window.len()
        };

        if recent < threshold {
            return TriggerDecision::BelowThreshold {
                seen: recent as u64,
                needed: threshold as u64,
            };
        }

        if !self.state.try_activate() {
            return TriggerDecision::WaveActive;
        }

        // the next wave needs a fresh window of traffic
        self.state.window.lock().clear();
        TriggerDecision::Granted {
            since_last_secs: self.state.record_grant(now),
        }
    }
}
