use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_COOLDOWN_SECS: u64 = 60;
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 5;
pub const DEFAULT_BURST_DURATION_SECS: u32 = 10;

const MIN_POOL_SIZE: usize = 1;
const MIN_REQUESTS_PER_SECOND: u32 = 1;
/// One wave tick submits this many calls at most, inline on a runtime worker.
pub const MAX_REQUESTS_PER_SECOND: u32 = 10_000;
pub const MAX_POOL_SIZE: usize = 2 * MAX_REQUESTS_PER_SECOND as usize;

/// Validated, immutable burst parameters. Waves hold an `Arc` of the
/// snapshot that was current when they started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstConfig {
    pub cooldown_secs: u64,
    pub requests_per_second: u32,
    pub burst_duration_secs: u32,
    pub pool_size: usize,
}

impl BurstConfig {
    pub fn new(cooldown_secs: u64, requests_per_second: u32, burst_duration_secs: u32) -> Self {
        Self {
            cooldown_secs,
            requests_per_second,
            burst_duration_secs,
            pool_size: derived_pool_size(requests_per_second),
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE);
        self
    }

    /// Calls a full wave issues: one batch per second of the wave.
    pub fn calls_per_wave(&self) -> u64 {
        u64::from(self.requests_per_second) * u64::from(self.burst_duration_secs)
    }
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_COOLDOWN_SECS,
            DEFAULT_REQUESTS_PER_SECOND,
            DEFAULT_BURST_DURATION_SECS,
        )
    }
}

pub fn derived_pool_size(requests_per_second: u32) -> usize {
    (requests_per_second as usize)
        .saturating_mul(2)
        .max(MIN_POOL_SIZE)
}

/// Unvalidated parameters as they arrive from a management call or a
/// settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub cooldown_secs: i64,
    pub requests_per_second: i64,
    pub burst_duration_secs: i64,
    pub pool_size: Option<i64>,
}

impl Default for ConfigUpdate {
    fn default() -> Self {
        Self {
            cooldown_secs: DEFAULT_COOLDOWN_SECS as i64,
            requests_per_second: i64::from(DEFAULT_REQUESTS_PER_SECOND),
            burst_duration_secs: i64::from(DEFAULT_BURST_DURATION_SECS),
            pool_size: None,
        }
    }
}

impl From<&BurstConfig> for ConfigUpdate {
    fn from(config: &BurstConfig) -> Self {
        Self {
            cooldown_secs: i64::try_from(config.cooldown_secs).unwrap_or(i64::MAX),
            requests_per_second: i64::from(config.requests_per_second),
            burst_duration_secs: i64::from(config.burst_duration_secs),
            pool_size: Some(i64::try_from(config.pool_size).unwrap_or(i64::MAX)),
        }
    }
}

/// A value the validator changed instead of rejecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Adjustment {
    RateRaisedToMinimum { requested: i64, applied: u32 },
    PoolSizeRaisedToMinimum { requested: i64, applied: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigApplied {
    pub config: BurstConfig,
    pub adjustments: Vec<Adjustment>,
}

impl ConfigUpdate {
    pub fn validate(self) -> Result<ConfigApplied, ConfigError> {
        let mut adjustments = Vec::new();

        let cooldown_secs = non_negative("cooldown_secs", self.cooldown_secs)?;

        let duration = non_negative("burst_duration_secs", self.burst_duration_secs)?;
        if duration == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        let burst_duration_secs = narrow("burst_duration_secs", duration)?;

        let rate = non_negative("requests_per_second", self.requests_per_second)?;
        let requests_per_second = if rate == 0 {
            adjustments.push(Adjustment::RateRaisedToMinimum {
                requested: self.requests_per_second,
                applied: MIN_REQUESTS_PER_SECOND,
            });
            MIN_REQUESTS_PER_SECOND
        } else {
            at_most("requests_per_second", rate, MAX_REQUESTS_PER_SECOND)?
        };

        let pool_size = match self.pool_size {
            None => derived_pool_size(requests_per_second),
            Some(requested) => {
                let size = non_negative("pool_size", requested)?;
                if size == 0 {
                    adjustments.push(Adjustment::PoolSizeRaisedToMinimum {
                        requested,
                        applied: MIN_POOL_SIZE,
                    });
                    MIN_POOL_SIZE
                } else {
                    at_most("pool_size", size, MAX_POOL_SIZE)?
                }
            }
        };

        Ok(ConfigApplied {
            config: BurstConfig {
                cooldown_secs,
                requests_per_second,
                burst_duration_secs,
                pool_size,
            },
            adjustments,
        })
    }
}

fn non_negative(field: &'static str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value).map_err(|_| ConfigError::Negative { field, value })
}

fn narrow<T: TryFrom<u64>>(field: &'static str, value: u64) -> Result<T, ConfigError> {
    T::try_from(value).map_err(|_| ConfigError::OutOfRange {
        field,
        value: i64::try_from(value).unwrap_or(i64::MAX),
    })
}

fn at_most<T>(field: &'static str, value: u64, max: T) -> Result<T, ConfigError>
where
    T: TryFrom<u64> + PartialOrd,
{
    match narrow::<T>(field, value)? {
        narrowed if narrowed <= max => Ok(narrowed),
        _ => Err(ConfigError::OutOfRange {
            field,
            value: i64::try_from(value).unwrap_or(i64::MAX),
        }),
    }
}
