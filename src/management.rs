//! Plain-text management surface: the same read/replace pair each service
//! exposed for tuning bursts at runtime.

use crate::{
    amplifier::{BurstAmplifier, BurstConfig, ConfigApplied, ConfigUpdate},
    error::ConfigError,
};
use std::fmt::Write;

/// Cooldown, rate, duration and pool size, one per line.
pub fn render_params(config: &BurstConfig) -> String {
    let mut out = String::new();
    for value in [
        config.cooldown_secs,
        u64::from(config.requests_per_second),
        u64::from(config.burst_duration_secs),
        config.pool_size as u64,
    ] {
        let _ = writeln!(out, "{value}");
    }
    out
}

/// Accepts `[cooldown, rate, duration]` or the same followed by a pool size
/// override. Values are validated later by [`ConfigUpdate::validate`].
pub fn parse_params(values: &[i64]) -> Result<ConfigUpdate, ConfigError> {
    match *values {
        [cooldown_secs, requests_per_second, burst_duration_secs] => Ok(ConfigUpdate {
            cooldown_secs,
            requests_per_second,
            burst_duration_secs,
            pool_size: None,
        }),
        [cooldown_secs, requests_per_second, burst_duration_secs, pool_size] => {
            Ok(ConfigUpdate {
                cooldown_secs,
                requests_per_second,
                burst_duration_secs,
                pool_size: Some(pool_size),
            })
        }
        _ => Err(ConfigError::ParamCount { got: values.len() }),
    }
}

pub fn get_burst_params(amplifier: &BurstAmplifier) -> String {
    render_params(&amplifier.config())
}

pub fn set_burst_params(
    amplifier: &BurstAmplifier,
    values: &[i64],
) -> Result<ConfigApplied, ConfigError> {
    amplifier.apply_config(parse_params(values)?)
}
