use amplifier::{
    amplifier::{BurstAmplifier, ConfigUpdate, SyntheticCall},
    clock::SystemClock,
    error::ConfigError,
    settings::{self, AmplifierSettings},
};
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

const PRIMARY_REQUESTS: usize = 400;
const CLIENTS: usize = 8;
const DOWNSTREAM_FAILURE_RATE: f64 = 0.1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let settings = match settings::load_default_settings() {
        Ok(settings) => settings,
        Err(ConfigError::Open { path, .. }) => {
            warn!(path = %path.display(), "no settings file, using defaults");
            demo_settings()
        }
        Err(err) => return Err(err.into()),
    };

    let amplifier = Arc::new(BurstAmplifier::new(&settings, Arc::new(SystemClock))?);

    let clients: Vec<_> = (0..CLIENTS)
        .map(|client| {
            let amplifier = Arc::clone(&amplifier);
            tokio::spawn(async move {
                let mut granted = 0usize;
                for _ in 0..PRIMARY_REQUESTS / CLIENTS {
                    if downstream().await.is_ok()
                        && amplifier.on_request_completed(replay()).is_granted()
                    {
                        granted += 1;
                    }
                }
                info!(client, granted, "client finished");
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_secs(2)).await;
    amplifier.apply_config(ConfigUpdate {
        cooldown_secs: 3,
        requests_per_second: 8,
        burst_duration_secs: 2,
        pool_size: None,
    })?;

    for client in clients {
        client.await?;
    }

    let report = amplifier.shutdown(settings.shutdown_grace()).await;
    let stats = amplifier.stats();
    info!(
        forced = report.forced(),
        waves_started = stats.waves_started,
        waves_completed = stats.waves_completed,
        waves_cancelled = stats.waves_cancelled,
        triggers_denied = stats.triggers_denied,
        calls_submitted = stats.calls_submitted,
        calls_succeeded = stats.calls_succeeded,
        calls_failed = stats.calls_failed,
        calls_cancelled = stats.calls_cancelled,
        pools_retired = stats.pools_retired,
        "demo finished"
    );
    Ok(())
}

fn demo_settings() -> AmplifierSettings {
    AmplifierSettings {
        service: "demo-service".to_string(),
        burst: ConfigUpdate {
            cooldown_secs: 2,
            requests_per_second: 5,
            burst_duration_secs: 1,
            pool_size: None,
        },
        shutdown_grace_ms: 2_000,
        ..AmplifierSettings::default()
    }
}

/// Simulated downstream dependency with random latency and failures.
async fn downstream() -> anyhow::Result<()> {
    let (latency_ms, fails) = {
        let mut rng = rand::rng();
        (
            rng.random_range(5..40),
            rng.random_bool(DOWNSTREAM_FAILURE_RATE),
        )
    };
    tokio::time::sleep(Duration::from_millis(latency_ms)).await;
    if fails {
        anyhow::bail!("downstream responded with 503");
    }
    Ok(())
}

fn replay() -> impl SyntheticCall {
    downstream
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("amplifier=info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
