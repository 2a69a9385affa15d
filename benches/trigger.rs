use std::{hint::black_box, sync::Arc, time::Duration};

use amplifier::{
    amplifier::{
        BurstAmplifier, BurstConfig, ConfigUpdate, TriggerEvaluator, TriggerPolicy, TriggerState,
    },
    clock::ManualClock,
    settings::AmplifierSettings,
};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

async fn noop_call() -> anyhow::Result<()> {
    Ok(())
}

fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build benchmark runtime")
}

fn settings(rate: i64, duration: i64) -> AmplifierSettings {
    AmplifierSettings {
        service: "bench".to_string(),
        burst: ConfigUpdate {
            cooldown_secs: 60,
            requests_per_second: rate,
            burst_duration_secs: duration,
            pool_size: None,
        },
        ..AmplifierSettings::default()
    }
}

fn should_trigger_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("should_trigger_denied");
    group.throughput(Throughput::Elements(1));

    let config = BurstConfig::new(60, 5, 10);
    let policies = [
        ("elapsed_time", TriggerPolicy::ElapsedTime),
        (
            "counter_modulo",
            TriggerPolicy::CounterModulo { threshold: 1_000_000 },
        ),
        (
            "sliding_window",
            TriggerPolicy::SlidingWindow {
                window_secs: 1,
                threshold: 64,
            },
        ),
    ];

    for (name, policy) in policies {
        let evaluator = TriggerEvaluator::new(policy, Arc::new(TriggerState::new()));
        // first grant leaves the state in cooldown or mid-count
        black_box(evaluator.should_trigger(0, &config));

        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            let mut now = 1u64;
            b.iter(|| {
                now = (now % 59) + 1;
                black_box(evaluator.should_trigger(black_box(now), &config))
            });
        });
    }

    group.finish();
}

fn hand_off_group(c: &mut Criterion) {
    let runtime = build_runtime();
    let mut group = c.benchmark_group("on_request_completed_grant");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(5));

    // the granting call only spawns the wave, so cost must not follow r * d
    for &(rate, duration) in &[(5i64, 10i64), (100, 60), (10_000, 600)] {
        let settings = settings(rate, duration);
        let id = format!("r{}_d{}", rate, duration);

        group.bench_function(BenchmarkId::new("grant", id), |b| {
            b.to_async(&runtime).iter_batched(
                || {
                    let _guard = runtime.enter();
                    BurstAmplifier::new(&settings, Arc::new(ManualClock::new(0)))
                        .expect("valid bench settings")
                },
                |amplifier| async move {
                    let decision = amplifier.on_request_completed(noop_call);
                    assert!(decision.is_granted());
                    amplifier
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, should_trigger_group, hand_off_group);
criterion_main!(benches);
