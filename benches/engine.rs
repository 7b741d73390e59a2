//! Engine throughput benchmarks.

use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use crash_game::core::crash::CrashModel;
use crash_game::core::rng::DeterministicRng;
use crash_game::game::{GameConfig, InboundEvent, LedgerHandle, PlayerId, RoundEngine};

fn engine(now: Instant, bet_window: Duration) -> RoundEngine {
    let config = GameConfig {
        bet_window,
        seed: 1,
        ..Default::default()
    };
    RoundEngine::new(config, LedgerHandle::new(), now)
}

fn bench_bets(c: &mut Criterion) {
    c.bench_function("place 1000 bets", |b| {
        b.iter_batched(
            || engine(Instant::now(), Duration::from_secs(3600)),
            |mut engine| {
                let now = Instant::now();
                for id in 1..=1000 {
                    black_box(engine.handle(InboundEvent::bet(PlayerId::new(id), 10.0), now));
                }
                engine
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_ticks(c: &mut Criterion) {
    let t0 = Instant::now();
    // Cycles through every phase as simulated time advances
    let mut engine = engine(t0, Duration::from_secs(1));
    let mut now = t0;

    c.bench_function("tick", |b| {
        b.iter(|| {
            now += Duration::from_millis(100);
            black_box(engine.handle(InboundEvent::Tick, now));
        })
    });
}

fn bench_crash_draw(c: &mut Criterion) {
    let model = CrashModel::default();
    let mut rng = DeterministicRng::new(7);

    c.bench_function("draw crash", |b| b.iter(|| black_box(model.draw_crash(&mut rng))));
}

criterion_group!(benches, bench_bets, bench_ticks, bench_crash_draw);
criterion_main!(benches);
