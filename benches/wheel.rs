use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use tickwheel::{Tick, Timer, TimerId, TimerWheel};

// ==================== Benchmark Timer Types ====================

struct NoopTimer;

impl Timer for NoopTimer {
    type Context = ();

    fn fire(&mut self, _wheel: &mut TimerWheel<Self>, _id: TimerId, _ctx: &mut ()) {}
}

struct CountingTimer;

impl Timer for CountingTimer {
    type Context = u64;

    fn fire(&mut self, _wheel: &mut TimerWheel<Self>, _id: TimerId, fired: &mut u64) {
        *fired += 1;
    }
}

struct PeriodicTimer {
    period: Tick,
}

impl Timer for PeriodicTimer {
    type Context = u64;

    fn fire(&mut self, wheel: &mut TimerWheel<Self>, id: TimerId, fired: &mut u64) {
        *fired += 1;
        let period = self.period;
        wheel.schedule(id, period);
    }
}

// Deltas spread over three levels, deterministic across runs.
fn spread_delta(i: u64) -> Tick {
    1 + (i.wrapping_mul(2_654_435_761) % 100_000)
}

// ==================== Scheduling ====================

fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");

    group.bench_function("fresh", |b| {
        let mut wheel = TimerWheel::new();
        let id = wheel.register(NoopTimer);
        let mut i = 0u64;
        b.iter(|| {
            wheel.cancel(id);
            wheel.schedule(id, black_box(spread_delta(i)));
            i += 1;
        });
    });

    group.bench_function("reschedule_active", |b| {
        let mut wheel = TimerWheel::new();
        let id = wheel.register(NoopTimer);
        wheel.schedule(id, 10);
        let mut i = 0u64;
        b.iter(|| {
            wheel.schedule(id, black_box(spread_delta(i)));
            i += 1;
        });
    });

    group.bench_function("schedule_in_range_stable", |b| {
        let mut wheel = TimerWheel::new();
        let id = wheel.register(NoopTimer);
        wheel.schedule_in_range(id, 500, 1000);
        b.iter(|| {
            wheel.schedule_in_range(id, black_box(500), black_box(1000));
        });
    });

    group.finish();
}

fn bench_cancel(c: &mut Criterion) {
    c.bench_function("schedule_cancel_churn", |b| {
        let mut wheel = TimerWheel::new();
        let id = wheel.register(NoopTimer);
        let mut i = 0u64;
        b.iter(|| {
            wheel.schedule(id, black_box(spread_delta(i)));
            wheel.cancel(id);
            i += 1;
        });
    });
}

// ==================== Advance ====================

fn bench_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("advance");

    for population in [100u64, 1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("drain_population", population),
            &population,
            |b, &population| {
                b.iter_batched(
                    || {
                        let mut wheel = TimerWheel::new();
                        for i in 0..population {
                            let id = wheel.register(CountingTimer);
                            wheel.schedule(id, spread_delta(i));
                        }
                        wheel
                    },
                    |mut wheel| {
                        let mut fired = 0u64;
                        wheel.advance(100_000, &mut fired);
                        black_box(fired)
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.bench_function("empty_ticks", |b| {
        let mut wheel: TimerWheel<CountingTimer> = TimerWheel::new();
        let mut fired = 0u64;
        b.iter(|| {
            wheel.advance(black_box(512), &mut fired);
        });
    });

    group.bench_function("periodic_steady_state", |b| {
        let mut wheel = TimerWheel::new();
        for i in 0..1_000u64 {
            let id = wheel.register(PeriodicTimer { period: 97 });
            wheel.schedule(id, 1 + i % 97);
        }
        let mut fired = 0u64;
        b.iter(|| {
            wheel.advance(black_box(97), &mut fired);
        });
        black_box(fired);
    });

    group.finish();
}

// ==================== Next-Event Query ====================

fn bench_next_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("ticks_to_next_event");

    group.bench_function("sparse", |b| {
        let mut wheel = TimerWheel::new();
        let id = wheel.register(NoopTimer);
        wheel.schedule(id, 60_000);
        b.iter(|| black_box(wheel.ticks_to_next_event(Tick::MAX)));
    });

    group.bench_function("populated", |b| {
        let mut wheel = TimerWheel::new();
        for i in 0..10_000u64 {
            let id = wheel.register(NoopTimer);
            wheel.schedule(id, spread_delta(i));
        }
        b.iter(|| black_box(wheel.ticks_to_next_event(Tick::MAX)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_schedule,
    bench_cancel,
    bench_advance,
    bench_next_event
);
criterion_main!(benches);
