//! Scheduling Benchmarks
//!
//! Cost of the three hot paths driven by timer wake-ups: draining timer
//! units, allocating voices, and advancing live-coded tracks.
//!
//! A wake-up runs every 25 ms by default, so each of these has to stay far
//! below that to leave room for the audio back end.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use synthflow::prelude::*;

const VOICE_COUNTS: [usize; 4] = [1, 4, 8, 16];
const TEMPOS: [f64; 3] = [60.0, 120.0, 240.0];

// ============================================================================
// Timer
// ============================================================================

fn bench_timer_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_drain");

    for &bpm in &TEMPOS {
        group.bench_with_input(BenchmarkId::new("bpm", bpm as u32), &bpm, |b, &bpm| {
            let clock = ManualClock::new(0.0);
            let config = TimerConfig::default().with_bpm(bpm);
            let mut timer = Timer::new(Arc::new(clock.clone()), config).unwrap();
            timer.arm();

            b.iter(|| {
                clock.advance(1.0);
                black_box(timer.wake(&mut |t: f64| {
                    black_box(t);
                }));
            });
        });
    }

    group.finish();
}

// ============================================================================
// Voice Allocation
// ============================================================================

fn bench_voice_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("voice_allocation");
    let preset = ClassicPresets::saw_lead();

    for &voices in &VOICE_COUNTS {
        // Twice as many notes as voices, so half of them steal
        group.throughput(Throughput::Elements(2 * voices as u64));
        group.bench_with_input(BenchmarkId::new("voices", voices), &voices, |b, &voices| {
            let clock = ManualClock::new(0.0);
            let mut inst = Instrument::new(Arc::new(clock.clone()), &preset, voices).unwrap();

            b.iter(|| {
                let now = clock.now();
                for i in 0..2 * voices {
                    inst.note_on(48 + (i % 24) as u8, 1.0, Some(now));
                }
                inst.all_notes_off(Some(now + 0.1));
                clock.advance(10.0);
                black_box(inst.collect(clock.now()));
                black_box(inst.drain_commands());
            });
        });
    }

    group.finish();
}

// ============================================================================
// Track Scheduler
// ============================================================================

fn bench_track_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("track_tick");

    for &tracks in &[1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("tracks", tracks), &tracks, |b, &tracks| {
            let clock = ManualClock::new(0.0);
            let mut lc = LiveCoding::new(
                Arc::new(clock.clone()),
                PresetLibrary::new(),
                EngineConfig::default(),
            )
            .unwrap();
            let pluck = lc.instrument("Pluck", None).unwrap();
            for n in 0..tracks {
                lc.loop_track(&format!("t{}", n), |t| {
                    t.instrument(pluck)?;
                    t.repeat(16, |t, i| {
                        t.play(48 + (i % 12) as i32)?.sleep(0.25);
                        Ok(())
                    })?;
                    Ok(())
                })
                .unwrap();
            }

            b.iter(|| {
                clock.advance(1.0);
                black_box(lc.wake());
                black_box(lc.collect());
                black_box(lc.drain_commands());
            });
        });
    }

    group.finish();
}

criterion_group!(timer_benches, bench_timer_drain);
criterion_group!(voice_benches, bench_voice_allocation);
criterion_group!(track_benches, bench_track_tick);

criterion_main!(timer_benches, voice_benches, track_benches);
