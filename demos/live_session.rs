//! Live session demo
//!
//! Runs a short live-coding script against a manual clock, stepping it the
//! way a real-time host would (one wake-up every timer period), and prints
//! the unit operations the audio back end would receive.
//!
//! Run with: cargo run --example live_session
//! Set RUST_LOG=debug to see every note and loop transition.

use std::sync::Arc;
use synthflow::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let clock = ManualClock::new(0.0);
    let config = EngineConfig::default();
    let mut lc = LiveCoding::new(Arc::new(clock.clone()), PresetLibrary::new(), config)?;

    lc.execute(|lc| {
        lc.set_bpm(120.0)?;
        lc.use_log(true);

        let bass = lc.instrument("Sub Bass", Some("bass"))?;
        let hat = lc.instrument_with_voices("Noise Hat", Some("hat"), 2)?;
        let echo = lc.effect("WebAudio/Delay", Some("echo"))?;
        if let Some(mut fx) = lc.effect_handle(echo) {
            fx.set_param("delayTime", 0.375, None, false)?;
        }

        lc.loop_track("bass", |t| {
            t.instrument(bass)?;
            for note in [36, 36, 43, 41] {
                t.play_for(note, 0.4)?.sleep(1.0);
            }
            Ok(())
        })?;

        lc.loop_track("hats", |t| {
            t.instrument(hat)?.effect(echo)?.volume(0.6);
            t.repeat(8, |t, i| {
                if i % 2 == 1 {
                    t.param("Filter/frequency", 9000.0)?;
                }
                t.play(60)?.sleep(0.5);
                Ok(())
            })?;
            Ok(())
        })?;

        lc.log("script loaded");
        Ok(())
    })?;

    let period = lc.timer().wake_period().as_secs_f64();
    let mut played = 0;
    let mut commands = 0;
    while clock.now() < 4.0 {
        played += lc.wake();
        lc.collect();
        commands += lc.drain_commands().len();
        clock.advance(period);
    }

    // Replace the bass line; it takes over at the next loop boundary
    let bass = lc.instrument_named("bass").ok_or("bass instrument missing")?;
    lc.execute(|lc| {
        lc.loop_track("bass", |t| {
            t.instrument(bass)?.transpose(5);
            for note in [36, 43] {
                t.play_for(note, 0.8)?.sleep(2.0);
            }
            Ok(())
        })?;
        Ok(())
    })?;

    while clock.now() < 8.0 {
        played += lc.wake();
        lc.collect();
        commands += lc.drain_commands().len();
        clock.advance(period);
    }

    lc.reset();
    println!(
        "played {} events, {} unit operations, {} tracks left",
        played,
        commands,
        lc.scheduler().len()
    );
    Ok(())
}
