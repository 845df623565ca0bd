//! # Synthflow: Note Scheduling for Modular Synthesizers
//!
//! `synthflow` is the timing core of a modular synthesizer. It decides, for
//! every note-on, note-off and parameter change, exactly when and how a
//! control value moves, how overlapping notes interact, and how a live-coded
//! sequence of events is advanced against a look-ahead audio clock.
//!
//! ## Architecture
//!
//! The library is organized in three layers:
//!
//! - **Layer 1: Time** - an external [`clock::AudioClock`] and the
//!   [`timer::Timer`] that hands out fixed-length units inside a look-ahead
//!   window
//! - **Layer 2: Notes** - per-node note handlers, linear ramps and envelope
//!   segments, monophonic synths ([`graph::Synth`]) and voice pools
//!   ([`polyphony::Instrument`])
//! - **Layer 3: Performance** - the keyboard router with its arpeggiator, and
//!   the live-coding session with its track scheduler
//!
//! Processing units themselves live outside the engine. The engine keeps a
//! model of them in a [`unit::UnitGraph`] and emits a [`unit::UnitCommand`]
//! log for the host to apply.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use synthflow::prelude::*;
//! use std::sync::Arc;
//!
//! let clock = Arc::new(ManualClock::new(0.0));
//! let preset = PresetLibrary::new().get(&PresetRef::from("Saw Lead")).unwrap();
//!
//! // Two voices of the same graph
//! let mut inst = Instrument::new(clock.clone(), &preset, 2).unwrap();
//! inst.note_on(60, 1.0, None);
//! inst.note_on(64, 1.0, None);
//! inst.note_off(60, 1.0, Some(0.5));
//!
//! // Hand the resulting unit operations to the audio back end
//! for cmd in inst.drain_commands() {
//!     println!("{:?}", cmd);
//! }
//! ```

pub mod arpeggiator;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod graph;
pub mod handler;
pub mod keyboard;
pub mod live;
pub mod polyphony;
pub mod presets;
pub mod ramp;
pub mod serialize;
pub mod timer;
pub mod track;
pub mod unit;

/// Note whose frequency ratio is 1
pub const REFERENCE_NOTE: u8 = 57;

/// Frequency ratio between adjacent semitones
pub const SEMITONE: f64 = 1.059_463_094_359_295_3;

/// Frequency ratio of a MIDI note relative to [`REFERENCE_NOTE`]
pub fn note_ratio(note: u8) -> f64 {
    SEMITONE.powi(note as i32 - REFERENCE_NOTE as i32)
}

/// Prelude module for convenient imports
pub mod prelude {
    // Layer 1: Time
    pub use crate::clock::{AtomicF64, AudioClock, ManualClock, SharedClock, SystemClock};
    pub use crate::config::{ConfigError, EngineConfig, TimerConfig};
    pub use crate::timer::Timer;

    // Processing units
    pub use crate::unit::{
        AutomationEvent, Endpoint, FieldValue, Param, PlayState, SampleBuffer, UnitCommand,
        UnitGraph, UnitId, UnitKind,
    };

    // Layer 2: Notes
    pub use crate::catalog::{HandlerKind, NodeCatalog, NodeDef, NodeKind, ParamDef};
    pub use crate::graph::{GraphError, NodeData, NodeId, Synth};
    pub use crate::handler::{Adsr, HandlerState, NoteHandler};
    pub use crate::polyphony::{Instrument, Voice};
    pub use crate::ramp::{EnvelopeSegment, Portamento, Ramp};

    // Serialization
    pub use crate::serialize::{
        ArpeggioDef, GraphDef, GraphNodeDef, KeyboardDef, NodeDataDef, ParamValue,
    };
    pub use crate::presets::{ClassicPresets, PresetError, PresetLibrary, PresetRef};

    // Layer 3: Performance
    pub use crate::arpeggiator::{ArpMode, Arpeggiator, NoteSink, NoteTable};
    pub use crate::keyboard::KeyboardRouter;
    pub use crate::live::{
        EffectHandle, LcInstrument, LiveCoding, LiveError, LiveErrorKind, ScriptError,
        TrackBuilder, TrackHandle,
    };
    pub use crate::track::{
        EffectKey, InstrumentKey, NoteEvent, NoteOptions, Performer, Track, TrackScheduler,
    };

    pub use crate::{note_ratio, REFERENCE_NOTE, SEMITONE};
}

// Re-export key types at crate root for convenience
pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_note_ratio() {
        assert_relative_eq!(note_ratio(REFERENCE_NOTE), 1.0);
        assert_relative_eq!(note_ratio(69), 2.0, epsilon = 1e-12);
        assert_relative_eq!(note_ratio(45), 0.5, epsilon = 1e-12);
        assert_relative_eq!(SEMITONE.powi(12), 2.0, epsilon = 1e-12);
    }
}
