//! Arpeggiator
//!
//! Keeps the held keys in a [`NoteTable`] sorted by the note to play and, on
//! every timer unit, plays the entry under the cursor for a fraction of the
//! unit before moving the cursor up, down, or back and forth.

use crate::clock::SharedClock;
use crate::config::{ConfigError, TimerConfig};
use crate::serialize::ArpeggioDef;
use crate::timer::Timer;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Receiver of note events
pub trait NoteSink {
    fn note_on(&mut self, note: u8, velocity: f64, time: f64);
    fn note_off(&mut self, note: u8, velocity: f64, time: f64);
}

/// Arpeggio direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArpMode {
    /// Keys pass straight through
    #[default]
    #[serde(rename = "")]
    Off,
    #[serde(rename = "u")]
    Up,
    #[serde(rename = "d")]
    Down,
    #[serde(rename = "ud")]
    UpDown,
}

/// One entry of the note table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEntry {
    /// Key being held
    pub note: u8,
    /// Note actually played, possibly octaves above the key
    pub note_to_play: u8,
    pub velocity: f64,
}

/// Held notes sorted ascending by the note to play
#[derive(Debug, Clone, Default)]
pub struct NoteTable {
    notes: Vec<NoteEntry>,
}

impl NoteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&NoteEntry> {
        self.notes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NoteEntry> {
        self.notes.iter()
    }

    /// Insert before the first entry playing a strictly higher note
    pub fn add(&mut self, note: u8, note_to_play: u8, velocity: f64) {
        let entry = NoteEntry {
            note,
            note_to_play,
            velocity,
        };
        let pos = self
            .notes
            .iter()
            .position(|e| note_to_play < e.note_to_play)
            .unwrap_or(self.notes.len());
        self.notes.insert(pos, entry);
    }

    /// Remove every entry added for a held key
    pub fn remove(&mut self, note: u8) {
        self.notes.retain(|e| e.note != note);
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }
}

/// Last arpeggiated note, kept so releasing the last key can cut it short
#[derive(Debug, Clone, Copy, PartialEq)]
struct Played {
    note: u8,
    velocity: f64,
    on: f64,
    off: f64,
}

/// Cursor and table, split from the timer driving them
#[derive(Debug, Clone, Default)]
struct ArpState {
    mode: ArpMode,
    octaves: u8,
    gate: f64,
    notect: isize,
    backward: bool,
    notes: NoteTable,
    last: Option<Played>,
}

impl ArpState {
    /// Play the entry under the cursor together with its note-off at the
    /// gate time, then move the cursor
    fn tick(&mut self, time: f64, unit: f64, sink: &mut dyn NoteSink) {
        if self.mode == ArpMode::Off || self.notes.is_empty() {
            return;
        }
        self.wrap_counter(self.notes.len());
        let Some(entry) = self.notes.get(self.notect as usize).copied() else {
            return;
        };
        let off = time + unit * self.gate;
        sink.note_on(entry.note_to_play, entry.velocity, time);
        sink.note_off(entry.note_to_play, entry.velocity, off);
        self.last = Some(Played {
            note: entry.note_to_play,
            velocity: entry.velocity,
            on: time,
            off,
        });
        match self.mode {
            ArpMode::Up => self.notect += 1,
            ArpMode::Down => self.notect -= 1,
            ArpMode::UpDown if self.backward => self.notect -= 1,
            ArpMode::UpDown => self.notect += 1,
            ArpMode::Off => {}
        }
    }

    /// Bring the cursor back inside the table. Up-down reverses at either
    /// end without repeating the end note.
    fn wrap_counter(&mut self, len: usize) {
        let len = len as isize;
        if self.notect >= len {
            if self.mode != ArpMode::UpDown {
                self.notect = 0;
            } else {
                self.backward = true;
                self.notect = if len < 2 { 0 } else { len - 2 };
            }
        } else if self.notect < 0 {
            if self.mode != ArpMode::UpDown {
                self.notect = len - 1;
            } else {
                self.backward = false;
                self.notect = if len < 2 { 0 } else { 1 };
            }
        }
    }

    /// Release the last played note at `now` if its gate is still open
    fn cut(&mut self, now: f64, sink: &mut dyn NoteSink) {
        if let Some(p) = self.last.take() {
            if now < p.off {
                sink.note_off(p.note, p.velocity, now.max(p.on));
            }
        }
    }
}

/// Re-emits held keys as a timed sequence
#[derive(Debug)]
pub struct Arpeggiator {
    timer: Timer,
    state: ArpState,
}

impl Arpeggiator {
    pub fn new(clock: SharedClock, timer: TimerConfig, gate: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            timer: Timer::new(clock, timer)?,
            state: ArpState {
                octaves: 1,
                gate,
                ..ArpState::default()
            },
        })
    }

    pub fn mode(&self) -> ArpMode {
        self.state.mode
    }

    /// Switching to `Off` lets keys pass through; held entries stay in the
    /// table until released.
    pub fn set_mode(&mut self, mode: ArpMode) {
        self.state.mode = mode;
    }

    pub fn octaves(&self) -> u8 {
        self.state.octaves
    }

    /// Number of octaves each key spans, 1 to 3
    pub fn set_octaves(&mut self, octaves: u8) {
        self.state.octaves = octaves.clamp(1, 3);
    }

    pub fn bpm(&self) -> f64 {
        self.timer.bpm()
    }

    pub fn set_bpm(&mut self, bpm: f64) -> Result<(), ConfigError> {
        self.timer.set_tempo(bpm)
    }

    pub fn gate(&self) -> f64 {
        self.state.gate
    }

    pub fn notes(&self) -> &NoteTable {
        &self.state.notes
    }

    /// Table index of the next note to play
    pub fn cursor(&self) -> isize {
        self.state.notect
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn settings(&self) -> ArpeggioDef {
        ArpeggioDef {
            bpm: self.bpm(),
            mode: self.mode(),
            octave: self.octaves(),
        }
    }

    pub fn apply(&mut self, def: &ArpeggioDef) -> Result<(), ConfigError> {
        self.set_bpm(def.bpm)?;
        self.set_mode(def.mode);
        self.set_octaves(def.octave);
        Ok(())
    }

    /// Key pressed. The first key of an empty table starts the timer.
    pub fn send_note_on(&mut self, note: u8, velocity: f64, sink: &mut dyn NoteSink) {
        if self.state.mode == ArpMode::Off {
            sink.note_on(note, velocity, self.timer.now());
            return;
        }
        let should_start = self.state.notes.is_empty();
        for octave in 0..self.state.octaves {
            if let Some(play) = note.checked_add(12 * octave).filter(|n| *n <= 127) {
                self.state.notes.add(note, play, velocity);
            }
        }
        if should_start {
            debug!(note, "arpeggiator started");
            let unit = self.timer.unit_duration();
            let state = &mut self.state;
            self.timer.start(&mut |t| state.tick(t, unit, sink));
        }
    }

    /// Key released. Releasing the last held key silences the sounding
    /// note at once and resets the cursor.
    pub fn send_note_off(&mut self, note: u8, velocity: f64, sink: &mut dyn NoteSink) {
        let now = self.timer.now();
        if self.state.mode == ArpMode::Off {
            sink.note_off(note, velocity, now);
        }
        self.state.notes.remove(note);
        if self.state.notes.is_empty() {
            self.state.cut(now, sink);
            self.timer.stop();
            self.state.backward = false;
            self.state.notect = 0;
        }
    }

    /// Play every unit inside the timer's look-ahead window
    pub fn wake(&mut self, sink: &mut dyn NoteSink) -> usize {
        let unit = self.timer.unit_duration();
        let state = &mut self.state;
        self.timer.wake(&mut |t| state.tick(t, unit, sink))
    }
}
