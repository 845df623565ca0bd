//! Track Scheduler
//!
//! A track is an append-only list of note events with a replay cursor.
//! On every timer unit the scheduler plays, for each track, every event
//! whose absolute time has arrived. At the end of the list a track is
//! stopped, replaced by a pending same-named track, looped, or deleted.
//! A track is never changed in the middle of an iteration: redefining a
//! playing track parks the new one until the old one reaches its end.

use slotmap::new_key_type;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

new_key_type! {
    /// Instrument registered with a live-coding session
    pub struct InstrumentKey;
    /// Effect registered with a live-coding session
    pub struct EffectKey;
}

/// Parameter changes applied right before an event plays
#[derive(Debug, Clone, PartialEq)]
pub enum NoteOptions {
    /// `node/param` values for every voice of an instrument
    Instrument {
        instrument: InstrumentKey,
        params: Vec<(String, f64)>,
    },
    /// Parameter values of an effect
    Effect {
        effect: EffectKey,
        params: Vec<(String, f64)>,
    },
}

/// One scheduled note. Numbers below 1 carry only options.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteEvent {
    pub instrument: InstrumentKey,
    pub number: i32,
    /// Offset from the track start, in seconds
    pub time: f64,
    pub velocity: f64,
    pub duration: Option<f64>,
    pub options: Option<NoteOptions>,
}

impl NoteEvent {
    pub fn is_note(&self) -> bool {
        self.number >= 1
    }
}

/// What the scheduler plays tracks on
pub trait Performer {
    fn note_on(&mut self, instrument: InstrumentKey, note: u8, velocity: f64, time: f64);
    fn note_off(&mut self, instrument: InstrumentKey, note: u8, velocity: f64, time: f64);
    /// Default note length of an instrument, 0 if it has none
    fn note_duration(&self, instrument: InstrumentKey) -> f64;
    fn instrument_name(&self, instrument: InstrumentKey) -> &str;
    fn apply(&mut self, options: &NoteOptions);
}

/// Ordered note events plus replay state
#[derive(Debug, Clone)]
pub struct Track {
    name: String,
    notes: Vec<NoteEvent>,
    notect: usize,
    start_time: f64,
    /// Length of one iteration, in seconds
    time: f64,
    looping: bool,
    loop_count: u32,
    should_stop: bool,
    stopped: bool,
}

impl Track {
    pub fn new(name: impl Into<String>, start_time: f64) -> Self {
        Self {
            name: name.into(),
            notes: Vec::new(),
            notect: 0,
            start_time,
            time: 0.0,
            looping: false,
            loop_count: 0,
            should_stop: false,
            stopped: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn notes(&self) -> &[NoteEvent] {
        &self.notes
    }

    /// Index of the next event to play
    pub fn cursor(&self) -> usize {
        self.notect
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Current write position, which becomes the iteration length
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_stopping(&self) -> bool {
        self.should_stop
    }

    /// Append an event at the current write position
    pub fn push(&mut self, mut event: NoteEvent) {
        event.time = self.time;
        self.notes.push(event);
    }

    /// Move the write position forward
    pub fn advance(&mut self, seconds: f64) {
        self.time += seconds.max(0.0);
    }

    /// Finish at the end of the current iteration
    pub fn stop(&mut self) {
        self.should_stop = true;
    }

    pub fn pause(&mut self) {
        self.stopped = true;
    }

    pub fn resume(&mut self) {
        self.should_stop = false;
        self.stopped = false;
    }
}

/// Track table advanced by the live-coding timer
#[derive(Debug, Default)]
pub struct TrackScheduler {
    tracks: BTreeMap<String, Track>,
    next_tracks: BTreeMap<String, Track>,
    log_notes: bool,
}

impl TrackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a track. A same-named track that is still playing keeps
    /// playing; the new one replaces it at its next loop boundary.
    pub fn insert(&mut self, track: Track) {
        let name = track.name.clone();
        if self.tracks.contains_key(&name) {
            debug!(track = %name, "track queued for replacement");
            self.next_tracks.insert(name, track);
        } else {
            self.tracks.insert(name, track);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Track> {
        self.tracks.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Track> {
        self.tracks.get_mut(name)
    }

    /// Track waiting to replace `name`
    pub fn pending(&self, name: &str) -> Option<&Track> {
        self.next_tracks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tracks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tracks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drop a track together with any pending replacement
    pub fn remove(&mut self, name: &str) -> Option<Track> {
        self.next_tracks.remove(name);
        self.tracks.remove(name)
    }

    /// Apply `f` to the playing and the pending track of `name`
    pub fn for_name(&mut self, name: &str, mut f: impl FnMut(&mut Track)) -> bool {
        let mut found = false;
        for table in [&mut self.tracks, &mut self.next_tracks] {
            if let Some(t) = table.get_mut(name) {
                f(t);
                found = true;
            }
        }
        found
    }

    pub fn each_track(&mut self, mut f: impl FnMut(&mut Track)) {
        self.tracks.values_mut().for_each(&mut f);
    }

    pub fn set_log(&mut self, enabled: bool) {
        self.log_notes = enabled;
    }

    pub fn log_enabled(&self) -> bool {
        self.log_notes
    }

    /// Play every event due at `time` on every track. `unit` is the
    /// fallback note length. Returns the number of events played.
    pub fn tick(&mut self, time: f64, unit: f64, performer: &mut dyn Performer) -> usize {
        let names: Vec<String> = self.tracks.keys().cloned().collect();
        names
            .iter()
            .map(|name| self.play_track(name, time, unit, performer))
            .sum()
    }

    fn play_track(&mut self, name: &str, time: f64, unit: f64, performer: &mut dyn Performer) -> usize {
        let log = self.log_notes;
        let mut played = 0;
        while !self.should_track_end(name) {
            let Some(track) = self.tracks.get_mut(name) else {
                break;
            };
            let note = &track.notes[track.notect];
            if track.start_time + note.time > time {
                break;
            }
            play_note(note, track.start_time, unit, log, performer);
            track.notect += 1;
            played += 1;
        }
        played
    }

    /// Decide what happens to a track whose cursor may be exhausted.
    /// Returns true when nothing more can be played from it now.
    fn should_track_end(&mut self, name: &str) -> bool {
        let Some(track) = self.tracks.get_mut(name) else {
            return true;
        };
        if track.stopped {
            return true;
        }
        if track.notect < track.notes.len() {
            return false;
        }
        track.notect = 0;

        if track.should_stop {
            debug!(track = %name, "track stopped");
            self.tracks.remove(name);
            return true;
        }
        if let Some(mut next) = self.next_tracks.remove(name) {
            next.start_time = track.start_time + track.time;
            debug!(track = %name, start = next.start_time, "track replaced");
            self.tracks.insert(name.to_string(), next);
            return self.should_track_end(name);
        }
        if track.looping {
            if track.notes.is_empty() {
                return true;
            }
            if track.time <= 0.0 {
                warn!(track = %name, "looping track has no length, pausing it");
                track.stopped = true;
                return true;
            }
            track.start_time += track.time;
            track.loop_count += 1;
            debug!(track = %name, loop_count = track.loop_count, "track looped");
            return false;
        }
        debug!(track = %name, "track finished");
        self.tracks.remove(name);
        true
    }
}

fn play_note(note: &NoteEvent, start_time: f64, unit: f64, log: bool, performer: &mut dyn Performer) {
    if let Some(options) = note.options.as_ref() {
        performer.apply(options);
    }
    if !note.is_note() {
        return;
    }
    let number = note.number.min(127) as u8;
    if log {
        info!("Note: {} - {}", number, performer.instrument_name(note.instrument));
    }
    let on = start_time + note.time;
    performer.note_on(note.instrument, number, note.velocity, on);
    let duration = note
        .duration
        .filter(|d| *d > 0.0)
        .or_else(|| Some(performer.note_duration(note.instrument)).filter(|d| *d > 0.0))
        .unwrap_or(unit);
    performer.note_off(note.instrument, number, note.velocity, on + duration);
}
