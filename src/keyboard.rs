//! Keyboard Routing
//!
//! Front end for live note input (PC keyboard, on-screen piano, MIDI).
//! Keys go through the arpeggiator, then to either the monophonic editor
//! synth or, in polyphonic mode, to an [`Instrument`] built from a snapshot
//! of the same graph.

use crate::arpeggiator::{Arpeggiator, NoteSink};
use crate::config::{ConfigError, EngineConfig};
use crate::graph::{GraphError, Synth};
use crate::polyphony::Instrument;
use crate::serialize::KeyboardDef;
use crate::unit::UnitCommand;
use tracing::debug;

/// Destination of the notes leaving the arpeggiator
#[derive(Debug)]
struct NoteOutput {
    synth: Synth,
    instrument: Option<Instrument>,
    portamento: f64,
    last_note: Option<u8>,
}

impl NoteSink for NoteOutput {
    fn note_on(&mut self, note: u8, velocity: f64, time: f64) {
        self.last_note = Some(note);
        match self.instrument.as_mut() {
            Some(inst) => {
                inst.set_portamento_time(self.portamento);
                inst.note_on(note, velocity, Some(time));
            }
            None => {
                self.synth.set_portamento_time(self.portamento);
                self.synth.note_on(note, velocity, Some(time));
            }
        }
    }

    fn note_off(&mut self, note: u8, velocity: f64, time: f64) {
        // A release scheduled ahead leaves the note sounding until then
        if self.last_note == Some(note) && time <= self.synth.now() {
            self.last_note = None;
        }
        match self.instrument.as_mut() {
            Some(inst) => {
                inst.note_off(note, velocity, Some(time));
            }
            None => self.synth.note_off(note, velocity, Some(time)),
        }
    }
}

/// Routes keyboard input to a mono synth or a polyphonic instrument
#[derive(Debug)]
pub struct KeyboardRouter {
    arpeggiator: Arpeggiator,
    output: NoteOutput,
    voices: usize,
    octave: Option<i32>,
    /// Held keys and the note each one was sent as
    held: Vec<(u8, u8)>,
}

impl KeyboardRouter {
    pub fn new(synth: Synth, config: &EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let arpeggiator = Arpeggiator::new(synth.clock().clone(), config.timer, config.arpeggio_gate)?;
        let portamento = synth.portamento().time;
        Ok(Self {
            arpeggiator,
            output: NoteOutput {
                synth,
                instrument: None,
                portamento,
                last_note: None,
            },
            voices: config.keyboard_voices,
            octave: None,
            held: Vec::new(),
        })
    }

    pub fn synth(&self) -> &Synth {
        &self.output.synth
    }

    /// The editor synth. Graph edits take effect in polyphonic mode only
    /// after the next [`KeyboardRouter::poly_on`].
    pub fn synth_mut(&mut self) -> &mut Synth {
        &mut self.output.synth
    }

    pub fn instrument(&self) -> Option<&Instrument> {
        self.output.instrument.as_ref()
    }

    pub fn arpeggiator(&self) -> &Arpeggiator {
        &self.arpeggiator
    }

    pub fn arpeggiator_mut(&mut self) -> &mut Arpeggiator {
        &mut self.arpeggiator
    }

    pub fn is_poly(&self) -> bool {
        self.output.instrument.is_some()
    }

    pub fn last_note(&self) -> Option<u8> {
        self.output.last_note
    }

    pub fn portamento(&self) -> f64 {
        self.output.portamento
    }

    /// Glide time applied on every following note-on
    pub fn set_portamento(&mut self, time: f64) {
        self.output.portamento = time.max(0.0);
    }

    pub fn octave(&self) -> Option<i32> {
        self.octave
    }

    /// Shift every following key by whole octaves. Keys already held are
    /// released as the note they were sent as.
    pub fn set_octave(&mut self, octave: Option<i32>) {
        self.octave = octave;
    }

    /// Key number after the octave shift, if still a MIDI note
    fn shifted(&self, key: u8) -> Option<u8> {
        let note = key as i32 + 12 * self.octave.unwrap_or(0);
        u8::try_from(note).ok().filter(|n| *n <= 127)
    }

    pub fn key_down(&mut self, key: u8, velocity: f64) {
        let Some(note) = self.shifted(key) else {
            debug!(key, octave = ?self.octave, "key outside the note range ignored");
            return;
        };
        self.held.retain(|(k, _)| *k != key);
        self.held.push((key, note));
        self.arpeggiator.send_note_on(note, velocity, &mut self.output);
    }

    pub fn key_up(&mut self, key: u8, velocity: f64) {
        let note = match self.held.iter().position(|(k, _)| *k == key) {
            Some(i) => self.held.remove(i).1,
            None => match self.shifted(key) {
                Some(note) => note,
                None => return,
            },
        };
        self.arpeggiator.send_note_off(note, velocity, &mut self.output);
    }

    /// Drive the arpeggiator timer
    pub fn wake(&mut self) -> usize {
        self.arpeggiator.wake(&mut self.output)
    }

    /// Switch to polyphonic mode, releasing the sounding mono note first
    pub fn poly_on(&mut self) -> Result<(), GraphError> {
        let now = self.output.synth.now();
        if let Some(note) = self.output.last_note {
            self.output.note_off(note, 1.0, now);
        }
        let def = self.output.synth.to_def();
        let mut inst = Instrument::new(self.output.synth.clock().clone(), &def, self.voices)?;
        inst.route_to(self.output.synth.bus());
        if let Some(mut old) = self.output.instrument.replace(inst) {
            old.close();
        }
        debug!(voices = self.voices, "keyboard switched to polyphonic mode");
        Ok(())
    }

    /// Back to monophonic mode; the instrument is closed and dropped
    pub fn poly_off(&mut self) {
        if let Some(mut inst) = self.output.instrument.take() {
            inst.close();
            debug!("keyboard switched to monophonic mode");
        }
    }

    pub fn settings(&self) -> KeyboardDef {
        KeyboardDef {
            portamento: self.output.portamento,
            octave: self.octave,
            arpeggio: Some(self.arpeggiator.settings()),
        }
    }

    pub fn apply_settings(&mut self, def: &KeyboardDef) -> Result<(), ConfigError> {
        if let Some(arp) = def.arpeggio.as_ref() {
            self.arpeggiator.apply(arp)?;
        }
        self.set_portamento(def.portamento);
        self.set_octave(def.octave);
        Ok(())
    }

    /// Release expired per-note units
    pub fn collect(&mut self, now: f64) -> usize {
        let poly = self
            .output
            .instrument
            .as_mut()
            .map_or(0, |inst| inst.collect(now));
        self.output.synth.collect(now) + poly
    }

    pub fn drain_commands(&mut self) -> Vec<UnitCommand> {
        let mut cmds = self.output.synth.drain_commands();
        if let Some(inst) = self.output.instrument.as_mut() {
            cmds.extend(inst.drain_commands());
        }
        cmds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arpeggiator::ArpMode;
    use crate::clock::ManualClock;
    use crate::handler::HandlerState;
    use crate::serialize::{ArpeggioDef, GraphDef, NodeDataDef};
    use std::sync::Arc;

    fn router(clock: &ManualClock) -> KeyboardRouter {
        let mut def = GraphDef::new("kb")
            .with_node("out", NodeDataDef::new("out"))
            .with_node("osc", NodeDataDef::new("Oscillator"));
        def.connect("osc", "out").unwrap();
        let synth = Synth::from_def(Arc::new(clock.clone()), &def).unwrap();
        KeyboardRouter::new(synth, &EngineConfig::default()).unwrap()
    }

    fn osc_state(synth: &Synth) -> HandlerState {
        let id = synth.node_by_name("osc").unwrap();
        synth.node(id).unwrap().handler().unwrap().state()
    }

    #[test]
    fn test_mono_routing() {
        let clock = ManualClock::new(0.0);
        let mut kb = router(&clock);
        kb.key_down(60, 1.0);
        assert_eq!(kb.last_note(), Some(60));
        assert!(matches!(osc_state(kb.synth()), HandlerState::Sounding(_)));
        kb.key_up(60, 1.0);
        assert_eq!(kb.last_note(), None);
        assert_eq!(osc_state(kb.synth()), HandlerState::Idle);
    }

    #[test]
    fn test_poly_on_releases_mono_note() {
        let clock = ManualClock::new(0.0);
        let mut kb = router(&clock);
        kb.key_down(60, 1.0);
        kb.poly_on().unwrap();
        assert_eq!(osc_state(kb.synth()), HandlerState::Idle);
        assert_eq!(kb.instrument().unwrap().num_voices(), 8);

        kb.key_down(64, 1.0);
        kb.key_down(67, 1.0);
        let inst = kb.instrument().unwrap();
        assert_eq!(inst.voice(0).unwrap().last_note(), Some(64));
        assert_eq!(inst.voice(1).unwrap().last_note(), Some(67));
        // The mono synth stays silent in poly mode
        assert_eq!(osc_state(kb.synth()), HandlerState::Idle);

        kb.poly_off();
        assert!(!kb.is_poly());
    }

    #[test]
    fn test_portamento_applied_on_note_on() {
        let clock = ManualClock::new(0.0);
        let mut kb = router(&clock);
        kb.set_portamento(0.3);
        kb.key_down(60, 1.0);
        assert_eq!(kb.synth().portamento().time, 0.3);
    }

    #[test]
    fn test_arpeggiator_in_front() {
        let clock = ManualClock::new(0.0);
        let mut kb = router(&clock);
        kb.apply_settings(&KeyboardDef {
            portamento: 0.0,
            octave: None,
            arpeggio: Some(ArpeggioDef {
                bpm: 60.0,
                mode: ArpMode::Up,
                octave: 1,
            }),
        })
        .unwrap();
        kb.key_down(60, 1.0);
        kb.key_down(64, 1.0);
        assert_eq!(kb.last_note(), Some(60));
        clock.advance(0.25);
        assert_eq!(kb.wake(), 1);
        assert_eq!(kb.last_note(), Some(64));

        let settings = kb.settings();
        assert_eq!(settings.octave, None);
        assert_eq!(settings.arpeggio.unwrap().mode, ArpMode::Up);
    }

    #[test]
    fn test_octave_shifts_keys() {
        let clock = ManualClock::new(0.0);
        let mut kb = router(&clock);
        kb.apply_settings(&KeyboardDef {
            portamento: 0.0,
            octave: Some(-1),
            arpeggio: None,
        })
        .unwrap();
        kb.key_down(60, 1.0);
        assert_eq!(kb.last_note(), Some(48));

        // Changing octave while held still releases the note that sounds
        kb.set_octave(Some(2));
        kb.key_up(60, 1.0);
        assert_eq!(kb.last_note(), None);
        assert_eq!(osc_state(kb.synth()), HandlerState::Idle);

        // Out of range after the shift
        kb.key_down(120, 1.0);
        assert_eq!(kb.last_note(), None);
        assert_eq!(kb.settings().octave, Some(2));
    }
}
