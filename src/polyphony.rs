//! Polyphony Support
//!
//! An `Instrument` is a fixed pool of voices, each a private copy of the
//! same node graph, plus two queues of voice indices:
//!
//! - `released` - voices free for a new note, oldest release first
//! - `pressed` - voices holding a key, oldest press first
//!
//! A note-on takes the front of `released`, or steals the front of `pressed`
//! when every voice is held. Every voice index lives in exactly one queue.

use crate::arpeggiator::NoteSink;
use crate::catalog::NodeKind;
use crate::clock::SharedClock;
use crate::graph::{GraphError, Synth};
use crate::handler::Adsr;
use crate::ramp::Portamento;
use crate::serialize::GraphDef;
use crate::unit::{SampleBuffer, UnitCommand};
use std::collections::VecDeque;
use tracing::debug;

/// Extra time added to an envelope-derived note duration
const DURATION_MARGIN: f64 = 0.01;

/// One independent monophonic synth inside an instrument
#[derive(Debug)]
pub struct Voice {
    synth: Synth,
    last_note: Option<u8>,
}

impl Voice {
    fn new(clock: SharedClock, def: &GraphDef) -> Result<Self, GraphError> {
        Ok(Self {
            synth: Synth::from_def(clock, def)?,
            last_note: None,
        })
    }

    pub fn synth(&self) -> &Synth {
        &self.synth
    }

    pub fn synth_mut(&mut self) -> &mut Synth {
        &mut self.synth
    }

    /// Note the voice is sounding, `None` when idle
    pub fn last_note(&self) -> Option<u8> {
        self.last_note
    }

    pub fn is_sounding(&self) -> bool {
        self.last_note.is_some()
    }

    fn note_on(&mut self, note: u8, velocity: f64, time: Option<f64>) {
        self.synth.note_on(note, velocity, time);
        self.last_note = Some(note);
    }

    fn note_off(&mut self, note: u8, velocity: f64, time: Option<f64>) {
        self.synth.note_off(note, velocity, time);
        self.last_note = None;
    }

    fn close(&mut self) {
        if let Some(note) = self.last_note {
            self.note_off(note, 1.0, None);
        }
        self.synth.close();
    }
}

/// A polyphonic synth controlling a pool of voices
#[derive(Debug)]
pub struct Instrument {
    voices: Vec<Voice>,
    pressed: VecDeque<usize>,
    released: VecDeque<usize>,
    /// Glide state shared by every voice
    portamento: Portamento,
    duration: f64,
}

impl Instrument {
    /// Build `num_voices` copies of a graph. At least one voice is created.
    pub fn new(clock: SharedClock, def: &GraphDef, num_voices: usize) -> Result<Self, GraphError> {
        let num_voices = num_voices.max(1);
        let mut voices = Vec::with_capacity(num_voices);
        for _ in 0..num_voices {
            voices.push(Voice::new(clock.clone(), def)?);
        }
        let duration = note_duration(&voices[0].synth);
        Ok(Self {
            voices,
            pressed: VecDeque::with_capacity(num_voices),
            released: (0..num_voices).collect(),
            portamento: Portamento::with_time(def.portamento()),
            duration,
        })
    }

    pub fn num_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn voice(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index)
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    /// Voices holding a key, oldest first
    pub fn pressed(&self) -> &VecDeque<usize> {
        &self.pressed
    }

    /// Free voices, oldest release first
    pub fn released(&self) -> &VecDeque<usize> {
        &self.released
    }

    pub fn portamento(&self) -> Portamento {
        self.portamento
    }

    pub fn set_portamento_time(&mut self, time: f64) {
        self.portamento.time = time.max(0.0);
    }

    /// Default note length: the longest attack plus decay of any envelope
    /// in the graph, slightly padded. Zero when the graph has no envelope.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Pick a voice for a new note, stealing the longest-held one if none
    /// is free
    fn find_voice(&mut self) -> usize {
        if let Some(vnum) = self.released.pop_front() {
            return vnum;
        }
        match self.pressed.pop_front() {
            Some(vnum) => vnum,
            None => unreachable!("voice pool lost track of its voices"),
        }
    }

    /// Start a note on the next available voice, returning its index
    pub fn note_on(&mut self, note: u8, velocity: f64, time: Option<f64>) -> usize {
        let vnum = self.find_voice();
        self.pressed.push_back(vnum);
        let voice = &mut self.voices[vnum];
        voice.synth.set_portamento(self.portamento);
        voice.note_on(note, velocity, time);
        self.portamento = voice.synth.portamento();
        debug!(note, voice = vnum, "instrument note on");
        vnum
    }

    /// Release the voice sounding `note`. Returns `None` if the note was
    /// already stolen.
    pub fn note_off(&mut self, note: u8, velocity: f64, time: Option<f64>) -> Option<usize> {
        let vnum = self
            .voices
            .iter()
            .position(|v| v.last_note == Some(note))?;
        self.voices[vnum].note_off(note, velocity, time);
        self.pressed.retain(|&i| i != vnum);
        self.released.push_back(vnum);
        Some(vnum)
    }

    /// Release every sounding voice
    pub fn all_notes_off(&mut self, time: Option<f64>) {
        let sounding: Vec<u8> = self.voices.iter().filter_map(|v| v.last_note).collect();
        for note in sounding {
            self.note_off(note, 1.0, time);
        }
    }

    /// Silence every voice and drop all of its connections
    pub fn close(&mut self) {
        for voice in &mut self.voices {
            voice.close();
        }
        self.pressed.clear();
        self.released = (0..self.voices.len()).collect();
    }

    /// Send every voice's output to a host bus
    pub fn route_to(&mut self, bus: u32) {
        for voice in &mut self.voices {
            voice.synth.route_to(bus);
        }
    }

    /// Current value of a continuous parameter, read from the first voice
    pub fn param(&self, node: &str, param: &str) -> Result<f64, GraphError> {
        let synth = &self.voices[0].synth;
        let id = synth
            .node_by_name(node)
            .ok_or_else(|| GraphError::UnknownNode(node.to_string()))?;
        let unit = synth.node(id).map(|n| n.unit()).ok_or(GraphError::InvalidNode)?;
        synth
            .units()
            .param(unit, param)
            .map(|p| p.nominal())
            .ok_or_else(|| GraphError::UnknownParam {
                node: node.to_string(),
                param: param.to_string(),
            })
    }

    /// Set a continuous parameter on every voice, optionally ramping to it
    pub fn set_param(
        &mut self,
        node: &str,
        param: &str,
        value: f64,
        ramp_time: Option<f64>,
        exponential: bool,
    ) -> Result<(), GraphError> {
        for voice in &mut self.voices {
            let id = voice
                .synth
                .node_by_name(node)
                .ok_or_else(|| GraphError::UnknownNode(node.to_string()))?;
            voice
                .synth
                .set_param_value(id, param, value, ramp_time, exponential)?;
        }
        Ok(())
    }

    /// Every continuous parameter as `node/param`
    pub fn param_names(&self) -> Vec<String> {
        self.voices[0].synth.param_paths()
    }

    /// Hand a decoded sample to the named buffer node of every voice
    pub fn deliver_sample(&mut self, node: &str, buffer: SampleBuffer) -> Result<(), GraphError> {
        for voice in &mut self.voices {
            let id = voice
                .synth
                .node_by_name(node)
                .ok_or_else(|| GraphError::UnknownNode(node.to_string()))?;
            voice.synth.deliver_sample(id, buffer.clone())?;
        }
        Ok(())
    }

    /// Release expired per-note units in every voice
    pub fn collect(&mut self, now: f64) -> usize {
        self.voices.iter_mut().map(|v| v.synth.collect(now)).sum()
    }

    /// Take the unit commands of every voice, in voice order
    pub fn drain_commands(&mut self) -> Vec<UnitCommand> {
        self.voices
            .iter_mut()
            .flat_map(|v| v.synth.drain_commands())
            .collect()
    }
}

impl NoteSink for Instrument {
    fn note_on(&mut self, note: u8, velocity: f64, time: f64) {
        Instrument::note_on(self, note, velocity, Some(time));
    }

    fn note_off(&mut self, note: u8, velocity: f64, time: f64) {
        Instrument::note_off(self, note, velocity, Some(time));
    }
}

fn note_duration(synth: &Synth) -> f64 {
    let longest = synth
        .nodes()
        .filter(|(_, n)| n.kind() == NodeKind::Adsr)
        .filter_map(|(_, n)| Adsr::read(synth.units(), n.unit()))
        .map(|a| a.attack + a.decay)
        .fold(0.0, f64::max);
    if longest > 0.0 {
        longest + DURATION_MARGIN
    } else {
        0.0
    }
}
