//! Note Handlers
//!
//! Per-node state machines translating note events into operations on
//! processing units. The variant is fixed by the node's [`HandlerKind`] when
//! the node is built; dispatch is a `match`, never a name lookup.
//!
//! Sources that cannot be restarted (oscillators, buffer players) are
//! retriggered by spawning an ephemeral copy of the node's template unit per
//! note. The copy inherits the template's outputs and every control
//! connection feeding the template's parameters, and is scheduled for
//! release at its stop instant.

use crate::catalog::HandlerKind;
use crate::ramp::{ramp_param, reschedule, EnvelopeSegment, Portamento, Ramp};
use crate::unit::{AutomationEvent, Endpoint, UnitGraph, UnitId};
use tracing::warn;

/// Everything a handler touches while reacting to a note
pub struct NoteContext<'a> {
    pub graph: &'a mut UnitGraph,
    pub portamento: &'a Portamento,
    /// Current instant of the audio clock
    pub now: f64,
}

/// Idle/sounding state of a handler
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandlerState {
    Idle,
    /// An ephemeral unit spawned for the current note is playing
    Sounding(UnitId),
    /// The template unit itself is playing
    Playing,
}

/// Envelope settings read from an envelope unit's fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adsr {
    pub attack: f64,
    pub decay: f64,
    pub sustain: f64,
    pub release: f64,
    pub depth: f64,
}

impl Default for Adsr {
    fn default() -> Self {
        Self {
            attack: 0.2,
            decay: 0.5,
            sustain: 0.5,
            release: 1.0,
            depth: 1.0,
        }
    }
}

impl Adsr {
    /// Read the envelope settings of a unit, falling back to defaults for
    /// missing fields
    pub fn read(graph: &UnitGraph, unit: UnitId) -> Option<Self> {
        let u = graph.get(unit)?;
        let d = Adsr::default();
        Some(Self {
            attack: u.number("attack").unwrap_or(d.attack).max(0.0),
            decay: u.number("decay").unwrap_or(d.decay).max(0.0),
            sustain: u.number("sustain").unwrap_or(d.sustain),
            release: u.number("release").unwrap_or(d.release).max(0.0),
            depth: u.number("depth").unwrap_or(d.depth),
        })
    }
}

/// Note-event state machine attached to one node
#[derive(Debug, Clone)]
pub struct NoteHandler {
    kind: HandlerKind,
    template: UnitId,
    release_time: f64,
    last_note: Option<u8>,
    state: HandlerState,
    dropped: u64,
}

impl NoteHandler {
    pub fn new(kind: HandlerKind, template: UnitId) -> Self {
        Self {
            kind,
            template,
            release_time: 0.0,
            last_note: None,
            state: HandlerState::Idle,
            dropped: 0,
        }
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Unit the handler was built for
    pub fn template(&self) -> UnitId {
        self.template
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn last_note(&self) -> Option<u8> {
        self.last_note
    }

    /// Note-ons dropped because sample data was not ready
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Envelopes are triggered by the keyboard and own their release time;
    /// every other handler borrows the longest envelope release.
    pub fn is_key_triggered(&self) -> bool {
        self.kind == HandlerKind::Envelope
    }

    pub fn release_time(&self, graph: &UnitGraph) -> f64 {
        match self.kind {
            HandlerKind::Envelope => Adsr::read(graph, self.template)
                .map(|a| a.release)
                .unwrap_or(0.0),
            _ => self.release_time,
        }
    }

    /// Ignored by envelopes, whose release comes from their own settings
    pub fn set_release_time(&mut self, time: f64) {
        if !self.is_key_triggered() {
            self.release_time = time.max(0.0);
        }
    }

    pub fn note_on(&mut self, cx: &mut NoteContext, note: u8, ratio: f64, time: f64) {
        match self.kind {
            HandlerKind::Tone | HandlerKind::Lfo => self.tone_on(cx, note, ratio, time),
            HandlerKind::Sampled => self.sampled_on(cx, note, ratio, time),
            HandlerKind::Envelope => self.envelope_on(cx, note, time),
            HandlerKind::Restartable => {
                if self.state == HandlerState::Playing {
                    cx.graph.stop(self.template, time);
                }
                cx.graph.start(self.template, time);
                self.state = HandlerState::Playing;
                self.last_note = Some(note);
            }
            HandlerKind::SoundBank => self.bank_on(cx, note, time),
        }
    }

    pub fn note_off(&mut self, cx: &mut NoteContext, note: u8, time: f64) {
        // Stale key-up from an earlier note in monophonic mode
        if self.last_note != Some(note) {
            return;
        }
        match self.kind {
            HandlerKind::Tone | HandlerKind::Lfo | HandlerKind::Sampled => {
                if let HandlerState::Sounding(unit) = self.state {
                    retire(cx.graph, unit, time + self.release_time);
                }
                self.state = HandlerState::Idle;
            }
            HandlerKind::Envelope => {
                self.envelope_off(cx, time);
                self.last_note = None;
            }
            HandlerKind::Restartable => {
                if self.state == HandlerState::Playing {
                    cx.graph.stop(self.template, time + self.release_time);
                }
                self.state = HandlerState::Idle;
            }
            HandlerKind::SoundBank => {}
        }
    }

    fn tone_on(&mut self, cx: &mut NoteContext, note: u8, ratio: f64, time: f64) {
        self.cut_sounding(cx.graph, time);
        let Some(unit) = spawn(cx.graph, self.template) else {
            return;
        };
        if self.kind == HandlerKind::Lfo {
            // Modulators keep their own rate regardless of the note played
            if let Some(value) = cx.graph.param(unit, "frequency").map(|p| p.value()) {
                cx.graph
                    .automate(unit, "frequency", AutomationEvent::SetValue { value, time });
            }
        } else {
            ramp_param(cx.graph, unit, "frequency", ratio, time, cx.portamento);
        }
        cx.graph.start(unit, time);
        self.state = HandlerState::Sounding(unit);
        self.last_note = Some(note);
    }

    fn sampled_on(&mut self, cx: &mut NoteContext, note: u8, ratio: f64, time: f64) {
        self.cut_sounding(cx.graph, time);
        let buffer = cx.graph.get(self.template).and_then(|u| u.buffer.clone());
        let Some(buffer) = buffer else {
            self.dropped += 1;
            warn!(note, time, "sample not loaded, note dropped");
            return;
        };
        let Some(unit) = spawn(cx.graph, self.template) else {
            return;
        };
        cx.graph.set_buffer(unit, buffer);
        ramp_param(cx.graph, unit, "playbackRate", ratio, time, cx.portamento);
        cx.graph.start(unit, time);
        self.state = HandlerState::Sounding(unit);
        self.last_note = Some(note);
    }

    fn bank_on(&mut self, cx: &mut NoteContext, note: u8, time: f64) {
        let buffer = cx.graph.get(self.template).and_then(|u| {
            if u.bank.is_empty() {
                return None;
            }
            u.bank[note as usize % u.bank.len()].decoded.clone()
        });
        let Some(buffer) = buffer else {
            self.dropped += 1;
            warn!(note, time, "sound bank sample not loaded, note dropped");
            return;
        };
        let Some(unit) = spawn(cx.graph, self.template) else {
            return;
        };
        let end = time + buffer.duration();
        cx.graph.set_buffer(unit, buffer);
        cx.graph.start(unit, time);
        // One-shot: lives exactly as long as its sample
        cx.graph.schedule_release(unit, end);
    }

    fn envelope_on(&mut self, cx: &mut NoteContext, note: u8, time: f64) {
        self.last_note = Some(note);
        let Some(adsr) = Adsr::read(cx.graph, self.template) else {
            return;
        };
        for (unit, name) in envelope_targets(cx.graph, self.template) {
            let Some(param) = cx.graph.param(unit, &name) else {
                continue;
            };
            let v = param.nominal();
            let prior = param.segment;
            let initial = (1.0 - adsr.depth) * v;
            let sustain = v * adsr.sustain + initial * (1.0 - adsr.sustain);

            cx.graph.cancel_scheduled(unit, &name, time);
            // A ramp still in flight is issued again below
            cx.graph.prune_automation(unit, &name, time);
            let start = prior
                .as_ref()
                .and_then(|seg| reschedule(cx.graph, unit, &name, seg, time))
                .unwrap_or(initial);

            let attack = Ramp::new(start, v, time, time + adsr.attack);
            let decay = Ramp::new(v, sustain, attack.t2, attack.t2 + adsr.decay);
            attack.run(cx.graph, unit, &name, false);
            decay.run(cx.graph, unit, &name, true);
            if let Some(p) = cx.graph.param_mut(unit, &name) {
                p.segment = Some(EnvelopeSegment::Attack { attack, decay });
            }
        }
    }

    fn envelope_off(&mut self, cx: &mut NoteContext, time: f64) {
        let Some(adsr) = Adsr::read(cx.graph, self.template) else {
            return;
        };
        for (unit, name) in envelope_targets(cx.graph, self.template) {
            let Some(param) = cx.graph.param(unit, &name) else {
                continue;
            };
            let prior = param.segment;
            let v = prior
                .and_then(|seg| {
                    seg.value_at(time)
                        .or_else(|| (time >= seg.end_time()).then(|| seg.settled_value()))
                })
                .unwrap_or(param.nominal() * adsr.sustain);
            let floor = (1.0 - adsr.depth) * v;

            cx.graph.cancel_scheduled(unit, &name, time);
            cx.graph.prune_automation(unit, &name, time);
            if let Some(seg) = prior.as_ref() {
                reschedule(cx.graph, unit, &name, seg, time);
            }
            let release = Ramp::new(v, floor, time, time + adsr.release);
            release.run(cx.graph, unit, &name, false);
            if let Some(p) = cx.graph.param_mut(unit, &name) {
                p.segment = Some(EnvelopeSegment::Release(release));
            }
        }
    }

    /// Stop the unit sounding for the previous note at `time`, with no gap
    fn cut_sounding(&mut self, graph: &mut UnitGraph, time: f64) {
        if let HandlerState::Sounding(unit) = self.state {
            retire(graph, unit, time);
            self.state = HandlerState::Idle;
        }
    }

    /// Release the envelope's hold on a parameter it no longer drives,
    /// restoring the parameter's nominal value
    pub fn detach(&self, cx: &mut NoteContext, unit: UnitId, param: &str) {
        if !self.is_key_triggered() {
            return;
        }
        let Some(value) = cx.graph.param(unit, param).map(|p| p.nominal()) else {
            return;
        };
        cx.graph.cancel_scheduled(unit, param, cx.now);
        cx.graph.automate(
            unit,
            param,
            AutomationEvent::SetValue {
                value,
                time: cx.now,
            },
        );
        if let Some(p) = cx.graph.param_mut(unit, param) {
            p.segment = None;
        }
    }

    /// Destroy any unit spawned for the current note
    pub fn shutdown(&mut self, graph: &mut UnitGraph) {
        if let HandlerState::Sounding(unit) = self.state {
            graph.release(unit);
        }
        self.state = HandlerState::Idle;
        self.last_note = None;
    }
}

/// Parameters an envelope unit is connected to
fn envelope_targets(graph: &UnitGraph, envelope: UnitId) -> Vec<(UnitId, String)> {
    graph
        .get(envelope)
        .map(|u| {
            u.outputs()
                .iter()
                .filter_map(|e| match e {
                    Endpoint::Param(unit, name) => Some((*unit, name.clone())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Copy a template unit together with its output connections and the
/// control connections feeding its parameters
fn spawn(graph: &mut UnitGraph, template: UnitId) -> Option<UnitId> {
    let outputs = graph.get(template)?.outputs().to_vec();
    let controls = graph.inputs_of(template);
    let unit = graph.clone_unit(template)?;
    for out in outputs {
        graph.connect(unit, out);
    }
    for (src, endpoint) in controls {
        if let Endpoint::Param(_, name) = endpoint {
            graph.connect(src, Endpoint::Param(unit, name));
        }
    }
    Some(unit)
}

fn retire(graph: &mut UnitGraph, unit: UnitId, at: f64) {
    graph.stop(unit, at);
    graph.schedule_release(unit, at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{FieldValue, PlayState, SampleBuffer, SampleSlot, UnitKind};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    struct Rig {
        graph: UnitGraph,
        out: UnitId,
        portamento: Portamento,
    }

    impl Rig {
        fn new() -> Self {
            let mut graph = UnitGraph::new();
            let out = graph.create(UnitKind::Output, [("gain".to_string(), 1.0)], []);
            Self {
                graph,
                out,
                portamento: Portamento::default(),
            }
        }

        fn cx(&mut self, now: f64) -> NoteContext<'_> {
            NoteContext {
                graph: &mut self.graph,
                portamento: &self.portamento,
                now,
            }
        }

        fn osc(&mut self) -> UnitId {
            let id = self.graph.create(
                UnitKind::Oscillator,
                [("frequency".to_string(), 220.0), ("detune".to_string(), 0.0)],
                [],
            );
            self.graph.connect(id, Endpoint::Unit(self.out));
            id
        }

        fn envelope_on_gain(&mut self, adsr: Adsr) -> (UnitId, UnitId) {
            let gain = self
                .graph
                .create(UnitKind::Gain, [("gain".to_string(), 1.0)], []);
            let env = self.graph.create(
                UnitKind::Envelope,
                [],
                [
                    ("attack".to_string(), FieldValue::Number(adsr.attack)),
                    ("decay".to_string(), FieldValue::Number(adsr.decay)),
                    ("sustain".to_string(), FieldValue::Number(adsr.sustain)),
                    ("release".to_string(), FieldValue::Number(adsr.release)),
                    ("depth".to_string(), FieldValue::Number(adsr.depth)),
                ],
            );
            self.graph
                .connect(env, Endpoint::Param(gain, "gain".to_string()));
            (env, gain)
        }
    }

    fn sounding(h: &NoteHandler) -> UnitId {
        match h.state() {
            HandlerState::Sounding(u) => u,
            other => panic!("not sounding: {:?}", other),
        }
    }

    #[test]
    fn test_tone_spawns_scaled_copy() {
        let mut rig = Rig::new();
        let osc = rig.osc();
        let mut h = NoteHandler::new(HandlerKind::Tone, osc);
        h.note_on(&mut rig.cx(0.0), 69, 2.0, 1.0);

        let unit = sounding(&h);
        assert_ne!(unit, osc);
        let u = rig.graph.get(unit).unwrap();
        assert_eq!(u.state(), PlayState::Started(1.0));
        assert_eq!(u.outputs(), &[Endpoint::Unit(rig.out)]);
        assert_relative_eq!(rig.graph.param(unit, "frequency").unwrap().value_at(1.0), 440.0);
        // Template stays silent and untouched
        assert_eq!(rig.graph.get(osc).unwrap().state(), PlayState::Idle);
    }

    #[test]
    fn test_tone_legato_cuts_previous_at_new_time() {
        let mut rig = Rig::new();
        let osc = rig.osc();
        let mut h = NoteHandler::new(HandlerKind::Tone, osc);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.5);
        let first = sounding(&h);
        h.note_on(&mut rig.cx(0.0), 64, 1.2, 1.0);
        let second = sounding(&h);

        assert_ne!(first, second);
        assert_eq!(rig.graph.get(first).unwrap().state(), PlayState::Stopped(1.0));
        assert_eq!(rig.graph.get(second).unwrap().state(), PlayState::Started(1.0));
    }

    #[test]
    fn test_stale_note_off_ignored() {
        let mut rig = Rig::new();
        let osc = rig.osc();
        let mut h = NoteHandler::new(HandlerKind::Tone, osc);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.0);
        h.note_on(&mut rig.cx(0.0), 64, 1.0, 0.5);
        let unit = sounding(&h);
        h.note_off(&mut rig.cx(0.0), 60, 1.0);
        assert_eq!(rig.graph.get(unit).unwrap().state(), PlayState::Started(0.5));
        h.note_off(&mut rig.cx(0.0), 64, 1.0);
        assert_eq!(h.state(), HandlerState::Idle);
    }

    #[test]
    fn test_note_off_extends_by_release_and_expires() {
        let mut rig = Rig::new();
        let osc = rig.osc();
        let mut h = NoteHandler::new(HandlerKind::Tone, osc);
        h.set_release_time(0.5);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.0);
        let unit = sounding(&h);
        h.note_off(&mut rig.cx(0.0), 60, 1.0);
        assert_eq!(rig.graph.get(unit).unwrap().state(), PlayState::Stopped(1.5));
        assert_eq!(rig.graph.collect(1.4), 0);
        assert_eq!(rig.graph.collect(1.5), 1);
        assert!(!rig.graph.contains(unit));
    }

    #[test]
    fn test_spawn_copies_control_connections() {
        let mut rig = Rig::new();
        let osc = rig.osc();
        let lfo = rig.osc();
        rig.graph.disconnect_all(lfo);
        rig.graph
            .connect(lfo, Endpoint::Param(osc, "detune".to_string()));

        let mut h = NoteHandler::new(HandlerKind::Tone, osc);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.0);
        let unit = sounding(&h);
        assert!(rig
            .graph
            .get(lfo)
            .unwrap()
            .outputs()
            .contains(&Endpoint::Param(unit, "detune".to_string())));

        // Releasing the copy drops the control connection again
        rig.graph.release(unit);
        assert_eq!(rig.graph.get(lfo).unwrap().outputs().len(), 1);
    }

    #[test]
    fn test_lfo_ignores_note_ratio() {
        let mut rig = Rig::new();
        let lfo = rig.osc();
        let mut h = NoteHandler::new(HandlerKind::Lfo, lfo);
        rig.portamento = Portamento {
            time: 1.0,
            ratio: 0.5,
        };
        h.note_on(&mut rig.cx(0.0), 81, 4.0, 0.0);
        let unit = sounding(&h);
        let p = rig.graph.param(unit, "frequency").unwrap();
        assert_relative_eq!(p.value_at(0.0), 220.0);
        assert_relative_eq!(p.value_at(0.5), 220.0);
    }

    #[test]
    fn test_sampled_drops_until_buffer_delivered() {
        let mut rig = Rig::new();
        let player = rig
            .graph
            .create(UnitKind::BufferSource, [("playbackRate".to_string(), 1.0)], []);
        let mut h = NoteHandler::new(HandlerKind::Sampled, player);
        h.note_on(&mut rig.cx(0.0), 60, 2.0, 0.0);
        assert_eq!(h.state(), HandlerState::Idle);
        assert_eq!(h.dropped(), 1);

        rig.graph.get_mut(player).unwrap().buffer = Some(Arc::new(SampleBuffer {
            frames: 44100,
            channels: 1,
            sample_rate: 44100.0,
        }));
        h.note_on(&mut rig.cx(0.0), 60, 2.0, 1.0);
        let unit = sounding(&h);
        assert!(rig.graph.get(unit).unwrap().buffer.is_some());
        assert_relative_eq!(
            rig.graph.param(unit, "playbackRate").unwrap().value_at(1.0),
            2.0
        );
    }

    #[test]
    fn test_restartable_stops_before_restart() {
        let mut rig = Rig::new();
        let noise = rig.graph.create(UnitKind::Noise, [], []);
        let mut h = NoteHandler::new(HandlerKind::Restartable, noise);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.0);
        rig.graph.drain_commands();
        h.note_on(&mut rig.cx(0.0), 62, 1.0, 0.5);
        let cmds = rig.graph.drain_commands();
        assert_eq!(cmds.len(), 2);
        assert_eq!(rig.graph.get(noise).unwrap().state(), PlayState::Started(0.5));
        h.note_off(&mut rig.cx(0.0), 62, 1.0);
        assert_eq!(rig.graph.get(noise).unwrap().state(), PlayState::Stopped(1.0));
    }

    #[test]
    fn test_sound_bank_selects_by_note() {
        let mut rig = Rig::new();
        let bank = rig.graph.create(UnitKind::BufferSource, [], []);
        let slots: Vec<SampleSlot> = (0..3)
            .map(|i| SampleSlot {
                name: format!("s{}", i),
                encoded: vec![],
                decoded: Some(Arc::new(SampleBuffer {
                    frames: 1000 * (i + 1),
                    channels: 1,
                    sample_rate: 1000.0,
                })),
            })
            .collect();
        rig.graph.get_mut(bank).unwrap().bank = slots;

        let mut h = NoteHandler::new(HandlerKind::SoundBank, bank);
        h.note_on(&mut rig.cx(0.0), 61, 1.0, 0.0); // 61 % 3 == 1
        let shot = rig
            .graph
            .ids()
            .find(|&id| id != bank && rig.graph.get(id).unwrap().kind() == UnitKind::BufferSource)
            .unwrap();
        assert_eq!(rig.graph.get(shot).unwrap().buffer.as_ref().unwrap().frames, 2000);
        assert_eq!(rig.graph.get(shot).unwrap().expires_at(), Some(2.0));
        // No note-off behaviour
        h.note_off(&mut rig.cx(0.0), 61, 0.5);
        assert_eq!(rig.graph.get(shot).unwrap().state(), PlayState::Started(0.0));
    }

    #[test]
    fn test_envelope_attack_decay_release() {
        let mut rig = Rig::new();
        let adsr = Adsr {
            attack: 1.0,
            decay: 1.0,
            sustain: 0.5,
            release: 2.0,
            depth: 1.0,
        };
        let (env, gain) = rig.envelope_on_gain(adsr);
        let mut h = NoteHandler::new(HandlerKind::Envelope, env);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.0);
        let p = rig.graph.param(gain, "gain").unwrap();
        assert_relative_eq!(p.value_at(0.0), 0.0);
        assert_relative_eq!(p.value_at(0.5), 0.5);
        assert_relative_eq!(p.value_at(1.0), 1.0);
        assert_relative_eq!(p.value_at(1.5), 0.75);
        assert_relative_eq!(p.value_at(3.0), 0.5);

        h.note_off(&mut rig.cx(3.0), 60, 3.0);
        let p = rig.graph.param(gain, "gain").unwrap();
        assert_relative_eq!(p.value_at(3.0), 0.5);
        assert_relative_eq!(p.value_at(4.0), 0.25);
        assert_relative_eq!(p.value_at(6.0), 0.0);
        assert_eq!(h.release_time(&rig.graph), 2.0);
    }

    #[test]
    fn test_envelope_legato_during_decay_is_continuous() {
        let mut rig = Rig::new();
        let adsr = Adsr {
            attack: 1.0,
            decay: 2.0,
            sustain: 0.0,
            release: 1.0,
            depth: 1.0,
        };
        let (env, gain) = rig.envelope_on_gain(adsr);
        let mut h = NoteHandler::new(HandlerKind::Envelope, env);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.0);
        let decay = match rig.graph.param(gain, "gain").unwrap().segment() {
            Some(EnvelopeSegment::Attack { decay, .. }) => *decay,
            other => panic!("unexpected segment {:?}", other),
        };

        let t = 2.0;
        assert!(decay.inside(t));
        h.note_on(&mut rig.cx(t), 64, 1.0, t);
        let p = rig.graph.param(gain, "gain").unwrap();
        let attack = match p.segment() {
            Some(EnvelopeSegment::Attack { attack, .. }) => *attack,
            other => panic!("unexpected segment {:?}", other),
        };
        assert_relative_eq!(attack.v1, decay.cut(t).v2);
        let eps = 1e-6;
        assert_relative_eq!(p.value_at(t - eps), p.value_at(t), epsilon = 1e-5);
        assert_relative_eq!(p.value_at(t), 0.5);
    }

    #[test]
    fn test_envelope_note_off_mid_attack_releases_from_current_value() {
        let mut rig = Rig::new();
        let adsr = Adsr {
            attack: 2.0,
            decay: 1.0,
            sustain: 0.5,
            release: 1.0,
            depth: 1.0,
        };
        let (env, gain) = rig.envelope_on_gain(adsr);
        let mut h = NoteHandler::new(HandlerKind::Envelope, env);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.0);
        h.note_off(&mut rig.cx(0.0), 60, 1.0);
        let p = rig.graph.param(gain, "gain").unwrap();
        assert_relative_eq!(p.value_at(0.5), 0.25);
        assert_relative_eq!(p.value_at(1.0), 0.5);
        assert_relative_eq!(p.value_at(1.5), 0.25);
        assert_relative_eq!(p.value_at(2.5), 0.0);
    }

    #[test]
    fn test_envelope_restarts_from_depth_floor_after_release() {
        let mut rig = Rig::new();
        let adsr = Adsr {
            attack: 1.0,
            decay: 1.0,
            sustain: 0.5,
            release: 1.0,
            depth: 0.5,
        };
        let (env, gain) = rig.envelope_on_gain(adsr);
        let mut h = NoteHandler::new(HandlerKind::Envelope, env);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.0);
        h.note_off(&mut rig.cx(3.0), 60, 3.0);
        // Release has settled long before the next note
        h.note_on(&mut rig.cx(10.0), 62, 1.0, 10.0);
        let p = rig.graph.param(gain, "gain").unwrap();
        assert_relative_eq!(p.value_at(10.0), 0.5);
        assert_relative_eq!(p.value_at(10.5), 0.75);
        assert_relative_eq!(p.value_at(11.0), 1.0);
    }

    #[test]
    fn test_envelope_timeline_stays_bounded() {
        let mut rig = Rig::new();
        let adsr = Adsr {
            attack: 0.1,
            decay: 0.1,
            sustain: 0.5,
            release: 0.1,
            depth: 1.0,
        };
        let (env, gain) = rig.envelope_on_gain(adsr);
        let mut h = NoteHandler::new(HandlerKind::Envelope, env);
        for i in 0..2000 {
            let t = i as f64;
            h.note_on(&mut rig.cx(t), 60, 1.0, t);
            h.note_off(&mut rig.cx(t + 0.5), 60, t + 0.5);
            assert!(rig.graph.param(gain, "gain").unwrap().events().len() <= 6);
        }
        let p = rig.graph.param(gain, "gain").unwrap();
        assert_relative_eq!(p.value_at(1999.1), 1.0, epsilon = 1e-9);
        assert_relative_eq!(p.value_at(1999.7), 0.0);
    }

    #[test]
    fn test_partial_depth_floor() {
        let mut rig = Rig::new();
        let adsr = Adsr {
            attack: 0.0,
            decay: 0.0,
            sustain: 1.0,
            release: 1.0,
            depth: 0.5,
        };
        let (env, gain) = rig.envelope_on_gain(adsr);
        let mut h = NoteHandler::new(HandlerKind::Envelope, env);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.0);
        h.note_off(&mut rig.cx(0.0), 60, 1.0);
        let p = rig.graph.param(gain, "gain").unwrap();
        assert_relative_eq!(p.value_at(0.5), 1.0);
        assert_relative_eq!(p.value_at(2.0), 0.5);
    }

    #[test]
    fn test_detach_restores_nominal() {
        let mut rig = Rig::new();
        let (env, gain) = rig.envelope_on_gain(Adsr::default());
        let mut h = NoteHandler::new(HandlerKind::Envelope, env);
        h.note_on(&mut rig.cx(0.0), 60, 1.0, 0.0);
        h.detach(&mut rig.cx(0.1), gain, "gain");
        let p = rig.graph.param(gain, "gain").unwrap();
        assert!(p.segment().is_none());
        assert_relative_eq!(p.value_at(5.0), 1.0);
    }
}
