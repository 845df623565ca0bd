//! Live Coding
//!
//! Script surface over the track scheduler. A [`LiveCoding`] session owns
//! every instrument, effect and track a script creates, plus the look-ahead
//! timer that advances the tracks. Scripts are plain Rust closures run
//! through [`LiveCoding::execute`]:
//!
//! ```ignore
//! use synthflow::prelude::*;
//!
//! session.execute(|lc| {
//!     let bass = lc.instrument("Sub Bass", Some("bass"))?;
//!     let echo = lc.effect("Delay", None)?;
//!     lc.loop_track("groove", |t| {
//!         t.instrument(bass)?.effect(echo)?;
//!         t.play(36)?.sleep(1.0).play(43)?.sleep(1.0);
//!         Ok(())
//!     })?;
//!     Ok(())
//! })?;
//! ```
//!
//! Each track plays through its own gain unit, reached over a numbered host
//! bus, and from there through its effect chain to the master bus.

use crate::catalog::{NodeCatalog, NodeDef, NodeKind};
use crate::clock::SharedClock;
use crate::config::{ConfigError, EngineConfig};
use crate::graph::GraphError;
use crate::polyphony::Instrument;
use crate::presets::{PresetError, PresetLibrary, PresetRef};
use crate::timer::{panic_message, Timer};
use crate::track::{
    EffectKey, InstrumentKey, NoteEvent, NoteOptions, Performer, Track, TrackScheduler,
};
use crate::unit::{AutomationEvent, Endpoint, UnitCommand, UnitGraph, UnitId, UnitKind};
use slotmap::SlotMap;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::AtomicBool;
use tracing::{debug, error, info, warn};

/// Lowest gain a track is set to; muting parks the gain here
pub const MIN_GAIN: f64 = 1e-5;

const GAIN: &str = "gain";

/// What a script call did wrong
#[derive(Debug)]
pub enum LiveErrorKind {
    /// A note or parameter event before any `instrument` call
    NoInstrument,
    /// Instrument parameter not written as `node/param`
    ParamPath(String),
    UnknownInstrumentParam {
        instrument: String,
        node: String,
        param: String,
    },
    UnknownEffectParam {
        effect: String,
        param: String,
    },
    UnknownEffect(String),
    /// Instrument or effect key not issued by this session
    StaleKey,
    UnknownTrack(String),
    Graph(GraphError),
    Preset(PresetError),
    Config(ConfigError),
}

impl std::fmt::Display for LiveErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveErrorKind::NoInstrument => write!(
                f,
                "Must call instrument before playing a note or setting parameters"
            ),
            LiveErrorKind::ParamPath(path) => write!(
                f,
                "Instrument parameters require \"node/param\" format, got \"{}\"",
                path
            ),
            LiveErrorKind::UnknownInstrumentParam {
                instrument,
                node,
                param,
            } => write!(
                f,
                "Parameter \"{}\" not found in node \"{}\" of instrument \"{}\"",
                param, node, instrument
            ),
            LiveErrorKind::UnknownEffectParam { effect, param } => {
                write!(f, "Parameter \"{}\" not found in effect \"{}\"", param, effect)
            }
            LiveErrorKind::UnknownEffect(name) => write!(f, "Effect \"{}\" does not exist", name),
            LiveErrorKind::StaleKey => write!(f, "Instrument or effect is not part of this session"),
            LiveErrorKind::UnknownTrack(name) => write!(f, "Track \"{}\" does not exist", name),
            LiveErrorKind::Graph(e) => write!(f, "{}", e),
            LiveErrorKind::Preset(e) => write!(f, "{}", e),
            LiveErrorKind::Config(e) => write!(f, "{}", e),
        }
    }
}

/// Error raised by a script call, tagged with the calling source location
#[derive(Debug)]
pub struct LiveError {
    kind: LiveErrorKind,
    location: &'static Location<'static>,
}

impl LiveError {
    #[track_caller]
    pub fn new(kind: LiveErrorKind) -> Self {
        Self::at(kind, Location::caller())
    }

    pub fn at(kind: LiveErrorKind, location: &'static Location<'static>) -> Self {
        Self { kind, location }
    }

    pub fn kind(&self) -> &LiveErrorKind {
        &self.kind
    }

    /// Script line that made the failing call
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl std::fmt::Display for LiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for LiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            LiveErrorKind::Graph(e) => Some(e),
            LiveErrorKind::Preset(e) => Some(e),
            LiveErrorKind::Config(e) => Some(e),
            _ => None,
        }
    }
}

/// Failure of a whole script run
#[derive(Debug)]
pub enum ScriptError {
    Failed(LiveError),
    Panicked(String),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Failed(e) => write!(f, "{} (at {})", e, e.location()),
            ScriptError::Panicked(msg) => write!(f, "Script panicked: {}", msg),
        }
    }
}

impl std::error::Error for ScriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScriptError::Failed(e) => Some(e),
            ScriptError::Panicked(_) => None,
        }
    }
}

impl From<LiveError> for ScriptError {
    fn from(e: LiveError) -> Self {
        ScriptError::Failed(e)
    }
}

/// Jump a unit parameter to `value` now, dropping pending automation
fn set_value_now(graph: &mut UnitGraph, unit: UnitId, name: &str, value: f64, now: f64) {
    graph.cancel_scheduled(unit, name, now);
    graph.automate(unit, name, AutomationEvent::SetValue { value, time: now });
}

/// Move a unit parameter to `value`, over `ramp` seconds when given
fn ramp_value(
    graph: &mut UnitGraph,
    unit: UnitId,
    name: &str,
    value: f64,
    ramp: Option<f64>,
    exponential: bool,
    now: f64,
) {
    let Some(ramp) = ramp else {
        set_value_now(graph, unit, name, value, now);
        return;
    };
    let current = graph.param(unit, name).map_or(value, |p| p.value_at(now));
    set_value_now(graph, unit, name, current, now);
    let time = now + ramp.max(0.0);
    let event = if exponential {
        AutomationEvent::ExponentialRamp { value, time }
    } else {
        AutomationEvent::LinearRamp { value, time }
    };
    graph.automate(unit, name, event);
}

/// Polyphonic instrument created from a preset
#[derive(Debug)]
pub struct LcInstrument {
    name: String,
    instrument: Instrument,
    duration: f64,
}

impl LcInstrument {
    /// Preset name the instrument was built from
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default note length, 0 when the preset has no envelope
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn instrument_mut(&mut self) -> &mut Instrument {
        &mut self.instrument
    }

    fn resolve<'p>(
        &self,
        path: &'p str,
        at: &'static Location<'static>,
    ) -> Result<(&'p str, &'p str, f64), LiveError> {
        let (node, param) = path
            .split_once('/')
            .ok_or_else(|| LiveError::at(LiveErrorKind::ParamPath(path.to_string()), at))?;
        let value = self.instrument.param(node, param).map_err(|_| {
            LiveError::at(
                LiveErrorKind::UnknownInstrumentParam {
                    instrument: self.name.clone(),
                    node: node.to_string(),
                    param: param.to_string(),
                },
                at,
            )
        })?;
        Ok((node, param, value))
    }

    /// Value of a `node/param` parameter
    #[track_caller]
    pub fn param(&self, path: &str) -> Result<f64, LiveError> {
        self.resolve(path, Location::caller()).map(|(_, _, v)| v)
    }

    /// Set a `node/param` parameter on every voice
    #[track_caller]
    pub fn set_param(
        &mut self,
        path: &str,
        value: f64,
        ramp: Option<f64>,
        exponential: bool,
    ) -> Result<(), LiveError> {
        let at = Location::caller();
        let (node, param, _) = self.resolve(path, at)?;
        self.instrument
            .set_param(node, param, value, ramp, exponential)
            .map_err(|e| LiveError::at(LiveErrorKind::Graph(e), at))
    }

    /// Every continuous parameter as `node/param`
    pub fn param_names(&self) -> Vec<String> {
        self.instrument.param_names()
    }
}

/// Effect unit placed in a track's output chain
#[derive(Debug, Clone)]
pub struct Effect {
    name: String,
    kind: NodeKind,
    unit: UnitId,
}

impl Effect {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    fn def(&self) -> Option<&'static NodeDef> {
        NodeCatalog::global().get(self.kind)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.def()
            .is_some_and(|d| d.automatable_params().any(|p| p == name))
    }

    pub fn param_names(&self) -> Vec<String> {
        self.def()
            .map(|d| d.automatable_params().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn check_param(&self, name: &str, at: &'static Location<'static>) -> Result<(), LiveError> {
        if self.has_param(name) {
            Ok(())
        } else {
            Err(LiveError::at(
                LiveErrorKind::UnknownEffectParam {
                    effect: self.name.clone(),
                    param: name.to_string(),
                },
                at,
            ))
        }
    }
}

/// Resolve an effect name, with or without the `WebAudio/` prefix
fn effect_kind(name: &str) -> Option<NodeKind> {
    let bare = match name.split_once('/') {
        Some(("WebAudio", rest)) => rest,
        Some(_) => return None,
        None => name,
    };
    let kind = match bare {
        "Gain" => NodeKind::Gain,
        "BiquadFilter" => NodeKind::Filter,
        "Delay" => NodeKind::Delay,
        "StereoPanner" => NodeKind::StereoPan,
        "DynamicsCompressor" => NodeKind::Compressor,
        other => NodeKind::from_type_name(other)?,
    };
    NodeCatalog::global()
        .get(kind)
        .filter(|d| d.is_effect())
        .map(|d| d.kind)
}

/// Mutable view of one effect
pub struct EffectHandle<'a> {
    effect: &'a Effect,
    mixer: &'a mut UnitGraph,
    now: f64,
}

impl EffectHandle<'_> {
    pub fn effect(&self) -> &Effect {
        self.effect
    }

    #[track_caller]
    pub fn param(&self, name: &str) -> Result<f64, LiveError> {
        self.effect.check_param(name, Location::caller())?;
        Ok(self
            .mixer
            .param(self.effect.unit, name)
            .map_or(0.0, |p| p.value_at(self.now)))
    }

    /// Set a parameter, optionally ramping to it over `ramp` seconds
    #[track_caller]
    pub fn set_param(
        &mut self,
        name: &str,
        value: f64,
        ramp: Option<f64>,
        exponential: bool,
    ) -> Result<&mut Self, LiveError> {
        self.effect.check_param(name, Location::caller())?;
        ramp_value(self.mixer, self.effect.unit, name, value, ramp, exponential, self.now);
        Ok(self)
    }

    pub fn param_names(&self) -> Vec<String> {
        self.effect.param_names()
    }
}

/// Instruments, effects and the mixer units tracks play through
#[derive(Debug, Default)]
pub struct Rack {
    instruments: SlotMap<InstrumentKey, LcInstrument>,
    effects: SlotMap<EffectKey, Effect>,
    instrument_names: BTreeMap<String, InstrumentKey>,
    effect_names: BTreeMap<String, EffectKey>,
    mixer: UnitGraph,
}

impl Rack {
    pub fn instrument(&self, key: InstrumentKey) -> Option<&LcInstrument> {
        self.instruments.get(key)
    }

    pub fn instrument_mut(&mut self, key: InstrumentKey) -> Option<&mut LcInstrument> {
        self.instruments.get_mut(key)
    }

    pub fn effect(&self, key: EffectKey) -> Option<&Effect> {
        self.effects.get(key)
    }

    pub fn instrument_named(&self, name: &str) -> Option<InstrumentKey> {
        self.instrument_names.get(name).copied()
    }

    pub fn effect_named(&self, name: &str) -> Option<EffectKey> {
        self.effect_names.get(name).copied()
    }

    pub fn mixer(&self) -> &UnitGraph {
        &self.mixer
    }

    fn check_options(
        &self,
        options: &NoteOptions,
        at: &'static Location<'static>,
    ) -> Result<(), LiveError> {
        match options {
            NoteOptions::Instrument { instrument, params } => {
                let inst = self
                    .instruments
                    .get(*instrument)
                    .ok_or_else(|| LiveError::at(LiveErrorKind::StaleKey, at))?;
                for (path, _) in params {
                    inst.resolve(path, at)?;
                }
            }
            NoteOptions::Effect { effect, params } => {
                let e = self
                    .effects
                    .get(*effect)
                    .ok_or_else(|| LiveError::at(LiveErrorKind::StaleKey, at))?;
                for (name, _) in params {
                    e.check_param(name, at)?;
                }
            }
        }
        Ok(())
    }
}

impl Performer for Rack {
    fn note_on(&mut self, instrument: InstrumentKey, note: u8, velocity: f64, time: f64) {
        if let Some(inst) = self.instruments.get_mut(instrument) {
            inst.instrument.note_on(note, velocity, Some(time));
        }
    }

    fn note_off(&mut self, instrument: InstrumentKey, note: u8, velocity: f64, time: f64) {
        if let Some(inst) = self.instruments.get_mut(instrument) {
            inst.instrument.note_off(note, velocity, Some(time));
        }
    }

    fn note_duration(&self, instrument: InstrumentKey) -> f64 {
        self.instruments.get(instrument).map_or(0.0, |i| i.duration)
    }

    fn instrument_name(&self, instrument: InstrumentKey) -> &str {
        self.instruments.get(instrument).map_or("", |i| i.name.as_str())
    }

    fn apply(&mut self, options: &NoteOptions) {
        match options {
            NoteOptions::Instrument { instrument, params } => {
                let Some(inst) = self.instruments.get_mut(*instrument) else {
                    return;
                };
                for (path, value) in params {
                    if let Err(e) = inst.set_param(path, *value, None, false) {
                        warn!(instrument = %inst.name, error = %e, "parameter event skipped");
                    }
                }
            }
            NoteOptions::Effect { effect, params } => {
                let Some(e) = self.effects.get(*effect) else {
                    return;
                };
                for (name, value) in params {
                    if e.has_param(name) {
                        self.mixer.set_param(e.unit, name, *value);
                    } else {
                        warn!(effect = %e.name, param = %name, "parameter event skipped");
                    }
                }
            }
        }
    }
}

/// Per-track mixer state, kept across redefinitions of the same name
#[derive(Debug, Clone)]
struct TrackControl {
    bus: u32,
    gain: UnitId,
    last_gain: f64,
    chain: Vec<EffectKey>,
}

/// Collects the events of a track while its script closure runs
pub struct TrackBuilder<'a> {
    track: &'a mut Track,
    rack: &'a Rack,
    bpm: f64,
    instrument: Option<InstrumentKey>,
    routed: Vec<InstrumentKey>,
    effects: Vec<EffectKey>,
    velocity: f64,
    transpose: i32,
}

impl<'a> TrackBuilder<'a> {
    fn new(track: &'a mut Track, rack: &'a Rack, bpm: f64) -> Self {
        Self {
            track,
            rack,
            bpm,
            instrument: None,
            routed: Vec::new(),
            effects: Vec::new(),
            velocity: 1.0,
            transpose: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.track.name()
    }

    /// Write position in seconds from the track start
    pub fn time(&self) -> f64 {
        self.track.time()
    }

    /// Play the following notes on `key`, routing it through this track
    #[track_caller]
    pub fn instrument(&mut self, key: InstrumentKey) -> Result<&mut Self, LiveError> {
        if !self.rack.instruments.contains_key(key) {
            return Err(LiveError::new(LiveErrorKind::StaleKey));
        }
        self.instrument = Some(key);
        if !self.routed.contains(&key) {
            self.routed.push(key);
        }
        Ok(self)
    }

    /// Append an effect to the track's output chain
    #[track_caller]
    pub fn effect(&mut self, key: EffectKey) -> Result<&mut Self, LiveError> {
        if !self.rack.effects.contains_key(key) {
            return Err(LiveError::new(LiveErrorKind::StaleKey));
        }
        self.effects.push(key);
        Ok(self)
    }

    /// Velocity of the following notes
    pub fn volume(&mut self, velocity: f64) -> &mut Self {
        self.velocity = velocity;
        self
    }

    /// Semitone offset added to the following notes
    pub fn transpose(&mut self, semitones: i32) -> &mut Self {
        self.transpose = semitones;
        self
    }

    #[track_caller]
    pub fn play(&mut self, note: i32) -> Result<&mut Self, LiveError> {
        self.push(note, None, None, Location::caller())
    }

    #[track_caller]
    pub fn play_for(&mut self, note: i32, duration: f64) -> Result<&mut Self, LiveError> {
        self.push(note, Some(duration), None, Location::caller())
    }

    /// Play a note with an explicit duration and parameter changes
    #[track_caller]
    pub fn play_with(
        &mut self,
        note: i32,
        duration: Option<f64>,
        options: Option<NoteOptions>,
    ) -> Result<&mut Self, LiveError> {
        self.push(note, duration, options, Location::caller())
    }

    /// Parameter changes at the current position, without a note
    #[track_caller]
    pub fn params(&mut self, options: NoteOptions) -> Result<&mut Self, LiveError> {
        self.push(0, None, Some(options), Location::caller())
    }

    /// Set a `node/param` parameter of the current instrument
    #[track_caller]
    pub fn param(&mut self, path: &str, value: f64) -> Result<&mut Self, LiveError> {
        let at = Location::caller();
        let instrument = self
            .instrument
            .ok_or_else(|| LiveError::at(LiveErrorKind::NoInstrument, at))?;
        let options = NoteOptions::Instrument {
            instrument,
            params: vec![(path.to_string(), value)],
        };
        self.push(0, None, Some(options), at)
    }

    #[track_caller]
    pub fn effect_param(
        &mut self,
        effect: EffectKey,
        name: &str,
        value: f64,
    ) -> Result<&mut Self, LiveError> {
        let options = NoteOptions::Effect {
            effect,
            params: vec![(name.to_string(), value)],
        };
        self.push(0, None, Some(options), Location::caller())
    }

    /// Advance the write position by `beats` at the session tempo
    pub fn sleep(&mut self, beats: f64) -> &mut Self {
        self.track.advance(beats * 60.0 / self.bpm);
        self
    }

    pub fn repeat<F>(&mut self, times: usize, mut body: F) -> Result<&mut Self, LiveError>
    where
        F: FnMut(&mut Self, usize) -> Result<(), LiveError>,
    {
        for i in 0..times {
            body(self, i)?;
        }
        Ok(self)
    }

    fn push(
        &mut self,
        note: i32,
        duration: Option<f64>,
        options: Option<NoteOptions>,
        at: &'static Location<'static>,
    ) -> Result<&mut Self, LiveError> {
        let instrument = self
            .instrument
            .ok_or_else(|| LiveError::at(LiveErrorKind::NoInstrument, at))?;
        if let Some(opts) = options.as_ref() {
            self.rack.check_options(opts, at)?;
        }
        let number = if note > 0 { note + self.transpose } else { note };
        self.track.push(NoteEvent {
            instrument,
            number,
            time: 0.0,
            velocity: self.velocity,
            duration,
            options,
        });
        Ok(self)
    }
}

/// Control over a registered track
#[derive(Debug)]
pub struct TrackHandle<'a> {
    name: String,
    scheduler: &'a mut TrackScheduler,
    control: &'a mut TrackControl,
    mixer: &'a mut UnitGraph,
    now: f64,
}

impl TrackHandle<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The playing track, or `None` while it is only queued as a replacement
    pub fn track(&self) -> Option<&Track> {
        self.scheduler.get(&self.name)
    }

    /// Host bus the track's instruments play into
    pub fn bus(&self) -> u32 {
        self.control.bus
    }

    pub fn gain_value(&self) -> f64 {
        self.mixer
            .param(self.control.gain, GAIN)
            .map_or(0.0, |p| p.value_at(self.now))
    }

    pub fn mute(&mut self) -> &mut Self {
        self.control.last_gain = self.gain_value();
        set_value_now(self.mixer, self.control.gain, GAIN, MIN_GAIN, self.now);
        self
    }

    pub fn unmute(&mut self) -> &mut Self {
        set_value_now(self.mixer, self.control.gain, GAIN, self.control.last_gain, self.now);
        self
    }

    /// Set the track gain, with an exponential ramp over `ramp` seconds
    pub fn gain(&mut self, value: f64, ramp: Option<f64>) -> &mut Self {
        let value = value.max(MIN_GAIN);
        ramp_value(self.mixer, self.control.gain, GAIN, value, ramp, true, self.now);
        self
    }

    /// Stop at the end of the current iteration
    pub fn stop(&mut self) -> &mut Self {
        self.scheduler.for_name(&self.name, Track::stop);
        self
    }

    pub fn pause(&mut self) -> &mut Self {
        self.scheduler.for_name(&self.name, Track::pause);
        self
    }

    pub fn resume(&mut self) -> &mut Self {
        self.scheduler.for_name(&self.name, Track::resume);
        self
    }

    /// Silence the track and drop it right away
    pub fn delete(mut self) {
        self.mute();
        self.scheduler.remove(&self.name);
        debug!(track = %self.name, "track deleted");
    }
}

/// A live-coding session
pub struct LiveCoding {
    config: EngineConfig,
    clock: SharedClock,
    timer: Timer,
    presets: PresetLibrary,
    rack: Rack,
    scheduler: TrackScheduler,
    controls: BTreeMap<String, TrackControl>,
    next_bus: u32,
}

impl LiveCoding {
    /// Create a session whose timer starts at the current clock instant
    pub fn new(
        clock: SharedClock,
        presets: PresetLibrary,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut timer = Timer::new(clock.clone(), config.live_timer())?;
        timer.arm();
        Ok(Self {
            config,
            clock,
            timer,
            presets,
            rack: Rack::default(),
            scheduler: TrackScheduler::new(),
            controls: BTreeMap::new(),
            next_bus: 1,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn scheduler(&self) -> &TrackScheduler {
        &self.scheduler
    }

    pub fn rack(&self) -> &Rack {
        &self.rack
    }

    pub fn presets(&self) -> &PresetLibrary {
        &self.presets
    }

    pub fn presets_mut(&mut self) -> &mut PresetLibrary {
        &mut self.presets
    }

    /// Run a script. Errors and panics are reported without touching what
    /// the tracks already scheduled.
    pub fn execute<F>(&mut self, script: F) -> Result<(), ScriptError>
    where
        F: FnOnce(&mut LiveCoding) -> Result<(), LiveError>,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| script(self))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(error = %e, location = %e.location(), "script failed");
                Err(ScriptError::Failed(e))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(message = %message, "script panicked");
                Err(ScriptError::Panicked(message))
            }
        }
    }

    /// Create an instrument with the configured voice count
    #[track_caller]
    pub fn instrument(
        &mut self,
        preset: impl Into<PresetRef>,
        name: Option<&str>,
    ) -> Result<InstrumentKey, LiveError> {
        let voices = self.config.voices;
        self.add_instrument(preset.into(), name, voices, Location::caller())
    }

    #[track_caller]
    pub fn instrument_with_voices(
        &mut self,
        preset: impl Into<PresetRef>,
        name: Option<&str>,
        voices: usize,
    ) -> Result<InstrumentKey, LiveError> {
        self.add_instrument(preset.into(), name, voices, Location::caller())
    }

    fn add_instrument(
        &mut self,
        preset: PresetRef,
        name: Option<&str>,
        voices: usize,
        at: &'static Location<'static>,
    ) -> Result<InstrumentKey, LiveError> {
        let def = self
            .presets
            .get(&preset)
            .map_err(|e| LiveError::at(LiveErrorKind::Preset(e), at))?;
        let instrument = Instrument::new(self.clock.clone(), &def, voices)
            .map_err(|e| LiveError::at(LiveErrorKind::Graph(e), at))?;
        let preset_name = def.name.clone().unwrap_or_default();
        let key_name = name.map_or_else(|| preset_name.clone(), str::to_string);
        let duration = instrument.duration();
        let key = self.rack.instruments.insert(LcInstrument {
            name: preset_name,
            instrument,
            duration,
        });
        debug!(instrument = %key_name, voices, duration, "instrument created");
        self.rack.instrument_names.insert(key_name, key);
        Ok(key)
    }

    /// Create an effect from a node type or a `WebAudio/` effect name
    #[track_caller]
    pub fn effect(&mut self, kind: &str, name: Option<&str>) -> Result<EffectKey, LiveError> {
        let at = Location::caller();
        let def = effect_kind(kind)
            .and_then(|k| NodeCatalog::global().get(k))
            .ok_or_else(|| LiveError::at(LiveErrorKind::UnknownEffect(kind.to_string()), at))?;
        let unit = self
            .rack
            .mixer
            .create(def.unit, def.initial_params(), def.initial_fields());
        let effect_name = name.unwrap_or(kind).to_string();
        let key = self.rack.effects.insert(Effect {
            name: effect_name.clone(),
            kind: def.kind,
            unit,
        });
        debug!(effect = %effect_name, kind = %def.kind, "effect created");
        self.rack.effect_names.insert(effect_name, key);
        Ok(key)
    }

    pub fn instrument_named(&self, name: &str) -> Option<InstrumentKey> {
        self.rack.instrument_named(name)
    }

    pub fn effect_named(&self, name: &str) -> Option<EffectKey> {
        self.rack.effect_named(name)
    }

    pub fn get_instrument(&self, key: InstrumentKey) -> Option<&LcInstrument> {
        self.rack.instrument(key)
    }

    pub fn get_instrument_mut(&mut self, key: InstrumentKey) -> Option<&mut LcInstrument> {
        self.rack.instrument_mut(key)
    }

    pub fn effect_handle(&mut self, key: EffectKey) -> Option<EffectHandle<'_>> {
        let now = self.clock.now();
        let effect = self.rack.effects.get(key)?;
        Some(EffectHandle {
            effect,
            mixer: &mut self.rack.mixer,
            now,
        })
    }

    /// Define a one-shot track. Redefining a playing track replaces it at
    /// the end of its current iteration.
    #[track_caller]
    pub fn track<F>(&mut self, name: &str, build: F) -> Result<TrackHandle<'_>, LiveError>
    where
        F: FnOnce(&mut TrackBuilder<'_>) -> Result<(), LiveError>,
    {
        self.define_track(name, false, build, Location::caller())
    }

    /// Define a track that repeats until stopped
    #[track_caller]
    pub fn loop_track<F>(&mut self, name: &str, build: F) -> Result<TrackHandle<'_>, LiveError>
    where
        F: FnOnce(&mut TrackBuilder<'_>) -> Result<(), LiveError>,
    {
        self.define_track(name, true, build, Location::caller())
    }

    fn define_track<F>(
        &mut self,
        name: &str,
        looping: bool,
        build: F,
        at: &'static Location<'static>,
    ) -> Result<TrackHandle<'_>, LiveError>
    where
        F: FnOnce(&mut TrackBuilder<'_>) -> Result<(), LiveError>,
    {
        let now = self.clock.now();
        let mut track = Track::new(name, now);
        track.set_looping(looping);
        let (routed, effects) = {
            let mut builder = TrackBuilder::new(&mut track, &self.rack, self.timer.bpm());
            build(&mut builder)?;
            (builder.routed, builder.effects)
        };

        let playing = self.scheduler.contains(name);
        let bus = self.ensure_control(name, playing, now);
        for key in routed {
            if let Some(inst) = self.rack.instruments.get_mut(key) {
                inst.instrument.route_to(bus);
            }
        }
        self.rewire(name, &effects);
        debug!(track = %name, events = track.notes().len(), looping, "track defined");
        self.scheduler.insert(track);
        self.handle(name, now)
            .ok_or_else(|| LiveError::at(LiveErrorKind::UnknownTrack(name.to_string()), at))
    }

    /// Gain unit and bus of a track. A track defined while no same-named
    /// track is playing starts at full gain.
    fn ensure_control(&mut self, name: &str, playing: bool, now: f64) -> u32 {
        if let Some(control) = self.controls.get_mut(name) {
            if !playing {
                control.last_gain = 1.0;
                set_value_now(&mut self.rack.mixer, control.gain, GAIN, 1.0, now);
            }
            return control.bus;
        }
        let gain = self
            .rack
            .mixer
            .create(UnitKind::Gain, [(GAIN.to_string(), 1.0)], std::iter::empty());
        self.rack.mixer.connect(gain, Endpoint::Bus(0));
        let bus = self.next_bus;
        self.next_bus += 1;
        self.controls.insert(
            name.to_string(),
            TrackControl {
                bus,
                gain,
                last_gain: 1.0,
                chain: Vec::new(),
            },
        );
        bus
    }

    /// Route a track's gain through `effects` in order, then to the master bus
    fn rewire(&mut self, name: &str, effects: &[EffectKey]) {
        let Some(control) = self.controls.get_mut(name) else {
            return;
        };
        if control.chain == effects {
            return;
        }
        let mixer = &mut self.rack.mixer;
        let mut dst = control.gain;
        mixer.disconnect_all(dst);
        mixer.connect(dst, Endpoint::Bus(0));
        for key in effects {
            let Some(effect) = self.rack.effects.get(*key) else {
                continue;
            };
            mixer.disconnect_all(dst);
            mixer.connect(dst, Endpoint::Unit(effect.unit));
            mixer.connect(effect.unit, Endpoint::Bus(0));
            dst = effect.unit;
        }
        control.chain = effects.to_vec();
    }

    fn handle(&mut self, name: &str, now: f64) -> Option<TrackHandle<'_>> {
        let control = self.controls.get_mut(name)?;
        Some(TrackHandle {
            name: name.to_string(),
            scheduler: &mut self.scheduler,
            control,
            mixer: &mut self.rack.mixer,
            now,
        })
    }

    /// Handle on a playing or queued track
    pub fn track_named(&mut self, name: &str) -> Option<TrackHandle<'_>> {
        if !self.scheduler.contains(name) && self.scheduler.pending(name).is_none() {
            return None;
        }
        let now = self.clock.now();
        self.handle(name, now)
    }

    pub fn bpm(&self) -> f64 {
        self.timer.bpm()
    }

    #[track_caller]
    pub fn set_bpm(&mut self, bpm: f64) -> Result<(), LiveError> {
        let at = Location::caller();
        self.timer
            .set_tempo(bpm)
            .map_err(|e| LiveError::at(LiveErrorKind::Config(e), at))
    }

    /// Stop every track at the end of its iteration
    pub fn stop(&mut self) {
        self.scheduler.each_track(Track::stop);
    }

    pub fn pause(&mut self) {
        self.scheduler.each_track(Track::pause);
    }

    pub fn resume(&mut self) {
        self.scheduler.each_track(Track::resume);
    }

    /// Mute and delete every track
    pub fn reset(&mut self) {
        let names: Vec<String> = self.scheduler.names().map(str::to_string).collect();
        let now = self.clock.now();
        for name in names {
            if let Some(handle) = self.handle(&name, now) {
                handle.delete();
            }
        }
    }

    /// Log every played note
    pub fn use_log(&mut self, enabled: bool) {
        self.scheduler.set_log(enabled);
    }

    pub fn log(&self, message: impl std::fmt::Display) {
        info!("{}", message);
    }

    /// Play everything due inside the look-ahead window. Returns the
    /// number of events played.
    pub fn wake(&mut self) -> usize {
        let Self {
            timer,
            scheduler,
            rack,
            ..
        } = self;
        let unit = timer.unit_duration();
        let mut played = 0;
        timer.wake(&mut |time: f64| played += scheduler.tick(time, unit, &mut *rack));
        played
    }

    /// Blocking scheduling loop, see [`Timer::run`]
    pub fn run(&mut self, quit: &AtomicBool) {
        let Self {
            timer,
            scheduler,
            rack,
            ..
        } = self;
        let unit = timer.unit_duration();
        timer.run(
            &mut |time: f64| {
                scheduler.tick(time, unit, &mut *rack);
            },
            quit,
        );
    }

    /// Release expired per-note units
    pub fn collect(&mut self) -> usize {
        let now = self.clock.now();
        let voices: usize = self
            .rack
            .instruments
            .values_mut()
            .map(|i| i.instrument.collect(now))
            .sum();
        voices + self.rack.mixer.collect(now)
    }

    /// Take every pending unit command: mixer first, then instruments
    pub fn drain_commands(&mut self) -> Vec<UnitCommand> {
        let mut cmds = self.rack.mixer.drain_commands();
        for inst in self.rack.instruments.values_mut() {
            cmds.extend(inst.instrument.drain_commands());
        }
        cmds
    }
}

impl std::fmt::Debug for LiveCoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCoding")
            .field("timer", &self.timer)
            .field("instruments", &self.rack.instruments.len())
            .field("effects", &self.rack.effects.len())
            .field("tracks", &self.scheduler.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{AudioClock, ManualClock};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn session(clock: &ManualClock) -> LiveCoding {
        LiveCoding::new(
            Arc::new(clock.clone()),
            PresetLibrary::new(),
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_instrument_lookup() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let bass = lc.instrument(1, Some("bass")).unwrap();
        assert_eq!(lc.instrument_named("bass"), Some(bass));
        assert_eq!(lc.get_instrument(bass).unwrap().name(), "Sub Bass");
        assert_eq!(lc.get_instrument(bass).unwrap().instrument().num_voices(), 4);

        let lead = lc.instrument_with_voices("Saw Lead", None, 2).unwrap();
        assert_eq!(lc.instrument_named("Saw Lead"), Some(lead));

        let err = lc.instrument(99, None).unwrap_err();
        assert!(matches!(err.kind(), LiveErrorKind::Preset(PresetError::OutOfRange { .. })));
    }

    #[test]
    fn test_instrument_params() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let key = lc.instrument("Pluck", None).unwrap();
        let inst = lc.get_instrument_mut(key).unwrap();
        assert!(inst.param_names().contains(&"Filter/frequency".to_string()));

        inst.set_param("Filter/frequency", 900.0, None, false).unwrap();
        assert_relative_eq!(inst.param("Filter/frequency").unwrap(), 900.0);

        let err = inst.param("frequency").unwrap_err();
        assert!(matches!(err.kind(), LiveErrorKind::ParamPath(_)));
        let err = inst.param("Filter/nope").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Parameter \"nope\" not found in node \"Filter\" of instrument \"Pluck\""
        );
    }

    #[test]
    fn test_track_plays_on_timer() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let bass = lc.instrument(1, None).unwrap();
        lc.track("a", |t| {
            t.instrument(bass)?.play(60)?.sleep(1.0).play(64)?;
            Ok(())
        })
        .unwrap();

        assert_eq!(lc.wake(), 1);
        clock.set(0.8);
        assert_eq!(lc.wake(), 0);
        clock.set(0.85);
        assert_eq!(lc.wake(), 1);
        // One-shot track is gone once played out
        assert!(lc.track_named("a").is_none());
    }

    #[test]
    fn test_track_routes_instrument_to_its_bus() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let bass = lc.instrument(1, None).unwrap();
        let bus = lc
            .loop_track("a", |t| {
                t.instrument(bass)?.play(40)?.sleep(1.0);
                Ok(())
            })
            .unwrap()
            .bus();
        assert_eq!(bus, 1);
        let inst = lc.get_instrument(bass).unwrap().instrument();
        assert!(inst.voices().iter().all(|v| v.synth().bus() == 1));

        // Redefinition keeps the bus
        let again = lc
            .loop_track("a", |t| {
                t.instrument(bass)?.play(41)?.sleep(1.0);
                Ok(())
            })
            .unwrap()
            .bus();
        assert_eq!(again, 1);
        assert!(lc.scheduler().pending("a").is_some());
    }

    #[test]
    fn test_play_without_instrument() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let line = line!() + 3;
        let err = lc
            .track("a", |t| {
                t.play(60)?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Must call instrument before playing a note or setting parameters"
        );
        assert_eq!(err.location().file(), file!());
        assert_eq!(err.location().line(), line);
        assert!(lc.scheduler().is_empty());
    }

    #[test]
    fn test_param_events_validated_up_front() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let key = lc.instrument("Pluck", None).unwrap();
        let result = lc.track("a", |t| {
            t.instrument(key)?.param("Filter/frequency", 300.0)?;
            t.param("Filter/bogus", 1.0)?;
            Ok(())
        });
        assert!(matches!(
            result.map(|_| ()).unwrap_err().kind(),
            LiveErrorKind::UnknownInstrumentParam { .. }
        ));

        lc.track("b", |t| {
            t.instrument(key)?.param("Filter/frequency", 300.0)?.play(60)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(lc.wake(), 2);
        let inst = lc.get_instrument(key).unwrap();
        assert_relative_eq!(inst.param("Filter/frequency").unwrap(), 300.0);
    }

    #[test]
    fn test_effect_names() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let filter = lc.effect("BiquadFilter", None).unwrap();
        assert_eq!(lc.rack().effect(filter).unwrap().kind(), NodeKind::Filter);
        let delay = lc.effect("WebAudio/Delay", Some("echo")).unwrap();
        assert_eq!(lc.effect_named("echo"), Some(delay));
        assert!(lc.effect("Compressor", None).is_ok());

        let err = lc.effect("Reverb", None).unwrap_err();
        assert_eq!(err.to_string(), "Effect \"Reverb\" does not exist");
        assert!(lc.effect("Tuna/Chorus", None).is_err());
        assert!(lc.effect("Oscillator", None).is_err());
    }

    #[test]
    fn test_effect_params() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let key = lc.effect("Delay", Some("echo")).unwrap();
        let mut fx = lc.effect_handle(key).unwrap();
        assert_eq!(fx.param_names(), vec!["delayTime".to_string()]);
        fx.set_param("delayTime", 0.25, None, false).unwrap();
        assert_relative_eq!(fx.param("delayTime").unwrap(), 0.25);

        let err = fx.param("feedback").unwrap_err();
        assert_eq!(err.to_string(), "Parameter \"feedback\" not found in effect \"echo\"");

        fx.set_param("delayTime", 0.5, Some(1.0), false).unwrap();
        clock.set(0.5);
        let fx = lc.effect_handle(key).unwrap();
        assert_relative_eq!(fx.param("delayTime").unwrap(), 0.375);
    }

    #[test]
    fn test_effect_chain_wiring() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let bass = lc.instrument(1, None).unwrap();
        let a = lc.effect("Filter", None).unwrap();
        let b = lc.effect("Delay", None).unwrap();
        lc.loop_track("t", |t| {
            t.instrument(bass)?.effect(a)?.effect(b)?.play(40)?.sleep(1.0);
            Ok(())
        })
        .unwrap();

        let ua = lc.rack().effect(a).unwrap().unit();
        let ub = lc.rack().effect(b).unwrap().unit();
        let gain = lc.controls["t"].gain;
        let mixer = lc.rack().mixer();
        assert_eq!(mixer.get(gain).unwrap().outputs(), &[Endpoint::Unit(ua)]);
        assert_eq!(mixer.get(ua).unwrap().outputs(), &[Endpoint::Unit(ub)]);
        assert_eq!(mixer.get(ub).unwrap().outputs(), &[Endpoint::Bus(0)]);
    }

    #[test]
    fn test_mute_unmute_gain() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let bass = lc.instrument(1, None).unwrap();
        let mut handle = lc
            .loop_track("t", |t| {
                t.instrument(bass)?.play(40)?.sleep(1.0);
                Ok(())
            })
            .unwrap();
        handle.gain(0.5, None);
        handle.mute();
        assert_relative_eq!(handle.gain_value(), MIN_GAIN);
        handle.unmute();
        assert_relative_eq!(handle.gain_value(), 0.5);
        handle.gain(0.0, None);
        assert_relative_eq!(handle.gain_value(), MIN_GAIN);
    }

    #[test]
    fn test_sleep_follows_tempo() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let bass = lc.instrument(1, None).unwrap();
        lc.set_bpm(120.0).unwrap();
        let handle = lc
            .loop_track("t", |t| {
                t.instrument(bass)?.play(40)?.sleep(1.0);
                Ok(())
            })
            .unwrap();
        assert_relative_eq!(handle.track().unwrap().time(), 0.5);

        let line = line!() + 1;
        let err = lc.set_bpm(0.0).unwrap_err();
        assert_eq!(err.location().line(), line);
        assert_relative_eq!(lc.bpm(), 120.0);
    }

    #[test]
    fn test_global_controls() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        let bass = lc.instrument(1, None).unwrap();
        for name in ["a", "b"] {
            lc.loop_track(name, |t| {
                t.instrument(bass)?.play(40)?.sleep(1.0);
                Ok(())
            })
            .unwrap();
        }
        lc.pause();
        assert_eq!(lc.wake(), 0);
        lc.resume();
        // Instant 0 went by while paused; 0.25 is not inside the window yet
        assert_eq!(lc.wake(), 0);
        assert_relative_eq!(lc.timer().next_instant(), 0.25);
        clock.set(0.1);
        // Both held notes go out on the first instant after resuming
        assert_eq!(lc.wake(), 2);
        assert_relative_eq!(lc.timer().next_instant(), 0.5);

        lc.stop();
        clock.set(1.0);
        lc.wake();
        assert!(lc.scheduler().is_empty());

        lc.loop_track("a", |t| {
            t.instrument(bass)?.play(40)?.sleep(1.0);
            Ok(())
        })
        .unwrap();
        lc.reset();
        assert!(lc.scheduler().is_empty());
        let gain = lc.controls["a"].gain;
        assert_relative_eq!(
            lc.rack().mixer().param(gain, GAIN).unwrap().value_at(clock.now()),
            MIN_GAIN
        );
    }

    #[test]
    fn test_execute_reports_errors_and_panics() {
        let clock = ManualClock::new(0.0);
        let mut lc = session(&clock);
        assert!(lc.execute(|lc| lc.instrument(1, None).map(|_| ())).is_ok());

        let err = lc
            .execute(|lc| lc.instrument("Missing", None).map(|_| ()))
            .unwrap_err();
        assert!(err.to_string().starts_with("Preset \"Missing\" does not exist (at "));

        let err = lc.execute(|_| panic!("boom")).unwrap_err();
        assert!(matches!(err, ScriptError::Panicked(ref m) if m == "boom"));
        // The session is still usable
        assert!(lc.instrument_named("Sub Bass").is_some());
    }
}
