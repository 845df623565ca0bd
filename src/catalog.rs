//! Node Catalog
//!
//! Immutable definitions of every node type a graph may contain: which
//! processing unit it builds, its parameters and how they map to a control
//! surface, whether it reacts to notes (and through which handler), and
//! whether it is a control node that modulates another node's parameter.
//!
//! The type name used by the serialization format is resolved to a
//! [`NodeKind`] once, when a node is created; note events never look up
//! handlers by name.

use crate::unit::{FieldValue, UnitKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Closed set of node types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Oscillator,
    Buffer,
    Noise,
    LineIn,
    SoundBank,
    Gain,
    Filter,
    Delay,
    StereoPan,
    Compressor,
    Detuner,
    Lfo,
    GainCtrl,
    Adsr,
    NoiseCtrl,
    Output,
}

impl NodeKind {
    pub const ALL: [NodeKind; 16] = [
        NodeKind::Oscillator,
        NodeKind::Buffer,
        NodeKind::Noise,
        NodeKind::LineIn,
        NodeKind::SoundBank,
        NodeKind::Gain,
        NodeKind::Filter,
        NodeKind::Delay,
        NodeKind::StereoPan,
        NodeKind::Compressor,
        NodeKind::Detuner,
        NodeKind::Lfo,
        NodeKind::GainCtrl,
        NodeKind::Adsr,
        NodeKind::NoiseCtrl,
        NodeKind::Output,
    ];

    /// Name used in serialized graphs
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Oscillator => "Oscillator",
            NodeKind::Buffer => "Buffer",
            NodeKind::Noise => "Noise",
            NodeKind::LineIn => "LineIn",
            NodeKind::SoundBank => "SoundBank",
            NodeKind::Gain => "Gain",
            NodeKind::Filter => "Filter",
            NodeKind::Delay => "Delay",
            NodeKind::StereoPan => "StereoPan",
            NodeKind::Compressor => "Compressor",
            NodeKind::Detuner => "Detuner",
            NodeKind::Lfo => "LFO",
            NodeKind::GainCtrl => "GainCtrl",
            NodeKind::Adsr => "ADSR",
            NodeKind::NoiseCtrl => "NoiseCtrl",
            NodeKind::Output => "out",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        if name == "Speaker" {
            return Some(NodeKind::Output);
        }
        NodeKind::ALL.into_iter().find(|k| k.type_name() == name)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Note handler variant attached to a node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerKind {
    /// Clones an oscillator per note and scales its frequency
    Tone,
    /// Clones an oscillator per note without following the keyboard
    Lfo,
    /// Clones a buffer player per note and scales its playback rate
    Sampled,
    /// Drives connected parameters through attack/decay/release ramps
    Envelope,
    /// Stops and restarts the node itself
    Restartable,
    /// Fires a one-shot from a bank of samples
    SoundBank,
}

/// Custom (de)serialization for parameters that carry data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamHandlerKind {
    /// One base64-encoded sample
    BufferData,
    /// A list of named base64-encoded samples
    SoundBank,
}

/// Initial value of a parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamInitial {
    Number(f64),
    Choice(String),
    Flag(bool),
    /// Data handled by a `ParamHandlerKind`
    Data,
}

const LOG_BASE: f64 = 2.0;

/// Definition of one node parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    pub name: String,
    pub initial: ParamInitial,
    pub min: f64,
    pub max: f64,
    /// Linear rather than logarithmic control mapping
    pub linear: bool,
    pub choices: Vec<String>,
    pub handler: Option<ParamHandlerKind>,
    /// Continuous parameter that accepts automation and modulation
    pub automatable: bool,
}

impl ParamDef {
    fn base(name: &str, initial: ParamInitial) -> Self {
        Self {
            name: name.to_string(),
            initial,
            min: 0.0,
            max: 1.0,
            linear: false,
            choices: Vec::new(),
            handler: None,
            automatable: false,
        }
    }

    /// Continuous, automatable parameter
    pub fn audio(name: &str, initial: f64, min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            automatable: true,
            ..Self::base(name, ParamInitial::Number(initial))
        }
    }

    /// Plain numeric field of a unit
    pub fn number(name: &str, initial: f64, min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            ..Self::base(name, ParamInitial::Number(initial))
        }
    }

    pub fn choice(name: &str, initial: &str, choices: &[&str]) -> Self {
        Self {
            choices: choices.iter().map(|c| c.to_string()).collect(),
            ..Self::base(name, ParamInitial::Choice(initial.to_string()))
        }
    }

    pub fn flag(name: &str, initial: bool) -> Self {
        Self::base(name, ParamInitial::Flag(initial))
    }

    pub fn data(name: &str, handler: ParamHandlerKind) -> Self {
        Self {
            handler: Some(handler),
            ..Self::base(name, ParamInitial::Data)
        }
    }

    pub fn linear(mut self) -> Self {
        self.linear = true;
        self
    }

    /// Detune in cents across two octaves
    pub fn octave_detune() -> Self {
        Self::audio("detune", 0.0, -1200.0, 1200.0).linear()
    }

    pub fn initial_number(&self) -> Option<f64> {
        match self.initial {
            ParamInitial::Number(v) => Some(v),
            _ => None,
        }
    }

    /// Initial value of a non-automatable parameter as a unit field
    pub fn initial_field(&self) -> Option<FieldValue> {
        match &self.initial {
            ParamInitial::Number(v) => Some(FieldValue::Number(*v)),
            ParamInitial::Choice(c) => Some(FieldValue::Text(c.clone())),
            ParamInitial::Flag(b) => Some(FieldValue::Bool(*b)),
            ParamInitial::Data => None,
        }
    }

    /// Map a value onto a 0..=1 control position
    pub fn to_normalized(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span <= 0.0 {
            return 0.0;
        }
        if self.linear {
            return (value - self.min) / span;
        }
        let offset = value - self.min;
        if offset <= 0.0 {
            return 0.0;
        }
        offset.log(LOG_BASE) / span.log(LOG_BASE)
    }

    /// Map a 0..=1 control position back onto a value
    pub fn from_normalized(&self, position: f64) -> f64 {
        let span = self.max - self.min;
        if self.linear {
            return self.min + position * span;
        }
        self.min + LOG_BASE.powf(position * span.log(LOG_BASE))
    }
}

/// Definition of one node type
#[derive(Debug, Clone)]
pub struct NodeDef {
    pub kind: NodeKind,
    pub unit: UnitKind,
    pub note_handler: Option<HandlerKind>,
    /// Output modulates another node's parameter
    pub control: bool,
    pub category: String,
    pub description: String,
    pub params: Vec<ParamDef>,
}

impl NodeDef {
    pub fn new(kind: NodeKind, unit: UnitKind, category: &str) -> Self {
        Self {
            kind,
            unit,
            note_handler: None,
            control: false,
            category: category.to_string(),
            description: String::new(),
            params: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: HandlerKind) -> Self {
        self.note_handler = Some(handler);
        self
    }

    pub fn control(mut self) -> Self {
        self.control = true;
        self
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }

    pub fn param(mut self, def: ParamDef) -> Self {
        self.params.push(def);
        self
    }

    pub fn param_def(&self, name: &str) -> Option<&ParamDef> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Names of the automatable parameters, in definition order
    pub fn automatable_params(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .filter(|p| p.automatable)
            .map(|p| p.name.as_str())
    }

    /// Initial continuous parameters of a freshly built unit
    pub fn initial_params(&self) -> Vec<(String, f64)> {
        self.params
            .iter()
            .filter(|p| p.automatable)
            .map(|p| (p.name.clone(), p.initial_number().unwrap_or(0.0)))
            .collect()
    }

    /// Initial discrete fields of a freshly built unit
    pub fn initial_fields(&self) -> Vec<(String, FieldValue)> {
        self.params
            .iter()
            .filter(|p| !p.automatable)
            .filter_map(|p| p.initial_field().map(|v| (p.name.clone(), v)))
            .collect()
    }

    pub fn is_output(&self) -> bool {
        self.kind == NodeKind::Output
    }

    /// Usable as a live-coding effect (audio in, audio out, no notes)
    pub fn is_effect(&self) -> bool {
        self.category == "Effects"
    }
}

/// Registry of the available node types
pub struct NodeCatalog {
    defs: HashMap<NodeKind, NodeDef>,
}

impl NodeCatalog {
    pub fn new() -> Self {
        let mut catalog = Self {
            defs: HashMap::new(),
        };
        catalog.register_builtin();
        catalog
    }

    /// Shared instance of the built-in catalog
    pub fn global() -> &'static NodeCatalog {
        static CATALOG: OnceLock<NodeCatalog> = OnceLock::new();
        CATALOG.get_or_init(NodeCatalog::new)
    }

    fn register_builtin(&mut self) {
        const WAVES: &[&str] = &["sine", "square", "sawtooth", "triangle"];

        // Sources
        self.register(
            NodeDef::new(NodeKind::Oscillator, UnitKind::Oscillator, "Sources")
                .with_handler(HandlerKind::Tone)
                .with_description("Oscillator following the keyboard")
                .param(ParamDef::audio("frequency", 220.0, 20.0, 20000.0))
                .param(ParamDef::octave_detune())
                .param(ParamDef::choice("type", "sawtooth", WAVES)),
        );

        self.register(
            NodeDef::new(NodeKind::Buffer, UnitKind::BufferSource, "Sources")
                .with_handler(HandlerKind::Sampled)
                .with_description("Sample player, playback rate follows the keyboard")
                .param(ParamDef::audio("playbackRate", 1.0, 0.0, 8.0))
                .param(ParamDef::octave_detune())
                .param(ParamDef::data("buffer", ParamHandlerKind::BufferData))
                .param(ParamDef::flag("loop", false))
                .param(ParamDef::number("loopStart", 0.0, 0.0, 10.0))
                .param(ParamDef::number("loopEnd", 3.0, 0.0, 10.0)),
        );

        self.register(
            NodeDef::new(NodeKind::Noise, UnitKind::Noise, "Sources")
                .with_handler(HandlerKind::Restartable)
                .with_description("White noise")
                .param(ParamDef::number("gain", 1.0, 0.0, 10.0)),
        );

        self.register(
            NodeDef::new(NodeKind::LineIn, UnitKind::LineIn, "Sources")
                .with_description("Audio input"),
        );

        self.register(
            NodeDef::new(NodeKind::SoundBank, UnitKind::BufferSource, "Sources")
                .with_handler(HandlerKind::SoundBank)
                .with_description("One-shot samples selected by note number")
                .param(ParamDef::data("buffer", ParamHandlerKind::SoundBank)),
        );

        // Effects
        self.register(
            NodeDef::new(NodeKind::Gain, UnitKind::Gain, "Effects")
                .param(ParamDef::audio("gain", 1.0, 0.0, 10.0).linear()),
        );

        self.register(
            NodeDef::new(NodeKind::Filter, UnitKind::BiquadFilter, "Effects")
                .param(ParamDef::audio("frequency", 440.0, 20.0, 20000.0))
                .param(ParamDef::audio("Q", 0.0, 0.0, 100.0))
                .param(ParamDef::octave_detune())
                .param(ParamDef::audio("gain", 0.0, -40.0, 40.0).linear())
                .param(ParamDef::choice(
                    "type",
                    "lowpass",
                    &[
                        "lowpass",
                        "highpass",
                        "bandpass",
                        "lowshelf",
                        "highshelf",
                        "peaking",
                        "notch",
                        "allpass",
                    ],
                )),
        );

        self.register(
            NodeDef::new(NodeKind::Delay, UnitKind::Delay, "Effects")
                .param(ParamDef::audio("delayTime", 1.0, 0.0, 5.0)),
        );

        self.register(
            NodeDef::new(NodeKind::StereoPan, UnitKind::StereoPanner, "Effects")
                .param(ParamDef::audio("pan", 0.0, -1.0, 1.0).linear()),
        );

        self.register(
            NodeDef::new(NodeKind::Compressor, UnitKind::DynamicsCompressor, "Effects")
                .param(ParamDef::audio("threshold", -24.0, -100.0, 0.0).linear())
                .param(ParamDef::audio("knee", 30.0, 0.0, 40.0).linear())
                .param(ParamDef::audio("ratio", 12.0, 1.0, 20.0).linear())
                .param(ParamDef::audio("attack", 0.003, 0.0, 1.0))
                .param(ParamDef::audio("release", 0.25, 0.0, 1.0)),
        );

        self.register(
            NodeDef::new(NodeKind::Detuner, UnitKind::Detuner, "Effects")
                .param(ParamDef::number("octave", 0.0, -2.0, 2.0).linear()),
        );

        // Controllers
        self.register(
            NodeDef::new(NodeKind::Lfo, UnitKind::Oscillator, "Controllers")
                .with_handler(HandlerKind::Lfo)
                .control()
                .param(ParamDef::audio("frequency", 5.0, 0.01, 200.0))
                .param(ParamDef::octave_detune())
                .param(ParamDef::choice("type", "sine", WAVES)),
        );

        self.register(
            NodeDef::new(NodeKind::GainCtrl, UnitKind::Gain, "Controllers")
                .control()
                .param(ParamDef::audio("gain", 10.0, 0.0, 100.0).linear()),
        );

        self.register(
            NodeDef::new(NodeKind::Adsr, UnitKind::Envelope, "Controllers")
                .with_handler(HandlerKind::Envelope)
                .control()
                .with_description("Envelope driving the parameters it is connected to")
                .param(ParamDef::number("attack", 0.2, 0.0, 10.0))
                .param(ParamDef::number("decay", 0.5, 0.0, 10.0))
                .param(ParamDef::number("sustain", 0.5, 0.0, 1.0).linear())
                .param(ParamDef::number("release", 1.0, 0.0, 10.0))
                .param(ParamDef::number("depth", 1.0, 0.0, 1.0)),
        );

        self.register(
            NodeDef::new(NodeKind::NoiseCtrl, UnitKind::NoiseControl, "Controllers")
                .control()
                .param(ParamDef::number("frequency", 4.0, 0.0, 200.0))
                .param(ParamDef::number("depth", 20.0, 0.0, 200.0)),
        );

        // Output
        self.register(NodeDef::new(NodeKind::Output, UnitKind::Output, "Output"));
    }

    pub fn register(&mut self, def: NodeDef) {
        self.defs.insert(def.kind, def);
    }

    pub fn get(&self, kind: NodeKind) -> Option<&NodeDef> {
        self.defs.get(&kind)
    }

    /// Resolve a serialized type name
    pub fn lookup(&self, type_name: &str) -> Option<&NodeDef> {
        NodeKind::from_type_name(type_name).and_then(|k| self.get(k))
    }

    pub fn list(&self) -> impl Iterator<Item = &NodeDef> {
        NodeKind::ALL.iter().filter_map(|k| self.defs.get(k))
    }

    pub fn list_by_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a NodeDef> {
        self.list().filter(move |d| d.category == category)
    }
}

impl Default for NodeCatalog {
    fn default() -> Self {
        Self::new()
    }
}
