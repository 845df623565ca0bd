//! Preset Library
//!
//! Ordered collection of node-graph presets. Presets are addressed the way
//! scripts address them: by 1-based number, by name, or by handing over a
//! graph directly.
//!
//! # Example
//!
//! ```ignore
//! use synthflow::prelude::*;
//!
//! let library = PresetLibrary::new();
//! let bass = library.get(&PresetRef::from("Sub Bass"))?;
//! let same = library.get(&PresetRef::from(1))?;
//! ```

use crate::serialize::{GraphDef, NodeDataDef};

/// Error type for preset lookup
#[derive(Debug)]
pub enum PresetError {
    /// Number outside `1..=max`
    OutOfRange { max: usize },
    NotFound(String),
    Json(serde_json::Error),
}

impl std::fmt::Display for PresetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresetError::OutOfRange { max } => {
                write!(f, "The preset number should be between 1 and {}", max)
            }
            PresetError::NotFound(name) => write!(f, "Preset \"{}\" does not exist", name),
            PresetError::Json(e) => write!(f, "Malformed preset file: {}", e),
        }
    }
}

impl std::error::Error for PresetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PresetError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for PresetError {
    fn from(e: serde_json::Error) -> Self {
        PresetError::Json(e)
    }
}

/// How a script names a preset
#[derive(Debug, Clone, PartialEq)]
pub enum PresetRef {
    /// 1-based position in the library
    Index(usize),
    Name(String),
    /// Inline graph, used as is
    Data(GraphDef),
}

impl From<usize> for PresetRef {
    fn from(n: usize) -> Self {
        PresetRef::Index(n)
    }
}

impl From<&str> for PresetRef {
    fn from(name: &str) -> Self {
        PresetRef::Name(name.to_string())
    }
}

impl From<GraphDef> for PresetRef {
    fn from(def: GraphDef) -> Self {
        PresetRef::Data(def)
    }
}

/// Ordered preset collection
#[derive(Debug, Clone)]
pub struct PresetLibrary {
    presets: Vec<GraphDef>,
}

impl PresetLibrary {
    /// Library holding the built-in presets
    pub fn new() -> Self {
        Self {
            presets: vec![
                ClassicPresets::sub_bass(),
                ClassicPresets::saw_lead(),
                ClassicPresets::slow_pad(),
                ClassicPresets::pluck(),
                ClassicPresets::noise_hat(),
                ClassicPresets::wobble(),
            ],
        }
    }

    pub fn empty() -> Self {
        Self {
            presets: Vec::new(),
        }
    }

    /// Parse a preset file: a JSON array of graphs
    pub fn from_json(json: &str) -> Result<Self, PresetError> {
        Ok(Self {
            presets: serde_json::from_str(json)?,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.presets)
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    pub fn push(&mut self, preset: GraphDef) {
        self.presets.push(preset);
    }

    /// Preset names in library order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.iter().map(|p| p.name.as_deref().unwrap_or(""))
    }

    pub fn by_name(&self, name: &str) -> Option<&GraphDef> {
        self.presets.iter().find(|p| p.name.as_deref() == Some(name))
    }

    /// Resolve a preset reference to a graph
    pub fn get(&self, preset: &PresetRef) -> Result<GraphDef, PresetError> {
        match preset {
            PresetRef::Index(n) => {
                let max = self.presets.len();
                if *n < 1 || *n > max {
                    return Err(PresetError::OutOfRange { max });
                }
                Ok(self.presets[n - 1].clone())
            }
            PresetRef::Name(name) => self
                .by_name(name)
                .cloned()
                .ok_or_else(|| PresetError::NotFound(name.clone())),
            PresetRef::Data(def) => Ok(def.clone()),
        }
    }
}

impl Default for PresetLibrary {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in instrument graphs
pub struct ClassicPresets;

impl ClassicPresets {
    /// Oscillator, filter and amplifier with the envelope on the amplifier
    fn subtractive(name: &str, wave: &str, cutoff: f64, env: NodeDataDef) -> GraphDef {
        let mut def = GraphDef::new(name)
            .with_node("Out", NodeDataDef::new("out"))
            .with_node("Amp", NodeDataDef::new("Gain"))
            .with_node("Filter", NodeDataDef::new("Filter").with_param("frequency", cutoff))
            .with_node("Osc", NodeDataDef::new("Oscillator").with_param("type", wave))
            .with_node("Env", env);
        for (src, dst) in [("Amp", "Out"), ("Filter", "Amp"), ("Osc", "Filter"), ("Env", "Amp")] {
            // Every name above is defined
            let _ = def.connect(src, dst);
        }
        def
    }

    fn adsr(attack: f64, decay: f64, sustain: f64, release: f64) -> NodeDataDef {
        NodeDataDef::new("ADSR")
            .with_param("attack", attack)
            .with_param("decay", decay)
            .with_param("sustain", sustain)
            .with_param("release", release)
            .with_param("depth", 1.0)
    }

    pub fn sub_bass() -> GraphDef {
        Self::subtractive("Sub Bass", "square", 400.0, Self::adsr(0.01, 0.2, 0.7, 0.1))
    }

    pub fn saw_lead() -> GraphDef {
        Self::subtractive("Saw Lead", "sawtooth", 3000.0, Self::adsr(0.02, 0.3, 0.6, 0.3))
    }

    pub fn slow_pad() -> GraphDef {
        Self::subtractive("Slow Pad", "triangle", 1200.0, Self::adsr(1.0, 1.0, 0.8, 2.0))
    }

    pub fn pluck() -> GraphDef {
        Self::subtractive("Pluck", "sawtooth", 2000.0, Self::adsr(0.0, 0.15, 0.0, 0.05))
    }

    /// Noise through a high-pass filter with a short envelope
    pub fn noise_hat() -> GraphDef {
        let mut def = GraphDef::new("Noise Hat")
            .with_node("Out", NodeDataDef::new("out"))
            .with_node("Amp", NodeDataDef::new("Gain"))
            .with_node(
                "Filter",
                NodeDataDef::new("Filter")
                    .with_param("type", "highpass")
                    .with_param("frequency", 7000.0),
            )
            .with_node("Noise", NodeDataDef::new("Noise"))
            .with_node("Env", Self::adsr(0.0, 0.05, 0.0, 0.05));
        for (src, dst) in [("Amp", "Out"), ("Filter", "Amp"), ("Noise", "Filter"), ("Env", "Amp")] {
            let _ = def.connect(src, dst);
        }
        def
    }

    /// Saw bass with an LFO sweeping the filter cutoff
    pub fn wobble() -> GraphDef {
        let mut def = Self::subtractive("Wobble", "sawtooth", 800.0, Self::adsr(0.01, 0.1, 0.9, 0.2));
        def.add_node(
            "LFO",
            NodeDataDef::new("LFO")
                .with_param("frequency", 4.0)
                .with_control_param("frequency"),
        );
        let _ = def.connect("LFO", "Filter");
        def
    }
}
