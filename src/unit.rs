//! Processing Units
//!
//! The engine never renders audio. It drives opaque processing units
//! (oscillators, buffer players, gains, envelopes) owned by the host's
//! audio back end, and only needs four operations from them: connect,
//! disconnect, start and stop, plus automation of their continuous
//! parameters.
//!
//! `UnitGraph` is the engine-side model of those units. Every operation is
//! applied to the model (so scheduling decisions can inspect current
//! connections and parameter timelines) and appended to a command log that
//! the host drains and forwards to the real back end.

use crate::ramp::EnvelopeSegment;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::collections::BTreeMap;
use std::sync::Arc;

new_key_type! {
    /// Identifier of a processing unit inside a `UnitGraph`
    pub struct UnitId;
}

/// Concrete kind of processing unit to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    Oscillator,
    BufferSource,
    Gain,
    BiquadFilter,
    Delay,
    StereoPanner,
    DynamicsCompressor,
    Envelope,
    Noise,
    NoiseControl,
    LineIn,
    Detuner,
    Output,
}

impl UnitKind {
    /// Whether `start` may follow `stop` on the same unit
    pub fn is_restartable(&self) -> bool {
        !matches!(self, UnitKind::Oscillator | UnitKind::BufferSource)
    }
}

/// Destination of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// Audio input of another unit
    Unit(UnitId),
    /// A continuous parameter of another unit (modulation)
    Param(UnitId, String),
    /// A host-side output bus (0 = master)
    Bus(u32),
}

impl Endpoint {
    pub fn unit(&self) -> Option<UnitId> {
        match self {
            Endpoint::Unit(id) | Endpoint::Param(id, _) => Some(*id),
            Endpoint::Bus(_) => None,
        }
    }
}

/// Value of a discrete (non-automatable) unit field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// One entry of a parameter's automation timeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AutomationEvent {
    /// Jump to `value` at `time`
    SetValue { value: f64, time: f64 },
    /// Linear ramp from the previous event, reaching `value` at `time`
    LinearRamp { value: f64, time: f64 },
    /// Exponential ramp from the previous event, reaching `value` at `time`
    ExponentialRamp { value: f64, time: f64 },
}

impl AutomationEvent {
    pub fn time(&self) -> f64 {
        match *self {
            AutomationEvent::SetValue { time, .. }
            | AutomationEvent::LinearRamp { time, .. }
            | AutomationEvent::ExponentialRamp { time, .. } => time,
        }
    }

    pub fn value(&self) -> f64 {
        match *self {
            AutomationEvent::SetValue { value, .. }
            | AutomationEvent::LinearRamp { value, .. }
            | AutomationEvent::ExponentialRamp { value, .. } => value,
        }
    }
}

/// A continuous, automatable unit parameter
#[derive(Debug, Clone, Default)]
pub struct Param {
    value: f64,
    nominal: Option<f64>,
    events: Vec<AutomationEvent>,
    /// Envelope segment currently driving this parameter
    pub(crate) segment: Option<EnvelopeSegment>,
}

impl Param {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    /// Intrinsic value, used before the first automation event
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Value the parameter returns to when no note is shaping it.
    ///
    /// Falls back to the intrinsic value until a note handler or the user
    /// records one explicitly.
    pub fn nominal(&self) -> f64 {
        self.nominal.unwrap_or(self.value)
    }

    pub fn set_nominal(&mut self, value: f64) {
        self.nominal = Some(value);
    }

    pub fn events(&self) -> &[AutomationEvent] {
        &self.events
    }

    pub fn segment(&self) -> Option<&EnvelopeSegment> {
        self.segment.as_ref()
    }

    fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    /// Insert keeping the timeline sorted; equal times keep insertion order
    fn schedule(&mut self, event: AutomationEvent) {
        let pos = self
            .events
            .iter()
            .position(|e| e.time() > event.time())
            .unwrap_or(self.events.len());
        self.events.insert(pos, event);
    }

    fn cancel_scheduled(&mut self, time: f64) {
        self.events.retain(|e| e.time() < time);
    }

    /// Drop events superseded by `time`. The last event at or before it
    /// stays as the start point of whatever ramp follows.
    fn prune(&mut self, time: f64) {
        if let Some(anchor) = self.events.iter().rposition(|e| e.time() <= time) {
            self.events.drain(..anchor);
        }
    }

    /// Evaluate the automation timeline at `t`
    pub fn value_at(&self, t: f64) -> f64 {
        let mut prev_t = f64::NEG_INFINITY;
        let mut prev_v = self.value;
        for event in &self.events {
            let (time, value) = (event.time(), event.value());
            if time <= t {
                prev_t = time;
                prev_v = value;
                continue;
            }
            // First event after `t`: only a ramp shapes the value before it
            if !prev_t.is_finite() || time <= prev_t {
                return prev_v;
            }
            let frac = (t - prev_t) / (time - prev_t);
            return match event {
                AutomationEvent::SetValue { .. } => prev_v,
                AutomationEvent::LinearRamp { .. } => prev_v + (value - prev_v) * frac,
                AutomationEvent::ExponentialRamp { .. } => {
                    if prev_v * value > 0.0 {
                        prev_v * (value / prev_v).powf(frac)
                    } else {
                        prev_v
                    }
                }
            };
        }
        prev_v
    }
}

/// Decoded sample data supplied by the host once decoding completes
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub frames: usize,
    pub channels: u16,
    pub sample_rate: f64,
}

impl SampleBuffer {
    pub fn duration(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.frames as f64 / self.sample_rate
        } else {
            0.0
        }
    }
}

/// Encoded sample data plus its decoded form, once available
#[derive(Debug, Clone, Default)]
pub struct SampleSlot {
    pub name: String,
    pub encoded: Vec<u8>,
    pub decoded: Option<Arc<SampleBuffer>>,
}

/// Lifecycle of a startable unit
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PlayState {
    #[default]
    Idle,
    Started(f64),
    Stopped(f64),
}

/// Engine-side model of one processing unit
#[derive(Debug, Clone)]
pub struct Unit {
    kind: UnitKind,
    params: BTreeMap<String, Param>,
    fields: BTreeMap<String, FieldValue>,
    outputs: Vec<Endpoint>,
    state: PlayState,
    expires_at: Option<f64>,
    /// Buffer currently assigned for playback
    pub buffer: Option<Arc<SampleBuffer>>,
    /// Single sample owned by a buffer template
    pub sample: Option<SampleSlot>,
    /// Sample bank owned by a sound-bank template
    pub bank: Vec<SampleSlot>,
}

impl Unit {
    fn new(kind: UnitKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
            fields: BTreeMap::new(),
            outputs: Vec::new(),
            state: PlayState::Idle,
            expires_at: None,
            buffer: None,
            sample: None,
            bank: Vec::new(),
        }
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.get(name)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Numeric field value, if the field exists and is a number
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.fields.get(name) {
            Some(FieldValue::Number(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Connections leaving this unit, in connection order
    pub fn outputs(&self) -> &[Endpoint] {
        &self.outputs
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn expires_at(&self) -> Option<f64> {
        self.expires_at
    }
}

/// Operation dispatched to the host's processing-unit back end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum UnitCommand {
    Create { unit: UnitId, kind: UnitKind },
    Connect { from: UnitId, to: Endpoint },
    Disconnect { from: UnitId, to: Endpoint },
    Start { unit: UnitId, time: f64 },
    Stop { unit: UnitId, time: f64 },
    SetParam { unit: UnitId, param: String, value: f64 },
    SetField { unit: UnitId, field: String, value: FieldValue },
    Automate { unit: UnitId, param: String, event: AutomationEvent },
    CancelScheduled { unit: UnitId, param: String, time: f64 },
    SetBuffer { unit: UnitId, frames: usize },
    Release { unit: UnitId },
}

/// Arena of processing units with a dispatch log
#[derive(Debug, Default)]
pub struct UnitGraph {
    units: SlotMap<UnitId, Unit>,
    commands: Vec<UnitCommand>,
}

impl UnitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn contains(&self, id: UnitId) -> bool {
        self.units.contains_key(id)
    }

    pub fn get(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: UnitId) -> Option<&mut Unit> {
        self.units.get_mut(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.units.keys()
    }

    /// Commands issued so far and not yet drained
    pub fn commands(&self) -> &[UnitCommand] {
        &self.commands
    }

    pub fn drain_commands(&mut self) -> Vec<UnitCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Construct a unit with the given continuous parameters and fields
    pub fn create<P, F>(&mut self, kind: UnitKind, params: P, fields: F) -> UnitId
    where
        P: IntoIterator<Item = (String, f64)>,
        F: IntoIterator<Item = (String, FieldValue)>,
    {
        let mut unit = Unit::new(kind);
        unit.params = params.into_iter().map(|(k, v)| (k, Param::new(v))).collect();
        unit.fields = fields.into_iter().collect();
        let id = self.units.insert(unit);
        self.commands.push(UnitCommand::Create { unit: id, kind });
        id
    }

    /// Construct a fresh unit of the same kind, copying parameter values
    /// and discrete fields. Connections and samples are not copied.
    pub fn clone_unit(&mut self, source: UnitId) -> Option<UnitId> {
        let src = self.units.get(source)?;
        let kind = src.kind;
        let params: Vec<(String, Param)> = src
            .params
            .iter()
            .map(|(name, p)| {
                let mut copy = Param::new(p.value);
                copy.nominal = p.nominal;
                (name.clone(), copy)
            })
            .collect();
        let fields = src.fields.clone();

        let mut unit = Unit::new(kind);
        unit.params = params.into_iter().collect();
        unit.fields = fields;
        let id = self.units.insert(unit);
        self.commands.push(UnitCommand::Create { unit: id, kind });
        Some(id)
    }

    pub fn param(&self, unit: UnitId, name: &str) -> Option<&Param> {
        self.units.get(unit)?.params.get(name)
    }

    pub(crate) fn param_mut(&mut self, unit: UnitId, name: &str) -> Option<&mut Param> {
        self.units.get_mut(unit)?.params.get_mut(name)
    }

    /// Names of the continuous parameters of a unit
    pub fn param_names(&self, unit: UnitId) -> Vec<String> {
        self.units
            .get(unit)
            .map(|u| u.params.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connect(&mut self, from: UnitId, to: Endpoint) -> bool {
        if let Some(target) = to.unit() {
            if !self.units.contains_key(target) {
                return false;
            }
        }
        let Some(unit) = self.units.get_mut(from) else {
            return false;
        };
        if unit.outputs.contains(&to) {
            return false;
        }
        unit.outputs.push(to.clone());
        self.commands.push(UnitCommand::Connect { from, to });
        true
    }

    pub fn disconnect(&mut self, from: UnitId, to: &Endpoint) -> bool {
        let Some(unit) = self.units.get_mut(from) else {
            return false;
        };
        let before = unit.outputs.len();
        unit.outputs.retain(|e| e != to);
        if unit.outputs.len() == before {
            return false;
        }
        self.commands.push(UnitCommand::Disconnect {
            from,
            to: to.clone(),
        });
        true
    }

    /// Drop every connection leaving `from`
    pub fn disconnect_all(&mut self, from: UnitId) {
        let outputs = match self.units.get(from) {
            Some(unit) => unit.outputs.clone(),
            None => return,
        };
        for to in outputs {
            self.disconnect(from, &to);
        }
    }

    pub fn start(&mut self, unit: UnitId, time: f64) {
        if let Some(u) = self.units.get_mut(unit) {
            u.state = PlayState::Started(time);
            self.commands.push(UnitCommand::Start { unit, time });
        }
    }

    pub fn stop(&mut self, unit: UnitId, time: f64) {
        if let Some(u) = self.units.get_mut(unit) {
            u.state = PlayState::Stopped(time);
            self.commands.push(UnitCommand::Stop { unit, time });
        }
    }

    /// Set a parameter's intrinsic value immediately
    pub fn set_param(&mut self, unit: UnitId, name: &str, value: f64) -> bool {
        match self.param_mut(unit, name) {
            Some(p) => {
                p.set_value(value);
                self.commands.push(UnitCommand::SetParam {
                    unit,
                    param: name.to_string(),
                    value,
                });
                true
            }
            None => false,
        }
    }

    pub fn set_field(&mut self, unit: UnitId, name: &str, value: FieldValue) -> bool {
        match self.units.get_mut(unit) {
            Some(u) => {
                u.fields.insert(name.to_string(), value.clone());
                self.commands.push(UnitCommand::SetField {
                    unit,
                    field: name.to_string(),
                    value,
                });
                true
            }
            None => false,
        }
    }

    pub fn set_buffer(&mut self, unit: UnitId, buffer: Arc<SampleBuffer>) {
        if let Some(u) = self.units.get_mut(unit) {
            let frames = buffer.frames;
            u.buffer = Some(buffer);
            self.commands.push(UnitCommand::SetBuffer { unit, frames });
        }
    }

    pub fn automate(&mut self, unit: UnitId, name: &str, event: AutomationEvent) -> bool {
        match self.param_mut(unit, name) {
            Some(p) => {
                p.schedule(event);
                self.commands.push(UnitCommand::Automate {
                    unit,
                    param: name.to_string(),
                    event,
                });
                true
            }
            None => false,
        }
    }

    /// Remove every automation event at or after `time`
    pub fn cancel_scheduled(&mut self, unit: UnitId, name: &str, time: f64) -> bool {
        match self.param_mut(unit, name) {
            Some(p) => {
                p.cancel_scheduled(time);
                self.commands.push(UnitCommand::CancelScheduled {
                    unit,
                    param: name.to_string(),
                    time,
                });
                true
            }
            None => false,
        }
    }

    /// Forget automation of one parameter that can no longer shape its
    /// value at or after `time`
    pub fn prune_automation(&mut self, unit: UnitId, name: &str, time: f64) {
        if let Some(p) = self.param_mut(unit, name) {
            p.prune(time);
        }
    }

    /// Mark a unit for release once the clock passes `at`
    pub fn schedule_release(&mut self, unit: UnitId, at: f64) {
        if let Some(u) = self.units.get_mut(unit) {
            u.expires_at = Some(at);
        }
    }

    /// Release every unit whose scheduled release instant has passed and
    /// drop automation lying wholly in the past.
    /// Returns the number of units released.
    pub fn collect(&mut self, now: f64) -> usize {
        for unit in self.units.values_mut() {
            for param in unit.params.values_mut() {
                param.prune(now);
            }
        }
        let expired: Vec<UnitId> = self
            .units
            .iter()
            .filter(|(_, u)| u.expires_at.is_some_and(|t| t <= now))
            .map(|(id, _)| id)
            .collect();
        for &id in &expired {
            self.release(id);
        }
        expired.len()
    }

    /// Destroy a unit, disconnecting both its outputs and every connection
    /// feeding it (audio or parameter modulation).
    pub fn release(&mut self, unit: UnitId) -> bool {
        if !self.units.contains_key(unit) {
            return false;
        }
        self.disconnect_all(unit);

        let feeding: Vec<(UnitId, Endpoint)> = self
            .units
            .iter()
            .flat_map(|(src, u)| {
                u.outputs
                    .iter()
                    .filter(|e| e.unit() == Some(unit))
                    .map(move |e| (src, e.clone()))
            })
            .collect();
        for (src, to) in feeding {
            self.disconnect(src, &to);
        }

        self.units.remove(unit);
        self.commands.push(UnitCommand::Release { unit });
        true
    }

    /// Units connected into `unit` through any endpoint
    pub fn inputs_of(&self, unit: UnitId) -> Vec<(UnitId, Endpoint)> {
        self.units
            .iter()
            .flat_map(|(src, u)| {
                u.outputs
                    .iter()
                    .filter(|e| e.unit() == Some(unit))
                    .map(move |e| (src, e.clone()))
            })
            .collect()
    }
}
