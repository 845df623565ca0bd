//! Node Graph
//!
//! A `Synth` is one monophonic synthesis instance: a graph of nodes, each
//! owning a processing unit and, depending on its type, a note handler.
//! Nodes are added, wired and parameterised either one by one (the editor
//! path) or all at once from a [`GraphDef`].
//!
//! Connecting a control node (LFO, envelope, ...) to an audio node routes
//! the control output into one of the target's continuous parameters
//! instead of its audio input.

use crate::arpeggiator::NoteSink;
use crate::catalog::{NodeCatalog, NodeDef, NodeKind, ParamHandlerKind, ParamInitial};
use crate::clock::SharedClock;
use crate::handler::{NoteContext, NoteHandler};
use crate::ramp::Portamento;
use crate::serialize::{
    decode_sample, encode_sample, GraphDef, GraphNodeDef, KeyboardDef, NamedSample, NodeDataDef,
    ParamValue,
};
use crate::unit::{
    AutomationEvent, Endpoint, FieldValue, SampleBuffer, SampleSlot, UnitCommand, UnitGraph,
    UnitId, UnitKind,
};
use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

new_key_type! {
    /// Identifier of a node inside a `Synth`
    pub struct NodeId;
}

/// Continuous parameter of the output node set to the note velocity
pub const OUTPUT_GAIN: &str = "gain";

/// Error types for graph operations
#[derive(Debug)]
pub enum GraphError {
    UnknownNodeType(String),
    UnknownNode(String),
    InvalidNode,
    UnknownParam { node: String, param: String },
    InvalidParamValue { node: String, param: String },
    InvalidConnection(String),
    MismatchedNodeData { nodes: usize, data: usize },
    DuplicateNodeId(u32),
    InvalidSampleData(String),
    NoSampleSlot(String),
    Json(serde_json::Error),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::UnknownNodeType(t) => write!(f, "No node type found for \"{}\"", t),
            GraphError::UnknownNode(n) => write!(f, "Node \"{}\" not found in synth", n),
            GraphError::InvalidNode => write!(f, "Invalid node"),
            GraphError::UnknownParam { node, param } => {
                write!(f, "Parameter \"{}\" not found in node \"{}\"", param, node)
            }
            GraphError::InvalidParamValue { node, param } => {
                write!(f, "Invalid value for parameter \"{}\" of node \"{}\"", param, node)
            }
            GraphError::InvalidConnection(msg) => write!(f, "Invalid connection: {}", msg),
            GraphError::MismatchedNodeData { nodes, data } => write!(
                f,
                "Graph has {} nodes but {} node data entries",
                nodes, data
            ),
            GraphError::DuplicateNodeId(id) => write!(f, "Duplicate node id {}", id),
            GraphError::InvalidSampleData(msg) => write!(f, "Invalid sample data: {}", msg),
            GraphError::NoSampleSlot(n) => write!(f, "Node \"{}\" does not hold samples", n),
            GraphError::Json(e) => write!(f, "Malformed graph: {}", e),
        }
    }
}

impl std::error::Error for GraphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GraphError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(e: serde_json::Error) -> Self {
        GraphError::Json(e)
    }
}

/// Per-instance record of one graph node
#[derive(Debug, Clone)]
pub struct NodeData {
    id: u32,
    name: String,
    kind: NodeKind,
    unit: UnitId,
    handler: Option<NoteHandler>,
    inputs: Vec<NodeId>,
    control_param: Option<String>,
    control_params: Vec<String>,
    position: (f64, f64),
    classes: Option<String>,
}

impl NodeData {
    /// Serialized id
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn handler(&self) -> Option<&NoteHandler> {
        self.handler.as_ref()
    }

    /// Nodes feeding this one, in connection order
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Target parameter of a control node
    pub fn control_param(&self) -> Option<&str> {
        self.control_param.as_deref()
    }

    /// Parameters a control node may target on its current destination
    pub fn control_params(&self) -> &[String] {
        &self.control_params
    }

    pub fn position(&self) -> (f64, f64) {
        self.position
    }

    pub fn set_position(&mut self, x: f64, y: f64) {
        self.position = (x, y);
    }

    pub fn def(&self) -> &'static NodeDef {
        // Every kind is registered in the global catalog
        NodeCatalog::global()
            .get(self.kind)
            .unwrap_or_else(|| unreachable!("node kind {} not in catalog", self.kind))
    }
}

/// Parameter value checked against its definition, ready to apply
#[derive(Debug, Clone)]
enum Prepared {
    Number(f64),
    Field(FieldValue),
    Sample(SampleSlot),
    Bank(Vec<SampleSlot>),
}

/// Sample data waiting for the host to decode it
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRequest<'a> {
    pub node: NodeId,
    /// Position in a sound bank, `None` for a single-sample node
    pub index: Option<usize>,
    pub name: &'a str,
    pub encoded: &'a [u8],
}

/// One monophonic synthesis instance
pub struct Synth {
    clock: SharedClock,
    units: UnitGraph,
    nodes: SlotMap<NodeId, NodeData>,
    order: Vec<NodeId>,
    output: Option<NodeId>,
    bus: u32,
    portamento: Portamento,
}

impl Synth {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            units: UnitGraph::new(),
            nodes: SlotMap::with_key(),
            order: Vec::new(),
            output: None,
            bus: 0,
            portamento: Portamento::default(),
        }
    }

    /// Build a synth from a serialized graph
    pub fn from_def(clock: SharedClock, def: &GraphDef) -> Result<Self, GraphError> {
        let mut synth = Self::new(clock);
        synth.load(def)?;
        Ok(synth)
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn units(&self) -> &UnitGraph {
        &self.units
    }

    /// Take the unit commands issued since the last drain
    pub fn drain_commands(&mut self) -> Vec<UnitCommand> {
        self.units.drain_commands()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeData> {
        self.nodes.get_mut(id)
    }

    /// Nodes in creation order
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NodeData)> {
        self.order.iter().filter_map(|&id| self.nodes.get(id).map(|n| (id, n)))
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes().find(|(_, n)| n.name == name).map(|(id, _)| id)
    }

    pub fn node_by_id(&self, id: u32) -> Option<NodeId> {
        self.nodes().find(|(_, n)| n.id == id).map(|(nid, _)| nid)
    }

    pub fn output(&self) -> Option<NodeId> {
        self.output
    }

    pub fn portamento(&self) -> Portamento {
        self.portamento
    }

    pub fn set_portamento(&mut self, portamento: Portamento) {
        self.portamento = portamento;
    }

    pub fn set_portamento_time(&mut self, time: f64) {
        self.portamento.time = time.max(0.0);
    }

    /// Output bus the output node feeds
    pub fn bus(&self) -> u32 {
        self.bus
    }

    /// Re-route the output node to another host bus
    pub fn route_to(&mut self, bus: u32) {
        if let Some(unit) = self.output.and_then(|id| self.nodes.get(id)).map(|n| n.unit) {
            self.units.disconnect(unit, &Endpoint::Bus(self.bus));
            self.units.connect(unit, Endpoint::Bus(bus));
        }
        self.bus = bus;
    }

    /// Add a node of the given serialized type
    pub fn add_node(&mut self, type_name: &str, name: &str) -> Result<NodeId, GraphError> {
        let kind = NodeKind::from_type_name(type_name)
            .ok_or_else(|| GraphError::UnknownNodeType(type_name.to_string()))?;
        let id = self.order.iter().map(|n| self.nodes[*n].id + 1).max().unwrap_or(0);
        Ok(self.insert_node(kind, id, name))
    }

    fn insert_node(&mut self, kind: NodeKind, id: u32, name: &str) -> NodeId {
        let def = NodeCatalog::global()
            .get(kind)
            .unwrap_or_else(|| unreachable!("node kind {} not in catalog", kind));
        let unit = if def.is_output() {
            let unit = self
                .units
                .create(UnitKind::Output, [(OUTPUT_GAIN.to_string(), 1.0)], []);
            self.units.connect(unit, Endpoint::Bus(self.bus));
            unit
        } else {
            self.units
                .create(def.unit, def.initial_params(), def.initial_fields())
        };
        if let Some(u) = self.units.get_mut(unit) {
            match def.params.iter().find_map(|p| p.handler) {
                Some(ParamHandlerKind::BufferData) => u.sample = Some(SampleSlot::default()),
                Some(ParamHandlerKind::SoundBank) | None => {}
            }
        }
        let data = NodeData {
            id,
            name: name.to_string(),
            kind,
            unit,
            handler: def.note_handler.map(|k| NoteHandler::new(k, unit)),
            inputs: Vec::new(),
            control_param: None,
            control_params: Vec::new(),
            position: (0.0, 0.0),
            classes: None,
        };
        let node = self.nodes.insert(data);
        self.order.push(node);
        if def.is_output() {
            self.output = Some(node);
        }
        node
    }

    /// Remove a node, dropping every connection to or from it
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), GraphError> {
        let feeders = self.nodes.get(node).ok_or(GraphError::InvalidNode)?.inputs.clone();
        for src in feeders {
            self.disconnect_nodes(src, node);
        }
        let consumers: Vec<NodeId> = self
            .order
            .iter()
            .copied()
            .filter(|dst| self.nodes[*dst].inputs.contains(&node))
            .collect();
        for dst in consumers {
            self.disconnect_nodes(node, dst);
            self.nodes[dst].inputs.retain(|n| *n != node);
        }

        if let Some(mut data) = self.nodes.remove(node) {
            if let Some(handler) = data.handler.as_mut() {
                handler.shutdown(&mut self.units);
            }
            self.units.release(data.unit);
        }
        self.order.retain(|n| *n != node);
        if self.output == Some(node) {
            self.output = None;
        }
        Ok(())
    }

    /// Remove every node
    pub fn clear(&mut self) {
        for node in self.order.clone().into_iter().rev() {
            let _ = self.remove_node(node);
        }
    }

    pub fn connect(&mut self, src: NodeId, dst: NodeId) -> Result<(), GraphError> {
        let (Some(s), Some(d)) = (self.nodes.get(src), self.nodes.get(dst)) else {
            return Err(GraphError::InvalidNode);
        };
        if src == dst {
            return Err(GraphError::InvalidConnection(format!(
                "\"{}\" cannot feed itself",
                s.name
            )));
        }
        if s.def().is_output() {
            return Err(GraphError::InvalidConnection(format!(
                "\"{}\" has no outputs",
                s.name
            )));
        }
        if d.inputs.contains(&src) {
            return Err(GraphError::InvalidConnection(format!(
                "\"{}\" already feeds \"{}\"",
                s.name, d.name
            )));
        }
        self.nodes[dst].inputs.push(src);
        self.connect_nodes(src, dst);
        Ok(())
    }

    pub fn disconnect(&mut self, src: NodeId, dst: NodeId) -> Result<(), GraphError> {
        let d = self.nodes.get(dst).ok_or(GraphError::InvalidNode)?;
        if !d.inputs.contains(&src) {
            return Err(GraphError::InvalidConnection("nodes are not connected".into()));
        }
        self.disconnect_nodes(src, dst);
        self.nodes[dst].inputs.retain(|n| *n != src);
        Ok(())
    }

    /// Wire the processing units of two nodes already linked in the graph
    fn connect_nodes(&mut self, src: NodeId, dst: NodeId) {
        let (src_def, dst_def) = (self.nodes[src].def(), self.nodes[dst].def());
        let dst_unit = self.nodes[dst].unit;
        let src_unit = self.nodes[src].unit;

        if src_def.control && !dst_def.control {
            let params: Vec<String> = dst_def.automatable_params().map(String::from).collect();
            let data = &mut self.nodes[src];
            let keep = data
                .control_param
                .as_ref()
                .is_some_and(|p| params.contains(p));
            if !keep {
                data.control_param = params.first().cloned();
            }
            data.control_params = params;
            if let Some(param) = data.control_param.clone() {
                self.units.connect(src_unit, Endpoint::Param(dst_unit, param));
                return;
            }
        }
        self.units.connect(src_unit, Endpoint::Unit(dst_unit));
    }

    fn disconnect_nodes(&mut self, src: NodeId, dst: NodeId) {
        let src_unit = self.nodes[src].unit;
        let dst_unit = self.nodes[dst].unit;
        let edges: Vec<Endpoint> = self
            .units
            .get(src_unit)
            .map(|u| {
                u.outputs()
                    .iter()
                    .filter(|e| e.unit() == Some(dst_unit))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let now = self.clock.now();
        for edge in edges {
            self.units.disconnect(src_unit, &edge);
            if let Endpoint::Param(unit, param) = &edge {
                if let Some(handler) = self.nodes[src].handler.as_ref() {
                    let mut cx = NoteContext {
                        graph: &mut self.units,
                        portamento: &self.portamento,
                        now,
                    };
                    handler.detach(&mut cx, *unit, param);
                }
                self.nodes[src].control_params.clear();
            }
        }
    }

    /// Choose which parameter of its destination a control node drives
    pub fn set_control_param(&mut self, node: NodeId, param: &str) -> Result<(), GraphError> {
        let data = self.nodes.get(node).ok_or(GraphError::InvalidNode)?;
        if !data.control_params.iter().any(|p| p == param) {
            return Err(GraphError::UnknownParam {
                node: data.name.clone(),
                param: param.to_string(),
            });
        }
        let consumers: Vec<NodeId> = self
            .order
            .iter()
            .copied()
            .filter(|dst| self.nodes[*dst].inputs.contains(&node))
            .collect();
        for dst in &consumers {
            self.disconnect_nodes(node, *dst);
        }
        self.nodes[node].control_param = Some(param.to_string());
        for dst in consumers {
            self.connect_nodes(node, dst);
        }
        Ok(())
    }

    fn prepare_param(
        def: &NodeDef,
        node: &str,
        name: &str,
        value: &ParamValue,
    ) -> Result<Prepared, GraphError> {
        let pdef = def.param_def(name).ok_or_else(|| GraphError::UnknownParam {
            node: node.to_string(),
            param: name.to_string(),
        })?;
        let invalid = || GraphError::InvalidParamValue {
            node: node.to_string(),
            param: name.to_string(),
        };
        let prepared = match (pdef.handler, &pdef.initial, value) {
            (Some(ParamHandlerKind::BufferData), _, ParamValue::Text(data)) => {
                Prepared::Sample(SampleSlot {
                    name: String::new(),
                    encoded: decode_sample(data)?,
                    decoded: None,
                })
            }
            (Some(ParamHandlerKind::SoundBank), _, ParamValue::Bank(samples)) => {
                let slots = samples
                    .iter()
                    .map(|s| {
                        Ok(SampleSlot {
                            name: s.name.clone(),
                            encoded: decode_sample(&s.data)?,
                            decoded: None,
                        })
                    })
                    .collect::<Result<Vec<_>, GraphError>>()?;
                Prepared::Bank(slots)
            }
            (Some(_), _, _) => return Err(invalid()),
            (None, ParamInitial::Number(_), ParamValue::Number(v)) if pdef.automatable => {
                Prepared::Number(*v)
            }
            (None, ParamInitial::Number(_), ParamValue::Number(v)) => {
                Prepared::Field(FieldValue::Number(*v))
            }
            (None, ParamInitial::Choice(_), ParamValue::Text(s)) => {
                if !pdef.choices.is_empty() && !pdef.choices.contains(s) {
                    return Err(invalid());
                }
                Prepared::Field(FieldValue::Text(s.clone()))
            }
            (None, ParamInitial::Flag(_), ParamValue::Flag(b)) => Prepared::Field(FieldValue::Bool(*b)),
            _ => return Err(invalid()),
        };
        Ok(prepared)
    }

    fn apply_param(&mut self, node: NodeId, name: &str, value: Prepared) {
        let unit = self.nodes[node].unit;
        match value {
            Prepared::Number(v) => {
                self.units.set_param(unit, name, v);
                if let Some(p) = self.units.param_mut(unit, name) {
                    p.set_nominal(v);
                }
            }
            Prepared::Field(v) => {
                self.units.set_field(unit, name, v);
            }
            Prepared::Sample(slot) => {
                if let Some(u) = self.units.get_mut(unit) {
                    u.sample = Some(slot);
                    // Playback waits for the host to decode the new data
                    u.buffer = None;
                }
            }
            Prepared::Bank(slots) => {
                if let Some(u) = self.units.get_mut(unit) {
                    u.bank = slots;
                }
            }
        }
    }

    /// Set a node parameter from its serialized form
    pub fn set_param(
        &mut self,
        node: NodeId,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<(), GraphError> {
        let data = self.nodes.get(node).ok_or(GraphError::InvalidNode)?;
        let prepared = Self::prepare_param(data.def(), &data.name, name, &value.into())?;
        self.apply_param(node, name, prepared);
        Ok(())
    }

    /// Current value of a node parameter in serialized form
    pub fn param(&self, node: NodeId, name: &str) -> Option<ParamValue> {
        let data = self.nodes.get(node)?;
        let pdef = data.def().param_def(name)?;
        let unit = self.units.get(data.unit)?;
        match pdef.handler {
            Some(ParamHandlerKind::BufferData) => unit
                .sample
                .as_ref()
                .filter(|s| !s.encoded.is_empty())
                .map(|s| ParamValue::Text(encode_sample(&s.encoded))),
            Some(ParamHandlerKind::SoundBank) => Some(ParamValue::Bank(
                unit.bank
                    .iter()
                    .map(|s| NamedSample {
                        name: s.name.clone(),
                        data: encode_sample(&s.encoded),
                    })
                    .collect(),
            )),
            None if pdef.automatable => unit.param(name).map(|p| ParamValue::Number(p.nominal())),
            None => unit.field(name).map(|f| match f {
                FieldValue::Bool(b) => ParamValue::Flag(*b),
                FieldValue::Number(v) => ParamValue::Number(*v),
                FieldValue::Text(s) => ParamValue::Text(s.clone()),
            }),
        }
    }

    /// Set a continuous parameter's value, scheduling a ramp when
    /// `ramp_time` is given
    pub fn set_param_value(
        &mut self,
        node: NodeId,
        name: &str,
        value: f64,
        ramp_time: Option<f64>,
        exponential: bool,
    ) -> Result<(), GraphError> {
        let data = self.nodes.get(node).ok_or(GraphError::InvalidNode)?;
        let unit = data.unit;
        if self.units.param(unit, name).is_none() {
            return Err(GraphError::UnknownParam {
                node: data.name.clone(),
                param: name.to_string(),
            });
        }
        match ramp_time {
            None => {
                self.units.set_param(unit, name, value);
                if let Some(p) = self.units.param_mut(unit, name) {
                    p.set_nominal(value);
                }
            }
            Some(ramp) => {
                let time = self.clock.now() + ramp.max(0.0);
                let event = if exponential {
                    AutomationEvent::ExponentialRamp { value, time }
                } else {
                    AutomationEvent::LinearRamp { value, time }
                };
                self.units.automate(unit, name, event);
            }
        }
        Ok(())
    }

    /// Names of every continuous parameter as `node/param`
    pub fn param_paths(&self) -> Vec<String> {
        self.nodes()
            .flat_map(|(_, n)| {
                n.def()
                    .automatable_params()
                    .map(move |p| format!("{}/{}", n.name, p))
            })
            .collect()
    }

    /// Replace the whole graph with a serialized one.
    ///
    /// Every node type and parameter is checked before existing state is
    /// touched, so a failed load leaves the synth unchanged. Nodes are then
    /// created, linked by id, given their parameter data, and only then
    /// wired, so control routing sees the complete graph.
    pub fn load(&mut self, def: &GraphDef) -> Result<(), GraphError> {
        def.validate()?;
        let mut plan = Vec::with_capacity(def.nodes.len());
        for (node, data) in def.entries() {
            let kind = NodeKind::from_type_name(&data.node_type)
                .ok_or_else(|| GraphError::UnknownNodeType(data.node_type.clone()))?;
            let ndef = NodeCatalog::global()
                .get(kind)
                .ok_or_else(|| GraphError::UnknownNodeType(data.node_type.clone()))?;
            let params = data
                .params
                .iter()
                .map(|(name, value)| {
                    Self::prepare_param(ndef, &node.name, name, value).map(|p| (name.clone(), p))
                })
                .collect::<Result<Vec<_>, GraphError>>()?;
            plan.push((kind, params));
        }

        self.clear();

        let mut by_id = HashMap::new();
        let mut created = Vec::with_capacity(def.nodes.len());
        for ((node, data), (kind, _)) in def.entries().zip(&plan) {
            let id = self.insert_node(*kind, node.id, &node.name);
            let n = &mut self.nodes[id];
            n.position = (node.x, node.y);
            n.classes = node.classes.clone();
            n.control_param = data.control_param.clone();
            by_id.insert(node.id, id);
            created.push(id);
        }
        for (node, &id) in def.nodes.iter().zip(&created) {
            let inputs: Vec<NodeId> = node
                .inputs
                .iter()
                .filter_map(|i| by_id.get(i).copied())
                .collect();
            self.nodes[id].inputs = inputs;
        }
        for ((_, params), &id) in plan.into_iter().zip(&created) {
            for (name, value) in params {
                self.apply_param(id, &name, value);
            }
        }
        for &dst in &created {
            for src in self.nodes[dst].inputs.clone() {
                self.connect_nodes(src, dst);
            }
        }
        self.portamento.time = def.portamento();
        debug!("Loaded graph with {} nodes", created.len());
        Ok(())
    }

    /// Serialize the current graph
    pub fn to_def(&self) -> GraphDef {
        let mut def = GraphDef::default();
        for (id, n) in self.nodes() {
            def.nodes.push(GraphNodeDef {
                id: n.id,
                x: n.position.0,
                y: n.position.1,
                name: n.name.clone(),
                inputs: n.inputs.iter().map(|i| self.nodes[*i].id).collect(),
                classes: n.classes.clone(),
            });
            let mut data = NodeDataDef::new(n.kind.type_name());
            for pdef in &n.def().params {
                if let Some(value) = self.param(id, &pdef.name) {
                    data.params.insert(pdef.name.clone(), value);
                }
            }
            if n.def().control {
                data.control_param = n.control_param.clone();
                if !n.control_params.is_empty() {
                    data.control_params = Some(n.control_params.clone());
                }
            }
            def.node_data.push(data);
        }
        if self.portamento.time > 0.0 {
            def.keyboard = Some(KeyboardDef::with_portamento(self.portamento.time));
        }
        def
    }

    /// Give every non-envelope handler the longest envelope release so
    /// sources keep sounding while the envelope fades out
    fn propagate_release(&mut self) {
        let units = &self.units;
        let max_release = self
            .nodes
            .values()
            .filter_map(|n| n.handler.as_ref())
            .filter(|h| h.is_key_triggered())
            .map(|h| h.release_time(units))
            .fold(0.0, f64::max);
        for node in self.nodes.values_mut() {
            if let Some(h) = node.handler.as_mut() {
                h.set_release_time(max_release);
            }
        }
    }

    /// Start a note at `time`, or immediately
    pub fn note_on(&mut self, note: u8, velocity: f64, time: Option<f64>) {
        let now = self.clock.now();
        let time = time.unwrap_or(now);
        if let Some(out) = self.output.and_then(|id| self.nodes.get(id)).map(|n| n.unit) {
            self.units.automate(
                out,
                OUTPUT_GAIN,
                AutomationEvent::SetValue {
                    value: velocity,
                    time,
                },
            );
        }
        let ratio = crate::note_ratio(note);
        self.propagate_release();

        let portamento = self.portamento;
        let mut cx = NoteContext {
            graph: &mut self.units,
            portamento: &portamento,
            now,
        };
        for id in &self.order {
            if let Some(handler) = self.nodes.get_mut(*id).and_then(|n| n.handler.as_mut()) {
                handler.note_on(&mut cx, note, ratio, time);
            }
        }
        self.portamento.ratio = ratio;
        debug!(note, velocity, time, "note on");
    }

    /// Release a note at `time`, or immediately
    pub fn note_off(&mut self, note: u8, velocity: f64, time: Option<f64>) {
        let now = self.clock.now();
        let time = time.unwrap_or(now);
        let portamento = self.portamento;
        let mut cx = NoteContext {
            graph: &mut self.units,
            portamento: &portamento,
            now,
        };
        for id in &self.order {
            if let Some(handler) = self.nodes.get_mut(*id).and_then(|n| n.handler.as_mut()) {
                handler.note_off(&mut cx, note, time);
            }
        }
        debug!(note, velocity, time, "note off");
    }

    /// Release ephemeral units whose stop instant has passed
    pub fn collect(&mut self, now: f64) -> usize {
        self.units.collect(now)
    }

    /// Note-ons dropped so far because sample data was not decoded yet
    pub fn dropped_notes(&self) -> u64 {
        self.nodes
            .values()
            .filter_map(|n| n.handler.as_ref())
            .map(|h| h.dropped())
            .sum()
    }

    /// Encoded samples the host still has to decode
    pub fn pending_samples(&self) -> Vec<SampleRequest<'_>> {
        let mut pending = Vec::new();
        for (id, n) in self.nodes() {
            let Some(unit) = self.units.get(n.unit) else {
                continue;
            };
            if let Some(slot) = unit.sample.as_ref() {
                if slot.decoded.is_none() && !slot.encoded.is_empty() {
                    pending.push(SampleRequest {
                        node: id,
                        index: None,
                        name: &slot.name,
                        encoded: &slot.encoded,
                    });
                }
            }
            for (i, slot) in unit.bank.iter().enumerate() {
                if slot.decoded.is_none() {
                    pending.push(SampleRequest {
                        node: id,
                        index: Some(i),
                        name: &slot.name,
                        encoded: &slot.encoded,
                    });
                }
            }
        }
        pending
    }

    /// Hand over the decoded sample of a buffer node
    pub fn deliver_sample(&mut self, node: NodeId, buffer: SampleBuffer) -> Result<(), GraphError> {
        let data = self.nodes.get(node).ok_or(GraphError::InvalidNode)?;
        let (name, unit_id) = (data.name.clone(), data.unit);
        let unit = self.units.get_mut(unit_id).ok_or(GraphError::InvalidNode)?;
        let slot = unit.sample.as_mut().ok_or(GraphError::NoSampleSlot(name))?;
        let buffer = Arc::new(buffer);
        slot.decoded = Some(buffer.clone());
        self.units.set_buffer(unit_id, buffer);
        Ok(())
    }

    /// Hand over one decoded sample of a sound bank node
    pub fn deliver_bank_sample(
        &mut self,
        node: NodeId,
        index: usize,
        buffer: SampleBuffer,
    ) -> Result<(), GraphError> {
        let data = self.nodes.get(node).ok_or(GraphError::InvalidNode)?;
        let name = data.name.clone();
        let unit = self
            .units
            .get_mut(data.unit)
            .ok_or(GraphError::InvalidNode)?;
        let slot = unit
            .bank
            .get_mut(index)
            .ok_or(GraphError::NoSampleSlot(name))?;
        slot.decoded = Some(Arc::new(buffer));
        Ok(())
    }

    /// Release spawned units and drop every connection, leaving the nodes
    /// in place but silent
    pub fn close(&mut self) {
        for dst in self.order.clone() {
            for src in self.nodes[dst].inputs.clone() {
                self.disconnect_nodes(src, dst);
            }
        }
        for node in self.nodes.values_mut() {
            if let Some(h) = node.handler.as_mut() {
                h.shutdown(&mut self.units);
            }
        }
        if let Some(unit) = self.output.and_then(|id| self.nodes.get(id)).map(|n| n.unit) {
            self.units.disconnect_all(unit);
        }
    }
}

impl NoteSink for Synth {
    fn note_on(&mut self, note: u8, velocity: f64, time: f64) {
        Synth::note_on(self, note, velocity, Some(time));
    }

    fn note_off(&mut self, note: u8, velocity: f64, time: f64) {
        Synth::note_off(self, note, velocity, Some(time));
    }
}

impl std::fmt::Debug for Synth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synth")
            .field("nodes", &self.order.len())
            .field("units", &self.units.len())
            .field("bus", &self.bus)
            .field("portamento", &self.portamento)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::HandlerKind;
    use crate::clock::ManualClock;
    use crate::handler::HandlerState;
    use crate::unit::PlayState;
    use approx::assert_relative_eq;

    fn synth() -> (ManualClock, Synth) {
        let clock = ManualClock::new(0.0);
        let synth = Synth::new(Arc::new(clock.clone()));
        (clock, synth)
    }

    /// Oscillator into a gain shaped by an envelope, into the output
    fn basic_def() -> GraphDef {
        let mut def = GraphDef::new("basic")
            .with_node("out", NodeDataDef::new("out"))
            .with_node("amp", NodeDataDef::new("Gain"))
            .with_node("osc", NodeDataDef::new("Oscillator").with_param("frequency", 110.0))
            .with_node(
                "env",
                NodeDataDef::new("ADSR")
                    .with_param("attack", 0.1)
                    .with_param("release", 0.5),
            );
        def.connect("amp", "out").unwrap();
        def.connect("osc", "amp").unwrap();
        def.connect("env", "amp").unwrap();
        def
    }

    fn handler_of(synth: &Synth, name: &str) -> NoteHandler {
        let id = synth.node_by_name(name).unwrap();
        synth.node(id).unwrap().handler().unwrap().clone()
    }

    #[test]
    fn test_add_and_connect() {
        let (_, mut s) = synth();
        let out = s.add_node("out", "out").unwrap();
        let osc = s.add_node("Oscillator", "osc").unwrap();
        s.connect(osc, out).unwrap();
        let osc_unit = s.node(osc).unwrap().unit();
        let out_unit = s.node(out).unwrap().unit();
        assert_eq!(
            s.units().get(osc_unit).unwrap().outputs(),
            &[Endpoint::Unit(out_unit)]
        );
        assert_eq!(
            s.units().get(out_unit).unwrap().outputs(),
            &[Endpoint::Bus(0)]
        );
        assert!(s.connect(osc, out).is_err());
        assert!(s.connect(out, osc).is_err());
        assert!(matches!(
            s.add_node("Theremin", "t"),
            Err(GraphError::UnknownNodeType(_))
        ));
    }

    #[test]
    fn test_control_node_targets_first_param() {
        let (_, mut s) = synth();
        let filter = s.add_node("Filter", "filter").unwrap();
        let lfo = s.add_node("LFO", "lfo").unwrap();
        s.connect(lfo, filter).unwrap();
        let data = s.node(lfo).unwrap();
        assert_eq!(data.control_param(), Some("frequency"));
        assert_eq!(data.control_params(), &["frequency", "Q", "detune", "gain"]);

        s.set_control_param(lfo, "Q").unwrap();
        let filter_unit = s.node(filter).unwrap().unit();
        let lfo_unit = s.node(lfo).unwrap().unit();
        assert_eq!(
            s.units().get(lfo_unit).unwrap().outputs(),
            &[Endpoint::Param(filter_unit, "Q".into())]
        );
        assert!(s.set_control_param(lfo, "type").is_err());
    }

    #[test]
    fn test_control_to_control_is_audio() {
        let (_, mut s) = synth();
        let lfo = s.add_node("LFO", "lfo").unwrap();
        let ctrl = s.add_node("GainCtrl", "depth").unwrap();
        s.connect(lfo, ctrl).unwrap();
        let ctrl_unit = s.node(ctrl).unwrap().unit();
        let lfo_unit = s.node(lfo).unwrap().unit();
        assert_eq!(
            s.units().get(lfo_unit).unwrap().outputs(),
            &[Endpoint::Unit(ctrl_unit)]
        );
    }

    #[test]
    fn test_load_order_and_routing() {
        let (_, s) = synth();
        let s = Synth::from_def(s.clock().clone(), &basic_def()).unwrap();
        assert_eq!(s.node_count(), 4);
        let env = s.node_by_name("env").unwrap();
        let amp = s.node(s.node_by_name("amp").unwrap()).unwrap().unit();
        let env_unit = s.node(env).unwrap().unit();
        assert_eq!(
            s.units().get(env_unit).unwrap().outputs(),
            &[Endpoint::Param(amp, "gain".into())]
        );
        assert_eq!(
            s.param(s.node_by_name("osc").unwrap(), "frequency"),
            Some(ParamValue::Number(110.0))
        );
        assert_eq!(handler_of(&s, "env").kind(), HandlerKind::Envelope);
    }

    #[test]
    fn test_failed_load_keeps_state() {
        let (_, mut s) = synth();
        s.load(&basic_def()).unwrap();
        let mut bad = basic_def();
        bad.node_data[2]
            .params
            .insert("frequency".into(), ParamValue::Text("loud".into()));
        assert!(matches!(
            s.load(&bad),
            Err(GraphError::InvalidParamValue { .. })
        ));
        let mut unknown = basic_def();
        unknown.node_data[1].node_type = "Warp".into();
        assert!(s.load(&unknown).is_err());
        assert_eq!(s.node_count(), 4);
    }

    #[test]
    fn test_serialized_control_param_survives_load() {
        let mut def = GraphDef::new("ctl")
            .with_node("out", NodeDataDef::new("out"))
            .with_node("filter", NodeDataDef::new("Filter"))
            .with_node("lfo", NodeDataDef::new("LFO").with_control_param("Q"));
        def.connect("filter", "out").unwrap();
        def.connect("lfo", "filter").unwrap();
        let (_, s) = synth();
        let s = Synth::from_def(s.clock().clone(), &def).unwrap();
        let lfo = s.node(s.node_by_name("lfo").unwrap()).unwrap();
        assert_eq!(lfo.control_param(), Some("Q"));
    }

    #[test]
    fn test_to_def_roundtrip() {
        let (clock, _) = synth();
        let mut def = basic_def();
        def.keyboard = Some(KeyboardDef::with_portamento(0.2));
        let s = Synth::from_def(Arc::new(clock.clone()), &def).unwrap();
        let saved = s.to_def();
        assert_eq!(saved.nodes.len(), 4);
        assert_eq!(saved.nodes[0].inputs, def.nodes[0].inputs);
        assert_eq!(saved.portamento(), 0.2);
        let env = &saved.node_data[3];
        assert_eq!(env.number("attack"), Some(0.1));
        assert_eq!(env.control_param.as_deref(), Some("gain"));

        let again = Synth::from_def(Arc::new(clock), &saved).unwrap();
        assert_eq!(again.to_def().node_data, saved.node_data);
    }

    #[test]
    fn test_note_on_propagates_release_and_sets_gain() {
        let (clock, _) = synth();
        let mut s = Synth::from_def(Arc::new(clock), &basic_def()).unwrap();
        s.note_on(69, 0.8, Some(1.0));
        let osc = handler_of(&s, "osc");
        assert_eq!(osc.release_time(s.units()), 0.5);

        let out = s.node(s.output().unwrap()).unwrap().unit();
        assert_relative_eq!(s.units().param(out, OUTPUT_GAIN).unwrap().value_at(1.0), 0.8);

        let HandlerState::Sounding(unit) = osc.state() else {
            panic!("oscillator not sounding");
        };
        // One octave above the reference note
        assert_relative_eq!(
            s.units().param(unit, "frequency").unwrap().value_at(1.0),
            110.0 * 2.0,
            epsilon = 1e-9
        );
        assert_eq!(s.portamento().ratio, crate::note_ratio(69));

        s.note_off(69, 1.0, Some(2.0));
        assert_eq!(
            s.units().get(unit).unwrap().state(),
            PlayState::Stopped(2.5)
        );
        assert_eq!(s.collect(2.5), 1);
    }

    #[test]
    fn test_removing_envelope_restores_param() {
        let (clock, _) = synth();
        let mut s = Synth::from_def(Arc::new(clock.clone()), &basic_def()).unwrap();
        s.note_on(60, 1.0, Some(0.0));
        clock.set(0.05);
        let env = s.node_by_name("env").unwrap();
        s.remove_node(env).unwrap();
        let amp = s.node(s.node_by_name("amp").unwrap()).unwrap().unit();
        let p = s.units().param(amp, "gain").unwrap();
        assert!(p.segment().is_none());
        assert_relative_eq!(p.value_at(10.0), 1.0);
        assert_eq!(s.node_count(), 3);
    }

    #[test]
    fn test_sample_delivery() {
        let def = GraphDef::new("sampler")
            .with_node("out", NodeDataDef::new("out"))
            .with_node(
                "buf",
                NodeDataDef::new("Buffer").with_param("buffer", encode_sample(b"RIFF").as_str()),
            );
        let (clock, _) = synth();
        let mut s = Synth::from_def(Arc::new(clock), &def).unwrap();
        let buf = s.node_by_name("buf").unwrap();
        let pending = s.pending_samples();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].encoded, b"RIFF");

        s.note_on(60, 1.0, Some(0.0));
        assert_eq!(s.dropped_notes(), 1);

        s.deliver_sample(
            buf,
            SampleBuffer {
                frames: 10,
                channels: 1,
                sample_rate: 10.0,
            },
        )
        .unwrap();
        assert!(s.pending_samples().is_empty());
        s.note_on(60, 1.0, Some(1.0));
        assert_eq!(s.dropped_notes(), 1);
        assert!(matches!(
            handler_of(&s, "buf").state(),
            HandlerState::Sounding(_)
        ));
        assert_eq!(
            s.param(buf, "buffer"),
            Some(ParamValue::Text(encode_sample(b"RIFF")))
        );
    }

    #[test]
    fn test_close_disconnects_everything() {
        let (clock, _) = synth();
        let mut s = Synth::from_def(Arc::new(clock), &basic_def()).unwrap();
        s.note_on(60, 1.0, Some(0.0));
        s.close();
        for (_, n) in s.nodes() {
            assert!(s.units().get(n.unit()).unwrap().outputs().is_empty());
        }
        // Only the node units remain
        assert_eq!(s.units().len(), 4);
    }

    #[test]
    fn test_route_to_bus() {
        let (clock, _) = synth();
        let mut s = Synth::from_def(Arc::new(clock), &basic_def()).unwrap();
        s.route_to(3);
        let out = s.node(s.output().unwrap()).unwrap().unit();
        assert_eq!(s.units().get(out).unwrap().outputs(), &[Endpoint::Bus(3)]);
    }
}
