//! Graph Serialization
//!
//! The exchange format for node graphs: a `nodes` array carrying identity
//! and wiring, and a `nodeData` array carrying node type and parameter
//! values. Both arrays correspond by position; inputs reference other nodes
//! by integer `id`.
//!
//! ```json
//! {
//!   "nodes": [{"id": 0, "name": "out", "inputs": [1]}, {"id": 1, "name": "osc", "inputs": []}],
//!   "nodeData": [{"type": "out", "params": {}}, {"type": "Oscillator", "params": {"frequency": 220}}]
//! }
//! ```

use crate::arpeggiator::ArpMode;
use crate::graph::GraphError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serializable node graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDef {
    /// Preset name, when the graph is stored as a preset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<GraphNodeDef>,
    pub node_data: Vec<NodeDataDef>,
    /// Keyboard settings saved alongside the graph
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<KeyboardDef>,
}

impl GraphDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let def: Self = serde_json::from_str(json)?;
        def.validate()?;
        Ok(def)
    }

    /// Append a node, returning its id
    pub fn add_node(&mut self, name: &str, data: NodeDataDef) -> u32 {
        let id = self.nodes.iter().map(|n| n.id + 1).max().unwrap_or(0);
        self.nodes.push(GraphNodeDef::new(id, name));
        self.node_data.push(data);
        id
    }

    /// Builder form of [`GraphDef::add_node`]
    pub fn with_node(mut self, name: &str, data: NodeDataDef) -> Self {
        self.add_node(name, data);
        self
    }

    /// Wire the node named `src` into the node named `dst`
    pub fn connect(&mut self, src: &str, dst: &str) -> Result<(), GraphError> {
        let src_id = self
            .node_named(src)
            .map(|n| n.id)
            .ok_or_else(|| GraphError::UnknownNode(src.to_string()))?;
        let dst_node = self
            .nodes
            .iter_mut()
            .find(|n| n.name == dst)
            .ok_or_else(|| GraphError::UnknownNode(dst.to_string()))?;
        if !dst_node.inputs.contains(&src_id) {
            dst_node.inputs.push(src_id);
        }
        Ok(())
    }

    pub fn with_keyboard(mut self, keyboard: KeyboardDef) -> Self {
        self.keyboard = Some(keyboard);
        self
    }

    pub fn node_named(&self, name: &str) -> Option<&GraphNodeDef> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Node definitions paired with their data
    pub fn entries(&self) -> impl Iterator<Item = (&GraphNodeDef, &NodeDataDef)> {
        self.nodes.iter().zip(self.node_data.iter())
    }

    pub fn portamento(&self) -> f64 {
        self.keyboard.as_ref().map(|k| k.portamento).unwrap_or(0.0)
    }

    /// Structural checks that do not need the node catalog
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.len() != self.node_data.len() {
            return Err(GraphError::MismatchedNodeData {
                nodes: self.nodes.len(),
                data: self.node_data.len(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id) {
                return Err(GraphError::DuplicateNodeId(node.id));
            }
        }
        Ok(())
    }
}

/// Identity, wiring and display data of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNodeDef {
    pub id: u32,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub name: String,
    /// Ids of the nodes feeding this one
    #[serde(default)]
    pub inputs: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<String>,
}

impl GraphNodeDef {
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            x: 0.0,
            y: 0.0,
            name: name.to_string(),
            inputs: Vec::new(),
            classes: None,
        }
    }
}

/// Type and parameter values of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDataDef {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_params: Option<Vec<String>>,
}

impl NodeDataDef {
    pub fn new(node_type: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            params: BTreeMap::new(),
            control_param: None,
            control_params: None,
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn with_control_param(mut self, name: &str) -> Self {
        self.control_param = Some(name.to_string());
        self
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.params.get(name) {
            Some(ParamValue::Number(v)) => Some(*v),
            _ => None,
        }
    }
}

/// Serialized parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Number(f64),
    /// Choice value, or base64 sample data
    Text(String),
    /// Named base64 samples of a sound bank
    Bank(Vec<NamedSample>),
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Flag(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// One sample of a sound bank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSample {
    pub name: String,
    /// Base64-encoded sample file
    pub data: String,
}

/// Keyboard settings stored with a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyboardDef {
    /// Glide time in seconds
    #[serde(default)]
    pub portamento: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub octave: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arpeggio: Option<ArpeggioDef>,
}

impl KeyboardDef {
    pub fn with_portamento(portamento: f64) -> Self {
        Self {
            portamento,
            octave: None,
            arpeggio: None,
        }
    }
}

/// Arpeggiator settings stored with a graph
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArpeggioDef {
    pub bpm: f64,
    pub mode: ArpMode,
    pub octave: u8,
}

/// Encode raw sample file bytes for storage
pub fn encode_sample(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_sample(data: &str) -> Result<Vec<u8>, GraphError> {
    BASE64
        .decode(data)
        .map_err(|e| GraphError::InvalidSampleData(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPH: &str = r#"{
        "nodes": [
            {"id": 3, "x": 10, "y": 20, "name": "out", "inputs": [7]},
            {"id": 7, "x": 0, "y": 0, "name": "osc", "inputs": [], "classes": "node node-src"}
        ],
        "nodeData": [
            {"type": "out", "params": {}},
            {"type": "Oscillator", "params": {"frequency": 440, "type": "square"}}
        ],
        "keyboard": {"portamento": 0.1, "octave": 3, "arpeggio": {"bpm": 90, "mode": "ud", "octave": 2}}
    }"#;

    #[test]
    fn test_parse_graph() {
        let def = GraphDef::from_json(GRAPH).unwrap();
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.nodes[0].inputs, vec![7]);
        assert_eq!(def.node_data[1].number("frequency"), Some(440.0));
        assert_eq!(
            def.node_data[1].params.get("type"),
            Some(&ParamValue::Text("square".into()))
        );
        assert_eq!(def.portamento(), 0.1);
        let arp = def.keyboard.as_ref().unwrap().arpeggio.unwrap();
        assert_eq!(arp.mode, ArpMode::UpDown);
    }

    #[test]
    fn test_mismatched_arrays_rejected() {
        let json = r#"{"nodes": [{"id": 0, "name": "out", "inputs": []}], "nodeData": []}"#;
        assert!(matches!(
            GraphDef::from_json(json),
            Err(GraphError::MismatchedNodeData { nodes: 1, data: 0 })
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let json = r#"{
            "nodes": [{"id": 1, "inputs": []}, {"id": 1, "inputs": []}],
            "nodeData": [{"type": "out"}, {"type": "Gain"}]
        }"#;
        assert!(matches!(
            GraphDef::from_json(json),
            Err(GraphError::DuplicateNodeId(1))
        ));
    }

    #[test]
    fn test_builder_assigns_ids_and_inputs() {
        let mut def = GraphDef::new("test")
            .with_node("out", NodeDataDef::new("out"))
            .with_node("osc", NodeDataDef::new("Oscillator").with_param("frequency", 110.0));
        def.connect("osc", "out").unwrap();
        def.connect("osc", "out").unwrap();
        assert_eq!(def.nodes[1].id, 1);
        assert_eq!(def.nodes[0].inputs, vec![1]);
        assert!(def.connect("lfo", "out").is_err());
    }

    #[test]
    fn test_sound_bank_param() {
        let json = r#"{"type": "SoundBank", "params": {"buffer": [{"name": "kick", "data": "AAEC"}]}}"#;
        let data: NodeDataDef = serde_json::from_str(json).unwrap();
        match data.params.get("buffer") {
            Some(ParamValue::Bank(samples)) => {
                assert_eq!(samples[0].name, "kick");
                assert_eq!(decode_sample(&samples[0].data).unwrap(), vec![0, 1, 2]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_base64() {
        assert!(decode_sample("not base64!").is_err());
        assert_eq!(encode_sample(&[0, 1, 2]), "AAEC");
    }

    #[test]
    fn test_json_roundtrip_keeps_camel_case() {
        let def = GraphDef::from_json(GRAPH).unwrap();
        let json = def.to_json().unwrap();
        assert!(json.contains("nodeData"));
        assert_eq!(GraphDef::from_json(&json).unwrap(), def);
    }
}
