//! State Snapshots
//!
//! `getCurrentState` returns a structured description of the canonical
//! voice: the node list and the connection list. External patch storage
//! owns persistence; this module only defines the snapshot types, their
//! JSON encoding and equality-up-to-renaming used to compare snapshots
//! whose auto-generated node IDs differ.

use crate::node::NodeKind;
use crate::port::{ModulationMode, ModulationTransformation, PortId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Description of one node in the canonical voice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    pub kind: NodeKind,
    /// User-facing label; never interpreted by the engine
    pub name: Option<String>,
}

/// Description of one edge in the canonical voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDef {
    pub from: String,
    pub to: String,
    pub target_port: PortId,
    pub amount: f32,
    pub mode: ModulationMode,
    pub transformation: ModulationTransformation,
}

/// Structured snapshot of the canonical graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// Schema version for forward compatibility
    pub version: u32,
    pub sample_rate: f32,
    pub voice_count: usize,
    pub nodes: Vec<NodeDef>,
    pub connections: Vec<ConnectionDef>,
}

impl EngineState {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Structural equality ignoring auto-generated node IDs: both
    /// snapshots are renamed into positional IDs (nodes in listed order)
    /// before comparison.
    pub fn structurally_equal(&self, other: &EngineState) -> bool {
        fn canonicalize(state: &EngineState) -> (Vec<(usize, NodeKind)>, Vec<CanonEdge>) {
            let renaming: HashMap<&str, usize> = state
                .nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (n.id.as_str(), i))
                .collect();
            let nodes = state
                .nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (i, n.kind))
                .collect();
            let mut edges: Vec<CanonEdge> = state
                .connections
                .iter()
                .filter_map(|c| {
                    Some(CanonEdge {
                        from: *renaming.get(c.from.as_str())?,
                        to: *renaming.get(c.to.as_str())?,
                        target_port: c.target_port,
                        amount: c.amount,
                        mode: c.mode,
                        transformation: c.transformation,
                    })
                })
                .collect();
            edges.sort_by_key(|e| (e.from, e.to, e.target_port));
            (nodes, edges)
        }

        #[derive(PartialEq)]
        struct CanonEdge {
            from: usize,
            to: usize,
            target_port: PortId,
            amount: f32,
            mode: ModulationMode,
            transformation: ModulationTransformation,
        }

        if self.nodes.len() != other.nodes.len()
            || self.connections.len() != other.connections.len()
        {
            return false;
        }
        let (nodes_a, edges_a) = canonicalize(self);
        let (nodes_b, edges_b) = canonicalize(other);
        nodes_a == nodes_b && edges_a == edges_b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> EngineState {
        EngineState {
            version: EngineState::CURRENT_VERSION,
            sample_rate: 44100.0,
            voice_count: 4,
            nodes: vec![
                NodeDef {
                    id: "analog_oscillator_0".into(),
                    kind: NodeKind::AnalogOscillator,
                    name: None,
                },
                NodeDef {
                    id: "mixer_1".into(),
                    kind: NodeKind::Mixer,
                    name: Some("out".into()),
                },
            ],
            connections: vec![ConnectionDef {
                from: "analog_oscillator_0".into(),
                to: "mixer_1".into(),
                target_port: PortId::AudioInput0,
                amount: 1.0,
                mode: ModulationMode::Additive,
                transformation: ModulationTransformation::None,
            }],
        }
    }

    #[test]
    fn test_json_round_trip() {
        let state = sample_state();
        let json = state.to_json().unwrap();
        let back = EngineState::from_json(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_structural_equality_ignores_ids() {
        let a = sample_state();
        let mut b = sample_state();
        b.nodes[0].id = "osc_renamed".into();
        b.connections[0].from = "osc_renamed".into();
        assert!(a.structurally_equal(&b));
    }

    #[test]
    fn test_structural_inequality_on_changed_amount() {
        let a = sample_state();
        let mut b = sample_state();
        b.connections[0].amount = 0.5;
        assert!(!a.structurally_equal(&b));
    }

    #[test]
    fn test_structural_inequality_on_missing_node() {
        let a = sample_state();
        let mut b = sample_state();
        b.nodes.pop();
        b.connections.clear();
        assert!(!a.structurally_equal(&b));
    }

    #[test]
    fn test_json_is_stable_for_enums() {
        let state = sample_state();
        let json = state.to_json().unwrap();
        assert!(json.contains("\"AnalogOscillator\""));
        assert!(json.contains("\"AudioInput0\""));
        assert!(json.contains("\"Additive\""));
    }
}
