//! Voice Graph
//!
//! One voice's worth of patched nodes: storage, connections, a
//! feedback-aware topological order, per-port scratch buffers and the
//! block evaluation loop.
//!
//! Connections into delay-capable ports (oscillator feedback, delay and
//! reverb audio inputs) are excluded from the ordering constraints; their
//! consumers read whatever the producer wrote last block, which realizes
//! the one-block-delay contract for feedback loops. Any cycle that cannot
//! be broken this way is rejected when the connection is added.

use crate::block::{BufferPool, MAX_BLOCK_SIZE};
use crate::modulation::accumulate_one;
use crate::node::{AudioNode, InputBuffers, OutputBuffers, ProcessContext};
use crate::port::{ModulationMode, ModulationTransformation, PortId, PortRole};
use slotmap::SlotMap;
use std::collections::HashMap;

/// Key addressing a node within one voice. Replicated voices are built by
/// identical insertion sequences, so a key is valid in every voice of the
/// pool.
pub type NodeKey = slotmap::DefaultKey;

/// A directed edge from one node's output port to another node's input
/// port. Two connections are the same edge iff (from, to, to_port) match;
/// amount, mode and transformation are mutable attributes of the edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Connection {
    pub from: NodeKey,
    pub from_port: PortId,
    pub to: NodeKey,
    pub to_port: PortId,
    pub amount: f32,
    pub mode: ModulationMode,
    pub transformation: ModulationTransformation,
}

/// A host macro routed into a destination port, per voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacroRoute {
    pub macro_index: usize,
    pub target: NodeKey,
    pub port: PortId,
    pub amount: f32,
    pub mode: ModulationMode,
    pub transformation: ModulationTransformation,
}

/// Failures raised by graph topology operations.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    UnknownNode,
    /// The named port is not an output of the source / input of the
    /// destination, or their roles are incompatible.
    PortTypeMismatch {
        from_port: PortId,
        to_port: PortId,
    },
    /// The edge would close a cycle that no delay-capable port breaks.
    CycleWithoutFeedback,
}

impl core::fmt::Display for GraphError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            GraphError::UnknownNode => write!(f, "unknown node"),
            GraphError::PortTypeMismatch { from_port, to_port } => {
                write!(f, "port mismatch: {:?} -> {:?}", from_port, to_port)
            }
            GraphError::CycleWithoutFeedback => {
                write!(f, "connection would create a cycle with no feedback-capable edge")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Per-block control inputs for one voice.
#[derive(Debug, Clone, Copy)]
pub struct BlockInputs<'a> {
    /// Gate stream; a single element is broadcast across the block
    pub gate: &'a [f32],
    pub frequency: &'a [f32],
    pub velocity: &'a [f32],
    /// Per-sample macro streams; empty slices are treated as zero
    pub macros: [&'a [f32]; 4],
}

/// Cached per-connection info used in the hot loop: the source's buffer
/// index instead of its key and port.
#[derive(Debug, Clone, Copy)]
struct ResolvedInput {
    port: PortId,
    source_buffer: usize,
    amount: f32,
    mode: ModulationMode,
    transformation: ModulationTransformation,
}

pub struct VoiceGraph {
    nodes: SlotMap<NodeKey, Box<dyn AudioNode>>,
    insertion_order: Vec<NodeKey>,
    connections: Vec<Connection>,
    macro_routes: Vec<MacroRoute>,
    terminal: Option<NodeKey>,
    sample_rate: f32,

    processing_order: Vec<NodeKey>,
    input_pool: BufferPool,
    output_pool: BufferPool,
    input_index: HashMap<(NodeKey, PortId), usize>,
    output_index: HashMap<(NodeKey, PortId), usize>,
    resolved_inputs: HashMap<NodeKey, Vec<ResolvedInput>>,
    layout_dirty: bool,

    add_scratch: Vec<f32>,
    mult_scratch: Vec<f32>,
}

impl VoiceGraph {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            nodes: SlotMap::new(),
            insertion_order: Vec::new(),
            connections: Vec::new(),
            macro_routes: Vec::new(),
            terminal: None,
            sample_rate,
            processing_order: Vec::new(),
            input_pool: BufferPool::new(MAX_BLOCK_SIZE, 32),
            output_pool: BufferPool::new(MAX_BLOCK_SIZE, 32),
            input_index: HashMap::new(),
            output_index: HashMap::new(),
            resolved_inputs: HashMap::new(),
            layout_dirty: true,
            add_scratch: vec![0.0; MAX_BLOCK_SIZE],
            mult_scratch: vec![1.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn macro_routes(&self) -> &[MacroRoute] {
        &self.macro_routes
    }

    pub fn terminal(&self) -> Option<NodeKey> {
        self.terminal
    }

    /// Node keys in creation order; identical across replicated voices.
    pub fn keys(&self) -> &[NodeKey] {
        &self.insertion_order
    }

    pub fn node(&self, key: NodeKey) -> Option<&dyn AudioNode> {
        self.nodes.get(key).map(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, key: NodeKey) -> Option<&mut Box<dyn AudioNode>> {
        self.nodes.get_mut(key)
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn add_node(&mut self, node: Box<dyn AudioNode>) -> NodeKey {
        let key = self.nodes.insert(node);
        self.insertion_order.push(key);
        self.layout_dirty = true;
        key
    }

    /// Remove a node and every connection or macro route touching it.
    pub fn remove_node(&mut self, key: NodeKey) -> Result<(), GraphError> {
        if self.nodes.remove(key).is_none() {
            return Err(GraphError::UnknownNode);
        }
        self.insertion_order.retain(|&k| k != key);
        self.connections
            .retain(|c| c.from != key && c.to != key);
        self.macro_routes.retain(|r| r.target != key);
        if self.terminal == Some(key) {
            self.terminal = None;
        }
        self.layout_dirty = true;
        Ok(())
    }

    /// The last mixer (or otherwise designated node) whose stereo output
    /// is the voice's result.
    pub fn set_terminal(&mut self, key: NodeKey) -> Result<(), GraphError> {
        if !self.nodes.contains_key(key) {
            return Err(GraphError::UnknownNode);
        }
        self.terminal = Some(key);
        self.layout_dirty = true;
        Ok(())
    }

    /// Add an edge, or update the matching edge's attributes in place.
    pub fn connect(&mut self, connection: Connection) -> Result<(), GraphError> {
        let from_node = self
            .nodes
            .get(connection.from)
            .ok_or(GraphError::UnknownNode)?;
        let to_node = self
            .nodes
            .get(connection.to)
            .ok_or(GraphError::UnknownNode)?;

        let mismatch = GraphError::PortTypeMismatch {
            from_port: connection.from_port,
            to_port: connection.to_port,
        };
        if !from_node.port_spec().has_output(connection.from_port) {
            return Err(mismatch);
        }
        if !to_node.port_spec().has_input(connection.to_port) {
            return Err(mismatch);
        }
        // Global inputs are seeded by the voice manager, never patched
        if connection.to_port.is_global_input() {
            return Err(mismatch);
        }
        if !PortRole::accepts(connection.to_port.role(), connection.from_port.role()) {
            return Err(mismatch);
        }

        if self.would_cycle(&connection) {
            return Err(GraphError::CycleWithoutFeedback);
        }

        // Same edge: update attributes instead of duplicating
        if let Some(existing) = self.connections.iter_mut().find(|c| {
            c.from == connection.from && c.to == connection.to && c.to_port == connection.to_port
        }) {
            *existing = connection;
        } else {
            self.connections.push(connection);
        }
        self.layout_dirty = true;
        Ok(())
    }

    /// Remove the exact edge. Idempotent.
    pub fn remove_connection(
        &mut self,
        from: NodeKey,
        from_port: PortId,
        to: NodeKey,
        to_port: PortId,
    ) {
        let before = self.connections.len();
        self.connections.retain(|c| {
            !(c.from == from && c.from_port == from_port && c.to == to && c.to_port == to_port)
        });
        if self.connections.len() != before {
            self.layout_dirty = true;
        }
    }

    /// Remove every edge from `from` into `to`'s `to_port`, regardless of
    /// source port. Idempotent.
    pub fn remove_matching(&mut self, from: NodeKey, to: NodeKey, to_port: PortId) {
        let before = self.connections.len();
        self.connections
            .retain(|c| !(c.from == from && c.to == to && c.to_port == to_port));
        if self.connections.len() != before {
            self.layout_dirty = true;
        }
    }

    pub fn add_macro_route(&mut self, route: MacroRoute) -> Result<(), GraphError> {
        let target = self.nodes.get(route.target).ok_or(GraphError::UnknownNode)?;
        if !target.port_spec().has_input(route.port) || route.port.is_global_input() {
            return Err(GraphError::PortTypeMismatch {
                from_port: route.port,
                to_port: route.port,
            });
        }
        // Same (macro, target, port) route is replaced, not duplicated
        if let Some(existing) = self.macro_routes.iter_mut().find(|r| {
            r.macro_index == route.macro_index && r.target == route.target && r.port == route.port
        }) {
            *existing = route;
        } else {
            self.macro_routes.push(route);
        }
        Ok(())
    }

    /// Whether `candidate` would close a cycle through ordering-relevant
    /// edges. Edges into delay-capable ports never constrain ordering.
    fn would_cycle(&self, candidate: &Connection) -> bool {
        if self.is_delay_edge(candidate) {
            return false;
        }
        // DFS from the destination through ordering edges; reaching the
        // source again means the new edge closes a cycle.
        let mut stack = vec![candidate.to];
        let mut visited: Vec<NodeKey> = Vec::new();
        while let Some(key) = stack.pop() {
            if key == candidate.from {
                return true;
            }
            if visited.contains(&key) {
                continue;
            }
            visited.push(key);
            for c in &self.connections {
                if c.from == key && !self.is_delay_edge(c) {
                    stack.push(c.to);
                }
            }
        }
        false
    }

    fn is_delay_edge(&self, connection: &Connection) -> bool {
        self.nodes
            .get(connection.to)
            .map(|node| {
                node.node_kind()
                    .delay_capable_inputs()
                    .contains(&connection.to_port)
            })
            .unwrap_or(false)
    }

    /// Rebuild the processing order and the per-port buffer layout.
    /// Runs between blocks only.
    fn rebuild_layout(&mut self) {
        // Kahn's algorithm over ordering-relevant edges
        let mut in_degree: HashMap<NodeKey, usize> =
            self.insertion_order.iter().map(|&k| (k, 0)).collect();
        let mut successors: HashMap<NodeKey, Vec<NodeKey>> = HashMap::new();

        let ordering_edges: Vec<(NodeKey, NodeKey)> = self
            .connections
            .iter()
            .filter(|c| !self.is_delay_edge(c))
            .map(|c| (c.from, c.to))
            .collect();
        for &(from, to) in &ordering_edges {
            *in_degree.entry(to).or_insert(0) += 1;
            successors.entry(from).or_default().push(to);
        }

        // Seed the queue in insertion order so replicas agree exactly
        let mut queue: Vec<NodeKey> = self
            .insertion_order
            .iter()
            .copied()
            .filter(|k| in_degree.get(k).copied().unwrap_or(0) == 0)
            .collect();

        self.processing_order.clear();
        let mut head = 0;
        while head < queue.len() {
            let key = queue[head];
            head += 1;
            self.processing_order.push(key);
            if let Some(next) = successors.get(&key) {
                for &succ in next {
                    let deg = in_degree.get_mut(&succ).expect("tracked node");
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(succ);
                    }
                }
            }
        }
        debug_assert_eq!(
            self.processing_order.len(),
            self.nodes.len(),
            "cycle slipped past connection-time validation"
        );

        // Allocate one buffer per declared port, in declaration order:
        // the block loop relies on each node's run being contiguous.
        self.input_pool.reset();
        self.output_pool.reset();
        self.input_index.clear();
        self.output_index.clear();
        for &key in &self.insertion_order {
            let spec = self.nodes[key].port_spec();
            for &port in spec.inputs {
                let idx = self.input_pool.acquire();
                self.input_index.insert((key, port), idx);
            }
            for &port in spec.outputs {
                let idx = self.output_pool.acquire();
                self.output_index.insert((key, port), idx);
            }
        }

        // Resolve connections to buffer indices
        self.resolved_inputs.clear();
        for c in &self.connections {
            if let Some(&source_buffer) = self.output_index.get(&(c.from, c.from_port)) {
                self.resolved_inputs
                    .entry(c.to)
                    .or_default()
                    .push(ResolvedInput {
                        port: c.to_port,
                        source_buffer,
                        amount: c.amount,
                        mode: c.mode,
                        transformation: c.transformation,
                    });
            }
        }

        self.layout_dirty = false;
    }

    /// Commit staged node parameters. Between blocks only.
    pub fn commit_params(&mut self) {
        for (_, node) in self.nodes.iter_mut() {
            node.commit_params();
        }
    }

    /// Evaluate one block. Control inputs arrive via `inputs`; the
    /// terminal node's stereo output is readable afterwards through
    /// [`VoiceGraph::terminal_output`].
    pub fn process_block(&mut self, n: usize, inputs: &BlockInputs, ctx: &ProcessContext) {
        debug_assert!(n >= 1 && n <= MAX_BLOCK_SIZE);
        if self.layout_dirty {
            self.rebuild_layout();
        }

        for order_idx in 0..self.processing_order.len() {
            let key = self.processing_order[order_idx];

            // Inactive nodes publish silence and are otherwise skipped
            if !self.nodes[key].is_active() {
                let spec = self.nodes[key].port_spec();
                for &port in spec.outputs {
                    if let Some(&idx) = self.output_index.get(&(key, port)) {
                        self.output_pool.clear(idx);
                    }
                }
                continue;
            }

            self.prepare_inputs(key, n, inputs, ctx);

            // Assemble the port maps and run the node. A node's buffers
            // were acquired consecutively in declaration order, so each
            // side is one contiguous pool region split on the stack; no
            // allocation happens on the audio path.
            let spec = self.nodes[key].port_spec();
            let blen = self.input_pool.buffer_len();

            let mut input_map = InputBuffers::new();
            if let Some(&first_port) = spec.inputs.first() {
                let first = self.input_index[&(key, first_port)];
                let region = self.input_pool.buffers(first, spec.inputs.len());
                for (offset, (chunk, &port)) in
                    region.chunks(blen).zip(spec.inputs.iter()).enumerate()
                {
                    debug_assert_eq!(self.input_index[&(key, port)], first + offset);
                    input_map.insert(port, &chunk[..n]);
                }
            }

            let mut output_map = OutputBuffers::new();
            if let Some(&first_port) = spec.outputs.first() {
                let first = self.output_index[&(key, first_port)];
                let region = self.output_pool.buffers_mut(first, spec.outputs.len());
                for (offset, (chunk, &port)) in
                    region.chunks_mut(blen).zip(spec.outputs.iter()).enumerate()
                {
                    debug_assert_eq!(self.output_index[&(key, port)], first + offset);
                    output_map.insert(port, &mut chunk[..n]);
                }
            }

            self.nodes[key].process_block(n, &input_map, &mut output_map, ctx);
        }
    }

    /// Fill every input-port buffer for `key`: global seeds, connection
    /// accumulation against the node-declared base, and macro routes.
    fn prepare_inputs(&mut self, key: NodeKey, n: usize, inputs: &BlockInputs, ctx: &ProcessContext) {
        let spec = self.nodes[key].port_spec();

        for &port in spec.inputs {
            let idx = self.input_index[&(key, port)];

            // Global ports mirror the host-provided streams directly
            if port.is_global_input() {
                let src = match port {
                    PortId::GlobalGate => inputs.gate,
                    PortId::GlobalFrequency => inputs.frequency,
                    _ => inputs.velocity,
                };
                self.input_pool.copy_in(idx, src);
                continue;
            }

            let has_connection = self
                .resolved_inputs
                .get(&key)
                .map(|list| list.iter().any(|r| r.port == port))
                .unwrap_or(false);
            let has_macro = self
                .macro_routes
                .iter()
                .any(|r| r.target == key && r.port == port);

            let default = self.nodes[key].input_default(port, ctx);
            if !has_connection && !has_macro {
                self.input_pool.fill(idx, default);
                continue;
            }

            // Connected frequency and gate ports are defined by their
            // connections alone; everything else modulates around the
            // declared base.
            let absolute_role = matches!(port.role(), PortRole::Frequency | PortRole::Gate);
            let base = if absolute_role && has_connection {
                0.0
            } else {
                default
            };

            self.add_scratch[..n].fill(0.0);
            self.mult_scratch[..n].fill(1.0);
            if let Some(list) = self.resolved_inputs.get(&key) {
                for r in list.iter().filter(|r| r.port == port) {
                    accumulate_one(
                        n,
                        self.output_pool.buffer(r.source_buffer),
                        r.amount,
                        r.mode,
                        r.transformation,
                        &mut self.add_scratch,
                        &mut self.mult_scratch,
                    );
                }
            }
            for r in self
                .macro_routes
                .iter()
                .filter(|r| r.target == key && r.port == port)
            {
                let buf = inputs.macros[r.macro_index.min(3)];
                if !buf.is_empty() {
                    accumulate_one(
                        n,
                        buf,
                        r.amount,
                        r.mode,
                        r.transformation,
                        &mut self.add_scratch,
                        &mut self.mult_scratch,
                    );
                }
            }

            let target = self.input_pool.buffer_mut(idx);
            for i in 0..n {
                target[i] = (base + self.add_scratch[i]) * self.mult_scratch[i];
            }
        }
    }

    /// Read the terminal node's output for `port` after a block.
    /// A mono terminal mirrors its single output on both channels.
    pub fn terminal_output(&self, port: PortId) -> Option<&[f32]> {
        let terminal = self.terminal?;
        if let Some(&idx) = self.output_index.get(&(terminal, port)) {
            return Some(self.output_pool.buffer(idx));
        }
        // Mono fallback for the right channel
        if port == PortId::AudioOutput1 {
            if let Some(&idx) = self.output_index.get(&(terminal, PortId::AudioOutput0)) {
                return Some(self.output_pool.buffer(idx));
            }
        }
        None
    }

    /// Zero all DSP state and scratch. The graph shape is untouched.
    pub fn reset(&mut self) {
        for (_, node) in self.nodes.iter_mut() {
            node.reset();
        }
        self.input_pool.clear_all();
        self.output_pool.clear_all();
    }
}

impl std::fmt::Debug for VoiceGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceGraph")
            .field("nodes", &self.nodes.len())
            .field("connections", &self.connections.len())
            .field("terminal", &self.terminal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{InputBuffers, NodeKind, OutputBuffers, PortSpec};
    use crate::port::{ModulationMode, ModulationTransformation};
    use std::any::Any;

    // Minimal nodes for exercising the graph machinery without real DSP.

    struct Constant {
        value: f32,
    }

    static CONST_OUTPUTS: [PortId; 1] = [PortId::AudioOutput0];

    impl AudioNode for Constant {
        fn port_spec(&self) -> PortSpec {
            PortSpec {
                inputs: &[],
                outputs: &CONST_OUTPUTS,
            }
        }
        fn node_kind(&self) -> NodeKind {
            NodeKind::Noise
        }
        fn process_block(
            &mut self,
            n: usize,
            _inputs: &InputBuffers,
            outputs: &mut OutputBuffers,
            _ctx: &ProcessContext,
        ) {
            if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
                out[..n].fill(self.value);
            }
        }
        fn reset(&mut self) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Passthrough {
        active: bool,
    }

    static PASS_INPUTS: [PortId; 2] = [PortId::AudioInput0, PortId::GainMod];
    static PASS_OUTPUTS: [PortId; 1] = [PortId::AudioOutput0];

    impl AudioNode for Passthrough {
        fn port_spec(&self) -> PortSpec {
            PortSpec {
                inputs: &PASS_INPUTS,
                outputs: &PASS_OUTPUTS,
            }
        }
        fn node_kind(&self) -> NodeKind {
            NodeKind::Mixer
        }
        fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
            match port {
                PortId::GainMod => 1.0,
                _ => crate::node::default_for_port(port, ctx),
            }
        }
        fn is_active(&self) -> bool {
            self.active
        }
        fn process_block(
            &mut self,
            n: usize,
            inputs: &InputBuffers,
            outputs: &mut OutputBuffers,
            _ctx: &ProcessContext,
        ) {
            let input = inputs[&PortId::AudioInput0];
            let gain = inputs[&PortId::GainMod];
            if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
                for i in 0..n {
                    out[i] = input[i] * gain[i];
                }
            }
        }
        fn reset(&mut self) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Consumes its own input with one block of delay, like a delay line.
    struct FeedbackSink;

    static SINK_INPUTS: [PortId; 2] = [PortId::AudioInput0, PortId::AudioInput1];

    impl AudioNode for FeedbackSink {
        fn port_spec(&self) -> PortSpec {
            PortSpec {
                inputs: &SINK_INPUTS,
                outputs: &CONST_OUTPUTS,
            }
        }
        fn node_kind(&self) -> NodeKind {
            NodeKind::Delay
        }
        fn process_block(
            &mut self,
            n: usize,
            inputs: &InputBuffers,
            outputs: &mut OutputBuffers,
            _ctx: &ProcessContext,
        ) {
            let input = inputs[&PortId::AudioInput0];
            if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
                for i in 0..n {
                    out[i] = input[i] + 1.0;
                }
            }
        }
        fn reset(&mut self) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn edge(from: NodeKey, to: NodeKey, to_port: PortId, amount: f32) -> Connection {
        Connection {
            from,
            from_port: PortId::AudioOutput0,
            to,
            to_port,
            amount,
            mode: ModulationMode::Additive,
            transformation: ModulationTransformation::None,
        }
    }

    fn ctx() -> ProcessContext {
        ProcessContext::new(48000.0)
    }

    fn inputs<'a>() -> BlockInputs<'a> {
        BlockInputs {
            gate: &[1.0],
            frequency: &[440.0],
            velocity: &[1.0],
            macros: [&[], &[], &[], &[]],
        }
    }

    #[test]
    fn test_connect_and_process() {
        let mut graph = VoiceGraph::new(48000.0);
        let source = graph.add_node(Box::new(Constant { value: 0.5 }));
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(source, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph.set_terminal(sink).unwrap();

        graph.process_block(16, &inputs(), &ctx());
        let out = graph.terminal_output(PortId::AudioOutput0).unwrap();
        assert!(out[..16].iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_connection_amount_scales() {
        let mut graph = VoiceGraph::new(48000.0);
        let source = graph.add_node(Box::new(Constant { value: 1.0 }));
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(source, sink, PortId::AudioInput0, 0.25)).unwrap();
        graph.set_terminal(sink).unwrap();

        graph.process_block(8, &inputs(), &ctx());
        let out = graph.terminal_output(PortId::AudioOutput0).unwrap();
        assert!((out[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_multiple_connections_sum() {
        let mut graph = VoiceGraph::new(48000.0);
        let a = graph.add_node(Box::new(Constant { value: 0.25 }));
        let b = graph.add_node(Box::new(Constant { value: 0.5 }));
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(a, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph.connect(edge(b, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph.set_terminal(sink).unwrap();

        graph.process_block(8, &inputs(), &ctx());
        let out = graph.terminal_output(PortId::AudioOutput0).unwrap();
        assert!((out[0] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_vca_connection_multiplies_base() {
        let mut graph = VoiceGraph::new(48000.0);
        let signal = graph.add_node(Box::new(Constant { value: 1.0 }));
        let vca = graph.add_node(Box::new(Constant { value: 0.5 }));
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(signal, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph
            .connect(Connection {
                mode: ModulationMode::Vca,
                ..edge(vca, sink, PortId::GainMod, 1.0)
            })
            .unwrap();
        graph.set_terminal(sink).unwrap();

        graph.process_block(8, &inputs(), &ctx());
        let out = graph.terminal_output(PortId::AudioOutput0).unwrap();
        // Gain base 1.0 scaled by the 0.5 VCA source
        assert!((out[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_amount_contributes_nothing() {
        let mut graph = VoiceGraph::new(48000.0);
        let source = graph.add_node(Box::new(Constant { value: 1.0 }));
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(source, sink, PortId::AudioInput0, 0.0)).unwrap();
        graph.set_terminal(sink).unwrap();

        graph.process_block(8, &inputs(), &ctx());
        let out = graph.terminal_output(PortId::AudioOutput0).unwrap();
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn test_reconnect_updates_edge() {
        let mut graph = VoiceGraph::new(48000.0);
        let source = graph.add_node(Box::new(Constant { value: 1.0 }));
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(source, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph.connect(edge(source, sink, PortId::AudioInput0, 0.5)).unwrap();

        assert_eq!(graph.connections().len(), 1);
        assert_eq!(graph.connections()[0].amount, 0.5);
    }

    #[test]
    fn test_unknown_node_and_port_validation() {
        let mut graph = VoiceGraph::new(48000.0);
        let a = graph.add_node(Box::new(Constant { value: 1.0 }));
        let b = graph.add_node(Box::new(Passthrough { active: true }));

        // AudioInput0 is not an output of `a`
        let bad = Connection {
            from_port: PortId::AudioInput0,
            ..edge(a, b, PortId::AudioInput0, 1.0)
        };
        assert!(matches!(
            graph.connect(bad),
            Err(GraphError::PortTypeMismatch { .. })
        ));

        // Dangling key after removal
        graph.remove_node(a).unwrap();
        assert!(matches!(
            graph.connect(edge(a, b, PortId::AudioInput0, 1.0)),
            Err(GraphError::UnknownNode)
        ));
        assert!(matches!(graph.remove_node(a), Err(GraphError::UnknownNode)));
    }

    #[test]
    fn test_global_ports_cannot_be_patched() {
        let mut graph = VoiceGraph::new(48000.0);
        let a = graph.add_node(Box::new(Constant { value: 1.0 }));
        let sink = graph.add_node(Box::new(crate::modules::GateMixer::new()));
        assert!(matches!(
            graph.connect(edge(a, sink, PortId::GlobalGate, 1.0)),
            Err(GraphError::PortTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected_without_delay_port() {
        let mut graph = VoiceGraph::new(48000.0);
        let a = graph.add_node(Box::new(Passthrough { active: true }));
        let b = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(a, b, PortId::AudioInput0, 1.0)).unwrap();

        assert_eq!(
            graph.connect(edge(b, a, PortId::AudioInput0, 1.0)),
            Err(GraphError::CycleWithoutFeedback)
        );
        assert_eq!(graph.connections().len(), 1);
    }

    #[test]
    fn test_feedback_cycle_carries_previous_block() {
        // sink.out = sink.in + 1, patched back into itself through its
        // delay-capable input: each block increments by one.
        let mut graph = VoiceGraph::new(48000.0);
        let sink = graph.add_node(Box::new(FeedbackSink));
        graph.connect(edge(sink, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph.set_terminal(sink).unwrap();

        graph.process_block(4, &inputs(), &ctx());
        assert_eq!(graph.terminal_output(PortId::AudioOutput0).unwrap()[0], 1.0);

        graph.process_block(4, &inputs(), &ctx());
        assert_eq!(graph.terminal_output(PortId::AudioOutput0).unwrap()[0], 2.0);

        graph.process_block(4, &inputs(), &ctx());
        assert_eq!(graph.terminal_output(PortId::AudioOutput0).unwrap()[0], 3.0);
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let mut graph = VoiceGraph::new(48000.0);
        // Insert consumer before producer; the order must still run the
        // producer first.
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        let source = graph.add_node(Box::new(Constant { value: 0.25 }));
        graph.connect(edge(source, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph.set_terminal(sink).unwrap();

        graph.process_block(4, &inputs(), &ctx());
        let out = graph.terminal_output(PortId::AudioOutput0).unwrap();
        assert!((out[0] - 0.25).abs() < 1e-6, "same-block producer value");
    }

    #[test]
    fn test_inactive_node_outputs_silence() {
        let mut graph = VoiceGraph::new(48000.0);
        let source = graph.add_node(Box::new(Constant { value: 1.0 }));
        let mid = graph.add_node(Box::new(Passthrough { active: false }));
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(source, mid, PortId::AudioInput0, 1.0)).unwrap();
        graph.connect(edge(mid, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph.set_terminal(sink).unwrap();

        graph.process_block(8, &inputs(), &ctx());
        let out = graph.terminal_output(PortId::AudioOutput0).unwrap();
        assert!(out[..8].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_remove_node_prunes_edges() {
        let mut graph = VoiceGraph::new(48000.0);
        let source = graph.add_node(Box::new(Constant { value: 1.0 }));
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(source, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph.remove_node(source).unwrap();
        assert!(graph.connections().is_empty());
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_remove_connection_idempotent() {
        let mut graph = VoiceGraph::new(48000.0);
        let source = graph.add_node(Box::new(Constant { value: 1.0 }));
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(source, sink, PortId::AudioInput0, 1.0)).unwrap();

        graph.remove_connection(source, PortId::AudioOutput0, sink, PortId::AudioInput0);
        assert!(graph.connections().is_empty());
        // Second removal is a no-op
        graph.remove_connection(source, PortId::AudioOutput0, sink, PortId::AudioInput0);
        assert!(graph.connections().is_empty());
    }

    #[test]
    fn test_macro_route_feeds_port() {
        let mut graph = VoiceGraph::new(48000.0);
        let source = graph.add_node(Box::new(Constant { value: 1.0 }));
        let sink = graph.add_node(Box::new(Passthrough { active: true }));
        graph.connect(edge(source, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph
            .add_macro_route(MacroRoute {
                macro_index: 0,
                target: sink,
                port: PortId::GainMod,
                amount: 1.0,
                mode: ModulationMode::Vca,
                transformation: ModulationTransformation::None,
            })
            .unwrap();
        graph.set_terminal(sink).unwrap();

        let macro_buf = vec![0.25f32; 8];
        let block = BlockInputs {
            gate: &[1.0],
            frequency: &[440.0],
            velocity: &[1.0],
            macros: [&macro_buf, &[], &[], &[]],
        };
        graph.process_block(8, &block, &ctx());
        let out = graph.terminal_output(PortId::AudioOutput0).unwrap();
        // Base gain 1.0 through a quarter-open VCA macro
        assert!((out[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_reset_clears_buffers() {
        let mut graph = VoiceGraph::new(48000.0);
        let sink = graph.add_node(Box::new(FeedbackSink));
        graph.connect(edge(sink, sink, PortId::AudioInput0, 1.0)).unwrap();
        graph.set_terminal(sink).unwrap();

        graph.process_block(4, &inputs(), &ctx());
        graph.process_block(4, &inputs(), &ctx());
        graph.reset();

        // Feedback memory is gone; the count restarts
        graph.process_block(4, &inputs(), &ctx());
        assert_eq!(graph.terminal_output(PortId::AudioOutput0).unwrap()[0], 1.0);
    }

    #[test]
    fn test_mono_terminal_mirrors_right_channel() {
        let mut graph = VoiceGraph::new(48000.0);
        let source = graph.add_node(Box::new(Constant { value: 0.5 }));
        graph.set_terminal(source).unwrap();
        graph.process_block(4, &inputs(), &ctx());

        let left = graph.terminal_output(PortId::AudioOutput0).unwrap()[0];
        let right = graph.terminal_output(PortId::AudioOutput1).unwrap()[0];
        assert_eq!(left, right);
    }
}
