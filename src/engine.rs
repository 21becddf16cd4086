//! Engine Facade
//!
//! The [`Engine`] owns the canonical voice graph, the replicated voice
//! pool, the global effects chain and the imported audio data. It exposes
//! the control-plane operations (node creation, patching, parameter
//! updates, imports) and the per-block `process_audio` entry point the
//! host calls from its audio thread.
//!
//! Mutations validate against the canonical graph and are mirrored into
//! every replica immediately; the engine owner serializes control calls
//! with the audio callback (the worklet model), so any mutation happens
//! between blocks by construction. Staged node parameters are committed
//! at the top of the next block.

use crate::automation::{AutomationFrame, MACROS_PER_VOICE};
use crate::block::MAX_BLOCK_SIZE;
use crate::effects::{
    Bitcrusher, BitcrusherParams, Chorus, ChorusParams, Compressor, CompressorParams, Delay,
    DelayParams, EffectsChain, Limiter, LimiterParams, Reverb, ReverbParams, Saturation,
    SaturationParams,
};
use crate::graph::{Connection, GraphError, MacroRoute, NodeKey, VoiceGraph};
use crate::modulation::scrub_non_finite;
use crate::modules::{
    default_waveform_banks, AnalogOscillator, AnalogOscillatorParams, ArpeggiatorGenerator,
    ArpeggiatorParams, Envelope, EnvelopeParams, FilterCollection, FilterParams, GateMixer, Glide,
    GlideParams, GlobalFrequencyNode, GlobalVelocityNode, Lfo, LfoParams, Mixer, MixerParams,
    Noise, NoiseParams, Sampler, SamplerParams, Velocity, VelocityParams, WavetableOscillator,
    WavetableOscillatorParams,
};
use crate::node::{AudioNode, NodeKind, ProcessContext};
use crate::polyphony::{Voice, VoiceManager, MAX_VOICES};
use crate::port::{ModulationMode, ModulationTransformation, PortId};
use crate::rng::Rng;
use crate::serialize::{ConnectionDef, EngineState, NodeDef};
use crate::wav::{decode_wav_bytes, encode_wav_bytes, SampleData, Waveform, WavetableBank};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Most nodes a single voice may hold.
pub const MAX_NODES_PER_VOICE: usize = 64;

/// Typed failure of a control-plane operation. The audio path never
/// returns errors.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    UnknownNode(String),
    WrongNodeKind {
        id: String,
        expected: NodeKind,
        actual: NodeKind,
    },
    PortTypeMismatch {
        from_port: PortId,
        to_port: PortId,
    },
    CycleWithoutFeedback,
    ImportFailure(String),
    InvalidVoiceCount(usize),
    VoiceOutOfRange(usize),
    InvalidMacroIndex(usize),
    UnknownEffect(usize),
    GraphFull,
}

impl core::fmt::Display for EngineError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EngineError::UnknownNode(id) => write!(f, "unknown node: {}", id),
            EngineError::WrongNodeKind {
                id,
                expected,
                actual,
            } => write!(
                f,
                "node {} is a {:?}, operation expects {:?}",
                id, actual, expected
            ),
            EngineError::PortTypeMismatch { from_port, to_port } => {
                write!(f, "port mismatch: {:?} -> {:?}", from_port, to_port)
            }
            EngineError::CycleWithoutFeedback => {
                write!(f, "connection would create a cycle with no feedback-capable edge")
            }
            EngineError::ImportFailure(msg) => write!(f, "import failed: {}", msg),
            EngineError::InvalidVoiceCount(count) => {
                write!(f, "voice count {} exceeds the pool limit {}", count, MAX_VOICES)
            }
            EngineError::VoiceOutOfRange(index) => write!(f, "voice index {} out of range", index),
            EngineError::InvalidMacroIndex(index) => write!(f, "macro index {} out of range", index),
            EngineError::UnknownEffect(index) => write!(f, "no effect at index {}", index),
            EngineError::GraphFull => write!(f, "voice graph is full"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<GraphError> for EngineError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::UnknownNode => EngineError::UnknownNode(String::new()),
            GraphError::PortTypeMismatch { from_port, to_port } => {
                EngineError::PortTypeMismatch { from_port, to_port }
            }
            GraphError::CycleWithoutFeedback => EngineError::CycleWithoutFeedback,
        }
    }
}

/// What `import_sample` reports back about the decoded material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleInfo {
    pub frames: usize,
    pub channels: usize,
    pub sample_rate: f32,
}

struct NodeRecord {
    id: String,
    key: NodeKey,
    kind: NodeKind,
    name: Option<String>,
}

/// The polyphonic modular synthesizer engine.
pub struct Engine {
    sample_rate: f32,
    banks: Arc<HashMap<Waveform, Arc<WavetableBank>>>,

    canonical: VoiceGraph,
    voices: VoiceManager,
    effects: EffectsChain,

    records: Vec<NodeRecord>,
    next_serial: u64,
    seed: u64,

    frame: AutomationFrame,
    cpu_usage: f32,
}

impl Engine {
    /// Create an engine with an empty canonical graph and no voices.
    /// Call [`Engine::init`] to commit the pool size.
    pub fn new(sample_rate: f32) -> Self {
        let sample_rate = sample_rate.clamp(8_000.0, 192_000.0);
        Self {
            sample_rate,
            banks: default_waveform_banks(sample_rate),
            canonical: VoiceGraph::new(sample_rate),
            voices: VoiceManager::new(sample_rate),
            effects: EffectsChain::new(),
            records: Vec::new(),
            next_serial: 0,
            seed: 0x766f7867726170,
            frame: AutomationFrame::with_dimensions(0, MACROS_PER_VOICE, MAX_BLOCK_SIZE),
            cpu_usage: 0.0,
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn voice_count(&self) -> usize {
        self.voices.voice_count()
    }

    /// Read-only view of the voice pool.
    pub fn voice_manager(&self) -> &VoiceManager {
        &self.voices
    }

    /// Smoothed ratio of block processing time to the realtime deadline.
    pub fn get_cpu_usage(&self) -> f32 {
        self.cpu_usage
    }

    /// Commit the graph shape: rebuild the canonical graph and clone the
    /// voice pool from it. Existing nodes, connections and parameters
    /// survive; DSP state does not.
    pub fn init(&mut self, sample_rate: f32, voice_count: usize) -> Result<(), EngineError> {
        if voice_count > MAX_VOICES {
            return Err(EngineError::InvalidVoiceCount(voice_count));
        }
        let sample_rate = sample_rate.clamp(8_000.0, 192_000.0);
        if (sample_rate - self.sample_rate).abs() > f32::EPSILON {
            self.sample_rate = sample_rate;
            self.banks = default_waveform_banks(sample_rate);
        }

        // Rebuild every graph from empty with the same insertion sequence
        // so node keys stay interchangeable across the whole pool.
        let fresh_canonical = self.replicate_graph();
        let old = std::mem::replace(&mut self.canonical, fresh_canonical);

        let mut seeder = Rng::from_seed(self.seed);
        let mut pool = Vec::with_capacity(voice_count);
        for index in 0..voice_count {
            let graph = self.replicate_from(&old);
            pool.push(Voice::new(index, seeder.next_u64(), graph));
        }
        // Canonical was rebuilt from `old` too; refresh the key map once.
        self.refresh_record_keys();

        self.voices = VoiceManager::new(self.sample_rate);
        self.voices.install_voices(pool);
        self.frame =
            AutomationFrame::with_dimensions(voice_count, MACROS_PER_VOICE, MAX_BLOCK_SIZE);

        log::debug!(
            "engine initialized: {} Hz, {} voices, {} nodes",
            self.sample_rate,
            voice_count,
            self.records.len()
        );
        Ok(())
    }

    // =================================================================
    // Node construction
    // =================================================================

    fn build_node(&self, kind: NodeKind) -> Box<dyn AudioNode> {
        match kind {
            NodeKind::AnalogOscillator => {
                Box::new(AnalogOscillator::new(self.sample_rate, self.banks.clone()))
            }
            NodeKind::WavetableOscillator => Box::new(WavetableOscillator::new(self.sample_rate)),
            NodeKind::Sampler => Box::new(Sampler::new(self.sample_rate)),
            NodeKind::Noise => Box::new(Noise::new()),
            NodeKind::Filter => Box::new(FilterCollection::new(self.sample_rate)),
            NodeKind::Mixer => Box::new(Mixer::new()),
            NodeKind::GateMixer => Box::new(GateMixer::new()),
            NodeKind::Envelope => Box::new(Envelope::new(self.sample_rate)),
            NodeKind::Lfo => Box::new(Lfo::new(self.sample_rate)),
            NodeKind::Glide => Box::new(Glide::new(self.sample_rate)),
            NodeKind::Velocity => Box::new(Velocity::new()),
            NodeKind::GlobalFrequency => Box::new(GlobalFrequencyNode::new()),
            NodeKind::GlobalVelocity => Box::new(GlobalVelocityNode::new()),
            NodeKind::Arpeggiator => Box::new(ArpeggiatorGenerator::new(self.sample_rate)),
            NodeKind::Delay => Box::new(Delay::new(self.sample_rate)),
            NodeKind::Chorus => Box::new(Chorus::new(self.sample_rate)),
            NodeKind::Reverb => Box::new(Reverb::new(self.sample_rate)),
            NodeKind::Compressor => Box::new(Compressor::new(self.sample_rate)),
            NodeKind::Saturation => Box::new(Saturation::new()),
            NodeKind::Bitcrusher => Box::new(Bitcrusher::new()),
            NodeKind::Limiter => Box::new(Limiter::new(self.sample_rate)),
        }
    }

    /// Clone a node for voice replication: same kind, same parameters,
    /// shared imported data, fresh DSP state.
    fn clone_node(&self, node: &dyn AudioNode) -> Box<dyn AudioNode> {
        let kind = node.node_kind();
        let mut fresh = self.build_node(kind);

        // Copy the parameter struct between same-kind concrete types.
        macro_rules! copy_params {
            ($node_ty:ty) => {{
                let src = node
                    .as_any()
                    .downcast_ref::<$node_ty>()
                    .expect("kind tag matches concrete type");
                fresh
                    .as_any_mut()
                    .downcast_mut::<$node_ty>()
                    .expect("fresh node kind")
                    .set_params(*src.params());
            }};
        }

        match kind {
            NodeKind::AnalogOscillator => copy_params!(AnalogOscillator),
            NodeKind::WavetableOscillator => {
                copy_params!(WavetableOscillator);
                let src = node
                    .as_any()
                    .downcast_ref::<WavetableOscillator>()
                    .expect("kind tag matches concrete type");
                fresh
                    .as_any_mut()
                    .downcast_mut::<WavetableOscillator>()
                    .expect("fresh node kind")
                    .set_bank(src.bank().clone());
            }
            NodeKind::Sampler => {
                copy_params!(Sampler);
                let src = node
                    .as_any()
                    .downcast_ref::<Sampler>()
                    .expect("kind tag matches concrete type");
                fresh
                    .as_any_mut()
                    .downcast_mut::<Sampler>()
                    .expect("fresh node kind")
                    .set_sample(src.sample().clone());
            }
            NodeKind::Noise => copy_params!(Noise),
            NodeKind::Filter => copy_params!(FilterCollection),
            NodeKind::Mixer => copy_params!(Mixer),
            NodeKind::GateMixer | NodeKind::GlobalFrequency | NodeKind::GlobalVelocity => {}
            NodeKind::Envelope => copy_params!(Envelope),
            NodeKind::Lfo => copy_params!(Lfo),
            NodeKind::Glide => copy_params!(Glide),
            NodeKind::Velocity => copy_params!(Velocity),
            NodeKind::Arpeggiator => copy_params!(ArpeggiatorGenerator),
            NodeKind::Delay => copy_params!(Delay),
            NodeKind::Chorus => copy_params!(Chorus),
            NodeKind::Reverb => copy_params!(Reverb),
            NodeKind::Compressor => copy_params!(Compressor),
            NodeKind::Saturation => copy_params!(Saturation),
            NodeKind::Bitcrusher => copy_params!(Bitcrusher),
            NodeKind::Limiter => copy_params!(Limiter),
        }

        fresh.commit_params();
        fresh
    }

    /// Build a fresh graph with the canonical graph's structure.
    fn replicate_graph(&self) -> VoiceGraph {
        self.replicate_from(&self.canonical)
    }

    fn replicate_from(&self, template: &VoiceGraph) -> VoiceGraph {
        let mut graph = VoiceGraph::new(self.sample_rate);
        let mut key_map: HashMap<NodeKey, NodeKey> = HashMap::new();

        for &key in template.keys() {
            let node = template.node(key).expect("listed key exists");
            let new_key = graph.add_node(self.clone_node(node));
            key_map.insert(key, new_key);
        }
        for c in template.connections() {
            let mapped = Connection {
                from: key_map[&c.from],
                to: key_map[&c.to],
                ..*c
            };
            graph
                .connect(mapped)
                .expect("replicated edge was valid in the template");
        }
        for r in template.macro_routes() {
            let mapped = MacroRoute {
                target: key_map[&r.target],
                ..*r
            };
            graph
                .add_macro_route(mapped)
                .expect("replicated route was valid in the template");
        }
        if let Some(terminal) = template.terminal() {
            graph
                .set_terminal(key_map[&terminal])
                .expect("terminal exists in replica");
        }
        graph
    }

    /// After a canonical rebuild, records map to the fresh keys, which
    /// follow the insertion order.
    fn refresh_record_keys(&mut self) {
        let keys = self.canonical.keys().to_vec();
        debug_assert_eq!(keys.len(), self.records.len());
        for (record, key) in self.records.iter_mut().zip(keys) {
            record.key = key;
        }
    }

    fn kind_slug(kind: NodeKind) -> &'static str {
        match kind {
            NodeKind::AnalogOscillator => "analog_oscillator",
            NodeKind::WavetableOscillator => "wavetable_oscillator",
            NodeKind::Sampler => "sampler",
            NodeKind::Noise => "noise",
            NodeKind::Filter => "filter",
            NodeKind::Mixer => "mixer",
            NodeKind::GateMixer => "gate_mixer",
            NodeKind::Envelope => "envelope",
            NodeKind::Lfo => "lfo",
            NodeKind::Glide => "glide",
            NodeKind::Velocity => "velocity",
            NodeKind::GlobalFrequency => "global_frequency",
            NodeKind::GlobalVelocity => "global_velocity",
            NodeKind::Arpeggiator => "arpeggiator",
            NodeKind::Delay => "delay",
            NodeKind::Chorus => "chorus",
            NodeKind::Reverb => "reverb",
            NodeKind::Compressor => "compressor",
            NodeKind::Saturation => "saturation",
            NodeKind::Bitcrusher => "bitcrusher",
            NodeKind::Limiter => "limiter",
        }
    }

    /// Create a node of `kind` in the canonical voice and every replica,
    /// returning its stable string ID.
    pub fn create_node(&mut self, kind: NodeKind) -> Result<String, EngineError> {
        if self.records.len() >= MAX_NODES_PER_VOICE {
            return Err(EngineError::GraphFull);
        }

        let id = format!("{}_{}", Self::kind_slug(kind), self.next_serial);
        self.next_serial += 1;

        let node = self.build_node(kind);
        let key = self.canonical.add_node(node);
        for index in 0..self.voices.voice_count() {
            let node = self.build_node(kind);
            let voice = self.voices.voice_mut(index).expect("pool index");
            let replica_key = voice.graph_mut().add_node(node);
            debug_assert_eq!(key, replica_key, "replicas evolve in lockstep");
        }

        // A mixer becomes the terminal when none is set yet, or when it is
        // the most recently added mixer.
        if kind == NodeKind::Mixer {
            self.canonical.set_terminal(key).expect("node just added");
            for index in 0..self.voices.voice_count() {
                let voice = self.voices.voice_mut(index).expect("pool index");
                voice.graph_mut().set_terminal(key).expect("node just added");
            }
        }

        log::debug!("created node {}", id);
        self.records.push(NodeRecord {
            id: id.clone(),
            key,
            kind,
            name: None,
        });
        Ok(id)
    }

    pub fn create_analog_oscillator(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::AnalogOscillator)
    }

    pub fn create_wavetable_oscillator(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::WavetableOscillator)
    }

    pub fn create_sampler(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::Sampler)
    }

    pub fn create_noise(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::Noise)
    }

    pub fn create_filter(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::Filter)
    }

    pub fn create_mixer(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::Mixer)
    }

    pub fn create_gate_mixer(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::GateMixer)
    }

    pub fn create_envelope(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::Envelope)
    }

    pub fn create_lfo(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::Lfo)
    }

    pub fn create_glide(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::Glide)
    }

    pub fn create_velocity(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::Velocity)
    }

    pub fn create_global_frequency(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::GlobalFrequency)
    }

    pub fn create_global_velocity(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::GlobalVelocity)
    }

    pub fn create_arpeggiator(&mut self) -> Result<String, EngineError> {
        self.create_node(NodeKind::Arpeggiator)
    }

    /// Delete a node; all connections and macro routes touching it are
    /// pruned in every voice.
    pub fn delete_node(&mut self, id: &str) -> Result<(), EngineError> {
        let key = self.lookup(id)?;
        self.canonical
            .remove_node(key)
            .map_err(|_| EngineError::UnknownNode(id.to_string()))?;
        for index in 0..self.voices.voice_count() {
            let voice = self.voices.voice_mut(index).expect("pool index");
            let _ = voice.graph_mut().remove_node(key);
        }
        self.records.retain(|r| r.id != id);
        log::debug!("deleted node {}", id);
        Ok(())
    }

    /// Attach a user-facing label carried in snapshots.
    pub fn set_node_name(&mut self, id: &str, name: Option<String>) -> Result<(), EngineError> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::UnknownNode(id.to_string()))?;
        record.name = name;
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<NodeKey, EngineError> {
        self.records
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.key)
            .ok_or_else(|| EngineError::UnknownNode(id.to_string()))
    }

    fn lookup_kind(&self, id: &str) -> Result<(NodeKey, NodeKind), EngineError> {
        self.records
            .iter()
            .find(|r| r.id == id)
            .map(|r| (r.key, r.kind))
            .ok_or_else(|| EngineError::UnknownNode(id.to_string()))
    }

    fn id_for_key(&self, key: NodeKey) -> Option<&str> {
        self.records
            .iter()
            .find(|r| r.key == key)
            .map(|r| r.id.as_str())
    }

    // =================================================================
    // Topology
    // =================================================================

    /// Add or update a connection. Reconnecting an existing
    /// (from, to, target-port) edge updates its attributes in place.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &mut self,
        from: &str,
        from_port: PortId,
        to: &str,
        to_port: PortId,
        amount: f32,
        mode: ModulationMode,
        transformation: ModulationTransformation,
    ) -> Result<(), EngineError> {
        let from_key = self.lookup(from)?;
        let to_key = self.lookup(to)?;
        let connection = Connection {
            from: from_key,
            from_port,
            to: to_key,
            to_port,
            amount,
            mode,
            transformation,
        };

        self.canonical.connect(connection)?;
        for index in 0..self.voices.voice_count() {
            let voice = self.voices.voice_mut(index).expect("pool index");
            voice
                .graph_mut()
                .connect(connection)
                .expect("edge was valid in the canonical graph");
        }
        log::debug!(
            "connected {}:{:?} -> {}:{:?} ({:?}, amount {})",
            from,
            from_port,
            to,
            to_port,
            mode,
            amount
        );
        Ok(())
    }

    /// Remove one exact edge. Idempotent.
    pub fn remove_connection(
        &mut self,
        from: &str,
        from_port: PortId,
        to: &str,
        to_port: PortId,
    ) -> Result<(), EngineError> {
        let from_key = self.lookup(from)?;
        let to_key = self.lookup(to)?;
        self.canonical
            .remove_connection(from_key, from_port, to_key, to_port);
        for index in 0..self.voices.voice_count() {
            let voice = self.voices.voice_mut(index).expect("pool index");
            voice
                .graph_mut()
                .remove_connection(from_key, from_port, to_key, to_port);
        }
        Ok(())
    }

    /// Remove every edge from `from` into `to`'s target port. Idempotent.
    pub fn remove_all(
        &mut self,
        from: &str,
        to: &str,
        to_port: PortId,
    ) -> Result<(), EngineError> {
        let from_key = self.lookup(from)?;
        let to_key = self.lookup(to)?;
        self.canonical.remove_matching(from_key, to_key, to_port);
        for index in 0..self.voices.voice_count() {
            let voice = self.voices.voice_mut(index).expect("pool index");
            voice.graph_mut().remove_matching(from_key, to_key, to_port);
        }
        Ok(())
    }

    /// Route a host macro of one voice into a destination port. Mode
    /// defaults to Additive when the caller leaves it unspecified.
    #[allow(clippy::too_many_arguments)]
    pub fn connect_macro(
        &mut self,
        voice_index: usize,
        macro_index: usize,
        target: &str,
        target_port: PortId,
        amount: f32,
        mode: Option<ModulationMode>,
        transformation: ModulationTransformation,
    ) -> Result<(), EngineError> {
        if macro_index >= MACROS_PER_VOICE {
            return Err(EngineError::InvalidMacroIndex(macro_index));
        }
        let target_key = self.lookup(target)?;
        let route = MacroRoute {
            macro_index,
            target: target_key,
            port: target_port,
            amount,
            mode: mode.unwrap_or(ModulationMode::Additive),
            transformation,
        };
        let voice = self
            .voices
            .voice_mut(voice_index)
            .ok_or(EngineError::VoiceOutOfRange(voice_index))?;
        voice.graph_mut().add_macro_route(route)?;
        Ok(())
    }
}

// =====================================================================
// Parameter updates
// =====================================================================

/// Expands a typed `update_*` operation: kind check, then stage the new
/// parameter struct on the canonical node and every replica.
macro_rules! update_op {
    ($fn_name:ident, $kind:expr, $node_ty:ty, $params_ty:ty) => {
        impl Engine {
            pub fn $fn_name(&mut self, id: &str, params: $params_ty) -> Result<(), EngineError> {
                let (key, kind) = self.lookup_kind(id)?;
                if kind != $kind {
                    return Err(EngineError::WrongNodeKind {
                        id: id.to_string(),
                        expected: $kind,
                        actual: kind,
                    });
                }

                let node = self
                    .canonical
                    .node_mut(key)
                    .ok_or_else(|| EngineError::UnknownNode(id.to_string()))?;
                node.as_any_mut()
                    .downcast_mut::<$node_ty>()
                    .expect("kind tag matches concrete type")
                    .set_params(params);

                for index in 0..self.voices.voice_count() {
                    let voice = self.voices.voice_mut(index).expect("pool index");
                    if let Some(node) = voice.graph_mut().node_mut(key) {
                        node.as_any_mut()
                            .downcast_mut::<$node_ty>()
                            .expect("kind tag matches concrete type")
                            .set_params(params);
                    }
                }
                Ok(())
            }
        }
    };
}

update_op!(
    update_analog_oscillator,
    NodeKind::AnalogOscillator,
    AnalogOscillator,
    AnalogOscillatorParams
);
update_op!(
    update_wavetable_oscillator,
    NodeKind::WavetableOscillator,
    WavetableOscillator,
    WavetableOscillatorParams
);
update_op!(update_sampler, NodeKind::Sampler, Sampler, SamplerParams);
update_op!(update_noise, NodeKind::Noise, Noise, NoiseParams);
update_op!(update_filter, NodeKind::Filter, FilterCollection, FilterParams);
update_op!(update_mixer, NodeKind::Mixer, Mixer, MixerParams);
update_op!(update_envelope, NodeKind::Envelope, Envelope, EnvelopeParams);
update_op!(update_lfo, NodeKind::Lfo, Lfo, LfoParams);
update_op!(update_glide, NodeKind::Glide, Glide, GlideParams);
update_op!(update_velocity, NodeKind::Velocity, Velocity, VelocityParams);
update_op!(
    update_arpeggiator,
    NodeKind::Arpeggiator,
    ArpeggiatorGenerator,
    ArpeggiatorParams
);

// Effect kinds living inside a voice graph (a per-voice delay in a
// feedback loop, say) are updated by node ID; the `_node` suffix keeps
// them apart from the index-addressed chain operations below.
update_op!(update_delay_node, NodeKind::Delay, Delay, DelayParams);
update_op!(update_chorus_node, NodeKind::Chorus, Chorus, ChorusParams);
update_op!(update_reverb_node, NodeKind::Reverb, Reverb, ReverbParams);
update_op!(
    update_compressor_node,
    NodeKind::Compressor,
    Compressor,
    CompressorParams
);
update_op!(
    update_saturation_node,
    NodeKind::Saturation,
    Saturation,
    SaturationParams
);
update_op!(
    update_bitcrusher_node,
    NodeKind::Bitcrusher,
    Bitcrusher,
    BitcrusherParams
);
update_op!(update_limiter_node, NodeKind::Limiter, Limiter, LimiterParams);

impl Engine {
    // =================================================================
    // Imports
    // =================================================================

    /// Install a wavetable morph collection on a wavetable oscillator:
    /// the WAV payload is read as consecutive single-cycle frames of
    /// `base_size` samples. On failure the previous table is retained.
    pub fn import_wavetable(
        &mut self,
        id: &str,
        wav_bytes: &[u8],
        base_size: usize,
    ) -> Result<(), EngineError> {
        let (key, kind) = self.lookup_kind(id)?;
        if kind != NodeKind::WavetableOscillator {
            return Err(EngineError::WrongNodeKind {
                id: id.to_string(),
                expected: NodeKind::WavetableOscillator,
                actual: kind,
            });
        }

        let decoded = decode_wav_bytes(wav_bytes)
            .map_err(|e| EngineError::ImportFailure(e.to_string()))?;
        let mono = decoded.to_mono();
        let bank = Arc::new(
            WavetableBank::from_frames(&mono, base_size)
                .map_err(|e| EngineError::ImportFailure(e.to_string()))?,
        );

        let install = |graph: &mut VoiceGraph| {
            if let Some(node) = graph.node_mut(key) {
                node.as_any_mut()
                    .downcast_mut::<WavetableOscillator>()
                    .expect("kind tag matches concrete type")
                    .set_bank(bank.clone());
            }
        };
        install(&mut self.canonical);
        for index in 0..self.voices.voice_count() {
            install(self.voices.voice_mut(index).expect("pool index").graph_mut());
        }

        log::debug!(
            "imported wavetable into {}: {} frames of {}",
            id,
            bank.frame_count(),
            base_size
        );
        Ok(())
    }

    /// Install sample material on a sampler and report what was decoded.
    /// On failure the previous sample is retained.
    pub fn import_sample(&mut self, id: &str, wav_bytes: &[u8]) -> Result<SampleInfo, EngineError> {
        let (key, kind) = self.lookup_kind(id)?;
        if kind != NodeKind::Sampler {
            return Err(EngineError::WrongNodeKind {
                id: id.to_string(),
                expected: NodeKind::Sampler,
                actual: kind,
            });
        }

        let decoded = decode_wav_bytes(wav_bytes)
            .map_err(|e| EngineError::ImportFailure(e.to_string()))?;
        let sample = Arc::new(SampleData::from_decoded(decoded));
        let info = SampleInfo {
            frames: sample.len(),
            channels: sample.channels,
            sample_rate: sample.sample_rate,
        };

        let install = |graph: &mut VoiceGraph| {
            if let Some(node) = graph.node_mut(key) {
                node.as_any_mut()
                    .downcast_mut::<Sampler>()
                    .expect("kind tag matches concrete type")
                    .set_sample(sample.clone());
            }
        };
        install(&mut self.canonical);
        for index in 0..self.voices.voice_count() {
            install(self.voices.voice_mut(index).expect("pool index").graph_mut());
        }

        log::debug!(
            "imported sample into {}: {} frames, {} ch @ {} Hz",
            id,
            info.frames,
            info.channels,
            info.sample_rate
        );
        Ok(info)
    }

    /// Encode the sampler's current material back into 32-bit float WAV
    /// bytes; decoding them reproduces the same frames.
    pub fn export_sample(&self, id: &str) -> Result<Vec<u8>, EngineError> {
        let (key, kind) = self.lookup_kind(id)?;
        if kind != NodeKind::Sampler {
            return Err(EngineError::WrongNodeKind {
                id: id.to_string(),
                expected: NodeKind::Sampler,
                actual: kind,
            });
        }
        let node = self
            .canonical
            .node(key)
            .ok_or_else(|| EngineError::UnknownNode(id.to_string()))?;
        let sampler = node
            .as_any()
            .downcast_ref::<Sampler>()
            .expect("kind tag matches concrete type");
        let sample = sampler.sample();
        Ok(encode_wav_bytes(
            &sample.samples,
            sample.channels,
            sample.sample_rate,
        ))
    }

    // =================================================================
    // Effects chain
    // =================================================================

    /// Append a stereo effect to the global chain, returning its index.
    pub fn add_effect(&mut self, kind: NodeKind) -> Result<usize, EngineError> {
        if !kind.is_effect() {
            return Err(EngineError::UnknownEffect(usize::MAX));
        }
        let effect = self.build_node(kind);
        Ok(self.effects.add(effect))
    }

    pub fn remove_effect(&mut self, index: usize) -> Result<(), EngineError> {
        if self.effects.remove(index) {
            Ok(())
        } else {
            Err(EngineError::UnknownEffect(index))
        }
    }

    pub fn reorder_effects(&mut self, from: usize, to: usize) -> Result<(), EngineError> {
        if self.effects.reorder(from, to) {
            Ok(())
        } else {
            Err(EngineError::UnknownEffect(from.max(to)))
        }
    }

    pub fn effect_kinds(&self) -> Vec<NodeKind> {
        self.effects.kinds()
    }

    fn update_effect<E: 'static, P>(
        &mut self,
        index: usize,
        kind: NodeKind,
        params: P,
        apply: impl FnOnce(&mut E, P),
    ) -> Result<(), EngineError> {
        let effect = self
            .effects
            .get_mut(index)
            .ok_or(EngineError::UnknownEffect(index))?;
        if effect.node_kind() != kind {
            return Err(EngineError::WrongNodeKind {
                id: format!("effect_{}", index),
                expected: kind,
                actual: effect.node_kind(),
            });
        }
        apply(
            effect
                .as_any_mut()
                .downcast_mut::<E>()
                .expect("kind tag matches concrete type"),
            params,
        );
        Ok(())
    }

    pub fn update_delay(&mut self, index: usize, params: DelayParams) -> Result<(), EngineError> {
        self.update_effect(index, NodeKind::Delay, params, Delay::set_params)
    }

    pub fn update_chorus(&mut self, index: usize, params: ChorusParams) -> Result<(), EngineError> {
        self.update_effect(index, NodeKind::Chorus, params, Chorus::set_params)
    }

    pub fn update_reverb(&mut self, index: usize, params: ReverbParams) -> Result<(), EngineError> {
        self.update_effect(index, NodeKind::Reverb, params, Reverb::set_params)
    }

    pub fn update_compressor(
        &mut self,
        index: usize,
        params: CompressorParams,
    ) -> Result<(), EngineError> {
        self.update_effect(index, NodeKind::Compressor, params, Compressor::set_params)
    }

    pub fn update_saturation(
        &mut self,
        index: usize,
        params: SaturationParams,
    ) -> Result<(), EngineError> {
        self.update_effect(index, NodeKind::Saturation, params, Saturation::set_params)
    }

    pub fn update_bitcrusher(
        &mut self,
        index: usize,
        params: BitcrusherParams,
    ) -> Result<(), EngineError> {
        self.update_effect(index, NodeKind::Bitcrusher, params, Bitcrusher::set_params)
    }

    pub fn update_limiter(&mut self, index: usize, params: LimiterParams) -> Result<(), EngineError> {
        self.update_effect(index, NodeKind::Limiter, params, Limiter::set_params)
    }

    /// Install an imported impulse response on a convolution reverb in
    /// the chain. Mono material feeds both channels.
    pub fn import_impulse_response(
        &mut self,
        index: usize,
        wav_bytes: &[u8],
    ) -> Result<(), EngineError> {
        let decoded = decode_wav_bytes(wav_bytes)
            .map_err(|e| EngineError::ImportFailure(e.to_string()))?;
        let (left, right) = if decoded.channels >= 2 {
            let frames = decoded.frames();
            let mut left = Vec::with_capacity(frames);
            let mut right = Vec::with_capacity(frames);
            for frame in 0..frames {
                left.push(decoded.samples[frame * decoded.channels]);
                right.push(decoded.samples[frame * decoded.channels + 1]);
            }
            (left, right)
        } else {
            (decoded.samples.clone(), decoded.samples)
        };

        let effect = self
            .effects
            .get_mut(index)
            .ok_or(EngineError::UnknownEffect(index))?;
        let actual = effect.node_kind();
        let reverb = effect
            .as_any_mut()
            .downcast_mut::<Reverb>()
            .ok_or(EngineError::WrongNodeKind {
                id: format!("effect_{}", index),
                expected: NodeKind::Reverb,
                actual,
            })?;
        reverb.set_impulse_response(&left, &right);
        Ok(())
    }

    // =================================================================
    // Audio path
    // =================================================================

    /// Render one block. `out_l`/`out_r` fix the block length; every
    /// other array is read by voice (and for macros, by sample).
    ///
    /// This runs on the audio thread: no allocation, no I/O, no blocking.
    #[allow(clippy::too_many_arguments)]
    pub fn process_audio(
        &mut self,
        gates: &[f32],
        frequencies: &[f32],
        gains: &[f32],
        velocities: &[f32],
        macros: &[f32],
        master_gain: f32,
        out_l: &mut [f32],
        out_r: &mut [f32],
    ) {
        let n = out_l.len().min(out_r.len()).min(MAX_BLOCK_SIZE);
        debug_assert_eq!(out_l.len(), out_r.len(), "output buffers must match");
        if n == 0 {
            return;
        }
        let started = Instant::now();

        // Block boundary: staged parameters become visible now.
        self.canonical.commit_params();
        self.voices.commit_params();
        self.effects.commit_params();

        // Feed the arpeggiators the currently held notes. Fixed-size
        // scratch: this path must not allocate.
        let mut held = [0.0f32; MAX_VOICES];
        let mut held_len = 0;
        for (&gate, &freq) in gates.iter().zip(frequencies.iter()).take(MAX_VOICES) {
            if gate > 0.5 {
                held[held_len] = freq;
                held_len += 1;
            }
        }
        for record_idx in 0..self.records.len() {
            if self.records[record_idx].kind != NodeKind::Arpeggiator {
                continue;
            }
            let key = self.records[record_idx].key;
            for index in 0..self.voices.voice_count() {
                let voice = self.voices.voice_mut(index).expect("pool index");
                if let Some(node) = voice.graph_mut().node_mut(key) {
                    node.as_any_mut()
                        .downcast_mut::<ArpeggiatorGenerator>()
                        .expect("kind tag matches concrete type")
                        .set_held_notes(&held[..held_len]);
                }
            }
        }

        self.frame.set_block_len(n);
        self.frame
            .populate(gates, frequencies, gains, velocities, macros);

        self.voices.process_block(&self.frame, n);

        let ctx = ProcessContext::new(self.sample_rate);
        let (bus_l, bus_r) = self.voices.bus_mut();
        // Split borrow: the chain and the bus are distinct fields.
        self.effects.process(bus_l, bus_r, n, &ctx);

        let (bus_l, bus_r) = self.voices.bus();
        for i in 0..n {
            out_l[i] = bus_l[i] * master_gain;
            out_r[i] = bus_r[i] * master_gain;
        }
        scrub_non_finite(&mut out_l[..n]);
        scrub_non_finite(&mut out_r[..n]);

        // Smoothed load estimate against the realtime deadline
        let deadline = n as f32 / self.sample_rate;
        let spent = started.elapsed().as_secs_f32();
        let load = (spent / deadline).clamp(0.0, 1.0);
        self.cpu_usage += 0.1 * (load - self.cpu_usage);
    }

    // =================================================================
    // Snapshot
    // =================================================================

    /// Structured description of the canonical voice.
    pub fn get_current_state(&self) -> EngineState {
        let nodes = self
            .records
            .iter()
            .map(|r| NodeDef {
                id: r.id.clone(),
                kind: r.kind,
                name: r.name.clone(),
            })
            .collect();

        let connections = self
            .canonical
            .connections()
            .iter()
            .filter_map(|c| {
                Some(ConnectionDef {
                    from: self.id_for_key(c.from)?.to_string(),
                    to: self.id_for_key(c.to)?.to_string(),
                    target_port: c.to_port,
                    amount: c.amount,
                    mode: c.mode,
                    transformation: c.transformation,
                })
            })
            .collect();

        EngineState {
            version: EngineState::CURRENT_VERSION,
            sample_rate: self.sample_rate,
            voice_count: self.voices.voice_count(),
            nodes,
            connections,
        }
    }

    /// Recreate a snapshot's nodes and connections in this engine.
    /// Returns the mapping from snapshot IDs to freshly assigned ones.
    pub fn apply_state(&mut self, state: &EngineState) -> Result<HashMap<String, String>, EngineError> {
        let mut renaming = HashMap::new();
        for def in &state.nodes {
            let new_id = self.create_node(def.kind)?;
            if def.name.is_some() {
                self.set_node_name(&new_id, def.name.clone())?;
            }
            renaming.insert(def.id.clone(), new_id);
        }
        for def in &state.connections {
            let from = renaming
                .get(&def.from)
                .ok_or_else(|| EngineError::UnknownNode(def.from.clone()))?
                .clone();
            let to = renaming
                .get(&def.to)
                .ok_or_else(|| EngineError::UnknownNode(def.to.clone()))?
                .clone();
            let (_, from_kind) = self.lookup_kind(&from)?;
            self.connect(
                &from,
                source_port_for(from_kind, def.target_port),
                &to,
                def.target_port,
                def.amount,
                def.mode,
                def.transformation,
            )?;
        }
        Ok(renaming)
    }

    /// Clear every voice's DSP state and the effects chain. The graph
    /// shape and all parameters survive.
    pub fn reset(&mut self) {
        self.canonical.reset();
        self.voices.reset();
        self.effects.reset();
        log::debug!("engine reset");
    }
}

/// The output port a snapshot edge reads from. Snapshots record only the
/// target port; the source port follows from the producing node's kind.
fn source_port_for(from_kind: NodeKind, target: PortId) -> PortId {
    match from_kind {
        NodeKind::Envelope => PortId::EnvelopeMod,
        NodeKind::GateMixer => PortId::CombinedGate,
        NodeKind::Arpeggiator => {
            if target.is_gate() {
                PortId::ArpGate
            } else {
                PortId::Frequency
            }
        }
        _ => PortId::AudioOutput0,
    }
}
