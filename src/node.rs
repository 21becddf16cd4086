//! Node Contract
//!
//! The [`AudioNode`] trait is the uniform interface every DSP node in a
//! voice graph implements: a declared static port set, block processing
//! over accumulated per-port input buffers, reset, and an activity flag
//! that lets the graph skip silent nodes.

use crate::port::PortId;
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Most ports any node kind declares in one direction.
pub const MAX_NODE_PORTS: usize = 12;

/// Fixed-capacity map from ports to per-block buffers.
///
/// One of these lives on the stack of the block evaluation loop for the
/// duration of a single node call; building and filling it performs no
/// heap allocation, which keeps the audio path free of the allocator.
pub struct PortTable<T> {
    entries: [Option<(PortId, T)>; MAX_NODE_PORTS],
    len: usize,
}

/// Per-block input view: one accumulated buffer per declared input port.
pub type InputBuffers<'a> = PortTable<&'a [f32]>;

/// Per-block output view: one buffer per output port of the node.
pub type OutputBuffers<'a> = PortTable<&'a mut [f32]>;

impl<T> PortTable<T> {
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| None),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a buffer, replacing any existing entry for the same port.
    pub fn insert(&mut self, port: PortId, value: T) {
        for slot in self.entries[..self.len].iter_mut() {
            if let Some((p, v)) = slot {
                if *p == port {
                    *v = value;
                    return;
                }
            }
        }
        debug_assert!(self.len < MAX_NODE_PORTS, "port table overflow");
        if self.len < MAX_NODE_PORTS {
            self.entries[self.len] = Some((port, value));
            self.len += 1;
        }
    }

    pub fn get(&self, port: &PortId) -> Option<&T> {
        self.entries[..self.len].iter().find_map(|slot| match slot {
            Some((p, v)) if p == port => Some(v),
            _ => None,
        })
    }

    pub fn get_mut(&mut self, port: &PortId) -> Option<&mut T> {
        self.entries[..self.len]
            .iter_mut()
            .find_map(|slot| match slot {
                Some((p, v)) if p == port => Some(v),
                _ => None,
            })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PortId, &mut T)> {
        self.entries[..self.len]
            .iter_mut()
            .filter_map(|slot| slot.as_mut().map(|(p, v)| (&*p, v)))
    }
}

impl<T> Default for PortTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::ops::Index<&PortId> for PortTable<T> {
    type Output = T;

    fn index(&self, port: &PortId) -> &T {
        self.get(port).expect("port not present in table")
    }
}

impl<T> FromIterator<(PortId, T)> for PortTable<T> {
    fn from_iter<I: IntoIterator<Item = (PortId, T)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (port, value) in iter {
            table.insert(port, value);
        }
        table
    }
}

/// Identifies every node kind the engine can instantiate.
///
/// Codes are stable across versions; they appear in state snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum NodeKind {
    AnalogOscillator = 0,
    WavetableOscillator = 1,
    Sampler = 2,
    Noise = 3,
    Filter = 4,
    Mixer = 5,
    GateMixer = 6,
    Envelope = 7,
    Lfo = 8,
    Glide = 9,
    Velocity = 10,
    GlobalFrequency = 11,
    GlobalVelocity = 12,
    Arpeggiator = 13,
    Delay = 14,
    Chorus = 15,
    Reverb = 16,
    Compressor = 17,
    Saturation = 18,
    Bitcrusher = 19,
    Limiter = 20,
}

impl NodeKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Input ports of this kind that carry one block of delay, making an
    /// otherwise-cyclic connection legal: the consumer observes the
    /// producer's previous block.
    pub fn delay_capable_inputs(self) -> &'static [PortId] {
        match self {
            NodeKind::AnalogOscillator | NodeKind::WavetableOscillator => &[PortId::FeedbackMod],
            NodeKind::Delay | NodeKind::Reverb => &[PortId::AudioInput0, PortId::AudioInput1],
            _ => &[],
        }
    }

    /// Whether this kind is a stereo-in/stereo-out effect usable in the
    /// global effects chain.
    pub fn is_effect(self) -> bool {
        matches!(
            self,
            NodeKind::Delay
                | NodeKind::Chorus
                | NodeKind::Reverb
                | NodeKind::Compressor
                | NodeKind::Saturation
                | NodeKind::Bitcrusher
                | NodeKind::Limiter
        )
    }
}

/// Declared port set of a node kind: which ports it reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortSpec {
    pub inputs: &'static [PortId],
    pub outputs: &'static [PortId],
}

impl PortSpec {
    pub fn has_input(&self, port: PortId) -> bool {
        self.inputs.contains(&port)
    }

    pub fn has_output(&self, port: PortId) -> bool {
        self.outputs.contains(&port)
    }
}

/// Per-block context handed to every node.
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext {
    /// Engine sample rate in Hz
    pub sample_rate: f32,
    /// Current voice gate (scalar view of the block's gate input)
    pub gate: f32,
    /// Current voice base frequency in Hz
    pub frequency: f32,
    /// Current voice velocity in 0..1
    pub velocity: f32,
    /// Index of the voice this node instance belongs to
    pub voice_index: usize,
    /// Seed for the voice's deterministic random stream
    pub voice_seed: u64,
}

impl ProcessContext {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            gate: 0.0,
            frequency: 440.0,
            velocity: 0.0,
            voice_index: 0,
            voice_seed: 0,
        }
    }
}

/// The uniform contract all DSP nodes implement.
///
/// `process_block` must not allocate and must not fail; missing input
/// buffers are a programming bug (asserted in debug builds) and degrade to
/// the port default in release. Parameter updates are staged via the
/// node's own update method and become visible after `commit_params`,
/// which the graph calls between blocks.
pub trait AudioNode: Send {
    /// The static set of ports this node reads and writes.
    fn port_spec(&self) -> PortSpec;

    /// The kind tag, used for snapshots and update-kind checks.
    fn node_kind(&self) -> NodeKind;

    /// Render one block. `inputs` holds the accumulated buffer for every
    /// connected input port; `outputs` holds one buffer per output port.
    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    );

    /// Base value of an input port: what the accumulated stream resolves
    /// against when the port has connections, and the constant the port
    /// holds when it has none. Nodes override this for ports whose base
    /// is one of their own parameters (gain, cutoff, attack time, ...).
    ///
    /// Frequency-role ports are special-cased by the graph: once
    /// connected, their base is zero and the connections alone define the
    /// stream.
    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        default_for_port(port, ctx)
    }

    /// Clear all internal DSP state (phases, delay lines, envelope
    /// position). Does not touch parameters.
    fn reset(&mut self);

    /// Swap in any pending parameter struct. Called at block boundaries
    /// only.
    fn commit_params(&mut self) {}

    /// Inactive nodes are skipped by the graph and their outputs cleared.
    fn is_active(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Double-buffered parameter storage shared by all node kinds.
///
/// `set` stages a wholesale replacement; `commit` swaps it in. The audio
/// thread only ever reads `get`, so a block never observes a half-applied
/// update.
#[derive(Debug, Clone, Default)]
pub struct ParamSlot<P> {
    active: P,
    pending: Option<P>,
}

impl<P> ParamSlot<P> {
    pub fn new(params: P) -> Self {
        Self {
            active: params,
            pending: None,
        }
    }

    /// Stage a full replacement, overwriting any earlier staged value.
    pub fn set(&mut self, params: P) {
        self.pending = Some(params);
    }

    /// Swap the staged value in. Returns true if anything changed.
    pub fn commit(&mut self) -> bool {
        match self.pending.take() {
            Some(p) => {
                self.active = p;
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn get(&self) -> &P {
        &self.active
    }
}

/// Port base values shared across node kinds. Global ports mirror the
/// voice controls; ratio-style modulation ports are neutral at 1.
pub fn default_for_port(port: PortId, ctx: &ProcessContext) -> f32 {
    match port {
        PortId::GlobalGate => ctx.gate,
        PortId::GlobalFrequency | PortId::Frequency => ctx.frequency,
        PortId::GlobalVelocity => ctx.velocity,
        PortId::FrequencyMod | PortId::ModIndex => 1.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_slot_commit() {
        let mut slot = ParamSlot::new(1.0f32);
        assert_eq!(*slot.get(), 1.0);

        slot.set(2.0);
        // Still the active value until commit
        assert_eq!(*slot.get(), 1.0);

        assert!(slot.commit());
        assert_eq!(*slot.get(), 2.0);

        // Nothing staged
        assert!(!slot.commit());
    }

    #[test]
    fn test_param_slot_last_write_wins() {
        let mut slot = ParamSlot::new(0u32);
        slot.set(1);
        slot.set(2);
        slot.commit();
        assert_eq!(*slot.get(), 2);
    }

    #[test]
    fn test_delay_capable_ports() {
        assert_eq!(
            NodeKind::AnalogOscillator.delay_capable_inputs(),
            &[PortId::FeedbackMod]
        );
        assert!(NodeKind::Delay
            .delay_capable_inputs()
            .contains(&PortId::AudioInput0));
        assert!(NodeKind::Mixer.delay_capable_inputs().is_empty());
        assert!(NodeKind::Envelope.delay_capable_inputs().is_empty());
    }

    #[test]
    fn test_effect_kinds() {
        assert!(NodeKind::Delay.is_effect());
        assert!(NodeKind::Limiter.is_effect());
        assert!(!NodeKind::AnalogOscillator.is_effect());
        assert!(!NodeKind::Mixer.is_effect());
    }

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(NodeKind::AnalogOscillator.code(), 0);
        assert_eq!(NodeKind::Envelope.code(), 7);
        assert_eq!(NodeKind::Arpeggiator.code(), 13);
        assert_eq!(NodeKind::Limiter.code(), 20);
    }

    #[test]
    fn test_port_table_insert_get() {
        let a = [1.0f32; 4];
        let b = [2.0f32; 4];
        let mut table: InputBuffers = PortTable::new();
        assert!(table.is_empty());

        table.insert(PortId::AudioInput0, &a);
        table.insert(PortId::GainMod, &b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&PortId::AudioInput0).copied(), Some(&a[..]));
        assert_eq!(table[&PortId::GainMod][0], 2.0);
        assert!(table.get(&PortId::CutoffMod).is_none());
    }

    #[test]
    fn test_port_table_insert_replaces() {
        let a = [1.0f32; 2];
        let b = [2.0f32; 2];
        let mut table: InputBuffers = PortTable::new();
        table.insert(PortId::GainMod, &a);
        table.insert(PortId::GainMod, &b);
        assert_eq!(table.len(), 1);
        assert_eq!(table[&PortId::GainMod][0], 2.0);
    }

    #[test]
    fn test_port_table_mutable_access() {
        let mut a = [0.0f32; 4];
        {
            let mut table: OutputBuffers = PortTable::new();
            table.insert(PortId::AudioOutput0, &mut a);
            if let Some(buf) = table.get_mut(&PortId::AudioOutput0) {
                buf.fill(0.5);
            }
            for (_, buf) in table.iter_mut() {
                buf[0] = 1.0;
            }
        }
        assert_eq!(a[0], 1.0);
        assert_eq!(a[1], 0.5);
    }

    #[test]
    fn test_port_table_from_iter() {
        let a = [1.0f32; 2];
        let b = [2.0f32; 2];
        let table: InputBuffers = [(PortId::AudioInput0, &a[..]), (PortId::AudioInput1, &b[..])]
            .into_iter()
            .collect();
        assert_eq!(table.len(), 2);
        assert_eq!(table[&PortId::AudioInput1][1], 2.0);
    }

    #[test]
    fn test_port_spec_queries() {
        static INPUTS: [PortId; 2] = [PortId::AudioInput0, PortId::GainMod];
        static OUTPUTS: [PortId; 1] = [PortId::AudioOutput0];
        let spec = PortSpec {
            inputs: &INPUTS,
            outputs: &OUTPUTS,
        };
        assert!(spec.has_input(PortId::GainMod));
        assert!(!spec.has_input(PortId::AudioOutput0));
        assert!(spec.has_output(PortId::AudioOutput0));
    }
}
