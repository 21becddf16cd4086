//! # Voxgraph: Polyphonic Modular Synthesizer Engine
//!
//! `voxgraph` realizes a user-defined graph of signal-processing nodes
//! (oscillators, samplers, filters, envelopes, LFOs, effects) evaluated in
//! fixed-size sample blocks to produce a stereo stream. It is host-driven:
//! a realtime audio host (a browser audio worklet or a native audio
//! thread) supplies per-voice control parameters for a block of N frames
//! and receives N stereo frames back.
//!
//! ## Three interlocking subsystems
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Engine facade                          │  Control plane
//! │  - node / connection mutation           │  "the patch editor's API"
//! │  - imports, snapshots, process_audio    │
//! ├─────────────────────────────────────────┤
//! │  Voice pool                             │  Polyphony
//! │  - ≤ 8 structurally identical replicas  │  "one graph per voice"
//! │  - per-slot gate/freq/gain/velocity     │
//! ├─────────────────────────────────────────┤
//! │  Voice graph                            │  Signal flow
//! │  - typed ports, modulation routing      │  "modular synthesis"
//! │  - feedback-aware topological order     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use voxgraph::prelude::*;
//!
//! // A one-voice engine with a sine oscillator into the output mixer
//! let mut engine = Engine::new(44100.0);
//! engine.init(44100.0, 1).unwrap();
//!
//! let osc = engine.create_analog_oscillator().unwrap();
//! let mixer = engine.create_mixer().unwrap();
//! engine
//!     .connect(
//!         &osc,
//!         PortId::AudioOutput0,
//!         &mixer,
//!         PortId::AudioInput0,
//!         1.0,
//!         ModulationMode::Additive,
//!         ModulationTransformation::None,
//!     )
//!     .unwrap();
//!
//! // The host drives one voice per parameter slot, block by block
//! let mut left = [0.0f32; 128];
//! let mut right = [0.0f32; 128];
//! engine.process_audio(
//!     &[1.0],    // gates
//!     &[440.0],  // frequencies
//!     &[1.0],    // gains
//!     &[1.0],    // velocities
//!     &[],       // macros
//!     1.0,       // master gain
//!     &mut left,
//!     &mut right,
//! );
//! ```
//!
//! ## Modulation model
//!
//! Every connection carries an amount, a [`port::ModulationMode`]
//! (additive, bipolar, or VCA) and an elementwise
//! [`port::ModulationTransformation`]. Before a node runs, the graph folds
//! all of a port's incoming connections into `(base + additive) ×
//! multiplicative`, where `base` is the node's own parameter. An
//! envelope patched into a mixer's `GainMod` in VCA mode therefore
//! scales the mixer's configured gain, and an unpatched port simply
//! reads as the parameter itself.
//!
//! Cycles are legal only through delay-capable ports (oscillator
//! feedback, delay and reverb inputs), which observe the producer's
//! previous block; anything else is rejected when the cable is added.
//!
//! ## Module Documentation
//!
//! - [`engine`] - The facade the host talks to
//! - [`graph`] - One voice's node graph and block evaluation
//! - [`polyphony`] - Voice pool and stereo summing
//! - [`modules`] - Voice-level DSP nodes
//! - [`effects`] - Stereo effects and the global chain
//! - [`port`] - Port roles and modulation combination
//! - [`automation`] - Host-side parameter marshalling
//! - [`wav`] - WAV ingestion, samples and wavetables
//! - [`serialize`] - Canonical-graph snapshots

pub mod automation;
pub mod block;
pub mod effects;
pub mod engine;
pub mod graph;
pub mod modulation;
pub mod modules;
pub mod node;
pub mod polyphony;
pub mod port;
pub mod rng;
pub mod serialize;
pub mod wav;

#[cfg(feature = "wasm")]
pub mod wasm;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::automation::AutomationFrame;
    pub use crate::block::MAX_BLOCK_SIZE;
    pub use crate::effects::{
        BitcrusherParams, ChorusParams, CompressorParams, DelayParams, EffectsChain,
        LimiterParams, ReverbKind, ReverbParams, SaturationParams,
    };
    pub use crate::engine::{Engine, EngineError, SampleInfo, MAX_NODES_PER_VOICE};
    pub use crate::graph::{BlockInputs, Connection, GraphError, MacroRoute, NodeKey, VoiceGraph};
    pub use crate::modules::{
        AnalogOscillatorParams, ArpMode, ArpeggiatorParams, EnvelopeParams, FilterParams,
        FilterSlope, FilterType, GlideParams, LfoLoopMode, LfoParams, LfoTriggerMode, MixerParams,
        NoiseParams, NoiseType, SamplerLoopMode, SamplerParams, SamplerTriggerMode,
        VelocityParams, WavetableOscillatorParams,
    };
    pub use crate::node::{
        AudioNode, InputBuffers, NodeKind, OutputBuffers, PortSpec, PortTable, ProcessContext,
    };
    pub use crate::polyphony::{Voice, VoiceManager, VoiceState, MAX_VOICES};
    pub use crate::port::{ModulationMode, ModulationTransformation, PortId, PortRole};
    pub use crate::serialize::{ConnectionDef, EngineState, NodeDef};
    pub use crate::wav::{SampleData, Waveform, WavetableBank};
}

// Re-export key types at crate root for convenience
pub use prelude::*;
