//! Polyphony
//!
//! A [`Voice`] is one slot of the pool: a full private copy of the synth
//! graph plus its per-slot control state. The [`VoiceManager`] demuxes the
//! host's parallel parameter arrays into the voices, runs each one, and
//! sums their stereo outputs into the shared bus.
//!
//! Voice-to-slot mapping is the host's job: slot `i` is always driven by
//! row `i` of the automation frame, and the core never reallocates voices
//! across slots.

use crate::automation::AutomationFrame;
use crate::block::MAX_BLOCK_SIZE;
use crate::graph::{BlockInputs, VoiceGraph};
use crate::modules::Envelope;
use crate::node::ProcessContext;
use crate::port::PortId;

/// Hard upper bound on the pool size.
pub const MAX_VOICES: usize = 8;

/// Play state of one voice slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    /// Gate high
    Playing,
    /// Gate fell but envelopes are still above silence
    Releasing,
}

/// One polyphonic slot: a private graph replica and its control values.
pub struct Voice {
    index: usize,
    seed: u64,
    graph: VoiceGraph,

    current_gate: f32,
    current_frequency: f32,
    current_gain: f32,
    current_velocity: f32,
    state: VoiceState,
}

impl Voice {
    pub fn new(index: usize, seed: u64, graph: VoiceGraph) -> Self {
        Self {
            index,
            seed,
            graph,
            current_gate: 0.0,
            current_frequency: 440.0,
            current_gain: 1.0,
            current_velocity: 0.0,
            state: VoiceState::Idle,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn graph(&self) -> &VoiceGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut VoiceGraph {
        &mut self.graph
    }

    pub fn current_frequency(&self) -> f32 {
        self.current_frequency
    }

    pub fn current_gate(&self) -> f32 {
        self.current_gate
    }

    /// Whether this voice needs processing at all: gate held, or some
    /// envelope still sounding.
    pub fn is_audible(&self) -> bool {
        self.state != VoiceState::Idle
    }

    pub fn set_controls(&mut self, gate: f32, frequency: f32, gain: f32, velocity: f32) {
        self.current_gate = gate;
        self.current_frequency = frequency;
        self.current_gain = gain;
        self.current_velocity = velocity;
    }

    fn any_envelope_sounding(&self) -> bool {
        self.graph.keys().iter().any(|&key| {
            self.graph
                .node(key)
                .and_then(|node| node.as_any().downcast_ref::<Envelope>())
                .map(|env| !env.is_idle())
                .unwrap_or(false)
        })
    }

    /// Recompute the play state from the gate and envelope positions.
    /// Called after each processed block.
    pub fn update_state(&mut self) {
        self.state = if self.current_gate > 0.5 {
            VoiceState::Playing
        } else if self.any_envelope_sounding() {
            VoiceState::Releasing
        } else {
            VoiceState::Idle
        };
    }

    pub fn context(&self, sample_rate: f32) -> ProcessContext {
        ProcessContext {
            sample_rate,
            gate: self.current_gate,
            frequency: self.current_frequency,
            velocity: self.current_velocity,
            voice_index: self.index,
            voice_seed: self.seed,
        }
    }

    pub fn reset(&mut self) {
        self.graph.reset();
        self.current_gate = 0.0;
        self.state = VoiceState::Idle;
    }
}

/// The fixed-size voice pool and the stereo sum.
pub struct VoiceManager {
    voices: Vec<Voice>,
    sample_rate: f32,
    bus_l: Vec<f32>,
    bus_r: Vec<f32>,
}

impl VoiceManager {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            voices: Vec::new(),
            sample_rate,
            bus_l: vec![0.0; MAX_BLOCK_SIZE],
            bus_r: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Replace the pool wholesale. The engine calls this from `init` with
    /// freshly replicated voices.
    pub fn install_voices(&mut self, voices: Vec<Voice>) {
        debug_assert!(voices.len() <= MAX_VOICES);
        self.voices = voices;
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    pub fn voice(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index)
    }

    pub fn voice_mut(&mut self, index: usize) -> Option<&mut Voice> {
        self.voices.get_mut(index)
    }

    /// Frequencies of all currently gated voices; feeds the arpeggiator's
    /// held-note set.
    pub fn held_frequencies(&self) -> Vec<f32> {
        self.voices
            .iter()
            .filter(|v| v.current_gate() > 0.5)
            .map(|v| v.current_frequency())
            .collect()
    }

    /// Commit staged parameters on every voice. Between blocks only.
    pub fn commit_params(&mut self) {
        for voice in self.voices.iter_mut() {
            voice.graph_mut().commit_params();
        }
    }

    /// Process one block for the whole pool, mixing every audible voice
    /// into the internal stereo bus.
    pub fn process_block(&mut self, frame: &AutomationFrame, n: usize) {
        self.bus_l[..n].fill(0.0);
        self.bus_r[..n].fill(0.0);

        for voice in self.voices.iter_mut() {
            let i = voice.index();
            let gate = frame.gates().get(i).copied().unwrap_or(0.0);
            let frequency = frame.frequencies().get(i).copied().unwrap_or(440.0);
            let gain = frame.gains().get(i).copied().unwrap_or(1.0);
            let velocity = frame.velocities().get(i).copied().unwrap_or(0.0);
            voice.set_controls(gate, frequency, gain, velocity);

            // Skip silent voices entirely; they contribute exact zeros
            if !voice.is_audible() && gate <= 0.5 {
                continue;
            }

            let ctx = voice.context(self.sample_rate);
            let gate_slice = [gate];
            let freq_slice = [frequency];
            let vel_slice = [velocity];
            let inputs = BlockInputs {
                gate: &gate_slice,
                frequency: &freq_slice,
                velocity: &vel_slice,
                macros: [
                    frame.macro_slice(i, 0),
                    frame.macro_slice(i, 1),
                    frame.macro_slice(i, 2),
                    frame.macro_slice(i, 3),
                ],
            };

            voice.graph_mut().process_block(n, &inputs, &ctx);
            voice.update_state();

            if let Some(left) = voice.graph().terminal_output(PortId::AudioOutput0) {
                for (bus, &sample) in self.bus_l[..n].iter_mut().zip(left[..n].iter()) {
                    *bus += sample * gain;
                }
            }
            if let Some(right) = voice.graph().terminal_output(PortId::AudioOutput1) {
                for (bus, &sample) in self.bus_r[..n].iter_mut().zip(right[..n].iter()) {
                    *bus += sample * gain;
                }
            }
        }
    }

    pub fn bus(&self) -> (&[f32], &[f32]) {
        (&self.bus_l, &self.bus_r)
    }

    pub fn bus_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.bus_l, &mut self.bus_r)
    }

    /// Clear all DSP state in every voice; graph shapes survive.
    pub fn reset(&mut self) {
        for voice in self.voices.iter_mut() {
            voice.reset();
        }
        self.bus_l.fill(0.0);
        self.bus_r.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::AutomationFrame;
    use crate::graph::Connection;
    use crate::modules::{default_waveform_banks, AnalogOscillator, Mixer};
    use crate::port::{ModulationMode, ModulationTransformation};

    const SR: f32 = 44100.0;

    fn sine_voice(index: usize) -> Voice {
        let banks = default_waveform_banks(SR);
        let mut graph = VoiceGraph::new(SR);
        let osc = graph.add_node(Box::new(AnalogOscillator::new(SR, banks)));
        let mixer = graph.add_node(Box::new(Mixer::new()));
        graph
            .connect(Connection {
                from: osc,
                from_port: PortId::AudioOutput0,
                to: mixer,
                to_port: PortId::AudioInput0,
                amount: 1.0,
                mode: ModulationMode::Additive,
                transformation: ModulationTransformation::None,
            })
            .unwrap();
        graph.set_terminal(mixer).unwrap();
        Voice::new(index, index as u64 + 1, graph)
    }

    fn frame_for(voices: usize, n: usize) -> AutomationFrame {
        AutomationFrame::with_dimensions(voices, 4, n)
    }

    #[test]
    fn test_gated_voice_produces_audio() {
        let mut manager = VoiceManager::new(SR);
        manager.install_voices(vec![sine_voice(0)]);

        let mut frame = frame_for(1, 128);
        frame.set_voice_values(0, 1.0, 440.0, 1.0, 1.0);
        manager.process_block(&frame, 128);

        let (left, right) = manager.bus();
        let energy: f32 = left[..128].iter().map(|s| s * s).sum();
        assert!(energy > 0.1);
        assert_eq!(&left[..128], &right[..128], "mono voice mirrors channels");
    }

    #[test]
    fn test_ungated_voice_is_skipped() {
        let mut manager = VoiceManager::new(SR);
        manager.install_voices(vec![sine_voice(0)]);

        let frame = frame_for(1, 128);
        manager.process_block(&frame, 128);

        let (left, _) = manager.bus();
        assert!(left[..128].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_voice_gain_scales_contribution() {
        let mut manager = VoiceManager::new(SR);
        manager.install_voices(vec![sine_voice(0)]);

        let mut frame = frame_for(1, 128);
        frame.set_voice_values(0, 1.0, 440.0, 1.0, 1.0);
        manager.process_block(&frame, 128);
        let loud: f32 = manager.bus().0[..128].iter().map(|s| s * s).sum();

        manager.reset();
        frame.set_voice_values(0, 1.0, 440.0, 0.5, 1.0);
        manager.process_block(&frame, 128);
        let quiet: f32 = manager.bus().0[..128].iter().map(|s| s * s).sum();

        assert!((quiet - loud * 0.25).abs() < loud * 0.05);
    }

    #[test]
    fn test_voices_do_not_bleed() {
        let mut manager = VoiceManager::new(SR);
        manager.install_voices(vec![sine_voice(0), sine_voice(1)]);

        // Only voice 0 gated; voice 1's frequency sweeps wildly
        let mut frame = frame_for(2, 128);
        frame.set_voice_values(0, 1.0, 440.0, 1.0, 1.0);
        frame.set_voice_values(1, 0.0, 123.0, 1.0, 1.0);
        manager.process_block(&frame, 128);
        let reference: Vec<f32> = manager.bus().0[..128].to_vec();

        let mut manager2 = VoiceManager::new(SR);
        manager2.install_voices(vec![sine_voice(0), sine_voice(1)]);
        let mut frame2 = frame_for(2, 128);
        frame2.set_voice_values(0, 1.0, 440.0, 1.0, 1.0);
        frame2.set_voice_values(1, 0.0, 9999.0, 1.0, 1.0);
        manager2.process_block(&frame2, 128);

        assert_eq!(reference, manager2.bus().0[..128].to_vec());
    }

    #[test]
    fn test_voice_state_transitions() {
        let mut voice = sine_voice(0);
        assert_eq!(voice.state(), VoiceState::Idle);

        voice.set_controls(1.0, 440.0, 1.0, 1.0);
        voice.update_state();
        assert_eq!(voice.state(), VoiceState::Playing);

        // Gate off with no envelopes in the graph: straight to idle
        voice.set_controls(0.0, 440.0, 1.0, 1.0);
        voice.update_state();
        assert_eq!(voice.state(), VoiceState::Idle);
    }

    #[test]
    fn test_held_frequencies() {
        let mut manager = VoiceManager::new(SR);
        manager.install_voices(vec![sine_voice(0), sine_voice(1), sine_voice(2)]);
        manager.voices_mut()[0].set_controls(1.0, 220.0, 1.0, 1.0);
        manager.voices_mut()[1].set_controls(0.0, 330.0, 1.0, 1.0);
        manager.voices_mut()[2].set_controls(1.0, 440.0, 1.0, 1.0);

        assert_eq!(manager.held_frequencies(), vec![220.0, 440.0]);
    }

    #[test]
    fn test_reset_silences_pool() {
        let mut manager = VoiceManager::new(SR);
        manager.install_voices(vec![sine_voice(0)]);
        let mut frame = frame_for(1, 128);
        frame.set_voice_values(0, 1.0, 440.0, 1.0, 1.0);
        manager.process_block(&frame, 128);
        manager.reset();

        let (left, right) = manager.bus();
        assert!(left.iter().all(|&s| s == 0.0));
        assert!(right.iter().all(|&s| s == 0.0));
        assert_eq!(manager.voice(0).unwrap().state(), VoiceState::Idle);
    }
}
