//! Voice-Level DSP Nodes
//!
//! This module provides the building blocks a voice graph is patched from:
//! oscillators, sampler, noise, the filter collection, envelope, LFO,
//! glide, velocity shaping, mixers and the arpeggiator generator.
//!
//! Every node receives its input ports as already-accumulated streams (see
//! [`crate::modulation`]): the graph has folded all incoming connections
//! against the node's declared base value, so a node reads e.g. its
//! `GainMod` buffer as the effective gain, whether or not anything is
//! patched into it.

use crate::block::MAX_BLOCK_SIZE;
use crate::modulation::scrub_non_finite;
use crate::node::{
    AudioNode, InputBuffers, NodeKind, OutputBuffers, ParamSlot, PortSpec, ProcessContext,
};
use crate::port::PortId;
use crate::rng::Rng;
use crate::wav::{SampleData, Waveform, WavetableBank};
use libm::{expf, fabsf, powf, sinf};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::f32::consts::{FRAC_PI_2, PI, TAU};
use std::sync::Arc;

/// One-pole smoothing coefficient for a time constant in milliseconds.
fn smoothing_coeff(sample_rate: f32, time_ms: f32) -> f32 {
    let samples = sample_rate * (time_ms / 1000.0);
    if samples > 0.0 {
        1.0 - expf(-1.0 / samples)
    } else {
        1.0
    }
}

#[inline]
fn cents_ratio(cents: f32) -> f32 {
    powf(2.0, cents / 1200.0)
}

#[inline]
fn midi_note_to_freq(note: f32) -> f32 {
    440.0 * powf(2.0, (note - 69.0) / 12.0)
}

/// Fetch an input stream, falling back to an empty slice. The graph
/// guarantees every declared port has a buffer; the fallback only
/// protects release builds against wiring bugs.
#[inline]
fn stream<'a>(inputs: &'a InputBuffers, port: PortId) -> &'a [f32] {
    match inputs.get(&port) {
        Some(buf) => buf,
        None => {
            debug_assert!(false, "missing input stream {:?}", port);
            &[]
        }
    }
}

#[inline]
fn at(buf: &[f32], i: usize, fallback: f32) -> f32 {
    buf.get(i).copied().unwrap_or(fallback)
}

/// Write the same mono block to both stereo outputs.
fn write_stereo(outputs: &mut OutputBuffers, n: usize, left: &[f32], right: &[f32]) {
    if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
        out[..n].copy_from_slice(&left[..n]);
        scrub_non_finite(&mut out[..n]);
    }
    if let Some(out) = outputs.get_mut(&PortId::AudioOutput1) {
        out[..n].copy_from_slice(&right[..n]);
        scrub_non_finite(&mut out[..n]);
    }
}

fn clear_outputs(outputs: &mut OutputBuffers, n: usize) {
    for (_, buf) in outputs.iter_mut() {
        buf[..n].fill(0.0);
    }
}

// ====================================================================
// Analog oscillator
// ====================================================================

/// User-visible parameters of [`AnalogOscillator`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalogOscillatorParams {
    pub waveform: Waveform,
    /// Octaves, semitones and cents combined, expressed in cents
    pub detune_cents: f32,
    pub hard_sync: bool,
    pub unison_voices: u32,
    /// Total unison width in cents, peak to peak
    pub spread_cents: f32,
    pub feedback_amount: f32,
    pub gain: f32,
    pub active: bool,
}

impl Default for AnalogOscillatorParams {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            detune_cents: 0.0,
            hard_sync: false,
            unison_voices: 1,
            spread_cents: 10.0,
            feedback_amount: 0.0,
            gain: 1.0,
            active: true,
        }
    }
}

impl AnalogOscillatorParams {
    /// Clamp every field to its documented range.
    pub fn sanitize(mut self) -> Self {
        self.detune_cents = self.detune_cents.clamp(-4800.0, 4800.0);
        self.unison_voices = self.unison_voices.clamp(1, 16);
        self.spread_cents = self.spread_cents.clamp(0.0, 100.0);
        self.feedback_amount = self.feedback_amount.clamp(0.0, 1.0);
        self.gain = self.gain.clamp(0.0, 2.0);
        self
    }
}

/// Band-limited wavetable oscillator with unison, detune spread, phase
/// modulation, self-feedback and hard sync.
///
/// Hard sync listens to the `PhaseMod` stream: a 1-to-0 transition resets
/// every unison phase. With nothing patched into `PhaseMod` the stream is
/// constant and sync never fires.
pub struct AnalogOscillator {
    params: ParamSlot<AnalogOscillatorParams>,
    banks: Arc<HashMap<Waveform, Arc<WavetableBank>>>,

    sample_rate: f32,
    smoothing: f32,
    smoothed_gain: f32,
    smoothed_feedback: f32,
    smoothed_spread: f32,

    voice_phases: Vec<f32>,
    voice_last_out: Vec<f32>,
    voice_offsets: Vec<f32>,
    last_sync_level: f32,

    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

static ANALOG_OSC_INPUTS: [PortId; 7] = [
    PortId::Frequency,
    PortId::FrequencyMod,
    PortId::PhaseMod,
    PortId::ModIndex,
    PortId::DetuneMod,
    PortId::GainMod,
    PortId::FeedbackMod,
];
static STEREO_OUTPUTS: [PortId; 2] = [PortId::AudioOutput0, PortId::AudioOutput1];

impl AnalogOscillator {
    pub fn new(sample_rate: f32, banks: Arc<HashMap<Waveform, Arc<WavetableBank>>>) -> Self {
        let params = AnalogOscillatorParams::default();
        let mut osc = Self {
            params: ParamSlot::new(params),
            banks,
            sample_rate,
            smoothing: smoothing_coeff(sample_rate, 1.0),
            smoothed_gain: params.gain,
            smoothed_feedback: params.feedback_amount,
            smoothed_spread: params.spread_cents,
            voice_phases: vec![0.0; 16],
            voice_last_out: vec![0.0; 16],
            voice_offsets: vec![0.0; 16],
            last_sync_level: 0.0,
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        };
        osc.recalc_voice_offsets();
        osc
    }

    pub fn set_params(&mut self, params: AnalogOscillatorParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &AnalogOscillatorParams {
        self.params.get()
    }

    fn recalc_voice_offsets(&mut self) {
        let n = self.params.get().unison_voices as usize;
        let half = self.smoothed_spread / 2.0;
        for (i, offset) in self.voice_offsets.iter_mut().enumerate().take(n) {
            *offset = if n > 1 {
                let norm = (i as f32 / (n - 1) as f32) * 2.0 - 1.0;
                norm * half
            } else {
                0.0
            };
        }
    }

    /// Render one sample across the unison stack, returning (left, right).
    #[inline]
    fn tick_unison(
        &mut self,
        bank: &WavetableBank,
        freq: f32,
        phase_offset: f32,
        feedback: f32,
        detune_mod_cents: f32,
        morph: f32,
    ) -> (f32, f32) {
        let p = *self.params.get();
        let voices = p.unison_voices as usize;
        let base_detune = cents_ratio(p.detune_cents + detune_mod_cents);

        let mut sum_l = 0.0;
        let mut sum_r = 0.0;

        for v in 0..voices {
            let eff_freq = freq * base_detune * cents_ratio(self.voice_offsets[v]);
            let inc = eff_freq / self.sample_rate;
            let phase = (self.voice_phases[v] + inc).rem_euclid(1.0);
            let fb = self.voice_last_out[v] * feedback / (PI * 1.5);
            let lookup = (phase + phase_offset + fb).rem_euclid(1.0);

            let sample = bank_read_guard(bank.sample(lookup, morph, eff_freq));
            self.voice_phases[v] = phase;
            self.voice_last_out[v] = sample;

            // A single voice stays at unity; stacks fan out equal-power
            let (gain_l, gain_r) = if voices > 1 {
                let pan = (v as f32 / (voices - 1) as f32) * 2.0 - 1.0;
                let pan_norm = (pan + 1.0) * 0.5;
                (
                    libm::cosf(pan_norm * FRAC_PI_2),
                    sinf(pan_norm * FRAC_PI_2),
                )
            } else {
                (1.0, 1.0)
            };

            sum_l += sample * gain_l;
            sum_r += sample * gain_r;
        }

        let norm = 1.0 / (voices as f32);
        (sum_l * norm, sum_r * norm)
    }
}

#[inline]
fn bank_read_guard(sample: f32) -> f32 {
    if sample.is_finite() {
        sample
    } else {
        0.0
    }
}

impl AudioNode for AnalogOscillator {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &ANALOG_OSC_INPUTS,
            outputs: &STEREO_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::AnalogOscillator
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::GainMod => self.smoothed_gain,
            PortId::FeedbackMod => self.smoothed_feedback,
            _ => crate::node::default_for_port(port, ctx),
        }
    }

    fn commit_params(&mut self) {
        if self.params.commit() {
            let p = *self.params.get();
            let voices = p.unison_voices as usize;
            if self.voice_phases.len() < voices {
                self.voice_phases.resize(voices, 0.0);
                self.voice_last_out.resize(voices, 0.0);
                self.voice_offsets.resize(voices, 0.0);
            }
            self.recalc_voice_offsets();
        }
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        if !p.active {
            clear_outputs(outputs, n);
            return;
        }

        let bank = match self.banks.get(&p.waveform) {
            Some(b) => b.clone(),
            None => {
                log::warn!("wavetable bank missing for {:?}", p.waveform);
                clear_outputs(outputs, n);
                return;
            }
        };

        // Smooth the zipper-prone parameters toward their targets once per
        // block, scaled by the block length.
        let alpha = (self.smoothing * n as f32).min(1.0);
        self.smoothed_gain += alpha * (p.gain - self.smoothed_gain);
        self.smoothed_feedback += alpha * (p.feedback_amount - self.smoothed_feedback);
        let prev_spread = self.smoothed_spread;
        self.smoothed_spread += alpha * (p.spread_cents - self.smoothed_spread);
        if fabsf(self.smoothed_spread - prev_spread) > 0.5 {
            self.recalc_voice_offsets();
        }

        let freq = stream(inputs, PortId::Frequency);
        let freq_mod = stream(inputs, PortId::FrequencyMod);
        let phase_mod = stream(inputs, PortId::PhaseMod);
        let mod_index = stream(inputs, PortId::ModIndex);
        let detune_mod = stream(inputs, PortId::DetuneMod);
        let gain_mod = stream(inputs, PortId::GainMod);
        let feedback_mod = stream(inputs, PortId::FeedbackMod);

        for i in 0..n {
            let pm = at(phase_mod, i, 0.0);

            // Hard sync: falling edge through 0.5 on the phase-mod stream
            if p.hard_sync && self.last_sync_level > 0.5 && pm <= 0.5 {
                for phase in self.voice_phases.iter_mut() {
                    *phase = 0.0;
                }
            }
            self.last_sync_level = pm;

            let f = (at(freq, i, ctx.frequency) * at(freq_mod, i, 1.0)).max(0.0);
            let phase_offset = pm * at(mod_index, i, 1.0) / TAU;

            let (l, r) = self.tick_unison(
                &bank,
                f,
                phase_offset,
                at(feedback_mod, i, self.smoothed_feedback),
                at(detune_mod, i, 0.0),
                0.0,
            );

            let g = at(gain_mod, i, self.smoothed_gain);
            self.out_l[i] = l * g;
            self.out_r[i] = r * g;
        }

        write_stereo(outputs, n, &self.out_l, &self.out_r);
    }

    fn reset(&mut self) {
        self.voice_phases.fill(0.0);
        self.voice_last_out.fill(0.0);
        self.last_sync_level = 0.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Wavetable oscillator
// ====================================================================

/// User-visible parameters of [`WavetableOscillator`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WavetableOscillatorParams {
    /// Morph position in 0..1 across the loaded table collection
    pub wave_index: f32,
    pub detune_cents: f32,
    pub hard_sync: bool,
    pub unison_voices: u32,
    pub spread_cents: f32,
    pub feedback_amount: f32,
    pub gain: f32,
    pub active: bool,
}

impl Default for WavetableOscillatorParams {
    fn default() -> Self {
        Self {
            wave_index: 0.0,
            detune_cents: 0.0,
            hard_sync: false,
            unison_voices: 1,
            spread_cents: 10.0,
            feedback_amount: 0.0,
            gain: 1.0,
            active: true,
        }
    }
}

impl WavetableOscillatorParams {
    pub fn sanitize(mut self) -> Self {
        self.wave_index = self.wave_index.clamp(0.0, 1.0);
        self.detune_cents = self.detune_cents.clamp(-4800.0, 4800.0);
        self.unison_voices = self.unison_voices.clamp(1, 16);
        self.spread_cents = self.spread_cents.clamp(0.0, 100.0);
        self.feedback_amount = self.feedback_amount.clamp(0.0, 1.0);
        self.gain = self.gain.clamp(0.0, 2.0);
        self
    }
}

/// Morphing wavetable oscillator.
///
/// Plays an imported morph collection (equal-length single-cycle frames),
/// scanning the morph axis with the `WavetableIndex` stream on top of the
/// `wave_index` parameter. Unison, feedback and hard sync behave as on
/// [`AnalogOscillator`].
pub struct WavetableOscillator {
    params: ParamSlot<WavetableOscillatorParams>,
    bank: Arc<WavetableBank>,
    pending_bank: Option<Arc<WavetableBank>>,

    sample_rate: f32,
    smoothing: f32,
    smoothed_gain: f32,
    smoothed_feedback: f32,
    smoothed_spread: f32,

    voice_phases: Vec<f32>,
    voice_last_out: Vec<f32>,
    voice_offsets: Vec<f32>,
    last_sync_level: f32,

    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

static WAVETABLE_OSC_INPUTS: [PortId; 8] = [
    PortId::Frequency,
    PortId::FrequencyMod,
    PortId::PhaseMod,
    PortId::ModIndex,
    PortId::DetuneMod,
    PortId::GainMod,
    PortId::FeedbackMod,
    PortId::WavetableIndex,
];

impl WavetableOscillator {
    pub fn new(sample_rate: f32) -> Self {
        let params = WavetableOscillatorParams::default();
        let mut osc = Self {
            params: ParamSlot::new(params),
            bank: Arc::new(WavetableBank::synthesize(Waveform::Sine, sample_rate)),
            pending_bank: None,
            sample_rate,
            smoothing: smoothing_coeff(sample_rate, 1.0),
            smoothed_gain: params.gain,
            smoothed_feedback: params.feedback_amount,
            smoothed_spread: params.spread_cents,
            voice_phases: vec![0.0; 16],
            voice_last_out: vec![0.0; 16],
            voice_offsets: vec![0.0; 16],
            last_sync_level: 0.0,
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        };
        osc.recalc_voice_offsets();
        osc
    }

    pub fn set_params(&mut self, params: WavetableOscillatorParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &WavetableOscillatorParams {
        self.params.get()
    }

    /// Stage a new morph collection; swapped in at the next block boundary.
    pub fn set_bank(&mut self, bank: Arc<WavetableBank>) {
        self.pending_bank = Some(bank);
    }

    pub fn bank(&self) -> &Arc<WavetableBank> {
        &self.bank
    }

    fn recalc_voice_offsets(&mut self) {
        let n = self.params.get().unison_voices as usize;
        let half = self.smoothed_spread / 2.0;
        for (i, offset) in self.voice_offsets.iter_mut().enumerate().take(n) {
            *offset = if n > 1 {
                let norm = (i as f32 / (n - 1) as f32) * 2.0 - 1.0;
                norm * half
            } else {
                0.0
            };
        }
    }
}

impl AudioNode for WavetableOscillator {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &WAVETABLE_OSC_INPUTS,
            outputs: &STEREO_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::WavetableOscillator
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::GainMod => self.smoothed_gain,
            PortId::FeedbackMod => self.smoothed_feedback,
            PortId::WavetableIndex => self.params.get().wave_index,
            _ => crate::node::default_for_port(port, ctx),
        }
    }

    fn commit_params(&mut self) {
        if let Some(bank) = self.pending_bank.take() {
            self.bank = bank;
        }
        if self.params.commit() {
            let voices = self.params.get().unison_voices as usize;
            if self.voice_phases.len() < voices {
                self.voice_phases.resize(voices, 0.0);
                self.voice_last_out.resize(voices, 0.0);
                self.voice_offsets.resize(voices, 0.0);
            }
            self.recalc_voice_offsets();
        }
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        if !p.active {
            clear_outputs(outputs, n);
            return;
        }

        let alpha = (self.smoothing * n as f32).min(1.0);
        self.smoothed_gain += alpha * (p.gain - self.smoothed_gain);
        self.smoothed_feedback += alpha * (p.feedback_amount - self.smoothed_feedback);
        let prev_spread = self.smoothed_spread;
        self.smoothed_spread += alpha * (p.spread_cents - self.smoothed_spread);
        if fabsf(self.smoothed_spread - prev_spread) > 0.5 {
            self.recalc_voice_offsets();
        }

        let freq = stream(inputs, PortId::Frequency);
        let freq_mod = stream(inputs, PortId::FrequencyMod);
        let phase_mod = stream(inputs, PortId::PhaseMod);
        let mod_index = stream(inputs, PortId::ModIndex);
        let detune_mod = stream(inputs, PortId::DetuneMod);
        let gain_mod = stream(inputs, PortId::GainMod);
        let feedback_mod = stream(inputs, PortId::FeedbackMod);
        let wave_index = stream(inputs, PortId::WavetableIndex);

        let bank = self.bank.clone();
        let voices = p.unison_voices as usize;

        for i in 0..n {
            let pm = at(phase_mod, i, 0.0);
            if p.hard_sync && self.last_sync_level > 0.5 && pm <= 0.5 {
                for phase in self.voice_phases.iter_mut() {
                    *phase = 0.0;
                }
            }
            self.last_sync_level = pm;

            let f = (at(freq, i, ctx.frequency) * at(freq_mod, i, 1.0)).max(0.0);
            let phase_offset = pm * at(mod_index, i, 1.0) / TAU;
            let morph = at(wave_index, i, p.wave_index).clamp(0.0, 1.0);
            let feedback = at(feedback_mod, i, self.smoothed_feedback);
            let detune_mod_cents = at(detune_mod, i, 0.0);
            let base_detune = cents_ratio(p.detune_cents + detune_mod_cents);

            let mut sum_l = 0.0;
            let mut sum_r = 0.0;
            for v in 0..voices {
                let eff_freq = f * base_detune * cents_ratio(self.voice_offsets[v]);
                let inc = eff_freq / self.sample_rate;
                let phase = (self.voice_phases[v] + inc).rem_euclid(1.0);
                let fb = self.voice_last_out[v] * feedback / (PI * 1.5);
                let lookup = (phase + phase_offset + fb).rem_euclid(1.0);

                let sample = bank_read_guard(bank.sample(lookup, morph, eff_freq));
                self.voice_phases[v] = phase;
                self.voice_last_out[v] = sample;

                let (gain_l, gain_r) = if voices > 1 {
                    let pan = (v as f32 / (voices - 1) as f32) * 2.0 - 1.0;
                    let pan_norm = (pan + 1.0) * 0.5;
                    (
                        libm::cosf(pan_norm * FRAC_PI_2),
                        sinf(pan_norm * FRAC_PI_2),
                    )
                } else {
                    (1.0, 1.0)
                };
                sum_l += sample * gain_l;
                sum_r += sample * gain_r;
            }

            let norm = 1.0 / (voices as f32);
            let g = at(gain_mod, i, self.smoothed_gain);
            self.out_l[i] = sum_l * norm * g;
            self.out_r[i] = sum_r * norm * g;
        }

        write_stereo(outputs, n, &self.out_l, &self.out_r);
    }

    fn reset(&mut self) {
        self.voice_phases.fill(0.0);
        self.voice_last_out.fill(0.0);
        self.last_sync_level = 0.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Sampler
// ====================================================================

/// Sample loop behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SamplerLoopMode {
    /// Play once, stop at the end
    Off = 0,
    /// Wrap from loop end back to loop start
    Loop = 1,
    /// Reverse direction at the loop boundaries
    PingPong = 2,
}

/// How the sampler reacts to the voice gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SamplerTriggerMode {
    /// Always playing, gate ignored
    FreeRunning = 0,
    /// Arms on a rising gate edge, releases on the falling edge
    Gate = 1,
    /// Rising edge starts playback; gate releases are ignored
    OneShot = 2,
}

/// User-visible parameters of [`Sampler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerParams {
    /// MIDI note the sample is pitched at
    pub root_note: f32,
    pub loop_mode: SamplerLoopMode,
    /// Loop boundaries in frames; an end of 0 means "whole sample"
    pub loop_start: f32,
    pub loop_end: f32,
    pub trigger_mode: SamplerTriggerMode,
    pub detune_cents: f32,
    pub gain: f32,
    pub active: bool,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            root_note: 60.0,
            loop_mode: SamplerLoopMode::Off,
            loop_start: 0.0,
            loop_end: 0.0,
            trigger_mode: SamplerTriggerMode::Gate,
            detune_cents: 0.0,
            gain: 1.0,
            active: true,
        }
    }
}

impl SamplerParams {
    pub fn sanitize(mut self) -> Self {
        self.root_note = self.root_note.clamp(0.0, 127.0);
        self.loop_start = self.loop_start.max(0.0);
        self.loop_end = self.loop_end.max(0.0);
        self.detune_cents = self.detune_cents.clamp(-4800.0, 4800.0);
        self.gain = self.gain.clamp(0.0, 10.0);
        self
    }
}

/// Plays the imported sample, resampling by the ratio of the voice
/// frequency to the root note's frequency.
pub struct Sampler {
    params: ParamSlot<SamplerParams>,
    sample: Arc<SampleData>,
    pending_sample: Option<Arc<SampleData>>,

    sample_rate: f32,
    playhead: f32,
    direction: f32,
    last_gate: f32,
    is_playing: bool,
    oneshot_complete: bool,

    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

static SAMPLER_INPUTS: [PortId; 4] = [
    PortId::GlobalGate,
    PortId::GlobalFrequency,
    PortId::GainMod,
    PortId::DetuneMod,
];

impl Sampler {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            params: ParamSlot::new(SamplerParams::default()),
            sample: Arc::new(SampleData::default()),
            pending_sample: None,
            sample_rate,
            playhead: 0.0,
            direction: 1.0,
            last_gate: 0.0,
            is_playing: false,
            oneshot_complete: false,
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: SamplerParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &SamplerParams {
        self.params.get()
    }

    /// Stage imported sample data; swapped in at the next block boundary.
    pub fn set_sample(&mut self, sample: Arc<SampleData>) {
        self.pending_sample = Some(sample);
    }

    pub fn sample(&self) -> &Arc<SampleData> {
        &self.sample
    }

    fn retrigger(&mut self) {
        self.playhead = 0.0;
        self.direction = 1.0;
        self.is_playing = true;
        self.oneshot_complete = false;
    }

    fn step_playhead(&mut self, step: f32, loop_start: f32, loop_end: f32, sample_len: f32) {
        let p = *self.params.get();
        match p.loop_mode {
            SamplerLoopMode::Off => {
                self.playhead += step;
                if self.playhead >= sample_len {
                    self.playhead = sample_len - 1.0;
                    self.is_playing = false;
                    if p.trigger_mode == SamplerTriggerMode::OneShot {
                        self.oneshot_complete = true;
                    }
                } else if self.playhead < 0.0 {
                    self.playhead = 0.0;
                }
            }
            SamplerLoopMode::Loop => {
                let loop_width = (loop_end - loop_start).max(1.0);
                self.playhead += step;
                if self.playhead >= loop_end {
                    self.playhead = loop_start + (self.playhead - loop_end) % loop_width;
                } else if self.playhead < loop_start && step < 0.0 {
                    self.playhead = loop_end - (loop_start - self.playhead) % loop_width;
                }
            }
            SamplerLoopMode::PingPong => {
                self.playhead += step * self.direction;
                if self.playhead >= loop_end {
                    self.playhead = loop_end - (self.playhead - loop_end);
                    self.direction = -1.0;
                } else if self.playhead <= loop_start {
                    self.playhead = loop_start + (loop_start - self.playhead);
                    self.direction = 1.0;
                }
            }
        }
    }
}

impl AudioNode for Sampler {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &SAMPLER_INPUTS,
            outputs: &STEREO_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Sampler
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::GainMod => self.params.get().gain,
            _ => crate::node::default_for_port(port, ctx),
        }
    }

    fn commit_params(&mut self) {
        if let Some(sample) = self.pending_sample.take() {
            self.sample = sample;
            self.playhead = 0.0;
            self.direction = 1.0;
            self.is_playing = false;
            self.oneshot_complete = false;
        }
        self.params.commit();
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        let sample = self.sample.clone();
        if !p.active || sample.is_empty() {
            clear_outputs(outputs, n);
            return;
        }

        let gate = stream(inputs, PortId::GlobalGate);
        let freq = stream(inputs, PortId::GlobalFrequency);
        let gain_mod = stream(inputs, PortId::GainMod);
        let detune_mod = stream(inputs, PortId::DetuneMod);

        let sample_len = sample.len() as f32;
        let loop_start = p.loop_start.min(sample_len - 1.0);
        let loop_end = if p.loop_end <= 0.0 {
            sample_len
        } else {
            p.loop_end.min(sample_len)
        };
        let root_freq = midi_note_to_freq(p.root_note);
        // Imported material keeps its own rate; the ratio folds the
        // source/engine rate mismatch into the pitch step.
        let rate_ratio = sample.sample_rate / self.sample_rate;

        for i in 0..n {
            let g = at(gate, i, ctx.gate);
            let rising = g > 0.5 && self.last_gate <= 0.5;
            let falling = g <= 0.5 && self.last_gate > 0.5;
            self.last_gate = g;

            match p.trigger_mode {
                SamplerTriggerMode::FreeRunning => {
                    if !self.is_playing {
                        self.retrigger();
                    }
                }
                SamplerTriggerMode::Gate => {
                    if rising {
                        self.retrigger();
                    } else if falling {
                        self.is_playing = false;
                    }
                }
                SamplerTriggerMode::OneShot => {
                    if rising && !self.is_playing {
                        self.retrigger();
                    }
                }
            }

            if !self.is_playing {
                self.out_l[i] = 0.0;
                self.out_r[i] = 0.0;
                continue;
            }

            let pitch = at(freq, i, ctx.frequency) / root_freq
                * cents_ratio(p.detune_cents + at(detune_mod, i, 0.0));
            let step = pitch * rate_ratio;

            let (l, r) = sample.frame_at(self.playhead);
            let g = at(gain_mod, i, p.gain);
            self.out_l[i] = l * g;
            self.out_r[i] = r * g;

            self.step_playhead(step, loop_start, loop_end, sample_len);
        }

        write_stereo(outputs, n, &self.out_l, &self.out_r);
    }

    fn reset(&mut self) {
        self.playhead = 0.0;
        self.direction = 1.0;
        self.last_gate = 0.0;
        self.is_playing = false;
        self.oneshot_complete = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Noise
// ====================================================================

/// Noise flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum NoiseType {
    White = 0,
    Pink = 1,
    Brownian = 2,
}

/// User-visible parameters of [`Noise`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseParams {
    pub noise_type: NoiseType,
    pub gain: f32,
    pub active: bool,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            noise_type: NoiseType::White,
            gain: 1.0,
            active: true,
        }
    }
}

impl NoiseParams {
    pub fn sanitize(mut self) -> Self {
        self.gain = self.gain.clamp(0.0, 2.0);
        self
    }
}

/// White, pink or brownian noise source seeded from the voice's random
/// stream, so replicas decorrelate without being host-visible random.
pub struct Noise {
    params: ParamSlot<NoiseParams>,
    rng: Rng,
    seeded: bool,
    // Paul Kellet pink filter state
    pink: [f32; 3],
    brown: f32,
    out: Vec<f32>,
}

static NOISE_INPUTS: [PortId; 1] = [PortId::GainMod];
static MONO_OUTPUT: [PortId; 1] = [PortId::AudioOutput0];

impl Noise {
    pub fn new() -> Self {
        Self {
            params: ParamSlot::new(NoiseParams::default()),
            rng: Rng::default(),
            seeded: false,
            pink: [0.0; 3],
            brown: 0.0,
            out: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: NoiseParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &NoiseParams {
        self.params.get()
    }
}

impl Default for Noise {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for Noise {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &NOISE_INPUTS,
            outputs: &MONO_OUTPUT,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Noise
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::GainMod => self.params.get().gain,
            _ => crate::node::default_for_port(port, ctx),
        }
    }

    fn commit_params(&mut self) {
        self.params.commit();
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        if !p.active {
            clear_outputs(outputs, n);
            return;
        }

        if !self.seeded {
            self.rng = Rng::from_seed(ctx.voice_seed.wrapping_add(0x4e6f697365));
            self.seeded = true;
        }

        let gain_mod = stream(inputs, PortId::GainMod);

        for i in 0..n {
            let white = self.rng.next_f32_bipolar();
            let value = match p.noise_type {
                NoiseType::White => white,
                NoiseType::Pink => {
                    // Paul Kellet's economy pink filter
                    self.pink[0] = 0.99765 * self.pink[0] + white * 0.0990460;
                    self.pink[1] = 0.96300 * self.pink[1] + white * 0.2965164;
                    self.pink[2] = 0.57000 * self.pink[2] + white * 1.0526913;
                    (self.pink[0] + self.pink[1] + self.pink[2] + white * 0.1848) * 0.25
                }
                NoiseType::Brownian => {
                    self.brown = (self.brown + white * 0.02).clamp(-1.0, 1.0);
                    self.brown * 3.5
                }
            };
            self.out[i] = value * at(gain_mod, i, p.gain);
        }

        if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
            out[..n].copy_from_slice(&self.out[..n]);
            scrub_non_finite(&mut out[..n]);
        }
    }

    fn reset(&mut self) {
        self.pink = [0.0; 3];
        self.brown = 0.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Filter collection
// ====================================================================

/// Filter topology selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum FilterType {
    LowPass = 0,
    HighPass = 1,
    BandPass = 2,
    Notch = 3,
    Peaking = 4,
    LowShelf = 5,
    HighShelf = 6,
    Ladder = 7,
    Comb = 8,
}

/// Rolloff steepness for the biquad topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum FilterSlope {
    Db12 = 0,
    Db24 = 1,
}

/// User-visible parameters of [`FilterCollection`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    /// Cutoff in Hz, clamped to 20 Hz .. Nyquist
    pub cutoff: f32,
    pub resonance: f32,
    pub filter_type: FilterType,
    pub slope: FilterSlope,
    /// 0..1 weight mixing the voice frequency into the cutoff
    pub key_tracking: f32,
    /// Comb mode: fundamental in Hz
    pub comb_frequency: f32,
    /// Comb mode: feedback-path damping
    pub comb_dampening: f32,
    pub gain: f32,
    pub active: bool,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            cutoff: 2000.0,
            resonance: 0.0,
            filter_type: FilterType::LowPass,
            slope: FilterSlope::Db12,
            key_tracking: 0.0,
            comb_frequency: 220.0,
            comb_dampening: 0.5,
            gain: 1.0,
            active: true,
        }
    }
}

impl FilterParams {
    pub fn sanitize(mut self) -> Self {
        self.cutoff = self.cutoff.clamp(20.0, 20_000.0);
        self.resonance = self.resonance.clamp(0.0, 1.0);
        self.key_tracking = self.key_tracking.clamp(0.0, 1.0);
        self.comb_frequency = self.comb_frequency.clamp(20.0, 2_000.0);
        self.comb_dampening = self.comb_dampening.clamp(0.0, 1.0);
        self.gain = self.gain.clamp(0.0, 2.0);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadState {
    #[inline]
    fn tick(&mut self, x: f32, c: &BiquadCoeffs) -> f32 {
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl BiquadCoeffs {
    /// RBJ cookbook coefficients, normalized by a0.
    fn compute(
        filter_type: FilterType,
        cutoff: f32,
        q: f32,
        gain_db: f32,
        sample_rate: f32,
    ) -> Self {
        let omega = TAU * cutoff / sample_rate;
        let sin_w = sinf(omega);
        let cos_w = libm::cosf(omega);
        let alpha = sin_w / (2.0 * q);
        let a = powf(10.0, gain_db / 40.0);

        let (b0, b1, b2, a0, a1, a2) = match filter_type {
            FilterType::LowPass => {
                let b1 = 1.0 - cos_w;
                (b1 / 2.0, b1, b1 / 2.0, 1.0 + alpha, -2.0 * cos_w, 1.0 - alpha)
            }
            FilterType::HighPass => {
                let b1 = -(1.0 + cos_w);
                let b0 = (1.0 + cos_w) / 2.0;
                (b0, b1, b0, 1.0 + alpha, -2.0 * cos_w, 1.0 - alpha)
            }
            FilterType::BandPass => (
                alpha,
                0.0,
                -alpha,
                1.0 + alpha,
                -2.0 * cos_w,
                1.0 - alpha,
            ),
            FilterType::Notch => (
                1.0,
                -2.0 * cos_w,
                1.0,
                1.0 + alpha,
                -2.0 * cos_w,
                1.0 - alpha,
            ),
            FilterType::Peaking => (
                1.0 + alpha * a,
                -2.0 * cos_w,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_w,
                1.0 - alpha / a,
            ),
            FilterType::LowShelf => {
                let sqrt_a = libm::sqrtf(a);
                let two_sqrt_a_alpha = 2.0 * sqrt_a * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_w + two_sqrt_a_alpha),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w),
                    a * ((a + 1.0) - (a - 1.0) * cos_w - two_sqrt_a_alpha),
                    (a + 1.0) + (a - 1.0) * cos_w + two_sqrt_a_alpha,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w),
                    (a + 1.0) + (a - 1.0) * cos_w - two_sqrt_a_alpha,
                )
            }
            FilterType::HighShelf => {
                let sqrt_a = libm::sqrtf(a);
                let two_sqrt_a_alpha = 2.0 * sqrt_a * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_w + two_sqrt_a_alpha),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w),
                    a * ((a + 1.0) + (a - 1.0) * cos_w - two_sqrt_a_alpha),
                    (a + 1.0) - (a - 1.0) * cos_w + two_sqrt_a_alpha,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w),
                    (a + 1.0) - (a - 1.0) * cos_w - two_sqrt_a_alpha,
                )
            }
            // Ladder and comb run their own topologies
            FilterType::Ladder | FilterType::Comb => (1.0, 0.0, 0.0, 1.0, 0.0, 0.0),
        };

        let inv_a0 = 1.0 / a0;
        Self {
            b0: b0 * inv_a0,
            b1: b1 * inv_a0,
            b2: b2 * inv_a0,
            a1: a1 * inv_a0,
            a2: a2 * inv_a0,
        }
    }
}

/// Multi-mode filter: biquad LP/HP/BP/Notch/Peaking/Shelf at 12 or 24
/// dB/oct, a four-pole saturating ladder, and a damped feedback comb.
///
/// Key tracking scales the cutoff by the voice frequency relative to
/// middle C, weighted by `key_tracking`.
pub struct FilterCollection {
    params: ParamSlot<FilterParams>,
    sample_rate: f32,

    stage1: BiquadState,
    stage2: BiquadState,
    coeffs: BiquadCoeffs,
    last_cutoff: f32,
    last_res: f32,
    last_type: FilterType,

    ladder_stages: [f32; 4],

    comb_buffer: Vec<f32>,
    comb_pos: usize,
    comb_lp: f32,

    out: Vec<f32>,
}

static FILTER_INPUTS: [PortId; 4] = [
    PortId::AudioInput0,
    PortId::CutoffMod,
    PortId::ResonanceMod,
    PortId::GlobalFrequency,
];

impl FilterCollection {
    pub fn new(sample_rate: f32) -> Self {
        // Sized for the lowest supported comb fundamental
        let comb_len = (sample_rate / 20.0) as usize + 2;
        Self {
            params: ParamSlot::new(FilterParams::default()),
            sample_rate,
            stage1: BiquadState::default(),
            stage2: BiquadState::default(),
            coeffs: BiquadCoeffs::default(),
            last_cutoff: -1.0,
            last_res: -1.0,
            last_type: FilterType::LowPass,
            ladder_stages: [0.0; 4],
            comb_buffer: vec![0.0; comb_len],
            comb_pos: 0,
            comb_lp: 0.0,
            out: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: FilterParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &FilterParams {
        self.params.get()
    }

    #[inline]
    fn resonance_to_q(resonance: f32) -> f32 {
        0.5 + resonance * 9.5
    }

    #[inline]
    fn comb_read(&self, delay: f32) -> f32 {
        let len = self.comb_buffer.len();
        let read_pos = self.comb_pos as f32 - delay;
        let read_pos = read_pos.rem_euclid(len as f32);
        let i0 = read_pos as usize % len;
        let i1 = (i0 + 1) % len;
        let frac = read_pos - read_pos as usize as f32;
        self.comb_buffer[i0] + (self.comb_buffer[i1] - self.comb_buffer[i0]) * frac
    }
}

impl AudioNode for FilterCollection {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &FILTER_INPUTS,
            outputs: &MONO_OUTPUT,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Filter
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::CutoffMod => self.params.get().cutoff,
            PortId::ResonanceMod => self.params.get().resonance,
            _ => crate::node::default_for_port(port, ctx),
        }
    }

    fn commit_params(&mut self) {
        if self.params.commit() {
            // Force a coefficient refresh on the next block
            self.last_cutoff = -1.0;
        }
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        if !p.active {
            clear_outputs(outputs, n);
            return;
        }

        let audio = stream(inputs, PortId::AudioInput0);
        let cutoff_mod = stream(inputs, PortId::CutoffMod);
        let res_mod = stream(inputs, PortId::ResonanceMod);
        let global_freq = stream(inputs, PortId::GlobalFrequency);

        let nyquist = self.sample_rate * 0.49;
        let gain_db = 20.0 * libm::log10f(p.gain.max(1e-3));

        for i in 0..n {
            let x = at(audio, i, 0.0);
            let res = at(res_mod, i, p.resonance).clamp(0.0, 1.0);

            // Key tracking: an octave above middle C doubles the cutoff at
            // full weight.
            let track = if p.key_tracking > 0.0 {
                powf(at(global_freq, i, ctx.frequency).max(1.0) / 261.63, p.key_tracking)
            } else {
                1.0
            };
            let cutoff = (at(cutoff_mod, i, p.cutoff) * track).clamp(20.0, nyquist);

            let y = match p.filter_type {
                FilterType::Ladder => {
                    let g = libm::tanf(PI * cutoff / self.sample_rate).min(1.0);
                    let g1 = g / (1.0 + g);
                    let k = res * 4.0;
                    let fb = libm::tanhf(self.ladder_stages[3] * k);
                    let u = libm::tanhf(x - fb);
                    let s1 = self.ladder_stages[0] + g1 * (u - self.ladder_stages[0]);
                    let s2 = self.ladder_stages[1] + g1 * (s1 - self.ladder_stages[1]);
                    let s3 = self.ladder_stages[2] + g1 * (s2 - self.ladder_stages[2]);
                    let s4 = self.ladder_stages[3] + g1 * (s3 - self.ladder_stages[3]);
                    self.ladder_stages = [s1, s2, s3, s4];
                    s4
                }
                FilterType::Comb => {
                    let comb_freq = (p.comb_frequency * track).clamp(20.0, 2_000.0);
                    let delay = self.sample_rate / comb_freq;
                    let delayed = self.comb_read(delay);
                    // Damped feedback path
                    self.comb_lp += p.comb_dampening * (delayed - self.comb_lp);
                    let fed = x + self.comb_lp * (res * 0.98);
                    let len = self.comb_buffer.len();
                    self.comb_buffer[self.comb_pos] = fed;
                    self.comb_pos = (self.comb_pos + 1) % len;
                    x + delayed
                }
                biquad_type => {
                    if cutoff != self.last_cutoff
                        || res != self.last_res
                        || biquad_type != self.last_type
                    {
                        self.coeffs = BiquadCoeffs::compute(
                            biquad_type,
                            cutoff,
                            Self::resonance_to_q(res),
                            gain_db,
                            self.sample_rate,
                        );
                        self.last_cutoff = cutoff;
                        self.last_res = res;
                        self.last_type = biquad_type;
                    }
                    let y = self.stage1.tick(x, &self.coeffs);
                    match p.slope {
                        FilterSlope::Db12 => y,
                        FilterSlope::Db24 => self.stage2.tick(y, &self.coeffs),
                    }
                }
            };

            self.out[i] = match p.filter_type {
                // Peaking and shelf already bake the gain into their curve
                FilterType::Peaking | FilterType::LowShelf | FilterType::HighShelf => y,
                _ => y * p.gain,
            };
        }

        if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
            out[..n].copy_from_slice(&self.out[..n]);
            scrub_non_finite(&mut out[..n]);
        }
    }

    fn reset(&mut self) {
        self.stage1.clear();
        self.stage2.clear();
        self.ladder_stages = [0.0; 4];
        self.comb_buffer.fill(0.0);
        self.comb_pos = 0;
        self.comb_lp = 0.0;
        self.last_cutoff = -1.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Envelope
// ====================================================================

/// Envelope state machine stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// User-visible parameters of [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeParams {
    /// Seconds
    pub attack: f32,
    pub decay: f32,
    /// Level in 0..1
    pub sustain: f32,
    pub release: f32,
    /// Per-segment curvature: -1 log .. 0 linear .. +1 exponential
    pub attack_curve: f32,
    pub decay_curve: f32,
    pub release_curve: f32,
    /// One-pole smoothing window applied to the output, in samples
    pub attack_smoothing_samples: f32,
    pub active: bool,
}

impl Default for EnvelopeParams {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.1,
            sustain: 0.7,
            release: 0.2,
            attack_curve: 0.0,
            decay_curve: 0.0,
            release_curve: 0.0,
            attack_smoothing_samples: 0.0,
            active: true,
        }
    }
}

impl EnvelopeParams {
    pub fn sanitize(mut self) -> Self {
        self.attack = self.attack.clamp(0.0001, 60.0);
        self.decay = self.decay.clamp(0.0001, 60.0);
        self.sustain = self.sustain.clamp(0.0, 1.0);
        self.release = self.release.clamp(0.0001, 60.0);
        self.attack_curve = self.attack_curve.clamp(-1.0, 1.0);
        self.decay_curve = self.decay_curve.clamp(-1.0, 1.0);
        self.release_curve = self.release_curve.clamp(-1.0, 1.0);
        self.attack_smoothing_samples = self.attack_smoothing_samples.clamp(0.0, 10_000.0);
        self
    }
}

/// Normalized segment shape: curve -1 bows log-like (fast start), 0 is
/// linear, +1 bows exponential (slow start).
#[inline]
pub fn curve_shape(t: f32, curve: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    if fabsf(curve) < 1e-3 {
        t
    } else {
        let k = curve * 6.0;
        (expf(k * t) - 1.0) / (expf(k) - 1.0)
    }
}

/// ADSR envelope with per-segment curvature and output smoothing.
///
/// Gate source is the `CombinedGate` stream, which defaults to the voice
/// gate when no gate mixer is patched in. Attack restarts from the
/// current level, so retriggers never click back to zero.
pub struct Envelope {
    params: ParamSlot<EnvelopeParams>,
    sample_rate: f32,

    stage: EnvelopeStage,
    stage_time: f32,
    stage_start_level: f32,
    level: f32,
    smoothed: f32,
    last_gate: f32,

    out: Vec<f32>,
}

static ENVELOPE_INPUTS: [PortId; 2] = [PortId::CombinedGate, PortId::AttackMod];
static ENVELOPE_OUTPUTS: [PortId; 1] = [PortId::EnvelopeMod];

impl Envelope {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            params: ParamSlot::new(EnvelopeParams::default()),
            sample_rate,
            stage: EnvelopeStage::Idle,
            stage_time: 0.0,
            stage_start_level: 0.0,
            level: 0.0,
            smoothed: 0.0,
            last_gate: 0.0,
            out: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: EnvelopeParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &EnvelopeParams {
        self.params.get()
    }

    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    pub fn is_idle(&self) -> bool {
        self.stage == EnvelopeStage::Idle
    }

    pub fn current_level(&self) -> f32 {
        self.level
    }
}

impl AudioNode for Envelope {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &ENVELOPE_INPUTS,
            outputs: &ENVELOPE_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Envelope
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::CombinedGate => ctx.gate,
            PortId::AttackMod => self.params.get().attack,
            _ => crate::node::default_for_port(port, ctx),
        }
    }

    fn commit_params(&mut self) {
        self.params.commit();
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        if !p.active {
            clear_outputs(outputs, n);
            return;
        }

        let gate = stream(inputs, PortId::CombinedGate);
        let attack_mod = stream(inputs, PortId::AttackMod);
        let dt = 1.0 / self.sample_rate;

        let smooth_coeff = if p.attack_smoothing_samples > 0.0 {
            1.0 - expf(-1.0 / p.attack_smoothing_samples)
        } else {
            1.0
        };

        for i in 0..n {
            let g = at(gate, i, ctx.gate);
            let rising = g > 0.5 && self.last_gate <= 0.5;
            let falling = g <= 0.5 && self.last_gate > 0.5;
            self.last_gate = g;

            if rising {
                self.stage = EnvelopeStage::Attack;
                self.stage_time = 0.0;
                self.stage_start_level = self.level;
            } else if falling && self.stage != EnvelopeStage::Idle {
                self.stage = EnvelopeStage::Release;
                self.stage_time = 0.0;
                self.stage_start_level = self.level;
            }

            let attack = at(attack_mod, i, p.attack).max(0.0001);

            match self.stage {
                EnvelopeStage::Idle => {
                    self.level = 0.0;
                }
                EnvelopeStage::Attack => {
                    self.stage_time += dt;
                    let t = self.stage_time / attack;
                    if t >= 1.0 {
                        self.level = 1.0;
                        self.stage = EnvelopeStage::Decay;
                        self.stage_time = 0.0;
                        self.stage_start_level = 1.0;
                    } else {
                        self.level = self.stage_start_level
                            + (1.0 - self.stage_start_level) * curve_shape(t, p.attack_curve);
                    }
                }
                EnvelopeStage::Decay => {
                    self.stage_time += dt;
                    let t = self.stage_time / p.decay;
                    if t >= 1.0 {
                        self.level = p.sustain;
                        self.stage = EnvelopeStage::Sustain;
                    } else {
                        self.level =
                            1.0 + (p.sustain - 1.0) * curve_shape(t, p.decay_curve);
                    }
                }
                EnvelopeStage::Sustain => {
                    self.level = p.sustain;
                }
                EnvelopeStage::Release => {
                    self.stage_time += dt;
                    let t = self.stage_time / p.release;
                    if t >= 1.0 {
                        self.level = 0.0;
                        self.stage = EnvelopeStage::Idle;
                    } else {
                        self.level = self.stage_start_level
                            * (1.0 - curve_shape(t, p.release_curve));
                    }
                }
            }

            self.smoothed += smooth_coeff * (self.level - self.smoothed);
            self.out[i] = self.smoothed;
        }

        if let Some(out) = outputs.get_mut(&PortId::EnvelopeMod) {
            out[..n].copy_from_slice(&self.out[..n]);
            scrub_non_finite(&mut out[..n]);
        }
    }

    fn reset(&mut self) {
        self.stage = EnvelopeStage::Idle;
        self.stage_time = 0.0;
        self.stage_start_level = 0.0;
        self.level = 0.0;
        self.smoothed = 0.0;
        self.last_gate = 0.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// LFO
// ====================================================================

/// LFO loop behavior over its normalized 0..1 phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum LfoLoopMode {
    /// One pass, then hold the final value
    Off = 0,
    Loop = 1,
    PingPong = 2,
}

/// What resets the LFO phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum LfoTriggerMode {
    None = 0,
    /// Reset on the voice gate's rising edge
    Gate = 1,
    /// Reset when the voice's envelope gate rises (combined gate)
    Envelope = 2,
}

/// User-visible parameters of [`Lfo`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LfoParams {
    pub frequency: f32,
    /// Initial phase in cycles, 0..1
    pub phase_offset: f32,
    pub waveform: Waveform,
    pub trigger_mode: LfoTriggerMode,
    pub loop_mode: LfoLoopMode,
    pub loop_start: f32,
    pub loop_end: f32,
    pub gain: f32,
    /// Output |x| instead of x
    pub use_absolute: bool,
    /// Output (x+1)/2 instead of x
    pub use_normalized: bool,
    pub active: bool,
}

impl Default for LfoParams {
    fn default() -> Self {
        Self {
            frequency: 1.0,
            phase_offset: 0.0,
            waveform: Waveform::Sine,
            trigger_mode: LfoTriggerMode::None,
            loop_mode: LfoLoopMode::Loop,
            loop_start: 0.0,
            loop_end: 1.0,
            gain: 1.0,
            use_absolute: false,
            use_normalized: false,
            active: true,
        }
    }
}

impl LfoParams {
    pub fn sanitize(mut self) -> Self {
        self.frequency = self.frequency.clamp(0.0, 100.0);
        self.phase_offset = self.phase_offset.rem_euclid(1.0);
        self.loop_start = self.loop_start.clamp(0.0, 1.0);
        self.loop_end = self.loop_end.clamp(0.0, 1.0);
        if self.loop_end <= self.loop_start {
            self.loop_end = (self.loop_start + 0.01).min(1.0);
        }
        self.gain = self.gain.clamp(0.0, 10.0);
        self
    }
}

/// Low-frequency oscillator emitting a bipolar modulator (or its
/// absolute / normalized variants) with loopable phase segments.
pub struct Lfo {
    params: ParamSlot<LfoParams>,
    sample_rate: f32,

    phase: f32,
    direction: f32,
    finished: bool,
    last_gate: f32,

    out: Vec<f32>,
}

static LFO_INPUTS: [PortId; 3] = [PortId::GlobalGate, PortId::CombinedGate, PortId::Frequency];

impl Lfo {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            params: ParamSlot::new(LfoParams::default()),
            sample_rate,
            phase: 0.0,
            direction: 1.0,
            finished: false,
            last_gate: 0.0,
            out: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: LfoParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &LfoParams {
        self.params.get()
    }

    #[inline]
    fn waveform_value(waveform: Waveform, phase: f32) -> f32 {
        match waveform {
            Waveform::Sine | Waveform::Custom => sinf(phase * TAU),
            Waveform::Triangle => 1.0 - 4.0 * fabsf(phase - 0.5),
            Waveform::Saw => 2.0 * phase - 1.0,
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
        }
    }

    fn retrigger(&mut self) {
        let p = *self.params.get();
        self.phase = p.phase_offset;
        self.direction = 1.0;
        self.finished = false;
    }
}

impl AudioNode for Lfo {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &LFO_INPUTS,
            outputs: &MONO_OUTPUT,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Lfo
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            // The LFO runs at its own rate, not the voice pitch
            PortId::Frequency => self.params.get().frequency,
            PortId::CombinedGate => ctx.gate,
            _ => crate::node::default_for_port(port, ctx),
        }
    }

    fn commit_params(&mut self) {
        self.params.commit();
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        if !p.active {
            clear_outputs(outputs, n);
            return;
        }

        let global_gate = stream(inputs, PortId::GlobalGate);
        let combined_gate = stream(inputs, PortId::CombinedGate);
        let freq = stream(inputs, PortId::Frequency);

        for i in 0..n {
            let trigger_level = match p.trigger_mode {
                LfoTriggerMode::None => 0.0,
                LfoTriggerMode::Gate => at(global_gate, i, ctx.gate),
                LfoTriggerMode::Envelope => at(combined_gate, i, ctx.gate),
            };
            if p.trigger_mode != LfoTriggerMode::None
                && trigger_level > 0.5
                && self.last_gate <= 0.5
            {
                self.retrigger();
            }
            self.last_gate = trigger_level;

            let raw = Self::waveform_value(p.waveform, self.phase);
            let mut value = raw;
            if p.use_absolute {
                value = fabsf(value);
            }
            if p.use_normalized {
                value = (value + 1.0) * 0.5;
            }
            self.out[i] = value * p.gain;

            // Advance phase within the loop segment
            let step = at(freq, i, p.frequency).max(0.0) / self.sample_rate;
            match p.loop_mode {
                LfoLoopMode::Off => {
                    if !self.finished {
                        self.phase += step;
                        if self.phase >= 1.0 {
                            self.phase = 1.0;
                            self.finished = true;
                        }
                    }
                }
                LfoLoopMode::Loop => {
                    self.phase += step;
                    if self.phase >= p.loop_end {
                        let width = p.loop_end - p.loop_start;
                        self.phase = p.loop_start + (self.phase - p.loop_end) % width;
                    }
                }
                LfoLoopMode::PingPong => {
                    self.phase += step * self.direction;
                    if self.phase >= p.loop_end {
                        self.phase = p.loop_end - (self.phase - p.loop_end);
                        self.direction = -1.0;
                    } else if self.phase <= p.loop_start {
                        self.phase = p.loop_start + (p.loop_start - self.phase);
                        self.direction = 1.0;
                    }
                }
            }
        }

        if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
            out[..n].copy_from_slice(&self.out[..n]);
            scrub_non_finite(&mut out[..n]);
        }
    }

    fn reset(&mut self) {
        let p = *self.params.get();
        self.phase = p.phase_offset;
        self.direction = 1.0;
        self.finished = false;
        self.last_gate = 0.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Glide
// ====================================================================

/// User-visible parameters of [`Glide`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlideParams {
    /// Seconds to close 1/e of a frequency step
    pub time: f32,
    pub active: bool,
}

impl Default for GlideParams {
    fn default() -> Self {
        Self {
            time: 0.05,
            active: true,
        }
    }
}

impl GlideParams {
    pub fn sanitize(mut self) -> Self {
        self.time = self.time.clamp(0.0, 10.0);
        self
    }
}

/// One-pole portamento over the voice frequency. Route its output into an
/// oscillator's `Frequency` port to replace the hard-stepped pitch.
pub struct Glide {
    params: ParamSlot<GlideParams>,
    sample_rate: f32,
    current: f32,
    out: Vec<f32>,
}

static GLIDE_INPUTS: [PortId; 1] = [PortId::GlobalFrequency];

impl Glide {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            params: ParamSlot::new(GlideParams::default()),
            sample_rate,
            current: 0.0,
            out: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: GlideParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &GlideParams {
        self.params.get()
    }
}

impl AudioNode for Glide {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &GLIDE_INPUTS,
            outputs: &MONO_OUTPUT,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Glide
    }

    fn commit_params(&mut self) {
        self.params.commit();
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        let freq = stream(inputs, PortId::GlobalFrequency);

        let coeff = if p.active && p.time > 0.0 {
            1.0 - expf(-1.0 / (p.time * self.sample_rate))
        } else {
            1.0
        };

        for i in 0..n {
            let target = at(freq, i, ctx.frequency);
            if self.current <= 0.0 {
                // First note: no sweep up from silence
                self.current = target;
            }
            self.current += coeff * (target - self.current);
            self.out[i] = self.current;
        }

        if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
            out[..n].copy_from_slice(&self.out[..n]);
        }
    }

    fn reset(&mut self) {
        self.current = 0.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Velocity
// ====================================================================

/// User-visible parameters of [`Velocity`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityParams {
    /// How much velocity affects the output: 0 pins it to 1.0
    pub sensitivity: f32,
    /// Response curvature, -1 log .. +1 exponential
    pub curve: f32,
    pub active: bool,
}

impl Default for VelocityParams {
    fn default() -> Self {
        Self {
            sensitivity: 1.0,
            curve: 0.0,
            active: true,
        }
    }
}

impl VelocityParams {
    pub fn sanitize(mut self) -> Self {
        self.sensitivity = self.sensitivity.clamp(0.0, 1.0);
        self.curve = self.curve.clamp(-1.0, 1.0);
        self
    }
}

/// Shapes the voice velocity into a unipolar modulator, typically routed
/// into a mixer or oscillator `GainMod`.
pub struct Velocity {
    params: ParamSlot<VelocityParams>,
    out: Vec<f32>,
}

static VELOCITY_INPUTS: [PortId; 1] = [PortId::GlobalVelocity];

impl Velocity {
    pub fn new() -> Self {
        Self {
            params: ParamSlot::new(VelocityParams::default()),
            out: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: VelocityParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &VelocityParams {
        self.params.get()
    }
}

impl Default for Velocity {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for Velocity {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &VELOCITY_INPUTS,
            outputs: &MONO_OUTPUT,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Velocity
    }

    fn commit_params(&mut self) {
        self.params.commit();
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        let velocity = stream(inputs, PortId::GlobalVelocity);

        for i in 0..n {
            let v = at(velocity, i, ctx.velocity).clamp(0.0, 1.0);
            let shaped = curve_shape(v, p.curve);
            self.out[i] = (1.0 - p.sensitivity) + p.sensitivity * shaped;
        }

        if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
            out[..n].copy_from_slice(&self.out[..n]);
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

// ====================================================================
// Mixer
// ====================================================================

/// User-visible parameters of [`Mixer`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixerParams {
    pub gain: f32,
    pub active: bool,
}

impl Default for MixerParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            active: true,
        }
    }
}

impl MixerParams {
    pub fn sanitize(mut self) -> Self {
        self.gain = self.gain.clamp(0.0, 2.0);
        self
    }
}

/// Sums its audio inputs into a stereo pair with equal-power panning.
///
/// Per-connection amounts are applied by the graph's accumulation pass;
/// the mixer sees each input port as one summed stream. The last mixer in
/// the canonical graph is the voice's terminal node.
pub struct Mixer {
    params: ParamSlot<MixerParams>,
    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

static MIXER_INPUTS: [PortId; 6] = [
    PortId::AudioInput0,
    PortId::AudioInput1,
    PortId::AudioInput2,
    PortId::AudioInput3,
    PortId::GainMod,
    PortId::StereoPan,
];

impl Mixer {
    pub fn new() -> Self {
        Self {
            params: ParamSlot::new(MixerParams::default()),
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: MixerParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &MixerParams {
        self.params.get()
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for Mixer {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &MIXER_INPUTS,
            outputs: &STEREO_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Mixer
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::GainMod => self.params.get().gain,
            _ => crate::node::default_for_port(port, ctx),
        }
    }

    fn commit_params(&mut self) {
        self.params.commit();
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        _ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        if !p.active {
            clear_outputs(outputs, n);
            return;
        }

        let in0 = stream(inputs, PortId::AudioInput0);
        let in1 = stream(inputs, PortId::AudioInput1);
        let in2 = stream(inputs, PortId::AudioInput2);
        let in3 = stream(inputs, PortId::AudioInput3);
        let gain_mod = stream(inputs, PortId::GainMod);
        let pan = stream(inputs, PortId::StereoPan);

        for i in 0..n {
            let sum = at(in0, i, 0.0) + at(in1, i, 0.0) + at(in2, i, 0.0) + at(in3, i, 0.0);
            let g = at(gain_mod, i, p.gain);
            // Balance law: unity at center, full attenuation opposite
            let pan_pos = at(pan, i, 0.0).clamp(-1.0, 1.0);
            self.out_l[i] = sum * g * (1.0 - pan_pos).min(1.0);
            self.out_r[i] = sum * g * (1.0 + pan_pos).min(1.0);
        }

        write_stereo(outputs, n, &self.out_l, &self.out_r);
    }

    fn reset(&mut self) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Gate mixer
// ====================================================================

/// OR-combines the keyboard gate with the arpeggiator gate into the
/// `CombinedGate` stream envelopes listen to.
pub struct GateMixer;

static GATE_MIXER_INPUTS: [PortId; 2] = [PortId::GlobalGate, PortId::ArpGate];
static GATE_MIXER_OUTPUTS: [PortId; 1] = [PortId::CombinedGate];

impl GateMixer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GateMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for GateMixer {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &GATE_MIXER_INPUTS,
            outputs: &GATE_MIXER_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::GateMixer
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            // An unpatched arp input must not hold the gate open
            PortId::ArpGate => 0.0,
            _ => crate::node::default_for_port(port, ctx),
        }
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let global = stream(inputs, PortId::GlobalGate);
        let arp = stream(inputs, PortId::ArpGate);

        if let Some(out) = outputs.get_mut(&PortId::CombinedGate) {
            for i in 0..n {
                out[i] = at(global, i, ctx.gate).max(at(arp, i, 0.0));
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

// ====================================================================
// Arpeggiator generator
// ====================================================================

/// Note-selection order of [`ArpeggiatorGenerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ArpMode {
    Up = 0,
    Down = 1,
    UpDown = 2,
    Random = 3,
}

/// User-visible parameters of [`ArpeggiatorGenerator`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArpeggiatorParams {
    pub mode: ArpMode,
    /// Steps per second
    pub rate_hz: f32,
    /// Portion of each step the gate stays high
    pub gate_length: f32,
    /// Octave span stacked on top of the held notes
    pub octaves: u32,
    pub active: bool,
}

impl Default for ArpeggiatorParams {
    fn default() -> Self {
        Self {
            mode: ArpMode::Up,
            rate_hz: 8.0,
            gate_length: 0.5,
            octaves: 1,
            active: true,
        }
    }
}

impl ArpeggiatorParams {
    pub fn sanitize(mut self) -> Self {
        self.rate_hz = self.rate_hz.clamp(0.1, 50.0);
        self.gate_length = self.gate_length.clamp(0.05, 0.95);
        self.octaves = self.octaves.clamp(1, 4);
        self
    }
}

/// Steps through the engine's held-note set, emitting an `ArpGate` pulse
/// stream and a `Frequency` stream that selects the current note.
///
/// The held-note set is pushed in by the engine before each block from
/// the gated voices' frequencies.
pub struct ArpeggiatorGenerator {
    params: ParamSlot<ArpeggiatorParams>,
    sample_rate: f32,

    notes: Vec<f32>,
    pattern: Vec<f32>,
    pattern_dirty: bool,

    step_phase: f32,
    step_index: usize,
    current_freq: f32,
    rng: Rng,
    seeded: bool,

    gate_out: Vec<f32>,
    freq_out: Vec<f32>,
}

static ARP_OUTPUTS: [PortId; 2] = [PortId::ArpGate, PortId::Frequency];

impl ArpeggiatorGenerator {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            params: ParamSlot::new(ArpeggiatorParams::default()),
            sample_rate,
            notes: Vec::with_capacity(16),
            pattern: Vec::with_capacity(64),
            pattern_dirty: true,
            step_phase: 0.0,
            step_index: 0,
            current_freq: 440.0,
            rng: Rng::default(),
            seeded: false,
            gate_out: vec![0.0; MAX_BLOCK_SIZE],
            freq_out: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: ArpeggiatorParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &ArpeggiatorParams {
        self.params.get()
    }

    /// Replace the held-note frequency set. Called by the engine between
    /// blocks; order does not matter.
    pub fn set_held_notes(&mut self, freqs: &[f32]) {
        if self.notes.as_slice() != freqs {
            self.notes.clear();
            self.notes.extend_from_slice(freqs);
            self.pattern_dirty = true;
        }
    }

    fn rebuild_pattern(&mut self) {
        let p = *self.params.get();
        self.pattern.clear();

        let mut sorted = self.notes.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted.dedup();

        let mut ascending = Vec::with_capacity(sorted.len() * p.octaves as usize);
        for octave in 0..p.octaves {
            let factor = powf(2.0, octave as f32);
            ascending.extend(sorted.iter().map(|f| f * factor));
        }

        match p.mode {
            ArpMode::Up | ArpMode::Random => self.pattern.extend_from_slice(&ascending),
            ArpMode::Down => self.pattern.extend(ascending.iter().rev()),
            ArpMode::UpDown => {
                self.pattern.extend_from_slice(&ascending);
                // Back down without repeating the endpoints
                if ascending.len() > 2 {
                    self.pattern
                        .extend(ascending[1..ascending.len() - 1].iter().rev());
                }
            }
        }

        if self.step_index >= self.pattern.len() {
            self.step_index = 0;
        }
        self.pattern_dirty = false;
    }

    fn advance_step(&mut self) {
        let p = *self.params.get();
        if self.pattern.is_empty() {
            return;
        }
        self.step_index = match p.mode {
            ArpMode::Random => self.rng.next_index(self.pattern.len()),
            _ => (self.step_index + 1) % self.pattern.len(),
        };
        self.current_freq = self.pattern[self.step_index];
    }
}

impl AudioNode for ArpeggiatorGenerator {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &[],
            outputs: &ARP_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Arpeggiator
    }

    fn commit_params(&mut self) {
        if self.params.commit() {
            self.pattern_dirty = true;
        }
    }

    fn is_active(&self) -> bool {
        self.params.get().active
    }

    fn process_block(
        &mut self,
        n: usize,
        _inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let p = *self.params.get();

        if !self.seeded {
            self.rng = Rng::from_seed(ctx.voice_seed.wrapping_add(0x417270));
            self.seeded = true;
        }
        if self.pattern_dirty {
            self.rebuild_pattern();
            if !self.pattern.is_empty() {
                self.current_freq = self.pattern[self.step_index.min(self.pattern.len() - 1)];
            }
        }

        if !p.active || self.pattern.is_empty() {
            self.gate_out[..n].fill(0.0);
            self.freq_out[..n].fill(ctx.frequency);
            self.step_phase = 0.0;
        } else {
            let step = p.rate_hz / self.sample_rate;
            for i in 0..n {
                self.gate_out[i] = if self.step_phase < p.gate_length {
                    1.0
                } else {
                    0.0
                };
                self.freq_out[i] = self.current_freq;

                self.step_phase += step;
                if self.step_phase >= 1.0 {
                    self.step_phase -= 1.0;
                    self.advance_step();
                }
            }
        }

        if let Some(out) = outputs.get_mut(&PortId::ArpGate) {
            out[..n].copy_from_slice(&self.gate_out[..n]);
        }
        if let Some(out) = outputs.get_mut(&PortId::Frequency) {
            out[..n].copy_from_slice(&self.freq_out[..n]);
        }
    }

    fn reset(&mut self) {
        self.step_phase = 0.0;
        self.step_index = 0;
        self.pattern_dirty = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Global pass-throughs
// ====================================================================

/// Exposes the voice frequency as a patchable signal source.
pub struct GlobalFrequencyNode {
    out: Vec<f32>,
}

static GLOBAL_FREQ_INPUTS: [PortId; 1] = [PortId::GlobalFrequency];

impl GlobalFrequencyNode {
    pub fn new() -> Self {
        Self {
            out: vec![0.0; MAX_BLOCK_SIZE],
        }
    }
}

impl Default for GlobalFrequencyNode {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for GlobalFrequencyNode {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &GLOBAL_FREQ_INPUTS,
            outputs: &MONO_OUTPUT,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::GlobalFrequency
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let freq = stream(inputs, PortId::GlobalFrequency);
        for i in 0..n {
            self.out[i] = at(freq, i, ctx.frequency);
        }
        if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
            out[..n].copy_from_slice(&self.out[..n]);
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

/// Exposes the voice velocity as a patchable signal source.
pub struct GlobalVelocityNode {
    out: Vec<f32>,
}

static GLOBAL_VEL_INPUTS: [PortId; 1] = [PortId::GlobalVelocity];

impl GlobalVelocityNode {
    pub fn new() -> Self {
        Self {
            out: vec![0.0; MAX_BLOCK_SIZE],
        }
    }
}

impl Default for GlobalVelocityNode {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for GlobalVelocityNode {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &GLOBAL_VEL_INPUTS,
            outputs: &MONO_OUTPUT,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::GlobalVelocity
    }

    fn process_block(
        &mut self,
        n: usize,
        inputs: &InputBuffers,
        outputs: &mut OutputBuffers,
        ctx: &ProcessContext,
    ) {
        let vel = stream(inputs, PortId::GlobalVelocity);
        for i in 0..n {
            self.out[i] = at(vel, i, ctx.velocity);
        }
        if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
            out[..n].copy_from_slice(&self.out[..n]);
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

/// Synthesize the band-limited bank set shared by every analog oscillator
/// at a given sample rate. Built once per engine and shared by all voices.
pub fn default_waveform_banks(sample_rate: f32) -> Arc<HashMap<Waveform, Arc<WavetableBank>>> {
    let mut banks = HashMap::new();
    for waveform in [
        Waveform::Sine,
        Waveform::Triangle,
        Waveform::Saw,
        Waveform::Square,
        Waveform::Custom,
    ] {
        banks.insert(
            waveform,
            Arc::new(WavetableBank::synthesize(waveform, sample_rate)),
        );
    }
    Arc::new(banks)
}
