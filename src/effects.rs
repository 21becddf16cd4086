//! Stereo Effects and the Global Effects Chain
//!
//! Every effect here is a stereo-in/stereo-out [`AudioNode`] reading
//! `AudioInput0/1` and writing `AudioOutput0/1`, with a `WetDryMix` port
//! resolved against its own mix parameter. The [`EffectsChain`] applies an
//! ordered list of them to the summed voice bus after polyphonic mixing.

use crate::block::MAX_BLOCK_SIZE;
use crate::modulation::scrub_non_finite;
use crate::node::{
    AudioNode, InputBuffers, NodeKind, OutputBuffers, ParamSlot, PortSpec, ProcessContext,
};
use crate::port::PortId;
use crate::wav::generate_impulse_response;
use libm::{expf, fabsf, log10f, powf, sinf};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::f32::consts::TAU;
use std::sync::Arc;

static EFFECT_INPUTS: [PortId; 3] = [
    PortId::AudioInput0,
    PortId::AudioInput1,
    PortId::WetDryMix,
];
static EFFECT_OUTPUTS: [PortId; 2] = [PortId::AudioOutput0, PortId::AudioOutput1];

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

#[inline]
fn wet_dry(dry: f32, wet: f32, mix: f32) -> f32 {
    dry * (1.0 - mix) + wet * mix
}

/// Tiny values in feedback paths are flushed so denormals never stall the
/// audio thread.
#[inline]
fn flush_denormal(x: f32) -> f32 {
    if fabsf(x) < 1e-20 {
        0.0
    } else {
        x
    }
}

fn write_outputs(outputs: &mut OutputBuffers, n: usize, left: &[f32], right: &[f32]) {
    if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
        out[..n].copy_from_slice(&left[..n]);
        scrub_non_finite(&mut out[..n]);
    }
    if let Some(out) = outputs.get_mut(&PortId::AudioOutput1) {
        out[..n].copy_from_slice(&right[..n]);
        scrub_non_finite(&mut out[..n]);
    }
}

fn passthrough(outputs: &mut OutputBuffers, n: usize, left: &[f32], right: &[f32]) {
    if let Some(out) = outputs.get_mut(&PortId::AudioOutput0) {
        for i in 0..n {
            out[i] = at(left, i, 0.0);
        }
    }
    if let Some(out) = outputs.get_mut(&PortId::AudioOutput1) {
        for i in 0..n {
            out[i] = at(right, i, 0.0);
        }
    }
}

/// Fractional delay line with linear interpolation.
#[derive(Debug, Clone)]
struct DelayLine {
    buffer: Vec<f32>,
    pos: usize,
}

impl DelayLine {
    fn new(max_samples: usize) -> Self {
        Self {
            buffer: vec![0.0; max_samples.max(2)],
            pos: 0,
        }
    }

    #[inline]
    fn read(&self, delay_samples: f32) -> f32 {
        let len = self.buffer.len();
        let delay = delay_samples.clamp(1.0, (len - 1) as f32);
        let read_pos = (self.pos as f32 - delay).rem_euclid(len as f32);
        let i0 = read_pos as usize % len;
        let i1 = (i0 + 1) % len;
        let frac = read_pos - read_pos as usize as f32;
        self.buffer[i0] + (self.buffer[i1] - self.buffer[i0]) * frac
    }

    #[inline]
    fn write(&mut self, value: f32) {
        self.buffer[self.pos] = flush_denormal(value);
        self.pos = (self.pos + 1) % self.buffer.len();
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.pos = 0;
    }
}

// ====================================================================
// Delay
// ====================================================================

/// User-visible parameters of [`Delay`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayParams {
    pub time_ms: f32,
    pub feedback: f32,
    pub mix: f32,
    /// Feedback crosses channels for bouncing stereo repeats
    pub ping_pong: bool,
    pub active: bool,
}

impl Default for DelayParams {
    fn default() -> Self {
        Self {
            time_ms: 300.0,
            feedback: 0.4,
            mix: 0.5,
            ping_pong: false,
            active: true,
        }
    }
}

impl DelayParams {
    pub fn sanitize(mut self) -> Self {
        self.time_ms = self.time_ms.clamp(1.0, MAX_DELAY_MS);
        self.feedback = self.feedback.clamp(0.0, 0.95);
        self.mix = self.mix.clamp(0.0, 1.0);
        self
    }
}

const MAX_DELAY_MS: f32 = 2000.0;

/// Stereo feedback delay with optional ping-pong channel crossing.
pub struct Delay {
    params: ParamSlot<DelayParams>,
    sample_rate: f32,
    line_l: DelayLine,
    line_r: DelayLine,
    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

impl Delay {
    pub fn new(sample_rate: f32) -> Self {
        let max_samples = ((MAX_DELAY_MS / 1000.0) * sample_rate) as usize + 2;
        Self {
            params: ParamSlot::new(DelayParams::default()),
            sample_rate,
            line_l: DelayLine::new(max_samples),
            line_r: DelayLine::new(max_samples),
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: DelayParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &DelayParams {
        self.params.get()
    }
}

impl AudioNode for Delay {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &EFFECT_INPUTS,
            outputs: &EFFECT_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Delay
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::WetDryMix => self.params.get().mix,
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
        let left = stream(inputs, PortId::AudioInput0);
        let right = stream(inputs, PortId::AudioInput1);

        if !p.active {
            passthrough(outputs, n, left, right);
            return;
        }

        let mix = stream(inputs, PortId::WetDryMix);
        let delay_samples = (p.time_ms / 1000.0) * self.sample_rate;

        for i in 0..n {
            let in_l = at(left, i, 0.0);
            let in_r = at(right, i, 0.0);
            let m = at(mix, i, p.mix).clamp(0.0, 1.0);

            let delayed_l = self.line_l.read(delay_samples);
            let delayed_r = self.line_r.read(delay_samples);

            if p.ping_pong {
                self.line_l.write(in_l + delayed_r * p.feedback);
                self.line_r.write(in_r + delayed_l * p.feedback);
            } else {
                self.line_l.write(in_l + delayed_l * p.feedback);
                self.line_r.write(in_r + delayed_r * p.feedback);
            }

            self.out_l[i] = wet_dry(in_l, delayed_l, m);
            self.out_r[i] = wet_dry(in_r, delayed_r, m);
        }

        write_outputs(outputs, n, &self.out_l, &self.out_r);
    }

    fn reset(&mut self) {
        self.line_l.clear();
        self.line_r.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Chorus
// ====================================================================

/// User-visible parameters of [`Chorus`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChorusParams {
    pub base_delay_ms: f32,
    pub depth_ms: f32,
    pub rate_hz: f32,
    pub feedback: f32,
    /// One-pole damping in the feedback path, 0 dark .. 1 bright
    pub feedback_brightness: f32,
    /// Phase offset between the channel LFOs, in degrees
    pub stereo_phase_deg: f32,
    pub mix: f32,
    pub active: bool,
}

impl Default for ChorusParams {
    fn default() -> Self {
        Self {
            base_delay_ms: 15.0,
            depth_ms: 5.0,
            rate_hz: 0.8,
            feedback: 0.2,
            feedback_brightness: 0.5,
            stereo_phase_deg: 90.0,
            mix: 0.5,
            active: true,
        }
    }
}

impl ChorusParams {
    pub fn sanitize(mut self) -> Self {
        self.base_delay_ms = self.base_delay_ms.clamp(1.0, 50.0);
        self.depth_ms = self.depth_ms.clamp(0.0, 20.0);
        self.rate_hz = self.rate_hz.clamp(0.01, 10.0);
        self.feedback = self.feedback.clamp(0.0, 0.9);
        self.feedback_brightness = self.feedback_brightness.clamp(0.0, 1.0);
        self.stereo_phase_deg = self.stereo_phase_deg.clamp(0.0, 180.0);
        self.mix = self.mix.clamp(0.0, 1.0);
        self
    }
}

/// Modulated delay chorus with a lowpassed feedback path and a phase
/// offset between the channel LFOs for stereo width.
pub struct Chorus {
    params: ParamSlot<ChorusParams>,
    sample_rate: f32,
    line_l: DelayLine,
    line_r: DelayLine,
    lfo_phase: f32,
    fb_lp_l: f32,
    fb_lp_r: f32,
    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

impl Chorus {
    pub fn new(sample_rate: f32) -> Self {
        // Base + depth tops out at 70 ms
        let max_samples = (0.08 * sample_rate) as usize + 2;
        Self {
            params: ParamSlot::new(ChorusParams::default()),
            sample_rate,
            line_l: DelayLine::new(max_samples),
            line_r: DelayLine::new(max_samples),
            lfo_phase: 0.0,
            fb_lp_l: 0.0,
            fb_lp_r: 0.0,
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: ChorusParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &ChorusParams {
        self.params.get()
    }
}

impl AudioNode for Chorus {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &EFFECT_INPUTS,
            outputs: &EFFECT_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Chorus
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::WetDryMix => self.params.get().mix,
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
        let left = stream(inputs, PortId::AudioInput0);
        let right = stream(inputs, PortId::AudioInput1);

        if !p.active {
            passthrough(outputs, n, left, right);
            return;
        }

        let mix = stream(inputs, PortId::WetDryMix);
        let base = (p.base_delay_ms / 1000.0) * self.sample_rate;
        let depth = (p.depth_ms / 1000.0) * self.sample_rate;
        let phase_offset = p.stereo_phase_deg / 360.0;
        let lfo_step = p.rate_hz / self.sample_rate;
        // Brightness maps to the feedback lowpass coefficient
        let lp_coeff = 0.05 + p.feedback_brightness * 0.9;

        for i in 0..n {
            let in_l = at(left, i, 0.0);
            let in_r = at(right, i, 0.0);
            let m = at(mix, i, p.mix).clamp(0.0, 1.0);

            let lfo_l = sinf(self.lfo_phase * TAU);
            let lfo_r = sinf((self.lfo_phase + phase_offset) * TAU);
            self.lfo_phase = (self.lfo_phase + lfo_step).rem_euclid(1.0);

            let delay_l = base + depth * (lfo_l * 0.5 + 0.5);
            let delay_r = base + depth * (lfo_r * 0.5 + 0.5);

            let wet_l = self.line_l.read(delay_l);
            let wet_r = self.line_r.read(delay_r);

            // Lowpass in the feedback path keeps repeats from whistling
            self.fb_lp_l += lp_coeff * (wet_l - self.fb_lp_l);
            self.fb_lp_r += lp_coeff * (wet_r - self.fb_lp_r);

            self.line_l.write(in_l + self.fb_lp_l * p.feedback);
            self.line_r.write(in_r + self.fb_lp_r * p.feedback);

            self.out_l[i] = wet_dry(in_l, wet_l, m);
            self.out_r[i] = wet_dry(in_r, wet_r, m);
        }

        write_outputs(outputs, n, &self.out_l, &self.out_r);
    }

    fn reset(&mut self) {
        self.line_l.clear();
        self.line_r.clear();
        self.lfo_phase = 0.0;
        self.fb_lp_l = 0.0;
        self.fb_lp_r = 0.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Reverb
// ====================================================================

/// Reverb algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ReverbKind {
    /// Schroeder/Moorer comb-allpass network
    Freeverb = 0,
    /// Convolution with a synthesized hall response
    Hall = 1,
    /// Convolution with a denser, brighter plate response
    Plate = 2,
}

/// User-visible parameters of [`Reverb`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReverbParams {
    pub kind: ReverbKind,
    /// Tail length in seconds (convolution kinds regenerate their response)
    pub decay_seconds: f32,
    /// Room size / diffusion character in 0..1
    pub size: f32,
    /// High-frequency damping in 0..1
    pub damping: f32,
    pub mix: f32,
    pub active: bool,
}

impl Default for ReverbParams {
    fn default() -> Self {
        Self {
            kind: ReverbKind::Freeverb,
            decay_seconds: 2.0,
            size: 0.5,
            damping: 0.5,
            mix: 0.3,
            active: true,
        }
    }
}

impl ReverbParams {
    pub fn sanitize(mut self) -> Self {
        self.decay_seconds = self.decay_seconds.clamp(0.1, 10.0);
        self.size = self.size.clamp(0.0, 1.0);
        self.damping = self.damping.clamp(0.0, 1.0);
        self.mix = self.mix.clamp(0.0, 1.0);
        self
    }
}

/// Classic Freeverb comb filter with damping in the feedback path.
#[derive(Debug, Clone)]
struct FreeverbComb {
    buffer: Vec<f32>,
    pos: usize,
    filter_state: f32,
}

impl FreeverbComb {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            pos: 0,
            filter_state: 0.0,
        }
    }

    #[inline]
    fn tick(&mut self, input: f32, feedback: f32, damp: f32) -> f32 {
        let output = self.buffer[self.pos];
        self.filter_state = flush_denormal(output * (1.0 - damp) + self.filter_state * damp);
        self.buffer[self.pos] = flush_denormal(input + self.filter_state * feedback);
        self.pos = (self.pos + 1) % self.buffer.len();
        output
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.filter_state = 0.0;
        self.pos = 0;
    }
}

#[derive(Debug, Clone)]
struct FreeverbAllpass {
    buffer: Vec<f32>,
    pos: usize,
}

impl FreeverbAllpass {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            pos: 0,
        }
    }

    #[inline]
    fn tick(&mut self, input: f32) -> f32 {
        let buffered = self.buffer[self.pos];
        let output = -input + buffered;
        self.buffer[self.pos] = flush_denormal(input + buffered * 0.5);
        self.pos = (self.pos + 1) % self.buffer.len();
        output
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.pos = 0;
    }
}

// Freeverb tunings at 44.1 kHz; scaled to the engine rate at build time.
const COMB_TUNINGS: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_TUNINGS: [usize; 4] = [556, 441, 341, 225];
const STEREO_SPREAD: usize = 23;

/// Uniform partitioned convolution over a fixed impulse response.
///
/// Input is staged into partition-sized chunks; each chunk is transformed
/// once and multiplied against every stored partition spectrum, so cost is
/// independent of the host block size. Output carries one partition of
/// latency.
struct PartitionedConvolver {
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    partition_len: usize,
    ir_spectra: Vec<Vec<Complex<f32>>>,
    input_spectra: Vec<Vec<Complex<f32>>>,
    history_pos: usize,
    stage_in: Vec<f32>,
    staged: usize,
    overlap: Vec<f32>,
    out_fifo: Vec<f32>,
    out_read: usize,
    scratch: Vec<Complex<f32>>,
    accum: Vec<Complex<f32>>,
}

const PARTITION_LEN: usize = 256;

impl PartitionedConvolver {
    fn new(impulse: &[f32]) -> Self {
        let fft_len = PARTITION_LEN * 2;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_len);
        let ifft = planner.plan_fft_inverse(fft_len);

        let mut ir_spectra = Vec::new();
        for chunk in impulse.chunks(PARTITION_LEN) {
            let mut buf = vec![Complex::new(0.0, 0.0); fft_len];
            for (i, &s) in chunk.iter().enumerate() {
                buf[i] = Complex::new(s, 0.0);
            }
            fft.process(&mut buf);
            ir_spectra.push(buf);
        }
        if ir_spectra.is_empty() {
            ir_spectra.push(vec![Complex::new(0.0, 0.0); fft_len]);
        }

        let partitions = ir_spectra.len();
        Self {
            fft,
            ifft,
            partition_len: PARTITION_LEN,
            input_spectra: vec![vec![Complex::new(0.0, 0.0); fft_len]; partitions],
            ir_spectra,
            history_pos: 0,
            stage_in: vec![0.0; PARTITION_LEN],
            staged: 0,
            overlap: vec![0.0; PARTITION_LEN],
            out_fifo: vec![0.0; PARTITION_LEN],
            out_read: PARTITION_LEN,
            scratch: vec![Complex::new(0.0, 0.0); fft_len],
            accum: vec![Complex::new(0.0, 0.0); fft_len],
        }
    }

    /// Push one input sample, pull one (latency-delayed) output sample.
    #[inline]
    fn tick(&mut self, input: f32) -> f32 {
        self.stage_in[self.staged] = input;
        self.staged += 1;
        if self.staged == self.partition_len {
            self.process_partition();
            self.staged = 0;
            self.out_read = 0;
        }

        if self.out_read < self.out_fifo.len() {
            let v = self.out_fifo[self.out_read];
            self.out_read += 1;
            v
        } else {
            0.0
        }
    }

    fn process_partition(&mut self) {
        let fft_len = self.partition_len * 2;

        // Transform the newest chunk into the history ring
        self.scratch.iter_mut().for_each(|c| *c = Complex::new(0.0, 0.0));
        for (i, &s) in self.stage_in.iter().enumerate() {
            self.scratch[i] = Complex::new(s, 0.0);
        }
        self.fft.process(&mut self.scratch);
        self.history_pos = (self.history_pos + self.ir_spectra.len() - 1) % self.ir_spectra.len();
        self.input_spectra[self.history_pos].copy_from_slice(&self.scratch);

        // Multiply-accumulate every partition against its history slot
        self.accum.iter_mut().for_each(|c| *c = Complex::new(0.0, 0.0));
        for (k, ir) in self.ir_spectra.iter().enumerate() {
            let slot = (self.history_pos + k) % self.ir_spectra.len();
            let hist = &self.input_spectra[slot];
            for i in 0..fft_len {
                self.accum[i] += hist[i] * ir[i];
            }
        }

        self.ifft.process(&mut self.accum);
        let norm = 1.0 / fft_len as f32;

        // First half plus the saved overlap becomes the output chunk
        for i in 0..self.partition_len {
            self.out_fifo[i] = self.accum[i].re * norm + self.overlap[i];
        }
        for i in 0..self.partition_len {
            self.overlap[i] = self.accum[self.partition_len + i].re * norm;
        }
    }

    fn clear(&mut self) {
        for spec in self.input_spectra.iter_mut() {
            spec.iter_mut().for_each(|c| *c = Complex::new(0.0, 0.0));
        }
        self.stage_in.fill(0.0);
        self.staged = 0;
        self.overlap.fill(0.0);
        self.out_fifo.fill(0.0);
        self.out_read = self.out_fifo.len();
    }
}

/// Freeverb, hall and plate reverbs behind one node.
///
/// The convolution kinds synthesize their impulse responses from
/// (decay, size) on the control plane, inside `set_params`; the audio
/// thread only swaps the prebuilt convolvers in at the block boundary,
/// so no response-sized allocation ever lands in the realtime call.
pub struct Reverb {
    params: ParamSlot<ReverbParams>,
    sample_rate: f32,

    combs_l: Vec<FreeverbComb>,
    combs_r: Vec<FreeverbComb>,
    allpasses_l: Vec<FreeverbAllpass>,
    allpasses_r: Vec<FreeverbAllpass>,

    convolver_l: Option<PartitionedConvolver>,
    convolver_r: Option<PartitionedConvolver>,
    pending_convolvers: Option<(PartitionedConvolver, PartitionedConvolver)>,
    ir_stamp: (ReverbKind, f32, f32),

    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

impl Reverb {
    pub fn new(sample_rate: f32) -> Self {
        let scale = sample_rate / 44100.0;
        let combs = |offset: usize| -> Vec<FreeverbComb> {
            COMB_TUNINGS
                .iter()
                .map(|&len| FreeverbComb::new(((len + offset) as f32 * scale) as usize))
                .collect()
        };
        let allpasses = |offset: usize| -> Vec<FreeverbAllpass> {
            ALLPASS_TUNINGS
                .iter()
                .map(|&len| FreeverbAllpass::new(((len + offset) as f32 * scale) as usize))
                .collect()
        };

        Self {
            params: ParamSlot::new(ReverbParams::default()),
            sample_rate,
            combs_l: combs(0),
            combs_r: combs(STEREO_SPREAD),
            allpasses_l: allpasses(0),
            allpasses_r: allpasses(STEREO_SPREAD),
            convolver_l: None,
            convolver_r: None,
            pending_convolvers: None,
            ir_stamp: (ReverbKind::Freeverb, -1.0, -1.0),
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    /// Stage a parameter update. When the change affects a convolution
    /// kind's response, the impulse and its partition spectra are built
    /// here, on the caller's thread, and staged alongside the params.
    pub fn set_params(&mut self, params: ReverbParams) {
        let params = params.sanitize();

        if params.kind != ReverbKind::Freeverb {
            let stamp = (params.kind, params.decay_seconds, params.size);
            if stamp != self.ir_stamp {
                // Plate responses are shorter and denser than halls
                let (decay, size, seed) = match params.kind {
                    ReverbKind::Hall => (params.decay_seconds, params.size, 0x48414c4c),
                    ReverbKind::Plate => (params.decay_seconds * 0.6, params.size * 0.3, 0x504c4154),
                    ReverbKind::Freeverb => unreachable!(),
                };
                let (left, right) = generate_impulse_response(self.sample_rate, decay, size, seed);
                self.pending_convolvers = Some((
                    PartitionedConvolver::new(&left),
                    PartitionedConvolver::new(&right),
                ));
                self.ir_stamp = stamp;
            }
        }

        self.params.set(params);
    }

    pub fn params(&self) -> &ReverbParams {
        self.params.get()
    }

    /// Stage a caller-provided impulse response, overriding the
    /// synthesized one until parameters change again. Swapped in at the
    /// next block boundary like any other staged update.
    pub fn set_impulse_response(&mut self, left: &[f32], right: &[f32]) {
        self.pending_convolvers = Some((
            PartitionedConvolver::new(left),
            PartitionedConvolver::new(right),
        ));
        let p = *self.params.get();
        self.ir_stamp = (p.kind, p.decay_seconds, p.size);
    }
}

impl AudioNode for Reverb {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &EFFECT_INPUTS,
            outputs: &EFFECT_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Reverb
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::WetDryMix => self.params.get().mix,
            _ => crate::node::default_for_port(port, ctx),
        }
    }

    fn commit_params(&mut self) {
        self.params.commit();
        if let Some((left, right)) = self.pending_convolvers.take() {
            self.convolver_l = Some(left);
            self.convolver_r = Some(right);
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
        _ctx: &ProcessContext,
    ) {
        let p = *self.params.get();
        let left = stream(inputs, PortId::AudioInput0);
        let right = stream(inputs, PortId::AudioInput1);

        if !p.active {
            passthrough(outputs, n, left, right);
            return;
        }

        let mix = stream(inputs, PortId::WetDryMix);

        match p.kind {
            ReverbKind::Freeverb => {
                // Feedback grows with both size and decay
                let feedback = 0.7 + 0.28 * (p.size * 0.5 + (p.decay_seconds / 10.0) * 0.5);
                let damp = p.damping * 0.8;
                let input_gain = 0.015;

                for i in 0..n {
                    let in_l = at(left, i, 0.0);
                    let in_r = at(right, i, 0.0);
                    let mono = (in_l + in_r) * input_gain;

                    let mut wet_l = 0.0;
                    for comb in self.combs_l.iter_mut() {
                        wet_l += comb.tick(mono, feedback, damp);
                    }
                    let mut wet_r = 0.0;
                    for comb in self.combs_r.iter_mut() {
                        wet_r += comb.tick(mono, feedback, damp);
                    }
                    for ap in self.allpasses_l.iter_mut() {
                        wet_l = ap.tick(wet_l);
                    }
                    for ap in self.allpasses_r.iter_mut() {
                        wet_r = ap.tick(wet_r);
                    }

                    let m = at(mix, i, p.mix).clamp(0.0, 1.0);
                    self.out_l[i] = wet_dry(in_l, wet_l, m);
                    self.out_r[i] = wet_dry(in_r, wet_r, m);
                }
            }
            ReverbKind::Hall | ReverbKind::Plate => {
                let (Some(conv_l), Some(conv_r)) = (&mut self.convolver_l, &mut self.convolver_r)
                else {
                    passthrough(outputs, n, left, right);
                    return;
                };
                // Keep the convolved tail in the same ballpark as the dry
                // signal
                let wet_gain = 0.25;
                for i in 0..n {
                    let in_l = at(left, i, 0.0);
                    let in_r = at(right, i, 0.0);
                    let wet_l = conv_l.tick(in_l) * wet_gain;
                    let wet_r = conv_r.tick(in_r) * wet_gain;
                    let m = at(mix, i, p.mix).clamp(0.0, 1.0);
                    self.out_l[i] = wet_dry(in_l, wet_l, m);
                    self.out_r[i] = wet_dry(in_r, wet_r, m);
                }
            }
        }

        write_outputs(outputs, n, &self.out_l, &self.out_r);
    }

    fn reset(&mut self) {
        for comb in self.combs_l.iter_mut().chain(self.combs_r.iter_mut()) {
            comb.clear();
        }
        for ap in self
            .allpasses_l
            .iter_mut()
            .chain(self.allpasses_r.iter_mut())
        {
            ap.clear();
        }
        if let Some(conv) = &mut self.convolver_l {
            conv.clear();
        }
        if let Some(conv) = &mut self.convolver_r {
            conv.clear();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Compressor
// ====================================================================

/// Level detector flavor of [`Compressor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum CompressorDetector {
    Peak = 0,
    Rms = 1,
}

/// User-visible parameters of [`Compressor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorParams {
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub makeup_db: f32,
    pub detector: CompressorDetector,
    /// Parallel-compression blend
    pub mix: f32,
    pub active: bool,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -18.0,
            ratio: 4.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            makeup_db: 0.0,
            detector: CompressorDetector::Peak,
            mix: 1.0,
            active: true,
        }
    }
}

impl CompressorParams {
    pub fn sanitize(mut self) -> Self {
        self.threshold_db = self.threshold_db.clamp(-60.0, 0.0);
        self.ratio = self.ratio.clamp(1.0, 20.0);
        self.attack_ms = self.attack_ms.clamp(0.1, 100.0);
        self.release_ms = self.release_ms.clamp(1.0, 1000.0);
        self.makeup_db = self.makeup_db.clamp(0.0, 24.0);
        self.mix = self.mix.clamp(0.0, 1.0);
        self
    }
}

/// Feed-forward compressor with a shared stereo detector.
pub struct Compressor {
    params: ParamSlot<CompressorParams>,
    sample_rate: f32,
    envelope: f32,
    rms_state: f32,
    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

impl Compressor {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            params: ParamSlot::new(CompressorParams::default()),
            sample_rate,
            envelope: 0.0,
            rms_state: 0.0,
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: CompressorParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &CompressorParams {
        self.params.get()
    }
}

impl AudioNode for Compressor {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &EFFECT_INPUTS,
            outputs: &EFFECT_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Compressor
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::WetDryMix => self.params.get().mix,
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
        let left = stream(inputs, PortId::AudioInput0);
        let right = stream(inputs, PortId::AudioInput1);

        if !p.active {
            passthrough(outputs, n, left, right);
            return;
        }

        let mix = stream(inputs, PortId::WetDryMix);
        let attack = expf(-1.0 / (p.attack_ms * 0.001 * self.sample_rate));
        let release = expf(-1.0 / (p.release_ms * 0.001 * self.sample_rate));
        let makeup = powf(10.0, p.makeup_db / 20.0);
        let slope = 1.0 - 1.0 / p.ratio;

        for i in 0..n {
            let in_l = at(left, i, 0.0);
            let in_r = at(right, i, 0.0);

            let level = match p.detector {
                CompressorDetector::Peak => fabsf(in_l).max(fabsf(in_r)),
                CompressorDetector::Rms => {
                    let square = (in_l * in_l + in_r * in_r) * 0.5;
                    // ~10 ms RMS window
                    let coeff = expf(-1.0 / (0.010 * self.sample_rate));
                    self.rms_state = coeff * self.rms_state + (1.0 - coeff) * square;
                    libm::sqrtf(self.rms_state)
                }
            };

            let coeff = if level > self.envelope { attack } else { release };
            self.envelope = flush_denormal(coeff * self.envelope + (1.0 - coeff) * level);

            let env_db = 20.0 * log10f(self.envelope.max(1e-6));
            let over_db = (env_db - p.threshold_db).max(0.0);
            let gain = powf(10.0, -over_db * slope / 20.0) * makeup;

            let m = at(mix, i, p.mix).clamp(0.0, 1.0);
            self.out_l[i] = wet_dry(in_l, in_l * gain, m);
            self.out_r[i] = wet_dry(in_r, in_r * gain, m);
        }

        write_outputs(outputs, n, &self.out_l, &self.out_r);
    }

    fn reset(&mut self) {
        self.envelope = 0.0;
        self.rms_state = 0.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Saturation
// ====================================================================

/// User-visible parameters of [`Saturation`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SaturationParams {
    pub drive: f32,
    pub mix: f32,
    pub active: bool,
}

impl Default for SaturationParams {
    fn default() -> Self {
        Self {
            drive: 1.0,
            mix: 1.0,
            active: true,
        }
    }
}

impl SaturationParams {
    pub fn sanitize(mut self) -> Self {
        self.drive = self.drive.clamp(0.0, 10.0);
        self.mix = self.mix.clamp(0.0, 1.0);
        self
    }
}

/// Normalized tanh waveshaper: unity-level input stays at unity level
/// regardless of drive, so drive changes color rather than loudness.
pub struct Saturation {
    params: ParamSlot<SaturationParams>,
    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

impl Saturation {
    pub fn new() -> Self {
        Self {
            params: ParamSlot::new(SaturationParams::default()),
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: SaturationParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &SaturationParams {
        self.params.get()
    }
}

impl Default for Saturation {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for Saturation {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &EFFECT_INPUTS,
            outputs: &EFFECT_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Saturation
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::WetDryMix => self.params.get().mix,
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
        let left = stream(inputs, PortId::AudioInput0);
        let right = stream(inputs, PortId::AudioInput1);

        if !p.active {
            passthrough(outputs, n, left, right);
            return;
        }

        let mix = stream(inputs, PortId::WetDryMix);
        let pre = 1.0 + p.drive;
        let norm = 1.0 / libm::tanhf(pre);

        for i in 0..n {
            let in_l = at(left, i, 0.0);
            let in_r = at(right, i, 0.0);
            let m = at(mix, i, p.mix).clamp(0.0, 1.0);
            self.out_l[i] = wet_dry(in_l, libm::tanhf(in_l * pre) * norm, m);
            self.out_r[i] = wet_dry(in_r, libm::tanhf(in_r * pre) * norm, m);
        }

        write_outputs(outputs, n, &self.out_l, &self.out_r);
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
// Bitcrusher
// ====================================================================

/// User-visible parameters of [`Bitcrusher`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BitcrusherParams {
    pub bit_depth: u32,
    /// Hold every sample for this many frames
    pub downsample: u32,
    pub mix: f32,
    pub active: bool,
}

impl Default for BitcrusherParams {
    fn default() -> Self {
        Self {
            bit_depth: 8,
            downsample: 1,
            mix: 1.0,
            active: true,
        }
    }
}

impl BitcrusherParams {
    pub fn sanitize(mut self) -> Self {
        self.bit_depth = self.bit_depth.clamp(1, 16);
        self.downsample = self.downsample.clamp(1, 64);
        self.mix = self.mix.clamp(0.0, 1.0);
        self
    }
}

/// Quantizes amplitude to a bit depth and holds samples for a rate-reduce
/// effect.
pub struct Bitcrusher {
    params: ParamSlot<BitcrusherParams>,
    hold_counter: u32,
    held_l: f32,
    held_r: f32,
    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

impl Bitcrusher {
    pub fn new() -> Self {
        Self {
            params: ParamSlot::new(BitcrusherParams::default()),
            hold_counter: 0,
            held_l: 0.0,
            held_r: 0.0,
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: BitcrusherParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &BitcrusherParams {
        self.params.get()
    }
}

impl Default for Bitcrusher {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for Bitcrusher {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &EFFECT_INPUTS,
            outputs: &EFFECT_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Bitcrusher
    }

    fn input_default(&self, port: PortId, ctx: &ProcessContext) -> f32 {
        match port {
            PortId::WetDryMix => self.params.get().mix,
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
        let left = stream(inputs, PortId::AudioInput0);
        let right = stream(inputs, PortId::AudioInput1);

        if !p.active {
            passthrough(outputs, n, left, right);
            return;
        }

        let mix = stream(inputs, PortId::WetDryMix);
        let levels = powf(2.0, p.bit_depth as f32 - 1.0);

        for i in 0..n {
            let in_l = at(left, i, 0.0);
            let in_r = at(right, i, 0.0);

            if self.hold_counter == 0 {
                self.held_l = libm::roundf(in_l * levels) / levels;
                self.held_r = libm::roundf(in_r * levels) / levels;
            }
            self.hold_counter = (self.hold_counter + 1) % p.downsample;

            let m = at(mix, i, p.mix).clamp(0.0, 1.0);
            self.out_l[i] = wet_dry(in_l, self.held_l, m);
            self.out_r[i] = wet_dry(in_r, self.held_r, m);
        }

        write_outputs(outputs, n, &self.out_l, &self.out_r);
    }

    fn reset(&mut self) {
        self.hold_counter = 0;
        self.held_l = 0.0;
        self.held_r = 0.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Limiter
// ====================================================================

/// User-visible parameters of [`Limiter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimiterParams {
    pub release_ms: f32,
    pub active: bool,
}

impl Default for LimiterParams {
    fn default() -> Self {
        Self {
            release_ms: 80.0,
            active: true,
        }
    }
}

impl LimiterParams {
    pub fn sanitize(mut self) -> Self {
        self.release_ms = self.release_ms.clamp(10.0, 1000.0);
        self
    }
}

const LIMITER_CEILING: f32 = 0.985;
const LIMITER_LOOKAHEAD_MS: f32 = 5.0;

/// Lookahead peak limiter with a fixed ceiling. Gain reduction is
/// computed from the incoming peak and applied to the delayed signal, so
/// transients never overshoot.
pub struct Limiter {
    params: ParamSlot<LimiterParams>,
    sample_rate: f32,
    lookahead: usize,
    line_l: DelayLine,
    line_r: DelayLine,
    envelope: f32,
    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

impl Limiter {
    pub fn new(sample_rate: f32) -> Self {
        let lookahead = ((LIMITER_LOOKAHEAD_MS / 1000.0) * sample_rate) as usize + 1;
        Self {
            params: ParamSlot::new(LimiterParams::default()),
            sample_rate,
            lookahead,
            line_l: DelayLine::new(lookahead + 2),
            line_r: DelayLine::new(lookahead + 2),
            envelope: 0.0,
            out_l: vec![0.0; MAX_BLOCK_SIZE],
            out_r: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    pub fn set_params(&mut self, params: LimiterParams) {
        self.params.set(params.sanitize());
    }

    pub fn params(&self) -> &LimiterParams {
        self.params.get()
    }
}

impl AudioNode for Limiter {
    fn port_spec(&self) -> PortSpec {
        PortSpec {
            inputs: &EFFECT_INPUTS,
            outputs: &EFFECT_OUTPUTS,
        }
    }

    fn node_kind(&self) -> NodeKind {
        NodeKind::Limiter
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
        let left = stream(inputs, PortId::AudioInput0);
        let right = stream(inputs, PortId::AudioInput1);

        if !p.active {
            passthrough(outputs, n, left, right);
            return;
        }

        let release = expf(-1.0 / (p.release_ms * 0.001 * self.sample_rate));
        let lookahead = self.lookahead as f32;

        for i in 0..n {
            let in_l = at(left, i, 0.0);
            let in_r = at(right, i, 0.0);

            // Peak envelope: instant attack, exponential release
            let peak = fabsf(in_l).max(fabsf(in_r));
            self.envelope = flush_denormal(peak.max(self.envelope * release));

            let gain = if self.envelope > LIMITER_CEILING {
                LIMITER_CEILING / self.envelope
            } else {
                1.0
            };

            self.line_l.write(in_l);
            self.line_r.write(in_r);

            self.out_l[i] = self.line_l.read(lookahead) * gain;
            self.out_r[i] = self.line_r.read(lookahead) * gain;
        }

        write_outputs(outputs, n, &self.out_l, &self.out_r);
    }

    fn reset(&mut self) {
        self.line_l.clear();
        self.line_r.clear();
        self.envelope = 0.0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ====================================================================
// Effects chain
// ====================================================================

/// Ordered list of stereo effects applied to the summed voice bus.
///
/// The chain owns its nodes; callers address them by index. Processing
/// runs each effect in order through a pair of scratch buffers, in place
/// over the bus.
pub struct EffectsChain {
    effects: Vec<Box<dyn AudioNode>>,
    scratch_l: Vec<f32>,
    scratch_r: Vec<f32>,
    mix_scratch: Vec<f32>,
}

impl EffectsChain {
    pub fn new() -> Self {
        Self {
            effects: Vec::new(),
            scratch_l: vec![0.0; MAX_BLOCK_SIZE],
            scratch_r: vec![0.0; MAX_BLOCK_SIZE],
            mix_scratch: vec![0.0; MAX_BLOCK_SIZE],
        }
    }

    /// Append an effect, returning its index in the chain.
    pub fn add(&mut self, effect: Box<dyn AudioNode>) -> usize {
        debug_assert!(effect.node_kind().is_effect());
        self.effects.push(effect);
        self.effects.len() - 1
    }

    /// Remove the effect at `index`. Later effects shift down.
    pub fn remove(&mut self, index: usize) -> bool {
        if index < self.effects.len() {
            self.effects.remove(index);
            true
        } else {
            false
        }
    }

    /// Move an effect to a new position, shifting the ones between.
    pub fn reorder(&mut self, from: usize, to: usize) -> bool {
        if from >= self.effects.len() || to >= self.effects.len() {
            return false;
        }
        let effect = self.effects.remove(from);
        self.effects.insert(to, effect);
        true
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn AudioNode> {
        self.effects.get(index).map(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Box<dyn AudioNode>> {
        self.effects.get_mut(index)
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        self.effects.iter().map(|e| e.node_kind()).collect()
    }

    /// Swap staged parameters on every effect. Called between blocks.
    pub fn commit_params(&mut self) {
        for effect in self.effects.iter_mut() {
            effect.commit_params();
        }
    }

    pub fn reset(&mut self) {
        for effect in self.effects.iter_mut() {
            effect.reset();
        }
    }

    /// Run the bus through every effect in order, in place.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32], n: usize, ctx: &ProcessContext) {
        for effect in self.effects.iter_mut() {
            let mix_default = effect.input_default(PortId::WetDryMix, ctx);
            self.mix_scratch[..n].fill(mix_default);

            let mut inputs: InputBuffers = InputBuffers::new();
            inputs.insert(PortId::AudioInput0, &left[..n]);
            inputs.insert(PortId::AudioInput1, &right[..n]);
            inputs.insert(PortId::WetDryMix, &self.mix_scratch[..n]);

            let mut outputs: OutputBuffers = OutputBuffers::new();
            outputs.insert(PortId::AudioOutput0, &mut self.scratch_l[..n]);
            outputs.insert(PortId::AudioOutput1, &mut self.scratch_r[..n]);

            effect.process_block(n, &inputs, &mut outputs, ctx);

            left[..n].copy_from_slice(&self.scratch_l[..n]);
            right[..n].copy_from_slice(&self.scratch_r[..n]);
        }
    }
}

impl Default for EffectsChain {
    fn default() -> Self {
        Self::new()
    }
}
