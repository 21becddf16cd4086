//! End-to-end engine scenarios: host-style block processing over complete
//! patches, exercising the control plane and the audio path together.

use voxgraph::prelude::*;

const SR: f32 = 44100.0;
const BLOCK: usize = 128;

/// Render `blocks` blocks with constant controls, appending the left
/// channel to `sink` and returning the last block's peak.
fn drive(
    engine: &mut Engine,
    gate: f32,
    freq: f32,
    blocks: usize,
    sink: &mut Vec<f32>,
) -> f32 {
    let mut out_l = vec![0.0f32; BLOCK];
    let mut out_r = vec![0.0f32; BLOCK];
    let mut peak = 0.0f32;
    for _ in 0..blocks {
        engine.process_audio(
            &[gate],
            &[freq],
            &[1.0],
            &[1.0],
            &[],
            1.0,
            &mut out_l,
            &mut out_r,
        );
        sink.extend_from_slice(&out_l);
        peak = out_l.iter().fold(0.0, |m, &s| m.max(s.abs()));
    }
    peak
}

/// Signal energy at one frequency via direct projection.
fn energy_at(signal: &[f32], freq: f32, sample_rate: f32) -> f32 {
    let mut re = 0.0f64;
    let mut im = 0.0f64;
    for (i, &s) in signal.iter().enumerate() {
        let phase = std::f64::consts::TAU * freq as f64 * i as f64 / sample_rate as f64;
        re += s as f64 * phase.cos();
        im += s as f64 * phase.sin();
    }
    let norm = 2.0 / signal.len() as f64;
    (((re * norm).powi(2) + (im * norm).powi(2)).sqrt()) as f32
}

fn sine_patch(voices: usize) -> (Engine, String, String) {
    let mut engine = Engine::new(SR);
    engine.init(SR, voices).unwrap();
    let osc = engine.create_analog_oscillator().unwrap();
    let mixer = engine.create_mixer().unwrap();
    engine
        .connect(
            &osc,
            PortId::AudioOutput0,
            &mixer,
            PortId::AudioInput0,
            1.0,
            ModulationMode::Additive,
            ModulationTransformation::None,
        )
        .unwrap();
    (engine, osc, mixer)
}

// ---------------------------------------------------------------------
// Scenario 1: single sine voice
// ---------------------------------------------------------------------

#[test]
fn single_sine_voice() {
    let (mut engine, _, _) = sine_patch(1);

    let mut out_l = vec![0.0f32; BLOCK];
    let mut out_r = vec![0.0f32; BLOCK];
    let mut left = Vec::new();
    let mut right = Vec::new();

    // Ten seconds of held note
    let blocks = (10.0 * SR / BLOCK as f32) as usize;
    for _ in 0..blocks {
        engine.process_audio(
            &[1.0],
            &[440.0],
            &[1.0],
            &[1.0],
            &[],
            1.0,
            &mut out_l,
            &mut out_r,
        );
        left.extend_from_slice(&out_l);
        right.extend_from_slice(&out_r);
    }

    assert_eq!(left.len(), right.len());
    assert_eq!(left, right, "mono sine must be identical on both channels");
    assert!(left.iter().all(|s| s.is_finite()));

    // 440 Hz fundamental at amplitude ~1
    let fundamental = energy_at(&left, 440.0, SR);
    assert!(
        (fundamental - 1.0).abs() < 0.05,
        "440 Hz amplitude was {}",
        fundamental
    );

    // Upward zero crossings count the frequency
    let crossings = left.windows(2).filter(|w| w[0] <= 0.0 && w[1] > 0.0).count();
    let measured_hz = crossings as f32 / 10.0;
    assert!(
        (measured_hz - 440.0).abs() < 5.0,
        "measured {} Hz",
        measured_hz
    );

    // No DC component
    let mean: f64 = left.iter().map(|&s| s as f64).sum::<f64>() / left.len() as f64;
    assert!(mean.abs() < 1e-4, "DC offset was {}", mean);
}

// ---------------------------------------------------------------------
// Scenario 2: envelope gating
// ---------------------------------------------------------------------

#[test]
fn envelope_gating() {
    let (mut engine, _, mixer) = sine_patch(1);
    let env = engine.create_envelope().unwrap();
    engine
        .update_envelope(
            &env,
            EnvelopeParams {
                attack: 0.01,
                decay: 0.1,
                sustain: 0.5,
                release: 0.2,
                ..EnvelopeParams::default()
            },
        )
        .unwrap();
    engine
        .connect(
            &env,
            PortId::EnvelopeMod,
            &mixer,
            PortId::GainMod,
            1.0,
            ModulationMode::Vca,
            ModulationTransformation::None,
        )
        .unwrap();

    // Hold the gate through attack + decay and well into sustain
    let mut held = Vec::new();
    let hold_blocks = (0.5 * SR / BLOCK as f32) as usize;
    let sustain_peak = drive(&mut engine, 1.0, 440.0, hold_blocks, &mut held);

    // Peak output lands during the attack segment
    let attack_window = (0.02 * SR) as usize;
    let early_peak = held[..attack_window]
        .iter()
        .fold(0.0f32, |m, &s| m.max(s.abs()));
    let overall_peak = held.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
    assert!(
        early_peak > overall_peak * 0.95,
        "peak {} should occur during attack (early {})",
        overall_peak,
        early_peak
    );

    // Sustain sits at half the attack peak
    assert!(
        (sustain_peak - 0.5).abs() < 0.05,
        "sustain peak was {}",
        sustain_peak
    );

    // Release: monotonic block peaks, below 1e-4 within the release time
    let mut released = Vec::new();
    let release_blocks = (0.25 * SR / BLOCK as f32) as usize;
    let mut last_block_peak = f32::MAX;
    let mut out_l = vec![0.0f32; BLOCK];
    let mut out_r = vec![0.0f32; BLOCK];
    for _ in 0..release_blocks {
        engine.process_audio(
            &[0.0],
            &[440.0],
            &[1.0],
            &[1.0],
            &[],
            1.0,
            &mut out_l,
            &mut out_r,
        );
        let peak = out_l.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(peak <= last_block_peak + 1e-5, "release must fall monotonically");
        last_block_peak = peak;
        released.extend_from_slice(&out_l);
    }
    assert!(
        last_block_peak < 1e-4,
        "residual after release was {}",
        last_block_peak
    );
}

// ---------------------------------------------------------------------
// Scenario 3: FM sidebands
// ---------------------------------------------------------------------

#[test]
fn fm_produces_sidebands() {
    let mut engine = Engine::new(SR);
    engine.init(SR, 1).unwrap();

    let carrier = engine.create_analog_oscillator().unwrap();
    let modulator = engine.create_analog_oscillator().unwrap();
    let mixer = engine.create_mixer().unwrap();

    engine
        .connect(
            &modulator,
            PortId::AudioOutput0,
            &carrier,
            PortId::PhaseMod,
            std::f32::consts::PI,
            ModulationMode::Additive,
            ModulationTransformation::None,
        )
        .unwrap();
    engine
        .connect(
            &carrier,
            PortId::AudioOutput0,
            &mixer,
            PortId::AudioInput0,
            1.0,
            ModulationMode::Additive,
            ModulationTransformation::None,
        )
        .unwrap();

    // Carrier at 220 Hz; the modulator tracks the 440 Hz voice frequency
    // while the carrier is pinned by its detune an octave down.
    let mut p = AnalogOscillatorParams::default();
    p.detune_cents = -1200.0;
    engine.update_analog_oscillator(&carrier, p).unwrap();

    let mut signal = Vec::new();
    let blocks = (2.0 * SR / BLOCK as f32) as usize;
    drive(&mut engine, 1.0, 440.0, blocks, &mut signal);
    // Skip the parameter-smoothing transient
    let settled = &signal[signal.len() / 2..];

    // Upper sideband at carrier + modulator = 660 Hz
    let sideband = energy_at(settled, 660.0, SR);
    let off_grid = energy_at(settled, 555.0, SR);
    assert!(
        sideband > 0.05,
        "sideband energy at 660 Hz was {}",
        sideband
    );
    assert!(
        sideband > off_grid * 5.0,
        "sideband {} should stand out over {}",
        sideband,
        off_grid
    );
}

// ---------------------------------------------------------------------
// Scenario 4: cycle rejection
// ---------------------------------------------------------------------

#[test]
fn cycle_rejection_leaves_graph_unchanged() {
    let mut engine = Engine::new(SR);
    engine.init(SR, 1).unwrap();
    let osc_a = engine.create_analog_oscillator().unwrap();
    let osc_b = engine.create_analog_oscillator().unwrap();
    engine
        .connect(
            &osc_a,
            PortId::AudioOutput0,
            &osc_b,
            PortId::FrequencyMod,
            0.5,
            ModulationMode::Additive,
            ModulationTransformation::None,
        )
        .unwrap();

    let before = engine.get_current_state();

    // Direct self-loop on a non-feedback port
    assert_eq!(
        engine.connect(
            &osc_a,
            PortId::AudioOutput0,
            &osc_a,
            PortId::FrequencyMod,
            1.0,
            ModulationMode::Additive,
            ModulationTransformation::None,
        ),
        Err(EngineError::CycleWithoutFeedback)
    );

    // Two-node cycle through modulation ports
    assert_eq!(
        engine.connect(
            &osc_b,
            PortId::AudioOutput0,
            &osc_a,
            PortId::FrequencyMod,
            1.0,
            ModulationMode::Additive,
            ModulationTransformation::None,
        ),
        Err(EngineError::CycleWithoutFeedback)
    );

    assert_eq!(engine.get_current_state(), before);
}

// ---------------------------------------------------------------------
// Scenario 5: patch round-trip
// ---------------------------------------------------------------------

#[test]
fn patch_round_trip() {
    let (mut engine, _, mixer) = sine_patch(1);
    let env = engine.create_envelope().unwrap();
    engine
        .update_envelope(
            &env,
            EnvelopeParams {
                attack: 0.01,
                decay: 0.1,
                sustain: 0.5,
                release: 0.2,
                ..EnvelopeParams::default()
            },
        )
        .unwrap();
    engine
        .connect(
            &env,
            PortId::EnvelopeMod,
            &mixer,
            PortId::GainMod,
            1.0,
            ModulationMode::Vca,
            ModulationTransformation::None,
        )
        .unwrap();

    let snapshot = engine.get_current_state();

    // Through JSON, into a fresh engine, and back out
    let json = snapshot.to_json().unwrap();
    let parsed = EngineState::from_json(&json).unwrap();

    let mut fresh = Engine::new(SR);
    fresh.init(SR, 1).unwrap();
    fresh.apply_state(&parsed).unwrap();
    let replayed = fresh.get_current_state();

    assert!(
        snapshot.structurally_equal(&replayed),
        "replayed snapshot diverged:\n{:?}\nvs\n{:?}",
        snapshot,
        replayed
    );
}

// ---------------------------------------------------------------------
// Scenario 6: voice independence
// ---------------------------------------------------------------------

#[test]
fn voice_independence() {
    let render = |other_freqs: [f32; 7]| {
        let (mut engine, _, _) = sine_patch(8);
        let mut gates = [0.0f32; 8];
        gates[0] = 1.0;
        let mut freqs = [0.0f32; 8];
        freqs[0] = 440.0;
        freqs[1..].copy_from_slice(&other_freqs);

        let mut out_l = vec![0.0f32; BLOCK];
        let mut out_r = vec![0.0f32; BLOCK];
        let mut collected = Vec::new();
        for _ in 0..20 {
            engine.process_audio(
                &gates,
                &freqs,
                &[1.0; 8],
                &[1.0; 8],
                &[],
                1.0,
                &mut out_l,
                &mut out_r,
            );
            collected.extend_from_slice(&out_l);
        }
        collected
    };

    let low = render([100.0; 7]);
    let high = render([18_000.0; 7]);
    assert_eq!(low, high, "silent voices' frequencies must not bleed");
}

// ---------------------------------------------------------------------
// Additional cross-cutting checks
// ---------------------------------------------------------------------

#[test]
fn output_always_finite_with_hostile_params() {
    let (mut engine, osc, mixer) = sine_patch(1);

    // Out-of-range values everywhere; updates clamp, output stays finite
    engine
        .update_analog_oscillator(
            &osc,
            AnalogOscillatorParams {
                detune_cents: 1e9,
                unison_voices: 9999,
                spread_cents: -50.0,
                feedback_amount: 100.0,
                gain: f32::INFINITY,
                ..AnalogOscillatorParams::default()
            },
        )
        .unwrap();
    engine
        .update_mixer(
            &mixer,
            MixerParams {
                gain: f32::NAN,
                active: true,
            },
        )
        .unwrap();

    let mut signal = Vec::new();
    drive(&mut engine, 1.0, 440.0, 40, &mut signal);
    assert!(signal.iter().all(|s| s.is_finite()));
}

#[test]
fn effects_chain_processes_voice_output() {
    let (mut engine, _, _) = sine_patch(1);
    let delay = engine.add_effect(NodeKind::Delay).unwrap();
    engine
        .update_delay(
            delay,
            DelayParams {
                time_ms: 50.0,
                feedback: 0.3,
                mix: 0.5,
                ..DelayParams::default()
            },
        )
        .unwrap();
    engine.add_effect(NodeKind::Limiter).unwrap();

    // Play a short note, then listen to the tail
    let mut signal = Vec::new();
    drive(&mut engine, 1.0, 440.0, 10, &mut signal);

    let mut tail = Vec::new();
    drive(&mut engine, 0.0, 440.0, 30, &mut tail);
    let tail_energy: f32 = tail.iter().map(|s| s * s).sum();
    assert!(
        tail_energy > 1e-4,
        "delay must ring after the note stops, got {}",
        tail_energy
    );
}

#[test]
fn block_size_flexibility() {
    let (mut engine, _, _) = sine_patch(1);

    // Anything from one frame to the compile-time maximum is legal
    for n in [1usize, 7, 64, 128, 480, 1024, MAX_BLOCK_SIZE] {
        let mut out_l = vec![0.0f32; n];
        let mut out_r = vec![0.0f32; n];
        engine.process_audio(
            &[1.0],
            &[440.0],
            &[1.0],
            &[1.0],
            &[],
            1.0,
            &mut out_l,
            &mut out_r,
        );
        assert!(out_l.iter().all(|s| s.is_finite()));
    }
}

#[test]
fn arpeggiated_voice_pulses() {
    let mut engine = Engine::new(SR);
    engine.init(SR, 1).unwrap();

    let osc = engine.create_analog_oscillator().unwrap();
    let mixer = engine.create_mixer().unwrap();
    let arp = engine.create_arpeggiator().unwrap();
    let env = engine.create_envelope().unwrap();

    engine
        .update_arpeggiator(
            &arp,
            ArpeggiatorParams {
                mode: ArpMode::Up,
                rate_hz: 20.0,
                gate_length: 0.5,
                octaves: 1,
                active: true,
            },
        )
        .unwrap();
    engine
        .update_envelope(
            &env,
            EnvelopeParams {
                attack: 0.001,
                decay: 0.005,
                sustain: 1.0,
                release: 0.005,
                ..EnvelopeParams::default()
            },
        )
        .unwrap();

    // The arp gate drives the envelope directly: a connected gate port
    // follows its connections, not the voice gate.
    engine
        .connect(
            &arp,
            PortId::ArpGate,
            &env,
            PortId::CombinedGate,
            1.0,
            ModulationMode::Additive,
            ModulationTransformation::None,
        )
        .unwrap();
    engine
        .connect(
            &arp,
            PortId::Frequency,
            &osc,
            PortId::Frequency,
            1.0,
            ModulationMode::Additive,
            ModulationTransformation::None,
        )
        .unwrap();
    engine
        .connect(
            &osc,
            PortId::AudioOutput0,
            &mixer,
            PortId::AudioInput0,
            1.0,
            ModulationMode::Additive,
            ModulationTransformation::None,
        )
        .unwrap();
    engine
        .connect(
            &env,
            PortId::EnvelopeMod,
            &mixer,
            PortId::GainMod,
            1.0,
            ModulationMode::Vca,
            ModulationTransformation::None,
        )
        .unwrap();

    // The combined gate pulses at the arp rate while the key is held.
    let mut signal = Vec::new();
    let blocks = (1.0 * SR / BLOCK as f32) as usize;
    drive(&mut engine, 1.0, 220.0, blocks, &mut signal);

    // Count amplitude dips: at 20 steps/s with 50% gate length, the
    // envelope opens and closes repeatedly.
    let window = (SR / 100.0) as usize;
    let peaks: Vec<f32> = signal
        .chunks(window)
        .map(|c| c.iter().fold(0.0f32, |m, &s| m.max(s.abs())))
        .collect();
    let loud = peaks.iter().filter(|&&p| p > 0.2).count();
    let quiet = peaks.iter().filter(|&&p| p < 0.05).count();
    assert!(loud > 5, "arp must sound, loud windows {}", loud);
    assert!(quiet > 5, "arp must pulse, quiet windows {}", quiet);
}
