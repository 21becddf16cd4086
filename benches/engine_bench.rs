//! Block-processing benchmarks: a realtime block at 44.1 kHz must finish
//! well inside its 2.9 ms deadline.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use voxgraph::prelude::*;

const SR: f32 = 44100.0;
const BLOCK: usize = 128;

fn subtractive_patch(voices: usize) -> Engine {
    let mut engine = Engine::new(SR);
    engine.init(SR, voices).unwrap();

    let osc = engine.create_analog_oscillator().unwrap();
    let filter = engine.create_filter().unwrap();
    let env = engine.create_envelope().unwrap();
    let lfo = engine.create_lfo().unwrap();
    let mixer = engine.create_mixer().unwrap();

    engine
        .connect(
            &osc,
            PortId::AudioOutput0,
            &filter,
            PortId::AudioInput0,
            1.0,
            ModulationMode::Additive,
            ModulationTransformation::None,
        )
        .unwrap();
    engine
        .connect(
            &lfo,
            PortId::AudioOutput0,
            &filter,
            PortId::CutoffMod,
            500.0,
            ModulationMode::Additive,
            ModulationTransformation::None,
        )
        .unwrap();
    engine
        .connect(
            &filter,
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

    engine
}

fn bench_process_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_audio");

    for voices in [1usize, 4, 8] {
        let mut engine = subtractive_patch(voices);
        let gates = vec![1.0f32; voices];
        let freqs: Vec<f32> = (0..voices).map(|i| 220.0 * (i + 1) as f32).collect();
        let gains = vec![1.0f32; voices];
        let vels = vec![1.0f32; voices];
        let mut out_l = vec![0.0f32; BLOCK];
        let mut out_r = vec![0.0f32; BLOCK];

        group.bench_function(format!("{}_voices", voices), |b| {
            b.iter(|| {
                engine.process_audio(
                    black_box(&gates),
                    black_box(&freqs),
                    &gains,
                    &vels,
                    &[],
                    1.0,
                    &mut out_l,
                    &mut out_r,
                );
                black_box(out_l[0])
            })
        });
    }

    group.finish();
}

fn bench_effects_chain(c: &mut Criterion) {
    let mut engine = subtractive_patch(4);
    engine.add_effect(NodeKind::Delay).unwrap();
    engine.add_effect(NodeKind::Reverb).unwrap();
    engine.add_effect(NodeKind::Limiter).unwrap();

    let gates = vec![1.0f32; 4];
    let freqs = vec![220.0f32, 330.0, 440.0, 550.0];
    let gains = vec![1.0f32; 4];
    let vels = vec![1.0f32; 4];
    let mut out_l = vec![0.0f32; BLOCK];
    let mut out_r = vec![0.0f32; BLOCK];

    c.bench_function("process_audio_with_effects", |b| {
        b.iter(|| {
            engine.process_audio(
                black_box(&gates),
                black_box(&freqs),
                &gains,
                &vels,
                &[],
                1.0,
                &mut out_l,
                &mut out_r,
            );
            black_box(out_l[0])
        })
    });
}

criterion_group!(benches, bench_process_block, bench_effects_chain);
criterion_main!(benches);
