//! WasmEngine - worklet-facing interface over [`crate::engine::Engine`]
//!
//! String and numeric codes cross the JS boundary; the typed enums stay on
//! the Rust side. Every fallible operation maps its [`EngineError`] into a
//! `JsValue` message.

use crate::engine::{Engine, EngineError};
use crate::node::NodeKind;
use crate::port::{ModulationMode, ModulationTransformation, PortId};
use wasm_bindgen::prelude::*;

fn js_err(e: EngineError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn parse_port(code: u32) -> Result<PortId, JsValue> {
    PortId::from_code(code).ok_or_else(|| JsValue::from_str("unknown port code"))
}

fn parse_mode(code: u32) -> Result<ModulationMode, JsValue> {
    ModulationMode::from_code(code).ok_or_else(|| JsValue::from_str("unknown modulation mode"))
}

fn parse_transformation(code: u32) -> Result<ModulationTransformation, JsValue> {
    ModulationTransformation::from_code(code)
        .ok_or_else(|| JsValue::from_str("unknown modulation transformation"))
}

/// Worklet-facing engine handle.
#[wasm_bindgen]
pub struct WasmEngine {
    inner: Engine,
}

#[wasm_bindgen]
impl WasmEngine {
    #[wasm_bindgen(constructor)]
    pub fn new(sample_rate: f32) -> Self {
        console_error_panic_hook::set_once();
        Self {
            inner: Engine::new(sample_rate),
        }
    }

    pub fn init(&mut self, sample_rate: f32, num_voices: usize) -> Result<(), JsValue> {
        self.inner.init(sample_rate, num_voices).map_err(js_err)
    }

    /// Create a node by kind name (e.g. "analog_oscillator", "envelope").
    pub fn create_node(&mut self, kind: &str) -> Result<String, JsValue> {
        let kind = match kind {
            "analog_oscillator" => NodeKind::AnalogOscillator,
            "wavetable_oscillator" => NodeKind::WavetableOscillator,
            "sampler" => NodeKind::Sampler,
            "noise" => NodeKind::Noise,
            "filter" => NodeKind::Filter,
            "mixer" => NodeKind::Mixer,
            "gate_mixer" => NodeKind::GateMixer,
            "envelope" => NodeKind::Envelope,
            "lfo" => NodeKind::Lfo,
            "glide" => NodeKind::Glide,
            "velocity" => NodeKind::Velocity,
            "global_frequency" => NodeKind::GlobalFrequency,
            "global_velocity" => NodeKind::GlobalVelocity,
            "arpeggiator" => NodeKind::Arpeggiator,
            other => return Err(JsValue::from_str(&format!("unknown node kind: {}", other))),
        };
        self.inner.create_node(kind).map_err(js_err)
    }

    pub fn delete_node(&mut self, id: &str) -> Result<(), JsValue> {
        self.inner.delete_node(id).map_err(js_err)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn connect_nodes(
        &mut self,
        from: &str,
        from_port: u32,
        to: &str,
        to_port: u32,
        amount: f32,
        mode: u32,
        transformation: u32,
    ) -> Result<(), JsValue> {
        self.inner
            .connect(
                from,
                parse_port(from_port)?,
                to,
                parse_port(to_port)?,
                amount,
                parse_mode(mode)?,
                parse_transformation(transformation)?,
            )
            .map_err(js_err)
    }

    pub fn remove_connection(
        &mut self,
        from: &str,
        from_port: u32,
        to: &str,
        to_port: u32,
    ) -> Result<(), JsValue> {
        self.inner
            .remove_connection(from, parse_port(from_port)?, to, parse_port(to_port)?)
            .map_err(js_err)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn connect_macro(
        &mut self,
        voice_index: usize,
        macro_index: usize,
        target: &str,
        target_port: u32,
        amount: f32,
        mode: u32,
        transformation: u32,
    ) -> Result<(), JsValue> {
        self.inner
            .connect_macro(
                voice_index,
                macro_index,
                target,
                parse_port(target_port)?,
                amount,
                Some(parse_mode(mode)?),
                parse_transformation(transformation)?,
            )
            .map_err(js_err)
    }

    pub fn import_sample(&mut self, id: &str, wav_bytes: &[u8]) -> Result<usize, JsValue> {
        self.inner
            .import_sample(id, wav_bytes)
            .map(|info| info.frames)
            .map_err(js_err)
    }

    pub fn import_wavetable(
        &mut self,
        id: &str,
        wav_bytes: &[u8],
        base_size: usize,
    ) -> Result<(), JsValue> {
        self.inner
            .import_wavetable(id, wav_bytes, base_size)
            .map_err(js_err)
    }

    /// Render one block into the worklet's output channels.
    #[allow(clippy::too_many_arguments)]
    pub fn process_audio(
        &mut self,
        gates: &[f32],
        frequencies: &[f32],
        gains: &[f32],
        velocities: &[f32],
        macros: &[f32],
        master_gain: f32,
        output_left: &mut [f32],
        output_right: &mut [f32],
    ) {
        self.inner.process_audio(
            gates,
            frequencies,
            gains,
            velocities,
            macros,
            master_gain,
            output_left,
            output_right,
        );
    }

    /// Canonical-graph snapshot as a structured JS object.
    pub fn get_current_state(&self) -> Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(&self.inner.get_current_state())
            .map_err(|e| JsValue::from_str(&e.to_string()))
    }

    pub fn get_cpu_usage(&self) -> f32 {
        self.inner.get_cpu_usage()
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }
}
