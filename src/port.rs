//! Port Roles and Modulation Combination
//!
//! This module defines the closed set of semantic port identifiers that nodes
//! expose, the modulation modes that govern how incoming connections combine
//! into a destination port, and the unary transformations applied to a source
//! signal before combination.
//!
//! The numeric codes on every enum here cross the host boundary and are part
//! of the persisted snapshot format; they must never be reordered.

use serde::{Deserialize, Serialize};

/// Semantic identifier for a connection point on a node.
///
/// Ports are typed by role, not by direction: whether a given port is an
/// input or an output is declared per node kind (see
/// [`crate::node::AudioNode::ports`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum PortId {
    /// Signal-rate audio inputs
    AudioInput0 = 0,
    AudioInput1 = 1,
    AudioInput2 = 2,
    AudioInput3 = 3,

    /// Signal-rate audio outputs
    AudioOutput0 = 4,
    AudioOutput1 = 5,
    AudioOutput2 = 6,
    AudioOutput3 = 7,

    /// Per-voice gate supplied by the host (0/1, threshold 0.5)
    GlobalGate = 8,
    /// Per-voice base frequency in Hz supplied by the host
    GlobalFrequency = 9,
    /// Per-voice velocity in 0..1 supplied by the host
    GlobalVelocity = 10,

    /// Direct frequency input in Hz (overrides the global when connected)
    Frequency = 11,
    /// Frequency ratio modulation (1.0 = unchanged)
    FrequencyMod = 12,
    /// Phase offset in radians added before wrap
    PhaseMod = 13,
    /// Phase-modulation index scaling
    ModIndex = 14,
    /// Filter cutoff modulation
    CutoffMod = 15,
    /// Filter resonance modulation
    ResonanceMod = 16,
    /// Amplitude modulation
    GainMod = 17,
    /// Envelope output level
    EnvelopeMod = 18,
    /// Stereo pan position modulation
    StereoPan = 19,
    /// Oscillator feedback amount modulation
    FeedbackMod = 20,
    /// Detune modulation in cents
    DetuneMod = 21,
    /// Wavetable morph position in 0..1
    WavetableIndex = 22,
    /// Effect wet/dry balance modulation
    WetDryMix = 23,
    /// Envelope attack time modulation
    AttackMod = 24,

    /// Gate stream emitted by an arpeggiator generator
    ArpGate = 25,
    /// Gate derived from the keyboard gate OR the arpeggiator gate
    CombinedGate = 26,
}

/// Interpretation of the signal a port carries, used for connection
/// validation and for choosing accumulator defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortRole {
    /// Full-range audio-rate signal
    Audio,
    /// 0/1 control, rising/falling edges are meaningful
    Gate,
    /// Absolute frequency in Hz
    Frequency,
    /// Modulator swinging symmetrically around zero
    BipolarModulator,
    /// Modulator in 0..1
    UnipolarModulator,
}

impl PortId {
    /// Every port identifier, in code order.
    pub const ALL: [PortId; 27] = [
        PortId::AudioInput0,
        PortId::AudioInput1,
        PortId::AudioInput2,
        PortId::AudioInput3,
        PortId::AudioOutput0,
        PortId::AudioOutput1,
        PortId::AudioOutput2,
        PortId::AudioOutput3,
        PortId::GlobalGate,
        PortId::GlobalFrequency,
        PortId::GlobalVelocity,
        PortId::Frequency,
        PortId::FrequencyMod,
        PortId::PhaseMod,
        PortId::ModIndex,
        PortId::CutoffMod,
        PortId::ResonanceMod,
        PortId::GainMod,
        PortId::EnvelopeMod,
        PortId::StereoPan,
        PortId::FeedbackMod,
        PortId::DetuneMod,
        PortId::WavetableIndex,
        PortId::WetDryMix,
        PortId::AttackMod,
        PortId::ArpGate,
        PortId::CombinedGate,
    ];

    /// Stable numeric code for the host boundary.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Parse a numeric code back into a port identifier.
    pub fn from_code(code: u32) -> Option<PortId> {
        PortId::ALL.iter().copied().find(|p| p.code() == code)
    }

    /// The role of the signal this port carries.
    pub fn role(self) -> PortRole {
        use PortId::*;
        match self {
            AudioInput0 | AudioInput1 | AudioInput2 | AudioInput3 | AudioOutput0
            | AudioOutput1 | AudioOutput2 | AudioOutput3 => PortRole::Audio,
            GlobalGate | ArpGate | CombinedGate => PortRole::Gate,
            GlobalFrequency | Frequency => PortRole::Frequency,
            PhaseMod | FrequencyMod | DetuneMod | StereoPan | FeedbackMod => {
                PortRole::BipolarModulator
            }
            GlobalVelocity | ModIndex | CutoffMod | ResonanceMod | GainMod | EnvelopeMod
            | WavetableIndex | WetDryMix | AttackMod => PortRole::UnipolarModulator,
        }
    }

    pub fn is_audio_input(self) -> bool {
        matches!(
            self,
            PortId::AudioInput0 | PortId::AudioInput1 | PortId::AudioInput2 | PortId::AudioInput3
        )
    }

    pub fn is_audio_output(self) -> bool {
        matches!(
            self,
            PortId::AudioOutput0
                | PortId::AudioOutput1
                | PortId::AudioOutput2
                | PortId::AudioOutput3
        )
    }

    /// Ports seeded by the voice manager rather than by connections.
    pub fn is_global_input(self) -> bool {
        matches!(
            self,
            PortId::GlobalGate | PortId::GlobalFrequency | PortId::GlobalVelocity
        )
    }

    /// Whether the port accepts modulation-style connections (anything that
    /// is not a pure audio or global port).
    pub fn is_modulation_input(self) -> bool {
        !self.is_audio_input() && !self.is_audio_output() && !self.is_global_input()
    }

    pub fn is_gate(self) -> bool {
        self.role() == PortRole::Gate
    }
}

impl PortRole {
    /// Whether a source of role `src` may feed a destination of role `dest`.
    ///
    /// Gates only accept gates; everything else accepts any non-gate
    /// source (audio-rate modulation of any parameter is legitimate).
    pub fn accepts(dest: PortRole, src: PortRole) -> bool {
        match dest {
            PortRole::Gate => src == PortRole::Gate,
            _ => src != PortRole::Gate,
        }
    }
}

/// How an incoming connection combines into its destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ModulationMode {
    /// Multiplicative: `acc *= (1 - amount) + amount * signal`.
    /// Amount 0 is pass-through, amount 1 is full amplitude control.
    Vca = 0,
    /// Additive, recentered so a 0..1 modulator swings symmetrically:
    /// `acc += signal * amount * 2 - amount`.
    Bipolar = 1,
    /// Plain additive: `acc += signal * amount`.
    Additive = 2,
}

impl ModulationMode {
    /// Stable numeric code for the host boundary.
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<ModulationMode> {
        match code {
            0 => Some(ModulationMode::Vca),
            1 => Some(ModulationMode::Bipolar),
            2 => Some(ModulationMode::Additive),
            _ => None,
        }
    }

    /// Identity value of the accumulator this mode writes into.
    pub fn accumulator_init(self) -> f32 {
        match self {
            ModulationMode::Vca => 1.0,
            ModulationMode::Bipolar | ModulationMode::Additive => 0.0,
        }
    }

    /// Whether this mode combines multiplicatively (into the mult
    /// accumulator) rather than additively.
    pub fn is_multiplicative(self) -> bool {
        matches!(self, ModulationMode::Vca)
    }
}

/// Fold one transformed source sample into an accumulator.
///
/// For [`ModulationMode::Vca`] the accumulator must start at 1.0, for the
/// additive modes at 0.0. Each mode's per-connection contribution commutes,
/// so the final accumulator is independent of connection order.
#[inline(always)]
pub fn modulation_combine(mode: ModulationMode, acc: f32, sample: f32, amount: f32) -> f32 {
    match mode {
        ModulationMode::Vca => acc * ((1.0 - amount) + amount * sample),
        ModulationMode::Bipolar => acc + sample * amount * 2.0 - amount,
        ModulationMode::Additive => acc + sample * amount,
    }
}

/// Elementwise transformation applied to a source signal before it is
/// combined into the destination accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ModulationTransformation {
    None = 0,
    Invert = 1,
    Square = 2,
    Cube = 3,
}

impl ModulationTransformation {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<ModulationTransformation> {
        match code {
            0 => Some(ModulationTransformation::None),
            1 => Some(ModulationTransformation::Invert),
            2 => Some(ModulationTransformation::Square),
            3 => Some(ModulationTransformation::Cube),
            _ => None,
        }
    }

    /// Apply the transformation to one sample.
    #[inline(always)]
    pub fn apply(self, sample: f32) -> f32 {
        match self {
            ModulationTransformation::None => sample,
            ModulationTransformation::Invert => -sample,
            ModulationTransformation::Square => sample * sample,
            ModulationTransformation::Cube => sample * sample * sample,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_codes_are_stable() {
        assert_eq!(PortId::AudioInput0.code(), 0);
        assert_eq!(PortId::AudioOutput0.code(), 4);
        assert_eq!(PortId::GlobalGate.code(), 8);
        assert_eq!(PortId::Frequency.code(), 11);
        assert_eq!(PortId::AttackMod.code(), 24);
        assert_eq!(PortId::CombinedGate.code(), 26);
    }

    #[test]
    fn test_port_code_round_trip() {
        for port in PortId::ALL {
            assert_eq!(PortId::from_code(port.code()), Some(port));
        }
        assert_eq!(PortId::from_code(27), None);
        assert_eq!(PortId::from_code(u32::MAX), None);
    }

    #[test]
    fn test_port_roles() {
        assert_eq!(PortId::AudioInput2.role(), PortRole::Audio);
        assert_eq!(PortId::GlobalGate.role(), PortRole::Gate);
        assert_eq!(PortId::ArpGate.role(), PortRole::Gate);
        assert_eq!(PortId::Frequency.role(), PortRole::Frequency);
        assert_eq!(PortId::PhaseMod.role(), PortRole::BipolarModulator);
        assert_eq!(PortId::GainMod.role(), PortRole::UnipolarModulator);
    }

    #[test]
    fn test_gate_ports_reject_audio() {
        assert!(!PortRole::accepts(PortRole::Gate, PortRole::Audio));
        assert!(PortRole::accepts(PortRole::Gate, PortRole::Gate));
        assert!(PortRole::accepts(PortRole::Audio, PortRole::Audio));
        assert!(PortRole::accepts(
            PortRole::UnipolarModulator,
            PortRole::Audio
        ));
        assert!(!PortRole::accepts(PortRole::Audio, PortRole::Gate));
    }

    #[test]
    fn test_port_classification() {
        assert!(PortId::AudioInput0.is_audio_input());
        assert!(!PortId::AudioInput0.is_audio_output());
        assert!(PortId::AudioOutput3.is_audio_output());
        assert!(PortId::GlobalFrequency.is_global_input());
        assert!(PortId::CutoffMod.is_modulation_input());
        assert!(!PortId::AudioOutput0.is_modulation_input());
        assert!(PortId::CombinedGate.is_gate());
    }

    #[test]
    fn test_additive_combine() {
        let acc = ModulationMode::Additive.accumulator_init();
        let acc = modulation_combine(ModulationMode::Additive, acc, 0.5, 2.0);
        assert!((acc - 1.0).abs() < 1e-6);

        // Amount zero contributes exactly nothing.
        let acc = modulation_combine(ModulationMode::Additive, acc, 123.0, 0.0);
        assert!((acc - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bipolar_combine_is_symmetric() {
        // A 0..1 modulator maps to -amount..+amount around zero.
        let lo = modulation_combine(ModulationMode::Bipolar, 0.0, 0.0, 0.5);
        let mid = modulation_combine(ModulationMode::Bipolar, 0.0, 0.5, 0.5);
        let hi = modulation_combine(ModulationMode::Bipolar, 0.0, 1.0, 0.5);
        assert!((lo + 0.5).abs() < 1e-6);
        assert!(mid.abs() < 1e-6);
        assert!((hi - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_vca_combine() {
        let acc = ModulationMode::Vca.accumulator_init();
        assert_eq!(acc, 1.0);

        // Amount 0 is pass-through regardless of the signal.
        let acc0 = modulation_combine(ModulationMode::Vca, acc, 0.0, 0.0);
        assert!((acc0 - 1.0).abs() < 1e-6);

        // Amount 1 is full amplitude control.
        let acc1 = modulation_combine(ModulationMode::Vca, acc, 0.25, 1.0);
        assert!((acc1 - 0.25).abs() < 1e-6);

        // Half amount sits halfway between unity and the signal.
        let acc_half = modulation_combine(ModulationMode::Vca, acc, 0.0, 0.5);
        assert!((acc_half - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_vca_factors_commute() {
        let a = modulation_combine(ModulationMode::Vca, 1.0, 0.3, 0.8);
        let ab = modulation_combine(ModulationMode::Vca, a, 0.9, 0.4);

        let b = modulation_combine(ModulationMode::Vca, 1.0, 0.9, 0.4);
        let ba = modulation_combine(ModulationMode::Vca, b, 0.3, 0.8);

        assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn test_transformations() {
        assert_eq!(ModulationTransformation::None.apply(0.5), 0.5);
        assert_eq!(ModulationTransformation::Invert.apply(0.5), -0.5);
        assert_eq!(ModulationTransformation::Square.apply(-0.5), 0.25);
        assert_eq!(ModulationTransformation::Cube.apply(-0.5), -0.125);
    }

    #[test]
    fn test_mode_codes_round_trip() {
        for mode in [
            ModulationMode::Vca,
            ModulationMode::Bipolar,
            ModulationMode::Additive,
        ] {
            assert_eq!(ModulationMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(ModulationMode::from_code(3), None);

        for t in [
            ModulationTransformation::None,
            ModulationTransformation::Invert,
            ModulationTransformation::Square,
            ModulationTransformation::Cube,
        ] {
            assert_eq!(ModulationTransformation::from_code(t.code()), Some(t));
        }
        assert_eq!(ModulationTransformation::from_code(4), None);
    }

    #[test]
    fn test_serde_uses_stable_names() {
        let json = serde_json::to_string(&PortId::CutoffMod).unwrap();
        assert_eq!(json, "\"CutoffMod\"");
        let back: PortId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PortId::CutoffMod);
    }
}
