//! Automation Frame
//!
//! Block-level parameter marshalling between the host and the engine: one
//! gate/frequency/gain/velocity value per voice plus four per-sample macro
//! streams per voice, laid out as one flat buffer indexed
//! `((voice * 4) + macro) * block_len + sample` to match worklet
//! conventions.

pub const MACROS_PER_VOICE: usize = 4;

const DEFAULT_FREQUENCY: f32 = 440.0;
const DEFAULT_GAIN: f32 = 1.0;
const DEFAULT_GATE: f32 = 0.0;
const DEFAULT_VELOCITY: f32 = 0.0;

/// Frame of per-block automation data shared between the host and the
/// voice manager.
#[derive(Clone, Debug)]
pub struct AutomationFrame {
    num_voices: usize,
    macro_count: usize,
    macro_buffer_len: usize,
    gates: Vec<f32>,
    frequencies: Vec<f32>,
    velocities: Vec<f32>,
    gains: Vec<f32>,
    macro_buffers: Vec<f32>,
}

impl AutomationFrame {
    pub fn with_dimensions(num_voices: usize, macro_count: usize, macro_buffer_len: usize) -> Self {
        let macro_buffers = vec![0.0; num_voices * macro_count * macro_buffer_len];
        Self {
            num_voices,
            macro_count,
            macro_buffer_len,
            gates: vec![DEFAULT_GATE; num_voices],
            frequencies: vec![DEFAULT_FREQUENCY; num_voices],
            velocities: vec![DEFAULT_VELOCITY; num_voices],
            gains: vec![DEFAULT_GAIN; num_voices],
            macro_buffers,
        }
    }

    pub fn num_voices(&self) -> usize {
        self.num_voices
    }

    pub fn macro_count(&self) -> usize {
        self.macro_count
    }

    pub fn macro_buffer_len(&self) -> usize {
        self.macro_buffer_len
    }

    pub fn gates(&self) -> &[f32] {
        &self.gates
    }

    pub fn frequencies(&self) -> &[f32] {
        &self.frequencies
    }

    pub fn velocities(&self) -> &[f32] {
        &self.velocities
    }

    pub fn gains(&self) -> &[f32] {
        &self.gains
    }

    pub fn macro_buffers(&self) -> &[f32] {
        &self.macro_buffers
    }

    pub fn set_voice_values(
        &mut self,
        voice_index: usize,
        gate: f32,
        frequency: f32,
        velocity: f32,
        gain: f32,
    ) {
        if voice_index >= self.num_voices {
            return;
        }
        self.gates[voice_index] = gate;
        self.frequencies[voice_index] = frequency;
        self.velocities[voice_index] = velocity;
        self.gains[voice_index] = gain;
    }

    /// Fill one macro's whole stream with a constant.
    pub fn set_macro_value(&mut self, voice_index: usize, macro_index: usize, value: f32) {
        if voice_index >= self.num_voices || macro_index >= self.macro_count {
            return;
        }
        let start = self.macro_offset(voice_index, macro_index);
        for slot in self
            .macro_buffers
            .iter_mut()
            .skip(start)
            .take(self.macro_buffer_len)
        {
            *slot = value;
        }
    }

    /// The per-sample stream of one voice's macro. Empty when the frame
    /// was built without macro storage.
    pub fn macro_slice(&self, voice_index: usize, macro_index: usize) -> &[f32] {
        if voice_index >= self.num_voices || macro_index >= self.macro_count {
            return &[];
        }
        let start = self.macro_offset(voice_index, macro_index);
        &self.macro_buffers[start..start + self.macro_buffer_len]
    }

    fn macro_offset(&self, voice_index: usize, macro_index: usize) -> usize {
        (voice_index * self.macro_count + macro_index) * self.macro_buffer_len
    }

    /// Adjust the per-macro stream length to the current block without
    /// reallocating. Lengths beyond the preallocated maximum are clamped.
    pub fn set_block_len(&mut self, n: usize) {
        let capacity = if self.num_voices * self.macro_count == 0 {
            n
        } else {
            self.macro_buffers.len() / (self.num_voices * self.macro_count)
        };
        self.macro_buffer_len = n.min(capacity).max(1);
    }

    /// Populate the frame from the host's parallel arrays. Short arrays
    /// leave the remaining voices at their defaults; the macro buffer is
    /// copied through when its length matches the frame layout.
    pub fn populate(
        &mut self,
        gates: &[f32],
        frequencies: &[f32],
        gains: &[f32],
        velocities: &[f32],
        macros: &[f32],
    ) {
        self.reset_defaults();

        for voice in 0..self.num_voices {
            let gate = gates.get(voice).copied().unwrap_or(DEFAULT_GATE);
            let frequency = frequencies.get(voice).copied().unwrap_or(DEFAULT_FREQUENCY);
            let gain = gains.get(voice).copied().unwrap_or(DEFAULT_GAIN);
            let velocity = velocities.get(voice).copied().unwrap_or(DEFAULT_VELOCITY);
            self.set_voice_values(voice, gate, frequency, velocity, gain);
        }

        // The host buffer is laid out with the current block's stride, so
        // only the logical prefix is meaningful.
        let needed = self.num_voices * self.macro_count * self.macro_buffer_len;
        let take = needed.min(macros.len()).min(self.macro_buffers.len());
        self.macro_buffers[..take].copy_from_slice(&macros[..take]);
    }

    fn reset_defaults(&mut self) {
        self.gates.fill(DEFAULT_GATE);
        self.frequencies.fill(DEFAULT_FREQUENCY);
        self.velocities.fill(DEFAULT_VELOCITY);
        self.gains.fill(DEFAULT_GAIN);
        self.macro_buffers.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let frame = AutomationFrame::with_dimensions(2, 4, 8);
        assert_eq!(frame.gates(), &[0.0, 0.0]);
        assert_eq!(frame.frequencies(), &[440.0, 440.0]);
        assert_eq!(frame.gains(), &[1.0, 1.0]);
        assert_eq!(frame.velocities(), &[0.0, 0.0]);
        assert_eq!(frame.macro_buffers().len(), 2 * 4 * 8);
    }

    #[test]
    fn test_macro_expansion() {
        let mut frame = AutomationFrame::with_dimensions(2, 4, 8);
        frame.set_voice_values(0, 1.0, 330.0, 0.5, 0.75);
        frame.set_macro_value(0, 2, 0.75);

        let macro_slice = frame.macro_slice(0, 2);
        assert_eq!(macro_slice.len(), 8);
        assert!(macro_slice.iter().all(|&v| (v - 0.75).abs() < 1e-6));

        // Other voices stay at defaults
        assert!(frame.macro_slice(1, 3).iter().all(|&v| v == 0.0));
        assert_eq!(frame.frequencies()[0], 330.0);
        assert_eq!(frame.gains()[0], 0.75);
        assert_eq!(frame.velocities()[0], 0.5);
        assert_eq!(frame.gates()[0], 1.0);
        assert_eq!(frame.frequencies()[1], 440.0);
    }

    #[test]
    fn test_out_of_range_writes_ignored() {
        let mut frame = AutomationFrame::with_dimensions(1, 4, 8);
        frame.set_voice_values(5, 1.0, 100.0, 1.0, 1.0);
        frame.set_macro_value(0, 9, 1.0);
        assert_eq!(frame.gates(), &[0.0]);
        assert!(frame.macro_buffers().iter().all(|&v| v == 0.0));
        assert!(frame.macro_slice(3, 0).is_empty());
    }

    #[test]
    fn test_populate_from_host_arrays() {
        let mut frame = AutomationFrame::with_dimensions(2, 4, 4);
        let macros: Vec<f32> = (0..2 * 4 * 4).map(|i| i as f32 / 32.0).collect();
        frame.populate(&[1.0, 0.0], &[220.0, 550.0], &[0.5, 0.6], &[0.7, 0.8], &macros);

        assert_eq!(frame.gates(), &[1.0, 0.0]);
        assert_eq!(frame.frequencies(), &[220.0, 550.0]);
        assert_eq!(frame.gains(), &[0.5, 0.6]);
        assert_eq!(frame.velocities(), &[0.7, 0.8]);
        // Voice 1, macro 2 starts at ((1*4)+2)*4
        assert_eq!(frame.macro_slice(1, 2)[0], 24.0 / 32.0);
    }

    #[test]
    fn test_populate_short_arrays_fall_back() {
        let mut frame = AutomationFrame::with_dimensions(2, 4, 4);
        frame.populate(&[1.0], &[100.0], &[], &[], &[]);
        assert_eq!(frame.gates(), &[1.0, 0.0]);
        assert_eq!(frame.frequencies(), &[100.0, 440.0]);
        assert_eq!(frame.gains(), &[1.0, 1.0]);
    }

    #[test]
    fn test_zero_voices_is_legal() {
        let mut frame = AutomationFrame::with_dimensions(0, 4, 128);
        frame.populate(&[], &[], &[], &[], &[]);
        assert_eq!(frame.num_voices(), 0);
        assert!(frame.macro_buffers().is_empty());
    }
}
