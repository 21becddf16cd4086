//! Modulation Accumulation
//!
//! Before a node runs, every incoming connection to each of its input
//! ports is gathered into that port's scratch buffer: the source signal is
//! transformed elementwise, then folded into an additive or multiplicative
//! accumulator according to the connection's [`ModulationMode`]. The node
//! finally combines `(base + add) * mult` with its own base value, either a
//! scalar parameter or a varying stream such as the global frequency.

use crate::port::{modulation_combine, ModulationMode, ModulationTransformation};

/// One incoming connection's view for a single block: the producer's
/// output buffer plus the edge attributes.
#[derive(Debug, Clone, Copy)]
pub struct ModulationSource<'a> {
    pub buffer: &'a [f32],
    pub amount: f32,
    pub mode: ModulationMode,
    pub transformation: ModulationTransformation,
}

/// Accumulate all sources for one destination port into split additive and
/// multiplicative scratch buffers.
///
/// `add` is reset to 0 and `mult` to 1 before folding, so the caller can
/// reuse the scratch across ports. The result is order-independent: sums
/// commute, and VCA factors multiply.
pub fn accumulate(n: usize, sources: &[ModulationSource], add: &mut [f32], mult: &mut [f32]) {
    add[..n].fill(0.0);
    mult[..n].fill(1.0);

    for src in sources {
        accumulate_one(
            n,
            src.buffer,
            src.amount,
            src.mode,
            src.transformation,
            add,
            mult,
        );
    }
}

/// Fold a single source into already-initialized accumulators. The graph
/// uses this directly so it never has to build a source list per port.
///
/// The per-sample arithmetic is [`modulation_combine`]; this only routes
/// each mode to its accumulator half.
pub fn accumulate_one(
    n: usize,
    buffer: &[f32],
    amount: f32,
    mode: ModulationMode,
    transformation: ModulationTransformation,
    add: &mut [f32],
    mult: &mut [f32],
) {
    let len = buffer.len().min(n);
    if mode.is_multiplicative() {
        for i in 0..len {
            let s = transformation.apply(buffer[i]);
            mult[i] = modulation_combine(mode, mult[i], s, amount);
        }
    } else {
        for i in 0..len {
            let s = transformation.apply(buffer[i]);
            add[i] = modulation_combine(mode, add[i], s, amount);
        }
    }
}

/// `target[i] = (base + add[i]) * mult[i]` for a scalar base.
#[inline]
pub fn combine_with_base(target: &mut [f32], n: usize, base: f32, add: &[f32], mult: &[f32]) {
    for i in 0..n {
        target[i] = (base + add[i]) * mult[i];
    }
}

/// `target[i] = (base[i] + add[i]) * mult[i]` for a varying base stream.
#[inline]
pub fn combine_with_varying_base(
    target: &mut [f32],
    n: usize,
    base: &[f32],
    add: &[f32],
    mult: &[f32],
) {
    for i in 0..n {
        target[i] = (base[i] + add[i]) * mult[i];
    }
}

/// Replace every non-finite sample with silence. Nodes run this over
/// their outputs so corrupt parameters can never leak NaN/Inf downstream.
#[inline]
pub fn scrub_non_finite(buffer: &mut [f32]) {
    for sample in buffer.iter_mut() {
        if !sample.is_finite() {
            *sample = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{ModulationMode, ModulationTransformation};

    fn src(
        buffer: &[f32],
        amount: f32,
        mode: ModulationMode,
        transformation: ModulationTransformation,
    ) -> ModulationSource<'_> {
        ModulationSource {
            buffer,
            amount,
            mode,
            transformation,
        }
    }

    #[test]
    fn test_accumulate_empty_is_identity() {
        let mut add = [9.0f32; 4];
        let mut mult = [9.0f32; 4];
        accumulate(4, &[], &mut add, &mut mult);
        assert_eq!(add, [0.0; 4]);
        assert_eq!(mult, [1.0; 4]);
    }

    #[test]
    fn test_accumulate_additive() {
        let buf_a = [1.0f32; 4];
        let buf_b = [0.5f32; 4];
        let sources = [
            src(&buf_a, 0.5, ModulationMode::Additive, ModulationTransformation::None),
            src(&buf_b, 1.0, ModulationMode::Additive, ModulationTransformation::None),
        ];
        let mut add = [0.0f32; 4];
        let mut mult = [0.0f32; 4];
        accumulate(4, &sources, &mut add, &mut mult);
        assert!(add.iter().all(|&x| (x - 1.0).abs() < 1e-6));
        assert!(mult.iter().all(|&x| (x - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_accumulate_vca_goes_to_mult() {
        let buf = [0.5f32; 4];
        let sources = [src(
            &buf,
            1.0,
            ModulationMode::Vca,
            ModulationTransformation::None,
        )];
        let mut add = [0.0f32; 4];
        let mut mult = [0.0f32; 4];
        accumulate(4, &sources, &mut add, &mut mult);
        assert!(add.iter().all(|&x| x == 0.0));
        assert!(mult.iter().all(|&x| (x - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_accumulate_vca_amount_zero_is_passthrough() {
        let buf = [0.0f32; 4];
        let sources = [src(
            &buf,
            0.0,
            ModulationMode::Vca,
            ModulationTransformation::None,
        )];
        let mut add = [0.0f32; 4];
        let mut mult = [0.0f32; 4];
        accumulate(4, &sources, &mut add, &mut mult);
        assert!(mult.iter().all(|&x| (x - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_accumulate_applies_transformation() {
        let buf = [2.0f32; 4];
        let sources = [src(
            &buf,
            1.0,
            ModulationMode::Additive,
            ModulationTransformation::Square,
        )];
        let mut add = [0.0f32; 4];
        let mut mult = [0.0f32; 4];
        accumulate(4, &sources, &mut add, &mut mult);
        assert!(add.iter().all(|&x| (x - 4.0).abs() < 1e-6));
    }

    #[test]
    fn test_accumulate_order_independent() {
        let buf_a = [0.3f32; 4];
        let buf_b = [0.8f32; 4];
        let a = src(&buf_a, 0.7, ModulationMode::Vca, ModulationTransformation::None);
        let b = src(&buf_b, 0.4, ModulationMode::Bipolar, ModulationTransformation::None);

        let mut add1 = [0.0f32; 4];
        let mut mult1 = [0.0f32; 4];
        accumulate(4, &[a, b], &mut add1, &mut mult1);

        let mut add2 = [0.0f32; 4];
        let mut mult2 = [0.0f32; 4];
        accumulate(4, &[b, a], &mut add2, &mut mult2);

        for i in 0..4 {
            assert!((add1[i] - add2[i]).abs() < 1e-6);
            assert!((mult1[i] - mult2[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_combine_with_base() {
        let add = [0.5f32; 4];
        let mult = [2.0f32; 4];
        let mut target = [0.0f32; 4];
        combine_with_base(&mut target, 4, 1.0, &add, &mult);
        assert!(target.iter().all(|&x| (x - 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_combine_with_varying_base() {
        let base = [100.0f32, 200.0, 300.0, 400.0];
        let add = [10.0f32; 4];
        let mult = [1.0f32; 4];
        let mut target = [0.0f32; 4];
        combine_with_varying_base(&mut target, 4, &base, &add, &mult);
        assert_eq!(target, [110.0, 210.0, 310.0, 410.0]);
    }

    #[test]
    fn test_short_source_buffer_only_covers_prefix() {
        let buf = [1.0f32; 2];
        let sources = [src(
            &buf,
            1.0,
            ModulationMode::Additive,
            ModulationTransformation::None,
        )];
        let mut add = [0.0f32; 4];
        let mut mult = [0.0f32; 4];
        accumulate(4, &sources, &mut add, &mut mult);
        assert_eq!(add, [1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_scrub_non_finite() {
        let mut buf = [1.0f32, f32::NAN, f32::INFINITY, -2.0];
        scrub_non_finite(&mut buf);
        assert_eq!(buf, [1.0, 0.0, 0.0, -2.0]);
    }
}
