//! Signal level helpers and the optional silence gate.
//!
//! The gate lets the worker skip inference for windows that are plainly
//! silent. It only ever suppresses work: a gated window is treated the same
//! as a window classified as background.

/// Root-mean-square of a sample slice. Empty input is silent.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Skips windows whose RMS falls below a fixed floor.
#[derive(Debug, Clone, Copy)]
pub struct SilenceGate {
    floor: f32,
}

impl SilenceGate {
    /// Gate with the given RMS floor. Negative floors are treated as zero,
    /// which gates nothing.
    pub fn new(floor: f32) -> Self {
        Self {
            floor: floor.max(0.0),
        }
    }

    pub fn floor(&self) -> f32 {
        self.floor
    }

    /// `true` when the window should skip inference.
    pub fn is_silent(&self, samples: &[f32]) -> bool {
        self.floor > 0.0 && rms(samples) < self.floor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rms_of_square_wave() {
        let samples: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        assert_relative_eq!(rms(&samples), 0.5, epsilon = 1e-5);
    }

    #[test]
    fn empty_slice_is_silent() {
        assert_eq!(rms(&[]), 0.0);
        assert!(SilenceGate::new(0.01).is_silent(&[]));
    }

    #[test]
    fn gate_passes_loud_windows() {
        let gate = SilenceGate::new(0.02);
        assert!(gate.is_silent(&[0.001; 160]));
        assert!(!gate.is_silent(&[0.3; 160]));
    }

    #[test]
    fn zero_floor_gates_nothing() {
        let gate = SilenceGate::new(-1.0);
        assert_eq!(gate.floor(), 0.0);
        assert!(!gate.is_silent(&[0.0; 160]));
    }
}
