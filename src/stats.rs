//! Buffer statistics and calibration
//!
//! [`compute_stats`] summarises one float buffer (range, moments,
//! percentiles, optional histogram). [`Calibrator`] derives a single set of
//! quantization parameters from any number of calibration buffers by
//! tracking a running global min/max, so samples are never concatenated.

use serde::{Deserialize, Serialize};

use crate::error::{HyperionError, Result};
use crate::quantize::{affine_params, BitWidth};

/// Summary statistics over a float buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantStats {
    /// Minimum value
    pub min: f32,
    /// Maximum value
    pub max: f32,
    /// Arithmetic mean
    pub mean: f32,
    /// Population variance, `E[x²] - mean²`
    pub variance: f32,
    /// 1st percentile
    pub percentile_1: f32,
    /// 99th percentile
    pub percentile_99: f32,
    /// Normalized histogram over `[min, max]` (empty unless requested)
    pub histogram: Vec<f32>,
}

/// Index of percentile `p` in a sorted buffer of `n` values
fn percentile_index(n: usize, p: usize) -> usize {
    (p * n / 100).min(n - 1)
}

/// Min/max after clipping `percentile` percent from each tail
///
/// Sorts a copy of `values`. For fewer than 100 values this is the exact
/// min/max. `values` must be non-empty.
pub(crate) fn clipped_min_max(values: &[f32], percentile: usize) -> (f32, f32) {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    (
        sorted[percentile_index(n, percentile)],
        sorted[percentile_index(n, 100 - percentile)],
    )
}

/// Compute statistics over `values`
///
/// `histogram_bins == 0` skips the histogram. Bin `i` holds the fraction of
/// values with `floor((x - min) / (max - min) * (bins - 1)) == i`; a constant
/// buffer produces an all-zero histogram.
///
/// # Errors
///
/// Returns error if `values` is empty.
pub fn compute_stats(values: &[f32], histogram_bins: usize) -> Result<QuantStats> {
    if values.is_empty() {
        return Err(HyperionError::InvalidShape {
            reason: "compute_stats: input must not be empty".to_string(),
        });
    }

    let mut min = values[0];
    let mut max = values[0];
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &x in values {
        min = min.min(x);
        max = max.max(x);
        sum += f64::from(x);
        sum_sq += f64::from(x) * f64::from(x);
    }

    let n = values.len() as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);

    let (percentile_1, percentile_99) = clipped_min_max(values, 1);

    let mut histogram = vec![0.0f32; histogram_bins];
    let range = max - min;
    if histogram_bins > 0 && range > 0.0 {
        let top = (histogram_bins - 1) as f32;
        for &x in values {
            let bin = ((x - min) / range * top) as usize;
            if let Some(slot) = histogram.get_mut(bin) {
                *slot += 1.0;
            }
        }
        let count = values.len() as f32;
        for slot in &mut histogram {
            *slot /= count;
        }
    }

    Ok(QuantStats {
        min,
        max,
        mean: mean as f32,
        variance: variance as f32,
        percentile_1,
        percentile_99,
        histogram,
    })
}

/// Streaming calibration over many sample buffers
#[derive(Debug, Clone)]
pub struct Calibrator {
    bit_width: BitWidth,
    global_min: f32,
    global_max: f32,
    samples: usize,
}

impl Calibrator {
    /// Create a calibrator targeting `bit_width`
    pub fn new(bit_width: BitWidth) -> Self {
        Self {
            bit_width,
            global_min: f32::MAX,
            global_max: f32::MIN,
            samples: 0,
        }
    }

    /// Fold one sample buffer into the running range
    pub fn observe(&mut self, sample: &[f32]) {
        for &x in sample {
            self.global_min = self.global_min.min(x);
            self.global_max = self.global_max.max(x);
        }
        self.samples += 1;
    }

    /// Number of samples observed
    pub fn sample_count(&self) -> usize {
        self.samples
    }

    /// Running `(min, max)`, `None` before any value was seen
    pub fn range(&self) -> Option<(f32, f32)> {
        (self.global_min <= self.global_max).then_some((self.global_min, self.global_max))
    }

    /// Final `(scale, zero_point)`
    ///
    /// A degenerate range (`min >= max`) yields `(1.0, 0)`.
    pub fn finish(&self) -> (f32, i32) {
        if self.global_min >= self.global_max {
            return (1.0, 0);
        }
        affine_params(self.global_min, self.global_max, self.bit_width)
    }
}

/// Derive `(scale, zero_point)` from calibration samples
///
/// # Errors
///
/// Returns error if `samples` is empty.
pub fn calibrate(samples: &[&[f32]], bit_width: BitWidth) -> Result<(f32, i32)> {
    if samples.is_empty() {
        return Err(HyperionError::InvalidShape {
            reason: "calibrate: at least one sample is required".to_string(),
        });
    }
    let mut calibrator = Calibrator::new(bit_width);
    for sample in samples {
        calibrator.observe(sample);
    }
    Ok(calibrator.finish())
}
