//! Connectivity-weighted smoothing of per-subject fixel data
//!
//! Applies the normalised smoothing kernel to a subject's scalar vector with
//! NaN-aware renormalisation: non-finite neighbours are excluded and the
//! remaining weights rescaled. A fixel whose own value is non-finite stays
//! non-finite, so missing measurements remain missing for the GLM.

use crate::connectivity::SmoothingWeights;

/// Smooth one subject's fixel values in place of a fresh vector
pub fn smooth_subject(values: &[f64], weights: &SmoothingWeights) -> Vec<f64> {
    let mut smoothed = vec![f64::NAN; values.len()];
    for (fixel, out) in smoothed.iter_mut().enumerate() {
        if !values[fixel].is_finite() {
            continue;
        }
        let mut value = 0.0;
        let mut sum_weights = 0.0;
        for &(neighbour, weight) in weights.row(fixel) {
            let v = values[neighbour as usize];
            if v.is_finite() {
                value += v * weight;
                sum_weights += weight;
            }
        }
        if sum_weights > 0.0 {
            *out = value / sum_weights;
        }
    }
    smoothed
}
