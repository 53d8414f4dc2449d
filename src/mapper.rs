//! Streamline -> voxel sample mapping
//!
//! Converts each streamline into a set of (voxel, mean tangent, length) samples
//! using subvoxel-precise traversal: the polyline is upsampled so that each
//! segment covers roughly a third of a voxel, segments are binned by the voxel
//! containing their midpoint, and repeated visits to the same voxel are merged
//! by summing lengths and length-weighting the tangent.

use std::collections::HashMap;

use crate::fixel::FixelAtlas;
use crate::tracks::Streamline;

/// One voxel traversed by a streamline
#[derive(Debug, Clone)]
pub struct VoxelSample {
    /// Voxel index in the template grid
    pub voxel: [i64; 3],
    /// Mean unit tangent of the streamline within this voxel
    pub tangent: [f64; 3],
    /// Streamline length within this voxel (mm)
    pub length: f64,
}

/// Maps streamlines onto the voxel grid of a fixel atlas
pub struct TrackMapper<'a> {
    atlas: &'a FixelAtlas,
    min_voxel: f64,
    /// Fixed upsample ratio from the track step size; 0 = estimate per streamline
    upsample: usize,
}

impl<'a> TrackMapper<'a> {
    /// Create a mapper; `step_size` is the track file step size in mm, when known
    pub fn new(atlas: &'a FixelAtlas, voxel_size: [f64; 3], step_size: Option<f64>) -> Self {
        let min_voxel = voxel_size
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min)
            .max(1e-6);
        let upsample = match step_size {
            Some(step) if step > 0.0 => upsample_ratio(step, min_voxel),
            _ => 0,
        };
        TrackMapper {
            atlas,
            min_voxel,
            upsample,
        }
    }

    /// Map one streamline to its voxel samples, ordered by first visit
    pub fn map(&self, streamline: &Streamline) -> Vec<VoxelSample> {
        if streamline.len() < 2 {
            return Vec::new();
        }

        let ratio = if self.upsample > 0 {
            self.upsample
        } else {
            // No step size in the header: estimate from the mean segment length
            let total: f64 = streamline
                .windows(2)
                .map(|w| distance(w[0], w[1]))
                .sum::<f64>();
            let mean_step = total / (streamline.len() - 1) as f64;
            upsample_ratio(mean_step, self.min_voxel)
        };

        let mut order: Vec<[i64; 3]> = Vec::new();
        let mut accum: HashMap<[i64; 3], ([f64; 3], f64)> = HashMap::new();

        for window in streamline.windows(2) {
            let (a, b) = (window[0], window[1]);
            for sub in 0..ratio {
                let t0 = sub as f64 / ratio as f64;
                let t1 = (sub + 1) as f64 / ratio as f64;
                let p0 = lerp(a, b, t0);
                let p1 = lerp(a, b, t1);
                let length = distance(p0, p1);
                if length <= 0.0 {
                    continue;
                }
                let mid = lerp(p0, p1, 0.5);
                let voxel_f = self.atlas.scanner_to_voxel(mid);
                let voxel = [
                    voxel_f[0].round() as i64,
                    voxel_f[1].round() as i64,
                    voxel_f[2].round() as i64,
                ];
                let entry = accum.entry(voxel).or_insert_with(|| {
                    order.push(voxel);
                    ([0.0; 3], 0.0)
                });
                // (p1 - p0) is already the length-weighted unit tangent
                entry.0[0] += p1[0] - p0[0];
                entry.0[1] += p1[1] - p0[1];
                entry.0[2] += p1[2] - p0[2];
                entry.1 += length;
            }
        }

        order
            .into_iter()
            .filter_map(|voxel| {
                let (tangent, length) = accum[&voxel];
                let norm =
                    (tangent[0] * tangent[0] + tangent[1] * tangent[1] + tangent[2] * tangent[2])
                        .sqrt();
                if norm < 1e-12 || length <= 0.0 {
                    return None;
                }
                Some(VoxelSample {
                    voxel,
                    tangent: [tangent[0] / norm, tangent[1] / norm, tangent[2] / norm],
                    length,
                })
            })
            .collect()
    }
}

/// Upsample factor so that each sub-segment covers about a third of a voxel
fn upsample_ratio(step: f64, min_voxel: f64) -> usize {
    (step / (min_voxel / 3.0)).ceil().max(1.0) as usize
}

#[inline]
fn lerp(a: [f64; 3], b: [f64; 3], t: f64) -> [f64; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

#[inline]
fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2) + (b[2] - a[2]).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mif::identity_transform;

    fn line_atlas() -> FixelAtlas {
        FixelAtlas::from_parts(
            [4, 1, 1],
            [1.0, 1.0, 1.0],
            identity_transform(),
            vec![1, 1, 1, 1],
            vec![[1.0, 0.0, 0.0]; 4],
        )
        .unwrap()
    }

    #[test]
    fn test_straight_line_lengths() {
        let atlas = line_atlas();
        let mapper = TrackMapper::new(&atlas, [1.0, 1.0, 1.0], Some(0.5));
        // Spans voxels 0..=3 edge to edge at 0.5mm steps: one unit of length per voxel
        let streamline: Streamline = (0..9).map(|i| [-0.5 + 0.5 * i as f64, 0.0, 0.0]).collect();
        let samples = mapper.map(&streamline);
        assert_eq!(samples.len(), 4);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.voxel, [i as i64, 0, 0]);
            assert!(
                (sample.length - 1.0).abs() < 1e-9,
                "voxel {} length {}",
                i,
                sample.length
            );
            assert!((sample.tangent[0] - 1.0).abs() < 1e-9);
        }
        let total: f64 = samples.iter().map(|s| s.length).sum();
        assert!((total - 4.0).abs() < 1e-9, "total length {}", total);
    }

    #[test]
    fn test_duplicate_visits_merged() {
        let atlas = line_atlas();
        let mapper = TrackMapper::new(&atlas, [1.0, 1.0, 1.0], Some(0.5));
        // Doubles back through voxel 1
        let streamline = vec![
            [0.6, 0.0, 0.0],
            [1.4, 0.0, 0.0],
            [0.6, 0.0, 0.0],
            [1.4, 0.0, 0.0],
        ];
        let samples = mapper.map(&streamline);
        // Tangent contributions cancel in the doubled-back section for voxel 1,
        // but the net direction is still +x; lengths add up
        let voxel1 = samples.iter().find(|s| s.voxel == [1, 0, 0]).unwrap();
        assert!(voxel1.length > 1.0, "length {}", voxel1.length);
        let total: f64 = samples.iter().map(|s| s.length).sum();
        assert!((total - 2.4).abs() < 1e-9, "total {}", total);
    }

    #[test]
    fn test_short_streamline_ignored() {
        let atlas = line_atlas();
        let mapper = TrackMapper::new(&atlas, [1.0, 1.0, 1.0], None);
        assert!(mapper.map(&vec![[0.0, 0.0, 0.0]]).is_empty());
        assert!(mapper.map(&Vec::new()).is_empty());
    }
}
