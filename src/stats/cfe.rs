//! Connectivity-based fixel enhancement
//!
//! Transforms a per-fixel t-statistic vector into enhanced statistics by
//! integrating connectivity-weighted extent against height over a discrete
//! height grid: CFE_i = sum_h dh * e_i(h)^E * h^H, where the extent e_i(h)
//! sums the pre-exponentiated connectivity values of neighbours (self-loop
//! included) whose statistic reaches h. Only the positive tail is enhanced.

use crate::connectivity::ConnectivityGraph;

/// CFE integrator over a frozen connectivity graph
pub struct Enhancer<'a> {
    graph: &'a ConnectivityGraph,
    dh: f64,
    extent_exponent: f64,
    height_exponent: f64,
}

impl<'a> Enhancer<'a> {
    pub fn new(graph: &'a ConnectivityGraph, dh: f64, e: f64, h: f64) -> Self {
        Enhancer {
            graph,
            dh,
            extent_exponent: e,
            height_exponent: h,
        }
    }

    /// Enhance one contrast's t-statistic vector.
    ///
    /// Fixels with non-finite statistics produce zero, as do non-positive
    /// statistics everywhere (positive tail only).
    pub fn enhance(&self, stats: &[f64]) -> Vec<f64> {
        let num_fixels = self.graph.num_fixels();
        debug_assert_eq!(stats.len(), num_fixels);
        let mut enhanced = vec![0.0; num_fixels];

        let max_stat = stats
            .iter()
            .cloned()
            .filter(|v| v.is_finite())
            .fold(0.0f64, f64::max);
        let num_steps = (max_stat / self.dh).floor() as usize;
        if num_steps == 0 {
            return enhanced;
        }

        for (fixel, out) in enhanced.iter_mut().enumerate() {
            if !stats[fixel].is_finite() {
                continue;
            }
            // Neighbour statistics sorted descending: walking the height grid
            // downwards grows the extent incrementally
            let mut neighbours: Vec<(f64, f64)> = self
                .graph
                .row(fixel)
                .iter()
                .filter_map(|&(j, value)| {
                    let t = stats[j as usize];
                    if t.is_finite() && t >= self.dh {
                        Some((t, value))
                    } else {
                        None
                    }
                })
                .collect();
            neighbours.sort_by(|a, b| b.0.total_cmp(&a.0));

            let mut extent = 0.0;
            let mut next = 0;
            let mut acc = 0.0;
            for step in (1..=num_steps).rev() {
                let h = self.dh * step as f64;
                while next < neighbours.len() && neighbours[next].0 >= h {
                    extent += neighbours[next].1;
                    next += 1;
                }
                if extent > 0.0 {
                    acc += extent.powf(self.extent_exponent) * h.powf(self.height_exponent);
                }
            }
            *out = acc * self.dh;
        }
        enhanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::{normalise, GraphBuild, NormaliseOptions};
    use crate::fixel::FixelAtlas;
    use crate::mif::identity_transform;

    fn pair_graph() -> ConnectivityGraph {
        // Two fixels connected with fraction 1/4 each way (C = 0.5 -> 0.5)
        let atlas = FixelAtlas::from_parts(
            [2, 1, 1],
            [1.0, 1.0, 1.0],
            identity_transform(),
            vec![1, 1],
            vec![[1.0, 0.0, 0.0]; 2],
        )
        .unwrap();
        let mut build = GraphBuild::new(2);
        build.tdi = vec![4.0, 4.0];
        build.edges[0].insert(1, 1);
        build.edges[1].insert(0, 1);
        let (graph, _) = normalise(
            build,
            &atlas,
            &NormaliseOptions {
                connectivity_threshold: 0.01,
                smooth_fwhm: 0.0,
                cfe_c: 0.5,
            },
            || {},
        );
        graph
    }

    #[test]
    fn test_hand_computed_enhancement() {
        let graph = pair_graph();
        let enhancer = Enhancer::new(&graph, 0.1, 2.0, 3.0);
        let enhanced = enhancer.enhance(&[0.25, 0.15]);
        // Fixel 0: h=0.2 -> extent 1.0 (self), h=0.1 -> extent 1.5 (self + 0.5 neighbour)
        let expected0 = 0.1 * (1.0f64.powi(2) * 0.2f64.powi(3) + 1.5f64.powi(2) * 0.1f64.powi(3));
        assert!(
            (enhanced[0] - expected0).abs() < 1e-12,
            "expected {}, got {}",
            expected0,
            enhanced[0]
        );
        // Fixel 1: h=0.2 -> extent 0.5 (neighbour only), h=0.1 -> extent 1.5
        let expected1 = 0.1 * (0.5f64.powi(2) * 0.2f64.powi(3) + 1.5f64.powi(2) * 0.1f64.powi(3));
        assert!(
            (enhanced[1] - expected1).abs() < 1e-12,
            "expected {}, got {}",
            expected1,
            enhanced[1]
        );
    }

    #[test]
    fn test_negative_tail_not_enhanced() {
        let graph = pair_graph();
        let enhancer = Enhancer::new(&graph, 0.1, 2.0, 3.0);
        assert_eq!(enhancer.enhance(&[-1.0, -2.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_non_finite_contributes_zero() {
        let graph = pair_graph();
        let enhancer = Enhancer::new(&graph, 0.1, 2.0, 3.0);
        let enhanced = enhancer.enhance(&[f64::NAN, 0.5]);
        assert_eq!(enhanced[0], 0.0, "non-finite fixel must stay zero");
        assert!(enhanced[1] > 0.0, "finite fixel unaffected by NaN neighbour");
    }

    #[test]
    fn test_monotone_in_statistics() {
        let graph = pair_graph();
        let enhancer = Enhancer::new(&graph, 0.1, 2.0, 3.0);
        let base = enhancer.enhance(&[0.35, 0.55]);
        let raised = enhancer.enhance(&[0.45, 0.65]);
        for (b, r) in base.iter().zip(raised.iter()) {
            assert!(r >= b, "enhancement must be monotone: {} < {}", r, b);
        }
    }
}
