//! Connectivity normalisation and smoothing-kernel derivation
//!
//! Converts raw co-traversal counts into fractional connectivity per fixel
//! row, prunes weak edges, pre-exponentiates the surviving fractions for CFE,
//! and builds the normalised Gaussian smoothing kernel over the pruned graph.

use crate::connectivity::GraphBuild;
use crate::fixel::FixelAtlas;

/// FWHM of a Gaussian relative to its standard deviation
pub const FWHM_TO_STD: f64 = 2.3548;

/// Pruned connectivity graph holding `fraction^C` per edge.
///
/// Row-normalised fractions are not symmetric; each row additionally holds a
/// self-loop with the literal value 1.0. Rows are sorted by neighbour index.
pub struct ConnectivityGraph {
    rows: Vec<Vec<(u32, f64)>>,
}

impl ConnectivityGraph {
    /// Neighbours of a fixel as (neighbour, weight) pairs, self-loop included
    pub fn row(&self, fixel: usize) -> &[(u32, f64)] {
        &self.rows[fixel]
    }

    pub fn num_fixels(&self) -> usize {
        self.rows.len()
    }
}

/// Normalised smoothing kernel: rows sum to 1, self-term always present
pub struct SmoothingWeights {
    rows: Vec<Vec<(u32, f64)>>,
}

impl SmoothingWeights {
    pub fn row(&self, fixel: usize) -> &[(u32, f64)] {
        &self.rows[fixel]
    }

    pub fn num_fixels(&self) -> usize {
        self.rows.len()
    }
}

/// Parameters for [`normalise`]
pub struct NormaliseOptions {
    /// Minimum fraction of shared streamlines for an edge to survive
    pub connectivity_threshold: f64,
    /// Smoothing kernel FWHM in mm; 0 disables smoothing
    pub smooth_fwhm: f64,
    /// CFE connectivity exponent applied to surviving fractions
    pub cfe_c: f64,
}

/// Normalise the raw graph and derive smoothing weights.
///
/// Fixels are processed independently; `on_fixel` is invoked once per fixel.
pub fn normalise<F: Fn()>(
    build: GraphBuild,
    atlas: &FixelAtlas,
    options: &NormaliseOptions,
    on_fixel: F,
) -> (ConnectivityGraph, SmoothingWeights) {
    let num_fixels = build.edges.len();
    let std_dev = options.smooth_fwhm / FWHM_TO_STD;
    let do_smoothing = std_dev > 0.0;
    let gaussian_const2 = 2.0 * std_dev * std_dev;
    let gaussian_const1 = if do_smoothing {
        1.0 / (std_dev * (2.0 * std::f64::consts::PI).sqrt())
    } else {
        1.0
    };

    let mut graph_rows = Vec::with_capacity(num_fixels);
    let mut smooth_rows = Vec::with_capacity(num_fixels);

    for (fixel, edges) in build.edges.into_iter().enumerate() {
        let tdi = build.tdi[fixel];
        let pos = atlas.position(fixel);

        let mut graph_row: Vec<(u32, f64)> = Vec::new();
        let mut smooth_row: Vec<(u32, f64)> = Vec::new();
        let mut self_inserted = false;

        for (neighbour, count) in edges {
            if tdi <= 0.0 {
                break;
            }
            let fraction = count as f64 / tdi;
            if fraction < options.connectivity_threshold {
                continue;
            }
            if do_smoothing {
                let npos = atlas.position(neighbour as usize);
                let distance = ((pos[0] - npos[0]).powi(2)
                    + (pos[1] - npos[1]).powi(2)
                    + (pos[2] - npos[2]).powi(2))
                .sqrt();
                let weight =
                    fraction * gaussian_const1 * (-distance * distance / gaussian_const2).exp();
                if weight > 0.01 {
                    smooth_row.push((neighbour, weight));
                }
            }
            // Pre-exponentiate for CFE; insert the self-loop in sorted position
            if !self_inserted && neighbour > fixel as u32 {
                graph_row.push((fixel as u32, 1.0));
                self_inserted = true;
            }
            graph_row.push((neighbour, fraction.powf(options.cfe_c)));
        }

        // The fixel is always fully connected to itself
        if !self_inserted {
            graph_row.push((fixel as u32, 1.0));
        }
        let self_pos = match smooth_row.binary_search_by_key(&(fixel as u32), |&(n, _)| n) {
            Ok(p) | Err(p) => p,
        };
        smooth_row.insert(self_pos, (fixel as u32, gaussian_const1));

        // Normalise smoothing weights to unit sum
        let sum: f64 = smooth_row.iter().map(|&(_, w)| w).sum();
        for (_, w) in smooth_row.iter_mut() {
            *w /= sum;
        }

        graph_rows.push(graph_row);
        smooth_rows.push(smooth_row);
        on_fixel();
    }

    (
        ConnectivityGraph { rows: graph_rows },
        SmoothingWeights { rows: smooth_rows },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mif::identity_transform;
    use std::collections::BTreeMap;

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

    fn full_build() -> GraphBuild {
        // One streamline through all four fixels, unit length per voxel
        let mut build = GraphBuild::new(4);
        build.tdi = vec![1.0; 4];
        for i in 0..4u32 {
            for j in 0..4u32 {
                if i != j {
                    build.edges[i as usize].insert(j, 1);
                }
            }
        }
        build
    }

    #[test]
    fn test_smoothing_weights_normalised() {
        let atlas = line_atlas();
        let (graph, weights) = normalise(
            full_build(),
            &atlas,
            &NormaliseOptions {
                connectivity_threshold: 0.01,
                smooth_fwhm: 10.0,
                cfe_c: 0.5,
            },
            || {},
        );
        for fixel in 0..4 {
            let row = weights.row(fixel);
            let sum: f64 = row.iter().map(|&(_, w)| w).sum();
            assert!((sum - 1.0).abs() < 1e-9, "row {} sums to {}", fixel, sum);
            assert!(
                row.iter().any(|&(n, _)| n as usize == fixel),
                "row {} missing self-term",
                fixel
            );
            // Self-loop in the CFE graph is exactly 1.0
            let self_edge = graph.row(fixel).iter().find(|&&(n, _)| n as usize == fixel);
            assert_eq!(self_edge, Some(&(fixel as u32, 1.0)));
        }
    }

    #[test]
    fn test_pruning_below_threshold() {
        let atlas = line_atlas();
        let mut build = full_build();
        // Fixel 0 saw 200 units of track length: all its fractions are 1/200
        build.tdi[0] = 200.0;
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
        assert_eq!(graph.row(0), &[(0u32, 1.0)], "only the self-loop survives");
        // The reverse edges (from fixels 1..3 towards 0) keep fraction 1.0
        assert!(graph.row(1).iter().any(|&(n, _)| n == 0));
    }

    #[test]
    fn test_fraction_exponentiation() {
        let atlas = line_atlas();
        let mut build = GraphBuild::new(4);
        build.tdi = vec![4.0, 1.0, 0.0, 0.0];
        build.edges[0] = BTreeMap::from([(1u32, 1u32)]);
        build.edges[1] = BTreeMap::from([(0u32, 1u32)]);
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
        // fraction 1/4, C = 0.5 -> 0.5
        let edge = graph.row(0).iter().find(|&&(n, _)| n == 1).unwrap();
        assert!((edge.1 - 0.5).abs() < 1e-12, "got {}", edge.1);
    }

    #[test]
    fn test_disabled_smoothing_is_self_only() {
        let atlas = line_atlas();
        let (_, weights) = normalise(
            full_build(),
            &atlas,
            &NormaliseOptions {
                connectivity_threshold: 0.01,
                smooth_fwhm: 0.0,
                cfe_c: 0.5,
            },
            || {},
        );
        for fixel in 0..4 {
            assert_eq!(weights.row(fixel), &[(fixel as u32, 1.0)]);
        }
    }
}
