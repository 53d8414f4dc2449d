//! Permutation testing
//!
//! Generates (or loads) sign-flip-free row permutations of the design matrix,
//! drives the per-permutation GLM + CFE computation over a worker pool, and
//! converts the resulting maximum-statistic distribution into family-wise
//! error corrected p-values. An optional pre-pass estimates a per-fixel
//! empirical CFE statistic used to adjust for non-stationarity.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{FixelError, FixelResult};
use crate::stats::cfe::Enhancer;
use crate::stats::glm::GlmTest;

/// Saturating n! for permutation-space exhaustion checks
pub fn factorial_saturating(n: usize) -> usize {
    let mut total = 1usize;
    for k in 2..=n {
        total = match total.checked_mul(k) {
            Some(v) => v,
            None => return usize::MAX,
        };
    }
    total
}

/// Generate unique random permutations of [0, num_subjects).
///
/// The identity is pinned to index 0 when `include_identity` is set and counts
/// towards `num_perms`. Requesting more permutations than the space holds
/// fails with `PermutationSpaceExhausted` before any drawing.
pub fn generate_permutations<R: Rng>(
    num_perms: usize,
    num_subjects: usize,
    include_identity: bool,
    rng: &mut R,
) -> FixelResult<Vec<Vec<usize>>> {
    if num_subjects == 0 || num_perms == 0 {
        return Err(FixelError::InputInvalid(
            "permutation testing requires at least one subject and one permutation".to_string(),
        ));
    }
    if num_perms > factorial_saturating(num_subjects) {
        return Err(FixelError::PermutationSpaceExhausted {
            requested: num_perms,
            subjects: num_subjects,
        });
    }

    let identity: Vec<usize> = (0..num_subjects).collect();
    let mut seen: HashSet<Vec<usize>> = HashSet::new();
    let mut permutations = Vec::with_capacity(num_perms);
    if include_identity {
        seen.insert(identity.clone());
        permutations.push(identity.clone());
    }
    while permutations.len() < num_perms {
        let mut candidate = identity.clone();
        candidate.shuffle(rng);
        if seen.insert(candidate.clone()) {
            permutations.push(candidate);
        }
    }
    Ok(permutations)
}

/// Load permutation vectors from a whitespace-delimited text file, one
/// permutation per line. Every line must be a bijection of [0, S).
pub fn load_permutations_file(path: &Path) -> FixelResult<Vec<Vec<usize>>> {
    let text = fs::read_to_string(path).map_err(|e| FixelError::io(path, e))?;
    let mut permutations: Vec<Vec<usize>> = Vec::new();
    for (line_number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let indices: Vec<usize> = line
            .split_whitespace()
            .map(|v| {
                v.parse::<usize>().map_err(|_| {
                    FixelError::InputInvalid(format!(
                        "{}: malformed permutation index \"{}\" on line {}",
                        path.display(),
                        v,
                        line_number + 1
                    ))
                })
            })
            .collect::<FixelResult<_>>()?;
        if let Some(first) = permutations.first() {
            if indices.len() != first.len() {
                return Err(FixelError::InputInvalid(format!(
                    "{}: inconsistent permutation length on line {}",
                    path.display(),
                    line_number + 1
                )));
            }
        }
        let mut used = vec![false; indices.len()];
        for &index in &indices {
            if index >= indices.len() || used[index] {
                return Err(FixelError::InputInvalid(format!(
                    "{}: line {} is not a permutation of 0..{}",
                    path.display(),
                    line_number + 1,
                    indices.len()
                )));
            }
            used[index] = true;
        }
        permutations.push(indices);
    }
    if permutations.is_empty() {
        return Err(FixelError::InputInvalid(format!(
            "{}: no permutations found",
            path.display()
        )));
    }
    Ok(permutations)
}

/// Divide a CFE map by the empirical statistic, guarding zeros with zero
fn adjust(enhanced: &mut [f64], empirical: &[f64]) {
    for (value, &divisor) in enhanced.iter_mut().zip(empirical.iter()) {
        *value = if divisor > 0.0 { *value / divisor } else { 0.0 };
    }
}

/// Observed (identity permutation) statistics: adjusted CFE and t-values, C x N
pub fn default_permutation(
    glm: &GlmTest,
    enhancer: &Enhancer,
    empirical: Option<&Array2<f64>>,
) -> (Array2<f64>, Array2<f64>) {
    let identity: Vec<usize> = (0..glm.num_subjects()).collect();
    let tvalues = glm.tvalues(&identity);
    let mut cfe = Array2::zeros(tvalues.dim());
    for contrast in 0..tvalues.nrows() {
        let row: Vec<f64> = tvalues.row(contrast).to_vec();
        let mut enhanced = enhancer.enhance(&row);
        if let Some(empirical) = empirical {
            adjust(&mut enhanced, empirical.row(contrast).to_vec().as_slice());
        }
        for (fixel, value) in enhanced.into_iter().enumerate() {
            cfe[[contrast, fixel]] = value;
        }
    }
    (cfe, tvalues)
}

/// Mean per-fixel CFE across a set of permutations (non-stationarity pre-pass)
pub fn empirical_statistic<F: Fn() + Sync>(
    permutations: &[Vec<usize>],
    glm: &GlmTest,
    enhancer: &Enhancer,
    threads: usize,
    on_permutation: F,
) -> Array2<f64> {
    let num_contrasts = glm.num_contrasts();
    let num_elements = glm.num_elements();
    let cursor = AtomicUsize::new(0);
    let sum = Mutex::new(Array2::<f64>::zeros((num_contrasts, num_elements)));

    std::thread::scope(|scope| {
        for _ in 0..threads.max(1) {
            scope.spawn(|| {
                let mut local = Array2::<f64>::zeros((num_contrasts, num_elements));
                loop {
                    let index = cursor.fetch_add(1, Ordering::Relaxed);
                    if index >= permutations.len() {
                        break;
                    }
                    let tvalues = glm.tvalues(&permutations[index]);
                    for contrast in 0..num_contrasts {
                        let row: Vec<f64> = tvalues.row(contrast).to_vec();
                        let enhanced = enhancer.enhance(&row);
                        for (fixel, value) in enhanced.into_iter().enumerate() {
                            local[[contrast, fixel]] += value;
                        }
                    }
                    on_permutation();
                }
                let mut sum = sum.lock().unwrap();
                *sum += &local;
            });
        }
    });

    let mut mean = sum.into_inner().unwrap_or_else(|e| e.into_inner());
    mean /= permutations.len().max(1) as f64;
    mean
}

/// Null distribution and uncorrected p-values from a permutation run
pub struct PermutationResult {
    /// Maximum adjusted CFE per contrast per permutation, C x num_perms
    pub distribution: Array2<f64>,
    /// Fraction of permutations reaching each fixel's observed CFE, C x N
    pub uncorrected_pvalues: Array2<f64>,
}

/// Run the full permutation test.
///
/// Each worker claims permutation indices from a shared cursor, computes the
/// t-statistics and adjusted CFE map, records the map's maximum into its own
/// column of the distribution and tallies per-fixel exceedances locally;
/// tallies are reduced once per worker.
pub fn run_permutations<F: Fn() + Sync>(
    permutations: &[Vec<usize>],
    glm: &GlmTest,
    enhancer: &Enhancer,
    empirical: Option<&Array2<f64>>,
    observed_cfe: &Array2<f64>,
    threads: usize,
    on_permutation: F,
) -> PermutationResult {
    let num_contrasts = glm.num_contrasts();
    let num_elements = glm.num_elements();
    let num_perms = permutations.len();
    let cursor = AtomicUsize::new(0);
    let distribution = Mutex::new(Array2::<f64>::zeros((num_contrasts, num_perms)));
    let tally = Mutex::new(Array2::<f64>::zeros((num_contrasts, num_elements)));

    std::thread::scope(|scope| {
        for _ in 0..threads.max(1) {
            scope.spawn(|| {
                let mut local_tally = Array2::<f64>::zeros((num_contrasts, num_elements));
                loop {
                    let index = cursor.fetch_add(1, Ordering::Relaxed);
                    if index >= num_perms {
                        break;
                    }
                    let tvalues = glm.tvalues(&permutations[index]);
                    let mut maxima = vec![0.0f64; num_contrasts];
                    for contrast in 0..num_contrasts {
                        let row: Vec<f64> = tvalues.row(contrast).to_vec();
                        let mut enhanced = enhancer.enhance(&row);
                        if let Some(empirical) = empirical {
                            adjust(&mut enhanced, empirical.row(contrast).to_vec().as_slice());
                        }
                        for (fixel, &value) in enhanced.iter().enumerate() {
                            if value > maxima[contrast] {
                                maxima[contrast] = value;
                            }
                            if value >= observed_cfe[[contrast, fixel]] {
                                local_tally[[contrast, fixel]] += 1.0;
                            }
                        }
                    }
                    let mut distribution = distribution.lock().unwrap();
                    for (contrast, &max) in maxima.iter().enumerate() {
                        distribution[[contrast, index]] = max;
                    }
                    drop(distribution);
                    on_permutation();
                }
                let mut tally = tally.lock().unwrap();
                *tally += &local_tally;
            });
        }
    });

    let distribution = distribution.into_inner().unwrap_or_else(|e| e.into_inner());
    let mut uncorrected = tally.into_inner().unwrap_or_else(|e| e.into_inner());
    uncorrected /= num_perms.max(1) as f64;
    PermutationResult {
        distribution,
        uncorrected_pvalues: uncorrected,
    }
}

/// Family-wise error corrected p-values from the maximum-statistic
/// distribution of one contrast.
///
/// With the distribution sorted ascending and j the count of permutation
/// maxima not exceeding the observed value, p = 1 - j / num_perms, clamped to
/// 1/num_perms so an observed value above the whole distribution can never
/// reach zero. Non-positive observed values map to zero by convention.
pub fn statistic2pvalue(distribution: &[f64], observed: &[f64]) -> Vec<f64> {
    let mut sorted = distribution.to_vec();
    sorted.sort_by(f64::total_cmp);
    let num_perms = sorted.len();

    observed
        .iter()
        .map(|&value| {
            if !(value > 0.0) {
                return 0.0;
            }
            let below = sorted.partition_point(|&d| d <= value);
            let p = 1.0 - below as f64 / num_perms as f64;
            p.max(1.0 / num_perms as f64)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::{normalise, ConnectivityGraph, GraphBuild, NormaliseOptions};
    use crate::fixel::FixelAtlas;
    use crate::mif::identity_transform;
    use crate::stats::glm::identity_permutation;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_factorial() {
        assert_eq!(factorial_saturating(0), 1);
        assert_eq!(factorial_saturating(4), 24);
        assert_eq!(factorial_saturating(64), usize::MAX);
    }

    #[test]
    fn test_generate_unique_permutations() {
        let mut rng = StdRng::seed_from_u64(7);
        let perms = generate_permutations(6, 3, true, &mut rng).unwrap();
        assert_eq!(perms.len(), 6);
        assert_eq!(perms[0], vec![0, 1, 2], "identity pinned to index 0");
        let unique: HashSet<_> = perms.iter().collect();
        assert_eq!(unique.len(), 6, "all 3! permutations drawn exactly once");
    }

    #[test]
    fn test_exhaustion_detected() {
        let mut rng = StdRng::seed_from_u64(7);
        let result = generate_permutations(7, 3, true, &mut rng);
        assert!(matches!(
            result,
            Err(FixelError::PermutationSpaceExhausted {
                requested: 7,
                subjects: 3
            })
        ));
    }

    #[test]
    fn test_statistic2pvalue() {
        let distribution = vec![1.0, 2.0, 3.0, 4.0];
        let p = statistic2pvalue(&distribution, &[0.5, 1.5, 3.5, 10.0, -1.0, 0.0]);
        assert_eq!(p[0], 1.0, "below the whole distribution");
        assert_eq!(p[1], 0.75);
        assert_eq!(p[2], 0.25);
        assert_eq!(p[3], 0.25, "above the whole distribution clamps to 1/n");
        assert_eq!(p[4], 0.0, "negative observed");
        assert_eq!(p[5], 0.0, "zero observed");
    }

    fn chain_graph(num_fixels: usize) -> ConnectivityGraph {
        let atlas = FixelAtlas::from_parts(
            [num_fixels, 1, 1],
            [1.0, 1.0, 1.0],
            identity_transform(),
            vec![1; num_fixels],
            vec![[1.0, 0.0, 0.0]; num_fixels],
        )
        .unwrap();
        let mut build = GraphBuild::new(num_fixels);
        build.tdi = vec![1.0; num_fixels];
        for i in 0..num_fixels.saturating_sub(1) {
            build.edges[i].insert(i as u32 + 1, 1);
            build.edges[i + 1].insert(i as u32, 1);
        }
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

    fn null_glm(num_fixels: usize, num_subjects: usize, seed: u64) -> GlmTest {
        use rand::Rng;
        let mut rng = StdRng::seed_from_u64(seed);
        let measurements = Array2::from_shape_fn((num_fixels, num_subjects), |_| {
            rng.gen::<f64>() * 2.0 - 1.0
        });
        let mut design = Array2::zeros((num_subjects, 2));
        for subject in 0..num_subjects {
            design[[subject, subject % 2]] = 1.0;
        }
        let contrasts = ndarray::array![[1.0, -1.0]];
        GlmTest::new(measurements, design, &contrasts, Vec::new()).unwrap()
    }

    #[test]
    fn test_run_permutations_identity_pinned() {
        let graph = chain_graph(8);
        let enhancer = Enhancer::new(&graph, 0.1, 2.0, 3.0);
        let glm = null_glm(8, 8, 21);
        let mut rng = StdRng::seed_from_u64(3);
        let permutations = generate_permutations(20, 8, true, &mut rng).unwrap();

        let (observed, _) = default_permutation(&glm, &enhancer, None);
        let result =
            run_permutations(&permutations, &glm, &enhancer, None, &observed, 2, || {});

        assert_eq!(result.distribution.dim(), (1, 20));
        // The identity permutation's entry is the observed maximum
        let observed_max = observed.row(0).iter().cloned().fold(0.0f64, f64::max);
        assert!(
            (result.distribution[[0, 0]] - observed_max).abs() < 1e-12,
            "identity at index 0: {} vs {}",
            result.distribution[[0, 0]],
            observed_max
        );
        // Uncorrected p-values count the identity itself, so they sit in [1/20, 1]
        for &p in result.uncorrected_pvalues.iter() {
            assert!((0.05..=1.0).contains(&p), "uncorrected p {}", p);
        }
    }

    #[test]
    fn test_null_distribution_sanity() {
        let graph = chain_graph(16);
        let enhancer = Enhancer::new(&graph, 0.1, 2.0, 3.0);
        let glm = null_glm(16, 12, 99);
        let mut rng = StdRng::seed_from_u64(5);
        let permutations = generate_permutations(100, 12, true, &mut rng).unwrap();
        let (observed, _) = default_permutation(&glm, &enhancer, None);
        let result =
            run_permutations(&permutations, &glm, &enhancer, None, &observed, 4, || {});

        let mut maxima: Vec<f64> = result.distribution.row(0).to_vec();
        assert!(maxima.iter().all(|v| v.is_finite() && *v >= 0.0));
        maxima.sort_by(f64::total_cmp);
        // Exchangeable noise: the bulk of the null maxima stay the same order
        // of magnitude
        let low = maxima[9];
        let high = maxima[89];
        assert!(
            high <= low * 16.0 + 1e-12,
            "null maxima spread too wide: p10 {} p90 {}",
            low,
            high
        );
    }

    #[test]
    fn test_empirical_adjustment_flattens_itself() {
        let graph = chain_graph(8);
        let enhancer = Enhancer::new(&graph, 0.1, 2.0, 3.0);
        let glm = null_glm(8, 8, 13);
        let identity = vec![identity_permutation(8)];
        let empirical = empirical_statistic(&identity, &glm, &enhancer, 1, || {});
        let (adjusted, _) = default_permutation(&glm, &enhancer, Some(&empirical));
        // Dividing the identity CFE map by itself yields 1 wherever it is non-zero
        for contrast in 0..adjusted.nrows() {
            for fixel in 0..adjusted.ncols() {
                let value = adjusted[[contrast, fixel]];
                assert!(
                    value == 0.0 || (value - 1.0).abs() < 1e-9,
                    "adjusted value {}",
                    value
                );
            }
        }
    }
}
