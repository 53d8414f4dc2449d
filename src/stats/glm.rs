//! General linear model t-tests
//!
//! Two engines discriminated at construction time: a fixed-design test with a
//! pre-computed contrast scaling and batched matrix products, and a
//! per-element variable-design test used whenever element-wise design columns
//! are supplied or the measurements contain non-finite values.
//!
//! Measurements are N x S (elements by subjects), the design is S x P and the
//! contrast matrix is C x (P + E) with each row an independent univariate
//! contrast.

use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewMut2};

use crate::error::{FixelError, FixelResult};
use crate::stats::math::{pinv, rank};

/// Fixels per batch in the fixed-design test
pub const GLM_BATCH_SIZE: usize = 1024;

/// Scale contrast rows for use in the t-test.
///
/// Each row c is multiplied by sqrt(dof / (c . pinv(X^T X) . c^T)), so that
/// the test statistic reduces to (beta . c) / |residual|. The Gram matrix is
/// invariant under row permutations of the design, so scaling is valid for
/// every permutation.
pub fn scale_contrasts(
    contrasts: &Array2<f64>,
    design: &Array2<f64>,
    dof: usize,
) -> FixelResult<Array2<f64>> {
    let gram_pinv = pinv(&design.t().dot(design));
    let mut scaled = contrasts.to_owned();
    for mut row in scaled.rows_mut() {
        let c = row.to_owned();
        let denom = c.dot(&gram_pinv.dot(&c));
        if !(denom > 0.0) {
            return Err(FixelError::Numerical(
                "contrast is orthogonal to the estimable space of the design".to_string(),
            ));
        }
        let alpha = (dof as f64 / denom).sqrt();
        row *= alpha;
    }
    Ok(scaled)
}

/// Bring a contrast matrix into row form and validate its shape.
///
/// Accepted shapes: C x (P+E), every row an independent univariate contrast,
/// or a single (P+E) x 1 column vector, transposed into one row. A matrix
/// with both dimensions above one that spans the design width along its rows
/// instead of its columns is a column-wise block of jointly tested weights
/// (a multivariate contrast) and is rejected; only univariate contrasts are
/// supported. Any other shape is a dimension mismatch.
pub fn canonicalise_contrasts(
    contrasts: &Array2<f64>,
    expected_columns: usize,
) -> FixelResult<Array2<f64>> {
    if contrasts.ncols() == expected_columns {
        return Ok(contrasts.to_owned());
    }
    if contrasts.ncols() == 1 && contrasts.nrows() == expected_columns {
        return Ok(contrasts.t().to_owned());
    }
    if contrasts.nrows() == expected_columns && contrasts.nrows() > 1 && contrasts.ncols() > 1 {
        return Err(FixelError::InputInvalid(format!(
            "multivariate contrast: the {} x {} contrast matrix spans the design width along its rows; each contrast must be a single row of weights, and jointly tested contrast blocks are not supported",
            contrasts.nrows(),
            contrasts.ncols()
        )));
    }
    Err(FixelError::InputInvalid(format!(
        "the number of columns per contrast ({}) does not equal the number of design matrix columns ({})",
        contrasts.ncols(),
        expected_columns
    )))
}

/// Fixed-design t-test: one design shared by every element
pub struct GlmFixed {
    measurements: Array2<f64>,
    design: Array2<f64>,
    scaled_contrasts: Array2<f64>,
}

impl GlmFixed {
    pub fn new(
        measurements: Array2<f64>,
        design: Array2<f64>,
        contrasts: Array2<f64>,
    ) -> FixelResult<Self> {
        let dof = design.nrows() - rank(&design);
        if dof == 0 {
            return Err(FixelError::InputInvalid(
                "design matrix has no residual degrees of freedom".to_string(),
            ));
        }
        let scaled_contrasts = scale_contrasts(&contrasts, &design, dof)?;
        Ok(GlmFixed {
            measurements,
            design,
            scaled_contrasts,
        })
    }

    /// t-statistics for one permutation of the design rows, C x N.
    /// Non-finite statistics are demoted to zero.
    pub fn tvalues(&self, permutation: &[usize]) -> Array2<f64> {
        let num_elements = self.measurements.nrows();
        let num_contrasts = self.scaled_contrasts.nrows();

        // The pseudo-inverse is recomputed from the permuted design rather
        // than row-shuffled, so it never depends on the factorisation used.
        let mut sx = Array2::zeros(self.design.dim());
        for (i, &p) in permutation.iter().enumerate() {
            sx.row_mut(i).assign(&self.design.row(p));
        }
        let pinv_sx = pinv(&sx);

        let mut stats = Array2::zeros((num_contrasts, num_elements));
        let mut start = 0;
        while start < num_elements {
            let end = (start + GLM_BATCH_SIZE).min(num_elements);
            let batch = self.measurements.slice(s![start..end, ..]);
            ttest(
                &batch,
                &sx,
                &pinv_sx,
                &self.scaled_contrasts,
                &mut stats.slice_mut(s![.., start..end]),
            );
            start = end;
        }
        stats
    }
}

/// One batched t-test: betas = Y pinv(SX)^T, residuals = Y - betas SX^T,
/// t = (betas . c) / |residual| per contrast row
fn ttest(
    measurements: &ArrayView2<f64>,
    sx: &Array2<f64>,
    pinv_sx: &Array2<f64>,
    scaled_contrasts: &Array2<f64>,
    stats: &mut ArrayViewMut2<f64>,
) {
    let betas = measurements.dot(&pinv_sx.t());
    let residuals = measurements - &betas.dot(&sx.t());
    for element in 0..measurements.nrows() {
        let residual = residuals.row(element);
        let norm = residual.dot(&residual).sqrt();
        for contrast in 0..scaled_contrasts.nrows() {
            let value = betas.row(element).dot(&scaled_contrasts.row(contrast)) / norm;
            stats[[contrast, element]] = if value.is_finite() { value } else { 0.0 };
        }
    }
}

/// Variable-design t-test: each element owns its design matrix, formed by
/// appending element-wise columns to the base design and dropping subjects
/// with non-finite entries
pub struct GlmVariable {
    measurements: Array2<f64>,
    design: Array2<f64>,
    contrasts: Array2<f64>,
    extra_columns: Vec<Array2<f64>>,
}

impl GlmVariable {
    pub fn new(
        measurements: Array2<f64>,
        design: Array2<f64>,
        contrasts: Array2<f64>,
        extra_columns: Vec<Array2<f64>>,
    ) -> FixelResult<Self> {
        for (index, column) in extra_columns.iter().enumerate() {
            if column.dim() != measurements.dim() {
                return Err(FixelError::InputInvalid(format!(
                    "element-wise column {} has shape {:?}, expected {:?}",
                    index,
                    column.dim(),
                    measurements.dim()
                )));
            }
        }
        Ok(GlmVariable {
            measurements,
            design,
            contrasts,
            extra_columns,
        })
    }

    /// The design matrix and measurement vector for one element under a
    /// permutation, with non-finite subjects dropped.
    pub fn element_design(
        &self,
        element: usize,
        permutation: &[usize],
    ) -> (Array2<f64>, Array1<f64>) {
        let num_subjects = self.design.nrows();
        let width = self.design.ncols() + self.extra_columns.len();
        let mut rows: Vec<f64> = Vec::with_capacity(num_subjects * width);
        let mut values: Vec<f64> = Vec::with_capacity(num_subjects);

        for subject in 0..num_subjects {
            let y = self.measurements[[element, subject]];
            let shuffled = permutation[subject];
            let mut row: Vec<f64> = self.design.row(shuffled).to_vec();
            for column in &self.extra_columns {
                row.push(column[[element, shuffled]]);
            }
            if y.is_finite() && row.iter().all(|v| v.is_finite()) {
                rows.extend_from_slice(&row);
                values.push(y);
            }
        }

        let kept = values.len();
        let design = Array2::from_shape_vec((kept, width), rows)
            .unwrap_or_else(|_| Array2::zeros((0, width)));
        (design, Array1::from_vec(values))
    }

    /// t-statistics for one permutation, C x N; numerical failures demote to zero
    pub fn tvalues(&self, permutation: &[usize]) -> Array2<f64> {
        let num_elements = self.measurements.nrows();
        let num_contrasts = self.contrasts.nrows();
        let mut stats = Array2::zeros((num_contrasts, num_elements));

        for element in 0..num_elements {
            let (design, values) = self.element_design(element, permutation);
            let dof = design.nrows().saturating_sub(rank(&design));
            if design.nrows() == 0 || dof == 0 {
                continue;
            }
            let pinv_design = pinv(&design);
            let betas = pinv_design.dot(&values);
            let residual = &values - &design.dot(&betas);
            let norm = residual.dot(&residual).sqrt();
            let gram_pinv = pinv(&design.t().dot(&design));

            for contrast in 0..num_contrasts {
                let c = self.contrasts.row(contrast);
                let denom = c.dot(&gram_pinv.dot(&c));
                if !(denom > 0.0) {
                    continue;
                }
                let alpha = (dof as f64 / denom).sqrt();
                let value = alpha * c.dot(&betas) / norm;
                if value.is_finite() {
                    stats[[contrast, element]] = value;
                }
            }
        }
        stats
    }
}

/// GLM test engine, discriminated at construction
pub enum GlmTest {
    Fixed(GlmFixed),
    Variable(GlmVariable),
}

impl GlmTest {
    /// Choose the engine: the variable-design path activates when element-wise
    /// columns were supplied or the measurements contain non-finite values.
    pub fn new(
        measurements: Array2<f64>,
        design: Array2<f64>,
        contrasts: &Array2<f64>,
        extra_columns: Vec<Array2<f64>>,
    ) -> FixelResult<Self> {
        if design.nrows() != measurements.ncols() {
            return Err(FixelError::InputInvalid(format!(
                "number of subjects ({}) does not match number of rows in design matrix ({})",
                measurements.ncols(),
                design.nrows()
            )));
        }
        let width = design.ncols() + extra_columns.len();
        let contrasts = canonicalise_contrasts(contrasts, width)?;
        let nans_in_data = measurements.iter().any(|v| !v.is_finite());
        if !extra_columns.is_empty() || nans_in_data {
            Ok(GlmTest::Variable(GlmVariable::new(
                measurements,
                design,
                contrasts,
                extra_columns,
            )?))
        } else {
            Ok(GlmTest::Fixed(GlmFixed::new(
                measurements,
                design,
                contrasts,
            )?))
        }
    }

    pub fn num_elements(&self) -> usize {
        match self {
            GlmTest::Fixed(t) => t.measurements.nrows(),
            GlmTest::Variable(t) => t.measurements.nrows(),
        }
    }

    pub fn num_subjects(&self) -> usize {
        match self {
            GlmTest::Fixed(t) => t.measurements.ncols(),
            GlmTest::Variable(t) => t.measurements.ncols(),
        }
    }

    pub fn num_contrasts(&self) -> usize {
        match self {
            GlmTest::Fixed(t) => t.scaled_contrasts.nrows(),
            GlmTest::Variable(t) => t.contrasts.nrows(),
        }
    }

    /// t-statistics for one permutation of the design rows, C x N
    pub fn tvalues(&self, permutation: &[usize]) -> Array2<f64> {
        match self {
            GlmTest::Fixed(t) => t.tvalues(permutation),
            GlmTest::Variable(t) => t.tvalues(permutation),
        }
    }

    /// The variable-design engine, when active
    pub fn as_variable(&self) -> Option<&GlmVariable> {
        match self {
            GlmTest::Variable(t) => Some(t),
            GlmTest::Fixed(_) => None,
        }
    }
}

/// Per-element report for the identity permutation
pub struct AllStats {
    /// Beta coefficients, (P + E) x N
    pub betas: Array2<f64>,
    /// Effect of interest per contrast, C x N
    pub abs_effect: Array2<f64>,
    /// Standardised effect size per contrast, C x N
    pub std_effect: Array2<f64>,
    /// Pooled standard deviation, C x N (identical rows)
    pub stdev: Array2<f64>,
}

/// Betas, effect sizes and pooled standard deviation by direct least squares
pub fn all_stats(
    measurements: &Array2<f64>,
    design: &Array2<f64>,
    contrasts: &Array2<f64>,
) -> AllStats {
    let num_contrasts = contrasts.nrows();
    let num_elements = measurements.nrows();

    let betas = pinv(design).dot(&measurements.t());
    let abs_effect = contrasts.dot(&betas);
    let residuals = &measurements.t() - &design.dot(&betas);
    let dof = design.nrows() as f64 - rank(design) as f64;

    let mut stdev = Array2::zeros((num_contrasts, num_elements));
    for element in 0..num_elements {
        let column = residuals.column(element);
        let rss = column.dot(&column);
        let value = if dof > 0.0 {
            (rss / dof).sqrt()
        } else {
            f64::NAN
        };
        for contrast in 0..num_contrasts {
            stdev[[contrast, element]] = value;
        }
    }
    let std_effect = &abs_effect / &stdev;

    AllStats {
        betas,
        abs_effect,
        std_effect,
        stdev,
    }
}

/// The identity permutation over S subjects
pub fn identity_permutation(num_subjects: usize) -> Vec<usize> {
    (0..num_subjects).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn group_design() -> Array2<f64> {
        array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]]
    }

    #[test]
    fn test_group_difference_tvalues() {
        // Two groups with means 1 and 3 plus a little noise; contrast group1 - group2
        let y = array![
            [1.1, 0.9, 3.1, 2.9],
            [1.1, 0.9, 3.1, 2.9]
        ];
        let glm = GlmTest::new(y, group_design(), &array![[1.0, -1.0]], Vec::new()).unwrap();
        assert!(matches!(glm, GlmTest::Fixed(_)));

        let stats = glm.tvalues(&identity_permutation(4));
        assert_eq!(stats.dim(), (1, 2));
        assert!(stats[[0, 0]] < 0.0, "group 2 larger, t = {}", stats[[0, 0]]);
        assert!(
            (stats[[0, 0]] - stats[[0, 1]]).abs() < 1e-9,
            "identical fixels share the t-value"
        );
        // Direct check: two-sample t with equal variances
        // mean diff -2, pooled var = 0.02, se = sqrt(0.02 * (1/2 + 1/2)) = sqrt(0.02)
        let expected = -2.0 / 0.02f64.sqrt();
        assert!(
            (stats[[0, 0]] - expected).abs() < 1e-6,
            "expected {}, got {}",
            expected,
            stats[[0, 0]]
        );
    }

    #[test]
    fn test_all_stats_betas() {
        let y = array![
            [1.0, 1.0, 3.0, 3.0],
            [1.0, 1.0, 3.0, 3.0]
        ];
        let report = all_stats(&y, &group_design(), &array![[1.0, -1.0]]);
        for element in 0..2 {
            assert!((report.betas[[0, element]] - 1.0).abs() < 1e-9);
            assert!((report.betas[[1, element]] - 3.0).abs() < 1e-9);
            assert!((report.abs_effect[[0, element]] + 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_nan_activates_variable_path() {
        let mut y = array![
            [1.1, 0.9, 3.1, 2.9],
            [1.1, 0.9, 3.1, 2.9]
        ];
        y[[0, 2]] = f64::NAN;
        let glm = GlmTest::new(y, group_design(), &array![[1.0, -1.0]], Vec::new()).unwrap();
        let variable = glm.as_variable().expect("NaN data must select the variable path");

        // Element 0 drops subject 2: 3 rows kept, rank 2, dof 1
        let (design, values) = variable.element_design(0, &identity_permutation(4));
        assert_eq!(design.nrows(), 3);
        assert_eq!(values.len(), 3);
        assert_eq!(design.nrows() - rank(&design), 1);

        // Element 1 keeps all subjects and must match the fixed-path statistic
        let y_clean = array![[1.1, 0.9, 3.1, 2.9]];
        let fixed =
            GlmTest::new(y_clean, group_design(), &array![[1.0, -1.0]], Vec::new()).unwrap();
        let stats_var = glm.tvalues(&identity_permutation(4));
        let stats_fixed = fixed.tvalues(&identity_permutation(4));
        assert!(
            (stats_var[[0, 1]] - stats_fixed[[0, 0]]).abs() < 1e-9,
            "variable {} vs fixed {}",
            stats_var[[0, 1]],
            stats_fixed[[0, 0]]
        );
    }

    #[test]
    fn test_element_wise_column() {
        // One extra column equal everywhere except element 1, where it tracks y
        let y = array![
            [1.0, 2.0, 3.0, 4.2],
            [4.1, 3.0, 2.0, 1.0]
        ];
        let extra = array![
            [1.0, 1.0, 1.0, 1.0],
            [4.0, 3.0, 2.0, 1.0]
        ];
        let design = array![[1.0], [1.0], [1.0], [1.0]];
        let glm = GlmTest::new(y, design, &array![[0.0, 1.0]], vec![extra]).unwrap();
        let stats = glm.tvalues(&identity_permutation(4));
        assert_eq!(stats.dim(), (1, 2));
        // Element 1's covariate explains its data almost perfectly
        assert!(
            stats[[0, 1]].abs() > stats[[0, 0]].abs(),
            "element 1 ({}) should beat element 0 ({})",
            stats[[0, 1]],
            stats[[0, 0]]
        );
    }

    #[test]
    fn test_degenerate_design_demotes_to_zero() {
        // After dropping NaN subjects only two rows remain for element 0;
        // rank-2 design leaves no degrees of freedom, so t stays 0
        let y = array![[1.0, f64::NAN, 3.0, f64::NAN]];
        let glm = GlmTest::new(y, group_design(), &array![[1.0, -1.0]], Vec::new()).unwrap();
        let stats = glm.tvalues(&identity_permutation(4));
        assert_eq!(stats[[0, 0]], 0.0);
    }

    #[test]
    fn test_rejects_contrast_width_mismatch() {
        let y = array![[1.0, 2.0, 3.0, 4.0]];
        let result = GlmTest::new(y, group_design(), &array![[1.0, -1.0, 0.5]], Vec::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_column_contrast_transposed() {
        let contrasts = canonicalise_contrasts(&array![[1.0], [-1.0]], 2).unwrap();
        assert_eq!(contrasts.dim(), (1, 2));
        assert_eq!(contrasts[[0, 1]], -1.0);
    }

    #[test]
    fn test_multiple_row_contrasts_accepted() {
        let contrasts =
            canonicalise_contrasts(&array![[1.0, -1.0], [-1.0, 1.0]], 2).unwrap();
        assert_eq!(contrasts.dim(), (2, 2));
    }

    #[test]
    fn test_rejects_multivariate_contrast() {
        // Design width along the rows with several columns: a jointly tested
        // block rather than independent row contrasts
        let result = canonicalise_contrasts(&array![[1.0, 0.5, 0.0], [-1.0, 0.5, 1.0]], 2);
        let message = match result {
            Err(FixelError::InputInvalid(message)) => message,
            other => panic!("expected InputInvalid, got {:?}", other.map(|m| m.dim())),
        };
        assert!(
            message.contains("multivariate contrast"),
            "unexpected message: {}",
            message
        );
    }

    #[test]
    fn test_permutation_changes_statistic() {
        let y = array![[1.0, 1.2, 3.0, 3.2]];
        let glm = GlmTest::new(y, group_design(), &array![[1.0, -1.0]], Vec::new()).unwrap();
        let identity = glm.tvalues(&identity_permutation(4));
        let swapped = glm.tvalues(&[0, 2, 1, 3]);
        assert!(
            (identity[[0, 0]] - swapped[[0, 0]]).abs() > 1e-6,
            "permutation must change the statistic"
        );
    }
}
