//! Small dense linear algebra for the GLM
//!
//! Pseudo-inverse and rank are computed from a Jacobi eigendecomposition of
//! the Gram matrix. Design matrices here are tall and narrow (subjects x a few
//! regressors), so the n x n eigenproblem is tiny. Singular values below an
//! absolute 1e-10 are treated as zero.

use ndarray::{Array1, Array2};

/// Singular values below this are treated as zero
pub const SINGULAR_TOLERANCE: f64 = 1e-10;

/// Jacobi eigendecomposition of a symmetric matrix.
/// Returns (eigenvalues, eigenvectors as columns), unsorted.
fn jacobi_eigen_symmetric(a: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = a.nrows();
    debug_assert_eq!(a.nrows(), a.ncols());

    let mut d = a.clone();
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..100 * n * n {
        // Largest off-diagonal element
        let mut max_val = 0.0f64;
        let (mut p, mut q) = (0, 1);
        for i in 0..n {
            for j in (i + 1)..n {
                let value = d[[i, j]].abs();
                if value > max_val {
                    max_val = value;
                    p = i;
                    q = j;
                }
            }
        }
        if max_val < 1e-14 {
            break;
        }

        let app = d[[p, p]];
        let aqq = d[[q, q]];
        let apq = d[[p, q]];
        let theta = if (app - aqq).abs() < 1e-30 {
            std::f64::consts::FRAC_PI_4
        } else {
            0.5 * (2.0 * apq / (app - aqq)).atan()
        };
        let c = theta.cos();
        let s = theta.sin();

        // Apply the Givens rotation to rows p,q then columns p,q of D
        for j in 0..n {
            let dpj = d[[p, j]];
            let dqj = d[[q, j]];
            d[[p, j]] = c * dpj + s * dqj;
            d[[q, j]] = -s * dpj + c * dqj;
        }
        for i in 0..n {
            let dip = d[[i, p]];
            let diq = d[[i, q]];
            d[[i, p]] = c * dip + s * diq;
            d[[i, q]] = -s * dip + c * diq;
        }
        for i in 0..n {
            let vip = v[[i, p]];
            let viq = v[[i, q]];
            v[[i, p]] = c * vip + s * viq;
            v[[i, q]] = -s * vip + c * viq;
        }
    }

    let eigenvalues = Array1::from_iter((0..n).map(|i| d[[i, i]]));
    (eigenvalues, v)
}

/// Moore-Penrose pseudo-inverse.
///
/// For a tall matrix the Gram matrix is formed on the narrow side; a wide
/// matrix is handled by transposition.
pub fn pinv(a: &Array2<f64>) -> Array2<f64> {
    if a.nrows() < a.ncols() {
        return pinv(&a.t().to_owned()).t().to_owned();
    }
    let gram = a.t().dot(a);
    let (eigenvalues, v) = jacobi_eigen_symmetric(&gram);
    let n = gram.nrows();

    // pinv(A) = V diag(1/lambda) V^T A^T over the non-null eigenspace
    let mut core = Array2::<f64>::zeros((n, n));
    for k in 0..n {
        let lambda = eigenvalues[k].max(0.0);
        if lambda.sqrt() <= SINGULAR_TOLERANCE {
            continue;
        }
        let inv = 1.0 / lambda;
        for i in 0..n {
            for j in 0..n {
                core[[i, j]] += v[[i, k]] * inv * v[[j, k]];
            }
        }
    }
    core.dot(&a.t())
}

/// Rank of a matrix: number of singular values above the tolerance
pub fn rank(a: &Array2<f64>) -> usize {
    let gram = if a.nrows() < a.ncols() {
        a.dot(&a.t())
    } else {
        a.t().dot(a)
    };
    let (eigenvalues, _) = jacobi_eigen_symmetric(&gram);
    eigenvalues
        .iter()
        .filter(|&&l| l.max(0.0).sqrt() > SINGULAR_TOLERANCE)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>, tol: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "expected {}, got {}", y, x);
        }
    }

    #[test]
    fn test_pinv_identity() {
        let eye = Array2::<f64>::eye(3);
        assert_close(&pinv(&eye), &eye, 1e-10);
    }

    #[test]
    fn test_pinv_group_design() {
        let x = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let expected = array![[0.5, 0.5, 0.0, 0.0], [0.0, 0.0, 0.5, 0.5]];
        assert_close(&pinv(&x), &expected, 1e-9);
    }

    #[test]
    fn test_pinv_reconstruction() {
        let a = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.5]];
        let p = pinv(&a);
        // A pinv(A) A = A
        assert_close(&a.dot(&p).dot(&a), &a, 1e-8);
    }

    #[test]
    fn test_pinv_wide() {
        let a = array![[1.0, 0.0, 2.0], [0.0, 1.0, -1.0]];
        let p = pinv(&a);
        assert_eq!(p.dim(), (3, 2));
        assert_close(&a.dot(&p).dot(&a), &a, 1e-8);
    }

    #[test]
    fn test_rank() {
        assert_eq!(rank(&Array2::<f64>::eye(4)), 4);
        let deficient = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        assert_eq!(rank(&deficient), 1);
        let design = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        assert_eq!(rank(&design), 2);
    }
}
