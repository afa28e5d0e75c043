//! Numerically stable log-space primitives shared by the lattice and
//! emission-family M-steps.
//!
//! Log-space sentinels: log(0) is represented as [`f64::NEG_INFINITY`],
//! never `NaN`. Every function here is written so an all-`-inf` input
//! produces `-inf`, not `NaN`.

use nalgebra::{Cholesky, DMatrix, DVector};
use std::f64::consts::PI;

use crate::error::{HmmError, Result};

const NEG_INF: f64 = f64::NEG_INFINITY;

/// `log(sum(exp(v)))`, computed as `m + log(sum(exp(v - m)))` where `m =
/// max(v)`. Returns `-inf` if `v` is empty or every entry is `-inf`.
pub fn logsumexp(v: &[f64]) -> f64 {
    let m = v.iter().copied().fold(NEG_INF, f64::max);
    if !m.is_finite() {
        // m == -inf (all entries -inf, or v empty) or m == +inf (shouldn't
        // occur for log-probabilities but guarded rather than propagating NaN).
        return m;
    }
    let sum: f64 = v.iter().map(|&x| (x - m).exp()).sum();
    m + sum.ln()
}

/// `logsumexp` over a [`DVector`].
pub fn logsumexp_vec(v: &DVector<f64>) -> f64 {
    logsumexp(v.as_slice())
}

/// `y[j] = logsumexp_i(log_a[i, j] + log_x[i])`, i.e. a log-space
/// matrix-vector product where `log_a` is N x N and `log_x` is length N.
pub fn log_mat_vec_log(log_a: &DMatrix<f64>, log_x: &DVector<f64>) -> DVector<f64> {
    let rows = log_a.nrows();
    let cols = log_a.ncols();
    debug_assert_eq!(rows, log_x.len());
    let mut y = DVector::from_element(cols, NEG_INF);
    let mut buf = vec![0.0; rows];
    for j in 0..cols {
        for i in 0..rows {
            buf[i] = log_a[(i, j)] + log_x[i];
        }
        y[j] = logsumexp(&buf);
    }
    y
}

/// Normalises a row of log-probabilities in place (subtracts its
/// `logsumexp`) and returns the `logsumexp` that was subtracted.
pub fn log_normalize_row(row: &mut [f64]) -> f64 {
    let lse = logsumexp(row);
    if lse.is_finite() {
        for x in row.iter_mut() {
            *x -= lse;
        }
    }
    lse
}

/// Multivariate Gaussian log-density using a Cholesky factorisation of
/// `cov`, per spec §4.1:
///
/// `-1/2 * (D*ln(2*pi) + 2*sum(ln(diag(L))) + ||L^-1(x - mean)||^2)`
///
/// If `cov` is not positive-definite, `min_covar * I` is added once and
/// the factorisation retried; if it is still not PD this returns
/// [`HmmError::NonPositiveDefinite`].
pub fn gaussian_log_density_chol(
    x: &DVector<f64>,
    mean: &DVector<f64>,
    cov: &DMatrix<f64>,
    min_covar: f64,
) -> Result<f64> {
    let d = mean.len();
    let diff = x - mean;

    let chol = match Cholesky::new(cov.clone()) {
        Some(c) => c,
        None => {
            let floored = cov + DMatrix::<f64>::identity(d, d) * min_covar;
            Cholesky::new(floored).ok_or_else(|| {
                HmmError::NonPositiveDefinite(
                    "covariance is not positive-definite even after min_covar flooring".into(),
                )
            })?
        }
    };

    let l = chol.l();
    let log_det: f64 = (0..d).map(|i| l[(i, i)].ln()).sum::<f64>() * 2.0;
    let solved = chol.solve(&diff);
    let quad = diff.dot(&solved);

    Ok(-0.5 * (d as f64 * (2.0 * PI).ln() + log_det + quad))
}

/// Cholesky factor of `cov`, flooring once with `min_covar * I` on failure.
/// Used by the GMM/Gaussian full- and tied-covariance M-steps to validate
/// a re-estimated covariance before it is accepted.
pub fn cholesky_with_floor(cov: &DMatrix<f64>, min_covar: f64) -> Result<DMatrix<f64>> {
    let d = cov.nrows();
    if let Some(c) = Cholesky::new(cov.clone()) {
        return Ok(c.l());
    }
    let floored = cov + DMatrix::<f64>::identity(d, d) * min_covar;
    Cholesky::new(floored)
        .map(|c| c.l())
        .ok_or_else(|| HmmError::NonPositiveDefinite("smallest eigenvalue <= 0 after flooring".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn logsumexp_all_neg_inf_is_neg_inf() {
        let v = vec![NEG_INF, NEG_INF, NEG_INF];
        assert_eq!(logsumexp(&v), NEG_INF);
    }

    #[test]
    fn logsumexp_empty_is_neg_inf() {
        let v: Vec<f64> = vec![];
        assert_eq!(logsumexp(&v), NEG_INF);
    }

    #[test]
    fn logsumexp_matches_naive_for_moderate_values() {
        let v = vec![1.0_f64, 2.0, 3.0];
        let naive = (v.iter().map(|x| x.exp()).sum::<f64>()).ln();
        assert_relative_eq!(logsumexp(&v), naive, epsilon = 1e-12);
    }

    #[test]
    fn logsumexp_stable_for_large_values() {
        let v = vec![1000.0, 1000.0];
        assert_relative_eq!(logsumexp(&v), 1000.0 + 2.0_f64.ln(), epsilon = 1e-9);
    }

    #[test]
    fn log_normalize_row_sums_to_zero_in_prob_space() {
        let mut row = vec![0.1_f64.ln(), 0.4_f64.ln(), 0.5_f64.ln()];
        log_normalize_row(&mut row);
        let total: f64 = row.iter().map(|x| x.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn gaussian_log_density_matches_univariate_normal() {
        let x = DVector::from_vec(vec![1.0]);
        let mean = DVector::from_vec(vec![0.0]);
        let cov = DMatrix::from_vec(1, 1, vec![1.0]);
        let got = gaussian_log_density_chol(&x, &mean, &cov, 1e-6).unwrap();
        let expected = -0.5 * (2.0 * PI).ln() - 0.5;
        assert_relative_eq!(got, expected, epsilon = 1e-9);
    }

    #[test]
    fn gaussian_log_density_floors_non_pd_covariance() {
        let x = DVector::from_vec(vec![0.0, 0.0]);
        let mean = DVector::from_vec(vec![0.0, 0.0]);
        // Singular (rank-1) covariance: not PD, must be floored to succeed.
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let got = gaussian_log_density_chol(&x, &mean, &cov, 1e-3);
        assert!(got.is_ok());
    }
}
