//! Validates and projects parameter matrices onto the probability
//! simplex (spec §4.7).

use nalgebra::{DMatrix, DVector};

use crate::error::{HmmError, Result};
use crate::numeric::cholesky_with_floor;
use crate::model::CovarianceType;

/// `max(v + prior - 1, 0)`, normalised to sum to 1; returns a uniform
/// distribution if the result sums to zero.
pub fn normalize_row(v: &DVector<f64>, prior: f64) -> DVector<f64> {
    let n = v.len();
    let mut out = DVector::from_iterator(n, v.iter().map(|&x| (x + prior - 1.0).max(0.0)));
    let sum: f64 = out.iter().sum();
    if sum > 0.0 {
        out /= sum;
    } else {
        out = DVector::from_element(n, 1.0 / n as f64);
    }
    out
}

/// Row-normalises every row of `m` with `normalize_row`.
pub fn normalize_rows(m: &DMatrix<f64>, prior: f64) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(m.nrows(), m.ncols());
    for i in 0..m.nrows() {
        let row = DVector::from_iterator(m.ncols(), m.row(i).iter().copied());
        let normalized = normalize_row(&row, prior);
        for j in 0..m.ncols() {
            out[(i, j)] = normalized[j];
        }
    }
    out
}

/// Checks every row of `m` sums to 1 within `1e-9` and has no negative
/// entries.
pub fn validate_stochastic(m: &DMatrix<f64>, name: &str) -> Result<()> {
    for i in 0..m.nrows() {
        let mut sum = 0.0;
        for j in 0..m.ncols() {
            let v = m[(i, j)];
            if v < 0.0 {
                return Err(HmmError::NotStochastic(format!(
                    "{name} row {i} has a negative entry: {v}"
                )));
            }
            sum += v;
        }
        if (sum - 1.0).abs() > 1e-9 {
            return Err(HmmError::NotStochastic(format!(
                "{name} row {i} sums to {sum}, expected 1"
            )));
        }
    }
    Ok(())
}

/// Checks `v` itself sums to 1 within `1e-9` and has no negative entries.
pub fn validate_stochastic_vec(v: &DVector<f64>, name: &str) -> Result<()> {
    let mut sum = 0.0;
    for &x in v.iter() {
        if x < 0.0 {
            return Err(HmmError::NotStochastic(format!("{name} has a negative entry: {x}")));
        }
        sum += x;
    }
    if (sum - 1.0).abs() > 1e-9 {
        return Err(HmmError::NotStochastic(format!("{name} sums to {sum}, expected 1")));
    }
    Ok(())
}

/// Validates a covariance matrix against its declared `covariance_type`:
/// shape, symmetry within `1e-9`, and positive-definiteness (checked via
/// a Cholesky attempt for `full`/`tied`).
pub fn validate_covariance(cov: &DMatrix<f64>, cov_type: CovarianceType, min_covar: f64) -> Result<()> {
    if cov.nrows() != cov.ncols() {
        return Err(HmmError::ShapeMismatch(format!(
            "covariance must be square, got {}x{}",
            cov.nrows(),
            cov.ncols()
        )));
    }
    for i in 0..cov.nrows() {
        for j in 0..cov.ncols() {
            if (cov[(i, j)] - cov[(j, i)]).abs() > 1e-9 {
                return Err(HmmError::NonPositiveDefinite(format!(
                    "covariance is not symmetric at ({i}, {j})"
                )));
            }
        }
    }
    match cov_type {
        CovarianceType::Full | CovarianceType::Tied => {
            cholesky_with_floor(cov, min_covar)?;
        }
        CovarianceType::Diag | CovarianceType::Spherical => {
            for i in 0..cov.nrows() {
                if cov[(i, i)] <= 0.0 {
                    return Err(HmmError::NonPositiveDefinite(format!(
                        "diagonal entry {i} is not positive: {}",
                        cov[(i, i)]
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_row_with_uninformative_prior_just_normalizes() {
        let v = DVector::from_vec(vec![1.0, 3.0]);
        let out = normalize_row(&v, 1.0);
        assert_eq!(out, DVector::from_vec(vec![0.25, 0.75]));
    }

    #[test]
    fn normalize_row_of_all_zero_falls_back_to_uniform() {
        let v = DVector::from_vec(vec![0.0, 0.0, 0.0]);
        let out = normalize_row(&v, 1.0);
        assert_eq!(out, DVector::from_element(3, 1.0 / 3.0));
    }

    #[test]
    fn validate_stochastic_rejects_bad_row_sum() {
        let m = DMatrix::from_row_slice(1, 2, &[0.5, 0.6]);
        assert!(validate_stochastic(&m, "trans_mat").is_err());
    }

    #[test]
    fn validate_stochastic_rejects_negative_entry() {
        let m = DMatrix::from_row_slice(1, 2, &[-0.1, 1.1]);
        assert!(validate_stochastic(&m, "trans_mat").is_err());
    }

    #[test]
    fn validate_covariance_accepts_pd_full_matrix() {
        let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.5]);
        assert!(validate_covariance(&cov, CovarianceType::Full, 1e-6).is_ok());
    }

    #[test]
    fn validate_covariance_rejects_asymmetric_matrix() {
        let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.9, 1.5]);
        assert!(validate_covariance(&cov, CovarianceType::Full, 1e-6).is_err());
    }
}
