//! Forward, backward, Viterbi and posterior computations over a
//! time x state lattice (spec §4.2).
//!
//! All public entry points operate in log space. A scaling-based
//! alternative (`Implementation::Scaling`) is also provided; it is
//! reconciled back to log-space arrays internally so every downstream
//! consumer (posteriors, xi-sums, forward/backward duality) shares one
//! code path regardless of which implementation produced them.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{HmmError, Result};
use crate::numeric::logsumexp;

const NEG_INF: f64 = f64::NEG_INFINITY;

/// Which numerical strategy the lattice recurrences use. Both must agree
/// within `1e-8` on the reference scenarios (spec §8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Implementation {
    /// Everything in log space; numerically simplest, the default.
    Log,
    /// Rabiner-style per-timestep normalisation in probability space.
    Scaling,
}

impl Default for Implementation {
    fn default() -> Self {
        Implementation::Log
    }
}

/// The transient per-subsequence lattice: frame log-probabilities and
/// the forward/backward/posterior arrays derived from them.
#[derive(Clone, Debug)]
pub struct Lattice {
    /// B\[t, j\] = log p(x_t | state = j). T x N.
    pub log_frame_prob: DMatrix<f64>,
    /// alpha, T x N, in log space regardless of `Implementation`.
    pub fwd: DMatrix<f64>,
    /// beta, T x N, in log space regardless of `Implementation`.
    pub bwd: DMatrix<f64>,
    /// gamma, T x N, rows sum to 1.
    pub posteriors: DMatrix<f64>,
    /// Total log-probability of the subsequence.
    pub log_prob: f64,
    /// Summed transition posteriors, N x N. `None` when T < 2.
    pub xi_sum: Option<DMatrix<f64>>,
}

impl Lattice {
    /// Runs forward, backward, posterior and xi computation for one
    /// subsequence. `start_prob` is linear-space (length N), `trans_mat`
    /// is linear-space (N x N, row-stochastic), `log_frame_prob` is T x N.
    pub fn compute(
        start_prob: &DVector<f64>,
        trans_mat: &DMatrix<f64>,
        log_frame_prob: DMatrix<f64>,
        implementation: Implementation,
    ) -> Result<Lattice> {
        let t = log_frame_prob.nrows();
        let n = log_frame_prob.ncols();

        if t == 0 {
            return Ok(Lattice {
                log_frame_prob,
                fwd: DMatrix::zeros(0, n),
                bwd: DMatrix::zeros(0, n),
                posteriors: DMatrix::zeros(0, n),
                log_prob: 0.0,
                xi_sum: None,
            });
        }

        let log_pi = log_vec(start_prob);
        let log_a = log_mat(trans_mat);

        let (fwd, bwd, log_prob) = match implementation {
            Implementation::Log => {
                let (fwd, log_prob) = forward_log(&log_pi, &log_a, &log_frame_prob);
                let bwd = backward_log(&log_a, &log_frame_prob);
                (fwd, bwd, log_prob)
            }
            Implementation::Scaling => {
                let b = log_frame_prob.map(f64::exp);
                let (alpha_hat, c) = forward_scaling(start_prob, trans_mat, &b);
                let beta_hat = backward_scaling(trans_mat, &b, &c);
                let log_prob = -c.iter().map(|ci| ci.ln()).sum::<f64>();
                let fwd = reconstruct_log_alpha(&alpha_hat, &c);
                let bwd = reconstruct_log_beta(&beta_hat, &c);
                (fwd, bwd, log_prob)
            }
        };

        let posteriors = posteriors_from(&fwd, &bwd, log_prob);
        let xi_sum = if t >= 2 {
            Some(xi_sum_from(&fwd, &log_a, &log_frame_prob, &bwd, log_prob))
        } else {
            None
        };

        Ok(Lattice {
            log_frame_prob,
            fwd,
            bwd,
            posteriors,
            log_prob,
            xi_sum,
        })
    }

    /// Raises [`HmmError::IllConditioned`] if this lattice's total
    /// log-probability is `-inf`, i.e. the model assigned zero mass to
    /// the subsequence. Left to the caller to invoke (spec §4.2: "the
    /// caller decides whether to surface `IllConditioned`").
    pub fn require_finite(&self) -> Result<()> {
        if self.log_prob.is_finite() {
            Ok(())
        } else {
            Err(HmmError::IllConditioned(
                "forward pass total log-probability is -inf".into(),
            ))
        }
    }
}

fn log_vec(v: &DVector<f64>) -> DVector<f64> {
    v.map(|x| if x > 0.0 { x.ln() } else { NEG_INF })
}

fn log_mat(m: &DMatrix<f64>) -> DMatrix<f64> {
    m.map(|x| if x > 0.0 { x.ln() } else { NEG_INF })
}

/// alpha\[0, j\] = log pi\[j\] + B\[0, j\]
/// alpha\[t, j\] = logsumexp_i(alpha\[t-1, i\] + log A\[i, j\]) + B\[t, j\]
fn forward_log(log_pi: &DVector<f64>, log_a: &DMatrix<f64>, log_b: &DMatrix<f64>) -> (DMatrix<f64>, f64) {
    let t = log_b.nrows();
    let n = log_b.ncols();
    let mut alpha = DMatrix::from_element(t, n, NEG_INF);
    for j in 0..n {
        alpha[(0, j)] = log_pi[j] + log_b[(0, j)];
    }
    let mut buf = vec![0.0; n];
    for ti in 1..t {
        for j in 0..n {
            for i in 0..n {
                buf[i] = alpha[(ti - 1, i)] + log_a[(i, j)];
            }
            alpha[(ti, j)] = logsumexp(&buf) + log_b[(ti, j)];
        }
    }
    let last: Vec<f64> = (0..n).map(|j| alpha[(t - 1, j)]).collect();
    let log_prob = logsumexp(&last);
    (alpha, log_prob)
}

/// beta\[T-1, j\] = 0
/// beta\[t, i\] = logsumexp_j(log A\[i, j\] + B\[t+1, j\] + beta\[t+1, j\])
fn backward_log(log_a: &DMatrix<f64>, log_b: &DMatrix<f64>) -> DMatrix<f64> {
    let t = log_b.nrows();
    let n = log_b.ncols();
    let mut beta = DMatrix::from_element(t, n, NEG_INF);
    for j in 0..n {
        beta[(t - 1, j)] = 0.0;
    }
    let mut buf = vec![0.0; n];
    for ti in (0..t.saturating_sub(1)).rev() {
        for i in 0..n {
            for j in 0..n {
                buf[j] = log_a[(i, j)] + log_b[(ti + 1, j)] + beta[(ti + 1, j)];
            }
            beta[(ti, i)] = logsumexp(&buf);
        }
    }
    beta
}

/// gamma\[t, j\] = exp(alpha\[t, j\] + beta\[t, j\] - log_prob)
fn posteriors_from(fwd: &DMatrix<f64>, bwd: &DMatrix<f64>, log_prob: f64) -> DMatrix<f64> {
    let t = fwd.nrows();
    let n = fwd.ncols();
    let mut gamma = DMatrix::zeros(t, n);
    for ti in 0..t {
        for j in 0..n {
            let v = fwd[(ti, j)] + bwd[(ti, j)] - log_prob;
            gamma[(ti, j)] = if v.is_finite() { v.exp() } else { 0.0 };
        }
        // Renormalise defensively against floating drift; a no-op when
        // the row already sums to 1 within tolerance.
        let row_sum: f64 = (0..n).map(|j| gamma[(ti, j)]).sum();
        if row_sum > 0.0 && (row_sum - 1.0).abs() > 1e-9 {
            for j in 0..n {
                gamma[(ti, j)] /= row_sum;
            }
        }
    }
    gamma
}

/// xi\[i, j\] = exp(logsumexp_t(alpha\[t, i\] + log A\[i, j\] + B\[t+1, j\] + beta\[t+1, j\]) - log_prob)
fn xi_sum_from(
    fwd: &DMatrix<f64>,
    log_a: &DMatrix<f64>,
    log_b: &DMatrix<f64>,
    bwd: &DMatrix<f64>,
    log_prob: f64,
) -> DMatrix<f64> {
    let t = fwd.nrows();
    let n = fwd.ncols();
    let mut xi = DMatrix::zeros(n, n);
    let mut buf = vec![0.0; t - 1];
    for i in 0..n {
        for j in 0..n {
            for ti in 0..t - 1 {
                buf[ti] = fwd[(ti, i)] + log_a[(i, j)] + log_b[(ti + 1, j)] + bwd[(ti + 1, j)];
            }
            let lse = logsumexp(&buf);
            xi[(i, j)] = if (lse - log_prob).is_finite() { (lse - log_prob).exp() } else { 0.0 };
        }
    }
    xi
}

/// Most likely state sequence under the model (spec §4.2). Ties are
/// broken by the lowest state index.
pub fn viterbi(start_prob: &DVector<f64>, trans_mat: &DMatrix<f64>, log_frame_prob: &DMatrix<f64>) -> (f64, Vec<usize>) {
    let t = log_frame_prob.nrows();
    let n = log_frame_prob.ncols();
    if t == 0 {
        return (0.0, Vec::new());
    }
    let log_pi = log_vec(start_prob);
    let log_a = log_mat(trans_mat);

    let mut delta = DMatrix::from_element(t, n, NEG_INF);
    let mut psi = vec![vec![0usize; n]; t];
    for j in 0..n {
        delta[(0, j)] = log_pi[j] + log_frame_prob[(0, j)];
    }
    for ti in 1..t {
        for j in 0..n {
            let mut best = NEG_INF;
            let mut best_i = 0usize;
            for i in 0..n {
                let v = delta[(ti - 1, i)] + log_a[(i, j)];
                if v > best {
                    best = v;
                    best_i = i;
                }
            }
            delta[(ti, j)] = best + log_frame_prob[(ti, j)];
            psi[ti][j] = best_i;
        }
    }

    let mut best_last = 0usize;
    let mut best_val = NEG_INF;
    for j in 0..n {
        if delta[(t - 1, j)] > best_val {
            best_val = delta[(t - 1, j)];
            best_last = j;
        }
    }

    let mut path = vec![0usize; t];
    path[t - 1] = best_last;
    for ti in (0..t - 1).rev() {
        path[ti] = psi[ti + 1][path[ti + 1]];
    }
    (best_val, path)
}

// --- Scaling implementation (Rabiner 1989) ------------------------------

fn forward_scaling(pi: &DVector<f64>, a: &DMatrix<f64>, b: &DMatrix<f64>) -> (DMatrix<f64>, Vec<f64>) {
    let t = b.nrows();
    let n = b.ncols();
    let mut alpha_hat = DMatrix::zeros(t, n);
    let mut c = vec![0.0; t];

    for j in 0..n {
        alpha_hat[(0, j)] = pi[j] * b[(0, j)];
    }
    c[0] = scale_row(&mut alpha_hat, 0, n);

    for ti in 1..t {
        for j in 0..n {
            let mut sum = 0.0;
            for i in 0..n {
                sum += alpha_hat[(ti - 1, i)] * a[(i, j)];
            }
            alpha_hat[(ti, j)] = sum * b[(ti, j)];
        }
        c[ti] = scale_row(&mut alpha_hat, ti, n);
    }
    (alpha_hat, c)
}

fn backward_scaling(a: &DMatrix<f64>, b: &DMatrix<f64>, c: &[f64]) -> DMatrix<f64> {
    let t = b.nrows();
    let n = b.ncols();
    let mut beta_hat = DMatrix::zeros(t, n);
    for j in 0..n {
        beta_hat[(t - 1, j)] = c[t - 1];
    }
    for ti in (0..t - 1).rev() {
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..n {
                sum += a[(i, j)] * b[(ti + 1, j)] * beta_hat[(ti + 1, j)];
            }
            beta_hat[(ti, i)] = c[ti] * sum;
        }
    }
    beta_hat
}

fn scale_row(m: &mut DMatrix<f64>, row: usize, n: usize) -> f64 {
    let sum: f64 = (0..n).map(|j| m[(row, j)]).sum();
    let c = if sum > 0.0 { 1.0 / sum } else { 0.0 };
    for j in 0..n {
        m[(row, j)] *= c;
    }
    c
}

/// `alpha_hat[t] = alpha[t] * prod_{k<=t} c_k`, so
/// `log(alpha[t]) = log(alpha_hat[t]) - sum_{k<=t} log(c_k)`.
fn reconstruct_log_alpha(alpha_hat: &DMatrix<f64>, c: &[f64]) -> DMatrix<f64> {
    let t = alpha_hat.nrows();
    let n = alpha_hat.ncols();
    let mut out = DMatrix::from_element(t, n, NEG_INF);
    let mut cum = 0.0;
    for ti in 0..t {
        cum += c[ti].ln();
        for j in 0..n {
            let v = alpha_hat[(ti, j)];
            out[(ti, j)] = if v > 0.0 { v.ln() - cum } else { NEG_INF };
        }
    }
    out
}

/// `beta_hat[t] = beta[t] * prod_{k=t}^{T-1} c_k`, so
/// `log(beta[t]) = log(beta_hat[t]) - sum_{k=t}^{T-1} log(c_k)`.
fn reconstruct_log_beta(beta_hat: &DMatrix<f64>, c: &[f64]) -> DMatrix<f64> {
    let t = beta_hat.nrows();
    let n = beta_hat.ncols();
    let mut out = DMatrix::from_element(t, n, NEG_INF);
    let mut tail: Vec<f64> = vec![0.0; t];
    let mut cum = 0.0;
    for ti in (0..t).rev() {
        cum += c[ti].ln();
        tail[ti] = cum;
    }
    for ti in 0..t {
        for j in 0..n {
            let v = beta_hat[(ti, j)];
            out[(ti, j)] = if v > 0.0 { v.ln() - tail[ti] } else { NEG_INF };
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_state_fixture() -> (DVector<f64>, DMatrix<f64>, DMatrix<f64>) {
        let pi = DVector::from_vec(vec![0.6, 0.4]);
        let a = DMatrix::from_row_slice(2, 2, &[0.7, 0.3, 0.4, 0.6]);
        // emission_prob rows for symbols 0,1,2,2,1,0 per spec scenario 1
        let emission = DMatrix::from_row_slice(2, 3, &[0.1, 0.4, 0.5, 0.6, 0.3, 0.1]);
        let obs = [0usize, 1, 2, 2, 1, 0];
        let mut log_b = DMatrix::zeros(obs.len(), 2);
        for (t, &o) in obs.iter().enumerate() {
            for s in 0..2 {
                log_b[(t, s)] = emission[(s, o)].ln();
            }
        }
        (pi, a, log_b)
    }

    #[test]
    fn forward_matches_reference_scenario_1() {
        let (pi, a, log_b) = two_state_fixture();
        let lat = Lattice::compute(&pi, &a, log_b, Implementation::Log).unwrap();
        assert_relative_eq!(lat.log_prob, -7.4174, epsilon = 1e-3);
    }

    #[test]
    fn viterbi_matches_reference_scenario_1() {
        let (pi, a, log_b) = two_state_fixture();
        let (_, path) = viterbi(&pi, &a, &log_b);
        assert_eq!(path, vec![1, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn posteriors_row_sums_to_one() {
        let (pi, a, log_b) = two_state_fixture();
        let lat = Lattice::compute(&pi, &a, log_b, Implementation::Log).unwrap();
        for t in 0..lat.posteriors.nrows() {
            let sum: f64 = lat.posteriors.row(t).iter().sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn xi_sum_totals_t_minus_one() {
        let (pi, a, log_b) = two_state_fixture();
        let t = log_b.nrows();
        let lat = Lattice::compute(&pi, &a, log_b, Implementation::Log).unwrap();
        let xi = lat.xi_sum.unwrap();
        let total: f64 = xi.iter().sum();
        assert_relative_eq!(total, (t - 1) as f64, epsilon = 1e-6);
    }

    #[test]
    fn forward_backward_duality() {
        let (pi, a, log_b) = two_state_fixture();
        let lat = Lattice::compute(&pi, &a, log_b, Implementation::Log).unwrap();
        let n = lat.fwd.ncols();
        let row: Vec<f64> = (0..n).map(|j| lat.fwd[(0, j)] + lat.bwd[(0, j)]).collect();
        assert_relative_eq!(logsumexp(&row), lat.log_prob, epsilon = 1e-9);
    }

    #[test]
    fn scaling_matches_log_implementation() {
        let (pi, a, log_b) = two_state_fixture();
        let log_lat = Lattice::compute(&pi, &a, log_b.clone(), Implementation::Log).unwrap();
        let scaled_lat = Lattice::compute(&pi, &a, log_b, Implementation::Scaling).unwrap();
        assert_relative_eq!(log_lat.log_prob, scaled_lat.log_prob, epsilon = 1e-8);
        for t in 0..log_lat.posteriors.nrows() {
            for j in 0..log_lat.posteriors.ncols() {
                assert_relative_eq!(
                    log_lat.posteriors[(t, j)],
                    scaled_lat.posteriors[(t, j)],
                    epsilon = 1e-8
                );
            }
        }
    }

    #[test]
    fn zero_length_sequence_yields_zero_log_prob_and_empty_path() {
        let pi = DVector::from_vec(vec![0.5, 0.5]);
        let a = DMatrix::from_row_slice(2, 2, &[0.5, 0.5, 0.5, 0.5]);
        let log_b = DMatrix::zeros(0, 2);
        let lat = Lattice::compute(&pi, &a, log_b.clone(), Implementation::Log).unwrap();
        assert_eq!(lat.log_prob, 0.0);
        let (score, path) = viterbi(&pi, &a, &log_b);
        assert_eq!(score, 0.0);
        assert!(path.is_empty());
    }

    #[test]
    fn single_state_model_score_is_sum_of_frame_log_prob() {
        let pi = DVector::from_vec(vec![1.0]);
        let a = DMatrix::from_row_slice(1, 1, &[1.0]);
        let log_b = DMatrix::from_row_slice(3, 1, &[-1.0, -2.0, -0.5]);
        let lat = Lattice::compute(&pi, &a, log_b.clone(), Implementation::Log).unwrap();
        let expected: f64 = log_b.iter().sum();
        assert_relative_eq!(lat.log_prob, expected, epsilon = 1e-9);
    }

    #[test]
    fn single_timestep_gamma_is_softmax_of_alpha0_and_xi_is_none() {
        let pi = DVector::from_vec(vec![0.5, 0.5]);
        let a = DMatrix::from_row_slice(2, 2, &[0.6, 0.4, 0.3, 0.7]);
        let log_b = DMatrix::from_row_slice(1, 2, &[-0.2, -1.6]);
        let lat = Lattice::compute(&pi, &a, log_b, Implementation::Log).unwrap();
        assert!(lat.xi_sum.is_none());
        let row_sum: f64 = lat.posteriors.row(0).iter().sum();
        assert_relative_eq!(row_sum, 1.0, epsilon = 1e-9);
    }
}
