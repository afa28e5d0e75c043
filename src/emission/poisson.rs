//! Poisson emissions: each feature `d` of state `j` is an independent
//! `Poisson(lambda[j, d])` count variable (spec §4.3.4).

use nalgebra::DMatrix;
use rand::RngCore;
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use super::EmissionFamily;
use crate::error::{HmmError, Result};

pub const LETTER_LAMBDAS: char = 'l';

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Poisson {
    n_components: usize,
    n_features: usize,
    /// `lambdas[j, d]`, strictly positive.
    pub lambdas: DMatrix<f64>,
    /// Gamma-prior shape `alpha` (pseudo-counts) and rate `beta`
    /// (pseudo-observations), combined in the M-step as
    /// `(alpha + obs) / (beta + post)` (spec §4.3.4's Gamma conjugate).
    pub lambda_prior_shape: f64,
    pub lambda_prior_rate: f64,
}

impl Poisson {
    pub fn new(n_components: usize, n_features: usize) -> Self {
        Self {
            n_components,
            n_features,
            lambdas: DMatrix::from_element(n_components, n_features, 1.0),
            lambda_prior_shape: 1.0,
            lambda_prior_rate: 0.0,
        }
    }

    pub fn with_lambdas(mut self, lambdas: DMatrix<f64>) -> Result<Self> {
        if lambdas.nrows() != self.n_components || lambdas.ncols() != self.n_features {
            return Err(HmmError::ShapeMismatch("lambdas shape mismatch".into()));
        }
        if lambdas.iter().any(|&v| v <= 0.0) {
            return Err(HmmError::InvalidOption("lambdas must be strictly positive".into()));
        }
        self.lambdas = lambdas;
        Ok(self)
    }

    pub fn with_prior(mut self, shape: f64, rate: f64) -> Self {
        self.lambda_prior_shape = shape;
        self.lambda_prior_rate = rate;
        self
    }
}

#[derive(Clone, Debug)]
pub struct PoissonStats {
    pub post: nalgebra::DVector<f64>,
    pub obs: DMatrix<f64>,
}

impl EmissionFamily for Poisson {
    type Stats = PoissonStats;

    fn letters() -> &'static str {
        "l"
    }

    fn n_states(&self) -> usize {
        self.n_components
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn validate(&self) -> Result<()> {
        if self.lambdas.nrows() != self.n_components || self.lambdas.ncols() != self.n_features {
            return Err(HmmError::ShapeMismatch("lambdas shape mismatch".into()));
        }
        if self.lambdas.iter().any(|&v| v <= 0.0) {
            return Err(HmmError::InvalidOption("lambdas must be strictly positive".into()));
        }
        Ok(())
    }

    fn initialise(&mut self, rows: &DMatrix<f64>, mask: &str, rng: &mut dyn RngCore) -> Result<()> {
        if mask.contains(LETTER_LAMBDAS) {
            let global_mean: Vec<f64> = (0..self.n_features)
                .map(|d| rows.column(d).mean().max(1e-3))
                .collect();
            for j in 0..self.n_components {
                for d in 0..self.n_features {
                    let jitter = 0.5 + rand::Rng::gen::<f64>(rng);
                    self.lambdas[(j, d)] = global_mean[d] * jitter;
                }
            }
        }
        Ok(())
    }

    fn log_likelihood(&self, rows: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let t = rows.nrows();
        let mut b = DMatrix::zeros(t, self.n_components);
        for ti in 0..t {
            for j in 0..self.n_components {
                let mut ll = 0.0;
                for d in 0..self.n_features {
                    let x = rows[(ti, d)];
                    let lambda = self.lambdas[(j, d)];
                    ll += -lambda + x * lambda.ln() - ln_gamma(x + 1.0);
                }
                b[(ti, j)] = ll;
            }
        }
        Ok(b)
    }

    fn stats_init(&self) -> Self::Stats {
        PoissonStats {
            post: nalgebra::DVector::zeros(self.n_components),
            obs: DMatrix::zeros(self.n_components, self.n_features),
        }
    }

    fn accumulate(&self, stats: &mut Self::Stats, rows: &DMatrix<f64>, gamma: &DMatrix<f64>) -> Result<()> {
        for t in 0..rows.nrows() {
            for j in 0..self.n_components {
                let w = gamma[(t, j)];
                stats.post[j] += w;
                for d in 0..self.n_features {
                    stats.obs[(j, d)] += w * rows[(t, d)];
                }
            }
        }
        Ok(())
    }

    fn m_step(&mut self, stats: &Self::Stats, mask: &str) -> Result<()> {
        if mask.contains(LETTER_LAMBDAS) {
            for j in 0..self.n_components {
                for d in 0..self.n_features {
                    let numerator = self.lambda_prior_shape + stats.obs[(j, d)];
                    let denominator = self.lambda_prior_rate + stats.post[j];
                    self.lambdas[(j, d)] = (numerator / denominator).max(1e-6);
                }
            }
        }
        Ok(())
    }

    fn sample_from_state(&self, j: usize, rng: &mut dyn RngCore) -> Vec<f64> {
        (0..self.n_features)
            .map(|d| {
                let dist = rand_distr::Poisson::new(self.lambdas[(j, d)]).expect("lambda is finite and positive");
                dist.sample(&mut RngShim(rng))
            })
            .collect()
    }

    fn n_free_scalars(&self, mask: &str) -> usize {
        if mask.contains(LETTER_LAMBDAS) {
            self.n_components * self.n_features
        } else {
            0
        }
    }
}

/// Adapts a borrowed `&mut dyn RngCore` to satisfy `rand_distr`'s
/// `rand::Rng` bound, which the trait-object form doesn't implement
/// directly.
struct RngShim<'a>(&'a mut dyn RngCore);

impl<'a> rand::RngCore for RngShim<'a> {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.0.try_fill_bytes(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn log_likelihood_matches_closed_form_poisson_pmf() {
        let p = Poisson::new(1, 1).with_lambdas(DMatrix::from_row_slice(1, 1, &[2.0])).unwrap();
        let rows = DMatrix::from_row_slice(1, 1, &[3.0]);
        let b = p.log_likelihood(&rows).unwrap();
        let expected = -2.0 + 3.0 * 2.0_f64.ln() - ln_gamma(4.0);
        assert_relative_eq!(b[(0, 0)], expected, epsilon = 1e-9);
    }

    #[test]
    fn m_step_with_flat_prior_recovers_empirical_mean() {
        // shape=0, rate=0 is the improper flat Gamma prior: numerator and
        // denominator reduce to the bare sufficient statistics.
        let p = Poisson::new(1, 1).with_prior(0.0, 0.0);
        let mut stats = p.stats_init();
        let rows = DMatrix::from_row_slice(3, 1, &[1.0, 2.0, 3.0]);
        let gamma = DMatrix::from_element(3, 1, 1.0);
        p.accumulate(&mut stats, &rows, &gamma).unwrap();
        let mut p2 = p.clone();
        p2.m_step(&stats, "l").unwrap();
        assert_relative_eq!(p2.lambdas[(0, 0)], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn rejects_non_positive_lambdas() {
        let p = Poisson::new(1, 1).with_lambdas(DMatrix::from_row_slice(1, 1, &[0.0]));
        assert!(p.is_err());
    }
}
