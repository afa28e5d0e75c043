//! Multinomial emissions: each observation row is a vector of trial
//! counts over `K` categories (spec §4.3.3).

use nalgebra::DMatrix;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use super::{sample_categorical, EmissionFamily};
use crate::error::{HmmError, Result};
use crate::guard::{normalize_rows, validate_stochastic};

pub const LETTER_EMISSION: char = 'e';

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Multinomial {
    n_components: usize,
    n_symbols: usize,
    /// `emission_prob[j, k] = P(category k | state = j)`, row-stochastic.
    pub emission_prob: DMatrix<f64>,
    pub emissionprob_prior: f64,
    /// Number of trials drawn per generated sample (`sample_from_state`
    /// only — the log-likelihood and M-step infer each observed row's
    /// trial count from its own sum, per spec §4.3.3's formula).
    pub n_trials: usize,
}

impl Multinomial {
    pub fn new(n_components: usize, n_symbols: usize, n_trials: usize) -> Self {
        Self {
            n_components,
            n_symbols,
            emission_prob: DMatrix::from_element(n_components, n_symbols, 1.0 / n_symbols as f64),
            emissionprob_prior: 1.0,
            n_trials,
        }
    }

    pub fn with_emission_prob(mut self, emission_prob: DMatrix<f64>) -> Result<Self> {
        if emission_prob.nrows() != self.n_components || emission_prob.ncols() != self.n_symbols {
            return Err(HmmError::ShapeMismatch("emission_prob shape mismatch".into()));
        }
        self.emission_prob = emission_prob;
        Ok(self)
    }
}

#[derive(Clone, Debug)]
pub struct MultinomialStats {
    pub obs: DMatrix<f64>,
}

impl EmissionFamily for Multinomial {
    type Stats = MultinomialStats;

    fn letters() -> &'static str {
        "e"
    }

    fn n_states(&self) -> usize {
        self.n_components
    }

    fn n_features(&self) -> usize {
        self.n_symbols
    }

    fn validate(&self) -> Result<()> {
        if self.emission_prob.nrows() != self.n_components || self.emission_prob.ncols() != self.n_symbols {
            return Err(HmmError::ShapeMismatch("emission_prob shape mismatch".into()));
        }
        validate_stochastic(&self.emission_prob, "emission_prob")
    }

    fn initialise(&mut self, _rows: &DMatrix<f64>, mask: &str, rng: &mut dyn RngCore) -> Result<()> {
        if mask.contains(LETTER_EMISSION) {
            let mut m = DMatrix::zeros(self.n_components, self.n_symbols);
            for i in 0..self.n_components {
                for j in 0..self.n_symbols {
                    m[(i, j)] = rand::Rng::gen::<f64>(rng) + 1e-3;
                }
            }
            self.emission_prob = normalize_rows(&m, 1.0);
        }
        Ok(())
    }

    fn log_likelihood(&self, rows: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let t = rows.nrows();
        let mut b = DMatrix::zeros(t, self.n_components);
        for ti in 0..t {
            let row = rows.row(ti);
            let n: f64 = row.iter().sum();
            let log_coeff = ln_gamma(n + 1.0) - row.iter().map(|&x| ln_gamma(x + 1.0)).sum::<f64>();
            for j in 0..self.n_components {
                let mut ll = log_coeff;
                for k in 0..self.n_symbols {
                    let x = row[k];
                    if x != 0.0 {
                        ll += x * self.emission_prob[(j, k)].ln();
                    }
                }
                b[(ti, j)] = ll;
            }
        }
        Ok(b)
    }

    fn stats_init(&self) -> Self::Stats {
        MultinomialStats {
            obs: DMatrix::zeros(self.n_components, self.n_symbols),
        }
    }

    fn accumulate(&self, stats: &mut Self::Stats, rows: &DMatrix<f64>, gamma: &DMatrix<f64>) -> Result<()> {
        for t in 0..rows.nrows() {
            for j in 0..self.n_components {
                let w = gamma[(t, j)];
                for k in 0..self.n_symbols {
                    stats.obs[(j, k)] += w * rows[(t, k)];
                }
            }
        }
        Ok(())
    }

    fn m_step(&mut self, stats: &Self::Stats, mask: &str) -> Result<()> {
        if mask.contains(LETTER_EMISSION) {
            self.emission_prob = normalize_rows(&stats.obs, self.emissionprob_prior);
        }
        Ok(())
    }

    fn sample_from_state(&self, j: usize, rng: &mut dyn RngCore) -> Vec<f64> {
        let probs: Vec<f64> = self.emission_prob.row(j).iter().copied().collect();
        let mut counts = vec![0.0; self.n_symbols];
        for _ in 0..self.n_trials {
            counts[sample_categorical(&probs, rng)] += 1.0;
        }
        counts
    }

    fn n_free_scalars(&self, mask: &str) -> usize {
        if mask.contains(LETTER_EMISSION) {
            self.n_components * (self.n_symbols - 1)
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn log_likelihood_single_trial_matches_categorical() {
        let m = Multinomial::new(1, 2, 1)
            .with_emission_prob(DMatrix::from_row_slice(1, 2, &[0.3, 0.7]))
            .unwrap();
        let rows = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        let b = m.log_likelihood(&rows).unwrap();
        assert_relative_eq!(b[(0, 0)], 0.3_f64.ln(), epsilon = 1e-9);
    }

    #[test]
    fn accumulate_and_m_step_recovers_empirical_proportions() {
        let m = Multinomial::new(1, 2, 10);
        let mut stats = m.stats_init();
        let rows = DMatrix::from_row_slice(2, 2, &[3.0, 7.0, 6.0, 4.0]);
        let gamma = DMatrix::from_element(2, 1, 1.0);
        m.accumulate(&mut stats, &rows, &gamma).unwrap();
        let mut m2 = m.clone();
        m2.m_step(&stats, "e").unwrap();
        assert_relative_eq!(m2.emission_prob[(0, 0)], 0.45, epsilon = 1e-9);
    }
}
