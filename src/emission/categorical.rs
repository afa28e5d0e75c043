//! Categorical emissions: `p(x = k | j) = E[j, k]` for a symbol `x` in
//! `[0, K)` (spec §4.3.1).

use nalgebra::DMatrix;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{sample_categorical, EmissionFamily};
use crate::error::{HmmError, Result};
use crate::guard::{normalize_rows, validate_stochastic};

/// `params`/`init_params` letter for the emission matrix.
pub const LETTER_EMISSION: char = 'e';

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Categorical {
    n_components: usize,
    n_symbols: usize,
    /// `emission_prob[j, k] = P(symbol = k | state = j)`, row-stochastic.
    pub emission_prob: DMatrix<f64>,
    /// Dirichlet pseudocount `alpha` added to each row before
    /// normalising (this crate's fixed convention: prior contributes
    /// `alpha - 1` to the effective count, see DESIGN.md).
    pub emissionprob_prior: f64,
}

impl Categorical {
    pub fn new(n_components: usize, n_symbols: usize) -> Self {
        Self {
            n_components,
            n_symbols,
            emission_prob: DMatrix::from_element(n_components, n_symbols, 1.0 / n_symbols as f64),
            emissionprob_prior: 1.0,
        }
    }

    pub fn with_emission_prob(mut self, emission_prob: DMatrix<f64>) -> Result<Self> {
        if emission_prob.nrows() != self.n_components || emission_prob.ncols() != self.n_symbols {
            return Err(HmmError::ShapeMismatch(format!(
                "emission_prob must be {}x{}, got {}x{}",
                self.n_components,
                self.n_symbols,
                emission_prob.nrows(),
                emission_prob.ncols()
            )));
        }
        self.emission_prob = emission_prob;
        Ok(self)
    }

    pub fn with_prior(mut self, prior: f64) -> Self {
        self.emissionprob_prior = prior;
        self
    }

    pub fn n_symbols(&self) -> usize {
        self.n_symbols
    }
}

#[derive(Clone, Debug)]
pub struct CategoricalStats {
    pub obs: DMatrix<f64>,
}

impl EmissionFamily for Categorical {
    type Stats = CategoricalStats;

    fn letters() -> &'static str {
        "e"
    }

    fn n_states(&self) -> usize {
        self.n_components
    }

    fn n_features(&self) -> usize {
        1
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
            let symbol = rows[(ti, 0)].round() as usize;
            if symbol >= self.n_symbols {
                return Err(HmmError::ShapeMismatch(format!(
                    "observed symbol {symbol} is out of range [0, {})",
                    self.n_symbols
                )));
            }
            for j in 0..self.n_components {
                b[(ti, j)] = self.emission_prob[(j, symbol)].ln();
            }
        }
        Ok(b)
    }

    fn stats_init(&self) -> Self::Stats {
        CategoricalStats {
            obs: DMatrix::zeros(self.n_components, self.n_symbols),
        }
    }

    fn accumulate(&self, stats: &mut Self::Stats, rows: &DMatrix<f64>, gamma: &DMatrix<f64>) -> Result<()> {
        for t in 0..rows.nrows() {
            let symbol = rows[(t, 0)].round() as usize;
            for j in 0..self.n_components {
                stats.obs[(j, symbol)] += gamma[(t, j)];
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
        let row: Vec<f64> = self.emission_prob.row(j).iter().copied().collect();
        vec![sample_categorical(&row, rng) as f64]
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

    fn fixture() -> Categorical {
        Categorical::new(2, 3)
            .with_emission_prob(DMatrix::from_row_slice(2, 3, &[0.1, 0.4, 0.5, 0.6, 0.3, 0.1]))
            .unwrap()
    }

    #[test]
    fn log_likelihood_matches_ln_of_emission_prob() {
        let cat = fixture();
        let rows = DMatrix::from_row_slice(2, 1, &[0.0, 2.0]);
        let b = cat.log_likelihood(&rows).unwrap();
        assert_relative_eq!(b[(0, 0)], 0.1_f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(b[(1, 1)], 0.1_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn m_step_renormalizes_rows_after_accumulation() {
        let cat = fixture();
        let mut stats = cat.stats_init();
        stats.obs[(0, 0)] = 3.0;
        stats.obs[(0, 1)] = 1.0;
        stats.obs[(1, 2)] = 5.0;
        let mut cat2 = cat.clone();
        cat2.m_step(&stats, "e").unwrap();
        let row0_sum: f64 = cat2.emission_prob.row(0).iter().sum();
        assert_relative_eq!(row0_sum, 1.0, epsilon = 1e-9);
        assert_relative_eq!(cat2.emission_prob[(0, 0)], 0.75, epsilon = 1e-9);
    }

    #[test]
    fn out_of_range_symbol_is_rejected() {
        let cat = fixture();
        let rows = DMatrix::from_row_slice(1, 1, &[5.0]);
        assert!(cat.log_likelihood(&rows).is_err());
    }
}
