//! The pluggable emission-family abstraction (spec §4.3): every family
//! implements [`EmissionFamily`] rather than participating in a class
//! hierarchy, and each owns its own [`EmissionFamily::Stats`] type
//! rather than populating an untyped accumulator (spec §9 design notes).

pub mod categorical;
pub mod gaussian;
pub mod gmm;
pub mod multinomial;
pub mod poisson;

pub use categorical::Categorical;
pub use gaussian::Gaussian;
pub use gmm::Gmm;
pub use multinomial::Multinomial;
pub use poisson::Poisson;

use nalgebra::DMatrix;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// A pluggable observation model: log-likelihood, EM accumulation,
/// M-step re-estimation, sampling, and parameter-count reporting (spec
/// §4.3).
pub trait EmissionFamily: Clone + std::fmt::Debug + Serialize + DeserializeOwned {
    /// This family's sufficient-statistic accumulator.
    type Stats: Clone + std::fmt::Debug;

    /// The family-specific letters recognised by `params`/`init_params`
    /// (spec §9: unrecognised letters elsewhere in the alphabet are
    /// rejected at construction, per this crate's fixed convention).
    fn letters() -> &'static str;

    fn n_states(&self) -> usize;

    /// Expected number of columns in an observation row for this family.
    fn n_features(&self) -> usize;

    /// Checks parameter shapes and stochasticity/positivity invariants.
    fn validate(&self) -> Result<()>;

    /// Randomises or data-derives the parameters named by `mask`
    /// (letters not present in `mask` are left untouched).
    fn initialise(&mut self, rows: &DMatrix<f64>, mask: &str, rng: &mut dyn RngCore) -> Result<()>;

    /// `B[t, j] = log p(x_t | state = j)` for one subsequence's rows.
    fn log_likelihood(&self, rows: &DMatrix<f64>) -> Result<DMatrix<f64>>;

    /// Allocates a zeroed accumulator for this family.
    fn stats_init(&self) -> Self::Stats;

    /// Updates `stats` from one subsequence's rows and posteriors.
    fn accumulate(&self, stats: &mut Self::Stats, rows: &DMatrix<f64>, gamma: &DMatrix<f64>) -> Result<()>;

    /// Re-estimates the parameters named by `mask` from `stats`.
    fn m_step(&mut self, stats: &Self::Stats, mask: &str) -> Result<()>;

    /// Draws one observation row from state `j`.
    fn sample_from_state(&self, j: usize, rng: &mut dyn RngCore) -> Vec<f64>;

    /// Number of free scalar parameters selected by `mask`, for
    /// `aic`/`bic`.
    fn n_free_scalars(&self, mask: &str) -> usize;
}

pub(crate) fn sample_categorical(probs: &[f64], rng: &mut dyn RngCore) -> usize {
    let r: f64 = rand::Rng::gen(rng);
    let mut cumsum = 0.0;
    for (idx, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r <= cumsum {
            return idx;
        }
    }
    probs.len() - 1
}
