//! Shared model configuration and the generic `Model<E>` container
//! (spec §3, §6).

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::convergence::ConvergenceMonitor;
use crate::emission::EmissionFamily;
use crate::error::{HmmError, Result};
use crate::guard::{normalize_row, normalize_rows, validate_stochastic, validate_stochastic_vec};
use crate::lattice::Implementation;

/// Decoding strategy for [`crate::estimator`]'s `decode`/`predict`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// Single most likely state sequence (spec §4.2 Viterbi).
    Viterbi,
    /// Per-timestep argmax of the posterior `gamma`.
    Map,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Viterbi
    }
}

/// Storage layout of a per-state covariance matrix (spec §9 design note:
/// a tagged variant, never an implicit-shape 3-D array).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceType {
    Spherical,
    Diag,
    Full,
    Tied,
}

impl Default for CovarianceType {
    fn default() -> Self {
        CovarianceType::Diag
    }
}

/// Per-state covariance storage for the Gaussian and GMM families,
/// keyed by [`CovarianceType`] (spec §3/§4.3.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Covariances {
    /// One scalar variance per state, shared across all `D` dimensions.
    Spherical(Vec<f64>),
    /// One length-`D` variance vector per state.
    Diag(Vec<DVector<f64>>),
    /// One `D x D` matrix per state.
    Full(Vec<DMatrix<f64>>),
    /// A single `D x D` matrix shared by every state.
    Tied(DMatrix<f64>),
}

impl Covariances {
    pub fn cov_type(&self) -> CovarianceType {
        match self {
            Covariances::Spherical(_) => CovarianceType::Spherical,
            Covariances::Diag(_) => CovarianceType::Diag,
            Covariances::Full(_) => CovarianceType::Full,
            Covariances::Tied(_) => CovarianceType::Tied,
        }
    }

    /// Materialises the `D x D` covariance matrix used by state `j`.
    pub fn as_matrix(&self, j: usize, n_features: usize) -> DMatrix<f64> {
        match self {
            Covariances::Spherical(v) => DMatrix::identity(n_features, n_features) * v[j],
            Covariances::Diag(v) => DMatrix::from_diagonal(&v[j]),
            Covariances::Full(v) => v[j].clone(),
            Covariances::Tied(m) => m.clone(),
        }
    }
}

/// Configuration options shared by every emission family (spec §6
/// "Common" constructor options).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommonOptions {
    pub n_components: usize,
    pub algorithm: Algorithm,
    pub n_iter: usize,
    pub tol: f64,
    pub verbose: bool,
    /// Letters of the family alphabet (see each family's `letters()`)
    /// selecting which parameters the M-step re-estimates.
    pub params: String,
    /// Letters selecting which parameters `initialise` randomises.
    pub init_params: String,
    pub implementation: Implementation,
    /// Dirichlet pseudocount added to `start_prob` before normalising.
    pub startprob_prior: f64,
    /// Dirichlet pseudocount added to each row of `trans_mat`.
    pub transmat_prior: f64,
}

impl CommonOptions {
    pub fn new(n_components: usize) -> Self {
        Self {
            n_components,
            algorithm: Algorithm::default(),
            n_iter: 10,
            tol: 1e-2,
            verbose: false,
            params: String::new(),
            init_params: String::new(),
            implementation: Implementation::default(),
            startprob_prior: 1.0,
            transmat_prior: 1.0,
        }
    }

    /// Validates that every letter in `letters` is one of `recognised`
    /// (common letters `s`/`t` plus the family's own), per spec §9's
    /// fixed convention: unknown letters are rejected, not ignored.
    pub fn validate_letters(letters: &str, recognised: &str, field: &str) -> Result<()> {
        for c in letters.chars() {
            if !recognised.contains(c) {
                return Err(HmmError::InvalidOption(format!(
                    "unknown letter '{c}' in {field} (recognised: {recognised})"
                )));
            }
        }
        Ok(())
    }
}

/// A Hidden Markov Model parameterised over an [`EmissionFamily`].
///
/// The estimator (`fit`/`score`/`decode`/...) is implemented in
/// [`crate::estimator`] as an `impl<E: EmissionFamily> Model<E>` block;
/// this type only owns the parameters and configuration (spec §3's
/// ownership rule: the Estimator exclusively owns the Model during
/// `fit`, the Model exclusively owns its parameter arrays otherwise).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Model<E: EmissionFamily> {
    pub options: CommonOptions,
    pub start_prob: DVector<f64>,
    pub trans_mat: DMatrix<f64>,
    pub emission: E,
    pub(crate) fitted: bool,
    /// Convergence history from the most recent `fit` call; `None`
    /// before the model has ever been fitted. Not part of the model's
    /// own parameters, so it is excluded from (de)serialisation.
    #[serde(skip)]
    pub(crate) convergence: Option<ConvergenceMonitor>,
}

impl<E: EmissionFamily> Model<E> {
    /// Builds a model with uniform `start_prob`/`trans_mat` and the
    /// emission family's own default parameters. Call `initialise`
    /// (invoked automatically by `fit`) to randomise per `init_params`.
    pub fn new(options: CommonOptions, emission: E) -> Result<Self> {
        let letters = format!("st{}", E::letters());
        CommonOptions::validate_letters(&options.params, &letters, "params")?;
        CommonOptions::validate_letters(&options.init_params, &letters, "init_params")?;
        if options.n_components == 0 {
            return Err(HmmError::InvalidOption("n_components must be >= 1".into()));
        }
        if options.n_iter == 0 {
            return Err(HmmError::InvalidOption("n_iter must be >= 1".into()));
        }
        if options.tol <= 0.0 {
            return Err(HmmError::InvalidOption("tol must be > 0".into()));
        }
        if emission.n_states() != options.n_components {
            return Err(HmmError::ShapeMismatch(format!(
                "emission family has {} states, expected {}",
                emission.n_states(),
                options.n_components
            )));
        }
        let n = options.n_components;
        Ok(Self {
            start_prob: DVector::from_element(n, 1.0 / n as f64),
            trans_mat: DMatrix::from_element(n, n, 1.0 / n as f64),
            emission,
            options,
            fitted: false,
            convergence: None,
        })
    }

    pub fn n_components(&self) -> usize {
        self.options.n_components
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    /// Convergence history from the most recent `fit` call, if any
    /// (spec §4.5 `ConvergenceMonitor`).
    pub fn convergence(&self) -> Option<&ConvergenceMonitor> {
        self.convergence.as_ref()
    }

    /// Validates `start_prob`/`trans_mat` stochasticity and the
    /// emission family's own parameters (spec §4.7).
    pub fn validate(&self) -> Result<()> {
        validate_stochastic_vec(&self.start_prob, "start_prob")?;
        validate_stochastic(&self.trans_mat, "trans_mat")?;
        self.emission.validate()
    }

    /// Re-estimates `start_prob` from accumulated E-step statistics,
    /// applying `startprob_prior` (spec §4.4 step 3).
    pub(crate) fn m_step_start(&mut self, start_stats: &DVector<f64>) {
        self.start_prob = normalize_row(start_stats, self.options.startprob_prior);
    }

    /// Re-estimates `trans_mat` row by row (spec §4.4 step 3). A row
    /// whose accumulated mass is zero resets to uniform (handled by
    /// `normalize_rows`'s fallback).
    pub(crate) fn m_step_trans(&mut self, trans_stats: &DMatrix<f64>) {
        self.trans_mat = normalize_rows(trans_stats, self.options.transmat_prior);
    }

    pub(crate) fn train_mask(&self) -> &str {
        &self.options.params
    }

    pub(crate) fn init_mask(&self) -> &str {
        &self.options.init_params
    }

    /// Serialises this model's parameters to JSON. Not a stable on-disk
    /// *format* (persistence/versioning is an explicit non-goal) -- a thin
    /// convenience for a host application's own storage layer.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialises a model previously produced by [`Model::to_json`].
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emission::Categorical;

    #[test]
    fn json_round_trip_preserves_parameters() {
        let cat = Categorical::new(2, 3);
        let model = Model::new(CommonOptions::new(2), cat).unwrap();
        let json = model.to_json().unwrap();
        let restored: Model<Categorical> = Model::from_json(&json).unwrap();
        assert_eq!(restored.n_components(), model.n_components());
        assert_eq!(restored.start_prob, model.start_prob);
        assert_eq!(restored.trans_mat, model.trans_mat);
    }

    #[test]
    fn from_json_rejects_malformed_input() {
        let err = Model::<Categorical>::from_json("not json").unwrap_err();
        assert!(matches!(err, HmmError::Serialization(_)));
    }
}
