//! # Hanzo HMM - Hidden Markov Model training and inference engine
//!
//! A log-space forward/backward/Viterbi lattice engine, Baum-Welch (EM)
//! training loop, and a pluggable emission-family abstraction (Categorical,
//! Gaussian with four covariance parameterisations, Multinomial, Poisson,
//! Gaussian Mixture) for discrete-time, finite-state HMMs.
//!
//! This crate generalises the single-family `HiddenMarkovModel<S, O>`
//! previously shipped here into [`Model<E>`], parameterised over an
//! [`EmissionFamily`] implementation, so the lattice recurrences and EM
//! orchestration are shared across every emission model rather than
//! duplicated per family.
//!
//! ## Quick start
//!
//! ```rust
//! use hanzo_hmm::prelude::*;
//! use nalgebra::DMatrix;
//! use rand::SeedableRng;
//!
//! let emission = Categorical::new(2, 3);
//! let mut options = CommonOptions::new(2);
//! options.params = "ste".into();
//! options.init_params = "ste".into();
//! let mut model = Model::new(options, emission).unwrap();
//!
//! let data = DMatrix::from_row_slice(8, 1, &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
//! let buffer = ObservationBuffer::single(data);
//! let mut rng = rand::rngs::StdRng::seed_from_u64(0);
//! model.fit(&buffer, &mut rng).unwrap();
//!
//! let (log_prob, path) = model.decode(&buffer, Algorithm::Viterbi).unwrap();
//! assert!(log_prob.is_finite());
//! assert_eq!(path.len(), 8);
//! ```
//!
//! ## Module layout
//!
//! - [`numeric`]: log-space primitives (`logsumexp`, Cholesky-based Gaussian
//!   log-density).
//! - [`lattice`]: forward/backward/Viterbi/posterior/xi-sum recurrences.
//! - [`emission`]: the pluggable `EmissionFamily` trait and its five
//!   implementations.
//! - [`estimator`]: Baum-Welch EM orchestration plus `score`/`decode`/
//!   `predict`/`sample`/`aic`/`bic`.
//! - [`convergence`]: the EM termination/non-monotonicity monitor.
//! - [`sequence`]: splitting a concatenated observation buffer by lengths.
//! - [`guard`]: parameter-simplex normalisation and validation.
//! - [`model`]: the shared `Model<E>` container and per-family options.
//! - [`error`]: the crate's typed error enum.
//!
//! What this crate does *not* do: no CLI, no configuration-file loading, no
//! persisted model file format, and no advanced initialisation schemes
//! (k-means, variational Bayes, Dirichlet/Wishart conjugate posteriors) --
//! those are treated as external collaborators, not part of the core engine.

pub mod convergence;
pub mod emission;
pub mod error;
pub mod estimator;
pub mod guard;
pub mod lattice;
pub mod model;
pub mod numeric;
pub mod sequence;

pub use emission::{Categorical, Gaussian, Gmm, Multinomial, Poisson};
pub use error::{HmmError, Result};
pub use lattice::{Implementation, Lattice};
pub use model::{Algorithm, CommonOptions, Covariances, CovarianceType, Model};
pub use sequence::ObservationBuffer;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::emission::{Categorical, EmissionFamily, Gaussian, Gmm, Multinomial, Poisson};
    pub use crate::error::{HmmError, Result};
    pub use crate::lattice::{Implementation, Lattice};
    pub use crate::model::{Algorithm, CommonOptions, Covariances, CovarianceType, Model};
    pub use crate::sequence::ObservationBuffer;
}
