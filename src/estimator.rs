//! Baum–Welch EM orchestration and the inference-time operations built
//! on top of the lattice (spec §4.4).

use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::RngCore;
use rayon::prelude::*;

use crate::convergence::ConvergenceMonitor;
use crate::emission::EmissionFamily;
use crate::error::{HmmError, Result};
use crate::lattice::{viterbi, Lattice};
use crate::model::{Algorithm, Model};
use crate::sequence::ObservationBuffer;

impl<E: EmissionFamily + Send + Sync> Model<E>
where
    E::Stats: Send,
{
    fn check_features(&self, buffer: &ObservationBuffer) -> Result<()> {
        if buffer.n_features() != self.emission.n_features() {
            return Err(HmmError::ShapeMismatch(format!(
                "observation buffer has {} columns, emission family expects {}",
                buffer.n_features(),
                self.emission.n_features()
            )));
        }
        Ok(())
    }

    /// One parallel E-step pass: computes one [`Lattice`] per
    /// subsequence concurrently (read-only access to `self`'s
    /// parameters), in the fixed order `buffer.subsequences()` returns
    /// (spec §5: reduction uses a fixed subsequence order for
    /// reproducibility).
    fn e_step_lattices(&self, subs: &[(usize, DMatrix<f64>)]) -> Result<Vec<Lattice>> {
        subs.par_iter()
            .map(|(_, rows)| {
                let log_b = self.emission.log_likelihood(rows)?;
                Lattice::compute(&self.start_prob, &self.trans_mat, log_b, self.options.implementation)
            })
            .collect()
    }

    /// Runs initialisation (if not already fitted) followed by up to
    /// `n_iter` EM iterations (spec §4.4).
    pub fn fit(&mut self, buffer: &ObservationBuffer, rng: &mut dyn RngCore) -> Result<&mut Self> {
        self.check_features(buffer)?;
        self.validate()?;

        let init_mask = self.init_mask().to_string();
        if !init_mask.is_empty() {
            self.emission.initialise(buffer.data(), &init_mask, rng)?;
        }

        let n = self.n_components();
        let train_mask = self.train_mask().to_string();
        let subs = buffer.subsequences();
        let mut monitor = ConvergenceMonitor::new(self.options.n_iter, self.options.tol, self.options.verbose);

        loop {
            let lattices = self.e_step_lattices(&subs)?;
            for lattice in &lattices {
                lattice.require_finite()?;
            }

            let mut start_stats = DVector::zeros(n);
            let mut trans_stats = DMatrix::zeros(n, n);
            let mut family_stats = self.emission.stats_init();
            let mut total_log_prob = 0.0;

            for ((_, rows), lattice) in subs.iter().zip(lattices.iter()) {
                total_log_prob += lattice.log_prob;
                start_stats += lattice.posteriors.row(0).transpose();
                if let Some(xi) = &lattice.xi_sum {
                    trans_stats += xi;
                }
                self.emission.accumulate(&mut family_stats, rows, &lattice.posteriors)?;
            }

            if train_mask.contains('s') {
                self.m_step_start(&start_stats);
            }
            if train_mask.contains('t') {
                self.m_step_trans(&trans_stats);
            }
            self.emission.m_step(&family_stats, &train_mask)?;

            debug!("EM iteration {} log-prob = {}", monitor.iterations(), total_log_prob);
            monitor.report(total_log_prob);
            if monitor.converged() {
                break;
            }
        }

        self.fitted = true;
        self.convergence = Some(monitor);
        Ok(self)
    }

    /// Sum of per-subsequence forward log-probabilities (spec §4.4
    /// `score`). A pure function of the current parameters.
    pub fn score(&self, buffer: &ObservationBuffer) -> Result<f64> {
        self.check_features(buffer)?;
        let subs = buffer.subsequences();
        let total: f64 = self
            .e_step_lattices(&subs)?
            .iter()
            .map(|lat| lat.log_prob)
            .sum();
        Ok(total)
    }

    /// Total log-probability plus the concatenation of per-subsequence
    /// posteriors (spec §4.4 `score_samples`).
    pub fn score_samples(&self, buffer: &ObservationBuffer) -> Result<(f64, DMatrix<f64>)> {
        self.check_features(buffer)?;
        let n = self.n_components();
        let subs = buffer.subsequences();
        let lattices = self.e_step_lattices(&subs)?;

        let mut total = 0.0;
        let mut posteriors = DMatrix::zeros(buffer.n_rows(), n);
        for ((offset, rows), lattice) in subs.iter().zip(lattices.iter()) {
            total += lattice.log_prob;
            for t in 0..rows.nrows() {
                for j in 0..n {
                    posteriors[(*offset + t, j)] = lattice.posteriors[(t, j)];
                }
            }
        }
        Ok((total, posteriors))
    }

    /// Most likely state path per subsequence, concatenated, plus the
    /// summed log-probability (spec §4.4 `decode`). `Algorithm::Map`
    /// takes the per-timestep argmax of the posterior instead of
    /// running Viterbi. On an empty buffer this returns `(0.0, vec![])`
    /// regardless of `algorithm` (spec §9 open question, fixed here).
    pub fn decode(&self, buffer: &ObservationBuffer, algorithm: Algorithm) -> Result<(f64, Vec<usize>)> {
        self.check_features(buffer)?;
        if buffer.n_rows() == 0 {
            return Ok((0.0, Vec::new()));
        }

        let subs = buffer.subsequences();
        let mut total = 0.0;
        let mut path = Vec::with_capacity(buffer.n_rows());

        match algorithm {
            Algorithm::Viterbi => {
                for (_, rows) in &subs {
                    let log_b = self.emission.log_likelihood(rows)?;
                    let (score, sub_path) = viterbi(&self.start_prob, &self.trans_mat, &log_b);
                    total += score;
                    path.extend(sub_path);
                }
            }
            Algorithm::Map => {
                let lattices = self.e_step_lattices(&subs)?;
                for lattice in &lattices {
                    total += lattice.log_prob;
                    for t in 0..lattice.posteriors.nrows() {
                        let mut best_j = 0usize;
                        let mut best_v = f64::NEG_INFINITY;
                        for j in 0..lattice.posteriors.ncols() {
                            let v = lattice.posteriors[(t, j)];
                            if v > best_v {
                                best_v = v;
                                best_j = j;
                            }
                        }
                        path.push(best_j);
                    }
                }
            }
        }
        Ok((total, path))
    }

    /// Convenience wrapper over `decode` using `self.options.algorithm`
    /// (spec §4.4 `predict`).
    pub fn predict(&self, buffer: &ObservationBuffer) -> Result<Vec<usize>> {
        self.decode(buffer, self.options.algorithm).map(|(_, path)| path)
    }

    /// Posterior state-occupation probabilities, i.e. `score_samples`'s
    /// `posteriors` without the log-probability (spec §6 `predict_proba`).
    pub fn predict_proba(&self, buffer: &ObservationBuffer) -> Result<DMatrix<f64>> {
        self.score_samples(buffer).map(|(_, posteriors)| posteriors)
    }

    /// Draws an initial state from `start_prob`, then alternates
    /// transition sampling and emission sampling for `n_samples` steps
    /// (spec §4.4 `sample`).
    pub fn sample(&self, n_samples: usize, rng: &mut dyn RngCore) -> (DMatrix<f64>, Vec<usize>) {
        let d = self.emission.n_features();
        let mut states = Vec::with_capacity(n_samples);
        let mut rows = Vec::with_capacity(n_samples);

        let start_probs: Vec<f64> = self.start_prob.iter().copied().collect();
        let mut state = crate::emission::sample_categorical(&start_probs, rng);
        for t in 0..n_samples {
            if t > 0 {
                let trans_row: Vec<f64> = self.trans_mat.row(state).iter().copied().collect();
                state = crate::emission::sample_categorical(&trans_row, rng);
            }
            states.push(state);
            rows.push(self.emission.sample_from_state(state, rng));
        }

        let mut data = DMatrix::zeros(n_samples, d);
        for (t, row) in rows.iter().enumerate() {
            for (d_idx, &v) in row.iter().enumerate() {
                data[(t, d_idx)] = v;
            }
        }
        (data, states)
    }

    fn n_free_scalars(&self) -> usize {
        let mask = self.train_mask();
        let n = self.n_components();
        let mut count = 0;
        if mask.contains('s') {
            count += n - 1;
        }
        if mask.contains('t') {
            count += n * (n - 1);
        }
        count += self.emission.n_free_scalars(mask);
        count
    }

    /// Akaike information criterion: `2k - 2*ln L` (spec §6 `aic`).
    pub fn aic(&self, buffer: &ObservationBuffer) -> Result<f64> {
        let ll = self.score(buffer)?;
        Ok(2.0 * self.n_free_scalars() as f64 - 2.0 * ll)
    }

    /// Bayesian information criterion: `k*ln(n) - 2*ln L` (spec §6
    /// `bic`).
    pub fn bic(&self, buffer: &ObservationBuffer) -> Result<f64> {
        let ll = self.score(buffer)?;
        let n_obs = buffer.n_rows().max(1) as f64;
        Ok(self.n_free_scalars() as f64 * n_obs.ln() - 2.0 * ll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emission::{Categorical, Gaussian};
    use crate::model::{CommonOptions, CovarianceType, Covariances};
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn scenario_1() -> Model<Categorical> {
        let cat = Categorical::new(2, 3)
            .with_emission_prob(DMatrix::from_row_slice(2, 3, &[0.1, 0.4, 0.5, 0.6, 0.3, 0.1]))
            .unwrap();
        let mut options = CommonOptions::new(2);
        options.params = String::new();
        let mut model = Model::new(options, cat).unwrap();
        model.start_prob = DVector::from_vec(vec![0.6, 0.4]);
        model.trans_mat = DMatrix::from_row_slice(2, 2, &[0.7, 0.3, 0.4, 0.6]);
        model
    }

    #[test]
    fn score_matches_reference_scenario_1() {
        let model = scenario_1();
        let data = DMatrix::from_row_slice(6, 1, &[0.0, 1.0, 2.0, 2.0, 1.0, 0.0]);
        let buffer = ObservationBuffer::single(data);
        let ll = model.score(&buffer).unwrap();
        assert_relative_eq!(ll, -7.4174, epsilon = 1e-3);
    }

    #[test]
    fn decode_viterbi_matches_reference_scenario_1() {
        let model = scenario_1();
        let data = DMatrix::from_row_slice(6, 1, &[0.0, 1.0, 2.0, 2.0, 1.0, 0.0]);
        let buffer = ObservationBuffer::single(data);
        let (_, path) = model.decode(&buffer, Algorithm::Viterbi).unwrap();
        assert_eq!(path, vec![1, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn decode_on_empty_buffer_returns_zero_and_empty_path() {
        let model = scenario_1();
        let buffer = ObservationBuffer::single(DMatrix::zeros(0, 1));
        let (score, path) = model.decode(&buffer, Algorithm::Map).unwrap();
        assert_eq!(score, 0.0);
        assert!(path.is_empty());
    }

    #[test]
    fn fit_improves_or_holds_log_likelihood_across_iterations() {
        let cat = Categorical::new(2, 3);
        let mut options = CommonOptions::new(2);
        options.params = "ste".into();
        options.init_params = String::new();
        options.n_iter = 5;
        let mut model = Model::new(options, cat).unwrap();
        let data = DMatrix::from_row_slice(12, 1, &[0.0, 1.0, 2.0, 2.0, 1.0, 0.0, 0.0, 1.0, 2.0, 2.0, 1.0, 0.0]);
        let buffer = ObservationBuffer::single(data);
        let before = model.score(&buffer).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        model.fit(&buffer, &mut rng).unwrap();
        let after = model.score(&buffer).unwrap();
        assert!(after >= before - 1e-6);
        assert!(model.is_fitted());
    }

    #[test]
    fn sample_then_score_is_finite() {
        let model = scenario_1();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let (data, states) = model.sample(10, &mut rng);
        assert_eq!(states.len(), 10);
        let buffer = ObservationBuffer::single(data);
        let ll = model.score(&buffer).unwrap();
        assert!(ll.is_finite());
    }

    #[test]
    fn aic_and_bic_are_finite_after_fit() {
        let model = scenario_1();
        let data = DMatrix::from_row_slice(6, 1, &[0.0, 1.0, 2.0, 2.0, 1.0, 0.0]);
        let buffer = ObservationBuffer::single(data);
        assert!(model.aic(&buffer).unwrap().is_finite());
        assert!(model.bic(&buffer).unwrap().is_finite());
    }

    fn scenario_2() -> Model<Gaussian> {
        let gauss = Gaussian::new(2, 1, CovarianceType::Diag)
            .with_means(vec![DVector::from_vec(vec![0.0]), DVector::from_vec(vec![3.0])])
            .unwrap()
            .with_covariances(Covariances::Diag(vec![
                DVector::from_vec(vec![1.0]),
                DVector::from_vec(vec![1.0]),
            ]))
            .unwrap();
        let mut options = CommonOptions::new(2);
        options.params = String::new();
        let mut model = Model::new(options, gauss).unwrap();
        model.start_prob = DVector::from_vec(vec![0.5, 0.5]);
        model.trans_mat = DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.2, 0.8]);
        model
    }

    #[test]
    fn score_matches_reference_scenario_2() {
        let model = scenario_2();
        let data = DMatrix::from_row_slice(5, 1, &[0.1, 0.2, 3.1, 2.9, 0.0]);
        let buffer = ObservationBuffer::single(data);
        let ll = model.score(&buffer).unwrap();
        assert_relative_eq!(ll, -8.0913, epsilon = 1e-3);
    }

    #[test]
    fn decode_viterbi_matches_reference_scenario_2() {
        let model = scenario_2();
        let data = DMatrix::from_row_slice(5, 1, &[0.1, 0.2, 3.1, 2.9, 0.0]);
        let buffer = ObservationBuffer::single(data);
        let (_, path) = model.decode(&buffer, Algorithm::Viterbi).unwrap();
        assert_eq!(path, vec![0, 0, 1, 1, 0]);
    }

    #[test]
    fn em_on_period_four_sequence_converges_near_reference_scenario_3() {
        let cat = Categorical::new(2, 2);
        let mut options = CommonOptions::new(2);
        options.params = "ste".into();
        options.init_params = "ste".into();
        options.n_iter = 50;
        options.tol = 1e-2;
        let mut model = Model::new(options, cat).unwrap();

        let pattern = [0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0];
        let observations: Vec<f64> = pattern.iter().copied().cycle().take(pattern.len() * 10).collect();
        let data = DMatrix::from_row_slice(observations.len(), 1, &observations);
        let buffer = ObservationBuffer::single(data);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        model.fit(&buffer, &mut rng).unwrap();
        let ll = model.score(&buffer).unwrap();

        assert!(ll >= -55.5 && ll <= -54.5, "converged log-prob {ll} outside expected range");
        for row in model.trans_mat.row_iter() {
            assert_relative_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
        }
    }
}
