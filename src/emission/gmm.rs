//! Gaussian Mixture emissions: `n_mix` mixture components per HMM state
//! (spec §4.3.5).

use nalgebra::{DMatrix, DVector};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::gaussian::{row_variance, RngShim};
use super::EmissionFamily;
use crate::error::{HmmError, Result};
use crate::guard::normalize_row;
use crate::model::{Covariances, CovarianceType};
use crate::numeric::{cholesky_with_floor, gaussian_log_density_chol, logsumexp};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Gmm {
    n_components: usize,
    n_mix: usize,
    n_features: usize,
    /// `weights[j][m]`, row-stochastic per state.
    pub weights: Vec<Vec<f64>>,
    /// `means[j][m]`.
    pub means: Vec<Vec<DVector<f64>>>,
    /// Covariances flattened over `(state, mixture)` pairs at index
    /// `j * n_mix + m`, reusing [`Covariances`]'s per-index storage.
    pub covariances: Covariances,
    pub min_covar: f64,
    pub weights_prior: f64,
    pub means_weight: f64,
    pub covars_weight: f64,
    pub covars_prior: f64,
}

impl Gmm {
    pub fn new(n_components: usize, n_mix: usize, n_features: usize, cov_type: CovarianceType) -> Self {
        let n_flat = n_components * n_mix;
        let covariances = match cov_type {
            CovarianceType::Spherical => Covariances::Spherical(vec![1.0; n_flat]),
            CovarianceType::Diag => Covariances::Diag(vec![DVector::from_element(n_features, 1.0); n_flat]),
            CovarianceType::Full => Covariances::Full(vec![DMatrix::identity(n_features, n_features); n_flat]),
            CovarianceType::Tied => Covariances::Tied(DMatrix::identity(n_features, n_features)),
        };
        Self {
            n_components,
            n_mix,
            n_features,
            weights: vec![vec![1.0 / n_mix as f64; n_mix]; n_components],
            means: vec![vec![DVector::zeros(n_features); n_mix]; n_components],
            covariances,
            min_covar: 1e-3,
            weights_prior: 1.0,
            means_weight: 0.0,
            covars_weight: 1.0,
            covars_prior: 0.0,
        }
    }

    fn flat(&self, j: usize, m: usize) -> usize {
        j * self.n_mix + m
    }

    fn covariance_for(&self, j: usize, m: usize) -> DMatrix<f64> {
        let idx = if matches!(self.covariances, Covariances::Tied(_)) { 0 } else { self.flat(j, m) };
        self.covariances.as_matrix(idx, self.n_features)
    }
}

#[derive(Clone, Debug)]
pub struct GmmStats {
    /// `post_mix_sum[j][m] = sum_t gamma[t,j] * resp[t,j,m]`.
    pub post_mix_sum: Vec<Vec<f64>>,
    pub post_sum: Vec<f64>,
    pub obs: Vec<Vec<DVector<f64>>>,
    pub obs_outer: Vec<Vec<DMatrix<f64>>>,
}

impl EmissionFamily for Gmm {
    type Stats = GmmStats;

    fn letters() -> &'static str {
        "wmc"
    }

    fn n_states(&self) -> usize {
        self.n_components
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn validate(&self) -> Result<()> {
        if self.weights.len() != self.n_components || self.weights.iter().any(|w| w.len() != self.n_mix) {
            return Err(HmmError::ShapeMismatch("weights shape mismatch".into()));
        }
        for (j, row) in self.weights.iter().enumerate() {
            let sum: f64 = row.iter().sum();
            if row.iter().any(|&w| w < 0.0) || (sum - 1.0).abs() > 1e-9 {
                return Err(HmmError::NotStochastic(format!("mixture weights for state {j} do not sum to 1")));
            }
        }
        Ok(())
    }

    fn initialise(&mut self, rows: &DMatrix<f64>, mask: &str, rng: &mut dyn RngCore) -> Result<()> {
        if mask.contains('w') {
            self.weights = vec![vec![1.0 / self.n_mix as f64; self.n_mix]; self.n_components];
        }
        if mask.contains('m') {
            let t = rows.nrows().max(1);
            for j in 0..self.n_components {
                for m in 0..self.n_mix {
                    let idx = ((rand::Rng::gen::<f64>(rng) * t as f64) as usize).min(t - 1);
                    self.means[j][m] = rows.row(idx).transpose();
                }
            }
        }
        if mask.contains('c') {
            let global_var = row_variance(rows);
            let n_flat = self.n_components * self.n_mix;
            self.covariances = match self.covariances.cov_type() {
                CovarianceType::Spherical => {
                    Covariances::Spherical(vec![global_var.iter().sum::<f64>() / self.n_features as f64; n_flat])
                }
                CovarianceType::Diag => Covariances::Diag(vec![global_var.clone(); n_flat]),
                CovarianceType::Full => Covariances::Full(vec![DMatrix::from_diagonal(&global_var); n_flat]),
                CovarianceType::Tied => Covariances::Tied(DMatrix::from_diagonal(&global_var)),
            };
        }
        Ok(())
    }

    fn log_likelihood(&self, rows: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let t = rows.nrows();
        let mut b = DMatrix::zeros(t, self.n_components);
        for ti in 0..t {
            let x = rows.row(ti).transpose();
            for j in 0..self.n_components {
                let mut terms = vec![0.0; self.n_mix];
                for m in 0..self.n_mix {
                    let cov = self.covariance_for(j, m);
                    let dens = gaussian_log_density_chol(&x, &self.means[j][m], &cov, self.min_covar)?;
                    terms[m] = self.weights[j][m].ln() + dens;
                }
                b[(ti, j)] = logsumexp(&terms);
            }
        }
        Ok(b)
    }

    fn stats_init(&self) -> Self::Stats {
        GmmStats {
            post_mix_sum: vec![vec![0.0; self.n_mix]; self.n_components],
            post_sum: vec![0.0; self.n_components],
            obs: vec![vec![DVector::zeros(self.n_features); self.n_mix]; self.n_components],
            obs_outer: vec![vec![DMatrix::zeros(self.n_features, self.n_features); self.n_mix]; self.n_components],
        }
    }

    fn accumulate(&self, stats: &mut Self::Stats, rows: &DMatrix<f64>, gamma: &DMatrix<f64>) -> Result<()> {
        for t in 0..rows.nrows() {
            let x = rows.row(t).transpose();
            for j in 0..self.n_components {
                let gamma_tj = gamma[(t, j)];
                stats.post_sum[j] += gamma_tj;

                let mut log_comp = vec![0.0; self.n_mix];
                for m in 0..self.n_mix {
                    let cov = self.covariance_for(j, m);
                    let dens = gaussian_log_density_chol(&x, &self.means[j][m], &cov, self.min_covar)?;
                    log_comp[m] = self.weights[j][m].ln() + dens;
                }
                let lse = logsumexp(&log_comp);
                for m in 0..self.n_mix {
                    let resp = if lse.is_finite() { (log_comp[m] - lse).exp() } else { 1.0 / self.n_mix as f64 };
                    let w = gamma_tj * resp;
                    stats.post_mix_sum[j][m] += w;
                    stats.obs[j][m] += &x * w;
                    stats.obs_outer[j][m] += (&x * x.transpose()) * w;
                }
            }
        }
        Ok(())
    }

    fn m_step(&mut self, stats: &Self::Stats, mask: &str) -> Result<()> {
        let n = self.n_features;

        if mask.contains('w') {
            for j in 0..self.n_components {
                let v = DVector::from_vec(stats.post_mix_sum[j].clone());
                let normalized = normalize_row(&v, self.weights_prior);
                self.weights[j] = normalized.iter().copied().collect();
            }
        }

        if mask.contains('m') {
            for j in 0..self.n_components {
                for m in 0..self.n_mix {
                    let denom = stats.post_mix_sum[j][m] + self.means_weight;
                    if denom > 0.0 {
                        self.means[j][m] = &stats.obs[j][m] / denom;
                    }
                }
            }
        }

        if mask.contains('c') {
            match self.covariances.cov_type() {
                CovarianceType::Tied => {
                    let mut acc = DMatrix::zeros(n, n);
                    let mut total = 0.0;
                    for j in 0..self.n_components {
                        for m in 0..self.n_mix {
                            acc += centered_numerator(&stats.obs[j][m], &stats.obs_outer[j][m], &self.means[j][m], stats.post_mix_sum[j][m]);
                            total += stats.post_mix_sum[j][m];
                        }
                    }
                    acc += DMatrix::identity(n, n) * (2.0 * self.covars_prior);
                    let denom = (total + 2.0 * self.covars_weight + n as f64 + 1.0).max(1e-12);
                    self.covariances = Covariances::Tied(floor_covar(&(acc / denom), self.min_covar)?);
                }
                cov_type => {
                    let n_flat = self.n_components * self.n_mix;
                    let mut full = Vec::with_capacity(n_flat);
                    for j in 0..self.n_components {
                        for m in 0..self.n_mix {
                            let numerator = centered_numerator(&stats.obs[j][m], &stats.obs_outer[j][m], &self.means[j][m], stats.post_mix_sum[j][m])
                                + DMatrix::identity(n, n) * (2.0 * self.covars_prior);
                            let denom = (stats.post_mix_sum[j][m] + 2.0 * self.covars_weight + n as f64 + 1.0).max(1e-12);
                            full.push(floor_covar(&(numerator / denom), self.min_covar)?);
                        }
                    }
                    self.covariances = match cov_type {
                        CovarianceType::Full => Covariances::Full(full),
                        CovarianceType::Diag => Covariances::Diag(full.iter().map(|m| m.diagonal()).collect()),
                        CovarianceType::Spherical => {
                            Covariances::Spherical(full.iter().map(|m| m.diagonal().iter().sum::<f64>() / n as f64).collect())
                        }
                        CovarianceType::Tied => unreachable!(),
                    };
                }
            }
        }
        Ok(())
    }

    fn sample_from_state(&self, j: usize, rng: &mut dyn RngCore) -> Vec<f64> {
        let m = super::sample_categorical(&self.weights[j], rng);
        let cov = self.covariance_for(j, m);
        let chol = cholesky_with_floor(&cov, self.min_covar).unwrap_or_else(|_| DMatrix::identity(self.n_features, self.n_features));
        let z = DVector::from_iterator(self.n_features, (0..self.n_features).map(|_| {
            use rand_distr::Distribution;
            Distribution::<f64>::sample(&rand_distr::StandardNormal, &mut RngShim::new(rng))
        }));
        (&self.means[j][m] + chol * z).iter().copied().collect()
    }

    fn n_free_scalars(&self, mask: &str) -> usize {
        let mut count = 0;
        if mask.contains('w') {
            count += self.n_components * (self.n_mix - 1);
        }
        if mask.contains('m') {
            count += self.n_components * self.n_mix * self.n_features;
        }
        if mask.contains('c') {
            let per = self.n_features * (self.n_features + 1) / 2;
            count += match self.covariances.cov_type() {
                CovarianceType::Spherical => self.n_components * self.n_mix,
                CovarianceType::Diag => self.n_components * self.n_mix * self.n_features,
                CovarianceType::Full => self.n_components * self.n_mix * per,
                CovarianceType::Tied => per,
            };
        }
        count
    }
}

fn centered_numerator(obs: &DVector<f64>, obs_outer: &DMatrix<f64>, mean: &DVector<f64>, post: f64) -> DMatrix<f64> {
    obs_outer - obs * mean.transpose() - mean * obs.transpose() + mean * mean.transpose() * post
}

fn floor_covar(cov: &DMatrix<f64>, min_covar: f64) -> Result<DMatrix<f64>> {
    let d = cov.nrows();
    if nalgebra::Cholesky::new(cov.clone()).is_some() {
        return Ok(cov.clone());
    }
    let floored = cov + DMatrix::<f64>::identity(d, d) * min_covar;
    if nalgebra::Cholesky::new(floored.clone()).is_some() {
        Ok(floored)
    } else {
        Err(HmmError::NonPositiveDefinite("mixture covariance is not PD after flooring".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fixture() -> Gmm {
        let mut g = Gmm::new(1, 2, 1, CovarianceType::Diag);
        g.means[0][0] = DVector::from_vec(vec![-2.0]);
        g.means[0][1] = DVector::from_vec(vec![2.0]);
        g.weights[0] = vec![0.5, 0.5];
        g
    }

    #[test]
    fn log_likelihood_is_logsumexp_of_weighted_components() {
        let g = fixture();
        let rows = DMatrix::from_row_slice(1, 1, &[-2.0]);
        let b = g.log_likelihood(&rows).unwrap();
        let d0 = gaussian_log_density_chol(&DVector::from_vec(vec![-2.0]), &g.means[0][0], &g.covariance_for(0, 0), g.min_covar).unwrap();
        let d1 = gaussian_log_density_chol(&DVector::from_vec(vec![-2.0]), &g.means[0][1], &g.covariance_for(0, 1), g.min_covar).unwrap();
        let expected = logsumexp(&[0.5_f64.ln() + d0, 0.5_f64.ln() + d1]);
        assert_relative_eq!(b[(0, 0)], expected, epsilon = 1e-9);
    }

    #[test]
    fn initialise_with_c_derives_covariance_from_data() {
        let mut g = Gmm::new(1, 1, 1, CovarianceType::Diag);
        let rows = DMatrix::from_row_slice(4, 1, &[0.0, 2.0, 4.0, 6.0]);
        let mut rng = rand_chacha_for_test();
        g.initialise(&rows, "c", &mut rng).unwrap();
        let Covariances::Diag(diags) = &g.covariances else { panic!("expected diag") };
        assert_relative_eq!(diags[0][0], row_variance(&rows)[0], epsilon = 1e-9);
    }

    fn rand_chacha_for_test() -> impl RngCore {
        use rand::SeedableRng;
        rand_chacha::ChaCha8Rng::seed_from_u64(7)
    }

    #[test]
    fn weights_m_step_renormalizes_to_one() {
        let g = fixture();
        let mut stats = g.stats_init();
        stats.post_mix_sum[0] = vec![3.0, 1.0];
        let mut g2 = g.clone();
        g2.m_step(&stats, "w").unwrap();
        let sum: f64 = g2.weights[0].iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-9);
        assert_relative_eq!(g2.weights[0][0], 0.75, epsilon = 1e-9);
    }
}
