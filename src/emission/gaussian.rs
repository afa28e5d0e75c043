//! Gaussian emissions with four covariance parameterisations (spec
//! §4.3.2).

use nalgebra::{DMatrix, DVector};
use rand::RngCore;
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};

use super::EmissionFamily;
use crate::error::{HmmError, Result};
use crate::guard::validate_covariance;
use crate::model::{Covariances, CovarianceType};
use crate::numeric::{cholesky_with_floor, gaussian_log_density_chol};

pub const LETTER_MEANS: char = 'm';
pub const LETTER_COVARS: char = 'c';

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Gaussian {
    n_components: usize,
    n_features: usize,
    pub means: Vec<DVector<f64>>,
    pub covariances: Covariances,
    pub min_covar: f64,
    /// Mean prior: `means_prior[j]` pulls state `j`'s mean towards it
    /// with pseudo-count weight `means_weight` (spec §4.3.2 mean MAP
    /// term).
    pub means_prior: Vec<DVector<f64>>,
    pub means_weight: f64,
    /// Covariance prior (spec §4.3.2): `covars_prior` is the analogue of
    /// the Gamma rate `beta` (diag/spherical) or inverse-Wishart scale
    /// (full/tied); `covars_weight` is the analogue of the Gamma shape
    /// `alpha`.
    pub covars_weight: f64,
    pub covars_prior: f64,
}

impl Gaussian {
    pub fn new(n_components: usize, n_features: usize, cov_type: CovarianceType) -> Self {
        let means = vec![DVector::zeros(n_features); n_components];
        let covariances = match cov_type {
            CovarianceType::Spherical => Covariances::Spherical(vec![1.0; n_components]),
            CovarianceType::Diag => Covariances::Diag(vec![DVector::from_element(n_features, 1.0); n_components]),
            CovarianceType::Full => {
                Covariances::Full(vec![DMatrix::identity(n_features, n_features); n_components])
            }
            CovarianceType::Tied => Covariances::Tied(DMatrix::identity(n_features, n_features)),
        };
        Self {
            n_components,
            n_features,
            means,
            covariances,
            min_covar: 1e-3,
            means_prior: vec![DVector::zeros(n_features); n_components],
            means_weight: 0.0,
            covars_weight: 1.0,
            covars_prior: 0.0,
        }
    }

    pub fn with_means(mut self, means: Vec<DVector<f64>>) -> Result<Self> {
        if means.len() != self.n_components || means.iter().any(|m| m.len() != self.n_features) {
            return Err(HmmError::ShapeMismatch("means shape mismatch".into()));
        }
        self.means = means;
        Ok(self)
    }

    pub fn with_covariances(mut self, covariances: Covariances) -> Result<Self> {
        self.validate_covariances(&covariances)?;
        self.covariances = covariances;
        Ok(self)
    }

    fn validate_covariances(&self, covariances: &Covariances) -> Result<()> {
        let cov_type = covariances.cov_type();
        let n_matrices = match covariances {
            Covariances::Spherical(v) => v.len(),
            Covariances::Diag(v) => v.len(),
            Covariances::Full(v) => v.len(),
            Covariances::Tied(_) => 1,
        };
        if !matches!(covariances, Covariances::Tied(_)) && n_matrices != self.n_components {
            return Err(HmmError::ShapeMismatch(format!(
                "expected {} per-state covariances, got {n_matrices}",
                self.n_components
            )));
        }
        let states = if matches!(covariances, Covariances::Tied(_)) { 1 } else { self.n_components };
        for j in 0..states {
            validate_covariance(&covariances.as_matrix(j, self.n_features), cov_type, self.min_covar)?;
        }
        Ok(())
    }

    pub fn with_min_covar(mut self, min_covar: f64) -> Self {
        self.min_covar = min_covar;
        self
    }

    fn covariance_for(&self, j: usize) -> DMatrix<f64> {
        self.covariances.as_matrix(j, self.n_features)
    }
}

#[derive(Clone, Debug)]
pub struct GaussianStats {
    pub post: DVector<f64>,
    pub obs: Vec<DVector<f64>>,
    pub obs_outer: Vec<DMatrix<f64>>,
}

impl EmissionFamily for Gaussian {
    type Stats = GaussianStats;

    fn letters() -> &'static str {
        "mc"
    }

    fn n_states(&self) -> usize {
        self.n_components
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn validate(&self) -> Result<()> {
        if self.means.len() != self.n_components || self.means.iter().any(|m| m.len() != self.n_features) {
            return Err(HmmError::ShapeMismatch("means shape mismatch".into()));
        }
        self.validate_covariances(&self.covariances)
    }

    fn initialise(&mut self, rows: &DMatrix<f64>, mask: &str, rng: &mut dyn RngCore) -> Result<()> {
        if mask.contains(LETTER_MEANS) {
            let t = rows.nrows();
            for j in 0..self.n_components {
                let idx = (rand::Rng::gen::<f64>(rng) * t as f64) as usize % t.max(1);
                self.means[j] = rows.row(idx.min(t.saturating_sub(1))).transpose();
            }
        }
        if mask.contains(LETTER_COVARS) {
            let global_var = row_variance(rows);
            self.covariances = match self.covariances.cov_type() {
                CovarianceType::Spherical => {
                    Covariances::Spherical(vec![global_var.iter().sum::<f64>() / self.n_features as f64; self.n_components])
                }
                CovarianceType::Diag => Covariances::Diag(vec![global_var.clone(); self.n_components]),
                CovarianceType::Full => {
                    Covariances::Full(vec![DMatrix::from_diagonal(&global_var); self.n_components])
                }
                CovarianceType::Tied => Covariances::Tied(DMatrix::from_diagonal(&global_var)),
            };
        }
        Ok(())
    }

    fn log_likelihood(&self, rows: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let t = rows.nrows();
        let mut b = DMatrix::zeros(t, self.n_components);
        let covs: Vec<DMatrix<f64>> = (0..self.n_components).map(|j| self.covariance_for(j)).collect();
        for ti in 0..t {
            let x = rows.row(ti).transpose();
            for j in 0..self.n_components {
                b[(ti, j)] = gaussian_log_density_chol(&x, &self.means[j], &covs[j], self.min_covar)?;
            }
        }
        Ok(b)
    }

    fn stats_init(&self) -> Self::Stats {
        GaussianStats {
            post: DVector::zeros(self.n_components),
            obs: vec![DVector::zeros(self.n_features); self.n_components],
            obs_outer: vec![DMatrix::zeros(self.n_features, self.n_features); self.n_components],
        }
    }

    fn accumulate(&self, stats: &mut Self::Stats, rows: &DMatrix<f64>, gamma: &DMatrix<f64>) -> Result<()> {
        for t in 0..rows.nrows() {
            let x = rows.row(t).transpose();
            for j in 0..self.n_components {
                let w = gamma[(t, j)];
                stats.post[j] += w;
                stats.obs[j] += &x * w;
                stats.obs_outer[j] += (&x * x.transpose()) * w;
            }
        }
        Ok(())
    }

    fn m_step(&mut self, stats: &Self::Stats, mask: &str) -> Result<()> {
        let n = self.n_features;

        if mask.contains(LETTER_MEANS) {
            for j in 0..self.n_components {
                let denom = stats.post[j] + self.means_weight;
                if denom > 0.0 {
                    self.means[j] = (&stats.obs[j] + &self.means_prior[j] * self.means_weight) / denom;
                }
            }
        }

        if mask.contains(LETTER_COVARS) {
            match &self.covariances {
                Covariances::Spherical(_) => {
                    let mut out = Vec::with_capacity(self.n_components);
                    for j in 0..self.n_components {
                        let c = spherical_covar(
                            &stats.obs[j],
                            &stats.obs_outer[j],
                            &self.means[j],
                            &self.means_prior[j],
                            stats.post[j],
                            self.covars_weight,
                            self.covars_prior,
                            self.means_weight,
                            n,
                        );
                        out.push(c.max(self.min_covar));
                    }
                    self.covariances = Covariances::Spherical(out);
                }
                Covariances::Diag(_) => {
                    let mut out = Vec::with_capacity(self.n_components);
                    for j in 0..self.n_components {
                        out.push(diag_covar(
                            &stats.obs[j],
                            &stats.obs_outer[j],
                            &self.means[j],
                            &self.means_prior[j],
                            stats.post[j],
                            self.covars_weight,
                            self.covars_prior,
                            self.means_weight,
                            self.min_covar,
                        ));
                    }
                    self.covariances = Covariances::Diag(out);
                }
                Covariances::Full(_) => {
                    let mut out = Vec::with_capacity(self.n_components);
                    for j in 0..self.n_components {
                        let c = full_covar(&stats.obs[j], &stats.obs_outer[j], &self.means[j], stats.post[j], self.covars_weight, self.covars_prior, n);
                        out.push(floor_covar(&c, self.min_covar)?);
                    }
                    self.covariances = Covariances::Full(out);
                }
                Covariances::Tied(_) => {
                    let mut acc = DMatrix::zeros(n, n);
                    let mut total_post = 0.0;
                    for j in 0..self.n_components {
                        acc += full_covar_numerator(&stats.obs[j], &stats.obs_outer[j], &self.means[j], stats.post[j]);
                        total_post += stats.post[j];
                    }
                    acc += DMatrix::identity(n, n) * (2.0 * self.covars_prior);
                    let denom = total_post + 2.0 * self.covars_weight + n as f64 + 1.0;
                    let c = acc / denom.max(1e-12);
                    self.covariances = Covariances::Tied(floor_covar(&c, self.min_covar)?);
                }
            }
        }
        Ok(())
    }

    fn sample_from_state(&self, j: usize, rng: &mut dyn RngCore) -> Vec<f64> {
        let cov = self.covariance_for(j);
        let chol = cholesky_with_floor(&cov, self.min_covar).unwrap_or_else(|_| DMatrix::identity(self.n_features, self.n_features));
        let z = DVector::from_iterator(
            self.n_features,
            (0..self.n_features).map(|_| {
                let dist = rand_distr::StandardNormal;
                Distribution::<f64>::sample(&dist, &mut RngShim::new(rng))
            }),
        );
        (&self.means[j] + chol * z).iter().copied().collect()
    }

    fn n_free_scalars(&self, mask: &str) -> usize {
        let mut count = 0;
        if mask.contains(LETTER_MEANS) {
            count += self.n_components * self.n_features;
        }
        if mask.contains(LETTER_COVARS) {
            count += match self.covariances.cov_type() {
                CovarianceType::Spherical => self.n_components,
                CovarianceType::Diag => self.n_components * self.n_features,
                CovarianceType::Full => self.n_components * self.n_features * (self.n_features + 1) / 2,
                CovarianceType::Tied => self.n_features * (self.n_features + 1) / 2,
            };
        }
        count
    }
}

pub(crate) fn row_variance(rows: &DMatrix<f64>) -> DVector<f64> {
    let n = rows.ncols();
    let mut v = DVector::from_element(n, 1.0);
    for d in 0..n {
        let col = rows.column(d);
        let mean = col.mean();
        let var = col.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (col.len().max(1) as f64);
        v[d] = var.max(1e-3);
    }
    v
}

/// Numerator of the centred second-moment matrix before dividing by the
/// posterior mass, shared by the full and tied M-step branches:
/// `obs_outer - obs*meanᵀ - mean*obsᵀ + post*mean*meanᵀ`.
fn full_covar_numerator(obs: &DVector<f64>, obs_outer: &DMatrix<f64>, mean: &DVector<f64>, post: f64) -> DMatrix<f64> {
    obs_outer - obs * mean.transpose() - mean * obs.transpose() + mean * mean.transpose() * post
}

fn full_covar(obs: &DVector<f64>, obs_outer: &DMatrix<f64>, mean: &DVector<f64>, post: f64, weight: f64, prior: f64, n: usize) -> DMatrix<f64> {
    let numerator = full_covar_numerator(obs, obs_outer, mean, post) + DMatrix::identity(n, n) * (2.0 * prior);
    let denom = (post + 2.0 * weight + n as f64 + 1.0).max(1e-12);
    numerator / denom
}

/// Spec §4.3.2 diagonal M-step:
/// `(obs_sq - 2*means*obs + post*means^2 + 2*beta + lambda*(means-mu0)^2)
/// / (post + 2*alpha + 1)`, floored at `min_covar`.
#[allow(clippy::too_many_arguments)]
fn diag_covar(
    obs: &DVector<f64>,
    obs_outer: &DMatrix<f64>,
    mean: &DVector<f64>,
    means_prior: &DVector<f64>,
    post: f64,
    weight: f64,
    prior: f64,
    means_weight: f64,
    min_covar: f64,
) -> DVector<f64> {
    let n = mean.len();
    let mut out = DVector::zeros(n);
    for d in 0..n {
        let centered = obs_outer[(d, d)] - 2.0 * mean[d] * obs[d] + post * mean[d] * mean[d];
        let mean_prior_term = means_weight * (mean[d] - means_prior[d]).powi(2);
        let numerator = centered + 2.0 * prior + mean_prior_term;
        let denom = post + 2.0 * weight + 1.0;
        out[d] = (numerator / denom).max(min_covar);
    }
    out
}

/// Spherical covariance: the average of [`diag_covar`]'s per-dimension
/// result across `D` (spec §4.3.2 "spherical: average the diagonal
/// result across D").
#[allow(clippy::too_many_arguments)]
fn spherical_covar(
    obs: &DVector<f64>,
    obs_outer: &DMatrix<f64>,
    mean: &DVector<f64>,
    means_prior: &DVector<f64>,
    post: f64,
    weight: f64,
    prior: f64,
    means_weight: f64,
    n: usize,
) -> f64 {
    let mut total = 0.0;
    for d in 0..n {
        let centered = obs_outer[(d, d)] - 2.0 * mean[d] * obs[d] + post * mean[d] * mean[d];
        let mean_prior_term = means_weight * (mean[d] - means_prior[d]).powi(2);
        total += centered + 2.0 * prior + mean_prior_term;
    }
    let denom = n as f64 * (post + 2.0 * weight + 1.0);
    total / denom
}

fn floor_covar(cov: &DMatrix<f64>, min_covar: f64) -> Result<DMatrix<f64>> {
    match nalgebra::Cholesky::new(cov.clone()) {
        Some(_) => Ok(cov.clone()),
        None => {
            let d = cov.nrows();
            let floored = cov + DMatrix::<f64>::identity(d, d) * min_covar;
            if nalgebra::Cholesky::new(floored.clone()).is_some() {
                Ok(floored)
            } else {
                Err(HmmError::NonPositiveDefinite("re-estimated covariance is not PD after flooring".into()))
            }
        }
    }
}

pub(crate) struct RngShim<'a>(&'a mut dyn RngCore);

impl<'a> RngShim<'a> {
    pub(crate) fn new(inner: &'a mut dyn RngCore) -> Self {
        Self(inner)
    }
}

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
    fn log_likelihood_diag_matches_product_of_univariate_normals() {
        let g = Gaussian::new(1, 2, CovarianceType::Diag)
            .with_means(vec![DVector::from_vec(vec![1.0, -1.0])])
            .unwrap()
            .with_covariances(Covariances::Diag(vec![DVector::from_vec(vec![2.0, 0.5])]))
            .unwrap();
        let rows = DMatrix::from_row_slice(1, 2, &[1.0, -1.0]);
        let b = g.log_likelihood(&rows).unwrap();
        let expected = -0.5 * (2.0_f64 * std::f64::consts::PI * 2.0).ln() - 0.5 * (2.0 * std::f64::consts::PI * 0.5).ln();
        assert_relative_eq!(b[(0, 0)], expected, epsilon = 1e-9);
    }

    #[test]
    fn m_step_recovers_sample_mean_with_flat_prior() {
        let g = Gaussian::new(1, 1, CovarianceType::Diag);
        let mut stats = g.stats_init();
        let rows = DMatrix::from_row_slice(3, 1, &[1.0, 2.0, 3.0]);
        let gamma = DMatrix::from_element(3, 1, 1.0);
        g.accumulate(&mut stats, &rows, &gamma).unwrap();
        let mut g2 = g.clone();
        g2.m_step(&stats, "m").unwrap();
        assert_relative_eq!(g2.means[0][0], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn full_covariance_m_step_is_symmetric_positive_definite() {
        let g = Gaussian::new(1, 2, CovarianceType::Full);
        let mut stats = g.stats_init();
        let rows = DMatrix::from_row_slice(4, 2, &[1.0, 2.0, 1.5, 2.5, 0.5, 1.5, 2.0, 3.0]);
        let gamma = DMatrix::from_element(4, 1, 1.0);
        g.accumulate(&mut stats, &rows, &gamma).unwrap();
        let mut g2 = g.clone();
        g2.m_step(&stats, "c").unwrap();
        if let Covariances::Full(cov) = &g2.covariances {
            assert_relative_eq!(cov[0][(0, 1)], cov[0][(1, 0)], epsilon = 1e-9);
            assert!(nalgebra::Cholesky::new(cov[0].clone()).is_some());
        } else {
            panic!("expected full covariance");
        }
    }
}
