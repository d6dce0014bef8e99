//! REML fit of the null model `y = Xβ + g + e`, `g ~ N(0, σ²g K)`.
//!
//! Spectral approach: with `H = K + λI`, the REML objective only depends on the
//! eigenvalues `θ` of `S K S` (S projects out X) and the projected response, so
//! `λ` is found by a one-dimensional search. Used once per GWAS scan to fix the
//! genome-wide variance ratio.

use breed_core::{BreedError, Result};
use log::debug;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};

/// Options for the null-model search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NullModelOptions {
    /// Search interval for λ = σ²e/σ²g (default: [1e-9, 1e9])
    pub bounds: (f64, f64),
}

impl Default for NullModelOptions {
    fn default() -> Self {
        Self { bounds: (1e-9, 1e9) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NullModelFit {
    /// σ²e / σ²g
    pub lambda: f64,
    pub vu: f64,
    pub ve: f64,
    pub beta: Vec<f64>,
    pub log_likelihood: f64,
    /// Eigenvalues of K (descending), clamped at zero.
    pub eigenvalues: Vec<f64>,
    /// Matching eigenvectors as columns.
    pub eigenvectors: DMatrix<f64>,
}

impl NullModelFit {
    pub fn heritability(&self) -> f64 {
        1.0 / (1.0 + self.lambda)
    }

    /// `D^{-1/2} Uᵀ v` with `D = φ + λ`; ordinary least squares on rotated data
    /// is generalised least squares under `H = K + λI`.
    pub fn rotate(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = self.eigenvectors.tr_mul(v);
        for (i, x) in out.iter_mut().enumerate() {
            *x /= (self.eigenvalues[i] + self.lambda).sqrt();
        }
        out
    }

    pub fn rotate_matrix(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = self.eigenvectors.tr_mul(m);
        for (i, mut row) in out.row_iter_mut().enumerate() {
            row /= (self.eigenvalues[i] + self.lambda).sqrt();
        }
        out
    }
}

/// Spectral pieces of the null model, computed once and reusable for any λ.
#[derive(Debug, Clone)]
pub struct SpectralNullModel {
    n: usize,
    p: usize,
    y: DVector<f64>,
    x: DMatrix<f64>,
    phi: Vec<f64>,
    u: DMatrix<f64>,
    theta: Vec<f64>,
    omega_sq: Vec<f64>,
}

fn sorted_descending(eig: &SymmetricEigen<f64, nalgebra::Dyn>) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    idx.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
    idx
}

impl SpectralNullModel {
    pub fn new(y: &[f64], x: &DMatrix<f64>, k: &DMatrix<f64>) -> Result<Self> {
        let n = y.len();
        let p = x.ncols();
        if x.nrows() != n {
            return Err(BreedError::dimension("null-model design rows", n, x.nrows()));
        }
        if k.nrows() != n || k.ncols() != n {
            return Err(BreedError::dimension("null-model relationship matrix", n, k.nrows()));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(BreedError::invalid("null-model response contains missing values"));
        }
        if n <= p + 1 {
            return Err(BreedError::invalid(format!(
                "null model needs more than {} observations, got {}",
                p + 1,
                n
            )));
        }

        let y = DVector::from_column_slice(y);
        let xtx_inv = (x.transpose() * x).try_inverse().ok_or_else(|| BreedError::SingularModel {
            ridge: 0.0,
            detail: "null-model covariates are collinear".to_string(),
        })?;
        let s = DMatrix::<f64>::identity(n, n) - x * &xtx_inv * x.transpose();

        // Offset keeps the decomposed matrices safely positive definite.
        let offset = (n as f64).sqrt();
        let mut hb = k.clone();
        for i in 0..n {
            hb[(i, i)] += offset;
        }

        let hb_eig = SymmetricEigen::new(hb.clone());
        let order = sorted_descending(&hb_eig);
        let phi: Vec<f64> = order.iter().map(|&i| hb_eig.eigenvalues[i] - offset).collect();
        let min_phi = phi.iter().cloned().fold(f64::INFINITY, f64::min);
        if min_phi < -1e-6 {
            return Err(BreedError::invalid(format!(
                "relationship matrix is not positive semi-definite (min eigenvalue {:.3e})",
                min_phi
            )));
        }
        let phi: Vec<f64> = phi.into_iter().map(|v| v.max(0.0)).collect();
        let u = DMatrix::from_fn(n, n, |i, j| hb_eig.eigenvectors[(i, order[j])]);

        let shbs = &s * &hb * &s;
        let shbs_eig = SymmetricEigen::new(shbs);
        let order = sorted_descending(&shbs_eig);
        let n_theta = n - p;
        let theta: Vec<f64> = order
            .iter()
            .take(n_theta)
            .map(|&i| (shbs_eig.eigenvalues[i] - offset).max(0.0))
            .collect();
        let q = DMatrix::from_fn(n, n_theta, |i, j| shbs_eig.eigenvectors[(i, order[j])]);
        let omega_sq: Vec<f64> = q.tr_mul(&y).iter().map(|o| o * o).collect();

        Ok(Self {
            n,
            p,
            y,
            x: x.clone(),
            phi,
            u,
            theta,
            omega_sq,
        })
    }

    fn reml_objective(&self, lambda: f64) -> f64 {
        if lambda <= 0.0 {
            return f64::INFINITY;
        }
        let sum_ratio: f64 = self
            .omega_sq
            .iter()
            .zip(&self.theta)
            .map(|(o, t)| o / (t + lambda))
            .sum();
        if sum_ratio <= 0.0 {
            return f64::INFINITY;
        }
        let sum_log: f64 = self.theta.iter().map(|t| (t + lambda).ln()).sum();
        ((self.n - self.p) as f64) * sum_ratio.ln() + sum_log
    }

    /// Estimate λ by REML.
    pub fn fit_reml(&self, options: Option<NullModelOptions>) -> Result<NullModelFit> {
        let opts = options.unwrap_or_default();
        let (lo, hi) = opts.bounds;
        if !(lo > 0.0 && hi > lo) {
            return Err(BreedError::invalid(format!("invalid lambda bounds ({}, {})", lo, hi)));
        }
        // Coarse log-scale grid to bracket the best basin, then golden section inside it.
        let (a, b) = (lo.ln(), hi.ln());
        let n_grid = 100;
        let step = (b - a) / n_grid as f64;
        let best = (0..=n_grid)
            .map(|i| a + step * i as f64)
            .map(|t| (t, self.reml_objective(t.exp())))
            .min_by(|x, y| x.1.total_cmp(&y.1))
            .map_or(a, |(t, _)| t);
        let (log_lambda, _) = golden_section_minimize(
            |t| self.reml_objective(t.exp()),
            (best - step).max(a),
            (best + step).min(b),
        );
        self.fit_with_ratio(log_lambda.exp())
    }

    /// Evaluate the null model at a fixed λ.
    pub fn fit_with_ratio(&self, lambda: f64) -> Result<NullModelFit> {
        if !(lambda > 0.0 && lambda.is_finite()) {
            return Err(BreedError::invalid(format!("variance ratio must be positive, got {}", lambda)));
        }
        let df = (self.n - self.p) as f64;
        let vu = self
            .omega_sq
            .iter()
            .zip(&self.theta)
            .map(|(o, t)| o / (t + lambda))
            .sum::<f64>()
            / df;
        let ve = lambda * vu;
        let obj = self.reml_objective(lambda);
        let log_likelihood = -0.5 * (obj + df + df * (2.0 * std::f64::consts::PI / df).ln());

        let mut fit = NullModelFit {
            lambda,
            vu,
            ve,
            beta: Vec::new(),
            log_likelihood,
            eigenvalues: self.phi.clone(),
            eigenvectors: self.u.clone(),
        };
        let x_star = fit.rotate_matrix(&self.x);
        let y_star = fit.rotate(&self.y);
        let w = x_star.tr_mul(&x_star);
        let w_inv = w.try_inverse().ok_or_else(|| BreedError::SingularModel {
            ridge: 0.0,
            detail: "null-model GLS system is singular".to_string(),
        })?;
        fit.beta = (w_inv * x_star.tr_mul(&y_star)).iter().copied().collect();

        debug!(
            "Null model: lambda = {:.4}, Vu = {:.4}, Ve = {:.4}, h2 = {:.3}",
            lambda,
            vu,
            ve,
            fit.heritability()
        );
        Ok(fit)
    }
}

/// Convenience wrapper: spectral decomposition plus REML search.
pub fn reml_null_model(
    y: &[f64],
    x: &DMatrix<f64>,
    k: &DMatrix<f64>,
    options: Option<NullModelOptions>,
) -> Result<NullModelFit> {
    SpectralNullModel::new(y, x, k)?.fit_reml(options)
}

/// Golden section search for the minimum of a unimodal function on [a, b].
fn golden_section_minimize<F>(f: F, mut a: f64, mut b: f64) -> (f64, f64)
where
    F: Fn(f64) -> f64,
{
    let gr = 0.5 * (1.0 + 5f64.sqrt());
    let tol = 1e-8;
    let max_iter = 200;

    let mut c = b - (b - a) / gr;
    let mut d = a + (b - a) / gr;
    let mut fc = f(c);
    let mut fd = f(d);

    for _ in 0..max_iter {
        if (b - a).abs() < tol {
            break;
        }
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - (b - a) / gr;
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + (b - a) / gr;
            fd = f(d);
        }
    }

    if fc < fd {
        (c, fc)
    } else {
        (d, fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_golden_section_quadratic() {
        let (x, fx) = golden_section_minimize(|x| (x - 2.0).powi(2) + 1.0, -10.0, 10.0);
        assert_relative_eq!(x, 2.0, epsilon = 1e-6);
        assert_relative_eq!(fx, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_identity_kernel_intercept() {
        let y = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = DMatrix::from_element(6, 1, 1.0);
        let k = DMatrix::identity(6, 6);
        let fit = reml_null_model(&y, &x, &k, None).unwrap();
        // With K = I every lambda gives the same GLS mean.
        assert_relative_eq!(fit.beta[0], 3.5, epsilon = 1e-8);
        assert!(fit.vu >= 0.0 && fit.ve >= 0.0);
        assert_eq!(fit.eigenvalues.len(), 6);
    }

    #[test]
    fn test_fixed_ratio_variances() {
        let y = vec![1.2, 0.7, 2.5, 3.1, 1.9, 0.4, 2.2];
        let x = DMatrix::from_element(7, 1, 1.0);
        #[rustfmt::skip]
        let k = DMatrix::from_fn(7, 7, |i, j| if i == j { 1.0 } else if i / 3 == j / 3 { 0.5 } else { 0.0 });
        let model = SpectralNullModel::new(&y, &x, &k).unwrap();
        let fit = model.fit_with_ratio(2.0).unwrap();
        assert_relative_eq!(fit.ve, 2.0 * fit.vu, epsilon = 1e-12);
        assert_relative_eq!(fit.heritability(), 1.0 / 3.0, epsilon = 1e-12);
        let reml = model.fit_reml(None).unwrap();
        assert!(reml.log_likelihood >= fit.log_likelihood - 1e-8);
    }

    #[test]
    fn test_fit_serialises_with_eigenvectors() {
        let y = vec![1.0, 2.5, 2.0, 4.0, 3.5];
        let x = DMatrix::from_element(5, 1, 1.0);
        let k = DMatrix::from_fn(5, 5, |i, j| if i == j { 1.0 } else { 0.2 });
        let fit = SpectralNullModel::new(&y, &x, &k).unwrap().fit_with_ratio(1.5).unwrap();
        let json = serde_json::to_string(&fit).unwrap();
        let back: NullModelFit = serde_json::from_str(&json).unwrap();
        assert_eq!(back.eigenvectors.shape(), fit.eigenvectors.shape());
        assert_relative_eq!(back.lambda, 1.5);
        let v = DVector::from_vec(y);
        assert_relative_eq!(back.rotate(&v), fit.rotate(&v), epsilon = 1e-12);
    }

    #[test]
    fn test_collinear_covariates() {
        let y = vec![1.0, 2.0, 3.0, 4.0];
        let x = DMatrix::from_element(4, 2, 1.0);
        let k = DMatrix::identity(4, 4);
        assert!(SpectralNullModel::new(&y, &x, &k).is_err());
    }
}
