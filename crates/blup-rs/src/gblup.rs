//! Closed-form GBLUP for the single genetic-term model `y = 1μ + g + e`.
//!
//! With `V = K_oo + λI` over the phenotyped individuals `o`:
//! `μ̂ = 1ᵀV⁻¹y / 1ᵀV⁻¹1`, `ĝ = K_·o V⁻¹ (y - 1μ̂)`, which is the solution of
//! the mixed-model equations with `X = 1`, `Z = I`. Individuals without a
//! phenotype are predicted through their relationships.

use breed_core::{align_phenotypes, BreedError, RelationshipMatrix, Result};
use log::info;
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;

use breed_core::numeric::variance;

use crate::mme::factor_with_ridge;
use crate::model::{
    MixedModelOptions, MixedModelSolution, RandomEffectSolution, TermRole, VarianceComponents,
};

pub const INTERCEPT: &str = "(Intercept)";
pub const GENETIC_TERM: &str = "genotype";

pub fn gblup(
    kinship: &RelationshipMatrix,
    phenotypes: &HashMap<String, f64>,
    options: Option<MixedModelOptions>,
) -> Result<MixedModelSolution> {
    let opts = options.unwrap_or_default();
    opts.validate()?;
    let n_all = kinship.n();
    if kinship.matrix.dim() != (n_all, n_all) {
        return Err(BreedError::dimension("relationship matrix", n_all, kinship.matrix.nrows()));
    }

    let (obs, y) = align_phenotypes(&kinship.sample_ids, phenotypes);
    let n = obs.len();
    if n < 2 {
        return Err(BreedError::invalid(format!(
            "GBLUP needs at least 2 phenotyped individuals in the relationship matrix, got {}",
            n
        )));
    }
    let lambda = opts.variance_ratio();
    let y = DVector::from_vec(y);
    let ones = DVector::<f64>::from_element(n, 1.0);

    let mut v = DMatrix::from_fn(n, n, |i, j| kinship.matrix[(obs[i], obs[j])]);
    for i in 0..n {
        v[(i, i)] += lambda;
    }
    let (chol, ridge) = factor_with_ridge(&v, 0, &opts, "GBLUP covariance K + λI")?;
    let v_inv = chol.inverse();

    let v_inv_1 = &v_inv * &ones;
    let denom = ones.dot(&v_inv_1);
    let mu = v_inv_1.dot(&y) / denom;
    let resid = &y - &ones * mu;
    let alpha = &v_inv * &resid;

    // P = V⁻¹ - V⁻¹11ᵀV⁻¹ / 1ᵀV⁻¹1
    let p_mat = &v_inv - (&v_inv_1 * v_inv_1.transpose()) / denom;

    let sigma_p = variance(y.as_slice());
    let sigma_g = opts.heritability * sigma_p;
    let sigma_e = (1.0 - opts.heritability) * sigma_p;

    let mut values = Vec::with_capacity(n_all);
    let mut reliability = Vec::with_capacity(n_all);
    let mut pev = Vec::with_capacity(n_all);
    for i in 0..n_all {
        let k_io = DVector::from_fn(n, |j, _| kinship.matrix[(i, obs[j])]);
        values.push(k_io.dot(&alpha));
        let kii = kinship.matrix[(i, i)];
        let explained = k_io.dot(&(&p_mat * &k_io));
        pev.push(sigma_g * (kii - explained).max(0.0));
        reliability.push(if kii > 0.0 {
            (explained / kii).clamp(0.0, 1.0)
        } else {
            0.0
        });
    }

    let fitted: Vec<f64> = obs.iter().map(|&i| mu + values[i]).collect();
    let residuals: Vec<f64> = y.iter().zip(&fitted).map(|(a, b)| a - b).collect();
    info!(
        "GBLUP: {} phenotyped of {} individuals, h2 = {}, mean = {:.4}",
        n, n_all, opts.heritability, mu
    );

    Ok(MixedModelSolution {
        fixed_names: vec![INTERCEPT.to_string()],
        fixed_effects: vec![mu],
        fixed_se: vec![(sigma_g / denom).max(0.0).sqrt()],
        random: vec![RandomEffectSolution {
            term: GENETIC_TERM.to_string(),
            role: TermRole::Genetic,
            levels: kinship.sample_ids.clone(),
            values,
            reliability,
            pev,
            variance_ratio: lambda,
        }],
        variance: VarianceComponents {
            phenotypic: sigma_p,
            genetic: sigma_g,
            gxe: None,
            other: 0.0,
            residual: sigma_e,
        },
        fitted,
        residuals,
        ridge_applied: ridge,
        n_obs: n,
    })
}
