//! Henderson's mixed-model equations.
//!
//! ```text
//! [ X'X   X'Z₁              X'Z₂            ] [ b  ]   [ X'y  ]
//! [ Z₁'X  Z₁'Z₁ + λ₁K₁⁻¹    Z₁'Z₂           ] [ u₁ ] = [ Z₁'y ]
//! [ Z₂'X  Z₂'Z₁             Z₂'Z₂ + λ₂K₂⁻¹  ] [ u₂ ]   [ Z₂'y ]
//! ```
//!
//! Each ratio `λₖ = σ²e / σ²ₖ` comes from the term's share of phenotypic
//! variance (heritability for the genetic term); nothing is re-estimated.

use breed_core::{BreedError, Result};
use log::{debug, info, warn};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::Array2;

use breed_core::numeric::variance;

use crate::model::{
    Covariance, MixedModelOptions, MixedModelSolution, MixedModelSpec, RandomEffectSolution, TermRole,
    VarianceComponents,
};

/// Cholesky factor whose pivots all keep at least `tol` of their diagonal.
///
/// Comparing each squared pivot with its own diagonal entry makes the check
/// independent of column scaling.
pub(crate) fn checked_cholesky(m: DMatrix<f64>, tol: f64) -> Option<Cholesky<f64, Dyn>> {
    let diag: Vec<f64> = m.diagonal().iter().copied().collect();
    let chol = m.cholesky()?;
    let l = chol.l_dirty();
    for (i, d) in diag.iter().enumerate() {
        let pivot = l[(i, i)] * l[(i, i)];
        if !(*d > 0.0) || !(pivot / d >= tol) {
            return None;
        }
    }
    Some(chol)
}

/// Factor `m`, adding an escalating ridge to the diagonal entries `from..` until
/// the factorisation is stable. Returns the factor and the ridge used.
pub(crate) fn factor_with_ridge(
    m: &DMatrix<f64>,
    from: usize,
    opts: &MixedModelOptions,
    what: &str,
) -> Result<(Cholesky<f64, Dyn>, f64)> {
    let dim = m.nrows();
    if let Some(chol) = checked_cholesky(m.clone(), opts.pivot_tolerance) {
        return Ok((chol, 0.0));
    }
    if from >= dim {
        return Err(BreedError::SingularModel {
            ridge: 0.0,
            detail: format!("{} is singular and has no ridge-able block", what),
        });
    }

    let scale = (from..dim).map(|i| m[(i, i)].abs()).sum::<f64>() / (dim - from) as f64;
    let scale = if scale > 0.0 { scale } else { 1.0 };
    let mut ridge = opts.ridge * scale;
    for attempt in 0..opts.max_ridge_attempts.max(1) {
        let mut ridged = m.clone();
        for i in from..dim {
            ridged[(i, i)] += ridge;
        }
        if let Some(chol) = checked_cholesky(ridged, opts.pivot_tolerance) {
            warn!(
                "{} near-singular; applied diagonal ridge {:.3e} (attempt {})",
                what,
                ridge,
                attempt + 1
            );
            return Ok((chol, ridge));
        }
        ridge *= 10.0;
    }
    Err(BreedError::SingularModel {
        ridge: ridge / 10.0,
        detail: format!("{} remains singular after ridge correction", what),
    })
}

/// Index of the first fixed-effect column that is a linear combination of the
/// columns before it.
fn collinear_fixed_column(xtx: &DMatrix<f64>, tol: f64) -> Option<usize> {
    (0..xtx.nrows()).find(|&j| {
        let lead = xtx.view((0, 0), (j + 1, j + 1)).into_owned();
        checked_cholesky(lead, tol).is_none()
    })
}

fn to_dmatrix_rows(a: &Array2<f64>, rows: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), a.ncols(), |i, j| a[(rows[i], j)])
}

/// Variance shares per random term and the residual share.
fn term_shares(spec: &MixedModelSpec, opts: &MixedModelOptions) -> Result<(Vec<f64>, f64)> {
    let shares: Vec<f64> = spec
        .random
        .iter()
        .map(|t| {
            t.share.unwrap_or(match t.role {
                TermRole::Genetic => opts.heritability,
                _ => opts.nuisance_share,
            })
        })
        .collect();
    for (t, s) in spec.random.iter().zip(&shares) {
        if !(*s > 0.0 && *s < 1.0) {
            return Err(BreedError::invalid(format!(
                "variance share of term '{}' must lie in (0, 1), got {}",
                t.name, s
            )));
        }
    }
    let residual = 1.0 - shares.iter().sum::<f64>();
    if residual <= 0.0 {
        return Err(BreedError::invalid(format!(
            "random-term shares sum to {:.3}; nothing left for the residual",
            1.0 - residual
        )));
    }
    Ok((shares, residual))
}

/// Solve the mixed-model equations for `spec`.
///
/// Rows with a missing (non-finite) response are dropped first; `fitted` and
/// `residuals` refer to the remaining rows.
pub fn solve_mme(spec: &MixedModelSpec, options: Option<MixedModelOptions>) -> Result<MixedModelSolution> {
    let opts = options.unwrap_or_default();
    opts.validate()?;
    spec.validate()?;

    let keep: Vec<usize> = (0..spec.y.len()).filter(|&i| spec.y[i].is_finite()).collect();
    if keep.len() < spec.y.len() {
        debug!("Dropped {} observations with missing response", spec.y.len() - keep.len());
    }
    let n = keep.len();
    let p = spec.x.ncols();
    if n < 2 {
        return Err(BreedError::invalid(format!("need at least 2 observations, got {}", n)));
    }

    let (shares, residual_share) = term_shares(spec, &opts)?;
    let ratios: Vec<f64> = shares.iter().map(|s| residual_share / s).collect();

    let y = DVector::from_iterator(n, keep.iter().map(|&i| spec.y[i]));
    let x = to_dmatrix_rows(&spec.x, &keep);
    let zs: Vec<DMatrix<f64>> = spec.random.iter().map(|t| to_dmatrix_rows(&t.z, &keep)).collect();

    let mut offsets = Vec::with_capacity(zs.len());
    let mut dim = p;
    for z in &zs {
        offsets.push(dim);
        dim += z.ncols();
    }

    let xt = x.transpose();
    let xtx = &xt * &x;
    let mut c = DMatrix::<f64>::zeros(dim, dim);
    let mut rhs = DVector::<f64>::zeros(dim);
    c.view_mut((0, 0), (p, p)).copy_from(&xtx);
    rhs.rows_mut(0, p).copy_from(&(&xt * &y));

    let mut cov_ridge = 0.0f64;
    let mut level_diag: Vec<Vec<f64>> = Vec::with_capacity(zs.len());
    for (a, za) in zs.iter().enumerate() {
        let (oa, qa) = (offsets[a], za.ncols());
        let zat = za.transpose();
        let xz = &xt * za;
        c.view_mut((0, oa), (p, qa)).copy_from(&xz);
        c.view_mut((oa, 0), (qa, p)).copy_from(&xz.transpose());
        rhs.rows_mut(oa, qa).copy_from(&(&zat * &y));

        for (b, zb) in zs.iter().enumerate().skip(a) {
            let (ob, qb) = (offsets[b], zb.ncols());
            let block = &zat * zb;
            c.view_mut((oa, ob), (qa, qb)).copy_from(&block);
            if b != a {
                c.view_mut((ob, oa), (qb, qa)).copy_from(&block.transpose());
            }
        }

        let term = &spec.random[a];
        let penalty = match &term.covariance {
            Covariance::Identity => {
                level_diag.push(vec![1.0; qa]);
                DMatrix::<f64>::identity(qa, qa)
            }
            Covariance::Relationship(k) => {
                level_diag.push(k.diag().to_vec());
                let kmat = DMatrix::from_fn(qa, qa, |i, j| k[(i, j)]);
                let what = format!("covariance of term '{}'", term.name);
                let (chol, ridge) = factor_with_ridge(&kmat, 0, &opts, &what)?;
                cov_ridge = cov_ridge.max(ridge);
                chol.inverse()
            }
        };
        let mut block = c.view_mut((oa, oa), (qa, qa));
        block += penalty * ratios[a];
    }

    let (chol, mme_ridge) = factor_with_ridge(&c, p, &opts, "mixed-model coefficient matrix").map_err(|err| {
        match collinear_fixed_column(&xtx, opts.pivot_tolerance) {
            Some(j) => BreedError::SingularModel {
                ridge: match &err {
                    BreedError::SingularModel { ridge, .. } => *ridge,
                    _ => 0.0,
                },
                detail: format!(
                    "fixed-effect column '{}' is collinear with preceding columns",
                    spec.fixed_names[j]
                ),
            },
            None => err,
        }
    })?;
    let sol = chol.solve(&rhs);
    let cinv = chol.inverse();

    let sigma_p = variance(y.as_slice());
    if sigma_p <= 0.0 {
        warn!("Response has zero variance; variance components are all zero");
    }
    let sigma_e = residual_share * sigma_p;

    let fixed_effects: Vec<f64> = sol.rows(0, p).iter().copied().collect();
    let fixed_se: Vec<f64> = (0..p).map(|j| (sigma_e * cinv[(j, j)]).max(0.0).sqrt()).collect();

    let mut fitted = &x * sol.rows(0, p);
    let mut random = Vec::with_capacity(zs.len());
    let mut components = VarianceComponents {
        phenotypic: sigma_p,
        residual: sigma_e,
        ..Default::default()
    };

    for (a, za) in zs.iter().enumerate() {
        let (oa, qa) = (offsets[a], za.ncols());
        let term = &spec.random[a];
        let u = sol.rows(oa, qa);
        fitted += za * u;

        let lambda = ratios[a];
        let mut reliability = Vec::with_capacity(qa);
        let mut pev = Vec::with_capacity(qa);
        for i in 0..qa {
            let cii = cinv[(oa + i, oa + i)];
            let kii = level_diag[a][i];
            pev.push(sigma_e * cii);
            let r = if kii > 0.0 { 1.0 - lambda * cii / kii } else { 0.0 };
            reliability.push(r.clamp(0.0, 1.0));
        }

        let sigma_term = shares[a] * sigma_p;
        match term.role {
            TermRole::Genetic => components.genetic += sigma_term,
            TermRole::GenotypeByEnvironment => *components.gxe.get_or_insert(0.0) += sigma_term,
            TermRole::Other => components.other += sigma_term,
        }

        random.push(RandomEffectSolution {
            term: term.name.clone(),
            role: term.role,
            levels: term.levels.clone(),
            values: u.iter().copied().collect(),
            reliability,
            pev,
            variance_ratio: lambda,
        });
    }

    let residuals: Vec<f64> = y.iter().zip(fitted.iter()).map(|(a, b)| a - b).collect();
    info!(
        "Solved mixed model: {} observations, {} fixed, {} random levels in {} terms",
        n,
        p,
        dim - p,
        zs.len()
    );

    Ok(MixedModelSolution {
        fixed_names: spec.fixed_names.clone(),
        fixed_effects,
        fixed_se,
        random,
        variance: components,
        fitted: fitted.iter().copied().collect(),
        residuals,
        ridge_applied: cov_ridge.max(mme_ridge),
        n_obs: n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RandomTerm;
    use approx::assert_relative_eq;
    use breed_core::ErrorKind;
    use ndarray::{array, Array2};

    fn one_hot(groups: &[usize], q: usize) -> Array2<f64> {
        let mut z = Array2::zeros((groups.len(), q));
        for (i, &g) in groups.iter().enumerate() {
            z[(i, g)] = 1.0;
        }
        z
    }

    fn one_way(covariance: Covariance) -> MixedModelSpec {
        MixedModelSpec {
            y: vec![1.0, 2.0, 3.0, 5.0, 6.0, 7.0],
            x: Array2::ones((6, 1)),
            fixed_names: vec!["(Intercept)".into()],
            random: vec![RandomTerm {
                name: "g".into(),
                levels: vec!["a".into(), "b".into()],
                z: one_hot(&[0, 0, 0, 1, 1, 1], 2),
                covariance,
                role: TermRole::Genetic,
                share: None,
            }],
        }
    }

    #[test]
    fn test_balanced_one_way_shrinkage() {
        // h2 = 0.5 -> lambda = 1, u = n (ybar_g - mu) / (n + lambda)
        let sol = solve_mme(&one_way(Covariance::Identity), None).unwrap();
        assert_relative_eq!(sol.fixed_effects[0], 4.0, epsilon = 1e-10);
        let bv = sol.breeding_values().unwrap();
        assert_relative_eq!(bv.values[0], -1.5, epsilon = 1e-10);
        assert_relative_eq!(bv.values[1], 1.5, epsilon = 1e-10);
        assert_relative_eq!(bv.variance_ratio, 1.0);
        assert!(bv.reliability.iter().all(|r| (0.0..=1.0).contains(r)));
        assert_eq!(sol.ridge_applied, 0.0);
        assert_relative_eq!(sol.residuals.iter().sum::<f64>(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_relationship_identity_matches_identity() {
        let a = solve_mme(&one_way(Covariance::Identity), None).unwrap();
        let b = solve_mme(&one_way(Covariance::Relationship(array![[1.0, 0.0], [0.0, 1.0]])), None).unwrap();
        assert_relative_eq!(a.random[0].values[1], b.random[0].values[1], epsilon = 1e-10);
    }

    #[test]
    fn test_duplicate_fixed_column_is_singular() {
        let mut spec = one_way(Covariance::Identity);
        spec.x = Array2::ones((6, 2));
        spec.fixed_names = vec!["(Intercept)".into(), "dup".into()];
        let err = solve_mme(&spec, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SingularModel);
        assert!(err.offending_input().contains("'dup'"));
    }

    #[test]
    fn test_singular_covariance_is_ridged() {
        let spec = one_way(Covariance::Relationship(array![[1.0, 1.0], [1.0, 1.0]]));
        let sol = solve_mme(&spec, None).unwrap();
        assert!(sol.ridge_applied > 0.0);
        assert!(sol.fixed_effects[0].is_finite());
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut spec = one_way(Covariance::Identity);
        spec.y.push(9.0);
        let err = solve_mme(&spec, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_missing_response_dropped() {
        let mut spec = one_way(Covariance::Identity);
        spec.y[2] = f64::NAN;
        let sol = solve_mme(&spec, None).unwrap();
        assert_eq!(sol.n_obs, 5);
        assert_eq!(sol.fitted.len(), 5);
    }

    #[test]
    fn test_shares_must_leave_residual() {
        let mut spec = one_way(Covariance::Identity);
        spec.random[0].share = Some(0.6);
        let mut second = spec.random[0].clone();
        second.name = "h".into();
        second.role = TermRole::Other;
        second.share = Some(0.5);
        spec.random.push(second);
        let err = solve_mme(&spec, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_heritability_bounds() {
        let spec = one_way(Covariance::Identity);
        assert!(solve_mme(&spec, Some(MixedModelOptions::with_heritability(1.0))).is_err());
        assert!(solve_mme(&spec, Some(MixedModelOptions::with_heritability(0.0))).is_err());
    }
}
