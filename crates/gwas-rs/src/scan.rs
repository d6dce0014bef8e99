//! Per-marker association tests over a shared, read-only context.
//!
//! The context is prepared once: phenotypes aligned, covariates assembled and,
//! for MLM, the null model fitted so that `H = K + λI` is fixed for the whole
//! scan. Data are rotated by `D^{-1/2}Uᵀ` (eigenvectors of K), after which
//! each marker is an ordinary least-squares fit with the covariates
//! partialled out. Markers can then be tested individually, in ranges, or in
//! parallel, and the outcomes combined by [`ScanContext::finish`].

use breed_core::{align_phenotypes, BreedError, DegenerateReason, GenotypeMatrix, RelationshipMatrix, Result};
use blup_rs::SpectralNullModel;
use kinship_rs::{pca, PcaOptions};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::HashMap;
use std::ops::Range;

use crate::summary::{apply_output_policy, genomic_inflation, manhattan, qq};
use crate::threshold::significance_threshold;
use crate::types::{
    AssociationResult, GwasMethod, GwasOptions, MarkerOutcome, MarkerRecord, NullModelSummary, SkippedMarker,
};

/// Shared state for one scan. Holds only immutable data, so markers may be
/// tested from any number of threads.
#[derive(Debug)]
pub struct ScanContext<'a> {
    geno: &'a GenotypeMatrix,
    options: GwasOptions,
    /// Genotype rows with a phenotype, in analysis order
    rows: Vec<usize>,
    /// `D^{-1/2}Uᵀ` for MLM; `None` for GLM
    rotation: Option<DMatrix<f64>>,
    /// Rotated covariates, intercept first
    x: DMatrix<f64>,
    /// `(XᵀX)⁻¹Xᵀ` on the rotated scale
    projector: DMatrix<f64>,
    /// Rotated response with the covariates partialled out
    y_resid: DVector<f64>,
    null_model: Option<NullModelSummary>,
}

fn covariate_columns(
    geno: &GenotypeMatrix,
    rows: &[usize],
    covariates: &[Vec<f64>],
    n_pcs: usize,
) -> Result<DMatrix<f64>> {
    let mut columns: Vec<Vec<f64>> = vec![vec![1.0; rows.len()]];
    for (c, col) in covariates.iter().enumerate() {
        if col.len() != geno.n_samples() {
            return Err(BreedError::dimension(format!("covariate {}", c + 1), geno.n_samples(), col.len()));
        }
        if rows.iter().any(|&i| !col[i].is_finite()) {
            return Err(BreedError::invalid(format!(
                "covariate {} has missing values for phenotyped individuals",
                c + 1
            )));
        }
        columns.push(rows.iter().map(|&i| col[i]).collect());
    }
    if n_pcs > 0 {
        let pcs = pca(
            geno,
            Some(PcaOptions {
                n_components: n_pcs,
                scale: false,
            }),
        )?;
        for k in 0..pcs.scores.ncols() {
            columns.push(rows.iter().map(|&i| pcs.scores[(i, k)]).collect());
        }
        debug!("Added {} principal components as covariates", pcs.scores.ncols());
    }
    Ok(DMatrix::from_fn(rows.len(), columns.len(), |i, j| columns[j][i]))
}

impl<'a> ScanContext<'a> {
    /// Align data and fix the null model.
    ///
    /// `covariates` are columns in `geno.sample_ids` order. For MLM the
    /// relationship matrix must contain every phenotyped individual.
    pub fn prepare(
        geno: &'a GenotypeMatrix,
        phenotypes: &HashMap<String, f64>,
        kinship: Option<&RelationshipMatrix>,
        covariates: &[Vec<f64>],
        options: Option<GwasOptions>,
    ) -> Result<Self> {
        let opts = options.unwrap_or_default();
        opts.validate()?;

        let (rows, y) = align_phenotypes(&geno.sample_ids, phenotypes);
        let n = rows.len();
        if n < 3 {
            return Err(BreedError::invalid(format!(
                "GWAS needs at least 3 phenotyped and genotyped individuals, got {}",
                n
            )));
        }
        let x = covariate_columns(geno, &rows, covariates, opts.n_pcs)?;
        let y = DVector::from_vec(y);

        let (rotation, null_model) = match opts.method {
            GwasMethod::Glm => (None, None),
            GwasMethod::Mlm => {
                let kin = kinship.ok_or_else(|| BreedError::invalid("MLM requires a relationship matrix"))?;
                let mut kidx = Vec::with_capacity(n);
                for &i in &rows {
                    let id = &geno.sample_ids[i];
                    kidx.push(kin.index_of(id).ok_or_else(|| {
                        BreedError::invalid(format!("individual '{}' is missing from the relationship matrix", id))
                    })?);
                }
                let k = DMatrix::from_fn(n, n, |a, b| kin.matrix[(kidx[a], kidx[b])]);
                let model = SpectralNullModel::new(y.as_slice(), &x, &k)?;
                let fit = match opts.heritability {
                    Some(h2) => model.fit_with_ratio((1.0 - h2) / h2)?,
                    None => model.fit_reml(None)?,
                };
                info!(
                    "Null model fixed for scan: lambda = {:.4}, h2 = {:.3}{}",
                    fit.lambda,
                    fit.heritability(),
                    if opts.heritability.is_some() { " (supplied)" } else { " (REML)" }
                );
                let rotation = fit.rotate_matrix(&DMatrix::identity(n, n));
                let summary = NullModelSummary {
                    lambda: fit.lambda,
                    heritability: fit.heritability(),
                    fixed: opts.heritability.is_some(),
                };
                (Some(rotation), Some(summary))
            }
        };

        let (x, y) = match &rotation {
            Some(r) => (r * &x, r * &y),
            None => (x, y),
        };
        let xtx_inv = (x.transpose() * &x).try_inverse().ok_or_else(|| BreedError::SingularModel {
            ridge: 0.0,
            detail: "GWAS covariates are collinear".to_string(),
        })?;
        let projector = xtx_inv * x.transpose();
        let y_resid = &y - &x * (&projector * &y);

        Ok(Self {
            geno,
            options: opts,
            rows,
            rotation,
            x,
            projector,
            y_resid,
            null_model,
        })
    }

    pub fn n_markers(&self) -> usize {
        self.geno.n_markers()
    }

    pub fn n_obs(&self) -> usize {
        self.rows.len()
    }

    pub fn options(&self) -> &GwasOptions {
        &self.options
    }

    fn skip(&self, j: usize, reason: DegenerateReason) -> MarkerOutcome {
        let (chrom, pos) = self.geno.marker_location(j);
        MarkerOutcome::Skipped(SkippedMarker {
            index: j,
            marker_id: self.geno.marker_ids[j].clone(),
            chrom,
            pos,
            reason,
        })
    }

    /// Test marker `j`. Degenerate markers come back as
    /// [`MarkerOutcome::Skipped`]; only an index past the panel is an error.
    pub fn test_marker(&self, j: usize) -> Result<MarkerOutcome> {
        if j >= self.n_markers() {
            return Err(BreedError::invalid(format!(
                "marker index {} is out of range for {} markers",
                j,
                self.n_markers()
            )));
        }
        Ok(self.evaluate(j))
    }

    fn evaluate(&self, j: usize) -> MarkerOutcome {
        let summary = &self.geno.markers[j];
        let n = self.rows.len();
        let n_params = self.x.ncols() + 1;
        if n <= n_params {
            return self.skip(j, DegenerateReason::InsufficientObservations { n_obs: n, n_params });
        }

        let raw = DVector::from_iterator(n, self.rows.iter().map(|&i| self.geno.dosages[(i, j)]));
        let (lo, hi) = raw.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if summary.monomorphic || hi - lo <= 1e-12 {
            return self.skip(j, DegenerateReason::Monomorphic);
        }
        if summary.maf < self.options.min_maf {
            return self.skip(
                j,
                DegenerateReason::BelowMinMaf {
                    maf: summary.maf,
                    min_maf: self.options.min_maf,
                },
            );
        }

        let xm = match &self.rotation {
            Some(r) => r * &raw,
            None => raw,
        };
        let xm_resid = &xm - &self.x * (&self.projector * &xm);
        let sxx = xm_resid.dot(&xm_resid);
        if sxx <= 1e-10 * xm.dot(&xm) {
            return self.skip(j, DegenerateReason::CollinearWithCovariates);
        }

        let df = (n - n_params) as f64;
        let effect = xm_resid.dot(&self.y_resid) / sxx;
        let sse = (self.y_resid.dot(&self.y_resid) - effect * effect * sxx).max(0.0);
        let std_error = (sse / df / sxx).sqrt();
        let statistic = if std_error > 0.0 { effect / std_error } else { f64::INFINITY };
        let p_value = match StudentsT::new(0.0, 1.0, df) {
            Ok(t) if statistic.is_finite() => (2.0 * t.sf(statistic.abs())).clamp(0.0, 1.0),
            Ok(_) => 0.0,
            Err(_) => 1.0,
        };
        let (chrom, pos) = self.geno.marker_location(j);

        MarkerOutcome::Tested(MarkerRecord {
            index: j,
            marker_id: self.geno.marker_ids[j].clone(),
            chrom,
            pos,
            effect,
            std_error,
            statistic,
            p_value,
            score: -p_value.max(1e-300).log10(),
            maf: summary.maf,
            n_obs: n,
            significant: false,
        })
    }

    /// Sequentially test a contiguous block of markers.
    pub fn scan_range(&self, range: Range<usize>) -> Vec<MarkerOutcome> {
        let end = range.end.min(self.n_markers());
        (range.start.min(end)..end).map(|j| self.evaluate(j)).collect()
    }

    /// Combine outcomes from any number of units of work, in any order.
    pub fn finish(&self, outcomes: Vec<MarkerOutcome>) -> Result<AssociationResult> {
        let mut outcomes = outcomes;
        outcomes.sort_by_key(MarkerOutcome::index);
        outcomes.dedup_by_key(|o| o.index());

        let mut tested = Vec::new();
        let mut skipped = Vec::new();
        for outcome in outcomes {
            match outcome {
                MarkerOutcome::Tested(r) => tested.push(r),
                MarkerOutcome::Skipped(s) => skipped.push(s),
            }
        }
        if !skipped.is_empty() {
            warn!("Skipped {} degenerate markers", skipped.len());
            for s in &skipped {
                debug!("{}", s.to_error());
            }
        }

        let p_values: Vec<f64> = tested.iter().map(|r| r.p_value).collect();
        let threshold = significance_threshold(&p_values, self.options.threshold, self.options.alpha);
        for r in &mut tested {
            r.significant = threshold.is_significant(r.p_value);
        }
        let n_tested = tested.len();
        let n_significant = tested.iter().filter(|r| r.significant).count();
        let lambda_gc = genomic_inflation(&p_values)?;
        let manhattan = manhattan(&tested);
        let qq = qq(&p_values);
        let (markers, truncated) = apply_output_policy(tested, self.options.output);

        info!(
            "{} scan: {} tested, {} skipped, {} significant at p <= {:.3e} ({}), lambda_GC = {:.3}",
            self.options.method.as_str(),
            n_tested,
            skipped.len(),
            n_significant,
            threshold.p_value,
            threshold.method.as_str(),
            lambda_gc
        );

        Ok(AssociationResult {
            method: self.options.method,
            threshold,
            n_tested,
            n_significant,
            markers,
            truncated,
            skipped,
            manhattan,
            qq,
            lambda_gc,
            null_model: self.null_model.clone(),
        })
    }
}

/// Prepare, test every marker in parallel, and combine.
pub fn run_gwas(
    geno: &GenotypeMatrix,
    phenotypes: &HashMap<String, f64>,
    kinship: Option<&RelationshipMatrix>,
    covariates: &[Vec<f64>],
    options: Option<GwasOptions>,
) -> Result<AssociationResult> {
    let ctx = ScanContext::prepare(geno, phenotypes, kinship, covariates, options)?;
    let outcomes: Vec<MarkerOutcome> = (0..ctx.n_markers())
        .into_par_iter()
        .map(|j| ctx.evaluate(j))
        .collect();
    ctx.finish(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use breed_core::standardize;

    fn pheno(ids: &[&str], values: &[f64]) -> HashMap<String, f64> {
        ids.iter().zip(values).map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_glm_simple_regression() {
        // y = 1 + 2x exactly on marker 1; marker 2 is constant
        let raw = vec![vec![0.0, 1.0], vec![1.0, 1.0], vec![2.0, 1.0], vec![1.0, 1.0], vec![0.0, 1.0]];
        let (geno, _) = standardize(&raw, None).unwrap();
        let y = pheno(&["IND1", "IND2", "IND3", "IND4", "IND5"], &[1.1, 2.9, 5.0, 3.1, 0.9]);
        let ctx = ScanContext::prepare(&geno, &y, None, &[], None).unwrap();

        match ctx.test_marker(0).unwrap() {
            MarkerOutcome::Tested(r) => {
                assert_relative_eq!(r.effect, 2.0, epsilon = 0.1);
                assert!(r.p_value < 0.01);
                assert_eq!(r.n_obs, 5);
            }
            other => panic!("expected a test, got {:?}", other),
        }
        match ctx.test_marker(1).unwrap() {
            MarkerOutcome::Skipped(s) => assert_eq!(s.reason, DegenerateReason::Monomorphic),
            other => panic!("expected a skip, got {:?}", other),
        }
    }

    #[test]
    fn test_collinear_with_covariate() {
        let raw = vec![vec![0.0], vec![1.0], vec![2.0], vec![1.0], vec![2.0]];
        let (geno, _) = standardize(&raw, None).unwrap();
        let y = pheno(&["IND1", "IND2", "IND3", "IND4", "IND5"], &[1.0, 2.0, 3.5, 2.2, 3.9]);
        let cov = vec![vec![0.0, 2.0, 4.0, 2.0, 4.0]];
        let ctx = ScanContext::prepare(&geno, &y, None, &cov, None).unwrap();
        match ctx.test_marker(0).unwrap() {
            MarkerOutcome::Skipped(s) => assert_eq!(s.reason, DegenerateReason::CollinearWithCovariates),
            other => panic!("expected a skip, got {:?}", other),
        }
    }

    #[test]
    fn test_mlm_requires_kinship() {
        let raw = vec![vec![0.0], vec![1.0], vec![2.0]];
        let (geno, _) = standardize(&raw, None).unwrap();
        let y = pheno(&["IND1", "IND2", "IND3"], &[1.0, 2.0, 3.0]);
        let opts = GwasOptions {
            method: GwasMethod::Mlm,
            ..Default::default()
        };
        assert!(ScanContext::prepare(&geno, &y, None, &[], Some(opts)).is_err());
    }

    #[test]
    fn test_scan_range_clamps() {
        let raw = vec![vec![0.0, 2.0], vec![1.0, 1.0], vec![2.0, 0.0], vec![1.0, 2.0]];
        let (geno, _) = standardize(&raw, None).unwrap();
        let y = pheno(&["IND1", "IND2", "IND3", "IND4"], &[1.0, 2.0, 3.0, 1.5]);
        let ctx = ScanContext::prepare(&geno, &y, None, &[], None).unwrap();
        assert_eq!(ctx.scan_range(1..10).len(), 1);
        assert!(ctx.scan_range(5..10).is_empty());
    }

    #[test]
    fn test_marker_index_out_of_range() {
        let raw = vec![vec![0.0, 2.0], vec![1.0, 1.0], vec![2.0, 0.0], vec![1.0, 2.0]];
        let (geno, _) = standardize(&raw, None).unwrap();
        let y = pheno(&["IND1", "IND2", "IND3", "IND4"], &[1.0, 2.0, 3.0, 1.5]);
        let ctx = ScanContext::prepare(&geno, &y, None, &[], None).unwrap();
        assert!(ctx.test_marker(1).is_ok());
        let err = ctx.test_marker(2).unwrap_err();
        assert_eq!(err.kind(), breed_core::ErrorKind::InvalidInput);
    }
}
