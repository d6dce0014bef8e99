//! Population structure: principal components and pairwise genetic distances.

use breed_core::{BreedError, GenotypeMatrix, Result};
use faer::Mat as FaerMat;
use log::debug;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use breed_core::numeric::mirror_upper;

/// Options for [`pca`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaOptions {
    /// Number of components to keep (default: 10, capped at min(n, m))
    pub n_components: usize,
    /// Divide each centred marker by its standard deviation (default: false)
    pub scale: bool,
}

impl Default for PcaOptions {
    fn default() -> Self {
        Self {
            n_components: 10,
            scale: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaResult {
    pub sample_ids: Vec<String>,
    /// Individuals x components.
    pub scores: Array2<f64>,
    /// Markers x components.
    pub loadings: Array2<f64>,
    pub explained_variance: Vec<f64>,
    pub explained_variance_ratio: Vec<f64>,
}

/// Principal components of the centred dosage matrix via thin SVD.
///
/// Each component's sign is fixed so its largest-magnitude loading is positive.
pub fn pca(geno: &GenotypeMatrix, options: Option<PcaOptions>) -> Result<PcaResult> {
    let opts = options.unwrap_or_default();
    let n = geno.n_samples();
    let m = geno.n_markers();
    if n < 2 || m == 0 {
        return Err(BreedError::invalid(format!(
            "PCA needs at least 2 individuals and 1 marker, got {} x {}",
            n, m
        )));
    }
    let k = opts.n_components.min(n).min(m);
    if k == 0 {
        return Err(BreedError::invalid("n_components must be at least 1"));
    }

    let mut centered = Array2::<f64>::zeros((n, m));
    for j in 0..m {
        let col = geno.dosages.column(j);
        let mu = col.sum() / n as f64;
        let sd = if opts.scale {
            (col.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            1.0
        };
        if sd <= 1e-12 {
            continue;
        }
        for i in 0..n {
            centered[(i, j)] = (col[i] - mu) / sd;
        }
    }

    let mat = FaerMat::<f64>::from_fn(n, m, |i, j| centered[(i, j)]);
    let svd = mat.thin_svd();
    let u = svd.u();
    let v = svd.v();
    let s = svd.s_diagonal();

    let total: f64 = (0..s.nrows()).map(|i| s.read(i).powi(2)).sum();
    let mut scores = Array2::<f64>::zeros((n, k));
    let mut loadings = Array2::<f64>::zeros((m, k));
    let mut explained_variance = Vec::with_capacity(k);
    let mut explained_variance_ratio = Vec::with_capacity(k);

    for c in 0..k {
        let sv = s.read(c);
        let mut pivot = 0usize;
        for j in 0..m {
            if v.read(j, c).abs() > v.read(pivot, c).abs() {
                pivot = j;
            }
        }
        let sign = if v.read(pivot, c) < 0.0 { -1.0 } else { 1.0 };
        for i in 0..n {
            scores[(i, c)] = sign * u.read(i, c) * sv;
        }
        for j in 0..m {
            loadings[(j, c)] = sign * v.read(j, c);
        }
        explained_variance.push(sv * sv / (n - 1) as f64);
        explained_variance_ratio.push(if total > 0.0 { sv * sv / total } else { 0.0 });
    }

    debug!(
        "PCA on {} x {} genotypes: first {} components explain {:.1}%",
        n,
        m,
        k,
        100.0 * explained_variance_ratio.iter().sum::<f64>()
    );

    Ok(PcaResult {
        sample_ids: geno.sample_ids.clone(),
        scores,
        loadings,
        explained_variance,
        explained_variance_ratio,
    })
}

/// Pairwise genetic distance measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMethod {
    Euclidean,
    /// `sqrt(Σ(fi - fj)² / 2m)` on allele frequencies `f = dosage / ploidy`.
    ModifiedRogers,
    /// `Σ|xi - xj| / (ploidy · m)`.
    IdentityByState,
    /// Nei's standard distance on allele frequencies.
    Nei,
}

impl DistanceMethod {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "euclidean" => Ok(DistanceMethod::Euclidean),
            "modified_rogers" | "rogers" | "mrd" => Ok(DistanceMethod::ModifiedRogers),
            "ibs" | "identity_by_state" => Ok(DistanceMethod::IdentityByState),
            "nei" => Ok(DistanceMethod::Nei),
            other => Err(BreedError::invalid(format!(
                "unknown distance method: {}. Use: euclidean, modified_rogers, ibs, nei",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMethod::Euclidean => "euclidean",
            DistanceMethod::ModifiedRogers => "modified_rogers",
            DistanceMethod::IdentityByState => "ibs",
            DistanceMethod::Nei => "nei",
        }
    }
}

/// Distance between two dosage vectors of equal length.
pub fn pairwise_distance(a: ArrayView1<f64>, b: ArrayView1<f64>, ploidy: u8, method: DistanceMethod) -> f64 {
    let m = a.len() as f64;
    let ploidy = ploidy as f64;
    match method {
        DistanceMethod::Euclidean => a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt(),
        DistanceMethod::ModifiedRogers => {
            let ss: f64 = a.iter().zip(b.iter()).map(|(x, y)| ((x - y) / ploidy).powi(2)).sum();
            (ss / (2.0 * m)).sqrt()
        }
        DistanceMethod::IdentityByState => {
            a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum::<f64>() / (ploidy * m)
        }
        DistanceMethod::Nei => {
            let (mut jxy, mut jx, mut jy) = (0.0, 0.0, 0.0);
            for (x, y) in a.iter().zip(b.iter()) {
                let (fx, fy) = (x / ploidy, y / ploidy);
                jxy += fx * fy;
                jx += fx * fx;
                jy += fy * fy;
            }
            let identity = if jx > 0.0 && jy > 0.0 {
                jxy / (jx * jy).sqrt()
            } else if jx == jy {
                1.0
            } else {
                0.0
            };
            -identity.clamp(1e-10, 1.0).ln()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistanceMatrix {
    pub sample_ids: Vec<String>,
    pub matrix: Array2<f64>,
    pub method: DistanceMethod,
}

pub fn distance_matrix(geno: &GenotypeMatrix, method: DistanceMethod) -> Result<DistanceMatrix> {
    let n = geno.n_samples();
    if n == 0 || geno.n_markers() == 0 {
        return Err(BreedError::invalid("genotype matrix is empty"));
    }
    let mut matrix = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            matrix[(i, j)] = pairwise_distance(geno.dosages.row(i), geno.dosages.row(j), geno.ploidy, method);
        }
    }
    mirror_upper(&mut matrix);
    Ok(DistanceMatrix {
        sample_ids: geno.sample_ids.clone(),
        matrix,
        method,
    })
}
