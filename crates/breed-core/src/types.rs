use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{BreedError, Result};

/// Chromosome and physical position of a marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerMetadata {
    pub chrom: String,
    pub pos: u64,
}

/// Per-marker quality summary computed while standardising genotypes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerSummary {
    /// Frequency of the counted allele (mean dosage / ploidy).
    pub allele_freq: f64,
    pub maf: f64,
    /// Share of observed calls strictly between 0 and ploidy.
    pub heterozygosity: f64,
    pub missing_rate: f64,
    /// Zero dosage variance after imputation.
    pub monomorphic: bool,
}

/// Imputed dosage matrix, individuals x markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenotypeMatrix {
    pub ploidy: u8,
    pub sample_ids: Vec<String>,
    pub marker_ids: Vec<String>,
    pub marker_metadata: Option<Vec<MarkerMetadata>>,
    pub dosages: Array2<f64>,
    pub markers: Vec<MarkerSummary>,
}

impl GenotypeMatrix {
    pub fn n_samples(&self) -> usize {
        self.dosages.nrows()
    }

    pub fn n_markers(&self) -> usize {
        self.dosages.ncols()
    }

    pub fn allele_frequencies(&self) -> Vec<f64> {
        self.markers.iter().map(|m| m.allele_freq).collect()
    }

    pub fn sample_index(&self, id: &str) -> Option<usize> {
        self.sample_ids.iter().position(|s| s == id)
    }

    /// Chromosome and position of marker `j`; "NA"/0 when no map was supplied.
    pub fn marker_location(&self, j: usize) -> (String, u64) {
        match self.marker_metadata.as_ref().and_then(|m| m.get(j)) {
            Some(meta) => (meta.chrom.clone(), meta.pos),
            None => ("NA".to_string(), 0),
        }
    }

    /// New matrix holding only markers whose MAF is at least `min_maf`.
    pub fn filter_markers(&self, min_maf: f64) -> GenotypeMatrix {
        let keep: Vec<usize> = (0..self.n_markers())
            .filter(|&j| self.markers[j].maf >= min_maf)
            .collect();
        self.select_marker_indices(&keep)
    }

    pub fn select_marker_indices(&self, keep: &[usize]) -> GenotypeMatrix {
        GenotypeMatrix {
            ploidy: self.ploidy,
            sample_ids: self.sample_ids.clone(),
            marker_ids: keep.iter().map(|&j| self.marker_ids[j].clone()).collect(),
            marker_metadata: self
                .marker_metadata
                .as_ref()
                .map(|meta| keep.iter().map(|&j| meta[j].clone()).collect()),
            dosages: self.dosages.select(Axis(1), keep),
            markers: keep.iter().map(|&j| self.markers[j].clone()).collect(),
        }
    }

    /// Rows for the given sample ids, in the order requested.
    pub fn select_samples(&self, ids: &[String]) -> Result<GenotypeMatrix> {
        let rows = ids
            .iter()
            .map(|id| {
                self.sample_index(id)
                    .ok_or_else(|| BreedError::invalid(format!("sample '{}' not in genotype matrix", id)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.select_sample_indices(&rows))
    }

    /// Row subset. Marker summaries describe the full panel and are carried over unchanged.
    pub fn select_sample_indices(&self, rows: &[usize]) -> GenotypeMatrix {
        GenotypeMatrix {
            ploidy: self.ploidy,
            sample_ids: rows.iter().map(|&i| self.sample_ids[i].clone()).collect(),
            marker_ids: self.marker_ids.clone(),
            marker_metadata: self.marker_metadata.clone(),
            dosages: self.dosages.select(Axis(0), rows),
            markers: self.markers.clone(),
        }
    }
}

/// How a relationship matrix was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipMethod {
    VanRaden1,
    VanRaden2,
    Pedigree,
    /// Loaded from an external source.
    Supplied,
}

impl RelationshipMethod {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vanraden1" | "vanraden" | "genomic" => Ok(RelationshipMethod::VanRaden1),
            "vanraden2" => Ok(RelationshipMethod::VanRaden2),
            "pedigree" | "a" | "amat" => Ok(RelationshipMethod::Pedigree),
            "supplied" => Ok(RelationshipMethod::Supplied),
            other => Err(BreedError::invalid(format!(
                "unknown relationship method: {}. Use: vanraden1, vanraden2, pedigree",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipMethod::VanRaden1 => "vanraden1",
            RelationshipMethod::VanRaden2 => "vanraden2",
            RelationshipMethod::Pedigree => "pedigree",
            RelationshipMethod::Supplied => "supplied",
        }
    }

    pub fn is_genomic(&self) -> bool {
        matches!(self, RelationshipMethod::VanRaden1 | RelationshipMethod::VanRaden2)
    }
}

/// Square, symmetric, individual-indexed relationship matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipMatrix {
    pub sample_ids: Vec<String>,
    pub matrix: Array2<f64>,
    pub method: RelationshipMethod,
    /// Scaling denominator used for genomic matrices (1.0 for pedigree).
    pub denominator: f64,
    /// True when the computed denominator was zero and a fallback constant was used.
    pub denominator_fallback: bool,
}

/// Largest tolerated `|K_ij - K_ji|`, relative to the largest absolute entry.
const SYMMETRY_TOLERANCE: f64 = 1e-8;

impl RelationshipMatrix {
    /// Wrap a supplied matrix. It must be square, finite and symmetric with a
    /// non-negative diagonal.
    pub fn new(sample_ids: Vec<String>, matrix: Array2<f64>, method: RelationshipMethod) -> Result<Self> {
        if matrix.nrows() != matrix.ncols() {
            return Err(BreedError::dimension(
                "relationship matrix columns",
                matrix.nrows(),
                matrix.ncols(),
            ));
        }
        if sample_ids.len() != matrix.nrows() {
            return Err(BreedError::dimension(
                "relationship matrix labels",
                matrix.nrows(),
                sample_ids.len(),
            ));
        }
        if let Some(((i, j), v)) = matrix.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(BreedError::invalid(format!(
                "relationship matrix entry [{}, {}] = {} is not finite",
                i, j, v
            )));
        }
        if let Some((i, d)) = matrix.diag().iter().enumerate().find(|(_, d)| **d < 0.0) {
            return Err(BreedError::invalid(format!(
                "relationship matrix diagonal for '{}' is negative ({})",
                sample_ids[i], d
            )));
        }
        let scale = matrix.iter().fold(1.0f64, |m, v| m.max(v.abs()));
        let n = matrix.nrows();
        for i in 0..n {
            for j in (i + 1)..n {
                if (matrix[(i, j)] - matrix[(j, i)]).abs() > SYMMETRY_TOLERANCE * scale {
                    return Err(BreedError::invalid(format!(
                        "relationship matrix is not symmetric: [{}, {}] = {} but [{}, {}] = {}",
                        sample_ids[i],
                        sample_ids[j],
                        matrix[(i, j)],
                        sample_ids[j],
                        sample_ids[i],
                        matrix[(j, i)]
                    )));
                }
            }
        }
        Ok(Self {
            sample_ids,
            matrix,
            method,
            denominator: 1.0,
            denominator_fallback: false,
        })
    }

    pub fn n(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.sample_ids.iter().position(|s| s == id)
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        Some(self.matrix[(self.index_of(a)?, self.index_of(b)?)])
    }

    pub fn is_symmetric(&self, tol: f64) -> bool {
        let n = self.n();
        (0..n).all(|i| (i + 1..n).all(|j| (self.matrix[(i, j)] - self.matrix[(j, i)]).abs() <= tol))
    }

    /// Inbreeding coefficients `K_ii - 1`.
    pub fn inbreeding(&self) -> Vec<f64> {
        self.matrix.diag().iter().map(|d| d - 1.0).collect()
    }

    /// Reorder and subset to the given ids.
    pub fn subset(&self, ids: &[String]) -> Result<RelationshipMatrix> {
        let idx = ids
            .iter()
            .map(|id| {
                self.index_of(id)
                    .ok_or_else(|| BreedError::invalid(format!("'{}' not in relationship matrix", id)))
            })
            .collect::<Result<Vec<_>>>()?;
        let matrix = Array2::from_shape_fn((idx.len(), idx.len()), |(i, j)| self.matrix[(idx[i], idx[j])]);
        Ok(RelationshipMatrix {
            sample_ids: ids.to_vec(),
            matrix,
            method: self.method,
            denominator: self.denominator,
            denominator_fallback: self.denominator_fallback,
        })
    }
}

/// One row of a pedigree: an individual and its (possibly unknown) parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PedigreeRecord {
    pub id: String,
    pub parent1: Option<String>,
    pub parent2: Option<String>,
}

impl PedigreeRecord {
    pub fn new(id: &str, parent1: Option<&str>, parent2: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            parent1: parent1.map(str::to_string),
            parent2: parent2.map(str::to_string),
        }
    }

    pub fn founder(id: &str) -> Self {
        Self::new(id, None, None)
    }
}

/// Column of a tabular dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    Numeric(Vec<f64>),
    Factor(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Factor(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of row `i` as a factor level.
    pub fn level(&self, i: usize) -> String {
        match self {
            Column::Numeric(v) => v[i].to_string(),
            Column::Factor(v) => v[i].clone(),
        }
    }
}

/// Named columns of equal length.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    n_rows: usize,
    names: Vec<String>,
    columns: HashMap<String, Column>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn insert(&mut self, name: &str, column: Column) -> Result<()> {
        if self.names.is_empty() {
            self.n_rows = column.len();
        } else if column.len() != self.n_rows {
            return Err(BreedError::dimension(
                format!("dataset column '{}'", name),
                self.n_rows,
                column.len(),
            ));
        }
        if !self.columns.contains_key(name) {
            self.names.push(name.to_string());
        }
        self.columns.insert(name.to_string(), column);
        Ok(())
    }

    pub fn with_numeric(mut self, name: &str, values: Vec<f64>) -> Result<Self> {
        self.insert(name, Column::Numeric(values))?;
        Ok(self)
    }

    pub fn with_factor<S: Into<String>>(mut self, name: &str, values: Vec<S>) -> Result<Self> {
        self.insert(name, Column::Factor(values.into_iter().map(Into::into).collect()))?;
        Ok(self)
    }
}

/// Indices into `sample_ids` with a finite phenotype, and the matching values.
pub fn align_phenotypes(sample_ids: &[String], phenotypes: &HashMap<String, f64>) -> (Vec<usize>, Vec<f64>) {
    sample_ids
        .iter()
        .enumerate()
        .filter_map(|(i, id)| match phenotypes.get(id) {
            Some(v) if v.is_finite() => Some((i, *v)),
            _ => None,
        })
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn relationship_subset_reorders() {
        let rel = RelationshipMatrix::new(
            vec!["a".into(), "b".into(), "c".into()],
            array![[1.0, 0.5, 0.1], [0.5, 1.0, 0.2], [0.1, 0.2, 1.0]],
            RelationshipMethod::Supplied,
        )
        .unwrap();
        let sub = rel.subset(&["c".into(), "a".into()]).unwrap();
        assert_eq!(sub.matrix, array![[1.0, 0.1], [0.1, 1.0]]);
        assert!(rel.subset(&["z".into()]).is_err());
        assert!(rel.is_symmetric(0.0));
    }

    #[test]
    fn relationship_rejects_asymmetric_matrix() {
        let ids: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let err = RelationshipMatrix::new(
            ids.clone(),
            array![[1.0, 0.9, 0.0], [-0.4, 1.0, 0.2], [0.0, 0.7, 1.0]],
            RelationshipMethod::Supplied,
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("not symmetric"));

        // rounding noise is tolerated
        let ok = RelationshipMatrix::new(
            ids,
            array![[1.0, 0.5, 0.0], [0.5 + 1e-12, 1.0, 0.2], [0.0, 0.2, 1.0]],
            RelationshipMethod::Supplied,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn relationship_rejects_negative_or_missing_diagonal() {
        let ids: Vec<String> = vec!["a".into(), "b".into()];
        let err = RelationshipMatrix::new(ids.clone(), array![[1.0, 0.0], [0.0, -0.5]], RelationshipMethod::Supplied)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("'b'"));

        let err = RelationshipMatrix::new(ids, array![[1.0, f64::NAN], [f64::NAN, 1.0]], RelationshipMethod::Supplied)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
    }

    #[test]
    fn dataset_rejects_ragged_columns() {
        let ds = Dataset::new().with_numeric("y", vec![1.0, 2.0]).unwrap();
        let err = ds.with_factor("g", vec!["a", "b", "c"]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
    }

    #[test]
    fn align_skips_missing() {
        let ids: Vec<String> = vec!["s1".into(), "s2".into(), "s3".into()];
        let mut pheno = HashMap::new();
        pheno.insert("s3".to_string(), 4.0);
        pheno.insert("s1".to_string(), f64::NAN);
        let (idx, y) = align_phenotypes(&ids, &pheno);
        assert_eq!(idx, vec![2]);
        assert_eq!(y, vec![4.0]);
    }

    #[test]
    fn method_lookup() {
        assert_eq!(RelationshipMethod::from_str("VanRaden1").unwrap(), RelationshipMethod::VanRaden1);
        assert!(RelationshipMethod::from_str("eval").is_err());
        assert!(!RelationshipMethod::Pedigree.is_genomic());
    }
}
