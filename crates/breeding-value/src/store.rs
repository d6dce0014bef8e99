//! Caller-supplied storage for finished breeding-value analyses.

use blup_rs::VarianceComponents;
use breed_core::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisKind {
    /// GBLUP on a genomic relationship matrix
    Genomic,
    /// BLUP on a pedigree numerator relationship matrix
    Pedigree,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Genomic => "GBLUP",
            AnalysisKind::Pedigree => "BLUP",
        }
    }
}

/// One individual's estimate as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBreedingValue {
    pub rank: usize,
    pub id: String,
    pub ebv: f64,
    pub reliability: f64,
    /// `None` for individuals predicted only through relationships
    pub phenotype: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: Uuid,
    pub kind: AnalysisKind,
    pub trait_name: String,
    pub heritability: f64,
    pub n_individuals: usize,
    pub n_phenotyped: usize,
    pub n_markers: Option<usize>,
    pub overall_mean: f64,
    pub variance: VarianceComponents,
    /// Sorted by EBV, highest first
    pub breeding_values: Vec<StoredBreedingValue>,
}

impl AnalysisRecord {
    pub fn top(&self, n: usize) -> &[StoredBreedingValue] {
        &self.breeding_values[..n.min(self.breeding_values.len())]
    }
}

/// Key-value storage for analysis records.
pub trait AnalysisStore: Send + Sync {
    /// Save a record, replacing any earlier record with the same id
    fn save(&mut self, record: AnalysisRecord) -> Result<()>;

    fn load(&self, id: &Uuid) -> Result<Option<AnalysisRecord>>;

    /// Ids in save order
    fn list(&self) -> Result<Vec<Uuid>>;
}

/// In-process store; contents live as long as the value.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Vec<AnalysisRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AnalysisStore for MemoryStore {
    fn save(&mut self, record: AnalysisRecord) -> Result<()> {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
        Ok(())
    }

    fn load(&self, id: &Uuid) -> Result<Option<AnalysisRecord>> {
        Ok(self.records.iter().find(|r| &r.id == id).cloned())
    }

    fn list(&self) -> Result<Vec<Uuid>> {
        Ok(self.records.iter().map(|r| r.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: Uuid, mean: f64) -> AnalysisRecord {
        AnalysisRecord {
            id,
            kind: AnalysisKind::Pedigree,
            trait_name: "yield".to_string(),
            heritability: 0.3,
            n_individuals: 2,
            n_phenotyped: 2,
            n_markers: None,
            overall_mean: mean,
            variance: VarianceComponents::default(),
            breeding_values: vec![StoredBreedingValue {
                rank: 1,
                id: "a".to_string(),
                ebv: 0.4,
                reliability: 0.2,
                phenotype: Some(5.0),
            }],
        }
    }

    #[test]
    fn test_save_load_list() {
        let mut store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.save(record(a, 1.0)).unwrap();
        store.save(record(b, 2.0)).unwrap();
        assert_eq!(store.list().unwrap(), vec![a, b]);
        assert_eq!(store.load(&b).unwrap().unwrap().overall_mean, 2.0);
        assert!(store.load(&Uuid::new_v4()).unwrap().is_none());

        store.save(record(a, 3.0)).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.load(&a).unwrap().unwrap().overall_mean, 3.0);
        assert_eq!(store.load(&a).unwrap().unwrap().top(10).len(), 1);
    }
}
