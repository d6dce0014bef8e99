//! Model description and solution types shared by every solver path.

use breed_core::{BreedError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Covariance among the levels of a random term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Covariance {
    Identity,
    /// Level-by-level relationship matrix (levels in the term's level order).
    Relationship(Array2<f64>),
}

/// What a random term represents; decides its default variance share and
/// where it lands in the variance split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermRole {
    Genetic,
    GenotypeByEnvironment,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomTerm {
    pub name: String,
    pub levels: Vec<String>,
    /// Observations x levels incidence matrix.
    pub z: Array2<f64>,
    pub covariance: Covariance,
    pub role: TermRole,
    /// Share of phenotypic variance; `None` uses the role default.
    pub share: Option<f64>,
}

/// Response, fixed design and random terms of a linear mixed model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedModelSpec {
    pub y: Vec<f64>,
    pub x: Array2<f64>,
    pub fixed_names: Vec<String>,
    pub random: Vec<RandomTerm>,
}

impl MixedModelSpec {
    /// Check that every design matrix has one row per observation and that
    /// names and covariance shapes line up.
    pub fn validate(&self) -> Result<()> {
        let n = self.y.len();
        if n == 0 {
            return Err(BreedError::invalid("response vector is empty"));
        }
        if self.x.nrows() != n {
            return Err(BreedError::dimension("fixed-effect design rows", n, self.x.nrows()));
        }
        if self.fixed_names.len() != self.x.ncols() {
            return Err(BreedError::dimension(
                "fixed-effect names",
                self.x.ncols(),
                self.fixed_names.len(),
            ));
        }
        for term in &self.random {
            if term.z.nrows() != n {
                return Err(BreedError::dimension(
                    format!("random term '{}' design rows", term.name),
                    n,
                    term.z.nrows(),
                ));
            }
            if term.z.ncols() != term.levels.len() {
                return Err(BreedError::dimension(
                    format!("random term '{}' levels", term.name),
                    term.z.ncols(),
                    term.levels.len(),
                ));
            }
            if let Covariance::Relationship(k) = &term.covariance {
                if k.nrows() != term.levels.len() || k.ncols() != term.levels.len() {
                    return Err(BreedError::dimension(
                        format!("random term '{}' covariance", term.name),
                        term.levels.len(),
                        k.nrows().max(k.ncols()),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Options for mixed-model solves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedModelOptions {
    /// Narrow-sense heritability; share of the genetic term (default: 0.5)
    pub heritability: f64,
    /// Default share for non-genetic random terms (default: 0.1)
    pub nuisance_share: f64,
    /// Initial ridge, relative to the mean diagonal (default: 1e-6)
    pub ridge: f64,
    /// Ridge escalations (x10 each) before giving up (default: 4)
    pub max_ridge_attempts: usize,
    /// Smallest accepted squared Cholesky pivot ratio (default: 1e-10)
    pub pivot_tolerance: f64,
}

impl Default for MixedModelOptions {
    fn default() -> Self {
        Self {
            heritability: 0.5,
            nuisance_share: 0.1,
            ridge: 1e-6,
            max_ridge_attempts: 4,
            pivot_tolerance: 1e-10,
        }
    }
}

impl MixedModelOptions {
    pub fn with_heritability(h2: f64) -> Self {
        Self {
            heritability: h2,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.heritability > 0.0 && self.heritability < 1.0) {
            return Err(BreedError::invalid(format!(
                "heritability must lie in (0, 1), got {}",
                self.heritability
            )));
        }
        if !(self.nuisance_share > 0.0 && self.nuisance_share < 1.0) {
            return Err(BreedError::invalid(format!(
                "nuisance_share must lie in (0, 1), got {}",
                self.nuisance_share
            )));
        }
        Ok(())
    }

    /// Genetic variance ratio `λ = σ²e / σ²g = (1 - h²) / h²`.
    pub fn variance_ratio(&self) -> f64 {
        (1.0 - self.heritability) / self.heritability
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomEffectSolution {
    pub term: String,
    pub role: TermRole,
    pub levels: Vec<String>,
    pub values: Vec<f64>,
    /// `1 - PEV / (σ²_term · K_ii)`, clipped to [0, 1].
    pub reliability: Vec<f64>,
    pub pev: Vec<f64>,
    /// `σ²e / σ²_term` used in the equations.
    pub variance_ratio: f64,
}

impl RandomEffectSolution {
    pub fn value_of(&self, level: &str) -> Option<f64> {
        self.levels.iter().position(|l| l == level).map(|i| self.values[i])
    }
}

/// Variance split derived from the supplied shares and the sample phenotypic variance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponents {
    pub phenotypic: f64,
    pub genetic: f64,
    /// Present when the model has a genotype x environment term.
    pub gxe: Option<f64>,
    /// Blocking and other non-genetic random terms.
    pub other: f64,
    pub residual: f64,
}

impl VarianceComponents {
    pub fn heritability(&self) -> f64 {
        if self.phenotypic > 0.0 {
            self.genetic / self.phenotypic
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedModelSolution {
    pub fixed_names: Vec<String>,
    pub fixed_effects: Vec<f64>,
    pub fixed_se: Vec<f64>,
    pub random: Vec<RandomEffectSolution>,
    pub variance: VarianceComponents,
    pub fitted: Vec<f64>,
    pub residuals: Vec<f64>,
    /// Largest diagonal ridge added to reach a stable factorisation (0 if none).
    pub ridge_applied: f64,
    pub n_obs: usize,
}

impl MixedModelSolution {
    /// The first genetic random term, i.e. the breeding values.
    pub fn breeding_values(&self) -> Option<&RandomEffectSolution> {
        self.random.iter().find(|r| r.role == TermRole::Genetic)
    }

    pub fn term(&self, name: &str) -> Option<&RandomEffectSolution> {
        self.random.iter().find(|r| r.term == name)
    }

    pub fn fixed_effect(&self, name: &str) -> Option<f64> {
        self.fixed_names
            .iter()
            .position(|n| n == name)
            .map(|i| self.fixed_effects[i])
    }
}
