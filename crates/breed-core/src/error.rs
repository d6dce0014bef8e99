use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BreedError>;

/// Closed set of failure kinds returned by every analysis in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DimensionMismatch,
    InvalidDosage,
    CyclicPedigree,
    SingularModel,
    DegenerateMarker,
    InvalidInput,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DimensionMismatch => "DimensionMismatch",
            ErrorKind::InvalidDosage => "InvalidDosage",
            ErrorKind::CyclicPedigree => "CyclicPedigreeError",
            ErrorKind::SingularModel => "SingularModelError",
            ErrorKind::DegenerateMarker => "DegenerateMarker",
            ErrorKind::InvalidInput => "InvalidInput",
        }
    }

    /// Only degenerate markers are recovered inline; everything else aborts the call.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::DegenerateMarker)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a marker could not be tested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DegenerateReason {
    /// Zero dosage variance after imputation.
    Monomorphic,
    BelowMinMaf { maf: f64, min_maf: f64 },
    /// Marker dosage is a linear combination of the covariates.
    CollinearWithCovariates,
    InsufficientObservations { n_obs: usize, n_params: usize },
}

impl fmt::Display for DegenerateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegenerateReason::Monomorphic => write!(f, "zero variance (monomorphic)"),
            DegenerateReason::BelowMinMaf { maf, min_maf } => {
                write!(f, "MAF {:.4} below minimum {:.4}", maf, min_maf)
            }
            DegenerateReason::CollinearWithCovariates => {
                write!(f, "collinear with covariates")
            }
            DegenerateReason::InsufficientObservations { n_obs, n_params } => write!(
                f,
                "{} observations cannot support {} parameters",
                n_obs, n_params
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreedError {
    #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid dosage {value} at individual {individual}, marker {marker} (allowed 0..={ploidy})")]
    InvalidDosage {
        individual: usize,
        marker: usize,
        value: f64,
        ploidy: u8,
    },

    #[error("pedigree contains a cycle through {}", .members.join(", "))]
    CyclicPedigree { members: Vec<String> },

    #[error("mixed model equations are singular after ridge {ridge:e}: {detail}")]
    SingularModel { ridge: f64, detail: String },

    #[error("degenerate marker {marker} ({chrom}:{pos}): {reason}")]
    DegenerateMarker {
        marker: String,
        chrom: String,
        pos: u64,
        reason: DegenerateReason,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl BreedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BreedError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            BreedError::InvalidDosage { .. } => ErrorKind::InvalidDosage,
            BreedError::CyclicPedigree { .. } => ErrorKind::CyclicPedigree,
            BreedError::SingularModel { .. } => ErrorKind::SingularModel,
            BreedError::DegenerateMarker { .. } => ErrorKind::DegenerateMarker,
            BreedError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Short description of the input that triggered the error, suitable for
    /// reporting without inspecting the variant.
    pub fn offending_input(&self) -> String {
        match self {
            BreedError::DimensionMismatch {
                context,
                expected,
                found,
            } => format!("{} (expected {}, found {})", context, expected, found),
            BreedError::InvalidDosage {
                individual,
                marker,
                value,
                ..
            } => format!("[{}, {}] = {}", individual, marker, value),
            BreedError::CyclicPedigree { members } => members.join(" -> "),
            BreedError::SingularModel { detail, .. } => detail.clone(),
            BreedError::DegenerateMarker {
                marker, chrom, pos, ..
            } => format!("{} at {}:{}", marker, chrom, pos),
            BreedError::InvalidInput(msg) => msg.clone(),
        }
    }

    pub fn dimension(context: impl Into<String>, expected: usize, found: usize) -> Self {
        BreedError::DimensionMismatch {
            context: context.into(),
            expected,
            found,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        BreedError::InvalidInput(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_summaries() {
        let err = BreedError::dimension("phenotype vector", 10, 9);
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
        assert!(err.offending_input().contains("phenotype vector"));
        assert!(err.kind().is_fatal());

        let err = BreedError::DegenerateMarker {
            marker: "snp7".into(),
            chrom: "3".into(),
            pos: 1200,
            reason: DegenerateReason::Monomorphic,
        };
        assert_eq!(err.kind(), ErrorKind::DegenerateMarker);
        assert_eq!(err.offending_input(), "snp7 at 3:1200");
        assert!(!err.kind().is_fatal());
        assert!(err.to_string().contains("monomorphic"));
    }

    #[test]
    fn cycle_lists_members() {
        let err = BreedError::CyclicPedigree {
            members: vec!["A".into(), "B".into(), "C".into()],
        };
        assert_eq!(err.kind().as_str(), "CyclicPedigreeError");
        assert_eq!(err.offending_input(), "A -> B -> C");
    }
}
