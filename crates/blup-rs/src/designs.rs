//! Common field-trial layouts as formula presets.

use breed_core::{BreedError, Dataset, RelationshipMatrix, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::formula::{fit_model, ModelDescription};
use crate::model::{MixedModelOptions, MixedModelSolution};

/// Randomised complete block design: `y ~ genotype + (1|block)`.
///
/// Genotype is fixed, so the solution carries genotype BLUEs as treatment
/// contrasts against the first level. Blocks are random. For genotype BLUPs
/// fit `y ~ (1|block) + (1|genotype)` through [`fit_formula`](crate::fit_formula).
pub fn rcbd(
    data: &Dataset,
    response: &str,
    genotype: &str,
    block: &str,
    options: Option<MixedModelOptions>,
) -> Result<MixedModelSolution> {
    let desc = ModelDescription::parse(&format!("{} ~ {} + (1|{})", response, genotype, block))?;
    fit_model(&desc, data, &HashMap::new(), options)
}

/// Alpha-lattice: `y ~ genotype + rep + (1|rep:block)`, incomplete blocks
/// nested in replicates and random, genotype and replicate fixed.
pub fn alpha_lattice(
    data: &Dataset,
    response: &str,
    genotype: &str,
    replicate: &str,
    block: &str,
    options: Option<MixedModelOptions>,
) -> Result<MixedModelSolution> {
    let formula = format!(
        "{} ~ {} + {} + (1|{}:{})",
        response, genotype, replicate, replicate, block
    );
    let desc = ModelDescription::parse(&formula)?;
    fit_model(&desc, data, &HashMap::new(), options)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiEnvironmentOptions {
    pub model: MixedModelOptions,
    /// Share of phenotypic variance given to genotype x environment (default: 0.2)
    pub gxe_share: f64,
}

impl Default for MultiEnvironmentOptions {
    fn default() -> Self {
        Self {
            model: MixedModelOptions::default(),
            gxe_share: 0.2,
        }
    }
}

/// Multi-environment trial: `y ~ env + (1|genotype) + (1|genotype:env)`.
///
/// With `kinship` the genotype term uses that relationship matrix, which must
/// list every genotype in `data`.
pub fn multi_environment(
    data: &Dataset,
    response: &str,
    genotype: &str,
    environment: &str,
    kinship: Option<&RelationshipMatrix>,
    options: Option<MultiEnvironmentOptions>,
) -> Result<MixedModelSolution> {
    let opts = options.unwrap_or_default();
    if opts.gxe_share + opts.model.heritability >= 1.0 {
        return Err(BreedError::invalid(format!(
            "heritability {} plus G x E share {} leaves no residual variance",
            opts.model.heritability, opts.gxe_share
        )));
    }
    let formula = format!(
        "{} ~ {} + (1|{}) + (1|{}:{})",
        response, environment, genotype, genotype, environment
    );
    let gxe_key = format!("{}:{}", genotype, environment);
    let desc = ModelDescription::parse(&formula)?
        .with_genetic_factor(genotype)
        .with_share(&gxe_key, opts.gxe_share);

    let mut covariances = HashMap::new();
    if let Some(k) = kinship {
        covariances.insert(genotype.to_string(), k.clone());
    }
    fit_model(&desc, data, &covariances, Some(opts.model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TermRole;
    use approx::assert_relative_eq;

    fn met() -> Dataset {
        let envs = ["E1", "E1", "E1", "E2", "E2", "E2", "E3", "E3", "E3"];
        let genos = ["G1", "G2", "G3", "G1", "G2", "G3", "G1", "G2", "G3"];
        Dataset::new()
            .with_numeric("y", vec![5.0, 6.1, 4.2, 6.3, 7.0, 5.1, 4.4, 5.9, 3.8])
            .unwrap()
            .with_factor("env", envs.to_vec())
            .unwrap()
            .with_factor("geno", genos.to_vec())
            .unwrap()
            .with_factor("block", vec!["1", "2", "1", "2", "1", "2", "1", "2", "1"])
            .unwrap()
    }

    #[test]
    fn test_multi_environment_variance_split() {
        let sol = multi_environment(&met(), "y", "geno", "env", None, None).unwrap();
        let v = &sol.variance;
        assert_relative_eq!(v.genetic + v.gxe.unwrap() + v.residual, v.phenotypic, epsilon = 1e-10);
        assert_relative_eq!(v.gxe.unwrap(), 0.2 * v.phenotypic, epsilon = 1e-10);
        assert_eq!(sol.term("geno:env").unwrap().role, TermRole::GenotypeByEnvironment);
        let bv = sol.breeding_values().unwrap();
        // G2 is best in every environment
        let best = bv
            .values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| bv.levels[i].clone());
        assert_eq!(best.as_deref(), Some("G2"));
    }

    #[test]
    fn test_gxe_share_leaves_no_residual() {
        let opts = MultiEnvironmentOptions {
            model: MixedModelOptions::with_heritability(0.85),
            gxe_share: 0.2,
        };
        assert!(multi_environment(&met(), "y", "geno", "env", None, Some(opts)).is_err());
    }

    #[test]
    fn test_rcbd_genotype_blues() {
        let sol = rcbd(&met(), "y", "geno", "env", None).unwrap();
        assert_eq!(sol.fixed_names, vec!["(Intercept)", "geno[G2]", "geno[G3]"]);
        assert_eq!(sol.random.len(), 1);
        assert_eq!(sol.term("env").unwrap().role, TermRole::Other);
        assert!(sol.breeding_values().is_none());
        // balanced blocks: contrasts equal differences of genotype means
        assert_relative_eq!(sol.fixed_effect("geno[G2]").unwrap(), 1.1, epsilon = 1e-8);
        assert_relative_eq!(sol.fixed_effect("geno[G3]").unwrap(), -2.6 / 3.0, epsilon = 1e-8);
    }

    #[test]
    fn test_alpha_lattice_nested_blocks() {
        let sol = alpha_lattice(&met(), "y", "geno", "env", "block", None).unwrap();
        let blocks = sol.term("env:block").unwrap();
        assert_eq!(blocks.levels, vec!["E1:1", "E1:2", "E2:1", "E2:2", "E3:1", "E3:2"]);
        assert_eq!(sol.random.len(), 1);
        assert_eq!(
            sol.fixed_names,
            vec!["(Intercept)", "geno[G2]", "geno[G3]", "env[E2]", "env[E3]"]
        );
    }
}
