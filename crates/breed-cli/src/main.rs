mod io;

use anyhow::{bail, Context, Result};
use blup_rs::{fit_model, MixedModelOptions, ModelDescription};
use breed_core::{RelationshipMatrix, RelationshipMethod};
use breeding_value::{
    cross_validate, predict_cross, rank_candidates, rank_crosses, Candidate, CrossCriterion, CrossOptions,
    CvMethod, CvOptions, ParentPanel, RankCrossOptions,
};
use clap::{Parser, Subcommand};
use gwas_rs::{run_gwas, GwasMethod, GwasOptions, OutputPolicy, ThresholdMethod};
use kinship_rs::{
    distance_matrix, inbreeding_summary, pca, vanraden_kinship, DistanceMethod, KinshipOptions, PcaOptions, Pedigree,
};
use log::{info, warn};
use std::collections::HashMap;

/// breed: quantitative-genetics toolkit for plant and animal breeding
#[derive(Parser)]
#[command(name = "breed", version, about = "breed: relationship matrices, mixed models, GWAS and cross prediction")]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Genomic relationship matrix from dosages
    Kinship {
        /// Genotype dosage file (TSV: marker, chr, pos, samples...)
        #[arg(long)]
        geno: String,

        /// Ploidy (e.g., 2, 4, 6)
        #[arg(long, default_value = "2")]
        ploidy: u8,

        /// vanraden1 (default) or vanraden2
        #[arg(long, default_value = "vanraden1")]
        method: String,

        /// Drop markers below this minor allele frequency first
        #[arg(long, default_value = "0.0")]
        min_maf: f64,

        /// Output TSV path for the matrix
        #[arg(long)]
        out: String,

        /// Optional JSON inbreeding summary
        #[arg(long)]
        summary: Option<String>,
    },

    /// Numerator relationship matrix from a pedigree
    Pedigree {
        /// Pedigree file (id, parent1, parent2; 0 or NA for unknown)
        #[arg(long)]
        pedigree: String,

        /// Output TSV path for the A-matrix
        #[arg(long)]
        out: String,

        /// Optional JSON pedigree statistics
        #[arg(long)]
        stats: Option<String>,
    },

    /// Principal components and genetic distances
    Pca {
        #[arg(long)]
        geno: String,

        #[arg(long, default_value = "2")]
        ploidy: u8,

        #[arg(long, default_value = "10")]
        n_components: usize,

        /// Standardise markers before decomposition
        #[arg(long, default_value_t = false)]
        scale: bool,

        /// Output TSV of component scores
        #[arg(long)]
        out: String,

        /// Also write a distance matrix: euclidean, rogers, ibs or nei
        #[arg(long)]
        distance: Option<String>,

        #[arg(long)]
        distance_out: Option<String>,
    },

    /// Breeding values by GBLUP (genomic) or BLUP (pedigree)
    #[command(after_help = "EXAMPLES:
    breed gblup --geno geno.tsv --pheno pheno.csv --trait yield --h2 0.4 --out gebv.tsv
    breed gblup --pedigree ped.csv --pheno pheno.csv --trait yield --select 0.1 --out ebv.tsv
    breed gblup --geno geno.tsv --pheno pheno.csv --trait yield --cv-folds 5 --out gebv.tsv")]
    Gblup {
        // === Input/Output ===
        #[arg(long, help_heading = "Input/Output")]
        geno: Option<String>,

        #[arg(long, help_heading = "Input/Output")]
        pedigree: Option<String>,

        /// Precomputed relationship matrix TSV
        #[arg(long, help_heading = "Input/Output")]
        kinship: Option<String>,

        #[arg(long, help_heading = "Input/Output")]
        pheno: String,

        /// Output TSV of breeding values, ranked
        #[arg(long, help_heading = "Input/Output")]
        out: String,

        /// Optional JSON with variance components and fixed effects
        #[arg(long, help_heading = "Input/Output")]
        summary: Option<String>,

        // === Analysis ===
        #[arg(long, help_heading = "Analysis")]
        r#trait: String,

        #[arg(long, default_value = "2", help_heading = "Analysis")]
        ploidy: u8,

        /// Narrow-sense heritability
        #[arg(long, default_value = "0.5", help_heading = "Analysis")]
        h2: f64,

        /// Selected proportion marked in the output
        #[arg(long, default_value = "0.1", help_heading = "Analysis")]
        select: f64,

        // === Cross-validation ===
        /// Run k-fold cross-validation (needs --geno)
        #[arg(long, help_heading = "Cross-validation")]
        cv_folds: Option<usize>,

        #[arg(long, default_value = "1", help_heading = "Cross-validation")]
        cv_repeats: usize,

        #[arg(long, default_value = "42", help_heading = "Cross-validation")]
        seed: u64,

        /// gblup or rrblup
        #[arg(long, default_value = "gblup", help_heading = "Cross-validation")]
        cv_method: String,
    },

    /// Mixed model from a formula, e.g. "yield ~ env + (1|block) + (1|geno)"
    Mixed {
        #[arg(long)]
        pheno: String,

        #[arg(long)]
        formula: String,

        /// Relationship matrix TSV for the genetic term
        #[arg(long)]
        kinship: Option<String>,

        /// Factor column the relationship matrix belongs to
        #[arg(long)]
        genetic_factor: Option<String>,

        #[arg(long, default_value = "0.5")]
        h2: f64,

        /// Output JSON with the full solution
        #[arg(long)]
        out: String,
    },

    /// Genome-wide association scan
    #[command(after_help = "METHODS:
    glm   Least squares on dosage plus covariates
    mlm   Generalised least squares with the relationship matrix; variance ratio fixed once")]
    Gwas {
        // === Input/Output ===
        #[arg(long, help_heading = "Input/Output")]
        geno: String,

        #[arg(long, help_heading = "Input/Output")]
        pheno: String,

        /// Optional kinship matrix TSV (computed from --geno for MLM otherwise)
        #[arg(long, help_heading = "Input/Output")]
        kinship: Option<String>,

        /// Output results TSV/CSV
        #[arg(long, help_heading = "Input/Output")]
        out: String,

        /// Optional JSON with threshold, skipped markers, Manhattan and QQ arrays
        #[arg(long, help_heading = "Input/Output")]
        summary: Option<String>,

        // === Analysis ===
        #[arg(long, help_heading = "Analysis")]
        r#trait: String,

        #[arg(long, default_value = "2", help_heading = "Analysis")]
        ploidy: u8,

        #[arg(long, default_value = "mlm", help_heading = "Analysis")]
        method: String,

        /// Covariates from phenotype file (comma-separated)
        #[arg(long, help_heading = "Analysis")]
        covariates: Option<String>,

        /// Number of principal components to include as covariates
        #[arg(long, default_value = "0", help_heading = "Analysis")]
        n_pc: usize,

        /// Fix heritability instead of estimating the null model by REML
        #[arg(long, help_heading = "Analysis")]
        h2: Option<f64>,

        // === QC Filters ===
        #[arg(long, default_value = "0.0", help_heading = "QC Filters")]
        min_maf: f64,

        // === Threshold ===
        /// bonferroni or fdr
        #[arg(long, default_value = "bonferroni", help_heading = "Threshold")]
        threshold: String,

        #[arg(long, default_value = "0.05", help_heading = "Threshold")]
        alpha: f64,

        /// Non-significant markers kept in the output (0 = all markers)
        #[arg(long, default_value = "1000", help_heading = "Threshold")]
        top: usize,
    },

    /// Predict progeny of planned crosses
    Cross {
        /// Breeding value file (id, ebv)
        #[arg(long)]
        ebv: String,

        /// Parents (comma-separated); all ids in --ebv when omitted
        #[arg(long)]
        parents: Option<String>,

        /// Genotypes adding distance and progeny inbreeding
        #[arg(long)]
        geno: Option<String>,

        #[arg(long, default_value = "2")]
        ploidy: u8,

        #[arg(long)]
        mean: f64,

        #[arg(long, default_value = "0.5")]
        h2: f64,

        /// usefulness, mean, variance or superior_prob
        #[arg(long, default_value = "usefulness")]
        criterion: String,

        #[arg(long, default_value = "20")]
        top: usize,

        #[arg(long)]
        max_inbreeding: Option<f64>,

        #[arg(long)]
        out: String,
    },
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    match cli.command {
        Commands::Kinship { geno, ploidy, method, min_maf, out, summary } => {
            let method = RelationshipMethod::from_str(&method)?;
            if !method.is_genomic() {
                bail!("kinship expects a genomic method: vanraden1 or vanraden2");
            }
            let mut g = io::load_genotypes(&geno, ploidy)?;
            if min_maf > 0.0 {
                let before = g.n_markers();
                g = g.filter_markers(min_maf);
                info!("MAF filter {}: kept {} of {} markers", min_maf, g.n_markers(), before);
            }
            let kin = vanraden_kinship(
                &g,
                Some(KinshipOptions {
                    method,
                    ..Default::default()
                }),
            )?;
            io::write_relationship(&out, &kin)?;
            info!("Wrote {} x {} relationship matrix to {}", kin.n(), kin.n(), out);
            if let Some(path) = summary {
                io::write_json(&path, &inbreeding_summary(&kin))?;
            }
        }
        Commands::Pedigree { pedigree, out, stats } => {
            let records = io::load_pedigree(&pedigree)?;
            let ped = Pedigree::from_records(&records).with_context(|| format!("validating {}", pedigree))?;
            let a = ped.relationship_matrix();
            io::write_relationship(&out, &a)?;
            let s = ped.statistics(&a);
            info!(
                "{} individuals, {} founders, {} generations, mean F = {:.4}",
                s.n_individuals, s.n_founders, s.max_generation, s.mean_inbreeding
            );
            if let Some(path) = stats {
                io::write_json(&path, &s)?;
            }
        }
        Commands::Pca { geno, ploidy, n_components, scale, out, distance, distance_out } => {
            let g = io::load_genotypes(&geno, ploidy)?;
            let res = pca(&g, Some(PcaOptions { n_components, scale }))?;
            let mut header = vec!["sample_id".to_string()];
            header.extend((1..=res.scores.ncols()).map(|k| format!("PC{}", k)));
            let rows: Vec<Vec<String>> = res
                .sample_ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    std::iter::once(id.clone())
                        .chain(res.scores.row(i).iter().map(|v| v.to_string()))
                        .collect()
                })
                .collect();
            let header_refs: Vec<&str> = header.iter().map(String::as_str).collect();
            io::write_rows(&out, &header_refs, &rows)?;
            for (k, r) in res.explained_variance_ratio.iter().enumerate() {
                info!("PC{}: {:.2}% of variance", k + 1, 100.0 * r);
            }
            if let Some(method) = distance {
                let method = DistanceMethod::from_str(&method)?;
                let path = distance_out.unwrap_or_else(|| format!("{}.distance.tsv", out.trim_end_matches(".tsv")));
                io::write_distances(&path, &distance_matrix(&g, method)?)?;
                info!("Wrote {} distances to {}", method.as_str(), path);
            }
        }
        Commands::Gblup {
            geno,
            pedigree,
            kinship,
            pheno,
            out,
            summary,
            r#trait,
            ploidy,
            h2,
            select,
            cv_folds,
            cv_repeats,
            seed,
            cv_method,
        } => {
            let table = io::load_phenotypes(&pheno)?;
            let y = table.trait_values(&r#trait)?;
            let opts = MixedModelOptions::with_heritability(h2);

            let genotypes = geno.as_deref().map(|p| io::load_genotypes(p, ploidy)).transpose()?;
            let rel: RelationshipMatrix = match (&genotypes, &pedigree, &kinship) {
                (_, _, Some(path)) => io::load_relationship(path)?,
                (Some(g), None, None) => vanraden_kinship(g, None)?,
                (None, Some(path), None) => kinship_rs::numerator_relationship(&io::load_pedigree(path)?)?,
                (Some(_), Some(_), None) => bail!("Use either --geno or --pedigree, not both"),
                (None, None, None) => bail!("Provide --geno, --pedigree or --kinship"),
            };
            let sol = blup_rs::gblup(&rel, &y, Some(opts.clone()))?;
            let Some(bv) = sol.breeding_values() else {
                bail!("model returned no breeding values");
            };
            let candidates: Vec<Candidate> = bv
                .levels
                .iter()
                .zip(&bv.values)
                .zip(&bv.reliability)
                .map(|((id, &ebv), &rel)| Candidate {
                    id: id.clone(),
                    ebv,
                    reliability: Some(rel),
                })
                .collect();
            let ranking = rank_candidates(&candidates, select)?;
            let rows: Vec<Vec<String>> = ranking
                .ranked
                .iter()
                .map(|r| {
                    vec![
                        r.rank.to_string(),
                        r.candidate.id.clone(),
                        r.candidate.ebv.to_string(),
                        r.candidate.reliability.unwrap_or(0.0).to_string(),
                        y.get(&r.candidate.id).map(|v| v.to_string()).unwrap_or_else(|| "NA".to_string()),
                        r.selected.to_string(),
                    ]
                })
                .collect();
            io::write_rows(&out, &["rank", "id", "ebv", "reliability", "phenotype", "selected"], &rows)?;
            info!(
                "Selected {} of {}: differential {:.4}",
                ranking.summary.n_selected, ranking.summary.n_candidates, ranking.summary.selection_differential
            );
            if let Some(path) = summary {
                io::write_json(&path, &sol)?;
            }

            if let Some(k_folds) = cv_folds {
                let Some(g) = &genotypes else {
                    bail!("--cv-folds needs --geno");
                };
                let cv = cross_validate(
                    g,
                    &y,
                    Some(CvOptions {
                        method: CvMethod::from_str(&cv_method)?,
                        k_folds,
                        repeats: cv_repeats,
                        seed,
                        model: opts,
                    }),
                )?;
                let lo = cv.mean_accuracy - 1.96 * cv.se_accuracy;
                let hi = cv.mean_accuracy + 1.96 * cv.se_accuracy;
                info!("Prediction accuracy {:.3} (95% CI {:.3} to {:.3})", cv.mean_accuracy, lo, hi);
            }
        }
        Commands::Mixed { pheno, formula, kinship, genetic_factor, h2, out } => {
            let data = io::load_phenotypes(&pheno)?.to_dataset()?;
            let mut desc = ModelDescription::parse(&formula)?;
            let mut covs = HashMap::new();
            match (kinship, genetic_factor) {
                (Some(path), Some(factor)) => {
                    covs.insert(factor.clone(), io::load_relationship(&path)?);
                    desc = desc.with_genetic_factor(&factor);
                }
                (None, Some(factor)) => desc = desc.with_genetic_factor(&factor),
                (Some(_), None) => bail!("--kinship needs --genetic-factor"),
                (None, None) => {}
            }
            let sol = fit_model(&desc, &data, &covs, Some(MixedModelOptions::with_heritability(h2)))
                .with_context(|| format!("fitting '{}'", formula))?;
            if sol.ridge_applied > 0.0 {
                warn!("Ridge {:.3e} was needed to solve the equations", sol.ridge_applied);
            }
            info!(
                "Variance split: genetic {:.4}, other {:.4}, residual {:.4}",
                sol.variance.genetic, sol.variance.other, sol.variance.residual
            );
            io::write_json(&out, &sol)?;
        }
        Commands::Gwas {
            geno,
            pheno,
            kinship,
            out,
            summary,
            r#trait,
            ploidy,
            method,
            covariates,
            n_pc,
            h2,
            min_maf,
            threshold,
            alpha,
            top,
        } => {
            let method = GwasMethod::from_str(&method)?;
            let g = io::load_genotypes(&geno, ploidy)?;
            let table = io::load_phenotypes(&pheno)?;
            let y = table.trait_values(&r#trait)?;
            let covs = covariates
                .as_deref()
                .map(split_list)
                .unwrap_or_default()
                .iter()
                .map(|c| table.numeric_column_for(c, &g.sample_ids))
                .collect::<Result<Vec<_>>>()?;

            let kin = match (method, kinship) {
                (_, Some(path)) => Some(io::load_relationship(&path)?),
                (GwasMethod::Mlm, None) => Some(vanraden_kinship(&g, None)?),
                (GwasMethod::Glm, None) => None,
            };
            let opts = GwasOptions {
                method,
                alpha,
                threshold: ThresholdMethod::from_str(&threshold)?,
                min_maf,
                output: if top == 0 {
                    OutputPolicy::All
                } else {
                    OutputPolicy::SignificantPlusTop(top)
                },
                n_pcs: n_pc,
                heritability: h2,
            };
            let result = run_gwas(&g, &y, kin.as_ref(), &covs, Some(opts))?;
            for s in &result.skipped {
                warn!("Skipped {} ({}:{}): {}", s.marker_id, s.chrom, s.pos, s.reason);
            }
            info!(
                "{}: {} tested, {} skipped, {} significant (p < {:.3e}), lambda_GC = {:.3}",
                result.method.as_str(),
                result.n_tested,
                result.skipped.len(),
                result.n_significant,
                result.threshold.p_value,
                result.lambda_gc
            );
            io::write_gwas(&out, &result)?;
            if let Some(path) = summary {
                io::write_json(&path, &result)?;
            }
        }
        Commands::Cross {
            ebv,
            parents,
            geno,
            ploidy,
            mean,
            h2,
            criterion,
            top,
            max_inbreeding,
            out,
        } => {
            let table = io::load_phenotypes(&ebv)?;
            let Some((ebv_column, _)) = table.columns.first() else {
                bail!("Breeding value file needs 2 columns: id, ebv");
            };
            let ebvs = table.trait_values(ebv_column)?;
            let parent_ids = parents.as_deref().map(split_list).unwrap_or_else(|| {
                let mut ids: Vec<String> = ebvs.keys().cloned().collect();
                ids.sort();
                ids
            });

            let crosses = match geno {
                Some(path) => {
                    let g = io::load_genotypes(&path, ploidy)?;
                    let panel = ParentPanel {
                        geno: &g,
                        ebvs: &ebvs,
                        kinship: None,
                        marker_effects: None,
                    };
                    rank_crosses(
                        &panel,
                        &parent_ids,
                        mean,
                        h2,
                        Some(CrossOptions::default()),
                        Some(RankCrossOptions {
                            criterion: CrossCriterion::from_str(&criterion)?,
                            max_inbreeding,
                            min_distance: None,
                            top_n: Some(top),
                        }),
                    )?
                }
                None => {
                    if parent_ids.len() != 2 {
                        bail!("Without --geno give exactly two --parents");
                    }
                    let e = |id: &str| ebvs.get(id).copied().with_context(|| format!("no breeding value for '{}'", id));
                    let mut p = predict_cross(e(&parent_ids[0])?, e(&parent_ids[1])?, mean, h2, None)?;
                    p.parent1 = Some(parent_ids[0].clone());
                    p.parent2 = Some(parent_ids[1].clone());
                    vec![p]
                }
            };
            io::write_json(&out, &crosses)?;
            if let Some(best) = crosses.first() {
                info!(
                    "Best cross {} x {}: mean {:.4}, usefulness {:.4}",
                    best.parent1.as_deref().unwrap_or("?"),
                    best.parent2.as_deref().unwrap_or("?"),
                    best.predicted_mean,
                    best.usefulness_criterion
                );
            }
        }
    }

    Ok(())
}
