//! File formats for the `breed` command line.
//!
//! Genotypes: `marker, chr, pos, <samples...>` with one marker per row.
//! Phenotypes: `sample_id, <columns...>`. Pedigrees: `id, parent1, parent2`.
//! Tab, comma or space delimited, detected from the header line.

use anyhow::{anyhow, bail, Context, Result};
use breed_core::{
    Dataset, GenotypeMatrix, GenotypeMatrixBuilder, MarkerMetadata, PedigreeRecord, RelationshipMatrix,
    RelationshipMethod, StandardizeOptions,
};
use gwas_rs::AssociationResult;
use ndarray::Array2;
use serde::Serialize;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

fn is_missing(v: &str) -> bool {
    matches!(v.trim(), "" | "NA" | "na" | "NaN" | ".")
}

pub fn detect_delimiter<P: AsRef<Path>>(path: P) -> Result<u8> {
    let file = std::fs::File::open(&path).with_context(|| format!("opening {}", path.as_ref().display()))?;
    let mut first_line = String::new();
    std::io::BufReader::new(file).read_line(&mut first_line)?;
    if first_line.contains('\t') {
        Ok(b'\t')
    } else if first_line.contains(',') {
        Ok(b',')
    } else {
        Ok(b' ')
    }
}

fn reader<P: AsRef<Path>>(path: P) -> Result<csv::Reader<std::fs::File>> {
    let delim = detect_delimiter(&path)?;
    csv::ReaderBuilder::new()
        .delimiter(delim)
        .trim(csv::Trim::All)
        .from_path(&path)
        .with_context(|| format!("reading {}", path.as_ref().display()))
}

/// Sample-keyed table with raw string cells, columns in file order.
#[derive(Debug, Clone)]
pub struct PhenotypeTable {
    pub id_column: String,
    pub sample_ids: Vec<String>,
    pub columns: Vec<(String, Vec<String>)>,
}

impl PhenotypeTable {
    fn column(&self, name: &str) -> Result<&[String]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
            .ok_or_else(|| anyhow!("Column '{}' not found in phenotype file", name))
    }

    /// Finite values of a numeric column by sample; missing cells are left out.
    pub fn trait_values(&self, name: &str) -> Result<HashMap<String, f64>> {
        let mut out = HashMap::new();
        for (id, v) in self.sample_ids.iter().zip(self.column(name)?) {
            if is_missing(v) {
                continue;
            }
            let x: f64 = v
                .parse()
                .map_err(|_| anyhow!("Non-numeric value '{}' for sample '{}' in column '{}'", v, id, name))?;
            out.insert(id.clone(), x);
        }
        Ok(out)
    }

    /// Numeric column laid out in `order`; absent samples are NaN.
    pub fn numeric_column_for(&self, name: &str, order: &[String]) -> Result<Vec<f64>> {
        let values = self.trait_values(name)?;
        Ok(order.iter().map(|id| values.get(id).copied().unwrap_or(f64::NAN)).collect())
    }

    /// Every column, numeric where all present cells parse, otherwise a factor.
    pub fn to_dataset(&self) -> Result<Dataset> {
        let mut data = Dataset::new().with_factor(&self.id_column, self.sample_ids.clone())?;
        for (name, vals) in &self.columns {
            let numeric: Option<Vec<f64>> = vals
                .iter()
                .map(|v| if is_missing(v) { Some(f64::NAN) } else { v.parse().ok() })
                .collect();
            data = match numeric {
                Some(v) => data.with_numeric(name, v)?,
                None => data.with_factor(name, vals.clone())?,
            };
        }
        Ok(data)
    }
}

pub fn load_phenotypes<P: AsRef<Path>>(path: P) -> Result<PhenotypeTable> {
    let mut rdr = reader(&path)?;
    let headers = rdr.headers()?.clone();
    if headers.len() < 2 {
        bail!("Phenotype file needs at least 2 columns: sample_id, <trait>");
    }
    let mut sample_ids = Vec::new();
    let mut columns: Vec<(String, Vec<String>)> = headers.iter().skip(1).map(|h| (h.to_string(), Vec::new())).collect();
    for result in rdr.records() {
        let record = result?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        sample_ids.push(record.get(0).unwrap_or("").to_string());
        for (i, (_, vals)) in columns.iter_mut().enumerate() {
            vals.push(record.get(i + 1).unwrap_or("").to_string());
        }
    }
    Ok(PhenotypeTable {
        id_column: headers.get(0).unwrap_or("sample_id").to_string(),
        sample_ids,
        columns,
    })
}

/// Load a marker-by-sample dosage file into an individuals x markers matrix.
pub fn load_genotypes<P: AsRef<Path>>(path: P, ploidy: u8) -> Result<GenotypeMatrix> {
    let mut rdr = reader(&path)?;
    let headers = rdr.headers()?.clone();
    if headers.len() < 4 {
        bail!("Genotype file needs at least 4 columns: marker_id, chr, pos, <samples...>");
    }
    let sample_ids: Vec<String> = headers.iter().skip(3).map(str::to_string).collect();

    let mut marker_ids = Vec::new();
    let mut metadata = Vec::new();
    let mut by_marker: Vec<Vec<f64>> = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        if record.len() != headers.len() {
            bail!(
                "Genotype row {} has {} fields, header has {}",
                line + 2,
                record.len(),
                headers.len()
            );
        }
        marker_ids.push(record.get(0).unwrap_or("").to_string());
        metadata.push(MarkerMetadata {
            chrom: record.get(1).unwrap_or("").to_string(),
            pos: record.get(2).unwrap_or("0").parse().unwrap_or(0),
        });
        let row = record
            .iter()
            .skip(3)
            .map(|v| {
                if is_missing(v) {
                    Ok(f64::NAN)
                } else {
                    v.parse::<f64>().map_err(|_| anyhow!("Invalid dosage '{}' on row {}", v, line + 2))
                }
            })
            .collect::<Result<Vec<f64>>>()?;
        by_marker.push(row);
    }
    if by_marker.is_empty() {
        bail!("No markers found in {}", path.as_ref().display());
    }

    let raw: Vec<Vec<f64>> = (0..sample_ids.len())
        .map(|i| by_marker.iter().map(|row| row[i]).collect())
        .collect();
    let (geno, _) = GenotypeMatrixBuilder::new(Some(StandardizeOptions {
        ploidy,
        ..Default::default()
    }))
    .sample_ids(sample_ids)
    .marker_ids(marker_ids)
    .marker_metadata(metadata)
    .standardize(&raw)?;
    Ok(geno)
}

pub fn load_pedigree<P: AsRef<Path>>(path: P) -> Result<Vec<PedigreeRecord>> {
    let mut rdr = reader(&path)?;
    if rdr.headers()?.len() < 3 {
        bail!("Pedigree file needs 3 columns: id, parent1, parent2");
    }
    let parent = |v: Option<&str>| match v {
        Some(p) if !is_missing(p) && p != "0" => Some(p.to_string()),
        _ => None,
    };
    let mut records = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let id = record.get(0).unwrap_or("");
        if id.is_empty() {
            continue;
        }
        records.push(PedigreeRecord {
            id: id.to_string(),
            parent1: parent(record.get(1)),
            parent2: parent(record.get(2)),
        });
    }
    Ok(records)
}

/// Square matrix with a `sample_id` header row and column.
pub fn load_relationship<P: AsRef<Path>>(path: P) -> Result<RelationshipMatrix> {
    let mut rdr = reader(&path)?;
    let headers = rdr.headers()?.clone();
    let col_ids: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
    let n = col_ids.len();

    let mut row_ids = Vec::with_capacity(n);
    let mut matrix = Array2::<f64>::zeros((n, n));
    for result in rdr.records() {
        let record = result?;
        let i = row_ids.len();
        if i >= n || record.len() != n + 1 {
            bail!("Relationship matrix in {} is not square", path.as_ref().display());
        }
        row_ids.push(record.get(0).unwrap_or("").to_string());
        for j in 0..n {
            let v = record.get(j + 1).unwrap_or("");
            matrix[(i, j)] = v
                .parse()
                .map_err(|_| anyhow!("Invalid relationship value '{}' at row {}", v, i + 1))?;
        }
    }
    if row_ids != col_ids {
        bail!("Relationship matrix row and column ids differ");
    }
    Ok(RelationshipMatrix::new(row_ids, matrix, RelationshipMethod::Supplied)?)
}

fn write_square<P: AsRef<Path>>(path: P, ids: &[String], matrix: &Array2<f64>) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&path)
        .with_context(|| format!("writing {}", path.as_ref().display()))?;
    let mut header = Vec::with_capacity(ids.len() + 1);
    header.push("sample_id".to_string());
    header.extend(ids.iter().cloned());
    wtr.write_record(&header)?;
    for (i, sid) in ids.iter().enumerate() {
        let mut row = Vec::with_capacity(ids.len() + 1);
        row.push(sid.clone());
        row.extend(matrix.row(i).iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_relationship<P: AsRef<Path>>(path: P, rel: &RelationshipMatrix) -> Result<()> {
    write_square(path, &rel.sample_ids, &rel.matrix)
}

pub fn write_distances<P: AsRef<Path>>(path: P, dist: &kinship_rs::DistanceMatrix) -> Result<()> {
    write_square(path, &dist.sample_ids, &dist.matrix)
}

/// Header row followed by one row per record; rows must match the header width.
pub fn write_rows<P: AsRef<Path>>(path: P, header: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let delim = if path.as_ref().extension().is_some_and(|e| e == "csv") {
        b','
    } else {
        b'\t'
    };
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(delim)
        .from_path(&path)
        .with_context(|| format!("writing {}", path.as_ref().display()))?;
    wtr.write_record(header)?;
    for row in rows {
        wtr.write_record(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_gwas<P: AsRef<Path>>(path: P, result: &AssociationResult) -> Result<()> {
    let rows: Vec<Vec<String>> = result
        .markers
        .iter()
        .map(|m| {
            vec![
                m.marker_id.clone(),
                m.chrom.clone(),
                m.pos.to_string(),
                m.effect.to_string(),
                m.std_error.to_string(),
                m.statistic.to_string(),
                m.p_value.to_string(),
                m.score.to_string(),
                m.maf.to_string(),
                m.n_obs.to_string(),
                m.significant.to_string(),
            ]
        })
        .collect();
    write_rows(
        path,
        &["marker", "chrom", "pos", "effect", "std_error", "t", "p_value", "score", "maf", "n_obs", "significant"],
        &rows,
    )
}

pub fn write_json<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> Result<()> {
    let file = std::fs::File::create(&path).with_context(|| format!("writing {}", path.as_ref().display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), value)?;
    Ok(())
}
