// Dataset loading.
//
// A dataset directory holds three CSV files sharing a leading `cell_id`
// column, one row per cell:
//
// - `features.csv`: gene-expression values, one column per gene
// - `targets.csv`: electrophysiological properties; empty, `NA` or `NaN`
//   cells mark missing measurements
// - `labels.csv` (optional): `cell_id,label` cell-type annotation
//
// Loading either succeeds completely or fails with a [`DataError`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::error::DataError;

pub const FEATURES_FILE: &str = "features.csv";
pub const TARGETS_FILE: &str = "targets.csv";
pub const LABELS_FILE: &str = "labels.csv";

const MISSING_TOKENS: [&str; 5] = ["", "NA", "NaN", "nan", "null"];

#[derive(Debug, Clone)]
pub struct Dataset {
    cell_ids: Vec<String>,
    gene_names: Vec<String>,
    target_names: Vec<String>,
    features: Array2<f32>,
    /// NaN where a measurement is missing.
    targets: Array2<f32>,
    observed: Array2<bool>,
    labels: Vec<Option<String>>,
}

impl Dataset {
    /// Assemble a dataset from in-memory parts, checking the shape invariants.
    pub fn new(
        cell_ids: Vec<String>,
        gene_names: Vec<String>,
        target_names: Vec<String>,
        features: Array2<f32>,
        targets: Array2<f32>,
        labels: Vec<Option<String>>,
    ) -> Result<Self, DataError> {
        let n = features.nrows();
        if n == 0 {
            return Err(DataError::Empty("no samples"));
        }
        if features.ncols() == 0 {
            return Err(DataError::Empty("no feature columns"));
        }
        if targets.ncols() == 0 {
            return Err(DataError::Empty("no target columns"));
        }
        check_rows("targets", n, targets.nrows())?;
        check_rows("cell ids", n, cell_ids.len())?;
        check_rows("labels", n, labels.len())?;
        check_rows("gene names", features.ncols(), gene_names.len())?;
        check_rows("target names", targets.ncols(), target_names.len())?;

        let observed = targets.mapv(|v| !v.is_nan());
        Ok(Dataset {
            cell_ids,
            gene_names,
            target_names,
            features,
            targets,
            observed,
            labels,
        })
    }

    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self, DataError> {
        let dir = dir.as_ref();
        let features = read_table(&dir.join(FEATURES_FILE), false)?;
        let targets = read_table(&dir.join(TARGETS_FILE), true)?;

        check_rows("targets.csv", features.ids.len(), targets.ids.len())?;
        for (row, (a, b)) in features.ids.iter().zip(&targets.ids).enumerate() {
            if a != b {
                return Err(DataError::CellIdMismatch {
                    row,
                    left: a.clone(),
                    right: b.clone(),
                });
            }
        }

        let labels_path = dir.join(LABELS_FILE);
        let labels = if labels_path.exists() {
            read_labels(&labels_path, &features.ids)?
        } else {
            debug!(path = %labels_path.display(), "no labels file, cells are unlabelled");
            vec![None; features.ids.len()]
        };

        let n = features.ids.len();
        let dataset = Dataset::new(
            features.ids,
            features.columns,
            targets.columns,
            Array2::from_shape_vec((n, features.width), features.values)?,
            Array2::from_shape_vec((n, targets.width), targets.values)?,
            labels,
        )?;
        info!(
            dir = %dir.display(),
            cells = dataset.n_samples(),
            genes = dataset.n_features(),
            targets = dataset.n_targets(),
            "loaded dataset"
        );
        Ok(dataset)
    }

    /// Write the dataset back in the directory layout [`Dataset::load`] reads.
    pub fn write_dir<P: AsRef<Path>>(&self, dir: P) -> Result<(), DataError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| DataError::Csv {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        write_table(&dir.join(FEATURES_FILE), &self.cell_ids, &self.gene_names, &self.features)?;
        write_table(&dir.join(TARGETS_FILE), &self.cell_ids, &self.target_names, &self.targets)?;
        if self.labels.iter().any(Option::is_some) {
            let path = dir.join(LABELS_FILE);
            let mut wtr = csv::Writer::from_path(&path).map_err(|e| csv_err(&path, e))?;
            wtr.write_record(["cell_id", "label"]).map_err(|e| csv_err(&path, e))?;
            for (id, label) in self.cell_ids.iter().zip(&self.labels) {
                wtr.write_record([id.as_str(), label.as_deref().unwrap_or("")])
                    .map_err(|e| csv_err(&path, e))?;
            }
            wtr.flush().map_err(|e| csv_err(&path, e.into()))?;
        }
        Ok(())
    }

    /// Low-rank synthetic data: cells of a few types scattered around type
    /// centers in a latent space; expression and electrophysiology are both
    /// driven by the latent coordinates.
    pub fn synthetic(spec: &SyntheticSpec) -> Self {
        let mut rng = StdRng::seed_from_u64(spec.seed);
        let n = spec.n_samples;
        let d = spec.latent_dim.max(1);
        let n_types = spec.n_types.max(1);

        let centers: Array2<f32> = Array2::random_using((n_types, d), StandardNormal, &mut rng) * 2.0;
        let types: Vec<usize> = (0..n).map(|i| i % n_types).collect();
        let mut latent: Array2<f32> = Array2::random_using((n, d), StandardNormal, &mut rng);
        for (mut row, &t) in latent.axis_iter_mut(Axis(0)).zip(&types) {
            row += &centers.row(t);
        }

        let loadings: Array2<f32> =
            Array2::random_using((d, spec.n_features), StandardNormal, &mut rng) / (d as f32).sqrt();
        let expr_noise: Array2<f32> = Array2::random_using((n, spec.n_features), StandardNormal, &mut rng);
        // softplus keeps expression non-negative
        let features = (latent.dot(&loadings) + expr_noise * spec.noise).mapv(|v| (1.0 + v.exp()).ln());

        let effects: Array2<f32> = Array2::random_using((d, spec.n_targets), StandardNormal, &mut rng);
        let target_noise: Array2<f32> = Array2::random_using((n, spec.n_targets), StandardNormal, &mut rng);
        let mut targets = latent.dot(&effects) + target_noise * spec.noise;

        for &(target, count) in &spec.missing {
            if target >= spec.n_targets {
                continue;
            }
            let mut rows: Vec<usize> = (0..n).collect();
            rows.shuffle(&mut rng);
            for &i in rows.iter().take(count.min(n)) {
                targets[[i, target]] = f32::NAN;
            }
        }

        let observed = targets.mapv(|v| !v.is_nan());
        Dataset {
            cell_ids: (0..n).map(|i| format!("cell{i:04}")).collect(),
            gene_names: (0..spec.n_features).map(|j| format!("gene{j}")).collect(),
            target_names: (0..spec.n_targets).map(|j| format!("ephys{j}")).collect(),
            features,
            targets,
            observed,
            labels: types.iter().map(|t| Some(format!("type{t}"))).collect(),
        }
    }

    pub fn n_samples(&self) -> usize {
        self.features.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn n_targets(&self) -> usize {
        self.targets.ncols()
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn gene_names(&self) -> &[String] {
        &self.gene_names
    }

    pub fn target_names(&self) -> &[String] {
        &self.target_names
    }

    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    pub fn targets(&self) -> &Array2<f32> {
        &self.targets
    }

    pub fn observed(&self) -> &Array2<bool> {
        &self.observed
    }

    pub fn labels(&self) -> &[Option<String>] {
        &self.labels
    }

    pub fn missing_count(&self, target: usize) -> usize {
        self.observed.column(target).iter().filter(|&&m| !m).count()
    }

    /// Distinct cell-type labels, sorted.
    pub fn classes(&self) -> Vec<String> {
        self.labels
            .iter()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn features_of(&self, rows: &[usize]) -> Array2<f32> {
        self.features.select(Axis(0), rows)
    }

    pub fn targets_of(&self, rows: &[usize]) -> Array2<f32> {
        self.targets.select(Axis(0), rows)
    }

    pub fn observed_of(&self, rows: &[usize]) -> Array2<bool> {
        self.observed.select(Axis(0), rows)
    }

    pub fn labels_of(&self, rows: &[usize]) -> Vec<Option<String>> {
        rows.iter().map(|&i| self.labels[i].clone()).collect()
    }
}

/// Parameters of [`Dataset::synthetic`].
#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub n_samples: usize,
    pub n_features: usize,
    pub n_targets: usize,
    pub latent_dim: usize,
    pub n_types: usize,
    pub noise: f32,
    /// `(target, count)`: blank out `count` random entries of `target`.
    pub missing: Vec<(usize, usize)>,
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        SyntheticSpec {
            n_samples: 100,
            n_features: 50,
            n_targets: 3,
            latent_dim: 2,
            n_types: 4,
            noise: 0.1,
            missing: Vec::new(),
            seed: 0,
        }
    }
}

struct Table {
    ids: Vec<String>,
    columns: Vec<String>,
    width: usize,
    values: Vec<f32>,
}

fn read_table(path: &Path, allow_missing: bool) -> Result<Table, DataError> {
    if !path.exists() {
        return Err(DataError::MissingFile(path.to_path_buf()));
    }
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| csv_err(path, e))?;
    let headers = rdr.headers().map_err(|e| csv_err(path, e))?.clone();
    let columns: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
    let width = columns.len();

    let mut ids = Vec::new();
    let mut values = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let rec = result.map_err(|e| csv_err(path, e))?;
        if rec.len() != width + 1 {
            return Err(DataError::RaggedRow {
                path: path.to_path_buf(),
                row,
                expected: width + 1,
                found: rec.len(),
            });
        }
        ids.push(rec[0].to_string());
        for (column, field) in rec.iter().skip(1).enumerate() {
            values.push(parse_value(path, row, column, field, allow_missing)?);
        }
    }
    if ids.is_empty() {
        return Err(DataError::Empty("table has no rows"));
    }
    Ok(Table {
        ids,
        columns,
        width,
        values,
    })
}

fn parse_value(path: &Path, row: usize, column: usize, field: &str, allow_missing: bool) -> Result<f32, DataError> {
    let field = field.trim();
    if allow_missing && MISSING_TOKENS.contains(&field) {
        return Ok(f32::NAN);
    }
    match field.parse::<f32>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(DataError::Parse {
            path: path.to_path_buf(),
            row,
            column,
            value: field.to_string(),
        }),
    }
}

fn read_labels(path: &Path, ids: &[String]) -> Result<Vec<Option<String>>, DataError> {
    let mut rdr = csv::Reader::from_path(path).map_err(|e| csv_err(path, e))?;
    let mut labels = Vec::with_capacity(ids.len());
    for (row, result) in rdr.records().enumerate() {
        let rec = result.map_err(|e| csv_err(path, e))?;
        let id = rec.get(0).unwrap_or_default();
        match ids.get(row) {
            Some(expected) if expected == id => {}
            Some(expected) => {
                return Err(DataError::CellIdMismatch {
                    row,
                    left: expected.clone(),
                    right: id.to_string(),
                })
            }
            None => {
                return Err(DataError::RowCount {
                    what: "labels.csv",
                    expected: ids.len(),
                    found: row + 1,
                })
            }
        }
        let label = rec.get(1).map(str::trim).filter(|s| !s.is_empty());
        labels.push(label.map(str::to_string));
    }
    check_rows("labels.csv", ids.len(), labels.len())?;
    Ok(labels)
}

fn write_table(path: &Path, ids: &[String], columns: &[String], values: &Array2<f32>) -> Result<(), DataError> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_err(path, e))?;
    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push("cell_id".to_string());
    header.extend(columns.iter().cloned());
    wtr.write_record(&header).map_err(|e| csv_err(path, e))?;
    for (id, row) in ids.iter().zip(values.rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(id.clone());
        record.extend(row.iter().map(|v| if v.is_nan() { String::new() } else { v.to_string() }));
        wtr.write_record(&record).map_err(|e| csv_err(path, e))?;
    }
    wtr.flush().map_err(|e| csv_err(path, e.into()))?;
    Ok(())
}

fn check_rows(what: &'static str, expected: usize, found: usize) -> Result<(), DataError> {
    if expected == found {
        Ok(())
    } else {
        Err(DataError::RowCount { what, expected, found })
    }
}

fn csv_err(path: &Path, source: csv::Error) -> DataError {
    DataError::Csv {
        path: PathBuf::from(path),
        source,
    }
}
