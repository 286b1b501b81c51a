// Evaluation records and their aggregation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::metrics::Metric;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Bottleneck,
    Linear,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Bottleneck => write!(f, "bottleneck"),
            ModelKind::Linear => write!(f, "linear"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordStatus {
    Ok,
    /// `observed` is the count that fell short: observed training rows of the
    /// target, or 0 when no test row of the target is observed.
    InsufficientData { observed: usize },
    Failed { reason: String },
}

impl RecordStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RecordStatus::Ok)
    }
}

/// Hyperparameters the fold's model ended up with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Hyperparameters {
    Bottleneck {
        width: usize,
        l1: f32,
        l2: f32,
        epochs_run: usize,
        converged: bool,
    },
    Linear {
        alpha: f32,
        l1_ratio: f32,
    },
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub model: ModelKind,
    pub fold: usize,
    pub target: usize,
    pub target_name: String,
    pub metric: Metric,
    /// `Some` exactly when `status` is `Ok`; always finite then.
    pub value: Option<f32>,
    pub status: RecordStatus,
    pub hyperparameters: Hyperparameters,
}

impl EvaluationRecord {
    pub fn skipped(model: ModelKind, fold: usize, target: usize, target_name: &str, metric: Metric, observed: usize) -> Self {
        EvaluationRecord {
            model,
            fold,
            target,
            target_name: target_name.to_string(),
            metric,
            value: None,
            status: RecordStatus::InsufficientData { observed },
            hyperparameters: Hyperparameters::None,
        }
    }

    pub fn failed(model: ModelKind, fold: usize, target: usize, target_name: &str, metric: Metric, reason: String) -> Self {
        EvaluationRecord {
            model,
            fold,
            target,
            target_name: target_name.to_string(),
            metric,
            value: None,
            status: RecordStatus::Failed { reason },
            hyperparameters: Hyperparameters::None,
        }
    }
}

/// All records of a run plus the fingerprint of the configuration that
/// produced them. This is the unit stored in the results cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsTable {
    pub fingerprint: String,
    pub records: Vec<EvaluationRecord>,
}

impl ResultsTable {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        ResultsTable {
            fingerprint: fingerprint.into(),
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn fold_len(&self, fold: usize) -> usize {
        self.records.iter().filter(|r| r.fold == fold).count()
    }

    /// Drop whatever is stored for `fold` and insert `records` instead.
    pub fn replace_fold(&mut self, fold: usize, records: Vec<EvaluationRecord>) {
        self.records.retain(|r| r.fold != fold);
        self.records.extend(records);
    }

    /// Order by fold, model, then target.
    pub fn sort(&mut self) {
        self.records.sort_by_key(|r| (r.fold, r.model, r.target));
    }

    /// Mean and sample variance of the scores per (model, target).
    pub fn summarize(&self) -> Vec<SummaryRow> {
        let mut groups: BTreeMap<(ModelKind, usize), SummaryRow> = BTreeMap::new();
        let mut values: BTreeMap<(ModelKind, usize), Vec<f64>> = BTreeMap::new();
        for r in &self.records {
            let key = (r.model, r.target);
            let row = groups.entry(key).or_insert_with(|| SummaryRow {
                model: r.model,
                target: r.target,
                target_name: r.target_name.clone(),
                metric: r.metric,
                n_ok: 0,
                n_skipped: 0,
                n_failed: 0,
                mean: None,
                variance: None,
            });
            match (&r.status, r.value) {
                (RecordStatus::Ok, Some(v)) => {
                    row.n_ok += 1;
                    values.entry(key).or_default().push(v as f64);
                }
                (RecordStatus::Ok, None) | (RecordStatus::Failed { .. }, _) => row.n_failed += 1,
                (RecordStatus::InsufficientData { .. }, _) => row.n_skipped += 1,
            }
        }
        for (key, vs) in values {
            if let Some(row) = groups.get_mut(&key) {
                let n = vs.len() as f64;
                let mean = vs.iter().sum::<f64>() / n;
                row.mean = Some(mean as f32);
                if vs.len() > 1 {
                    let var = vs.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                    row.variance = Some(var as f32);
                }
            }
        }
        groups.into_values().collect()
    }

    /// One row per record, for inspection outside the tool.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), DataError> {
        let path = path.as_ref();
        let csv_err = |source| DataError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut wtr = csv::Writer::from_path(path).map_err(csv_err)?;
        wtr.write_record(["model", "fold", "target", "metric", "value", "status", "hyperparameters"])
            .map_err(csv_err)?;
        for r in &self.records {
            let status = match &r.status {
                RecordStatus::Ok => "ok".to_string(),
                RecordStatus::InsufficientData { observed } => format!("insufficient_data({observed})"),
                RecordStatus::Failed { reason } => format!("failed({reason})"),
            };
            let hyper = match &r.hyperparameters {
                Hyperparameters::Bottleneck { width, l1, l2, epochs_run, converged } => {
                    format!("k={width} l1={l1} l2={l2} epochs={epochs_run} converged={converged}")
                }
                Hyperparameters::Linear { alpha, l1_ratio } => format!("alpha={alpha} l1_ratio={l1_ratio}"),
                Hyperparameters::None => String::new(),
            };
            wtr.write_record([
                r.model.to_string(),
                r.fold.to_string(),
                r.target_name.clone(),
                r.metric.name().to_string(),
                r.value.map(|v| v.to_string()).unwrap_or_default(),
                status,
                hyper,
            ])
            .map_err(csv_err)?;
        }
        wtr.flush().map_err(|e| csv_err(e.into()))?;
        Ok(())
    }
}

/// Aggregate of one (model, target) pair across folds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub model: ModelKind,
    pub target: usize,
    pub target_name: String,
    pub metric: Metric,
    pub n_ok: usize,
    pub n_skipped: usize,
    pub n_failed: usize,
    /// Over `Ok` records only.
    pub mean: Option<f32>,
    /// Sample variance (n - 1); needs two `Ok` records.
    pub variance: Option<f32>,
}

impl fmt::Display for SummaryRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let num = |v: Option<f32>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
        write!(
            f,
            "{:<10} {:<16} {}={:>8} var={:>8} ok={} skipped={} failed={}",
            self.model,
            self.target_name,
            self.metric.name(),
            num(self.mean),
            num(self.variance),
            self.n_ok,
            self.n_skipped,
            self.n_failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(model: ModelKind, fold: usize, target: usize, value: f32) -> EvaluationRecord {
        EvaluationRecord {
            model,
            fold,
            target,
            target_name: format!("t{target}"),
            metric: Metric::R2,
            value: Some(value),
            status: RecordStatus::Ok,
            hyperparameters: Hyperparameters::Linear { alpha: 0.1, l1_ratio: 0.5 },
        }
    }

    #[test]
    fn summary_mean_and_sample_variance() {
        let mut table = ResultsTable::new("fp");
        table.records = vec![
            ok(ModelKind::Linear, 0, 0, 0.2),
            ok(ModelKind::Linear, 1, 0, 0.4),
            ok(ModelKind::Linear, 2, 0, 0.6),
            EvaluationRecord::skipped(ModelKind::Linear, 3, 0, "t0", Metric::R2, 3),
            EvaluationRecord::failed(ModelKind::Bottleneck, 0, 0, "t0", Metric::R2, "diverged".into()),
        ];
        let summary = table.summarize();
        assert_eq!(summary.len(), 2);
        let bottleneck = &summary[0];
        assert_eq!((bottleneck.n_ok, bottleneck.n_failed), (0, 1));
        assert_eq!(bottleneck.mean, None);
        let linear = &summary[1];
        assert_eq!((linear.n_ok, linear.n_skipped), (3, 1));
        assert!((linear.mean.unwrap() - 0.4).abs() < 1e-6);
        assert!((linear.variance.unwrap() - 0.04).abs() < 1e-6);
    }

    #[test]
    fn replacing_a_fold_drops_stale_records() {
        let mut table = ResultsTable::new("fp");
        table.replace_fold(0, vec![ok(ModelKind::Linear, 0, 0, 0.1)]);
        table.replace_fold(1, vec![ok(ModelKind::Linear, 1, 0, 0.2)]);
        table.replace_fold(0, vec![ok(ModelKind::Linear, 0, 0, 0.3), ok(ModelKind::Linear, 0, 1, 0.3)]);
        assert_eq!(table.fold_len(0), 2);
        assert_eq!(table.len(), 3);
        table.sort();
        assert_eq!(table.records[0].fold, 0);
        assert_eq!(table.records[2].fold, 1);
    }

    #[test]
    fn csv_has_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let mut table = ResultsTable::new("fp");
        table.records = vec![
            ok(ModelKind::Linear, 0, 0, 0.5),
            EvaluationRecord::skipped(ModelKind::Bottleneck, 0, 1, "t1", Metric::R2, 2),
        ];
        table.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("insufficient_data(2)"));
    }
}
