// Bottleneck activations for every sample and their plots.

use std::collections::BTreeMap;
use std::path::Path;

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{s, Array2, Axis};
use plotters::prelude::*;
use tracing::info;

use crate::bottleneck::{BottleneckConfig, BottleneckFitter, BottleneckParams, FittedBottleneck, TrainingHistory, TrainingRows};
use crate::data::Dataset;
use crate::error::{Error, FitError, Result};

const UNLABELLED: &str = "unlabelled";

/// Bottleneck coordinates of each sample, with its cell-type label.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentRepresentation {
    pub coords: Array2<f32>,
    pub labels: Vec<Option<String>>,
    pub cell_ids: Vec<String>,
}

impl LatentRepresentation {
    pub fn width(&self) -> usize {
        self.coords.ncols()
    }
}

pub fn extract(model: &FittedBottleneck, dataset: &Dataset) -> LatentRepresentation {
    LatentRepresentation {
        coords: model.latent(dataset.features()),
        labels: dataset.labels().to_vec(),
        cell_ids: dataset.cell_ids().to_vec(),
    }
}

/// Train one model on every row of `dataset`. Without a validation slice the
/// full epoch budget runs and the final weights are kept.
pub fn refit_full(dataset: &Dataset, config: &BottleneckConfig, params: BottleneckParams, seed: u64) -> std::result::Result<FittedBottleneck, FitError> {
    let mut config = config.clone();
    config.train.validation_fraction = 0.0;
    let rows = TrainingRows {
        features: dataset.features(),
        targets: dataset.targets(),
        observed: dataset.observed(),
        labels: dataset.labels(),
    };
    let model = BottleneckFitter::new(&config).fit(&rows, params, seed)?;
    info!(width = params.width, epochs = model.history().len(), "refitted on the full dataset");
    Ok(model)
}

/// Two columns for plotting. One-dimensional codes get a zero second
/// column, two-dimensional ones pass through, wider ones are projected onto
/// their two leading principal axes.
pub fn project_2d(coords: &Array2<f32>) -> Array2<f32> {
    let (n, k) = coords.dim();
    match k {
        0 => Array2::zeros((n, 2)),
        1 => {
            let mut out = Array2::zeros((n, 2));
            out.column_mut(0).assign(&coords.column(0));
            out
        }
        2 => coords.clone(),
        _ => pca(coords, 2),
    }
}

/// Projection onto the `dims` leading principal axes. Each axis is signed so
/// that its largest-magnitude loading is positive.
fn pca(coords: &Array2<f32>, dims: usize) -> Array2<f32> {
    let (n, k) = coords.dim();
    let x = coords.mapv(f64::from);
    let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| ndarray::Array1::zeros(k));
    let centered = &x - &mean;
    let denom = (n.max(2) - 1) as f64;
    let cov = centered.t().dot(&centered) / denom;

    let eigen = SymmetricEigen::new(DMatrix::from_fn(k, k, |i, j| cov[[i, j]]));
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let mut axes = Array2::<f64>::zeros((k, dims));
    for (d, &idx) in order.iter().take(dims).enumerate() {
        let v = eigen.eigenvectors.column(idx);
        let pivot = v.iter().copied().fold(0.0f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
        let sign = if pivot < 0.0 { -1.0 } else { 1.0 };
        for i in 0..k {
            axes[[i, d]] = sign * v[i];
        }
    }
    centered.dot(&axes).mapv(|v| v as f32)
}

/// Row indices per label, in label order; unlabelled rows come under their
/// own group.
fn groups(labels: &[Option<String>]) -> BTreeMap<&str, Vec<usize>> {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, l) in labels.iter().enumerate() {
        groups.entry(l.as_deref().unwrap_or(UNLABELLED)).or_default().push(i);
    }
    groups
}

fn padded_range(values: impl Iterator<Item = f32>) -> std::ops::Range<f32> {
    let (lo, hi) = values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() || !hi.is_finite() {
        return -1.0..1.0;
    }
    let pad = if hi > lo { 0.05 * (hi - lo) } else { 1.0 };
    (lo - pad)..(hi + pad)
}

/// SVG scatter of the (projected) latent space, one color per label.
pub fn render_scatter<P: AsRef<Path>>(latent: &LatentRepresentation, path: P) -> Result<()> {
    let xy = project_2d(&latent.coords);
    let caption = if latent.width() > 2 {
        format!("Bottleneck space (k = {}, PCA)", latent.width())
    } else {
        format!("Bottleneck space (k = {})", latent.width())
    };
    draw_scatter(&xy, &latent.labels, &caption, path.as_ref()).map_err(|e| Error::Plot(e.to_string()))
}

fn draw_scatter(xy: &Array2<f32>, labels: &[Option<String>], caption: &str, path: &Path) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let root = SVGBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 20).into_font().color(&BLACK))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(padded_range(xy.column(0).iter().copied()), padded_range(xy.column(1).iter().copied()))?;
    chart.configure_mesh().x_desc("latent 1").y_desc("latent 2").draw()?;

    for (i, (label, rows)) in groups(labels).into_iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        chart
            .draw_series(
                rows.iter()
                    .map(|&r| Circle::new((xy[[r, 0]], xy[[r, 1]]), 3, ShapeStyle::from(&color).filled())),
            )?
            .label(label)
            .legend(move |(x, y)| Circle::new((x + 10, y), 4, ShapeStyle::from(&color).filled()));
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

/// 3D scatter for a three-unit bottleneck.
pub fn render_scatter_3d<P: AsRef<Path>>(latent: &LatentRepresentation, path: P) -> Result<()> {
    if latent.width() != 3 {
        return Err(FitError::DimensionMismatch {
            expected: "3 latent dimensions".into(),
            actual: latent.width().to_string(),
        }
        .into());
    }
    draw_scatter_3d(&latent.coords, &latent.labels, path.as_ref()).map_err(|e| Error::Plot(e.to_string()))
}

fn draw_scatter_3d(xyz: &Array2<f32>, labels: &[Option<String>], path: &Path) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let root = SVGBackend::new(path, (800, 800)).into_drawing_area();
    root.fill(&WHITE)?;
    let range = |c: usize| padded_range(xyz.column(c).iter().copied());
    let mut chart = ChartBuilder::on(&root)
        .caption("Bottleneck space (k = 3)", ("sans-serif", 20).into_font().color(&BLACK))
        .margin(10)
        .build_cartesian_3d(range(0), range(1), range(2))?;
    chart.with_projection(|mut pb| {
        pb.yaw = 0.6;
        pb.pitch = 0.3;
        pb.scale = 0.85;
        pb.into_matrix()
    });
    chart.configure_axes().draw()?;

    for (i, (label, rows)) in groups(labels).into_iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        chart
            .draw_series(rows.iter().map(|&r| {
                let p = xyz.slice(s![r, ..]);
                Circle::new((p[0], p[1], p[2]), 3, ShapeStyle::from(&color).filled())
            }))?
            .label(label)
            .legend(move |(x, y)| Circle::new((x + 10, y), 4, ShapeStyle::from(&color).filled()));
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

/// Training and validation loss per epoch.
pub fn plot_history<P: AsRef<Path>>(history: &TrainingHistory, path: P) -> Result<()> {
    if history.is_empty() {
        return Err(Error::Plot("training history is empty".into()));
    }
    draw_history(history, path.as_ref()).map_err(|e| Error::Plot(e.to_string()))
}

fn draw_history(history: &TrainingHistory, path: &Path) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let root = SVGBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let epochs: Vec<i32> = (1..=history.len()).map(|x| x as i32).collect();
    let last = epochs.last().copied().unwrap_or(1).max(2);
    let max_y = history
        .loss
        .iter()
        .chain(history.val_loss.iter())
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max)
        .max(1e-6);
    let mut chart = ChartBuilder::on(&root)
        .caption("Training vs Validation Loss", ("sans-serif", 20).into_font().color(&BLACK))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(1i32..last, 0f32..max_y)?;
    chart.configure_mesh().x_desc("epoch").draw()?;
    chart
        .draw_series(LineSeries::new(
            epochs.iter().zip(history.loss.iter()).map(|(&x, y)| (x, *y)),
            ShapeStyle::from(&RED).stroke_width(2),
        ))?
        .label("Train")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));
    chart
        .draw_series(LineSeries::new(
            epochs.iter().zip(history.val_loss.iter()).map(|(&x, y)| (x, *y)),
            ShapeStyle::from(&BLUE).stroke_width(2),
        ))?
        .label("Val")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));
    chart.configure_series_labels().border_style(&BLACK).draw()?;
    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn labels(n: usize) -> Vec<Option<String>> {
        (0..n).map(|i| if i % 3 == 0 { None } else { Some(format!("type{}", i % 2)) }).collect()
    }

    #[test]
    fn narrow_codes_are_padded() {
        let coords = array![[1.0f32], [2.0], [3.0]];
        let xy = project_2d(&coords);
        assert_eq!(xy.dim(), (3, 2));
        assert_eq!(xy.column(0), coords.column(0));
        assert!(xy.column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn pca_finds_the_dominant_axis() {
        // variance lives almost entirely along (1, 1, 0, 0)
        let coords = Array2::from_shape_fn((50, 4), |(i, j)| {
            let t = i as f32 - 25.0;
            match j {
                0 | 1 => t,
                2 => 0.01 * ((i % 5) as f32),
                _ => 0.0,
            }
        });
        let xy = project_2d(&coords);
        assert_eq!(xy.dim(), (50, 2));
        let first = xy.column(0);
        // first component is monotone in t with the positive sign convention
        assert!(first.windows(2).into_iter().all(|w| w[1] > w[0]));
        let var = |c: usize| xy.column(c).mapv(|v| v * v).sum();
        assert!(var(0) > 100.0 * var(1));
    }

    #[test]
    fn writes_scatter_and_history_svgs() {
        let dir = tempfile::tempdir().unwrap();
        let latent = LatentRepresentation {
            coords: Array2::from_shape_fn((12, 3), |(i, j)| (i * (j + 1)) as f32 * 0.1),
            labels: labels(12),
            cell_ids: (0..12).map(|i| format!("c{i}")).collect(),
        };
        let flat = dir.path().join("latent.svg");
        render_scatter(&latent, &flat).unwrap();
        assert!(std::fs::read_to_string(&flat).unwrap().contains("<svg"));

        let cube = dir.path().join("latent3d.svg");
        render_scatter_3d(&latent, &cube).unwrap();
        assert!(cube.exists());

        let history = TrainingHistory {
            loss: vec![1.0, 0.5, 0.3],
            val_loss: vec![1.1, 0.6, 0.4],
            epochs: vec![0, 1, 2],
        };
        let curve = dir.path().join("history.svg");
        plot_history(&history, &curve).unwrap();
        assert!(curve.exists());
    }

    #[test]
    fn three_d_needs_three_dimensions() {
        let latent = LatentRepresentation {
            coords: Array2::zeros((4, 2)),
            labels: labels(4),
            cell_ids: vec![String::new(); 4],
        };
        let dir = tempfile::tempdir().unwrap();
        assert!(render_scatter_3d(&latent, dir.path().join("x.svg")).is_err());
    }
}
