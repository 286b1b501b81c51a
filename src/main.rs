// Command-line entry point: generate a synthetic dataset, run the
// cross-validation, summarize cached results, and plot the bottleneck space.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ephys_bottleneck::bottleneck::BottleneckParams;
use ephys_bottleneck::{cache, latent, CrossValidation, Dataset, ExperimentConfig, SyntheticSpec};

#[derive(Parser)]
#[command(name = "ephys-bottleneck")]
#[command(about = "Bottleneck regression of electrophysiology from gene expression")]
#[command(version)]
struct Cli {
    /// Experiment configuration (TOML). Defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic dataset directory
    Synth {
        /// Output directory
        out: PathBuf,

        #[arg(long, default_value_t = 100)]
        samples: usize,

        #[arg(long, default_value_t = 50)]
        genes: usize,

        #[arg(long, default_value_t = 3)]
        targets: usize,

        /// Blank out entries as TARGET:COUNT, repeatable
        #[arg(long = "missing", value_parser = parse_missing)]
        missing: Vec<(usize, usize)>,

        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Run repeated cross-validation of both model families
    Cv {
        /// Dataset directory with features.csv and targets.csv
        data: PathBuf,

        /// Pickled results cache; resumes an interrupted run
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Also write every record as CSV
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Override the number of repetitions
        #[arg(long)]
        repetitions: Option<usize>,

        /// Override the base seed
        #[arg(long)]
        seed: Option<u64>,

        /// Run folds in parallel
        #[arg(long)]
        parallel: bool,

        /// Show epoch progress bars
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print mean and variance per model and target from a results cache
    Summary {
        cache: PathBuf,
    },

    /// Fit one model on the full dataset and plot its bottleneck space
    Latent {
        data: PathBuf,

        /// Output directory for the SVG files and the model JSON
        #[arg(short, long, default_value = "latent")]
        out: PathBuf,

        /// Bottleneck width; the first configured width by default
        #[arg(short = 'k', long)]
        width: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(short, long)]
        verbose: bool,
    },
}

fn parse_missing(s: &str) -> std::result::Result<(usize, usize), String> {
    let (t, c) = s.split_once(':').ok_or_else(|| format!("expected TARGET:COUNT, got {s}"))?;
    let t = t.parse().map_err(|e| format!("bad target index {t}: {e}"))?;
    let c = c.parse().map_err(|e| format!("bad count {c}: {e}"))?;
    Ok((t, c))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ExperimentConfig::default(),
    };

    match cli.command {
        Commands::Synth {
            out,
            samples,
            genes,
            targets,
            missing,
            seed,
        } => {
            if let Some(&(t, _)) = missing.iter().find(|(t, _)| *t >= targets) {
                bail!("--missing names target {t}, but there are only {targets}");
            }
            let spec = SyntheticSpec {
                n_samples: samples,
                n_features: genes,
                n_targets: targets,
                missing,
                seed,
                ..SyntheticSpec::default()
            };
            Dataset::synthetic(&spec)
                .write_dir(&out)
                .with_context(|| format!("writing {}", out.display()))?;
            info!(dir = %out.display(), samples, genes, targets, "synthetic dataset written");
        }
        Commands::Cv {
            data,
            cache,
            csv,
            repetitions,
            seed,
            parallel,
            verbose,
        } => {
            if let Some(r) = repetitions {
                config.cv.repetitions = r;
            }
            if let Some(s) = seed {
                config.cv.seed = s;
            }
            config.cv.parallel |= parallel;
            config.bottleneck.train.verbose |= verbose;
            config.validate()?;
            run_cv(&data, &config, cache.as_deref(), csv.as_deref())?;
        }
        Commands::Summary { cache: path } => {
            let table = cache::load(&path)?.with_context(|| format!("no results cache at {}", path.display()))?;
            println!("{} records", table.len());
            for row in table.summarize() {
                println!("{row}");
            }
        }
        Commands::Latent {
            data,
            out,
            width,
            seed,
            verbose,
        } => {
            config.bottleneck.train.verbose |= verbose;
            config.validate()?;
            run_latent(&data, &config, &out, width, seed.unwrap_or(config.cv.seed))?;
        }
    }
    Ok(())
}

fn run_cv(data: &Path, config: &ExperimentConfig, cache_path: Option<&Path>, csv: Option<&Path>) -> Result<()> {
    let dataset = Dataset::load(data).with_context(|| format!("loading dataset {}", data.display()))?;
    let cv = CrossValidation::new(&dataset, config);
    let table = match cache_path {
        Some(path) => cv.run_cached(path)?,
        None => cv.run()?,
    };
    if let Some(path) = csv {
        table.write_csv(path)?;
    }
    println!("{} records", table.len());
    for row in table.summarize() {
        println!("{row}");
    }
    Ok(())
}

fn run_latent(data: &Path, config: &ExperimentConfig, out: &Path, width: Option<usize>, seed: u64) -> Result<()> {
    let dataset = Dataset::load(data).with_context(|| format!("loading dataset {}", data.display()))?;
    let b = &config.bottleneck;
    let params = BottleneckParams {
        width: width.or_else(|| b.widths.first().copied()).unwrap_or(2),
        l1: b.l1_grid.first().copied().unwrap_or(0.0),
        l2: b.l2_grid.first().copied().unwrap_or(0.0),
    };
    let model = latent::refit_full(&dataset, b, params, seed)?;

    std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    model.save_json(out.join("model.json"))?;
    let rep = latent::extract(&model, &dataset);
    latent::render_scatter(&rep, out.join("latent.svg"))?;
    if rep.width() == 3 {
        latent::render_scatter_3d(&rep, out.join("latent_3d.svg"))?;
    }
    latent::plot_history(model.history(), out.join("history.svg"))?;
    if let Some(genes) = model.selected_genes() {
        let names: Vec<&str> = genes.iter().map(|&g| dataset.gene_names()[g].as_str()).collect();
        println!("selected genes: {}", names.join(", "));
    }
    info!(dir = %out.display(), width = params.width, "latent plots written");
    Ok(())
}
