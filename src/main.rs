use std::{fmt, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sparse_sage::{
    config::Config,
    dataset::NodePredDataset,
    nn::Sage,
    npy,
    train::{layerwise_infer, train},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Cpu,
    Puregpu,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Cpu => write!(f, "cpu"),
            Mode::Puregpu => write!(f, "puregpu"),
        }
    }
}

/// GraphSAGE node classification with neighbor sampling.
#[derive(Parser)]
#[command(name = "graphsage")]
#[command(about = "Train and test a GraphSAGE node classifier", long_about = None)]
struct Cli {
    /// Training mode. Only the CPU backend exists; `puregpu` runs on it.
    #[arg(long, value_enum, default_value_t = Mode::Puregpu)]
    mode: Mode,

    /// Directory holding feat.npy, label.npy, edges.npy and the split
    /// index files. A synthetic graph is generated when absent.
    #[arg(long)]
    data: Option<PathBuf>,

    /// Read feature rows from disk on demand instead of loading them.
    #[arg(long)]
    on_disk_features: bool,

    /// JSON file overriding the default configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Write the logits of every node to this `.npy` file.
    #[arg(long)]
    predictions: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(seed) = cli.seed {
        cfg.seed = seed;
    }
    cfg.validate().context("Invalid configuration")?;

    let mode = match cli.mode {
        Mode::Puregpu => {
            warn!("no GPU backend available, falling back to cpu");
            Mode::Cpu
        }
        mode => mode,
    };
    info!("Training in {mode} mode.");

    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);

    info!("Loading data");
    let dataset = match &cli.data {
        Some(dir) => NodePredDataset::load_dir(dir, cli.on_disk_features)
            .with_context(|| format!("Failed to load dataset from {}", dir.display()))?,
        None => NodePredDataset::synthetic(&cfg.synthetic, &mut rng)
            .context("Failed to generate synthetic dataset")?,
    };
    let adj = dataset.adjacency().context("Failed to build adjacency matrix")?;
    info!(
        dataset = %dataset.name,
        nodes = dataset.num_nodes,
        edges = adj.nnz(),
        classes = dataset.num_classes,
        "graph ready"
    );

    let mut model = Sage::new(
        dataset.features.dim(),
        cfg.model.hidden_size,
        dataset.num_classes,
        cfg.model.num_layers,
        cfg.model.dropout,
        &mut rng,
    )?;
    info!(parameters = model.params().num_scalars(), "model initialised");

    info!("Training...");
    train(&cfg, &adj, &dataset, &mut model, &mut rng)?;

    info!("Testing...");
    let (acc, logits) = layerwise_infer(&model, &adj, &dataset, cfg.inference.batch_size)?;
    info!("Test accuracy {acc:.4}");

    if let Some(path) = &cli.predictions {
        npy::write_matrix(path, &logits)
            .with_context(|| format!("Failed to write predictions to {}", path.display()))?;
        info!(path = %path.display(), "predictions written");
    }

    Ok(())
}
