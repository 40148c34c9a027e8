use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tracing::{debug, info};

use crate::{
    config::Config,
    cpu::CpuContext,
    dataset::NodePredDataset,
    loader::IndexLoader,
    matrix::DenseMatrix,
    metrics::accuracy,
    nn::Sage,
    optim::Adam,
    sampler::NeighborSampler,
    sparse::SparseMatrix,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
}

fn progress_bar(len: usize, visible: bool, epoch: usize) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template("{prefix} [{bar:40}] {pos}/{len} {msg}") {
        pb.set_style(style.progress_chars("=> "));
    }
    pb.set_prefix(format!("epoch {epoch:>3}"));
    pb
}

pub fn train<R: Rng + ?Sized>(
    cfg: &Config,
    adj: &SparseMatrix,
    dataset: &NodePredDataset,
    model: &mut Sage,
    rng: &mut R,
) -> Result<Vec<EpochStats>> {
    if dataset.train_idx.is_empty() {
        return Err(Error::InvalidConfig(String::from("training split is empty")));
    }

    let train_loader = IndexLoader::new(dataset.train_idx.clone(), cfg.train.batch_size, true)?;
    let val_loader = IndexLoader::new(dataset.val_idx.clone(), cfg.train.batch_size, false)?;
    let sampler = NeighborSampler::new(cfg.train.fanouts.clone(), cfg.train.replace);
    let mut opt = Adam::new(cfg.train.optimizer);

    let mut history = Vec::with_capacity(cfg.train.epochs);

    for epoch in 0..cfg.train.epochs {
        let pb = progress_bar(train_loader.num_batches(), cfg.train.progress, epoch);
        let mut total_loss = 0.0;
        let mut batches = 0;

        for seeds in train_loader.epoch(&mut *rng) {
            let batch = sampler.sample(adj, &seeds, &mut *rng)?;
            let x = dataset.features.index_select(&batch.input_nodes)?;
            let y = dataset.labels_of(&batch.output_nodes);

            let ctx = CpuContext::training(model.dropout(), rng.gen());
            let (loss, grads) = model.train_step(&batch.blocks, &x, &y, ctx)?;
            opt.step(model.params_mut(), &grads)?;

            total_loss += loss;
            batches += 1;
            pb.set_message(format!("loss {loss:.4}"));
            pb.inc(1);
        }
        pb.finish_and_clear();

        let acc = evaluate(model, adj, dataset, &val_loader, &sampler, &mut *rng)?;
        let stats = EpochStats {
            epoch,
            loss: total_loss / batches.max(1) as f32,
            accuracy: acc,
        };
        info!(
            "Epoch {:05} | Loss {:.4} | Accuracy {:.4}",
            stats.epoch, stats.loss, stats.accuracy
        );
        debug!(steps = opt.steps(), "optimizer state");
        history.push(stats);
    }

    Ok(history)
}

/// Accuracy of the model on the nodes of `loader`, each batch run over
/// freshly sampled blocks without dropout.
pub fn evaluate<R: Rng + ?Sized>(
    model: &Sage,
    adj: &SparseMatrix,
    dataset: &NodePredDataset,
    loader: &IndexLoader,
    sampler: &NeighborSampler,
    rng: &mut R,
) -> Result<f32> {
    let classes = dataset.num_classes;
    let mut logits = Vec::new();
    let mut labels = Vec::new();

    for seeds in loader.iter() {
        let batch = sampler.sample(adj, &seeds, &mut *rng)?;
        let x = dataset.features.index_select(&batch.input_nodes)?;
        let out = model.forward(&batch.blocks, &x)?;
        logits.extend(out.into_vec());
        labels.extend(dataset.labels_of(&batch.output_nodes));
    }

    let logits = DenseMatrix::new(labels.len(), classes, logits)?;
    accuracy(&logits, &labels, classes)
}

/// Runs full-neighborhood inference over every node and scores the test
/// split. Returns the accuracy together with all logits.
pub fn layerwise_infer(
    model: &Sage,
    adj: &SparseMatrix,
    dataset: &NodePredDataset,
    batch_size: usize,
) -> Result<(f32, DenseMatrix)> {
    let pred = model.inference(adj, &dataset.features, batch_size)?;
    let test = pred.index_select(&dataset.test_idx)?;
    let labels = dataset.labels_of(&dataset.test_idx);
    let acc = accuracy(&test, &labels, dataset.num_classes)?;
    Ok((acc, pred))
}
