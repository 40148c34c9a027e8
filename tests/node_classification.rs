//! End-to-end runs of the training pipeline on small graphs.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sparse_sage::{
    config::Config,
    dataset::{FeatureStore, NodePredDataset, SyntheticConfig},
    nn::Sage,
    npy,
    train::{layerwise_infer, train},
};

fn small_config() -> Config {
    let mut cfg = Config::default();
    cfg.seed = 3;
    cfg.model.hidden_size = 16;
    cfg.model.num_layers = 2;
    cfg.train.fanouts = vec![5, 5];
    cfg.train.epochs = 20;
    cfg.train.batch_size = 64;
    cfg.train.progress = false;
    cfg.train.optimizer.lr = 1e-2;
    cfg.inference.batch_size = 100;
    cfg.synthetic = SyntheticConfig {
        num_nodes: 300,
        num_classes: 3,
        feat_dim: 6,
        avg_degree: 5,
        homophily: 0.9,
        noise: 0.3,
        ..Default::default()
    };
    cfg
}

#[test]
fn learns_a_separable_synthetic_graph() {
    let cfg = small_config();
    cfg.validate().unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let dataset = NodePredDataset::synthetic(&cfg.synthetic, &mut rng).unwrap();
    let adj = dataset.adjacency().unwrap();

    let mut model = Sage::new(
        dataset.features.dim(),
        cfg.model.hidden_size,
        dataset.num_classes,
        cfg.model.num_layers,
        cfg.model.dropout,
        &mut rng,
    )
    .unwrap();

    let history = train(&cfg, &adj, &dataset, &mut model, &mut rng).unwrap();
    assert_eq!(history.len(), cfg.train.epochs);
    let first = history.first().unwrap();
    let last = history.last().unwrap();
    assert!(last.loss < first.loss, "loss {} -> {}", first.loss, last.loss);

    let (acc, logits) = layerwise_infer(&model, &adj, &dataset, cfg.inference.batch_size).unwrap();
    assert_eq!(logits.shape(), (300, 3));
    assert!(acc > 0.7, "test accuracy {acc}");
}

#[test]
fn on_disk_features_match_in_memory_inference() {
    let cfg = small_config();
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let generated = NodePredDataset::synthetic(&cfg.synthetic, &mut rng).unwrap();
    let FeatureStore::InMemory(feat) = &generated.features else {
        panic!("synthetic features live in memory");
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path();
    npy::write_matrix(path.join("feat.npy"), feat).unwrap();

    let as_i64 = |ids: &[usize]| ids.iter().map(|&i| i as i64).collect::<Vec<_>>();
    let labels = as_i64(&generated.labels);
    npy::write_indices(path.join("label.npy"), &labels, &[labels.len()]).unwrap();
    let edges = [as_i64(&generated.src), as_i64(&generated.dst)].concat();
    npy::write_indices(path.join("edges.npy"), &edges, &[2, generated.src.len()]).unwrap();
    for (name, ids) in [
        ("train_idx.npy", &generated.train_idx),
        ("val_idx.npy", &generated.val_idx),
        ("test_idx.npy", &generated.test_idx),
    ] {
        npy::write_indices(path.join(name), &as_i64(ids), &[ids.len()]).unwrap();
    }

    let in_memory = NodePredDataset::load_dir(path, false).unwrap();
    let on_disk = NodePredDataset::load_dir(path, true).unwrap();
    assert!(matches!(on_disk.features, FeatureStore::OnDisk(_)));
    assert_eq!(on_disk.num_classes, generated.num_classes);
    assert_eq!(on_disk.test_idx, generated.test_idx);

    let adj = in_memory.adjacency().unwrap();
    let model = Sage::new(6, 8, 3, 2, 0.5, &mut rng).unwrap();
    let (acc_mem, logits_mem) = layerwise_infer(&model, &adj, &in_memory, 128).unwrap();
    let (acc_disk, logits_disk) = layerwise_infer(&model, &adj, &on_disk, 128).unwrap();

    assert_eq!(acc_mem, acc_disk);
    for (a, b) in logits_mem.as_slice().iter().zip(logits_disk.as_slice()) {
        assert!((a - b).abs() < 1e-5);
    }
}
