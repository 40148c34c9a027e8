use std::{collections::HashSet, path::Path};

use rand::{seq::SliceRandom, Rng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    matrix::DenseMatrix,
    npy::{self, NpyArray},
    sparse::SparseMatrix,
    Error, Result,
};

#[derive(Clone, Debug)]
pub enum FeatureStore {
    InMemory(DenseMatrix),
    OnDisk(NpyArray),
}

impl FeatureStore {
    pub fn num_rows(&self) -> usize {
        match self {
            FeatureStore::InMemory(m) => m.rows(),
            FeatureStore::OnDisk(arr) => arr.num_rows(),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            FeatureStore::InMemory(m) => m.cols(),
            FeatureStore::OnDisk(arr) => arr.feature_dim(),
        }
    }

    pub fn index_select(&self, ids: &[usize]) -> Result<DenseMatrix> {
        match self {
            FeatureStore::InMemory(m) => m.index_select(ids),
            FeatureStore::OnDisk(arr) => arr.index_select(ids),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodePredDataset {
    pub name: String,
    pub features: FeatureStore,
    pub labels: Vec<usize>,
    pub src: Vec<usize>,
    pub dst: Vec<usize>,
    pub num_nodes: usize,
    pub num_classes: usize,
    pub train_idx: Vec<usize>,
    pub val_idx: Vec<usize>,
    pub test_idx: Vec<usize>,
}

impl NodePredDataset {
    /// Checks that every array agrees on the node count and that the
    /// splits and edges only reference existing nodes. Repeated ids in a
    /// split are dropped, keeping the first occurrence.
    pub fn new(
        name: impl Into<String>,
        features: FeatureStore,
        labels: Vec<usize>,
        (src, dst): (Vec<usize>, Vec<usize>),
        (train_idx, val_idx, test_idx): (Vec<usize>, Vec<usize>, Vec<usize>),
    ) -> Result<Self> {
        let num_nodes = features.num_rows();
        if labels.len() != num_nodes {
            return Err(Error::ShapeMismatch(format!(
                "{} labels for {num_nodes} nodes",
                labels.len()
            )));
        }
        if src.len() != dst.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} edge sources but {} destinations",
                src.len(),
                dst.len()
            )));
        }

        for &id in src.iter().chain(&dst).chain(&train_idx).chain(&val_idx).chain(&test_idx) {
            if id >= num_nodes {
                return Err(Error::IndexOutOfBounds {
                    index: id,
                    len: num_nodes,
                });
            }
        }

        let num_classes = labels.iter().max().map_or(0, |&m| m + 1);
        let train_idx = unique_ids("train", train_idx);
        let val_idx = unique_ids("val", val_idx);
        let test_idx = unique_ids("test", test_idx);

        Ok(Self {
            name: name.into(),
            features,
            labels,
            src,
            dst,
            num_nodes,
            num_classes,
            train_idx,
            val_idx,
            test_idx,
        })
    }

    /// Loads `feat.npy`, `label.npy`, `edges.npy`, `train_idx.npy`,
    /// `val_idx.npy` and `test_idx.npy` from `dir`.
    pub fn load_dir(dir: impl AsRef<Path>, on_disk: bool) -> Result<Self> {
        let dir = dir.as_ref();
        let feat_path = dir.join("feat.npy");

        let features = if on_disk {
            FeatureStore::OnDisk(NpyArray::open(&feat_path)?)
        } else {
            FeatureStore::InMemory(npy::read_matrix(&feat_path)?)
        };

        let name = dir
            .file_name()
            .map_or_else(|| String::from("dataset"), |n| n.to_string_lossy().into_owned());

        let dataset = Self::new(
            name,
            features,
            npy::read_indices(dir.join("label.npy"))?,
            npy::read_edges(dir.join("edges.npy"))?,
            (
                npy::read_indices(dir.join("train_idx.npy"))?,
                npy::read_indices(dir.join("val_idx.npy"))?,
                npy::read_indices(dir.join("test_idx.npy"))?,
            ),
        )?;

        info!(
            name = %dataset.name,
            nodes = dataset.num_nodes,
            edges = dataset.src.len(),
            classes = dataset.num_classes,
            on_disk,
            "loaded dataset"
        );

        Ok(dataset)
    }

    /// Planted-partition graph: nodes of the same class link with
    /// probability `homophily`, features are noisy class centroids.
    pub fn synthetic<R: Rng + ?Sized>(cfg: &SyntheticConfig, rng: &mut R) -> Result<Self> {
        if cfg.num_classes == 0 || cfg.num_nodes < cfg.num_classes {
            return Err(Error::InvalidConfig(String::from(
                "synthetic graph needs at least one node per class",
            )));
        }
        if cfg.feat_dim < cfg.num_classes {
            return Err(Error::InvalidConfig(String::from(
                "synthetic features need one dimension per class",
            )));
        }
        let noise = Normal::new(0.0, cfg.noise)
            .map_err(|e| Error::InvalidConfig(format!("feature noise: {e}")))?;

        let n = cfg.num_nodes;
        let labels = (0..n).map(|i| i % cfg.num_classes).collect::<Vec<_>>();

        let mut by_class = vec![Vec::new(); cfg.num_classes];
        for (node, &label) in labels.iter().enumerate() {
            by_class[label].push(node);
        }

        let (mut src, mut dst) = (Vec::new(), Vec::new());
        for (node, &label) in labels.iter().enumerate() {
            for _ in 0..cfg.avg_degree {
                let neighbor = if rng.gen::<f32>() < cfg.homophily {
                    by_class[label][rng.gen_range(0..by_class[label].len())]
                } else {
                    rng.gen_range(0..n)
                };
                if neighbor != node {
                    src.push(neighbor);
                    dst.push(node);
                }
            }
        }

        let features = DenseMatrix::from_fn(n, cfg.feat_dim, |r, c| {
            let centroid = if c % cfg.num_classes == labels[r] { 1.0 } else { 0.0 };
            centroid + noise.sample(&mut *rng) as f32
        });

        let mut order = (0..n).collect::<Vec<_>>();
        order.shuffle(rng);
        let train_end = ((n as f32 * cfg.train_fraction) as usize).min(n);
        let val_end = (train_end + (n as f32 * cfg.val_fraction) as usize).min(n);

        Self::new(
            "synthetic",
            FeatureStore::InMemory(features),
            labels,
            (src, dst),
            (
                order[..train_end].to_vec(),
                order[train_end..val_end].to_vec(),
                order[val_end..].to_vec(),
            ),
        )
    }

    pub fn adjacency(&self) -> Result<SparseMatrix> {
        SparseMatrix::from_edges(self.src.clone(), self.dst.clone(), self.num_nodes)
    }

    pub fn labels_of(&self, ids: &[usize]) -> Vec<usize> {
        ids.iter().map(|&id| self.labels[id]).collect()
    }
}

fn unique_ids(split: &str, ids: Vec<usize>) -> Vec<usize> {
    let mut seen = HashSet::with_capacity(ids.len());
    let total = ids.len();
    let unique = ids.into_iter().filter(|&id| seen.insert(id)).collect::<Vec<_>>();
    if unique.len() != total {
        warn!(split, dropped = total - unique.len(), "repeated node ids in split");
    }
    unique
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub num_nodes: usize,
    pub num_classes: usize,
    pub feat_dim: usize,
    pub avg_degree: usize,
    pub homophily: f32,
    pub noise: f64,
    pub train_fraction: f32,
    pub val_fraction: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_nodes: 10_000,
            num_classes: 8,
            feat_dim: 32,
            avg_degree: 10,
            homophily: 0.8,
            noise: 1.0,
            train_fraction: 0.6,
            val_fraction: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn synthetic_splits_partition_the_nodes() {
        let cfg = SyntheticConfig {
            num_nodes: 100,
            num_classes: 4,
            feat_dim: 8,
            ..Default::default()
        };
        let data = NodePredDataset::synthetic(&cfg, &mut ChaCha8Rng::seed_from_u64(1)).unwrap();

        assert_eq!(data.num_classes, 4);
        assert_eq!(data.features.dim(), 8);
        assert_eq!(data.train_idx.len() + data.val_idx.len() + data.test_idx.len(), 100);

        let mut all = [data.train_idx.clone(), data.val_idx.clone(), data.test_idx.clone()].concat();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
        assert!(data.src.iter().zip(&data.dst).all(|(s, d)| s != d));
    }

    #[test]
    fn rejects_inconsistent_arrays() {
        let features = FeatureStore::InMemory(DenseMatrix::zeros(3, 2));
        let err = NodePredDataset::new(
            "bad",
            features.clone(),
            vec![0, 1],
            (vec![], vec![]),
            (vec![], vec![], vec![]),
        );
        assert!(err.is_err());

        let err = NodePredDataset::new(
            "bad",
            features,
            vec![0, 1, 0],
            (vec![0], vec![3]),
            (vec![], vec![], vec![]),
        );
        assert!(matches!(err, Err(Error::IndexOutOfBounds { index: 3, .. })));
    }

    #[test]
    fn repeated_split_ids_are_dropped_in_order() {
        let features = FeatureStore::InMemory(DenseMatrix::zeros(4, 2));
        let data = NodePredDataset::new(
            "repeats",
            features,
            vec![0, 1, 0, 1],
            (vec![1, 2, 3], vec![0, 0, 1]),
            (vec![0, 0, 1, 0], vec![2, 2], vec![3]),
        )
        .unwrap();

        assert_eq!(data.train_idx, vec![0, 1]);
        assert_eq!(data.val_idx, vec![2]);
        assert_eq!(data.test_idx, vec![3]);

        // The whole split as one batch of seeds must be samplable.
        let adj = data.adjacency().unwrap();
        let sampler = crate::sampler::NeighborSampler::new(vec![2, 2], true);
        let batch = sampler
            .sample(&adj, &data.train_idx, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap();
        assert_eq!(batch.output_nodes, vec![0, 1]);
    }

    #[test]
    fn loads_directory_with_on_disk_features() {
        let dir = tempfile::tempdir().unwrap();
        let feat = DenseMatrix::from_fn(4, 3, |r, c| (r + c) as f32);
        npy::write_matrix(dir.path().join("feat.npy"), &feat).unwrap();
        npy::write_indices(dir.path().join("label.npy"), &[0, 1, 2, 1], &[4]).unwrap();
        npy::write_indices(dir.path().join("edges.npy"), &[0, 1, 2, 1, 2, 3], &[2, 3]).unwrap();
        npy::write_indices(dir.path().join("train_idx.npy"), &[0, 1], &[2]).unwrap();
        npy::write_indices(dir.path().join("val_idx.npy"), &[2], &[1]).unwrap();
        npy::write_indices(dir.path().join("test_idx.npy"), &[3], &[1]).unwrap();

        let data = NodePredDataset::load_dir(dir.path(), true).unwrap();
        assert!(matches!(data.features, FeatureStore::OnDisk(_)));
        assert_eq!(data.num_classes, 3);
        assert_eq!(data.features.index_select(&[3]).unwrap().as_slice(), feat.row(3));
        assert_eq!(data.adjacency().unwrap().column_sums(), vec![0.0, 1.0, 1.0, 1.0]);
    }
}
