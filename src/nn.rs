//! GraphSAGE with mean aggregation.
//!
//! A [`SageConv`] layer consumes a sparse `src x dst` block whose first
//! `dst` source rows are the destination nodes themselves:
//!
//! ```text
//! h_dst = fc_self(x[..dst]) + D⁻¹ Aᵀ fc_neigh(x)
//! ```
//!
//! where `D` holds the (multiplicity-weighted) in-degree of every
//! destination. [`Sage`] stacks these layers with ReLU and dropout in
//! between and owns the trainable parameters.

use std::collections::BTreeMap;

use rand::{distributions::Uniform, Rng};
use tracing::debug;

use crate::{
    cpu::{CpuContext, CpuTensor, Shape},
    dataset::FeatureStore,
    loader::IndexLoader,
    matrix::DenseMatrix,
    ops::Operation,
    optim::ParamStore,
    sampler::full_neighbor_block,
    sparse::{DiagMatrix, SparseMatrix},
    Error, Graph, GraphBuilder, Node, Result,
};

#[derive(Clone, Debug)]
pub struct SageConv {
    prefix: String,
    in_feats: usize,
    out_feats: usize,
}

impl SageConv {
    pub fn new(prefix: impl Into<String>, in_feats: usize, out_feats: usize) -> Self {
        Self {
            prefix: prefix.into(),
            in_feats,
            out_feats,
        }
    }

    pub fn out_feats(&self) -> usize {
        self.out_feats
    }

    fn param_id(&self, name: &str) -> String {
        format!("{}.{name}", self.prefix)
    }

    /// Xavier-uniform weights scaled for ReLU, biases uniform in
    /// `±1/sqrt(in_feats)`.
    pub fn reset_parameters<R: Rng + ?Sized>(&self, params: &mut ParamStore, rng: &mut R) {
        let gain = 2f32.sqrt();
        let bound = gain * (6.0 / (self.in_feats + self.out_feats) as f32).sqrt();
        let xavier = Uniform::new_inclusive(-bound, bound);

        for name in ["fc_neigh.weight", "fc_self.weight"] {
            let w = DenseMatrix::from_fn(self.in_feats, self.out_feats, |_, _| rng.sample(&xavier));
            params.insert(self.param_id(name), w);
        }

        let bound = (self.in_feats as f32).sqrt().recip();
        let bias = Uniform::new_inclusive(-bound, bound);
        let b = DenseMatrix::from_fn(1, self.out_feats, |_, _| rng.sample(&bias));
        params.insert(self.param_id("fc_self.bias"), b);
    }

    /// Removes duplicate entries and divides every column by its degree.
    pub fn aggregation_matrix(block: &SparseMatrix) -> Result<SparseMatrix> {
        let a = block.coalesce();
        let d_hat = DiagMatrix::from(a.column_sums()).inverse();
        a.matmul_diag(&d_hat)
    }

    pub fn build(&self, graph: &mut GraphBuilder<CpuTensor>, block: Node, feat: Node) -> Result<Node> {
        let weights = Shape::Dense(self.in_feats, self.out_feats);
        let fc_neigh = graph.create_weights(&self.param_id("fc_neigh.weight"), weights)?;
        let fc_self = graph.create_weights(&self.param_id("fc_self.weight"), weights)?;
        let bias = graph.create_weights(&self.param_id("fc_self.bias"), Shape::Dense(1, self.out_feats))?;

        let src = Operation::matmul(graph, feat, fc_neigh)?;
        let neigh = Operation::aggregate_neighbors(graph, block, src)?;

        let dst = Operation::dst_rows(graph, block, feat)?;
        let own = Operation::matmul(graph, dst, fc_self)?;
        let own = Operation::add_bias(graph, own, bias)?;

        Operation::add(graph, own, neigh)
    }
}

#[derive(Clone, Debug)]
pub struct Sage {
    layers: Vec<SageConv>,
    dropout: f32,
    params: ParamStore,
}

impl Sage {
    /// `num_layers` layers: `in -> hid`, `hid -> hid`, ..., `hid -> out`.
    pub fn new<R: Rng + ?Sized>(
        in_size: usize,
        hid_size: usize,
        out_size: usize,
        num_layers: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self> {
        if num_layers == 0 {
            return Err(Error::InvalidConfig(String::from("model needs at least one layer")));
        }
        if in_size == 0 || hid_size == 0 || out_size == 0 {
            return Err(Error::InvalidConfig(format!(
                "layer sizes must be positive, got {in_size}/{hid_size}/{out_size}"
            )));
        }
        if !(0.0..1.0).contains(&dropout) {
            return Err(Error::InvalidConfig(format!("dropout {dropout} outside [0, 1)")));
        }

        let layers = (0..num_layers)
            .map(|l| {
                let in_feats = if l == 0 { in_size } else { hid_size };
                let out_feats = if l == num_layers - 1 { out_size } else { hid_size };
                SageConv::new(format!("layers.{l}"), in_feats, out_feats)
            })
            .collect::<Vec<_>>();

        let mut params = ParamStore::default();
        for layer in &layers {
            layer.reset_parameters(&mut params, rng);
        }

        Ok(Self {
            layers,
            dropout,
            params,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn out_size(&self) -> usize {
        self.layers.last().map_or(0, SageConv::out_feats)
    }

    pub fn dropout(&self) -> f32 {
        self.dropout
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// Wires layers `first..first + blocks.len()` on top of input `x`.
    fn build_layers(
        &self,
        graph: &mut GraphBuilder<CpuTensor>,
        first: usize,
        x: Shape,
        blocks: &[&SparseMatrix],
    ) -> Result<Node> {
        let mut hidden = graph.create_input("x", x)?;

        for (i, block) in blocks.iter().enumerate() {
            let l = first + i;
            let layer = self.layers.get(l).ok_or_else(|| {
                Error::InvalidGraph(format!("model has no layer {l}"))
            })?;
            let (src, dst) = block.shape();
            let block = graph.create_input(&format!("block{i}"), Shape::Sparse(src, dst))?;

            hidden = layer.build(graph, block, hidden)?;
            if l != self.layers.len() - 1 {
                hidden = Operation::relu(graph, hidden)?;
                hidden = Operation::dropout(graph, hidden)?;
            }
        }

        Ok(hidden)
    }

    fn load_graph(
        &self,
        mut graph: Graph<CpuTensor>,
        blocks: &[&SparseMatrix],
        x: &DenseMatrix,
    ) -> Result<Graph<CpuTensor>> {
        graph.store_input("x", &CpuTensor::from(x.clone()))?;
        for (i, block) in blocks.iter().enumerate() {
            let normalised = SageConv::aggregation_matrix(block)?;
            graph.store_input(&format!("block{i}"), &CpuTensor::from(normalised))?;
        }
        for id in graph.weight_ids() {
            let value = self
                .params
                .get(&id)
                .ok_or_else(|| Error::UnknownNode(id.clone()))?;
            graph.store_weights(&id, &CpuTensor::from(value.clone()))?;
        }
        Ok(graph)
    }

    fn run_layers(
        &self,
        first: usize,
        blocks: &[&SparseMatrix],
        x: &DenseMatrix,
        ctx: CpuContext,
    ) -> Result<DenseMatrix> {
        let mut builder = GraphBuilder::default();
        self.build_layers(&mut builder, first, Shape::Dense(x.rows(), x.cols()), blocks)?;

        let mut graph = self.load_graph(builder.build(ctx)?, blocks, x)?;
        graph.forward();
        let out = graph.output().dense().clone();
        Ok(out)
    }

    /// Logits for the destination nodes of the last block.
    pub fn forward(&self, blocks: &[SparseMatrix], x: &DenseMatrix) -> Result<DenseMatrix> {
        self.check_depth(blocks)?;
        let blocks = blocks.iter().collect::<Vec<_>>();
        self.run_layers(0, &blocks, x, CpuContext::eval())
    }

    fn check_depth(&self, blocks: &[SparseMatrix]) -> Result<()> {
        if blocks.len() != self.layers.len() {
            return Err(Error::InvalidGraph(format!(
                "{} blocks for a {}-layer model",
                blocks.len(),
                self.layers.len()
            )));
        }
        Ok(())
    }

    /// Forward and backward pass of one mini-batch; returns the mean
    /// cross-entropy loss and the gradient of every parameter.
    pub fn train_step(
        &self,
        blocks: &[SparseMatrix],
        x: &DenseMatrix,
        labels: &[usize],
        ctx: CpuContext,
    ) -> Result<(f32, BTreeMap<String, DenseMatrix>)> {
        self.check_depth(blocks)?;
        let classes = self.out_size();
        if let Some(&label) = labels.iter().find(|&&l| l >= classes) {
            return Err(Error::IndexOutOfBounds {
                index: label,
                len: classes,
            });
        }

        let blocks = blocks.iter().collect::<Vec<_>>();
        let mut builder = GraphBuilder::default();
        let logits = self.build_layers(&mut builder, 0, Shape::Dense(x.rows(), x.cols()), &blocks)?;
        let targets = builder.create_input("labels", Shape::Dense(labels.len(), 1))?;
        Operation::cross_entropy(&mut builder, logits, targets)?;

        let mut graph = self.load_graph(builder.build(ctx)?, &blocks, x)?;
        let targets = DenseMatrix::new(
            labels.len(),
            1,
            labels.iter().map(|&l| l as f32).collect(),
        )?;
        graph.store_input("labels", &CpuTensor::from(targets))?;

        let loss = graph
            .forward()
            .ok_or_else(|| Error::InvalidGraph(String::from("loss is not a scalar")))?;
        graph.zero_grads();
        graph.backward();

        let mut grads = BTreeMap::new();
        for id in graph.weight_ids() {
            if let Some(grad) = graph.get_weights(&id).and_then(|w| w.grad().cloned()) {
                grads.insert(id, grad);
            }
        }

        Ok((loss, grads))
    }

    /// Embeddings of every node, computed one layer at a time over full
    /// neighborhoods so no sampling noise enters the result.
    pub fn inference(
        &self,
        adj: &SparseMatrix,
        features: &FeatureStore,
        batch_size: usize,
    ) -> Result<DenseMatrix> {
        let num_nodes = adj.shape().1;
        if features.num_rows() != num_nodes {
            return Err(Error::ShapeMismatch(format!(
                "{} feature rows for {num_nodes} nodes",
                features.num_rows()
            )));
        }

        let loader = IndexLoader::new((0..num_nodes).collect(), batch_size, false)?;
        let mut feat: Option<DenseMatrix> = None;

        for (l, layer) in self.layers.iter().enumerate() {
            let mut y = DenseMatrix::zeros(num_nodes, layer.out_feats());

            for dst in loader.iter() {
                let (block, src) = full_neighbor_block(adj, &dst)?;
                let x = match &feat {
                    Some(f) => f.index_select(&src)?,
                    None => features.index_select(&src)?,
                };
                let h = self.run_layers(l, &[&block], &x, CpuContext::eval())?;
                y.scatter_rows(&dst, &h)?;
            }

            debug!(layer = l, dim = layer.out_feats(), "layer-wise inference done");
            feat = Some(y);
        }

        feat.ok_or_else(|| Error::InvalidGraph(String::from("model has no layers")))
    }
}
