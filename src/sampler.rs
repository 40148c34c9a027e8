use rand::Rng;

use crate::{
    sparse::{Dim, SparseMatrix},
    Result,
};

/// The sampled computation graph of one mini-batch.
#[derive(Clone, Debug)]
pub struct SampledBatch {
    /// One `src x dst` block per layer, input layer first.
    pub blocks: Vec<SparseMatrix>,
    /// Nodes whose features feed the first block.
    pub input_nodes: Vec<usize>,
    /// The seed nodes the last block produces outputs for.
    pub output_nodes: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct NeighborSampler {
    fanouts: Vec<usize>,
    replace: bool,
}

impl NeighborSampler {
    pub fn new(fanouts: Vec<usize>, replace: bool) -> Self {
        Self { fanouts, replace }
    }

    /// Walks outward from `seeds`, one hop per fanout.
    ///
    /// Every hop samples in-neighbors of the current frontier and compacts
    /// rows with the frontier as leading ids, so the first `dst` rows of
    /// each block are its destination nodes.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        adj: &SparseMatrix,
        seeds: &[usize],
        rng: &mut R,
    ) -> Result<SampledBatch> {
        let mut frontier = seeds.to_vec();
        let mut blocks = Vec::with_capacity(self.fanouts.len());

        for &fanout in &self.fanouts {
            let mat = adj.sample(Dim::Column, fanout, &frontier, self.replace, &mut *rng)?;
            let (block, src) = mat.compact(Dim::Row, &frontier)?;
            blocks.push(block);
            frontier = src;
        }

        blocks.reverse();

        Ok(SampledBatch {
            blocks,
            input_nodes: frontier,
            output_nodes: seeds.to_vec(),
        })
    }
}

/// All in-neighbors of `dst`, compacted with `dst` leading.
pub fn full_neighbor_block(adj: &SparseMatrix, dst: &[usize]) -> Result<(SparseMatrix, Vec<usize>)> {
    adj.select(Dim::Column, dst)?.compact(Dim::Row, dst)
}
