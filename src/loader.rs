use rand::{seq::SliceRandom, Rng};

use crate::{Error, Result};

/// Splits a list of node ids into fixed-size batches, optionally in a
/// fresh random order each epoch. The last batch may be short.
#[derive(Clone, Debug)]
pub struct IndexLoader {
    ids: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
}

impl IndexLoader {
    pub fn new(ids: Vec<usize>, batch_size: usize, shuffle: bool) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig(String::from("batch size must be positive")));
        }
        Ok(Self {
            ids,
            batch_size,
            shuffle,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.ids.len().div_ceil(self.batch_size)
    }

    /// Batches in the stored order, ignoring `shuffle`.
    pub fn iter(&self) -> Batches {
        Batches {
            order: self.ids.clone(),
            batch_size: self.batch_size,
            pos: 0,
        }
    }

    pub fn epoch<R: Rng + ?Sized>(&self, rng: &mut R) -> Batches {
        let mut order = self.ids.clone();
        if self.shuffle {
            order.shuffle(rng);
        }
        Batches {
            order,
            batch_size: self.batch_size,
            pos: 0,
        }
    }
}

#[derive(Debug)]
pub struct Batches {
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl Iterator for Batches {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let batch = self.order[self.pos..end].to_vec();
        self.pos = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.pos).div_ceil(self.batch_size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Batches {}
