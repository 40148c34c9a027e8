use rayon::prelude::*;

use crate::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl DenseMatrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::ShapeMismatch(format!(
                "{rows}x{cols} matrix needs {} values, got {}",
                rows * cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [f32] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn fill(&mut self, val: f32) {
        self.data.fill(val);
    }

    pub fn index_select(&self, ids: &[usize]) -> Result<Self> {
        let mut data = Vec::with_capacity(ids.len() * self.cols);
        for &id in ids {
            if id >= self.rows {
                return Err(Error::IndexOutOfBounds {
                    index: id,
                    len: self.rows,
                });
            }
            data.extend_from_slice(self.row(id));
        }
        Ok(Self {
            rows: ids.len(),
            cols: self.cols,
            data,
        })
    }

    /// Writes row `i` of `src` into row `ids[i]` of `self`.
    pub fn scatter_rows(&mut self, ids: &[usize], src: &DenseMatrix) -> Result<()> {
        if src.rows != ids.len() || src.cols != self.cols {
            return Err(Error::ShapeMismatch(format!(
                "cannot scatter {}x{} into {} rows of width {}",
                src.rows,
                src.cols,
                ids.len(),
                self.cols
            )));
        }
        for (i, &id) in ids.iter().enumerate() {
            if id >= self.rows {
                return Err(Error::IndexOutOfBounds {
                    index: id,
                    len: self.rows,
                });
            }
            self.row_mut(id).copy_from_slice(src.row(i));
        }
        Ok(())
    }

    pub fn argmax_rows(&self) -> Vec<usize> {
        (0..self.rows)
            .map(|r| {
                self.row(r)
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }

    pub fn add_assign(&mut self, other: &DenseMatrix) {
        debug_assert_eq!(self.shape(), other.shape());
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }
}

/// `out += a · b`
pub fn matmul_acc(a: &DenseMatrix, b: &DenseMatrix, out: &mut DenseMatrix) {
    debug_assert_eq!(a.cols, b.rows);
    debug_assert_eq!(out.shape(), (a.rows, b.cols));
    let n = b.cols;
    if n == 0 {
        return;
    }

    out.data
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, out_row)| {
            for (k, &aik) in a.row(i).iter().enumerate() {
                if aik == 0.0 {
                    continue;
                }
                for (o, &bkj) in out_row.iter_mut().zip(b.row(k)) {
                    *o += aik * bkj;
                }
            }
        });
}

/// `out += a · bᵀ`
pub fn matmul_nt_acc(a: &DenseMatrix, b: &DenseMatrix, out: &mut DenseMatrix) {
    debug_assert_eq!(a.cols, b.cols);
    debug_assert_eq!(out.shape(), (a.rows, b.rows));
    let n = b.rows;
    if n == 0 {
        return;
    }

    out.data
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, out_row)| {
            let a_row = a.row(i);
            for (j, o) in out_row.iter_mut().enumerate() {
                *o += a_row.iter().zip(b.row(j)).map(|(x, y)| x * y).sum::<f32>();
            }
        });
}

/// `out += aᵀ · b`
pub fn matmul_tn_acc(a: &DenseMatrix, b: &DenseMatrix, out: &mut DenseMatrix) {
    debug_assert_eq!(a.rows, b.rows);
    debug_assert_eq!(out.shape(), (a.cols, b.cols));
    let n = b.cols;
    if n == 0 {
        return;
    }

    out.data
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(k, out_row)| {
            for i in 0..a.rows {
                let aik = a.get(i, k);
                if aik == 0.0 {
                    continue;
                }
                for (o, &bij) in out_row.iter_mut().zip(b.row(i)) {
                    *o += aik * bij;
                }
            }
        });
}
