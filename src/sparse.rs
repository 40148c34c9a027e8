//! Coordinate-format sparse matrices.
//!
//! The GraphSAGE pipeline only needs a handful of primitives on the
//! adjacency matrix: duplicate removal, degree reductions, diagonal
//! scaling, sparse-dense products, and the two sampling primitives
//! [`SparseMatrix::sample`] and [`SparseMatrix::compact`].
//!
//! An entry `(u, v)` of an adjacency matrix is the edge `u -> v`, so the
//! column of a node holds its in-neighbours.

use std::{collections::HashMap, sync::OnceLock};

use rand::{seq::SliceRandom, Rng};

use crate::{matrix::DenseMatrix, Error, Result};

/// Which axis a set of ids indexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dim {
    Row,
    Column,
}

/// Compressed index over one axis: `entries[indptr[i]..indptr[i + 1]]`
/// are the coordinate positions of line `i`.
#[derive(Clone, Debug, Default)]
struct Compressed {
    indptr: Vec<usize>,
    entries: Vec<usize>,
}

impl Compressed {
    fn build(keys: &[usize], len: usize) -> Self {
        let mut indptr = vec![0; len + 1];
        for &k in keys {
            indptr[k + 1] += 1;
        }
        for i in 0..len {
            indptr[i + 1] += indptr[i];
        }

        let mut cursor = indptr.clone();
        let mut entries = vec![0; keys.len()];
        for (pos, &k) in keys.iter().enumerate() {
            entries[cursor[k]] = pos;
            cursor[k] += 1;
        }

        Self { indptr, entries }
    }

    fn line(&self, i: usize) -> &[usize] {
        &self.entries[self.indptr[i]..self.indptr[i + 1]]
    }
}

#[derive(Clone, Debug, Default)]
pub struct SparseMatrix {
    shape: (usize, usize),
    rows: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f32>,
    csr: OnceLock<Compressed>,
    csc: OnceLock<Compressed>,
}

impl SparseMatrix {
    /// Creates a matrix from coordinates; missing values default to one.
    pub fn new(
        rows: Vec<usize>,
        cols: Vec<usize>,
        vals: Option<Vec<f32>>,
        shape: (usize, usize),
    ) -> Result<Self> {
        if rows.len() != cols.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} row indices but {} column indices",
                rows.len(),
                cols.len()
            )));
        }
        let vals = vals.unwrap_or_else(|| vec![1.0; rows.len()]);
        if vals.len() != rows.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} values for {} entries",
                vals.len(),
                rows.len()
            )));
        }
        if let Some(&r) = rows.iter().find(|&&r| r >= shape.0) {
            return Err(Error::IndexOutOfBounds {
                index: r,
                len: shape.0,
            });
        }
        if let Some(&c) = cols.iter().find(|&&c| c >= shape.1) {
            return Err(Error::IndexOutOfBounds {
                index: c,
                len: shape.1,
            });
        }

        Ok(Self::from_parts(shape, rows, cols, vals))
    }

    fn from_parts(shape: (usize, usize), rows: Vec<usize>, cols: Vec<usize>, vals: Vec<f32>) -> Self {
        Self {
            shape,
            rows,
            cols,
            vals,
            csr: OnceLock::new(),
            csc: OnceLock::new(),
        }
    }

    /// Square adjacency matrix of a graph with `num_nodes` nodes.
    pub fn from_edges(src: Vec<usize>, dst: Vec<usize>, num_nodes: usize) -> Result<Self> {
        Self::new(src, dst, None, (num_nodes, num_nodes))
    }

    pub fn empty(shape: (usize, usize)) -> Self {
        Self::from_parts(shape, Vec::new(), Vec::new(), Vec::new())
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn nnz(&self) -> usize {
        self.vals.len()
    }

    pub fn row_indices(&self) -> &[usize] {
        &self.rows
    }

    pub fn col_indices(&self) -> &[usize] {
        &self.cols
    }

    pub fn values(&self) -> &[f32] {
        &self.vals
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        self.rows
            .iter()
            .zip(&self.cols)
            .zip(&self.vals)
            .map(|((&r, &c), &v)| (r, c, v))
    }

    fn csr(&self) -> &Compressed {
        self.csr.get_or_init(|| Compressed::build(&self.rows, self.shape.0))
    }

    fn csc(&self) -> &Compressed {
        self.csc.get_or_init(|| Compressed::build(&self.cols, self.shape.1))
    }

    fn index(&self, dim: Dim) -> &Compressed {
        match dim {
            Dim::Row => self.csr(),
            Dim::Column => self.csc(),
        }
    }

    /// Sorts entries by `(row, col)` and sums duplicates.
    pub fn coalesce(&self) -> Self {
        let mut order = (0..self.nnz()).collect::<Vec<_>>();
        order.sort_unstable_by_key(|&i| (self.rows[i], self.cols[i]));

        let mut rows = Vec::with_capacity(order.len());
        let mut cols = Vec::with_capacity(order.len());
        let mut vals: Vec<f32> = Vec::with_capacity(order.len());

        for i in order {
            let (r, c, v) = (self.rows[i], self.cols[i], self.vals[i]);
            if rows.last() == Some(&r) && cols.last() == Some(&c) {
                if let Some(last) = vals.last_mut() {
                    *last += v;
                }
            } else {
                rows.push(r);
                cols.push(c);
                vals.push(v);
            }
        }

        Self::from_parts(self.shape, rows, cols, vals)
    }

    /// Sum over the rows, one value per column (`A.sum(0)`).
    pub fn column_sums(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.shape.1];
        for (_, c, v) in self.entries() {
            sums[c] += v;
        }
        sums
    }

    /// Sum over the columns, one value per row (`A.sum(1)`).
    pub fn row_sums(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.shape.0];
        for (r, _, v) in self.entries() {
            sums[r] += v;
        }
        sums
    }

    /// `A @ D`: scales column `j` by `d[j]`.
    pub fn matmul_diag(&self, diag: &DiagMatrix) -> Result<Self> {
        if diag.len() != self.shape.1 {
            return Err(Error::ShapeMismatch(format!(
                "cannot multiply {:?} sparse matrix by {}x{} diagonal",
                self.shape,
                diag.len(),
                diag.len()
            )));
        }
        let vals = self
            .cols
            .iter()
            .zip(&self.vals)
            .map(|(&c, &v)| v * diag.0[c])
            .collect();
        Ok(Self::from_parts(self.shape, self.rows.clone(), self.cols.clone(), vals))
    }

    pub fn transpose(&self) -> Self {
        Self::from_parts(
            (self.shape.1, self.shape.0),
            self.cols.clone(),
            self.rows.clone(),
            self.vals.clone(),
        )
    }

    /// `A · X`
    pub fn spmm(&self, x: &DenseMatrix) -> Result<DenseMatrix> {
        if x.rows() != self.shape.1 {
            return Err(Error::ShapeMismatch(format!(
                "cannot multiply {:?} sparse matrix by {:?} dense matrix",
                self.shape,
                x.shape()
            )));
        }
        let mut out = DenseMatrix::zeros(self.shape.0, x.cols());
        self.spmm_acc(x, &mut out);
        Ok(out)
    }

    /// `Aᵀ · X`
    pub fn transpose_spmm(&self, x: &DenseMatrix) -> Result<DenseMatrix> {
        if x.rows() != self.shape.0 {
            return Err(Error::ShapeMismatch(format!(
                "cannot multiply transposed {:?} sparse matrix by {:?} dense matrix",
                self.shape,
                x.shape()
            )));
        }
        let mut out = DenseMatrix::zeros(self.shape.1, x.cols());
        self.transpose_spmm_acc(x, &mut out);
        Ok(out)
    }

    pub(crate) fn spmm_acc(&self, x: &DenseMatrix, out: &mut DenseMatrix) {
        for (r, c, v) in self.entries() {
            let src = x.row(c);
            for (o, &s) in out.row_mut(r).iter_mut().zip(src) {
                *o += v * s;
            }
        }
    }

    pub(crate) fn transpose_spmm_acc(&self, x: &DenseMatrix, out: &mut DenseMatrix) {
        for (r, c, v) in self.entries() {
            let src = x.row(r);
            for (o, &s) in out.row_mut(c).iter_mut().zip(src) {
                *o += v * s;
            }
        }
    }

    fn check_ids(&self, dim: Dim, ids: &[usize]) -> Result<()> {
        let len = match dim {
            Dim::Row => self.shape.0,
            Dim::Column => self.shape.1,
        };
        match ids.iter().find(|&&id| id >= len) {
            Some(&index) => Err(Error::IndexOutOfBounds { index, len }),
            None => Ok(()),
        }
    }

    /// Builds the matrix made of the chosen coordinate positions, with
    /// line `i` of `dim` relabeled to `i`.
    fn gather(&self, dim: Dim, picks: Vec<(usize, usize)>, num_lines: usize) -> Self {
        let mut rows = Vec::with_capacity(picks.len());
        let mut cols = Vec::with_capacity(picks.len());
        let mut vals = Vec::with_capacity(picks.len());

        for (line, pos) in picks {
            match dim {
                Dim::Row => {
                    rows.push(line);
                    cols.push(self.cols[pos]);
                }
                Dim::Column => {
                    rows.push(self.rows[pos]);
                    cols.push(line);
                }
            }
            vals.push(self.vals[pos]);
        }

        let shape = match dim {
            Dim::Row => (num_lines, self.shape.1),
            Dim::Column => (self.shape.0, num_lines),
        };
        Self::from_parts(shape, rows, cols, vals)
    }

    /// Keeps every entry of the chosen rows or columns.
    ///
    /// Line `i` of the result is line `ids[i]` of `self`.
    pub fn select(&self, dim: Dim, ids: &[usize]) -> Result<Self> {
        self.check_ids(dim, ids)?;
        let index = self.index(dim);

        let picks = ids
            .iter()
            .enumerate()
            .flat_map(|(line, &id)| index.line(id).iter().map(move |&pos| (line, pos)))
            .collect();

        Ok(self.gather(dim, picks, ids.len()))
    }

    /// Samples up to `fanout` entries from each chosen row or column.
    ///
    /// With replacement, a non-empty line contributes exactly `fanout`
    /// entries. Without replacement, lines with at most `fanout` entries
    /// are kept whole.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        dim: Dim,
        fanout: usize,
        ids: &[usize],
        replace: bool,
        rng: &mut R,
    ) -> Result<Self> {
        self.check_ids(dim, ids)?;
        let index = self.index(dim);

        let mut picks = Vec::with_capacity(ids.len() * fanout);
        for (line, &id) in ids.iter().enumerate() {
            let candidates = index.line(id);
            if candidates.is_empty() {
                continue;
            }

            if replace {
                for _ in 0..fanout {
                    picks.push((line, candidates[rng.gen_range(0..candidates.len())]));
                }
            } else if candidates.len() <= fanout {
                picks.extend(candidates.iter().map(|&pos| (line, pos)));
            } else {
                picks.extend(
                    candidates
                        .choose_multiple(&mut *rng, fanout)
                        .map(|&pos| (line, pos)),
                );
            }
        }

        Ok(self.gather(dim, picks, ids.len()))
    }

    /// Removes empty rows or columns and relabels the survivors.
    ///
    /// `leading` ids are kept first, in the given order, even when empty;
    /// the remaining non-empty ids follow in ascending order. Returns the
    /// compacted matrix and the original id of every new position.
    pub fn compact(&self, dim: Dim, leading: &[usize]) -> Result<(Self, Vec<usize>)> {
        self.check_ids(dim, leading)?;

        let mut mapping = leading.to_vec();
        let mut position = HashMap::with_capacity(leading.len());
        for (i, &id) in leading.iter().enumerate() {
            if position.insert(id, i).is_some() {
                return Err(Error::InvalidGraph(format!(
                    "leading id {id} appears more than once"
                )));
            }
        }

        let keys = match dim {
            Dim::Row => &self.rows,
            Dim::Column => &self.cols,
        };

        let mut rest = keys
            .iter()
            .copied()
            .filter(|id| !position.contains_key(id))
            .collect::<Vec<_>>();
        rest.sort_unstable();
        rest.dedup();

        for id in rest {
            position.insert(id, mapping.len());
            mapping.push(id);
        }

        let relabeled = keys.iter().map(|id| position[id]).collect::<Vec<_>>();
        let (shape, rows, cols) = match dim {
            Dim::Row => ((mapping.len(), self.shape.1), relabeled, self.cols.clone()),
            Dim::Column => ((self.shape.0, mapping.len()), self.rows.clone(), relabeled),
        };

        Ok((
            Self::from_parts(shape, rows, cols, self.vals.clone()),
            mapping,
        ))
    }

    pub fn to_dense(&self) -> DenseMatrix {
        let mut dense = DenseMatrix::zeros(self.shape.0, self.shape.1);
        for (r, c, v) in self.entries() {
            dense.as_mut_slice()[r * self.shape.1 + c] += v;
        }
        dense
    }
}

/// Diagonal matrix stored as its diagonal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiagMatrix(Vec<f32>);

impl DiagMatrix {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn diagonal(&self) -> &[f32] {
        &self.0
    }

    /// Elementwise reciprocal; zero entries stay zero.
    pub fn inverse(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|&d| if d == 0.0 { 0.0 } else { d.recip() })
                .collect(),
        )
    }
}

impl From<Vec<f32>> for DiagMatrix {
    fn from(diag: Vec<f32>) -> Self {
        Self(diag)
    }
}
