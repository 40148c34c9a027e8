use std::cell::RefCell;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{matrix::DenseMatrix, sparse::SparseMatrix, Tensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    Dense(usize, usize),
    Sparse(usize, usize),
}

impl Shape {
    pub fn rows(&self) -> usize {
        match *self {
            Shape::Dense(rows, _) | Shape::Sparse(rows, _) => rows,
        }
    }

    pub fn cols(&self) -> usize {
        match *self {
            Shape::Dense(_, cols) | Shape::Sparse(_, cols) => cols,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Storage {
    Dense(DenseMatrix),
    Sparse(SparseMatrix),
}

impl Default for Storage {
    fn default() -> Self {
        Storage::Dense(DenseMatrix::default())
    }
}

/// Dense tensors may carry a gradient, sparse tensors never do.
/// `saved` holds whatever the producing operation needs on backprop.
#[derive(Clone, Debug, Default)]
pub struct CpuTensor {
    storage: Storage,
    grad: Option<DenseMatrix>,
    pub(crate) saved: Vec<f32>,
}

impl CpuTensor {
    pub fn dense(&self) -> &DenseMatrix {
        match &self.storage {
            Storage::Dense(m) => m,
            Storage::Sparse(_) => panic!("expected a dense tensor"),
        }
    }

    pub(crate) fn dense_mut(&mut self) -> &mut DenseMatrix {
        match &mut self.storage {
            Storage::Dense(m) => m,
            Storage::Sparse(_) => panic!("expected a dense tensor"),
        }
    }

    pub fn sparse(&self) -> &SparseMatrix {
        match &self.storage {
            Storage::Sparse(m) => m,
            Storage::Dense(_) => panic!("expected a sparse tensor"),
        }
    }

    pub fn grad(&self) -> Option<&DenseMatrix> {
        self.grad.as_ref()
    }

    pub(crate) fn grad_mut(&mut self) -> Option<&mut DenseMatrix> {
        self.grad.as_mut()
    }

    pub(crate) fn value_and_grad_mut(&mut self) -> (&DenseMatrix, Option<&mut DenseMatrix>) {
        match &self.storage {
            Storage::Dense(m) => (m, self.grad.as_mut()),
            Storage::Sparse(_) => panic!("expected a dense tensor"),
        }
    }

    pub fn into_dense(self) -> DenseMatrix {
        match self.storage {
            Storage::Dense(m) => m,
            Storage::Sparse(m) => m.to_dense(),
        }
    }
}

impl From<DenseMatrix> for CpuTensor {
    fn from(m: DenseMatrix) -> Self {
        Self {
            storage: Storage::Dense(m),
            grad: None,
            saved: Vec::new(),
        }
    }
}

impl From<SparseMatrix> for CpuTensor {
    fn from(m: SparseMatrix) -> Self {
        Self {
            storage: Storage::Sparse(m),
            grad: None,
            saved: Vec::new(),
        }
    }
}

impl Tensor for CpuTensor {
    type ModelOfTensor = Shape;
    type ExecutionContext = CpuContext;

    fn new(desc: Shape, requires_grad: bool) -> Self {
        match desc {
            Shape::Dense(rows, cols) => Self {
                storage: Storage::Dense(DenseMatrix::zeros(rows, cols)),
                grad: requires_grad.then(|| DenseMatrix::zeros(rows, cols)),
                saved: Vec::new(),
            },
            Shape::Sparse(rows, cols) => Self::from(SparseMatrix::empty((rows, cols))),
        }
    }

    fn model(&self) -> Shape {
        match &self.storage {
            Storage::Dense(m) => Shape::Dense(m.rows(), m.cols()),
            Storage::Sparse(m) => Shape::Sparse(m.shape().0, m.shape().1),
        }
    }

    fn get_scalar(&self) -> Option<f32> {
        match &self.storage {
            Storage::Dense(m) if m.shape() == (1, 1) => Some(m.as_slice()[0]),
            _ => None,
        }
    }

    fn copy_values_into(&self, dest: &mut Self) {
        match (&self.storage, &mut dest.storage) {
            (Storage::Dense(src), Storage::Dense(dst)) => {
                dst.as_mut_slice().copy_from_slice(src.as_slice())
            }
            (src, dst) => *dst = src.clone(),
        }
    }

    fn zero_grad(&mut self) {
        if let Some(grad) = self.grad.as_mut() {
            grad.fill(0.0);
        }
    }

    fn set_grad_to_unit(&mut self) {
        if let Some(grad) = self.grad.as_mut() {
            grad.fill(1.0);
        }
    }
}

#[derive(Debug)]
pub struct CpuContext {
    pub training: bool,
    pub dropout: f32,
    pub rng: RefCell<ChaCha8Rng>,
}

impl CpuContext {
    pub fn training(dropout: f32, seed: u64) -> Self {
        Self {
            training: true,
            dropout,
            rng: RefCell::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn eval() -> Self {
        Self {
            training: false,
            dropout: 0.0,
            rng: RefCell::new(ChaCha8Rng::seed_from_u64(0)),
        }
    }
}
