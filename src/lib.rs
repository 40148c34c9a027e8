mod error;
mod graph;
pub mod graph_builder;
pub mod operation;
mod tensor;

pub mod config;
pub mod cpu;
pub mod dataset;
pub mod loader;
pub mod matrix;
pub mod metrics;
pub mod nn;
pub mod npy;
pub mod ops;
pub mod optim;
pub mod sampler;
pub mod sparse;
pub mod train;

pub use error::{Error, Result};
pub use graph::Graph;
pub use graph_builder::{GraphBuilder, Node};
pub use operation::DiffableOperation;
pub use tensor::Tensor;
