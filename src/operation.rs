use std::{cell::RefCell, fmt};

use tracing::trace;

use crate::{Node, Tensor};

pub type ModelResult<T> = Result<<T as Tensor>::ModelOfTensor, String>;

pub type ForwardFunc<T> = fn(&<T as Tensor>::ExecutionContext, &[&T], &mut T);

pub type BackwardFunc<T> = fn(&<T as Tensor>::ExecutionContext, &T, &mut [&mut T]);

/// Shape inference, forward pass and gradient propagation of one
/// operation, as plain function pointers.
pub struct DiffableOperation<T: Tensor> {
    pub name: &'static str,
    pub output_tensor: fn(&[T::ModelOfTensor]) -> ModelResult<T>,
    pub forward: ForwardFunc<T>,
    pub backprop: BackwardFunc<T>,
}

impl<T: Tensor> Clone for DiffableOperation<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Tensor> Copy for DiffableOperation<T> {}

impl<T: Tensor> fmt::Debug for DiffableOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffableOperation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Step<T: Tensor> {
    operation: DiffableOperation<T>,
    inputs: Vec<Node>,
    output: Node,
    /// Whether any trainable weight flows into `output`.
    backprop: bool,
}

/// Every recorded operation in creation order, which is a topological
/// order of the graph.
#[derive(Debug)]
pub(crate) struct Tape<T: Tensor> {
    steps: Vec<Step<T>>,
}

impl<T: Tensor> Default for Tape<T> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<T: Tensor> Tape<T> {
    pub fn push(&mut self, operation: DiffableOperation<T>, inputs: &[Node], output: Node, backprop: bool) {
        self.steps.push(Step {
            operation,
            inputs: inputs.to_vec(),
            output,
            backprop,
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Steps visited on the way back.
    pub fn num_backward(&self) -> usize {
        self.steps.iter().filter(|step| step.backprop).count()
    }

    pub fn forward(&self, ctx: &T::ExecutionContext, nodes: &[RefCell<T>]) {
        for step in &self.steps {
            trace!(op = step.operation.name, output = step.output.0, "forward");

            let inputs = step
                .inputs
                .iter()
                .map(|node| nodes[node.0].borrow())
                .collect::<Vec<_>>();
            let inputs = inputs.iter().map(|cell| &**cell).collect::<Vec<_>>();

            let mut output = nodes[step.output.0].borrow_mut();
            (step.operation.forward)(ctx, &inputs, &mut output);
        }
    }

    /// Replays the tape in reverse, skipping steps no weight depends on.
    pub fn backward(&self, ctx: &T::ExecutionContext, nodes: &[RefCell<T>]) {
        for step in self.steps.iter().rev().filter(|step| step.backprop) {
            trace!(op = step.operation.name, output = step.output.0, "backprop");

            let mut inputs = step
                .inputs
                .iter()
                .map(|node| nodes[node.0].borrow_mut())
                .collect::<Vec<_>>();
            let mut inputs = inputs.iter_mut().map(|cell| &mut **cell).collect::<Vec<_>>();

            let output = nodes[step.output.0].borrow();
            (step.operation.backprop)(ctx, &output, &mut inputs);
        }
    }
}
