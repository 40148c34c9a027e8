use std::{
    cell::{Ref, RefCell},
    collections::HashMap,
};

use crate::{
    operation::Tape,
    Error, Node, Result, Tensor,
};

pub struct Graph<T: Tensor> {
    pub(crate) nodes: Vec<RefCell<T>>,

    pub(crate) root: Node,
    pub(crate) inputs: HashMap<String, Node>,
    pub(crate) weights: HashMap<String, Node>,

    pub(crate) tape: Tape<T>,

    pub(crate) execution_context: T::ExecutionContext,
}

impl<T: Tensor> Graph<T> {
    pub fn forward(&mut self) -> Option<f32> {
        self.tape.forward(&self.execution_context, &self.nodes);
        self.nodes[self.root.0].borrow().get_scalar()
    }

    pub fn backward(&mut self) {
        self.nodes[self.root.0].get_mut().set_grad_to_unit();
        self.tape.backward(&self.execution_context, &self.nodes);
    }

    pub fn zero_grads(&mut self) {
        for node in &mut self.nodes {
            node.get_mut().zero_grad();
        }
    }

    pub fn output(&self) -> Ref<'_, T> {
        self.nodes[self.root.0].borrow()
    }

    fn store_values(&mut self, node: Node, data: &T) -> Result<()> {
        let dest = self.nodes[node.0].get_mut();
        if data.model() != dest.model() {
            return Err(Error::ShapeMismatch(format!(
                "expected {:?}, got {:?}",
                dest.model(),
                data.model()
            )));
        }
        data.copy_values_into(dest);
        Ok(())
    }

    pub fn store_input(&mut self, input: &str, data: &T) -> Result<()> {
        let node = *self
            .inputs
            .get(input)
            .ok_or_else(|| Error::UnknownNode(input.to_string()))?;
        self.store_values(node, data)
    }

    pub fn store_weights(&mut self, weights: &str, data: &T) -> Result<()> {
        let node = *self
            .weights
            .get(weights)
            .ok_or_else(|| Error::UnknownNode(weights.to_string()))?;
        self.store_values(node, data)
    }

    pub fn weight_ids(&self) -> Vec<String> {
        let mut ids = self.weights.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn get_weights(&self, id: &str) -> Option<Ref<'_, T>> {
        self.weights.get(id).map(|node| self.nodes[node.0].borrow())
    }

    pub fn num_operations(&self) -> usize {
        self.tape.len()
    }

    pub fn num_backward_operations(&self) -> usize {
        self.tape.num_backward()
    }
}
