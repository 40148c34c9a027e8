use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    ops::Index,
};

use crate::{
    operation::Tape,
    DiffableOperation, Error, Graph, Result, Tensor,
};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Node(pub(crate) usize);

#[derive(Debug)]
pub struct NodeData<T: Tensor> {
    own: Node,
    id: Option<String>,
    vals: T::ModelOfTensor,
    requires_grad: bool,
    parent_operation: Option<DiffableOperation<T>>,
    parent_nodes: Vec<Node>,
}

impl<T: Tensor> NodeData<T> {
    pub fn new(
        id: Option<String>,
        operation: Option<DiffableOperation<T>>,
        vals: T::ModelOfTensor,
        requires_grad: bool,
        parents: &[Node],
    ) -> Self {
        Self {
            id,
            own: Node(usize::MAX),
            vals,
            requires_grad,
            parent_operation: operation,
            parent_nodes: parents.to_vec(),
        }
    }

    pub fn model(&self) -> T::ModelOfTensor {
        self.vals
    }
}

#[derive(Debug)]
pub struct GraphBuilder<T: Tensor> {
    nodes: Vec<NodeData<T>>,
    roots: HashSet<Node>,
    inputs: HashSet<Node>,
    weights: HashSet<Node>,
    ids: HashSet<String>,
}

impl<T: Tensor> Default for GraphBuilder<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            roots: HashSet::new(),
            inputs: HashSet::new(),
            weights: HashSet::new(),
            ids: HashSet::new(),
        }
    }
}

impl<T: Tensor> Index<Node> for GraphBuilder<T> {
    type Output = NodeData<T>;

    fn index(&self, index: Node) -> &Self::Output {
        &self.nodes[index.0]
    }
}

impl<T: Tensor> GraphBuilder<T> {
    pub fn create_node(&mut self, mut data: NodeData<T>) -> Result<Node> {
        if let Some(id) = data.id.as_ref() {
            if !self.ids.insert(id.to_string()) {
                return Err(Error::InvalidGraph(format!("duplicate node id '{id}'")));
            }
        }

        let node = Node(self.nodes.len());
        data.own = node;

        for parent in &data.parent_nodes {
            self.roots.remove(parent);
        }

        self.nodes.push(data);
        self.roots.insert(node);

        Ok(node)
    }

    pub fn create_input(&mut self, id: &str, vals: T::ModelOfTensor) -> Result<Node> {
        let node = self.create_node(NodeData::new(Some(id.to_string()), None, vals, false, &[]))?;

        self.inputs.insert(node);

        Ok(node)
    }

    pub fn create_weights(&mut self, id: &str, vals: T::ModelOfTensor) -> Result<Node> {
        let node = self.create_node(NodeData::new(Some(id.to_string()), None, vals, true, &[]))?;

        self.weights.insert(node);

        Ok(node)
    }

    pub fn create_result_of_operation(
        &mut self,
        operation: DiffableOperation<T>,
        inputs: &[Node],
    ) -> Result<Node> {
        let mut set = HashSet::new();
        if !inputs.iter().all(|node| set.insert(node)) {
            return Err(Error::InvalidGraph(String::from(
                "an operation will alias nodes on backprop",
            )));
        }

        let input_vals = inputs
            .iter()
            .map(|node| self[*node].vals)
            .collect::<Vec<_>>();

        let vals = (operation.output_tensor)(&input_vals).map_err(Error::ShapeMismatch)?;
        let requires_grad = inputs.iter().any(|node| self[*node].requires_grad);

        self.create_node(NodeData::new(None, Some(operation), vals, requires_grad, inputs))
    }

    fn build_tape(&self) -> Tape<T> {
        let mut tape = Tape::default();

        for data in &self.nodes {
            if let Some(operation) = data.parent_operation {
                tape.push(operation, &data.parent_nodes, data.own, data.requires_grad);
            }
        }

        tape
    }

    pub fn build(&self, execution_context: T::ExecutionContext) -> Result<Graph<T>> {
        if self.roots.len() != 1 {
            return Err(Error::InvalidGraph(format!(
                "graph must have a single output, found {}",
                self.roots.len()
            )));
        }

        let root = *self.roots.iter().min().unwrap_or(&Node(0));
        if self.inputs.contains(&root) {
            return Err(Error::InvalidGraph(String::from("output cannot be an input")));
        }
        if self.weights.contains(&root) {
            return Err(Error::InvalidGraph(String::from("can't output trainable weights")));
        }

        let nodes = self
            .nodes
            .iter()
            .map(|node_data| RefCell::new(T::new(node_data.vals, node_data.requires_grad)))
            .collect::<Vec<_>>();

        let named = |set: &HashSet<Node>| {
            set.iter()
                .filter_map(|&node| self[node].id.clone().map(|id| (id, node)))
                .collect::<HashMap<_, _>>()
        };

        let inputs = named(&self.inputs);
        let weights = named(&self.weights);

        Ok(Graph {
            nodes,
            root,
            inputs,
            weights,
            tape: self.build_tape(),
            execution_context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Scalar {
        val: f32,
        grad: Option<f32>,
    }

    impl Tensor for Scalar {
        type ModelOfTensor = ();
        type ExecutionContext = ();

        fn new(_: (), requires_grad: bool) -> Self {
            Self {
                val: 0.0,
                grad: requires_grad.then_some(0.0),
            }
        }

        fn model(&self) {}

        fn get_scalar(&self) -> Option<f32> {
            Some(self.val)
        }

        fn copy_values_into(&self, dest: &mut Self) {
            dest.val = self.val;
        }

        fn zero_grad(&mut self) {
            if let Some(grad) = self.grad.as_mut() {
                *grad = 0.0;
            }
        }

        fn set_grad_to_unit(&mut self) {
            self.grad = Some(1.0);
        }
    }

    fn mul() -> DiffableOperation<Scalar> {
        DiffableOperation {
            name: "mul",
            output_tensor: |inputs| {
                if inputs.len() == 2 {
                    Ok(())
                } else {
                    Err(String::from("Invalid number of arguments!"))
                }
            },
            forward: |_, inputs, output| output.val = inputs[0].val * inputs[1].val,
            backprop: |_, output, inputs| {
                let output_grad = output.grad.unwrap_or_default();
                for (a, b) in [(0, 1), (1, 0)] {
                    let other = inputs[b].val;
                    if let Some(grd) = inputs[a].grad.as_mut() {
                        *grd += output_grad * other;
                    }
                }
            },
        }
    }

    #[test]
    fn product_gradients() {
        let mut builder = GraphBuilder::<Scalar>::default();
        let a = builder.create_weights("a", ()).unwrap();
        let x = builder.create_input("x", ()).unwrap();
        builder.create_result_of_operation(mul(), &[a, x]).unwrap();

        let mut graph = builder.build(()).unwrap();
        graph.store_weights("a", &Scalar { val: 3.0, grad: None }).unwrap();
        graph.store_input("x", &Scalar { val: 5.0, grad: None }).unwrap();

        assert_eq!(graph.forward(), Some(15.0));
        graph.zero_grads();
        graph.backward();

        assert_eq!(graph.get_weights("a").unwrap().grad, Some(5.0));
    }

    #[test]
    fn input_only_branches_skip_backprop() {
        let mut builder = GraphBuilder::<Scalar>::default();
        let a = builder.create_weights("a", ()).unwrap();
        let x = builder.create_input("x", ()).unwrap();
        let y = builder.create_input("y", ()).unwrap();
        let xy = builder.create_result_of_operation(mul(), &[x, y]).unwrap();
        builder.create_result_of_operation(mul(), &[a, xy]).unwrap();

        let mut graph = builder.build(()).unwrap();
        assert_eq!(graph.num_operations(), 2);
        assert_eq!(graph.num_backward_operations(), 1);

        graph.store_weights("a", &Scalar { val: 2.0, grad: None }).unwrap();
        graph.store_input("x", &Scalar { val: 3.0, grad: None }).unwrap();
        graph.store_input("y", &Scalar { val: 4.0, grad: None }).unwrap();
        assert_eq!(graph.forward(), Some(24.0));
        graph.zero_grads();
        graph.backward();
        assert_eq!(graph.get_weights("a").unwrap().grad, Some(12.0));
    }

    #[test]
    fn rejects_aliased_inputs() {
        let mut builder = GraphBuilder::<Scalar>::default();
        let a = builder.create_weights("a", ()).unwrap();
        let err = builder.create_result_of_operation(mul(), &[a, a]).unwrap_err();
        assert!(matches!(err, Error::InvalidGraph(_)));
    }

    #[test]
    fn rejects_multiple_roots_and_duplicate_ids() {
        let mut builder = GraphBuilder::<Scalar>::default();
        builder.create_input("x", ()).unwrap();
        assert!(builder.create_input("x", ()).is_err());
        builder.create_weights("w", ()).unwrap();
        assert!(builder.build(()).is_err());
    }

    #[test]
    fn rejects_weight_as_output() {
        let mut builder = GraphBuilder::<Scalar>::default();
        builder.create_weights("w", ()).unwrap();
        assert!(builder.build(()).is_err());
    }
}
