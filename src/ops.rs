use rand::Rng;

use crate::{
    cpu::{CpuContext, CpuTensor, Shape},
    matrix::{matmul_acc, matmul_nt_acc, matmul_tn_acc},
    operation::ModelResult,
    DiffableOperation, GraphBuilder, Node, Result,
};

type Builder = GraphBuilder<CpuTensor>;

pub struct Operation;
impl Operation {
    /// `a · b`
    pub fn matmul(graph: &mut Builder, a: Node, b: Node) -> Result<Node> {
        graph.create_result_of_operation(matmul(), &[a, b])
    }

    /// Adds a `1 x m` row to every row of an `n x m` matrix.
    pub fn add_bias(graph: &mut Builder, a: Node, bias: Node) -> Result<Node> {
        graph.create_result_of_operation(add_bias(), &[a, bias])
    }

    pub fn add(graph: &mut Builder, a: Node, b: Node) -> Result<Node> {
        graph.create_result_of_operation(add(), &[a, b])
    }

    pub fn relu(graph: &mut Builder, a: Node) -> Result<Node> {
        graph.create_result_of_operation(relu(), &[a])
    }

    /// Inverted dropout; the rate comes from the execution context.
    pub fn dropout(graph: &mut Builder, a: Node) -> Result<Node> {
        graph.create_result_of_operation(dropout(), &[a])
    }

    /// `blockᵀ · h` for a sparse `src x dst` block.
    pub fn aggregate_neighbors(graph: &mut Builder, block: Node, h: Node) -> Result<Node> {
        graph.create_result_of_operation(aggregate_neighbors(), &[block, h])
    }

    /// The first `dst` rows of the source features of a block.
    pub fn dst_rows(graph: &mut Builder, block: Node, x: Node) -> Result<Node> {
        graph.create_result_of_operation(dst_rows(), &[block, x])
    }

    /// Mean softmax cross-entropy of `logits` against an `n x 1` column
    /// of class indices.
    pub fn cross_entropy(graph: &mut Builder, logits: Node, labels: Node) -> Result<Node> {
        graph.create_result_of_operation(cross_entropy(), &[logits, labels])
    }
}

fn invalid(name: &str, inputs: &[Shape]) -> String {
    format!("{name}: invalid inputs {inputs:?}")
}

fn matmul() -> DiffableOperation<CpuTensor> {
    DiffableOperation {
        name: "matmul",
        output_tensor: matmul::is_valid,
        forward: matmul::forward,
        backprop: matmul::backprop,
    }
}

mod matmul {
    use super::*;

    pub fn is_valid(inputs: &[Shape]) -> ModelResult<CpuTensor> {
        match *inputs {
            [Shape::Dense(n, k), Shape::Dense(k2, m)] if k == k2 => Ok(Shape::Dense(n, m)),
            _ => Err(invalid("matmul", inputs)),
        }
    }

    pub fn forward(_: &CpuContext, inputs: &[&CpuTensor], output: &mut CpuTensor) {
        let out = output.dense_mut();
        out.fill(0.0);
        matmul_acc(inputs[0].dense(), inputs[1].dense(), out);
    }

    pub fn backprop(_: &CpuContext, output: &CpuTensor, inputs: &mut [&mut CpuTensor]) {
        let Some(dy) = output.grad() else { return };
        let (x, w) = inputs.split_at_mut(1);
        let (x, w) = (&mut *x[0], &mut *w[0]);

        if let Some(dx) = x.grad_mut() {
            matmul_nt_acc(dy, w.dense(), dx);
        }

        if let Some(dw) = w.grad_mut() {
            matmul_tn_acc(x.dense(), dy, dw);
        }
    }
}

fn add_bias() -> DiffableOperation<CpuTensor> {
    DiffableOperation {
        name: "add_bias",
        output_tensor: add_bias::is_valid,
        forward: add_bias::forward,
        backprop: add_bias::backprop,
    }
}

mod add_bias {
    use super::*;

    pub fn is_valid(inputs: &[Shape]) -> ModelResult<CpuTensor> {
        match *inputs {
            [Shape::Dense(n, m), Shape::Dense(1, m2)] if m == m2 => Ok(Shape::Dense(n, m)),
            _ => Err(invalid("add_bias", inputs)),
        }
    }

    pub fn forward(_: &CpuContext, inputs: &[&CpuTensor], output: &mut CpuTensor) {
        let (h, bias) = (inputs[0].dense(), inputs[1].dense().as_slice());
        let out = output.dense_mut();
        for r in 0..h.rows() {
            for ((o, &x), &b) in out.row_mut(r).iter_mut().zip(h.row(r)).zip(bias) {
                *o = x + b;
            }
        }
    }

    pub fn backprop(_: &CpuContext, output: &CpuTensor, inputs: &mut [&mut CpuTensor]) {
        let Some(dy) = output.grad() else { return };

        if let Some(dh) = inputs[0].grad_mut() {
            dh.add_assign(dy);
        }

        if let Some(db) = inputs[1].grad_mut() {
            let db = db.as_mut_slice();
            for r in 0..dy.rows() {
                for (g, &d) in db.iter_mut().zip(dy.row(r)) {
                    *g += d;
                }
            }
        }
    }
}

fn add() -> DiffableOperation<CpuTensor> {
    DiffableOperation {
        name: "add",
        output_tensor: add::is_valid,
        forward: add::forward,
        backprop: add::backprop,
    }
}

mod add {
    use super::*;

    pub fn is_valid(inputs: &[Shape]) -> ModelResult<CpuTensor> {
        match *inputs {
            [a @ Shape::Dense(..), b] if a == b => Ok(a),
            _ => Err(invalid("add", inputs)),
        }
    }

    pub fn forward(_: &CpuContext, inputs: &[&CpuTensor], output: &mut CpuTensor) {
        let (a, b) = (inputs[0].dense().as_slice(), inputs[1].dense().as_slice());
        for ((o, &x), &y) in output.dense_mut().as_mut_slice().iter_mut().zip(a).zip(b) {
            *o = x + y;
        }
    }

    pub fn backprop(_: &CpuContext, output: &CpuTensor, inputs: &mut [&mut CpuTensor]) {
        let Some(dy) = output.grad() else { return };

        for input in inputs {
            if let Some(grd) = input.grad_mut() {
                grd.add_assign(dy);
            }
        }
    }
}

fn relu() -> DiffableOperation<CpuTensor> {
    DiffableOperation {
        name: "relu",
        output_tensor: relu::is_valid,
        forward: relu::forward,
        backprop: relu::backprop,
    }
}

mod relu {
    use super::*;

    pub fn is_valid(inputs: &[Shape]) -> ModelResult<CpuTensor> {
        match *inputs {
            [a @ Shape::Dense(..)] => Ok(a),
            _ => Err(invalid("relu", inputs)),
        }
    }

    pub fn forward(_: &CpuContext, inputs: &[&CpuTensor], output: &mut CpuTensor) {
        let x = inputs[0].dense().as_slice();
        for (o, &v) in output.dense_mut().as_mut_slice().iter_mut().zip(x) {
            *o = v.max(0.0);
        }
    }

    pub fn backprop(_: &CpuContext, output: &CpuTensor, inputs: &mut [&mut CpuTensor]) {
        let Some(dy) = output.grad() else { return };
        let (x, Some(dx)) = inputs[0].value_and_grad_mut() else { return };

        for ((g, &v), &d) in dx.as_mut_slice().iter_mut().zip(x.as_slice()).zip(dy.as_slice()) {
            if v > 0.0 {
                *g += d;
            }
        }
    }
}

fn dropout() -> DiffableOperation<CpuTensor> {
    DiffableOperation {
        name: "dropout",
        output_tensor: dropout::is_valid,
        forward: dropout::forward,
        backprop: dropout::backprop,
    }
}

mod dropout {
    use super::*;

    pub fn is_valid(inputs: &[Shape]) -> ModelResult<CpuTensor> {
        match *inputs {
            [a @ Shape::Dense(..)] => Ok(a),
            _ => Err(invalid("dropout", inputs)),
        }
    }

    // `saved` holds the per-element scale (0 or 1 / (1 - p)); empty means identity.
    pub fn forward(ctx: &CpuContext, inputs: &[&CpuTensor], output: &mut CpuTensor) {
        let x = inputs[0].dense().as_slice();
        output.saved.clear();

        if !ctx.training || ctx.dropout <= 0.0 {
            output.dense_mut().as_mut_slice().copy_from_slice(x);
            return;
        }

        let keep = 1.0 - ctx.dropout;
        let scale = keep.recip();
        let mut rng = ctx.rng.borrow_mut();
        let mask = (0..x.len())
            .map(|_| if rng.gen::<f32>() < keep { scale } else { 0.0 })
            .collect::<Vec<_>>();

        for ((o, &v), &m) in output.dense_mut().as_mut_slice().iter_mut().zip(x).zip(&mask) {
            *o = v * m;
        }
        output.saved = mask;
    }

    pub fn backprop(_: &CpuContext, output: &CpuTensor, inputs: &mut [&mut CpuTensor]) {
        let Some(dy) = output.grad() else { return };
        let Some(dx) = inputs[0].grad_mut() else { return };

        if output.saved.is_empty() {
            dx.add_assign(dy);
            return;
        }

        for ((g, &d), &m) in dx.as_mut_slice().iter_mut().zip(dy.as_slice()).zip(&output.saved) {
            *g += d * m;
        }
    }
}

fn aggregate_neighbors() -> DiffableOperation<CpuTensor> {
    DiffableOperation {
        name: "aggregate_neighbors",
        output_tensor: aggregate_neighbors::is_valid,
        forward: aggregate_neighbors::forward,
        backprop: aggregate_neighbors::backprop,
    }
}

mod aggregate_neighbors {
    use super::*;

    pub fn is_valid(inputs: &[Shape]) -> ModelResult<CpuTensor> {
        match *inputs {
            [Shape::Sparse(src, dst), Shape::Dense(n, m)] if src == n => Ok(Shape::Dense(dst, m)),
            _ => Err(invalid("aggregate_neighbors", inputs)),
        }
    }

    pub fn forward(_: &CpuContext, inputs: &[&CpuTensor], output: &mut CpuTensor) {
        let out = output.dense_mut();
        out.fill(0.0);
        inputs[0]
            .sparse()
            .transpose_spmm_acc(inputs[1].dense(), out);
    }

    pub fn backprop(_: &CpuContext, output: &CpuTensor, inputs: &mut [&mut CpuTensor]) {
        let Some(dy) = output.grad() else { return };
        let (block, h) = inputs.split_at_mut(1);

        if let Some(dh) = h[0].grad_mut() {
            block[0].sparse().spmm_acc(dy, dh);
        }
    }
}

fn dst_rows() -> DiffableOperation<CpuTensor> {
    DiffableOperation {
        name: "dst_rows",
        output_tensor: dst_rows::is_valid,
        forward: dst_rows::forward,
        backprop: dst_rows::backprop,
    }
}

mod dst_rows {
    use super::*;

    pub fn is_valid(inputs: &[Shape]) -> ModelResult<CpuTensor> {
        match *inputs {
            [Shape::Sparse(src, dst), Shape::Dense(n, k)] if src == n && dst <= n => {
                Ok(Shape::Dense(dst, k))
            }
            _ => Err(invalid("dst_rows", inputs)),
        }
    }

    pub fn forward(_: &CpuContext, inputs: &[&CpuTensor], output: &mut CpuTensor) {
        let out = output.dense_mut().as_mut_slice();
        out.copy_from_slice(&inputs[1].dense().as_slice()[..out.len()]);
    }

    pub fn backprop(_: &CpuContext, output: &CpuTensor, inputs: &mut [&mut CpuTensor]) {
        let Some(dy) = output.grad() else { return };
        let Some(dx) = inputs[1].grad_mut() else { return };

        for (g, &d) in dx.as_mut_slice().iter_mut().zip(dy.as_slice()) {
            *g += d;
        }
    }
}

fn cross_entropy() -> DiffableOperation<CpuTensor> {
    DiffableOperation {
        name: "cross_entropy",
        output_tensor: cross_entropy::is_valid,
        forward: cross_entropy::forward,
        backprop: cross_entropy::backprop,
    }
}

mod cross_entropy {
    use super::*;

    pub fn is_valid(inputs: &[Shape]) -> ModelResult<CpuTensor> {
        match *inputs {
            [Shape::Dense(n, c), Shape::Dense(n2, 1)] if n == n2 && n > 0 && c > 0 => {
                Ok(Shape::Dense(1, 1))
            }
            _ => Err(invalid("cross_entropy", inputs)),
        }
    }

    // `saved` holds the softmax probabilities.
    pub fn forward(_: &CpuContext, inputs: &[&CpuTensor], output: &mut CpuTensor) {
        let (logits, labels) = (inputs[0].dense(), inputs[1].dense().as_slice());
        let classes = logits.cols();

        let mut probs = Vec::with_capacity(logits.rows() * classes);
        let mut loss = 0.0;
        for (r, &label) in labels.iter().enumerate() {
            let row = logits.row(r);
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>();
            let log_sum = sum.ln() + max;

            loss += log_sum - row[label as usize];
            probs.extend(row.iter().map(|&v| (v - log_sum).exp()));
        }

        output.saved = probs;
        output.dense_mut().as_mut_slice()[0] = loss / labels.len() as f32;
    }

    pub fn backprop(_: &CpuContext, output: &CpuTensor, inputs: &mut [&mut CpuTensor]) {
        let Some(dy) = output.grad() else { return };
        let (logits, labels) = inputs.split_at_mut(1);
        let labels = labels[0].dense().as_slice();
        let Some(dx) = logits[0].grad_mut() else { return };

        let classes = dx.cols();
        let scale = dy.as_slice()[0] / labels.len() as f32;
        for (r, &label) in labels.iter().enumerate() {
            let probs = &output.saved[r * classes..(r + 1) * classes];
            for (c, (g, &p)) in dx.row_mut(r).iter_mut().zip(probs).enumerate() {
                let target = if c == label as usize { 1.0 } else { 0.0 };
                *g += scale * (p - target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{matrix::DenseMatrix, sparse::SparseMatrix, Graph};

    fn dense(rows: usize, cols: usize, data: &[f32]) -> CpuTensor {
        CpuTensor::from(DenseMatrix::new(rows, cols, data.to_vec()).unwrap())
    }

    fn block() -> SparseMatrix {
        // 3 sources, 2 destinations; source 2 feeds both.
        SparseMatrix::new(vec![0, 2, 1, 2], vec![0, 0, 1, 1], Some(vec![0.5, 0.5, 0.5, 0.5]), (3, 2))
            .unwrap()
    }

    /// `cross_entropy(aggregate(block, x·w) + dst_rows(x)·v, labels)`
    fn network() -> Graph<CpuTensor> {
        let mut builder = GraphBuilder::<CpuTensor>::default();
        let a = builder.create_input("block", Shape::Sparse(3, 2)).unwrap();
        let x = builder.create_input("x", Shape::Dense(3, 2)).unwrap();
        let y = builder.create_input("y", Shape::Dense(2, 1)).unwrap();
        let w = builder.create_weights("w", Shape::Dense(2, 3)).unwrap();
        let v = builder.create_weights("v", Shape::Dense(2, 3)).unwrap();
        let b = builder.create_weights("b", Shape::Dense(1, 3)).unwrap();

        let neigh = Operation::matmul(&mut builder, x, w).unwrap();
        let agg = Operation::aggregate_neighbors(&mut builder, a, neigh).unwrap();
        let own = Operation::dst_rows(&mut builder, a, x).unwrap();
        let own = Operation::matmul(&mut builder, own, v).unwrap();
        let own = Operation::add_bias(&mut builder, own, b).unwrap();
        let h = Operation::add(&mut builder, own, agg).unwrap();
        let h = Operation::relu(&mut builder, h).unwrap();
        let h = Operation::dropout(&mut builder, h).unwrap();
        Operation::cross_entropy(&mut builder, h, y).unwrap();

        let mut graph = builder.build(CpuContext::eval()).unwrap();
        graph.store_input("block", &CpuTensor::from(block())).unwrap();
        graph
            .store_input("x", &dense(3, 2, &[0.3, -0.2, 0.8, 0.1, -0.5, 0.9]))
            .unwrap();
        graph.store_input("y", &dense(2, 1, &[2.0, 0.0])).unwrap();
        graph
    }

    fn weights() -> [(&'static str, CpuTensor); 3] {
        [
            ("w", dense(2, 3, &[0.4, -0.3, 0.7, 0.2, 0.5, -0.6])),
            ("v", dense(2, 3, &[-0.1, 0.6, 0.3, 0.9, -0.4, 0.2])),
            ("b", dense(1, 3, &[0.3, 0.3, 0.3])),
        ]
    }

    fn loss_at(id: &str, idx: usize, delta: f32) -> f32 {
        let mut graph = network();
        for (name, mut tensor) in weights() {
            if name == id {
                let mut m = tensor.into_dense();
                m.as_mut_slice()[idx] += delta;
                tensor = CpuTensor::from(m);
            }
            graph.store_weights(name, &tensor).unwrap();
        }
        graph.forward().unwrap()
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut graph = network();
        for (name, tensor) in weights() {
            graph.store_weights(name, &tensor).unwrap();
        }
        graph.forward().unwrap();
        graph.zero_grads();
        graph.backward();

        let eps = 1e-2;
        for id in graph.weight_ids() {
            let analytic = graph.get_weights(&id).unwrap().grad().unwrap().clone();
            for (idx, &g) in analytic.as_slice().iter().enumerate() {
                let numeric = (loss_at(&id, idx, eps) - loss_at(&id, idx, -eps)) / (2.0 * eps);
                assert!(
                    (numeric - g).abs() < 1e-2,
                    "{id}[{idx}]: analytic {g}, numeric {numeric}"
                );
            }
        }
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_classes() {
        let mut builder = GraphBuilder::<CpuTensor>::default();
        let logits = builder.create_weights("logits", Shape::Dense(2, 4)).unwrap();
        let labels = builder.create_input("labels", Shape::Dense(2, 1)).unwrap();
        Operation::cross_entropy(&mut builder, logits, labels).unwrap();

        let mut graph = builder.build(CpuContext::eval()).unwrap();
        graph.store_input("labels", &dense(2, 1, &[1.0, 3.0])).unwrap();
        let loss = graph.forward().unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn dropout_scales_kept_values_in_training() {
        let mut builder = GraphBuilder::<CpuTensor>::default();
        let x = builder.create_input("x", Shape::Dense(1, 1000)).unwrap();
        Operation::dropout(&mut builder, x).unwrap();

        let mut graph = builder.build(CpuContext::training(0.5, 3)).unwrap();
        graph.store_input("x", &dense(1, 1000, &[1.0; 1000])).unwrap();
        graph.forward();

        let out = graph.output();
        let vals = out.dense().as_slice();
        assert!(vals.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = vals.iter().filter(|&&v| v > 0.0).count();
        assert!((350..650).contains(&kept), "kept {kept}");
    }

    #[test]
    fn shape_errors_surface_at_build_time() {
        let mut builder = GraphBuilder::<CpuTensor>::default();
        let a = builder.create_input("a", Shape::Dense(2, 3)).unwrap();
        let b = builder.create_weights("b", Shape::Dense(2, 3)).unwrap();
        assert!(Operation::matmul(&mut builder, a, b).is_err());

        let block = builder.create_input("block", Shape::Sparse(4, 2)).unwrap();
        assert!(Operation::aggregate_neighbors(&mut builder, block, a).is_err());
    }
}
