use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{matrix::DenseMatrix, Error, Result};

#[derive(Clone, Debug, Default)]
pub struct ParamStore {
    params: BTreeMap<String, DenseMatrix>,
}

impl ParamStore {
    pub fn insert(&mut self, id: impl Into<String>, value: DenseMatrix) {
        self.params.insert(id.into(), value);
    }

    pub fn get(&self, id: &str) -> Option<&DenseMatrix> {
        self.params.get(id)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn num_scalars(&self) -> usize {
        self.params.values().map(|p| p.as_slice().len()).sum()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 5e-4,
        }
    }
}

#[derive(Debug, Default)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

/// Adam with L2 weight decay folded into the gradient.
#[derive(Debug)]
pub struct Adam {
    cfg: AdamConfig,
    step: i32,
    moments: BTreeMap<String, Moments>,
}

impl Adam {
    pub fn new(cfg: AdamConfig) -> Self {
        Self {
            cfg,
            step: 0,
            moments: BTreeMap::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.step
    }

    pub fn step(
        &mut self,
        params: &mut ParamStore,
        grads: &BTreeMap<String, DenseMatrix>,
    ) -> Result<()> {
        self.step += 1;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.cfg;
        let bias1 = 1.0 - beta1.powi(self.step);
        let bias2 = 1.0 - beta2.powi(self.step);

        for (id, grad) in grads {
            let param = params
                .params
                .get_mut(id)
                .ok_or_else(|| Error::UnknownNode(id.clone()))?;
            if param.shape() != grad.shape() {
                return Err(Error::ShapeMismatch(format!(
                    "gradient of '{id}' is {:?}, parameter is {:?}",
                    grad.shape(),
                    param.shape()
                )));
            }

            let len = param.as_slice().len();
            let state = self.moments.entry(id.clone()).or_insert_with(|| Moments {
                m: vec![0.0; len],
                v: vec![0.0; len],
            });

            let values = param.as_mut_slice();
            for (i, &g) in grad.as_slice().iter().enumerate() {
                let g = g + weight_decay * values[i];
                state.m[i] = beta1 * state.m[i] + (1.0 - beta1) * g;
                state.v[i] = beta2 * state.v[i] + (1.0 - beta2) * g * g;
                let m_hat = state.m[i] / bias1;
                let v_hat = state.v[i] / bias2;
                values[i] -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_each_weight_by_lr() {
        let mut params = ParamStore::default();
        params.insert("w", DenseMatrix::new(1, 2, vec![1.0, -1.0]).unwrap());

        let mut grads = BTreeMap::new();
        grads.insert(String::from("w"), DenseMatrix::new(1, 2, vec![0.5, -2.0]).unwrap());

        let mut adam = Adam::new(AdamConfig {
            lr: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        });
        adam.step(&mut params, &grads).unwrap();

        let w = params.get("w").unwrap().as_slice();
        assert!((w[0] - 0.9).abs() < 1e-5);
        assert!((w[1] + 0.9).abs() < 1e-5);
    }

    #[test]
    fn minimises_a_quadratic() {
        let mut params = ParamStore::default();
        params.insert("x", DenseMatrix::new(1, 1, vec![3.0]).unwrap());
        let mut adam = Adam::new(AdamConfig {
            lr: 0.05,
            ..Default::default()
        });

        for _ in 0..500 {
            let x = params.get("x").unwrap().as_slice()[0];
            let mut grads = BTreeMap::new();
            grads.insert(String::from("x"), DenseMatrix::new(1, 1, vec![2.0 * x]).unwrap());
            adam.step(&mut params, &grads).unwrap();
        }

        assert!(params.get("x").unwrap().as_slice()[0].abs() < 0.1);
    }

    #[test]
    fn unknown_gradient_is_an_error() {
        let mut params = ParamStore::default();
        let mut grads = BTreeMap::new();
        grads.insert(String::from("ghost"), DenseMatrix::zeros(1, 1));
        assert!(Adam::new(AdamConfig::default()).step(&mut params, &grads).is_err());
    }
}
