//! Adam with inspectable state
//!
//! `tch::nn::Optimizer` keeps its moment buffers inside libtorch where they
//! cannot be written to a checkpoint. This implementation holds them as
//! plain tensors so a resumed run continues with the exact optimizer state.

use std::collections::HashMap;

use tch::{nn, Kind, Tensor};

use crate::error::{InpaintError, Result};
use crate::utils::OptimConfig;

const EPS: f64 = 1e-8;

/// Adam over every trainable variable of one `VarStore`
#[derive(Debug)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    /// Updates applied so far
    step: i64,
    /// Parameters sorted by name
    params: Vec<(String, Tensor)>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
}

impl Adam {
    pub fn new(vs: &nn::VarStore, config: &OptimConfig) -> Self {
        let mut params: Vec<(String, Tensor)> = vs
            .variables()
            .into_iter()
            .filter(|(_, t)| t.requires_grad())
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let exp_avg = params.iter().map(|(_, p)| p.zeros_like()).collect();
        let exp_avg_sq = params.iter().map(|(_, p)| p.zeros_like()).collect();

        Self {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            step: 0,
            params,
            exp_avg,
            exp_avg_sq,
        }
    }

    /// Updates applied so far
    pub fn steps(&self) -> i64 {
        self.step
    }

    pub fn zero_grad(&mut self) {
        for (_, p) in self.params.iter_mut() {
            p.zero_grad();
        }
    }

    /// One Adam update from the accumulated gradients
    ///
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self) {
        self.step += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        let bias_c1 = 1.0 - b1.powi(self.step as i32);
        let bias_c2 = 1.0 - b2.powi(self.step as i32);
        let step_size = self.lr / bias_c1;

        tch::no_grad(|| {
            for ((_, p), (m, v)) in self
                .params
                .iter_mut()
                .zip(self.exp_avg.iter_mut().zip(self.exp_avg_sq.iter_mut()))
            {
                let grad = p.grad();
                if !grad.defined() {
                    continue;
                }
                let next_m = &*m * b1 + &grad * (1.0 - b1);
                let next_v = &*v * b2 + grad.square() * (1.0 - b2);
                m.copy_(&next_m);
                v.copy_(&next_v);

                let denom = next_v.sqrt() / bias_c2.sqrt() + EPS;
                let updated = &*p - next_m / denom * step_size;
                p.copy_(&updated);
            }
        });
    }

    /// Named state tensors for `Tensor::save_multi`, keys prefixed
    pub fn state(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut named = Vec::with_capacity(2 * self.params.len() + 1);
        named.push((format!("{}.step", prefix), Tensor::from(self.step)));
        for ((name, _), (m, v)) in self
            .params
            .iter()
            .zip(self.exp_avg.iter().zip(self.exp_avg_sq.iter()))
        {
            named.push((format!("{}.exp_avg.{}", prefix, name), m.shallow_clone()));
            named.push((format!("{}.exp_avg_sq.{}", prefix, name), v.shallow_clone()));
        }
        named
    }

    /// Restore state written by [`Adam::state`]
    pub fn load_state(&mut self, named: &HashMap<String, Tensor>, prefix: &str) -> Result<()> {
        let fetch = |key: String| {
            named
                .get(&key)
                .ok_or_else(|| InpaintError::Checkpoint(format!("optimizer state misses {}", key)))
        };

        let step = fetch(format!("{}.step", prefix))?.int64_value(&[]);

        tch::no_grad(|| -> Result<()> {
            for ((name, _), (m, v)) in self
                .params
                .iter()
                .zip(self.exp_avg.iter_mut().zip(self.exp_avg_sq.iter_mut()))
            {
                let saved_m = fetch(format!("{}.exp_avg.{}", prefix, name))?;
                let saved_v = fetch(format!("{}.exp_avg_sq.{}", prefix, name))?;
                if saved_m.size() != m.size() || saved_v.size() != v.size() {
                    return Err(InpaintError::Checkpoint(format!(
                        "optimizer state for {} has shape {:?}, expected {:?}",
                        name,
                        saved_m.size(),
                        m.size()
                    )));
                }
                m.f_copy_(&saved_m.to_kind(Kind::Float))?;
                v.f_copy_(&saved_v.to_kind(Kind::Float))?;
            }
            Ok(())
        })?;

        self.step = step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Config;
    use approx::assert_relative_eq;
    use tch::Device;

    fn single_param() -> (nn::VarStore, Tensor) {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().zeros("w", &[2]);
        (vs, w)
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let (vs, w) = single_param();
        let config = OptimConfig {
            lr: 0.1,
            beta1: 0.5,
            beta2: 0.9,
        };
        let mut adam = Adam::new(&vs, &config);

        adam.zero_grad();
        let loss = (&w * Tensor::from_slice(&[1.0f32, -3.0])).sum(Kind::Float);
        loss.backward();
        adam.step();

        // Bias-corrected first step is lr * sign(grad)
        assert_relative_eq!(w.double_value(&[0]), -0.1, epsilon = 1e-5);
        assert_relative_eq!(w.double_value(&[1]), 0.1, epsilon = 1e-5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_state_roundtrip() {
        let (vs, w) = single_param();
        let config = Config::default().optim;
        let mut adam = Adam::new(&vs, &config);
        for _ in 0..3 {
            adam.zero_grad();
            (&w * 2.0).sum(Kind::Float).backward();
            adam.step();
        }

        let named: HashMap<String, Tensor> = adam.state("gen").into_iter().collect();

        let (vs2, _) = single_param();
        let mut restored = Adam::new(&vs2, &config);
        restored.load_state(&named, "gen").unwrap();

        assert_eq!(restored.steps(), 3);
        let a = adam.state("gen");
        let b: HashMap<String, Tensor> = restored.state("gen").into_iter().collect();
        for (key, tensor) in a {
            assert!(tensor.allclose(&b[&key], 1e-6, 1e-8, false), "{} differs", key);
        }
    }

    #[test]
    fn test_missing_state_is_an_error() {
        let (vs, _) = single_param();
        let mut adam = Adam::new(&vs, &Config::default().optim);
        assert!(matches!(
            adam.load_state(&HashMap::new(), "dis"),
            Err(InpaintError::Checkpoint(_))
        ));
    }
}
