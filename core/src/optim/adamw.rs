use super::Optimizer;
use crate::distributed::fsdp::ParamStore;
use crate::error::{Result, config_err};
use crate::tensor::{DType, Storage, Tensor, TensorError};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Moment buffers of one parameter shard, always `f32`.
#[derive(Debug, Clone, PartialEq)]
struct Moments {
    m: Tensor,
    v: Tensor,
    step: u64,
}

/// AdamW optimizer.
///
/// Implements Adam algorithm with Weight Decay fix as described in [Decoupled Weight Decay Regularization](https://arxiv.org/abs/1711.05101).
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \hat{m}_t = m_t / (1 - \beta_1^t) \\
/// & \hat{v}_t = v_t / (1 - \beta_2^t) \\
/// & \theta_t = \theta_{t-1} - \eta (\hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon) + \lambda \theta_{t-1})
/// \end{aligned}
/// $$
///
/// Moments are kept in `f32` even when parameters are stored in `f16`/`bf16`; the update is
/// computed in `f32` and rounded back once.
pub struct AdamW {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    /// Parameter path -> moments.
    state: BTreeMap<String, Moments>,
}

impl AdamW {
    /// Creates a new AdamW optimizer.
    ///
    /// Defaults: `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-8`, `weight_decay = 0.01`.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            state: BTreeMap::new(),
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Number of updates applied to `name` so far.
    pub fn step_count(&self, name: &str) -> u64 {
        self.state.get(name).map_or(0, |s| s.step)
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut ParamStore) -> Result<()> {
        if params.has_pending_reduce() {
            return Err(config_err(
                "optimizer step before gradients were reduced across data-parallel ranks",
            ));
        }
        let lr = self.learning_rate;
        let (b1, b2, eps, lambda) = (self.beta1, self.beta2, self.epsilon, self.weight_decay);

        for (name, param) in params.iter_mut() {
            let (value, grad) = param.value_and_grad_mut();
            let Some(grad) = grad else {
                continue;
            };
            if value.shape() != grad.shape() {
                return Err(TensorError::ShapeMismatch {
                    expected: value.shape().to_vec(),
                    got: grad.shape().to_vec(),
                }
                .into());
            }

            let moments = self.state.entry(name.clone()).or_insert_with(|| Moments {
                m: Tensor::zeros(value.shape(), DType::F32),
                v: Tensor::zeros(value.shape(), DType::F32),
                step: 0,
            });
            moments.step += 1;

            let bias_correction1 = 1.0 - (b1 as f64).powi(moments.step as i32);
            let bias_correction2 = 1.0 - (b2 as f64).powi(moments.step as i32);
            let (bc1, bc2) = (bias_correction1 as f32, bias_correction2 as f32);

            let (Storage::F32(m), Storage::F32(v)) =
                (moments.m.storage_mut(), moments.v.storage_mut())
            else {
                return Err(TensorError::Unsupported(format!("{name}: moments must be f32")).into());
            };
            let g = grad.to_f32_vec();
            let mut p = value.to_f32_vec();
            p.par_iter_mut()
                .zip(g.par_iter())
                .zip(m.par_iter_mut())
                .zip(v.par_iter_mut())
                .for_each(|(((p, g), m), v)| {
                    *m = b1 * *m + (1.0 - b1) * *g;
                    *v = b2 * *v + (1.0 - b2) * *g * *g;
                    let m_hat = *m / bc1;
                    let v_hat = *v / bc2;
                    *p -= lr * (m_hat / (v_hat.sqrt() + eps) + lambda * *p);
                });

            let dtype = value.dtype();
            *value.storage_mut() = Storage::from_f32(dtype, &p);
        }
        Ok(())
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn lr(&self) -> f32 {
        self.learning_rate
    }

    fn state_dict(&self) -> BTreeMap<String, Tensor> {
        let mut out = BTreeMap::new();
        for (name, s) in &self.state {
            out.insert(format!("{name}.exp_avg"), s.m.clone());
            out.insert(format!("{name}.exp_avg_sq"), s.v.clone());
            out.insert(
                format!("{name}.step"),
                Tensor::full(&[1], s.step as f32, DType::F32),
            );
        }
        out
    }

    fn load_state_dict(&mut self, state: &BTreeMap<String, Tensor>) -> Result<()> {
        let mut restored = BTreeMap::new();
        for (key, tensor) in state {
            let Some(name) = key.strip_suffix(".step") else {
                continue;
            };
            let moment = |suffix: &str| {
                state
                    .get(&format!("{name}.{suffix}"))
                    .ok_or_else(|| config_err(format!("optimizer state is missing `{name}.{suffix}`")))
            };
            let m = moment("exp_avg")?;
            let v = moment("exp_avg_sq")?;
            if m.shape() != v.shape() {
                return Err(TensorError::ShapeMismatch {
                    expected: m.shape().to_vec(),
                    got: v.shape().to_vec(),
                }
                .into());
            }
            let step = tensor.to_f32_vec().first().copied().unwrap_or(0.0) as u64;
            restored.insert(
                name.to_string(),
                Moments {
                    m: m.to_dtype(DType::F32),
                    v: v.to_dtype(DType::F32),
                    step,
                },
            );
        }
        self.state = restored;
        Ok(())
    }
}
