use super::backend::CollectiveBackend;
use crate::error::Result;
use crate::tensor::{Tensor, TensorError};

/// Adds a `[out]` bias to every row of a `[batch, out]` activation.
fn add_row_bias(y: &mut Tensor, bias: &Tensor) -> Result<()> {
    let out = y.shape().last().copied().unwrap_or(0);
    if bias.shape() != [out] {
        return Err(TensorError::ShapeMismatch {
            expected: vec![out],
            got: bias.shape().to_vec(),
        }
        .into());
    }
    let rows = y.numel() / out.max(1);
    let tiled: Vec<f32> = bias
        .to_f32_vec()
        .iter()
        .copied()
        .cycle()
        .take(rows * out)
        .collect();
    y.add_assign(&Tensor::new(tiled, y.shape())?)?;
    Ok(())
}

/// Linear layer whose weight is split along the **output** features.
///
/// # 🧠 The Math
///
/// With `W` stored `[out, in]` and split into row blocks `W_1, W_2`:
/// $$
/// Y = X W^T = [X W_1^T \,|\, X W_2^T] = [Y_1 \,|\, Y_2]
/// $$
/// - The input `X` is replicated.
/// - Each rank computes a slice of the output features; no communication in forward.
pub struct ColumnParallelLinear {
    /// Local shard, `[out / tp, in]`.
    pub weight: Tensor,
    /// Local shard, `[out / tp]`.
    pub bias: Option<Tensor>,
}

impl ColumnParallelLinear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }

    /// `x: [batch, in]` → `[batch, out / tp]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut y = x.matmul(&self.weight.t()?)?;
        if let Some(bias) = &self.bias {
            add_row_bias(&mut y, bias)?;
        }
        Ok(y)
    }

    /// Reassembles the full output features from every rank's slice.
    pub fn gather_output<B: CollectiveBackend>(y_local: &Tensor, tp_group: &B) -> Result<Tensor> {
        tp_group.all_gather(y_local, 1)
    }
}

/// The un-reduced output of a [`RowParallelLinear`].
///
/// The only way to turn it into a usable activation is [`PartialSum::all_reduce`], so a
/// row-parallel forward that forgets its reduction does not type-check.
#[must_use = "a row-parallel output is meaningless until it is all-reduced"]
pub struct PartialSum {
    partial: Tensor,
    bias: Option<Tensor>,
}

impl PartialSum {
    /// Sums the partial outputs over the tensor-parallel group, then adds the replicated bias.
    pub fn all_reduce<B: CollectiveBackend>(self, tp_group: &B) -> Result<Tensor> {
        let mut y = self.partial;
        tp_group.all_reduce_sum(&mut y)?;
        if let Some(bias) = &self.bias {
            add_row_bias(&mut y, bias)?;
        }
        Ok(y)
    }
}

/// Linear layer whose weight is split along the **input** features.
///
/// # 🧠 The Math
///
/// With `W` split into column blocks and `X` split to match:
/// $$
/// Y = [X_1 \,|\, X_2] [W_1 \,|\, W_2]^T = X_1 W_1^T + X_2 W_2^T
/// $$
/// - Each rank computes a *partial sum* of the full output.
/// - **Communication**: All-Reduce (Sum) over the TP group.
pub struct RowParallelLinear {
    /// Local shard, `[out, in / tp]`.
    pub weight: Tensor,
    /// Replicated, `[out]`.
    pub bias: Option<Tensor>,
}

impl RowParallelLinear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }

    /// `x_local: [batch, in / tp]` → partial `[batch, out]`.
    pub fn forward(&self, x_local: &Tensor) -> Result<PartialSum> {
        Ok(PartialSum {
            partial: x_local.matmul(&self.weight.t()?)?,
            bias: self.bias.clone(),
        })
    }
}
