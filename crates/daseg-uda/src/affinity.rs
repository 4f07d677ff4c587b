//! Soft same-class affinities between neighboring pixels.
//!
//! For class distributions `p` (centre) and `q` (neighbor) the diagonal of
//! the outer product `p_c · q_c` is the probability that both pixels belong
//! to class `c`; summed over classes it is the positive affinity.

use candle_core::{Result, Tensor};
use candle_nn::ops::softmax;

use crate::neighborhood::Window;

/// How the negative affinity is derived from the cross-probability map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeAffinity {
    /// Off-diagonal mass of the full outer product: `Σp · Σq − positive`.
    OffDiagonal,
    /// `1 − positive`.
    Complement,
}

/// Positive and negative affinity maps, both [batch, neighbors, height, width].
#[derive(Debug, Clone)]
pub struct Affinity {
    pub positive: Tensor,
    pub negative: Tensor,
}

/// Cross-probability computation over a dilated window.
#[derive(Debug, Clone)]
pub struct CrossProbability {
    window: Window,
}

impl CrossProbability {
    pub fn new(window: Window) -> Self {
        Self { window }
    }

    /// Centre/neighbor class products in [batch, classes, neighbors, height, width] layout.
    fn products(&self, prob: &Tensor) -> Result<(Tensor, Tensor)> {
        let neighbors = self.window.unfold(prob)?;
        let products = prob.unsqueeze(2)?.broadcast_mul(&neighbors)?;
        Ok((products, neighbors))
    }

    /// Diagonal of the per-neighbor outer product of class distributions.
    ///
    /// # Arguments
    /// * `logits` - Class scores [batch, classes, height, width]
    ///
    /// # Returns
    /// Tensor of shape [batch, classes, height, width, neighbors]
    pub fn diag(&self, logits: &Tensor) -> Result<Tensor> {
        let prob = softmax(logits, 1)?;
        let (products, _) = self.products(&prob)?;
        products.permute((0, 1, 3, 4, 2))
    }

    /// Positive and negative affinity of every pixel with each neighbor.
    pub fn affinity(&self, logits: &Tensor, negative: NegativeAffinity) -> Result<Affinity> {
        let prob = softmax(logits, 1)?;
        let (products, neighbors) = self.products(&prob)?;
        let positive = products.sum(1)?;

        let negative = match negative {
            NegativeAffinity::OffDiagonal => {
                let center_mass = prob.sum_keepdim(1)?;
                let neighbor_mass = neighbors.sum(1)?;
                (neighbor_mass.broadcast_mul(&center_mass)? - &positive)?
            }
            NegativeAffinity::Complement => positive.affine(-1.0, 1.0)?,
        };

        Ok(Affinity { positive, negative })
    }
}

/// Sums a cross-probability diagonal over classes: [batch, neighbors, height, width].
pub fn positive_affinity(diag: &Tensor) -> Result<Tensor> {
    diag.sum(1)?.permute((0, 3, 1, 2))?.contiguous()
}
