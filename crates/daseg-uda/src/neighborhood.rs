//! Dilated local neighborhoods and the similarity kernel over them.
//!
//! Every pixel is compared with the `kernel_size²` pixels of a dilated
//! window centred on it. Neighbors are enumerated row-major over the window,
//! so index `i * kernel_size + j` always refers to offset
//! `((i - r) * dilation, (j - r) * dilation)` with `r = kernel_size / 2`, and
//! the centre pixel sits at index `kernel_size² / 2`. Positions outside the
//! image read as zeros.

use candle_core::{Result, Tensor};
use daseg_core::SimType;

const COSINE_EPS: f64 = 1e-8;

/// A dilated square window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub kernel_size: usize,
    pub dilation: usize,
}

impl Window {
    pub fn new(kernel_size: usize, dilation: usize) -> Self {
        Self {
            kernel_size,
            dilation,
        }
    }

    /// Number of neighbors per pixel, centre included.
    pub fn neighbors(&self) -> usize {
        self.kernel_size * self.kernel_size
    }

    /// Neighbor index of the zero offset.
    pub fn center(&self) -> usize {
        self.neighbors() / 2
    }

    pub fn padding(&self) -> usize {
        self.kernel_size / 2 * self.dilation
    }

    /// Extracts the neighborhood of every pixel.
    ///
    /// # Arguments
    /// * `x` - Tensor of shape [batch, channels, height, width]
    ///
    /// # Returns
    /// Tensor of shape [batch, channels, neighbors, height, width]
    pub fn unfold(&self, x: &Tensor) -> Result<Tensor> {
        let (_batch, _channels, height, width) = x.dims4()?;
        let pad = self.padding();

        let padded = x.pad_with_zeros(2, pad, pad)?.pad_with_zeros(3, pad, pad)?;

        let mut shifted = Vec::with_capacity(self.neighbors());
        for i in 0..self.kernel_size {
            for j in 0..self.kernel_size {
                let view = padded
                    .narrow(2, i * self.dilation, height)?
                    .narrow(3, j * self.dilation, width)?;
                shifted.push(view);
            }
        }

        Tensor::stack(&shifted, 2)
    }
}

/// Per-pixel similarity against every neighbor of a dilated window.
#[derive(Debug, Clone)]
pub struct LocalSimilarity {
    window: Window,
    sim_type: SimType,
    sigma: f64,
}

impl LocalSimilarity {
    pub fn new(window: Window, sim_type: SimType, sigma: f64) -> Self {
        Self {
            window,
            sim_type,
            sigma,
        }
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Similarity map of a feature tensor.
    ///
    /// # Arguments
    /// * `feats` - Features [batch, channels, height, width]
    ///
    /// # Returns
    /// Similarities [batch, neighbors, height, width]
    pub fn forward(&self, feats: &Tensor) -> Result<Tensor> {
        let neighbors = self.window.unfold(feats)?;
        let center = feats.unsqueeze(2)?;

        match self.sim_type {
            SimType::Gaussian => {
                let dist = neighbors.broadcast_sub(&center)?.sqr()?.sum(1)?;
                (dist * (-1.0 / (self.sigma * self.sigma)))?.exp()
            }
            SimType::Cosine => {
                let dot = neighbors.broadcast_mul(&center)?.sum(1)?;
                let neighbor_sq = neighbors.sqr()?.sum(1)?;
                let center_sq = center.sqr()?.sum(1)?;
                // sqrt(max(|a|²|b|², eps²)) keeps the gradient finite on zero vectors
                let denom = neighbor_sq
                    .broadcast_mul(&center_sq)?
                    .maximum(COSINE_EPS * COSINE_EPS)?
                    .sqrt()?;
                dot / denom
            }
        }
    }
}

/// Indices of the `k` most (or least) similar neighbors of every pixel.
///
/// # Arguments
/// * `sim` - Similarities [batch, neighbors, height, width]
///
/// # Returns
/// u32 indices [batch, k, height, width]
pub fn top_k_neighbors(sim: &Tensor, k: usize, largest: bool) -> Result<Tensor> {
    let order = sim
        .detach()
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .arg_sort_last_dim(!largest)?;

    order.narrow(3, 0, k)?.permute((0, 3, 1, 2))?.contiguous()
}

/// Gathers neighbor entries of `x` [batch, neighbors, height, width] at `indices`.
pub fn gather_neighbors(x: &Tensor, indices: &Tensor) -> Result<Tensor> {
    x.contiguous()?.gather(indices, 1)
}
