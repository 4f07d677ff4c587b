//! DeepLab-style decode head and its pixel-wise losses.
//!
//! Atrous spatial pyramid pooling over the deepest feature level, fused with
//! a projection of the shallowest level, predicts logits at the resolution
//! of that shallow level.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::ops::log_softmax;
use candle_nn::{conv2d, conv2d_no_bias, group_norm, Conv2d, Conv2dConfig, Dropout, GroupNorm, VarBuilder};

use crate::labels::{one_hot, resize_nearest};

const GN_EPS: f64 = 1e-5;

/// Configuration for the decode head
#[derive(Debug, Clone)]
pub struct DecodeHeadConfig {
    /// Channels of the deepest feature level
    pub in_channels: usize,
    /// Channels of the shallowest feature level
    pub low_level_channels: usize,
    /// Width of the ASPP branches and the fused features
    pub channels: usize,
    pub low_level_proj: usize,
    /// Dilation of every ASPP branch; 1 is a 1x1 branch
    pub dilations: Vec<usize>,
    pub num_classes: usize,
    pub dropout_ratio: f32,
    pub norm_groups: usize,
}

impl Default for DecodeHeadConfig {
    fn default() -> Self {
        Self {
            in_channels: 2048,
            low_level_channels: 256,
            channels: 512,
            low_level_proj: 48,
            dilations: vec![1, 12, 24, 36],
            num_classes: 19,
            dropout_ratio: 0.1,
            norm_groups: 32,
        }
    }
}

/// Conv + group norm + ReLU
struct ConvGnRelu {
    conv: Conv2d,
    norm: GroupNorm,
}

impl ConvGnRelu {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
        max_groups: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = Conv2dConfig {
            padding: kernel_size / 2 * dilation,
            dilation,
            ..Default::default()
        };
        let conv = conv2d_no_bias(in_channels, out_channels, kernel_size, config, vb.pp("conv"))?;
        let groups = (1..=max_groups.min(out_channels))
            .rev()
            .find(|g| out_channels % g == 0)
            .unwrap_or(1);
        let norm = group_norm(groups, out_channels, GN_EPS, vb.pp("gn"))?;
        Ok(Self { conv, norm })
    }
}

impl Module for ConvGnRelu {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.norm.forward(&self.conv.forward(x)?)?.relu()
    }
}

/// DeepLab decode head
pub struct DeepLabHead {
    aspp: Vec<ConvGnRelu>,
    image_pool: Conv2d,
    bottleneck: ConvGnRelu,
    low_level: ConvGnRelu,
    fuse: ConvGnRelu,
    dropout: Dropout,
    conv_seg: Conv2d,
    config: DecodeHeadConfig,
}

impl DeepLabHead {
    pub fn new(config: DecodeHeadConfig, vb: VarBuilder) -> Result<Self> {
        let c = config.channels;
        let g = config.norm_groups;

        let mut aspp = Vec::with_capacity(config.dilations.len());
        for (i, &d) in config.dilations.iter().enumerate() {
            let kernel = if d == 1 { 1 } else { 3 };
            aspp.push(ConvGnRelu::new(
                config.in_channels,
                c,
                kernel,
                d,
                g,
                vb.pp(format!("aspp_{i}")),
            )?);
        }

        // Image-level pooling branch
        let image_pool = conv2d(config.in_channels, c, 1, Default::default(), vb.pp("image_pool"))?;

        let bottleneck = ConvGnRelu::new(
            c * (config.dilations.len() + 1),
            c,
            3,
            1,
            g,
            vb.pp("bottleneck"),
        )?;
        let low_level = ConvGnRelu::new(
            config.low_level_channels,
            config.low_level_proj,
            1,
            1,
            g,
            vb.pp("c1_proj"),
        )?;
        let fuse = ConvGnRelu::new(c + config.low_level_proj, c, 3, 1, g, vb.pp("fuse"))?;

        let dropout = Dropout::new(config.dropout_ratio);
        let conv_seg = conv2d(c, config.num_classes, 1, Default::default(), vb.pp("conv_seg"))?;

        Ok(Self {
            aspp,
            image_pool,
            bottleneck,
            low_level,
            fuse,
            dropout,
            conv_seg,
            config,
        })
    }

    /// Forward pass producing logits
    ///
    /// # Arguments
    /// * `levels` - Backbone pyramid, shallow to deep
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Logits [batch, num_classes, h0, w0] at the resolution of `levels[0]`
    pub fn forward(&self, levels: &[Tensor], train: bool) -> Result<Tensor> {
        let (Some(shallow), Some(deep)) = (levels.first(), levels.last()) else {
            candle_core::bail!("decode head needs at least one feature level")
        };
        let (batch, _, h, w) = deep.dims4()?;

        let mut branches = Vec::with_capacity(self.aspp.len() + 1);
        let pooled = deep.mean_keepdim(D::Minus2)?.mean_keepdim(D::Minus1)?;
        let pooled = self.image_pool.forward(&pooled)?.relu()?;
        branches.push(pooled.broadcast_as((batch, self.config.channels, h, w))?.contiguous()?);
        for branch in &self.aspp {
            branches.push(branch.forward(deep)?);
        }
        let x = self.bottleneck.forward(&Tensor::cat(&branches, 1)?)?;

        let (_, _, h0, w0) = shallow.dims4()?;
        let x = resize_nearest(&x, h0, w0)?;
        let low = self.low_level.forward(shallow)?;
        let x = self.fuse.forward(&Tensor::cat(&[x, low], 1)?)?;

        let x = self.dropout.forward(&x, train)?;
        self.conv_seg.forward(&x)
    }

    pub fn config(&self) -> &DecodeHeadConfig {
        &self.config
    }
}

/// Pixel-weighted cross-entropy, averaged over every pixel.
///
/// Pixels labelled `ignore_index` contribute zero.
///
/// # Arguments
/// * `logits` - [batch, classes, height, width], same resolution as `labels`
/// * `labels` - u32 [batch, height, width]
/// * `weight` - Optional per-pixel weight [batch, height, width]
pub fn weighted_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    weight: Option<&Tensor>,
    ignore_index: u32,
) -> Result<Tensor> {
    let num_classes = logits.dim(1)?;
    let log_prob = log_softmax(logits, 1)?;
    let target = one_hot(labels, num_classes)?.to_dtype(log_prob.dtype())?;
    let nll = (log_prob * target)?.sum(1)?.neg()?;

    let valid = labels.ne(ignore_index as f64)?.to_dtype(nll.dtype())?;
    let pixel_weight = match weight {
        Some(w) => (valid * w.to_dtype(nll.dtype())?)?,
        None => valid,
    };
    (nll * pixel_weight)?.mean_all()
}

/// Percentage of non-ignored pixels whose argmax matches the label.
pub fn pixel_accuracy(logits: &Tensor, labels: &Tensor, ignore_index: u32) -> Result<Tensor> {
    let pred = logits.argmax(1)?;
    let labels = labels.to_dtype(DType::U32)?;
    let valid = labels.ne(ignore_index as f64)?.to_dtype(DType::F32)?;
    let correct = pred.eq(&labels)?.to_dtype(DType::F32)?;

    let n_valid = valid.sum_all()?.to_scalar::<f32>()?;
    if n_valid == 0.0 {
        return Tensor::new(0f32, logits.device());
    }
    let n_correct = (correct * valid)?.sum_all()?;
    n_correct.affine(100.0 / n_valid as f64, 0.0)
}
