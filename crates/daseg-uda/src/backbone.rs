//! Dilated ResNet backbone producing a four-level feature pyramid.
//!
//! Normalization is group norm, so the network carries no running
//! statistics and two instances with equal parameters behave identically.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, conv2d_no_bias, group_norm, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

const GN_EPS: f64 = 1e-5;

/// Largest group count `<= max_groups` that divides `channels`.
fn norm_groups(channels: usize, max_groups: usize) -> usize {
    (1..=max_groups.min(channels))
        .rev()
        .find(|g| channels % g == 0)
        .unwrap_or(1)
}

fn gn(channels: usize, max_groups: usize, vb: VarBuilder) -> Result<GroupNorm> {
    group_norm(norm_groups(channels, max_groups), channels, GN_EPS, vb)
}

/// Bottleneck residual block
struct Bottleneck {
    conv1: Conv2d,
    gn1: GroupNorm,
    conv2: Conv2d,
    gn2: GroupNorm,
    conv3: Conv2d,
    gn3: GroupNorm,
    downsample: Option<(Conv2d, GroupNorm)>,
}

impl Bottleneck {
    #[allow(clippy::too_many_arguments)]
    fn new(
        in_channels: usize,
        mid_channels: usize,
        out_channels: usize,
        stride: usize,
        dilation: usize,
        max_groups: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv1 = conv2d_no_bias(in_channels, mid_channels, 1, Default::default(), vb.pp("conv1"))?;
        let gn1 = gn(mid_channels, max_groups, vb.pp("gn1"))?;

        // 3x3 conv carries the stride and dilation
        let conv2_config = Conv2dConfig {
            padding: dilation,
            stride,
            dilation,
            ..Default::default()
        };
        let conv2 = conv2d_no_bias(mid_channels, mid_channels, 3, conv2_config, vb.pp("conv2"))?;
        let gn2 = gn(mid_channels, max_groups, vb.pp("gn2"))?;

        let conv3 = conv2d_no_bias(mid_channels, out_channels, 1, Default::default(), vb.pp("conv3"))?;
        let gn3 = gn(out_channels, max_groups, vb.pp("gn3"))?;

        let downsample = if stride != 1 || in_channels != out_channels {
            let ds_config = Conv2dConfig {
                stride,
                ..Default::default()
            };
            let ds_conv = conv2d_no_bias(in_channels, out_channels, 1, ds_config, vb.pp("ds_conv"))?;
            let ds_gn = gn(out_channels, max_groups, vb.pp("ds_gn"))?;
            Some((ds_conv, ds_gn))
        } else {
            None
        };

        Ok(Self {
            conv1,
            gn1,
            conv2,
            gn2,
            conv3,
            gn3,
            downsample,
        })
    }
}

impl Module for Bottleneck {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let identity = match &self.downsample {
            Some((conv, norm)) => norm.forward(&conv.forward(x)?)?,
            None => x.clone(),
        };

        let out = self.gn1.forward(&self.conv1.forward(x)?)?.relu()?;
        let out = self.gn2.forward(&self.conv2.forward(&out)?)?.relu()?;
        let out = self.gn3.forward(&self.conv3.forward(&out)?)?;

        (out + identity)?.relu()
    }
}

/// Dilated ResNet configuration
#[derive(Debug, Clone)]
pub struct BackboneConfig {
    pub in_channels: usize,
    /// Base channel width; stage `i` outputs `base_channels * 4 * 2^i`
    pub base_channels: usize,
    /// Block counts per stage, [3, 4, 6, 3] for ResNet-50
    pub block_counts: [usize; 4],
    pub strides: [usize; 4],
    pub dilations: [usize; 4],
    pub stem_stride: usize,
    /// 2x2 max pooling after the stem
    pub stem_pool: bool,
    /// Upper bound on the group count of every group norm
    pub norm_groups: usize,
}

impl Default for BackboneConfig {
    /// ResNet-50 at output stride 8.
    fn default() -> Self {
        Self {
            in_channels: 3,
            base_channels: 64,
            block_counts: [3, 4, 6, 3],
            strides: [1, 2, 1, 1],
            dilations: [1, 1, 2, 4],
            stem_stride: 2,
            stem_pool: true,
            norm_groups: 32,
        }
    }
}

impl BackboneConfig {
    /// Output channels of every stage.
    pub fn stage_channels(&self) -> [usize; 4] {
        let c = self.base_channels * 4;
        [c, c * 2, c * 4, c * 8]
    }
}

pub struct ResNetBackbone {
    stem_conv: Conv2d,
    stem_gn: GroupNorm,
    stages: Vec<Vec<Bottleneck>>,
    config: BackboneConfig,
}

impl ResNetBackbone {
    pub fn new(config: BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let c = config.base_channels;

        let stem_config = Conv2dConfig {
            padding: 3,
            stride: config.stem_stride,
            ..Default::default()
        };
        let stem_conv = conv2d(config.in_channels, c, 7, stem_config, vb.pp("stem_conv"))?;
        let stem_gn = gn(c, config.norm_groups, vb.pp("stem_gn"))?;

        let out_channels = config.stage_channels();
        let mut stages = Vec::with_capacity(4);
        let mut in_channels = c;
        for (i, &out) in out_channels.iter().enumerate() {
            stages.push(Self::make_stage(
                in_channels,
                c << i,
                out,
                &config,
                i,
                vb.pp(format!("stage{}", i + 1)),
            )?);
            in_channels = out;
        }

        Ok(Self {
            stem_conv,
            stem_gn,
            stages,
            config,
        })
    }

    fn make_stage(
        in_channels: usize,
        mid_channels: usize,
        out_channels: usize,
        config: &BackboneConfig,
        stage: usize,
        vb: VarBuilder,
    ) -> Result<Vec<Bottleneck>> {
        let n_blocks = config.block_counts[stage].max(1);
        let mut blocks = Vec::with_capacity(n_blocks);

        blocks.push(Bottleneck::new(
            in_channels,
            mid_channels,
            out_channels,
            config.strides[stage],
            config.dilations[stage],
            config.norm_groups,
            vb.pp("block_0"),
        )?);
        for i in 1..n_blocks {
            blocks.push(Bottleneck::new(
                out_channels,
                mid_channels,
                out_channels,
                1,
                config.dilations[stage],
                config.norm_groups,
                vb.pp(format!("block_{}", i)),
            )?);
        }

        Ok(blocks)
    }

    /// Forward pass returning the output of every stage, shallow to deep.
    ///
    /// # Arguments
    /// * `x` - Images [batch, in_channels, height, width]
    pub fn forward(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let mut x = self.stem_gn.forward(&self.stem_conv.forward(x)?)?.relu()?;
        if self.config.stem_pool {
            x = x.max_pool2d(2)?;
        }

        let mut levels = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            for block in stage {
                x = block.forward(&x)?;
            }
            levels.push(x.clone());
        }
        Ok(levels)
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_norm_groups() {
        assert_eq!(norm_groups(64, 32), 32);
        assert_eq!(norm_groups(24, 32), 24);
        assert_eq!(norm_groups(48, 32), 24);
        assert_eq!(norm_groups(7, 4), 1);
    }

    #[test]
    fn test_backbone_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = BackboneConfig {
            base_channels: 4,
            block_counts: [1, 1, 1, 1],
            norm_groups: 4,
            ..Default::default()
        };
        let backbone = ResNetBackbone::new(config, vb)?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &device)?;
        let levels = backbone.forward(&x)?;

        // Output stride 4 after stem and pool, 8 from stage 2 on
        assert_eq!(levels.len(), 4);
        assert_eq!(levels[0].dims(), &[2, 16, 8, 8]);
        assert_eq!(levels[1].dims(), &[2, 32, 4, 4]);
        assert_eq!(levels[2].dims(), &[2, 64, 4, 4]);
        assert_eq!(levels[3].dims(), &[2, 128, 4, 4]);
        Ok(())
    }
}
