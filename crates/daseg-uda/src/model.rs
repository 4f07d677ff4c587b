//! Reference segmentation network: dilated ResNet backbone with a DeepLab
//! decode head.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use daseg_core::{Error, ImgMeta, LossMap, Pyramid, Result, IGNORE_INDEX};

use crate::backbone::{BackboneConfig, ResNetBackbone};
use crate::heads::{pixel_accuracy, weighted_cross_entropy, DecodeHeadConfig, DeepLabHead};
use crate::labels::resize_nearest;
use crate::segmentor::{Segmentor, TrainOutput};

/// Complete model configuration
#[derive(Debug, Clone)]
pub struct SegNetConfig {
    pub backbone: BackboneConfig,
    /// Channel counts of the head are derived from the backbone
    pub head: DecodeHeadConfig,
    pub ignore_index: u32,
}

impl Default for SegNetConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneConfig::default(),
            head: DecodeHeadConfig::default(),
            ignore_index: IGNORE_INDEX,
        }
    }
}

impl SegNetConfig {
    /// A few-thousand-parameter network at output stride 2, for tests and
    /// smoke runs on small images.
    pub fn tiny(num_classes: usize) -> Self {
        Self {
            backbone: BackboneConfig {
                base_channels: 4,
                block_counts: [1, 1, 1, 1],
                strides: [1, 1, 1, 1],
                dilations: [1, 1, 2, 2],
                stem_stride: 2,
                stem_pool: false,
                norm_groups: 4,
                ..Default::default()
            },
            head: DecodeHeadConfig {
                channels: 16,
                low_level_proj: 8,
                dilations: vec![1, 2],
                num_classes,
                dropout_ratio: 0.1,
                norm_groups: 4,
                ..Default::default()
            },
            ignore_index: IGNORE_INDEX,
        }
    }
}

/// Segmentation network used by the adaptation step
pub struct SegNet {
    backbone: ResNetBackbone,
    decode_head: DeepLabHead,
    config: SegNetConfig,
}

impl SegNet {
    pub fn new(mut config: SegNetConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let stage_channels = config.backbone.stage_channels();
        config.head.low_level_channels = stage_channels[0];
        config.head.in_channels = stage_channels[3];

        let backbone = ResNetBackbone::new(config.backbone.clone(), vb.pp("backbone"))?;
        let decode_head = DeepLabHead::new(config.head.clone(), vb.pp("decode_head"))?;

        Ok(Self {
            backbone,
            decode_head,
            config,
        })
    }

    pub fn config(&self) -> &SegNetConfig {
        &self.config
    }

    /// Backbone levels and decoder-resolution logits.
    fn features_and_logits(&self, img: &Tensor, train: bool) -> Result<(Vec<Tensor>, Tensor)> {
        let levels = self.backbone.forward(img)?;
        let logits = self.decode_head.forward(&levels, train)?;
        Ok((levels, logits))
    }
}

impl Segmentor for SegNet {
    fn num_classes(&self) -> usize {
        self.config.head.num_classes
    }

    fn num_feature_levels(&self) -> usize {
        self.config.backbone.stage_channels().len()
    }

    fn extract_feat(&self, img: &Tensor, _train: bool) -> Result<Pyramid> {
        Ok(Pyramid::new(self.backbone.forward(img)?))
    }

    fn encode_decode(
        &self,
        img: &Tensor,
        _metas: &[ImgMeta],
        train: bool,
    ) -> Result<(Tensor, Pyramid)> {
        let (_, _, height, width) = img.dims4()?;
        let (levels, logits) = self.features_and_logits(img, train)?;
        Ok((resize_nearest(&logits, height, width)?, Pyramid::new(levels)))
    }

    fn forward_train(
        &self,
        img: &Tensor,
        _metas: &[ImgMeta],
        gt: &Tensor,
        weight: Option<&Tensor>,
    ) -> Result<TrainOutput> {
        let (_, height, width) = gt.dims3()?;
        if let Some(w) = weight {
            if w.dims() != gt.dims() {
                return Err(Error::ShapeMismatch(format!(
                    "pixel weight {:?} does not match labels {:?}",
                    w.dims(),
                    gt.dims()
                )));
            }
        }

        let (levels, logits) = self.features_and_logits(img, true)?;
        let full = resize_nearest(&logits, height, width)?;

        let mut losses = LossMap::new();
        losses.insert(
            "decode.loss_seg".to_string(),
            weighted_cross_entropy(&full, gt, weight, self.config.ignore_index)?,
        );
        losses.insert(
            "decode.acc_seg".to_string(),
            pixel_accuracy(&full.detach(), gt, self.config.ignore_index)?,
        );

        Ok(TrainOutput {
            losses,
            features: Pyramid::new(levels),
            logits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny(num_classes: usize) -> Result<(VarMap, SegNet)> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = SegNet::new(SegNetConfig::tiny(num_classes), vb)?;
        Ok((varmap, model))
    }

    #[test]
    fn test_encode_decode_resolution() -> Result<()> {
        let device = Device::Cpu;
        let (_, model) = tiny(3)?;
        let img = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device)?;

        let (logits, feats) = model.encode_decode(&img, &[], false)?;
        assert_eq!(logits.dims(), &[2, 3, 8, 8]);
        assert_eq!(feats.depth(), model.num_feature_levels());
        assert_eq!(feats.level(2)?.dims(), &[2, 64, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_forward_train_losses() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, model) = tiny(3)?;
        let img = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device)?;
        let gt = Tensor::ones((2, 8, 8), DType::U32, &device)?;

        let out = model.forward_train(&img, &[], &gt, None)?;
        assert_eq!(out.logits.dims(), &[2, 3, 4, 4]);
        let loss = &out.losses["decode.loss_seg"];
        assert!(loss.to_scalar::<f32>()?.is_finite());

        // Gradients reach the backbone
        let grads = loss.backward()?;
        let stem = varmap
            .data()
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .get("backbone.stem_conv.weight")
            .cloned();
        let stem = stem.ok_or_else(|| Error::MissingParameter("stem".into()))?;
        assert!(grads.get(stem.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn test_weight_shape_checked() -> Result<()> {
        let device = Device::Cpu;
        let (_, model) = tiny(2)?;
        let img = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &device)?;
        let gt = Tensor::zeros((1, 8, 8), DType::U32, &device)?;
        let weight = Tensor::ones((1, 4, 4), DType::F32, &device)?;

        let err = model.forward_train(&img, &[], &gt, Some(&weight)).unwrap_err();
        assert!(err.is_shape_mismatch());
        Ok(())
    }
}
