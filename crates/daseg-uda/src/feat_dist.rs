//! Feature-distance regularization against a frozen reference network.

use candle_core::Tensor;
use daseg_core::{EmptyMaskPolicy, Error, Result, UdaConfig};

use crate::labels::{class_membership, downscale_label_ratio};
use crate::losses::masked_mean;

/// Log key of the regularization term.
pub const FEAT_DIST_KEY: &str = "loss_imnet_feat_dist";

const NORM_EPS: f64 = 1e-12;

/// Per-location L2 distance over channels, [batch, height, width].
pub fn pixelwise_distance(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let sq = (a - b)?.sqr()?.sum(1)?;
    Ok(sq.maximum(NORM_EPS)?.sqrt()?)
}

/// Masked feature distance between the trainable model and the reference.
#[derive(Debug, Clone)]
pub struct FeatureDistance {
    lambda: f64,
    classes: Option<Vec<u32>>,
    scale_min_ratio: f64,
    num_classes: usize,
    ignore_index: u32,
    policy: EmptyMaskPolicy,
}

impl FeatureDistance {
    pub fn new(config: &UdaConfig, num_classes: usize) -> Self {
        Self {
            lambda: config.imnet_feature_dist_lambda,
            classes: config.imnet_feature_dist_classes.clone(),
            scale_min_ratio: config.imnet_feature_dist_scale_min_ratio,
            num_classes,
            ignore_index: config.ignore_index,
            policy: config.empty_mask_policy,
        }
    }

    pub fn enabled(&self) -> bool {
        self.lambda > 0.0
    }

    /// Locations of a feature map that take part in the distance.
    ///
    /// # Arguments
    /// * `gt` - u32 labels [batch, height, width] at image resolution
    /// * `feat_width` - width of the feature map
    ///
    /// # Returns
    /// u8 mask [batch, feat_height, feat_width], or `None` when every
    /// location counts
    pub fn mask(&self, gt: &Tensor, feat_width: usize) -> Result<Option<Tensor>> {
        let Some(classes) = &self.classes else {
            return Ok(None);
        };
        let (_, _, gt_width) = gt.dims3()?;
        if feat_width == 0 || gt_width % feat_width != 0 {
            return Err(Error::ShapeMismatch(format!(
                "label width {gt_width} is not a multiple of feature width {feat_width}"
            )));
        }
        let coarse = downscale_label_ratio(
            gt,
            gt_width / feat_width,
            self.scale_min_ratio,
            self.num_classes,
            self.ignore_index,
        )?;
        Ok(Some(class_membership(&coarse, classes)?))
    }

    /// Weighted distance term, or `None` when the regularizer is disabled.
    ///
    /// `reference` produces the reference model's last feature level and is
    /// only invoked when the term is enabled.
    pub fn compute<F>(&self, feat: &Tensor, gt: &Tensor, reference: F) -> Result<Option<Tensor>>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        if !self.enabled() {
            return Ok(None);
        }

        let reference = reference()?.detach();
        if reference.dims() != feat.dims() {
            return Err(Error::ShapeMismatch(format!(
                "reference features {:?} do not match features {:?}",
                reference.dims(),
                feat.dims()
            )));
        }

        let dist = pixelwise_distance(feat, &reference)?;
        let mean = match self.mask(gt, feat.dim(3)?)? {
            Some(mask) => masked_mean(&dist, &mask, self.policy, FEAT_DIST_KEY)?,
            None => dist.mean_all()?,
        };
        Ok(Some((mean * self.lambda)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn config(lambda: f64, classes: Option<Vec<u32>>) -> UdaConfig {
        UdaConfig {
            imnet_feature_dist_lambda: lambda,
            imnet_feature_dist_classes: classes,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_lambda_skips_reference() -> Result<()> {
        let device = Device::Cpu;
        let feat = Tensor::ones((1, 2, 2, 2), DType::F32, &device)?;
        let gt = Tensor::zeros((1, 4, 4), DType::U32, &device)?;
        let fd = FeatureDistance::new(&config(0.0, None), 3);

        let mut called = false;
        let out = fd.compute(&feat, &gt, || {
            called = true;
            Ok(feat.clone())
        })?;

        assert!(out.is_none());
        assert!(!called);
        Ok(())
    }

    #[test]
    fn test_unmasked_distance() -> Result<()> {
        let device = Device::Cpu;
        let feat = Tensor::zeros((1, 2, 2, 2), DType::F32, &device)?;
        // Distance 5 everywhere
        let reference = Tensor::new(&[3f32, 4.0], &device)?
            .reshape((1, 2, 1, 1))?
            .broadcast_as((1, 2, 2, 2))?
            .contiguous()?;
        let gt = Tensor::zeros((1, 4, 4), DType::U32, &device)?;
        let fd = FeatureDistance::new(&config(0.5, None), 3);

        let out = fd.compute(&feat, &gt, || Ok(reference))?;
        let value = out.map(|t| t.to_scalar::<f32>()).transpose()?;
        assert!((value.unwrap_or_default() - 2.5).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_class_masked_distance() -> Result<()> {
        let device = Device::Cpu;
        let feat = Tensor::zeros((1, 1, 2, 2), DType::F32, &device)?;
        let reference = Tensor::new(&[[[[1f32, 2.0], [3.0, 4.0]]]], &device)?;
        // Coarse labels [[1, 2], [0, 1]]
        let gt = Tensor::new(
            &[[
                [1u32, 1, 2, 2],
                [1, 1, 2, 2],
                [0, 0, 1, 1],
                [0, 0, 1, 1],
            ]],
            &device,
        )?;
        let fd = FeatureDistance::new(&config(1.0, Some(vec![1])), 3);

        let out = fd.compute(&feat, &gt, || Ok(reference))?;
        let value = out.map(|t| t.to_scalar::<f32>()).transpose()?;
        // Mean of distances 1 and 4
        assert!((value.unwrap_or_default() - 2.5).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_reference_shape_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let feat = Tensor::zeros((1, 2, 2, 2), DType::F32, &device)?;
        let gt = Tensor::zeros((1, 4, 4), DType::U32, &device)?;
        let fd = FeatureDistance::new(&config(1.0, None), 3);

        let err = fd
            .compute(&feat, &gt, || {
                Ok(Tensor::zeros((1, 3, 2, 2), DType::F32, &device)?)
            })
            .unwrap_err();
        assert!(err.is_shape_mismatch());
        Ok(())
    }
}
