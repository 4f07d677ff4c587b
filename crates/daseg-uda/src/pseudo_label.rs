//! Pseudo-labels and confidence weights from teacher predictions.

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax;
use daseg_core::{Result, UdaConfig};

#[derive(Debug, Clone)]
pub struct PseudoLabels {
    /// Teacher argmax [batch, height, width], u32
    pub labels: Tensor,
    /// Per-pixel loss weight [batch, height, width], f32
    pub weight: Tensor,
    /// Fraction of pixels whose max probability reaches the threshold
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct PseudoLabeler {
    threshold: f64,
    ignore_top: usize,
    ignore_bottom: usize,
}

impl PseudoLabeler {
    pub fn new(threshold: f64, ignore_top: usize, ignore_bottom: usize) -> Self {
        Self {
            threshold,
            ignore_top,
            ignore_bottom,
        }
    }

    pub fn from_config(config: &UdaConfig) -> Self {
        Self::new(
            config.pseudo_threshold,
            config.pseudo_weight_ignore_top,
            config.pseudo_weight_ignore_bottom,
        )
    }

    /// Row mask [1, height, 1] that is 0 in the ignored top and bottom rows.
    pub fn border_mask(&self, height: usize, device: &candle_core::Device) -> Result<Tensor> {
        let top = self.ignore_top.min(height);
        let bottom = self.ignore_bottom.min(height - top);
        let rows: Vec<f32> = (0..height)
            .map(|r| if r < top || r >= height - bottom { 0.0 } else { 1.0 })
            .collect();
        Ok(Tensor::from_vec(rows, (1, height, 1), device)?)
    }

    /// Labels and weights from teacher logits [batch, classes, height, width].
    pub fn label(&self, logits: &Tensor) -> Result<PseudoLabels> {
        let prob = softmax(&logits.detach(), 1)?;
        let max_prob = prob.max(1)?;
        let labels = prob.argmax(1)?;

        let confident = max_prob
            .ge(self.threshold)?
            .to_dtype(DType::F32)?
            .mean_all()?
            .to_scalar::<f32>()?;

        let (_, height, _) = max_prob.dims3()?;
        let weight = self
            .border_mask(height, logits.device())?
            .broadcast_as(max_prob.shape())?
            .affine(confident as f64, 0.0)?;

        Ok(PseudoLabels {
            labels,
            weight,
            confidence: confident,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};

    #[test]
    fn test_weight_is_confident_fraction() -> Result<()> {
        let device = Device::Cpu;
        // Pixel 0 confident on class 1, pixel 1 uniform
        let logits = Tensor::new(&[[[[-10f32, 0.0]], [[10.0, 0.0]]]], &device)?;
        let labeler = PseudoLabeler::new(0.9, 0, 0);

        let pl = labeler.label(&logits)?;
        assert_eq!(pl.confidence, 0.5);
        assert_eq!(pl.labels.i((0, 0, 0))?.to_scalar::<u32>()?, 1);

        let weights: Vec<f32> = pl.weight.flatten_all()?.to_vec1()?;
        assert_eq!(weights, vec![0.5, 0.5]);
        Ok(())
    }

    #[test]
    fn test_border_rows_are_zero() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (2, 3, 6, 4), &device)?;
        let labeler = PseudoLabeler::new(0.0, 2, 1);

        let pl = labeler.label(&logits)?;
        // Threshold 0 keeps every pixel
        assert_eq!(pl.confidence, 1.0);

        let rows = pl.weight.i((.., .., 0))?.to_vec2::<f32>()?;
        for sample in rows {
            assert_eq!(sample, vec![0.0, 0.0, 1.0, 1.0, 1.0, 0.0]);
        }
        Ok(())
    }

    #[test]
    fn test_border_clamped_to_height() -> Result<()> {
        let device = Device::Cpu;
        let labeler = PseudoLabeler::new(0.5, 10, 10);

        let mask: Vec<f32> = labeler.border_mask(4, &device)?.flatten_all()?.to_vec1()?;
        assert_eq!(mask, vec![0.0; 4]);
        Ok(())
    }

    #[test]
    fn test_weight_bounds() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 3.0, (2, 4, 5, 5), &device)?;
        let pl = PseudoLabeler::new(0.7, 1, 1).label(&logits)?;

        let values: Vec<f32> = pl.weight.flatten_all()?.to_vec1()?;
        assert!(values.iter().all(|w| (0.0..=1.0).contains(w)));
        assert_eq!(pl.labels.dims(), &[2, 5, 5]);
        Ok(())
    }
}
