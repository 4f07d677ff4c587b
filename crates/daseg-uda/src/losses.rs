//! Auxiliary losses evaluated on the tensor bundle of a training step.

use candle_core::{DType, Tensor};
use daseg_core::{
    AuxLossConfig, BundleField, EmptyMaskPolicy, Error, LossMap, Result, TensorBundle, VisMap,
};

use crate::feat_sim::{AdaptiveFeatSimLoss, FeatSimLoss};

/// Scalar losses and visualization artifacts returned by one auxiliary loss.
#[derive(Debug, Clone, Default)]
pub struct AuxOutput {
    pub losses: LossMap,
    pub vis: VisMap,
}

/// The closed set of auxiliary losses.
#[derive(Debug, Clone)]
pub enum AuxLoss {
    FeatSim(FeatSimLoss),
    AdaptiveFeatSim(AdaptiveFeatSimLoss),
}

impl AuxLoss {
    pub fn from_config(
        config: &AuxLossConfig,
        policy: EmptyMaskPolicy,
        ignore_index: u32,
    ) -> Result<Self> {
        match config {
            AuxLossConfig::FeatSim(c) => Ok(AuxLoss::FeatSim(FeatSimLoss::new(c.clone(), policy)?)),
            AuxLossConfig::AdaptiveFeatSim(c) => Ok(AuxLoss::AdaptiveFeatSim(
                AdaptiveFeatSimLoss::new(c.clone(), policy, ignore_index)?,
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuxLoss::FeatSim(_) => "FeatSimLoss",
            AuxLoss::AdaptiveFeatSim(_) => "AdaptiveFeatSimLoss",
        }
    }

    /// Namespace of this loss's entries in the step's log vars.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            AuxLoss::FeatSim(_) => "feat_sim",
            AuxLoss::AdaptiveFeatSim(_) => "adaptive_feat_sim",
        }
    }

    /// Bundle fields read by [`AuxLoss::compute`].
    pub fn required_fields(&self) -> &'static [BundleField] {
        match self {
            AuxLoss::FeatSim(_) => FeatSimLoss::REQUIRED,
            AuxLoss::AdaptiveFeatSim(_) => AdaptiveFeatSimLoss::REQUIRED,
        }
    }

    /// Fails unless every required field is among `provided`.
    pub fn check_fields(&self, provided: &[BundleField]) -> Result<()> {
        match self
            .required_fields()
            .iter()
            .find(|f| !provided.contains(*f))
        {
            Some(field) => Err(Error::Config(format!(
                "{} needs `{field}`, which the training step does not produce",
                self.name()
            ))),
            None => Ok(()),
        }
    }

    pub fn feat_level(&self) -> usize {
        match self {
            AuxLoss::FeatSim(l) => l.feat_level(),
            AuxLoss::AdaptiveFeatSim(l) => l.feat_level(),
        }
    }

    pub fn compute(&self, bundle: &TensorBundle) -> Result<AuxOutput> {
        bundle.require(self.required_fields())?;
        match self {
            AuxLoss::FeatSim(l) => l.compute(bundle),
            AuxLoss::AdaptiveFeatSim(l) => l.compute(bundle),
        }
    }
}

/// Mean of `values` over the positions where `mask` is non-zero.
///
/// `mask` is broadcast to the shape of `values`. An empty mask is resolved
/// by `policy`.
pub fn masked_mean(
    values: &Tensor,
    mask: &Tensor,
    policy: EmptyMaskPolicy,
    term: &str,
) -> Result<Tensor> {
    let mask = mask
        .to_dtype(values.dtype())?
        .broadcast_as(values.shape())?;
    let count = mask.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;

    if count > 0.0 {
        let total = values.broadcast_mul(&mask)?.sum_all()?;
        return Ok((total / count)?);
    }

    match policy {
        EmptyMaskPolicy::Zero => {
            tracing::warn!("{term}: mask selects no element, term set to zero");
            Ok(Tensor::zeros((), values.dtype(), values.device())?)
        }
        EmptyMaskPolicy::Nan => Ok(Tensor::new(f32::NAN, values.device())?.to_dtype(values.dtype())?),
        EmptyMaskPolicy::Fail => Err(Error::NumericDegeneracy {
            term: term.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_masked_mean() -> Result<()> {
        let device = Device::Cpu;
        let values = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &device)?;
        let mask = Tensor::new(&[[1u8, 0], [1, 0]], &device)?;

        let mean = masked_mean(&values, &mask, EmptyMaskPolicy::Fail, "t")?;
        assert_eq!(mean.to_scalar::<f32>()?, 2.0);
        Ok(())
    }

    #[test]
    fn test_masked_mean_broadcasts_mask() -> Result<()> {
        let device = Device::Cpu;
        let values = Tensor::new(&[[[1f32, 5.0]], [[3.0, 7.0]]], &device)?;
        let mask = Tensor::new(&[[[1f32, 0.0]]], &device)?;

        let mean = masked_mean(&values, &mask, EmptyMaskPolicy::Fail, "t")?;
        assert_eq!(mean.to_scalar::<f32>()?, 2.0);
        Ok(())
    }

    #[test]
    fn test_empty_mask_policies() -> Result<()> {
        let device = Device::Cpu;
        let values = Tensor::new(&[1f32, 2.0], &device)?;
        let mask = Tensor::zeros(2, DType::F32, &device)?;

        let zero = masked_mean(&values, &mask, EmptyMaskPolicy::Zero, "t")?;
        assert_eq!(zero.to_scalar::<f32>()?, 0.0);

        let nan = masked_mean(&values, &mask, EmptyMaskPolicy::Nan, "t")?;
        assert!(nan.to_scalar::<f32>()?.is_nan());

        let err = masked_mean(&values, &mask, EmptyMaskPolicy::Fail, "loss_x").unwrap_err();
        assert!(matches!(err, Error::NumericDegeneracy { term } if term == "loss_x"));
        Ok(())
    }
}
