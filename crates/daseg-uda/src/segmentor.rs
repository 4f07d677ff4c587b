//! Contract between the adaptation step and a segmentation network, plus the
//! named-parameter container every model instance lives in.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use daseg_core::{Error, ImgMeta, LossMap, Pyramid, Result};

/// Result of a supervised forward pass.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// Named losses and metrics, e.g. `decode.loss_seg`
    pub losses: LossMap,
    /// Backbone feature pyramid
    pub features: Pyramid,
    /// Logits at decoder resolution
    pub logits: Tensor,
}

/// A segmentation network usable by the adaptation step.
pub trait Segmentor {
    fn num_classes(&self) -> usize;

    /// Depth of the pyramid returned by [`Segmentor::extract_feat`].
    fn num_feature_levels(&self) -> usize;

    fn extract_feat(&self, img: &Tensor, train: bool) -> Result<Pyramid>;

    /// Logits resized to the input image, together with the backbone pyramid.
    fn encode_decode(&self, img: &Tensor, metas: &[ImgMeta], train: bool)
        -> Result<(Tensor, Pyramid)>;

    /// Supervised forward in training mode.
    ///
    /// `weight` is an optional per-pixel loss weight [batch, height, width].
    fn forward_train(
        &self,
        img: &Tensor,
        metas: &[ImgMeta],
        gt: &Tensor,
        weight: Option<&Tensor>,
    ) -> Result<TrainOutput>;
}

/// A model together with the named parameter map it was built from.
pub struct SegModel<M> {
    model: M,
    varmap: VarMap,
}

impl<M: Segmentor> SegModel<M> {
    /// Builds a fresh instance with its own parameters.
    pub fn build<F>(factory: &F, device: &Device) -> Result<Self>
    where
        F: Fn(VarBuilder) -> candle_core::Result<M>,
    {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = factory(vb)?;
        Ok(Self { model, varmap })
    }

    /// Overwrites the parameters with a safetensors checkpoint.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.varmap.load(path)?;
        tracing::info!(params = self.num_params()?, "loaded model weights");
        Ok(())
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        Ok(self.varmap.save(path)?)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> Result<usize> {
        Ok(snapshot(&self.varmap)?
            .values()
            .map(|t| t.elem_count())
            .sum())
    }
}

/// Current parameter values by name.
pub fn snapshot(varmap: &VarMap) -> Result<BTreeMap<String, Tensor>> {
    let data = varmap.data().lock().map_err(|_| Error::LockPoisoned)?;
    Ok(data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect())
}

/// Whether two parameter maps hold the same names with identical values.
pub fn params_equal(a: &VarMap, b: &VarMap) -> Result<bool> {
    let a = snapshot(a)?;
    let b = snapshot(b)?;
    if a.len() != b.len() {
        return Ok(false);
    }

    for (name, ta) in &a {
        let Some(tb) = b.get(name) else {
            return Ok(false);
        };
        if ta.dims() != tb.dims() {
            return Ok(false);
        }
        let differing = ta
            .ne(tb)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()?;
        if differing > 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Module;

    struct OneConv {
        conv: candle_nn::Conv2d,
    }

    impl Segmentor for OneConv {
        fn num_classes(&self) -> usize {
            2
        }

        fn num_feature_levels(&self) -> usize {
            1
        }

        fn extract_feat(&self, img: &Tensor, _train: bool) -> Result<Pyramid> {
            Ok(Pyramid::new(vec![self.conv.forward(img)?]))
        }

        fn encode_decode(
            &self,
            img: &Tensor,
            _metas: &[ImgMeta],
            train: bool,
        ) -> Result<(Tensor, Pyramid)> {
            let feats = self.extract_feat(img, train)?;
            Ok((feats.last()?.clone(), feats))
        }

        fn forward_train(
            &self,
            img: &Tensor,
            metas: &[ImgMeta],
            _gt: &Tensor,
            _weight: Option<&Tensor>,
        ) -> Result<TrainOutput> {
            let (logits, features) = self.encode_decode(img, metas, true)?;
            Ok(TrainOutput {
                losses: LossMap::new(),
                features,
                logits,
            })
        }
    }

    fn one_conv(vb: VarBuilder) -> candle_core::Result<OneConv> {
        let conv = candle_nn::conv2d(3, 2, 1, Default::default(), vb.pp("conv"))?;
        Ok(OneConv { conv })
    }

    #[test]
    fn test_instances_have_own_parameters() -> Result<()> {
        let device = Device::Cpu;
        let a = SegModel::build(&one_conv, &device)?;
        let b = SegModel::build(&one_conv, &device)?;

        assert_eq!(a.num_params()?, 3 * 2 + 2);
        assert!(params_equal(a.varmap(), a.varmap())?);
        // Independently initialized weights differ
        assert!(!params_equal(a.varmap(), b.varmap())?);
        Ok(())
    }

    #[test]
    fn test_snapshot_names() -> Result<()> {
        let device = Device::Cpu;
        let model = SegModel::build(&one_conv, &device)?;

        let names: Vec<String> = snapshot(model.varmap())?.into_keys().collect();
        assert_eq!(names, vec!["conv.bias".to_string(), "conv.weight".to_string()]);
        Ok(())
    }
}
