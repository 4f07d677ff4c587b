//! Exponential-moving-average teacher.
//!
//! The teacher is a full copy of the trainable model whose parameters are
//! only ever written here: copied verbatim at iteration 0, then blended
//! with `decay = min(1 - 1 / (t + 1), alpha)` on every later iteration.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use daseg_core::{Error, Result};

use crate::segmentor::{snapshot, SegModel, Segmentor};

/// Decay applied at iteration `iter` for an EMA ceiling of `alpha`.
pub fn ema_decay(iter: usize, alpha: f64) -> f64 {
    (1.0 - 1.0 / (iter as f64 + 1.0)).min(alpha)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmaState {
    Uninitialized,
    Bootstrapped,
    Tracking,
}

pub struct EmaTeacher<M> {
    model: SegModel<M>,
    alpha: f64,
    state: EmaState,
}

impl<M: Segmentor> EmaTeacher<M> {
    pub fn new(model: SegModel<M>, alpha: f64) -> Self {
        Self {
            model,
            alpha,
            state: EmaState::Uninitialized,
        }
    }

    pub fn model(&self) -> &SegModel<M> {
        &self.model
    }

    pub fn state(&self) -> EmaState {
        self.state
    }

    /// Bootstraps at iteration 0 and blends afterwards.
    ///
    /// # Returns
    /// The decay that was applied (0 for the bootstrap copy)
    pub fn step(&mut self, student: &VarMap, iter: usize) -> Result<f64> {
        if iter == 0 {
            self.bootstrap(student)?;
            Ok(0.0)
        } else {
            self.update(student, iter)
        }
    }

    /// Copies every student parameter into the teacher.
    pub fn bootstrap(&mut self, student: &VarMap) -> Result<()> {
        copy_params(student, self.model.varmap())?;
        self.state = EmaState::Bootstrapped;
        tracing::debug!("teacher bootstrapped from the trainable model");
        Ok(())
    }

    /// Blends the student into the teacher with the decay of `iter`.
    pub fn update(&mut self, student: &VarMap, iter: usize) -> Result<f64> {
        if self.state == EmaState::Uninitialized {
            return Err(Error::Config(
                "teacher must be bootstrapped before the first update".to_string(),
            ));
        }

        let decay = ema_decay(iter, self.alpha);
        let pending = pending_params(self.model.varmap(), student, |t, s| {
            Ok((t.affine(decay, 0.0)? + s.affine(1.0 - decay, 0.0)?)?.detach())
        })?;
        commit(pending)?;
        self.state = EmaState::Tracking;
        Ok(decay)
    }
}

/// Copies every parameter of `source` into the same-named parameter of
/// `target`. Nothing is written unless every name and shape matches.
pub fn copy_params(source: &VarMap, target: &VarMap) -> Result<()> {
    let pending = pending_params(target, source, |_, s| Ok(s.detach()))?;
    commit(pending)
}

/// Computes the new value of every `target` parameter without writing any.
fn pending_params<F>(target: &VarMap, source: &VarMap, blend: F) -> Result<Vec<(Var, Tensor)>>
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    let source = snapshot(source)?;
    let target = target.data().lock().map_err(|_| Error::LockPoisoned)?;

    if let Some(name) = source.keys().find(|name| !target.contains_key(*name)) {
        return Err(Error::MissingParameter(name.clone()));
    }

    let mut pending = Vec::with_capacity(target.len());
    for (name, var) in target.iter() {
        let value = source
            .get(name)
            .ok_or_else(|| Error::MissingParameter(name.clone()))?;
        if value.dims() != var.dims() {
            return Err(Error::ShapeMismatch(format!(
                "parameter `{name}`: shadow {:?}, source {:?}",
                var.dims(),
                value.dims()
            )));
        }
        pending.push((var.clone(), blend(var.as_tensor(), value)?));
    }
    Ok(pending)
}

fn commit(pending: Vec<(Var, Tensor)>) -> Result<()> {
    for (var, value) in pending {
        var.set(&value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentor::params_equal;
    use candle_core::{DType, Device, Module};
    use candle_nn::VarBuilder;
    use daseg_core::{ImgMeta, LossMap, Pyramid};

    use crate::segmentor::TrainOutput;

    struct Linear1 {
        layer: candle_nn::Linear,
    }

    impl Segmentor for Linear1 {
        fn num_classes(&self) -> usize {
            1
        }

        fn num_feature_levels(&self) -> usize {
            1
        }

        fn extract_feat(&self, img: &Tensor, _train: bool) -> Result<Pyramid> {
            Ok(Pyramid::new(vec![self.layer.forward(img)?]))
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

    fn linear(vb: VarBuilder) -> candle_core::Result<Linear1> {
        Ok(Linear1 {
            layer: candle_nn::linear(2, 2, vb.pp("fc"))?,
        })
    }

    fn set_all(varmap: &VarMap, value: f64) -> Result<()> {
        for (_, var) in snapshot_vars(varmap)? {
            let filled = (var.as_tensor().ones_like()? * value)?;
            var.set(&filled)?;
        }
        Ok(())
    }

    fn snapshot_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
        let data = varmap.data().lock().map_err(|_| Error::LockPoisoned)?;
        Ok(data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    #[test]
    fn test_ema_decay_schedule() {
        assert_eq!(ema_decay(0, 0.99), 0.0);
        assert_eq!(ema_decay(1, 0.99), 0.5);
        assert!((ema_decay(3, 0.99) - 0.75).abs() < 1e-12);
        assert_eq!(ema_decay(10_000, 0.99), 0.99);
    }

    #[test]
    fn test_bootstrap_then_track() -> Result<()> {
        let device = Device::Cpu;
        let student = SegModel::build(&linear, &device)?;
        let mut teacher = EmaTeacher::new(SegModel::build(&linear, &device)?, 0.99);
        assert_eq!(teacher.state(), EmaState::Uninitialized);

        assert_eq!(teacher.step(student.varmap(), 0)?, 0.0);
        assert_eq!(teacher.state(), EmaState::Bootstrapped);
        assert!(params_equal(teacher.model().varmap(), student.varmap())?);

        // teacher = 1, student = 3, decay 0.5 -> 2
        set_all(teacher.model().varmap(), 1.0)?;
        set_all(student.varmap(), 3.0)?;
        assert_eq!(teacher.step(student.varmap(), 1)?, 0.5);
        assert_eq!(teacher.state(), EmaState::Tracking);

        for (_, t) in snapshot(teacher.model().varmap())? {
            let values: Vec<f32> = t.flatten_all()?.to_vec1()?;
            assert!(values.iter().all(|v| (v - 2.0).abs() < 1e-6));
        }
        // The student is never written
        for (_, s) in snapshot(student.varmap())? {
            let values: Vec<f32> = s.flatten_all()?.to_vec1()?;
            assert!(values.iter().all(|v| *v == 3.0));
        }
        Ok(())
    }

    #[test]
    fn test_converges_to_frozen_student() -> Result<()> {
        let device = Device::Cpu;
        let student = SegModel::build(&linear, &device)?;
        let mut teacher = EmaTeacher::new(SegModel::build(&linear, &device)?, 0.9);

        teacher.step(student.varmap(), 0)?;
        set_all(teacher.model().varmap(), 0.0)?;
        set_all(student.varmap(), 1.0)?;
        for iter in 1..200 {
            teacher.step(student.varmap(), iter)?;
        }

        for (_, t) in snapshot(teacher.model().varmap())? {
            let values: Vec<f32> = t.flatten_all()?.to_vec1()?;
            assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-4));
        }
        Ok(())
    }

    #[test]
    fn test_update_requires_bootstrap() -> Result<()> {
        let device = Device::Cpu;
        let student = SegModel::build(&linear, &device)?;
        let mut teacher = EmaTeacher::new(SegModel::build(&linear, &device)?, 0.99);

        assert!(teacher.update(student.varmap(), 1).unwrap_err().is_config());
        Ok(())
    }

    #[test]
    fn test_missing_parameter_leaves_teacher_untouched() -> Result<()> {
        let device = Device::Cpu;
        let mut teacher = EmaTeacher::new(SegModel::build(&linear, &device)?, 0.99);
        let before = snapshot(teacher.model().varmap())?;

        let partial = VarMap::new();
        let vb = VarBuilder::from_varmap(&partial, DType::F32, &device);
        vb.pp("fc").get((2, 2), "weight")?;

        let err = teacher.bootstrap(&partial).unwrap_err();
        assert!(matches!(err, Error::MissingParameter(name) if name == "fc.bias"));

        let after = snapshot(teacher.model().varmap())?;
        for (name, t) in before {
            let diff = (t - &after[&name])?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert_eq!(diff, 0.0);
        }
        Ok(())
    }
}
