//! One training iteration of feature-mixing domain adaptation.
//!
//! The trainable model is supervised on the source batch and on a class-mix
//! of source and target, whose target pixels carry EMA-teacher
//! pseudo-labels. The composited source/teacher features feed the
//! auxiliary similarity losses, and an optional frozen reference model
//! regularizes the source features.

use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use daseg_core::{
    add_prefix, parse_losses, Batch, BundleField, Error, LogVars, LossMap, Pyramid, Result,
    TensorBundle, UdaConfig, VisArtifact, VisMap,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::augment::StrongAugParams;
use crate::ema::{copy_params, EmaTeacher};
use crate::feat_dist::{FeatureDistance, FEAT_DIST_KEY};
use crate::losses::AuxLoss;
use crate::mix::{mix_batch, sample_class_masks, MixStreams};
use crate::pseudo_label::PseudoLabeler;
use crate::segmentor::{snapshot, SegModel, Segmentor};

pub const VIS_SEG_MASK_SRC: &str = "vis|seg_mask_src";
pub const VIS_SEG_MASK_MIX: &str = "vis|seg_mask_mix";
pub const VIS_DENSITY_PSEUDO: &str = "vis|density_pseudo";
pub const VIS_PSEUDO_LABEL: &str = "vis|pseudo_label";

/// Bundle fields populated on every iteration.
const STEP_FIELDS: [BundleField; 10] = [
    BundleField::ImgSrc,
    BundleField::ImgMixed,
    BundleField::MetasSrc,
    BundleField::MetasTrg,
    BundleField::GtSrc,
    BundleField::FeatsSrc,
    BundleField::FeatsMixed,
    BundleField::FeatsTeacher,
    BundleField::LogitsSrc,
    BundleField::LogitsMixed,
];

/// Result of [`FmdaMix::train_step`].
pub struct StepOutput {
    /// Differentiable total loss
    pub loss: Tensor,
    /// Gradients of `loss`, ready for an optimizer step on the trainable model
    pub grads: GradStore,
    pub log_vars: LogVars,
    /// Empty on iterations that are not a multiple of `debug_img_interval`
    pub vis: VisMap,
    /// Index of the iteration that produced this output
    pub iteration: usize,
}

/// Feature-mixing domain adaptation around a segmentation network.
pub struct FmdaMix<M> {
    config: UdaConfig,
    model: SegModel<M>,
    teacher: EmaTeacher<M>,
    /// Frozen copy for the feature-distance regularizer
    reference: Option<SegModel<M>>,
    aux_losses: Vec<AuxLoss>,
    feature_dist: FeatureDistance,
    pseudo_labeler: PseudoLabeler,
    rng: StdRng,
    local_iter: usize,
}

impl<M: Segmentor> FmdaMix<M> {
    /// Builds the trainable model, its EMA teacher and, when the feature
    /// distance is enabled, the reference model from one factory.
    ///
    /// # Errors
    /// Configuration errors, feature levels the network does not produce,
    /// and auxiliary losses that need fields the step does not provide are
    /// all reported here rather than during training.
    pub fn new<F>(config: UdaConfig, device: &Device, factory: F) -> Result<Self>
    where
        F: Fn(VarBuilder) -> candle_core::Result<M>,
    {
        config.validate()?;

        let model = SegModel::build(&factory, device)?;
        let depth = model.model().num_feature_levels();
        check_level(config.feat_level, depth)?;

        let teacher = EmaTeacher::new(SegModel::build(&factory, device)?, config.alpha);

        let reference = if config.feature_dist_enabled() {
            let reference = SegModel::build(&factory, device)?;
            copy_params(model.varmap(), reference.varmap())?;
            Some(reference)
        } else {
            None
        };

        let aux_losses = config
            .aux_losses
            .iter()
            .map(|aux| AuxLoss::from_config(aux, config.empty_mask_policy, config.ignore_index))
            .collect::<Result<Vec<_>>>()?;

        let mut provided = STEP_FIELDS.to_vec();
        if reference.is_some() {
            provided.push(BundleField::FeatsReference);
        }
        for (i, aux) in aux_losses.iter().enumerate() {
            aux.check_fields(&provided)?;
            check_level(aux.feat_level(), depth)?;
            // Entries are namespaced per loss type
            if aux_losses[..i].iter().any(|a| a.key_prefix() == aux.key_prefix()) {
                return Err(Error::Config(format!(
                    "{} is configured more than once",
                    aux.name()
                )));
            }
        }

        let feature_dist = FeatureDistance::new(&config, model.model().num_classes());
        let pseudo_labeler = PseudoLabeler::from_config(&config);

        tracing::info!(
            params = model.num_params()?,
            feature_levels = depth,
            aux_losses = aux_losses.len(),
            feature_dist = feature_dist.enabled(),
            "feature-mixing adaptation initialized"
        );

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            model,
            teacher,
            reference,
            aux_losses,
            feature_dist,
            pseudo_labeler,
            local_iter: 0,
        })
    }

    /// Loads pretrained weights into the reference model.
    pub fn load_reference_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        match self.reference.as_mut() {
            Some(reference) => reference.load_weights(path),
            None => Err(Error::Config(
                "feature distance is disabled, there is no reference model".to_string(),
            )),
        }
    }

    pub fn config(&self) -> &UdaConfig {
        &self.config
    }

    pub fn model(&self) -> &SegModel<M> {
        &self.model
    }

    /// Mutable access for loading weights into the trainable model.
    pub fn model_mut(&mut self) -> &mut SegModel<M> {
        &mut self.model
    }

    pub fn teacher(&self) -> &EmaTeacher<M> {
        &self.teacher
    }

    pub fn reference(&self) -> Option<&SegModel<M>> {
        self.reference.as_ref()
    }

    pub fn local_iter(&self) -> usize {
        self.local_iter
    }

    /// Runs one iteration and returns the total loss with its gradients.
    ///
    /// The caller applies the optimizer step; the EMA teacher is updated
    /// from the trainable parameters as they are when this is called.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        let batch_size = batch.validate()?;
        let device = batch.device().clone();
        let feat_level = self.config.feat_level;
        let iteration = self.local_iter;

        let decay = self.teacher.step(self.model.varmap(), iteration)?;

        let norm = batch
            .img_metas
            .first()
            .map(|meta| meta.img_norm_cfg.clone())
            .unwrap_or_default();
        let aug = StrongAugParams::sample(&self.config, &norm, &device, &mut self.rng)?;

        // Source
        let src = self.model.model().forward_train(
            &batch.img,
            &batch.img_metas,
            &batch.gt_semantic_seg,
            None,
        )?;
        let (src_loss, src_log) = parse_losses(&src.losses, &device)?;
        let mut log_vars = LogVars::new();
        merge_logs(&mut log_vars, src_log);

        // Teacher predictions on the target
        let (teacher_logits, teacher_feats) = self.teacher.model().model().encode_decode(
            &batch.target_img,
            &batch.target_img_metas,
            false,
        )?;
        let teacher_feats = teacher_feats.detach();
        let pseudo = self.pseudo_labeler.label(&teacher_logits.detach())?;

        // Class mix
        let masks = sample_class_masks(&batch.gt_semantic_seg, &mut self.rng)?;
        let src_level = src.features.level(feat_level)?.detach();
        let mixed = mix_batch(
            &MixStreams {
                src_img: &batch.img,
                trg_img: &batch.target_img,
                src_labels: &batch.gt_semantic_seg,
                pseudo_labels: &pseudo.labels,
                pseudo_weight: &pseudo.weight,
                src_feats: &src_level,
                teacher_feats: teacher_feats.level(feat_level)?,
            },
            &masks,
            &aug,
        )?;

        let mix = self.model.model().forward_train(
            &mixed.img,
            &batch.img_metas,
            &mixed.labels,
            Some(&mixed.weight),
        )?;
        let (mix_loss, mix_log) = parse_losses(&add_prefix(mix.losses, "mix"), &device)?;
        merge_logs(&mut log_vars, mix_log);

        // Auxiliary terms
        let reference_feats = match &self.reference {
            Some(reference) => Some(reference.model().extract_feat(&batch.img, false)?.detach()),
            None => None,
        };
        let bundle = TensorBundle {
            img_src: Some(batch.img.clone()),
            img_mixed: Some(mixed.img.clone()),
            metas_src: Some(batch.img_metas.clone()),
            metas_trg: Some(batch.target_img_metas.clone()),
            gt_src: Some(batch.gt_semantic_seg.clone()),
            feats_src: Some(src.features.clone()),
            feats_mixed: Some(mix.features),
            feats_teacher: Some(Pyramid::single(
                teacher_feats.depth(),
                feat_level,
                mixed.feats.clone(),
            )?),
            feats_reference: reference_feats.clone(),
            logits_src: Some(src.logits.clone()),
            logits_mixed: Some(mix.logits.clone()),
        };

        let mut aux_losses = LossMap::new();
        let mut vis = VisMap::new();
        for aux in &self.aux_losses {
            let out = aux.compute(&bundle)?;
            aux_losses.extend(add_prefix(out.losses, aux.key_prefix()));
            vis.extend(out.vis);
        }

        let dist = self
            .feature_dist
            .compute(src.features.last()?, &batch.gt_semantic_seg, || {
                reference_feats
                    .as_ref()
                    .ok_or_else(|| Error::Config("reference features are missing".to_string()))?
                    .last()
                    .cloned()
            })?;
        if let Some(dist) = dist {
            aux_losses.insert(FEAT_DIST_KEY.to_string(), dist);
        }
        let (aux_loss, aux_log) = parse_losses(&aux_losses, &device)?;
        merge_logs(&mut log_vars, aux_log);

        let loss = ((src_loss + mix_loss.affine(self.config.trg_loss_weight, 0.0)?)? + aux_loss)?;
        let grads = loss.backward()?;

        if self.config.print_grad_magnitude {
            let magnitude = self.grad_magnitude(&grads)?;
            log_vars.insert("grad_magnitude".to_string(), magnitude);
            tracing::info!(iteration, grad_magnitude = magnitude, "gradient magnitude");
        }

        let loss_value = loss.to_scalar::<f32>()?;
        if !loss_value.is_finite() {
            tracing::warn!(iteration, loss = loss_value, "non-finite total loss");
        }
        log_vars.insert("loss".to_string(), loss_value);

        if iteration % self.config.debug_img_interval == 0 {
            vis.insert(
                VIS_SEG_MASK_SRC.to_string(),
                VisArtifact::new(
                    batch.img.clone(),
                    vec![
                        batch.gt_semantic_seg.clone(),
                        src.logits.detach().argmax(1)?,
                    ],
                ),
            );
            vis.insert(
                VIS_SEG_MASK_MIX.to_string(),
                VisArtifact::new(
                    mixed.img.detach(),
                    vec![mixed.labels.clone(), mix.logits.detach().argmax(1)?],
                ),
            );
            vis.insert(
                VIS_DENSITY_PSEUDO.to_string(),
                VisArtifact::new(mixed.img.detach(), vec![mixed.weight.clone()]),
            );
            vis.insert(
                VIS_PSEUDO_LABEL.to_string(),
                VisArtifact::new(batch.target_img.clone(), vec![pseudo.labels.clone()]),
            );
        } else {
            vis.clear();
        }

        tracing::debug!(
            iteration,
            batch_size,
            decay,
            pseudo_confidence = pseudo.confidence,
            loss = loss_value,
            "training step"
        );

        self.local_iter += 1;
        Ok(StepOutput {
            loss,
            grads,
            log_vars,
            vis,
            iteration,
        })
    }

    /// Global L2 norm of the gradients of every trainable parameter.
    fn grad_magnitude(&self, grads: &GradStore) -> Result<f32> {
        let mut total = 0f64;
        for param in snapshot(self.model.varmap())?.values() {
            if let Some(grad) = grads.get(param) {
                total += grad
                    .to_dtype(DType::F64)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar::<f64>()?;
            }
        }
        Ok(total.sqrt() as f32)
    }
}

fn check_level(level: usize, depth: usize) -> Result<()> {
    if level >= depth {
        return Err(Error::FeatureLevel { level, depth });
    }
    Ok(())
}

/// Copies every entry except the partial total.
fn merge_logs(into: &mut LogVars, from: LogVars) {
    into.extend(from.into_iter().filter(|(name, _)| name != "loss"));
}
