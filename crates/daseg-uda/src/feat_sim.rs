//! Feature-similarity consistency losses.
//!
//! Both losses compare the local feature similarity of the teacher's
//! features with the soft same-class affinity predicted on the mixed batch:
//! neighbors that look alike should share a class, neighbors that look
//! different should not. [`AdaptiveFeatSimLoss`] additionally shapes the
//! student's source features with the ground-truth label agreement.

use candle_core::{DType, Tensor};
use daseg_core::{
    AdaptiveFeatSimConfig, BundleField, EmptyMaskPolicy, FeatSimConfig, LossMap, Result,
    TensorBundle, VisArtifact, VisMap,
};

use crate::affinity::{CrossProbability, NegativeAffinity};
use crate::labels::{resize_labels, resize_nearest};
use crate::losses::{masked_mean, AuxOutput};
use crate::neighborhood::{gather_neighbors, top_k_neighbors, LocalSimilarity, Window};

/// Visualization key of the feature-dissimilarity density map.
pub const VIS_DENSITY_SIM_FEAT: &str = "vis|density_sim_feat";

/// Similarity-weighted affinity terms over selected neighbors.
///
/// With `top_k` set, positives are taken from the `top_k + 1` most similar
/// neighbors (the centre is always among them) and negatives from the
/// `top_k` least similar ones.
fn sim_terms(
    sim: &Tensor,
    positive: &Tensor,
    negative: &Tensor,
    top_k: Option<usize>,
) -> Result<(Tensor, Tensor)> {
    let (max_sim, min_sim, pos, neg) = match top_k {
        Some(k) => {
            let idx_max = top_k_neighbors(sim, k + 1, true)?;
            let idx_min = top_k_neighbors(sim, k, false)?;
            (
                gather_neighbors(sim, &idx_max)?,
                gather_neighbors(sim, &idx_min)?,
                gather_neighbors(positive, &idx_max)?,
                gather_neighbors(negative, &idx_min)?,
            )
        }
        None => (sim.clone(), sim.clone(), positive.clone(), negative.clone()),
    };

    let loc_pos = (max_sim * pos)?.neg()?;
    let loc_neg = (min_sim.affine(-1.0, 1.0)? * neg)?.neg()?;
    Ok((loc_pos, loc_neg))
}

fn density_vis(image: &Tensor, sim: &Tensor) -> Result<VisMap> {
    let density = sim.mean_keepdim(1)?.affine(-1.0, 1.0)?.detach();
    let mut vis = VisMap::new();
    vis.insert(
        VIS_DENSITY_SIM_FEAT.to_string(),
        VisArtifact::new(image.clone(), vec![density]),
    );
    Ok(vis)
}

/// Target-branch feature-similarity loss.
#[derive(Debug, Clone)]
pub struct FeatSimLoss {
    similarity: LocalSimilarity,
    cross: CrossProbability,
    top_k: usize,
    feat_level: usize,
    w_pos: f64,
    w_neg: f64,
    policy: EmptyMaskPolicy,
}

impl FeatSimLoss {
    pub const REQUIRED: &'static [BundleField] = &[
        BundleField::LogitsMixed,
        BundleField::FeatsTeacher,
        BundleField::ImgMixed,
    ];

    pub fn new(config: FeatSimConfig, policy: EmptyMaskPolicy) -> Result<Self> {
        config.validate()?;
        let window = Window::new(config.kernel_size, config.dilation);
        Ok(Self {
            similarity: LocalSimilarity::new(window, config.sim_type, config.sigma),
            cross: CrossProbability::new(window),
            top_k: config.top_k,
            feat_level: config.feat_level,
            w_pos: config.weight("sim_pos")?,
            w_neg: config.weight("sim_neg")?,
            policy,
        })
    }

    pub fn feat_level(&self) -> usize {
        self.feat_level
    }

    pub fn compute(&self, bundle: &TensorBundle) -> Result<AuxOutput> {
        let logits = bundle.logits_mixed()?;
        let (_, _, height, width) = logits.dims4()?;

        let feats = resize_nearest(
            bundle.feats_teacher()?.level(self.feat_level)?,
            height,
            width,
        )?;
        let sim = self.similarity.forward(&feats)?;
        let affinity = self.cross.affinity(logits, NegativeAffinity::OffDiagonal)?;

        let (loc_pos, loc_neg) = sim_terms(
            &sim,
            &affinity.positive,
            &affinity.negative,
            Some(self.top_k),
        )?;

        // Pixels without teacher activation in the first channel are skipped
        let valid = feats.narrow(1, 0, 1)?.gt(0.0)?;

        let mut losses = LossMap::new();
        losses.insert(
            "loss_sim_pos".to_string(),
            (masked_mean(&loc_pos, &valid, self.policy, "loss_sim_pos")? * self.w_pos)?,
        );
        losses.insert(
            "loss_sim_neg".to_string(),
            (masked_mean(&loc_neg, &valid, self.policy, "loss_sim_neg")? * self.w_neg)?,
        );

        Ok(AuxOutput {
            losses,
            vis: density_vis(bundle.img_mixed()?, &sim)?,
        })
    }
}

/// Feature-similarity loss with ground-truth supervision on the source
/// features.
#[derive(Debug, Clone)]
pub struct AdaptiveFeatSimLoss {
    similarity: LocalSimilarity,
    cross: CrossProbability,
    window: Window,
    top_k: Option<usize>,
    feat_level: usize,
    w_src_pos: f64,
    w_src_neg: f64,
    w_sim_pos: f64,
    w_sim_neg: f64,
    apply_ignore: bool,
    ignore_index: u32,
    policy: EmptyMaskPolicy,
}

impl AdaptiveFeatSimLoss {
    pub const REQUIRED: &'static [BundleField] = &[
        BundleField::LogitsMixed,
        BundleField::FeatsTeacher,
        BundleField::FeatsSrc,
        BundleField::GtSrc,
        BundleField::ImgMixed,
    ];

    pub fn new(
        config: AdaptiveFeatSimConfig,
        policy: EmptyMaskPolicy,
        ignore_index: u32,
    ) -> Result<Self> {
        config.validate()?;
        let window = Window::new(config.kernel_size, config.dilation);
        Ok(Self {
            similarity: LocalSimilarity::new(window, config.sim_type, config.sigma),
            cross: CrossProbability::new(window),
            window,
            top_k: config.top_k,
            feat_level: config.feat_level,
            w_src_pos: config.weight("src_pos")?,
            w_src_neg: config.weight("src_neg")?,
            w_sim_pos: config.weight("sim_pos")?,
            w_sim_neg: config.weight("sim_neg")?,
            apply_ignore: config.apply_ignore,
            ignore_index,
            policy,
        })
    }

    pub fn feat_level(&self) -> usize {
        self.feat_level
    }

    /// Same-label and different-label neighbor pairs of a label map.
    ///
    /// Neighbors outside the image belong to neither set.
    ///
    /// # Arguments
    /// * `labels` - u32 labels [batch, height, width]
    ///
    /// # Returns
    /// u8 masks (positive, negative), each [batch, neighbors, height, width]
    pub fn label_pairs(&self, labels: &Tensor) -> Result<(Tensor, Tensor)> {
        // Shift by one so zero padding never matches a real label
        let shifted = labels
            .to_dtype(DType::F32)?
            .affine(1.0, 1.0)?
            .unsqueeze(1)?;
        let neighbors = self.window.unfold(&shifted)?.squeeze(1)?;
        let in_frame = neighbors.ne(0.0)?;

        let positive = neighbors.broadcast_eq(&shifted)?.mul(&in_frame)?;
        let negative = neighbors.broadcast_ne(&shifted)?.mul(&in_frame)?;
        Ok((positive, negative))
    }

    pub fn compute(&self, bundle: &TensorBundle) -> Result<AuxOutput> {
        let logits = bundle.logits_mixed()?;
        let (_, _, height, width) = logits.dims4()?;

        let labels = resize_labels(bundle.gt_src()?, height, width)?;
        let ignore_mask = if self.apply_ignore {
            Some(labels.ne(self.ignore_index as f64)?.unsqueeze(1)?)
        } else {
            None
        };

        let teacher_feats = resize_nearest(
            bundle.feats_teacher()?.level(self.feat_level)?,
            height,
            width,
        )?;
        let src_feats = resize_nearest(
            bundle.feats_src()?.level(self.feat_level)?,
            height,
            width,
        )?;
        let teacher_sim = self.similarity.forward(&teacher_feats)?;
        let src_sim = self.similarity.forward(&src_feats)?;

        let (mut pos_pairs, mut neg_pairs) = self.label_pairs(&labels)?;
        if let Some(mask) = &ignore_mask {
            pos_pairs = pos_pairs.broadcast_mul(mask)?;
            neg_pairs = neg_pairs.broadcast_mul(mask)?;
        }
        let src_pos = masked_mean(&src_sim, &pos_pairs, self.policy, "loss_src_pos")?;
        let src_neg = masked_mean(&src_sim, &neg_pairs, self.policy, "loss_src_neg")?;

        let affinity = self.cross.affinity(logits, NegativeAffinity::Complement)?;
        let (loc_pos, loc_neg) = sim_terms(
            &teacher_sim,
            &affinity.positive,
            &affinity.negative,
            self.top_k,
        )?;
        let (sim_pos, sim_neg) = match &ignore_mask {
            Some(mask) => (
                masked_mean(&loc_pos, mask, self.policy, "loss_sim_pos")?,
                masked_mean(&loc_neg, mask, self.policy, "loss_sim_neg")?,
            ),
            None => (loc_pos.mean_all()?, loc_neg.mean_all()?),
        };

        let mut losses = LossMap::new();
        losses.insert(
            "loss_src_pos".to_string(),
            (src_pos.neg()? * self.w_src_pos)?,
        );
        losses.insert("loss_src_neg".to_string(), (src_neg * self.w_src_neg)?);
        losses.insert("loss_sim_pos".to_string(), (sim_pos * self.w_sim_pos)?);
        losses.insert("loss_sim_neg".to_string(), (sim_neg * self.w_sim_neg)?);

        Ok(AuxOutput {
            losses,
            vis: density_vis(bundle.img_mixed()?, &teacher_sim)?,
        })
    }
}
