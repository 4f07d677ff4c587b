//! Fundamental types shared between the training step, the auxiliary losses
//! and the segmentation network.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Label value excluded from every loss and statistic.
pub const IGNORE_INDEX: u32 = 255;

/// Per-image normalization statistics in 0..255 pixel units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormConfig {
    pub mean: [f32; 3],
    pub std: [f32; 3],
    #[serde(default = "default_to_rgb")]
    pub to_rgb: bool,
}

fn default_to_rgb() -> bool {
    true
}

impl Default for NormConfig {
    fn default() -> Self {
        Self {
            mean: [123.675, 116.28, 103.53],
            std: [58.395, 57.12, 57.375],
            to_rgb: true,
        }
    }
}

impl NormConfig {
    /// Mean as a `(1, 3, 1, 1)` tensor, ready to broadcast over an image batch.
    pub fn mean_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(&self.mean, device)?.reshape((1, 3, 1, 1))?)
    }

    /// Standard deviation as a `(1, 3, 1, 1)` tensor.
    pub fn std_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(&self.std, device)?.reshape((1, 3, 1, 1))?)
    }
}

/// Metadata attached to every image of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImgMeta {
    /// (height, width, channels) after the data pipeline
    pub img_shape: [usize; 3],
    /// (height, width, channels) of the file on disk
    pub ori_shape: [usize; 3],
    #[serde(default)]
    pub flip: bool,
    #[serde(default)]
    pub img_norm_cfg: NormConfig,
    #[serde(default)]
    pub filename: Option<String>,
}

impl ImgMeta {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            img_shape: [height, width, 3],
            ori_shape: [height, width, 3],
            flip: false,
            img_norm_cfg: NormConfig::default(),
            filename: None,
        }
    }
}

/// One training batch: labeled source samples paired with unlabeled target samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Source images [batch, 3, height, width]
    pub img: Tensor,
    /// Source labels [batch, height, width], u32
    pub gt_semantic_seg: Tensor,
    pub img_metas: Vec<ImgMeta>,
    /// Target images [batch, 3, height, width]
    pub target_img: Tensor,
    pub target_img_metas: Vec<ImgMeta>,
}

impl Batch {
    /// Checks that every stream carries the same number of samples and
    /// returns that count.
    pub fn validate(&self) -> Result<usize> {
        let source_len = self.img.dim(0)?;
        let target_len = self.target_img.dim(0)?;
        if source_len != target_len {
            return Err(Error::BatchSize {
                source_len,
                target_len,
            });
        }

        let gt_len = self.gt_semantic_seg.dim(0)?;
        if gt_len != source_len {
            return Err(Error::ShapeMismatch(format!(
                "{gt_len} label maps for {source_len} source images"
            )));
        }
        if self.gt_semantic_seg.rank() != 3 {
            return Err(Error::ShapeMismatch(format!(
                "labels must be [batch, height, width], got {:?}",
                self.gt_semantic_seg.dims()
            )));
        }
        if self.img_metas.len() != source_len || self.target_img_metas.len() != target_len {
            return Err(Error::ShapeMismatch(format!(
                "metadata counts ({}, {}) do not match batch size {source_len}",
                self.img_metas.len(),
                self.target_img_metas.len()
            )));
        }

        Ok(source_len)
    }

    pub fn device(&self) -> &Device {
        self.img.device()
    }
}

/// Multi-scale features produced by a backbone, shallow to deep.
///
/// A level can be absent: the teacher's mixed pyramid only carries the level
/// that was used for mixing.
#[derive(Debug, Clone, Default)]
pub struct Pyramid {
    levels: Vec<Option<Tensor>>,
}

impl Pyramid {
    pub fn new(levels: Vec<Tensor>) -> Self {
        Self {
            levels: levels.into_iter().map(Some).collect(),
        }
    }

    /// A pyramid of `depth` levels where only `level` is populated.
    pub fn single(depth: usize, level: usize, feature: Tensor) -> Result<Self> {
        if level >= depth {
            return Err(Error::FeatureLevel { level, depth });
        }
        let mut levels = vec![None; depth];
        levels[level] = Some(feature);
        Ok(Self { levels })
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> Result<&Tensor> {
        match self.levels.get(level) {
            Some(Some(t)) => Ok(t),
            Some(None) => Err(Error::ShapeMismatch(format!(
                "feature level {level} is not populated"
            ))),
            None => Err(Error::FeatureLevel {
                level,
                depth: self.depth(),
            }),
        }
    }

    /// Deepest level.
    pub fn last(&self) -> Result<&Tensor> {
        match self.depth() {
            0 => Err(Error::FeatureLevel { level: 0, depth: 0 }),
            depth => self.level(depth - 1),
        }
    }

    /// Copy of the pyramid cut off from the autograd graph.
    pub fn detach(&self) -> Self {
        Self {
            levels: self
                .levels
                .iter()
                .map(|l| l.as_ref().map(|t| t.detach()))
                .collect(),
        }
    }
}

/// Named loss tensors, ordered by name so logs are stable between runs.
pub type LossMap = BTreeMap<String, Tensor>;

/// Named scalars for the logging collaborator.
pub type LogVars = BTreeMap<String, f32>;

/// Key prefix marking visualization entries in a loss map.
pub const VIS_PREFIX: &str = "vis|";

/// An image together with the maps to overlay on it.
#[derive(Debug, Clone)]
pub struct VisArtifact {
    pub image: Tensor,
    pub overlays: Vec<Tensor>,
}

impl VisArtifact {
    pub fn new(image: Tensor, overlays: Vec<Tensor>) -> Self {
        Self { image, overlays }
    }
}

pub type VisMap = BTreeMap<String, VisArtifact>;

/// Prefixes every key of a loss map with `prefix.`.
pub fn add_prefix(losses: LossMap, prefix: &str) -> LossMap {
    losses
        .into_iter()
        .map(|(name, value)| (format!("{prefix}.{name}"), value))
        .collect()
}

/// Reduces a loss map to a single differentiable scalar plus log values.
///
/// Every entry is logged as its mean; entries whose name contains `loss`
/// are summed into the returned total, which is also logged under `loss`.
pub fn parse_losses(losses: &LossMap, device: &Device) -> Result<(Tensor, LogVars)> {
    let mut log_vars = LogVars::new();
    let mut total = Tensor::zeros((), DType::F32, device)?;

    for (name, value) in losses {
        let value = value.to_dtype(DType::F32)?.mean_all()?;
        log_vars.insert(name.clone(), value.to_scalar::<f32>()?);
        if name.contains("loss") {
            total = (total + value)?;
        }
    }

    log_vars.insert("loss".to_string(), total.to_scalar::<f32>()?);
    Ok((total, log_vars))
}

/// Named fields of a [`TensorBundle`], used to declare what a loss consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BundleField {
    ImgSrc,
    ImgMixed,
    MetasSrc,
    MetasTrg,
    GtSrc,
    FeatsSrc,
    FeatsMixed,
    FeatsTeacher,
    FeatsReference,
    LogitsSrc,
    LogitsMixed,
}

impl BundleField {
    pub fn name(&self) -> &'static str {
        match self {
            BundleField::ImgSrc => "img_src",
            BundleField::ImgMixed => "img_mixed",
            BundleField::MetasSrc => "metas_src",
            BundleField::MetasTrg => "metas_trg",
            BundleField::GtSrc => "gt_src",
            BundleField::FeatsSrc => "feats_src",
            BundleField::FeatsMixed => "feats_mixed",
            BundleField::FeatsTeacher => "feats_teacher",
            BundleField::FeatsReference => "feats_reference",
            BundleField::LogitsSrc => "logits_src",
            BundleField::LogitsMixed => "logits_mixed",
        }
    }
}

impl std::fmt::Display for BundleField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tensors shared between the training step and the auxiliary losses.
#[derive(Debug, Clone, Default)]
pub struct TensorBundle {
    pub img_src: Option<Tensor>,
    pub img_mixed: Option<Tensor>,
    pub metas_src: Option<Vec<ImgMeta>>,
    pub metas_trg: Option<Vec<ImgMeta>>,
    /// Source labels [batch, height, width]
    pub gt_src: Option<Tensor>,
    pub feats_src: Option<Pyramid>,
    pub feats_mixed: Option<Pyramid>,
    /// Teacher features composited with detached source features
    pub feats_teacher: Option<Pyramid>,
    pub feats_reference: Option<Pyramid>,
    pub logits_src: Option<Tensor>,
    pub logits_mixed: Option<Tensor>,
}

macro_rules! bundle_getter {
    ($name:ident, $field:ident, $ty:ty) => {
        pub fn $name(&self) -> Result<&$ty> {
            self.$name
                .as_ref()
                .ok_or_else(|| missing(BundleField::$field))
        }
    };
}

fn missing(field: BundleField) -> Error {
    Error::Config(format!("tensor bundle field `{field}` is not populated"))
}

impl TensorBundle {
    bundle_getter!(img_src, ImgSrc, Tensor);
    bundle_getter!(img_mixed, ImgMixed, Tensor);
    bundle_getter!(metas_src, MetasSrc, Vec<ImgMeta>);
    bundle_getter!(metas_trg, MetasTrg, Vec<ImgMeta>);
    bundle_getter!(gt_src, GtSrc, Tensor);
    bundle_getter!(feats_src, FeatsSrc, Pyramid);
    bundle_getter!(feats_mixed, FeatsMixed, Pyramid);
    bundle_getter!(feats_teacher, FeatsTeacher, Pyramid);
    bundle_getter!(feats_reference, FeatsReference, Pyramid);
    bundle_getter!(logits_src, LogitsSrc, Tensor);
    bundle_getter!(logits_mixed, LogitsMixed, Tensor);

    pub fn has(&self, field: BundleField) -> bool {
        match field {
            BundleField::ImgSrc => self.img_src.is_some(),
            BundleField::ImgMixed => self.img_mixed.is_some(),
            BundleField::MetasSrc => self.metas_src.is_some(),
            BundleField::MetasTrg => self.metas_trg.is_some(),
            BundleField::GtSrc => self.gt_src.is_some(),
            BundleField::FeatsSrc => self.feats_src.is_some(),
            BundleField::FeatsMixed => self.feats_mixed.is_some(),
            BundleField::FeatsTeacher => self.feats_teacher.is_some(),
            BundleField::FeatsReference => self.feats_reference.is_some(),
            BundleField::LogitsSrc => self.logits_src.is_some(),
            BundleField::LogitsMixed => self.logits_mixed.is_some(),
        }
    }

    /// Fails on the first field of `fields` that is not populated.
    pub fn require(&self, fields: &[BundleField]) -> Result<()> {
        match fields.iter().find(|f| !self.has(**f)) {
            Some(field) => Err(missing(*field)),
            None => Ok(()),
        }
    }
}
