//! Class-based mixing of source and target samples.
//!
//! For every sample half of the classes present in the source label map are
//! pasted onto the target image. The same mask composites the image, label,
//! weight and feature streams.

use std::collections::BTreeSet;

use candle_core::{DType, IndexOp, Tensor};
use daseg_core::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::augment::{strong_transform, StrongAugParams};
use crate::labels::{class_membership, resize_nearest};

/// Draws one mask per sample of a source label batch [batch, height, width].
///
/// Every distinct value in a map counts as a class, the ignore label
/// included; `ceil(n / 2)` of the `n` values are selected.
///
/// # Returns
/// u8 masks [height, width], 1 where the source pixel is kept
pub fn sample_class_masks<R: Rng>(labels: &Tensor, rng: &mut R) -> Result<Vec<Tensor>> {
    let batch = labels.dim(0)?;
    let mut masks = Vec::with_capacity(batch);

    for i in 0..batch {
        let sample = labels.i(i)?.to_dtype(DType::U32)?;
        let present: Vec<u32> = sample
            .flatten_all()?
            .to_vec1::<u32>()?
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let n = present.len();
        let chosen: Vec<u32> = present
            .choose_multiple(rng, (n + n % 2) / 2)
            .copied()
            .collect();
        masks.push(class_membership(&sample, &chosen)?);
    }
    Ok(masks)
}

/// Composites `a` where `mask` is set and `b` elsewhere.
///
/// `mask` [height, width] is resampled (nearest) to the trailing spatial
/// dims of `a`, which are either [h, w] or [channels, h, w].
pub fn one_mix(mask: &Tensor, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.dims() != b.dims() {
        return Err(Error::ShapeMismatch(format!(
            "cannot mix {:?} with {:?}",
            a.dims(),
            b.dims()
        )));
    }
    let rank = a.rank();
    if !(2..=3).contains(&rank) {
        return Err(Error::ShapeMismatch(format!(
            "mix streams must be [h, w] or [c, h, w], got {:?}",
            a.dims()
        )));
    }
    let (height, width) = (a.dim(rank - 2)?, a.dim(rank - 1)?);

    let (mh, mw) = mask.dims2()?;
    let mask = resize_nearest(
        &mask.to_dtype(DType::F32)?.reshape((1, 1, mh, mw))?,
        height,
        width,
    )?
    .reshape((height, width))?
    .ge(0.5)?
    .broadcast_as(a.shape())?;

    Ok(mask.where_cond(a, b)?)
}

/// Per-sample inputs to the mixer, all with the same batch size.
#[derive(Debug, Clone, Copy)]
pub struct MixStreams<'a> {
    /// Source images [batch, 3, height, width]
    pub src_img: &'a Tensor,
    /// Target images [batch, 3, height, width]
    pub trg_img: &'a Tensor,
    /// Source labels [batch, height, width]
    pub src_labels: &'a Tensor,
    /// Pseudo-labels [batch, height, width]
    pub pseudo_labels: &'a Tensor,
    /// Confidence weights of the pseudo-labels [batch, height, width]
    pub pseudo_weight: &'a Tensor,
    /// Detached source features [batch, channels, h, w]
    pub src_feats: &'a Tensor,
    /// Teacher features [batch, channels, h, w]
    pub teacher_feats: &'a Tensor,
}

#[derive(Debug, Clone)]
pub struct MixedBatch {
    /// Augmented mixed images [batch, 3, height, width]
    pub img: Tensor,
    pub labels: Tensor,
    /// Source pixels weigh 1, target pixels carry the pseudo-label weight
    pub weight: Tensor,
    pub feats: Tensor,
}

/// Composites every stream with the per-sample masks and augments the
/// mixed images.
pub fn mix_batch(
    streams: &MixStreams<'_>,
    masks: &[Tensor],
    params: &StrongAugParams,
) -> Result<MixedBatch> {
    let batch = streams.src_img.dim(0)?;
    if masks.len() != batch {
        return Err(Error::ShapeMismatch(format!(
            "{} mix masks for a batch of {batch}",
            masks.len()
        )));
    }
    let src_weight = streams.pseudo_weight.ones_like()?;

    let mut img = Vec::with_capacity(batch);
    let mut labels = Vec::with_capacity(batch);
    let mut weight = Vec::with_capacity(batch);
    let mut feats = Vec::with_capacity(batch);

    for (i, mask) in masks.iter().enumerate() {
        img.push(one_mix(mask, &streams.src_img.i(i)?, &streams.trg_img.i(i)?)?);
        labels.push(one_mix(
            mask,
            &streams.src_labels.i(i)?.to_dtype(DType::U32)?,
            &streams.pseudo_labels.i(i)?.to_dtype(DType::U32)?,
        )?);
        weight.push(one_mix(
            mask,
            &src_weight.i(i)?,
            &streams.pseudo_weight.i(i)?,
        )?);
        feats.push(one_mix(
            mask,
            &streams.src_feats.i(i)?,
            &streams.teacher_feats.i(i)?,
        )?);
    }

    let img = strong_transform(params, &Tensor::stack(&img, 0)?)?;
    Ok(MixedBatch {
        img,
        labels: Tensor::stack(&labels, 0)?,
        weight: Tensor::stack(&weight, 0)?,
        feats: Tensor::stack(&feats, 0)?,
    })
}
