//! Label-map utilities: one-hot encoding, nearest resizing, ratio-based
//! downscaling and class-membership masks.

use candle_core::{DType, Result, Tensor};

/// One-hot encoding of a u32 label map.
///
/// # Arguments
/// * `labels` - Label indices [batch, height, width]
///
/// # Returns
/// f32 tensor [batch, n_classes, height, width]; labels `>= n_classes`
/// encode to all zeros
pub fn one_hot(labels: &Tensor, n_classes: usize) -> Result<Tensor> {
    let classes = Tensor::arange(0u32, n_classes as u32, labels.device())?
        .reshape((1, n_classes, 1, 1))?;
    labels
        .to_dtype(DType::U32)?
        .unsqueeze(1)?
        .broadcast_eq(&classes)?
        .to_dtype(DType::F32)
}

/// Nearest-neighbor resize of the two trailing spatial dims of a 4D tensor.
pub fn resize_nearest(x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if (h, w) == (height, width) {
        return Ok(x.clone());
    }
    match x.dtype() {
        DType::F32 | DType::F64 | DType::F16 | DType::BF16 => x.upsample_nearest2d(height, width),
        dtype => x
            .to_dtype(DType::F32)?
            .upsample_nearest2d(height, width)?
            .to_dtype(dtype),
    }
}

/// Nearest-neighbor resize of a [batch, height, width] label map.
pub fn resize_labels(labels: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    resize_nearest(&labels.unsqueeze(1)?, height, width)?.squeeze(1)
}

/// Downscales a label map by `scale`, keeping a coarse cell only when its
/// dominant label covers at least `min_ratio` of the cell.
///
/// Cells dominated by `ignore_index`, or whose dominant label is too rare,
/// become `ignore_index`.
///
/// # Arguments
/// * `labels` - u32 labels [batch, height, width]
///
/// # Returns
/// u32 labels [batch, height / scale, width / scale]
pub fn downscale_label_ratio(
    labels: &Tensor,
    scale: usize,
    min_ratio: f64,
    n_classes: usize,
    ignore_index: u32,
) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::U32)?;
    let substitute = n_classes as u32;

    let is_ignore = labels.eq(ignore_index as f64)?;
    let substituted = is_ignore.where_cond(
        &Tensor::full(substitute, labels.shape(), labels.device())?,
        &labels,
    )?;

    let encoded = one_hot(&substituted, n_classes + 1)?;
    let pooled = if scale > 1 {
        encoded.avg_pool2d(scale)?
    } else {
        encoded
    };

    let ratio = pooled.max(1)?;
    let dominant = pooled.argmax(1)?;

    let keep = dominant
        .ne(substitute as f64)?
        .mul(&ratio.ge(min_ratio)?)?;
    keep.where_cond(
        &dominant,
        &Tensor::full(ignore_index, dominant.shape(), dominant.device())?,
    )
}

/// Marks pixels whose label is one of `classes`.
///
/// # Returns
/// u8 mask with the shape of `labels`
pub fn class_membership(labels: &Tensor, classes: &[u32]) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::U32)?;
    if classes.is_empty() {
        return labels.zeros_like()?.to_dtype(DType::U8);
    }
    let rank = labels.rank();
    let mut shape = vec![1usize; rank];
    shape.push(classes.len());
    let classes = Tensor::new(classes, labels.device())?.reshape(shape)?;

    labels
        .unsqueeze(rank)?
        .broadcast_eq(&classes)?
        .max(rank)
}
