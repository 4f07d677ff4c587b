//! # daseg-uda
//!
//! Unsupervised domain adaptation for semantic segmentation by
//! teacher-student self-training with class-based domain mixing.
//!
//! ## Training step
//!
//! 1. **EMA teacher**: a moving average of the trainable model predicts
//!    pseudo-labels and confidence weights on the target batch
//! 2. **Class mix**: half of the classes of each source label map are
//!    pasted onto the target image, and the same mask composites labels,
//!    weights and a feature level of source and teacher
//! 3. **Strong augmentation**: color jitter and Gaussian blur on the mix
//! 4. **Feature-similarity losses**: local neighborhood similarity of the
//!    composited features is aligned with the cross-probability affinity of
//!    the mixed predictions
//! 5. **Feature distance**: optional regularizer towards a frozen reference
//!    model on the source features
//!
//! Loss: L = L_src + w_trg · L_mix + Σ L_aux

pub mod affinity;
pub mod augment;
pub mod backbone;
pub mod ema;
pub mod feat_dist;
pub mod feat_sim;
pub mod fmda;
pub mod heads;
pub mod labels;
pub mod losses;
pub mod mix;
pub mod model;
pub mod neighborhood;
pub mod pseudo_label;
pub mod segmentor;

pub use affinity::*;
pub use augment::*;
pub use backbone::*;
pub use ema::*;
pub use feat_dist::*;
pub use feat_sim::*;
pub use fmda::*;
pub use heads::*;
pub use labels::*;
pub use losses::*;
pub use mix::*;
pub use model::*;
pub use neighborhood::*;
pub use pseudo_label::*;
pub use segmentor::*;
