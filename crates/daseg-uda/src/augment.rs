//! Strong photometric augmentation applied to mixed images.

use candle_core::{Device, Tensor};
use daseg_core::{NormConfig, Result, UdaConfig};
use rand::Rng;

const GRAY_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];
const BLUR_SIGMA_MIN: f64 = 0.15;
const BLUR_SIGMA_MAX: f64 = 1.15;

/// Multiplicative color-jitter factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterFactors {
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
}

impl JitterFactors {
    pub const IDENTITY: Self = Self {
        brightness: 1.0,
        contrast: 1.0,
        saturation: 1.0,
    };

    fn sample<R: Rng>(strength: f64, rng: &mut R) -> Self {
        let mut draw = || {
            if strength > 0.0 {
                rng.gen_range((1.0 - strength).max(0.0)..=1.0 + strength)
            } else {
                1.0
            }
        };
        Self {
            brightness: draw(),
            contrast: draw(),
            saturation: draw(),
        }
    }
}

/// One set of augmentation parameters, shared by every sample of a batch.
#[derive(Debug, Clone)]
pub struct StrongAugParams {
    pub color_jitter: Option<JitterFactors>,
    pub blur_sigma: Option<f64>,
    /// (1, 3, 1, 1) normalization mean in pixel units
    pub mean: Tensor,
    /// (1, 3, 1, 1) normalization std in pixel units
    pub std: Tensor,
}

impl StrongAugParams {
    /// Draws the jitter and blur decisions for a batch.
    ///
    /// Color jitter applies when its draw exceeds the configured
    /// probability; blur applies when enabled and its draw exceeds 0.5.
    pub fn sample<R: Rng>(
        config: &UdaConfig,
        norm: &NormConfig,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self> {
        let jitter_draw: f64 = rng.gen();
        let blur_draw: f64 = if config.blur { rng.gen() } else { 0.0 };

        let color_jitter = (jitter_draw > config.color_jitter_probability)
            .then(|| JitterFactors::sample(config.color_jitter_strength, &mut *rng));
        let blur_sigma =
            (blur_draw > 0.5).then(|| rng.gen_range(BLUR_SIGMA_MIN..BLUR_SIGMA_MAX));

        Ok(Self {
            color_jitter,
            blur_sigma,
            mean: norm.mean_tensor(device)?,
            std: norm.std_tensor(device)?,
        })
    }

    /// Parameters that leave images untouched.
    pub fn identity(norm: &NormConfig, device: &Device) -> Result<Self> {
        Ok(Self {
            color_jitter: None,
            blur_sigma: None,
            mean: norm.mean_tensor(device)?,
            std: norm.std_tensor(device)?,
        })
    }
}

/// Applies color jitter then blur to normalized images [batch, 3, height, width].
pub fn strong_transform(params: &StrongAugParams, img: &Tensor) -> Result<Tensor> {
    let mut img = img.clone();
    if let Some(factors) = params.color_jitter {
        img = color_jitter(&img, factors, &params.mean, &params.std)?;
    }
    if let Some(sigma) = params.blur_sigma {
        img = gaussian_blur(&img, sigma)?;
    }
    Ok(img)
}

fn grayscale(x: &Tensor) -> Result<Tensor> {
    let weights = Tensor::new(&GRAY_WEIGHTS, x.device())?
        .to_dtype(x.dtype())?
        .reshape((1, 3, 1, 1))?;
    Ok(x.broadcast_mul(&weights)?.sum_keepdim(1)?)
}

/// `factor · x + (1 − factor) · other`
fn blend(x: &Tensor, other: &Tensor, factor: f64) -> Result<Tensor> {
    Ok(x.affine(factor, 0.0)?
        .broadcast_add(&other.affine(1.0 - factor, 0.0)?)?)
}

/// Brightness, contrast and saturation jitter in [0, 1] pixel space.
pub fn color_jitter(
    img: &Tensor,
    factors: JitterFactors,
    mean: &Tensor,
    std: &Tensor,
) -> Result<Tensor> {
    let mean = mean.to_dtype(img.dtype())?;
    let std = std.to_dtype(img.dtype())?;
    let x = (img.broadcast_mul(&std)?.broadcast_add(&mean)? / 255.0)?;

    let x = x.affine(factors.brightness, 0.0)?.clamp(0.0, 1.0)?;

    let batch = x.dim(0)?;
    let gray_mean = grayscale(&x)?
        .flatten_from(1)?
        .mean_keepdim(1)?
        .reshape((batch, 1, 1, 1))?;
    let x = blend(&x, &gray_mean, factors.contrast)?.clamp(0.0, 1.0)?;

    let x = blend(&x, &grayscale(&x)?, factors.saturation)?.clamp(0.0, 1.0)?;

    Ok((x * 255.0)?.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

/// Blur kernel length for an image extent: `ceil(0.1 · extent)`, lowered
/// to the nearest odd number.
pub fn blur_kernel_size(extent: usize) -> usize {
    let n = ((extent + 9) / 10).max(1);
    if n % 2 == 1 {
        n
    } else {
        n - 1
    }
}

fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f32> {
    let center = (size / 2) as f64;
    let raw: Vec<f64> = (0..size)
        .map(|i| (-((i as f64 - center).powi(2)) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|v| (v / total) as f32).collect()
}

/// Separable depthwise Gaussian blur with edge replication.
pub fn gaussian_blur(img: &Tensor, sigma: f64) -> Result<Tensor> {
    let (_, channels, height, width) = img.dims4()?;
    let ky = blur_kernel_size(height);
    let kx = blur_kernel_size(width);

    let mut out = img.clone();
    if kx > 1 {
        let kernel = Tensor::new(gaussian_kernel(kx, sigma), img.device())?
            .to_dtype(img.dtype())?
            .reshape((1, 1, 1, kx))?
            .repeat((channels, 1, 1, 1))?;
        out = out
            .pad_with_same(3, kx / 2, kx / 2)?
            .conv2d(&kernel, 0, 1, 1, channels)?;
    }
    if ky > 1 {
        let kernel = Tensor::new(gaussian_kernel(ky, sigma), img.device())?
            .to_dtype(img.dtype())?
            .reshape((1, 1, ky, 1))?
            .repeat((channels, 1, 1, 1))?;
        out = out
            .pad_with_same(2, ky / 2, ky / 2)?
            .conv2d(&kernel, 0, 1, 1, channels)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_kernel_size() {
        assert_eq!(blur_kernel_size(8), 1);
        assert_eq!(blur_kernel_size(20), 1);
        assert_eq!(blur_kernel_size(30), 3);
        assert_eq!(blur_kernel_size(32), 3);
        assert_eq!(blur_kernel_size(512), 51);
    }

    #[test]
    fn test_no_augmentation_when_disabled() -> Result<()> {
        let device = Device::Cpu;
        let config = UdaConfig {
            blur: false,
            color_jitter_probability: 1.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        let params = StrongAugParams::sample(&config, &NormConfig::default(), &device, &mut rng)?;
        assert!(params.color_jitter.is_none());
        assert!(params.blur_sigma.is_none());

        let img = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device)?;
        let out = strong_transform(&params, &img)?;
        assert_eq!(max_abs_diff(&img, &out)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_identity_jitter_round_trips() -> Result<()> {
        let device = Device::Cpu;
        let norm = NormConfig::default();
        let params = StrongAugParams::identity(&norm, &device)?;
        // Normalized images of in-range pixels
        let pixels = (Tensor::rand(0f32, 1.0, (1, 3, 4, 4), &device)? * 255.0)?;
        let img = pixels
            .broadcast_sub(&params.mean)?
            .broadcast_div(&params.std)?;

        let out = color_jitter(&img, JitterFactors::IDENTITY, &params.mean, &params.std)?;
        assert!(max_abs_diff(&img, &out)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_jitter_stays_in_pixel_range() -> Result<()> {
        let device = Device::Cpu;
        let norm = NormConfig::default();
        let params = StrongAugParams::identity(&norm, &device)?;
        let img = Tensor::randn(0f32, 3.0, (2, 3, 4, 4), &device)?;
        let factors = JitterFactors {
            brightness: 1.2,
            contrast: 0.8,
            saturation: 1.2,
        };

        let out = color_jitter(&img, factors, &params.mean, &params.std)?;
        let pixels = out.broadcast_mul(&params.std)?.broadcast_add(&params.mean)?;
        let values: Vec<f32> = pixels.flatten_all()?.to_vec1()?;
        assert!(values.iter().all(|v| *v >= -1e-3 && *v <= 255.0 + 1e-3));
        Ok(())
    }

    #[test]
    fn test_blur_keeps_constant_image() -> Result<()> {
        let device = Device::Cpu;
        let img = Tensor::full(0.5f32, (1, 3, 32, 32), &device)?;

        let out = gaussian_blur(&img, 1.0)?;
        assert_eq!(out.dims(), img.dims());
        assert!(max_abs_diff(&img, &out)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_blur_smooths() -> Result<()> {
        let device = Device::Cpu;
        let img = Tensor::randn(0f32, 1.0, (1, 3, 32, 32), &device)?;

        let out = gaussian_blur(&img, 1.0)?;
        let var = |t: &Tensor| -> Result<f32> {
            Ok(t.sqr()?.mean_all()?.to_scalar::<f32>()?)
        };
        assert!(var(&out)? < var(&img)?);
        assert_eq!(out.dtype(), DType::F32);
        Ok(())
    }
}
