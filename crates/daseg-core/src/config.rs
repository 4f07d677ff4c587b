//! Configuration surface of the adaptation step.
//!
//! Defaults follow the class-mix self-training recipe: EMA ceiling 0.99,
//! confidence threshold 0.968, color jitter 0.2/0.2 with blur, no feature
//! distance and no auxiliary losses.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::IGNORE_INDEX;

/// Similarity measure of the local similarity kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SimType {
    Gaussian,
    Cosine,
}

impl FromStr for SimType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gaussian" => Ok(SimType::Gaussian),
            "cosine" => Ok(SimType::Cosine),
            other => Err(Error::Config(format!(
                "unknown similarity type `{other}` (expected `gaussian` or `cosine`)"
            ))),
        }
    }
}

impl TryFrom<String> for SimType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SimType> for String {
    fn from(value: SimType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimType::Gaussian => f.write_str("gaussian"),
            SimType::Cosine => f.write_str("cosine"),
        }
    }
}

/// Domain mixing strategy. Only class-based mixing exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MixMode {
    #[default]
    Class,
}

impl TryFrom<String> for MixMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        match value.as_str() {
            "class" => Ok(MixMode::Class),
            other => Err(Error::Config(format!(
                "unsupported mix mode `{other}`, only `class` is available"
            ))),
        }
    }
}

impl From<MixMode> for String {
    fn from(_: MixMode) -> Self {
        "class".to_string()
    }
}

/// What a masked mean returns when its mask selects nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyMaskPolicy {
    /// The term becomes 0 and a warning is logged.
    #[default]
    Zero,
    /// The term becomes NaN and flows into the total.
    Nan,
    /// The step fails with `NumericDegeneracy`.
    Fail,
}

/// Named per-term weights, e.g. `{"sim_pos": 1.0, "sim_neg": 1.0}`.
pub type LossWeights = BTreeMap<String, f64>;

fn require_weight(weights: &LossWeights, key: &str, loss: &str) -> Result<f64> {
    weights
        .get(key)
        .copied()
        .ok_or_else(|| Error::Config(format!("{loss}: missing weight `{key}`")))
}

fn default_kernel_size() -> usize {
    3
}

fn default_dilation() -> usize {
    1
}

fn default_feat_level() -> usize {
    2
}

fn default_sim_type() -> SimType {
    SimType::Gaussian
}

/// Hyperparameters of the target-branch feature-similarity loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatSimConfig {
    pub top_k: usize,
    #[serde(default = "default_dilation")]
    pub dilation: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    pub sigma: f64,
    pub weights: LossWeights,
    #[serde(default = "default_feat_level")]
    pub feat_level: usize,
    #[serde(default = "default_sim_type")]
    pub sim_type: SimType,
}

impl FeatSimConfig {
    pub const WEIGHT_KEYS: [&'static str; 2] = ["sim_pos", "sim_neg"];

    pub fn validate(&self) -> Result<()> {
        validate_window(self.kernel_size, self.dilation, "FeatSimLoss")?;
        validate_sigma(self.sim_type, self.sigma, "FeatSimLoss")?;
        let neighbors = self.kernel_size * self.kernel_size;
        if self.top_k == 0 || self.top_k + 1 > neighbors {
            return Err(Error::Config(format!(
                "FeatSimLoss: top_k {} must be in 1..{neighbors}",
                self.top_k
            )));
        }
        for key in Self::WEIGHT_KEYS {
            require_weight(&self.weights, key, "FeatSimLoss")?;
        }
        Ok(())
    }

    pub fn weight(&self, key: &str) -> Result<f64> {
        require_weight(&self.weights, key, "FeatSimLoss")
    }
}

fn default_adaptive_sigma() -> f64 {
    30.0
}

/// Hyperparameters of the source-supervised feature-similarity loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveFeatSimConfig {
    /// Hard-neighbor mining; `None` uses every neighbor.
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default = "default_dilation")]
    pub dilation: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    pub weights: LossWeights,
    #[serde(default = "default_adaptive_sigma")]
    pub sigma: f64,
    #[serde(default = "default_feat_level")]
    pub feat_level: usize,
    #[serde(default = "default_sim_type")]
    pub sim_type: SimType,
    /// Exclude ignore-labelled source pixels from every term.
    #[serde(default)]
    pub apply_ignore: bool,
}

impl AdaptiveFeatSimConfig {
    pub const WEIGHT_KEYS: [&'static str; 4] = ["src_pos", "src_neg", "sim_pos", "sim_neg"];

    pub fn validate(&self) -> Result<()> {
        validate_window(self.kernel_size, self.dilation, "AdaptiveFeatSimLoss")?;
        validate_sigma(self.sim_type, self.sigma, "AdaptiveFeatSimLoss")?;
        if let Some(top_k) = self.top_k {
            let neighbors = self.kernel_size * self.kernel_size;
            if top_k == 0 || top_k + 1 > neighbors {
                return Err(Error::Config(format!(
                    "AdaptiveFeatSimLoss: top_k {top_k} must be in 1..{neighbors}"
                )));
            }
        }
        for key in Self::WEIGHT_KEYS {
            require_weight(&self.weights, key, "AdaptiveFeatSimLoss")?;
        }
        Ok(())
    }

    pub fn weight(&self, key: &str) -> Result<f64> {
        require_weight(&self.weights, key, "AdaptiveFeatSimLoss")
    }
}

fn validate_sigma(sim_type: SimType, sigma: f64, loss: &str) -> Result<()> {
    if sim_type == SimType::Gaussian && !(sigma > 0.0 && sigma.is_finite()) {
        return Err(Error::Config(format!(
            "{loss}: gaussian similarity needs a positive sigma, got {sigma}"
        )));
    }
    Ok(())
}

fn validate_window(kernel_size: usize, dilation: usize, loss: &str) -> Result<()> {
    if kernel_size == 0 || kernel_size % 2 == 0 {
        return Err(Error::Config(format!(
            "{loss}: kernel_size must be odd, got {kernel_size}"
        )));
    }
    if dilation == 0 {
        return Err(Error::Config(format!("{loss}: dilation must be positive")));
    }
    Ok(())
}

/// One entry of the auxiliary loss list, tagged by loss type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuxLossConfig {
    #[serde(rename = "FeatSimLoss")]
    FeatSim(FeatSimConfig),
    #[serde(rename = "AdaptiveFeatSimLoss")]
    AdaptiveFeatSim(AdaptiveFeatSimConfig),
}

impl AuxLossConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            AuxLossConfig::FeatSim(c) => c.validate(),
            AuxLossConfig::AdaptiveFeatSim(c) => c.validate(),
        }
    }

    pub fn feat_level(&self) -> usize {
        match self {
            AuxLossConfig::FeatSim(c) => c.feat_level,
            AuxLossConfig::AdaptiveFeatSim(c) => c.feat_level,
        }
    }
}

/// Complete configuration of the class-mix adaptation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdaConfig {
    /// EMA ceiling of the teacher decay
    pub alpha: f64,
    pub pseudo_threshold: f64,
    pub pseudo_weight_ignore_top: usize,
    pub pseudo_weight_ignore_bottom: usize,
    pub imnet_feature_dist_lambda: f64,
    pub imnet_feature_dist_classes: Option<Vec<u32>>,
    pub imnet_feature_dist_scale_min_ratio: f64,
    pub mix: MixMode,
    pub blur: bool,
    pub color_jitter_strength: f64,
    pub color_jitter_probability: f64,
    /// Visualization artifacts are produced every this many iterations
    pub debug_img_interval: usize,
    pub print_grad_magnitude: bool,
    pub trg_loss_weight: f64,
    /// Pyramid level mixed between source and teacher features
    pub feat_level: usize,
    pub aux_losses: Vec<AuxLossConfig>,
    pub empty_mask_policy: EmptyMaskPolicy,
    pub ignore_index: u32,
    pub seed: u64,
}

impl Default for UdaConfig {
    fn default() -> Self {
        Self {
            alpha: 0.99,
            pseudo_threshold: 0.968,
            pseudo_weight_ignore_top: 0,
            pseudo_weight_ignore_bottom: 0,
            imnet_feature_dist_lambda: 0.0,
            imnet_feature_dist_classes: None,
            imnet_feature_dist_scale_min_ratio: 0.75,
            mix: MixMode::Class,
            blur: true,
            color_jitter_strength: 0.2,
            color_jitter_probability: 0.2,
            debug_img_interval: 1,
            print_grad_magnitude: false,
            trg_loss_weight: 1.0,
            feat_level: 2,
            aux_losses: Vec::new(),
            empty_mask_policy: EmptyMaskPolicy::Zero,
            ignore_index: IGNORE_INDEX,
            seed: 0,
        }
    }
}

impl UdaConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s).map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn feature_dist_enabled(&self) -> bool {
        self.imnet_feature_dist_lambda > 0.0
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::Config(format!(
                "alpha must be in [0, 1], got {}",
                self.alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.pseudo_threshold) {
            return Err(Error::Config(format!(
                "pseudo_threshold must be in [0, 1], got {}",
                self.pseudo_threshold
            )));
        }
        if self.imnet_feature_dist_lambda < 0.0 {
            return Err(Error::Config(
                "imnet_feature_dist_lambda must not be negative".to_string(),
            ));
        }
        if self.debug_img_interval == 0 {
            return Err(Error::Config(
                "debug_img_interval must be positive".to_string(),
            ));
        }
        for aux in &self.aux_losses {
            aux.validate()?;
            if aux.feat_level() != self.feat_level {
                return Err(Error::Config(format!(
                    "auxiliary loss reads teacher features at level {} but mixing happens at level {}",
                    aux.feat_level(),
                    self.feat_level
                )));
            }
        }
        Ok(())
    }
}

/// Serde rejections of `SimType`/`MixMode` carry our own message; keep them
/// as configuration errors rather than generic serialization failures.
fn config_error(e: serde_json::Error) -> Error {
    Error::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptive_json(sim_type: &str, weights: &str) -> String {
        format!(
            r#"{{
                "alpha": 0.999,
                "pseudo_weight_ignore_top": 15,
                "pseudo_weight_ignore_bottom": 120,
                "aux_losses": [{{
                    "type": "AdaptiveFeatSimLoss",
                    "kernel_size": 3,
                    "dilation": 4,
                    "top_k": 3,
                    "sigma": 35,
                    "weights": {weights},
                    "sim_type": "{sim_type}",
                    "feat_level": 2
                }}]
            }}"#
        )
    }

    #[test]
    fn test_parse_adaptive_config() -> Result<()> {
        let json = adaptive_json(
            "cosine",
            r#"{"src_pos": 0.1, "src_neg": 0.1, "sim_pos": 0.1, "sim_neg": 0.1}"#,
        );
        let config = UdaConfig::from_json_str(&json)?;

        assert_eq!(config.alpha, 0.999);
        assert_eq!(config.pseudo_threshold, 0.968);
        assert_eq!(config.mix, MixMode::Class);
        match &config.aux_losses[0] {
            AuxLossConfig::AdaptiveFeatSim(c) => {
                assert_eq!(c.sim_type, SimType::Cosine);
                assert_eq!(c.top_k, Some(3));
                assert_eq!(c.weight("src_neg")?, 0.1);
            }
            other => panic!("unexpected loss {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_unknown_sim_type_rejected() {
        let json = adaptive_json(
            "euclidean",
            r#"{"src_pos": 1, "src_neg": 1, "sim_pos": 1, "sim_neg": 1}"#,
        );
        let err = UdaConfig::from_json_str(&json).unwrap_err();
        assert!(err.is_config());
        assert!("laplace".parse::<SimType>().unwrap_err().is_config());
    }

    #[test]
    fn test_missing_weight_rejected() {
        let json = adaptive_json("cosine", r#"{"src_pos": 1, "sim_pos": 1, "sim_neg": 1}"#);
        let err = UdaConfig::from_json_str(&json).unwrap_err();
        assert!(err.to_string().contains("src_neg"));
    }

    #[test]
    fn test_mix_mode_must_be_class() {
        let err = UdaConfig::from_json_str(r#"{"mix": "cutmix"}"#).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_feat_level_must_match_mixing_level() {
        let mut config = UdaConfig::default();
        config.aux_losses.push(AuxLossConfig::FeatSim(FeatSimConfig {
            top_k: 2,
            dilation: 1,
            kernel_size: 3,
            sigma: 1.0,
            weights: [("sim_pos".to_string(), 1.0), ("sim_neg".to_string(), 1.0)]
                .into_iter()
                .collect(),
            feat_level: 3,
            sim_type: SimType::Cosine,
        }));
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_gaussian_sigma_must_be_positive() {
        for sigma in ["0", "-2.5"] {
            let json = adaptive_json("gaussian", r#"{"src_pos": 1, "src_neg": 1, "sim_pos": 1, "sim_neg": 1}"#)
                .replace(r#""sigma": 35"#, &format!(r#""sigma": {sigma}"#));
            let err = UdaConfig::from_json_str(&json).unwrap_err();
            assert!(err.to_string().contains("sigma"), "sigma {sigma}: {err}");
        }

        // Cosine similarity never reads sigma
        let json = adaptive_json("cosine", r#"{"src_pos": 1, "src_neg": 1, "sim_pos": 1, "sim_neg": 1}"#)
            .replace(r#""sigma": 35"#, r#""sigma": 0"#);
        assert!(UdaConfig::from_json_str(&json).is_ok());
    }

    #[test]
    fn test_histogram_bins_key_is_accepted() -> Result<()> {
        let json = adaptive_json("cosine", r#"{"src_pos": 1, "src_neg": 1, "sim_pos": 1, "sim_neg": 1}"#)
            .replace(r#""feat_level": 2"#, r#""feat_level": 2, "num_bins": 50"#);
        let config = UdaConfig::from_json_str(&json)?;
        assert_eq!(config.aux_losses.len(), 1);
        Ok(())
    }

    #[test]
    fn test_config_round_trip() -> Result<()> {
        let config = UdaConfig::default();
        let parsed = UdaConfig::from_json_str(&config.to_json_string()?)?;
        assert_eq!(parsed, config);
        Ok(())
    }
}
