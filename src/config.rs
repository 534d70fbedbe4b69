use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use facecomp_vision::{
    model, CandidatePolicy, DistanceNormalization, SeetaSettings, YuNetSettings,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::narrative::PromptStyle;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACECOMP_CONFIG_PATH").unwrap_or("/usr/local/etc/facecomp/config.toml"))
});

pub static MODELS_DIR: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACECOMP_MODELS_DIR").unwrap_or("/usr/local/share/facecomp/models"))
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub narrative: NarrativeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9000".to_string(),
            body_limit_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorKind {
    /// Whole frame, no detection
    Whole,
    /// SeetaFace cascade on the grayscale image
    Seeta,
    /// YuNet CNN detector
    #[default]
    Yunet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractorKind {
    /// Grayscale pixel patch
    Patch,
    /// SFace identity embedding
    #[default]
    Sface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ScorerKind {
    /// Structural similarity between patches
    Ssim,
    /// Normalized L2 distance between embeddings
    #[default]
    Euclidean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateOrder {
    #[default]
    First,
    MostConfident,
    Largest,
}

impl From<CandidateOrder> for CandidatePolicy {
    fn from(order: CandidateOrder) -> Self {
        match order {
            CandidateOrder::First => CandidatePolicy::First,
            CandidateOrder::MostConfident => CandidatePolicy::MostConfident,
            CandidateOrder::Largest => CandidatePolicy::Largest,
        }
    }
}

/// `normalization = 2.5` or `normalization = "sqrt-dimension"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Normalization {
    Constant(f32),
    Rule(NormalizationRule),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizationRule {
    SqrtDimension,
}

impl Default for Normalization {
    fn default() -> Self {
        Normalization::Constant(facecomp_vision::score::DEFAULT_NORMALIZATION)
    }
}

impl From<Normalization> for DistanceNormalization {
    fn from(n: Normalization) -> Self {
        match n {
            Normalization::Constant(c) => DistanceNormalization::Constant(c),
            Normalization::Rule(NormalizationRule::SqrtDimension) => {
                DistanceNormalization::SqrtDimension
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct YuNetConfig {
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for YuNetConfig {
    fn default() -> Self {
        let s = YuNetSettings::default();
        Self {
            score_threshold: s.score_threshold,
            nms_threshold: s.nms_threshold,
        }
    }
}

impl From<YuNetConfig> for YuNetSettings {
    fn from(c: YuNetConfig) -> Self {
        Self {
            score_threshold: c.score_threshold,
            nms_threshold: c.nms_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SeetaConfig {
    pub min_face_size: u32,
    pub score_threshold: f64,
    pub pyramid_scale_factor: f32,
    pub window_step: u32,
}

impl Default for SeetaConfig {
    fn default() -> Self {
        let s = SeetaSettings::default();
        Self {
            min_face_size: s.min_face_size,
            score_threshold: s.score_threshold,
            pyramid_scale_factor: s.pyramid_scale_factor,
            window_step: s.window_step,
        }
    }
}

impl From<SeetaConfig> for SeetaSettings {
    fn from(c: SeetaConfig) -> Self {
        Self {
            min_face_size: c.min_face_size,
            score_threshold: c.score_threshold,
            pyramid_scale_factor: c.pyramid_scale_factor,
            window_step: c.window_step,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detector: DetectorKind,
    pub extractor: ExtractorKind,
    pub scorer: ScorerKind,
    pub candidate_policy: CandidateOrder,
    /// Directory searched for model files not given explicitly.
    pub models_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yunet_model: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sface_model: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeta_model: Option<PathBuf>,
    pub patch_side: u32,
    pub normalization: Normalization,
    pub jitters: u32,
    pub seed: u64,
    pub yunet: YuNetConfig,
    pub seeta: SeetaConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector: DetectorKind::default(),
            extractor: ExtractorKind::default(),
            scorer: ScorerKind::default(),
            candidate_policy: CandidateOrder::default(),
            models_dir: MODELS_DIR.to_path_buf(),
            yunet_model: None,
            sface_model: None,
            seeta_model: None,
            patch_side: facecomp_vision::feature::DEFAULT_PATCH_SIDE,
            normalization: Normalization::default(),
            jitters: 1,
            seed: 0,
            yunet: YuNetConfig::default(),
            seeta: SeetaConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn yunet_model_path(&self) -> PathBuf {
        self.resolve(&self.yunet_model, model::YUNET_MODEL_FILE)
    }

    pub fn sface_model_path(&self) -> PathBuf {
        self.resolve(&self.sface_model, model::SFACE_MODEL_FILE)
    }

    pub fn seeta_model_path(&self) -> PathBuf {
        self.resolve(&self.seeta_model, model::SEETA_MODEL_FILE)
    }

    fn resolve(&self, explicit: &Option<PathBuf>, file: &str) -> PathBuf {
        explicit
            .clone()
            .unwrap_or_else(|| self.models_dir.join(file))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    #[default]
    Anthropic,
    Openai,
}

impl Provider {
    pub fn api_key_var(&self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Openai => "OPENAI_API_KEY",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Anthropic => "claude-3-sonnet-20240229",
            Provider::Openai => "gpt-4o",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Anthropic => "https://api.anthropic.com",
            Provider::Openai => "https://api.openai.com",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeConfig {
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub prompt: PromptStyle,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: None,
            base_url: None,
            max_tokens: 1000,
            timeout_secs: 60,
            max_retries: 2,
            backoff_ms: 500,
            prompt: PromptStyle::default(),
        }
    }
}

impl NarrativeConfig {
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
    }

    /// Read the provider credential from the environment.
    pub fn api_key(&self) -> Result<String> {
        let var = self.provider.api_key_var();
        let key = std::env::var(var).with_context(|| format!("{} is not set", var))?;
        if key.trim().is_empty() {
            anyhow::bail!("{} is empty", var);
        }
        Ok(key)
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        log::debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}
