use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::publish::RetryPolicy;
use crate::render::{LayerConfigs, SpectrumLayer, WaveformLayer};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default = "default_layers")]
    pub layers: LayerConfigs,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub font: FontConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            layers: default_layers(),
            scheduler: SchedulerConfig::default(),
            font: FontConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_crf")]
    pub crf: u32,
    /// Video codec, or `auto` to probe for a hardware encoder.
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_pix_fmt")]
    pub pix_fmt: String,
    #[serde(default)]
    pub bitrate: Option<String>,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            crf: default_crf(),
            codec: default_codec(),
            pix_fmt: default_pix_fmt(),
            bitrate: None,
            audio_bitrate: default_audio_bitrate(),
            dir: default_output_dir(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SchedulerConfig {
    /// Share of overall progress given to rendering when a job also publishes.
    #[serde(default = "default_render_weight")]
    pub render_weight: u8,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Frames synthesized in parallel per batch; defaults to the rayon pool size.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            render_weight: default_render_weight(),
            max_concurrency: default_max_concurrency(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_attempts: default_max_attempts(),
            batch_size: None,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FontConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_width() -> u32 { 1920 }
fn default_height() -> u32 { 1080 }
fn default_fps() -> u32 { 30 }
fn default_crf() -> u32 { 18 }
fn default_codec() -> String { "auto".into() }
fn default_pix_fmt() -> String { "yuv420p".into() }
fn default_audio_bitrate() -> String { "320k".into() }
fn default_output_dir() -> PathBuf { PathBuf::from("renders") }
fn default_render_weight() -> u8 { 70 }
fn default_max_concurrency() -> usize { 1 }
fn default_retry_base_delay_ms() -> u64 { 1000 }
fn default_max_attempts() -> u32 { 3 }

fn default_layers() -> LayerConfigs {
    LayerConfigs {
        waveform: Some(WaveformLayer::default()),
        spectrum: Some(SpectrumLayer::default()),
        overlays: Vec::new(),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// `beatcast.toml` in the working directory, then the per-user config file.
pub fn find_config_path() -> Option<PathBuf> {
    let local = PathBuf::from("beatcast.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(home) = dirs::home_dir() {
        let xdg = home.join(".config").join("beatcast").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join("beatcast").join("config.toml"))
        .filter(|p| p.exists())
}
