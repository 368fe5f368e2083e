//! Binary configuration: optional JSON file, then `TIMELAPSE_*` overrides.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `TIMELAPSE_SPEED` | `session.speed_multiplier` |
//! | `TIMELAPSE_RESOLUTION` | `session.resolution` (`720p`, `1080p`, `1440p`, `4k`) |
//! | `TIMELAPSE_TIMESTAMP` | `session.show_timestamp` |
//! | `TIMELAPSE_WORK_DIR` | `work_dir` |
//! | `TIMELAPSE_OUTPUT_DIR` | `output_dir` |
//! | `TIMELAPSE_SOURCE_DIR` | `source_dir` (replay stills instead of a live source) |
//! | `TIMELAPSE_SOURCE_PIPELINE` | `source_pipeline` (GStreamer launch description) |
//! | `TIMELAPSE_BACKEND` | `backend` (`gstreamer` or `loopback`) |
//! | `TIMELAPSE_DURATION_SECS` | `duration_secs` (stop automatically) |

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use timelapse_core::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Gstreamer,
    Loopback,
}

impl BackendKind {
    /// Extension of the files this backend writes. Loopback containers are
    /// JSON and must not pass for playable video.
    pub fn artifact_extension(self) -> &'static str {
        match self {
            BackendKind::Gstreamer => "mp4",
            BackendKind::Loopback => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    #[serde(alias = "workDir")]
    pub work_dir: PathBuf,
    #[serde(alias = "outputDir")]
    pub output_dir: PathBuf,
    #[serde(alias = "sourceDir")]
    pub source_dir: Option<PathBuf>,
    #[serde(alias = "sourcePipeline")]
    pub source_pipeline: Option<String>,
    pub backend: BackendKind,
    #[serde(alias = "durationSecs")]
    pub duration_secs: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            work_dir: std::env::temp_dir(),
            output_dir: PathBuf::from("."),
            source_dir: None,
            source_pipeline: None,
            backend: BackendKind::default(),
            duration_secs: None,
        }
    }
}

impl AppConfig {
    /// Read `path` (if given), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Reading config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.session.validate().context("Session configuration")?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("TIMELAPSE_SPEED") {
            self.session.speed_multiplier = v.trim().parse().context("TIMELAPSE_SPEED")?;
        }
        if let Some(v) = var("TIMELAPSE_RESOLUTION") {
            self.session.resolution = v
                .parse()
                .map_err(anyhow::Error::msg)
                .context("TIMELAPSE_RESOLUTION")?;
        }
        if let Some(v) = var("TIMELAPSE_TIMESTAMP") {
            self.session.show_timestamp = parse_flag(&v).context("TIMELAPSE_TIMESTAMP")?;
        }
        if let Some(v) = var("TIMELAPSE_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = var("TIMELAPSE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = var("TIMELAPSE_SOURCE_DIR") {
            self.source_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("TIMELAPSE_SOURCE_PIPELINE") {
            self.source_pipeline = Some(v);
        }
        if let Some(v) = var("TIMELAPSE_BACKEND") {
            self.backend = match v.trim().to_ascii_lowercase().as_str() {
                "gstreamer" | "gst" => BackendKind::Gstreamer,
                "loopback" => BackendKind::Loopback,
                other => bail!("TIMELAPSE_BACKEND: unknown backend '{other}'"),
            };
        }
        if let Some(v) = var("TIMELAPSE_DURATION_SECS") {
            self.duration_secs = Some(v.trim().parse().context("TIMELAPSE_DURATION_SECS")?);
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}
