use crate::cli::Args;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub weights_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub font_path: Option<PathBuf>,
    pub records_url: String,
    pub ffmpeg_bin: String,
    pub camera_index: i32,
    pub http_timeout: Duration,
}

impl Settings {
    /// Validate command-line arguments and prepare the scratch directory.
    pub fn from_args(args: &Args) -> Result<Self> {
        if !args.weights_dir.is_dir() {
            return Err(anyhow!(
                "Weights directory does not exist: {}",
                args.weights_dir.display()
            ));
        }

        if let Some(font) = &args.font_path {
            if !font.is_file() {
                return Err(anyhow!("Font file does not exist: {}", font.display()));
            }
        }

        let records_url = args.records_url.trim_end_matches('/').to_string();
        if !(records_url.starts_with("http://") || records_url.starts_with("https://")) {
            return Err(anyhow!("Records URL must be http(s): {}", args.records_url));
        }

        fs::create_dir_all(&args.scratch_dir).with_context(|| {
            format!(
                "Failed to create scratch directory {}",
                args.scratch_dir.display()
            )
        })?;

        tracing::info!(
            "Settings: weights={}, scratch={}, records={}, camera={}",
            args.weights_dir.display(),
            args.scratch_dir.display(),
            records_url,
            args.camera_index
        );

        Ok(Self {
            weights_dir: args.weights_dir.clone(),
            scratch_dir: args.scratch_dir.clone(),
            font_path: args.font_path.clone(),
            records_url,
            ffmpeg_bin: args.ffmpeg_bin.clone(),
            camera_index: args.camera_index,
            http_timeout: Duration::from_secs(args.http_timeout_secs),
        })
    }

    pub fn model_path(&self, model_name: &str) -> PathBuf {
        self.weights_dir.join(model_name)
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn upload_url(&self) -> String {
        format!("{}/files/upload", self.records_url)
    }

    pub fn video_records_url(&self) -> String {
        format!("{}/videoRecords", self.records_url)
    }

    pub fn camera_records_url(&self) -> String {
        format!("{}/cameraRecords", self.records_url)
    }
}
