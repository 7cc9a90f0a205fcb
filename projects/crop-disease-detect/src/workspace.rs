use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const DOWNLOAD_FILE: &str = "download.mp4";
const CAPTURE_FILE: &str = "capture.avi";
const OUTPUT_FILE: &str = "output.mp4";
const RESULT_IMAGE_FILE: &str = "result.jpg";
const INPUT_IMAGE_STEM: &str = "input";

/// Scratch directory owned by one request. Everything inside is deleted
/// when the workspace is dropped.
#[derive(Debug)]
pub struct SessionWorkspace {
    id: Uuid,
    dir: PathBuf,
}

impl SessionWorkspace {
    pub fn create(scratch_root: &Path) -> Result<Self> {
        let id = Uuid::new_v4();
        let dir = scratch_root.join(id.to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create session dir {}", dir.display()))?;
        tracing::debug!("Session {} workspace at {}", id, dir.display());
        Ok(Self { id, dir })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn download_path(&self) -> PathBuf {
        self.dir.join(DOWNLOAD_FILE)
    }

    pub fn capture_path(&self) -> PathBuf {
        self.dir.join(CAPTURE_FILE)
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    /// Staging path for an input image, keeping the source's extension.
    pub fn input_image_path(&self, location: &str) -> PathBuf {
        let trimmed = location.split(['?', '#']).next().unwrap_or(location);
        let ext = Path::new(trimmed)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("jpg")
            .to_lowercase();
        self.dir.join(format!("{}.{}", INPUT_IMAGE_STEM, ext))
    }

    pub fn result_image_path(&self) -> PathBuf {
        self.dir.join(RESULT_IMAGE_FILE)
    }

    fn cleanup(&self) {
        if !self.dir.exists() {
            return;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::debug!("Session {} workspace removed", self.id),
            Err(e) => tracing::warn!(
                "Failed to remove session dir {}: {}",
                self.dir.display(),
                e
            ),
        }
    }
}

impl Drop for SessionWorkspace {
    fn drop(&mut self) {
        self.cleanup();
    }
}
