use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use std::path::Path;

/// Total playback time of a media file in seconds, from the video stream's
/// frame count and declared frame rate. Falls back to the container duration
/// when the stream does not record a frame count.
pub fn probe_duration_secs(path: &Path) -> Result<f64> {
    ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

    if !path.exists() {
        return Err(anyhow!("Media file not found: {}", path.display()));
    }
    let input_ctx = ffmpeg_next::format::input(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let stream = input_ctx
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .ok_or_else(|| anyhow!("No video stream found in {}", path.display()))?;

    let rate = stream.avg_frame_rate();
    let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        0.0
    };
    let frames = stream.frames();

    let duration = if frames > 0 && fps > 0.0 {
        frames as f64 / fps
    } else {
        let container = input_ctx.duration();
        if container > 0 {
            container as f64 / ffi::AV_TIME_BASE as f64
        } else {
            0.0
        }
    };

    tracing::debug!(
        "probe: {} frames={} fps={:.2} duration={:.2}s",
        path.display(),
        frames,
        fps,
        duration
    );
    Ok(duration)
}

/// Like [`probe_duration_secs`], but unknown durations come back as zero.
pub fn media_duration(path: &Path) -> f64 {
    match probe_duration_secs(path) {
        Ok(duration) if duration.is_finite() && duration > 0.0 => duration,
        Ok(_) => 0.0,
        Err(e) => {
            tracing::warn!("Could not determine duration of {}: {:#}", path.display(), e);
            0.0
        }
    }
}
