use super::probe::media_duration;
use anyhow::{anyhow, Result};
use futures::Stream;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Runs the external encoder that turns a raw capture into a web-friendly
/// H.264 file.
#[derive(Debug, Clone)]
pub struct Transcoder {
    bin: String,
}

impl Transcoder {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Transcode `input` into `output`, yielding percent-complete values.
    ///
    /// Values are clamped to [0, 100] and strictly increase. The sequence
    /// ends with a single 100 once the encoder has exited, whether or not
    /// it succeeded.
    pub fn run(&self, input: &Path, output: &Path) -> impl Stream<Item = f64> + Send + 'static {
        let bin = self.bin.clone();
        let input = input.to_path_buf();
        let output = output.to_path_buf();

        async_stream::stream! {
            let mut last = 0.0_f64;
            let probe_path = input.clone();
            let duration = tokio::task::spawn_blocking(move || media_duration(&probe_path))
                .await
                .unwrap_or(0.0);
            if duration <= 0.0 {
                tracing::warn!(
                    "Unknown duration for {}, progress updates suppressed",
                    input.display()
                );
            }

            match spawn_encoder(&bin, &input, &output) {
                Err(e) => tracing::error!("Failed to start {}: {:#}", bin, e),
                Ok(mut child) => {
                    if let Some(mut stderr) = child.stderr.take() {
                        let mut lines = LineSplitter::default();
                        let mut buf = [0u8; 4096];
                        loop {
                            let n = match stderr.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(n) => n,
                                Err(e) => {
                                    tracing::warn!("Reading encoder output failed: {}", e);
                                    break;
                                }
                            };
                            for line in lines.push(&buf[..n]) {
                                if duration <= 0.0 {
                                    continue;
                                }
                                match parse_progress_time(&line) {
                                    Ok(Some(secs)) => {
                                        let percent = (secs / duration * 100.0).clamp(0.0, 100.0);
                                        if percent > last {
                                            last = percent;
                                            yield percent;
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(e) => tracing::debug!("Skipping progress line: {:#}", e),
                                }
                            }
                        }
                    }

                    match child.wait().await {
                        Ok(status) if status.success() => {
                            tracing::info!("Transcoded {} -> {}", input.display(), output.display());
                        }
                        Ok(status) => tracing::error!(
                            "{} exited with {} while transcoding {}",
                            bin,
                            status,
                            input.display()
                        ),
                        Err(e) => tracing::error!("Waiting for {} failed: {}", bin, e),
                    }
                }
            }

            if last < 100.0 {
                yield 100.0;
            }
        }
    }
}

fn spawn_encoder(bin: &str, input: &Path, output: &Path) -> Result<tokio::process::Child> {
    let child = Command::new(bin)
        .arg("-i")
        .arg(input)
        .arg("-vcodec")
        .arg("libx264")
        .arg(output)
        .arg("-y")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

/// Splits the encoder's stderr into lines. Progress updates are terminated
/// by `\r`, everything else by `\n`.
#[derive(Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in chunk {
            if b == b'\r' || b == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }
}

/// Extract the `time=HH:MM:SS.xx` field of an encoder progress line.
/// Lines without the field yield `None`; a field that cannot be parsed is
/// an error.
pub fn parse_progress_time(line: &str) -> Result<Option<f64>> {
    let Some(start) = line.find("time=") else {
        return Ok(None);
    };
    let value = line[start + 5..]
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("empty time field in '{}'", line))?;

    let parts: Vec<&str> = value.split(':').collect();
    let [h, m, s] = parts.as_slice() else {
        return Err(anyhow!("malformed time '{}'", value));
    };
    let hours: f64 = h.parse().map_err(|_| anyhow!("malformed hours in '{}'", value))?;
    let minutes: f64 = m.parse().map_err(|_| anyhow!("malformed minutes in '{}'", value))?;
    let seconds: f64 = s.parse().map_err(|_| anyhow!("malformed seconds in '{}'", value))?;
    Ok(Some(hours * 3600.0 + minutes * 60.0 + seconds))
}
