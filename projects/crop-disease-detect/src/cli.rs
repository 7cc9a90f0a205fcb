use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "CROP_DISEASE_HOST")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 5000, env = "CROP_DISEASE_PORT")]
    pub port: u16,

    /// Directory holding one model artifact per crop kind
    #[arg(long, default_value = "./weights", env = "CROP_DISEASE_WEIGHTS_DIR")]
    pub weights_dir: PathBuf,

    /// Root directory for per-request scratch files
    #[arg(long, default_value = "./runs", env = "CROP_DISEASE_SCRATCH_DIR")]
    pub scratch_dir: PathBuf,

    /// Extra label font (TTF/OTF/TTC), consulted before the bundled one.
    /// Pass a CJK face here to render the Chinese half of the labels.
    #[arg(long, env = "CROP_DISEASE_FONT_PATH")]
    pub font_path: Option<PathBuf>,

    /// Base URL of the storage/records service
    #[arg(long, default_value = "http://localhost:9999", env = "CROP_DISEASE_RECORDS_URL")]
    pub records_url: String,

    /// Encoder binary used to transcode captured video
    #[arg(long, default_value = "ffmpeg", env = "CROP_DISEASE_FFMPEG_BIN")]
    pub ffmpeg_bin: String,

    /// Index of the local capture device used by the camera endpoint
    #[arg(long, default_value_t = 0, env = "CROP_DISEASE_CAMERA_INDEX")]
    pub camera_index: i32,

    /// Timeout applied to every outbound HTTP call
    #[arg(long, default_value_t = 30, env = "CROP_DISEASE_HTTP_TIMEOUT_SECS")]
    pub http_timeout_secs: u64,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
