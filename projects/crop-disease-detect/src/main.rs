mod cli;
mod error;
mod events;
mod pipeline;
mod settings;
mod transfer;
mod video;
mod web;
mod workspace;

use anyhow::Result;
use cli::Args;
use pipeline::detection::UslsLoader;
use settings::Settings;
use std::sync::Arc;
use video::OpencvBackend;
use web::server::run_server;
use web::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();
    let settings = Settings::from_args(&args)?;
    let state = AppState::new(settings, Arc::new(UslsLoader), Arc::new(OpencvBackend))?;

    run_server(args.host, args.port, state).await?;

    Ok(())
}
