use crate::web::api::{
    file_names_handler, predict_camera_handler, predict_handler, predict_video_handler,
    stop_camera_handler,
};
use crate::web::push::events_handler;
use crate::web::state::AppState;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr, TcpListener};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/file_names", get(file_names_handler))
        .route("/predict", post(predict_handler))
        .route("/predictImg", post(predict_handler))
        .route("/predictVideo", get(predict_video_handler))
        .route("/predictCamera", get(predict_camera_handler))
        .route("/stopCamera", get(stop_camera_handler))
        .route("/events", get(events_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(host: IpAddr, port: u16, state: AppState) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    };

    let app = router(state);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Crop disease detection server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}
