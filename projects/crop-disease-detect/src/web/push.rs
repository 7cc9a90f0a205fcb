use crate::events::PushEvent;
use crate::web::state::AppState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

const GREETING: &str = "Connected to event stream";

fn to_sse(event: &PushEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.payload().to_string())
}

/// Logs when the subscriber's stream is dropped, which is how a closed
/// connection surfaces.
struct DisconnectGuard(Uuid);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        tracing::info!("Push subscriber {} disconnected", self.0);
    }
}

/// `GET /events`: server-sent `message` and `progress` events.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = Uuid::new_v4();
    tracing::info!("Push subscriber {} connected", id);
    let rx = state.events.subscribe();

    let stream = async_stream::stream! {
        let _guard = DisconnectGuard(id);
        yield Ok::<_, Infallible>(to_sse(&PushEvent::Message(GREETING.to_string())));

        let mut events = BroadcastStream::new(rx);
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    yield Ok(to_sse(&event));
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!("Push subscriber {} lagged, skipped {} events", id, skipped);
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
