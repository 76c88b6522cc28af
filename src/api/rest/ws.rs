use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::assignment::AssignmentNotice;
use crate::state::AppState;

/// Optional narrowing of the notice stream, e.g. `/ws?driver_id=...` for a
/// driver app that only cares about its own assignments.
#[derive(Debug, Default, Deserialize)]
pub struct NoticeFilter {
    pub driver_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
}

impl NoticeFilter {
    fn accepts(&self, notice: &AssignmentNotice) -> bool {
        self.driver_id.is_none_or(|id| id == notice.driver_id)
            && self.request_id.is_none_or(|id| id == notice.request_id)
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(filter): Query<NoticeFilter>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_notices(socket, state, filter))
}

async fn stream_notices(socket: WebSocket, state: Arc<AppState>, filter: NoticeFilter) {
    let (mut outbound, mut inbound) = socket.split();
    let mut notices = BroadcastStream::new(state.assignment_events_tx.subscribe());

    info!(
        driver_id = ?filter.driver_id,
        request_id = ?filter.request_id,
        "notice subscriber connected"
    );

    let forward = tokio::spawn(async move {
        while let Some(item) = notices.next().await {
            let notice = match item {
                Ok(notice) if filter.accepts(&notice) => notice,
                Ok(_) => continue,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "notice subscriber lagging; notices dropped");
                    continue;
                }
            };
            let frame = match serde_json::to_string(&notice) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "failed to encode assignment notice");
                    continue;
                }
            };
            if outbound.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames carry nothing; reading them only detects the close.
    let drain = tokio::spawn(async move {
        while let Some(Ok(message)) = inbound.next().await {
            if matches!(message, Message::Close(_)) {
                debug!("notice subscriber sent close");
                break;
            }
        }
    });

    tokio::select! {
        _ = forward => {},
        _ = drain => {},
    }

    info!("notice subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::NoticeFilter;
    use crate::models::assignment::AssignmentNotice;

    fn notice(driver: u128, request: u128) -> AssignmentNotice {
        AssignmentNotice {
            assignment_id: Uuid::new_v4(),
            request_id: Uuid::from_u128(request),
            driver_id: Uuid::from_u128(driver),
            estimated_pickup_minutes: 3.0,
            estimated_trip_cost: 12.0,
            assigned_at: Utc::now(),
        }
    }

    #[test]
    fn empty_filter_passes_everything() {
        assert!(NoticeFilter::default().accepts(&notice(1, 10)));
    }

    #[test]
    fn driver_filter_only_passes_that_driver() {
        let filter = NoticeFilter {
            driver_id: Some(Uuid::from_u128(1)),
            request_id: None,
        };
        assert!(filter.accepts(&notice(1, 10)));
        assert!(!filter.accepts(&notice(2, 10)));
    }
}
