//! Realtime payment stream
//!
//! `GET /v1/payments/stream` is the long-lived, unidirectional push channel
//! to the browser: a server-sent-event stream carrying one frame per
//! published session event, opened against the caller's session cookie. The
//! first frame is an immediate heartbeat so the client knows the channel is
//! live; keep-alive heartbeats follow at the configured interval. The
//! subscriber's queue is released as soon as the client disconnects.

use super::{session_from_headers, ApiResponse, ApiState};
use crate::hub::{RealtimeHub, SessionEvent};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
};
use futures::Stream;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A hub subscription that unsubscribes itself when the SSE connection is
/// dropped, so a gone client never leaves a queue behind
struct SessionStream {
    hub: Arc<RealtimeHub>,
    session_id: String,
    client_id: u64,
    rx: mpsc::Receiver<SessionEvent>,
    sent_initial_heartbeat: bool,
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.sent_initial_heartbeat {
            self.sent_initial_heartbeat = true;
            return Poll::Ready(Some(Ok(frame(&SessionEvent::Heartbeat))));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(frame(&event)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        debug!(
            "Stream: client {} disconnected from session {}",
            self.client_id, self.session_id
        );
        self.hub.unsubscribe(&self.session_id, self.client_id);
    }
}

fn frame(event: &SessionEvent) -> Event {
    let name = match event {
        SessionEvent::PaymentPaid { .. } => "payment_paid",
        SessionEvent::PaymentFailed { .. } => "payment_failed",
        SessionEvent::Heartbeat => "heartbeat",
    };
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(name).data(data)
}

/// Open the realtime stream for the caller's session
pub async fn payment_stream(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Some(session_id) = session_from_headers(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::<()>::error("Missing session cookie")),
        )
            .into_response();
    };

    let (client_id, rx) = state.app.hub.subscribe(&session_id);
    info!("Stream: client {} subscribed to session {}", client_id, session_id);

    let stream = SessionStream {
        hub: state.app.hub.clone(),
        session_id,
        client_id,
        rx,
        sent_initial_heartbeat: false,
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.app.config.paywall.heartbeat())
                .event(frame(&SessionEvent::Heartbeat)),
        )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stream_emits_heartbeat_then_events() {
        let hub = Arc::new(RealtimeHub::new());
        let (client_id, rx) = hub.subscribe("sess1");
        let mut stream = SessionStream {
            hub: hub.clone(),
            session_id: "sess1".to_string(),
            client_id,
            rx,
            sent_initial_heartbeat: false,
        };

        // First frame is the immediate heartbeat
        let first = stream.next().await.unwrap().unwrap();
        drop(first);

        hub.publish(
            "sess1",
            SessionEvent::PaymentPaid {
                payment_hash: "h1".into(),
                content_id: 42,
            },
        );
        let second = stream.next().await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = Arc::new(RealtimeHub::new());
        let (client_id, rx) = hub.subscribe("sess1");
        assert_eq!(hub.subscriber_count(), 1);

        let stream = SessionStream {
            hub: hub.clone(),
            session_id: "sess1".to_string(),
            client_id,
            rx,
            sent_initial_heartbeat: false,
        };
        drop(stream);

        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_frame_serializes_event_payload() {
        let event = frame(&SessionEvent::PaymentPaid {
            payment_hash: "h1".into(),
            content_id: 42,
        });
        // Event's Debug output includes the data payload
        let debug = format!("{:?}", event);
        assert!(debug.contains("h1"));
    }
}
