// Stream publisher: frames one subscriber's events as server-sent events.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, error};

use crate::engine::bus::Subscription;
use crate::engine::events::ProgressEvent;

/// Wire shape of one pushed message.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct EventFrame {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded: Option<bool>,
}

impl EventFrame {
    pub fn new(filename: &str, event: &ProgressEvent) -> Self {
        let mut frame = Self {
            filename: filename.to_string(),
            ..Self::default()
        };
        match event {
            ProgressEvent::Progress { percent } => frame.progress = Some(percent.to_string()),
            ProgressEvent::Error { message } => frame.error = Some(message.clone()),
            ProgressEvent::Complete { exit_code } => {
                frame.complete = Some(true);
                frame.code = *exit_code;
            }
            ProgressEvent::Cancelled => {
                frame.complete = Some(true);
                frame.cancelled = Some(true);
            }
            ProgressEvent::Superseded => {
                frame.complete = Some(true);
                frame.superseded = Some(true);
            }
        }
        frame
    }
}

/// Map a subscription to SSE events, one per progress event, ending after
/// the terminal one. Dropping the stream drops (and detaches) the subscription.
pub fn event_stream(subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    let filename = subscription.key().to_string();
    subscription.into_stream().filter_map(move |event| {
        let frame = EventFrame::new(&filename, &event);
        let encoded = match serde_json::to_string(&frame) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(e) => {
                error!("failed to encode event for {}: {}", filename, e);
                None
            }
        };
        if event.is_terminal() {
            debug!("stream for {} ended with {:?}", filename, event);
        }
        futures::future::ready(encoded)
    })
}

/// Long-lived push response for one subscriber.
pub fn sse_response(
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(event_stream(subscription)).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_frame() {
        let frame = EventFrame::new("report.csv", &ProgressEvent::Progress { percent: 55.0 });
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"filename":"report.csv","progress":"55"}"#);
    }

    #[test]
    fn test_error_and_complete_frames() {
        let error = EventFrame::new(
            "missing.dat",
            &ProgressEvent::Error {
                message: "not found".to_string(),
            },
        );
        assert_eq!(
            serde_json::to_string(&error).unwrap(),
            r#"{"filename":"missing.dat","error":"not found"}"#
        );

        let complete = EventFrame::new("missing.dat", &ProgressEvent::Complete { exit_code: Some(2) });
        assert_eq!(
            serde_json::to_string(&complete).unwrap(),
            r#"{"filename":"missing.dat","complete":true,"code":2}"#
        );
    }

    #[test]
    fn test_synthetic_terminal_frames() {
        let cancelled = EventFrame::new("big.bin", &ProgressEvent::Cancelled);
        assert_eq!(
            serde_json::to_string(&cancelled).unwrap(),
            r#"{"filename":"big.bin","complete":true,"cancelled":true}"#
        );

        let superseded = EventFrame::new("big.bin", &ProgressEvent::Superseded);
        assert_eq!(superseded.complete, Some(true));
        assert_eq!(superseded.superseded, Some(true));
        assert_eq!(superseded.code, None);
    }
}
