use std::convert::Infallible;

use axum::response::sse::{Event, Sse};
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

/// Literal sentinel closing every successful stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One frame of the client-facing stream. Consumers tell frames apart by
/// JSON shape; there are no event names.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Text(String),
    Error(String),
    Done,
}

impl StreamFrame {
    /// The `data:` payload.
    pub fn payload(&self) -> String {
        match self {
            StreamFrame::Text(text) => json!({ "text": text }).to_string(),
            StreamFrame::Error(message) => json!({ "error": message }).to_string(),
            StreamFrame::Done => DONE_SENTINEL.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamFrame::Text(_))
    }
}

/// Wraps the orchestrator's frame channel as an SSE body. The body ends
/// when the sending side is dropped.
pub fn sse_body(
    frames: mpsc::Receiver<StreamFrame>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(ReceiverStream::new(frames).map(|frame| Ok(Event::default().data(frame.payload()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    #[test]
    fn test_payload_shapes() {
        assert_eq!(StreamFrame::Text("Hi \"there\"".into()).payload(), r#"{"text":"Hi \"there\""}"#);
        assert_eq!(StreamFrame::Error("boom".into()).payload(), r#"{"error":"boom"}"#);
        assert_eq!(StreamFrame::Done.payload(), "[DONE]");
        assert!(StreamFrame::Done.is_terminal());
        assert!(!StreamFrame::Text(String::new()).is_terminal());
    }

    #[tokio::test]
    async fn test_sse_body_wire_format() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamFrame::Text("You have 3".into())).await.unwrap();
        tx.send(StreamFrame::Done).await.unwrap();
        drop(tx);

        let response = sse_body(rx).into_response();
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "data: {\"text\":\"You have 3\"}\n\ndata: [DONE]\n\n"
        );
    }
}
