//! Ordered event channel over one session's stream
//!
//! Tracks which token lane is open and inserts `-start` / `-done`
//! markers on transitions, so consumers always see well-bracketed
//! lanes: every `-start` gets exactly one matching `-done`. Terminal
//! methods consume the channel; whatever lane is open gets closed
//! before the trailing sentinels go out.
//!
//! Once the session is cancelled, token frames are silently dropped.
//! Terminal frames still go out, so a consumer that is still connected
//! sees a clean close instead of a stream that just stops.

use crate::stream::event::{EventKind, StreamFrame};
use crate::stream::registry::StreamHandle;

pub struct EventChannel {
    handle: StreamHandle,
    open: Option<EventKind>,
}

impl EventChannel {
    pub fn new(handle: StreamHandle) -> Self {
        Self { handle, open: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Push one token frame, bracketing lane changes with markers
    pub async fn emit(&mut self, kind: EventKind, payload: &str) {
        if self.is_cancelled() {
            return;
        }

        if self.open != Some(kind) {
            if let Some(prev) = self.open.take() {
                if kind.ordinal() < prev.ordinal() {
                    tracing::warn!(
                        session = %self.handle.session(),
                        from = prev.name(),
                        to = kind.name(),
                        "Event lanes regressed"
                    );
                }
                self.handle.send(StreamFrame::done(prev)).await;
            }
            self.handle.send(StreamFrame::start(kind)).await;
            self.open = Some(kind);
        }

        self.handle.send(StreamFrame::process(kind, payload)).await;
    }

    /// Close the open lane and end the stream normally
    pub async fn complete(mut self) {
        self.close_open_lane().await;
        self.handle.send(StreamFrame::disconnect()).await;
    }

    /// Close the open lane, surface the failure, then end the stream
    pub async fn fail(mut self, message: &str) {
        self.close_open_lane().await;
        self.handle.send(StreamFrame::exception(message)).await;
        self.handle.send(StreamFrame::disconnect()).await;
    }

    /// Close the open lane after a cancellation; no exception frame
    pub async fn cancelled(mut self) {
        self.close_open_lane().await;
        self.handle.send(StreamFrame::disconnect()).await;
    }

    async fn close_open_lane(&mut self) {
        if let Some(prev) = self.open.take() {
            self.handle.send(StreamFrame::done(prev)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::event::DISCONNECT_EVENT;
    use crate::stream::registry::{EventStream, StreamRegistry};

    async fn frames_until_disconnect(stream: &mut EventStream) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = stream.recv().await {
            let is_disconnect = frame.event == DISCONNECT_EVENT;
            frames.push(frame);
            if is_disconnect {
                break;
            }
        }
        frames
    }

    fn open_channel(registry: &StreamRegistry, session: &str) -> (EventStream, EventChannel) {
        let stream = registry.create(session).unwrap();
        let channel = EventChannel::new(registry.get(session).unwrap());
        (stream, channel)
    }

    #[tokio::test]
    async fn test_lane_transitions_are_bracketed() {
        let registry = StreamRegistry::new(64);
        let (mut stream, mut channel) = open_channel(&registry, "s");

        channel.emit(EventKind::Reasoning, "mulling").await;
        channel.emit(EventKind::Reasoning, "still").await;
        channel.emit(EventKind::Answer, "verdict").await;
        channel.complete().await;

        let events: Vec<String> = frames_until_disconnect(&mut stream)
            .await
            .into_iter()
            .map(|f| f.event)
            .collect();
        assert_eq!(
            events,
            vec![
                "connect",
                "reasoning-start",
                "reasoning",
                "reasoning",
                "reasoning-done",
                "answer-start",
                "answer",
                "answer-done",
                "disconnect",
            ]
        );
    }

    #[tokio::test]
    async fn test_token_payloads_are_escaped() {
        let registry = StreamRegistry::new(64);
        let (mut stream, mut channel) = open_channel(&registry, "s");

        channel.emit(EventKind::Answer, "two words\nsecond line").await;
        channel.complete().await;

        let frames = frames_until_disconnect(&mut stream).await;
        let token = frames.iter().find(|f| f.event == "answer").unwrap();
        assert_eq!(token.data, "two&nbsp;words\\nsecond&nbsp;line");
    }

    #[tokio::test]
    async fn test_fail_closes_lane_before_exception() {
        let registry = StreamRegistry::new(64);
        let (mut stream, mut channel) = open_channel(&registry, "s");

        channel.emit(EventKind::Answer, "partial").await;
        channel.fail("backend unavailable").await;

        let frames = frames_until_disconnect(&mut stream).await;
        let events: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(
            events,
            vec![
                "connect",
                "answer-start",
                "answer",
                "answer-done",
                "exception",
                "disconnect",
            ]
        );
        let exception = frames.iter().find(|f| f.event == "exception").unwrap();
        assert_eq!(exception.data, "backend unavailable");
    }

    #[tokio::test]
    async fn test_tokens_dropped_after_cancellation() {
        let registry = StreamRegistry::new(64);
        let (mut stream, mut channel) = open_channel(&registry, "s");
        let handle = registry.get("s").unwrap();

        channel.emit(EventKind::Answer, "kept").await;
        handle.cancel();
        channel.emit(EventKind::Answer, "dropped").await;
        channel.cancelled().await;

        let frames = frames_until_disconnect(&mut stream).await;
        let tokens: Vec<&str> = frames
            .iter()
            .filter(|f| f.event == "answer")
            .map(|f| f.data.as_str())
            .collect();
        assert_eq!(tokens, vec!["kept"]);

        let events: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(
            events,
            vec!["connect", "answer-start", "answer", "answer-done", "disconnect"]
        );
    }

    #[tokio::test]
    async fn test_empty_stream_still_closes_cleanly() {
        let registry = StreamRegistry::new(64);
        let (mut stream, channel) = open_channel(&registry, "s");

        channel.complete().await;

        let events: Vec<String> = frames_until_disconnect(&mut stream)
            .await
            .into_iter()
            .map(|f| f.event)
            .collect();
        assert_eq!(events, vec!["connect", "disconnect"]);
    }
}
