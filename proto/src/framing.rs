//! Line-oriented event framing: each frame is `header: value` lines
//! terminated by a blank line. Recognized headers are `event` (defaults to
//! `message`) and `data` (required, single-line JSON).

use crate::{error::DecodeError, event::StreamEvent};

/// Append one framed event to `out`.
pub fn write_frame(out: &mut String, event: &StreamEvent) {
    out.push_str("event: ");
    out.push_str(event.name());
    out.push('\n');
    out.push_str("data: ");
    out.push_str(&event.payload().to_string());
    out.push_str("\n\n");
}

/// Convenience wrapper returning a single encoded frame.
pub fn encode_frame(event: &StreamEvent) -> String {
    let mut out = String::new();
    write_frame(&mut out, event);
    out
}

/// Incremental frame parser for the client side of the stream. Feed it
/// arbitrarily chunked text; it yields events as frame boundaries complete.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: String,
}

impl FrameDecoder {
    pub fn new() -> Self { Self::default() }

    /// Push a chunk of stream text, returning every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<Result<StreamEvent, DecodeError>> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();

        while let Some(boundary) = self.buf.find("\n\n") {
            let frame: String = self.buf.drain(..boundary + 2).collect();
            let trimmed = frame.trim_end_matches('\n');
            if trimmed.is_empty() {
                continue; // keep-alive blank frame
            }
            events.push(parse_frame(trimmed));
        }

        events
    }

    /// Bytes currently buffered awaiting a frame boundary.
    pub fn pending(&self) -> usize { self.buf.len() }
}

fn parse_frame(frame: &str) -> Result<StreamEvent, DecodeError> {
    let mut name = "message";
    let mut data: Option<&str> = None;

    for line in frame.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            name = value.trim();
        } else if let Some(value) = line.strip_prefix("data:") {
            data = Some(value.trim());
        }
        // Unrecognized headers are ignored per the framing contract.
    }

    let data = data.ok_or(DecodeError::MissingData)?;
    let payload: serde_json::Value = serde_json::from_str(data)?;
    StreamEvent::from_wire(name, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::reason, id::SubscriptionId};

    #[test]
    fn encode_then_decode() {
        let event = StreamEvent::Connected { seq: 42 };
        let text = encode_frame(&event);
        assert_eq!(text, "event: connected\ndata: {\"seq\":42}\n\n");

        let mut decoder = FrameDecoder::new();
        let events = decoder.push(&text);
        assert_eq!(events.len(), 1);
        assert_eq!(*events[0].as_ref().unwrap(), event);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decodes_across_chunk_boundaries() {
        let sub = SubscriptionId::new();
        let mut text = String::new();
        write_frame(&mut text, &StreamEvent::Connected { seq: 1 });
        write_frame(&mut text, &StreamEvent::Invalidate { subscription_id: Some(sub), reason: reason::LOG_TRUNCATED.into() });

        let mut decoder = FrameDecoder::new();
        let mid = text.len() / 2;
        let mut events = decoder.push(&text[..mid]);
        events.extend(decoder.push(&text[mid..]));

        let events: Vec<_> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Connected { seq: 1 },
                StreamEvent::Invalidate { subscription_id: Some(sub), reason: reason::LOG_TRUNCATED.into() },
            ]
        );
    }

    #[test]
    fn frame_without_data_is_an_error() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push("event: connected\n\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(DecodeError::MissingData)));
    }
}
