//! Server-Sent-Events wire framing for subscription frames.
//!
//! The HTTP route itself lives outside this crate; gateways only need a way
//! to turn [`StreamFrame`]s into SSE text. Every non-heartbeat frame built
//! from a logged event carries `id: <seq>` so a reconnecting client resumes
//! after the last frame it saw via the standard `Last-Event-ID` mechanism.

use super::fanout::StreamFrame;
use serde_json::json;

/// Render one frame as an SSE wire chunk (including the trailing blank line).
///
/// Payloads are compact JSON and therefore single-line, so one `data:` line
/// is always enough.
pub fn encode_frame(frame: &StreamFrame) -> String {
    match frame {
        StreamFrame::Hello {
            run_id,
            server_time,
        } => {
            let data = json!({
                "runId": run_id,
                "server_time": server_time.to_rfc3339(),
            });
            format!("event: hello\ndata: {data}\n\n")
        }
        StreamFrame::Event(event) => format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            event.seq,
            event.kind.as_str(),
            event.data
        ),
        StreamFrame::Heartbeat => ": keep-alive\n\n".to_string(),
    }
}

/// Parse a `Last-Event-ID` header value back into a seq. Garbage is treated
/// as absent rather than an error, per SSE convention.
pub fn parse_last_event_id(raw: &str) -> Option<u64> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventKind};
    use chrono::Utc;

    #[test]
    fn event_frames_carry_seq_as_id() {
        let event = Event {
            seq: 41,
            run_id: "r1".into(),
            kind: EventKind::NodeStatus,
            node_id: Some("build".into()),
            data: serde_json::json!({"runId": "r1", "nodeId": "build", "status": "running"}),
            ts: Utc::now(),
        };
        let wire = encode_frame(&StreamFrame::Event(event));
        assert!(wire.starts_with("id: 41\nevent: node_status\ndata: "));
        assert!(wire.ends_with("\n\n"));
    }

    #[test]
    fn heartbeats_are_comments() {
        assert_eq!(encode_frame(&StreamFrame::Heartbeat), ": keep-alive\n\n");
    }

    #[test]
    fn hello_frame_has_no_id() {
        let wire = encode_frame(&StreamFrame::Hello {
            run_id: "r1".into(),
            server_time: Utc::now(),
        });
        assert!(wire.starts_with("event: hello\n"));
        assert!(!wire.contains("id:"));
    }

    #[test]
    fn last_event_id_parsing() {
        assert_eq!(parse_last_event_id("40"), Some(40));
        assert_eq!(parse_last_event_id(" 40 "), Some(40));
        assert_eq!(parse_last_event_id("nope"), None);
        assert_eq!(parse_last_event_id(""), None);
    }
}
