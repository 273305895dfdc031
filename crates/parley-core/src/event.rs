//! Streaming response events.
//!
//! A stream is `start`, any number of `token`/`tool` events, and exactly one
//! terminal `end` or `error`. Sequence numbers start at 0 and increase by one.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::normalize::NormalizedError;
use crate::thread::ThreadId;
use crate::types::ToolCall;

/// One event of a streamed response.
///
/// Serializes as `{"seq": n, "tag": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub body: EventBody,
}

/// Tag and payload of a [`ResponseEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "lowercase")]
pub enum EventBody {
    Start { thread_id: ThreadId, run_id: Uuid },
    Token { content: String },
    Tool(ToolCall),
    Error(NormalizedError),
    End { thread_id: ThreadId, run_id: Uuid },
}

/// Discriminant of [`EventBody`], used for SSE event names and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTag {
    Start,
    Token,
    Tool,
    Error,
    End,
}

impl EventTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTag::Start => "start",
            EventTag::Token => "token",
            EventTag::Tool => "tool",
            EventTag::Error => "error",
            EventTag::End => "end",
        }
    }
}

impl EventBody {
    pub fn tag(&self) -> EventTag {
        match self {
            EventBody::Start { .. } => EventTag::Start,
            EventBody::Token { .. } => EventTag::Token,
            EventBody::Tool(_) => EventTag::Tool,
            EventBody::Error(_) => EventTag::Error,
            EventBody::End { .. } => EventTag::End,
        }
    }
}

impl ResponseEvent {
    pub fn tag(&self) -> EventTag {
        self.body.tag()
    }

    /// `end` and `error` close a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.tag(), EventTag::End | EventTag::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::ErrorKind;
    use serde_json::json;

    fn thread() -> ThreadId {
        ThreadId::parse("t-1").unwrap()
    }

    #[test]
    fn test_token_event_wire_shape() {
        let event = ResponseEvent {
            seq: 3,
            body: EventBody::Token {
                content: "Hel".to_string(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"seq": 3, "tag": "token", "payload": {"content": "Hel"}}));
    }

    #[test]
    fn test_tool_event_wire_shape() {
        let event = ResponseEvent {
            seq: 1,
            body: EventBody::Tool(ToolCall::new("c1", "calculator", json!({"expr": "1+1"}))),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["tag"], "tool");
        assert_eq!(value["payload"]["name"], "calculator");
        assert_eq!(value["payload"]["args"]["expr"], "1+1");
    }

    #[test]
    fn test_error_event_wire_shape() {
        let event = ResponseEvent {
            seq: 2,
            body: EventBody::Error(NormalizedError::new(
                ErrorKind::AgentExecutionError,
                "The agent failed to produce a response",
            )),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["tag"], "error");
        assert_eq!(value["payload"]["error_kind"], "agent-execution-error");
        assert!(event.is_terminal());
    }

    #[test]
    fn test_start_and_end_carry_thread() {
        let run_id = Uuid::new_v4();
        let start = ResponseEvent {
            seq: 0,
            body: EventBody::Start {
                thread_id: thread(),
                run_id,
            },
        };
        let value = serde_json::to_value(&start).unwrap();
        assert_eq!(value["payload"]["thread_id"], "t-1");
        assert!(!start.is_terminal());

        let end = ResponseEvent {
            seq: 1,
            body: EventBody::End {
                thread_id: thread(),
                run_id,
            },
        };
        assert!(end.is_terminal());
        assert_eq!(end.tag().as_str(), "end");
    }

    #[test]
    fn test_event_deserializes_from_wire() {
        let event: ResponseEvent = serde_json::from_value(
            json!({"seq": 4, "tag": "token", "payload": {"content": "lo"}}),
        )
        .unwrap();
        assert_eq!(event.seq, 4);
        assert_eq!(
            event.body,
            EventBody::Token {
                content: "lo".to_string()
            }
        );
    }
}
