//! The three kinds of Debug Adapter Protocol message, as they appear on the wire.
//!
//! Arguments and bodies are kept as opaque [`serde_json::Value`]s; only the handler that needs a
//! particular payload interprets it.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One parsed protocol unit.
///
/// The `type` field of the JSON object selects the variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Message {
    /// The sequence number of this message, as assigned by whoever sent it.
    pub fn seq(&self) -> i64 {
        match self {
            Message::Request(request) => request.seq,
            Message::Response(response) => response.seq,
            Message::Event(event) => event.seq,
        }
    }

    /// Consume the message and return a copy carrying the given sequence number.
    ///
    /// Handlers never pick sequence numbers themselves; the session stamps each outbound message
    /// right before it is written.
    pub(crate) fn with_seq(mut self, seq: i64) -> Self {
        match &mut self {
            Message::Request(request) => request.seq = seq,
            Message::Response(response) => response.seq = seq,
            Message::Event(event) => event.seq = seq,
        }
        self
    }

    /// Short human-readable label for logging, e.g. `request:launch` or `event:output`
    pub fn label(&self) -> String {
        match self {
            Message::Request(request) => format!("request:{}", request.command),
            Message::Response(response) => format!("response:{}", response.command),
            Message::Event(event) => format!("event:{}", event.event),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Message::Event(event)
    }
}

/// A command sent by the client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Request {
    pub fn new(seq: i64, command: impl Into<String>, arguments: impl Into<Option<Value>>) -> Self {
        Self {
            seq,
            command: command.into(),
            arguments: arguments.into(),
        }
    }
}

/// The reply to exactly one [`Request`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    /// A successful reply to `request`, optionally with a body
    pub fn success(request: &Request, body: impl Into<Option<Value>>) -> Self {
        Self {
            seq: 0,
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body: body.into(),
        }
    }

    /// A failed reply to `request`.
    ///
    /// `message` is the short, machine-checkable error string that DAP clients show verbatim.
    pub fn error(request: &Request, message: impl Into<String>) -> Self {
        Self {
            seq: 0,
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(message.into()),
            body: None,
        }
    }
}

/// Category of an `output` event.  Only the two the adapter actually produces are modeled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    Stdout,
    Stderr,
}

impl OutputCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputCategory::Stdout => "stdout",
            OutputCategory::Stderr => "stderr",
        }
    }
}

/// A notification sent by the adapter that is not tied to any particular request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    pub fn new(event: impl Into<String>, body: impl Into<Option<Value>>) -> Self {
        Self {
            seq: 0,
            event: event.into(),
            body: body.into(),
        }
    }

    /// An `output` event carrying a chunk of text for the client's debug console
    pub fn output(category: OutputCategory, output: impl Into<String>) -> Self {
        Self::new(
            "output",
            json!({
                "category": category,
                "output": output.into(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_request_with_and_without_arguments() {
        let message: Message = serde_json::from_str(
            r#"{"seq": 3, "type": "request", "command": "launch", "arguments": {"binary": "a.wasm"}}"#,
        )
        .unwrap();
        assert_matches!(message, Message::Request(Request { seq: 3, ref command, arguments: Some(_) }) if command == "launch");

        let message: Message =
            serde_json::from_str(r#"{"seq": 4, "type": "request", "command": "threads"}"#)
                .unwrap();
        assert_matches!(message, Message::Request(Request { arguments: None, .. }));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let result = serde_json::from_str::<Message>(r#"{"seq": 1, "type": "bogus"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn responses_echo_the_request_seq() {
        let request = Request::new(42, "disconnect", None);
        let ok = Response::success(&request, None);
        let failed = Response::error(&request, "unsupported");

        assert_eq!(ok.request_seq, 42);
        assert!(ok.success);
        assert_eq!(failed.request_seq, 42);
        assert!(!failed.success);
        assert_eq!(failed.message.as_deref(), Some("unsupported"));
        assert_eq!(failed.command, "disconnect");
    }

    #[test]
    fn output_event_serialization() {
        let message = Message::from(Event::output(OutputCategory::Stderr, "hi\n")).with_seq(7);
        let json = serde_json::to_string(&message).unwrap();
        expect_test::expect![[r#"{"type":"event","seq":7,"event":"output","body":{"category":"stderr","output":"hi\n"}}"#]]
            .assert_eq(&json);
    }

    #[test]
    fn error_response_serialization_omits_empty_body() {
        let request = Request::new(9, "threads", None);
        let message = Message::from(Response::error(&request, "unsupported")).with_seq(2);
        let json = serde_json::to_string(&message).unwrap();
        expect_test::expect![[r#"{"type":"response","seq":2,"request_seq":9,"success":false,"command":"threads","message":"unsupported"}"#]]
            .assert_eq(&json);
    }
}
