//! Typed records carried inside frames.
//!
//! Requests arrive as `{sender, payload, meta}` where `payload` is a
//! JSON list `[enqueue_ts, command, args...]`. Replies travel back
//! wrapped in a [`ReplyEnvelope`] that names the sender reference the
//! reply answers.

use crate::error::ProtoError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use skald_types::Status;

/// Handshake frame sent once after connecting.
///
/// Carries the supervisor-assigned node id and the shared auth cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Supervisor-assigned id of this service instance.
    pub node_id: u32,
    /// Shared authentication cookie.
    pub cookie: String,
}

/// One positional command argument.
///
/// The wire distinguishes only integers and byte strings; everything
/// structured (script sources, JSON payloads) travels as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    /// Integer argument.
    Int(i64),
    /// Text argument.
    Text(String),
}

impl Arg {
    /// Returns the text content, if this argument is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Int(_) => None,
        }
    }

    /// Returns the integer content, if this argument is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Opaque sender reference, echoed in the reply envelope.
    pub sender: String,
    /// Enqueue timestamp, milliseconds since the Unix epoch.
    pub enqueue_ts: u64,
    /// Command name.
    pub command: String,
    /// Positional arguments after the command name.
    pub args: Vec<Arg>,
}

/// Raw wire shape of a request, before payload validation.
#[derive(Debug, Serialize, Deserialize)]
struct RawRequest {
    sender: String,
    payload: Vec<JsonValue>,
    #[serde(default)]
    meta: JsonValue,
}

impl Request {
    /// Decodes a request from a frame body.
    ///
    /// # Errors
    ///
    /// [`ProtoError::Malformed`] when the body is not JSON, the
    /// payload list is shorter than `[ts, command]`, the timestamp is
    /// not an unsigned integer, or an argument is neither integer nor
    /// text.
    pub fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        let raw: RawRequest = serde_json::from_slice(body)
            .map_err(|e| ProtoError::Malformed(format!("request: {e}")))?;

        let mut payload = raw.payload.into_iter();
        let enqueue_ts = payload
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ProtoError::Malformed("payload missing timestamp".into()))?;
        let command = match payload.next() {
            Some(JsonValue::String(s)) => s,
            _ => return Err(ProtoError::Malformed("payload missing command".into())),
        };

        let mut args = Vec::new();
        for value in payload {
            match value {
                JsonValue::String(s) => args.push(Arg::Text(s)),
                JsonValue::Number(n) => {
                    let int = n
                        .as_i64()
                        .ok_or_else(|| ProtoError::Malformed("non-integer argument".into()))?;
                    args.push(Arg::Int(int));
                }
                other => {
                    return Err(ProtoError::Malformed(format!(
                        "unsupported argument type: {other}"
                    )))
                }
            }
        }

        Ok(Self {
            sender: raw.sender,
            enqueue_ts,
            command,
            args,
        })
    }

    /// Encodes this request to a frame body (supervisor side; used by
    /// tests and tooling).
    ///
    /// # Errors
    ///
    /// Serialization failure, which cannot happen for these types in
    /// practice.
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut payload = vec![
            JsonValue::from(self.enqueue_ts),
            JsonValue::from(self.command.clone()),
        ];
        for arg in &self.args {
            payload.push(match arg {
                Arg::Int(n) => JsonValue::from(*n),
                Arg::Text(s) => JsonValue::from(s.clone()),
            });
        }
        let raw = RawRequest {
            sender: self.sender.clone(),
            payload,
            meta: JsonValue::Null,
        };
        serde_json::to_vec(&raw).map_err(|e| ProtoError::Malformed(e.to_string()))
    }
}

/// A reply to the supervisor.
///
/// Three shapes, mirroring the supervisor's expectations: a single
/// value, a property list (`get_statistics`, `get_priorities`), or a
/// priority echo (`set_priority`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    /// `{status, data}`
    Value {
        /// Outcome code.
        status: Status,
        /// Payload: text, integer, or structured JSON.
        data: JsonValue,
    },
    /// `{status, [{key, value}, ...]}`
    Props {
        /// Outcome code.
        status: Status,
        /// Ordered property list.
        props: Vec<(String, JsonValue)>,
    },
    /// `{status, {command, name}, {priority, n}}`
    Priority {
        /// Outcome code.
        status: Status,
        /// Command whose priority was set.
        command: String,
        /// New priority.
        priority: i64,
    },
}

impl Reply {
    /// A `{status, text}` reply.
    #[must_use]
    pub fn text(status: Status, message: impl Into<String>) -> Self {
        Self::Value {
            status,
            data: JsonValue::from(message.into()),
        }
    }

    /// An `{OK, value}` reply.
    #[must_use]
    pub fn ok(data: impl Into<JsonValue>) -> Self {
        Self::Value {
            status: Status::Ok,
            data: data.into(),
        }
    }

    /// The status code of any reply shape.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Value { status, .. }
            | Self::Props { status, .. }
            | Self::Priority { status, .. } => *status,
        }
    }
}

/// Reply plus the sender reference it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Sender reference copied from the request.
    pub to: String,
    /// The reply itself.
    pub reply: Reply,
}

impl ReplyEnvelope {
    /// Encodes the envelope to a frame body.
    ///
    /// # Errors
    ///
    /// Serialization failure, which cannot happen for these types in
    /// practice.
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self).map_err(|e| ProtoError::Malformed(e.to_string()))
    }

    /// Decodes an envelope from a frame body (supervisor side).
    ///
    /// # Errors
    ///
    /// [`ProtoError::Malformed`] when the body is not an envelope.
    pub fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(body).map_err(|e| ProtoError::Malformed(format!("reply: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = Request {
            sender: "pid<0.42.0>".into(),
            enqueue_ts: 1_700_000_000_000,
            command: "run".into(),
            args: vec![
                Arg::Text("conv".into()),
                Arg::Text("node".into()),
                Arg::Text("{\"a\":1}".into()),
            ],
        };
        let body = req.encode().unwrap();
        assert_eq!(Request::decode(&body).unwrap(), req);
    }

    #[test]
    fn request_with_integer_arg() {
        let body = br#"{"sender":"s","payload":[1700000000000,"set_max_diff_time",5000]}"#;
        let req = Request::decode(body).unwrap();
        assert_eq!(req.command, "set_max_diff_time");
        assert_eq!(req.args, vec![Arg::Int(5000)]);
    }

    #[test]
    fn request_without_command_rejected() {
        let body = br#"{"sender":"s","payload":[1700000000000]}"#;
        assert!(Request::decode(body).is_err());
    }

    #[test]
    fn request_with_bad_timestamp_rejected() {
        let body = br#"{"sender":"s","payload":["soon","run"]}"#;
        assert!(Request::decode(body).is_err());
        let body = br#"{"sender":"s","payload":[-5,"run"]}"#;
        assert!(Request::decode(body).is_err());
    }

    #[test]
    fn request_with_structured_arg_rejected() {
        let body = br#"{"sender":"s","payload":[1,"run",{"nested":true}]}"#;
        assert!(Request::decode(body).is_err());
    }

    #[test]
    fn non_json_body_rejected() {
        assert!(Request::decode(b"\x00\x01garbage").is_err());
    }

    #[test]
    fn reply_shapes_round_trip() {
        let replies = [
            Reply::text(Status::SocketTimeout, "Socket queue timeout."),
            Reply::ok(serde_json::json!({"a": 2})),
            Reply::Props {
                status: Status::Ok,
                props: vec![("pool_threads".into(), 4.into())],
            },
            Reply::Priority {
                status: Status::Ok,
                command: "run".into(),
                priority: 2,
            },
        ];
        for reply in replies {
            let envelope = ReplyEnvelope {
                to: "pid".into(),
                reply: reply.clone(),
            };
            let body = envelope.encode().unwrap();
            let back = ReplyEnvelope::decode(&body).unwrap();
            assert_eq!(back.reply, reply);
            assert_eq!(back.to, "pid");
        }
    }

    #[test]
    fn status_survives_envelope_encoding() {
        let envelope = ReplyEnvelope {
            to: "pid".into(),
            reply: Reply::text(Status::ThreadPoolExhausted, "Thread pool exhausted."),
        };
        let body = envelope.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["reply"]["status"], 102);
    }
}
