//! Text packet codec.
//!
//! One WebSocket text message carries one packet. The first character is the
//! transport packet type; message packets (`4`) carry a second character with
//! the session packet type.
//!
//! | text                  | frame                   |
//! |-----------------------|-------------------------|
//! | `0{"sid":..}`         | [`Frame::Open`]         |
//! | `1`                   | [`Frame::Close`]        |
//! | `2` / `3`             | [`Frame::Ping`] / [`Frame::Pong`] |
//! | `40`                  | [`Frame::Connect`]      |
//! | `41`                  | [`Frame::Disconnect`]   |
//! | `42["name",payload]`  | [`Frame::Event`]        |
//! | `44{..}`              | [`Frame::ConnectError`] |
//! | `6`                   | [`Frame::Noop`]         |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChannelError, ChannelResult};

/// Parameters the remote announces when the transport opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    /// Session id assigned by the remote.
    pub sid: String,

    #[serde(default)]
    pub upgrades: Vec<String>,

    /// Milliseconds between heartbeats.
    #[serde(default)]
    pub ping_interval: u64,

    /// Milliseconds the remote waits for a heartbeat answer.
    #[serde(default)]
    pub ping_timeout: u64,
}

/// One decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(OpenPayload),
    Close,
    Ping,
    Pong,
    /// Namespace connected (inbound) or connect request (outbound).
    Connect,
    Disconnect,
    Event {
        name: String,
        payload: Value,
    },
    ConnectError(Value),
    Noop,
}

impl Frame {
    /// Build an event frame from a serializable payload.
    pub fn event<T: Serialize>(name: &str, payload: &T) -> ChannelResult<Self> {
        Ok(Frame::Event {
            name: name.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Open(_) => "open",
            Frame::Close => "close",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::Connect => "connect",
            Frame::Disconnect => "disconnect",
            Frame::Event { .. } => "event",
            Frame::ConnectError(_) => "connect_error",
            Frame::Noop => "noop",
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Frame::Open(payload) => format!("0{}", json_or_empty(payload)),
            Frame::Close => "1".to_string(),
            Frame::Ping => "2".to_string(),
            Frame::Pong => "3".to_string(),
            Frame::Connect => "40".to_string(),
            Frame::Disconnect => "41".to_string(),
            Frame::Event { name, payload } => {
                let envelope = Value::Array(vec![Value::String(name.clone()), payload.clone()]);
                format!("42{}", envelope)
            }
            Frame::ConnectError(payload) => format!("44{}", payload),
            Frame::Noop => "6".to_string(),
        }
    }

    pub fn decode(text: &str) -> ChannelResult<Self> {
        let mut chars = text.chars();
        let frame = match chars.next() {
            Some('0') => Frame::Open(
                serde_json::from_str(chars.as_str()).map_err(|e| malformed(text, e))?,
            ),
            Some('1') => Frame::Close,
            Some('2') => Frame::Ping,
            Some('3') => Frame::Pong,
            Some('4') => decode_message(text, chars.as_str())?,
            Some('6') => Frame::Noop,
            Some(other) => return Err(malformed(text, format!("unknown packet type {:?}", other))),
            None => return Err(malformed(text, "empty packet")),
        };
        Ok(frame)
    }
}

fn decode_message(text: &str, body: &str) -> ChannelResult<Frame> {
    let mut chars = body.chars();
    let kind = chars.next();
    let rest = skip_namespace(chars.as_str());

    match kind {
        // The connect packet may carry the namespace sid; it is not needed.
        Some('0') => Ok(Frame::Connect),
        Some('1') => Ok(Frame::Disconnect),
        Some('2') => {
            // Optional ack id precedes the envelope.
            let envelope = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            let values: Vec<Value> =
                serde_json::from_str(envelope).map_err(|e| malformed(text, e))?;
            let mut values = values.into_iter();
            let name = match values.next() {
                Some(Value::String(name)) => name,
                _ => return Err(malformed(text, "event name missing")),
            };
            Ok(Frame::Event {
                name,
                payload: values.next().unwrap_or(Value::Null),
            })
        }
        Some('4') => {
            let payload = if rest.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(rest).map_err(|e| malformed(text, e))?
            };
            Ok(Frame::ConnectError(payload))
        }
        _ => Err(malformed(text, "unsupported message packet")),
    }
}

/// Strip a `/namespace,` prefix.
fn skip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(at) => &body[at + 1..],
            None => "",
        }
    } else {
        body
    }
}

fn json_or_empty<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn malformed(packet: &str, reason: impl ToString) -> ChannelError {
    ChannelError::Decode {
        packet: packet.chars().take(64).collect(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open() {
        let frame = Frame::decode(
            r#"0{"sid":"abc123","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#,
        )
        .unwrap();

        match frame {
            Frame::Open(open) => {
                assert_eq!(open.sid, "abc123");
                assert_eq!(open.ping_interval, 25000);
                assert_eq!(open.ping_timeout, 5000);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_decode_event_with_namespace_and_ack() {
        let frame = Frame::decode(r#"42/agent,17["deploy",{"appId":"web"}]"#).unwrap();
        assert_eq!(
            frame,
            Frame::Event {
                name: "deploy".into(),
                payload: json!({"appId": "web"}),
            }
        );
    }

    #[test]
    fn test_event_without_payload_is_null() {
        let frame = Frame::decode(r#"42["resync"]"#).unwrap();
        assert_eq!(
            frame,
            Frame::Event {
                name: "resync".into(),
                payload: Value::Null,
            }
        );
    }

    #[test]
    fn test_connect_packets() {
        assert_eq!(Frame::decode("40").unwrap(), Frame::Connect);
        assert_eq!(Frame::decode(r#"40{"sid":"n1"}"#).unwrap(), Frame::Connect);
        assert_eq!(Frame::decode("41").unwrap(), Frame::Disconnect);
        assert_eq!(
            Frame::decode(r#"44{"message":"Not authorized"}"#).unwrap(),
            Frame::ConnectError(json!({"message": "Not authorized"}))
        );
    }

    #[test]
    fn test_encode_event() {
        let frame = Frame::event("appStatus", &json!({"state": "Ready"})).unwrap();
        assert_eq!(frame.encode(), r#"42["appStatus",{"state":"Ready"}]"#);
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_malformed_packets() {
        assert!(matches!(
            Frame::decode(""),
            Err(ChannelError::Decode { .. })
        ));
        assert!(Frame::decode("9").is_err());
        assert!(Frame::decode("42{not json").is_err());
        assert!(Frame::decode(r#"42[17,{}]"#).is_err());
        assert!(Frame::decode("0not-json").is_err());
    }
}
