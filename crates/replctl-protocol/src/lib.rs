//! replctl-protocol: wire envelope for the replication controller's
//! WebSocket sessions.
//!
//! Every frame is a single JSON value, a positional array rather than a
//! tagged object — the layout and field order are part of the wire
//! contract and must never change:
//!
//! ```text
//! [<typeId>, "<uniqueId>", "<action>", <payload>]                     // Open / Call / Notify
//! [<typeId>, "<uniqueId>", <payload>]                                 // CallResult
//! [<typeId>, "<uniqueId>", <errorCode>, "<errorMessage>", <payload>]  // CallError
//! ```
//!
//! `typeId`: 1=Open, 2=Close, 3=Call, 4=CallResult, 5=CallError, 6=Notify.

use serde::de::Error as DeError;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ---------------------------------------------------------------------------
// UniqueId
// ---------------------------------------------------------------------------

/// A 32-character lowercase hex correlation id, unique per peer-client.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueId(String);

impl UniqueId {
    /// Generate a fresh id from a random v4 UUID, rendered as 32 lowercase
    /// hex characters with the dashes stripped.
    pub fn generate() -> Self {
        UniqueId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UniqueId {
    fn from(s: String) -> Self {
        UniqueId(s)
    }
}

// ---------------------------------------------------------------------------
// Error codes (§6)
// ---------------------------------------------------------------------------

pub mod error_codes {
    pub const PROTOCOL_ERROR: i32 = 400;
    pub const UNAUTHORIZED: i32 = 401;
    pub const NOT_SUPPORTED: i32 = 404;
    pub const INTERNAL_ERROR: i32 = 500;
}

// ---------------------------------------------------------------------------
// Action names (§4.2)
// ---------------------------------------------------------------------------

pub mod actions {
    pub const AUTHORIZE: &str = "Authorize";
    pub const SUBSCRIBE: &str = "/observer/subscribe";
    pub const REPLICATION_APPLY: &str = "/replication/apply";
    pub const REPLICATION_LOG_MAX: &str = "/replication/log/max";
    pub const REPLICATION_RELAY_MAX: &str = "/replication/relay/max";
    pub const REPLICATION_RELAY_ADD: &str = "/replication/relay/add";
    pub const REPLICATION_LOG: &str = "/replication/log";
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One WebSocket frame, decoded to its semantic shape.
///
/// `Open`, `Close`, and `Notify` share the four-element layout with `Call`;
/// they are kept as distinct variants because their `typeId` differs and a
/// peer-client dispatches on the frame's role, not just its shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Open {
        unique_id: UniqueId,
        action: String,
        payload: Value,
    },
    Close {
        unique_id: UniqueId,
        action: String,
        payload: Value,
    },
    Call {
        unique_id: UniqueId,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: UniqueId,
        payload: Value,
    },
    CallError {
        unique_id: UniqueId,
        error_code: i32,
        error_message: String,
        payload: Value,
    },
    Notify {
        unique_id: UniqueId,
        action: String,
        payload: Value,
    },
}

impl Message {
    pub fn unique_id(&self) -> &UniqueId {
        match self {
            Message::Open { unique_id, .. }
            | Message::Close { unique_id, .. }
            | Message::Call { unique_id, .. }
            | Message::CallResult { unique_id, .. }
            | Message::CallError { unique_id, .. }
            | Message::Notify { unique_id, .. } => unique_id,
        }
    }

    fn type_id(&self) -> u8 {
        match self {
            Message::Open { .. } => 1,
            Message::Close { .. } => 2,
            Message::Call { .. } => 3,
            Message::CallResult { .. } => 4,
            Message::CallError { .. } => 5,
            Message::Notify { .. } => 6,
        }
    }

    /// Build a `Call` frame with a freshly generated `uniqueId`.
    pub fn call(action: impl Into<String>, payload: Value) -> Self {
        Message::Call {
            unique_id: UniqueId::generate(),
            action: action.into(),
            payload,
        }
    }

    /// Build an `Open` frame with a freshly generated `uniqueId`.
    pub fn open(action: impl Into<String>, payload: Value) -> Self {
        Message::Open {
            unique_id: UniqueId::generate(),
            action: action.into(),
            payload,
        }
    }

    /// Encode to the JSON text frame sent on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a JSON text frame received on the wire.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Message::Open {
                unique_id,
                action,
                payload,
            }
            | Message::Close {
                unique_id,
                action,
                payload,
            }
            | Message::Call {
                unique_id,
                action,
                payload,
            }
            | Message::Notify {
                unique_id,
                action,
                payload,
            } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element(&self.type_id())?;
                seq.serialize_element(unique_id)?;
                seq.serialize_element(action)?;
                seq.serialize_element(payload)?;
                seq.end()
            }
            Message::CallResult { unique_id, payload } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&self.type_id())?;
                seq.serialize_element(unique_id)?;
                seq.serialize_element(payload)?;
                seq.end()
            }
            Message::CallError {
                unique_id,
                error_code,
                error_message,
                payload,
            } => {
                let mut seq = serializer.serialize_seq(Some(5))?;
                seq.serialize_element(&self.type_id())?;
                seq.serialize_element(unique_id)?;
                seq.serialize_element(error_code)?;
                seq.serialize_element(error_message)?;
                seq.serialize_element(payload)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<Value>::deserialize(deserializer)?;
        decode_envelope(raw).map_err(D::Error::custom)
    }
}

fn decode_envelope(mut raw: Vec<Value>) -> Result<Message, String> {
    if raw.is_empty() {
        return Err("empty envelope".to_owned());
    }
    let type_id = raw[0]
        .as_u64()
        .ok_or_else(|| "envelope[0] (typeId) must be an integer".to_owned())?;

    let unique_id = |v: &Value| -> Result<UniqueId, String> {
        v.as_str()
            .map(|s| UniqueId(s.to_owned()))
            .ok_or_else(|| "envelope[1] (uniqueId) must be a string".to_owned())
    };

    match type_id {
        1 | 2 | 3 | 6 if raw.len() == 4 => {
            let payload = raw.pop().unwrap();
            let action = raw
                .pop()
                .unwrap()
                .as_str()
                .ok_or_else(|| "envelope[2] (action) must be a string".to_owned())?
                .to_owned();
            let uid = unique_id(&raw[1])?;
            match type_id {
                1 => Ok(Message::Open {
                    unique_id: uid,
                    action,
                    payload,
                }),
                2 => Ok(Message::Close {
                    unique_id: uid,
                    action,
                    payload,
                }),
                3 => Ok(Message::Call {
                    unique_id: uid,
                    action,
                    payload,
                }),
                6 => Ok(Message::Notify {
                    unique_id: uid,
                    action,
                    payload,
                }),
                _ => unreachable!(),
            }
        }
        4 if raw.len() == 3 => {
            let payload = raw.pop().unwrap();
            let uid = unique_id(&raw[1])?;
            Ok(Message::CallResult {
                unique_id: uid,
                payload,
            })
        }
        5 if raw.len() == 5 => {
            let payload = raw.pop().unwrap();
            let error_message = raw
                .pop()
                .unwrap()
                .as_str()
                .ok_or_else(|| "envelope[3] (errorMessage) must be a string".to_owned())?
                .to_owned();
            let error_code = raw[2]
                .as_i64()
                .ok_or_else(|| "envelope[2] (errorCode) must be an integer".to_owned())?
                as i32;
            let uid = unique_id(&raw[1])?;
            Ok(Message::CallError {
                unique_id: uid,
                error_code,
                error_message,
                payload,
            })
        }
        other => Err(format!(
            "unrecognized typeId {} or wrong element count {}",
            other,
            raw.len()
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_round_trips_through_json() {
        let msg = Message::Call {
            unique_id: UniqueId("abc123abc123abc123abc123abc12300".into()),
            action: actions::REPLICATION_LOG.to_owned(),
            payload: json!({"id": 5, "source": "nodeA", "reclimit": 1}),
        };
        let encoded = msg.to_json().unwrap();
        let decoded = Message::from_json(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn call_serializes_as_positional_array() {
        let msg = Message::call(actions::AUTHORIZE, json!({"secret": "k1"}));
        let value: Value = serde_json::to_value(&msg).unwrap();
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 4);
        assert_eq!(arr[0], json!(3));
        assert_eq!(arr[2], json!("Authorize"));
    }

    #[test]
    fn call_result_round_trips() {
        let msg = Message::CallResult {
            unique_id: UniqueId::generate(),
            payload: json!({"authorized": true}),
        };
        let encoded = msg.to_json().unwrap();
        let decoded = Message::from_json(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn call_error_round_trips_with_error_fields_in_position() {
        let msg = Message::CallError {
            unique_id: UniqueId::generate(),
            error_code: error_codes::UNAUTHORIZED,
            error_message: "session expired".to_owned(),
            payload: Value::Null,
        };
        let encoded = msg.to_json().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        let arr = value.as_array().unwrap();
        assert_eq!(arr[0], json!(5));
        assert_eq!(arr[2], json!(401));
        assert_eq!(arr[3], json!("session expired"));
        let decoded = Message::from_json(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn unique_id_is_32_lowercase_hex_chars() {
        let id = UniqueId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn decoding_empty_array_fails() {
        let err = Message::from_json("[]");
        assert!(err.is_err());
    }

    #[test]
    fn decoding_unknown_type_id_fails() {
        let err = Message::from_json(r#"[9, "x", "y", {}]"#);
        assert!(err.is_err());
    }
}
