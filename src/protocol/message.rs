//! Protocol message set.
//!
//! Every frame body is a map `{id, type, body}`:
//!
//! ```text
//! { "id": <u64>, "type": <tag>, "body": <payload map, absent for exit/heartbeat> }
//! ```
//!
//! Messages are direction-scoped. Clients send [`ClientMessage`]s and
//! services send [`ServiceMessage`]s; a tag belonging to the other direction
//! is rejected as a violation of the `type` field.

use std::fmt;

use serde_json::{json, Map, Value};

use super::schema::{encode_bytes, FieldReader, Requirement, SchemaViolation, Violation};
use crate::compute::{Batch, ComputeError, Lambda, LogEntry};

/// Message type tags.
pub mod message_type {
    /// Processed batch (client → service).
    pub const CLIENT_BATCH: i64 = 1;
    /// Error report (client → service).
    pub const CLIENT_ERROR: i64 = 2;
    /// Exit handshake (client → service).
    pub const CLIENT_EXIT: i64 = 3;
    /// Lambda log entry (client → service).
    pub const CLIENT_LOG_ENTRY: i64 = 4;
    /// Batch to process (service → client).
    pub const SERVICE_BATCH: i64 = 5;
    /// Exit handshake (service → client).
    pub const SERVICE_EXIT: i64 = 6;
    /// Lambda to register (service → client).
    pub const SERVICE_LAMBDA: i64 = 7;
    /// Keep-alive (client → service).
    pub const CLIENT_HEARTBEAT: i64 = 8;
    /// Keep-alive (service → client).
    pub const SERVICE_HEARTBEAT: i64 = 9;

    /// Tags a service accepts.
    pub const FROM_CLIENT: &[i64] = &[
        CLIENT_BATCH,
        CLIENT_ERROR,
        CLIENT_EXIT,
        CLIENT_LOG_ENTRY,
        CLIENT_HEARTBEAT,
    ];

    /// Tags a client accepts.
    pub const FROM_SERVICE: &[i64] = &[SERVICE_BATCH, SERVICE_EXIT, SERVICE_LAMBDA, SERVICE_HEARTBEAT];
}

/// A protocol message that can travel through a framing channel.
pub trait Message: Sized + Send + fmt::Debug + 'static {
    /// Per-connection message identifier.
    fn id(&self) -> u64;

    /// Numeric type tag.
    fn tag(&self) -> i64;

    /// Build the value tree sent on the wire.
    fn to_tree(&self) -> Value;

    /// Dispatch a decoded value tree to the matching variant.
    fn from_tree(tree: &Value) -> Result<Self, SchemaViolation>;
}

/// Messages sent by compute clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// A processed batch.
    Batch {
        /// Message id.
        id: u64,
        /// Resulting batch.
        batch: Batch,
    },
    /// An error raised while registering a lambda or processing a batch.
    Error {
        /// Message id.
        id: u64,
        /// Reported error.
        error: ComputeError,
    },
    /// A line logged by a running lambda.
    LogEntry {
        /// Message id.
        id: u64,
        /// Logged entry.
        entry: LogEntry,
    },
    /// The client is closing the connection.
    Exit {
        /// Message id.
        id: u64,
    },
    /// Keep-alive.
    Heartbeat {
        /// Message id.
        id: u64,
    },
}

/// Messages sent by compute services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMessage {
    /// A batch the client should process.
    Batch {
        /// Message id.
        id: u64,
        /// Batch to process.
        batch: Batch,
    },
    /// A lambda the client should register.
    Lambda {
        /// Message id.
        id: u64,
        /// Lambda to register.
        lambda: Lambda,
    },
    /// The service is closing the connection.
    Exit {
        /// Message id.
        id: u64,
    },
    /// Keep-alive.
    Heartbeat {
        /// Message id.
        id: u64,
    },
}

impl Message for ClientMessage {
    fn id(&self) -> u64 {
        match self {
            ClientMessage::Batch { id, .. }
            | ClientMessage::Error { id, .. }
            | ClientMessage::LogEntry { id, .. }
            | ClientMessage::Exit { id }
            | ClientMessage::Heartbeat { id } => *id,
        }
    }

    fn tag(&self) -> i64 {
        match self {
            ClientMessage::Batch { .. } => message_type::CLIENT_BATCH,
            ClientMessage::Error { .. } => message_type::CLIENT_ERROR,
            ClientMessage::LogEntry { .. } => message_type::CLIENT_LOG_ENTRY,
            ClientMessage::Exit { .. } => message_type::CLIENT_EXIT,
            ClientMessage::Heartbeat { .. } => message_type::CLIENT_HEARTBEAT,
        }
    }

    fn to_tree(&self) -> Value {
        let body = match self {
            ClientMessage::Batch { batch, .. } => Some(batch.to_tree()),
            ClientMessage::Error { error, .. } => Some(error.to_tree()),
            ClientMessage::LogEntry { entry, .. } => Some(entry.to_tree()),
            ClientMessage::Exit { .. } | ClientMessage::Heartbeat { .. } => None,
        };
        envelope(self.id(), self.tag(), body)
    }

    fn from_tree(tree: &Value) -> Result<Self, SchemaViolation> {
        let (id, tag, body) = open(tree, message_type::FROM_CLIENT)?;
        match tag {
            message_type::CLIENT_BATCH => Ok(ClientMessage::Batch {
                id,
                batch: read_body(body)?,
            }),
            message_type::CLIENT_ERROR => Ok(ClientMessage::Error {
                id,
                error: read_body(body)?,
            }),
            message_type::CLIENT_LOG_ENTRY => Ok(ClientMessage::LogEntry {
                id,
                entry: read_body(body)?,
            }),
            message_type::CLIENT_EXIT => Ok(ClientMessage::Exit { id }),
            message_type::CLIENT_HEARTBEAT => Ok(ClientMessage::Heartbeat { id }),
            _ => Err(bad_tag(message_type::FROM_CLIENT)),
        }
    }
}

impl Message for ServiceMessage {
    fn id(&self) -> u64 {
        match self {
            ServiceMessage::Batch { id, .. }
            | ServiceMessage::Lambda { id, .. }
            | ServiceMessage::Exit { id }
            | ServiceMessage::Heartbeat { id } => *id,
        }
    }

    fn tag(&self) -> i64 {
        match self {
            ServiceMessage::Batch { .. } => message_type::SERVICE_BATCH,
            ServiceMessage::Lambda { .. } => message_type::SERVICE_LAMBDA,
            ServiceMessage::Exit { .. } => message_type::SERVICE_EXIT,
            ServiceMessage::Heartbeat { .. } => message_type::SERVICE_HEARTBEAT,
        }
    }

    fn to_tree(&self) -> Value {
        let body = match self {
            ServiceMessage::Batch { batch, .. } => Some(batch.to_tree()),
            ServiceMessage::Lambda { lambda, .. } => Some(lambda.to_tree()),
            ServiceMessage::Exit { .. } | ServiceMessage::Heartbeat { .. } => None,
        };
        envelope(self.id(), self.tag(), body)
    }

    fn from_tree(tree: &Value) -> Result<Self, SchemaViolation> {
        let (id, tag, body) = open(tree, message_type::FROM_SERVICE)?;
        match tag {
            message_type::SERVICE_BATCH => Ok(ServiceMessage::Batch {
                id,
                batch: read_body(body)?,
            }),
            message_type::SERVICE_LAMBDA => Ok(ServiceMessage::Lambda {
                id,
                lambda: read_body(body)?,
            }),
            message_type::SERVICE_EXIT => Ok(ServiceMessage::Exit { id }),
            message_type::SERVICE_HEARTBEAT => Ok(ServiceMessage::Heartbeat { id }),
            _ => Err(bad_tag(message_type::FROM_SERVICE)),
        }
    }
}

// ─── Envelope ──────────────────────────────────────────────────────────────

fn envelope(id: u64, tag: i64, body: Option<Value>) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), json!(id));
    map.insert("type".to_string(), json!(tag));
    if let Some(body) = body {
        map.insert("body".to_string(), body);
    }
    Value::Object(map)
}

/// Validate the envelope, returning `(id, tag, body)`.
fn open<'a>(
    tree: &'a Value,
    allowed: &[i64],
) -> Result<(u64, i64, Option<&'a Value>), SchemaViolation> {
    let mut reader = FieldReader::new(tree, "");
    let id = reader
        .integer("id", 0, i64::MAX)
        .and_then(|id| u64::try_from(id).ok());
    let tag = reader.one_of("type", allowed);
    let body = reader.optional("body");
    let header = id.zip(tag);
    reader.finish_with(header).map(|(id, tag)| (id, tag, body))
}

fn bad_tag(allowed: &[i64]) -> SchemaViolation {
    SchemaViolation::new(vec![Violation::new(
        "type",
        Requirement::OneOf(allowed.to_vec()),
    )])
}

fn read_body<P: Payload>(body: Option<&Value>) -> Result<P, SchemaViolation> {
    let Some(body) = body else {
        return Err(SchemaViolation::new(vec![Violation::new(
            "body",
            Requirement::Present,
        )]));
    };
    let mut reader = FieldReader::new(body, "body");
    let payload = P::read(&mut reader);
    reader.finish_with(payload)
}

// ─── Payloads ──────────────────────────────────────────────────────────────

/// A message body with a fixed map layout.
trait Payload: Sized {
    fn to_tree(&self) -> Value;

    /// Read every field before combining, so all violations get recorded.
    fn read(reader: &mut FieldReader<'_>) -> Option<Self>;
}

impl Payload for Lambda {
    fn to_tree(&self) -> Value {
        json!({ "lid": self.lambda_id, "lua": self.program })
    }

    fn read(reader: &mut FieldReader<'_>) -> Option<Self> {
        let lambda_id = reader.int32("lid");
        let program = reader.text("lua");
        Some(Lambda {
            lambda_id: lambda_id?,
            program: program?,
        })
    }
}

impl Payload for Batch {
    fn to_tree(&self) -> Value {
        json!({ "lid": self.lambda_id, "bid": self.batch_id, "dat": encode_bytes(&self.data) })
    }

    fn read(reader: &mut FieldReader<'_>) -> Option<Self> {
        let lambda_id = reader.int32("lid");
        let batch_id = reader.int32("bid");
        let data = reader.bytes("dat");
        Some(Batch {
            lambda_id: lambda_id?,
            batch_id: batch_id?,
            data: data?,
        })
    }
}

impl Payload for ComputeError {
    fn to_tree(&self) -> Value {
        json!({ "cod": self.code, "msg": self.message })
    }

    fn read(reader: &mut FieldReader<'_>) -> Option<Self> {
        let code = reader.int32("cod");
        let message = reader.text("msg");
        Some(ComputeError {
            code: code?,
            message: message?,
        })
    }
}

impl Payload for LogEntry {
    fn to_tree(&self) -> Value {
        json!({
            "tim": self.timestamp.timestamp_millis(),
            "lid": self.lambda_id,
            "bid": self.batch_id,
            "msg": self.message,
        })
    }

    fn read(reader: &mut FieldReader<'_>) -> Option<Self> {
        let timestamp = reader.integer("tim", i64::MIN, i64::MAX).and_then(|millis| {
            let parsed = chrono::DateTime::from_timestamp_millis(millis);
            if parsed.is_none() {
                reader.reject(
                    "tim",
                    Requirement::Range {
                        min: chrono::DateTime::<chrono::Utc>::MIN_UTC.timestamp_millis(),
                        max: chrono::DateTime::<chrono::Utc>::MAX_UTC.timestamp_millis(),
                    },
                );
            }
            parsed
        });
        let lambda_id = reader.int32("lid");
        let batch_id = reader.int32("bid");
        let message = reader.text("msg");
        Some(LogEntry {
            timestamp: timestamp?,
            lambda_id: lambda_id?,
            batch_id: batch_id?,
            message: message?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::schema::ValueKind;

    #[test]
    fn test_client_messages_survive_tree_conversion() {
        let messages = vec![
            ClientMessage::Batch { id: 1, batch: Batch::new(1, 100, b"HELLO".to_vec()) },
            ClientMessage::Error { id: 2, error: ComputeError::new(12345, "bad") },
            ClientMessage::LogEntry { id: 3, entry: LogEntry::new(1, 100, "world!") },
            ClientMessage::Exit { id: 4 },
            ClientMessage::Heartbeat { id: 5 },
        ];
        for message in messages {
            let decoded = ClientMessage::from_tree(&message.to_tree()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_service_messages_survive_tree_conversion() {
        let messages = vec![
            ServiceMessage::Batch { id: 1, batch: Batch::new(1, 100, vec![0, 255, 7]) },
            ServiceMessage::Lambda { id: 2, lambda: Lambda::new(1, "return batch:upper()") },
            ServiceMessage::Exit { id: 3 },
            ServiceMessage::Heartbeat { id: 4 },
        ];
        for message in messages {
            let decoded = ServiceMessage::from_tree(&message.to_tree()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_exit_and_heartbeat_carry_no_body() {
        let tree = ClientMessage::Heartbeat { id: 9 }.to_tree();
        assert!(tree.get("body").is_none());
        assert_eq!(tree["type"], json!(message_type::CLIENT_HEARTBEAT));
    }

    #[test]
    fn test_wrong_direction_tag_is_type_violation() {
        let tree = ServiceMessage::Exit { id: 1 }.to_tree();
        let err = ClientMessage::from_tree(&tree).unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::new(
                "type",
                Requirement::OneOf(message_type::FROM_CLIENT.to_vec())
            )]
        );
    }

    #[test]
    fn test_missing_body_is_reported() {
        let tree = json!({"id": 1, "type": message_type::SERVICE_LAMBDA});
        let err = ServiceMessage::from_tree(&tree).unwrap_err();
        assert_eq!(err.violations, vec![Violation::new("body", Requirement::Present)]);
    }

    #[test]
    fn test_body_violations_carry_paths() {
        let tree = json!({
            "id": 1,
            "type": message_type::SERVICE_BATCH,
            "body": {"lid": "x", "dat": "aGk="}
        });
        let err = ServiceMessage::from_tree(&tree).unwrap_err();
        assert_eq!(
            err.violations,
            vec![
                Violation::new("body.lid", Requirement::Kind(ValueKind::Integer)),
                Violation::new("body.bid", Requirement::Present),
            ]
        );
    }

    #[test]
    fn test_negative_id_rejected() {
        let tree = json!({"id": -1, "type": message_type::CLIENT_EXIT});
        let err = ClientMessage::from_tree(&tree).unwrap_err();
        assert_eq!(err.violations[0].entity, "id");
    }
}
