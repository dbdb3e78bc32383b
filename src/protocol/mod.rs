//! Protocol message set and body encodings.
//!
//! ```text
//! Message ──to_tree()──► serde_json::Value ──Encoding::encode──► bytes
//! bytes ──Encoding::decode──► serde_json::Value ──from_tree()──► Message
//!                                   │
//!                                   └── FieldReader records Violations
//! ```

pub mod encoding;
pub mod message;
pub mod schema;

pub use encoding::{CborEncoding, Encoding, EncodingKind, JsonEncoding};
pub use message::{message_type, ClientMessage, Message, ServiceMessage};
pub use schema::{Requirement, SchemaViolation, Violation};
