//! Errors raised by the AI node.

use shared::{AllocError, BridgeError, Channel, DatagramError, DoId, SchemaError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
    /// A channel or zone range ran dry.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[from] AllocError),

    #[error("unknown object {0}")]
    UnknownObject(DoId),

    #[error("unknown field {0}")]
    UnknownField(u16),

    #[error("field {field} is not a field of object {do_id}")]
    FieldNotInClass { do_id: DoId, field: u16 },

    #[error("no constructor registered for class {0}")]
    UnknownType(u16),

    #[error("class {0} is not in the schema")]
    UnknownClass(String),

    #[error("class {class} requires field {field}")]
    MissingRequired { class: String, field: String },

    #[error("channel {sender} may not send field {field} to object {do_id}")]
    Unauthorized {
        sender: Channel,
        do_id: DoId,
        field: String,
    },

    /// A reply was requested outside of datagram handling.
    #[error("no current sender to reply to")]
    NoSender,

    #[error(transparent)]
    Datagram(#[from] DatagramError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
