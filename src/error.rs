//! Error type shared by bindings, operations and the registry

use crate::{schema::Datatype, thing::FormOperation};

/// Errors raised while binding forms and driving operations.
///
/// Application level failures (HTTP 4xx/5xx, CoAP 4.xx/5.xx) are not errors: they are
/// delivered as [`Response`](crate::response::Response) values with an error status.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No registered binding handles the URI scheme of the form
    #[error("No protocol binding registered for scheme \"{scheme}\"")]
    BindingNotFound { scheme: String },

    /// The form cannot be used for the requested interaction
    #[error("Invalid form: {0}")]
    InvalidForm(String),

    /// Neither the form nor the binding defines a method for the operation
    #[error("No method name found for operation type {operation}")]
    UnresolvedMethod { operation: FormOperation },

    /// The payload datatype is not accepted by the schema
    #[error("Payload type mismatch: got {actual}, schema expects {expected}")]
    PayloadTypeMismatch { actual: Datatype, expected: Datatype },

    /// The payload kind has no protocol encoder
    #[error("Unsupported payload type {0}")]
    UnsupportedPayloadType(Datatype),

    /// The payload has the right type but violates a schema constraint
    #[error("Payload does not satisfy the schema: {0}")]
    InvalidPayload(String),

    /// A blocking wait ended without a response
    #[error("No response received")]
    NoResponse,

    #[error("Missing value for URI variable \"{0}\"")]
    MissingUriVariable(String),

    #[error("Value of URI variable \"{name}\" is not a valid {expected}")]
    InvalidUriVariableType { name: String, expected: Datatype },

    #[error("Invalid URI \"{uri}\": {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CoAP message error: {0}")]
    Coap(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<coap_lite::error::MessageError> for Error {
    fn from(err: coap_lite::error::MessageError) -> Self {
        Self::Coap(err.to_string())
    }
}
