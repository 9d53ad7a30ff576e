//! Protocol-agnostic interaction results

use std::fmt;

use time::OffsetDateTime;

use crate::{
    error::Result,
    payload::PayloadValue,
    schema::Schema,
    thing::{FormOperation, Link},
};

/// Outcome class of a response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Ok,
    /// The request was rejected by the Thing (HTTP 4xx, CoAP 4.xx)
    ConsumerError,
    /// The Thing failed to serve the request (HTTP 5xx, CoAP 5.xx)
    ThingError,
    UnknownError,
}

impl ResponseStatus {
    /// Classify by response code class: 2 success, 4 client error, 5 server error
    pub fn from_class(class: u16) -> Self {
        match class {
            2 => Self::Ok,
            4 => Self::ConsumerError,
            5 => Self::ThingError,
            _ => Self::UnknownError,
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::ConsumerError => "CONSUMER_ERROR",
            Self::ThingError => "THING_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        };

        f.write_str(s)
    }
}

/// Immutable snapshot of a response
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    status: ResponseStatus,
    code: String,
    operation: FormOperation,
    content_type: Option<String>,
    payload: Option<Vec<u8>>,
    links: Vec<Link>,
    received_at: OffsetDateTime,
}

impl Response {
    pub fn new(status: ResponseStatus, code: impl Into<String>, operation: FormOperation) -> Self {
        Self {
            status,
            code: code.into(),
            operation,
            content_type: None,
            payload: None,
            links: Vec::new(),
            received_at: OffsetDateTime::now_utc(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_links(mut self, links: Vec<Link>) -> Self {
        self.links = links;
        self
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// The raw protocol code, `"404"` for HTTP or `"4.04"` for CoAP
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The operation type of the request that produced this response
    pub fn operation(&self) -> FormOperation {
        self.operation
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// The payload as text, lossily decoded
    pub fn payload_text(&self) -> Option<String> {
        self.payload
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Decode a JSON payload as a value of `schema`
    ///
    /// An empty or missing payload reads as `null`.
    pub fn payload_value(&self, schema: &dyn Schema) -> Result<PayloadValue> {
        let json = match self.payload.as_deref() {
            None | Some([]) => serde_json::Value::Null,
            Some(bytes) => serde_json::from_slice(bytes)?,
        };

        schema.parse_json(&json)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn received_at(&self) -> OffsetDateTime {
        self.received_at
    }
}
