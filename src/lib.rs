//! Web of Things protocol bindings
//!
//! Execute the interactions described by a
//! [Thing Description](https://www.w3.org/TR/wot-thing-description/) form over the
//! protocol its target URI names:
//! > A Thing Description describes the metadata and interfaces of Things,
//! > where a Thing is an abstraction of a physical or virtual entity that
//! > provides interactions to and participates in the Web of Things.
//!
//! A [Registry] picks the [binding](binding::ProtocolBinding) matching the form's URI scheme
//! and turns the form into an [Operation](operation::Operation). Payloads are validated
//! against a [DataSchema](schema::DataSchema) before being encoded, responses come back
//! either through a blocking wait or through registered callbacks.
//!
//! ```no_run
//! use wot_binding::{
//!     schema::DataSchema,
//!     thing::{Form, FormOperation},
//!     Registry,
//! };
//!
//! let registry = Registry::default();
//! let form = Form::new("coap://lamp.local/properties/brightness");
//!
//! let mut operation = registry.bind(&form, FormOperation::WriteProperty)?;
//! operation.set_payload(&DataSchema::integer(), 50.into())?;
//! operation.send_request()?;
//!
//! let response = operation.response()?;
//! assert!(response.is_ok());
//! # Ok::<(), wot_binding::Error>(())
//! ```
//!
//! The crate logs through [tracing](https://docs.rs/tracing) and installs no subscriber.

pub mod binding;
pub mod config;
pub mod error;
pub mod operation;
pub mod payload;
pub mod protocol;
pub mod response;
pub mod schema;
pub mod thing;
pub mod uri_template;

pub use binding::Registry;
pub use error::{Error, Result};
pub use operation::Operation;
pub use payload::PayloadValue;
pub use response::Response;
