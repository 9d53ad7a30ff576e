//! Binding Templates protocol implementations
//!
//! Application layer [protocol specific templates](https://w3c.github.io/wot-binding-templates)
//! map the operation types of a form to concrete protocol requests.

pub mod coap;
pub mod http;
