//! Transport configuration of the built-in bindings
//!
//! Every field has a default, so a partial JSON document is enough:
//!
//! ```
//! use wot_binding::config::BindingConfig;
//!
//! let config = BindingConfig::from_json(r#"{ "coap": { "maxRetransmit": 2 } }"#).unwrap();
//! assert_eq!(config.coap.max_retransmit, 2);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BindingConfig {
    pub http: HttpConfig,
    pub coap: CoapConfig,
}

impl BindingConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpConfig {
    /// Whole-request timeout, `None` waits forever
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub timeout: Option<Duration>,

    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

/// RFC 7252 transmission parameters
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoapConfig {
    /// Initial wait for an acknowledgement, doubled at each retransmission
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ack_timeout: Duration,

    pub max_retransmit: u32,

    /// How long a response to an acknowledged request may take to arrive
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub exchange_lifetime: Duration,

    /// Granularity at which observe receivers check for cancellation
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for CoapConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            max_retransmit: 4,
            exchange_lifetime: Duration::from_secs(247),
            poll_interval: Duration::from_millis(100),
        }
    }
}
