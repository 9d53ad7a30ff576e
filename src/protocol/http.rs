//! HTTP Binding Template
//!
//! Requests run on a dedicated thread with a blocking [reqwest] client, so
//! [Operation::send_request] returns as soon as the request is handed over.

use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{Arc, OnceLock},
    thread,
};

use reqwest::{
    blocking::Client,
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, LINK, LOCATION},
    StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    binding::{resolve_method, ProtocolBinding},
    config::HttpConfig,
    error::{Error, Result},
    operation::{set_payload, Operation, OperationCore, PayloadEncoder},
    payload::PayloadValue,
    response::{Response, ResponseStatus},
    schema::Schema,
    thing::{Form, FormOperation, Link},
};

pub const SCHEMES: &[&str] = &["http", "https"];

/// HTTP request method
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
        }
    }

    /// Default method of the HTTP binding template for `op`
    pub fn default_for(op: FormOperation) -> Option<Self> {
        use FormOperation::*;

        match op {
            ReadProperty | ReadAllProperties | ReadMultipleProperties | QueryAction
            | QueryAllActions => Some(Self::Get),
            WriteProperty | WriteAllProperties | WriteMultipleProperties => Some(Self::Put),
            InvokeAction => Some(Self::Post),
            CancelAction => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol binding
#[derive(Debug, Default)]
pub struct HttpBinding {
    config: HttpConfig,
    client: OnceLock<Client>,
}

impl HttpBinding {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            client: OnceLock::new(),
        }
    }

    // The client is shared by every operation and built on first use
    fn client(&self) -> Result<Client> {
        if let Some(client) = self.client.get() {
            return Ok(client.clone());
        }

        let client = Client::builder()
            .user_agent(self.config.user_agent.as_str())
            .timeout(self.config.timeout)
            .build()?;

        Ok(self.client.get_or_init(|| client).clone())
    }
}

impl ProtocolBinding for HttpBinding {
    fn protocol(&self) -> &str {
        "HTTP"
    }

    fn supported_schemes(&self) -> &[&str] {
        SCHEMES
    }

    fn default_method(&self, op: FormOperation) -> Option<&'static str> {
        Method::default_for(op).map(|method| method.as_str())
    }

    fn default_subprotocol(&self, _op: FormOperation) -> Option<&'static str> {
        None
    }

    fn bind(&self, form: &Form, op: FormOperation) -> Result<Box<dyn Operation>> {
        let method = resolve_method(self, form, op)?;
        Ok(Box::new(HttpOperation::new(form, op, &method, self.client()?)?))
    }
}

/// An interaction carried by a single HTTP request
pub struct HttpOperation {
    form: Form,
    op: FormOperation,
    method: reqwest::Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    client: Client,
    core: Arc<OperationCore>,
}

impl fmt::Debug for HttpOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpOperation")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("op", &self.op)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .finish()
    }
}

impl HttpOperation {
    pub fn new(form: &Form, op: FormOperation, method: &str, client: Client) -> Result<Self> {
        let method = reqwest::Method::from_str(&method.to_ascii_uppercase())
            .map_err(|_| Error::InvalidForm(format!("invalid HTTP method \"{method}\"")))?;
        let url = Url::parse(&form.href).map_err(|err| Error::InvalidUri {
            uri: form.href.clone(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            form: form.clone(),
            op,
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            client,
            core: Arc::new(OperationCore::new()),
        })
    }

    /// Add a request header, kept across sends
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::InvalidForm(format!("invalid header name \"{name}\"")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::InvalidForm(format!("invalid value for header {name}")))?;

        self.headers.append(name, value);
        Ok(())
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    fn set_body(&mut self, body: Vec<u8>) -> Result<()> {
        let content_type = HeaderValue::from_str(self.form.content_type()).map_err(|_| {
            Error::InvalidForm(format!(
                "invalid content type \"{}\"",
                self.form.content_type()
            ))
        })?;

        self.headers.insert(CONTENT_TYPE, content_type);
        self.body = Some(body);
        Ok(())
    }
}

impl PayloadEncoder for HttpOperation {
    fn set_object_payload(&mut self, value: &BTreeMap<String, PayloadValue>) -> Result<()> {
        self.set_body(serde_json::to_vec(value)?)
    }

    fn set_array_payload(&mut self, value: &[PayloadValue]) -> Result<()> {
        self.set_body(serde_json::to_vec(value)?)
    }

    fn set_string_payload(&mut self, value: &str) -> Result<()> {
        self.set_body(value.as_bytes().to_vec())
    }

    fn set_boolean_payload(&mut self, value: bool) -> Result<()> {
        self.set_body(value.to_string().into_bytes())
    }

    fn set_integer_payload(&mut self, value: i64) -> Result<()> {
        self.set_body(value.to_string().into_bytes())
    }

    fn set_number_payload(&mut self, value: f64) -> Result<()> {
        self.set_body(value.to_string().into_bytes())
    }
}

impl Operation for HttpOperation {
    fn form(&self) -> &Form {
        &self.form
    }

    fn operation_type(&self) -> FormOperation {
        self.op
    }

    fn method(&self) -> &str {
        self.method.as_str()
    }

    fn set_payload(&mut self, schema: &dyn Schema, value: PayloadValue) -> Result<()> {
        set_payload(self, schema, value)
    }

    fn send_request(&self) -> Result<()> {
        let mut builder = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        let request = builder.build()?;

        let client = self.client.clone();
        let core = Arc::clone(&self.core);
        let op = self.op;

        debug!(method = %self.method, url = %self.url, %op, "sending HTTP request");
        self.core.mark_sent();
        thread::Builder::new()
            .name("wot-http".into())
            .spawn(move || match client.execute(request).and_then(|r| to_response(r, op)) {
                Ok(response) => core.on_response(response),
                Err(err) => {
                    warn!(error = %err, "HTTP request failed");
                    core.on_error();
                }
            })?;

        Ok(())
    }

    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn to_response(response: reqwest::blocking::Response, op: FormOperation) -> reqwest::Result<Response> {
    let status = response.status();
    let headers = response.headers();

    let mut links = Vec::new();
    if status == StatusCode::CREATED {
        if let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
            links.push(Link::new(location, None));
        }
    }
    for value in headers.get_all(LINK) {
        if let Ok(value) = value.to_str() {
            links.extend(parse_link_header(value));
        }
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let body = response.bytes()?;

    let mut out = Response::new(
        ResponseStatus::from_class(status.as_u16() / 100),
        status.as_str(),
        op,
    )
    .with_links(links);
    if let Some(content_type) = content_type {
        out = out.with_content_type(content_type);
    }
    if !body.is_empty() {
        out = out.with_payload(body.to_vec());
    }

    Ok(out)
}

/// Parse the `<target>; rel="relation"` entries of a `Link` header, skipping malformed ones
pub fn parse_link_header(header: &str) -> Vec<Link> {
    split_link_values(header)
        .into_iter()
        .filter_map(parse_link_value)
        .collect()
}

fn split_link_values(header: &str) -> Vec<&str> {
    let mut values = Vec::new();
    let mut start = 0;
    let mut in_target = false;
    let mut in_quotes = false;

    for (i, c) in header.char_indices() {
        match c {
            '<' if !in_quotes => in_target = true,
            '>' if !in_quotes => in_target = false,
            '"' if !in_target => in_quotes = !in_quotes,
            ',' if !in_target && !in_quotes => {
                values.push(&header[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    values.push(&header[start..]);

    values
}

fn parse_link_value(value: &str) -> Option<Link> {
    let (target, params) = value.trim().strip_prefix('<')?.split_once('>')?;
    let target = target.trim();
    if target.is_empty() {
        return None;
    }

    let params = params.trim_start().strip_prefix(';')?;
    let rel = params.split(';').find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("rel")
            .then(|| value.trim().trim_matches('"').to_owned())
    })?;

    (!rel.is_empty()).then(|| Link::new(target, Some(rel)))
}
