//! CoAP Binding Template
//!
//! Each send opens its own UDP endpoint driven by a receive thread. Observe and subscribe
//! operations keep that thread alive as a [CoapObserveRelation] and deliver every
//! notification through the operation callbacks.

use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use coap_lite::{
    CoapOption, ContentFormat, MessageClass, MessageType, ObserveOption, Packet, RequestType,
    ResponseType,
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    binding::{resolve_method, resolve_subprotocol, ProtocolBinding},
    config::CoapConfig,
    error::{Error, Result},
    operation::{lock, set_payload, Operation, OperationCore, PayloadEncoder},
    payload::PayloadValue,
    response::{Response, ResponseStatus},
    schema::Schema,
    thing::{Form, FormOperation, Link},
};

mod client;
pub mod observe;

use client::CoapClient;
pub use observe::CoapObserveRelation;

pub const SCHEMES: &[&str] = &["coap"];

pub const DEFAULT_PORT: u16 = 5683;

pub const SUBPROTOCOL_OBSERVE: &str = "cov:observe";

/// Media types with a registered CoAP Content-Format
const MEDIA_TYPES: &[(&str, ContentFormat)] = &[
    ("text/plain", ContentFormat::TextPlain),
    ("application/link-format", ContentFormat::ApplicationLinkFormat),
    ("application/xml", ContentFormat::ApplicationXML),
    ("application/octet-stream", ContentFormat::ApplicationOctetStream),
    ("application/exi", ContentFormat::ApplicationEXI),
    ("application/json", ContentFormat::ApplicationJSON),
    ("application/cbor", ContentFormat::ApplicationCBOR),
    ("application/senml+json", ContentFormat::ApplicationSenmlJSON),
];

const LOCATION_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?');

/// CoAP request method
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Fetch,
    Patch,
    #[serde(rename = "iPATCH")]
    Ipatch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
            Self::Fetch => "FETCH",
            Self::Patch => "PATCH",
            Self::Ipatch => "iPATCH",
        }
    }

    /// Case-insensitive lookup by name
    pub fn from_name(name: &str) -> Option<Self> {
        [
            Self::Get,
            Self::Put,
            Self::Post,
            Self::Delete,
            Self::Fetch,
            Self::Patch,
            Self::Ipatch,
        ]
        .into_iter()
        .find(|method| method.as_str().eq_ignore_ascii_case(name))
    }

    /// Default method of the CoAP binding template for `op`
    pub fn default_for(op: FormOperation) -> Option<Self> {
        use FormOperation::*;

        match op {
            ReadProperty | ReadAllProperties | ReadMultipleProperties | ObserveProperty
            | UnobserveProperty | SubscribeEvent | UnsubscribeEvent => Some(Self::Get),
            WriteProperty | WriteAllProperties | WriteMultipleProperties => Some(Self::Put),
            InvokeAction => Some(Self::Post),
            _ => None,
        }
    }

    fn request_type(self) -> RequestType {
        match self {
            Self::Get => RequestType::Get,
            Self::Put => RequestType::Put,
            Self::Post => RequestType::Post,
            Self::Delete => RequestType::Delete,
            Self::Fetch => RequestType::Fetch,
            Self::Patch => RequestType::Patch,
            Self::Ipatch => RequestType::IPatch,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CoAP protocol binding
#[derive(Debug, Default)]
pub struct CoapBinding {
    config: CoapConfig,
}

impl CoapBinding {
    pub fn new(config: CoapConfig) -> Self {
        Self { config }
    }
}

impl ProtocolBinding for CoapBinding {
    fn protocol(&self) -> &str {
        "CoAP"
    }

    fn supported_schemes(&self) -> &[&str] {
        SCHEMES
    }

    fn default_method(&self, op: FormOperation) -> Option<&'static str> {
        Method::default_for(op).map(|method| method.as_str())
    }

    fn default_subprotocol(&self, op: FormOperation) -> Option<&'static str> {
        use FormOperation::*;

        matches!(
            op,
            ObserveProperty | UnobserveProperty | SubscribeEvent | UnsubscribeEvent
        )
        .then_some(SUBPROTOCOL_OBSERVE)
    }

    fn bind(&self, form: &Form, op: FormOperation) -> Result<Box<dyn Operation>> {
        let method = resolve_method(self, form, op)?;
        let subprotocol = resolve_subprotocol(self, form, op);

        Ok(Box::new(CoapOperation::new(
            form,
            op,
            &method,
            subprotocol.as_deref(),
            self.config.clone(),
        )?))
    }
}

/// The Observe option value sent for `op`, if any
fn observe_value(op: FormOperation, subprotocol: Option<&str>) -> Option<u32> {
    use FormOperation::*;

    let observe = subprotocol.map_or(false, |subprotocol| {
        subprotocol.eq_ignore_ascii_case(SUBPROTOCOL_OBSERVE)
            || subprotocol.eq_ignore_ascii_case("observe")
    });
    if !observe {
        return None;
    }

    match op {
        ObserveProperty | SubscribeEvent => Some(ObserveOption::Register as u32),
        UnobserveProperty | UnsubscribeEvent => Some(ObserveOption::Deregister as u32),
        _ => None,
    }
}

#[derive(Debug)]
struct ClientHandle {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    relation: Option<CoapObserveRelation>,
}

/// An interaction carried over CoAP
pub struct CoapOperation {
    form: Form,
    op: FormOperation,
    method: Method,
    host: String,
    port: u16,
    path: Vec<String>,
    query: Vec<String>,
    observe: Option<u32>,
    body: Option<Vec<u8>>,
    config: CoapConfig,
    core: Arc<OperationCore>,
    clients: Mutex<Vec<ClientHandle>>,
    relation: Mutex<Option<CoapObserveRelation>>,
}

impl fmt::Debug for CoapOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoapOperation")
            .field("method", &self.method)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("op", &self.op)
            .field("observe", &self.observe)
            .finish_non_exhaustive()
    }
}

impl CoapOperation {
    pub fn new(
        form: &Form,
        op: FormOperation,
        method: &str,
        subprotocol: Option<&str>,
        config: CoapConfig,
    ) -> Result<Self> {
        let method = Method::from_name(method)
            .ok_or_else(|| Error::InvalidForm(format!("invalid CoAP method \"{method}\"")))?;

        let invalid = |reason: String| Error::InvalidUri {
            uri: form.href.clone(),
            reason,
        };
        let url = Url::parse(&form.href).map_err(|err| invalid(err.to_string()))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();

        let path = url
            .path_segments()
            .into_iter()
            .flatten()
            .filter(|segment| !segment.is_empty())
            .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
            .collect();
        let query = url
            .query()
            .into_iter()
            .flat_map(|query| query.split('&'))
            .filter(|param| !param.is_empty())
            .map(|param| percent_decode_str(param).decode_utf8_lossy().into_owned())
            .collect();

        Ok(Self {
            form: form.clone(),
            op,
            method,
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            path,
            query,
            observe: observe_value(op, subprotocol),
            body: None,
            config,
            core: Arc::new(OperationCore::new()),
            clients: Mutex::new(Vec::new()),
            relation: Mutex::new(None),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The request sent by [Operation::send_request], minus token and message id
    pub fn request_packet(&self) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(self.method.request_type());

        if let Some(observe) = self.observe {
            packet.set_observe_value(observe);
        }
        for segment in &self.path {
            packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        for param in &self.query {
            packet.add_option(CoapOption::UriQuery, param.as_bytes().to_vec());
        }

        if let Some(body) = &self.body {
            match content_format(self.form.content_type()) {
                Some(format) => packet.set_content_format(format),
                None => debug!(
                    content_type = self.form.content_type(),
                    "no CoAP content format for media type"
                ),
            }
            packet.payload = body.clone();
        }

        packet
    }

    /// The relation established by the last observe or subscribe send
    pub fn observe_relation(&self) -> Option<CoapObserveRelation> {
        lock(&self.relation).clone()
    }

    /// Number of transport clients still running
    pub fn active_clients(&self) -> usize {
        lock(&self.clients)
            .iter()
            .filter(|client| !client.thread.is_finished())
            .count()
    }

    /// Stop every transport client started by this operation and wait for them
    pub fn shutdown_executors(&self) {
        let clients: Vec<_> = lock(&self.clients).drain(..).collect();
        if clients.is_empty() {
            return;
        }

        debug!(count = clients.len(), "shutting down CoAP clients");
        for client in &clients {
            client.shutdown.store(true, Ordering::SeqCst);
            if let Some(relation) = &client.relation {
                relation.mark_canceled();
            }
        }

        let current = thread::current().id();
        for client in clients {
            if client.thread.thread().id() == current {
                continue;
            }
            if client.thread.join().is_err() {
                warn!("CoAP client thread panicked");
            }
        }
    }
}

impl Drop for CoapOperation {
    fn drop(&mut self) {
        self.shutdown_executors();
    }
}

impl PayloadEncoder for CoapOperation {
    fn set_object_payload(&mut self, value: &BTreeMap<String, PayloadValue>) -> Result<()> {
        self.body = Some(serde_json::to_vec(value)?);
        Ok(())
    }

    fn set_array_payload(&mut self, value: &[PayloadValue]) -> Result<()> {
        self.body = Some(serde_json::to_vec(value)?);
        Ok(())
    }

    fn set_string_payload(&mut self, value: &str) -> Result<()> {
        self.body = Some(value.as_bytes().to_vec());
        Ok(())
    }

    fn set_boolean_payload(&mut self, value: bool) -> Result<()> {
        self.body = Some(value.to_string().into_bytes());
        Ok(())
    }

    fn set_integer_payload(&mut self, value: i64) -> Result<()> {
        self.body = Some(value.to_string().into_bytes());
        Ok(())
    }

    fn set_number_payload(&mut self, value: f64) -> Result<()> {
        self.body = Some(value.to_string().into_bytes());
        Ok(())
    }
}

impl Operation for CoapOperation {
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
        let mut request = self.request_packet();
        request.set_token(rand::random::<[u8; 8]>().to_vec());

        let client = CoapClient::connect(&self.host, self.port, self.config.clone())?;
        let shutdown = client.shutdown_flag();
        let relation = (self.observe == Some(ObserveOption::Register as u32))
            .then(|| CoapObserveRelation::new(&request));
        if let Some(relation) = &relation {
            *lock(&self.relation) = Some(relation.clone());
        }

        let core = Arc::clone(&self.core);
        let op = self.op;

        debug!(
            method = %self.method,
            host = %self.host,
            port = self.port,
            %op,
            observe = ?self.observe,
            "sending CoAP request"
        );
        self.core.mark_sent();
        let thread = thread::Builder::new()
            .name("wot-coap".into())
            .spawn({
                let relation = relation.clone();
                move || match relation {
                    Some(relation) => observe::run(client, request, op, &core, &relation),
                    None => exchange_once(client, request, op, &core),
                }
            })?;

        let mut clients = lock(&self.clients);
        clients.retain(|client| !client.thread.is_finished());
        clients.push(ClientHandle {
            shutdown,
            thread,
            relation,
        });

        Ok(())
    }

    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn shutdown(&self) {
        self.shutdown_executors()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn exchange_once(
    mut client: CoapClient,
    mut request: Packet,
    op: FormOperation,
    core: &OperationCore,
) {
    match client.exchange(&mut request) {
        Ok(Some(packet)) => core.on_response(to_response(&packet, op)),
        Ok(None) => debug!("CoAP exchange abandoned on shutdown"),
        Err(err) => {
            warn!(error = %err, "CoAP exchange failed");
            core.on_error();
        }
    }
}

fn code_class(packet: &Packet) -> u8 {
    u8::from(packet.header.code) >> 5
}

pub(crate) fn is_success(packet: &Packet) -> bool {
    code_class(packet) == 2
}

/// `c.dd` rendering of the response code
fn code_string(packet: &Packet) -> String {
    let code = u8::from(packet.header.code);
    format!("{}.{:02}", code >> 5, code & 0x1f)
}

pub(crate) fn to_response(packet: &Packet, op: FormOperation) -> Response {
    let mut response = Response::new(
        ResponseStatus::from_class(code_class(packet).into()),
        code_string(packet),
        op,
    );

    if let Some(content_type) = packet.get_content_format().and_then(media_type) {
        response = response.with_content_type(content_type);
    }

    if let MessageClass::Response(ResponseType::Created) = packet.header.code {
        if let Some(location) = location(packet) {
            response = response.with_links(vec![Link::new(location, None)]);
        }
    }

    if !packet.payload.is_empty() {
        response = response.with_payload(packet.payload.clone());
    }

    response
}

fn location(packet: &Packet) -> Option<String> {
    let path = packet.get_option(CoapOption::LocationPath);
    let query = packet.get_option(CoapOption::LocationQuery);
    if path.is_none() && query.is_none() {
        return None;
    }

    let mut href = String::new();
    for segment in path.into_iter().flatten() {
        href.push('/');
        href.extend(utf8_percent_encode(
            &String::from_utf8_lossy(segment),
            LOCATION_SEGMENT,
        ));
    }
    if href.is_empty() {
        href.push('/');
    }

    let params: Vec<_> = query
        .into_iter()
        .flatten()
        .map(|param| String::from_utf8_lossy(param).into_owned())
        .collect();
    if !params.is_empty() {
        href.push('?');
        href.push_str(&params.join("&"));
    }

    Some(href)
}

/// Content-Format of a media type, parameters ignored
pub fn content_format(media_type: &str) -> Option<ContentFormat> {
    let essence = media_type.split(';').next().unwrap_or(media_type).trim();

    MEDIA_TYPES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(essence))
        .map(|&(_, format)| format)
}

pub fn media_type(content_format: ContentFormat) -> Option<&'static str> {
    MEDIA_TYPES
        .iter()
        .find(|&&(_, format)| format == content_format)
        .map(|&(name, _)| name)
}

/// Sequence number carried by the Observe option
pub(crate) fn observe_sequence(packet: &Packet) -> Option<u32> {
    packet.get_observe_value().and_then(std::result::Result::ok)
}
