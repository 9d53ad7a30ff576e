//! Protocol-agnostic operations
//!
//! An [Operation] is a single interaction bound to a concrete protocol. Results are
//! delivered two ways:
//!
//! - a one-slot mailbox polled by [Operation::response_timeout], which only ever holds the
//!   most recent response or error;
//! - registered [ResponseCallback]s, which see every response and error in arrival order.
//!
//! Protocol implementations embed an [OperationCore] for both and implement
//! [PayloadEncoder] to plug into the shared [set_payload] validation.

use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{
    error::{Error, Result},
    payload::PayloadValue,
    response::Response,
    schema::{Datatype, Schema},
    thing::{Form, FormOperation},
};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationState {
    Unsent,
    Sent,
    Responded,
    Errored,
}

/// Receiver of the results of an operation
pub trait ResponseCallback: Send + Sync {
    fn on_response(&self, response: &Response);

    /// Called on transport failures only
    fn on_error(&self);
}

/// A bound, executable interaction
pub trait Operation: Send + Sync + 'static {
    /// The form this operation was bound from, with URI variables already expanded
    fn form(&self) -> &Form;

    fn operation_type(&self) -> FormOperation;

    /// The resolved request method
    fn method(&self) -> &str;

    /// Validate `value` against `schema` and encode it as the request payload
    fn set_payload(&mut self, schema: &dyn Schema, value: PayloadValue) -> Result<()>;

    /// Start the request without waiting for its completion
    fn send_request(&self) -> Result<()>;

    fn core(&self) -> &OperationCore;

    /// Wait up to [DEFAULT_RESPONSE_TIMEOUT] for a response
    fn response(&self) -> Result<Response> {
        self.core().wait_response(DEFAULT_RESPONSE_TIMEOUT)
    }

    /// Wait up to `timeout` for a response
    fn response_timeout(&self, timeout: Duration) -> Result<Response> {
        self.core().wait_response(timeout)
    }

    fn register_callback(&self, callback: &Arc<dyn ResponseCallback>) {
        self.core().register_callback(callback)
    }

    fn unregister_callback(&self, callback: &Arc<dyn ResponseCallback>) {
        self.core().unregister_callback(callback)
    }

    fn state(&self) -> OperationState {
        self.core().state()
    }

    /// Release transport resources held by the operation
    fn shutdown(&self) {}

    fn as_any(&self) -> &dyn Any;

    /// Mutable access to the concrete binding operation, e.g. to add HTTP headers
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl fmt::Debug for dyn Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("href", &self.form().href)
            .field("operation_type", &self.operation_type())
            .field("method", &self.method())
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug)]
enum Delivery {
    Response(Response),
    Error,
}

#[derive(Debug)]
struct Mailbox {
    slot: Option<Delivery>,
    state: OperationState,
}

/// Shared delivery machinery of every operation
pub struct OperationCore {
    mailbox: Mutex<Mailbox>,
    ready: Condvar,
    callbacks: Mutex<Vec<Weak<dyn ResponseCallback>>>,
}

impl fmt::Debug for OperationCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationCore")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for OperationCore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Callbacks run outside the locks, a poisoned lock still holds consistent data
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl OperationCore {
    pub fn new() -> Self {
        Self {
            mailbox: Mutex::new(Mailbox {
                slot: None,
                state: OperationState::Unsent,
            }),
            ready: Condvar::new(),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> OperationState {
        lock(&self.mailbox).state
    }

    /// Record that a request went out
    pub fn mark_sent(&self) {
        lock(&self.mailbox).state = OperationState::Sent;
    }

    pub fn register_callback(&self, callback: &Arc<dyn ResponseCallback>) {
        lock(&self.callbacks).push(Arc::downgrade(callback));
    }

    pub fn unregister_callback(&self, callback: &Arc<dyn ResponseCallback>) {
        let target = Arc::as_ptr(callback) as *const ();
        lock(&self.callbacks).retain(|registered| registered.as_ptr() as *const () != target);
    }

    /// Store `response` as the latest result and hand it to every callback
    pub fn on_response(&self, response: Response) {
        trace!(status = %response.status(), code = response.code(), "response delivered");
        self.deliver(Delivery::Response(response.clone()), OperationState::Responded);

        for callback in self.live_callbacks() {
            callback.on_response(&response);
        }
    }

    /// Store an error marker and notify every callback
    pub fn on_error(&self) {
        trace!("error delivered");
        self.deliver(Delivery::Error, OperationState::Errored);

        for callback in self.live_callbacks() {
            callback.on_error();
        }
    }

    fn deliver(&self, delivery: Delivery, state: OperationState) {
        let mut mailbox = lock(&self.mailbox);
        // Only the latest result matters to a waiter
        mailbox.slot = Some(delivery);
        mailbox.state = state;
        self.ready.notify_all();
    }

    fn live_callbacks(&self) -> Vec<Arc<dyn ResponseCallback>> {
        let mut callbacks = lock(&self.callbacks);
        callbacks.retain(|callback| callback.strong_count() > 0);
        callbacks.iter().filter_map(Weak::upgrade).collect()
    }

    /// Take the latest result, waiting up to `timeout` for one to arrive
    pub fn wait_response(&self, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        let mut mailbox = lock(&self.mailbox);

        loop {
            match mailbox.slot.take() {
                Some(Delivery::Response(response)) => return Ok(response),
                Some(Delivery::Error) => return Err(Error::NoResponse),
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::NoResponse);
            }

            mailbox = self
                .ready
                .wait_timeout(mailbox, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

/// Typed payload setters of a protocol operation
pub trait PayloadEncoder {
    fn set_object_payload(&mut self, value: &BTreeMap<String, PayloadValue>) -> Result<()>;

    fn set_array_payload(&mut self, value: &[PayloadValue]) -> Result<()>;

    fn set_string_payload(&mut self, value: &str) -> Result<()>;

    fn set_boolean_payload(&mut self, value: bool) -> Result<()>;

    fn set_integer_payload(&mut self, value: i64) -> Result<()>;

    fn set_number_payload(&mut self, value: f64) -> Result<()>;
}

/// Validate `value` against `schema` and dispatch it to the matching typed setter
///
/// The schema decides whether the value is accepted, the runtime variant of the
/// normalized value selects the setter.
pub fn set_payload<E>(encoder: &mut E, schema: &dyn Schema, value: PayloadValue) -> Result<()>
where
    E: PayloadEncoder + ?Sized,
{
    let expected = schema.datatype();
    let actual = value.datatype();
    if !expected.accepts(actual) {
        return Err(Error::PayloadTypeMismatch { actual, expected });
    }

    if !schema.validate(&value) {
        return Err(Error::InvalidPayload(format!(
            "{actual} value {} violates the {expected} schema constraints",
            value.to_json()
        )));
    }

    match schema.instantiate(value) {
        PayloadValue::Object(map) => encoder.set_object_payload(&map),
        PayloadValue::Array(items) => encoder.set_array_payload(&items),
        PayloadValue::Str(s) => encoder.set_string_payload(&s),
        PayloadValue::Bool(b) => encoder.set_boolean_payload(b),
        PayloadValue::Int(i) => encoder.set_integer_payload(i),
        PayloadValue::Num(n) => encoder.set_number_payload(n),
        PayloadValue::Null => Err(Error::UnsupportedPayloadType(Datatype::Null)),
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use serde_json::json;

    use crate::{response::ResponseStatus, schema::DataSchema};

    use super::*;

    #[derive(Default)]
    struct Counter {
        responses: Mutex<Vec<Response>>,
        errors: AtomicUsize,
    }

    impl ResponseCallback for Counter {
        fn on_response(&self, response: &Response) {
            self.responses.lock().unwrap().push(response.clone());
        }

        fn on_error(&self) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ok_response(code: &str) -> Response {
        Response::new(ResponseStatus::Ok, code, FormOperation::ReadProperty).with_payload("42")
    }

    #[test]
    fn response_roundtrip_through_mailbox() {
        let core = OperationCore::new();
        let response = ok_response("200");

        core.on_response(response.clone());

        assert_eq!(core.state(), OperationState::Responded);
        assert_eq!(core.wait_response(Duration::from_millis(10)).unwrap(), response);
    }

    #[test]
    fn error_marker_is_no_response() {
        let core = OperationCore::new();
        core.on_error();

        assert_eq!(core.state(), OperationState::Errored);
        assert!(matches!(
            core.wait_response(Duration::from_millis(10)),
            Err(Error::NoResponse)
        ));
    }

    #[test]
    fn latest_response_wins() {
        let core = OperationCore::new();
        core.on_response(ok_response("2.05"));
        core.on_error();
        core.on_response(ok_response("2.04"));

        let response = core.wait_response(Duration::from_millis(10)).unwrap();
        assert_eq!(response.code(), "2.04");
        assert!(core.wait_response(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn wait_times_out() {
        let core = OperationCore::new();
        let timeout = Duration::from_millis(200);

        let start = Instant::now();
        let result = core.wait_response(timeout);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::NoResponse)));
        assert!(elapsed > timeout.mul_f64(0.8), "returned after {elapsed:?}");
        assert!(elapsed < timeout.mul_f64(1.5), "returned after {elapsed:?}");
    }

    #[test]
    fn waiter_wakes_on_delivery() {
        let core = Arc::new(OperationCore::new());
        let producer = {
            let core = Arc::clone(&core);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                core.on_response(ok_response("200"));
            })
        };

        let response = core.wait_response(Duration::from_secs(5)).unwrap();
        assert_eq!(response.code(), "200");
        producer.join().unwrap();
    }

    #[test]
    fn every_callback_sees_each_delivery_once() {
        let core = OperationCore::new();
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());
        let first_cb: Arc<dyn ResponseCallback> = first.clone();
        let second_cb: Arc<dyn ResponseCallback> = second.clone();
        core.register_callback(&first_cb);
        core.register_callback(&second_cb);

        let response = ok_response("200");
        core.on_response(response.clone());

        for counter in [&first, &second] {
            assert_eq!(*counter.responses.lock().unwrap(), vec![response.clone()]);
            assert_eq!(counter.errors.load(Ordering::SeqCst), 0);
        }

        core.on_error();

        for counter in [&first, &second] {
            assert_eq!(counter.responses.lock().unwrap().len(), 1);
            assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn callbacks_see_every_notification() {
        let core = OperationCore::new();
        let counter = Arc::new(Counter::default());
        let callback: Arc<dyn ResponseCallback> = counter.clone();
        core.register_callback(&callback);

        for code in ["2.05", "2.05", "2.03"] {
            core.on_response(ok_response(code));
        }

        let codes: Vec<_> = counter
            .responses
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.code().to_owned())
            .collect();
        assert_eq!(codes, ["2.05", "2.05", "2.03"]);
    }

    #[test]
    fn unregistered_and_dropped_callbacks_are_skipped() {
        let core = OperationCore::new();
        let kept = Arc::new(Counter::default());
        let removed = Arc::new(Counter::default());
        let kept_cb: Arc<dyn ResponseCallback> = kept.clone();
        let removed_cb: Arc<dyn ResponseCallback> = removed.clone();
        core.register_callback(&kept_cb);
        core.register_callback(&removed_cb);
        {
            let dropped: Arc<dyn ResponseCallback> = Arc::new(Counter::default());
            core.register_callback(&dropped);
        }

        core.unregister_callback(&removed_cb);
        core.on_error();

        assert_eq!(kept.errors.load(Ordering::SeqCst), 1);
        assert_eq!(removed.errors.load(Ordering::SeqCst), 0);
        assert_eq!(lock(&core.callbacks).len(), 1);
    }

    #[derive(Debug, Default, PartialEq)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl PayloadEncoder for Recorder {
        fn set_object_payload(&mut self, value: &BTreeMap<String, PayloadValue>) -> Result<()> {
            self.calls.push(format!("object:{}", value.len()));
            Ok(())
        }

        fn set_array_payload(&mut self, value: &[PayloadValue]) -> Result<()> {
            self.calls.push(format!("array:{}", value.len()));
            Ok(())
        }

        fn set_string_payload(&mut self, value: &str) -> Result<()> {
            self.calls.push(format!("string:{value}"));
            Ok(())
        }

        fn set_boolean_payload(&mut self, value: bool) -> Result<()> {
            self.calls.push(format!("boolean:{value}"));
            Ok(())
        }

        fn set_integer_payload(&mut self, value: i64) -> Result<()> {
            self.calls.push(format!("integer:{value}"));
            Ok(())
        }

        fn set_number_payload(&mut self, value: f64) -> Result<()> {
            self.calls.push(format!("number:{value}"));
            Ok(())
        }
    }

    #[test]
    fn payload_dispatch_by_runtime_type() {
        let mut recorder = Recorder::default();

        set_payload(&mut recorder, &DataSchema::string(), "on".into()).unwrap();
        set_payload(&mut recorder, &DataSchema::boolean(), true.into()).unwrap();
        set_payload(&mut recorder, &DataSchema::integer(), 7.into()).unwrap();
        set_payload(&mut recorder, &DataSchema::number(), 0.5.into()).unwrap();
        set_payload(&mut recorder, &DataSchema::array(), vec![1i64, 2].into()).unwrap();
        set_payload(
            &mut recorder,
            &DataSchema::object(),
            PayloadValue::from(json!({ "a": 1 })),
        )
        .unwrap();
        // untyped schemas let the value pick the setter
        set_payload(&mut recorder, &DataSchema::default(), 3.into()).unwrap();

        assert_eq!(
            recorder.calls,
            [
                "string:on",
                "boolean:true",
                "integer:7",
                "number:0.5",
                "array:2",
                "object:1",
                "integer:3",
            ]
        );
    }

    #[test]
    fn integer_into_number_schema_is_widened() {
        let mut recorder = Recorder::default();
        set_payload(&mut recorder, &DataSchema::number(), 3.into()).unwrap();
        assert_eq!(recorder.calls, ["number:3"]);
    }

    #[test]
    fn boolean_against_string_schema() {
        let mut recorder = Recorder::default();
        let err = set_payload(&mut recorder, &DataSchema::string(), true.into()).unwrap_err();

        assert!(matches!(
            err,
            Error::PayloadTypeMismatch {
                actual: Datatype::Boolean,
                expected: Datatype::String,
            }
        ));
        let message = err.to_string();
        assert!(message.contains("boolean") && message.contains("string"));
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn null_has_no_encoder() {
        let mut recorder = Recorder::default();
        let err = set_payload(&mut recorder, &DataSchema::default(), PayloadValue::Null)
            .unwrap_err();

        assert!(matches!(err, Error::UnsupportedPayloadType(Datatype::Null)));
    }

    #[test]
    fn constraint_violation() {
        let mut recorder = Recorder::default();
        let schema: DataSchema =
            serde_json::from_value(json!({ "type": "integer", "maximum": 10 })).unwrap();

        let err = set_payload(&mut recorder, &schema, 11.into()).unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }
}
