//! Protocol bindings and their registry
//!
//! A [ProtocolBinding] turns a [Form] and an operation type into an executable
//! [Operation]. The [Registry] selects the binding by the URI scheme of the form.
//!
//! # Example
//!
//! ```no_run
//! use wot_binding::{binding::Registry, thing::{Form, FormOperation}};
//!
//! let registry = Registry::default();
//! let form = Form::new("http://example.org/properties/temperature");
//!
//! let operation = registry.bind(&form, FormOperation::ReadProperty)?;
//! operation.send_request()?;
//! let response = operation.response()?;
//! println!("{:?}", response.payload_text());
//! # Ok::<(), wot_binding::Error>(())
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use tracing::{debug, warn};

use crate::{
    config::BindingConfig,
    error::{Error, Result},
    operation::Operation,
    payload::PayloadValue,
    protocol::{coap::CoapBinding, http::HttpBinding},
    schema::DataSchema,
    thing::{Form, FormOperation},
};

/// Protocol specific operation factory
pub trait ProtocolBinding: Send + Sync {
    /// Human readable protocol name
    fn protocol(&self) -> &str;

    /// Lower-case URI schemes handled by the binding
    fn supported_schemes(&self) -> &[&str];

    fn default_method(&self, op: FormOperation) -> Option<&'static str>;

    fn default_subprotocol(&self, op: FormOperation) -> Option<&'static str>;

    /// Build an operation for `op` out of `form`
    fn bind(&self, form: &Form, op: FormOperation) -> Result<Box<dyn Operation>>;
}

/// The method for `op`: the form's own method, or the binding default
pub fn resolve_method<B>(binding: &B, form: &Form, op: FormOperation) -> Result<String>
where
    B: ProtocolBinding + ?Sized,
{
    form.method_name(op)
        .map(str::to_owned)
        .or_else(|| binding.default_method(op).map(str::to_owned))
        .ok_or(Error::UnresolvedMethod { operation: op })
}

/// The sub-protocol for `op`: the form's own sub-protocol, or the binding default
pub fn resolve_subprotocol<B>(binding: &B, form: &Form, op: FormOperation) -> Option<String>
where
    B: ProtocolBinding + ?Sized,
{
    form.subprotocol(op)
        .map(str::to_owned)
        .or_else(|| binding.default_subprotocol(op).map(str::to_owned))
}

/// Ordered collection of bindings
///
/// Lookups walk bindings in registration order, the first one handling the scheme wins.
#[derive(Clone)]
pub struct Registry {
    bindings: Vec<Arc<dyn ProtocolBinding>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.bindings.iter().map(|binding| binding.protocol()))
            .finish()
    }
}

/// HTTP and CoAP bindings with default transport settings
impl Default for Registry {
    fn default() -> Self {
        Self::from_config(&BindingConfig::default())
    }
}

impl Registry {
    /// A registry without any binding
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// HTTP and CoAP bindings configured from `config`
    pub fn from_config(config: &BindingConfig) -> Self {
        let mut registry = Self::new();
        registry.register(HttpBinding::new(config.http.clone()));
        registry.register(CoapBinding::new(config.coap.clone()));
        registry
    }

    /// Append a binding, after the ones already registered
    pub fn register<B>(&mut self, binding: B)
    where
        B: ProtocolBinding + 'static,
    {
        self.register_shared(Arc::new(binding))
    }

    pub fn register_shared(&mut self, binding: Arc<dyn ProtocolBinding>) {
        for scheme in binding.supported_schemes() {
            if let Some(existing) = self
                .bindings
                .iter()
                .find(|registered| registered.supported_schemes().contains(scheme))
            {
                warn!(
                    scheme,
                    existing = existing.protocol(),
                    added = binding.protocol(),
                    "scheme already handled by a registered binding, the new one is shadowed"
                );
            }
        }

        self.bindings.push(binding);
    }

    pub fn bindings(&self) -> impl Iterator<Item = &dyn ProtocolBinding> {
        self.bindings.iter().map(|binding| binding.as_ref())
    }

    /// The binding handling the URI scheme of `form`
    pub fn binding(&self, form: &Form) -> Result<&dyn ProtocolBinding> {
        let scheme = form
            .scheme()
            .ok_or_else(|| Error::InvalidForm(format!("\"{}\" has no URI scheme", form.href)))?;

        self.bindings
            .iter()
            .find(|binding| binding.supported_schemes().contains(&scheme.as_str()))
            .map(|binding| binding.as_ref())
            .ok_or(Error::BindingNotFound { scheme })
    }

    /// Build an operation for `op` with the binding matching `form`
    pub fn bind(&self, form: &Form, op: FormOperation) -> Result<Box<dyn Operation>> {
        let binding = self.binding(form)?;
        if !form.supports(op) {
            return Err(Error::InvalidForm(format!(
                "form for \"{}\" does not declare operation {op}",
                form.href
            )));
        }

        debug!(href = %form.href, %op, protocol = binding.protocol(), "binding form");
        binding.bind(form, op)
    }

    /// Like [Registry::bind], after expanding the URI template of `form`
    pub fn bind_with_uri_variables(
        &self,
        form: &Form,
        op: FormOperation,
        schemas: &HashMap<String, DataSchema>,
        values: &HashMap<String, PayloadValue>,
    ) -> Result<Box<dyn Operation>> {
        let form = form.instantiate_uri_variables(schemas, values)?;
        self.bind(&form, op)
    }
}

#[cfg(test)]
mod test {
    use std::any::Any;

    use crate::{
        operation::{OperationCore, OperationState},
        schema::Schema,
    };

    use super::*;

    struct NullOperation {
        form: Form,
        op: FormOperation,
        method: String,
        core: OperationCore,
        origin: &'static str,
    }

    impl Operation for NullOperation {
        fn form(&self) -> &Form {
            &self.form
        }

        fn operation_type(&self) -> FormOperation {
            self.op
        }

        fn method(&self) -> &str {
            &self.method
        }

        fn set_payload(&mut self, _schema: &dyn Schema, _value: PayloadValue) -> Result<()> {
            Ok(())
        }

        fn send_request(&self) -> Result<()> {
            self.core.mark_sent();
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

    struct FakeBinding {
        name: &'static str,
        schemes: &'static [&'static str],
    }

    impl ProtocolBinding for FakeBinding {
        fn protocol(&self) -> &str {
            self.name
        }

        fn supported_schemes(&self) -> &[&str] {
            self.schemes
        }

        fn default_method(&self, op: FormOperation) -> Option<&'static str> {
            (op == FormOperation::ReadProperty).then_some("FETCH")
        }

        fn default_subprotocol(&self, _op: FormOperation) -> Option<&'static str> {
            None
        }

        fn bind(&self, form: &Form, op: FormOperation) -> Result<Box<dyn Operation>> {
            Ok(Box::new(NullOperation {
                form: form.clone(),
                op,
                method: resolve_method(self, form, op)?,
                core: OperationCore::new(),
                origin: self.name,
            }))
        }
    }

    fn origin(operation: &dyn Operation) -> &'static str {
        operation
            .as_any()
            .downcast_ref::<NullOperation>()
            .unwrap()
            .origin
    }

    #[test]
    fn unknown_scheme() {
        let registry = Registry::default();
        let form = Form::new("unknown://example.org/x");

        assert!(matches!(
            registry.binding(&form),
            Err(Error::BindingNotFound { scheme }) if scheme == "unknown"
        ));
        assert!(matches!(
            registry.bind(&form, FormOperation::ReadProperty),
            Err(Error::BindingNotFound { .. })
        ));
    }

    #[test]
    fn empty_registry_finds_nothing() {
        let registry = Registry::new();
        assert!(matches!(
            registry.binding(&Form::new("http://example.org")),
            Err(Error::BindingNotFound { .. })
        ));
    }

    #[test]
    fn relative_href_is_invalid() {
        let registry = Registry::default();
        assert!(matches!(
            registry.binding(&Form::new("/properties/on")),
            Err(Error::InvalidForm(_))
        ));
    }

    #[test]
    fn default_bindings_by_scheme() {
        let registry = Registry::default();

        assert_eq!(
            registry.binding(&Form::new("https://example.org")).unwrap().protocol(),
            "HTTP"
        );
        assert_eq!(
            registry.binding(&Form::new("coap://example.org")).unwrap().protocol(),
            "CoAP"
        );
    }

    #[test]
    fn first_registered_wins() {
        let mut registry = Registry::new();
        registry.register(FakeBinding {
            name: "first",
            schemes: &["fake"],
        });
        registry.register(FakeBinding {
            name: "second",
            schemes: &["fake", "other"],
        });

        let operation = registry
            .bind(&Form::new("fake://thing/x"), FormOperation::ReadProperty)
            .unwrap();
        assert_eq!(origin(operation.as_ref()), "first");

        let operation = registry
            .bind(&Form::new("other://thing/x"), FormOperation::ReadProperty)
            .unwrap();
        assert_eq!(origin(operation.as_ref()), "second");
    }

    #[test]
    fn builtins_take_priority_over_appended_bindings() {
        let mut registry = Registry::default();
        registry.register(FakeBinding {
            name: "custom-http",
            schemes: &["http"],
        });

        assert_eq!(
            registry.binding(&Form::new("http://example.org")).unwrap().protocol(),
            "HTTP"
        );
        assert_eq!(registry.bindings().count(), 3);
    }

    #[test]
    fn explicit_method_beats_default() {
        let mut registry = Registry::new();
        registry.register(FakeBinding {
            name: "fake",
            schemes: &["fake"],
        });

        let form = Form {
            method_name: Some("GET".into()),
            ..Form::new("fake://thing/x")
        };
        let operation = registry.bind(&form, FormOperation::ReadProperty).unwrap();
        assert_eq!(operation.method(), "GET");

        let operation = registry
            .bind(&Form::new("fake://thing/x"), FormOperation::ReadProperty)
            .unwrap();
        assert_eq!(operation.method(), "FETCH");
        assert_eq!(operation.state(), OperationState::Unsent);
    }

    #[test]
    fn unresolved_method() {
        let mut registry = Registry::new();
        registry.register(FakeBinding {
            name: "fake",
            schemes: &["fake"],
        });

        assert!(matches!(
            registry.bind(&Form::new("fake://thing/x"), FormOperation::InvokeAction),
            Err(Error::UnresolvedMethod {
                operation: FormOperation::InvokeAction
            })
        ));
    }

    #[test]
    fn undeclared_operation() {
        let registry = Registry::default();
        let form = Form {
            op: [FormOperation::ReadProperty].into(),
            ..Form::new("http://example.org/properties/on")
        };

        assert!(matches!(
            registry.bind(&form, FormOperation::WriteProperty),
            Err(Error::InvalidForm(_))
        ));
    }

    #[test]
    fn bind_with_uri_variables() {
        let registry = Registry::default();
        let form = Form::new("http://example.org/properties/{p}");
        let schemas = [("p".to_string(), DataSchema::string())].into_iter().collect();
        let values = [("p".to_string(), "temp".into())].into_iter().collect();

        let operation = registry
            .bind_with_uri_variables(&form, FormOperation::ReadProperty, &schemas, &values)
            .unwrap();
        assert_eq!(operation.form().href, "http://example.org/properties/temp");
        assert_eq!(operation.method(), "GET");
    }
}
