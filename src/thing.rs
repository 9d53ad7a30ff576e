//! Thing Description elements consumed by the bindings
//!
//! Only the pieces needed to dispatch an interaction are modelled: the [Form] describing a
//! protocol endpoint, the [FormOperation] semantics and the hypermedia [Link].
//!
//! Use [serde_json] to read them out of a Thing Description.

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{serde_as, skip_serializing_none, DeserializeAs, OneOrMany, Same};

use crate::{
    error::{Error, Result},
    payload::PayloadValue,
    schema::DataSchema,
    uri_template,
};

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Link {
    pub href: String,

    #[serde(rename = "type")]
    pub ty: Option<String>,

    pub rel: Option<String>,

    pub anchor: Option<String>,
}

impl Link {
    pub fn new(href: impl Into<String>, rel: Option<String>) -> Self {
        Self {
            href: href.into(),
            rel,
            ..Default::default()
        }
    }
}

/// A protocol binding point of an interaction affordance
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Form {
    #[serde(default, skip_serializing_if = "DefaultedFormOperations::is_default")]
    pub op: DefaultedFormOperations,

    pub href: String,

    pub content_type: Option<String>,

    pub content_coding: Option<String>,

    pub subprotocol: Option<String>,

    #[serde(default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub security: Option<Vec<String>>,

    #[serde(default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub scopes: Option<Vec<String>>,

    /// Request method, `htv:methodName` for HTTP and `cov:method` for CoAP
    #[serde(rename = "htv:methodName", alias = "cov:method")]
    pub method_name: Option<String>,
}

impl Form {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            ..Default::default()
        }
    }

    pub fn href(&self) -> &str {
        &self.href
    }

    pub fn content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Whether the form can be used for `op`
    pub fn supports(&self, op: FormOperation) -> bool {
        match &self.op {
            DefaultedFormOperations::Default => true,
            DefaultedFormOperations::Custom(ops) => ops.contains(&op),
        }
    }

    /// Operations explicitly declared by the form, empty when the affordance defaults apply
    pub fn operations(&self) -> &[FormOperation] {
        match &self.op {
            DefaultedFormOperations::Default => &[],
            DefaultedFormOperations::Custom(ops) => ops,
        }
    }

    /// The explicit method for `op`, if any
    pub fn method_name(&self, op: FormOperation) -> Option<&str> {
        self.method_name.as_deref().filter(|_| self.supports(op))
    }

    /// The explicit sub-protocol for `op`, if any
    pub fn subprotocol(&self, op: FormOperation) -> Option<&str> {
        self.subprotocol.as_deref().filter(|_| self.supports(op))
    }

    /// URI scheme of the target, lower-cased
    pub fn scheme(&self) -> Option<String> {
        let (scheme, _) = self.href.split_once(':')?;
        let mut chars = scheme.chars();
        let valid = chars.next().map_or(false, |c| c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));

        valid.then(|| scheme.to_ascii_lowercase())
    }

    /// Names of the URI template variables referenced by the target
    pub fn uri_variable_names(&self) -> Vec<String> {
        uri_template::variable_names(&self.href)
    }

    /// A copy of the form with its URI template expanded
    pub fn instantiate_uri_variables(
        &self,
        schemas: &HashMap<String, DataSchema>,
        values: &HashMap<String, PayloadValue>,
    ) -> Result<Self> {
        let href = uri_template::expand(&self.href, schemas, values)?;
        Ok(Self {
            href,
            ..self.clone()
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormOperation {
    ReadProperty,
    WriteProperty,
    ObserveProperty,
    UnobserveProperty,
    InvokeAction,
    QueryAction,
    CancelAction,
    SubscribeEvent,
    UnsubscribeEvent,
    ReadAllProperties,
    WriteAllProperties,
    ReadMultipleProperties,
    WriteMultipleProperties,
    ObserveAllProperties,
    UnobserveAllProperties,
    SubscribeAllEvents,
    UnsubscribeAllEvents,
    QueryAllActions,
}

const FORM_OPERATIONS: [FormOperation; 18] = [
    FormOperation::ReadProperty,
    FormOperation::WriteProperty,
    FormOperation::ObserveProperty,
    FormOperation::UnobserveProperty,
    FormOperation::InvokeAction,
    FormOperation::QueryAction,
    FormOperation::CancelAction,
    FormOperation::SubscribeEvent,
    FormOperation::UnsubscribeEvent,
    FormOperation::ReadAllProperties,
    FormOperation::WriteAllProperties,
    FormOperation::ReadMultipleProperties,
    FormOperation::WriteMultipleProperties,
    FormOperation::ObserveAllProperties,
    FormOperation::UnobserveAllProperties,
    FormOperation::SubscribeAllEvents,
    FormOperation::UnsubscribeAllEvents,
    FormOperation::QueryAllActions,
];

impl FormOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadProperty => "readproperty",
            Self::WriteProperty => "writeproperty",
            Self::ObserveProperty => "observeproperty",
            Self::UnobserveProperty => "unobserveproperty",
            Self::InvokeAction => "invokeaction",
            Self::QueryAction => "queryaction",
            Self::CancelAction => "cancelaction",
            Self::SubscribeEvent => "subscribeevent",
            Self::UnsubscribeEvent => "unsubscribeevent",
            Self::ReadAllProperties => "readallproperties",
            Self::WriteAllProperties => "writeallproperties",
            Self::ReadMultipleProperties => "readmultipleproperties",
            Self::WriteMultipleProperties => "writemultipleproperties",
            Self::ObserveAllProperties => "observeallproperties",
            Self::UnobserveAllProperties => "unobserveallproperties",
            Self::SubscribeAllEvents => "subscribeallevents",
            Self::UnsubscribeAllEvents => "unsubscribeallevents",
            Self::QueryAllActions => "queryallactions",
        }
    }
}

impl fmt::Display for FormOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses `readproperty`, `readProperty`, `td:readProperty` and
/// `https://www.w3.org/2019/wot/td#readProperty` alike.
impl FromStr for FormOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.rsplit(['#', ':']).next().unwrap_or(s);

        FORM_OPERATIONS
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::InvalidForm(format!("unknown operation type \"{s}\"")))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DefaultedFormOperations {
    #[default]
    Default,
    Custom(Vec<FormOperation>),
}

impl DefaultedFormOperations {
    /// Whether the affordance default operations apply
    pub fn is_default(&self) -> bool {
        match self {
            Self::Default => true,
            Self::Custom(ops) => ops.is_empty(),
        }
    }
}

impl Serialize for DefaultedFormOperations {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Default => serializer.serialize_none(),
            Self::Custom(ops) if ops.is_empty() => serializer.serialize_none(),
            Self::Custom(ops) => ops.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for DefaultedFormOperations
where
    OneOrMany<Same>: DeserializeAs<'de, Vec<FormOperation>>,
{
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ops = Option::<OneOrMany<_>>::deserialize_as(deserializer)?;
        Ok(ops.map(Self::Custom).unwrap_or(Self::Default))
    }
}

impl From<Vec<FormOperation>> for DefaultedFormOperations {
    fn from(ops: Vec<FormOperation>) -> Self {
        Self::Custom(ops)
    }
}

impl<const N: usize> From<[FormOperation; N]> for DefaultedFormOperations {
    fn from(ops: [FormOperation; N]) -> Self {
        Self::Custom(ops.to_vec())
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_http_form() {
        let form: Form = serde_json::from_value(json!({
            "href": "http://example.org/properties/on",
            "op": ["readproperty", "writeproperty"],
            "htv:methodName": "PUT",
            "contentType": "application/json",
        }))
        .unwrap();

        let expected = Form {
            op: DefaultedFormOperations::Custom(vec![
                FormOperation::ReadProperty,
                FormOperation::WriteProperty,
            ]),
            href: "http://example.org/properties/on".into(),
            content_type: Some("application/json".into()),
            method_name: Some("PUT".into()),
            ..Default::default()
        };

        assert_eq!(form, expected);
    }

    #[test]
    fn deserialize_coap_form() {
        let form: Form = serde_json::from_value(json!({
            "cov:method": "GET",
            "href": "coap://[2001:DB8::1]/status",
            "contentType": "text/plain;charset=utf-8",
            "subprotocol": "cov:observe",
            "op": "observeproperty",
        }))
        .unwrap();

        let expected = Form {
            op: DefaultedFormOperations::Custom(vec![FormOperation::ObserveProperty]),
            href: "coap://[2001:DB8::1]/status".into(),
            content_type: Some("text/plain;charset=utf-8".into()),
            subprotocol: Some("cov:observe".into()),
            method_name: Some("GET".into()),
            ..Default::default()
        };

        assert_eq!(form, expected);
    }

    #[test]
    fn default_operations_roundtrip_as_absent() {
        let form = Form::new("http://example.org/");
        let value = serde_json::to_value(&form).unwrap();
        assert_eq!(value, json!({ "href": "http://example.org/" }));
        assert_eq!(form.content_type(), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn empty_operations_are_omitted() {
        let form = Form {
            op: DefaultedFormOperations::Custom(vec![]),
            ..Form::new("coap://example.org/status")
        };
        assert_eq!(
            serde_json::to_value(&form).unwrap(),
            json!({ "href": "coap://example.org/status" })
        );

        let form = Form {
            op: [FormOperation::ReadProperty].into(),
            ..Form::new("coap://example.org/status")
        };
        assert_eq!(
            serde_json::to_value(&form).unwrap(),
            json!({ "href": "coap://example.org/status", "op": ["readproperty"] })
        );
    }

    #[test]
    fn method_only_for_declared_operations() {
        let form = Form {
            op: [FormOperation::WriteProperty].into(),
            method_name: Some("POST".into()),
            ..Form::new("http://example.org/properties/on")
        };

        assert_eq!(form.method_name(FormOperation::WriteProperty), Some("POST"));
        assert_eq!(form.method_name(FormOperation::ReadProperty), None);
    }

    #[test]
    fn scheme() {
        assert_eq!(Form::new("HTTPS://example.org").scheme().as_deref(), Some("https"));
        assert_eq!(Form::new("coap://[::1]/x").scheme().as_deref(), Some("coap"));
        assert_eq!(Form::new("/relative/path").scheme(), None);
        assert_eq!(Form::new("unknown://x").scheme().as_deref(), Some("unknown"));
    }

    #[test]
    fn parse_operation_types() {
        assert_eq!(
            "readProperty".parse::<FormOperation>().unwrap(),
            FormOperation::ReadProperty
        );
        assert_eq!(
            "https://www.w3.org/2019/wot/td#invokeAction"
                .parse::<FormOperation>()
                .unwrap(),
            FormOperation::InvokeAction
        );
        assert_eq!(
            "td:observeProperty".parse::<FormOperation>().unwrap(),
            FormOperation::ObserveProperty
        );
        assert!("dance".parse::<FormOperation>().is_err());
    }

    #[test]
    fn instantiate_uri_variables_rewrites_target_only() {
        let form = Form {
            op: [FormOperation::ReadProperty].into(),
            ..Form::new("http://example.org/properties/{p}")
        };
        let schemas = [("p".to_string(), DataSchema::string())].into_iter().collect();
        let values = [("p".to_string(), "temp".into())].into_iter().collect();

        let instance = form.instantiate_uri_variables(&schemas, &values).unwrap();

        assert_eq!(instance.href, "http://example.org/properties/temp");
        assert_eq!(instance.op, form.op);
        assert_eq!(form.href, "http://example.org/properties/{p}");
        assert_eq!(form.uri_variable_names(), vec!["p".to_string()]);
    }
}
