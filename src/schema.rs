//! Data schemas for payloads and URI variables
//!
//! [`DataSchema`] follows the [TD data schema](https://www.w3.org/TR/wot-thing-description/#dataschema)
//! vocabulary. Bindings only rely on the [`Schema`] capability, so any other schema
//! representation can be plugged in.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, skip_serializing_none, OneOrMany};

use crate::{
    error::{Error, Result},
    payload::PayloadValue,
};

/// Type tag of a schema or of a payload value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Object,
    Array,
    String,
    Boolean,
    Integer,
    Number,
    Null,
    /// The schema does not declare a type
    Empty,
}

impl Datatype {
    /// Whether a value of type `actual` is acceptable where `self` is expected
    pub fn accepts(self, actual: Datatype) -> bool {
        match (self, actual) {
            (Self::Empty, _) => true,
            (Self::Number, Self::Integer) => true,
            (expected, actual) => expected == actual,
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Null => "null",
            Self::Empty => "untyped",
        };

        f.write_str(s)
    }
}

/// The schema capability consumed by bindings
pub trait Schema {
    fn datatype(&self) -> Datatype;

    /// Check the value against the datatype and the structural constraints of the schema
    ///
    /// String `pattern`s are not evaluated.
    fn validate(&self, value: &PayloadValue) -> bool;

    /// Normalize an accepted value (defaults filled in, integers widened to numbers)
    fn instantiate(&self, value: PayloadValue) -> PayloadValue;

    /// Read a JSON document as a value of this schema
    fn parse_json(&self, value: &Value) -> Result<PayloadValue> {
        let parsed = PayloadValue::from(value.clone());
        let actual = parsed.datatype();
        if !self.datatype().accepts(actual) {
            return Err(Error::PayloadTypeMismatch {
                actual,
                expected: self.datatype(),
            });
        }

        Ok(self.instantiate(parsed))
    }
}

#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSchema {
    #[serde(rename = "@type", default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub attype: Option<Vec<String>>,

    pub title: Option<String>,

    pub description: Option<String>,

    #[serde(rename = "const")]
    pub constant: Option<Value>,

    pub default: Option<Value>,

    pub unit: Option<String>,

    pub one_of: Option<Vec<Self>>,

    #[serde(rename = "enum")]
    pub enumeration: Option<Vec<Value>>,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub write_only: bool,

    pub format: Option<String>,

    #[serde(flatten)]
    pub subtype: Option<DataSchemaSubtype>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataSchemaSubtype {
    Array(ArraySchema),
    Boolean,
    Number(NumberSchema),
    Integer(IntegerSchema),
    Object(ObjectSchema),
    String(StringSchema),
    Null,
}

impl Default for DataSchemaSubtype {
    fn default() -> Self {
        Self::Null
    }
}

#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArraySchema {
    #[serde(default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub items: Option<Vec<DataSchema>>,

    pub min_items: Option<u32>,

    pub max_items: Option<u32>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberSchema {
    pub minimum: Option<f64>,

    pub exclusive_minimum: Option<f64>,

    pub maximum: Option<f64>,

    pub exclusive_maximum: Option<f64>,

    pub multiple_of: Option<f64>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegerSchema {
    pub minimum: Option<i64>,

    pub exclusive_minimum: Option<i64>,

    pub maximum: Option<i64>,

    pub exclusive_maximum: Option<i64>,

    pub multiple_of: Option<i64>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSchema {
    pub properties: Option<HashMap<String, DataSchema>>,

    pub required: Option<Vec<String>>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StringSchema {
    pub min_length: Option<u32>,

    pub max_length: Option<u32>,

    /// Kept for round-trips, never evaluated by [Schema::validate]
    pub pattern: Option<String>,

    pub content_encoding: Option<String>,

    pub content_media_type: Option<String>,
}

impl DataSchema {
    pub fn with_subtype(subtype: DataSchemaSubtype) -> Self {
        Self {
            subtype: Some(subtype),
            ..Default::default()
        }
    }

    pub fn string() -> Self {
        Self::with_subtype(DataSchemaSubtype::String(Default::default()))
    }

    pub fn boolean() -> Self {
        Self::with_subtype(DataSchemaSubtype::Boolean)
    }

    pub fn integer() -> Self {
        Self::with_subtype(DataSchemaSubtype::Integer(Default::default()))
    }

    pub fn number() -> Self {
        Self::with_subtype(DataSchemaSubtype::Number(Default::default()))
    }

    pub fn object() -> Self {
        Self::with_subtype(DataSchemaSubtype::Object(Default::default()))
    }

    pub fn array() -> Self {
        Self::with_subtype(DataSchemaSubtype::Array(Default::default()))
    }

    fn check_value_constraints(&self, value: &PayloadValue) -> bool {
        let json = || value.to_json();

        if let Some(constant) = &self.constant {
            if *constant != json() {
                return false;
            }
        }

        if let Some(enumeration) = &self.enumeration {
            let json = json();
            if !enumeration.contains(&json) {
                return false;
            }
        }

        if let Some(one_of) = &self.one_of {
            if !one_of.iter().any(|schema| schema.validate(value)) {
                return false;
            }
        }

        true
    }
}

impl Schema for DataSchema {
    fn datatype(&self) -> Datatype {
        match &self.subtype {
            None => Datatype::Empty,
            Some(DataSchemaSubtype::Array(_)) => Datatype::Array,
            Some(DataSchemaSubtype::Boolean) => Datatype::Boolean,
            Some(DataSchemaSubtype::Number(_)) => Datatype::Number,
            Some(DataSchemaSubtype::Integer(_)) => Datatype::Integer,
            Some(DataSchemaSubtype::Object(_)) => Datatype::Object,
            Some(DataSchemaSubtype::String(_)) => Datatype::String,
            Some(DataSchemaSubtype::Null) => Datatype::Null,
        }
    }

    fn validate(&self, value: &PayloadValue) -> bool {
        if !self.datatype().accepts(value.datatype()) {
            return false;
        }

        if !self.check_value_constraints(value) {
            return false;
        }

        match (&self.subtype, value) {
            (Some(DataSchemaSubtype::Number(schema)), value) => {
                value.as_f64().map_or(false, |n| schema.check(n))
            }
            (Some(DataSchemaSubtype::Integer(schema)), PayloadValue::Int(i)) => schema.check(*i),
            (Some(DataSchemaSubtype::String(schema)), PayloadValue::Str(s)) => schema.check(s),
            (Some(DataSchemaSubtype::Array(schema)), PayloadValue::Array(items)) => {
                schema.check(items)
            }
            (Some(DataSchemaSubtype::Object(schema)), PayloadValue::Object(map)) => {
                schema.check(map)
            }
            _ => true,
        }
    }

    fn instantiate(&self, value: PayloadValue) -> PayloadValue {
        match (&self.subtype, value) {
            (Some(DataSchemaSubtype::Number(_)), PayloadValue::Int(i)) => {
                PayloadValue::Num(i as f64)
            }
            (Some(DataSchemaSubtype::Array(schema)), PayloadValue::Array(items)) => {
                match schema.items.as_deref() {
                    Some([item_schema]) => PayloadValue::Array(
                        items
                            .into_iter()
                            .map(|item| item_schema.instantiate(item))
                            .collect(),
                    ),
                    Some(tuple) => PayloadValue::Array(
                        items
                            .into_iter()
                            .enumerate()
                            .map(|(index, item)| match tuple.get(index) {
                                Some(schema) => schema.instantiate(item),
                                None => item,
                            })
                            .collect(),
                    ),
                    None => PayloadValue::Array(items),
                }
            }
            (Some(DataSchemaSubtype::Object(schema)), PayloadValue::Object(mut map)) => {
                if let Some(properties) = &schema.properties {
                    for (name, property) in properties {
                        match map.remove(name) {
                            Some(value) => {
                                map.insert(name.clone(), property.instantiate(value));
                            }
                            None => {
                                if let Some(default) = &property.default {
                                    let value = PayloadValue::from(default.clone());
                                    map.insert(name.clone(), property.instantiate(value));
                                }
                            }
                        }
                    }
                }
                PayloadValue::Object(map)
            }
            (_, value) => value,
        }
    }
}

impl NumberSchema {
    fn check(&self, n: f64) -> bool {
        if n.is_nan() {
            return false;
        }

        self.minimum.map_or(true, |min| n >= min)
            && self.exclusive_minimum.map_or(true, |min| n > min)
            && self.maximum.map_or(true, |max| n <= max)
            && self.exclusive_maximum.map_or(true, |max| n < max)
            && self.multiple_of.map_or(true, |m| {
                m > 0. && ((n / m) - (n / m).round()).abs() < 1e-9
            })
    }
}

impl IntegerSchema {
    fn check(&self, i: i64) -> bool {
        self.minimum.map_or(true, |min| i >= min)
            && self.exclusive_minimum.map_or(true, |min| i > min)
            && self.maximum.map_or(true, |max| i <= max)
            && self.exclusive_maximum.map_or(true, |max| i < max)
            && self.multiple_of.map_or(true, |m| m > 0 && i % m == 0)
    }
}

impl StringSchema {
    fn check(&self, s: &str) -> bool {
        let len = s.chars().count();
        self.min_length.map_or(true, |min| len >= min as usize)
            && self.max_length.map_or(true, |max| len <= max as usize)
    }
}

impl ArraySchema {
    fn check(&self, items: &[PayloadValue]) -> bool {
        let len = items.len();
        if self.min_items.map_or(false, |min| len < min as usize)
            || self.max_items.map_or(false, |max| len > max as usize)
        {
            return false;
        }

        match self.items.as_deref() {
            None => true,
            Some([schema]) => items.iter().all(|item| schema.validate(item)),
            Some(tuple) => items
                .iter()
                .zip(tuple)
                .all(|(item, schema)| schema.validate(item)),
        }
    }
}

impl ObjectSchema {
    fn check(&self, map: &std::collections::BTreeMap<String, PayloadValue>) -> bool {
        let required_present = self
            .required
            .iter()
            .flatten()
            .all(|name| map.contains_key(name));

        required_present
            && self.properties.iter().flatten().all(|(name, schema)| {
                map.get(name).map_or(true, |value| schema.validate(value))
            })
    }
}
